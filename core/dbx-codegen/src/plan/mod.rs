//! Logical plan input
//!
//! The read-only operator tree and scalar-expression vocabulary handed to the
//! generator by the planner. The generator never rewrites it.

pub mod types;

pub use types::*;
