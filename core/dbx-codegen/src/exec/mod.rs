//! Reference executor
//!
//! Runs a compiled [`Procedure`](crate::codegen::Procedure) statement by
//! statement against a [`TableSource`](crate::runtime::TableSource). Both
//! production styles of the same plan must produce the same result here.

mod interpreter;

pub use interpreter::{QueryResult, execute};
