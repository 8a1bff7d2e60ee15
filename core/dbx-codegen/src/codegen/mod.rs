//! Produce/consume code generation
//!
//! ```text
//! LogicalPlan → OperatorTree (+ sink) → paradigm negotiation
//!            → produce(root) ⇄ consume(parent) → Procedure (Stmt tree)
//! ```
//!
//! - [`types`] — logical and query-variable types
//! - [`ir`] — statements and expressions of the emitted code
//! - [`access_path`] — how each logical column is read at a point of the code
//! - [`context`] — naming, mapping stack, resources and allocation scopes
//! - [`hash_map`] — generated aggregation/join map types
//! - [`operators`] — Scan, Filter, Project, Aggregation, Join and the sinks
//! - [`compiler`] / [`procedure`] — entry point and its result

pub mod access_path;
pub mod compiler;
pub mod context;
pub mod hash_map;
pub mod ir;
pub mod operators;
pub mod procedure;
pub mod types;

pub use access_path::{AccessPath, FilterMarker, OrdinalMapping};
pub use compiler::QueryCompiler;
pub use context::GenerationContext;
pub use hash_map::MapDescriptor;
pub use operators::{ProductionStyle, QueryOutput};
pub use procedure::Procedure;
pub use types::{LogicalType, QueryVariableType};
