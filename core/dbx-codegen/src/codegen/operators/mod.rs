//! Code-generating operators
//!
//! One operator per logical-plan node plus the result sink. Operators talk to
//! each other only through produce/consume and the ordinal mapping on the
//! [`GenerationContext`](crate::codegen::context::GenerationContext).

mod aggregation;
mod batch;
mod filter;
mod join;
pub mod operator;
mod project;
mod scan;
pub mod sink;
pub mod tree;

pub use aggregation::Aggregation;
pub use filter::Filter;
pub use join::Join;
pub use operator::{Consumer, Operator, ProductionStyle};
pub use project::Project;
pub use scan::Scan;
pub use sink::{CountSink, QueryOutput, RowSink, make_sink};
pub use tree::{Inputs, NodeId, OperatorTree};
