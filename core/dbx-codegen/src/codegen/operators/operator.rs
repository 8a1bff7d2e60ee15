//! Operator base protocol
//!
//! Every code-generating operator implements [`Operator`]: capability
//! negotiation plus produce/consume in the two production styles. Produce
//! receives the parent's consume as a [`Consumer`] continuation and splices
//! the statements it returns into the loop it builds.

use crate::codegen::context::GenerationContext;
use crate::codegen::ir::Stmt;
use crate::codegen::operators::tree::Inputs;
use crate::codegen::types::LogicalType;
use crate::error::{DbxError, DbxResult};
use std::fmt;

/// Parent consume passed down during produce.
pub type Consumer<'a> = &'a mut dyn FnMut(&mut GenerationContext) -> DbxResult<Vec<Stmt>>;

/// Row-at-a-time or batch code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProductionStyle {
    NonVectorised,
    Vectorised,
}

impl fmt::Display for ProductionStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProductionStyle::NonVectorised => write!(f, "non-vectorised"),
            ProductionStyle::Vectorised => write!(f, "vectorised"),
        }
    }
}

/// Error for a produce/consume style the operator does not implement.
pub fn unsupported_style(operator: &str, style: ProductionStyle) -> DbxError {
    DbxError::UnsupportedProduction {
        operator: operator.to_string(),
        style: style.to_string(),
    }
}

/// 코드 생성 연산자 인터페이스
pub trait Operator: fmt::Debug {
    fn name(&self) -> &'static str;

    /// Output column types; the arity every consume of the parent sees.
    fn output_types(&self) -> &[LogicalType];

    fn can_produce_non_vectorised(&self) -> bool {
        false
    }

    fn can_produce_vectorised(&self) -> bool {
        false
    }

    fn produce_non_vec(
        &mut self,
        _ctx: &mut GenerationContext,
        _inputs: &mut Inputs<'_>,
        _parent: Consumer<'_>,
    ) -> DbxResult<Vec<Stmt>> {
        Err(unsupported_style(self.name(), ProductionStyle::NonVectorised))
    }

    fn consume_non_vec(
        &mut self,
        _ctx: &mut GenerationContext,
        _parent: Consumer<'_>,
    ) -> DbxResult<Vec<Stmt>> {
        Err(unsupported_style(self.name(), ProductionStyle::NonVectorised))
    }

    fn produce_vec(
        &mut self,
        _ctx: &mut GenerationContext,
        _inputs: &mut Inputs<'_>,
        _parent: Consumer<'_>,
    ) -> DbxResult<Vec<Stmt>> {
        Err(unsupported_style(self.name(), ProductionStyle::Vectorised))
    }

    fn consume_vec(
        &mut self,
        _ctx: &mut GenerationContext,
        _parent: Consumer<'_>,
    ) -> DbxResult<Vec<Stmt>> {
        Err(unsupported_style(self.name(), ProductionStyle::Vectorised))
    }

    fn can_produce(&self, style: ProductionStyle) -> bool {
        match style {
            ProductionStyle::NonVectorised => self.can_produce_non_vectorised(),
            ProductionStyle::Vectorised => self.can_produce_vectorised(),
        }
    }

    fn produce(
        &mut self,
        ctx: &mut GenerationContext,
        inputs: &mut Inputs<'_>,
        parent: Consumer<'_>,
        style: ProductionStyle,
    ) -> DbxResult<Vec<Stmt>> {
        match style {
            ProductionStyle::NonVectorised => self.produce_non_vec(ctx, inputs, parent),
            ProductionStyle::Vectorised => self.produce_vec(ctx, inputs, parent),
        }
    }

    fn consume(
        &mut self,
        ctx: &mut GenerationContext,
        parent: Consumer<'_>,
        style: ProductionStyle,
    ) -> DbxResult<Vec<Stmt>> {
        match style {
            ProductionStyle::NonVectorised => self.consume_non_vec(ctx, parent),
            ProductionStyle::Vectorised => self.consume_vec(ctx, parent),
        }
    }
}
