//! Result sinks — the root of every compiled operator tree

use crate::codegen::context::GenerationContext;
use crate::codegen::ir::{CodeExpr, Intrinsic, Stmt};
use crate::codegen::operators::batch::{for_each_active_row, marker_args, marker_kind};
use crate::codegen::operators::operator::{Consumer, Operator, ProductionStyle};
use crate::codegen::operators::tree::Inputs;
use crate::codegen::types::{LogicalType, QueryVariableType};
use crate::error::{DbxError, DbxResult};
use serde::{Deserialize, Serialize};

/// What the compiled procedure does with its result rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QueryOutput {
    /// `emit_row(values…)` per row
    #[default]
    Materialize,
    /// `print_row(values…)` per row
    Print,
    /// Emit the row count once
    Count,
}

pub fn make_sink(output: QueryOutput, input: &[LogicalType]) -> Box<dyn Operator> {
    match output {
        QueryOutput::Materialize => Box::new(RowSink::new(Intrinsic::EmitRow, input)),
        QueryOutput::Print => Box::new(RowSink::new(Intrinsic::PrintRow, input)),
        QueryOutput::Count => Box::new(CountSink::new()),
    }
}

/// Calls one output intrinsic per active row.
#[derive(Debug)]
pub struct RowSink {
    call: Intrinsic,
    types: Vec<LogicalType>,
}

impl RowSink {
    pub fn new(call: Intrinsic, input: &[LogicalType]) -> Self {
        Self {
            call,
            types: input.to_vec(),
        }
    }

    fn produce_sink(
        &mut self,
        ctx: &mut GenerationContext,
        inputs: &mut Inputs<'_>,
        style: ProductionStyle,
    ) -> DbxResult<Vec<Stmt>> {
        let mut consume = |ctx: &mut GenerationContext| {
            let mut none = |_: &mut GenerationContext| -> DbxResult<Vec<Stmt>> { Ok(Vec::new()) };
            self.consume(ctx, &mut none, style)
        };
        inputs.produce(ctx, 0, &mut consume)
    }
}

impl Operator for RowSink {
    fn name(&self) -> &'static str {
        match self.call {
            Intrinsic::PrintRow => "Print",
            _ => "Materialize",
        }
    }

    fn output_types(&self) -> &[LogicalType] {
        &self.types
    }

    fn can_produce_non_vectorised(&self) -> bool {
        true
    }

    fn can_produce_vectorised(&self) -> bool {
        true
    }

    fn produce_non_vec(
        &mut self,
        ctx: &mut GenerationContext,
        inputs: &mut Inputs<'_>,
        _parent: Consumer<'_>,
    ) -> DbxResult<Vec<Stmt>> {
        self.produce_sink(ctx, inputs, ProductionStyle::NonVectorised)
    }

    fn consume_non_vec(
        &mut self,
        ctx: &mut GenerationContext,
        _parent: Consumer<'_>,
    ) -> DbxResult<Vec<Stmt>> {
        let values = ctx
            .current_mapping()?
            .iter()
            .map(|path| path.read_scalar())
            .collect::<DbxResult<Vec<_>>>()?;
        Ok(vec![Stmt::eval(CodeExpr::call(self.call.clone(), values))])
    }

    fn produce_vec(
        &mut self,
        ctx: &mut GenerationContext,
        inputs: &mut Inputs<'_>,
        _parent: Consumer<'_>,
    ) -> DbxResult<Vec<Stmt>> {
        self.produce_sink(ctx, inputs, ProductionStyle::Vectorised)
    }

    fn consume_vec(
        &mut self,
        ctx: &mut GenerationContext,
        parent: Consumer<'_>,
    ) -> DbxResult<Vec<Stmt>> {
        let mapping = ctx.current_mapping()?.clone();
        let Some((marker, length)) = mapping.batch_extent(self.name())? else {
            return self.consume_non_vec(ctx, parent);
        };
        let call = self.call.clone();
        for_each_active_row(ctx, marker.as_ref(), length, |_, row| {
            let values = mapping
                .iter()
                .map(|path| path.element_at(row.clone())?.read_scalar())
                .collect::<DbxResult<Vec<_>>>()?;
            Ok(vec![Stmt::eval(CodeExpr::call(call, values))])
        })
    }
}

/// Blocking row count.
#[derive(Debug)]
pub struct CountSink {
    counter: Option<String>,
    output: [LogicalType; 1],
}

impl CountSink {
    pub fn new() -> Self {
        Self {
            counter: None,
            output: [LogicalType::Long],
        }
    }

    fn counter(&self) -> DbxResult<&str> {
        self.counter
            .as_deref()
            .ok_or_else(|| DbxError::invariant("Count", "consume before produce"))
    }

    fn produce_count(
        &mut self,
        ctx: &mut GenerationContext,
        inputs: &mut Inputs<'_>,
        style: ProductionStyle,
    ) -> DbxResult<Vec<Stmt>> {
        let counter = ctx.fresh("count");
        let mut stmts = vec![Stmt::declare(
            &counter,
            QueryVariableType::Scalar(LogicalType::Long),
            CodeExpr::long(0),
        )];
        self.counter = Some(counter.clone());
        {
            let mut consume = |ctx: &mut GenerationContext| {
                let mut none =
                    |_: &mut GenerationContext| -> DbxResult<Vec<Stmt>> { Ok(Vec::new()) };
                self.consume(ctx, &mut none, style)
            };
            stmts.extend(inputs.produce(ctx, 0, &mut consume)?);
        }
        stmts.push(Stmt::eval(CodeExpr::call(
            Intrinsic::EmitCount,
            vec![CodeExpr::var(counter)],
        )));
        Ok(stmts)
    }
}

impl Default for CountSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Operator for CountSink {
    fn name(&self) -> &'static str {
        "Count"
    }

    fn output_types(&self) -> &[LogicalType] {
        &self.output
    }

    fn can_produce_non_vectorised(&self) -> bool {
        true
    }

    fn can_produce_vectorised(&self) -> bool {
        true
    }

    fn produce_non_vec(
        &mut self,
        ctx: &mut GenerationContext,
        inputs: &mut Inputs<'_>,
        _parent: Consumer<'_>,
    ) -> DbxResult<Vec<Stmt>> {
        self.produce_count(ctx, inputs, ProductionStyle::NonVectorised)
    }

    fn consume_non_vec(
        &mut self,
        _ctx: &mut GenerationContext,
        _parent: Consumer<'_>,
    ) -> DbxResult<Vec<Stmt>> {
        Ok(vec![Stmt::increment(self.counter()?, CodeExpr::long(1))])
    }

    fn produce_vec(
        &mut self,
        ctx: &mut GenerationContext,
        inputs: &mut Inputs<'_>,
        _parent: Consumer<'_>,
    ) -> DbxResult<Vec<Stmt>> {
        self.produce_count(ctx, inputs, ProductionStyle::Vectorised)
    }

    fn consume_vec(
        &mut self,
        ctx: &mut GenerationContext,
        parent: Consumer<'_>,
    ) -> DbxResult<Vec<Stmt>> {
        let mapping = ctx.current_mapping()?;
        let Some((marker, length)) = mapping.batch_extent("Count")? else {
            return self.consume_non_vec(ctx, parent);
        };
        let count = CodeExpr::call(
            Intrinsic::VectorCount {
                marker: marker_kind(marker.as_ref()),
            },
            marker_args(marker.as_ref(), length),
        );
        Ok(vec![Stmt::increment(self.counter()?, count)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::access_path::{AccessPath, OrdinalMapping};
    use crate::config::CodegenConfig;

    #[test]
    fn test_sink_names() {
        let types = [LogicalType::Int];
        assert_eq!(make_sink(QueryOutput::Materialize, &types).name(), "Materialize");
        assert_eq!(make_sink(QueryOutput::Print, &types).name(), "Print");
        let count = make_sink(QueryOutput::Count, &types);
        assert_eq!(count.name(), "Count");
        assert_eq!(count.output_types(), &[LogicalType::Long]);
    }

    #[test]
    fn test_row_sink_batch_consume_loops_over_selection() {
        let mut sink = RowSink::new(Intrinsic::EmitRow, &[LogicalType::Int]);
        let mut ctx = GenerationContext::new(CodegenConfig::default());
        let mapping: OrdinalMapping = [AccessPath::ColumnVectorWithSelection {
            vector: "v".to_string(),
            ty: LogicalType::Int,
            selection: "sel".to_string(),
            length: CodeExpr::var("n"),
        }]
        .into_iter()
        .collect();
        let mut none = |_: &mut GenerationContext| -> DbxResult<Vec<Stmt>> { Ok(Vec::new()) };
        let stmts = ctx
            .with_mapping(mapping, |ctx| sink.consume_vec(ctx, &mut none))
            .unwrap();
        assert!(matches!(&stmts[0], Stmt::For { end, .. } if *end == CodeExpr::var("n")));
    }

    #[test]
    fn test_count_sink_requires_produce() {
        let mut sink = CountSink::new();
        let mut ctx = GenerationContext::new(CodegenConfig::default());
        let mut none = |_: &mut GenerationContext| -> DbxResult<Vec<Stmt>> { Ok(Vec::new()) };
        assert!(sink.consume_non_vec(&mut ctx, &mut none).is_err());
    }
}
