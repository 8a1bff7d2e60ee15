//! Scan Operator — table reader loop

use crate::codegen::access_path::{AccessPath, OrdinalMapping};
use crate::codegen::context::GenerationContext;
use crate::codegen::ir::{CodeExpr, Intrinsic, Method, Stmt};
use crate::codegen::operators::operator::{Consumer, Operator, ProductionStyle};
use crate::codegen::operators::tree::Inputs;
use crate::codegen::types::{LogicalType, QueryVariableType};
use crate::error::{DbxError, DbxResult};
use arrow::datatypes::SchemaRef;

/// 테이블 스캔 연산자 — reader에서 배치를 읽어 부모에게 전달
#[derive(Debug)]
pub struct Scan {
    table: String,
    projection: Vec<usize>,
    output: Vec<LogicalType>,
}

impl Scan {
    pub fn new(table: &str, schema: &SchemaRef, projection: &[usize]) -> DbxResult<Self> {
        if projection.is_empty() {
            return Err(DbxError::unsupported(
                "Scan",
                format!("scan of '{table}' projects no columns"),
            ));
        }
        let output = projection
            .iter()
            .map(|&idx| {
                let field = schema.fields().get(idx).ok_or_else(|| {
                    DbxError::unsupported(
                        "Scan",
                        format!(
                            "column #{idx} out of range for '{table}' ({} columns)",
                            schema.fields().len()
                        ),
                    )
                })?;
                LogicalType::from_arrow(field.data_type())
            })
            .collect::<DbxResult<Vec<_>>>()?;
        Ok(Self {
            table: table.to_string(),
            projection: projection.to_vec(),
            output,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn produce_loop(
        &mut self,
        ctx: &mut GenerationContext,
        parent: Consumer<'_>,
        style: ProductionStyle,
    ) -> DbxResult<Vec<Stmt>> {
        let batch_size = ctx.config().vector_capacity;
        let handle = ctx.register_reader(&self.table, &self.projection, batch_size);
        let reader = ctx.fresh("reader");
        let mut stmts = vec![Stmt::declare(
            &reader,
            QueryVariableType::TableReader,
            CodeExpr::call(Intrinsic::OpenReader, vec![CodeExpr::int(handle as i32)]),
        )];

        let (loop_body, scope) = ctx.with_allocation_scope(|ctx| {
            let mut body = Vec::with_capacity(self.output.len() + 1);
            let mut mapping = OrdinalMapping::new();
            for (i, ty) in self.output.iter().enumerate() {
                let vector = ctx.fresh("vec");
                body.push(Stmt::declare(
                    &vector,
                    QueryVariableType::Vector(*ty),
                    CodeExpr::var(&reader).method(Method::GetVector, vec![CodeExpr::int(i as i32)]),
                ));
                mapping.push(AccessPath::ColumnVector { vector, ty: *ty });
            }

            match style {
                ProductionStyle::Vectorised => {
                    body.extend(ctx.with_mapping(mapping, |ctx| parent(ctx))?);
                }
                ProductionStyle::NonVectorised => {
                    let row = ctx.fresh("row");
                    let rows = mapping.elements_at(&CodeExpr::var(&row))?;
                    let row_body = ctx.with_mapping(rows, |ctx| parent(ctx))?;
                    body.push(Stmt::for_range(
                        row,
                        CodeExpr::int(0),
                        CodeExpr::var(&reader).method(Method::ValueCount, vec![]),
                        row_body,
                    ));
                }
            }
            Ok(body)
        })?;

        let batches = Stmt::while_loop(
            CodeExpr::var(&reader).method(Method::LoadNextBatch, vec![]),
            loop_body,
        );
        stmts.extend(scope.wrap(vec![batches]));
        Ok(stmts)
    }
}

impl Operator for Scan {
    fn name(&self) -> &'static str {
        "Scan"
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
        _inputs: &mut Inputs<'_>,
        parent: Consumer<'_>,
    ) -> DbxResult<Vec<Stmt>> {
        self.produce_loop(ctx, parent, ProductionStyle::NonVectorised)
    }

    fn produce_vec(
        &mut self,
        ctx: &mut GenerationContext,
        _inputs: &mut Inputs<'_>,
        parent: Consumer<'_>,
    ) -> DbxResult<Vec<Stmt>> {
        self.produce_loop(ctx, parent, ProductionStyle::Vectorised)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int32, false),
            Field::new("name", DataType::Utf8, false),
            Field::new("ts", DataType::Timestamp(arrow::datatypes::TimeUnit::Second, None), false),
        ]))
    }

    #[test]
    fn test_scan_construction_errors() {
        let err = Scan::new("t", &schema(), &[]).unwrap_err();
        assert!(matches!(err, DbxError::UnsupportedPlanShape { .. }));

        let err = Scan::new("t", &schema(), &[5]).unwrap_err();
        assert!(err.to_string().contains("out of range"));

        let err = Scan::new("t", &schema(), &[2]).unwrap_err();
        assert!(err.to_string().contains("no code generation strategy"));
    }

    #[test]
    fn test_scan_output_types_follow_projection() {
        let scan = Scan::new("t", &schema(), &[1, 0]).unwrap();
        assert_eq!(scan.output_types(), &[LogicalType::Varchar, LogicalType::Int]);
        assert_eq!(scan.table(), "t");
    }

    #[test]
    fn test_scan_consume_is_contract_violation() {
        let mut scan = Scan::new("t", &schema(), &[0]).unwrap();
        let mut ctx = GenerationContext::new(crate::config::CodegenConfig::default());
        let mut noop = |_: &mut GenerationContext| -> DbxResult<Vec<Stmt>> { Ok(Vec::new()) };
        let err = scan.consume_vec(&mut ctx, &mut noop).unwrap_err();
        assert!(matches!(err, DbxError::UnsupportedProduction { .. }));
    }
}
