//! Query compiler — logical plan to generated procedure
//!
//! Builds the operator arena over the plan, negotiates one production style
//! for the whole tree and runs the root produce.

use crate::codegen::context::GenerationContext;
use crate::codegen::operators::{OperatorTree, ProductionStyle, QueryOutput};
use crate::codegen::operators::operator::unsupported_style;
use crate::codegen::procedure::Procedure;
use crate::config::{CodegenConfig, Paradigm};
use crate::error::{DbxError, DbxResult};
use crate::plan::LogicalPlan;
use crate::logging::TARGET;
use tracing::debug;

/// 쿼리 컴파일러
#[derive(Debug, Clone, Default)]
pub struct QueryCompiler {
    config: CodegenConfig,
}

impl QueryCompiler {
    pub fn new(config: CodegenConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CodegenConfig {
        &self.config
    }

    /// Compile `plan` into a procedure whose results go to `output`.
    pub fn compile(&self, plan: &LogicalPlan, output: QueryOutput) -> DbxResult<Procedure> {
        self.config.validate()?;
        let mut tree = OperatorTree::build(plan, output)?;
        let style = self.negotiate(&tree)?;
        debug!(
            target: TARGET,
            paradigm = self.config.paradigm.as_str(),
            %style,
            nodes = tree.len(),
            tables = ?plan.tables(),
            "paradigm chosen"
        );

        let mut ctx = GenerationContext::new(self.config.clone());
        let body = tree.produce_root(&mut ctx, style)?;
        if ctx.mapping_depth() != 0 || ctx.allocation_depth() != 0 {
            return Err(DbxError::invariant(
                "QueryCompiler",
                format!(
                    "unbalanced generation state: {} mappings, {} allocation scopes",
                    ctx.mapping_depth(),
                    ctx.allocation_depth()
                ),
            ));
        }
        let root = tree.root()?;
        let output_types = tree.output_types(root).to_vec();
        let finished = ctx.finish();

        let procedure = Procedure {
            name: self.config.procedure_name.clone(),
            style,
            resources: finished.resources,
            map_types: finished.map_types,
            globals: finished.globals,
            body,
            output_types,
        };
        debug!(
            target: TARGET,
            name = %procedure.name,
            readers = procedure.resources.len(),
            maps = procedure.map_types.len(),
            buffers = procedure.acquire_count(),
            "procedure generated"
        );
        Ok(procedure)
    }

    fn negotiate(&self, tree: &OperatorTree) -> DbxResult<ProductionStyle> {
        match self.config.paradigm {
            Paradigm::Auto => {
                if tree.first_incapable(ProductionStyle::Vectorised).is_none() {
                    return Ok(ProductionStyle::Vectorised);
                }
                match tree.first_incapable(ProductionStyle::NonVectorised) {
                    None => Ok(ProductionStyle::NonVectorised),
                    Some(op) => Err(DbxError::unsupported(
                        op,
                        "operator supports neither production style",
                    )),
                }
            }
            Paradigm::Vectorised => Self::forced(tree, ProductionStyle::Vectorised),
            Paradigm::NonVectorised => Self::forced(tree, ProductionStyle::NonVectorised),
        }
    }

    fn forced(tree: &OperatorTree, style: ProductionStyle) -> DbxResult<ProductionStyle> {
        match tree.first_incapable(style) {
            None => Ok(style),
            Some(op) => Err(unsupported_style(op, style)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::ir::Stmt;
    use crate::codegen::types::QueryVariableType;
    use crate::plan::{AggregateExpr, Expr, ScalarValue};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn scan() -> LogicalPlan {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int32, false),
            Field::new("b", DataType::Int64, false),
        ]));
        LogicalPlan::scan("t", schema, vec![0, 1])
    }

    #[test]
    fn test_auto_prefers_vectorised() {
        let procedure = QueryCompiler::default()
            .compile(&scan(), QueryOutput::Materialize)
            .unwrap();
        assert_eq!(procedure.style, ProductionStyle::Vectorised);
        assert_eq!(procedure.resources.len(), 1);
        assert_eq!(procedure.output_types.len(), 2);
    }

    #[test]
    fn test_auto_falls_back_for_literal_projection() {
        let plan = scan().project(vec![Expr::lit(ScalarValue::Int32(7))]);
        let procedure = QueryCompiler::default()
            .compile(&plan, QueryOutput::Materialize)
            .unwrap();
        assert_eq!(procedure.style, ProductionStyle::NonVectorised);

        let forced = QueryCompiler::new(CodegenConfig::default().with_paradigm(Paradigm::Vectorised))
            .compile(&plan, QueryOutput::Materialize)
            .unwrap_err();
        assert!(matches!(forced, DbxError::UnsupportedProduction { .. }));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let compiler = QueryCompiler::new(CodegenConfig::default().with_vector_capacity(0));
        assert!(matches!(
            compiler.compile(&scan(), QueryOutput::Count).unwrap_err(),
            DbxError::Config(_)
        ));
    }

    #[test]
    fn test_rendered_procedure_names_readers() {
        let procedure = QueryCompiler::new(CodegenConfig::default().with_procedure_name("q1"))
            .compile(&scan(), QueryOutput::Print)
            .unwrap();
        let source = procedure.to_string();
        assert!(source.contains("fn q1("));
        assert!(source.contains("reader #0: 't'"));
        assert!(source.contains("load_next_batch"));
    }

    fn map_declarations(stmts: &[Stmt], out: &mut Vec<String>) {
        for stmt in stmts {
            match stmt {
                Stmt::Declare {
                    ty: QueryVariableType::GeneratedMap(name),
                    ..
                } => out.push(name.clone()),
                Stmt::If { then_branch, else_branch, .. } => {
                    map_declarations(then_branch, out);
                    map_declarations(else_branch, out);
                }
                Stmt::While { body, .. } | Stmt::For { body, .. } => map_declarations(body, out),
                Stmt::Guarded { body, cleanup } => {
                    map_declarations(body, out);
                    map_declarations(cleanup, out);
                }
                _ => {}
            }
        }
    }

    #[test]
    fn test_grouped_aggregation_declares_its_registered_map() {
        let plan = scan().aggregate(vec![0], vec![AggregateExpr::count_star(), AggregateExpr::sum(1)]);
        for paradigm in [Paradigm::NonVectorised, Paradigm::Vectorised] {
            let procedure = QueryCompiler::new(CodegenConfig::default().with_paradigm(paradigm))
                .compile(&plan, QueryOutput::Materialize)
                .unwrap();
            assert_eq!(procedure.map_types.len(), 1);
            let mut declared = Vec::new();
            map_declarations(&procedure.body, &mut declared);
            assert_eq!(declared, vec![procedure.map_types[0].name.clone()]);
        }
    }
}
