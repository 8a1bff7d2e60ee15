//! Operator arena
//!
//! One node per logical-plan node plus the result sink on top. Children are
//! built first; parent links are indices. While a node generates code its
//! operator is taken out of the arena so it can hand [`Inputs`] (the rest of
//! the arena) to its children.

use crate::codegen::context::GenerationContext;
use crate::codegen::ir::Stmt;
use crate::codegen::operators::aggregation::Aggregation;
use crate::codegen::operators::filter::Filter;
use crate::codegen::operators::join::Join;
use crate::codegen::operators::operator::{Consumer, Operator, ProductionStyle};
use crate::codegen::operators::project::Project;
use crate::codegen::operators::scan::Scan;
use crate::codegen::operators::sink::{QueryOutput, make_sink};
use crate::codegen::types::LogicalType;
use crate::error::{DbxError, DbxResult};
use crate::plan::LogicalPlan;
use crate::logging::TARGET;
use smallvec::{SmallVec, smallvec};
use tracing::debug;

pub type NodeId = usize;

#[derive(Debug)]
struct OperatorNode {
    name: &'static str,
    /// `None` while the operator is generating
    op: Option<Box<dyn Operator>>,
    children: SmallVec<[NodeId; 2]>,
    parent: Option<NodeId>,
    output_types: Vec<LogicalType>,
}

/// 연산자 트리 (arena)
#[derive(Debug, Default)]
pub struct OperatorTree {
    nodes: Vec<OperatorNode>,
    root: Option<NodeId>,
}

impl OperatorTree {
    /// Lower `plan` into operators with `output` as the root sink.
    pub fn build(plan: &LogicalPlan, output: QueryOutput) -> DbxResult<Self> {
        let mut tree = OperatorTree::default();
        let top = tree.add_plan(plan)?;
        let sink = make_sink(output, &tree.nodes[top].output_types);
        let root = tree.push_node(sink, smallvec![top]);
        tree.root = Some(root);
        Ok(tree)
    }

    fn add_plan(&mut self, plan: &LogicalPlan) -> DbxResult<NodeId> {
        let id = match plan {
            LogicalPlan::Scan {
                table,
                schema,
                projection,
            } => {
                let scan = Scan::new(table, schema, projection)?;
                self.push_node(Box::new(scan), SmallVec::new())
            }
            LogicalPlan::Filter { input, predicate } => {
                let child = self.add_plan(input)?;
                let filter = Filter::new(predicate, &self.nodes[child].output_types)?;
                self.push_node(Box::new(filter), smallvec![child])
            }
            LogicalPlan::Project { input, exprs } => {
                let child = self.add_plan(input)?;
                let project = Project::new(exprs, &self.nodes[child].output_types)?;
                self.push_node(Box::new(project), smallvec![child])
            }
            LogicalPlan::Aggregate {
                input,
                group_by,
                aggregates,
            } => {
                let child = self.add_plan(input)?;
                let agg = Aggregation::new(group_by, aggregates, &self.nodes[child].output_types)?;
                self.push_node(Box::new(agg), smallvec![child])
            }
            LogicalPlan::Join {
                left,
                right,
                join_type,
                on,
            } => {
                let build = self.add_plan(left)?;
                let probe = self.add_plan(right)?;
                let join = Join::new(
                    *join_type,
                    on,
                    &self.nodes[build].output_types,
                    &self.nodes[probe].output_types,
                )?;
                self.push_node(Box::new(join), smallvec![build, probe])
            }
        };
        debug!(target: TARGET, node = id, operator = self.nodes[id].name, "built operator");
        Ok(id)
    }

    fn push_node(&mut self, op: Box<dyn Operator>, children: SmallVec<[NodeId; 2]>) -> NodeId {
        let id = self.nodes.len();
        for &child in &children {
            self.nodes[child].parent = Some(id);
        }
        self.nodes.push(OperatorNode {
            name: op.name(),
            output_types: op.output_types().to_vec(),
            op: Some(op),
            children,
            parent: None,
        });
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root(&self) -> DbxResult<NodeId> {
        self.root
            .ok_or_else(|| DbxError::invariant("OperatorTree", "tree has no root"))
    }

    pub fn name(&self, id: NodeId) -> &'static str {
        self.nodes[id].name
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    pub fn output_types(&self, id: NodeId) -> &[LogicalType] {
        &self.nodes[id].output_types
    }

    /// First node (bottom-up) that cannot produce in `style`.
    pub fn first_incapable(&self, style: ProductionStyle) -> Option<&'static str> {
        self.nodes
            .iter()
            .find(|node| !node.op.as_ref().is_some_and(|op| op.can_produce(style)))
            .map(|node| node.name)
    }

    /// Generate the whole procedure body from the root sink.
    pub fn produce_root(
        &mut self,
        ctx: &mut GenerationContext,
        style: ProductionStyle,
    ) -> DbxResult<Vec<Stmt>> {
        let root = self.root()?;
        let mut orphan = |_: &mut GenerationContext| -> DbxResult<Vec<Stmt>> {
            Err(DbxError::invariant(
                "OperatorTree",
                "the root sink consumed into a parent",
            ))
        };
        self.produce_node(ctx, root, style, &mut orphan)
    }

    fn produce_node(
        &mut self,
        ctx: &mut GenerationContext,
        id: NodeId,
        style: ProductionStyle,
        parent: Consumer<'_>,
    ) -> DbxResult<Vec<Stmt>> {
        let mut op = self.nodes[id].op.take().ok_or_else(|| {
            DbxError::invariant(
                "OperatorTree",
                format!("node {id} re-entered while generating"),
            )
        })?;
        debug!(target: TARGET, node = id, operator = op.name(), %style, "produce");
        let children = self.nodes[id].children.clone();
        let result = {
            let mut inputs = Inputs {
                tree: self,
                children,
                style,
            };
            op.produce(ctx, &mut inputs, parent, style)
        };
        self.nodes[id].op = Some(op);
        result
    }
}

/// Children of the operator currently producing.
pub struct Inputs<'t> {
    tree: &'t mut OperatorTree,
    children: SmallVec<[NodeId; 2]>,
    style: ProductionStyle,
}

impl Inputs<'_> {
    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn style(&self) -> ProductionStyle {
        self.style
    }

    /// Produce child `index`, consuming into `consumer`.
    ///
    /// Every consume is checked to see exactly as many columns as the child
    /// declares.
    pub fn produce(
        &mut self,
        ctx: &mut GenerationContext,
        index: usize,
        consumer: Consumer<'_>,
    ) -> DbxResult<Vec<Stmt>> {
        let child = *self.children.get(index).ok_or_else(|| {
            DbxError::invariant("OperatorTree", format!("operator has no input #{index}"))
        })?;
        let expected = self.tree.nodes[child].output_types.len();
        let producer = self.tree.nodes[child].name;
        let mut checked = |ctx: &mut GenerationContext| -> DbxResult<Vec<Stmt>> {
            let actual = ctx.current_mapping()?.len();
            if actual != expected {
                return Err(DbxError::invariant(
                    producer,
                    format!("consume sees {actual} columns, operator declares {expected}"),
                ));
            }
            consumer(ctx)
        };
        self.tree.produce_node(ctx, child, self.style, &mut checked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::access_path::{AccessPath, OrdinalMapping};
    use crate::codegen::operators::sink::CountSink;
    use crate::config::CodegenConfig;
    use crate::plan::{Expr, ScalarValue};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    /// Leaf that declares one column but pushes two.
    #[derive(Debug)]
    struct LyingLeaf {
        types: Vec<LogicalType>,
    }

    impl Operator for LyingLeaf {
        fn name(&self) -> &'static str {
            "LyingLeaf"
        }

        fn output_types(&self) -> &[LogicalType] {
            &self.types
        }

        fn can_produce_non_vectorised(&self) -> bool {
            true
        }

        fn produce_non_vec(
            &mut self,
            ctx: &mut GenerationContext,
            _inputs: &mut Inputs<'_>,
            parent: Consumer<'_>,
        ) -> DbxResult<Vec<Stmt>> {
            let mapping: OrdinalMapping = [
                AccessPath::scalar("a", LogicalType::Int),
                AccessPath::scalar("b", LogicalType::Int),
            ]
            .into_iter()
            .collect();
            ctx.with_mapping(mapping, |ctx| parent(ctx))
        }
    }

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int32, false),
            Field::new("b", DataType::Float64, false),
        ]))
    }

    #[test]
    fn test_arity_mismatch_is_invariant_violation() {
        let mut tree = OperatorTree::default();
        let leaf = tree.push_node(
            Box::new(LyingLeaf {
                types: vec![LogicalType::Int],
            }),
            SmallVec::new(),
        );
        let root = tree.push_node(Box::new(CountSink::new()), smallvec![leaf]);
        tree.root = Some(root);

        let mut ctx = GenerationContext::new(CodegenConfig::default());
        let err = tree
            .produce_root(&mut ctx, ProductionStyle::NonVectorised)
            .unwrap_err();
        assert!(matches!(err, DbxError::InternalInvariantViolation { .. }));
        assert!(err.to_string().contains("consume sees 2 columns"));
        assert_eq!(ctx.mapping_depth(), 0);
    }

    #[test]
    fn test_build_sets_parent_links() {
        let plan = LogicalPlan::scan("t", schema(), vec![0, 1])
            .filter(Expr::binary(
                Expr::col(0),
                crate::plan::BinaryOperator::Gt,
                Expr::lit(ScalarValue::Int32(1)),
            ))
            .project(vec![Expr::col(1)]);
        let tree = OperatorTree::build(&plan, QueryOutput::Materialize).unwrap();
        assert_eq!(tree.len(), 4);
        let root = tree.root().unwrap();
        assert_eq!(tree.name(root), "Materialize");
        let project = tree.children(root)[0];
        assert_eq!(tree.name(project), "Project");
        assert_eq!(tree.parent(project), Some(root));
        assert_eq!(tree.output_types(project), &[LogicalType::Double]);
        let filter = tree.children(project)[0];
        let scan = tree.children(filter)[0];
        assert_eq!(tree.name(scan), "Scan");
        assert_eq!(tree.parent(scan), Some(filter));
        assert!(tree.first_incapable(ProductionStyle::Vectorised).is_none());
    }
}
