//! Filter Operator — WHERE clause lowering
//!
//! Predicates are conjunctions of comparisons between columns and literals.
//! Row-at-a-time code skips failing rows with `continue`; batch code narrows a
//! selection vector or validity mask with the run-time filter primitives.

use crate::codegen::access_path::{AccessPath, FilterMarker, OrdinalMapping};
use crate::codegen::context::GenerationContext;
use crate::codegen::ir::{CmpOp, CodeExpr, Intrinsic, MarkerKind, OperandShape, Stmt};
use crate::codegen::operators::batch::{marker_args, marker_kind, materialize};
use crate::codegen::operators::operator::{Consumer, Operator};
use crate::codegen::operators::tree::Inputs;
use crate::codegen::types::{LogicalType, QueryVariableType};
use crate::config::{FilterPolicy, LaneWidth};
use crate::error::{DbxError, DbxResult};
use crate::plan::{BinaryOperator, Expr, ScalarValue};
use crate::logging::TARGET;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Column(usize),
    Literal(ScalarValue),
}

#[derive(Debug, Clone)]
struct Comparison {
    cmp: CmpOp,
    left: Operand,
    right: Operand,
    ty: LogicalType,
}

#[derive(Debug, Clone)]
enum Predicate {
    And(Box<Predicate>, Box<Predicate>),
    Compare(Comparison),
}

impl Predicate {
    fn conjuncts(&self) -> usize {
        match self {
            Predicate::And(l, r) => l.conjuncts() + r.conjuncts(),
            Predicate::Compare(_) => 1,
        }
    }
}

/// 필터 연산자 (WHERE 조건)
#[derive(Debug)]
pub struct Filter {
    predicate: Predicate,
    types: Vec<LogicalType>,
}

impl Filter {
    pub fn new(predicate: &Expr, input: &[LogicalType]) -> DbxResult<Self> {
        Ok(Self {
            predicate: parse_predicate(predicate, input)?,
            types: input.to_vec(),
        })
    }
}

fn parse_predicate(expr: &Expr, input: &[LogicalType]) -> DbxResult<Predicate> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => Ok(Predicate::And(
            Box::new(parse_predicate(left, input)?),
            Box::new(parse_predicate(right, input)?),
        )),
        Expr::BinaryOp { left, op, right } if op.is_comparison() => {
            let cmp = CmpOp::from_plan(*op).ok_or_else(|| {
                DbxError::unsupported("Filter", format!("comparison {}", op.symbol()))
            })?;
            let (left, right, cmp) = match (parse_operand(left, input)?, parse_operand(right, input)?) {
                (Operand::Literal(_), Operand::Literal(_)) => {
                    return Err(DbxError::unsupported(
                        "Filter",
                        format!("comparison of two literals in {expr}"),
                    ));
                }
                (l @ Operand::Literal(_), r) => (r, l, cmp.flip()),
                (l, r) => (l, r, cmp),
            };
            let lt = operand_type(&left, input)?;
            let rt = operand_type(&right, input)?;
            if !lt.comparable_with(&rt) {
                return Err(DbxError::type_mismatch(
                    format!("operand comparable with {lt}"),
                    format!("{rt} in {expr}"),
                ));
            }
            Ok(Predicate::Compare(Comparison {
                cmp,
                left,
                right,
                ty: lt,
            }))
        }
        other => Err(DbxError::unsupported(
            "Filter",
            format!("predicate {other} is not a conjunction of comparisons"),
        )),
    }
}

fn parse_operand(expr: &Expr, input: &[LogicalType]) -> DbxResult<Operand> {
    match expr {
        Expr::Column(idx) if *idx < input.len() => Ok(Operand::Column(*idx)),
        Expr::Column(idx) => Err(DbxError::unsupported(
            "Filter",
            format!("column #{idx} out of range ({} columns)", input.len()),
        )),
        Expr::Literal(ScalarValue::Null) => Err(DbxError::unsupported(
            "Filter",
            "comparison with NULL",
        )),
        Expr::Literal(value) => Ok(Operand::Literal(value.clone())),
        other => Err(DbxError::unsupported(
            "Filter",
            format!("operand {other} is not a column or literal"),
        )),
    }
}

fn operand_type(operand: &Operand, input: &[LogicalType]) -> DbxResult<LogicalType> {
    match operand {
        Operand::Column(idx) => Ok(input[*idx]),
        Operand::Literal(value) => LogicalType::of_literal(value),
    }
}

// ===== Row-at-a-time lowering =====

fn scalar_operand(
    ctx: &mut GenerationContext,
    operand: &Operand,
    mapping: &mut OrdinalMapping,
    stmts: &mut Vec<Stmt>,
) -> DbxResult<CodeExpr> {
    match operand {
        Operand::Column(idx) => {
            let path = materialize(ctx, mapping.get(*idx)?, "val", stmts)?;
            mapping.replace(*idx, path.clone())?;
            path.read_scalar()
        }
        Operand::Literal(value) => AccessPath::constant(value)?.read_scalar(),
    }
}

fn lower_row(
    ctx: &mut GenerationContext,
    predicate: &Predicate,
    mapping: &mut OrdinalMapping,
    stmts: &mut Vec<Stmt>,
) -> DbxResult<()> {
    match predicate {
        Predicate::And(l, r) => {
            lower_row(ctx, l, mapping, stmts)?;
            lower_row(ctx, r, mapping, stmts)
        }
        Predicate::Compare(c) => {
            let lhs = scalar_operand(ctx, &c.left, mapping, stmts)?;
            let rhs = scalar_operand(ctx, &c.right, mapping, stmts)?;
            let test = CodeExpr::binary(c.cmp.to_binop(), lhs, rhs);
            stmts.push(Stmt::if_then(test.not(), vec![Stmt::Continue]));
            Ok(())
        }
    }
}

// ===== Batch lowering =====

/// State of one batch lowering pass.
struct BatchLowering<'m> {
    mapping: &'m OrdinalMapping,
    kind: MarkerKind,
    /// Marker array owned by this filter node
    buffer: String,
    /// Length variable paired with `buffer`
    length_var: String,
}

impl BatchLowering<'_> {
    fn own_marker(&self) -> FilterMarker {
        FilterMarker {
            kind: self.kind,
            array: self.buffer.clone(),
            length: CodeExpr::var(&self.length_var),
        }
    }

    fn lower(
        &self,
        ctx: &mut GenerationContext,
        predicate: &Predicate,
        current: Option<FilterMarker>,
        batch_length: &CodeExpr,
        stmts: &mut Vec<Stmt>,
    ) -> DbxResult<FilterMarker> {
        match predicate {
            Predicate::And(l, r) => {
                let narrowed = self.lower(ctx, l, current, batch_length, stmts)?;
                self.lower(ctx, r, Some(narrowed), batch_length, stmts)
            }
            Predicate::Compare(c) => self.compare(ctx, c, current, batch_length, stmts),
        }
    }

    fn compare(
        &self,
        ctx: &mut GenerationContext,
        c: &Comparison,
        current: Option<FilterMarker>,
        batch_length: &CodeExpr,
        stmts: &mut Vec<Stmt>,
    ) -> DbxResult<FilterMarker> {
        let left = self.operand_path(&c.left)?;
        let right = self.operand_path(&c.right)?;
        let (batch, other, cmp) = if left.is_vector_family() {
            (left, right, c.cmp)
        } else if right.is_vector_family() {
            (right, left, c.cmp.flip())
        } else {
            return Err(DbxError::unsupported(
                "Filter",
                "batch comparison needs at least one batch operand",
            ));
        };
        let (rhs_shape, rhs) = if other.is_vector_family() {
            (OperandShape::Vector, other.vector_expr()?)
        } else {
            (OperandShape::Scalar, other.read_scalar()?)
        };
        let length = match &current {
            Some(m) => m.length.clone(),
            None => batch_length.clone(),
        };

        let simd = ctx.config().simd;
        if simd.enabled
            && self.kind == MarkerKind::Validity
            && rhs_shape == OperandShape::Scalar
            && (c.ty.is_numeric() || c.ty == LogicalType::Date)
        {
            return self.simd_compare(ctx, &batch, cmp, rhs, current, length, simd.lane_width, stmts);
        }

        let mut args = vec![batch.vector_expr()?, rhs];
        args.extend(marker_args(current.as_ref(), length));
        args.push(CodeExpr::var(&self.buffer));
        let primitive = Intrinsic::VectorFilter {
            cmp,
            rhs: rhs_shape,
            input: marker_kind(current.as_ref()),
            output: self.kind,
        };
        stmts.push(Stmt::assign(
            CodeExpr::var(&self.length_var),
            CodeExpr::call(primitive, args),
        ));
        Ok(self.own_marker())
    }

    fn operand_path(&self, operand: &Operand) -> DbxResult<AccessPath> {
        match operand {
            Operand::Column(idx) => Ok(self.mapping.get(*idx)?.clone()),
            Operand::Literal(value) => AccessPath::constant(value),
        }
    }

    /// Lane-group comparison ANDed into the validity mask.
    #[allow(clippy::too_many_arguments)]
    fn simd_compare(
        &self,
        ctx: &mut GenerationContext,
        batch: &AccessPath,
        cmp: CmpOp,
        scalar: CodeExpr,
        current: Option<FilterMarker>,
        length: CodeExpr,
        lane_width: LaneWidth,
        stmts: &mut Vec<Stmt>,
    ) -> DbxResult<FilterMarker> {
        let validity = CodeExpr::var(&self.buffer);
        match &current {
            None => stmts.push(Stmt::eval(CodeExpr::call(
                Intrinsic::ValidityInit,
                vec![validity.clone(), length.clone()],
            ))),
            Some(m) if m.array != self.buffer => stmts.push(Stmt::eval(CodeExpr::call(
                Intrinsic::ArrayCopy,
                vec![m.array_expr(), CodeExpr::int(0), length.clone(), validity.clone()],
            ))),
            Some(_) => {}
        }
        let ty = batch.logical_type().ok_or_else(|| {
            DbxError::invariant("Filter", "lane loop over an untyped batch")
        })?;
        let vector = match batch.vector_expr()? {
            CodeExpr::Var(name) => name,
            other => {
                return Err(DbxError::invariant(
                    "Filter",
                    format!("lane loop over non-variable batch {other}"),
                ));
            }
        };
        let binding = AccessPath::SimdLoopBinding {
            vector,
            ty,
            offset: ctx.fresh("lane_off"),
            lane_count: ctx.fresh("lane_cnt"),
            memory: ctx.acquire_scan_buffer("lanes", ty)?,
            lane_mask: ctx.acquire_scan_buffer("lane_mask", LogicalType::Boolean)?,
            lane_width,
        };
        stmts.extend(simd_lane_loop(&binding, cmp, scalar, validity, length.clone())?);
        stmts.push(Stmt::assign(CodeExpr::var(&self.length_var), length));
        Ok(self.own_marker())
    }
}

/// `while off < length` over lane groups of a [`AccessPath::SimdLoopBinding`].
fn simd_lane_loop(
    binding: &AccessPath,
    cmp: CmpOp,
    scalar: CodeExpr,
    validity: CodeExpr,
    length: CodeExpr,
) -> DbxResult<Vec<Stmt>> {
    let AccessPath::SimdLoopBinding {
        vector,
        ty,
        offset,
        lane_count,
        lane_mask,
        memory,
        lane_width,
    } = binding
    else {
        return Err(DbxError::invariant("Filter", "expected a lane binding"));
    };
    let lanes = CodeExpr::int(lane_width.lanes() as i32);
    let off = CodeExpr::var(offset);
    let cnt = CodeExpr::var(lane_count);
    let body = vec![
        Stmt::declare(
            lane_count,
            QueryVariableType::Scalar(LogicalType::Int),
            length.clone().sub(off.clone()),
        ),
        Stmt::if_then(
            cnt.clone().gt(lanes.clone()),
            vec![Stmt::assign(cnt.clone(), lanes.clone())],
        ),
        Stmt::eval(CodeExpr::call(
            Intrinsic::SimdLoad {
                lane_width: *lane_width,
            },
            vec![CodeExpr::var(vector), off.clone(), cnt.clone(), CodeExpr::var(memory)],
        )),
        Stmt::eval(CodeExpr::call(
            Intrinsic::SimdCompare {
                cmp,
                lane_width: *lane_width,
            },
            vec![CodeExpr::var(memory), scalar, cnt.clone(), CodeExpr::var(lane_mask)],
        )),
        Stmt::eval(CodeExpr::call(
            Intrinsic::SimdMaskStore,
            vec![CodeExpr::var(lane_mask), off.clone(), cnt, validity],
        )),
        Stmt::increment(offset, lanes),
    ];
    Ok(vec![
        Stmt::comment(format!("{} lanes over {vector} ({ty})", lane_width.lanes())),
        Stmt::declare(offset, QueryVariableType::Scalar(LogicalType::Int), CodeExpr::int(0)),
        Stmt::while_loop(off.lt(length), body),
    ])
}

impl Operator for Filter {
    fn name(&self) -> &'static str {
        "Filter"
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
        parent: Consumer<'_>,
    ) -> DbxResult<Vec<Stmt>> {
        let mut consume = |ctx: &mut GenerationContext| self.consume_non_vec(ctx, &mut *parent);
        inputs.produce(ctx, 0, &mut consume)
    }

    fn consume_non_vec(
        &mut self,
        ctx: &mut GenerationContext,
        parent: Consumer<'_>,
    ) -> DbxResult<Vec<Stmt>> {
        debug!(target: TARGET, conjuncts = self.predicate.conjuncts(), "Filter consume (row)");
        let mut mapping = ctx.current_mapping()?.clone();
        let mut stmts = Vec::new();
        lower_row(ctx, &self.predicate, &mut mapping, &mut stmts)?;
        stmts.extend(ctx.with_mapping(mapping, |ctx| parent(ctx))?);
        Ok(stmts)
    }

    fn produce_vec(
        &mut self,
        ctx: &mut GenerationContext,
        inputs: &mut Inputs<'_>,
        parent: Consumer<'_>,
    ) -> DbxResult<Vec<Stmt>> {
        let mut consume = |ctx: &mut GenerationContext| self.consume_vec(ctx, &mut *parent);
        inputs.produce(ctx, 0, &mut consume)
    }

    fn consume_vec(
        &mut self,
        ctx: &mut GenerationContext,
        parent: Consumer<'_>,
    ) -> DbxResult<Vec<Stmt>> {
        debug!(target: TARGET, conjuncts = self.predicate.conjuncts(), "Filter consume (batch)");
        let mapping = ctx.current_mapping()?.clone();
        let (upstream, batch_length) = mapping.batch_extent("Filter")?.ok_or_else(|| {
            DbxError::unsupported("Filter", "batch filter over a row with no batch columns")
        })?;
        let (kind, elem, prefix, len_prefix) = match ctx.config().filter_policy {
            FilterPolicy::SelectionVector => (MarkerKind::Selection, LogicalType::Int, "sel", "sel_len"),
            FilterPolicy::ValidityMask => (MarkerKind::Validity, LogicalType::Boolean, "valid", "valid_len"),
        };
        if let Some(m) = &upstream {
            if m.kind != kind {
                return Err(DbxError::invariant(
                    "Filter",
                    "upstream marker kind differs from the configured filter policy",
                ));
            }
        }

        let buffer = ctx.acquire_scan_buffer(prefix, elem)?;
        let length_var = ctx.fresh(len_prefix);
        let mut stmts = vec![Stmt::declare(
            &length_var,
            QueryVariableType::Scalar(LogicalType::Int),
            batch_length.clone(),
        )];
        let lowering = BatchLowering {
            mapping: &mapping,
            kind,
            buffer,
            length_var,
        };
        let marker = lowering.lower(ctx, &self.predicate, upstream, &batch_length, &mut stmts)?;

        let filtered = mapping
            .iter()
            .map(|path| path.with_marker(&marker))
            .collect::<DbxResult<OrdinalMapping>>()?;
        stmts.extend(ctx.with_mapping(filtered, |ctx| parent(ctx))?);
        Ok(stmts)
    }
}
