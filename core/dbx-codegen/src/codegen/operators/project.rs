//! Project Operator — SELECT expression lowering
//!
//! Output columns are literals, passthrough columns, arithmetic, two-way CASE
//! or date-field extraction. Batch arithmetic goes through the run-time
//! arithmetic primitives; CASE and extraction run an active-row loop.

use crate::codegen::access_path::{AccessPath, FilterMarker, OrdinalMapping};
use crate::codegen::context::GenerationContext;
use crate::codegen::ir::{ArithOp, BinOp, CodeExpr, Intrinsic, OperandShape, Stmt};
use crate::codegen::operators::batch::{for_each_active_row, marker_args, marker_kind, materialize};
use crate::codegen::operators::operator::{Consumer, Operator};
use crate::codegen::operators::tree::Inputs;
use crate::codegen::types::{LogicalType, QueryVariableType, infer_expr_type, promote_arithmetic};
use crate::error::{DbxError, DbxResult};
use crate::plan::{Expr, ScalarValue};
use crate::logging::TARGET;
use tracing::debug;

/// 프로젝션 연산자 (SELECT 컬럼 계산)
#[derive(Debug)]
pub struct Project {
    exprs: Vec<Expr>,
    input: Vec<LogicalType>,
    output: Vec<LogicalType>,
}

impl Project {
    pub fn new(exprs: &[Expr], input: &[LogicalType]) -> DbxResult<Self> {
        if exprs.is_empty() {
            return Err(DbxError::unsupported("Project", "projection with no expressions"));
        }
        let output = exprs
            .iter()
            .map(|expr| {
                check_shape(expr)?;
                infer_expr_type(expr, input)
            })
            .collect::<DbxResult<Vec<_>>>()?;
        Ok(Self {
            exprs: exprs.to_vec(),
            input: input.to_vec(),
            output,
        })
    }

    fn type_of(&self, expr: &Expr) -> DbxResult<LogicalType> {
        infer_expr_type(expr, &self.input)
    }
}

fn check_shape(expr: &Expr) -> DbxResult<()> {
    match expr {
        Expr::Column(_) => Ok(()),
        Expr::Literal(ScalarValue::Null) => {
            Err(DbxError::unsupported("Project", "NULL literal in projection"))
        }
        Expr::Literal(_) => Ok(()),
        Expr::BinaryOp { left, op, right } if op.is_arithmetic() => {
            check_shape(left)?;
            check_shape(right)
        }
        Expr::Case {
            when_left,
            when_right,
            then,
            otherwise,
        } => {
            check_shape(when_left)?;
            check_shape(when_right)?;
            check_shape(then)?;
            check_shape(otherwise)
        }
        Expr::DateExtract { expr, .. } => check_shape(expr),
        other => Err(DbxError::unsupported(
            "Project",
            format!("expression {other} cannot be projected"),
        )),
    }
}

fn references_column(expr: &Expr) -> bool {
    match expr {
        Expr::Column(_) => true,
        Expr::Literal(_) => false,
        Expr::BinaryOp { left, right, .. } => references_column(left) || references_column(right),
        Expr::Case {
            when_left,
            when_right,
            then,
            otherwise,
        } => [when_left, when_right, then, otherwise]
            .into_iter()
            .any(|e| references_column(e)),
        Expr::DateExtract { expr, .. } | Expr::Not(expr) => references_column(expr),
    }
}

fn cast_to(expr: CodeExpr, from: LogicalType, to: LogicalType) -> CodeExpr {
    if from == to { expr } else { expr.cast(to) }
}

fn arith_op(expr: &Expr) -> DbxResult<ArithOp> {
    match expr {
        Expr::BinaryOp { op, .. } => ArithOp::from_plan(*op).ok_or_else(|| {
            DbxError::unsupported("Project", format!("operator {} in projection", op.symbol()))
        }),
        other => Err(DbxError::invariant("Project", format!("{other} is not arithmetic"))),
    }
}

/// Marker and iteration length shared by the batch operands.
fn common_marker(paths: &[&AccessPath]) -> DbxResult<(Option<FilterMarker>, CodeExpr)> {
    let mut batches = paths.iter().filter(|p| p.is_vector_family());
    let first = batches.next().ok_or_else(|| {
        DbxError::invariant("Project", "batch lowering without a batch operand")
    })?;
    let marker = first.marker();
    for path in batches {
        if path.marker() != marker {
            return Err(DbxError::invariant(
                "Project",
                "operands carry different filtering markers",
            ));
        }
    }
    let length = match &marker {
        Some(m) => m.length.clone(),
        None => first.batch_length()?,
    };
    Ok((marker, length))
}

fn typed(path: &AccessPath) -> DbxResult<LogicalType> {
    path.logical_type()
        .ok_or_else(|| DbxError::invariant("Project", "operand without a value type"))
}

// ===== Row-at-a-time lowering =====

struct RowLowering<'p> {
    project: &'p Project,
    mapping: OrdinalMapping,
    stmts: Vec<Stmt>,
}

impl RowLowering<'_> {
    fn expr(&mut self, ctx: &mut GenerationContext, expr: &Expr) -> DbxResult<(CodeExpr, LogicalType)> {
        match expr {
            Expr::Column(idx) => {
                let path = materialize(ctx, self.mapping.get(*idx)?, "val", &mut self.stmts)?;
                self.mapping.replace(*idx, path.clone())?;
                Ok((path.read_scalar()?, typed(&path)?))
            }
            Expr::Literal(value) => {
                let path = AccessPath::constant(value)?;
                Ok((path.read_scalar()?, typed(&path)?))
            }
            Expr::BinaryOp { left, op, right } => {
                let (l, lt) = self.expr(ctx, left)?;
                let (r, rt) = self.expr(ctx, right)?;
                let t = promote_arithmetic(*op, lt, rt)?;
                let code = CodeExpr::binary(arith_op(expr)?.to_binop(), cast_to(l, lt, t), cast_to(r, rt, t));
                Ok((code, t))
            }
            Expr::Case {
                when_left,
                when_right,
                then,
                otherwise,
            } => {
                let t = self.project.type_of(expr)?;
                let (a, _) = self.expr(ctx, when_left)?;
                let (b, _) = self.expr(ctx, when_right)?;
                let (x, xt) = self.expr(ctx, then)?;
                let (y, yt) = self.expr(ctx, otherwise)?;
                let local = ctx.fresh("case");
                self.stmts.push(Stmt::declare(
                    &local,
                    QueryVariableType::Scalar(t),
                    cast_to(y, yt, t),
                ));
                self.stmts.push(Stmt::if_then(
                    CodeExpr::binary(BinOp::Eq, a, b),
                    vec![Stmt::assign(CodeExpr::var(&local), cast_to(x, xt, t))],
                ));
                Ok((CodeExpr::var(local), t))
            }
            Expr::DateExtract { field, expr } => {
                let (d, _) = self.expr(ctx, expr)?;
                Ok((
                    CodeExpr::call(Intrinsic::ExtractDate(*field), vec![d]),
                    LogicalType::Int,
                ))
            }
            Expr::Not(_) => Err(DbxError::unsupported("Project", "NOT in projection")),
        }
    }
}

// ===== Batch lowering =====

struct BatchLowering<'p> {
    project: &'p Project,
    mapping: OrdinalMapping,
    stmts: Vec<Stmt>,
}

impl BatchLowering<'_> {
    fn path(&mut self, ctx: &mut GenerationContext, expr: &Expr) -> DbxResult<AccessPath> {
        match expr {
            Expr::Column(idx) => Ok(self.mapping.get(*idx)?.clone()),
            Expr::Literal(value) => AccessPath::constant(value),
            Expr::BinaryOp { left, op, right } => {
                let l = self.path(ctx, left)?;
                let r = self.path(ctx, right)?;
                let t = promote_arithmetic(*op, typed(&l)?, typed(&r)?)?;
                self.arith(ctx, arith_op(expr)?, &l, &r, t)
            }
            Expr::Case {
                when_left,
                when_right,
                then,
                otherwise,
            } => {
                let t = self.project.type_of(expr)?;
                let operands = [
                    self.path(ctx, when_left)?,
                    self.path(ctx, when_right)?,
                    self.path(ctx, then)?,
                    self.path(ctx, otherwise)?,
                ];
                self.row_loop(ctx, "case", t, &operands, |reads| {
                    let [a, b, x, y] = reads else {
                        return Err(DbxError::invariant("Project", "CASE arity"));
                    };
                    Ok((
                        Some(CodeExpr::binary(BinOp::Eq, a.0.clone(), b.0.clone())),
                        cast_to(x.0.clone(), x.1, t),
                        cast_to(y.0.clone(), y.1, t),
                    ))
                })
            }
            Expr::DateExtract { field, expr } => {
                let operand = [self.path(ctx, expr)?];
                let field = *field;
                self.row_loop(ctx, "extract", LogicalType::Int, &operand, |reads| {
                    let call = CodeExpr::call(Intrinsic::ExtractDate(field), vec![reads[0].0.clone()]);
                    Ok((None, call.clone(), call))
                })
            }
            Expr::Not(_) => Err(DbxError::unsupported("Project", "NOT in projection")),
        }
    }

    fn arith(
        &mut self,
        ctx: &mut GenerationContext,
        op: ArithOp,
        l: &AccessPath,
        r: &AccessPath,
        t: LogicalType,
    ) -> DbxResult<AccessPath> {
        if !l.is_vector_family() && !r.is_vector_family() {
            let local = ctx.fresh("arith");
            let code = CodeExpr::binary(
                op.to_binop(),
                cast_to(l.read_scalar()?, typed(l)?, t),
                cast_to(r.read_scalar()?, typed(r)?, t),
            );
            self.stmts.push(Stmt::declare(&local, QueryVariableType::Scalar(t), code));
            return Ok(AccessPath::scalar(local, t));
        }

        let (marker, length) = common_marker(&[l, r])?;
        let operand = |p: &AccessPath| -> DbxResult<(OperandShape, CodeExpr)> {
            if p.is_vector_family() {
                Ok((OperandShape::Vector, p.vector_expr()?))
            } else {
                Ok((OperandShape::Scalar, p.read_scalar()?))
            }
        };
        let (lhs_shape, lhs) = operand(l)?;
        let (rhs_shape, rhs) = operand(r)?;
        let buffer = ctx.acquire_scan_buffer("arith", t)?;
        let len_var = ctx.fresh("len");

        let mut args = vec![lhs, rhs];
        args.extend(marker_args(marker.as_ref(), length));
        args.push(CodeExpr::var(&buffer));
        let primitive = Intrinsic::VectorArith {
            op,
            lhs: lhs_shape,
            rhs: rhs_shape,
            marker: marker_kind(marker.as_ref()),
            result: t,
        };
        self.stmts.push(Stmt::declare(
            &len_var,
            QueryVariableType::Scalar(LogicalType::Int),
            CodeExpr::call(primitive, args),
        ));
        let result = AccessPath::RawArraySlice {
            array: buffer,
            ty: t,
            length: Box::new(AccessPath::scalar(len_var, LogicalType::Int)),
        };
        match marker {
            Some(m) => result.with_marker(&m),
            None => Ok(result),
        }
    }

    /// Per-row lowering: `build` maps the operands' scalar reads to an
    /// optional condition and the values for the true/false branches.
    fn row_loop<F>(
        &mut self,
        ctx: &mut GenerationContext,
        prefix: &str,
        t: LogicalType,
        operands: &[AccessPath],
        build: F,
    ) -> DbxResult<AccessPath>
    where
        F: Fn(&[(CodeExpr, LogicalType)]) -> DbxResult<(Option<CodeExpr>, CodeExpr, CodeExpr)>,
    {
        let read_all = |row: Option<&CodeExpr>| -> DbxResult<Vec<(CodeExpr, LogicalType)>> {
            operands
                .iter()
                .map(|p| {
                    let p = match row {
                        Some(row) => p.element_at(row.clone())?,
                        None => p.clone(),
                    };
                    Ok((p.read_scalar()?, typed(&p)?))
                })
                .collect()
        };
        let assign_into = |target: CodeExpr, cond: Option<CodeExpr>, x: CodeExpr, y: CodeExpr| match cond {
            Some(cond) => Stmt::if_else(
                cond,
                vec![Stmt::assign(target.clone(), x)],
                vec![Stmt::assign(target, y)],
            ),
            None => Stmt::assign(target, x),
        };

        if operands.iter().all(|p| !p.is_vector_family()) {
            let local = ctx.fresh(prefix);
            let (cond, x, y) = build(&read_all(None)?)?;
            match cond {
                Some(cond) => {
                    self.stmts.push(Stmt::declare(&local, QueryVariableType::Scalar(t), y));
                    self.stmts.push(Stmt::if_then(
                        cond,
                        vec![Stmt::assign(CodeExpr::var(&local), x)],
                    ));
                }
                None => self.stmts.push(Stmt::declare(&local, QueryVariableType::Scalar(t), x)),
            }
            return Ok(AccessPath::scalar(local, t));
        }

        let refs: Vec<&AccessPath> = operands.iter().collect();
        let (marker, length) = common_marker(&refs)?;
        let buffer = ctx.acquire_scan_buffer(prefix, t)?;
        let len_var = ctx.fresh("len");
        self.stmts.push(Stmt::declare(
            &len_var,
            QueryVariableType::Scalar(LogicalType::Int),
            length.clone(),
        ));
        let rows = for_each_active_row(ctx, marker.as_ref(), length, |_, row| {
            let (cond, x, y) = build(&read_all(Some(&row))?)?;
            Ok(vec![assign_into(CodeExpr::var(&buffer).index(row), cond, x, y)])
        })?;
        self.stmts.extend(rows);

        let result = AccessPath::RawArraySlice {
            array: buffer,
            ty: t,
            length: Box::new(AccessPath::scalar(len_var, LogicalType::Int)),
        };
        match marker {
            Some(m) => result.with_marker(&m),
            None => Ok(result),
        }
    }
}

impl Operator for Project {
    fn name(&self) -> &'static str {
        "Project"
    }

    fn output_types(&self) -> &[LogicalType] {
        &self.output
    }

    fn can_produce_non_vectorised(&self) -> bool {
        true
    }

    /// A projection of literals only has no batch to carry the row count.
    fn can_produce_vectorised(&self) -> bool {
        self.exprs.iter().any(references_column)
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
        debug!(target: TARGET, columns = self.exprs.len(), "Project consume (row)");
        let mut lowering = RowLowering {
            project: self,
            mapping: ctx.current_mapping()?.clone(),
            stmts: Vec::new(),
        };
        let mut out = OrdinalMapping::new();
        for (expr, ty) in self.exprs.iter().zip(&self.output) {
            let path = match expr {
                Expr::Column(idx) => lowering.mapping.get(*idx)?.clone(),
                Expr::Literal(value) => AccessPath::constant(value)?,
                computed => {
                    let (code, _) = lowering.expr(ctx, computed)?;
                    let local = ctx.fresh("proj");
                    lowering
                        .stmts
                        .push(Stmt::declare(&local, QueryVariableType::Scalar(*ty), code));
                    AccessPath::scalar(local, *ty)
                }
            };
            out.push(path);
        }
        let mut stmts = lowering.stmts;
        stmts.extend(ctx.with_mapping(out, |ctx| parent(ctx))?);
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
        debug!(target: TARGET, columns = self.exprs.len(), "Project consume (batch)");
        let mapping = ctx.current_mapping()?.clone();
        mapping.shared_marker("Project")?;
        let mut lowering = BatchLowering {
            project: self,
            mapping,
            stmts: Vec::new(),
        };
        let out = self
            .exprs
            .iter()
            .map(|expr| lowering.path(ctx, expr))
            .collect::<DbxResult<OrdinalMapping>>()?;
        let mut stmts = lowering.stmts;
        stmts.extend(ctx.with_mapping(out, |ctx| parent(ctx))?);
        Ok(stmts)
    }
}
