//! Helpers shared by the operators: active-row loops, marker arguments and
//! scalar materialization.

use crate::codegen::access_path::{AccessPath, FilterMarker};
use crate::codegen::context::GenerationContext;
use crate::codegen::ir::{CodeExpr, Intrinsic, MarkerKind, Stmt};
use crate::codegen::types::{LogicalType, QueryVariableType};
use crate::error::{DbxError, DbxResult};

pub fn marker_kind(marker: Option<&FilterMarker>) -> MarkerKind {
    marker.map_or(MarkerKind::None, |m| m.kind)
}

/// `[marker array], length` tail of a primitive's argument list.
pub fn marker_args(marker: Option<&FilterMarker>, length: CodeExpr) -> Vec<CodeExpr> {
    let mut args = Vec::with_capacity(2);
    if let Some(m) = marker {
        args.push(m.array_expr());
    }
    args.push(length);
    args
}

/// Loop `body` over the active rows of a batch.
///
/// `length` is the selected-row count for a selection vector and the batch
/// length otherwise. `body` receives the row index expression.
pub fn for_each_active_row<F>(
    ctx: &mut GenerationContext,
    marker: Option<&FilterMarker>,
    length: CodeExpr,
    body: F,
) -> DbxResult<Vec<Stmt>>
where
    F: FnOnce(&mut GenerationContext, CodeExpr) -> DbxResult<Vec<Stmt>>,
{
    let row = ctx.fresh("row");
    match marker {
        None => {
            let inner = body(ctx, CodeExpr::var(&row))?;
            Ok(vec![Stmt::for_range(&row, CodeExpr::int(0), length, inner)])
        }
        Some(m) if m.kind == MarkerKind::Selection => {
            let pos = ctx.fresh("pos");
            let mut inner = vec![Stmt::declare(
                &row,
                QueryVariableType::Scalar(LogicalType::Int),
                m.array_expr().index(CodeExpr::var(&pos)),
            )];
            inner.extend(body(ctx, CodeExpr::var(&row))?);
            Ok(vec![Stmt::for_range(pos, CodeExpr::int(0), length, inner)])
        }
        Some(m) => {
            let inner = body(ctx, CodeExpr::var(&row))?;
            let guarded = Stmt::if_then(m.array_expr().index(CodeExpr::var(&row)), inner);
            Ok(vec![Stmt::for_range(&row, CodeExpr::int(0), length, vec![guarded])])
        }
    }
}

/// Read `path` into a local once so later uses see a scalar variable.
///
/// Byte-string elements are copied through a query-global scratch buffer.
pub fn materialize(
    ctx: &mut GenerationContext,
    path: &AccessPath,
    prefix: &str,
    out: &mut Vec<Stmt>,
) -> DbxResult<AccessPath> {
    match path {
        AccessPath::Constant { .. } | AccessPath::ScalarVariable { .. } => Ok(path.clone()),
        AccessPath::IndexedVectorElement { vector, ty, index } if ty.is_binary_like() => {
            let scratch = ctx.query_global(
                &format!("scratch_{vector}"),
                QueryVariableType::ByteBuffer,
                CodeExpr::NewByteBuffer,
            );
            let local = ctx.fresh(prefix);
            out.push(Stmt::declare(
                &local,
                QueryVariableType::Scalar(*ty),
                CodeExpr::call(
                    Intrinsic::ReadBytes,
                    vec![CodeExpr::var(vector), index.clone(), CodeExpr::var(scratch)],
                ),
            ));
            Ok(AccessPath::scalar(local, *ty))
        }
        AccessPath::IndexedVectorElement { ty, .. } | AccessPath::ArrayElement { ty, .. } => {
            let local = ctx.fresh(prefix);
            out.push(Stmt::declare(
                &local,
                QueryVariableType::Scalar(*ty),
                path.read_scalar()?,
            ));
            Ok(AccessPath::scalar(local, *ty))
        }
        other => Err(DbxError::invariant(
            "Materialize",
            format!("row-at-a-time code reached a {}", other.query_type()),
        )),
    }
}
