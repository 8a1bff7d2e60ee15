//! Join Operator — blocking inner hash equi-join
//!
//! The left input is the build side: its rows are stored in a generated
//! multi-record map keyed by the join column. The right input probes the map
//! and every match is pushed to the parent with the build side's stored
//! columns followed by the probe side's columns.

use crate::codegen::access_path::{AccessPath, FilterMarker, OrdinalMapping};
use crate::codegen::context::GenerationContext;
use crate::codegen::hash_map::{MapDescriptor, NEXT_FIELD, value_field};
use crate::codegen::ir::{CodeExpr, Intrinsic, MarkerKind, Method, Stmt};
use crate::codegen::operators::batch::{for_each_active_row, marker_args, marker_kind, materialize};
use crate::codegen::operators::operator::{Consumer, Operator, ProductionStyle};
use crate::codegen::operators::tree::Inputs;
use crate::codegen::types::{LogicalType, QueryVariableType};
use crate::error::{DbxError, DbxResult};
use crate::plan::{BinaryOperator, Expr, JoinType};
use crate::logging::TARGET;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinPhase {
    Build,
    Probe,
}

/// 해시 조인 연산자 (Build → Probe)
#[derive(Debug)]
pub struct Join {
    /// Key column within the left input
    build_key: usize,
    /// Key column within the right input
    probe_key: usize,
    key_type: LogicalType,
    left: Vec<LogicalType>,
    right: Vec<LogicalType>,
    output: Vec<LogicalType>,
    phase: JoinPhase,
    map: Option<(String, Arc<MapDescriptor>)>,
}

impl Join {
    /// `on` refers to left columns first, then right columns.
    pub fn new(
        join_type: JoinType,
        on: &Expr,
        left: &[LogicalType],
        right: &[LogicalType],
    ) -> DbxResult<Self> {
        if join_type != JoinType::Inner {
            return Err(DbxError::unsupported(
                "Join",
                format!("{join_type:?} joins are not compiled"),
            ));
        }
        let (a, b) = match on {
            Expr::BinaryOp {
                left: l,
                op: BinaryOperator::Eq,
                right: r,
            } => match (l.as_ref(), r.as_ref()) {
                (Expr::Column(a), Expr::Column(b)) => (*a, *b),
                _ => {
                    return Err(DbxError::unsupported(
                        "Join",
                        format!("condition {on} is not column = column"),
                    ));
                }
            },
            _ => {
                return Err(DbxError::unsupported(
                    "Join",
                    format!("condition {on} is not a single equality"),
                ));
            }
        };

        let width = left.len() + right.len();
        if a >= width || b >= width {
            return Err(DbxError::unsupported(
                "Join",
                format!("condition {on} references a column outside {width} columns"),
            ));
        }
        let (build, probe) = match (a < left.len(), b < left.len()) {
            (true, false) => (a, b - left.len()),
            (false, true) => (b, a - left.len()),
            _ => {
                return Err(DbxError::unsupported(
                    "Join",
                    format!("condition {on} does not relate the two inputs"),
                ));
            }
        };

        let key_type = left[build];
        if key_type != right[probe] {
            return Err(DbxError::type_mismatch(
                key_type.to_string(),
                right[probe].to_string(),
            ));
        }
        if !matches!(key_type, LogicalType::Int | LogicalType::Long) {
            return Err(DbxError::unsupported(
                "Join",
                format!("{key_type} join keys"),
            ));
        }

        Ok(Self {
            build_key: build,
            probe_key: probe,
            key_type,
            left: left.to_vec(),
            right: right.to_vec(),
            output: left.iter().chain(right).copied().collect(),
            phase: JoinPhase::Build,
            map: None,
        })
    }

    /// Left columns stored in the map, with their value slot.
    fn stored_columns(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.left.len())
            .filter(move |&j| j != self.build_key)
            .enumerate()
            .map(|(slot, column)| (column, slot))
    }

    fn map_name(&self) -> DbxResult<&str> {
        self.map
            .as_ref()
            .map(|(name, _)| name.as_str())
            .ok_or_else(|| DbxError::invariant("Join", "consume before produce"))
    }

    fn produce_join(
        &mut self,
        ctx: &mut GenerationContext,
        inputs: &mut Inputs<'_>,
        parent: Consumer<'_>,
        style: ProductionStyle,
    ) -> DbxResult<Vec<Stmt>> {
        let values = self.stored_columns().map(|(column, _)| self.left[column]).collect();
        let descriptor = ctx.register_map_type(MapDescriptor::join(self.key_type, values));
        let map = ctx.fresh("join_map");
        let mut stmts = vec![Stmt::declare(
            &map,
            QueryVariableType::GeneratedMap(descriptor.name.clone()),
            CodeExpr::NewMap(descriptor.name.clone()),
        )];
        debug!(target: TARGET, map = %descriptor.name, %style, "Join produce");
        self.map = Some((map, descriptor));
        self.phase = JoinPhase::Build;

        let mut consume = |ctx: &mut GenerationContext| self.consume(ctx, &mut *parent, style);
        stmts.extend(inputs.produce(ctx, 0, &mut consume)?);
        if self.phase != JoinPhase::Probe {
            return Err(DbxError::invariant(
                "Join",
                "build input finished without a build consume",
            ));
        }
        let mut consume = |ctx: &mut GenerationContext| self.consume(ctx, &mut *parent, style);
        stmts.extend(inputs.produce(ctx, 1, &mut consume)?);
        Ok(stmts)
    }

    // ===== Build =====

    fn build_row(&mut self, ctx: &mut GenerationContext) -> DbxResult<Vec<Stmt>> {
        let mapping = ctx.current_mapping()?.clone();
        let map = self.map_name()?.to_string();
        let mut stmts = Vec::new();
        let key = materialize(ctx, mapping.get(self.build_key)?, "key", &mut stmts)?.read_scalar()?;
        let hash = ctx.fresh("hash");
        stmts.push(Stmt::declare(
            &hash,
            QueryVariableType::Scalar(LogicalType::Long),
            CodeExpr::call(Intrinsic::PreHash, vec![key.clone()]),
        ));
        let mut args = vec![key, CodeExpr::var(&hash)];
        for (column, _) in self.stored_columns() {
            args.push(mapping.get(column)?.read_scalar()?);
        }
        stmts.push(Stmt::eval(CodeExpr::var(&map).method(Method::Associate, args)));
        self.phase = JoinPhase::Probe;
        Ok(stmts)
    }

    fn build_batch(
        &mut self,
        ctx: &mut GenerationContext,
        mapping: &OrdinalMapping,
        marker: Option<FilterMarker>,
        length: CodeExpr,
    ) -> DbxResult<Vec<Stmt>> {
        let map = self.map_name()?.to_string();
        let key = mapping.get(self.build_key)?.clone();
        let mut stmts = Vec::new();
        let hashes = self.hash_keys(ctx, &key, marker.as_ref(), length.clone(), &mut stmts)?;
        let stored: Vec<usize> = self.stored_columns().map(|(column, _)| column).collect();
        stmts.extend(for_each_active_row(ctx, marker.as_ref(), length, |_, row| {
            let key_value = key.element_at(row.clone())?.read_scalar()?;
            let mut args = vec![key_value.clone(), hash_at(hashes.as_deref(), &key_value, &row)];
            for &column in &stored {
                args.push(mapping.get(column)?.element_at(row.clone())?.read_scalar()?);
            }
            Ok(vec![Stmt::eval(CodeExpr::var(&map).method(Method::Associate, args))])
        })?);
        self.phase = JoinPhase::Probe;
        Ok(stmts)
    }

    /// Pre-hash a vector key into a scan buffer; `None` for a scalar key.
    fn hash_keys(
        &self,
        ctx: &mut GenerationContext,
        key: &AccessPath,
        marker: Option<&FilterMarker>,
        length: CodeExpr,
        out: &mut Vec<Stmt>,
    ) -> DbxResult<Option<String>> {
        if !key.is_vector_family() {
            return Ok(None);
        }
        let hashes = ctx.acquire_scan_buffer("hashes", LogicalType::Long)?;
        let mut args = vec![key.vector_expr()?];
        args.extend(marker_args(marker, length));
        args.push(CodeExpr::var(&hashes));
        out.push(Stmt::eval(CodeExpr::call(
            Intrinsic::VectorHash {
                marker: marker_kind(marker),
                combine: false,
            },
            args,
        )));
        Ok(Some(hashes))
    }

    // ===== Probe =====

    fn probe_row(&mut self, ctx: &mut GenerationContext, parent: Consumer<'_>) -> DbxResult<Vec<Stmt>> {
        let mapping = ctx.current_mapping()?.clone();
        let map = self.map_name()?.to_string();
        let int = QueryVariableType::Scalar(LogicalType::Int);
        let mut stmts = Vec::new();
        let key = materialize(ctx, mapping.get(self.probe_key)?, "key", &mut stmts)?;
        let key_value = key.read_scalar()?;
        let hash = ctx.fresh("hash");
        stmts.push(Stmt::declare(
            &hash,
            QueryVariableType::Scalar(LogicalType::Long),
            CodeExpr::call(Intrinsic::PreHash, vec![key_value.clone()]),
        ));
        let cursor = ctx.fresh("cursor");
        stmts.push(Stmt::declare(
            &cursor,
            int.clone(),
            CodeExpr::var(&map).method(Method::GetIndex, vec![key_value, CodeExpr::var(&hash)]),
        ));

        let record = ctx.fresh("rec");
        let mut output = OrdinalMapping::new();
        let mut stored = self.stored_columns();
        for column in 0..self.left.len() {
            if column == self.build_key {
                output.push(key.clone());
                continue;
            }
            let (_, slot) = stored
                .next()
                .ok_or_else(|| DbxError::invariant("Join", "stored column count"))?;
            output.push(AccessPath::ArrayElement {
                array: CodeExpr::var(&map).field(value_field(slot)),
                ty: self.left[column],
                index: CodeExpr::var(&record),
            });
        }
        for column in 0..self.right.len() {
            if column == self.probe_key {
                output.push(key.clone());
            } else {
                output.push(mapping.get(column)?.clone());
            }
        }

        // advance the chain before the parent body so `continue` is safe
        let mut chain = vec![
            Stmt::declare(&record, int, CodeExpr::var(&cursor)),
            Stmt::assign(
                CodeExpr::var(&cursor),
                CodeExpr::var(&map).field(NEXT_FIELD).index(CodeExpr::var(&record)),
            ),
        ];
        chain.extend(ctx.with_mapping(output, |ctx| parent(ctx))?);
        stmts.push(Stmt::while_loop(
            CodeExpr::var(&cursor).ne(CodeExpr::int(-1)),
            chain,
        ));
        Ok(stmts)
    }

    /// Two-level probe loop filling output batches of `vector_capacity` rows.
    ///
    /// The inner loop stops on a full batch with `resume` set, so the next
    /// round continues the same probe row's chain.
    fn probe_batch(
        &mut self,
        ctx: &mut GenerationContext,
        parent: Consumer<'_>,
        mapping: &OrdinalMapping,
        marker: Option<FilterMarker>,
        length: CodeExpr,
    ) -> DbxResult<Vec<Stmt>> {
        let map = self.map_name()?.to_string();
        let int = QueryVariableType::Scalar(LogicalType::Int);
        let capacity = ctx.capacity_expr()?;
        let key = mapping.get(self.probe_key)?.clone();

        let mut stmts = Vec::new();
        let hashes = self.hash_keys(ctx, &key, marker.as_ref(), length.clone(), &mut stmts)?;

        let pos = ctx.fresh("pos");
        let cursor = ctx.fresh("cursor");
        let resume = ctx.fresh("resume");
        let active = ctx.fresh("n_active");
        let out_len = ctx.fresh("out_len");
        let row = ctx.fresh("row");
        let row_expr = CodeExpr::var(&row);
        let out_at = CodeExpr::var(&out_len);

        // copies for one match, and the batch each output column reads from
        let mut copies = Vec::new();
        let mut output = OrdinalMapping::new();
        let key_value = key.element_at(row_expr.clone())?.read_scalar()?;
        let key_buffer = ctx.acquire_scan_buffer("join_out", self.key_type)?;
        copies.push(Stmt::assign(
            CodeExpr::var(&key_buffer).index(out_at.clone()),
            key_value.clone(),
        ));
        let key_output = out_slice(&key_buffer, self.key_type, &out_len);

        let mut stored = self.stored_columns();
        for column in 0..self.left.len() {
            if column == self.build_key {
                output.push(key_output.clone());
                continue;
            }
            let (_, slot) = stored
                .next()
                .ok_or_else(|| DbxError::invariant("Join", "stored column count"))?;
            let ty = self.left[column];
            let buffer = ctx.acquire_scan_buffer("join_out", ty)?;
            copies.push(Stmt::assign(
                CodeExpr::var(&buffer).index(out_at.clone()),
                CodeExpr::var(&map).field(value_field(slot)).index(CodeExpr::var(&cursor)),
            ));
            output.push(out_slice(&buffer, ty, &out_len));
        }
        for column in 0..self.right.len() {
            if column == self.probe_key {
                output.push(key_output.clone());
                continue;
            }
            let path = mapping.get(column)?;
            if !path.is_vector_family() {
                output.push(path.clone());
                continue;
            }
            let ty = self.right[column];
            let buffer = ctx.acquire_scan_buffer("join_out", ty)?;
            copies.push(Stmt::assign(
                CodeExpr::var(&buffer).index(out_at.clone()),
                path.element_at(row_expr.clone())?.read_scalar()?,
            ));
            output.push(out_slice(&buffer, ty, &out_len));
        }
        copies.push(Stmt::increment(&out_len, CodeExpr::int(1)));
        copies.push(Stmt::assign(
            CodeExpr::var(&cursor),
            CodeExpr::var(&map).field(NEXT_FIELD).index(CodeExpr::var(&cursor)),
        ));

        let mut fill = vec![Stmt::declare(
            &row,
            int.clone(),
            match &marker {
                Some(m) if m.kind == MarkerKind::Selection => m.array_expr().index(CodeExpr::var(&pos)),
                _ => CodeExpr::var(&pos),
            },
        )];
        if let Some(m) = marker.as_ref().filter(|m| m.kind == MarkerKind::Validity) {
            fill.push(Stmt::if_then(
                m.array_expr().index(row_expr.clone()).not(),
                vec![Stmt::increment(&pos, CodeExpr::int(1)), Stmt::Continue],
            ));
        }
        fill.push(Stmt::if_then(
            CodeExpr::var(&resume).not(),
            vec![Stmt::assign(
                CodeExpr::var(&cursor),
                CodeExpr::var(&map).method(
                    Method::GetIndex,
                    vec![key_value.clone(), hash_at(hashes.as_deref(), &key_value, &row_expr)],
                ),
            )],
        ));
        fill.push(Stmt::while_loop(
            CodeExpr::var(&cursor)
                .ne(CodeExpr::int(-1))
                .and(CodeExpr::var(&out_len).lt(capacity.clone())),
            copies,
        ));
        fill.push(Stmt::if_else(
            CodeExpr::var(&cursor).eq(CodeExpr::int(-1)),
            vec![
                Stmt::increment(&pos, CodeExpr::int(1)),
                Stmt::assign(CodeExpr::var(&resume), CodeExpr::bool(false)),
            ],
            vec![Stmt::assign(CodeExpr::var(&resume), CodeExpr::bool(true))],
        ));

        let mut round = vec![
            Stmt::declare(&out_len, int.clone(), CodeExpr::int(0)),
            Stmt::while_loop(
                CodeExpr::var(&pos)
                    .lt(CodeExpr::var(&active))
                    .and(CodeExpr::var(&out_len).lt(capacity)),
                fill,
            ),
        ];
        let emit = ctx.with_mapping(output, |ctx| parent(ctx))?;
        round.push(Stmt::if_then(CodeExpr::var(&out_len).gt(CodeExpr::int(0)), emit));

        stmts.extend([
            Stmt::declare(&pos, int.clone(), CodeExpr::int(0)),
            Stmt::declare(&cursor, int.clone(), CodeExpr::int(-1)),
            Stmt::declare(
                &resume,
                QueryVariableType::Scalar(LogicalType::Boolean),
                CodeExpr::bool(false),
            ),
            Stmt::declare(&active, int, length),
            Stmt::while_loop(CodeExpr::var(&pos).lt(CodeExpr::var(&active)), round),
        ]);
        Ok(stmts)
    }
}

/// Row pre-hash: the batch hash buffer when there is one, else computed inline.
fn hash_at(hashes: Option<&str>, key: &CodeExpr, row: &CodeExpr) -> CodeExpr {
    match hashes {
        Some(buffer) => CodeExpr::var(buffer).index(row.clone()),
        None => CodeExpr::call(Intrinsic::PreHash, vec![key.clone()]),
    }
}

fn out_slice(buffer: &str, ty: LogicalType, out_len: &str) -> AccessPath {
    AccessPath::RawArraySlice {
        array: buffer.to_string(),
        ty,
        length: Box::new(AccessPath::scalar(out_len, LogicalType::Int)),
    }
}

impl Operator for Join {
    fn name(&self) -> &'static str {
        "Join"
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
        parent: Consumer<'_>,
    ) -> DbxResult<Vec<Stmt>> {
        self.produce_join(ctx, inputs, parent, ProductionStyle::NonVectorised)
    }

    fn consume_non_vec(
        &mut self,
        ctx: &mut GenerationContext,
        parent: Consumer<'_>,
    ) -> DbxResult<Vec<Stmt>> {
        match self.phase {
            JoinPhase::Build => self.build_row(ctx),
            JoinPhase::Probe => self.probe_row(ctx, parent),
        }
    }

    fn produce_vec(
        &mut self,
        ctx: &mut GenerationContext,
        inputs: &mut Inputs<'_>,
        parent: Consumer<'_>,
    ) -> DbxResult<Vec<Stmt>> {
        self.produce_join(ctx, inputs, parent, ProductionStyle::Vectorised)
    }

    fn consume_vec(
        &mut self,
        ctx: &mut GenerationContext,
        parent: Consumer<'_>,
    ) -> DbxResult<Vec<Stmt>> {
        let mapping = ctx.current_mapping()?.clone();
        let extent = mapping.batch_extent("Join")?;
        match (self.phase, extent) {
            (JoinPhase::Build, Some((marker, length))) => self.build_batch(ctx, &mapping, marker, length),
            (JoinPhase::Build, None) => self.build_row(ctx),
            (JoinPhase::Probe, Some((marker, length))) => {
                self.probe_batch(ctx, parent, &mapping, marker, length)
            }
            (JoinPhase::Probe, None) => self.probe_row(ctx, parent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn on(a: usize, b: usize) -> Expr {
        Expr::eq(Expr::col(a), Expr::col(b))
    }

    #[test]
    fn test_condition_is_reordered_build_first() {
        let left = [LogicalType::Int, LogicalType::Varchar];
        let right = [LogicalType::Int, LogicalType::Varchar];
        let join = Join::new(JoinType::Inner, &on(2, 0), &left, &right).unwrap();
        assert_eq!(join.build_key, 0);
        assert_eq!(join.probe_key, 0);
        assert_eq!(join.output_types().len(), 4);
        assert_eq!(join.stored_columns().collect::<Vec<_>>(), vec![(1, 0)]);
    }

    #[test]
    fn test_rejected_shapes() {
        let left = [LogicalType::Int, LogicalType::Long];
        let right = [LogicalType::Long, LogicalType::Varchar, LogicalType::Double];

        let err = Join::new(JoinType::Left, &on(0, 2), &left, &right).unwrap_err();
        assert!(matches!(err, DbxError::UnsupportedPlanShape { .. }));

        // same side
        assert!(Join::new(JoinType::Inner, &on(0, 1), &left, &right).is_err());

        let err = Join::new(JoinType::Inner, &on(0, 2), &left, &right).unwrap_err();
        assert!(matches!(err, DbxError::TypeMismatch { .. }));

        // double keys
        let err = Join::new(
            JoinType::Inner,
            &on(0, 1),
            &[LogicalType::Double],
            &[LogicalType::Double],
        )
        .unwrap_err();
        assert!(matches!(err, DbxError::UnsupportedPlanShape { .. }));

        let non_equi = Expr::binary(Expr::col(1), BinaryOperator::Lt, Expr::col(2));
        assert!(Join::new(JoinType::Inner, &non_equi, &left, &right).is_err());
    }

    #[test]
    fn test_hash_at_prefers_buffer() {
        let row = CodeExpr::var("r");
        let key = CodeExpr::var("k");
        assert!(matches!(hash_at(Some("h"), &key, &row), CodeExpr::Index { .. }));
        assert!(matches!(
            hash_at(None, &key, &row),
            CodeExpr::Call {
                func: Intrinsic::PreHash,
                ..
            }
        ));
    }
}
