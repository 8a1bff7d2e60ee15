//! Aggregation Operator — blocking COUNT/SUM, plain or grouped
//!
//! Plain aggregation keeps one scalar accumulator per aggregate and emits a
//! single row after its input is exhausted. Grouped aggregation accumulates
//! into a generated aggregation map and emits its groups in insertion order.

use crate::codegen::access_path::{AccessPath, FilterMarker, OrdinalMapping};
use crate::codegen::context::GenerationContext;
use crate::codegen::hash_map::{MapDescriptor, NUM_RECORDS_FIELD, key_field, value_field};
use crate::codegen::ir::{BinOp, CodeExpr, Intrinsic, Literal, Method, Stmt};
use crate::codegen::operators::batch::{for_each_active_row, marker_args, marker_kind, materialize};
use crate::codegen::operators::operator::{Consumer, Operator, ProductionStyle};
use crate::codegen::operators::tree::Inputs;
use crate::codegen::types::{LogicalType, QueryVariableType};
use crate::error::{DbxError, DbxResult};
use crate::plan::{AggregateExpr, AggregateFunction};
use crate::logging::TARGET;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggKind {
    Count,
    Sum,
}

/// One aggregate: what it computes, over which input, into which type.
#[derive(Debug, Clone)]
struct AggSlot {
    kind: AggKind,
    input: Option<usize>,
    ty: LogicalType,
}

#[derive(Debug)]
enum AggState {
    Idle,
    Plain { accumulators: Vec<String> },
    Grouped { map: String },
}

/// 해시 집계 연산자 (GROUP BY + COUNT/SUM)
#[derive(Debug)]
pub struct Aggregation {
    group_by: Vec<usize>,
    slots: Vec<AggSlot>,
    input: Vec<LogicalType>,
    output: Vec<LogicalType>,
    state: AggState,
}

impl Aggregation {
    pub fn new(group_by: &[usize], aggregates: &[AggregateExpr], input: &[LogicalType]) -> DbxResult<Self> {
        let grouped = !group_by.is_empty();
        if !grouped && aggregates.is_empty() {
            return Err(DbxError::unsupported("Aggregation", "no groups and no aggregates"));
        }
        let column_type = |idx: usize| {
            input.get(idx).copied().ok_or_else(|| {
                DbxError::unsupported(
                    "Aggregation",
                    format!("column #{idx} out of range ({} columns)", input.len()),
                )
            })
        };
        let mut output = group_by
            .iter()
            .map(|&idx| column_type(idx))
            .collect::<DbxResult<Vec<_>>>()?;

        let mut slots = Vec::with_capacity(aggregates.len());
        for agg in aggregates {
            let slot = match agg.function {
                AggregateFunction::Count => {
                    if let Some(idx) = agg.input {
                        column_type(idx)?;
                    }
                    AggSlot {
                        kind: AggKind::Count,
                        input: agg.input,
                        ty: if grouped { LogicalType::Int } else { LogicalType::Long },
                    }
                }
                AggregateFunction::Sum => {
                    let idx = agg.input.ok_or_else(|| {
                        DbxError::unsupported("Aggregation", "SUM needs an input column")
                    })?;
                    let ty = column_type(idx)?;
                    if !ty.is_numeric() {
                        return Err(DbxError::type_mismatch("numeric SUM input", ty.to_string()));
                    }
                    AggSlot {
                        kind: AggKind::Sum,
                        input: Some(idx),
                        ty: ty.widened(),
                    }
                }
                other => {
                    return Err(DbxError::unsupported(
                        "Aggregation",
                        format!("aggregate function {other:?}"),
                    ));
                }
            };
            output.push(slot.ty);
            slots.push(slot);
        }

        Ok(Self {
            group_by: group_by.to_vec(),
            slots,
            input: input.to_vec(),
            output,
            state: AggState::Idle,
        })
    }

    fn zero(ty: LogicalType) -> CodeExpr {
        match ty {
            LogicalType::Double => CodeExpr::Lit(Literal::Double(0.0)),
            LogicalType::Int => CodeExpr::int(0),
            _ => CodeExpr::long(0),
        }
    }

    fn input_type(&self, slot: &AggSlot) -> DbxResult<LogicalType> {
        slot.input
            .map(|idx| self.input[idx])
            .ok_or_else(|| DbxError::invariant("Aggregation", "SUM without an input column"))
    }

    fn produce_groups(
        &mut self,
        ctx: &mut GenerationContext,
        inputs: &mut Inputs<'_>,
        parent: Consumer<'_>,
        style: ProductionStyle,
    ) -> DbxResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        if self.group_by.is_empty() {
            let mut accumulators = Vec::with_capacity(self.slots.len());
            for slot in &self.slots {
                let acc = ctx.fresh("acc");
                stmts.push(Stmt::declare(&acc, QueryVariableType::Scalar(slot.ty), Self::zero(slot.ty)));
                accumulators.push(acc);
            }
            self.state = AggState::Plain { accumulators };
        } else {
            let keys = self.group_by.iter().map(|&idx| self.input[idx]).collect();
            let values = self.slots.iter().map(|slot| slot.ty).collect();
            let descriptor = ctx.register_map_type(MapDescriptor::aggregation(keys, values));
            let map = ctx.fresh("agg_map");
            stmts.push(Stmt::declare(
                &map,
                QueryVariableType::GeneratedMap(descriptor.name.clone()),
                CodeExpr::NewMap(descriptor.name.clone()),
            ));
            self.state = AggState::Grouped { map };
        }
        debug!(target: TARGET, grouped = !self.group_by.is_empty(), aggregates = self.slots.len(), %style, "Aggregation produce");

        {
            let mut consume =
                |ctx: &mut GenerationContext| self.consume(ctx, &mut *parent, style);
            stmts.extend(inputs.produce(ctx, 0, &mut consume)?);
        }

        match (&self.state, style) {
            (AggState::Plain { accumulators }, ProductionStyle::NonVectorised) => {
                let mapping = accumulators
                    .iter()
                    .zip(&self.slots)
                    .map(|(acc, slot)| AccessPath::scalar(acc, slot.ty))
                    .collect();
                let once = ctx.fresh("once");
                let body = ctx.with_mapping(mapping, |ctx| parent(ctx))?;
                stmts.push(Stmt::for_range(once, CodeExpr::int(0), CodeExpr::int(1), body));
            }
            (AggState::Plain { accumulators }, ProductionStyle::Vectorised) => {
                let (body, scope) = ctx.with_allocation_scope(|ctx| {
                    let mut body = Vec::new();
                    let mut mapping = OrdinalMapping::new();
                    for (acc, slot) in accumulators.iter().zip(&self.slots) {
                        let array = ctx.fresh("agg_out");
                        body.push(Stmt::declare(
                            &array,
                            QueryVariableType::RawArray(slot.ty),
                            CodeExpr::NewArray {
                                elem: slot.ty,
                                len: Box::new(CodeExpr::int(1)),
                            },
                        ));
                        body.push(Stmt::assign(
                            CodeExpr::var(&array).index(CodeExpr::int(0)),
                            CodeExpr::var(acc),
                        ));
                        mapping.push(AccessPath::RawArraySlice {
                            array,
                            ty: slot.ty,
                            length: Box::new(AccessPath::Constant {
                                value: Literal::Int(1),
                                ty: LogicalType::Int,
                            }),
                        });
                    }
                    body.extend(ctx.with_mapping(mapping, |ctx| parent(ctx))?);
                    Ok(body)
                })?;
                stmts.extend(scope.wrap(body));
            }
            (AggState::Grouped { map, .. }, ProductionStyle::NonVectorised) => {
                let group = ctx.fresh("group");
                let mapping = self.group_output(map, &CodeExpr::var(&group));
                let body = ctx.with_mapping(mapping, |ctx| parent(ctx))?;
                stmts.push(Stmt::for_range(
                    group,
                    CodeExpr::int(0),
                    CodeExpr::var(map).field(NUM_RECORDS_FIELD),
                    body,
                ));
            }
            (AggState::Grouped { map, .. }, ProductionStyle::Vectorised) => {
                let (body, scope) =
                    ctx.with_allocation_scope(|ctx| self.emit_group_batches(ctx, map, parent))?;
                stmts.extend(scope.wrap(body));
            }
            (AggState::Idle, _) => {
                return Err(DbxError::invariant("Aggregation", "state not initialised"));
            }
        }
        Ok(stmts)
    }

    /// Keys then aggregates, read from the map's backing arrays at `index`.
    fn group_output(&self, map: &str, index: &CodeExpr) -> OrdinalMapping {
        let keys = self.group_by.iter().enumerate().map(|(i, &idx)| AccessPath::ArrayElement {
            array: CodeExpr::var(map).field(key_field(i)),
            ty: self.input[idx],
            index: index.clone(),
        });
        let values = self.slots.iter().enumerate().map(|(j, slot)| AccessPath::ArrayElement {
            array: CodeExpr::var(map).field(value_field(j)),
            ty: slot.ty,
            index: index.clone(),
        });
        keys.chain(values).collect()
    }

    /// Emit the groups in output batches of `vector_capacity` rows.
    fn emit_group_batches(
        &self,
        ctx: &mut GenerationContext,
        map: &str,
        parent: Consumer<'_>,
    ) -> DbxResult<Vec<Stmt>> {
        let int = QueryVariableType::Scalar(LogicalType::Int);
        let capacity = ctx.capacity_expr()?;
        let start = ctx.fresh("start");
        let total = ctx.fresh("total");
        let n = ctx.fresh("n");
        let offset = ctx.fresh("off");

        let mut arrays = Vec::with_capacity(self.output.len());
        for i in 0..self.group_by.len() {
            arrays.push(CodeExpr::var(map).field(key_field(i)));
        }
        for j in 0..self.slots.len() {
            arrays.push(CodeExpr::var(map).field(value_field(j)));
        }

        let mut batch = vec![
            Stmt::declare(&n, int.clone(), CodeExpr::var(&total).sub(CodeExpr::var(&start))),
            Stmt::if_then(
                CodeExpr::var(&n).gt(capacity.clone()),
                vec![Stmt::assign(CodeExpr::var(&n), capacity)],
            ),
            Stmt::declare(&offset, int.clone(), CodeExpr::var(&start)),
            Stmt::increment(&start, CodeExpr::var(&n)),
        ];
        let mut mapping = OrdinalMapping::new();
        for (array, ty) in arrays.into_iter().zip(&self.output) {
            let buffer = ctx.acquire_scan_buffer("group_out", *ty)?;
            batch.push(Stmt::eval(CodeExpr::call(
                Intrinsic::ArrayCopy,
                vec![array, CodeExpr::var(&offset), CodeExpr::var(&n), CodeExpr::var(&buffer)],
            )));
            mapping.push(AccessPath::RawArraySlice {
                array: buffer,
                ty: *ty,
                length: Box::new(AccessPath::scalar(&n, LogicalType::Int)),
            });
        }
        batch.extend(ctx.with_mapping(mapping, |ctx| parent(ctx))?);

        Ok(vec![
            Stmt::declare(&start, int.clone(), CodeExpr::int(0)),
            Stmt::declare(&total, int, CodeExpr::var(map).field(NUM_RECORDS_FIELD)),
            Stmt::while_loop(CodeExpr::var(&start).lt(CodeExpr::var(&total)), batch),
        ])
    }

    /// Accumulate one row whose columns are all scalar reads.
    fn consume_row(&self, ctx: &mut GenerationContext, mapping: &OrdinalMapping) -> DbxResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        match &self.state {
            AggState::Plain { accumulators } => {
                for (acc, slot) in accumulators.iter().zip(&self.slots) {
                    let delta = match slot.kind {
                        AggKind::Count => CodeExpr::long(1),
                        AggKind::Sum => {
                            let idx = slot.input.unwrap_or_default();
                            mapping.get(idx)?.read_scalar()?.cast(slot.ty)
                        }
                    };
                    stmts.push(Stmt::increment(acc, delta));
                }
            }
            AggState::Grouped { map, .. } => {
                let mut keys = Vec::with_capacity(self.group_by.len());
                for &idx in &self.group_by {
                    let key = materialize(ctx, mapping.get(idx)?, "key", &mut stmts)?;
                    keys.push(key.read_scalar()?);
                }
                let hash = ctx.fresh("hash");
                stmts.push(Stmt::declare(
                    &hash,
                    QueryVariableType::Scalar(LogicalType::Long),
                    combined_pre_hash(&keys),
                ));
                let mut args = keys;
                args.push(CodeExpr::var(&hash));
                for slot in &self.slots {
                    args.push(self.slot_delta(slot, mapping, None)?);
                }
                stmts.push(Stmt::eval(
                    CodeExpr::var(map).method(Method::IncrementForKey, args),
                ));
            }
            AggState::Idle => {
                return Err(DbxError::invariant("Aggregation", "consume before produce"));
            }
        }
        Ok(stmts)
    }

    /// Value passed to `increment_for_key` for one row.
    fn slot_delta(&self, slot: &AggSlot, mapping: &OrdinalMapping, row: Option<&CodeExpr>) -> DbxResult<CodeExpr> {
        match slot.kind {
            AggKind::Count => Ok(CodeExpr::int(1)),
            AggKind::Sum => {
                let idx = slot.input.unwrap_or_default();
                let path = match row {
                    Some(row) => mapping.get(idx)?.element_at(row.clone())?,
                    None => mapping.get(idx)?.clone(),
                };
                let value = path.read_scalar()?;
                Ok(if self.input_type(slot)? == slot.ty { value } else { value.cast(slot.ty) })
            }
        }
    }

    fn consume_batch(
        &self,
        ctx: &mut GenerationContext,
        mapping: &OrdinalMapping,
        marker: Option<FilterMarker>,
        length: CodeExpr,
    ) -> DbxResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        match &self.state {
            AggState::Plain { accumulators } => {
                let count = CodeExpr::call(
                    Intrinsic::VectorCount {
                        marker: marker_kind(marker.as_ref()),
                    },
                    marker_args(marker.as_ref(), length.clone()),
                );
                for (acc, slot) in accumulators.iter().zip(&self.slots) {
                    let delta = match slot.kind {
                        AggKind::Count => count.clone(),
                        AggKind::Sum => {
                            let path = mapping.get(slot.input.unwrap_or_default())?;
                            if path.is_vector_family() {
                                let mut args = vec![path.vector_expr()?];
                                args.extend(marker_args(marker.as_ref(), length.clone()));
                                CodeExpr::call(
                                    Intrinsic::VectorSum {
                                        marker: marker_kind(marker.as_ref()),
                                    },
                                    args,
                                )
                            } else {
                                // broadcast value times active rows
                                CodeExpr::binary(
                                    BinOp::Mul,
                                    path.read_scalar()?.cast(slot.ty),
                                    count.clone().cast(slot.ty),
                                )
                            }
                        }
                    };
                    stmts.push(Stmt::increment(acc, delta));
                }
            }
            AggState::Grouped { map, .. } => {
                let hashes = ctx.acquire_scan_buffer("hashes", LogicalType::Long)?;
                let mut key_paths = Vec::with_capacity(self.group_by.len());
                for (i, &idx) in self.group_by.iter().enumerate() {
                    let path = mapping.get(idx)?;
                    if !path.is_vector_family() {
                        return Err(DbxError::unsupported(
                            "Aggregation",
                            format!("batch group key #{i} is not a column vector"),
                        ));
                    }
                    let mut args = vec![path.vector_expr()?];
                    args.extend(marker_args(marker.as_ref(), length.clone()));
                    args.push(CodeExpr::var(&hashes));
                    stmts.push(Stmt::eval(CodeExpr::call(
                        Intrinsic::VectorHash {
                            marker: marker_kind(marker.as_ref()),
                            combine: i > 0,
                        },
                        args,
                    )));
                    key_paths.push(path.clone());
                }
                let rows = for_each_active_row(ctx, marker.as_ref(), length, |_, row| {
                    let mut args = key_paths
                        .iter()
                        .map(|p| p.element_at(row.clone())?.read_scalar())
                        .collect::<DbxResult<Vec<_>>>()?;
                    args.push(CodeExpr::var(&hashes).index(row.clone()));
                    for slot in &self.slots {
                        args.push(self.slot_delta(slot, mapping, Some(&row))?);
                    }
                    Ok(vec![Stmt::eval(
                        CodeExpr::var(map).method(Method::IncrementForKey, args),
                    )])
                })?;
                stmts.extend(rows);
            }
            AggState::Idle => {
                return Err(DbxError::invariant("Aggregation", "consume before produce"));
            }
        }
        Ok(stmts)
    }
}

/// XOR of the per-key pre-hashes.
fn combined_pre_hash(keys: &[CodeExpr]) -> CodeExpr {
    let mut hashes = keys
        .iter()
        .map(|k| CodeExpr::call(Intrinsic::PreHash, vec![k.clone()]));
    let first = hashes.next().unwrap_or_else(|| CodeExpr::long(0));
    hashes.fold(first, CodeExpr::xor)
}

impl Operator for Aggregation {
    fn name(&self) -> &'static str {
        "Aggregation"
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
        self.produce_groups(ctx, inputs, parent, ProductionStyle::NonVectorised)
    }

    /// Blocking: never calls the parent.
    fn consume_non_vec(
        &mut self,
        ctx: &mut GenerationContext,
        _parent: Consumer<'_>,
    ) -> DbxResult<Vec<Stmt>> {
        let mapping = ctx.current_mapping()?.clone();
        self.consume_row(ctx, &mapping)
    }

    fn produce_vec(
        &mut self,
        ctx: &mut GenerationContext,
        inputs: &mut Inputs<'_>,
        parent: Consumer<'_>,
    ) -> DbxResult<Vec<Stmt>> {
        self.produce_groups(ctx, inputs, parent, ProductionStyle::Vectorised)
    }

    fn consume_vec(
        &mut self,
        ctx: &mut GenerationContext,
        _parent: Consumer<'_>,
    ) -> DbxResult<Vec<Stmt>> {
        let mapping = ctx.current_mapping()?.clone();
        match mapping.batch_extent("Aggregation")? {
            Some((marker, length)) => self.consume_batch(ctx, &mapping, marker, length),
            None => self.consume_row(ctx, &mapping),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_types() {
        let input = [LogicalType::Int, LogicalType::Int, LogicalType::Double];
        let plain = Aggregation::new(
            &[],
            &[AggregateExpr::count_star(), AggregateExpr::sum(1), AggregateExpr::sum(2)],
            &input,
        )
        .unwrap();
        assert_eq!(
            plain.output_types(),
            &[LogicalType::Long, LogicalType::Long, LogicalType::Double]
        );

        let grouped =
            Aggregation::new(&[0], &[AggregateExpr::count_star(), AggregateExpr::sum(1)], &input).unwrap();
        assert_eq!(
            grouped.output_types(),
            &[LogicalType::Int, LogicalType::Int, LogicalType::Long]
        );
    }

    #[test]
    fn test_unsupported_functions() {
        let input = [LogicalType::Int, LogicalType::Varchar];
        let avg = AggregateExpr {
            function: AggregateFunction::Avg,
            input: Some(0),
        };
        assert!(matches!(
            Aggregation::new(&[], &[avg], &input).unwrap_err(),
            DbxError::UnsupportedPlanShape { .. }
        ));
        assert!(matches!(
            Aggregation::new(&[], &[AggregateExpr::sum(1)], &input).unwrap_err(),
            DbxError::TypeMismatch { .. }
        ));
        assert!(Aggregation::new(&[], &[], &input).is_err());
        assert!(Aggregation::new(&[7], &[], &input).is_err());
    }

    #[test]
    fn test_combined_pre_hash_xors_keys() {
        let h = combined_pre_hash(&[CodeExpr::var("a"), CodeExpr::var("b")]);
        assert!(matches!(
            h,
            CodeExpr::Binary {
                op: BinOp::BitXor,
                ..
            }
        ));
        let single = combined_pre_hash(&[CodeExpr::var("a")]);
        assert!(matches!(single, CodeExpr::Call { func: Intrinsic::PreHash, .. }));
    }
}
