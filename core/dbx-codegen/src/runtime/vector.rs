//! Batch primitives called by vectorised code
//!
//! Every primitive visits only the active rows of its batch: all rows, the
//! rows listed in a selection vector, or the rows whose validity flag is set.
//! Results are written at row positions, so a marker stays valid for them.

use crate::codegen::ir::{ArithOp, CmpOp, MarkerKind};
use crate::codegen::types::LogicalType;
use crate::error::{DbxError, DbxResult};
use crate::runtime::hash::pre_hash;
use crate::runtime::value::{ColumnData, Value, compare};

/// Snapshot of a filter marker taken before a primitive writes its output,
/// so a filter may narrow its own marker in place.
#[derive(Debug, Clone, PartialEq)]
pub enum Marker {
    None,
    Selection(Vec<i32>),
    Validity(Vec<bool>),
}

impl Marker {
    pub fn snapshot(kind: MarkerKind, array: Option<&ColumnData>) -> DbxResult<Self> {
        match (kind, array) {
            (MarkerKind::None, _) => Ok(Marker::None),
            (MarkerKind::Selection, Some(ColumnData::Int(sel))) => Ok(Marker::Selection(sel.clone())),
            (MarkerKind::Validity, Some(ColumnData::Boolean(valid))) => Ok(Marker::Validity(valid.clone())),
            (kind, other) => Err(DbxError::execution(
                format!("bad {kind:?} marker"),
                format!("{:?}", other.map(ColumnData::logical_type)),
            )),
        }
    }

    pub fn kind(&self) -> MarkerKind {
        match self {
            Marker::None => MarkerKind::None,
            Marker::Selection(_) => MarkerKind::Selection,
            Marker::Validity(_) => MarkerKind::Validity,
        }
    }

    /// Call `f` for each active row. `length` is the selected count for a
    /// selection vector and the batch length otherwise.
    pub fn for_each_active<F>(&self, length: usize, mut f: F) -> DbxResult<()>
    where
        F: FnMut(usize) -> DbxResult<()>,
    {
        match self {
            Marker::None => (0..length).try_for_each(f),
            Marker::Selection(sel) => {
                let sel = sel.get(..length).ok_or_else(|| too_long("selection", length, sel.len()))?;
                sel.iter().try_for_each(|&row| f(row as usize))
            }
            Marker::Validity(valid) => {
                let valid = valid.get(..length).ok_or_else(|| too_long("validity", length, valid.len()))?;
                valid
                    .iter()
                    .enumerate()
                    .filter(|(_, v)| **v)
                    .try_for_each(|(row, _)| f(row))
            }
        }
    }
}

fn too_long(what: &str, length: usize, capacity: usize) -> DbxError {
    DbxError::execution(
        format!("{what} length {length} exceeds its array"),
        format!("array holds {capacity}"),
    )
}

/// Second operand of a binary primitive.
#[derive(Debug, Clone, Copy)]
pub enum Operand<'a> {
    Scalar(&'a Value),
    Vector(&'a ColumnData),
}

impl Operand<'_> {
    fn at(&self, row: usize) -> DbxResult<Value> {
        match self {
            Operand::Scalar(v) => Ok((*v).clone()),
            Operand::Vector(col) => col.get(row),
        }
    }
}

/// Compare `lhs[row]` with `rhs` over the active rows.
///
/// A selection output receives the passing rows compacted from position 0 and
/// the count is returned; a validity output is rewritten for the whole batch
/// and the batch length is returned.
pub fn filter(
    cmp: CmpOp,
    lhs: &ColumnData,
    rhs: Operand<'_>,
    marker: &Marker,
    length: usize,
    output: MarkerKind,
    out: &mut ColumnData,
) -> DbxResult<usize> {
    match output {
        MarkerKind::Selection => {
            let mut selected = 0;
            marker.for_each_active(length, |row| {
                if compare(cmp, &lhs.get(row)?, &rhs.at(row)?)? {
                    out.set(selected, &Value::Int(row as i32))?;
                    selected += 1;
                }
                Ok(())
            })?;
            Ok(selected)
        }
        MarkerKind::Validity => {
            for row in 0..length {
                out.set(row, &Value::Bool(false))?;
            }
            marker.for_each_active(length, |row| {
                let pass = compare(cmp, &lhs.get(row)?, &rhs.at(row)?)?;
                out.set(row, &Value::Bool(pass))
            })?;
            Ok(length)
        }
        MarkerKind::None => Err(DbxError::execution("filter without an output marker", cmp.name())),
    }
}

/// `out[row] = lhs[row] op rhs[row]` over the active rows; returns `length`.
///
/// Both operands are cast to `result` first, so `Int / Int` divides as
/// `Double`.
pub fn arith(
    op: ArithOp,
    lhs: Operand<'_>,
    rhs: Operand<'_>,
    marker: &Marker,
    length: usize,
    result: LogicalType,
    out: &mut ColumnData,
) -> DbxResult<usize> {
    marker.for_each_active(length, |row| {
        let a = lhs.at(row)?.cast(result)?;
        let b = rhs.at(row)?.cast(result)?;
        out.set(row, &a.binary(op.to_binop(), &b)?)
    })?;
    Ok(length)
}

/// Pre-hash of every active row into `hashes`; `combine` XORs into it.
pub fn hash_into(
    vector: &ColumnData,
    marker: &Marker,
    length: usize,
    combine: bool,
    hashes: &mut ColumnData,
) -> DbxResult<()> {
    marker.for_each_active(length, |row| {
        let mut h = pre_hash(&vector.get(row)?)?;
        if combine {
            h ^= hashes.get(row)?.as_i64()?;
        }
        hashes.set(row, &Value::Long(h))
    })
}

/// Sum of the active rows, widened to `Long` or `Double`.
pub fn sum(vector: &ColumnData, marker: &Marker, length: usize) -> DbxResult<Value> {
    match vector {
        ColumnData::Double(_) => {
            let mut total = 0.0;
            marker.for_each_active(length, |row| {
                total += vector.get(row)?.as_f64()?;
                Ok(())
            })?;
            Ok(Value::Double(total))
        }
        ColumnData::Int(_) | ColumnData::Long(_) => {
            let mut total = 0i64;
            marker.for_each_active(length, |row| {
                total = total.wrapping_add(vector.get(row)?.as_i64()?);
                Ok(())
            })?;
            Ok(Value::Long(total))
        }
        other => Err(DbxError::execution(
            "sum over a non-numeric vector",
            other.logical_type().to_string(),
        )),
    }
}

pub fn count_active(marker: &Marker, length: usize) -> DbxResult<i64> {
    let mut count = 0i64;
    marker.for_each_active(length, |_| {
        count += 1;
        Ok(())
    })?;
    Ok(count)
}

/// `dst[i] = src[offset + i]` for `i < count`.
pub fn array_copy(src: &ColumnData, offset: usize, count: usize, dst: &mut ColumnData) -> DbxResult<()> {
    for i in 0..count {
        dst.set(i, &src.get(offset + i)?)?;
    }
    Ok(())
}

pub fn validity_init(validity: &mut ColumnData, length: usize) -> DbxResult<()> {
    for row in 0..length {
        validity.set(row, &Value::Bool(true))?;
    }
    Ok(())
}

/// Load `count` lanes starting at `offset`.
pub fn simd_load(vector: &ColumnData, offset: usize, count: usize, lanes: &mut ColumnData) -> DbxResult<()> {
    array_copy(vector, offset, count, lanes)
}

pub fn simd_compare(
    cmp: CmpOp,
    lanes: &ColumnData,
    scalar: &Value,
    count: usize,
    mask: &mut ColumnData,
) -> DbxResult<()> {
    for lane in 0..count {
        let pass = compare(cmp, &lanes.get(lane)?, scalar)?;
        mask.set(lane, &Value::Bool(pass))?;
    }
    Ok(())
}

/// AND the lane mask into `validity[offset..offset + count]`.
pub fn simd_mask_store(mask: &ColumnData, offset: usize, count: usize, validity: &mut ColumnData) -> DbxResult<()> {
    for lane in 0..count {
        let keep = validity.get(offset + lane)?.as_bool()? && mask.get(lane)?.as_bool()?;
        validity.set(offset + lane, &Value::Bool(keep))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_filter_compacts_rows() {
        let lhs = ColumnData::Int(vec![5, 1, 7, 3]);
        let mut sel = ColumnData::new(LogicalType::Int, 4);
        let n = filter(CmpOp::Gt, &lhs, Operand::Scalar(&Value::Int(2)), &Marker::None, 4, MarkerKind::Selection, &mut sel)
            .unwrap();
        assert_eq!(n, 3);

        // narrow the same selection again
        let marker = Marker::snapshot(MarkerKind::Selection, Some(&sel)).unwrap();
        let n = filter(CmpOp::Lt, &lhs, Operand::Scalar(&Value::Int(6)), &marker, n, MarkerKind::Selection, &mut sel)
            .unwrap();
        assert_eq!(n, 2);
        let ColumnData::Int(rows) = &sel else { panic!("selection is Int") };
        assert_eq!(&rows[..n], &[0, 3]);
    }

    #[test]
    fn test_validity_filter_keeps_batch_length() {
        let lhs = ColumnData::Long(vec![1, 2, 3]);
        let rhs = ColumnData::Long(vec![1, 0, 3]);
        let mut valid = ColumnData::new(LogicalType::Boolean, 4);
        let n = filter(CmpOp::Eq, &lhs, Operand::Vector(&rhs), &Marker::None, 3, MarkerKind::Validity, &mut valid)
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(valid, ColumnData::Boolean(vec![true, false, true, false]));
        assert_eq!(count_active(&Marker::Validity(vec![true, false, true, false]), 3).unwrap(), 2);
    }

    #[test]
    fn test_arith_skips_inactive_rows() {
        let lhs = ColumnData::Long(vec![10, 20, 30]);
        let divisor = ColumnData::Long(vec![2, 0, 3]);
        let mut out = ColumnData::new(LogicalType::Long, 3);
        let marker = Marker::Validity(vec![true, false, true]);
        arith(ArithOp::Mul, Operand::Vector(&lhs), Operand::Vector(&divisor), &marker, 3, LogicalType::Long, &mut out)
            .unwrap();
        assert_eq!(out, ColumnData::Long(vec![20, 0, 90]));
    }

    #[test]
    fn test_arith_divides_int_operands_as_double() {
        let lhs = ColumnData::Int(vec![7, 20, 1]);
        let divisor = ColumnData::Int(vec![2, 0, 4]);
        let mut out = ColumnData::new(LogicalType::Double, 3);
        let marker = Marker::Validity(vec![true, false, true]);
        arith(ArithOp::Div, Operand::Vector(&lhs), Operand::Vector(&divisor), &marker, 3, LogicalType::Double, &mut out)
            .unwrap();
        assert_eq!(out, ColumnData::Double(vec![3.5, 0.0, 0.25]));

        // scalar divisor
        let two = Value::Int(2);
        arith(ArithOp::Div, Operand::Vector(&lhs), Operand::Scalar(&two), &Marker::None, 3, LogicalType::Double, &mut out)
            .unwrap();
        assert_eq!(out, ColumnData::Double(vec![3.5, 10.0, 0.5]));
    }

    #[test]
    fn test_sum_and_combined_hash() {
        let v = ColumnData::Int(vec![1, 2, 3]);
        let sel = Marker::Selection(vec![0, 2]);
        assert!(matches!(sum(&v, &sel, 2).unwrap(), Value::Long(4)));

        let mut hashes = ColumnData::new(LogicalType::Long, 3);
        hash_into(&v, &Marker::None, 3, false, &mut hashes).unwrap();
        hash_into(&v, &Marker::None, 3, true, &mut hashes).unwrap();
        assert_eq!(hashes, ColumnData::Long(vec![0, 0, 0]));
    }

    #[test]
    fn test_simd_lane_group() {
        let v = ColumnData::Double(vec![1.0, 5.0, 2.0, 8.0, 9.0]);
        let mut lanes = ColumnData::new(LogicalType::Double, 4);
        let mut mask = ColumnData::new(LogicalType::Boolean, 4);
        let mut valid = ColumnData::new(LogicalType::Boolean, 5);
        validity_init(&mut valid, 5).unwrap();
        simd_load(&v, 4, 1, &mut lanes).unwrap();
        simd_compare(CmpOp::Gt, &lanes, &Value::Double(4.0), 1, &mut mask).unwrap();
        simd_mask_store(&mask, 4, 1, &mut valid).unwrap();
        simd_load(&v, 0, 4, &mut lanes).unwrap();
        simd_compare(CmpOp::Gt, &lanes, &Value::Double(4.0), 4, &mut mask).unwrap();
        simd_mask_store(&mask, 0, 4, &mut valid).unwrap();
        assert_eq!(valid, ColumnData::Boolean(vec![false, true, false, true, true]));
    }

    #[test]
    fn test_marker_longer_than_array_is_an_error() {
        let marker = Marker::Selection(vec![0]);
        assert!(count_active(&marker, 2).is_err());
    }
}
