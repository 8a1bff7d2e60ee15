//! Run-time values of the reference executor
//!
//! [`ColumnData`] backs both reader vectors and pooled buffers; [`Value`] is
//! whatever a generated variable or expression holds.

use crate::codegen::ir::{BinOp, CmpOp, Literal};
use crate::codegen::types::LogicalType;
use crate::error::{DbxError, DbxResult};
use crate::plan::ScalarValue;
use crate::runtime::map::GeneratedMap;
use crate::runtime::reader::TableReader;
use arrow::array::{Array, ArrayRef, AsArray};
use arrow::datatypes::{DataType, Date32Type, Float64Type, Int32Type, Int64Type};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

/// Typed column storage.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Boolean(Vec<bool>),
    Int(Vec<i32>),
    Long(Vec<i64>),
    Double(Vec<f64>),
    Date(Vec<i32>),
    Bytes(Vec<Vec<u8>>),
}

/// Column shared between the executor's variables.
pub type SharedColumn = Rc<RefCell<ColumnData>>;

impl ColumnData {
    /// `len` default values of `ty`.
    pub fn new(ty: LogicalType, len: usize) -> Self {
        match ty {
            LogicalType::Boolean => ColumnData::Boolean(vec![false; len]),
            LogicalType::Int => ColumnData::Int(vec![0; len]),
            LogicalType::Long => ColumnData::Long(vec![0; len]),
            LogicalType::Double => ColumnData::Double(vec![0.0; len]),
            LogicalType::Date => ColumnData::Date(vec![0; len]),
            LogicalType::FixedBinary(_) | LogicalType::Varchar => {
                ColumnData::Bytes(vec![Vec::new(); len])
            }
        }
    }

    pub fn shared(self) -> SharedColumn {
        Rc::new(RefCell::new(self))
    }

    /// Byte-string columns report `Varchar`.
    pub fn logical_type(&self) -> LogicalType {
        match self {
            ColumnData::Boolean(_) => LogicalType::Boolean,
            ColumnData::Int(_) => LogicalType::Int,
            ColumnData::Long(_) => LogicalType::Long,
            ColumnData::Double(_) => LogicalType::Double,
            ColumnData::Date(_) => LogicalType::Date,
            ColumnData::Bytes(_) => LogicalType::Varchar,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnData::Boolean(v) => v.len(),
            ColumnData::Int(v) | ColumnData::Date(v) => v.len(),
            ColumnData::Long(v) => v.len(),
            ColumnData::Double(v) => v.len(),
            ColumnData::Bytes(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, row: usize) -> DbxResult<Value> {
        let value = match self {
            ColumnData::Boolean(v) => v.get(row).map(|&b| Value::Bool(b)),
            ColumnData::Int(v) => v.get(row).map(|&i| Value::Int(i)),
            ColumnData::Long(v) => v.get(row).map(|&i| Value::Long(i)),
            ColumnData::Double(v) => v.get(row).map(|&d| Value::Double(d)),
            ColumnData::Date(v) => v.get(row).map(|&d| Value::Date(d)),
            ColumnData::Bytes(v) => v.get(row).map(|b| Value::Bytes(b.clone())),
        };
        value.ok_or_else(|| self.out_of_bounds(row))
    }

    /// Store `value` at `row`, converted to the column's type.
    pub fn set(&mut self, row: usize, value: &Value) -> DbxResult<()> {
        let len = self.len();
        if row >= len {
            return Err(self.out_of_bounds(row));
        }
        match self {
            ColumnData::Boolean(v) => v[row] = value.as_bool()?,
            ColumnData::Int(v) => v[row] = value.as_i64()? as i32,
            ColumnData::Long(v) => v[row] = value.as_i64()?,
            ColumnData::Double(v) => v[row] = value.as_f64()?,
            ColumnData::Date(v) => v[row] = value.as_i64()? as i32,
            ColumnData::Bytes(v) => v[row] = value.as_bytes()?.to_vec(),
        }
        Ok(())
    }

    pub fn push(&mut self, value: &Value) -> DbxResult<()> {
        match self {
            ColumnData::Boolean(v) => v.push(value.as_bool()?),
            ColumnData::Int(v) => v.push(value.as_i64()? as i32),
            ColumnData::Long(v) => v.push(value.as_i64()?),
            ColumnData::Double(v) => v.push(value.as_f64()?),
            ColumnData::Date(v) => v.push(value.as_i64()? as i32),
            ColumnData::Bytes(v) => v.push(value.as_bytes()?.to_vec()),
        }
        Ok(())
    }

    /// Copy an Arrow array's values. NULL slots read as the type's default.
    pub fn from_arrow(array: &ArrayRef) -> DbxResult<Self> {
        Ok(match array.data_type() {
            DataType::Boolean => ColumnData::Boolean(
                array.as_boolean().iter().map(|v| v.unwrap_or(false)).collect(),
            ),
            DataType::Int32 => ColumnData::Int(array.as_primitive::<Int32Type>().values().to_vec()),
            DataType::Int64 => ColumnData::Long(array.as_primitive::<Int64Type>().values().to_vec()),
            DataType::Float64 => {
                ColumnData::Double(array.as_primitive::<Float64Type>().values().to_vec())
            }
            DataType::Date32 => ColumnData::Date(array.as_primitive::<Date32Type>().values().to_vec()),
            DataType::Utf8 => ColumnData::Bytes(
                array
                    .as_string::<i32>()
                    .iter()
                    .map(|v| v.map(|s| s.as_bytes().to_vec()).unwrap_or_default())
                    .collect(),
            ),
            DataType::FixedSizeBinary(_) => {
                let binary = array.as_fixed_size_binary();
                ColumnData::Bytes(
                    (0..binary.len())
                        .map(|i| {
                            if binary.is_null(i) {
                                Vec::new()
                            } else {
                                binary.value(i).to_vec()
                            }
                        })
                        .collect(),
                )
            }
            other => {
                return Err(DbxError::unsupported(
                    "TableReader",
                    format!("column type {other:?}"),
                ));
            }
        })
    }

    fn out_of_bounds(&self, row: usize) -> DbxError {
        DbxError::execution(
            format!("row {row} out of bounds"),
            format!("{} column of length {}", self.logical_type(), self.len()),
        )
    }
}

/// Value held by a variable of the executing procedure.
#[derive(Clone)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    /// Days since epoch
    Date(i32),
    Bytes(Vec<u8>),
    Array(SharedColumn),
    Reader(Rc<RefCell<Box<dyn TableReader>>>),
    Map(Rc<RefCell<GeneratedMap>>),
    ByteBuffer(Rc<RefCell<Vec<u8>>>),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => write!(f, "()"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}i32"),
            Value::Long(v) => write!(f, "{v}i64"),
            Value::Double(v) => write!(f, "{v}f64"),
            Value::Date(v) => write!(f, "date({v})"),
            Value::Bytes(v) => write!(f, "{:?}", String::from_utf8_lossy(v)),
            Value::Array(col) => write!(f, "array[{}]", col.borrow().len()),
            Value::Reader(_) => write!(f, "<reader>"),
            Value::Map(map) => write!(f, "<map {}>", map.borrow().name()),
            Value::ByteBuffer(buf) => write!(f, "<bytes {}>", buf.borrow().len()),
        }
    }
}

impl Value {
    pub fn from_literal(literal: &Literal) -> Self {
        match literal {
            Literal::Bool(v) => Value::Bool(*v),
            Literal::Int(v) => Value::Int(*v),
            Literal::Long(v) => Value::Long(*v),
            Literal::Double(v) => Value::Double(*v),
            Literal::Date(v) => Value::Date(*v),
            Literal::Bytes(v) => Value::Bytes(v.clone()),
            Literal::Str(s) => Value::Bytes(s.as_bytes().to_vec()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Double(_) => "double",
            Value::Date(_) => "date",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Reader(_) => "reader",
            Value::Map(_) => "map",
            Value::ByteBuffer(_) => "byte buffer",
        }
    }

    fn mismatch(&self, expected: &str) -> DbxError {
        DbxError::execution(
            format!("expected {expected}, found {}", self.kind()),
            format!("{self:?}"),
        )
    }

    pub fn as_bool(&self) -> DbxResult<bool> {
        match self {
            Value::Bool(v) => Ok(*v),
            other => Err(other.mismatch("bool")),
        }
    }

    pub fn as_i64(&self) -> DbxResult<i64> {
        match self {
            Value::Int(v) | Value::Date(v) => Ok(i64::from(*v)),
            Value::Long(v) => Ok(*v),
            Value::Double(v) => Ok(*v as i64),
            Value::Bool(v) => Ok(i64::from(*v)),
            other => Err(other.mismatch("integer")),
        }
    }

    pub fn as_f64(&self) -> DbxResult<f64> {
        match self {
            Value::Double(v) => Ok(*v),
            Value::Int(v) | Value::Date(v) => Ok(f64::from(*v)),
            Value::Long(v) => Ok(*v as f64),
            other => Err(other.mismatch("number")),
        }
    }

    /// Non-negative integer usable as an array index or count.
    pub fn as_index(&self) -> DbxResult<usize> {
        let v = self.as_i64()?;
        usize::try_from(v).map_err(|_| {
            DbxError::execution(format!("negative index {v}"), "array access")
        })
    }

    pub fn as_bytes(&self) -> DbxResult<&[u8]> {
        match self {
            Value::Bytes(v) => Ok(v),
            other => Err(other.mismatch("bytes")),
        }
    }

    pub fn as_array(&self) -> DbxResult<&SharedColumn> {
        match self {
            Value::Array(col) => Ok(col),
            other => Err(other.mismatch("array")),
        }
    }

    fn is_scalar(&self) -> bool {
        matches!(
            self,
            Value::Bool(_) | Value::Int(_) | Value::Long(_) | Value::Double(_) | Value::Date(_) | Value::Bytes(_)
        )
    }

    fn scalar_type(&self) -> Option<LogicalType> {
        match self {
            Value::Bool(_) => Some(LogicalType::Boolean),
            Value::Int(_) => Some(LogicalType::Int),
            Value::Long(_) => Some(LogicalType::Long),
            Value::Double(_) => Some(LogicalType::Double),
            Value::Date(_) => Some(LogicalType::Date),
            Value::Bytes(_) => Some(LogicalType::Varchar),
            _ => None,
        }
    }

    pub fn cast(&self, to: LogicalType) -> DbxResult<Value> {
        Ok(match to {
            LogicalType::Boolean => Value::Bool(self.as_bool()?),
            LogicalType::Int => Value::Int(self.as_i64()? as i32),
            LogicalType::Long => Value::Long(self.as_i64()?),
            LogicalType::Double => Value::Double(self.as_f64()?),
            LogicalType::Date => Value::Date(self.as_i64()? as i32),
            LogicalType::FixedBinary(_) | LogicalType::Varchar => {
                Value::Bytes(self.as_bytes()?.to_vec())
            }
        })
    }

    /// Convert a scalar to the scalar type of `like`; other values pass through.
    pub fn coerce_like(self, like: &Value) -> DbxResult<Value> {
        match (self.is_scalar(), like.scalar_type()) {
            (true, Some(ty)) if self.scalar_type() != Some(ty) => self.cast(ty),
            _ => Ok(self),
        }
    }

    pub fn compare(&self, other: &Value) -> DbxResult<Ordering> {
        match (self, other) {
            (Value::Bytes(a), Value::Bytes(b)) => Ok(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Ok(a.cmp(b)),
            (Value::Double(_), _) | (_, Value::Double(_)) => {
                Ok(self.as_f64()?.total_cmp(&other.as_f64()?))
            }
            (
                Value::Int(_) | Value::Long(_) | Value::Date(_),
                Value::Int(_) | Value::Long(_) | Value::Date(_),
            ) => Ok(self.as_i64()?.cmp(&other.as_i64()?)),
            _ => Err(DbxError::execution(
                format!("cannot compare {} with {}", self.kind(), other.kind()),
                format!("{self:?} vs {other:?}"),
            )),
        }
    }

    pub fn binary(&self, op: BinOp, rhs: &Value) -> DbxResult<Value> {
        match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => self.arith(op, rhs),
            BinOp::Eq => Ok(Value::Bool(compare(CmpOp::Eq, self, rhs)?)),
            BinOp::Ne => Ok(Value::Bool(compare(CmpOp::Ne, self, rhs)?)),
            BinOp::Lt => Ok(Value::Bool(compare(CmpOp::Lt, self, rhs)?)),
            BinOp::Le => Ok(Value::Bool(compare(CmpOp::Le, self, rhs)?)),
            BinOp::Gt => Ok(Value::Bool(compare(CmpOp::Gt, self, rhs)?)),
            BinOp::Ge => Ok(Value::Bool(compare(CmpOp::Ge, self, rhs)?)),
            BinOp::And => Ok(Value::Bool(self.as_bool()? && rhs.as_bool()?)),
            BinOp::Or => Ok(Value::Bool(self.as_bool()? || rhs.as_bool()?)),
            BinOp::BitXor => match (self, rhs) {
                (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(a ^ b)),
                (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a ^ b)),
                _ => Ok(Value::Long(self.as_i64()? ^ rhs.as_i64()?)),
            },
        }
    }

    fn arith(&self, op: BinOp, rhs: &Value) -> DbxResult<Value> {
        let division_by_zero = || DbxError::execution("division by zero", format!("{self:?} / {rhs:?}"));
        match (self, rhs) {
            (Value::Double(_), _) | (_, Value::Double(_)) => {
                let (a, b) = (self.as_f64()?, rhs.as_f64()?);
                Ok(Value::Double(match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    _ => a / b,
                }))
            }
            (Value::Long(_), _) | (_, Value::Long(_)) => {
                let (a, b) = (self.as_i64()?, rhs.as_i64()?);
                Ok(Value::Long(match op {
                    BinOp::Add => a.wrapping_add(b),
                    BinOp::Sub => a.wrapping_sub(b),
                    BinOp::Mul => a.wrapping_mul(b),
                    _ => a.checked_div(b).ok_or_else(division_by_zero)?,
                }))
            }
            (Value::Int(_) | Value::Date(_), Value::Int(_) | Value::Date(_)) => {
                let (a, b) = (self.as_i64()? as i32, rhs.as_i64()? as i32);
                Ok(Value::Int(match op {
                    BinOp::Add => a.wrapping_add(b),
                    BinOp::Sub => a.wrapping_sub(b),
                    BinOp::Mul => a.wrapping_mul(b),
                    _ => a.checked_div(b).ok_or_else(division_by_zero)?,
                }))
            }
            _ => Err(DbxError::execution(
                format!("arithmetic on {} and {}", self.kind(), rhs.kind()),
                format!("{self:?} {} {rhs:?}", op.symbol()),
            )),
        }
    }

    /// Result-row form of a scalar of logical type `ty`.
    pub fn to_scalar(&self, ty: LogicalType) -> DbxResult<ScalarValue> {
        Ok(match self.cast(ty)? {
            Value::Bool(v) => ScalarValue::Boolean(v),
            Value::Int(v) => ScalarValue::Int32(v),
            Value::Long(v) => ScalarValue::Int64(v),
            Value::Double(v) => ScalarValue::Float64(v),
            Value::Date(v) => ScalarValue::Date32(v),
            Value::Bytes(v) => match ty {
                LogicalType::Varchar => ScalarValue::Utf8(String::from_utf8_lossy(&v).into_owned()),
                _ => ScalarValue::Binary(v),
            },
            other => return Err(other.mismatch("scalar")),
        })
    }
}

/// Evaluate `a cmp b`.
pub fn compare(cmp: CmpOp, a: &Value, b: &Value) -> DbxResult<bool> {
    let ord = a.compare(b)?;
    Ok(match cmp {
        CmpOp::Eq => ord == Ordering::Equal,
        CmpOp::Ne => ord != Ordering::Equal,
        CmpOp::Lt => ord == Ordering::Less,
        CmpOp::Le => ord != Ordering::Greater,
        CmpOp::Gt => ord == Ordering::Greater,
        CmpOp::Ge => ord != Ordering::Less,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, StringArray};
    use std::sync::Arc;

    #[test]
    fn test_column_from_sliced_arrow_array() {
        let array: ArrayRef = Arc::new(Int32Array::from(vec![1, 2, 3, 4]));
        let sliced = array.slice(1, 2);
        assert_eq!(ColumnData::from_arrow(&sliced).unwrap(), ColumnData::Int(vec![2, 3]));

        let strings: ArrayRef = Arc::new(StringArray::from(vec![Some("a"), None]));
        assert_eq!(
            ColumnData::from_arrow(&strings).unwrap(),
            ColumnData::Bytes(vec![b"a".to_vec(), Vec::new()])
        );
    }

    #[test]
    fn test_set_converts_and_checks_bounds() {
        let mut col = ColumnData::new(LogicalType::Long, 2);
        col.set(1, &Value::Int(7)).unwrap();
        assert!(matches!(col.get(1).unwrap(), Value::Long(7)));
        assert!(col.set(2, &Value::Int(1)).is_err());
        assert!(col.get(5).is_err());
    }

    #[test]
    fn test_arith_promotes_and_rejects_zero_division() {
        let v = Value::Int(3).binary(BinOp::Add, &Value::Long(4)).unwrap();
        assert!(matches!(v, Value::Long(7)));
        let v = Value::Int(1).binary(BinOp::Div, &Value::Double(4.0)).unwrap();
        assert!(matches!(v, Value::Double(d) if d == 0.25));
        assert!(Value::Int(1).binary(BinOp::Div, &Value::Int(0)).is_err());
    }

    #[test]
    fn test_compare_across_integer_widths() {
        assert!(compare(CmpOp::Lt, &Value::Int(1), &Value::Long(2)).unwrap());
        assert!(compare(CmpOp::Eq, &Value::Date(5), &Value::Int(5)).unwrap());
        assert!(compare(CmpOp::Ge, &Value::Bytes(b"b".to_vec()), &Value::Bytes(b"a".to_vec())).unwrap());
        assert!(compare(CmpOp::Eq, &Value::Bool(true), &Value::Int(1)).is_err());
    }

    #[test]
    fn test_to_scalar() {
        assert_eq!(
            Value::Bytes(b"x".to_vec()).to_scalar(LogicalType::Varchar).unwrap(),
            ScalarValue::Utf8("x".to_string())
        );
        assert_eq!(Value::Int(2).to_scalar(LogicalType::Long).unwrap(), ScalarValue::Int64(2));
    }
}
