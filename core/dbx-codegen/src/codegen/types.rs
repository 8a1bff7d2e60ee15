//! Logical types and QueryVariableType tags
//!
//! `LogicalType` is the value kind of a column; `QueryVariableType` crosses it
//! with the physical shape a variable has in the emitted procedure.

use crate::error::{DbxError, DbxResult};
use crate::plan::{BinaryOperator, Expr, ScalarValue};
use arrow::datatypes::DataType;
use std::fmt;

/// Logical value kind of a column or variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalType {
    Boolean,
    Int,
    Long,
    Double,
    /// Fixed-width binary with the byte width
    FixedBinary(i32),
    Varchar,
    /// Days since epoch
    Date,
}

impl LogicalType {
    pub fn from_arrow(data_type: &DataType) -> DbxResult<Self> {
        match data_type {
            DataType::Boolean => Ok(LogicalType::Boolean),
            DataType::Int32 => Ok(LogicalType::Int),
            DataType::Int64 => Ok(LogicalType::Long),
            DataType::Float64 => Ok(LogicalType::Double),
            DataType::FixedSizeBinary(width) => Ok(LogicalType::FixedBinary(*width)),
            DataType::Utf8 => Ok(LogicalType::Varchar),
            DataType::Date32 => Ok(LogicalType::Date),
            other => Err(DbxError::unsupported(
                "Scan",
                format!("column type {other:?} has no code generation strategy"),
            )),
        }
    }

    pub fn to_arrow(&self) -> DataType {
        match self {
            LogicalType::Boolean => DataType::Boolean,
            LogicalType::Int => DataType::Int32,
            LogicalType::Long => DataType::Int64,
            LogicalType::Double => DataType::Float64,
            LogicalType::FixedBinary(width) => DataType::FixedSizeBinary(*width),
            LogicalType::Varchar => DataType::Utf8,
            LogicalType::Date => DataType::Date32,
        }
    }

    pub fn of_literal(value: &ScalarValue) -> DbxResult<Self> {
        match value {
            ScalarValue::Null => Err(DbxError::unsupported(
                "Expression",
                "NULL literals are resolved by the planner",
            )),
            other => Self::from_arrow(&other.data_type()),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, LogicalType::Int | LogicalType::Long | LogicalType::Double)
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, LogicalType::Int | LogicalType::Long)
    }

    /// Stored as byte strings at run time.
    pub fn is_binary_like(&self) -> bool {
        matches!(self, LogicalType::FixedBinary(_) | LogicalType::Varchar)
    }

    /// Accumulator type for a SUM over this type.
    pub fn widened(&self) -> Self {
        match self {
            LogicalType::Int => LogicalType::Long,
            other => *other,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LogicalType::Boolean => "boolean",
            LogicalType::Int => "int",
            LogicalType::Long => "long",
            LogicalType::Double => "double",
            LogicalType::FixedBinary(_) => "fixed_binary",
            LogicalType::Varchar => "varchar",
            LogicalType::Date => "date",
        }
    }

    /// Type name of a single value in rendered source.
    pub fn rust_name(&self) -> &'static str {
        match self {
            LogicalType::Boolean => "bool",
            LogicalType::Int => "i32",
            LogicalType::Long => "i64",
            LogicalType::Double => "f64",
            LogicalType::FixedBinary(_) | LogicalType::Varchar => "&[u8]",
            LogicalType::Date => "Date32",
        }
    }

    /// Whether two types can be compared with `=`, `<`, ...
    pub fn comparable_with(&self, other: &LogicalType) -> bool {
        match (self, other) {
            (a, b) if a.is_numeric() && b.is_numeric() => true,
            (LogicalType::Date, LogicalType::Date) => true,
            (LogicalType::Varchar, LogicalType::Varchar) => true,
            (LogicalType::FixedBinary(_), LogicalType::FixedBinary(_)) => true,
            (LogicalType::Boolean, LogicalType::Boolean) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalType::FixedBinary(width) => write!(f, "fixed_binary({width})"),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// Logical kind × physical shape of a variable in generated code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryVariableType {
    Scalar(LogicalType),
    RawArray(LogicalType),
    Vector(LogicalType),
    VectorWithSelection(LogicalType),
    VectorWithValidity(LogicalType),
    SimdLanes(LogicalType),
    /// Instance of a generated hash-map type
    GeneratedMap(String),
    TableReader,
    /// Reusable scratch bytes for binary/string reads
    ByteBuffer,
}

impl QueryVariableType {
    pub fn logical(&self) -> Option<LogicalType> {
        match self {
            QueryVariableType::Scalar(t)
            | QueryVariableType::RawArray(t)
            | QueryVariableType::Vector(t)
            | QueryVariableType::VectorWithSelection(t)
            | QueryVariableType::VectorWithValidity(t)
            | QueryVariableType::SimdLanes(t) => Some(*t),
            QueryVariableType::GeneratedMap(_)
            | QueryVariableType::TableReader
            | QueryVariableType::ByteBuffer => None,
        }
    }

    pub fn is_batch(&self) -> bool {
        matches!(
            self,
            QueryVariableType::RawArray(_)
                | QueryVariableType::Vector(_)
                | QueryVariableType::VectorWithSelection(_)
                | QueryVariableType::VectorWithValidity(_)
        )
    }
}

impl fmt::Display for QueryVariableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryVariableType::Scalar(t) => write!(f, "{}", t.rust_name()),
            QueryVariableType::RawArray(t) => write!(f, "Buffer<{}>", t.rust_name()),
            QueryVariableType::Vector(t) => write!(f, "ColumnVector<{}>", t.rust_name()),
            QueryVariableType::VectorWithSelection(t) => {
                write!(f, "SelectedVector<{}>", t.rust_name())
            }
            QueryVariableType::VectorWithValidity(t) => {
                write!(f, "MaskedVector<{}>", t.rust_name())
            }
            QueryVariableType::SimdLanes(t) => write!(f, "Lanes<{}>", t.rust_name()),
            QueryVariableType::GeneratedMap(name) => write!(f, "{name}"),
            QueryVariableType::TableReader => write!(f, "TableReader"),
            QueryVariableType::ByteBuffer => write!(f, "Vec<u8>"),
        }
    }
}

/// Result type of binary arithmetic.
///
/// Division always yields `Double`; otherwise `Double` wins over `Long`,
/// which wins over `Int`.
pub fn promote_arithmetic(
    op: BinaryOperator,
    lhs: LogicalType,
    rhs: LogicalType,
) -> DbxResult<LogicalType> {
    if !op.is_arithmetic() {
        return Err(DbxError::unsupported(
            "Project",
            format!("operator {} is not arithmetic", op.symbol()),
        ));
    }
    if !lhs.is_numeric() || !rhs.is_numeric() {
        return Err(DbxError::type_mismatch(
            "numeric operands",
            format!("{lhs} {} {rhs}", op.symbol()),
        ));
    }
    if op == BinaryOperator::Divide {
        return Ok(LogicalType::Double);
    }
    Ok(match (lhs, rhs) {
        (LogicalType::Double, _) | (_, LogicalType::Double) => LogicalType::Double,
        (LogicalType::Long, _) | (_, LogicalType::Long) => LogicalType::Long,
        _ => LogicalType::Int,
    })
}

/// Common type of the two CASE branches.
pub fn unify_branches(then: LogicalType, otherwise: LogicalType) -> DbxResult<LogicalType> {
    if then == otherwise {
        return Ok(then);
    }
    if then.is_numeric() && otherwise.is_numeric() {
        return promote_arithmetic(BinaryOperator::Plus, then, otherwise);
    }
    Err(DbxError::type_mismatch(
        format!("CASE branches of one type ({then})"),
        otherwise.to_string(),
    ))
}

/// Infer the output type of a projection expression over `input` columns.
pub fn infer_expr_type(expr: &Expr, input: &[LogicalType]) -> DbxResult<LogicalType> {
    match expr {
        Expr::Column(idx) => input.get(*idx).copied().ok_or_else(|| {
            DbxError::unsupported(
                "Expression",
                format!("column #{idx} out of range ({} columns)", input.len()),
            )
        }),
        Expr::Literal(value) => LogicalType::of_literal(value),
        Expr::BinaryOp { left, op, right } => {
            let lhs = infer_expr_type(left, input)?;
            let rhs = infer_expr_type(right, input)?;
            if op.is_arithmetic() {
                promote_arithmetic(*op, lhs, rhs)
            } else if op.is_comparison() {
                if !lhs.comparable_with(&rhs) {
                    return Err(DbxError::type_mismatch(
                        format!("operand comparable with {lhs}"),
                        rhs.to_string(),
                    ));
                }
                Ok(LogicalType::Boolean)
            } else {
                Ok(LogicalType::Boolean)
            }
        }
        Expr::Case {
            when_left,
            when_right,
            then,
            otherwise,
        } => {
            let l = infer_expr_type(when_left, input)?;
            let r = infer_expr_type(when_right, input)?;
            if !l.comparable_with(&r) {
                return Err(DbxError::type_mismatch(
                    format!("CASE key comparable with {l}"),
                    r.to_string(),
                ));
            }
            unify_branches(
                infer_expr_type(then, input)?,
                infer_expr_type(otherwise, input)?,
            )
        }
        Expr::DateExtract { expr, .. } => match infer_expr_type(expr, input)? {
            LogicalType::Date => Ok(LogicalType::Int),
            other => Err(DbxError::type_mismatch("date", other.to_string())),
        },
        Expr::Not(_) => Ok(LogicalType::Boolean),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::DateField;

    #[test]
    fn test_division_always_promotes_to_double() {
        let t = promote_arithmetic(BinaryOperator::Divide, LogicalType::Int, LogicalType::Int);
        assert_eq!(t.unwrap(), LogicalType::Double);
    }

    #[test]
    fn test_promotion_lattice() {
        use LogicalType::*;
        let plus = BinaryOperator::Plus;
        assert_eq!(promote_arithmetic(plus, Int, Int).unwrap(), Int);
        assert_eq!(promote_arithmetic(plus, Int, Long).unwrap(), Long);
        assert_eq!(promote_arithmetic(plus, Long, Double).unwrap(), Double);
        assert_eq!(
            promote_arithmetic(BinaryOperator::Multiply, Double, Int).unwrap(),
            Double
        );
    }

    #[test]
    fn test_non_numeric_arithmetic_is_type_mismatch() {
        let err = promote_arithmetic(BinaryOperator::Plus, LogicalType::Varchar, LogicalType::Int)
            .unwrap_err();
        assert!(matches!(err, DbxError::TypeMismatch { .. }));
    }

    #[test]
    fn test_arrow_round_trip() {
        for t in [
            LogicalType::Int,
            LogicalType::Long,
            LogicalType::Double,
            LogicalType::FixedBinary(16),
            LogicalType::Varchar,
            LogicalType::Date,
        ] {
            assert_eq!(LogicalType::from_arrow(&t.to_arrow()).unwrap(), t);
        }
        assert!(LogicalType::from_arrow(&DataType::Float16).is_err());
    }

    #[test]
    fn test_infer_case_and_extract() {
        let input = [LogicalType::Int, LogicalType::Double, LogicalType::Date];
        let case = Expr::case_eq(Expr::col(0), Expr::lit(ScalarValue::Int32(1)), Expr::col(1), Expr::col(0));
        assert_eq!(infer_expr_type(&case, &input).unwrap(), LogicalType::Double);

        let year = Expr::extract(DateField::Year, Expr::col(2));
        assert_eq!(infer_expr_type(&year, &input).unwrap(), LogicalType::Int);

        let bad = Expr::extract(DateField::Day, Expr::col(0));
        assert!(infer_expr_type(&bad, &input).is_err());
    }

    #[test]
    fn test_query_variable_type_display() {
        assert_eq!(QueryVariableType::Scalar(LogicalType::Long).to_string(), "i64");
        assert_eq!(
            QueryVariableType::Vector(LogicalType::Double).to_string(),
            "ColumnVector<f64>"
        );
        assert_eq!(
            QueryVariableType::GeneratedMap("AggMap0".into()).to_string(),
            "AggMap0"
        );
        assert!(QueryVariableType::RawArray(LogicalType::Int).is_batch());
        assert!(!QueryVariableType::TableReader.is_batch());
    }
}
