//! 논리 플랜 타입 정의
//!
//! LogicalPlan, Expr, ScalarValue 등 코드 생성기가 읽는 핵심 타입들을 정의합니다.

use arrow::datatypes::{DataType, SchemaRef};
use std::fmt;

/// Literal value inside a plan expression or a query result row.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Binary(Vec<u8>),
    /// Days since 1970-01-01
    Date32(i32),
}

impl ScalarValue {
    /// Get the Arrow DataType for this value.
    pub fn data_type(&self) -> DataType {
        match self {
            ScalarValue::Null => DataType::Null,
            ScalarValue::Boolean(_) => DataType::Boolean,
            ScalarValue::Int32(_) => DataType::Int32,
            ScalarValue::Int64(_) => DataType::Int64,
            ScalarValue::Float64(_) => DataType::Float64,
            ScalarValue::Utf8(_) => DataType::Utf8,
            ScalarValue::Binary(bytes) => DataType::FixedSizeBinary(bytes.len() as i32),
            ScalarValue::Date32(_) => DataType::Date32,
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Null => write!(f, "NULL"),
            ScalarValue::Boolean(v) => write!(f, "{v}"),
            ScalarValue::Int32(v) => write!(f, "{v}"),
            ScalarValue::Int64(v) => write!(f, "{v}"),
            ScalarValue::Float64(v) => write!(f, "{v}"),
            ScalarValue::Utf8(v) => write!(f, "'{v}'"),
            ScalarValue::Binary(bytes) => {
                write!(f, "x'")?;
                for b in bytes {
                    write!(f, "{b:02x}")?;
                }
                write!(f, "'")
            }
            ScalarValue::Date32(days) => write!(f, "DATE {days}"),
        }
    }
}

/// 이항 연산자
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    // 산술
    Plus,
    Minus,
    Multiply,
    Divide,
    // 비교
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    // 논리
    And,
    Or,
}

impl BinaryOperator {
    pub fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            BinaryOperator::Plus
                | BinaryOperator::Minus
                | BinaryOperator::Multiply
                | BinaryOperator::Divide
        )
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOperator::Eq
                | BinaryOperator::NotEq
                | BinaryOperator::Lt
                | BinaryOperator::LtEq
                | BinaryOperator::Gt
                | BinaryOperator::GtEq
        )
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOperator::Plus => "+",
            BinaryOperator::Minus => "-",
            BinaryOperator::Multiply => "*",
            BinaryOperator::Divide => "/",
            BinaryOperator::Eq => "=",
            BinaryOperator::NotEq => "<>",
            BinaryOperator::Lt => "<",
            BinaryOperator::LtEq => "<=",
            BinaryOperator::Gt => ">",
            BinaryOperator::GtEq => ">=",
            BinaryOperator::And => "AND",
            BinaryOperator::Or => "OR",
        }
    }
}

/// Field extracted by `EXTRACT(... FROM date)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DateField {
    Year,
    Month,
    Day,
}

/// 표현식 — 컬럼 참조, 리터럴, 연산자
///
/// Column references are ordinals into the input operator's output columns.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(usize),
    Literal(ScalarValue),
    BinaryOp {
        left: Box<Expr>,
        op: BinaryOperator,
        right: Box<Expr>,
    },
    /// `CASE WHEN when_left = when_right THEN then ELSE otherwise END`
    Case {
        when_left: Box<Expr>,
        when_right: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    DateExtract {
        field: DateField,
        expr: Box<Expr>,
    },
    Not(Box<Expr>),
}

impl Expr {
    pub fn col(index: usize) -> Self {
        Expr::Column(index)
    }

    pub fn lit(value: ScalarValue) -> Self {
        Expr::Literal(value)
    }

    pub fn binary(left: Expr, op: BinaryOperator, right: Expr) -> Self {
        Expr::BinaryOp {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn eq(left: Expr, right: Expr) -> Self {
        Self::binary(left, BinaryOperator::Eq, right)
    }

    pub fn and(left: Expr, right: Expr) -> Self {
        Self::binary(left, BinaryOperator::And, right)
    }

    pub fn case_eq(when_left: Expr, when_right: Expr, then: Expr, otherwise: Expr) -> Self {
        Expr::Case {
            when_left: Box::new(when_left),
            when_right: Box::new(when_right),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        }
    }

    pub fn extract(field: DateField, expr: Expr) -> Self {
        Expr::DateExtract {
            field,
            expr: Box::new(expr),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(idx) => write!(f, "#{idx}"),
            Expr::Literal(value) => write!(f, "{value}"),
            Expr::BinaryOp { left, op, right } => write!(f, "({left} {} {right})", op.symbol()),
            Expr::Case {
                when_left,
                when_right,
                then,
                otherwise,
            } => write!(
                f,
                "CASE WHEN {when_left} = {when_right} THEN {then} ELSE {otherwise} END"
            ),
            Expr::DateExtract { field, expr } => write!(f, "EXTRACT({field:?} FROM {expr})"),
            Expr::Not(expr) => write!(f, "NOT {expr}"),
        }
    }
}

/// 집계 함수
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

/// 집계 표현식 — `input`이 None이면 COUNT(*)
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateExpr {
    pub function: AggregateFunction,
    pub input: Option<usize>,
}

impl AggregateExpr {
    pub fn count_star() -> Self {
        Self {
            function: AggregateFunction::Count,
            input: None,
        }
    }

    pub fn count(column: usize) -> Self {
        Self {
            function: AggregateFunction::Count,
            input: Some(column),
        }
    }

    pub fn sum(column: usize) -> Self {
        Self {
            function: AggregateFunction::Sum,
            input: Some(column),
        }
    }
}

/// JOIN 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Cross,
}

/// 논리 플랜 — 코드 생성 대상 연산자 트리
#[derive(Debug, Clone, PartialEq)]
pub enum LogicalPlan {
    /// 테이블 스캔: `projection` holds table column indices
    Scan {
        table: String,
        schema: SchemaRef,
        projection: Vec<usize>,
    },
    /// WHERE 조건 필터
    Filter {
        input: Box<LogicalPlan>,
        predicate: Expr,
    },
    /// 컬럼 선택/계산
    Project {
        input: Box<LogicalPlan>,
        exprs: Vec<Expr>,
    },
    /// GROUP BY + 집계: output is group columns then aggregates
    Aggregate {
        input: Box<LogicalPlan>,
        group_by: Vec<usize>,
        aggregates: Vec<AggregateExpr>,
    },
    /// JOIN: `on` refers to left columns first, then right columns
    Join {
        left: Box<LogicalPlan>,
        right: Box<LogicalPlan>,
        join_type: JoinType,
        on: Expr,
    },
}

impl LogicalPlan {
    pub fn scan(table: impl Into<String>, schema: SchemaRef, projection: Vec<usize>) -> Self {
        LogicalPlan::Scan {
            table: table.into(),
            schema,
            projection,
        }
    }

    pub fn filter(self, predicate: Expr) -> Self {
        LogicalPlan::Filter {
            input: Box::new(self),
            predicate,
        }
    }

    pub fn project(self, exprs: Vec<Expr>) -> Self {
        LogicalPlan::Project {
            input: Box::new(self),
            exprs,
        }
    }

    pub fn aggregate(self, group_by: Vec<usize>, aggregates: Vec<AggregateExpr>) -> Self {
        LogicalPlan::Aggregate {
            input: Box::new(self),
            group_by,
            aggregates,
        }
    }

    pub fn join(self, right: LogicalPlan, join_type: JoinType, on: Expr) -> Self {
        LogicalPlan::Join {
            left: Box::new(self),
            right: Box::new(right),
            join_type,
            on,
        }
    }

    /// Operator name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            LogicalPlan::Scan { .. } => "Scan",
            LogicalPlan::Filter { .. } => "Filter",
            LogicalPlan::Project { .. } => "Project",
            LogicalPlan::Aggregate { .. } => "Aggregation",
            LogicalPlan::Join { .. } => "Join",
        }
    }

    /// Returns a list of all tables involved in this plan.
    pub fn tables(&self) -> Vec<String> {
        match self {
            LogicalPlan::Scan { table, .. } => vec![table.clone()],
            LogicalPlan::Join { left, right, .. } => {
                let mut v = left.tables();
                v.extend(right.tables());
                v
            }
            LogicalPlan::Filter { input, .. }
            | LogicalPlan::Project { input, .. }
            | LogicalPlan::Aggregate { input, .. } => input.tables(),
        }
    }
}
