//! Statement/expression emission API
//!
//! Generated procedures are trees of [`Stmt`] and [`CodeExpr`]. Operators only
//! build code through these constructors; the tree renders to source text and
//! is run by the reference executor in [`crate::exec`].

use crate::codegen::types::{LogicalType, QueryVariableType};
use crate::config::LaneWidth;
use crate::plan::{BinaryOperator, DateField};
use std::fmt::{self, Write};

/// Literal embedded in generated code.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Date(i32),
    Bytes(Vec<u8>),
    Str(String),
}

/// Operators of generated scalar expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    BitXor,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
            BinOp::BitXor => "^",
        }
    }
}

/// Comparison selected for a run-time filter primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn from_plan(op: BinaryOperator) -> Option<Self> {
        match op {
            BinaryOperator::Eq => Some(CmpOp::Eq),
            BinaryOperator::NotEq => Some(CmpOp::Ne),
            BinaryOperator::Lt => Some(CmpOp::Lt),
            BinaryOperator::LtEq => Some(CmpOp::Le),
            BinaryOperator::Gt => Some(CmpOp::Gt),
            BinaryOperator::GtEq => Some(CmpOp::Ge),
            _ => None,
        }
    }

    /// Same comparison with operands swapped (`a < b` ⇔ `b > a`).
    pub fn flip(&self) -> Self {
        match self {
            CmpOp::Eq => CmpOp::Eq,
            CmpOp::Ne => CmpOp::Ne,
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Ge => CmpOp::Le,
        }
    }

    pub fn to_binop(&self) -> BinOp {
        match self {
            CmpOp::Eq => BinOp::Eq,
            CmpOp::Ne => BinOp::Ne,
            CmpOp::Lt => BinOp::Lt,
            CmpOp::Le => BinOp::Le,
            CmpOp::Gt => BinOp::Gt,
            CmpOp::Ge => BinOp::Ge,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CmpOp::Eq => "eq",
            CmpOp::Ne => "ne",
            CmpOp::Lt => "lt",
            CmpOp::Le => "le",
            CmpOp::Gt => "gt",
            CmpOp::Ge => "ge",
        }
    }
}

/// Arithmetic selected for a run-time arithmetic primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ArithOp {
    pub fn from_plan(op: BinaryOperator) -> Option<Self> {
        match op {
            BinaryOperator::Plus => Some(ArithOp::Add),
            BinaryOperator::Minus => Some(ArithOp::Sub),
            BinaryOperator::Multiply => Some(ArithOp::Mul),
            BinaryOperator::Divide => Some(ArithOp::Div),
            _ => None,
        }
    }

    pub fn to_binop(&self) -> BinOp {
        match self {
            ArithOp::Add => BinOp::Add,
            ArithOp::Sub => BinOp::Sub,
            ArithOp::Mul => BinOp::Mul,
            ArithOp::Div => BinOp::Div,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ArithOp::Add => "add",
            ArithOp::Sub => "sub",
            ArithOp::Mul => "mul",
            ArithOp::Div => "div",
        }
    }
}

/// Filtering marker carried by a batch operand of a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerKind {
    None,
    Selection,
    Validity,
}

impl MarkerKind {
    pub fn suffix(&self) -> &'static str {
        match self {
            MarkerKind::None => "",
            MarkerKind::Selection => "_sel",
            MarkerKind::Validity => "_valid",
        }
    }
}

/// Whether a primitive operand is a broadcast scalar or a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandShape {
    Scalar,
    Vector,
}

impl OperandShape {
    fn tag(&self) -> &'static str {
        match self {
            OperandShape::Scalar => "s",
            OperandShape::Vector => "v",
        }
    }
}

/// Run-time library entry points invoked by generated code.
///
/// Batch primitives share the positional layout
/// `(vector, scalar-or-vector, [marker array], length, output)`; the marker
/// array is present only when the marker kind is not `None`.
#[derive(Debug, Clone, PartialEq)]
pub enum Intrinsic {
    /// `(handle) -> reader`
    OpenReader,
    /// `(value) -> i64`
    PreHash,
    /// `(vector, row, scratch) -> bytes`
    ReadBytes,
    /// `(date) -> i32`
    ExtractDate(DateField),
    /// `(capacity) -> buffer` from the pooling allocator
    AcquireBuffer(LogicalType),
    /// `(buffer)`
    ReleaseBuffer,
    /// `(lhs, rhs, [marker], length, out) -> new length`
    VectorFilter {
        cmp: CmpOp,
        rhs: OperandShape,
        input: MarkerKind,
        output: MarkerKind,
    },
    /// `(lhs, rhs, [marker], length, out) -> length`
    VectorArith {
        op: ArithOp,
        lhs: OperandShape,
        rhs: OperandShape,
        marker: MarkerKind,
        result: LogicalType,
    },
    /// `(vector, [marker], length, hashes)`; `combine` XORs into `hashes`
    VectorHash { marker: MarkerKind, combine: bool },
    /// `(vector, [marker], length) -> widened sum`
    VectorSum { marker: MarkerKind },
    /// `([marker], length) -> i64`
    VectorCount { marker: MarkerKind },
    /// `(validity, length)`: marks every row valid
    ValidityInit,
    /// `(src, offset, count, dst)`
    ArrayCopy,
    /// `(vector, offset, lane_count, lanes)`
    SimdLoad { lane_width: LaneWidth },
    /// `(lanes, scalar, lane_count, lane_mask)`
    SimdCompare { cmp: CmpOp, lane_width: LaneWidth },
    /// `(lane_mask, offset, lane_count, validity)`: ANDs lanes into validity
    SimdMaskStore,
    /// `(values...)`
    EmitRow,
    /// `(values...)`
    PrintRow,
    /// `(count)`
    EmitCount,
}

impl Intrinsic {
    pub fn name(&self) -> String {
        match self {
            Intrinsic::OpenReader => "open_reader".to_string(),
            Intrinsic::PreHash => "pre_hash".to_string(),
            Intrinsic::ReadBytes => "read_bytes".to_string(),
            Intrinsic::ExtractDate(field) => match field {
                DateField::Year => "extract_year".to_string(),
                DateField::Month => "extract_month".to_string(),
                DateField::Day => "extract_day".to_string(),
            },
            Intrinsic::AcquireBuffer(ty) => format!("pool.acquire::<{}>", ty.rust_name()),
            Intrinsic::ReleaseBuffer => "pool.release".to_string(),
            Intrinsic::VectorFilter {
                cmp,
                rhs,
                input,
                output,
            } => format!(
                "filter_{}_v{}{}_into{}",
                cmp.name(),
                rhs.tag(),
                input.suffix(),
                output.suffix()
            ),
            Intrinsic::VectorArith {
                op,
                lhs,
                rhs,
                marker,
                result,
            } => format!(
                "{}_{}{}{}_{}",
                op.name(),
                lhs.tag(),
                rhs.tag(),
                marker.suffix(),
                result.name()
            ),
            Intrinsic::VectorHash { marker, combine } => format!(
                "hash{}{}",
                if *combine { "_combine" } else { "" },
                marker.suffix()
            ),
            Intrinsic::VectorSum { marker } => format!("sum{}", marker.suffix()),
            Intrinsic::VectorCount { marker } => format!("count{}", marker.suffix()),
            Intrinsic::ValidityInit => "validity_init".to_string(),
            Intrinsic::ArrayCopy => "array_copy".to_string(),
            Intrinsic::SimdLoad { lane_width } => format!("simd_load_{lane_width}"),
            Intrinsic::SimdCompare { cmp, lane_width } => {
                format!("simd_{}_{lane_width}", cmp.name())
            }
            Intrinsic::SimdMaskStore => "simd_mask_store".to_string(),
            Intrinsic::EmitRow => "out.emit_row".to_string(),
            Intrinsic::PrintRow => "out.print_row".to_string(),
            Intrinsic::EmitCount => "out.emit_count".to_string(),
        }
    }
}

/// Methods on reader, vector and generated-map variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    LoadNextBatch,
    GetVector,
    ValueCount,
    Len,
    Associate,
    IncrementForKey,
    GetIndex,
}

impl Method {
    pub fn name(&self) -> &'static str {
        match self {
            Method::LoadNextBatch => "load_next_batch",
            Method::GetVector => "get_vector",
            Method::ValueCount => "value_count",
            Method::Len => "len",
            Method::Associate => "associate",
            Method::IncrementForKey => "increment_for_key",
            Method::GetIndex => "get_index",
        }
    }
}

/// Expression in generated code.
#[derive(Debug, Clone, PartialEq)]
pub enum CodeExpr {
    Var(String),
    Lit(Literal),
    Binary {
        op: BinOp,
        lhs: Box<CodeExpr>,
        rhs: Box<CodeExpr>,
    },
    Not(Box<CodeExpr>),
    Cast {
        expr: Box<CodeExpr>,
        to: LogicalType,
    },
    Index {
        array: Box<CodeExpr>,
        index: Box<CodeExpr>,
    },
    Field {
        target: Box<CodeExpr>,
        field: String,
    },
    Call {
        func: Intrinsic,
        args: Vec<CodeExpr>,
    },
    Method {
        target: Box<CodeExpr>,
        method: Method,
        args: Vec<CodeExpr>,
    },
    NewArray {
        elem: LogicalType,
        len: Box<CodeExpr>,
    },
    NewMap(String),
    NewByteBuffer,
}

impl CodeExpr {
    pub fn var(name: impl Into<String>) -> Self {
        CodeExpr::Var(name.into())
    }

    pub fn int(value: i32) -> Self {
        CodeExpr::Lit(Literal::Int(value))
    }

    pub fn long(value: i64) -> Self {
        CodeExpr::Lit(Literal::Long(value))
    }

    pub fn bool(value: bool) -> Self {
        CodeExpr::Lit(Literal::Bool(value))
    }

    pub fn binary(op: BinOp, lhs: CodeExpr, rhs: CodeExpr) -> Self {
        CodeExpr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn call(func: Intrinsic, args: Vec<CodeExpr>) -> Self {
        CodeExpr::Call { func, args }
    }

    pub fn index(self, index: CodeExpr) -> Self {
        CodeExpr::Index {
            array: Box::new(self),
            index: Box::new(index),
        }
    }

    pub fn field(self, field: impl Into<String>) -> Self {
        CodeExpr::Field {
            target: Box::new(self),
            field: field.into(),
        }
    }

    pub fn method(self, method: Method, args: Vec<CodeExpr>) -> Self {
        CodeExpr::Method {
            target: Box::new(self),
            method,
            args,
        }
    }

    pub fn cast(self, to: LogicalType) -> Self {
        CodeExpr::Cast {
            expr: Box::new(self),
            to,
        }
    }

    pub fn not(self) -> Self {
        CodeExpr::Not(Box::new(self))
    }

    pub fn add(self, rhs: CodeExpr) -> Self {
        Self::binary(BinOp::Add, self, rhs)
    }

    pub fn sub(self, rhs: CodeExpr) -> Self {
        Self::binary(BinOp::Sub, self, rhs)
    }

    pub fn lt(self, rhs: CodeExpr) -> Self {
        Self::binary(BinOp::Lt, self, rhs)
    }

    pub fn gt(self, rhs: CodeExpr) -> Self {
        Self::binary(BinOp::Gt, self, rhs)
    }

    pub fn eq(self, rhs: CodeExpr) -> Self {
        Self::binary(BinOp::Eq, self, rhs)
    }

    pub fn ne(self, rhs: CodeExpr) -> Self {
        Self::binary(BinOp::Ne, self, rhs)
    }

    pub fn and(self, rhs: CodeExpr) -> Self {
        Self::binary(BinOp::And, self, rhs)
    }

    pub fn xor(self, rhs: CodeExpr) -> Self {
        Self::binary(BinOp::BitXor, self, rhs)
    }
}

/// Statement in generated code.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Declare {
        name: String,
        ty: QueryVariableType,
        init: Option<CodeExpr>,
    },
    Assign {
        target: CodeExpr,
        value: CodeExpr,
    },
    Eval(CodeExpr),
    If {
        cond: CodeExpr,
        then_branch: Vec<Stmt>,
        else_branch: Vec<Stmt>,
    },
    While {
        cond: CodeExpr,
        body: Vec<Stmt>,
    },
    /// `for var in start..end`; `end` is evaluated once
    For {
        var: String,
        start: CodeExpr,
        end: CodeExpr,
        body: Vec<Stmt>,
    },
    Continue,
    Break,
    /// `cleanup` runs on every exit path of `body`
    Guarded {
        body: Vec<Stmt>,
        cleanup: Vec<Stmt>,
    },
    Comment(String),
}

impl Stmt {
    pub fn declare(name: impl Into<String>, ty: QueryVariableType, init: CodeExpr) -> Self {
        Stmt::Declare {
            name: name.into(),
            ty,
            init: Some(init),
        }
    }

    pub fn assign(target: CodeExpr, value: CodeExpr) -> Self {
        Stmt::Assign { target, value }
    }

    /// `name = name + by`
    pub fn increment(name: &str, by: CodeExpr) -> Self {
        Stmt::Assign {
            target: CodeExpr::var(name),
            value: CodeExpr::var(name).add(by),
        }
    }

    pub fn eval(expr: CodeExpr) -> Self {
        Stmt::Eval(expr)
    }

    pub fn if_then(cond: CodeExpr, then_branch: Vec<Stmt>) -> Self {
        Stmt::If {
            cond,
            then_branch,
            else_branch: Vec::new(),
        }
    }

    pub fn if_else(cond: CodeExpr, then_branch: Vec<Stmt>, else_branch: Vec<Stmt>) -> Self {
        Stmt::If {
            cond,
            then_branch,
            else_branch,
        }
    }

    pub fn while_loop(cond: CodeExpr, body: Vec<Stmt>) -> Self {
        Stmt::While { cond, body }
    }

    pub fn for_range(var: impl Into<String>, start: CodeExpr, end: CodeExpr, body: Vec<Stmt>) -> Self {
        Stmt::For {
            var: var.into(),
            start,
            end,
            body,
        }
    }

    pub fn guarded(body: Vec<Stmt>, cleanup: Vec<Stmt>) -> Self {
        Stmt::Guarded { body, cleanup }
    }

    pub fn comment(text: impl Into<String>) -> Self {
        Stmt::Comment(text.into())
    }
}

/// Visit every intrinsic call in `stmts`, depth first.
pub fn walk_calls<'a>(stmts: &'a [Stmt], f: &mut dyn FnMut(&'a Intrinsic)) {
    for stmt in stmts {
        match stmt {
            Stmt::Declare { init, .. } => {
                if let Some(init) = init {
                    walk_expr_calls(init, f);
                }
            }
            Stmt::Assign { target, value } => {
                walk_expr_calls(target, f);
                walk_expr_calls(value, f);
            }
            Stmt::Eval(expr) => walk_expr_calls(expr, f),
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => {
                walk_expr_calls(cond, f);
                walk_calls(then_branch, f);
                walk_calls(else_branch, f);
            }
            Stmt::While { cond, body } => {
                walk_expr_calls(cond, f);
                walk_calls(body, f);
            }
            Stmt::For {
                start, end, body, ..
            } => {
                walk_expr_calls(start, f);
                walk_expr_calls(end, f);
                walk_calls(body, f);
            }
            Stmt::Guarded { body, cleanup } => {
                walk_calls(body, f);
                walk_calls(cleanup, f);
            }
            Stmt::Continue | Stmt::Break | Stmt::Comment(_) => {}
        }
    }
}

fn walk_expr_calls<'a>(expr: &'a CodeExpr, f: &mut dyn FnMut(&'a Intrinsic)) {
    match expr {
        CodeExpr::Var(_) | CodeExpr::Lit(_) | CodeExpr::NewMap(_) | CodeExpr::NewByteBuffer => {}
        CodeExpr::Binary { lhs, rhs, .. } => {
            walk_expr_calls(lhs, f);
            walk_expr_calls(rhs, f);
        }
        CodeExpr::Not(inner) | CodeExpr::Cast { expr: inner, .. } => walk_expr_calls(inner, f),
        CodeExpr::Index { array, index } => {
            walk_expr_calls(array, f);
            walk_expr_calls(index, f);
        }
        CodeExpr::Field { target, .. } => walk_expr_calls(target, f),
        CodeExpr::Call { func, args } => {
            f(func);
            for arg in args {
                walk_expr_calls(arg, f);
            }
        }
        CodeExpr::Method { target, args, .. } => {
            walk_expr_calls(target, f);
            for arg in args {
                walk_expr_calls(arg, f);
            }
        }
        CodeExpr::NewArray { len, .. } => walk_expr_calls(len, f),
    }
}

/// Count intrinsic calls matching `pred`.
pub fn count_calls(stmts: &[Stmt], pred: impl Fn(&Intrinsic) -> bool) -> usize {
    let mut count = 0;
    walk_calls(stmts, &mut |func| {
        if pred(func) {
            count += 1;
        }
    });
    count
}

// ===== Rendering =====

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Bool(v) => write!(f, "{v}"),
            Literal::Int(v) => write!(f, "{v}i32"),
            Literal::Long(v) => write!(f, "{v}i64"),
            Literal::Double(v) => write!(f, "{v:?}f64"),
            Literal::Date(v) => write!(f, "Date32({v})"),
            Literal::Bytes(bytes) => {
                write!(f, "b\"")?;
                for b in bytes {
                    write!(f, "\\x{b:02x}")?;
                }
                write!(f, "\"")
            }
            Literal::Str(s) => write!(f, "b{s:?}"),
        }
    }
}

impl fmt::Display for CodeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodeExpr::Var(name) => write!(f, "{name}"),
            CodeExpr::Lit(lit) => write!(f, "{lit}"),
            CodeExpr::Binary { op, lhs, rhs } => write!(f, "({lhs} {} {rhs})", op.symbol()),
            CodeExpr::Not(inner) => write!(f, "!{inner}"),
            CodeExpr::Cast { expr, to } => write!(f, "({expr} as {})", to.rust_name()),
            CodeExpr::Index { array, index } => write!(f, "{array}[{index}]"),
            CodeExpr::Field { target, field } => write!(f, "{target}.{field}"),
            CodeExpr::Call { func, args } => {
                write!(f, "{}(", func.name())?;
                write_args(f, args)?;
                write!(f, ")")
            }
            CodeExpr::Method {
                target,
                method,
                args,
            } => {
                write!(f, "{target}.{}(", method.name())?;
                write_args(f, args)?;
                write!(f, ")")
            }
            CodeExpr::NewArray { elem, len } => {
                write!(f, "Buffer::<{}>::new({len})", elem.rust_name())
            }
            CodeExpr::NewMap(type_name) => write!(f, "{type_name}::new()"),
            CodeExpr::NewByteBuffer => write!(f, "Vec::<u8>::new()"),
        }
    }
}

fn write_args(f: &mut fmt::Formatter<'_>, args: &[CodeExpr]) -> fmt::Result {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{arg}")?;
    }
    Ok(())
}

/// Render statements at `indent` levels (four spaces each).
pub fn render_block(stmts: &[Stmt], indent: usize, out: &mut String) {
    for stmt in stmts {
        render_stmt(stmt, indent, out);
    }
}

fn render_stmt(stmt: &Stmt, indent: usize, out: &mut String) {
    let pad = "    ".repeat(indent);
    // Writing into a String cannot fail.
    let _ = match stmt {
        Stmt::Declare { name, ty, init } => match init {
            Some(init) => writeln!(out, "{pad}let mut {name}: {ty} = {init};"),
            None => writeln!(out, "{pad}let mut {name}: {ty};"),
        },
        Stmt::Assign { target, value } => writeln!(out, "{pad}{target} = {value};"),
        Stmt::Eval(expr) => writeln!(out, "{pad}{expr};"),
        Stmt::If {
            cond,
            then_branch,
            else_branch,
        } => {
            let _ = writeln!(out, "{pad}if {cond} {{");
            render_block(then_branch, indent + 1, out);
            if else_branch.is_empty() {
                writeln!(out, "{pad}}}")
            } else {
                let _ = writeln!(out, "{pad}}} else {{");
                render_block(else_branch, indent + 1, out);
                writeln!(out, "{pad}}}")
            }
        }
        Stmt::While { cond, body } => {
            let _ = writeln!(out, "{pad}while {cond} {{");
            render_block(body, indent + 1, out);
            writeln!(out, "{pad}}}")
        }
        Stmt::For {
            var,
            start,
            end,
            body,
        } => {
            let _ = writeln!(out, "{pad}for {var} in {start}..{end} {{");
            render_block(body, indent + 1, out);
            writeln!(out, "{pad}}}")
        }
        Stmt::Continue => writeln!(out, "{pad}continue;"),
        Stmt::Break => writeln!(out, "{pad}break;"),
        Stmt::Guarded { body, cleanup } => {
            let _ = writeln!(out, "{pad}guarded {{");
            render_block(body, indent + 1, out);
            let _ = writeln!(out, "{pad}}} finally {{");
            render_block(cleanup, indent + 1, out);
            writeln!(out, "{pad}}}")
        }
        Stmt::Comment(text) => writeln!(out, "{pad}// {text}"),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_loop_with_guard() {
        let body = vec![
            Stmt::declare(
                "acc_0",
                QueryVariableType::Scalar(LogicalType::Long),
                CodeExpr::long(0),
            ),
            Stmt::guarded(
                vec![Stmt::for_range(
                    "row_1",
                    CodeExpr::int(0),
                    CodeExpr::int(4),
                    vec![Stmt::increment("acc_0", CodeExpr::long(1))],
                )],
                vec![Stmt::eval(CodeExpr::call(
                    Intrinsic::ReleaseBuffer,
                    vec![CodeExpr::var("sel_2")],
                ))],
            ),
        ];
        let mut out = String::new();
        render_block(&body, 0, &mut out);
        assert!(out.contains("let mut acc_0: i64 = 0i64;"));
        assert!(out.contains("for row_1 in 0i32..4i32 {"));
        assert!(out.contains("        acc_0 = (acc_0 + 1i64);"));
        assert!(out.contains("} finally {"));
        assert!(out.contains("pool.release(sel_2);"));
    }

    #[test]
    fn test_intrinsic_names_encode_shape() {
        let f = Intrinsic::VectorFilter {
            cmp: CmpOp::Lt,
            rhs: OperandShape::Scalar,
            input: MarkerKind::Selection,
            output: MarkerKind::Selection,
        };
        assert_eq!(f.name(), "filter_lt_vs_sel_into_sel");
        let a = Intrinsic::VectorArith {
            op: ArithOp::Mul,
            lhs: OperandShape::Vector,
            rhs: OperandShape::Vector,
            marker: MarkerKind::Validity,
            result: LogicalType::Double,
        };
        assert_eq!(a.name(), "mul_vv_valid_double");
    }

    #[test]
    fn test_cmp_flip() {
        assert_eq!(CmpOp::Lt.flip(), CmpOp::Gt);
        assert_eq!(CmpOp::Ge.flip(), CmpOp::Le);
        assert_eq!(CmpOp::Eq.flip(), CmpOp::Eq);
        assert_eq!(CmpOp::from_plan(BinaryOperator::Plus), None);
    }

    #[test]
    fn test_count_calls_descends_into_blocks() {
        let acquire = CodeExpr::call(
            Intrinsic::AcquireBuffer(LogicalType::Int),
            vec![CodeExpr::int(8)],
        );
        let stmts = vec![
            Stmt::declare("buf_0", QueryVariableType::RawArray(LogicalType::Int), acquire),
            Stmt::while_loop(
                CodeExpr::bool(true),
                vec![Stmt::if_then(
                    CodeExpr::call(Intrinsic::PreHash, vec![CodeExpr::int(1)]).eq(CodeExpr::long(0)),
                    vec![Stmt::Break],
                )],
            ),
        ];
        assert_eq!(
            count_calls(&stmts, |f| matches!(f, Intrinsic::AcquireBuffer(_))),
            1
        );
        assert_eq!(count_calls(&stmts, |f| *f == Intrinsic::PreHash), 1);
    }
}
