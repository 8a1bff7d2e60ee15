//! Tree-walking executor for [`Procedure`] bodies

use crate::codegen::context::ExternalResource;
use crate::codegen::ir::{BinOp, CodeExpr, Intrinsic, MarkerKind, Method, OperandShape, Stmt};
use crate::codegen::procedure::Procedure;
use crate::codegen::types::QueryVariableType;
use crate::error::{DbxError, DbxResult};
use crate::plan::{DateField, ScalarValue};
use crate::runtime::hash::pre_hash;
use crate::runtime::map::GeneratedMap;
use crate::runtime::pool::{BufferPool, PoolStats};
use crate::runtime::reader::TableSource;
use crate::runtime::value::{ColumnData, SharedColumn, Value};
use crate::runtime::vector::{self, Marker, Operand};
use crate::logging::TARGET;
use ahash::AHashMap;
use chrono::{Datelike, NaiveDate};
use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;
use tracing::debug;

/// Days from 0001-01-01 (CE day 1) to 1970-01-01.
const UNIX_EPOCH_FROM_CE: i32 = 719_163;

/// Everything a procedure sent to its output, plus pool counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// `emit_row` calls in order
    pub rows: Vec<Vec<ScalarValue>>,
    /// `print_row` lines in order
    pub printed: Vec<String>,
    /// `emit_count` value
    pub count: Option<i64>,
    pub pool: PoolStats,
}

/// Run `procedure` against the tables of `source`.
pub fn execute(procedure: &Procedure, source: &dyn TableSource) -> DbxResult<QueryResult> {
    debug!(target: TARGET, name = %procedure.name, style = %procedure.style, "execute");
    let mut interpreter = Interpreter {
        procedure,
        source,
        vars: AHashMap::new(),
        pool: BufferPool::new(),
        result: QueryResult::default(),
    };
    for global in &procedure.globals {
        interpreter.exec(&Stmt::declare(&global.name, global.ty.clone(), global.init.clone()))?;
    }
    interpreter.exec_block(&procedure.body)?;

    let mut result = interpreter.result;
    result.pool = interpreter.pool.stats();
    debug!(
        target: TARGET,
        rows = result.rows.len(),
        printed = result.printed.len(),
        count = ?result.count,
        outstanding = result.pool.outstanding,
        "execute finished"
    );
    Ok(result)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Normal,
    Continue,
    Break,
}

struct Interpreter<'p> {
    procedure: &'p Procedure,
    source: &'p dyn TableSource,
    /// Generated names are unique, so one flat scope suffices
    vars: AHashMap<String, Value>,
    pool: BufferPool,
    result: QueryResult,
}

fn borrow(column: &SharedColumn) -> DbxResult<Ref<'_, ColumnData>> {
    column
        .try_borrow()
        .map_err(|_| DbxError::execution("array is being written", "shared read"))
}

fn borrow_mut(column: &SharedColumn) -> DbxResult<RefMut<'_, ColumnData>> {
    column
        .try_borrow_mut()
        .map_err(|_| DbxError::execution("array is aliased by another operand", "exclusive write"))
}

/// Splits the `[marker], length` tail off a primitive's argument list.
struct MarkerArgs {
    marker: Marker,
    length: usize,
}

impl MarkerArgs {
    fn parse(kind: MarkerKind, args: &[Value]) -> DbxResult<Self> {
        let (marker, length) = match (kind, args) {
            (MarkerKind::None, [length]) => (Marker::None, length),
            (kind, [array, length]) if kind != MarkerKind::None => {
                let array = array.as_array()?;
                (Marker::snapshot(kind, Some(&*borrow(array)?))?, length)
            }
            _ => {
                return Err(DbxError::execution(
                    format!("{kind:?} marker arguments"),
                    format!("{} values", args.len()),
                ));
            }
        };
        Ok(Self {
            marker,
            length: length.as_index()?,
        })
    }
}

fn arity(func: &Intrinsic, args: &[Value], expected: usize) -> DbxResult<()> {
    if args.len() != expected {
        return Err(DbxError::execution(
            format!("{} takes {expected} arguments", func.name()),
            format!("got {}", args.len()),
        ));
    }
    Ok(())
}

impl Interpreter<'_> {
    fn exec_block(&mut self, stmts: &[Stmt]) -> DbxResult<Flow> {
        for stmt in stmts {
            match self.exec(stmt)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, stmt: &Stmt) -> DbxResult<Flow> {
        match stmt {
            Stmt::Declare { name, ty, init } => {
                let mut value = match init {
                    Some(init) => self.eval(init)?,
                    None => Value::Unit,
                };
                if let QueryVariableType::Scalar(t) = ty {
                    value = value.cast(*t)?;
                }
                self.vars.insert(name.clone(), value);
            }
            Stmt::Assign { target, value } => {
                let value = self.eval(value)?;
                self.assign(target, value)?;
            }
            Stmt::Eval(expr) => {
                self.eval(expr)?;
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => {
                return if self.eval(cond)?.as_bool()? {
                    self.exec_block(then_branch)
                } else {
                    self.exec_block(else_branch)
                };
            }
            Stmt::While { cond, body } => {
                while self.eval(cond)?.as_bool()? {
                    if self.exec_block(body)? == Flow::Break {
                        break;
                    }
                }
            }
            Stmt::For {
                var,
                start,
                end,
                body,
            } => {
                let start = self.eval(start)?.as_i64()?;
                let end = self.eval(end)?.as_i64()?;
                for i in start..end {
                    self.vars.insert(var.clone(), Value::Int(i as i32));
                    if self.exec_block(body)? == Flow::Break {
                        break;
                    }
                }
            }
            Stmt::Continue => return Ok(Flow::Continue),
            Stmt::Break => return Ok(Flow::Break),
            Stmt::Guarded { body, cleanup } => {
                let outcome = self.exec_block(body);
                let cleaned = self.exec_block(cleanup);
                let flow = outcome?;
                cleaned?;
                return Ok(flow);
            }
            Stmt::Comment(_) => {}
        }
        Ok(Flow::Normal)
    }

    fn assign(&mut self, target: &CodeExpr, value: Value) -> DbxResult<()> {
        match target {
            CodeExpr::Var(name) => {
                let current = self.vars.get(name).ok_or_else(|| {
                    DbxError::execution(format!("assignment to undeclared '{name}'"), format!("{value:?}"))
                })?;
                let value = value.coerce_like(current)?;
                self.vars.insert(name.clone(), value);
                Ok(())
            }
            CodeExpr::Index { array, index } => {
                let array = self.eval(array)?;
                let index = self.eval(index)?.as_index()?;
                borrow_mut(array.as_array()?)?.set(index, &value)
            }
            other => Err(DbxError::execution("invalid assignment target", other.to_string())),
        }
    }

    fn eval(&mut self, expr: &CodeExpr) -> DbxResult<Value> {
        match expr {
            CodeExpr::Var(name) => self
                .vars
                .get(name)
                .cloned()
                .ok_or_else(|| DbxError::execution(format!("undefined variable '{name}'"), "read")),
            CodeExpr::Lit(lit) => Ok(Value::from_literal(lit)),
            CodeExpr::Binary { op: BinOp::And, lhs, rhs } => {
                Ok(Value::Bool(self.eval(lhs)?.as_bool()? && self.eval(rhs)?.as_bool()?))
            }
            CodeExpr::Binary { op: BinOp::Or, lhs, rhs } => {
                Ok(Value::Bool(self.eval(lhs)?.as_bool()? || self.eval(rhs)?.as_bool()?))
            }
            CodeExpr::Binary { op, lhs, rhs } => {
                let l = self.eval(lhs)?;
                let r = self.eval(rhs)?;
                l.binary(*op, &r)
            }
            CodeExpr::Not(inner) => Ok(Value::Bool(!self.eval(inner)?.as_bool()?)),
            CodeExpr::Cast { expr, to } => self.eval(expr)?.cast(*to),
            CodeExpr::Index { array, index } => {
                let array = self.eval(array)?;
                let index = self.eval(index)?.as_index()?;
                borrow(array.as_array()?)?.get(index)
            }
            CodeExpr::Field { target, field } => match self.eval(target)? {
                Value::Map(map) => map.borrow().field(field),
                other => Err(DbxError::execution(
                    format!("field '{field}' of a {}", other.kind()),
                    expr.to_string(),
                )),
            },
            CodeExpr::Call { func, args } => {
                let args = args.iter().map(|a| self.eval(a)).collect::<DbxResult<Vec<_>>>()?;
                self.call(func, args)
            }
            CodeExpr::Method { target, method, args } => {
                let target = self.eval(target)?;
                let args = args.iter().map(|a| self.eval(a)).collect::<DbxResult<Vec<_>>>()?;
                self.method(target, *method, args)
            }
            CodeExpr::NewArray { elem, len } => {
                let len = self.eval(len)?.as_index()?;
                Ok(Value::Array(ColumnData::new(*elem, len).shared()))
            }
            CodeExpr::NewMap(type_name) => {
                let descriptor = self
                    .procedure
                    .map_types
                    .iter()
                    .find(|d| d.name == *type_name)
                    .ok_or_else(|| DbxError::execution(format!("unknown map type {type_name}"), "new"))?;
                Ok(Value::Map(Rc::new(RefCell::new(GeneratedMap::new(descriptor.clone())))))
            }
            CodeExpr::NewByteBuffer => Ok(Value::ByteBuffer(Rc::new(RefCell::new(Vec::new())))),
        }
    }

    fn method(&mut self, target: Value, method: Method, args: Vec<Value>) -> DbxResult<Value> {
        match (&target, method) {
            (Value::Reader(reader), Method::LoadNextBatch) => {
                Ok(Value::Bool(reader.borrow_mut().load_next_batch()?))
            }
            (Value::Reader(reader), Method::GetVector) => {
                let index = args
                    .first()
                    .ok_or_else(|| DbxError::execution("get_vector needs an index", "reader"))?
                    .as_index()?;
                Ok(Value::Array(reader.borrow().get_vector(index)?))
            }
            (Value::Reader(reader), Method::ValueCount) => {
                Ok(Value::Int(reader.borrow().value_count() as i32))
            }
            (Value::Array(column), Method::Len) => Ok(Value::Int(borrow(column)?.len() as i32)),
            (Value::Map(map), Method::IncrementForKey | Method::Associate | Method::GetIndex) => {
                let mut map = map.borrow_mut();
                let keys = map.key_count();
                if args.len() <= keys {
                    return Err(DbxError::execution(
                        format!("{} needs {keys} keys and a hash", method.name()),
                        format!("got {} arguments", args.len()),
                    ));
                }
                let hash = args[keys].as_i64()?;
                let (keys, rest) = args.split_at(keys);
                let values = &rest[1..];
                match method {
                    Method::IncrementForKey => map.increment_for_key(keys, hash, values).map(|_| Value::Unit),
                    Method::Associate => map.associate(keys, hash, values).map(|_| Value::Unit),
                    _ => map.get_index(keys, hash).map(Value::Int),
                }
            }
            _ => Err(DbxError::execution(
                format!("no method {} on a {}", method.name(), target.kind()),
                format!("{target:?}"),
            )),
        }
    }

    fn call(&mut self, func: &Intrinsic, args: Vec<Value>) -> DbxResult<Value> {
        match func {
            Intrinsic::OpenReader => {
                arity(func, &args, 1)?;
                let handle = args[0].as_index()?;
                let ExternalResource::TableReader {
                    table,
                    projection,
                    batch_size,
                } = self.procedure.resources.get(handle).ok_or_else(|| {
                    DbxError::execution(format!("no reader #{handle}"), self.procedure.name.clone())
                })?;
                let reader = self.source.open(table, projection, *batch_size)?;
                Ok(Value::Reader(Rc::new(RefCell::new(reader))))
            }
            Intrinsic::PreHash => {
                arity(func, &args, 1)?;
                Ok(Value::Long(pre_hash(&args[0])?))
            }
            Intrinsic::ReadBytes => {
                arity(func, &args, 3)?;
                let bytes = borrow(args[0].as_array()?)?.get(args[1].as_index()?)?;
                let Value::ByteBuffer(scratch) = &args[2] else {
                    return Err(DbxError::execution("read_bytes scratch", args[2].kind()));
                };
                let mut scratch = scratch.borrow_mut();
                scratch.clear();
                scratch.extend_from_slice(bytes.as_bytes()?);
                Ok(Value::Bytes(scratch.clone()))
            }
            Intrinsic::ExtractDate(field) => {
                arity(func, &args, 1)?;
                let days = args[0].as_i64()? as i32;
                let date = days
                    .checked_add(UNIX_EPOCH_FROM_CE)
                    .and_then(NaiveDate::from_num_days_from_ce_opt)
                    .ok_or_else(|| DbxError::execution(format!("date {days} out of range"), func.name()))?;
                Ok(Value::Int(match field {
                    DateField::Year => date.year(),
                    DateField::Month => date.month() as i32,
                    DateField::Day => date.day() as i32,
                }))
            }
            Intrinsic::AcquireBuffer(ty) => {
                arity(func, &args, 1)?;
                Ok(Value::Array(self.pool.acquire(*ty, args[0].as_index()?)))
            }
            Intrinsic::ReleaseBuffer => {
                arity(func, &args, 1)?;
                self.pool.release(args[0].as_array()?.clone())?;
                Ok(Value::Unit)
            }
            Intrinsic::VectorFilter {
                cmp,
                rhs,
                input,
                output,
            } => {
                let (lhs_arg, rest) = args.split_first().ok_or_else(|| arity_error(func))?;
                let (rhs_arg, rest) = rest.split_first().ok_or_else(|| arity_error(func))?;
                let (out, rest) = rest.split_last().ok_or_else(|| arity_error(func))?;
                let MarkerArgs { marker, length } = MarkerArgs::parse(*input, rest)?;
                let lhs = borrow(lhs_arg.as_array()?)?;
                let rhs_column;
                let rhs = match rhs {
                    OperandShape::Scalar => Operand::Scalar(rhs_arg),
                    OperandShape::Vector => {
                        rhs_column = borrow(rhs_arg.as_array()?)?;
                        Operand::Vector(&rhs_column)
                    }
                };
                let mut out = borrow_mut(out.as_array()?)?;
                let n = vector::filter(*cmp, &lhs, rhs, &marker, length, *output, &mut out)?;
                Ok(Value::Int(n as i32))
            }
            Intrinsic::VectorArith {
                op,
                lhs,
                rhs,
                marker,
                result,
            } => {
                let (lhs_arg, rest) = args.split_first().ok_or_else(|| arity_error(func))?;
                let (rhs_arg, rest) = rest.split_first().ok_or_else(|| arity_error(func))?;
                let (out, rest) = rest.split_last().ok_or_else(|| arity_error(func))?;
                let MarkerArgs { marker, length } = MarkerArgs::parse(*marker, rest)?;
                let lhs_column;
                let lhs = match lhs {
                    OperandShape::Scalar => Operand::Scalar(lhs_arg),
                    OperandShape::Vector => {
                        lhs_column = borrow(lhs_arg.as_array()?)?;
                        Operand::Vector(&lhs_column)
                    }
                };
                let rhs_column;
                let rhs = match rhs {
                    OperandShape::Scalar => Operand::Scalar(rhs_arg),
                    OperandShape::Vector => {
                        rhs_column = borrow(rhs_arg.as_array()?)?;
                        Operand::Vector(&rhs_column)
                    }
                };
                let mut out = borrow_mut(out.as_array()?)?;
                let n = vector::arith(*op, lhs, rhs, &marker, length, *result, &mut out)?;
                Ok(Value::Int(n as i32))
            }
            Intrinsic::VectorHash { marker, combine } => {
                let (vec_arg, rest) = args.split_first().ok_or_else(|| arity_error(func))?;
                let (hashes, rest) = rest.split_last().ok_or_else(|| arity_error(func))?;
                let MarkerArgs { marker, length } = MarkerArgs::parse(*marker, rest)?;
                let column = borrow(vec_arg.as_array()?)?;
                vector::hash_into(&column, &marker, length, *combine, &mut *borrow_mut(hashes.as_array()?)?)?;
                Ok(Value::Unit)
            }
            Intrinsic::VectorSum { marker } => {
                let (vec_arg, rest) = args.split_first().ok_or_else(|| arity_error(func))?;
                let MarkerArgs { marker, length } = MarkerArgs::parse(*marker, rest)?;
                vector::sum(&*borrow(vec_arg.as_array()?)?, &marker, length)
            }
            Intrinsic::VectorCount { marker } => {
                let MarkerArgs { marker, length } = MarkerArgs::parse(*marker, &args)?;
                Ok(Value::Long(vector::count_active(&marker, length)?))
            }
            Intrinsic::ValidityInit => {
                arity(func, &args, 2)?;
                vector::validity_init(&mut *borrow_mut(args[0].as_array()?)?, args[1].as_index()?)?;
                Ok(Value::Unit)
            }
            Intrinsic::ArrayCopy => {
                arity(func, &args, 4)?;
                let (src, dst) = (args[0].as_array()?, args[3].as_array()?);
                let offset = args[1].as_index()?;
                let count = args[2].as_index()?;
                if Rc::ptr_eq(src, dst) && offset == 0 {
                    return Ok(Value::Unit);
                }
                vector::array_copy(&*borrow(src)?, offset, count, &mut *borrow_mut(dst)?)?;
                Ok(Value::Unit)
            }
            Intrinsic::SimdLoad { .. } => {
                arity(func, &args, 4)?;
                vector::simd_load(
                    &*borrow(args[0].as_array()?)?,
                    args[1].as_index()?,
                    args[2].as_index()?,
                    &mut *borrow_mut(args[3].as_array()?)?,
                )?;
                Ok(Value::Unit)
            }
            Intrinsic::SimdCompare { cmp, .. } => {
                arity(func, &args, 4)?;
                vector::simd_compare(
                    *cmp,
                    &*borrow(args[0].as_array()?)?,
                    &args[1],
                    args[2].as_index()?,
                    &mut *borrow_mut(args[3].as_array()?)?,
                )?;
                Ok(Value::Unit)
            }
            Intrinsic::SimdMaskStore => {
                arity(func, &args, 4)?;
                vector::simd_mask_store(
                    &*borrow(args[0].as_array()?)?,
                    args[1].as_index()?,
                    args[2].as_index()?,
                    &mut *borrow_mut(args[3].as_array()?)?,
                )?;
                Ok(Value::Unit)
            }
            Intrinsic::EmitRow => {
                let row = self.output_row(func, &args)?;
                self.result.rows.push(row);
                Ok(Value::Unit)
            }
            Intrinsic::PrintRow => {
                let row = self.output_row(func, &args)?;
                let line = row.iter().map(ToString::to_string).collect::<Vec<_>>().join(" | ");
                self.result.printed.push(line);
                Ok(Value::Unit)
            }
            Intrinsic::EmitCount => {
                arity(func, &args, 1)?;
                self.result.count = Some(args[0].as_i64()?);
                Ok(Value::Unit)
            }
        }
    }

    fn output_row(&self, func: &Intrinsic, args: &[Value]) -> DbxResult<Vec<ScalarValue>> {
        arity(func, args, self.procedure.output_types.len())?;
        args.iter()
            .zip(&self.procedure.output_types)
            .map(|(value, ty)| value.to_scalar(*ty))
            .collect()
    }
}

fn arity_error(func: &Intrinsic) -> DbxError {
    DbxError::execution(format!("too few arguments to {}", func.name()), "call")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::ir::Literal;
    use crate::codegen::operators::ProductionStyle;
    use crate::codegen::types::LogicalType;
    use crate::runtime::reader::MemoryCatalog;

    fn procedure(body: Vec<Stmt>, output_types: Vec<LogicalType>) -> Procedure {
        Procedure {
            name: "test".to_string(),
            style: ProductionStyle::NonVectorised,
            resources: Vec::new(),
            map_types: Vec::new(),
            globals: Vec::new(),
            body,
            output_types,
        }
    }

    fn int() -> QueryVariableType {
        QueryVariableType::Scalar(LogicalType::Int)
    }

    #[test]
    fn test_loops_continue_and_break() {
        // for i in 0..10 { if i == 2 { continue } if i == 5 { break } emit(i) }
        let body = vec![Stmt::for_range(
            "i",
            CodeExpr::int(0),
            CodeExpr::int(10),
            vec![
                Stmt::if_then(CodeExpr::var("i").eq(CodeExpr::int(2)), vec![Stmt::Continue]),
                Stmt::if_then(CodeExpr::var("i").eq(CodeExpr::int(5)), vec![Stmt::Break]),
                Stmt::eval(CodeExpr::call(Intrinsic::EmitRow, vec![CodeExpr::var("i")])),
            ],
        )];
        let result = execute(&procedure(body, vec![LogicalType::Int]), &MemoryCatalog::new()).unwrap();
        let seen: Vec<_> = result.rows.iter().map(|r| r[0].clone()).collect();
        assert_eq!(
            seen,
            vec![ScalarValue::Int32(0), ScalarValue::Int32(1), ScalarValue::Int32(3), ScalarValue::Int32(4)]
        );
    }

    #[test]
    fn test_assignment_keeps_declared_type() {
        let body = vec![
            Stmt::declare("acc", QueryVariableType::Scalar(LogicalType::Long), CodeExpr::int(1)),
            Stmt::increment("acc", CodeExpr::int(2)),
            Stmt::eval(CodeExpr::call(Intrinsic::EmitCount, vec![CodeExpr::var("acc")])),
        ];
        let result = execute(&procedure(body, vec![]), &MemoryCatalog::new()).unwrap();
        assert_eq!(result.count, Some(3));
    }

    #[test]
    fn test_guarded_cleanup_runs_on_error() {
        let acquire = CodeExpr::call(Intrinsic::AcquireBuffer(LogicalType::Int), vec![CodeExpr::int(4)]);
        let body = vec![
            Stmt::declare("buf", QueryVariableType::RawArray(LogicalType::Int), acquire),
            Stmt::guarded(
                vec![Stmt::declare("bad", int(), CodeExpr::var("buf").index(CodeExpr::int(9)))],
                vec![Stmt::eval(CodeExpr::call(Intrinsic::ReleaseBuffer, vec![CodeExpr::var("buf")]))],
            ),
        ];
        let proc = procedure(body, vec![]);
        let catalog = MemoryCatalog::new();
        let mut interpreter = Interpreter {
            procedure: &proc,
            source: &catalog,
            vars: AHashMap::new(),
            pool: BufferPool::new(),
            result: QueryResult::default(),
        };
        assert!(interpreter.exec_block(&proc.body).is_err());
        assert_eq!(interpreter.pool.stats().outstanding, 0);
    }

    #[test]
    fn test_extract_date_fields() {
        // 2024-02-29
        let days = NaiveDate::from_ymd_opt(2024, 2, 29)
            .unwrap()
            .signed_duration_since(NaiveDate::from_ymd_opt(1970, 1, 1).unwrap())
            .num_days() as i32;
        let date = CodeExpr::Lit(Literal::Date(days));
        let body = vec![Stmt::eval(CodeExpr::call(
            Intrinsic::EmitRow,
            vec![
                CodeExpr::call(Intrinsic::ExtractDate(DateField::Year), vec![date.clone()]),
                CodeExpr::call(Intrinsic::ExtractDate(DateField::Month), vec![date.clone()]),
                CodeExpr::call(Intrinsic::ExtractDate(DateField::Day), vec![date]),
            ],
        ))];
        let types = vec![LogicalType::Int; 3];
        let result = execute(&procedure(body, types), &MemoryCatalog::new()).unwrap();
        assert_eq!(
            result.rows,
            vec![vec![ScalarValue::Int32(2024), ScalarValue::Int32(2), ScalarValue::Int32(29)]]
        );
    }

    #[test]
    fn test_undefined_variable_and_bad_handle() {
        let body = vec![Stmt::eval(CodeExpr::var("missing"))];
        assert!(execute(&procedure(body, vec![]), &MemoryCatalog::new()).is_err());

        let body = vec![Stmt::eval(CodeExpr::call(Intrinsic::OpenReader, vec![CodeExpr::int(0)]))];
        assert!(execute(&procedure(body, vec![]), &MemoryCatalog::new()).is_err());
    }
}
