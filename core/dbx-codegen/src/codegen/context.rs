//! GenerationContext: per-compilation state shared by all operators
//!
//! Holds the name generator, the ordinal-mapping stack, external resources,
//! query-global variables, allocation scopes and generated map types. Scoped
//! helpers pop what they push on every return path, errors included.

use crate::codegen::access_path::OrdinalMapping;
use crate::codegen::hash_map::MapDescriptor;
use crate::codegen::ir::{CodeExpr, Intrinsic, Stmt};
use crate::codegen::types::{LogicalType, QueryVariableType};
use crate::config::CodegenConfig;
use crate::error::{DbxError, DbxResult};
use crate::logging::TARGET;
use ahash::AHashMap;
use std::sync::Arc;
use tracing::trace;

/// External resource the emitted procedure receives by integer handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalResource {
    TableReader {
        table: String,
        projection: Vec<usize>,
        batch_size: usize,
    },
}

/// Variable declared once at the top of the procedure.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryGlobal {
    pub name: String,
    pub ty: QueryVariableType,
    pub init: CodeExpr,
}

/// Acquire prologue and release epilogue collected by one allocation scope.
#[derive(Debug, Default)]
pub struct ScopeCode {
    pub prologue: Vec<Stmt>,
    pub epilogue: Vec<Stmt>,
}

impl ScopeCode {
    /// `prologue; guarded { body } finally { epilogue }`
    pub fn wrap(self, body: Vec<Stmt>) -> Vec<Stmt> {
        let mut stmts = self.prologue;
        stmts.push(Stmt::guarded(body, self.epilogue));
        stmts
    }
}

/// Everything the context accumulated, handed to the procedure.
#[derive(Debug)]
pub struct ContextOutput {
    pub resources: Vec<ExternalResource>,
    pub globals: Vec<QueryGlobal>,
    pub map_types: Vec<Arc<MapDescriptor>>,
}

/// 코드 생성 컨텍스트
pub struct GenerationContext {
    config: CodegenConfig,
    next_id: usize,
    mappings: Vec<OrdinalMapping>,
    resources: Vec<ExternalResource>,
    globals: Vec<QueryGlobal>,
    global_keys: AHashMap<String, usize>,
    scopes: Vec<ScopeCode>,
    map_types: Vec<Arc<MapDescriptor>>,
}

impl GenerationContext {
    pub fn new(config: CodegenConfig) -> Self {
        Self {
            config,
            next_id: 0,
            mappings: Vec::new(),
            resources: Vec::new(),
            globals: Vec::new(),
            global_keys: AHashMap::new(),
            scopes: Vec::new(),
            map_types: Vec::new(),
        }
    }

    pub fn config(&self) -> &CodegenConfig {
        &self.config
    }

    /// Output batch capacity as a code literal; must fit the `Int` index type.
    pub fn capacity_expr(&self) -> DbxResult<CodeExpr> {
        let capacity = i32::try_from(self.config.vector_capacity).map_err(|_| {
            DbxError::Config(format!(
                "vector_capacity {} exceeds the i32 index range",
                self.config.vector_capacity
            ))
        })?;
        Ok(CodeExpr::int(capacity))
    }

    /// Globally unique variable name `prefix_N`.
    pub fn fresh(&mut self, prefix: &str) -> String {
        let id = self.next_id;
        self.next_id += 1;
        format!("{prefix}_{id}")
    }

    // ===== Ordinal mapping stack =====

    pub fn current_mapping(&self) -> DbxResult<&OrdinalMapping> {
        self.mappings.last().ok_or_else(|| {
            DbxError::invariant("GenerationContext", "consume called with no active mapping")
        })
    }

    pub fn mapping_depth(&self) -> usize {
        self.mappings.len()
    }

    /// Run `f` with `mapping` on top of the stack; popped on every return.
    pub fn with_mapping<T, F>(&mut self, mapping: OrdinalMapping, f: F) -> DbxResult<T>
    where
        F: FnOnce(&mut Self) -> DbxResult<T>,
    {
        trace!(target: TARGET, depth = self.mappings.len(), columns = mapping.len(), "push mapping");
        self.mappings.push(mapping);
        let result = f(self);
        self.mappings.pop();
        trace!(target: TARGET, depth = self.mappings.len(), "pop mapping");
        result
    }

    // ===== Resources and globals =====

    /// Register a table reader; returns its handle.
    pub fn register_reader(&mut self, table: &str, projection: &[usize], batch_size: usize) -> usize {
        self.resources.push(ExternalResource::TableReader {
            table: table.to_string(),
            projection: projection.to_vec(),
            batch_size,
        });
        self.resources.len() - 1
    }

    /// Query-global variable shared by every request with the same `key`.
    pub fn query_global(&mut self, key: &str, ty: QueryVariableType, init: CodeExpr) -> String {
        if let Some(&idx) = self.global_keys.get(key) {
            return self.globals[idx].name.clone();
        }
        let name = self.fresh(key);
        self.global_keys.insert(key.to_string(), self.globals.len());
        self.globals.push(QueryGlobal {
            name: name.clone(),
            ty,
            init,
        });
        name
    }

    /// Assign a unique type name and register the map type.
    pub fn register_map_type(&mut self, mut descriptor: MapDescriptor) -> Arc<MapDescriptor> {
        descriptor.name = format!("{}{}", descriptor.type_prefix(), self.map_types.len());
        let descriptor = Arc::new(descriptor);
        self.map_types.push(descriptor.clone());
        descriptor
    }

    // ===== Allocation scopes =====

    /// Run `f` inside a fresh allocation scope; the scope is closed on every
    /// return and its code handed back with `f`'s result.
    pub fn with_allocation_scope<T, F>(&mut self, f: F) -> DbxResult<(T, ScopeCode)>
    where
        F: FnOnce(&mut Self) -> DbxResult<T>,
    {
        self.scopes.push(ScopeCode::default());
        let result = f(self);
        let scope = self.scopes.pop().ok_or_else(|| {
            DbxError::invariant("GenerationContext", "allocation scope stack underflow")
        })?;
        Ok((result?, scope))
    }

    pub fn allocation_depth(&self) -> usize {
        self.scopes.len()
    }

    /// Buffer of `vector_capacity` elements acquired before the innermost row
    /// source's loop and released after it.
    pub fn acquire_scan_buffer(&mut self, prefix: &str, ty: LogicalType) -> DbxResult<String> {
        let capacity = self.capacity_expr()?;
        let name = self.fresh(prefix);
        let scope = self.scopes.last_mut().ok_or_else(|| {
            DbxError::invariant(
                "GenerationContext",
                format!("buffer '{name}' requested outside any row source"),
            )
        })?;
        scope.prologue.push(Stmt::declare(
            &name,
            QueryVariableType::RawArray(ty),
            CodeExpr::call(Intrinsic::AcquireBuffer(ty), vec![capacity]),
        ));
        scope.epilogue.push(Stmt::eval(CodeExpr::call(
            Intrinsic::ReleaseBuffer,
            vec![CodeExpr::var(&name)],
        )));
        Ok(name)
    }

    pub fn finish(self) -> ContextOutput {
        ContextOutput {
            resources: self.resources,
            globals: self.globals,
            map_types: self.map_types,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::access_path::AccessPath;

    #[test]
    fn test_fresh_names_are_unique() {
        let mut ctx = GenerationContext::new(CodegenConfig::default());
        let a = ctx.fresh("row");
        let b = ctx.fresh("row");
        let c = ctx.fresh("vec");
        assert_ne!(a, b);
        assert_eq!(c, "vec_2");
    }

    #[test]
    fn test_with_mapping_pops_on_error() {
        let mut ctx = GenerationContext::new(CodegenConfig::default());
        let mapping: OrdinalMapping = [AccessPath::scalar("x", LogicalType::Int)]
            .into_iter()
            .collect();
        let result: DbxResult<()> = ctx.with_mapping(mapping, |ctx| {
            assert_eq!(ctx.current_mapping()?.len(), 1);
            Err(DbxError::unsupported("Test", "boom"))
        });
        assert!(result.is_err());
        assert_eq!(ctx.mapping_depth(), 0);
        assert!(ctx.current_mapping().is_err());
    }

    #[test]
    fn test_query_global_is_reused_by_key() {
        let mut ctx = GenerationContext::new(CodegenConfig::default());
        let a = ctx.query_global("scratch", QueryVariableType::ByteBuffer, CodeExpr::NewByteBuffer);
        let b = ctx.query_global("scratch", QueryVariableType::ByteBuffer, CodeExpr::NewByteBuffer);
        assert_eq!(a, b);
        assert_eq!(ctx.finish().globals.len(), 1);
    }

    #[test]
    fn test_allocation_scope_balances_acquire_and_release() {
        let mut ctx = GenerationContext::new(CodegenConfig::default().with_vector_capacity(32));
        assert!(ctx.acquire_scan_buffer("sel", LogicalType::Int).is_err());

        let (name, scope) = ctx
            .with_allocation_scope(|ctx| ctx.acquire_scan_buffer("sel", LogicalType::Int))
            .unwrap();
        assert_eq!(scope.prologue.len(), 1);
        assert_eq!(scope.epilogue.len(), 1);
        assert!(matches!(&scope.prologue[0], Stmt::Declare { name: n, .. } if *n == name));
        assert_eq!(ctx.allocation_depth(), 0);

        let failed: DbxResult<((), ScopeCode)> =
            ctx.with_allocation_scope(|_| Err(DbxError::unsupported("Test", "boom")));
        assert!(failed.is_err());
        assert_eq!(ctx.allocation_depth(), 0);
    }

    #[test]
    fn test_capacity_beyond_int_range_is_config_error() {
        let ctx = GenerationContext::new(CodegenConfig::default().with_vector_capacity(1024));
        assert_eq!(ctx.capacity_expr().unwrap(), CodeExpr::int(1024));

        let oversized = i32::MAX as usize + 1;
        let mut ctx = GenerationContext::new(CodegenConfig::default().with_vector_capacity(oversized));
        assert!(matches!(ctx.capacity_expr().unwrap_err(), DbxError::Config(_)));
        let failed = ctx.with_allocation_scope(|ctx| ctx.acquire_scan_buffer("sel", LogicalType::Int));
        assert!(matches!(failed.unwrap_err(), DbxError::Config(_)));
        assert_eq!(ctx.allocation_depth(), 0);
    }

    #[test]
    fn test_map_type_names() {
        let mut ctx = GenerationContext::new(CodegenConfig::default());
        let a = ctx.register_map_type(MapDescriptor::aggregation(vec![LogicalType::Int], vec![]));
        let j = ctx.register_map_type(MapDescriptor::join(LogicalType::Long, vec![]));
        assert_eq!(a.name, "AggMap0");
        assert_eq!(j.name, "JoinMap1");
    }
}
