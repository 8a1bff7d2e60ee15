//! Compiled query procedure
//!
//! The output of [`QueryCompiler::compile`](crate::codegen::compiler::QueryCompiler::compile):
//! the statement tree plus everything it refers to from outside (table
//! readers by handle, generated map types, query-global variables).

use crate::codegen::context::{ExternalResource, QueryGlobal};
use crate::codegen::hash_map::MapDescriptor;
use crate::codegen::ir::{Intrinsic, Stmt, count_calls, render_block};
use crate::codegen::operators::ProductionStyle;
use crate::codegen::types::LogicalType;
use std::fmt;
use std::fmt::Write;
use std::sync::Arc;

/// 생성된 쿼리 프로시저
#[derive(Debug)]
pub struct Procedure {
    pub name: String,
    pub style: ProductionStyle,
    pub resources: Vec<ExternalResource>,
    pub map_types: Vec<Arc<MapDescriptor>>,
    pub globals: Vec<QueryGlobal>,
    pub body: Vec<Stmt>,
    /// Column types of the emitted rows
    pub output_types: Vec<LogicalType>,
}

impl Procedure {
    /// Rendered source: map types, then the procedure itself.
    pub fn render(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = self.render_into(&mut out);
        out
    }

    fn render_into(&self, out: &mut String) -> fmt::Result {
        for map in &self.map_types {
            out.push_str(&map.render());
            writeln!(out)?;
        }
        writeln!(out, "// {} code", self.style)?;
        for (handle, resource) in self.resources.iter().enumerate() {
            let ExternalResource::TableReader {
                table,
                projection,
                batch_size,
            } = resource;
            writeln!(
                out,
                "// reader #{handle}: '{table}' columns {projection:?}, batches of {batch_size}"
            )?;
        }
        writeln!(out, "fn {}(readers: &[TableReader], pool: &mut BufferPool, out: &mut Output) {{", self.name)?;
        let globals: Vec<Stmt> = self
            .globals
            .iter()
            .map(|g| Stmt::declare(&g.name, g.ty.clone(), g.init.clone()))
            .collect();
        render_block(&globals, 1, out);
        render_block(&self.body, 1, out);
        writeln!(out, "}}")
    }

    /// Number of pooled-buffer acquisitions in the emitted code.
    pub fn acquire_count(&self) -> usize {
        count_calls(&self.body, |call| matches!(call, Intrinsic::AcquireBuffer(_)))
    }

    /// Number of pooled-buffer releases in the emitted code.
    pub fn release_count(&self) -> usize {
        count_calls(&self.body, |call| matches!(call, Intrinsic::ReleaseBuffer))
    }

    /// Number of calls matching `pred` anywhere in the body.
    pub fn count_calls(&self, pred: impl Fn(&Intrinsic) -> bool) -> usize {
        count_calls(&self.body, pred)
    }
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}
