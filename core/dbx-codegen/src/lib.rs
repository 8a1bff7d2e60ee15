//! # DBX Codegen — Produce/Consume Query Code Generation
//!
//! 논리 플랜을 하나의 특화된 프로시저로 컴파일합니다. Operators hand rows or
//! column batches to their parent through continuation callbacks, so the
//! whole pipeline between two blocking operators fuses into one loop nest.
//!
//! ## 주요 특징
//!
//! - **Two production styles**: row-at-a-time and vectorised, negotiated per
//!   query with automatic fallback
//! - **Filter markers**: selection vectors or validity masks, with optional
//!   SIMD lane-group comparison
//! - **Generated hash maps**: per-query map types for GROUP BY and hash joins
//! - **Pooled buffers**: every scan-scoped buffer is released on every exit
//! - **Reference executor**: runs emitted procedures over in-memory Arrow
//!   batches or Parquet files
//!
//! ## 빠른 시작
//!
//! ```rust
//! use std::sync::Arc;
//! use arrow::array::Int32Array;
//! use arrow::datatypes::{DataType, Field, Schema};
//! use arrow::record_batch::RecordBatch;
//! use dbx_codegen::plan::{BinaryOperator, Expr, LogicalPlan, ScalarValue};
//! use dbx_codegen::runtime::MemoryCatalog;
//! use dbx_codegen::{CodegenConfig, QueryCompiler, QueryOutput};
//!
//! # fn main() -> dbx_codegen::DbxResult<()> {
//! let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Int32, false)]));
//! let batch = RecordBatch::try_new(schema.clone(), vec![Arc::new(Int32Array::from(vec![1, 2, 3]))])?;
//! let mut catalog = MemoryCatalog::new();
//! catalog.register("t", schema.clone(), vec![batch])?;
//!
//! // SELECT COUNT(*) FROM t WHERE x > 1
//! let plan = LogicalPlan::scan("t", schema, vec![0]).filter(Expr::binary(
//!     Expr::col(0),
//!     BinaryOperator::Gt,
//!     Expr::lit(ScalarValue::Int32(1)),
//! ));
//! let procedure = QueryCompiler::new(CodegenConfig::default()).compile(&plan, QueryOutput::Count)?;
//! let result = dbx_codegen::exec::execute(&procedure, &catalog)?;
//! assert_eq!(result.count, Some(2));
//! # Ok(())
//! # }
//! ```
//!
//! ## 모듈 구조
//!
//! - [`plan`] — logical plan and expressions
//! - [`codegen`] — operators, generation context, emitted code tree
//! - [`runtime`] — values, batch primitives, buffer pool, generated maps, readers
//! - [`exec`] — reference executor for emitted procedures
//! - [`config`] — paradigm, filter policy, vector capacity, SIMD

pub mod codegen;
pub mod config;
pub mod error;
pub mod exec;
pub mod plan;
pub mod runtime;

// Logging utilities
pub mod logging;

// Re-export commonly used types
pub use codegen::{Procedure, QueryCompiler, QueryOutput};
pub use config::CodegenConfig;
pub use error::{DbxError, DbxResult};
