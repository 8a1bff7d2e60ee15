//! Run-time library of generated procedures
//!
//! Column values, the pre-hash, batch primitives, the pooling allocator,
//! generated maps and table readers. The reference executor in
//! [`crate::exec`] binds the intrinsics of emitted code to these.

pub mod hash;
pub mod map;
pub mod pool;
pub mod reader;
pub mod value;
pub mod vector;

pub use map::GeneratedMap;
pub use pool::{BufferPool, PoolStats};
pub use reader::{MemoryCatalog, ParquetCatalog, TableReader, TableSource};
pub use value::{ColumnData, SharedColumn, Value};
