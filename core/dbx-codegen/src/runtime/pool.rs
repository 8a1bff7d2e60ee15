//! Pooling allocator behind `pool.acquire` / `pool.release`

use crate::codegen::types::LogicalType;
use crate::error::{DbxError, DbxResult};
use crate::runtime::value::{ColumnData, SharedColumn};
use crate::logging::TARGET;
use ahash::AHashMap;
use serde::Serialize;
use tracing::trace;

/// Acquire/release counters of one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub acquired: usize,
    pub released: usize,
    /// Buffers handed out and not yet returned
    pub outstanding: usize,
}

/// 버퍼 풀 — 타입별 free list
#[derive(Debug, Default)]
pub struct BufferPool {
    free: AHashMap<LogicalType, Vec<SharedColumn>>,
    stats: PoolStats,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer of `capacity` elements of `ty`, reused when one is free.
    pub fn acquire(&mut self, ty: LogicalType, capacity: usize) -> SharedColumn {
        self.stats.acquired += 1;
        self.stats.outstanding += 1;
        let reused = self.free.get_mut(&ty).and_then(Vec::pop);
        match reused {
            Some(buffer) => {
                let len = buffer.borrow().len();
                if len != capacity {
                    *buffer.borrow_mut() = ColumnData::new(ty, capacity);
                }
                trace!(target: TARGET, %ty, capacity, "pool reuse");
                buffer
            }
            None => {
                trace!(target: TARGET, %ty, capacity, "pool allocate");
                ColumnData::new(ty, capacity).shared()
            }
        }
    }

    pub fn release(&mut self, buffer: SharedColumn) -> DbxResult<()> {
        if self.stats.outstanding == 0 {
            return Err(DbxError::execution(
                "buffer released twice",
                "pool has no outstanding buffers",
            ));
        }
        self.stats.released += 1;
        self.stats.outstanding -= 1;
        let ty = buffer.borrow().logical_type();
        self.free.entry(ty).or_default().push(buffer);
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn test_release_makes_buffer_reusable() {
        let mut pool = BufferPool::new();
        let a = pool.acquire(LogicalType::Int, 4);
        pool.release(a.clone()).unwrap();
        let b = pool.acquire(LogicalType::Int, 4);
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(
            pool.stats(),
            PoolStats {
                acquired: 2,
                released: 1,
                outstanding: 1
            }
        );
    }

    #[test]
    fn test_unbalanced_release_fails() {
        let mut pool = BufferPool::new();
        let stray = ColumnData::new(LogicalType::Long, 1).shared();
        assert!(pool.release(stray).is_err());
    }
}
