//! Fixed-capacity object pools for per-flow state.
//!
//! Per-flow structures are recycled through pools with a hard capacity so a
//! flood of connection attempts degrades into flow-creation failures instead
//! of unbounded allocation. One pool is kept per structure type.

use std::fmt;

use thiserror::Error;

/// A free-list pool handing out recycled `T` instances up to a fixed capacity.
pub(crate) struct Mempool<T> {
    free: Vec<T>,
    capacity: usize,
    outstanding: usize,
}

impl<T> Mempool<T> {
    /// Creates a pool of `capacity` objects built by `init`.
    pub(crate) fn new(capacity: usize, init: impl Fn() -> T) -> Self {
        let mut free = Vec::with_capacity(capacity);
        free.resize_with(capacity, init);
        Mempool {
            free,
            capacity,
            outstanding: 0,
        }
    }

    /// Takes an object from the pool.
    pub(crate) fn allocate(&mut self) -> Result<T, MempoolError> {
        match self.free.pop() {
            Some(obj) => {
                self.outstanding += 1;
                Ok(obj)
            }
            None => Err(MempoolError::Exhausted),
        }
    }

    /// Returns an object to the pool.
    pub(crate) fn release(&mut self, obj: T) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.free.len() < self.capacity {
            self.free.push(obj);
        }
    }

    /// Number of objects currently handed out.
    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding
    }
}

impl<T> fmt::Debug for Mempool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mempool")
            .field("capacity", &self.capacity)
            .field("free", &self.free.len())
            .field("outstanding", &self.outstanding)
            .finish()
    }
}

#[derive(Error, Debug)]
pub enum MempoolError {
    #[error("Object allocation failed: mempool exhausted.")]
    Exhausted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_mempool_exhaustion() {
        let mut pool: Mempool<u32> = Mempool::new(2, || 0);
        let a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        assert!(matches!(pool.allocate(), Err(MempoolError::Exhausted)));
        pool.release(a);
        assert!(pool.allocate().is_ok());
    }
}
