//! The two-sided per-connection block shared by both direction FCBs.

use crate::conn::state::TcpState;
use crate::errors::Error;
use crate::memory::mempool::Mempool;
use crate::stream::maintainer::ByteStreamMaintainer;
use crate::utils::sync::{SpinGuard, SpinLock};

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Default capacity of the shared-block pool.
pub(crate) const TCP_COMMON_POOL_SIZE: usize = 16_384;

/// Fields of the shared block that both directions mutate.
#[derive(Debug, Default)]
pub(crate) struct TcpCommonInner {
    /// One maintainer for each direction of the connection.
    pub(crate) maintainers: [ByteStreamMaintainer; 2],
    /// Highest cumulative ACK observed per direction.
    pub(crate) last_ack_received: [Option<u32>; 2],
}

/// Common structure accessed by both sides of a TCP connection.
///
/// The state byte is readable lock-free on fast paths; the value may be
/// stale, and any action depending on it must re-read through the guard.
/// All other fields live behind the spinlock. Both direction FCBs hold a
/// strong reference; the reverse-tuple index holds a weak one, upgraded when
/// the SYN/ACK arrives. The Arc strong count is therefore the `use_count` of
/// the connection, and the block returns to its pool exactly once, when the
/// last holder releases it.
pub struct TcpCommon {
    state: AtomicU8,
    inner: SpinLock<TcpCommonInner>,
}

impl TcpCommon {
    fn new() -> Self {
        TcpCommon {
            state: AtomicU8::new(TcpState::Closed as u8),
            inner: SpinLock::new(TcpCommonInner::default()),
        }
    }

    /// Fast-path state read; may observe a stale value.
    pub fn state(&self) -> TcpState {
        TcpState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// Acquires the block. The returned guard is the token helpers take, so
    /// lock nesting cannot be written.
    pub(crate) fn lock(&self) -> CommonGuard<'_> {
        CommonGuard {
            state: &self.state,
            inner: self.inner.lock(),
        }
    }
}

/// Locked view of a [`TcpCommon`].
pub(crate) struct CommonGuard<'a> {
    state: &'a AtomicU8,
    inner: SpinGuard<'a, TcpCommonInner>,
}

impl CommonGuard<'_> {
    /// Authoritative state read under the lock.
    pub(crate) fn state(&self) -> TcpState {
        TcpState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub(crate) fn set_state(&mut self, state: TcpState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// Resets both maintainers and the ACK history for a reused socket.
    /// The caller decides the new state.
    pub(crate) fn reinit(&mut self) {
        self.inner.maintainers[0].reinit();
        self.inner.maintainers[1].reinit();
        self.inner.last_ack_received = [None, None];
    }
}

impl Deref for CommonGuard<'_> {
    type Target = TcpCommonInner;

    fn deref(&self) -> &TcpCommonInner {
        &self.inner
    }
}

impl DerefMut for CommonGuard<'_> {
    fn deref_mut(&mut self) -> &mut TcpCommonInner {
        &mut self.inner
    }
}

/// Fixed-capacity pool of shared blocks.
pub(crate) struct CommonPool {
    pool: Mempool<Arc<TcpCommon>>,
}

impl CommonPool {
    pub(crate) fn new(capacity: usize) -> Self {
        CommonPool {
            pool: Mempool::new(capacity, || Arc::new(TcpCommon::new())),
        }
    }

    /// Takes a block out of the pool, reinitialized and marked closed.
    pub(crate) fn allocate(&mut self) -> Result<Arc<TcpCommon>, Error> {
        let common = self
            .pool
            .allocate()
            .map_err(|_| Error::ResourceExhausted("tcp common pool empty"))?;
        debug_assert_eq!(Arc::strong_count(&common), 1);
        let mut guard = common.lock();
        guard.reinit();
        guard.set_state(TcpState::Closed);
        drop(guard);
        Ok(common)
    }

    /// Releases one holder's reference. The last holder returns the block to
    /// the pool; everyone else just drops their reference.
    pub(crate) fn release(&mut self, common: Arc<TcpCommon>) {
        if Arc::strong_count(&common) == 1 {
            self.pool.release(common);
        }
    }

    /// Number of blocks currently out of the pool.
    pub(crate) fn outstanding(&self) -> usize {
        self.pool.outstanding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_common_state_roundtrip() {
        let mut pool = CommonPool::new(4);
        let common = pool.allocate().unwrap();
        assert_eq!(common.state(), TcpState::Closed);

        let mut guard = common.lock();
        guard.set_state(TcpState::Establishing1);
        guard.maintainers[0].window_size = 512;
        guard.last_ack_received[1] = Some(42);
        drop(guard);

        assert_eq!(common.state(), TcpState::Establishing1);
        let guard = common.lock();
        assert_eq!(guard.state(), TcpState::Establishing1);
        assert_eq!(guard.maintainers[0].window_size, 512);
        assert_eq!(guard.last_ack_received[1], Some(42));
    }

    #[test]
    fn core_common_pool_recycles_once() {
        let mut pool = CommonPool::new(1);
        let first = pool.allocate().unwrap();
        let second = first.clone();
        assert!(pool.allocate().is_err());
        assert_eq!(pool.outstanding(), 1);

        // First release only drops one of the two references.
        pool.release(first);
        assert!(pool.allocate().is_err());

        // Last holder returns the block to the pool.
        pool.release(second);
        assert_eq!(pool.outstanding(), 0);
        assert!(pool.allocate().is_ok());
    }
}
