//! Mempool API: creation and release of the shared packet-buffer pool.

use crate::error::HalResult;
use crate::mempool::{Mempool, PoolParams};

/// Packet-buffer pool operations.
pub trait MempoolApi: Send + Sync {
    /// Allocates a pool of `params.count` buffers.
    fn pool_create(&self, params: &PoolParams) -> HalResult<Mempool>;

    /// Releases the pool's backing memory.
    ///
    /// Fails with `InvalidState` while buffers are still checked out.
    fn pool_free(&self, pool: &Mempool) -> HalResult<()>;
}
