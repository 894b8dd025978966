//! Shared packet-buffer pool.
//!
//! One [`Mempool`] is created at startup and shared by every port and queue.
//! Buffers are checked out as [`Mbuf`]s and return to the pool when dropped,
//! so an unsent packet is freed simply by letting it go out of scope.
//! Checkout and return are lock-free and safe for concurrent callers.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use offload_types::SocketId;

use crate::error::{HalError, HalResult, HalStatus};
use crate::types::MempoolOid;

/// Default data room of a packet buffer (2048 bytes plus headroom).
pub const DEFAULT_DATA_ROOM: u16 = 2048 + 128;

/// Parameters for creating a packet-buffer pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolParams {
    /// Pool name, unique per process.
    pub name: String,
    /// Number of buffers.
    pub count: usize,
    /// Per-core cache size.
    pub cache_size: u32,
    /// Private area size per buffer.
    pub priv_size: u16,
    /// Data room (payload capacity) per buffer.
    pub data_room: u16,
    /// NUMA socket hint.
    pub socket: SocketId,
}

impl Default for PoolParams {
    fn default() -> Self {
        Self {
            name: "mbuf_pool".to_string(),
            count: 40960,
            cache_size: 128,
            priv_size: 0,
            data_room: DEFAULT_DATA_ROOM,
            socket: SocketId::ANY,
        }
    }
}

struct PoolInner {
    oid: MempoolOid,
    params: PoolParams,
    in_use: AtomicUsize,
}

/// A fixed-size, process-wide packet-buffer pool.
///
/// Cloning is cheap and yields another handle to the same pool.
#[derive(Clone)]
pub struct Mempool {
    inner: Arc<PoolInner>,
}

impl Mempool {
    /// Wraps a driver-allocated pool.
    pub fn new(oid: MempoolOid, params: PoolParams) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                oid,
                params,
                in_use: AtomicUsize::new(0),
            }),
        }
    }

    /// Returns the pool object ID.
    pub fn oid(&self) -> MempoolOid {
        self.inner.oid
    }

    /// Returns the pool name.
    pub fn name(&self) -> &str {
        &self.inner.params.name
    }

    /// Returns the parameters the pool was created with.
    pub fn params(&self) -> &PoolParams {
        &self.inner.params
    }

    /// Returns the total number of buffers.
    pub fn capacity(&self) -> usize {
        self.inner.params.count
    }

    /// Returns the number of buffers currently checked out.
    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::Acquire)
    }

    /// Returns the number of free buffers.
    pub fn available(&self) -> usize {
        self.capacity().saturating_sub(self.in_use())
    }

    /// Checks out one buffer and copies `frame` into it.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` if the frame does not fit the data room, and a
    /// retryable `NoMemory` status if the pool is exhausted.
    pub fn alloc(&self, frame: &[u8]) -> HalResult<Mbuf> {
        if frame.len() > usize::from(self.inner.params.data_room) {
            return Err(HalError::invalid_parameter(format!(
                "frame of {} bytes exceeds data room {}",
                frame.len(),
                self.inner.params.data_room
            )));
        }

        let capacity = self.inner.params.count;
        self.inner
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            })
            .map_err(|_| HalError::from_status(HalStatus::NoMemory))?;

        Ok(Mbuf {
            data: frame.to_vec(),
            offload: RxOffloadInfo::default(),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Returns true if both handles refer to the same pool.
    pub fn same_pool(&self, other: &Mempool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Mempool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mempool")
            .field("oid", &self.inner.oid)
            .field("name", &self.inner.params.name)
            .field("capacity", &self.capacity())
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// Flow-director match reported by the NIC for a received packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdirMatch {
    /// A rule's MARK id.
    Id(u32),
    /// Flexible payload bytes.
    Flex { hi: u32, lo: u32 },
    /// Perfect-filter hash and soft id.
    Hash { hash: u16, id: u16 },
}

/// Hardware metadata attached to a received packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxOffloadInfo {
    /// RSS hash, if the NIC computed one.
    pub rss_hash: Option<u32>,
    /// Flow-director match, if a marking rule hit.
    pub fdir: Option<FdirMatch>,
}

/// A packet buffer checked out of a [`Mempool`].
///
/// Dropping the buffer returns it to its pool.
pub struct Mbuf {
    data: Vec<u8>,
    offload: RxOffloadInfo,
    pool: Arc<PoolInner>,
}

impl Mbuf {
    /// Returns the packet bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns the packet length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the packet carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the hardware metadata attached on receive.
    pub fn offload(&self) -> &RxOffloadInfo {
        &self.offload
    }

    /// Attaches hardware metadata. Used by drivers on receive.
    pub fn set_offload(&mut self, offload: RxOffloadInfo) {
        self.offload = offload;
    }

    /// Returns the object ID of the owning pool.
    pub fn pool_oid(&self) -> MempoolOid {
        self.pool.oid
    }
}

impl Drop for Mbuf {
    fn drop(&mut self) {
        self.pool.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for Mbuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mbuf")
            .field("len", &self.data.len())
            .field("offload", &self.offload)
            .finish()
    }
}
