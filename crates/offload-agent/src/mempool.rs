//! Device pool allocator.
//!
//! Creates the single process-wide packet-buffer pool before any queue is
//! set up and releases it after every port is closed.

use log::{info, warn};
use offload_hal::{HalError, Mempool, MempoolApi};
use offload_types::SocketId;
use thiserror::Error;

use crate::config::AgentConfig;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("cannot create mbuf pool {name} ({count} buffers): {source}")]
    Create {
        name: String,
        count: usize,
        #[source]
        source: HalError,
    },

    #[error("cannot release mbuf pool {name}: {source}")]
    Release {
        name: String,
        #[source]
        source: HalError,
    },
}

impl PoolError {
    pub fn hal_error(&self) -> Option<&HalError> {
        match self {
            PoolError::Create { source, .. } | PoolError::Release { source, .. } => Some(source),
        }
    }
}

/// Creates the shared pool sized from `config` on the given socket.
pub fn create_pool(
    api: &dyn MempoolApi,
    config: &AgentConfig,
    socket: SocketId,
) -> Result<Mempool, PoolError> {
    let params = config.pool_params(socket);
    let pool = api.pool_create(&params).map_err(|source| PoolError::Create {
        name: params.name.clone(),
        count: params.count,
        source,
    })?;
    info!(
        "Created mbuf pool {} ({} buffers, data room {}, socket {})",
        pool.name(),
        pool.capacity(),
        params.data_room,
        socket
    );
    Ok(pool)
}

/// Releases the pool. Buffers still checked out make this fail.
pub fn release_pool(api: &dyn MempoolApi, pool: &Mempool) -> Result<(), PoolError> {
    if pool.in_use() > 0 {
        warn!(
            "Releasing mbuf pool {} with {} buffers still in use",
            pool.name(),
            pool.in_use()
        );
    }
    api.pool_free(pool).map_err(|source| PoolError::Release {
        name: pool.name().to_string(),
        source,
    })
}
