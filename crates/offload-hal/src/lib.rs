//! Safe hardware abstraction for offload-capable multi-queue NICs.
//!
//! The orchestrator never talks to a device driver directly. Everything it
//! needs from the hardware is expressed by the traits in [`api`], so the same
//! setup and lifecycle logic runs against a real driver binding or against
//! the in-memory [`sim::SimNic`].
//!
//! # Architecture
//!
//! - [`types`]: type-safe object ids for flows, pools and hairpin bindings
//! - [`error`]: status codes and the [`HalError`] type
//! - [`mempool`]: the shared packet-buffer pool and its [`Mbuf`] handles
//! - [`flow`]: flow-program descriptors (attributes, pattern, actions)
//! - [`api`]: the driver traits ([`EthDevApi`], [`FlowApi`], [`MempoolApi`])
//! - [`sim`]: a deterministic simulated NIC with fault injection
//!
//! # Example
//!
//! ```ignore
//! use offload_hal::{EthDevApi, HalResult};
//! use offload_types::PortId;
//!
//! fn bring_up(dev: &dyn EthDevApi, port: PortId) -> HalResult<()> {
//!     dev.promiscuous_enable(port)?;
//!     dev.start(port)?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod error;
pub mod flow;
pub mod mempool;
pub mod sim;
pub mod types;

pub use api::{
    DevInfo, EthConf, EthDevApi, FlowApi, HairpinConf, HairpinDirection, LinkStatus,
    MempoolApi, NicDriver, TxOffloads,
};
pub use error::{HalError, HalResult, HalStatus};
pub use flow::{FlowAction, FlowAttr, FlowCounters, FlowItem, FlowSpec, RssTypes};
pub use mempool::{FdirMatch, Mbuf, Mempool, PoolParams, RxOffloadInfo};
pub use types::{
    FlowKind, FlowOid, HairpinBindingKind, HairpinBindingOid, HalObjectId, HalObjectKind,
    MempoolKind, MempoolOid, RawObjectId,
};
