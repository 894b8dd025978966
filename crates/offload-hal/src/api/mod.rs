//! Driver traits.
//!
//! Each submodule defines one slice of the device interface:
//!
//! - [`ethdev`]: port configuration, queues, hairpin wiring, burst I/O
//! - [`flow`]: flow-rule creation, flush and counter query
//! - [`mempool`]: packet-buffer pool creation and release
//!
//! [`NicDriver`] bundles all three so the orchestrator can hold a single
//! `Arc<dyn NicDriver>`.

pub mod ethdev;
pub mod flow;
pub mod mempool;

pub use ethdev::{
    DevInfo, EthConf, EthDevApi, HairpinConf, HairpinDirection, LinkStatus, TxOffloads,
};
pub use flow::FlowApi;
pub use mempool::MempoolApi;

/// A complete device driver.
///
/// The `as_*` accessors hand out the individual trait objects from an
/// `Arc<dyn NicDriver>`.
pub trait NicDriver: EthDevApi + FlowApi + MempoolApi {
    fn as_ethdev(&self) -> &dyn EthDevApi;
    fn as_flow(&self) -> &dyn FlowApi;
    fn as_mempool(&self) -> &dyn MempoolApi;
}

impl<T: EthDevApi + FlowApi + MempoolApi> NicDriver for T {
    fn as_ethdev(&self) -> &dyn EthDevApi {
        self
    }

    fn as_flow(&self) -> &dyn FlowApi {
        self
    }

    fn as_mempool(&self) -> &dyn MempoolApi {
        self
    }
}
