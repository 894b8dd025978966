//! Ethernet device API: port configuration, queues and hairpin wiring.

use std::fmt;

use offload_types::{MacAddress, PortId, QueueId, SocketId};

use crate::error::HalResult;
use crate::mempool::{Mbuf, Mempool};

bitflags::bitflags! {
    /// Transmit offload capability flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TxOffloads: u64 {
        const VLAN_INSERT = 1 << 0;
        const IPV4_CKSUM = 1 << 1;
        const UDP_CKSUM = 1 << 2;
        const TCP_CKSUM = 1 << 3;
        const SCTP_CKSUM = 1 << 4;
        const TCP_TSO = 1 << 5;
    }
}

impl fmt::Display for TxOffloads {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let names: Vec<String> = self
            .iter_names()
            .map(|(name, _)| name.to_ascii_lowercase())
            .collect();
        write!(f, "{}", names.join("|"))
    }
}

/// Device capabilities reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevInfo {
    pub driver_name: String,
    pub max_rx_queues: u16,
    pub max_tx_queues: u16,
    /// Maximum hairpin queues per direction; 0 if hairpin is unsupported.
    pub max_hairpin_queues: u16,
    pub tx_offload_capa: TxOffloads,
    pub mac: MacAddress,
}

/// Device-level configuration applied by [`EthDevApi::configure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EthConf {
    pub tx_offloads: TxOffloads,
    /// Enable RSS multi-queue receive mode.
    pub rx_rss: bool,
}

/// Link state as reported by the PHY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkStatus {
    pub up: bool,
    pub speed_mbps: u32,
}

/// Which side of a hairpin loop a queue implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HairpinDirection {
    Rx,
    Tx,
}

impl fmt::Display for HairpinDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HairpinDirection::Rx => write!(f, "rx"),
            HairpinDirection::Tx => write!(f, "tx"),
        }
    }
}

/// Peer description for a hairpin queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HairpinConf {
    pub direction: HairpinDirection,
    pub peer_port: PortId,
    pub peer_queue: QueueId,
    /// Binding is established explicitly with [`EthDevApi::hairpin_bind`]
    /// rather than implicitly on port start.
    pub manual_bind: bool,
    /// Tx side is driven by explicit flow rules.
    pub tx_explicit: bool,
}

/// Ethernet device operations.
///
/// Calls on a port are expected to happen in lifecycle order: `configure`,
/// queue setup, `start`, then bind, and on the way down `hairpin_unbind`,
/// `stop`, `close`. Implementations report out-of-order calls as
/// `HalError::InvalidState`.
pub trait EthDevApi: Send + Sync {
    /// Returns the ports the platform exposes, in discovery order.
    fn available_ports(&self) -> Vec<PortId>;

    /// Queries device capabilities.
    fn dev_info(&self, port: PortId) -> HalResult<DevInfo>;

    /// Returns the NUMA socket the port is attached to.
    fn socket_id(&self, port: PortId) -> SocketId;

    /// Sets the total receive and transmit queue counts.
    fn configure(&self, port: PortId, nb_rx: u16, nb_tx: u16, conf: &EthConf) -> HalResult<()>;

    /// Sets up a standard receive queue backed by `pool`.
    fn rx_queue_setup(
        &self,
        port: PortId,
        queue: QueueId,
        nb_desc: u16,
        socket: SocketId,
        pool: &Mempool,
    ) -> HalResult<()>;

    /// Sets up a standard transmit queue.
    fn tx_queue_setup(
        &self,
        port: PortId,
        queue: QueueId,
        nb_desc: u16,
        socket: SocketId,
        offloads: TxOffloads,
    ) -> HalResult<()>;

    /// Declares one side of a hairpin loop.
    fn hairpin_queue_setup(
        &self,
        port: PortId,
        queue: QueueId,
        nb_desc: u16,
        conf: &HairpinConf,
    ) -> HalResult<()>;

    fn promiscuous_enable(&self, port: PortId) -> HalResult<()>;

    fn start(&self, port: PortId) -> HalResult<()>;

    fn stop(&self, port: PortId) -> HalResult<()>;

    fn close(&self, port: PortId) -> HalResult<()>;

    /// Reads the current link state without waiting.
    fn link_get(&self, port: PortId) -> HalResult<LinkStatus>;

    /// Binds the hairpin Tx queues of `tx_port` to their peers on `rx_port`.
    fn hairpin_bind(&self, tx_port: PortId, rx_port: PortId) -> HalResult<()>;

    /// Inverse of [`EthDevApi::hairpin_bind`].
    fn hairpin_unbind(&self, tx_port: PortId, rx_port: PortId) -> HalResult<()>;

    /// Non-blocking receive of up to `max` packets.
    fn rx_burst(&self, port: PortId, queue: QueueId, max: usize) -> Vec<Mbuf>;

    /// Transmits packets in order. Returns the tail the device did not accept.
    fn tx_burst(&self, port: PortId, queue: QueueId, pkts: Vec<Mbuf>) -> Vec<Mbuf>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offload_display() {
        let set = TxOffloads::IPV4_CKSUM | TxOffloads::TCP_TSO;
        assert_eq!(set.to_string(), "ipv4_cksum|tcp_tso");
        assert_eq!(TxOffloads::empty().to_string(), "none");
    }
}
