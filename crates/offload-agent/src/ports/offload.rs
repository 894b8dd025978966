//! Transmit offload negotiation.

use offload_hal::TxOffloads;

/// Offloads the agent would like on every transmit queue.
pub const DESIRED_TX_OFFLOADS: TxOffloads = TxOffloads::VLAN_INSERT
    .union(TxOffloads::IPV4_CKSUM)
    .union(TxOffloads::UDP_CKSUM)
    .union(TxOffloads::TCP_CKSUM)
    .union(TxOffloads::SCTP_CKSUM)
    .union(TxOffloads::TCP_TSO);

/// Restricts `desired` to what the device reports it can do.
///
/// Never fails: an unsupported offload is simply not requested.
pub fn negotiate_tx_offloads(desired: TxOffloads, capability: TxOffloads) -> TxOffloads {
    desired & capability
}
