//! Common types for NIC offload orchestration.
//!
//! This crate provides type-safe representations of the primitives shared by
//! the hardware abstraction layer and the orchestrator:
//!
//! - [`PortId`], [`QueueId`], [`SocketId`]: device, queue and NUMA identifiers
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses
//! - [`PortState`]: port lifecycle state machine
//! - [`QueueRole`]: standard vs. hairpin queue roles

mod mac;
mod port;

pub use mac::MacAddress;
pub use port::{PortId, PortState, QueueId, QueueRole, SocketId};
