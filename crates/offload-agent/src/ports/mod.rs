//! Port configuration.
//!
//! Discovers ports, negotiates transmit offloads, sets up the standard
//! queues against the shared pool and drives each port through its
//! lifecycle (`configure → start → stop → close`).
//!
//! Hairpin queues are declared by [`crate::hairpin`] between `configure`
//! and `start`; this module only reserves their indices in the
//! [`QueueLayout`].

mod configurator;
mod offload;
mod port;
mod queue;

pub use configurator::{select_ports, PortConfigurator, PortError};
pub use offload::{negotiate_tx_offloads, DESIRED_TX_OFFLOADS};
pub use port::Port;
pub use queue::QueueLayout;
