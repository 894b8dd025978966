//! Offload Agent - NIC hairpin and flow-rule orchestrator
//!
//! Brings a multi-queue NIC from discovery to a running data plane:
//! standard queues for the host forwarding loop, hairpin queues that loop
//! packets inside the NIC, and an ordered set of hardware flow programs
//! (tunnel decap/encap, RSS, tagging, sampling, mirroring, aging, counters).
//!
//! # Architecture
//!
//! ```text
//! [Pool] ──> [Ports] ──> [Hairpin topology] ──> (start, link, bind)
//!                                                      │
//!                                                      ↓
//!        [Teardown] <── [Forwarding loop] <── [Flow installer]
//! ```
//!
//! # Key Components
//!
//! - [`daemon::OffloadAgent`]: setup sequence, forwarding hand-off, teardown
//! - [`ports`]: port discovery, offload negotiation and queue setup
//! - [`hairpin`]: loopback and two-port bridge wiring
//! - [`flow`]: stage ordering, rule catalog, installer, counters
//! - [`forward`]: the polling loop over standard queues
//!
//! All hardware access goes through the `offload-hal` traits, so the agent
//! runs unchanged on the simulated NIC.

pub mod config;
pub mod daemon;
pub mod error;
pub mod flow;
pub mod forward;
pub mod hairpin;
pub mod mempool;
pub mod packet;
pub mod ports;

pub use config::AgentConfig;
pub use daemon::{AgentPhase, OffloadAgent, TeardownReport};
pub use error::{AgentError, ErrorClass, Result};
