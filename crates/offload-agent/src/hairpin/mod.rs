//! Hairpin queue topology.
//!
//! With one port the hairpin queues loop back onto the same port; with two
//! ports they cross-bind into a symmetric bridge. Wiring is two-phase:
//! [`HairpinTopology::setup`] declares the queues while the ports are
//! configured but stopped, [`HairpinTopology::bind`] links them once the
//! ports are started. [`HairpinTopology::unbind`] must run before the ports
//! are closed.

mod topology;

pub use topology::{HairpinBinding, HairpinError, HairpinMode, HairpinTopology, TopologyState};
