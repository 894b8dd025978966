//! Port, queue and lifecycle state definitions.

use std::fmt;

/// An Ethernet device port index.
///
/// Transparent newtype around `u16` so that port and queue indices cannot be
/// swapped by accident.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PortId(pub u16);

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A receive/transmit queue index on a port. Stable for the port's lifetime.
pub type QueueId = u16;

/// NUMA socket a port (or allocation) is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SocketId(pub i32);

impl SocketId {
    /// Any socket; used when the platform cannot report locality.
    pub const ANY: SocketId = SocketId(-1);
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::ANY {
            write!(f, "any")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Lifecycle state of a port.
///
/// Transitions are monotonic: `Uninitialized → Configured → Started`, then
/// the terminal `Stopped → Closed` pair. A configured port that was never
/// started may be stopped directly, and closing a started port stops it
/// implicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum PortState {
    #[default]
    Uninitialized,
    Configured,
    Started,
    Stopped,
    Closed,
}

impl PortState {
    /// Returns true if moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: PortState) -> bool {
        matches!(
            (self, next),
            (PortState::Uninitialized, PortState::Configured)
                | (PortState::Configured, PortState::Started)
                | (PortState::Configured, PortState::Stopped)
                | (PortState::Started, PortState::Stopped)
                | (PortState::Stopped, PortState::Closed)
                | (PortState::Configured, PortState::Closed)
                | (PortState::Started, PortState::Closed)
        )
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PortState::Uninitialized => "uninitialized",
            PortState::Configured => "configured",
            PortState::Started => "started",
            PortState::Stopped => "stopped",
            PortState::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Role of a queue within a port's queue set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    /// Serviced by the host forwarding loop.
    Standard,
    /// Receive side of a hardware hairpin loop.
    HairpinRx,
    /// Transmit side of a hardware hairpin loop.
    HairpinTx,
}

impl fmt::Display for QueueRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueueRole::Standard => "standard",
            QueueRole::HairpinRx => "hairpin-rx",
            QueueRole::HairpinTx => "hairpin-tx",
        };
        write!(f, "{}", s)
    }
}
