//! Flow-program descriptors.
//!
//! A [`FlowSpec`] is the data a rule builder hands to the driver: rule
//! attributes, an ordered match pattern and an ordered action list. The
//! driver compiles it into a hardware-resident program and returns a
//! [`crate::FlowOid`].

use std::fmt;
use std::net::Ipv4Addr;

use offload_types::{PortId, QueueId};

bitflags::bitflags! {
    /// RSS hash-field selection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RssTypes: u64 {
        const IPV4 = 1 << 2;
        const TCP = 1 << 3 | 1 << 9;
        const UDP = 1 << 4 | 1 << 10;
        const IPV6 = 1 << 8;
        const IP = Self::IPV4.bits() | Self::IPV6.bits();
    }
}

/// Rule attributes: table group, priority and traffic direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowAttr {
    pub group: u32,
    pub priority: u32,
    pub ingress: bool,
    pub egress: bool,
    /// Rule lives in the switch (FDB) domain rather than the NIC domain.
    pub transfer: bool,
}

impl FlowAttr {
    /// Ingress rule in the given group.
    pub fn ingress(group: u32) -> Self {
        Self {
            group,
            ingress: true,
            ..Default::default()
        }
    }

    /// Egress rule in the given group.
    pub fn egress(group: u32) -> Self {
        Self {
            group,
            egress: true,
            ..Default::default()
        }
    }

    /// Returns the attributes with a priority set.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

/// One item of a match pattern, outermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowItem {
    Eth,
    Ipv4 {
        src: Option<Ipv4Addr>,
        dst: Option<Ipv4Addr>,
    },
    Ipv6,
    Udp {
        dst_port: Option<u16>,
    },
    Tcp,
    Gre {
        protocol: Option<u16>,
    },
    GtpU {
        teid: Option<u32>,
    },
    /// GTP PDU session container extension header.
    GtpPsc {
        qfi: Option<u8>,
    },
    /// Match on a tag register written by an earlier rule.
    Tag {
        index: u8,
        data: u32,
    },
    /// Match on metadata carried across a hairpin bridge.
    Meta {
        data: u32,
    },
}

/// Mutable header field targeted by a modify action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyField {
    GtpTeid,
    Ipv4Dst,
    MacDst,
}

/// One action of a flow program, executed in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowAction {
    /// Deliver to a single queue.
    Queue(QueueId),
    /// Spread across queues; the list order is the redirection table order.
    Rss {
        queues: Vec<QueueId>,
        types: RssTypes,
        /// 0/1 hashes the outer headers, 2 the inner (post-decap) headers.
        level: u32,
        symmetric: bool,
    },
    /// Reference a shared RSS context by id.
    SharedRss(u32),
    /// Strip `size` bytes of outer tunnel header.
    RawDecap { size: u16 },
    /// Prepend a pre-built tunnel header.
    RawEncap { header: Vec<u8> },
    Jump { group: u32 },
    SetTag { index: u8, data: u32 },
    SetMeta { data: u32 },
    Mark(u32),
    /// Send one out of every `ratio` packets to `queue`.
    Sample { ratio: u32, queue: QueueId },
    /// Duplicate to another port (or to a hairpin queue on this one).
    Mirror { port: PortId, queue: Option<QueueId> },
    Age { timeout_secs: u32 },
    Count,
    Meter { id: u32 },
    ModifyField { field: ModifyField, value: u64 },
    /// Forward through the hardware bridge to a peer port.
    PortRedirect(PortId),
    Drop,
}

impl FlowAction {
    /// Returns every queue index the action refers to.
    pub fn referenced_queues(&self) -> Vec<QueueId> {
        match self {
            FlowAction::Queue(q) => vec![*q],
            FlowAction::Rss { queues, .. } => queues.clone(),
            FlowAction::Sample { queue, .. } => vec![*queue],
            FlowAction::Mirror {
                queue: Some(queue), ..
            } => vec![*queue],
            _ => Vec::new(),
        }
    }
}

/// A complete flow program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSpec {
    /// Human-readable name, used in logs and for fault injection.
    pub name: String,
    pub attr: FlowAttr,
    pub pattern: Vec<FlowItem>,
    pub actions: Vec<FlowAction>,
}

impl FlowSpec {
    /// Creates an empty program with the given name and attributes.
    pub fn new(name: impl Into<String>, attr: FlowAttr) -> Self {
        Self {
            name: name.into(),
            attr,
            pattern: Vec::new(),
            actions: Vec::new(),
        }
    }

    /// Appends a pattern item.
    pub fn with_item(mut self, item: FlowItem) -> Self {
        self.pattern.push(item);
        self
    }

    /// Appends an action.
    pub fn with_action(mut self, action: FlowAction) -> Self {
        self.actions.push(action);
        self
    }

    /// Returns true if the program carries a counter.
    pub fn has_counter(&self) -> bool {
        self.actions.iter().any(|a| matches!(a, FlowAction::Count))
    }

    /// Returns the RSS queue list, if the program distributes traffic.
    pub fn rss_queues(&self) -> Option<&[QueueId]> {
        self.actions.iter().find_map(|a| match a {
            FlowAction::Rss { queues, .. } => Some(queues.as_slice()),
            _ => None,
        })
    }
}

impl fmt::Display for FlowSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (group {}, prio {}, {} items, {} actions)",
            self.name,
            self.attr.group,
            self.attr.priority,
            self.pattern.len(),
            self.actions.len()
        )
    }
}

/// Hit and byte counters of a counting rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowCounters {
    pub hits: u64,
    pub bytes: u64,
}
