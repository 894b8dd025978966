//! Declared installation stages for flow programs.
//!
//! Stages are totally ordered. A stage may only be installed after every
//! stage that precedes it has either been installed or skipped, never the
//! other way round, and some stages additionally name prerequisites that
//! must have been installed (not merely skipped).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One step of the flow installation sequence.
///
/// Variant order is installation order; the derived `Ord` is relied upon.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum FlowStage {
    /// GTP-U decapsulation fanned out over the RSS permutation.
    TunnelDecapRss,
    /// RSS on the inner IP header of decapsulated GTP-U.
    InnerRss,
    /// GTP-U encapsulation, with and without the PSC extension header.
    Encap,
    /// Hairpin forwarding (loopback or two-port bridge).
    HairpinForward,
    /// Tag set and tag-based redirect.
    Tag,
    /// Sampling and mirroring.
    Observe,
    /// Symmetric-hash RSS.
    SymmetricRss,
    /// Metering. Disabled unless listed in `optional_stages`.
    Metering,
    /// Flow aging.
    Aging,
    /// GRE decapsulation RSS and GRE encapsulation.
    GreTunnel,
    /// Metadata propagation across the two-port hairpin bridge.
    HairpinMeta,
    /// GTP-U inner RSS through a shared RSS context. Optional.
    SharedInnerRss,
    /// Hit/byte counters.
    Counting,
    /// In-place GTP-U TEID rewrite.
    StateModify,
}

impl FlowStage {
    /// Every stage in installation order.
    pub const ALL: [FlowStage; 14] = [
        FlowStage::TunnelDecapRss,
        FlowStage::InnerRss,
        FlowStage::Encap,
        FlowStage::HairpinForward,
        FlowStage::Tag,
        FlowStage::Observe,
        FlowStage::SymmetricRss,
        FlowStage::Metering,
        FlowStage::Aging,
        FlowStage::GreTunnel,
        FlowStage::HairpinMeta,
        FlowStage::SharedInnerRss,
        FlowStage::Counting,
        FlowStage::StateModify,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            FlowStage::TunnelDecapRss => "tunnel-decap-rss",
            FlowStage::InnerRss => "inner-rss",
            FlowStage::Encap => "encap",
            FlowStage::HairpinForward => "hairpin-forward",
            FlowStage::Tag => "tag",
            FlowStage::Observe => "observe",
            FlowStage::SymmetricRss => "symmetric-rss",
            FlowStage::Metering => "metering",
            FlowStage::Aging => "aging",
            FlowStage::GreTunnel => "gre-tunnel",
            FlowStage::HairpinMeta => "hairpin-meta",
            FlowStage::SharedInnerRss => "shared-inner-rss",
            FlowStage::Counting => "counting",
            FlowStage::StateModify => "state-modify",
        }
    }

    /// Stages that must have been installed before this one.
    pub const fn prerequisites(&self) -> &'static [FlowStage] {
        match self {
            FlowStage::InnerRss | FlowStage::SharedInnerRss => &[FlowStage::TunnelDecapRss],
            FlowStage::StateModify => &[FlowStage::Counting],
            _ => &[],
        }
    }

    /// Returns true if the stage's programs reference hairpin queues and so
    /// need the hairpin topology bound first.
    pub const fn requires_bound_topology(&self) -> bool {
        matches!(
            self,
            FlowStage::HairpinForward | FlowStage::Observe | FlowStage::HairpinMeta
        )
    }

    /// Returns true if the stage only makes sense across a two-port bridge.
    pub const fn requires_two_ports(&self) -> bool {
        matches!(self, FlowStage::HairpinMeta)
    }

    /// Returns true if the stage is skipped unless explicitly enabled.
    pub const fn is_optional(&self) -> bool {
        matches!(self, FlowStage::Metering | FlowStage::SharedInnerRss)
    }
}

impl fmt::Display for FlowStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a stage name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown flow stage: {0}")]
pub struct UnknownStage(pub String);

impl FromStr for FlowStage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        FlowStage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == wanted)
            .ok_or_else(|| UnknownStage(s.to_string()))
    }
}
