//! The seam between the installer and the code that writes flow programs.

use std::ops::Range;

use log::debug;
use offload_hal::{FlowApi, FlowOid, FlowSpec, HalResult};
use offload_types::{PortId, QueueId};
use parking_lot::Mutex;

use super::stage::FlowStage;

/// A flow program installed on a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowHandle {
    pub port: PortId,
    pub oid: FlowOid,
    /// The program carries a COUNT action and can be queried.
    pub counted: bool,
}

/// Everything a builder may use while installing its programs.
pub struct RuleContext<'a> {
    flows: &'a dyn FlowApi,
    port: PortId,
    peer_port: Option<PortId>,
    rss_queues: &'a [QueueId],
    hairpin_queues: Range<QueueId>,
    /// Every program created through this context, in creation order.
    created: Mutex<Vec<FlowHandle>>,
}

impl<'a> RuleContext<'a> {
    /// Context targeting `port`, distributing over `rss_queues`.
    pub fn new(flows: &'a dyn FlowApi, port: PortId, rss_queues: &'a [QueueId]) -> Self {
        Self {
            flows,
            port,
            peer_port: None,
            rss_queues,
            hairpin_queues: 0..0,
            created: Mutex::new(Vec::new()),
        }
    }

    /// Sets the second port of a two-port bridge.
    pub fn with_peer(mut self, peer: Option<PortId>) -> Self {
        self.peer_port = peer;
        self
    }

    pub fn with_hairpin_queues(mut self, queues: Range<QueueId>) -> Self {
        self.hairpin_queues = queues;
        self
    }

    /// The primary port rules are installed on.
    pub fn port(&self) -> PortId {
        self.port
    }

    /// The bridge peer, if two ports are in use.
    pub fn peer_port(&self) -> Option<PortId> {
        self.peer_port
    }

    /// Queue permutation for RSS targets. Builders must keep its order.
    pub fn rss_queues(&self) -> &[QueueId] {
        self.rss_queues
    }

    pub fn hairpin_queues(&self) -> Range<QueueId> {
        self.hairpin_queues.clone()
    }

    /// First hairpin queue, if the topology has any.
    pub fn first_hairpin_queue(&self) -> Option<QueueId> {
        self.hairpin_queues.clone().next()
    }

    /// Every port taking part, primary first.
    pub fn ports(&self) -> Vec<PortId> {
        std::iter::once(self.port).chain(self.peer_port).collect()
    }

    /// Installs a program on `port`.
    pub fn create(&self, port: PortId, spec: &FlowSpec) -> HalResult<FlowHandle> {
        let oid = self.flows.create(port, spec)?;
        debug!("Port {}: installed {} as {:?}", port, spec, oid);
        let handle = FlowHandle {
            port,
            oid,
            counted: spec.has_counter(),
        };
        self.created.lock().push(handle);
        Ok(handle)
    }

    /// Installs a program on the primary port.
    pub fn create_on_primary(&self, spec: &FlowSpec) -> HalResult<FlowHandle> {
        self.create(self.port, spec)
    }

    /// Handles created so far.
    pub fn created(&self) -> Vec<FlowHandle> {
        self.created.lock().clone()
    }

    pub(crate) fn into_created(self) -> Vec<FlowHandle> {
        self.created.into_inner()
    }
}

/// Produces and installs the programs of one stage.
///
/// A builder returns every handle it created or an error. Programs are
/// created through the [`RuleContext`], which keeps their handles even when
/// the builder fails partway, so the installer owns them either way.
pub trait RuleBuilder: Send + Sync {
    fn stage(&self) -> FlowStage;

    /// Name used in progress and error messages.
    fn name(&self) -> &str;

    fn build(&self, ctx: &RuleContext<'_>) -> HalResult<Vec<FlowHandle>>;
}
