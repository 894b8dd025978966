//! Ordered flow installation.
//!
//! The installer checks every stage's preconditions before calling its
//! builder. A refused stage never reaches the builder, so nothing is
//! programmed into hardware for it.

use std::collections::BTreeMap;
use std::ops::Range;

use log::{info, warn};
use offload_hal::{FlowApi, FlowOid, HalError};
use offload_types::{PortId, QueueId};
use thiserror::Error;

use super::builder::{FlowHandle, RuleBuilder, RuleContext};
use super::stage::FlowStage;

/// Flow installation errors.
#[derive(Debug, Error)]
pub enum FlowInstallError {
    #[error("stage {stage} cannot be installed after {after}")]
    OutOfOrder { stage: FlowStage, after: FlowStage },

    #[error("stage {stage} requires {missing} to be installed first")]
    MissingPrerequisite {
        stage: FlowStage,
        missing: FlowStage,
    },

    #[error("stage {stage} requires {requirement}")]
    TopologyNotReady {
        stage: FlowStage,
        requirement: &'static str,
    },

    #[error("cannot create {name} flows ({stage}): {source}")]
    Builder {
        stage: FlowStage,
        name: String,
        #[source]
        source: HalError,
    },

    #[error("{name} ({stage}) returned no flow handles")]
    NoHandles { stage: FlowStage, name: String },

    #[error("port {port}: flow flush failed: {source}")]
    Flush {
        port: PortId,
        #[source]
        source: HalError,
    },
}

impl FlowInstallError {
    pub fn hal_error(&self) -> Option<&HalError> {
        match self {
            FlowInstallError::Builder { source, .. } | FlowInstallError::Flush { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }
}

/// One installed program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstalledFlow {
    pub oid: FlowOid,
    pub stage: FlowStage,
    pub counted: bool,
}

/// Owning collection of every installed flow, per port.
///
/// Handles are retained until flushed; nothing is ever overwritten.
#[derive(Debug, Default)]
pub struct InstalledFlows {
    by_port: BTreeMap<PortId, Vec<InstalledFlow>>,
}

impl InstalledFlows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, stage: FlowStage, handle: FlowHandle) {
        self.by_port.entry(handle.port).or_default().push(InstalledFlow {
            oid: handle.oid,
            stage,
            counted: handle.counted,
        });
    }

    pub fn len(&self) -> usize {
        self.by_port.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn for_port(&self, port: PortId) -> &[InstalledFlow] {
        self.by_port.get(&port).map_or(&[], Vec::as_slice)
    }

    /// Number of programs installed by a stage, across ports.
    pub fn stage_count(&self, stage: FlowStage) -> usize {
        self.by_port
            .values()
            .flatten()
            .filter(|f| f.stage == stage)
            .count()
    }

    /// Flows on `port` that carry counters.
    pub fn counted(&self, port: PortId) -> Vec<FlowOid> {
        self.for_port(port)
            .iter()
            .filter(|f| f.counted)
            .map(|f| f.oid)
            .collect()
    }

    /// Flushes every rule on each of `ports` and forgets the handles.
    ///
    /// Continues past failures and returns them.
    pub fn flush(&mut self, flows: &dyn FlowApi, ports: &[PortId]) -> Vec<FlowInstallError> {
        let mut failures = Vec::new();
        for port in ports {
            let count = self.for_port(*port).len();
            match flows.flush(*port) {
                Ok(()) => {
                    if count > 0 {
                        info!("Port {}: flushed {} flows", port, count);
                    }
                    self.by_port.remove(port);
                }
                Err(e) => {
                    warn!("Port {}: flow flush failed: {}", port, e);
                    failures.push(FlowInstallError::Flush {
                        port: *port,
                        source: e,
                    });
                }
            }
        }
        failures
    }
}

/// Where and how flows are installed.
#[derive(Debug, Clone)]
pub struct InstallTarget {
    /// Port receiving the rules; the first discovered port.
    pub primary: PortId,
    /// Second port of a two-port bridge.
    pub peer: Option<PortId>,
    pub rss_queues: Vec<QueueId>,
    pub hairpin_queues: Range<QueueId>,
}

/// Installs stages in declared order.
pub struct FlowInstaller {
    target: InstallTarget,
    topology_bound: bool,
    installed_stages: Vec<FlowStage>,
    flows: InstalledFlows,
}

impl FlowInstaller {
    pub fn new(target: InstallTarget) -> Self {
        Self {
            target,
            topology_bound: false,
            installed_stages: Vec::new(),
            flows: InstalledFlows::new(),
        }
    }

    /// Records that the hairpin topology is bound, enabling the stages that
    /// reference hairpin queues.
    pub fn set_topology_bound(&mut self, bound: bool) {
        self.topology_bound = bound;
    }

    pub fn target(&self) -> &InstallTarget {
        &self.target
    }

    /// Stages installed so far, in order.
    pub fn installed_stages(&self) -> &[FlowStage] {
        &self.installed_stages
    }

    pub fn is_installed(&self, stage: FlowStage) -> bool {
        self.installed_stages.contains(&stage)
    }

    pub fn flows(&self) -> &InstalledFlows {
        &self.flows
    }

    pub fn flows_mut(&mut self) -> &mut InstalledFlows {
        &mut self.flows
    }

    /// Checks whether `stage` may be installed now.
    pub fn check(&self, stage: FlowStage) -> Result<(), FlowInstallError> {
        if let Some(last) = self.installed_stages.last() {
            if stage <= *last {
                return Err(FlowInstallError::OutOfOrder {
                    stage,
                    after: *last,
                });
            }
        }
        if let Some(missing) = stage
            .prerequisites()
            .iter()
            .find(|pre| !self.is_installed(**pre))
        {
            return Err(FlowInstallError::MissingPrerequisite {
                stage,
                missing: *missing,
            });
        }
        if stage.requires_bound_topology() && !self.topology_bound {
            return Err(FlowInstallError::TopologyNotReady {
                stage,
                requirement: "a bound hairpin topology",
            });
        }
        if stage.requires_two_ports() && self.target.peer.is_none() {
            return Err(FlowInstallError::TopologyNotReady {
                stage,
                requirement: "two ports",
            });
        }
        Ok(())
    }

    /// Installs one stage. Returns the number of programs installed.
    pub fn install(
        &mut self,
        flows: &dyn FlowApi,
        builder: &dyn RuleBuilder,
    ) -> Result<usize, FlowInstallError> {
        let stage = builder.stage();
        self.check(stage)?;

        if stage == FlowStage::SymmetricRss && self.is_installed(FlowStage::InnerRss) {
            warn!(
                "Symmetric RSS installed alongside inner-header RSS; \
                 overlapping traffic is distributed by whichever rule the NIC matches first"
            );
        }

        info!("Creating {} flows", builder.name());
        let ctx = RuleContext::new(flows, self.target.primary, &self.target.rss_queues)
            .with_peer(self.target.peer)
            .with_hairpin_queues(self.target.hairpin_queues.clone());
        let built = builder.build(&ctx);
        let created = ctx.into_created();
        let count = created.len();
        for handle in created {
            self.flows.record(stage, handle);
        }

        let handles = built.map_err(|source| {
            if count > 0 {
                warn!(
                    "{} failed after installing {} flow(s); kept for flush",
                    builder.name(),
                    count
                );
            }
            FlowInstallError::Builder {
                stage,
                name: builder.name().to_string(),
                source,
            }
        })?;
        if handles.is_empty() {
            return Err(FlowInstallError::NoHandles {
                stage,
                name: builder.name().to_string(),
            });
        }

        self.installed_stages.push(stage);
        info!("Creating {} flows done ({} installed)", builder.name(), count);
        Ok(count)
    }
}
