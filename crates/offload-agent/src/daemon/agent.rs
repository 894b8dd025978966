//! OffloadAgent implementation.
//!
//! The agent owns every hardware resource it brings up:
//! - the shared packet-buffer pool
//! - the configured ports and their queues
//! - the hairpin topology
//! - the installed flow programs
//!
//! Setup runs strictly in order and stops at the first error. Teardown is
//! best-effort, releases whatever was brought up and may be called any
//! number of times.

use std::sync::Arc;

use log::{error, info, warn};
use offload_hal::{Mempool, NicDriver};
use offload_types::PortId;

use crate::config::{AgentConfig, ConfigError};
use crate::error::{AgentError, Result};
use crate::flow::{
    default_plan, log_counters, CounterMonitor, FlowInstaller, FlowStage, InstallTarget,
    InstalledFlows, RuleBuilder,
};
use crate::forward::ForwardingLoop;
use crate::hairpin::HairpinTopology;
use crate::mempool::{create_pool, release_pool};
use crate::ports::{select_ports, Port, PortConfigurator, PortError, QueueLayout};

/// Where the agent is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    Idle,
    /// Setup started; stays here if it failed.
    Initializing,
    Running,
    ShutDown,
}

/// Outcome of [`OffloadAgent::shutdown`].
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub flows_flushed: usize,
    pub ports_closed: usize,
    pub pool_released: bool,
    /// Failures encountered along the way. Teardown continued past each.
    pub errors: Vec<AgentError>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// The hairpin/flow offload orchestrator.
pub struct OffloadAgent {
    config: AgentConfig,
    driver: Arc<dyn NicDriver>,
    /// Rule builders; the built-in catalog is chosen at init if unset.
    builders: Option<Vec<Box<dyn RuleBuilder>>>,
    phase: AgentPhase,
    layout: Option<QueueLayout>,
    discovered: Vec<PortId>,
    pool: Option<Mempool>,
    ports: Vec<Port>,
    topology: Option<HairpinTopology>,
    installer: Option<FlowInstaller>,
}

impl OffloadAgent {
    /// Creates an agent that installs the built-in rule catalog.
    pub fn new(config: AgentConfig, driver: Arc<dyn NicDriver>) -> Self {
        Self {
            config,
            driver,
            builders: None,
            phase: AgentPhase::Idle,
            layout: None,
            discovered: Vec::new(),
            pool: None,
            ports: Vec::new(),
            topology: None,
            installer: None,
        }
    }

    /// Creates an agent that installs `builders` in the given order.
    pub fn with_builders(
        config: AgentConfig,
        driver: Arc<dyn NicDriver>,
        builders: Vec<Box<dyn RuleBuilder>>,
    ) -> Self {
        let mut agent = Self::new(config, driver);
        agent.builders = Some(builders);
        agent
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn phase(&self) -> AgentPhase {
        self.phase
    }

    /// Ports selected for use, in discovery order.
    pub fn discovered_ports(&self) -> &[PortId] {
        &self.discovered
    }

    /// The port flow rules and the forwarding loop target.
    pub fn primary_port(&self) -> Option<PortId> {
        self.discovered.first().copied()
    }

    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    pub fn pool(&self) -> Option<&Mempool> {
        self.pool.as_ref()
    }

    pub fn topology(&self) -> Option<&HairpinTopology> {
        self.topology.as_ref()
    }

    pub fn installer(&self) -> Option<&FlowInstaller> {
        self.installer.as_ref()
    }

    /// Brings up the pool, ports, hairpin topology and flow programs.
    ///
    /// On error the agent is left in [`AgentPhase::Initializing`] and
    /// [`OffloadAgent::shutdown`] releases whatever was created.
    pub async fn init(&mut self) -> Result<()> {
        if self.phase != AgentPhase::Idle {
            return Err(AgentError::InvalidState(format!(
                "init called in phase {:?}",
                self.phase
            )));
        }
        self.phase = AgentPhase::Initializing;
        self.config.validate()?;

        let driver = Arc::clone(&self.driver);
        let ports_cfg = &self.config.ports;
        let layout = QueueLayout::new(ports_cfg.standard_queues, ports_cfg.hairpin_queues)
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "{} standard + {} hairpin queues do not fit a port",
                    ports_cfg.standard_queues, ports_cfg.hairpin_queues
                ))
            })?;
        let ring_depth = ports_cfg.ring_depth;
        self.layout = Some(layout);

        self.discovered = select_ports(driver.available_ports(), self.config.ports.max_ports)?;
        let primary = *self.discovered.first().ok_or(PortError::NoPorts)?;
        info!(
            "Using {} port(s): {:?}",
            self.discovered.len(),
            self.discovered
        );

        let pool = create_pool(
            driver.as_mempool(),
            &self.config,
            driver.socket_id(primary),
        )?;
        let pool = self.pool.insert(pool);

        let configurator = PortConfigurator::new(driver.as_ethdev(), layout, ring_depth);
        for id in &self.discovered {
            self.ports.push(configurator.open(*id)?);
            if let Some(port) = self.ports.last() {
                configurator.setup_queues(port, pool)?;
            }
        }

        let topology = self
            .topology
            .insert(HairpinTopology::plan(&self.discovered, layout, ring_depth)?);
        topology.setup(driver.as_ethdev(), &self.ports)?;

        for port in self.ports.iter_mut() {
            configurator.start(port)?;
        }
        for port in &self.ports {
            configurator
                .wait_for_link(
                    port,
                    self.config.link_check_interval(),
                    self.config.link.max_checks,
                )
                .await?;
        }

        topology.bind(driver.as_ethdev(), &self.ports)?;
        info!(
            "Hairpin {} topology bound over {} queue(s)",
            topology.mode(),
            layout.hairpin_count()
        );

        let peer = self.discovered.get(1).copied();
        if peer.is_some() {
            warn!("Flow rules are installed on port {} only", primary);
        }
        let installer = self.installer.insert(FlowInstaller::new(InstallTarget {
            primary,
            peer,
            rss_queues: self.config.flows.rss_queues.clone(),
            hairpin_queues: layout.hairpin_queues(),
        }));
        installer.set_topology_bound(topology.is_bound());

        let builders = match self.builders.take() {
            Some(builders) => builders,
            None => default_plan(&self.config, self.discovered.len()),
        };
        let installed = install_all(&*driver, installer, &builders);
        self.builders = Some(builders);
        installed?;

        self.phase = AgentPhase::Running;
        info!(
            "Agent running: {} port(s), {} flow(s) installed",
            self.ports.len(),
            self.installer.as_ref().map_or(0, |i| i.flows().len())
        );
        Ok(())
    }

    /// Builds the forwarding loop for the primary port.
    pub fn forwarding_loop(&self) -> Result<ForwardingLoop> {
        if self.phase != AgentPhase::Running {
            return Err(AgentError::InvalidState(format!(
                "forwarding requested in phase {:?}",
                self.phase
            )));
        }
        let (Some(primary), Some(layout), Some(installer)) =
            (self.primary_port(), self.layout, self.installer.as_ref())
        else {
            return Err(AgentError::InvalidState(
                "agent is running without ports".to_string(),
            ));
        };
        let counters = CounterMonitor::new(
            primary,
            installer.flows().counted(primary),
            self.config.forwarding.counter_failure_budget,
        );
        Ok(ForwardingLoop::new(
            Arc::clone(&self.driver),
            primary,
            layout.standard_queues(),
            self.config.forwarding.burst_size,
            counters,
        ))
    }

    /// Flushes flows, unbinds the hairpin topology, stops and closes the
    /// ports and releases the pool.
    ///
    /// Every step runs even if an earlier one failed. A second call finds
    /// nothing left to do.
    pub fn shutdown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.phase == AgentPhase::ShutDown {
            return report;
        }
        info!("Shutting down");
        let driver = Arc::clone(&self.driver);

        let mut untracked = InstalledFlows::new();
        let flows = match self.installer.as_mut() {
            Some(installer) => installer.flows_mut(),
            None => &mut untracked,
        };
        report.flows_flushed = flows.len();
        for err in flows.flush(driver.as_flow(), &self.discovered) {
            report.errors.push(err.into());
        }

        if let Some(topology) = self.topology.as_mut() {
            if let Err(e) = topology.unbind(driver.as_ethdev()) {
                report.errors.push(e.into());
            }
        }

        if let Some(layout) = self.layout {
            let configurator =
                PortConfigurator::new(driver.as_ethdev(), layout, self.config.ports.ring_depth);
            for port in self.ports.iter_mut() {
                if let Err(e) = configurator.stop(port) {
                    warn!("{}", e);
                    report.errors.push(e.into());
                }
                match configurator.close(port) {
                    Ok(()) => {
                        report.ports_closed += 1;
                        info!("Port {} closed", port.id());
                    }
                    Err(e) => {
                        warn!("{}", e);
                        report.errors.push(e.into());
                    }
                }
            }
        }

        if let Some(pool) = self.pool.take() {
            match release_pool(driver.as_mempool(), &pool) {
                Ok(()) => report.pool_released = true,
                Err(e) => {
                    warn!("{}", e);
                    report.errors.push(e.into());
                    self.pool = Some(pool);
                }
            }
        }

        self.phase = AgentPhase::ShutDown;
        if report.is_clean() {
            info!("Shutdown complete");
        } else {
            error!("Shutdown finished with {} error(s)", report.errors.len());
        }
        report
    }
}

/// Installs `builders` in order. Runs the one-shot counter query right
/// after the counting stage.
fn install_all(
    driver: &dyn NicDriver,
    installer: &mut FlowInstaller,
    builders: &[Box<dyn RuleBuilder>],
) -> Result<()> {
    let primary = installer.target().primary;
    for builder in builders {
        installer.install(driver.as_flow(), builder.as_ref())?;
        if builder.stage() == FlowStage::Counting {
            let monitor = CounterMonitor::new(primary, installer.flows().counted(primary), 0);
            let total = log_counters(&monitor, driver.as_flow())?;
            info!(
                "Port {}: counters hits={} bytes={}",
                primary, total.hits, total.bytes
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use offload_hal::sim::{FaultPoint, SimCall, SimNic, SimPortSpec};
    use offload_hal::HalStatus;
    use offload_types::PortState;
    use pretty_assertions::assert_eq;

    fn fast_config() -> AgentConfig {
        let mut config = AgentConfig::default();
        config.link.check_interval_ms = 1;
        config.link.max_checks = 5;
        config
    }

    fn agent(nic: &Arc<SimNic>, config: AgentConfig) -> OffloadAgent {
        let driver: Arc<dyn NicDriver> = nic.clone();
        OffloadAgent::new(config, driver)
    }

    #[tokio::test]
    async fn test_init_twice_rejected() {
        let nic = Arc::new(SimNic::with_ports(2));
        let mut agent = agent(&nic, fast_config());
        agent.init().await.unwrap();
        assert_eq!(agent.phase(), AgentPhase::Running);
        assert!(matches!(
            agent.init().await,
            Err(AgentError::InvalidState(_))
        ));
        agent.shutdown();
    }

    #[tokio::test]
    async fn test_link_down_fails_and_tears_down() {
        let nic = Arc::new(SimNic::new(vec![
            SimPortSpec::new(0),
            SimPortSpec::new(1).with_link_down(),
        ]));
        let mut agent = agent(&nic, fast_config());
        let err = agent.init().await.unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::LinkDown);
        assert_eq!(agent.phase(), AgentPhase::Initializing);
        assert!(agent.forwarding_loop().is_err());

        let report = agent.shutdown();
        assert!(report.is_clean(), "{:?}", report.errors);
        assert_eq!(report.ports_closed, 2);
        assert!(report.pool_released);
        assert_eq!(nic.port_state(PortId(0)), Some(PortState::Closed));
        assert_eq!(nic.port_state(PortId(1)), Some(PortState::Closed));
    }

    #[tokio::test]
    async fn test_pool_failure_leaves_nothing_to_release() {
        let nic = Arc::new(SimNic::with_ports(1));
        nic.inject_fault(FaultPoint::PoolCreate, HalStatus::NoMemory);
        let mut agent = agent(&nic, fast_config());
        let err = agent.init().await.unwrap_err();
        assert!(err.is_retryable());

        let report = agent.shutdown();
        assert!(report.is_clean());
        assert!(!report.pool_released);
        assert_eq!(report.ports_closed, 0);
    }

    #[tokio::test]
    async fn test_teardown_continues_past_failures() {
        let nic = Arc::new(SimNic::with_ports(2));
        let mut agent = agent(&nic, fast_config());
        agent.init().await.unwrap();

        nic.inject_fault(FaultPoint::FlowFlush(PortId(0)), HalStatus::Busy);
        nic.inject_fault(FaultPoint::Stop(PortId(1)), HalStatus::Failure);
        let report = agent.shutdown();
        assert_eq!(report.errors.len(), 2);
        assert_eq!(report.ports_closed, 2);
        assert!(nic.calls().contains(&SimCall::Close(PortId(1))));
        assert_eq!(nic.port_state(PortId(0)), Some(PortState::Closed));
        assert_eq!(nic.port_state(PortId(1)), Some(PortState::Closed));
        assert_eq!(agent.phase(), AgentPhase::ShutDown);
    }

    #[tokio::test]
    async fn test_queue_setup_failure_still_closes_port() {
        let nic = Arc::new(SimNic::with_ports(2));
        nic.inject_fault(FaultPoint::RxQueueSetup(PortId(1)), HalStatus::NoMemory);
        let mut agent = agent(&nic, fast_config());
        let err = agent.init().await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::Port(PortError::RxQueueSetup { queue: 0, .. })
        ));
        assert_eq!(agent.ports().len(), 2);
        assert_eq!(agent.ports()[1].state(), PortState::Configured);

        let report = agent.shutdown();
        assert!(report.is_clean(), "{:?}", report.errors);
        assert_eq!(report.ports_closed, 2);
        assert_eq!(nic.port_state(PortId(0)), Some(PortState::Closed));
        assert_eq!(nic.port_state(PortId(1)), Some(PortState::Closed));
    }

    #[tokio::test]
    async fn test_default_plan_installs_every_default_stage() {
        let nic = Arc::new(SimNic::with_ports(2));
        let mut agent = agent(&nic, fast_config());
        agent.init().await.unwrap();

        let installer = agent.installer().unwrap();
        let expected: Vec<FlowStage> = FlowStage::ALL
            .into_iter()
            .filter(|s| !s.is_optional())
            .collect();
        assert_eq!(installer.installed_stages(), expected.as_slice());
        // One-shot query after the counting stage.
        assert!(nic.query_count_calls() >= 1);
        agent.shutdown();
    }
}
