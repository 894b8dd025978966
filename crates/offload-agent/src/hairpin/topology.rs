use std::fmt;
use std::ops::Range;

use log::{debug, info, warn};
use offload_hal::{EthDevApi, HairpinBindingOid, HairpinConf, HairpinDirection, HalError};
use offload_types::{PortId, PortState, QueueId};
use thiserror::Error;

use crate::error::ErrorClass;
use crate::ports::{Port, QueueLayout};

/// Hairpin topology errors.
#[derive(Debug, Error)]
pub enum HairpinError {
    #[error("hairpin topology supports 1 or 2 ports, got {0}")]
    InvalidPortCount(usize),

    #[error("port {port} supports {max} hairpin queues, {requested} requested")]
    Unsupported {
        port: PortId,
        max: u16,
        requested: u16,
    },

    #[error("port {0} is not part of the hairpin topology")]
    UnknownPort(PortId),

    #[error("port {port} must be {expected} for hairpin {operation}, found {actual}")]
    PortState {
        port: PortId,
        operation: &'static str,
        expected: PortState,
        actual: PortState,
    },

    #[error("cannot {operation} while topology is {state}")]
    InvalidState {
        operation: &'static str,
        state: TopologyState,
    },

    #[error("hairpin {direction} queue {queue} setup failed on port {port}: {source}")]
    QueueSetup {
        port: PortId,
        queue: QueueId,
        direction: HairpinDirection,
        #[source]
        source: HalError,
    },

    #[error("cannot bind hairpin tx port {tx_port} to rx port {rx_port}: {source}")]
    Bind {
        tx_port: PortId,
        rx_port: PortId,
        #[source]
        source: HalError,
    },

    #[error("cannot unbind hairpin tx port {tx_port} from rx port {rx_port}: {source}")]
    Unbind {
        tx_port: PortId,
        rx_port: PortId,
        #[source]
        source: HalError,
    },
}

impl HairpinError {
    pub fn class(&self) -> ErrorClass {
        match self {
            HairpinError::Unsupported { .. } => ErrorClass::Capability,
            _ => ErrorClass::Topology,
        }
    }

    pub fn hal_error(&self) -> Option<&HalError> {
        match self {
            HairpinError::QueueSetup { source, .. }
            | HairpinError::Bind { source, .. }
            | HairpinError::Unbind { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// How hairpin queues are wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HairpinMode {
    /// Rx hairpin feeds Tx hairpin on the same port; bound implicitly on start.
    Loopback,
    /// Each port's Rx hairpin feeds the peer's Tx hairpin; bound explicitly.
    Bridge,
}

impl fmt::Display for HairpinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HairpinMode::Loopback => write!(f, "loopback"),
            HairpinMode::Bridge => write!(f, "bridge"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyState {
    Planned,
    QueuesDeclared,
    Bound,
    Unbound,
}

impl fmt::Display for TopologyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TopologyState::Planned => "planned",
            TopologyState::QueuesDeclared => "queues-declared",
            TopologyState::Bound => "bound",
            TopologyState::Unbound => "unbound",
        };
        f.write_str(s)
    }
}

/// An established hairpin link from a Tx port to an Rx port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HairpinBinding {
    pub oid: HairpinBindingOid,
    pub tx_port: PortId,
    pub rx_port: PortId,
    /// Established by the driver on port start rather than by an explicit
    /// bind call; nothing to unbind.
    pub implicit: bool,
}

/// The hairpin wiring of the managed ports.
#[derive(Debug)]
pub struct HairpinTopology {
    mode: HairpinMode,
    ports: Vec<PortId>,
    layout: QueueLayout,
    ring_depth: u16,
    state: TopologyState,
    bindings: Vec<HairpinBinding>,
    next_oid: u64,
}

impl HairpinTopology {
    /// Decides the wiring for the given ports.
    pub fn plan(
        ports: &[PortId],
        layout: QueueLayout,
        ring_depth: u16,
    ) -> Result<Self, HairpinError> {
        let mode = match ports.len() {
            1 => HairpinMode::Loopback,
            2 => HairpinMode::Bridge,
            n => return Err(HairpinError::InvalidPortCount(n)),
        };
        Ok(Self {
            mode,
            ports: ports.to_vec(),
            layout,
            ring_depth,
            state: TopologyState::Planned,
            bindings: Vec::new(),
            next_oid: 1,
        })
    }

    pub fn mode(&self) -> HairpinMode {
        self.mode
    }

    pub fn ports(&self) -> &[PortId] {
        &self.ports
    }

    pub fn state(&self) -> TopologyState {
        self.state
    }

    pub fn is_bound(&self) -> bool {
        self.state == TopologyState::Bound
    }

    pub fn bindings(&self) -> &[HairpinBinding] {
        &self.bindings
    }

    pub fn hairpin_queues(&self) -> Range<QueueId> {
        self.layout.hairpin_queues()
    }

    /// The port whose hairpin queues pair with `port`'s.
    pub fn peer_of(&self, port: PortId) -> Option<PortId> {
        let idx = self.ports.iter().position(|p| *p == port)?;
        match self.mode {
            HairpinMode::Loopback => Some(port),
            HairpinMode::Bridge => self.ports.get(1 - idx).copied(),
        }
    }

    /// Hairpin configuration for one queue of one port.
    pub fn queue_conf(
        &self,
        port: PortId,
        queue: QueueId,
        direction: HairpinDirection,
    ) -> Option<HairpinConf> {
        if !self.hairpin_queues().contains(&queue) {
            return None;
        }
        let peer_port = self.peer_of(port)?;
        let bridge = self.mode == HairpinMode::Bridge;
        Some(HairpinConf {
            direction,
            peer_port,
            peer_queue: queue,
            manual_bind: bridge,
            tx_explicit: bridge,
        })
    }

    /// Declares hairpin Rx and Tx queues on every port.
    ///
    /// Ports must be configured but not yet started.
    pub fn setup(&mut self, dev: &dyn EthDevApi, ports: &[Port]) -> Result<(), HairpinError> {
        if self.state != TopologyState::Planned {
            return Err(HairpinError::InvalidState {
                operation: "setup",
                state: self.state,
            });
        }

        for id in &self.ports {
            let port = find_port(ports, *id)?;
            require_state(port, "setup", PortState::Configured)?;
            let max = port.dev_info().max_hairpin_queues;
            if max < self.layout.hairpin_count() {
                return Err(HairpinError::Unsupported {
                    port: *id,
                    max,
                    requested: self.layout.hairpin_count(),
                });
            }
        }

        for id in self.ports.clone() {
            for queue in self.hairpin_queues() {
                for direction in [HairpinDirection::Rx, HairpinDirection::Tx] {
                    let conf = self
                        .queue_conf(id, queue, direction)
                        .ok_or(HairpinError::UnknownPort(id))?;
                    dev.hairpin_queue_setup(id, queue, self.ring_depth, &conf)
                        .map_err(|source| HairpinError::QueueSetup {
                            port: id,
                            queue,
                            direction,
                            source,
                        })?;
                    debug!(
                        "Port {}: hairpin {} queue {} -> port {} queue {}",
                        id, direction, queue, conf.peer_port, conf.peer_queue
                    );
                }
            }
        }

        self.state = TopologyState::QueuesDeclared;
        info!(
            "Hairpin {} queues declared on {} port(s)",
            self.mode,
            self.ports.len()
        );
        Ok(())
    }

    /// Links the hairpin queues. Every port must be started.
    pub fn bind(&mut self, dev: &dyn EthDevApi, ports: &[Port]) -> Result<(), HairpinError> {
        if self.state != TopologyState::QueuesDeclared {
            return Err(HairpinError::InvalidState {
                operation: "bind",
                state: self.state,
            });
        }
        for id in &self.ports {
            require_state(find_port(ports, *id)?, "bind", PortState::Started)?;
        }

        match self.mode {
            HairpinMode::Loopback => {
                let port = self.ports[0];
                let oid = self.alloc_oid();
                self.bindings.push(HairpinBinding {
                    oid,
                    tx_port: port,
                    rx_port: port,
                    implicit: true,
                });
                info!("Hairpin loopback on port {} active", port);
            }
            HairpinMode::Bridge => {
                for tx_port in self.ports.clone() {
                    let rx_port = self.peer_of(tx_port).ok_or(HairpinError::UnknownPort(tx_port))?;
                    dev.hairpin_bind(tx_port, rx_port)
                        .map_err(|source| HairpinError::Bind {
                            tx_port,
                            rx_port,
                            source,
                        })?;
                    let oid = self.alloc_oid();
                    self.bindings.push(HairpinBinding {
                        oid,
                        tx_port,
                        rx_port,
                        implicit: false,
                    });
                    info!("Hairpin bound: tx port {} -> rx port {}", tx_port, rx_port);
                }
            }
        }

        self.state = TopologyState::Bound;
        Ok(())
    }

    /// Removes every explicit binding, continuing past failures.
    ///
    /// Returns the first failure. Calling it again after success is a no-op.
    pub fn unbind(&mut self, dev: &dyn EthDevApi) -> Result<(), HairpinError> {
        let mut first_err = None;
        let mut remaining = Vec::new();
        for binding in self.bindings.drain(..) {
            if binding.implicit {
                continue;
            }
            match dev.hairpin_unbind(binding.tx_port, binding.rx_port) {
                Ok(()) => debug!(
                    "Hairpin unbound: tx port {} -> rx port {}",
                    binding.tx_port, binding.rx_port
                ),
                Err(source) => {
                    warn!(
                        "Failed to unbind hairpin tx port {} -> rx port {}: {}",
                        binding.tx_port, binding.rx_port, source
                    );
                    remaining.push(binding);
                    if first_err.is_none() {
                        first_err = Some(HairpinError::Unbind {
                            tx_port: binding.tx_port,
                            rx_port: binding.rx_port,
                            source,
                        });
                    }
                }
            }
        }
        self.bindings = remaining;
        if self.state != TopologyState::Planned {
            self.state = TopologyState::Unbound;
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn alloc_oid(&mut self) -> HairpinBindingOid {
        let raw = self.next_oid;
        self.next_oid += 1;
        HairpinBindingOid::from_raw(raw).unwrap_or(HairpinBindingOid::NULL)
    }
}

fn find_port(ports: &[Port], id: PortId) -> Result<&Port, HairpinError> {
    ports
        .iter()
        .find(|p| p.id() == id)
        .ok_or(HairpinError::UnknownPort(id))
}

fn require_state(
    port: &Port,
    operation: &'static str,
    expected: PortState,
) -> Result<(), HairpinError> {
    if port.state() == expected {
        Ok(())
    } else {
        Err(HairpinError::PortState {
            port: port.id(),
            operation,
            expected,
            actual: port.state(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offload_hal::sim::{FaultPoint, SimCall, SimNic};
    use offload_hal::{HalStatus, Mempool, MempoolApi, PoolParams};
    use crate::ports::PortConfigurator;

    fn configured(nic: &SimNic, count: u16) -> (Mempool, Vec<Port>) {
        let pool = nic.pool_create(&PoolParams::default()).unwrap();
        let cfg = PortConfigurator::new(nic, layout(), 512);
        let ports = (0..count)
            .map(|i| cfg.configure(PortId(i), &pool).unwrap())
            .collect();
        (pool, ports)
    }

    fn layout() -> QueueLayout {
        QueueLayout::new(8, 1).unwrap()
    }

    fn ids(ports: &[Port]) -> Vec<PortId> {
        ports.iter().map(|p| p.id()).collect()
    }

    fn start_all(nic: &SimNic, ports: &mut [Port]) {
        let cfg = PortConfigurator::new(nic, layout(), 512);
        for p in ports.iter_mut() {
            cfg.start(p).unwrap();
        }
    }

    #[test]
    fn test_plan_modes() {
        let lo = HairpinTopology::plan(&[PortId(0)], layout(), 512).unwrap();
        assert_eq!(lo.mode(), HairpinMode::Loopback);
        assert_eq!(lo.peer_of(PortId(0)), Some(PortId(0)));

        let br = HairpinTopology::plan(&[PortId(0), PortId(1)], layout(), 512).unwrap();
        assert_eq!(br.mode(), HairpinMode::Bridge);
        assert_eq!(br.peer_of(PortId(0)), Some(PortId(1)));
        assert_eq!(br.peer_of(PortId(1)), Some(PortId(0)));
        assert_eq!(br.peer_of(PortId(5)), None);

        assert!(matches!(
            HairpinTopology::plan(&[], layout(), 512),
            Err(HairpinError::InvalidPortCount(0))
        ));
        assert!(matches!(
            HairpinTopology::plan(&[PortId(0), PortId(1), PortId(2)], layout(), 512),
            Err(HairpinError::InvalidPortCount(3))
        ));
    }

    #[test]
    fn test_queue_conf() {
        let br = HairpinTopology::plan(&[PortId(0), PortId(1)], layout(), 512).unwrap();
        let conf = br.queue_conf(PortId(0), 8, HairpinDirection::Rx).unwrap();
        assert_eq!(conf.peer_port, PortId(1));
        assert_eq!(conf.peer_queue, 8);
        assert!(conf.manual_bind);
        assert!(br.queue_conf(PortId(0), 3, HairpinDirection::Rx).is_none());

        let lo = HairpinTopology::plan(&[PortId(0)], layout(), 512).unwrap();
        assert!(!lo.queue_conf(PortId(0), 8, HairpinDirection::Tx).unwrap().manual_bind);
    }

    #[test]
    fn test_bridge_setup_bind_unbind() {
        let nic = SimNic::with_ports(2);
        let (_pool, mut ports) = configured(&nic, 2);
        let mut topo = HairpinTopology::plan(&ids(&ports), layout(), 512).unwrap();

        topo.setup(&nic, &ports).unwrap();
        assert_eq!(topo.state(), TopologyState::QueuesDeclared);
        let conf = nic.hairpin_conf(PortId(1), 8, HairpinDirection::Tx).unwrap();
        assert_eq!(conf.peer_port, PortId(0));

        start_all(&nic, &mut ports);
        topo.bind(&nic, &ports).unwrap();
        assert!(topo.is_bound());
        assert_eq!(topo.bindings().len(), 2);
        assert!(nic.hairpin_bound(PortId(0), PortId(1)));
        assert!(nic.hairpin_bound(PortId(1), PortId(0)));

        topo.unbind(&nic).unwrap();
        assert!(!nic.hairpin_bound(PortId(0), PortId(1)));
        assert!(topo.bindings().is_empty());
        // Second unbind is a no-op.
        nic.clear_calls();
        topo.unbind(&nic).unwrap();
        assert!(nic.calls().is_empty());
    }

    #[test]
    fn test_bind_before_start_rejected() {
        let nic = SimNic::with_ports(2);
        let (_pool, ports) = configured(&nic, 2);
        let mut topo = HairpinTopology::plan(&ids(&ports), layout(), 512).unwrap();
        topo.setup(&nic, &ports).unwrap();

        let err = topo.bind(&nic, &ports).unwrap_err();
        assert!(matches!(
            err,
            HairpinError::PortState {
                expected: PortState::Started,
                actual: PortState::Configured,
                ..
            }
        ));
        assert_eq!(topo.state(), TopologyState::QueuesDeclared);
        assert!(!nic
            .calls()
            .iter()
            .any(|c| matches!(c, SimCall::HairpinBind { .. })));
    }

    #[test]
    fn test_bind_without_setup_rejected() {
        let nic = SimNic::with_ports(1);
        let (_pool, mut ports) = configured(&nic, 1);
        start_all(&nic, &mut ports);
        let mut topo = HairpinTopology::plan(&ids(&ports), layout(), 512).unwrap();
        assert!(matches!(
            topo.bind(&nic, &ports),
            Err(HairpinError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_loopback_binds_implicitly() {
        let nic = SimNic::with_ports(1);
        let (_pool, mut ports) = configured(&nic, 1);
        let mut topo = HairpinTopology::plan(&ids(&ports), layout(), 512).unwrap();
        topo.setup(&nic, &ports).unwrap();
        start_all(&nic, &mut ports);
        topo.bind(&nic, &ports).unwrap();

        assert!(topo.bindings()[0].implicit);
        assert!(nic.hairpin_bound(PortId(0), PortId(0)));
        assert!(!nic
            .calls()
            .iter()
            .any(|c| matches!(c, SimCall::HairpinBind { .. })));
        topo.unbind(&nic).unwrap();
    }

    #[test]
    fn test_setup_requires_hairpin_capability() {
        let nic = SimNic::new(vec![offload_hal::sim::SimPortSpec::new(0).with_max_hairpin_queues(0)]);
        let (_pool, ports) = configured(&nic, 1);
        let mut topo = HairpinTopology::plan(&ids(&ports), layout(), 512).unwrap();
        let err = topo.setup(&nic, &ports).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Capability);
    }

    #[test]
    fn test_unbind_failure_is_reported_and_retained() {
        let nic = SimNic::with_ports(2);
        let (_pool, mut ports) = configured(&nic, 2);
        let mut topo = HairpinTopology::plan(&ids(&ports), layout(), 512).unwrap();
        topo.setup(&nic, &ports).unwrap();
        start_all(&nic, &mut ports);
        topo.bind(&nic, &ports).unwrap();

        nic.inject_fault(FaultPoint::HairpinUnbind(PortId(0)), HalStatus::Busy);
        let err = topo.unbind(&nic).unwrap_err();
        assert!(matches!(err, HairpinError::Unbind { tx_port: PortId(0), .. }));
        // The other direction was still unbound.
        assert!(!nic.hairpin_bound(PortId(1), PortId(0)));
        assert_eq!(topo.bindings().len(), 1);

        nic.clear_faults();
        topo.unbind(&nic).unwrap();
        assert!(topo.bindings().is_empty());
    }
}
