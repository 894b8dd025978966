//! Port configurator: discovery, configure, start, link wait, stop, close.

use std::time::Duration;

use log::{debug, info, warn};
use offload_hal::{EthConf, EthDevApi, HalError, LinkStatus, Mempool};
use offload_types::{PortId, PortState, QueueId};
use thiserror::Error;

use super::offload::{negotiate_tx_offloads, DESIRED_TX_OFFLOADS};
use super::port::Port;
use super::queue::QueueLayout;
use crate::error::ErrorClass;

/// Port setup and lifecycle errors.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("no ports available")]
    NoPorts,

    #[error("cannot get device info for port {port}: {source}")]
    DevInfo {
        port: PortId,
        #[source]
        source: HalError,
    },

    #[error("port {port} supports {max_rx} rx / {max_tx} tx queues, {required} required")]
    QueueCapacity {
        port: PortId,
        max_rx: u16,
        max_tx: u16,
        required: u16,
    },

    #[error("cannot configure port {port}: {source}")]
    Configure {
        port: PortId,
        #[source]
        source: HalError,
    },

    #[error("rx queue {queue} setup failed on port {port}: {source}")]
    RxQueueSetup {
        port: PortId,
        queue: QueueId,
        #[source]
        source: HalError,
    },

    #[error("tx queue {queue} setup failed on port {port}: {source}")]
    TxQueueSetup {
        port: PortId,
        queue: QueueId,
        #[source]
        source: HalError,
    },

    #[error("promiscuous mode enable failed on port {port}: {source}")]
    Promiscuous {
        port: PortId,
        #[source]
        source: HalError,
    },

    #[error("cannot start port {port}: {source}")]
    Start {
        port: PortId,
        #[source]
        source: HalError,
    },

    #[error("link get is failing on port {port}: {source}")]
    LinkQuery {
        port: PortId,
        #[source]
        source: HalError,
    },

    #[error("link is still down on port {port} after {attempts} checks")]
    LinkDown { port: PortId, attempts: u32 },

    #[error("cannot stop port {port}: {source}")]
    Stop {
        port: PortId,
        #[source]
        source: HalError,
    },

    #[error("cannot close port {port}: {source}")]
    Close {
        port: PortId,
        #[source]
        source: HalError,
    },

    #[error("port {port}: illegal transition {from} -> {to}")]
    InvalidTransition {
        port: PortId,
        from: PortState,
        to: PortState,
    },
}

impl PortError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PortError::LinkQuery { .. } | PortError::LinkDown { .. } => ErrorClass::LinkDown,
            PortError::QueueCapacity { .. } => ErrorClass::Capability,
            _ => ErrorClass::ResourceSetup,
        }
    }

    pub fn hal_error(&self) -> Option<&HalError> {
        match self {
            PortError::DevInfo { source, .. }
            | PortError::Configure { source, .. }
            | PortError::RxQueueSetup { source, .. }
            | PortError::TxQueueSetup { source, .. }
            | PortError::Promiscuous { source, .. }
            | PortError::Start { source, .. }
            | PortError::LinkQuery { source, .. }
            | PortError::Stop { source, .. }
            | PortError::Close { source, .. } => Some(source),
            PortError::NoPorts
            | PortError::QueueCapacity { .. }
            | PortError::LinkDown { .. }
            | PortError::InvalidTransition { .. } => None,
        }
    }
}

/// Applies the port-count policy to the discovered ports.
///
/// Zero ports is an error; more than `max_ports` keeps the first
/// `max_ports` in discovery order.
pub fn select_ports(available: Vec<PortId>, max_ports: usize) -> Result<Vec<PortId>, PortError> {
    if available.is_empty() {
        return Err(PortError::NoPorts);
    }
    if available.len() > max_ports {
        warn!(
            "{} ports available, only the first {} are used",
            available.len(),
            max_ports
        );
    }
    Ok(available.into_iter().take(max_ports).collect())
}

/// Drives ports through configure/start/stop/close.
pub struct PortConfigurator<'a> {
    dev: &'a dyn EthDevApi,
    layout: QueueLayout,
    ring_depth: u16,
}

impl<'a> PortConfigurator<'a> {
    pub fn new(dev: &'a dyn EthDevApi, layout: QueueLayout, ring_depth: u16) -> Self {
        Self {
            dev,
            layout,
            ring_depth,
        }
    }

    /// Configures a port and its standard queues, then enables promiscuous
    /// mode. Hairpin queue indices are reserved but left for the topology
    /// builder.
    pub fn configure(&self, id: PortId, pool: &Mempool) -> Result<Port, PortError> {
        let port = self.open(id)?;
        self.setup_queues(&port, pool)?;
        Ok(port)
    }

    /// Negotiates offloads and configures the device queue counts.
    ///
    /// The returned port is already `Configured` on the driver side, so a
    /// caller that goes on to [`setup_queues`](Self::setup_queues) must keep
    /// it for teardown even if that step fails.
    pub fn open(&self, id: PortId) -> Result<Port, PortError> {
        info!("Initializing port {}", id);

        let info = self
            .dev
            .dev_info(id)
            .map_err(|source| PortError::DevInfo { port: id, source })?;

        let total = self.layout.total();
        if info.max_rx_queues < total || info.max_tx_queues < total {
            return Err(PortError::QueueCapacity {
                port: id,
                max_rx: info.max_rx_queues,
                max_tx: info.max_tx_queues,
                required: total,
            });
        }

        let tx_offloads = negotiate_tx_offloads(DESIRED_TX_OFFLOADS, info.tx_offload_capa);
        if tx_offloads != DESIRED_TX_OFFLOADS {
            info!(
                "Port {} ({}): tx offloads limited to {} (device supports {})",
                id, info.driver_name, tx_offloads, info.tx_offload_capa
            );
        }

        let socket = self.dev.socket_id(id);
        let mut port = Port::new(id, socket, info, self.layout, tx_offloads);

        let conf = EthConf {
            tx_offloads,
            rx_rss: false,
        };
        self.dev
            .configure(id, total, total, &conf)
            .map_err(|source| PortError::Configure { port: id, source })?;
        port.transition(PortState::Configured)?;
        Ok(port)
    }

    /// Sets up the standard rx/tx queues of a configured port and enables
    /// promiscuous mode.
    pub fn setup_queues(&self, port: &Port, pool: &Mempool) -> Result<(), PortError> {
        let id = port.id();
        let socket = port.socket();
        let tx_offloads = port.tx_offloads();

        for queue in self.layout.standard_queues() {
            self.dev
                .rx_queue_setup(id, queue, self.ring_depth, socket, pool)
                .map_err(|source| PortError::RxQueueSetup {
                    port: id,
                    queue,
                    source,
                })?;
        }
        for queue in self.layout.standard_queues() {
            self.dev
                .tx_queue_setup(id, queue, self.ring_depth, socket, tx_offloads)
                .map_err(|source| PortError::TxQueueSetup {
                    port: id,
                    queue,
                    source,
                })?;
        }
        debug!(
            "Port {}: {} standard queues set up ({} descriptors, socket {})",
            id,
            self.layout.standard_count(),
            self.ring_depth,
            socket
        );

        self.dev
            .promiscuous_enable(id)
            .map_err(|source| PortError::Promiscuous { port: id, source })?;

        info!("Initializing port {} done", id);
        Ok(())
    }

    pub fn start(&self, port: &mut Port) -> Result<(), PortError> {
        let id = port.id();
        if !port.state().can_transition_to(PortState::Started) {
            return Err(PortError::InvalidTransition {
                port: id,
                from: port.state(),
                to: PortState::Started,
            });
        }
        self.dev
            .start(id)
            .map_err(|source| PortError::Start { port: id, source })?;
        port.transition(PortState::Started)?;
        info!("Port {} started", id);
        Ok(())
    }

    /// Polls the link every `interval` until it is up, for at most
    /// `max_checks` polls.
    ///
    /// A failing link query is retried like a down link; if the final poll
    /// still failed the query error is reported rather than `LinkDown`.
    pub async fn wait_for_link(
        &self,
        port: &Port,
        interval: Duration,
        max_checks: u32,
    ) -> Result<LinkStatus, PortError> {
        let id = port.id();
        let mut last_err = None;
        for attempt in 1..=max_checks.max(1) {
            match self.dev.link_get(id) {
                Ok(link) if link.up => {
                    info!("Port {} link up ({} Mbps)", id, link.speed_mbps);
                    return Ok(link);
                }
                Ok(_) => {
                    last_err = None;
                    debug!("Port {} link down (check {}/{})", id, attempt, max_checks);
                }
                Err(e) => {
                    debug!("Port {} link get failed (check {}): {}", id, attempt, e);
                    last_err = Some(e);
                }
            }
            if attempt < max_checks {
                tokio::time::sleep(interval).await;
            }
        }
        match last_err {
            Some(source) => Err(PortError::LinkQuery { port: id, source }),
            None => Err(PortError::LinkDown {
                port: id,
                attempts: max_checks,
            }),
        }
    }

    /// Stops the port. A port that is not running is left alone.
    pub fn stop(&self, port: &mut Port) -> Result<(), PortError> {
        if !matches!(port.state(), PortState::Configured | PortState::Started) {
            return Ok(());
        }
        let id = port.id();
        self.dev
            .stop(id)
            .map_err(|source| PortError::Stop { port: id, source })?;
        port.transition(PortState::Stopped)
    }

    /// Closes the port. Closed and never-configured ports are left alone;
    /// a port that failed to stop is closed anyway.
    pub fn close(&self, port: &mut Port) -> Result<(), PortError> {
        if !matches!(
            port.state(),
            PortState::Configured | PortState::Started | PortState::Stopped
        ) {
            return Ok(());
        }
        let id = port.id();
        self.dev
            .close(id)
            .map_err(|source| PortError::Close { port: id, source })?;
        port.transition(PortState::Closed)
    }
}
