//! Per-port bookkeeping.

use offload_hal::{DevInfo, TxOffloads};
use offload_types::{PortId, PortState, SocketId};

use super::configurator::PortError;
use super::queue::QueueLayout;

/// A port under management.
///
/// The state mirrors what the driver has acknowledged: it only advances
/// after the corresponding driver call succeeded.
#[derive(Debug, Clone)]
pub struct Port {
    id: PortId,
    socket: SocketId,
    info: DevInfo,
    layout: QueueLayout,
    tx_offloads: TxOffloads,
    state: PortState,
}

impl Port {
    pub(crate) fn new(
        id: PortId,
        socket: SocketId,
        info: DevInfo,
        layout: QueueLayout,
        tx_offloads: TxOffloads,
    ) -> Self {
        Self {
            id,
            socket,
            info,
            layout,
            tx_offloads,
            state: PortState::Uninitialized,
        }
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn socket(&self) -> SocketId {
        self.socket
    }

    pub fn dev_info(&self) -> &DevInfo {
        &self.info
    }

    pub fn layout(&self) -> QueueLayout {
        self.layout
    }

    /// Negotiated transmit offloads.
    pub fn tx_offloads(&self) -> TxOffloads {
        self.tx_offloads
    }

    pub fn state(&self) -> PortState {
        self.state
    }

    pub fn is_started(&self) -> bool {
        self.state == PortState::Started
    }

    /// Advances the lifecycle state.
    pub(crate) fn transition(&mut self, next: PortState) -> Result<(), PortError> {
        if !self.state.can_transition_to(next) {
            return Err(PortError::InvalidTransition {
                port: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offload_types::MacAddress;

    fn port() -> Port {
        let info = DevInfo {
            driver_name: "net_test".to_string(),
            max_rx_queues: 16,
            max_tx_queues: 16,
            max_hairpin_queues: 2,
            tx_offload_capa: TxOffloads::empty(),
            mac: MacAddress::ZERO,
        };
        Port::new(
            PortId(0),
            SocketId(0),
            info,
            QueueLayout::new(8, 1).unwrap(),
            TxOffloads::empty(),
        )
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut p = port();
        assert_eq!(p.state(), PortState::Uninitialized);
        p.transition(PortState::Configured).unwrap();
        p.transition(PortState::Started).unwrap();
        assert!(p.is_started());
        p.transition(PortState::Stopped).unwrap();
        p.transition(PortState::Closed).unwrap();
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut p = port();
        let err = p.transition(PortState::Started).unwrap_err();
        assert!(matches!(err, PortError::InvalidTransition { .. }));
        assert_eq!(p.state(), PortState::Uninitialized);
    }
}
