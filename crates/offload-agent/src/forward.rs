//! The forwarding loop.
//!
//! Polls every standard queue of the primary port in index order, logs a
//! summary of each received packet and sends the burst back out on the same
//! queue. Packets the device does not accept are dropped. Hairpin queues are
//! never touched.

use std::ops::Range;
use std::sync::Arc;

use log::{debug, info};
use offload_hal::NicDriver;
use offload_types::{PortId, QueueId};
use tokio_util::sync::CancellationToken;

use crate::flow::{CounterError, CounterMonitor};
use crate::packet::PacketSummary;

/// Counts from one pass over the standard queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub queues_polled: usize,
    pub rx: usize,
    pub tx: usize,
    pub dropped: usize,
}

/// Totals over the lifetime of a loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub passes: u64,
    pub rx: u64,
    pub tx: u64,
    pub dropped: u64,
}

impl ForwardStats {
    fn add(&mut self, pass: &PassReport) {
        self.passes += 1;
        self.rx += pass.rx as u64;
        self.tx += pass.tx as u64;
        self.dropped += pass.dropped as u64;
    }
}

pub struct ForwardingLoop {
    driver: Arc<dyn NicDriver>,
    port: PortId,
    queues: Range<QueueId>,
    burst: usize,
    counters: CounterMonitor,
    stats: ForwardStats,
}

impl ForwardingLoop {
    pub fn new(
        driver: Arc<dyn NicDriver>,
        port: PortId,
        queues: Range<QueueId>,
        burst: usize,
        counters: CounterMonitor,
    ) -> Self {
        Self {
            driver,
            port,
            queues,
            burst,
            counters,
            stats: ForwardStats::default(),
        }
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    pub fn stats(&self) -> ForwardStats {
        self.stats
    }

    /// Services every standard queue once.
    ///
    /// A counter query runs before each packet is logged; a failure outside
    /// the tolerance budget stops the pass. Packets already received are
    /// dropped in that case.
    pub fn run_pass(&mut self) -> Result<PassReport, CounterError> {
        let mut report = PassReport::default();
        for queue in self.queues.clone() {
            report.queues_polled += 1;
            let pkts = self.driver.rx_burst(self.port, queue, self.burst);
            if pkts.is_empty() {
                continue;
            }
            report.rx += pkts.len();
            for pkt in &pkts {
                self.counters.check(self.driver.as_flow())?;
                match PacketSummary::parse(pkt.data(), queue, pkt.offload()) {
                    Some(summary) => info!("{}", summary),
                    None => debug!("queue {:#x}: runt frame of {} bytes", queue, pkt.len()),
                }
            }

            let offered = pkts.len();
            let unsent = self.driver.tx_burst(self.port, queue, pkts);
            report.tx += offered - unsent.len();
            report.dropped += unsent.len();
            // Unsent buffers go back to the pool here.
            drop(unsent);
        }
        self.stats.add(&report);
        Ok(report)
    }

    /// Runs passes until `cancel` fires. Cancellation is observed between
    /// passes, never in the middle of one.
    pub fn run(mut self, cancel: CancellationToken) -> Result<ForwardStats, CounterError> {
        info!(
            "Port {}: forwarding on queues {}..{}",
            self.port, self.queues.start, self.queues.end
        );
        while !cancel.is_cancelled() {
            let pass = self.run_pass()?;
            if pass.rx == 0 {
                std::thread::yield_now();
            }
        }
        info!(
            "Port {}: forwarding stopped after {} passes (rx={} tx={} dropped={})",
            self.port, self.stats.passes, self.stats.rx, self.stats.tx, self.stats.dropped
        );
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offload_hal::sim::{build_udp_frame, FaultPoint, SimNic};
    use offload_hal::{
        EthConf, EthDevApi, FlowAction, FlowApi, FlowAttr, FlowSpec, HalStatus, MempoolApi,
        PoolParams, RxOffloadInfo, TxOffloads,
    };
    use offload_types::{MacAddress, SocketId};
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    const QUEUES: u16 = 4;

    fn started_nic() -> Arc<SimNic> {
        let nic = Arc::new(SimNic::with_ports(1));
        let pool = nic.pool_create(&PoolParams::default()).unwrap();
        nic.configure(PortId(0), QUEUES, QUEUES, &EthConf::default())
            .unwrap();
        for q in 0..QUEUES {
            nic.rx_queue_setup(PortId(0), q, 64, SocketId(0), &pool).unwrap();
            nic.tx_queue_setup(PortId(0), q, 64, SocketId(0), TxOffloads::empty())
                .unwrap();
        }
        nic.start(PortId(0)).unwrap();
        nic
    }

    fn inject(nic: &SimNic, queue: QueueId, count: usize) {
        let frame = build_udp_frame(
            MacAddress::new([2, 0, 0, 0, 0, 1]),
            MacAddress::new([2, 0, 0, 0, 0, 2]),
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            4789,
        );
        for _ in 0..count {
            nic.inject_rx(PortId(0), queue, &frame, RxOffloadInfo::default())
                .unwrap();
        }
    }

    fn forwarding(nic: &Arc<SimNic>, counters: CounterMonitor) -> ForwardingLoop {
        let driver: Arc<dyn NicDriver> = nic.clone();
        ForwardingLoop::new(driver, PortId(0), 0..QUEUES, 32, counters)
    }

    fn no_counters() -> CounterMonitor {
        CounterMonitor::new(PortId(0), Vec::new(), 0)
    }

    #[test]
    fn test_pass_visits_each_queue_once() {
        let nic = started_nic();
        for q in 0..QUEUES {
            inject(&nic, q, 1);
        }
        nic.enable_rx_trace();
        let mut fwd = forwarding(&nic, no_counters());

        let report = fwd.run_pass().unwrap();
        assert_eq!(
            nic.rx_trace(),
            (0..QUEUES).map(|q| (PortId(0), q)).collect::<Vec<_>>()
        );
        assert_eq!(report.queues_polled, QUEUES as usize);
        assert_eq!(report.rx, QUEUES as usize);
        assert_eq!(report.tx, QUEUES as usize);
        for q in 0..QUEUES {
            assert_eq!(nic.tx_sent(PortId(0), q), 1);
        }
    }

    #[test]
    fn test_unsent_tail_is_dropped() {
        let nic = started_nic();
        inject(&nic, 2, 10);
        nic.set_tx_accept_limit(PortId(0), Some(3));
        let mut fwd = forwarding(&nic, no_counters());

        let report = fwd.run_pass().unwrap();
        assert_eq!(report.rx, 10);
        assert_eq!(report.tx, 3);
        assert_eq!(report.dropped, 7);
        assert_eq!(nic.rx_pending(PortId(0), 2), 0);
        assert_eq!(nic.tx_sent(PortId(0), 2), 3);
    }

    #[test]
    fn test_counter_failure_stops_pass() {
        let nic = started_nic();
        let spec = FlowSpec::new("count", FlowAttr::ingress(0))
            .with_action(FlowAction::Count)
            .with_action(FlowAction::Queue(0));
        let flow = nic.create(PortId(0), &spec).unwrap();
        inject(&nic, 0, 1);
        nic.inject_fault(FaultPoint::QueryCount, HalStatus::Timeout);

        let mut fwd = forwarding(&nic, CounterMonitor::new(PortId(0), vec![flow], 0));
        assert!(matches!(
            fwd.run_pass(),
            Err(CounterError::BudgetExhausted { .. })
        ));
    }

    #[test]
    fn test_counters_queried_per_packet() {
        let nic = started_nic();
        let spec = FlowSpec::new("count", FlowAttr::ingress(0))
            .with_action(FlowAction::Count)
            .with_action(FlowAction::Queue(0));
        let flow = nic.create(PortId(0), &spec).unwrap();
        inject(&nic, 1, 5);

        let mut fwd = forwarding(&nic, CounterMonitor::new(PortId(0), vec![flow], 0));
        fwd.run_pass().unwrap();
        assert_eq!(nic.query_count_calls(), 5);
    }

    #[test]
    fn test_cancelled_token_exits_before_polling() {
        let nic = started_nic();
        nic.enable_rx_trace();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stats = forwarding(&nic, no_counters()).run(cancel).unwrap();
        assert_eq!(stats.passes, 0);
        assert!(nic.rx_trace().is_empty());
    }

    #[test]
    fn test_run_until_cancelled_from_another_thread() {
        let nic = started_nic();
        nic.set_synthetic_rx(PortId(0), 2);
        let cancel = CancellationToken::new();
        let fwd = forwarding(&nic, no_counters());

        let worker = {
            let cancel = cancel.clone();
            std::thread::spawn(move || fwd.run(cancel))
        };
        while nic.tx_sent(PortId(0), 0) == 0 {
            std::thread::yield_now();
        }
        cancel.cancel();
        let stats = worker.join().unwrap().unwrap();
        assert!(stats.passes > 0);
        assert_eq!(stats.rx, stats.tx + stats.dropped);
    }
}
