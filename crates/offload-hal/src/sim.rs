//! In-memory simulated NIC.
//!
//! [`SimNic`] implements every driver trait against plain data structures.
//! It enforces the same lifecycle rules a poll-mode driver does (queues must
//! be set up before start, hairpin bind needs started ports, flows may only
//! reference queues that exist) and records setup calls in order, which makes
//! it usable both as the binary's backend when no hardware binding is linked
//! and as the mock driver in tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use offload_types::{MacAddress, PortId, PortState, QueueId, SocketId};
use parking_lot::Mutex;

use crate::api::{
    DevInfo, EthConf, EthDevApi, FlowApi, HairpinConf, HairpinDirection, LinkStatus,
    MempoolApi, TxOffloads,
};
use crate::error::{HalError, HalResult, HalStatus};
use crate::flow::{FlowAction, FlowCounters, FlowSpec};
use crate::mempool::{Mbuf, Mempool, PoolParams, RxOffloadInfo};
use crate::types::{FlowOid, MempoolOid};

/// Static description of one simulated port.
#[derive(Debug, Clone)]
pub struct SimPortSpec {
    pub dev_info: DevInfo,
    pub socket: SocketId,
    /// Number of `link_get` polls after start that still report link down.
    pub link_up_after: u32,
    /// Link never comes up.
    pub link_stays_down: bool,
}

impl SimPortSpec {
    /// A port resembling a ConnectX-class NIC: 64 queues each way, 4 hairpin
    /// queues, every standard offload except SCTP checksum.
    pub fn new(index: u16) -> Self {
        let [hi, lo] = index.to_be_bytes();
        Self {
            dev_info: DevInfo {
                driver_name: "net_sim".to_string(),
                max_rx_queues: 64,
                max_tx_queues: 64,
                max_hairpin_queues: 4,
                tx_offload_capa: TxOffloads::VLAN_INSERT
                    .union(TxOffloads::IPV4_CKSUM)
                    .union(TxOffloads::UDP_CKSUM)
                    .union(TxOffloads::TCP_CKSUM)
                    .union(TxOffloads::TCP_TSO),
                mac: MacAddress::new([0x02, 0x00, 0x00, 0x00, hi, lo]),
            },
            socket: SocketId(0),
            link_up_after: 0,
            link_stays_down: false,
        }
    }

    pub fn with_tx_offload_capa(mut self, capa: TxOffloads) -> Self {
        self.dev_info.tx_offload_capa = capa;
        self
    }

    pub fn with_max_hairpin_queues(mut self, max: u16) -> Self {
        self.dev_info.max_hairpin_queues = max;
        self
    }

    pub fn with_link_up_after(mut self, polls: u32) -> Self {
        self.link_up_after = polls;
        self
    }

    pub fn with_link_down(mut self) -> Self {
        self.link_stays_down = true;
        self
    }

    pub fn with_socket(mut self, socket: SocketId) -> Self {
        self.socket = socket;
        self
    }
}

/// Where an injected fault fires.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    PoolCreate,
    DevInfo(PortId),
    Configure(PortId),
    RxQueueSetup(PortId),
    TxQueueSetup(PortId),
    HairpinQueueSetup(PortId),
    Promiscuous(PortId),
    Start(PortId),
    Stop(PortId),
    Close(PortId),
    LinkGet(PortId),
    /// Keyed by the Tx port of the binding.
    HairpinBind(PortId),
    HairpinUnbind(PortId),
    /// Keyed by [`FlowSpec::name`].
    FlowCreate(String),
    FlowFlush(PortId),
    QueryCount,
}

/// A recorded setup or teardown call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    PoolCreate { name: String, count: usize },
    PoolFree { name: String },
    DevInfo(PortId),
    Configure { port: PortId, nb_rx: u16, nb_tx: u16, tx_offloads: TxOffloads },
    RxQueueSetup { port: PortId, queue: QueueId },
    TxQueueSetup { port: PortId, queue: QueueId },
    HairpinQueueSetup { port: PortId, queue: QueueId, conf: HairpinConf },
    Promiscuous(PortId),
    Start(PortId),
    Stop(PortId),
    Close(PortId),
    HairpinBind { tx_port: PortId, rx_port: PortId },
    HairpinUnbind { tx_port: PortId, rx_port: PortId },
    FlowCreate { port: PortId, name: String },
    FlowDestroy { port: PortId, flow: FlowOid },
    FlowFlush(PortId),
}

struct SimFlow {
    spec: FlowSpec,
    counters: FlowCounters,
}

struct SimPort {
    spec: SimPortSpec,
    state: PortState,
    nb_rx: u16,
    nb_tx: u16,
    tx_offloads: TxOffloads,
    rx_ready: BTreeSet<QueueId>,
    tx_ready: BTreeSet<QueueId>,
    hairpin: HashMap<(QueueId, HairpinDirection), HairpinConf>,
    promiscuous: bool,
    link_polls: u32,
    /// Rx ports this port's hairpin Tx queues are bound to.
    bound_to: BTreeSet<PortId>,
    rx_pool: Option<Mempool>,
    backlog: HashMap<QueueId, VecDeque<Mbuf>>,
    tx_sent: HashMap<QueueId, u64>,
    tx_accept_limit: Option<usize>,
    synthetic_per_poll: usize,
    synthetic_seq: u32,
}

impl SimPort {
    fn new(spec: SimPortSpec) -> Self {
        Self {
            spec,
            state: PortState::Uninitialized,
            nb_rx: 0,
            nb_tx: 0,
            tx_offloads: TxOffloads::empty(),
            rx_ready: BTreeSet::new(),
            tx_ready: BTreeSet::new(),
            hairpin: HashMap::new(),
            promiscuous: false,
            link_polls: 0,
            bound_to: BTreeSet::new(),
            rx_pool: None,
            backlog: HashMap::new(),
            tx_sent: HashMap::new(),
            tx_accept_limit: None,
            synthetic_per_poll: 0,
            synthetic_seq: 0,
        }
    }

    fn require_state(&self, port: PortId, allowed: &[PortState], op: &str) -> HalResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(HalError::invalid_state(format!(
                "{} on port {} in state {}",
                op, port, self.state
            )))
        }
    }

    fn synthesize(&mut self, max: usize) -> Vec<Mbuf> {
        let Some(pool) = self.rx_pool.clone() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for _ in 0..self.synthetic_per_poll.min(max) {
            self.synthetic_seq = self.synthetic_seq.wrapping_add(1);
            let seq = self.synthetic_seq;
            let [_, _, b2, b3] = seq.to_be_bytes();
            let frame = build_udp_frame(
                MacAddress::new([0x02, 0x00, 0x00, 0x00, 0xff, 0x01]),
                self.spec.dev_info.mac,
                Ipv4Addr::new(10, 0, b2, b3),
                Ipv4Addr::new(192, 168, 1, 1),
                2152,
            );
            match pool.alloc(&frame) {
                Ok(mut m) => {
                    m.set_offload(RxOffloadInfo {
                        rss_hash: Some(seq.wrapping_mul(0x9e37_79b9)),
                        fdir: None,
                    });
                    out.push(m);
                }
                Err(_) => break,
            }
        }
        out
    }
}

#[derive(Default)]
struct SimState {
    ports: BTreeMap<PortId, SimPort>,
    flows: HashMap<PortId, BTreeMap<FlowOid, SimFlow>>,
    pools: HashMap<String, Mempool>,
    faults: HashMap<FaultPoint, HalStatus>,
    calls: Vec<SimCall>,
    rx_trace: Option<Vec<(PortId, QueueId)>>,
    query_calls: u64,
}

impl SimState {
    fn check_fault(&self, point: &FaultPoint) -> HalResult<()> {
        match self.faults.get(point) {
            Some(status) => Err(HalError::from_status(*status)),
            None => Ok(()),
        }
    }

    fn port(&self, port: PortId) -> HalResult<&SimPort> {
        self.ports
            .get(&port)
            .ok_or_else(|| HalError::not_found(format!("port {}", port)))
    }

    fn port_mut(&mut self, port: PortId) -> HalResult<&mut SimPort> {
        self.ports
            .get_mut(&port)
            .ok_or_else(|| HalError::not_found(format!("port {}", port)))
    }

    fn is_bound(&self, port: PortId) -> bool {
        self.ports
            .iter()
            .any(|(id, p)| (*id == port && !p.bound_to.is_empty()) || p.bound_to.contains(&port))
    }
}

/// A simulated multi-port NIC.
pub struct SimNic {
    state: Mutex<SimState>,
    next_oid: AtomicU64,
}

impl SimNic {
    /// Creates a NIC exposing the given ports as ids `0..ports.len()`.
    pub fn new(ports: Vec<SimPortSpec>) -> Self {
        let mut state = SimState::default();
        for (i, spec) in ports.into_iter().enumerate() {
            let id = PortId(i as u16);
            state.ports.insert(id, SimPort::new(spec));
        }
        Self {
            state: Mutex::new(state),
            next_oid: AtomicU64::new(1),
        }
    }

    /// Creates a NIC with `count` default ports.
    pub fn with_ports(count: u16) -> Self {
        Self::new((0..count).map(SimPortSpec::new).collect())
    }

    fn alloc_oid(&self) -> u64 {
        self.next_oid.fetch_add(1, Ordering::Relaxed)
    }

    /// Makes every call matching `point` fail with `status` until cleared.
    pub fn inject_fault(&self, point: FaultPoint, status: HalStatus) {
        self.state.lock().faults.insert(point, status);
    }

    pub fn clear_fault(&self, point: &FaultPoint) {
        self.state.lock().faults.remove(point);
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Returns the recorded setup/teardown calls in issue order.
    pub fn calls(&self) -> Vec<SimCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn port_state(&self, port: PortId) -> Option<PortState> {
        self.state.lock().ports.get(&port).map(|p| p.state)
    }

    /// Returns the configured (rx, tx) queue counts.
    pub fn queue_counts(&self, port: PortId) -> Option<(u16, u16)> {
        self.state.lock().ports.get(&port).map(|p| (p.nb_rx, p.nb_tx))
    }

    pub fn tx_offloads(&self, port: PortId) -> Option<TxOffloads> {
        self.state.lock().ports.get(&port).map(|p| p.tx_offloads)
    }

    pub fn is_promiscuous(&self, port: PortId) -> bool {
        self.state
            .lock()
            .ports
            .get(&port)
            .is_some_and(|p| p.promiscuous)
    }

    pub fn hairpin_bound(&self, tx_port: PortId, rx_port: PortId) -> bool {
        self.state
            .lock()
            .ports
            .get(&tx_port)
            .is_some_and(|p| p.bound_to.contains(&rx_port))
    }

    /// Returns the hairpin peer declared for a queue, if any.
    pub fn hairpin_conf(
        &self,
        port: PortId,
        queue: QueueId,
        direction: HairpinDirection,
    ) -> Option<HairpinConf> {
        self.state
            .lock()
            .ports
            .get(&port)
            .and_then(|p| p.hairpin.get(&(queue, direction)).copied())
    }

    /// Returns the installed flow programs on a port, in creation order.
    pub fn flows(&self, port: PortId) -> Vec<FlowSpec> {
        self.state
            .lock()
            .flows
            .get(&port)
            .map(|f| f.values().map(|sf| sf.spec.clone()).collect())
            .unwrap_or_default()
    }

    pub fn flow_count(&self, port: PortId) -> usize {
        self.state.lock().flows.get(&port).map_or(0, |f| f.len())
    }

    /// Queues a received frame on a standard queue.
    pub fn inject_rx(
        &self,
        port: PortId,
        queue: QueueId,
        frame: &[u8],
        offload: RxOffloadInfo,
    ) -> HalResult<()> {
        let mut state = self.state.lock();
        let p = state.port_mut(port)?;
        if !p.rx_ready.contains(&queue) {
            return Err(HalError::invalid_parameter(format!(
                "queue {} on port {} is not a standard rx queue",
                queue, port
            )));
        }
        let pool = p
            .rx_pool
            .clone()
            .ok_or_else(|| HalError::invalid_state("rx queue has no pool"))?;
        let mut mbuf = pool.alloc(frame)?;
        mbuf.set_offload(offload);
        p.backlog.entry(queue).or_default().push_back(mbuf);
        Ok(())
    }

    /// Number of frames still waiting on a queue.
    pub fn rx_pending(&self, port: PortId, queue: QueueId) -> usize {
        self.state
            .lock()
            .ports
            .get(&port)
            .and_then(|p| p.backlog.get(&queue))
            .map_or(0, |q| q.len())
    }

    /// Caps how many packets one `tx_burst` accepts.
    pub fn set_tx_accept_limit(&self, port: PortId, limit: Option<usize>) {
        if let Some(p) = self.state.lock().ports.get_mut(&port) {
            p.tx_accept_limit = limit;
        }
    }

    /// Generates up to `per_poll` frames on every empty rx poll.
    pub fn set_synthetic_rx(&self, port: PortId, per_poll: usize) {
        if let Some(p) = self.state.lock().ports.get_mut(&port) {
            p.synthetic_per_poll = per_poll;
        }
    }

    pub fn tx_sent(&self, port: PortId, queue: QueueId) -> u64 {
        self.state
            .lock()
            .ports
            .get(&port)
            .and_then(|p| p.tx_sent.get(&queue).copied())
            .unwrap_or(0)
    }

    /// Starts recording every `rx_burst` poll.
    pub fn enable_rx_trace(&self) {
        self.state.lock().rx_trace = Some(Vec::new());
    }

    pub fn rx_trace(&self) -> Vec<(PortId, QueueId)> {
        self.state.lock().rx_trace.clone().unwrap_or_default()
    }

    pub fn query_count_calls(&self) -> u64 {
        self.state.lock().query_calls
    }
}

impl MempoolApi for SimNic {
    fn pool_create(&self, params: &PoolParams) -> HalResult<Mempool> {
        let mut state = self.state.lock();
        state.check_fault(&FaultPoint::PoolCreate)?;
        if params.count == 0 {
            return Err(HalError::invalid_parameter("pool size cannot be zero"));
        }
        if state.pools.contains_key(&params.name) {
            return Err(HalError::from_status(HalStatus::AlreadyExists));
        }
        let oid = MempoolOid::from_raw(self.alloc_oid())
            .ok_or_else(|| HalError::internal("object id space exhausted"))?;
        let pool = Mempool::new(oid, params.clone());
        state.pools.insert(params.name.clone(), pool.clone());
        state.calls.push(SimCall::PoolCreate {
            name: params.name.clone(),
            count: params.count,
        });
        Ok(pool)
    }

    fn pool_free(&self, pool: &Mempool) -> HalResult<()> {
        let mut state = self.state.lock();
        if pool.in_use() > 0 {
            return Err(HalError::invalid_state(format!(
                "pool {} still has {} buffers in use",
                pool.name(),
                pool.in_use()
            )));
        }
        state
            .pools
            .remove(pool.name())
            .ok_or_else(|| HalError::not_found(format!("pool {}", pool.name())))?;
        state.calls.push(SimCall::PoolFree {
            name: pool.name().to_string(),
        });
        Ok(())
    }
}

impl EthDevApi for SimNic {
    fn available_ports(&self) -> Vec<PortId> {
        self.state.lock().ports.keys().copied().collect()
    }

    fn dev_info(&self, port: PortId) -> HalResult<DevInfo> {
        let mut state = self.state.lock();
        state.check_fault(&FaultPoint::DevInfo(port))?;
        let info = state.port(port)?.spec.dev_info.clone();
        state.calls.push(SimCall::DevInfo(port));
        Ok(info)
    }

    fn socket_id(&self, port: PortId) -> SocketId {
        self.state
            .lock()
            .ports
            .get(&port)
            .map_or(SocketId::ANY, |p| p.spec.socket)
    }

    fn configure(&self, port: PortId, nb_rx: u16, nb_tx: u16, conf: &EthConf) -> HalResult<()> {
        let mut state = self.state.lock();
        state.check_fault(&FaultPoint::Configure(port))?;
        let p = state.port_mut(port)?;
        p.require_state(port, &[PortState::Uninitialized], "configure")?;
        let info = &p.spec.dev_info;
        if nb_rx == 0 || nb_tx == 0 || nb_rx > info.max_rx_queues || nb_tx > info.max_tx_queues {
            return Err(HalError::invalid_parameter(format!(
                "queue counts rx={} tx={} outside 1..={}/{}",
                nb_rx, nb_tx, info.max_rx_queues, info.max_tx_queues
            )));
        }
        if !info.tx_offload_capa.contains(conf.tx_offloads) {
            return Err(HalError::invalid_parameter(format!(
                "tx offloads {} not within capability {}",
                conf.tx_offloads, info.tx_offload_capa
            )));
        }
        p.nb_rx = nb_rx;
        p.nb_tx = nb_tx;
        p.tx_offloads = conf.tx_offloads;
        p.state = PortState::Configured;
        state.calls.push(SimCall::Configure {
            port,
            nb_rx,
            nb_tx,
            tx_offloads: conf.tx_offloads,
        });
        Ok(())
    }

    fn rx_queue_setup(
        &self,
        port: PortId,
        queue: QueueId,
        nb_desc: u16,
        _socket: SocketId,
        pool: &Mempool,
    ) -> HalResult<()> {
        let mut state = self.state.lock();
        state.check_fault(&FaultPoint::RxQueueSetup(port))?;
        let p = state.port_mut(port)?;
        p.require_state(port, &[PortState::Configured], "rx queue setup")?;
        if queue >= p.nb_rx || nb_desc == 0 {
            return Err(HalError::invalid_parameter(format!(
                "rx queue {} (nb_desc {}) on port {} with {} queues",
                queue, nb_desc, port, p.nb_rx
            )));
        }
        p.rx_ready.insert(queue);
        p.rx_pool = Some(pool.clone());
        state.calls.push(SimCall::RxQueueSetup { port, queue });
        Ok(())
    }

    fn tx_queue_setup(
        &self,
        port: PortId,
        queue: QueueId,
        nb_desc: u16,
        _socket: SocketId,
        offloads: TxOffloads,
    ) -> HalResult<()> {
        let mut state = self.state.lock();
        state.check_fault(&FaultPoint::TxQueueSetup(port))?;
        let p = state.port_mut(port)?;
        p.require_state(port, &[PortState::Configured], "tx queue setup")?;
        if queue >= p.nb_tx || nb_desc == 0 {
            return Err(HalError::invalid_parameter(format!(
                "tx queue {} (nb_desc {}) on port {} with {} queues",
                queue, nb_desc, port, p.nb_tx
            )));
        }
        if !p.tx_offloads.contains(offloads) {
            return Err(HalError::invalid_parameter(format!(
                "queue offloads {} exceed port offloads {}",
                offloads, p.tx_offloads
            )));
        }
        p.tx_ready.insert(queue);
        state.calls.push(SimCall::TxQueueSetup { port, queue });
        Ok(())
    }

    fn hairpin_queue_setup(
        &self,
        port: PortId,
        queue: QueueId,
        nb_desc: u16,
        conf: &HairpinConf,
    ) -> HalResult<()> {
        let mut state = self.state.lock();
        state.check_fault(&FaultPoint::HairpinQueueSetup(port))?;
        if !state.ports.contains_key(&conf.peer_port) {
            return Err(HalError::not_found(format!("peer port {}", conf.peer_port)));
        }
        let p = state.port_mut(port)?;
        p.require_state(port, &[PortState::Configured], "hairpin queue setup")?;
        if p.spec.dev_info.max_hairpin_queues == 0 {
            return Err(HalError::not_supported("hairpin queues"));
        }
        let limit = match conf.direction {
            HairpinDirection::Rx => p.nb_rx,
            HairpinDirection::Tx => p.nb_tx,
        };
        if queue >= limit || nb_desc == 0 {
            return Err(HalError::invalid_parameter(format!(
                "hairpin {} queue {} on port {} with {} queues",
                conf.direction, queue, port, limit
            )));
        }
        let standard = match conf.direction {
            HairpinDirection::Rx => p.rx_ready.contains(&queue),
            HairpinDirection::Tx => p.tx_ready.contains(&queue),
        };
        if standard {
            return Err(HalError::invalid_parameter(format!(
                "queue {} on port {} is already a standard queue",
                queue, port
            )));
        }
        let hairpin_count = p
            .hairpin
            .keys()
            .filter(|(_, dir)| *dir == conf.direction)
            .count();
        if hairpin_count >= usize::from(p.spec.dev_info.max_hairpin_queues) {
            return Err(HalError::table_full("hairpin queues"));
        }
        p.hairpin.insert((queue, conf.direction), *conf);
        state.calls.push(SimCall::HairpinQueueSetup {
            port,
            queue,
            conf: *conf,
        });
        Ok(())
    }

    fn promiscuous_enable(&self, port: PortId) -> HalResult<()> {
        let mut state = self.state.lock();
        state.check_fault(&FaultPoint::Promiscuous(port))?;
        let p = state.port_mut(port)?;
        p.require_state(
            port,
            &[PortState::Configured, PortState::Started],
            "promiscuous enable",
        )?;
        p.promiscuous = true;
        state.calls.push(SimCall::Promiscuous(port));
        Ok(())
    }

    fn start(&self, port: PortId) -> HalResult<()> {
        let mut state = self.state.lock();
        state.check_fault(&FaultPoint::Start(port))?;
        let p = state.port_mut(port)?;
        p.require_state(port, &[PortState::Configured], "start")?;
        for q in 0..p.nb_rx {
            if !p.rx_ready.contains(&q) && !p.hairpin.contains_key(&(q, HairpinDirection::Rx)) {
                return Err(HalError::invalid_state(format!(
                    "rx queue {} on port {} not set up",
                    q, port
                )));
            }
        }
        for q in 0..p.nb_tx {
            if !p.tx_ready.contains(&q) && !p.hairpin.contains_key(&(q, HairpinDirection::Tx)) {
                return Err(HalError::invalid_state(format!(
                    "tx queue {} on port {} not set up",
                    q, port
                )));
            }
        }
        p.state = PortState::Started;
        p.link_polls = 0;
        // Auto-bound hairpin queues (no manual bind) wire up on start.
        let auto_peers: Vec<PortId> = p
            .hairpin
            .values()
            .filter(|c| c.direction == HairpinDirection::Tx && !c.manual_bind)
            .map(|c| c.peer_port)
            .collect();
        p.bound_to.extend(auto_peers);
        state.calls.push(SimCall::Start(port));
        Ok(())
    }

    fn stop(&self, port: PortId) -> HalResult<()> {
        let mut state = self.state.lock();
        state.check_fault(&FaultPoint::Stop(port))?;
        let p = state.port_mut(port)?;
        p.require_state(
            port,
            &[PortState::Configured, PortState::Started, PortState::Stopped],
            "stop",
        )?;
        if p.state != PortState::Stopped {
            p.state = PortState::Stopped;
            // Implicit (auto-bound) hairpin peers go down with the port.
            let implicit: Vec<PortId> = p
                .hairpin
                .values()
                .filter(|c| c.direction == HairpinDirection::Tx && !c.manual_bind)
                .map(|c| c.peer_port)
                .collect();
            for peer in implicit {
                p.bound_to.remove(&peer);
            }
            state.calls.push(SimCall::Stop(port));
        }
        Ok(())
    }

    fn close(&self, port: PortId) -> HalResult<()> {
        let mut state = self.state.lock();
        state.check_fault(&FaultPoint::Close(port))?;
        // Closing a started port stops it first; implicit hairpin peers go
        // down with it.
        let p = state.port_mut(port)?;
        if p.state == PortState::Started {
            let implicit: Vec<PortId> = p
                .hairpin
                .values()
                .filter(|c| c.direction == HairpinDirection::Tx && !c.manual_bind)
                .map(|c| c.peer_port)
                .collect();
            for peer in implicit {
                p.bound_to.remove(&peer);
            }
            p.state = PortState::Stopped;
        }
        if state.is_bound(port) {
            return Err(HalError::invalid_state(format!(
                "port {} still has hairpin bindings",
                port
            )));
        }
        let p = state.port_mut(port)?;
        p.require_state(port, &[PortState::Configured, PortState::Stopped], "close")?;
        p.state = PortState::Closed;
        p.backlog.clear();
        state.flows.remove(&port);
        state.calls.push(SimCall::Close(port));
        Ok(())
    }

    fn link_get(&self, port: PortId) -> HalResult<LinkStatus> {
        let mut state = self.state.lock();
        state.check_fault(&FaultPoint::LinkGet(port))?;
        let p = state.port_mut(port)?;
        if p.state != PortState::Started {
            return Ok(LinkStatus::default());
        }
        p.link_polls = p.link_polls.saturating_add(1);
        let up = !p.spec.link_stays_down && p.link_polls > p.spec.link_up_after;
        Ok(LinkStatus {
            up,
            speed_mbps: if up { 100_000 } else { 0 },
        })
    }

    fn hairpin_bind(&self, tx_port: PortId, rx_port: PortId) -> HalResult<()> {
        let mut state = self.state.lock();
        state.check_fault(&FaultPoint::HairpinBind(tx_port))?;
        for id in [tx_port, rx_port] {
            let p = state.port(id)?;
            if p.state != PortState::Started {
                return Err(HalError::invalid_state(format!(
                    "hairpin bind needs port {} started, found {}",
                    id, p.state
                )));
            }
        }
        let tx = state.port(tx_port)?;
        let has_peer = tx.hairpin.values().any(|c| {
            c.direction == HairpinDirection::Tx && c.peer_port == rx_port && c.manual_bind
        });
        if !has_peer {
            return Err(HalError::invalid_parameter(format!(
                "port {} has no manual hairpin tx queue peered with port {}",
                tx_port, rx_port
            )));
        }
        if tx.bound_to.contains(&rx_port) {
            return Err(HalError::from_status(HalStatus::Busy));
        }
        state.port_mut(tx_port)?.bound_to.insert(rx_port);
        state.calls.push(SimCall::HairpinBind { tx_port, rx_port });
        debug!("sim: hairpin bound tx port {} -> rx port {}", tx_port, rx_port);
        Ok(())
    }

    fn hairpin_unbind(&self, tx_port: PortId, rx_port: PortId) -> HalResult<()> {
        let mut state = self.state.lock();
        state.check_fault(&FaultPoint::HairpinUnbind(tx_port))?;
        let tx = state.port_mut(tx_port)?;
        if tx.bound_to.remove(&rx_port) {
            state.calls.push(SimCall::HairpinUnbind { tx_port, rx_port });
        }
        Ok(())
    }

    fn rx_burst(&self, port: PortId, queue: QueueId, max: usize) -> Vec<Mbuf> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(trace) = state.rx_trace.as_mut() {
            trace.push((port, queue));
        }
        let Some(p) = state.ports.get_mut(&port) else {
            return Vec::new();
        };
        if p.state != PortState::Started || !p.rx_ready.contains(&queue) {
            return Vec::new();
        }
        let mut pkts: Vec<Mbuf> = match p.backlog.get_mut(&queue) {
            Some(backlog) => {
                let n = backlog.len().min(max);
                backlog.drain(..n).collect()
            }
            None => Vec::new(),
        };
        if pkts.is_empty() && p.synthetic_per_poll > 0 {
            pkts = p.synthesize(max);
        }
        if !pkts.is_empty() {
            let bytes: u64 = pkts.iter().map(|m| m.len() as u64).sum();
            if let Some(flows) = state.flows.get_mut(&port) {
                for flow in flows.values_mut().filter(|f| f.spec.has_counter()) {
                    flow.counters.hits += pkts.len() as u64;
                    flow.counters.bytes += bytes;
                }
            }
        }
        pkts
    }

    fn tx_burst(&self, port: PortId, queue: QueueId, mut pkts: Vec<Mbuf>) -> Vec<Mbuf> {
        let mut state = self.state.lock();
        let Some(p) = state.ports.get_mut(&port) else {
            return pkts;
        };
        if p.state != PortState::Started || !p.tx_ready.contains(&queue) {
            return pkts;
        }
        let accept = p.tx_accept_limit.unwrap_or(usize::MAX).min(pkts.len());
        let unsent = pkts.split_off(accept);
        *p.tx_sent.entry(queue).or_default() += accept as u64;
        // Accepted buffers return to the pool once "transmitted".
        drop(pkts);
        unsent
    }
}

impl FlowApi for SimNic {
    fn create(&self, port: PortId, spec: &FlowSpec) -> HalResult<FlowOid> {
        let mut state = self.state.lock();
        state.check_fault(&FaultPoint::FlowCreate(spec.name.clone()))?;
        let known_ports: BTreeSet<PortId> = state.ports.keys().copied().collect();
        let p = state.port(port)?;
        p.require_state(
            port,
            &[PortState::Configured, PortState::Started],
            "flow create",
        )?;
        if spec.actions.is_empty() {
            return Err(HalError::invalid_parameter(format!(
                "flow {} has no actions",
                spec.name
            )));
        }
        for action in &spec.actions {
            if let FlowAction::Rss { queues, .. } = action {
                let unique: BTreeSet<_> = queues.iter().collect();
                if queues.is_empty() || unique.len() != queues.len() {
                    return Err(HalError::invalid_parameter(format!(
                        "flow {}: RSS queue list must be non-empty and distinct",
                        spec.name
                    )));
                }
            }
            if let Some(q) = action.referenced_queues().into_iter().find(|q| *q >= p.nb_rx) {
                return Err(HalError::invalid_parameter(format!(
                    "flow {}: queue {} out of range ({} rx queues)",
                    spec.name, q, p.nb_rx
                )));
            }
            match action {
                FlowAction::Mirror { port: target, .. } | FlowAction::PortRedirect(target)
                    if !known_ports.contains(target) =>
                {
                    return Err(HalError::not_found(format!(
                        "flow {}: target port {}",
                        spec.name, target
                    )));
                }
                _ => {}
            }
        }
        let oid = FlowOid::from_raw(self.alloc_oid())
            .ok_or_else(|| HalError::internal("object id space exhausted"))?;
        state.flows.entry(port).or_default().insert(
            oid,
            SimFlow {
                spec: spec.clone(),
                counters: FlowCounters::default(),
            },
        );
        state.calls.push(SimCall::FlowCreate {
            port,
            name: spec.name.clone(),
        });
        Ok(oid)
    }

    fn destroy(&self, port: PortId, flow: FlowOid) -> HalResult<()> {
        let mut state = self.state.lock();
        state
            .flows
            .get_mut(&port)
            .and_then(|f| f.remove(&flow))
            .ok_or_else(|| HalError::not_found(format!("flow {:?} on port {}", flow, port)))?;
        state.calls.push(SimCall::FlowDestroy { port, flow });
        Ok(())
    }

    fn flush(&self, port: PortId) -> HalResult<()> {
        let mut state = self.state.lock();
        state.check_fault(&FaultPoint::FlowFlush(port))?;
        state.port(port)?;
        state.flows.remove(&port);
        state.calls.push(SimCall::FlowFlush(port));
        Ok(())
    }

    fn query_count(&self, port: PortId, flow: FlowOid) -> HalResult<FlowCounters> {
        let mut state = self.state.lock();
        state.query_calls += 1;
        state.check_fault(&FaultPoint::QueryCount)?;
        let f = state
            .flows
            .get(&port)
            .and_then(|f| f.get(&flow))
            .ok_or_else(|| HalError::not_found(format!("flow {:?} on port {}", flow, port)))?;
        if !f.spec.has_counter() {
            return Err(HalError::not_supported(format!(
                "flow {} has no COUNT action",
                f.spec.name
            )));
        }
        Ok(f.counters)
    }
}

/// Builds an Ethernet/IPv4/UDP frame with an 8-byte payload.
pub fn build_udp_frame(
    src_mac: MacAddress,
    dst_mac: MacAddress,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    dst_port: u16,
) -> Vec<u8> {
    const PAYLOAD: usize = 8;
    let ip_len = (20 + 8 + PAYLOAD) as u16;
    let mut frame = Vec::with_capacity(14 + usize::from(ip_len));
    frame.extend_from_slice(dst_mac.as_bytes());
    frame.extend_from_slice(src_mac.as_bytes());
    frame.extend_from_slice(&0x0800u16.to_be_bytes());
    // IPv4 header, no options, checksum left zero.
    frame.push(0x45);
    frame.push(0);
    frame.extend_from_slice(&ip_len.to_be_bytes());
    frame.extend_from_slice(&[0, 0, 0x40, 0]);
    frame.push(64);
    frame.push(17);
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&src_ip.octets());
    frame.extend_from_slice(&dst_ip.octets());
    // UDP header
    frame.extend_from_slice(&4000u16.to_be_bytes());
    frame.extend_from_slice(&dst_port.to_be_bytes());
    frame.extend_from_slice(&((8 + PAYLOAD) as u16).to_be_bytes());
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&[0u8; PAYLOAD]);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowAttr;

    fn pool(nic: &SimNic) -> Mempool {
        nic.pool_create(&PoolParams {
            count: 64,
            ..Default::default()
        })
        .unwrap()
    }

    fn bring_up(nic: &SimNic, port: PortId, pool: &Mempool) {
        nic.configure(port, 2, 2, &EthConf::default()).unwrap();
        for q in 0..2 {
            nic.rx_queue_setup(port, q, 512, SocketId(0), pool).unwrap();
            nic.tx_queue_setup(port, q, 512, SocketId(0), TxOffloads::empty())
                .unwrap();
        }
        nic.start(port).unwrap();
    }

    #[test]
    fn test_configure_rejects_unsupported_offloads() {
        let nic = SimNic::with_ports(1);
        let conf = EthConf {
            tx_offloads: TxOffloads::SCTP_CKSUM,
            rx_rss: false,
        };
        let err = nic.configure(PortId(0), 1, 1, &conf).unwrap_err();
        assert!(matches!(err, HalError::InvalidParameter { .. }));
        assert_eq!(nic.port_state(PortId(0)), Some(PortState::Uninitialized));
    }

    #[test]
    fn test_start_requires_all_queues() {
        let nic = SimNic::with_ports(1);
        let pool = pool(&nic);
        nic.configure(PortId(0), 2, 2, &EthConf::default()).unwrap();
        nic.rx_queue_setup(PortId(0), 0, 512, SocketId(0), &pool).unwrap();
        assert!(matches!(
            nic.start(PortId(0)),
            Err(HalError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_hairpin_bind_requires_started_ports() {
        let nic = SimNic::with_ports(2);
        let pool = pool(&nic);
        for (port, peer) in [(PortId(0), PortId(1)), (PortId(1), PortId(0))] {
            nic.configure(port, 2, 2, &EthConf::default()).unwrap();
            nic.rx_queue_setup(port, 0, 512, SocketId(0), &pool).unwrap();
            nic.tx_queue_setup(port, 0, 512, SocketId(0), TxOffloads::empty())
                .unwrap();
            for direction in [HairpinDirection::Rx, HairpinDirection::Tx] {
                let conf = HairpinConf {
                    direction,
                    peer_port: peer,
                    peer_queue: 1,
                    manual_bind: true,
                    tx_explicit: true,
                };
                nic.hairpin_queue_setup(port, 1, 512, &conf).unwrap();
            }
        }

        let err = nic.hairpin_bind(PortId(0), PortId(1)).unwrap_err();
        assert!(matches!(err, HalError::InvalidState { .. }));
        assert!(!nic.hairpin_bound(PortId(0), PortId(1)));

        nic.start(PortId(0)).unwrap();
        nic.start(PortId(1)).unwrap();
        nic.hairpin_bind(PortId(0), PortId(1)).unwrap();
        assert!(nic.hairpin_bound(PortId(0), PortId(1)));

        // Close is refused while bound.
        nic.stop(PortId(0)).unwrap();
        assert!(nic.close(PortId(0)).is_err());
        nic.hairpin_unbind(PortId(0), PortId(1)).unwrap();
        nic.close(PortId(0)).unwrap();
    }

    #[test]
    fn test_flow_queue_validation() {
        let nic = SimNic::with_ports(1);
        let pool = pool(&nic);
        bring_up(&nic, PortId(0), &pool);

        let bad = FlowSpec::new("bad", FlowAttr::ingress(0)).with_action(FlowAction::Queue(7));
        assert!(nic.create(PortId(0), &bad).is_err());

        let good = FlowSpec::new("good", FlowAttr::ingress(0))
            .with_action(FlowAction::Count)
            .with_action(FlowAction::Queue(1));
        let oid = nic.create(PortId(0), &good).unwrap();
        assert_eq!(nic.query_count(PortId(0), oid).unwrap(), FlowCounters::default());
        nic.flush(PortId(0)).unwrap();
        assert_eq!(nic.flow_count(PortId(0)), 0);
    }

    #[test]
    fn test_rx_tx_burst_and_backpressure() {
        let nic = SimNic::with_ports(1);
        let pool = pool(&nic);
        bring_up(&nic, PortId(0), &pool);

        let frame = build_udp_frame(
            MacAddress::new([2, 0, 0, 0, 0, 9]),
            MacAddress::new([2, 0, 0, 0, 0, 0]),
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(192, 168, 1, 1),
            2152,
        );
        for _ in 0..3 {
            nic.inject_rx(PortId(0), 1, &frame, RxOffloadInfo::default())
                .unwrap();
        }
        assert_eq!(pool.in_use(), 3);

        nic.set_tx_accept_limit(PortId(0), Some(1));
        let pkts = nic.rx_burst(PortId(0), 1, 32);
        assert_eq!(pkts.len(), 3);
        let unsent = nic.tx_burst(PortId(0), 1, pkts);
        assert_eq!(unsent.len(), 2);
        assert_eq!(nic.tx_sent(PortId(0), 1), 1);
        drop(unsent);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_fault_injection() {
        let nic = SimNic::with_ports(1);
        nic.inject_fault(FaultPoint::Configure(PortId(0)), HalStatus::Busy);
        let err = nic
            .configure(PortId(0), 1, 1, &EthConf::default())
            .unwrap_err();
        assert!(err.is_retryable());
        nic.clear_faults();
        nic.configure(PortId(0), 1, 1, &EthConf::default()).unwrap();
    }

    #[test]
    fn test_link_comes_up_after_polls() {
        let nic = SimNic::new(vec![SimPortSpec::new(0).with_link_up_after(2)]);
        let pool = pool(&nic);
        bring_up(&nic, PortId(0), &pool);
        assert!(!nic.link_get(PortId(0)).unwrap().up);
        assert!(!nic.link_get(PortId(0)).unwrap().up);
        assert!(nic.link_get(PortId(0)).unwrap().up);
    }
}
