//! Integration tests for the offload agent against the simulated NIC
//!
//! These tests drive the full bring-up, forwarding and teardown sequence
//! through the `offload-hal` traits, using `SimNic` in place of hardware and
//! a recording rule builder to observe installation order.

use std::sync::Arc;
use std::time::Duration;

use offload_agent::config::AgentConfig;
use offload_agent::flow::{FlowHandle, FlowInstallError, FlowStage, RuleBuilder, RuleContext};
use offload_agent::hairpin::{HairpinError, HairpinMode, HairpinTopology};
use offload_agent::ports::{PortConfigurator, QueueLayout};
use offload_agent::{AgentError, AgentPhase, ErrorClass, OffloadAgent};
use offload_hal::sim::{FaultPoint, SimCall, SimNic, SimPortSpec};
use offload_hal::{
    FlowAction, FlowAttr, FlowSpec, HairpinDirection, HalResult, HalStatus, MempoolApi,
    NicDriver, PoolParams, TxOffloads,
};
use offload_types::{PortId, PortState};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

/// Rule builder that records every call and installs a single counted rule.
struct RecordingBuilder {
    stage: FlowStage,
    calls: Arc<Mutex<Vec<FlowStage>>>,
}

impl RuleBuilder for RecordingBuilder {
    fn stage(&self) -> FlowStage {
        self.stage
    }

    fn name(&self) -> &str {
        self.stage.as_str()
    }

    fn build(&self, ctx: &RuleContext<'_>) -> HalResult<Vec<FlowHandle>> {
        self.calls.lock().push(self.stage);
        let spec = FlowSpec::new(self.stage.as_str(), FlowAttr::ingress(0))
            .with_action(FlowAction::Count)
            .with_action(FlowAction::Queue(ctx.rss_queues()[0]));
        Ok(vec![ctx.create_on_primary(&spec)?])
    }
}

fn recording(stages: &[FlowStage]) -> (Vec<Box<dyn RuleBuilder>>, Arc<Mutex<Vec<FlowStage>>>) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let builders = stages
        .iter()
        .map(|stage| {
            Box::new(RecordingBuilder {
                stage: *stage,
                calls: Arc::clone(&calls),
            }) as Box<dyn RuleBuilder>
        })
        .collect();
    (builders, calls)
}

/// Default sizing with a fast link check.
fn test_config() -> AgentConfig {
    let mut config = AgentConfig::default();
    config.link.check_interval_ms = 1;
    config.link.max_checks = 20;
    config
}

fn driver(nic: &Arc<SimNic>) -> Arc<dyn NicDriver> {
    nic.clone()
}

fn started_ports(nic: &SimNic, count: u16) -> usize {
    (0..count)
        .filter(|i| nic.port_state(PortId(*i)) == Some(PortState::Started))
        .count()
}

#[tokio::test]
async fn test_two_port_end_to_end() {
    let nic = Arc::new(SimNic::with_ports(2));
    for port in [PortId(0), PortId(1)] {
        nic.set_synthetic_rx(port, 4);
    }
    let mut agent = OffloadAgent::new(test_config(), driver(&nic));
    agent.init().await.unwrap();

    // Resources sized as configured.
    assert!(nic.calls().contains(&SimCall::PoolCreate {
        name: "mbuf_pool".to_string(),
        count: 40960,
    }));
    for port in [PortId(0), PortId(1)] {
        assert_eq!(nic.queue_counts(port), Some((9, 9)));
        assert!(nic.is_promiscuous(port));
    }
    assert_eq!(started_ports(&nic, 2), 2);

    // Symmetric bridge.
    let topology = agent.topology().unwrap();
    assert_eq!(topology.mode(), HairpinMode::Bridge);
    assert!(nic.hairpin_bound(PortId(0), PortId(1)));
    assert!(nic.hairpin_bound(PortId(1), PortId(0)));
    let conf = nic
        .hairpin_conf(PortId(0), 8, HairpinDirection::Rx)
        .unwrap();
    assert_eq!(conf.peer_port, PortId(1));
    assert!(conf.manual_bind);

    // Every installation call returned at least one handle.
    let installer = agent.installer().unwrap();
    assert!(installer.is_installed(FlowStage::HairpinMeta));
    for stage in installer.installed_stages() {
        assert!(installer.flows().stage_count(*stage) >= 1, "{}", stage);
    }

    // Cancellation stops the loop within one pass.
    nic.enable_rx_trace();
    let forwarding = agent.forwarding_loop().unwrap();
    let cancel = CancellationToken::new();
    let worker = {
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || forwarding.run(cancel))
    };
    while nic.tx_sent(PortId(0), 0) == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    cancel.cancel();
    let polled_at_cancel = nic.rx_trace().len();
    let stats = worker.await.unwrap().unwrap();
    let polled_after = nic.rx_trace().len() - polled_at_cancel;
    assert!(polled_after <= 8, "{} polls after cancel", polled_after);
    assert!(stats.passes > 0);
    assert!(stats.tx > 0);
    // Hairpin queue 8 is never polled by the host.
    assert!(nic.rx_trace().iter().all(|(port, queue)| *port == PortId(0) && *queue < 8));

    let report = agent.shutdown();
    assert!(report.is_clean(), "{:?}", report.errors);
    assert_eq!(report.ports_closed, 2);
    assert!(report.pool_released);
    assert_eq!(started_ports(&nic, 2), 0);
    assert!(!nic.hairpin_bound(PortId(0), PortId(1)));
    assert_eq!(nic.flow_count(PortId(0)), 0);
}

#[tokio::test]
async fn test_one_port_loopback() {
    let nic = Arc::new(SimNic::with_ports(1));
    let mut agent = OffloadAgent::new(test_config(), driver(&nic));
    agent.init().await.unwrap();

    assert_eq!(agent.topology().unwrap().mode(), HairpinMode::Loopback);
    let conf = nic
        .hairpin_conf(PortId(0), 8, HairpinDirection::Tx)
        .unwrap();
    assert_eq!(conf.peer_port, PortId(0));
    assert!(!conf.manual_bind);
    assert!(!nic
        .calls()
        .iter()
        .any(|c| matches!(c, SimCall::HairpinBind { .. })));

    let installer = agent.installer().unwrap();
    assert!(installer.is_installed(FlowStage::HairpinForward));
    assert!(!installer.is_installed(FlowStage::HairpinMeta));

    let report = agent.shutdown();
    assert!(report.is_clean(), "{:?}", report.errors);
    assert_eq!(nic.port_state(PortId(0)), Some(PortState::Closed));
}

#[tokio::test]
async fn test_extra_ports_ignored() {
    let nic = Arc::new(SimNic::with_ports(3));
    let mut agent = OffloadAgent::new(test_config(), driver(&nic));
    agent.init().await.unwrap();

    assert_eq!(agent.discovered_ports(), &[PortId(0), PortId(1)]);
    assert_eq!(nic.port_state(PortId(2)), Some(PortState::Uninitialized));
    agent.shutdown();
}

#[tokio::test]
async fn test_no_ports_is_fatal() {
    let nic = Arc::new(SimNic::new(Vec::new()));
    let mut agent = OffloadAgent::new(test_config(), driver(&nic));
    let err = agent.init().await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::ResourceSetup);
    assert!(agent.shutdown().is_clean());
}

#[tokio::test]
async fn test_missing_hairpin_capability() {
    let nic = Arc::new(SimNic::new(vec![
        SimPortSpec::new(0).with_max_hairpin_queues(0)
    ]));
    let mut agent = OffloadAgent::new(test_config(), driver(&nic));
    let err = agent.init().await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Capability);
    assert!(matches!(
        err,
        AgentError::Hairpin(HairpinError::Unsupported { .. })
    ));

    let report = agent.shutdown();
    assert!(report.is_clean(), "{:?}", report.errors);
    assert_eq!(nic.port_state(PortId(0)), Some(PortState::Closed));
}

#[tokio::test]
async fn test_tx_offloads_negotiated() {
    let capa = TxOffloads::IPV4_CKSUM.union(TxOffloads::UDP_CKSUM);
    let nic = Arc::new(SimNic::new(vec![
        SimPortSpec::new(0).with_tx_offload_capa(capa)
    ]));
    let mut agent = OffloadAgent::new(test_config(), driver(&nic));
    agent.init().await.unwrap();

    assert_eq!(nic.tx_offloads(PortId(0)), Some(capa));
    assert_eq!(agent.ports()[0].tx_offloads(), capa);
    agent.shutdown();
}

#[tokio::test]
async fn test_slow_link_is_waited_for() {
    let nic = Arc::new(SimNic::new(vec![SimPortSpec::new(0).with_link_up_after(5)]));
    let mut agent = OffloadAgent::new(test_config(), driver(&nic));
    agent.init().await.unwrap();
    assert_eq!(agent.phase(), AgentPhase::Running);
    agent.shutdown();
}

#[tokio::test]
async fn test_out_of_order_stage_never_reaches_builder() {
    let nic = Arc::new(SimNic::with_ports(1));
    let (builders, calls) = recording(&[FlowStage::InnerRss, FlowStage::TunnelDecapRss]);
    let mut agent = OffloadAgent::with_builders(test_config(), driver(&nic), builders);

    let err = agent.init().await.unwrap_err();
    assert!(matches!(
        err,
        AgentError::FlowInstall(FlowInstallError::MissingPrerequisite {
            stage: FlowStage::InnerRss,
            missing: FlowStage::TunnelDecapRss,
        })
    ));
    assert!(calls.lock().is_empty());
    assert_eq!(nic.flow_count(PortId(0)), 0);
    agent.shutdown();
}

#[tokio::test]
async fn test_builders_called_in_declared_order() {
    let nic = Arc::new(SimNic::with_ports(2));
    let stages = [
        FlowStage::TunnelDecapRss,
        FlowStage::InnerRss,
        FlowStage::HairpinForward,
        FlowStage::Counting,
        FlowStage::StateModify,
    ];
    let (builders, calls) = recording(&stages);
    let mut agent = OffloadAgent::with_builders(test_config(), driver(&nic), builders);
    agent.init().await.unwrap();

    assert_eq!(*calls.lock(), stages.to_vec());
    assert_eq!(nic.flow_count(PortId(0)), stages.len());
    assert_eq!(nic.flow_count(PortId(1)), 0);
    // One-shot counter query after the counting stage.
    assert_eq!(nic.query_count_calls(), 4);
    agent.shutdown();
}

#[tokio::test]
async fn test_flow_failure_aborts_remaining_stages() {
    let nic = Arc::new(SimNic::with_ports(2));
    nic.inject_fault(
        FaultPoint::FlowCreate("tag_set".to_string()),
        HalStatus::TableFull,
    );
    let mut agent = OffloadAgent::new(test_config(), driver(&nic));

    let err = agent.init().await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::FlowInstall);
    let installer = agent.installer().unwrap();
    assert_eq!(
        installer.installed_stages().last(),
        Some(&FlowStage::HairpinForward)
    );
    assert!(!nic
        .flows(PortId(0))
        .iter()
        .any(|f| f.name == "sample" || f.name == "tag_redirect"));

    let report = agent.shutdown();
    assert!(report.is_clean(), "{:?}", report.errors);
    assert_eq!(nic.flow_count(PortId(0)), 0);
    assert_eq!(started_ports(&nic, 2), 0);
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let nic = Arc::new(SimNic::with_ports(2));
    let mut agent = OffloadAgent::new(test_config(), driver(&nic));
    agent.init().await.unwrap();

    let first = agent.shutdown();
    assert!(first.is_clean());
    assert!(first.flows_flushed > 0);
    let calls = nic.calls().len();

    let second = agent.shutdown();
    assert!(second.is_clean());
    assert_eq!(second.flows_flushed, 0);
    assert_eq!(second.ports_closed, 0);
    assert_eq!(nic.calls().len(), calls);
}

#[tokio::test]
async fn test_partly_configured_port_is_closed() {
    let nic = Arc::new(SimNic::with_ports(2));
    nic.inject_fault(FaultPoint::RxQueueSetup(PortId(1)), HalStatus::NoMemory);
    let mut agent = OffloadAgent::new(test_config(), driver(&nic));

    let err = agent.init().await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::ResourceSetup);
    assert_eq!(nic.port_state(PortId(1)), Some(PortState::Configured));

    let report = agent.shutdown();
    assert!(report.is_clean(), "{:?}", report.errors);
    assert_eq!(report.ports_closed, 2);
    assert!(report.pool_released);
    assert_eq!(nic.port_state(PortId(0)), Some(PortState::Closed));
    assert_eq!(nic.port_state(PortId(1)), Some(PortState::Closed));
}

#[tokio::test]
async fn test_failed_stop_still_closes_port() {
    let nic = Arc::new(SimNic::with_ports(2));
    let mut agent = OffloadAgent::new(test_config(), driver(&nic));
    agent.init().await.unwrap();
    nic.inject_fault(FaultPoint::Stop(PortId(0)), HalStatus::Busy);

    let report = agent.shutdown();
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].class(), ErrorClass::ResourceSetup);
    assert_eq!(report.ports_closed, 2);
    assert!(nic.calls().contains(&SimCall::Close(PortId(0))));
    assert_eq!(nic.port_state(PortId(0)), Some(PortState::Closed));
}

#[tokio::test]
async fn test_counter_failure_stops_forwarding() {
    let nic = Arc::new(SimNic::with_ports(1));
    nic.set_synthetic_rx(PortId(0), 1);
    let mut agent = OffloadAgent::new(test_config(), driver(&nic));
    agent.init().await.unwrap();

    nic.inject_fault(FaultPoint::QueryCount, HalStatus::Timeout);
    let forwarding = agent.forwarding_loop().unwrap();
    let result = tokio::task::spawn_blocking(move || forwarding.run(CancellationToken::new()))
        .await
        .unwrap();
    let err = AgentError::from(result.unwrap_err());
    assert_eq!(err.class(), ErrorClass::CounterQuery);
    assert!(!err.is_retryable());

    assert!(agent.shutdown().is_clean());
}

#[tokio::test]
async fn test_counter_budget_tolerates_transient_failures() {
    let nic = Arc::new(SimNic::with_ports(1));
    nic.set_synthetic_rx(PortId(0), 1);
    let mut config = test_config();
    config.forwarding.counter_failure_budget = 1000;
    let mut agent = OffloadAgent::new(config, driver(&nic));
    agent.init().await.unwrap();

    nic.inject_fault(FaultPoint::QueryCount, HalStatus::Busy);
    let mut forwarding = agent.forwarding_loop().unwrap();
    let report = forwarding.run_pass().unwrap();
    assert_eq!(report.rx, 8);
    assert_eq!(report.tx, 8);
    agent.shutdown();
}

#[tokio::test]
async fn test_optional_stages_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.toml");
    std::fs::write(
        &path,
        r#"
[link]
check_interval_ms = 1

[flows]
optional_stages = ["metering", "shared-inner-rss"]
"#,
    )
    .unwrap();
    let config = AgentConfig::load(&path).unwrap();

    let nic = Arc::new(SimNic::with_ports(2));
    let mut agent = OffloadAgent::new(config, driver(&nic));
    agent.init().await.unwrap();
    let installer = agent.installer().unwrap();
    assert!(installer.is_installed(FlowStage::Metering));
    assert!(installer.is_installed(FlowStage::SharedInnerRss));
    agent.shutdown();
}

#[test]
fn test_bind_before_start_rejected() {
    let nic = SimNic::with_ports(2);
    let pool = nic.pool_create(&PoolParams::default()).unwrap();
    let layout = QueueLayout::new(8, 1).unwrap();
    let configurator = PortConfigurator::new(&nic, layout, 512);
    let ports = vec![
        configurator.configure(PortId(0), &pool).unwrap(),
        configurator.configure(PortId(1), &pool).unwrap(),
    ];

    let mut topology = HairpinTopology::plan(&[PortId(0), PortId(1)], layout, 512).unwrap();
    topology.setup(&nic, &ports).unwrap();
    let err = topology.bind(&nic, &ports).unwrap_err();
    assert!(matches!(err, HairpinError::PortState { .. }));
    assert!(!nic
        .calls()
        .iter()
        .any(|c| matches!(c, SimCall::HairpinBind { .. })));
}
