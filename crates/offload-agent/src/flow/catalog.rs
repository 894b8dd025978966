//! Built-in flow programs.
//!
//! One [`CatalogRule`] per [`FlowStage`]. Each produces plain [`FlowSpec`]
//! descriptors; the driver decides how to compile them.

use std::net::Ipv4Addr;

use offload_hal::flow::ModifyField;
use offload_hal::{FlowAction, FlowAttr, FlowItem, FlowSpec, HalError, HalResult, RssTypes};
use offload_types::{PortId, QueueId};

use super::builder::{FlowHandle, RuleBuilder, RuleContext};
use super::stage::FlowStage;
use crate::config::AgentConfig;

const GTPU_PORT: u16 = 2152;
const DEST_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
const GTPU_TAG: u32 = 0x1;
const REDIRECT_TAG: u32 = 0x55;
const BRIDGE_META: u32 = 0x1234;
const OUTER_UDP_LEN: u16 = 14 + 20 + 8;

type Programs = HalResult<Vec<(PortId, FlowSpec)>>;

/// A built-in rule set for one stage.
pub struct CatalogRule {
    stage: FlowStage,
    name: &'static str,
    programs: fn(&RuleContext<'_>) -> Programs,
}

impl CatalogRule {
    /// Returns the built-in rule set for `stage`.
    pub fn for_stage(stage: FlowStage) -> Self {
        let (name, programs): (&'static str, fn(&RuleContext<'_>) -> Programs) = match stage {
            FlowStage::TunnelDecapRss => ("GTP-U decap RSS", gtpu_decap_rss),
            FlowStage::InnerRss => ("GTP-U inner IP RSS", gtpu_inner_rss),
            FlowStage::Encap => ("GTP-U encap", gtpu_encap),
            FlowStage::HairpinForward => ("hairpin forward", hairpin_forward),
            FlowStage::Tag => ("tag redirect", tag_redirect),
            FlowStage::Observe => ("sampling and mirror", observe),
            FlowStage::SymmetricRss => ("symmetric RSS", symmetric_rss),
            FlowStage::Metering => ("meter", metering),
            FlowStage::Aging => ("age", aging),
            FlowStage::GreTunnel => ("GRE decap RSS and encap", gre_tunnel),
            FlowStage::HairpinMeta => ("hairpin meta", hairpin_meta),
            FlowStage::SharedInnerRss => ("GTP-U shared inner RSS", shared_inner_rss),
            FlowStage::Counting => ("counter", counting),
            FlowStage::StateModify => ("modify GTP-U TEID", modify_teid),
        };
        Self {
            stage,
            name,
            programs,
        }
    }

    /// Returns the programs this rule would install, without installing.
    pub fn programs(&self, ctx: &RuleContext<'_>) -> Programs {
        (self.programs)(ctx)
    }
}

impl RuleBuilder for CatalogRule {
    fn stage(&self) -> FlowStage {
        self.stage
    }

    fn name(&self) -> &str {
        self.name
    }

    fn build(&self, ctx: &RuleContext<'_>) -> HalResult<Vec<FlowHandle>> {
        self.programs(ctx)?
            .iter()
            .map(|(port, spec)| ctx.create(*port, spec))
            .collect()
    }
}

/// The default installation sequence for `port_count` ports.
///
/// Optional stages are included only when enabled in `config`; the
/// bridge-only stage only with two ports.
pub fn default_plan(config: &AgentConfig, port_count: usize) -> Vec<Box<dyn RuleBuilder>> {
    FlowStage::ALL
        .iter()
        .copied()
        .filter(|stage| config.stage_enabled(*stage))
        .filter(|stage| !stage.requires_two_ports() || port_count >= 2)
        .map(|stage| Box::new(CatalogRule::for_stage(stage)) as Box<dyn RuleBuilder>)
        .collect()
}

fn rss_queue(ctx: &RuleContext<'_>, index: usize) -> HalResult<QueueId> {
    let queues = ctx.rss_queues();
    if queues.is_empty() {
        return Err(HalError::invalid_parameter("empty RSS queue set"));
    }
    Ok(queues[index % queues.len()])
}

fn hairpin_queue(ctx: &RuleContext<'_>) -> HalResult<QueueId> {
    ctx.first_hairpin_queue()
        .ok_or_else(|| HalError::invalid_parameter("no hairpin queue in topology"))
}

fn rss(ctx: &RuleContext<'_>, types: RssTypes, level: u32, symmetric: bool) -> FlowAction {
    FlowAction::Rss {
        queues: ctx.rss_queues().to_vec(),
        types,
        level,
        symmetric,
    }
}

fn gtpu_match(teid: Option<u32>) -> Vec<FlowItem> {
    vec![
        FlowItem::Eth,
        FlowItem::Ipv4 {
            src: None,
            dst: None,
        },
        FlowItem::Udp {
            dst_port: Some(GTPU_PORT),
        },
        FlowItem::GtpU { teid },
    ]
}

fn any_ipv4() -> FlowItem {
    FlowItem::Ipv4 {
        src: None,
        dst: None,
    }
}

fn spec(name: &str, attr: FlowAttr, pattern: Vec<FlowItem>, actions: Vec<FlowAction>) -> FlowSpec {
    FlowSpec {
        name: name.to_string(),
        attr,
        pattern,
        actions,
    }
}

/// Outer Ethernet/IPv4/UDP header followed by `tunnel`.
fn outer_header(dst_port: u16, tunnel: &[u8]) -> Vec<u8> {
    let mut h = Vec::with_capacity(usize::from(OUTER_UDP_LEN) + tunnel.len());
    h.extend_from_slice(&[0u8; 12]);
    h.extend_from_slice(&0x0800u16.to_be_bytes());
    h.extend_from_slice(&[0x45, 0, 0, 0, 0, 0, 0x40, 0, 64, 17, 0, 0]);
    h.extend_from_slice(&Ipv4Addr::UNSPECIFIED.octets());
    h.extend_from_slice(&DEST_IP.octets());
    h.extend_from_slice(&GTPU_PORT.to_be_bytes());
    h.extend_from_slice(&dst_port.to_be_bytes());
    h.extend_from_slice(&[0, 0, 0, 0]);
    h.extend_from_slice(tunnel);
    h
}

/// GTP-U header, optionally carrying a PDU session container with `qfi`.
fn gtpu_header(teid: u32, psc_qfi: Option<u8>) -> Vec<u8> {
    let mut h = Vec::with_capacity(16);
    match psc_qfi {
        None => {
            h.extend_from_slice(&[0x30, 0xff, 0, 0]);
            h.extend_from_slice(&teid.to_be_bytes());
        }
        Some(qfi) => {
            h.extend_from_slice(&[0x34, 0xff, 0, 0]);
            h.extend_from_slice(&teid.to_be_bytes());
            // seq, n-pdu, next extension = PDU session container
            h.extend_from_slice(&[0, 0, 0, 0x85]);
            h.extend_from_slice(&[1, 0x10, qfi & 0x3f, 0]);
        }
    }
    h
}

fn gtpu_decap_rss(ctx: &RuleContext<'_>) -> Programs {
    rss_queue(ctx, 0)?;
    Ok(vec![(
        ctx.port(),
        spec(
            "gtpu_decap_rss",
            FlowAttr::ingress(0),
            gtpu_match(None),
            vec![
                FlowAction::RawDecap {
                    size: OUTER_UDP_LEN + 8,
                },
                FlowAction::SetTag {
                    index: 0,
                    data: GTPU_TAG,
                },
                rss(ctx, RssTypes::IP.union(RssTypes::UDP), 0, false),
            ],
        ),
    )])
}

fn gtpu_inner_rss(ctx: &RuleContext<'_>) -> Programs {
    rss_queue(ctx, 0)?;
    Ok(vec![(
        ctx.port(),
        spec(
            "gtpu_inner_ip_rss",
            FlowAttr::ingress(0).with_priority(1),
            vec![
                FlowItem::Tag {
                    index: 0,
                    data: GTPU_TAG,
                },
                any_ipv4(),
            ],
            vec![rss(ctx, RssTypes::IP, 2, false)],
        ),
    )])
}

fn gtpu_encap(ctx: &RuleContext<'_>) -> Programs {
    let pattern = vec![
        FlowItem::Eth,
        FlowItem::Ipv4 {
            src: None,
            dst: Some(DEST_IP),
        },
    ];
    Ok(vec![
        (
            ctx.port(),
            spec(
                "gtpu_encap",
                FlowAttr::egress(0),
                pattern.clone(),
                vec![FlowAction::RawEncap {
                    header: outer_header(GTPU_PORT, &gtpu_header(1, None)),
                }],
            ),
        ),
        (
            ctx.port(),
            spec(
                "gtpu_psc_encap",
                FlowAttr::egress(0).with_priority(1),
                pattern,
                vec![FlowAction::RawEncap {
                    header: outer_header(GTPU_PORT, &gtpu_header(1, Some(9))),
                }],
            ),
        ),
    ])
}

fn hairpin_forward(ctx: &RuleContext<'_>) -> Programs {
    let queue = hairpin_queue(ctx)?;
    let programs = match ctx.peer_port() {
        None => vec![(
            ctx.port(),
            spec(
                "hairpin_loopback",
                FlowAttr::ingress(0).with_priority(2),
                vec![
                    FlowItem::Eth,
                    FlowItem::Ipv4 {
                        src: None,
                        dst: Some(DEST_IP),
                    },
                    FlowItem::Tcp,
                ],
                vec![FlowAction::Queue(queue)],
            ),
        )],
        // Everything received on either side of the bridge crosses over.
        Some(_) => ctx
            .ports()
            .into_iter()
            .map(|port| {
                (
                    port,
                    spec(
                        "hairpin_bridge",
                        FlowAttr::ingress(0).with_priority(3),
                        vec![FlowItem::Eth],
                        vec![FlowAction::Queue(queue)],
                    ),
                )
            })
            .collect(),
    };
    Ok(programs)
}

fn tag_redirect(ctx: &RuleContext<'_>) -> Programs {
    let target = rss_queue(ctx, 0)?;
    Ok(vec![
        (
            ctx.port(),
            spec(
                "tag_set",
                FlowAttr::ingress(0),
                vec![
                    FlowItem::Eth,
                    FlowItem::Ipv4 {
                        src: None,
                        dst: Some(DEST_IP),
                    },
                    FlowItem::Udp { dst_port: None },
                ],
                vec![
                    FlowAction::SetTag {
                        index: 1,
                        data: REDIRECT_TAG,
                    },
                    FlowAction::Jump { group: 1 },
                ],
            ),
        ),
        (
            ctx.port(),
            spec(
                "tag_redirect",
                FlowAttr::ingress(1),
                vec![FlowItem::Tag {
                    index: 1,
                    data: REDIRECT_TAG,
                }],
                vec![FlowAction::Queue(target)],
            ),
        ),
    ])
}

fn observe(ctx: &RuleContext<'_>) -> Programs {
    let primary = rss_queue(ctx, 0)?;
    let sample_to = rss_queue(ctx, 1)?;
    let mirror_queue = hairpin_queue(ctx)?;
    let mirror_port = ctx.peer_port().unwrap_or(ctx.port());
    Ok(vec![
        (
            ctx.port(),
            spec(
                "sample",
                FlowAttr::ingress(1).with_priority(1),
                vec![FlowItem::Eth, any_ipv4(), FlowItem::Udp { dst_port: None }],
                vec![
                    FlowAction::Sample {
                        ratio: 2,
                        queue: sample_to,
                    },
                    FlowAction::Queue(primary),
                ],
            ),
        ),
        (
            ctx.port(),
            spec(
                "mirror",
                FlowAttr::ingress(1).with_priority(2),
                vec![FlowItem::Eth, any_ipv4(), FlowItem::Tcp],
                vec![
                    FlowAction::Mirror {
                        port: mirror_port,
                        queue: Some(mirror_queue),
                    },
                    FlowAction::Queue(primary),
                ],
            ),
        ),
    ])
}

fn symmetric_rss(ctx: &RuleContext<'_>) -> Programs {
    rss_queue(ctx, 0)?;
    Ok(vec![(
        ctx.port(),
        spec(
            "symmetric_rss",
            FlowAttr::ingress(0).with_priority(4),
            vec![FlowItem::Eth, any_ipv4(), FlowItem::Tcp],
            vec![rss(ctx, RssTypes::IP.union(RssTypes::TCP), 0, true)],
        ),
    )])
}

fn metering(ctx: &RuleContext<'_>) -> Programs {
    let target = rss_queue(ctx, 0)?;
    Ok(vec![(
        ctx.port(),
        spec(
            "meter",
            FlowAttr::ingress(1).with_priority(3),
            vec![FlowItem::Eth, any_ipv4()],
            vec![FlowAction::Meter { id: 1 }, FlowAction::Queue(target)],
        ),
    )])
}

fn aging(ctx: &RuleContext<'_>) -> Programs {
    let target = rss_queue(ctx, 0)?;
    Ok(vec![(
        ctx.port(),
        spec(
            "age",
            FlowAttr::ingress(1).with_priority(4),
            vec![
                FlowItem::Eth,
                FlowItem::Ipv4 {
                    src: Some(Ipv4Addr::new(10, 0, 0, 1)),
                    dst: None,
                },
                FlowItem::Udp { dst_port: None },
            ],
            vec![
                FlowAction::Age { timeout_secs: 10 },
                FlowAction::Queue(target),
            ],
        ),
    )])
}

fn gre_tunnel(ctx: &RuleContext<'_>) -> Programs {
    rss_queue(ctx, 0)?;
    let gre = [0u8, 0, 0x08, 0x00];
    Ok(vec![
        (
            ctx.port(),
            spec(
                "gre_decap_rss",
                FlowAttr::ingress(0).with_priority(1),
                vec![
                    FlowItem::Eth,
                    any_ipv4(),
                    FlowItem::Gre {
                        protocol: Some(0x0800),
                    },
                ],
                vec![
                    FlowAction::RawDecap {
                        size: 14 + 20 + 4,
                    },
                    rss(ctx, RssTypes::IP, 0, false),
                ],
            ),
        ),
        (
            ctx.port(),
            spec(
                "gre_encap",
                FlowAttr::egress(0).with_priority(2),
                vec![FlowItem::Eth, any_ipv4(), FlowItem::Tcp],
                vec![FlowAction::RawEncap {
                    header: gre.to_vec(),
                }],
            ),
        ),
    ])
}

fn hairpin_meta(ctx: &RuleContext<'_>) -> Programs {
    let queue = hairpin_queue(ctx)?;
    let peer = ctx
        .peer_port()
        .ok_or_else(|| HalError::invalid_parameter("hairpin meta needs a bridge peer"))?;
    Ok(vec![
        (
            ctx.port(),
            spec(
                "hairpin_meta_set",
                FlowAttr::ingress(0).with_priority(2),
                vec![FlowItem::Eth, any_ipv4(), FlowItem::Udp { dst_port: None }],
                vec![
                    FlowAction::SetMeta { data: BRIDGE_META },
                    FlowAction::Queue(queue),
                ],
            ),
        ),
        (
            peer,
            spec(
                "hairpin_meta_match",
                FlowAttr::egress(0),
                vec![FlowItem::Meta { data: BRIDGE_META }],
                vec![FlowAction::ModifyField {
                    field: ModifyField::MacDst,
                    value: 0x0200_0000_00ff,
                }],
            ),
        ),
    ])
}

fn shared_inner_rss(ctx: &RuleContext<'_>) -> Programs {
    rss_queue(ctx, 0)?;
    Ok(vec![(
        ctx.port(),
        spec(
            "gtpu_inner_ip_shared_rss",
            FlowAttr::ingress(0).with_priority(2),
            vec![
                FlowItem::Tag {
                    index: 0,
                    data: GTPU_TAG,
                },
                any_ipv4(),
                FlowItem::Udp { dst_port: None },
            ],
            vec![FlowAction::SharedRss(1)],
        ),
    )])
}

fn counting(ctx: &RuleContext<'_>) -> Programs {
    let first = rss_queue(ctx, 0)?;
    let second = rss_queue(ctx, 1)?;
    Ok(vec![
        (
            ctx.port(),
            spec(
                "count_gtpu",
                FlowAttr::ingress(1).with_priority(5),
                gtpu_match(None),
                vec![FlowAction::Count, FlowAction::Queue(first)],
            ),
        ),
        (
            ctx.port(),
            spec(
                "count_ipv4",
                FlowAttr::ingress(1).with_priority(6),
                vec![FlowItem::Eth, any_ipv4()],
                vec![FlowAction::Count, FlowAction::Queue(second)],
            ),
        ),
    ])
}

fn modify_teid(ctx: &RuleContext<'_>) -> Programs {
    let target = rss_queue(ctx, 0)?;
    let rewrite = |name: &str, from: u32, to: u32| {
        (
            ctx.port(),
            spec(
                name,
                FlowAttr::ingress(1).with_priority(7),
                gtpu_match(Some(from)),
                vec![
                    FlowAction::ModifyField {
                        field: ModifyField::GtpTeid,
                        value: u64::from(to),
                    },
                    FlowAction::Queue(target),
                ],
            ),
        )
    };
    Ok(vec![
        rewrite("modify_gtp_teid_up", 0x1234, 0x5678),
        rewrite("modify_gtp_teid_down", 0x5678, 0x1234),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use offload_hal::sim::SimNic;
    use pretty_assertions::assert_eq;

    const PERM: [QueueId; 8] = [1, 3, 2, 4, 5, 7, 0, 6];

    #[test]
    fn test_default_plan_one_port_skips_bridge_and_optional() {
        let plan = default_plan(&AgentConfig::default(), 1);
        let stages: Vec<FlowStage> = plan.iter().map(|b| b.stage()).collect();
        assert!(!stages.contains(&FlowStage::HairpinMeta));
        assert!(!stages.contains(&FlowStage::Metering));
        assert!(!stages.contains(&FlowStage::SharedInnerRss));
        assert_eq!(stages.first(), Some(&FlowStage::TunnelDecapRss));
        assert_eq!(stages.last(), Some(&FlowStage::StateModify));
    }

    #[test]
    fn test_default_plan_two_ports_with_optional() {
        let mut config = AgentConfig::default();
        config.flows.optional_stages = vec![FlowStage::Metering, FlowStage::SharedInnerRss];
        let stages: Vec<FlowStage> = default_plan(&config, 2).iter().map(|b| b.stage()).collect();
        assert_eq!(stages, FlowStage::ALL.to_vec());
    }

    #[test]
    fn test_rss_programs_keep_permutation() {
        let nic = SimNic::with_ports(1);
        let ctx = RuleContext::new(&nic, PortId(0), &PERM).with_hairpin_queues(8..9);
        for stage in [FlowStage::TunnelDecapRss, FlowStage::InnerRss, FlowStage::GreTunnel] {
            let programs = CatalogRule::for_stage(stage).programs(&ctx).unwrap();
            let queues = programs[0].1.rss_queues().unwrap();
            assert_eq!(queues, &PERM[..]);
        }
    }

    #[test]
    fn test_hairpin_forward_modes() {
        let nic = SimNic::with_ports(2);
        let rule = CatalogRule::for_stage(FlowStage::HairpinForward);

        let one = RuleContext::new(&nic, PortId(0), &PERM).with_hairpin_queues(8..9);
        let programs = rule.programs(&one).unwrap();
        assert_eq!(programs.len(), 1);
        assert_eq!(programs[0].1.actions, vec![FlowAction::Queue(8)]);

        let two = RuleContext::new(&nic, PortId(0), &PERM)
            .with_peer(Some(PortId(1)))
            .with_hairpin_queues(8..9);
        let ports: Vec<PortId> = rule.programs(&two).unwrap().iter().map(|(p, _)| *p).collect();
        assert_eq!(ports, vec![PortId(0), PortId(1)]);
    }

    #[test]
    fn test_hairpin_rules_need_hairpin_queue() {
        let nic = SimNic::with_ports(1);
        let ctx = RuleContext::new(&nic, PortId(0), &PERM);
        assert!(CatalogRule::for_stage(FlowStage::HairpinForward)
            .programs(&ctx)
            .is_err());
        assert!(CatalogRule::for_stage(FlowStage::Observe).programs(&ctx).is_err());
    }

    #[test]
    fn test_counting_programs_are_counted() {
        let nic = SimNic::with_ports(1);
        let ctx = RuleContext::new(&nic, PortId(0), &PERM);
        let programs = CatalogRule::for_stage(FlowStage::Counting)
            .programs(&ctx)
            .unwrap();
        assert!(programs.iter().all(|(_, s)| s.has_counter()));
    }

    #[test]
    fn test_gtpu_psc_header() {
        let plain = gtpu_header(0x0102_0304, None);
        assert_eq!(plain, vec![0x30, 0xff, 0, 0, 1, 2, 3, 4]);
        let psc = gtpu_header(1, Some(9));
        assert_eq!(psc.len(), 16);
        assert_eq!(psc[11], 0x85);
        assert_eq!(psc[14], 9);
    }
}
