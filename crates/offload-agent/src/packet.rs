//! Decoded per-packet diagnostics logged by the forwarding loop.

use std::fmt;
use std::net::Ipv4Addr;

use offload_hal::{FdirMatch, RxOffloadInfo};
use offload_types::{MacAddress, QueueId};

const ETH_HDR_LEN: usize = 14;
const ETHERTYPE_IPV4: u16 = 0x0800;
const IPV4_MIN_HDR_LEN: usize = 20;

/// Header fields and hardware metadata of one received packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketSummary {
    pub src_mac: MacAddress,
    pub dst_mac: MacAddress,
    /// Present only for IPv4 frames.
    pub src_ip: Option<Ipv4Addr>,
    pub dst_ip: Option<Ipv4Addr>,
    pub queue: QueueId,
    pub rss_hash: Option<u32>,
    pub fdir: Option<FdirMatch>,
}

impl PacketSummary {
    /// Decodes `frame`. Returns `None` for runt frames without an Ethernet
    /// header.
    pub fn parse(frame: &[u8], queue: QueueId, offload: &RxOffloadInfo) -> Option<Self> {
        if frame.len() < ETH_HDR_LEN {
            return None;
        }
        let dst_mac = MacAddress::from_slice(&frame[0..6])?;
        let src_mac = MacAddress::from_slice(&frame[6..12])?;
        let ethertype = u16::from_be_bytes([frame[12], frame[13]]);

        let ip = &frame[ETH_HDR_LEN..];
        let (src_ip, dst_ip) = if ethertype == ETHERTYPE_IPV4 && ip.len() >= IPV4_MIN_HDR_LEN {
            (
                Some(Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15])),
                Some(Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19])),
            )
        } else {
            (None, None)
        };

        Some(Self {
            src_mac,
            dst_mac,
            src_ip,
            dst_ip,
            queue,
            rss_hash: offload.rss_hash,
            fdir: offload.fdir,
        })
    }
}

impl fmt::Display for PacketSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "src_mac={} - dst_mac={}", self.src_mac, self.dst_mac)?;
        if let (Some(src), Some(dst)) = (self.src_ip, self.dst_ip) {
            write!(f, " - src_ip={} - dst_ip={}", src, dst)?;
        }
        write!(f, " - queue={:#x}", self.queue)?;
        if let Some(hash) = self.rss_hash {
            write!(f, " - RSS hash={:#x} - RSS queue={:#x}", hash, self.queue)?;
        }
        match self.fdir {
            Some(FdirMatch::Id(id)) => write!(f, " - FDIR matched ID={:#x}", id),
            Some(FdirMatch::Flex { hi, lo }) => {
                write!(f, " - FDIR matched flex bytes=0x{:08x} {:08x}", hi, lo)
            }
            Some(FdirMatch::Hash { hash, id }) => {
                write!(f, " - FDIR matched hash={:#x} ID={:#x}", hash, id)
            }
            None => Ok(()),
        }
    }
}
