//! The trace record: the unit published to the output channel.

use std::borrow::Cow;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::event::{Family, TraceType, Verdict};

/// Capacity of table, chain and jump-target name buffers.
pub const NAME_LEN: usize = 64;
/// Capacity of interface name buffers.
pub const IFNAME_LEN: usize = 16;

/// Fixed-capacity, NUL-bounded byte string.
///
/// At most `N - 1` bytes are stored, so the last byte is always zero even
/// when the source is longer than the buffer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FixedName<const N: usize> {
    bytes: [u8; N],
}

impl<const N: usize> FixedName<N> {
    /// Copy `src` up to its first NUL, truncated to `N - 1` bytes.
    pub fn from_bytes(src: &[u8]) -> Self {
        let mut bytes = [0u8; N];
        let end = src
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(src.len())
            .min(N.saturating_sub(1));
        if let (Some(dst), Some(src)) = (bytes.get_mut(..end), src.get(..end)) {
            dst.copy_from_slice(src);
        }
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        let end = self.bytes.iter().position(|&b| b == 0).unwrap_or(N);
        self.bytes.get(..end).unwrap_or_default()
    }

    pub fn to_str_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.as_bytes())
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.first().map_or(true, |&b| b == 0)
    }

    /// The whole backing buffer including the NUL padding.
    pub fn raw(&self) -> &[u8; N] {
        &self.bytes
    }
}

impl<const N: usize> Default for FixedName<N> {
    fn default() -> Self {
        Self { bytes: [0u8; N] }
    }
}

impl<const N: usize> From<&str> for FixedName<N> {
    fn from(s: &str) -> Self {
        Self::from_bytes(s.as_bytes())
    }
}

impl<const N: usize> fmt::Display for FixedName<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_str_lossy())
    }
}

impl<const N: usize> fmt::Debug for FixedName<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.to_str_lossy(), f)
    }
}

/// Ethernet hardware address.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 6]
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// One rule-match trace, possibly merged from several notifications for
/// the same packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceRecord {
    // Identity.
    pub id: u32,
    pub counter: u64,
    pub time: u64,

    // Rule evaluation.
    pub table_name: FixedName<NAME_LEN>,
    pub table_handle: u64,
    pub chain_name: FixedName<NAME_LEN>,
    pub chain_handle: u64,
    pub rule_handle: u64,
    pub jump_target: FixedName<NAME_LEN>,
    pub trace_type: u8,
    pub policy: u8,
    pub verdict: i32,

    // Network context.
    pub family: u8,
    pub nfproto: u8,
    pub mark: u32,
    pub iif: u32,
    pub oif: u32,
    pub iif_type: u16,
    pub oif_type: u16,
    pub iif_name: FixedName<IFNAME_LEN>,
    pub oif_name: FixedName<IFNAME_LEN>,
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub src_ip: [u8; 4],
    pub dst_ip: [u8; 4],
    pub src_ip6: [u8; 16],
    pub dst_ip6: [u8; 16],
    pub src_port: u16,
    pub dst_port: u16,
    pub ip_proto: u8,
    pub len: u16,
}

impl TraceRecord {
    pub fn trace_type(&self) -> Option<TraceType> {
        TraceType::from_u8(self.trace_type)
    }

    pub fn verdict(&self) -> Option<Verdict> {
        Verdict::from_code(self.verdict)
    }

    pub fn family(&self) -> Option<Family> {
        Family::from_u8(self.family)
    }

    /// Source address, preferring IPv4 when both are present.
    pub fn src_addr(&self) -> Option<IpAddr> {
        pick_addr(self.src_ip, self.src_ip6)
    }

    pub fn dst_addr(&self) -> Option<IpAddr> {
        pick_addr(self.dst_ip, self.dst_ip6)
    }
}

fn pick_addr(v4: [u8; 4], v6: [u8; 16]) -> Option<IpAddr> {
    if v4 != [0u8; 4] {
        Some(IpAddr::V4(Ipv4Addr::from(v4)))
    } else if v6 != [0u8; 16] {
        Some(IpAddr::V6(Ipv6Addr::from(v6)))
    } else {
        None
    }
}
