use std::fmt;

/// Kind of trace notification emitted by the filtering engine.
/// Values match `enum nft_trace_types` in the kernel uapi.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TraceType {
    Unspec = 0,
    Policy = 1,
    Return = 2,
    Rule = 3,
}

impl TraceType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unspec => "unspec",
            Self::Policy => "policy",
            Self::Return => "return",
            Self::Rule => "rule",
        }
    }

    /// Convert from a raw u8 value.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Unspec),
            1 => Some(Self::Policy),
            2 => Some(Self::Return),
            3 => Some(Self::Rule),
            _ => None,
        }
    }
}

impl fmt::Display for TraceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rule verdict. Non-negative codes are netfilter hook responses, negative
/// codes are nftables chain-control verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Verdict {
    Drop = 0,
    Accept = 1,
    Stolen = 2,
    Queue = 3,
    Repeat = 4,
    Stop = 5,
    Continue = -1,
    Break = -2,
    Jump = -3,
    Goto = -4,
    Return = -5,
}

impl Verdict {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Drop => "drop",
            Self::Accept => "accept",
            Self::Stolen => "stolen",
            Self::Queue => "queue",
            Self::Repeat => "repeat",
            Self::Stop => "stop",
            Self::Continue => "continue",
            Self::Break => "break",
            Self::Jump => "jump",
            Self::Goto => "goto",
            Self::Return => "return",
        }
    }

    /// Convert from a raw verdict code. Queue verdicts carry the queue number
    /// in the upper bits, so only the low byte of a non-negative code counts.
    pub fn from_code(code: i32) -> Option<Self> {
        let code = if code >= 0 { code & 0xff } else { code };
        match code {
            0 => Some(Self::Drop),
            1 => Some(Self::Accept),
            2 => Some(Self::Stolen),
            3 => Some(Self::Queue),
            4 => Some(Self::Repeat),
            5 => Some(Self::Stop),
            -1 => Some(Self::Continue),
            -2 => Some(Self::Break),
            -3 => Some(Self::Jump),
            -4 => Some(Self::Goto),
            -5 => Some(Self::Return),
            _ => None,
        }
    }

    /// Whether the verdict transfers control to another chain.
    pub const fn has_target(self) -> bool {
        matches!(self, Self::Jump | Self::Goto)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Netfilter protocol family (`NFPROTO_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Family {
    Inet = 1,
    Ipv4 = 2,
    Arp = 3,
    Netdev = 5,
    Bridge = 7,
    Ipv6 = 10,
}

impl Family {
    /// nft(8) table family keyword.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inet => "inet",
            Self::Ipv4 => "ip",
            Self::Arp => "arp",
            Self::Netdev => "netdev",
            Self::Bridge => "bridge",
            Self::Ipv6 => "ip6",
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Inet),
            2 => Some(Self::Ipv4),
            3 => Some(Self::Arp),
            5 => Some(Self::Netdev),
            7 => Some(Self::Bridge),
            10 => Some(Self::Ipv6),
            _ => None,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

/// Short name for an IP protocol number, as printed by nft(8).
pub const fn ip_proto_name(proto: u8) -> Option<&'static str> {
    match proto {
        IPPROTO_ICMP => Some("icmp"),
        2 => Some("igmp"),
        4 => Some("ipip"),
        IPPROTO_TCP => Some("tcp"),
        IPPROTO_UDP => Some("udp"),
        41 => Some("ipv6"),
        47 => Some("gre"),
        50 => Some("esp"),
        51 => Some("ah"),
        IPPROTO_ICMPV6 => Some("icmpv6"),
        132 => Some("sctp"),
        136 => Some("udplite"),
        _ => None,
    }
}
