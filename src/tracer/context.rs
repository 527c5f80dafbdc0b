//! Read-only view of one trace notification, as handed over by the
//! filtering engine at its trace point.

use serde::{Deserialize, Serialize};

/// Snapshot of the packet buffer and the per-packet identity fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketSnapshot {
    /// Identity of the packet memory (the skb address in the kernel).
    pub identity: u64,
    pub flow_hash: u32,
    /// Ingress interface index recorded on the packet.
    pub iif: u32,
    pub mark: u32,
    /// Linear buffer contents starting at the buffer head.
    pub data: Vec<u8>,
    /// Offset of the link-layer header, when one is set.
    pub mac_header: Option<u16>,
    /// Offset of the network header.
    pub network_header: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetDevice {
    pub ifindex: u32,
    pub dev_type: u16,
    pub name: String,
}

/// Hook state: the protocol the hook runs for and the devices involved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookState {
    pub nfproto: u8,
    pub in_dev: Option<NetDevice>,
    pub out_dev: Option<NetDevice>,
}

/// Base chain and owning table of the rule being evaluated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseChain {
    pub table_name: String,
    pub table_handle: u64,
    pub family: u8,
    pub chain_name: String,
    pub chain_handle: u64,
    pub policy: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerdictState {
    pub code: i32,
    /// Target chain for jump and goto verdicts.
    pub chain: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceContext {
    pub packet: PacketSnapshot,
    pub hook: HookState,
    pub chain: BaseChain,
    pub rule_handle: u64,
    pub trace_type: u8,
    pub verdict: VerdictState,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_partial_context() {
        let json = r#"{
            "packet": {"identity": 42, "flow_hash": 7, "data": [1, 2, 3], "network_header": 0},
            "chain": {"table_name": "filter", "chain_name": "input", "family": 2},
            "rule_handle": 4,
            "trace_type": 3,
            "verdict": {"code": -3, "chain": "allowed"}
        }"#;

        let ctx: TraceContext = serde_json::from_str(json).unwrap();
        assert_eq!(ctx.packet.identity, 42);
        assert_eq!(ctx.packet.data, vec![1, 2, 3]);
        assert_eq!(ctx.packet.mac_header, None);
        assert_eq!(ctx.chain.table_name, "filter");
        assert_eq!(ctx.hook.in_dev, None);
        assert_eq!(ctx.verdict.chain.as_deref(), Some("allowed"));
    }

    #[test]
    fn test_empty_object_is_default() {
        let ctx: TraceContext = serde_json::from_str("{}").unwrap();
        assert_eq!(ctx, TraceContext::default());
    }
}
