//! The trace-notification hot path.
//!
//! Runs synchronously to completion on the notifying core: no waiting, no
//! allocation, no logging. Every degradation is counted in
//! [`PipelineStats`] and the cheaper path is taken: aggregation falls back
//! to direct emission, and direct emission falls back to a counted drop.

use std::sync::Arc;

use crate::sink::aggregated::{Absorbed, AggregationState, Fallback};
use crate::sink::output::OutputChannel;

use super::context::TraceContext;
use super::event::{TraceType, Verdict};
use super::extract::extract_headers;
use super::hash::trace_id;
use super::monotonic_ns;
use super::record::{FixedName, TraceRecord};
use super::sampler::Sampler;
use super::settings::Settings;
use super::stats::{PipelineStats, StatKind};

/// What happened to one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Not a rule-match notification.
    Filtered,
    SampledOut,
    /// Published straight to the output channel.
    Emitted,
    /// Direct publish failed; the record is gone.
    Dropped,
    /// Stored as a new record awaiting flush.
    Aggregated,
    /// Folded into an existing record.
    Merged,
}

pub struct TraceProbe {
    settings: Arc<Settings>,
    sampler: Sampler,
    stats: Arc<PipelineStats>,
    aggregation: Option<Arc<AggregationState>>,
    output: OutputChannel,
}

impl TraceProbe {
    /// `aggregation` is `None` for a pipeline started in direct mode.
    pub fn new(
        settings: Arc<Settings>,
        stats: Arc<PipelineStats>,
        aggregation: Option<Arc<AggregationState>>,
        output: OutputChannel,
    ) -> Self {
        Self {
            settings,
            sampler: Sampler::new(),
            stats,
            aggregation,
            output,
        }
    }

    /// Handle one trace notification on `cpu`.
    pub fn on_trace(&self, cpu: usize, ctx: &TraceContext) -> ProbeOutcome {
        if ctx.trace_type != TraceType::Rule as u8 {
            self.stats.record(StatKind::Filtered);
            return ProbeOutcome::Filtered;
        }

        self.stats.record(StatKind::PacketsSeen);
        if !self.sampler.admit(self.settings.sample_rate()) {
            self.stats.record(StatKind::SampledOut);
            return ProbeOutcome::SampledOut;
        }

        let record = build_record(ctx, monotonic_ns());

        let aggregation = self
            .aggregation
            .as_deref()
            .filter(|_| self.settings.aggregation_enabled());
        let Some(aggregation) = aggregation else {
            return self.emit_direct(cpu, record);
        };

        match aggregation.absorb(cpu, record) {
            Absorbed::Merged(_) => {
                self.stats.record(StatKind::Merged);
                ProbeOutcome::Merged
            }
            Absorbed::Queued => {
                self.stats.record(StatKind::Aggregated);
                ProbeOutcome::Aggregated
            }
            Absorbed::Fallback(reason, record) => {
                self.stats.record(StatKind::WriteWait);
                if reason == Fallback::Contended {
                    self.stats.record(StatKind::LockContended);
                }
                self.emit_direct(cpu, record)
            }
        }
    }

    fn emit_direct(&self, cpu: usize, record: TraceRecord) -> ProbeOutcome {
        match self.output.publish(cpu, record) {
            Ok(()) => {
                self.stats.record(StatKind::DirectEmitted);
                ProbeOutcome::Emitted
            }
            Err(_) => ProbeOutcome::Dropped,
        }
    }

    /// The global sampler shared by all cores.
    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }
}

/// Build a fresh record (counter 1) from a notification.
pub fn build_record(ctx: &TraceContext, now_ns: u64) -> TraceRecord {
    let chain = &ctx.chain;
    let hook = &ctx.hook;
    let packet = &ctx.packet;

    let mut rec = TraceRecord {
        id: trace_id(packet.identity, packet.flow_hash, packet.iif),
        counter: 1,
        time: now_ns,
        table_name: FixedName::from(chain.table_name.as_str()),
        table_handle: chain.table_handle,
        chain_name: FixedName::from(chain.chain_name.as_str()),
        chain_handle: chain.chain_handle,
        rule_handle: ctx.rule_handle,
        trace_type: ctx.trace_type,
        policy: chain.policy,
        verdict: ctx.verdict.code,
        family: chain.family,
        nfproto: hook.nfproto,
        mark: packet.mark,
        ..Default::default()
    };

    let jumps = Verdict::from_code(ctx.verdict.code).is_some_and(Verdict::has_target);
    if let (true, Some(target)) = (jumps, ctx.verdict.chain.as_deref()) {
        rec.jump_target = FixedName::from(target);
    }

    if let Some(dev) = &hook.in_dev {
        rec.iif = dev.ifindex;
        rec.iif_type = dev.dev_type;
        rec.iif_name = FixedName::from(dev.name.as_str());
    }
    if let Some(dev) = &hook.out_dev {
        rec.oif = dev.ifindex;
        rec.oif_type = dev.dev_type;
        rec.oif_name = FixedName::from(dev.name.as_str());
    }

    extract_headers(packet, hook.nfproto, &mut rec);
    rec
}
