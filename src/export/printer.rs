//! Renders trace records as text lines or JSON objects.
//!
//! With dedupe on, consecutive records that render identically (ignoring
//! time and counter) collapse into one line carrying the summed counter.
//! The collapsed line is held until a different record arrives or
//! [`RecordPrinter::flush`] is called.

use std::io::{self, Write};

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::config::OutputFormat;
use crate::tracer::event::ip_proto_name;
use crate::tracer::monotonic_ns;
use crate::tracer::record::{MacAddr, TraceRecord};

#[derive(Error, Debug)]
pub enum PrintError {
    #[error("writing trace output: {0}")]
    Io(#[from] io::Error),

    #[error("encoding trace as json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Display form of a [`TraceRecord`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TraceView {
    pub trace_id: u32,
    pub table_name: String,
    pub chain_name: String,
    #[serde(rename = "jt", skip_serializing_if = "String::is_empty")]
    pub jump_target: String,
    pub handle: u64,
    pub family: String,
    #[serde(rename = "iif", skip_serializing_if = "String::is_empty")]
    pub iif_name: String,
    #[serde(rename = "oif", skip_serializing_if = "String::is_empty")]
    pub oif_name: String,
    #[serde(rename = "hw-src", skip_serializing_if = "String::is_empty")]
    pub hw_src: String,
    #[serde(rename = "hw-dst", skip_serializing_if = "String::is_empty")]
    pub hw_dst: String,
    #[serde(rename = "ip-src", skip_serializing_if = "String::is_empty")]
    pub ip_src: String,
    #[serde(rename = "ip-dst", skip_serializing_if = "String::is_empty")]
    pub ip_dst: String,
    #[serde(skip_serializing_if = "is_zero_port")]
    pub sport: u16,
    #[serde(skip_serializing_if = "is_zero_port")]
    pub dport: u16,
    pub len: u16,
    pub proto: String,
    pub verdict: String,
    pub cnt: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub timestamp: String,
}

fn is_zero_port(port: &u16) -> bool {
    *port == 0
}

impl TraceView {
    /// Build a view without time or counter; those are filled at write.
    pub fn from_record(rec: &TraceRecord) -> Self {
        let mac = |m: &MacAddr| {
            if m.is_zero() {
                String::new()
            } else {
                m.to_string()
            }
        };

        Self {
            trace_id: rec.id,
            table_name: rec.table_name.to_string(),
            chain_name: rec.chain_name.to_string(),
            jump_target: rec.jump_target.to_string(),
            handle: rec.rule_handle,
            family: rec
                .family()
                .map_or_else(|| rec.family.to_string(), |f| f.as_str().to_string()),
            iif_name: rec.iif_name.to_string(),
            oif_name: rec.oif_name.to_string(),
            hw_src: mac(&rec.src_mac),
            hw_dst: mac(&rec.dst_mac),
            ip_src: rec.src_addr().map(|a| a.to_string()).unwrap_or_default(),
            ip_dst: rec.dst_addr().map(|a| a.to_string()).unwrap_or_default(),
            sport: rec.src_port,
            dport: rec.dst_port,
            len: rec.len,
            proto: ip_proto_name(rec.ip_proto)
                .map_or_else(|| rec.ip_proto.to_string(), str::to_string),
            verdict: rec
                .verdict()
                .map_or_else(|| rec.verdict.to_string(), |v| v.as_str().to_string()),
            cnt: 0,
            timestamp: String::new(),
        }
    }

    /// Text form without the timestamp and counter.
    pub fn text_body(&self) -> String {
        let dash = |s: &str| if s.is_empty() { "-".to_string() } else { s.to_string() };

        let mut body = format!(
            "trace={:08x} {} {} {} handle={} verdict={}",
            self.trace_id,
            self.family,
            self.table_name,
            self.chain_name,
            self.handle,
            self.verdict,
        );
        if !self.jump_target.is_empty() {
            body.push_str(" jt=");
            body.push_str(&self.jump_target);
        }
        body.push_str(&format!(
            " iif={} oif={} {} len={}",
            dash(&self.iif_name),
            dash(&self.oif_name),
            self.five_tuple(),
            self.len,
        ));
        body
    }

    /// Padded `src= dst= proto=` triple; the text-mode dedupe key.
    pub fn five_tuple(&self) -> String {
        let endpoint = |addr: &str, port: u16| {
            if addr.is_empty() {
                "-".to_string()
            } else if addr.contains(':') {
                format!("[{addr}]:{port}")
            } else {
                format!("{addr}:{port}")
            }
        };

        format!(
            "src={:<25} dst={:<25} proto={:<8}",
            endpoint(&self.ip_src, self.sport),
            endpoint(&self.ip_dst, self.dport),
            self.proto,
        )
    }
}

/// Convert a monotonic record time to wall-clock time.
pub fn wall_time(mono_ns: u64) -> DateTime<Utc> {
    let age = monotonic_ns().saturating_sub(mono_ns);
    let age = TimeDelta::nanoseconds(i64::try_from(age).unwrap_or(i64::MAX));
    Utc::now()
        .checked_sub_signed(age)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

struct Pending {
    key: String,
    view: TraceView,
    time: u64,
    counter: u64,
}

pub struct RecordPrinter<W: Write> {
    out: W,
    format: OutputFormat,
    dedupe: bool,
    pending: Option<Pending>,
    lines: u64,
}

impl<W: Write> RecordPrinter<W> {
    /// Printer writing `format` lines to `out`.
    pub fn new(out: W, format: OutputFormat, dedupe: bool) -> Self {
        Self {
            out,
            format,
            dedupe,
            pending: None,
            lines: 0,
        }
    }

    /// Print `rec`, or fold it into the held line when dedupe matches.
    pub fn write(&mut self, rec: &TraceRecord) -> Result<(), PrintError> {
        let view = TraceView::from_record(rec);
        let key = match self.format {
            OutputFormat::Text => view.five_tuple(),
            OutputFormat::Json => serde_json::to_string(&view)?,
        };

        if let Some(pending) = self.pending.as_mut() {
            if pending.key == key {
                pending.counter = pending.counter.saturating_add(rec.counter);
                return Ok(());
            }
        }

        self.emit_pending()?;
        let next = Pending {
            key,
            view,
            time: rec.time,
            counter: rec.counter,
        };
        if self.dedupe {
            self.pending = Some(next);
            Ok(())
        } else {
            self.emit(next)
        }
    }

    /// Write the held line, if any, and flush the writer.
    pub fn flush(&mut self) -> Result<(), PrintError> {
        self.emit_pending()?;
        self.out.flush()?;
        Ok(())
    }

    /// Lines written so far.
    pub fn lines(&self) -> u64 {
        self.lines
    }

    /// The underlying writer.
    pub fn get_ref(&self) -> &W {
        &self.out
    }

    fn emit_pending(&mut self) -> Result<(), PrintError> {
        match self.pending.take() {
            Some(pending) => self.emit(pending),
            None => Ok(()),
        }
    }

    fn emit(&mut self, pending: Pending) -> Result<(), PrintError> {
        let stamp = wall_time(pending.time).to_rfc3339_opts(SecondsFormat::Micros, true);
        match self.format {
            OutputFormat::Text => {
                let body = pending.view.text_body();
                writeln!(self.out, "[{stamp}] {body} cnt={}", pending.counter)?;
            }
            OutputFormat::Json => {
                let mut view = pending.view;
                view.cnt = pending.counter;
                view.timestamp = stamp;
                serde_json::to_writer(&mut self.out, &view)?;
                self.out.write_all(b"\n")?;
            }
        }
        self.lines += 1;
        Ok(())
    }
}

impl<W: Write> Drop for RecordPrinter<W> {
    fn drop(&mut self) {
        if self.pending.is_some() {
            if let Err(e) = self.flush() {
                tracing::warn!(error = %e, "flushing pending trace line on drop");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::tracer::event::{Family, Verdict, IPPROTO_TCP};
    use crate::tracer::record::FixedName;

    fn record(id: u32, counter: u64) -> TraceRecord {
        TraceRecord {
            id,
            counter,
            time: monotonic_ns(),
            table_name: FixedName::from("filter"),
            chain_name: FixedName::from("input"),
            rule_handle: 7,
            verdict: Verdict::Accept as i32,
            family: Family::Ipv4 as u8,
            iif_name: FixedName::from("eth0"),
            src_mac: MacAddr([0x02, 0, 0, 0, 0, 1]),
            src_ip: [10, 0, 0, 1],
            dst_ip: [10, 0, 0, 2],
            src_port: 43512,
            dst_port: 443,
            ip_proto: IPPROTO_TCP,
            len: 60,
            ..Default::default()
        }
    }

    fn output(printer: &RecordPrinter<Vec<u8>>) -> Vec<String> {
        String::from_utf8(printer.get_ref().clone())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_text_line_layout() {
        let mut printer = RecordPrinter::new(Vec::new(), OutputFormat::Text, false);
        printer.write(&record(0x426e_2690, 3)).unwrap();

        let lines = output(&printer);
        assert_eq!(lines.len(), 1);
        let line = &lines[0];
        assert!(line.starts_with('['));
        assert!(line.contains("] trace=426e2690 ip filter input handle=7 verdict=accept iif=eth0 oif=-"));
        assert!(line.contains("src=10.0.0.1:43512"));
        assert!(line.contains("dst=10.0.0.2:443"));
        assert!(line.contains("proto=tcp"));
        assert!(line.ends_with("len=60 cnt=3"));
        assert!(!line.contains("jt="));
    }

    #[test]
    fn test_text_line_shows_jump_target() {
        let mut rec = record(1, 1);
        rec.verdict = Verdict::Jump as i32;
        rec.jump_target = FixedName::from("allowed");

        let mut printer = RecordPrinter::new(Vec::new(), OutputFormat::Text, false);
        printer.write(&rec).unwrap();
        assert!(output(&printer)[0].contains("verdict=jump jt=allowed iif="));
    }

    #[test]
    fn test_ipv6_endpoint_bracketed() {
        let mut rec = record(1, 1);
        rec.src_ip = [0; 4];
        rec.dst_ip = [0; 4];
        rec.src_ip6 = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        rec.dst_ip6 = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2];

        let view = TraceView::from_record(&rec);
        assert!(view.text_body().contains("src=[2001:db8::1]:43512"));
    }

    #[test]
    fn test_json_fields() {
        let mut printer = RecordPrinter::new(Vec::new(), OutputFormat::Json, false);
        printer.write(&record(9, 2)).unwrap();

        let lines = output(&printer);
        let value: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(value["trace_id"], 9);
        assert_eq!(value["table_name"], "filter");
        assert_eq!(value["handle"], 7);
        assert_eq!(value["family"], "ip");
        assert_eq!(value["iif"], "eth0");
        assert_eq!(value["hw-src"], "02:00:00:00:00:01");
        assert_eq!(value["ip-src"], "10.0.0.1");
        assert_eq!(value["dport"], 443);
        assert_eq!(value["proto"], "tcp");
        assert_eq!(value["verdict"], "accept");
        assert_eq!(value["cnt"], 2);
        assert!(value["timestamp"].is_string());
        assert!(value.get("oif").is_none());
        assert!(value.get("jt").is_none());
        assert!(value.get("hw-dst").is_none());
    }

    #[test]
    fn test_dedupe_sums_consecutive() {
        let mut printer = RecordPrinter::new(Vec::new(), OutputFormat::Text, true);
        printer.write(&record(1, 2)).unwrap();
        printer.write(&record(1, 3)).unwrap();

        let mut other_flow = record(2, 1);
        other_flow.dst_port = 8443;
        printer.write(&other_flow).unwrap();
        printer.write(&record(1, 1)).unwrap();
        assert_eq!(printer.lines(), 2);

        printer.flush().unwrap();
        let lines = output(&printer);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("trace=00000001") && lines[0].ends_with("cnt=5"));
        assert!(lines[1].contains("trace=00000002") && lines[1].ends_with("cnt=1"));
        assert!(lines[2].contains("trace=00000001") && lines[2].ends_with("cnt=1"));
    }

    #[test]
    fn test_text_dedupe_keys_on_five_tuple() {
        let mut printer = RecordPrinter::new(Vec::new(), OutputFormat::Text, true);
        for id in 1..=3 {
            let mut rec = record(id, 1);
            rec.rule_handle = u64::from(id);
            printer.write(&rec).unwrap();
        }
        printer.flush().unwrap();

        let lines = output(&printer);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("trace=00000001"));
        assert!(lines[0].contains("handle=1 "));
        assert!(lines[0].ends_with("cnt=3"));
    }

    #[test]
    fn test_five_tuple_layout() {
        let view = TraceView::from_record(&record(1, 1));
        assert_eq!(
            view.five_tuple(),
            format!("src={:<25} dst={:<25} proto={:<8}", "10.0.0.1:43512", "10.0.0.2:443", "tcp")
        );
        assert!(view.text_body().contains(&view.five_tuple()));
    }

    #[test]
    fn test_dedupe_json() {
        let mut printer = RecordPrinter::new(Vec::new(), OutputFormat::Json, true);
        printer.write(&record(4, 1)).unwrap();
        printer.write(&record(4, 1)).unwrap();
        printer.flush().unwrap();

        let lines = output(&printer);
        assert_eq!(lines.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(value["cnt"], 2);
    }

    #[test]
    fn test_no_dedupe_writes_every_record() {
        let mut printer = RecordPrinter::new(Vec::new(), OutputFormat::Text, false);
        printer.write(&record(1, 1)).unwrap();
        printer.write(&record(1, 1)).unwrap();
        assert_eq!(output(&printer).len(), 2);
    }

    #[test]
    fn test_wall_time_is_not_in_future() {
        let now = Utc::now();
        let t = wall_time(monotonic_ns());
        assert!(t <= Utc::now());
        assert!(now - t < TimeDelta::seconds(1));
    }
}
