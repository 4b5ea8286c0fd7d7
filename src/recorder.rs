//! Bounded, queryable debug log and metrics sink.
//!
//! Every other component records here. Recording is best-effort and must
//! never fail the caller, so the write paths return nothing and swallow
//! lock poisoning.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use crate::types::telemetry::{LogEntry, LogFilter, Metric, ServerStats};

/// Fixed capacity of the debug log ring buffer.
pub const MAX_LOG_ENTRIES: usize = 1000;
/// Fixed capacity of the metrics ring buffer.
pub const MAX_METRICS: usize = 500;

struct Buffers {
    logs: VecDeque<LogEntry>,
    metrics: VecDeque<Metric>,
}

/// Append-only recorder with ring-buffer eviction (oldest first).
pub struct Recorder {
    inner: Mutex<Buffers>,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Buffers {
                logs: VecDeque::with_capacity(MAX_LOG_ENTRIES),
                metrics: VecDeque::with_capacity(MAX_METRICS),
            }),
        }
    }

    /// Append a log entry, evicting the oldest once at capacity.
    pub fn log(&self, entry: LogEntry) {
        let Ok(mut buf) = self.inner.lock() else {
            return;
        };
        if buf.logs.len() == MAX_LOG_ENTRIES {
            buf.logs.pop_front();
        }
        buf.logs.push_back(entry);
    }

    /// Append a metric sample, evicting the oldest once at capacity.
    pub fn metric(&self, metric: Metric) {
        let Ok(mut buf) = self.inner.lock() else {
            return;
        };
        if buf.metrics.len() == MAX_METRICS {
            buf.metrics.pop_front();
        }
        buf.metrics.push_back(metric);
    }

    /// Query log entries, oldest first.
    pub fn query(&self, filter: &LogFilter) -> Vec<LogEntry> {
        let Ok(buf) = self.inner.lock() else {
            return Vec::new();
        };
        let needle = filter.text.as_ref().map(|t| t.to_lowercase());
        buf.logs
            .iter()
            .filter(|e| filter.level.map_or(true, |l| e.level == l))
            .filter(|e| filter.category.map_or(true, |c| e.category == c))
            .filter(|e| match &needle {
                None => true,
                Some(needle) => {
                    e.message.to_lowercase().contains(needle)
                        || e.server_name
                            .as_ref()
                            .is_some_and(|n| n.to_lowercase().contains(needle))
                        || e.detail
                            .as_ref()
                            .is_some_and(|d| d.to_string().to_lowercase().contains(needle))
                }
            })
            .cloned()
            .collect()
    }

    /// All metric samples, oldest first.
    pub fn metrics(&self) -> Vec<Metric> {
        match self.inner.lock() {
            Ok(buf) => buf.metrics.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Per-server operation count, mean duration and success rate.
    pub fn aggregate(&self) -> Vec<ServerStats> {
        let Ok(buf) = self.inner.lock() else {
            return Vec::new();
        };
        let mut by_server: BTreeMap<&str, (usize, u64, usize)> = BTreeMap::new();
        for m in &buf.metrics {
            let slot = by_server.entry(m.server_id.as_str()).or_default();
            slot.0 += 1;
            slot.1 += m.duration_ms;
            if m.success {
                slot.2 += 1;
            }
        }
        by_server
            .into_iter()
            .map(|(server_id, (count, total_ms, ok))| ServerStats {
                server_id: server_id.to_string(),
                operation_count: count,
                mean_duration_ms: total_ms as f64 / count as f64,
                success_rate: ok as f64 / count as f64,
            })
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut buf) = self.inner.lock() {
            buf.logs.clear();
            buf.metrics.clear();
        }
    }

    /// Dump logs and metrics as a JSON document for operator export.
    pub fn export(&self) -> String {
        let Ok(buf) = self.inner.lock() else {
            return "{}".to_string();
        };
        let doc = serde_json::json!({
            "logs": buf.logs.iter().collect::<Vec<_>>(),
            "metrics": buf.metrics.iter().collect::<Vec<_>>(),
        });
        serde_json::to_string_pretty(&doc).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::telemetry::{LogCategory, LogLevel};
    use chrono::Utc;

    fn entry(msg: &str, level: LogLevel) -> LogEntry {
        LogEntry::new(level, LogCategory::Connection, msg)
    }

    fn sample(server: &str, ms: u64, ok: bool) -> Metric {
        Metric {
            timestamp: Utc::now(),
            server_id: server.into(),
            server_name: None,
            operation: "tools/call".into(),
            duration_ms: ms,
            success: ok,
        }
    }

    #[test]
    fn log_buffer_evicts_oldest() {
        let rec = Recorder::new();
        for i in 0..MAX_LOG_ENTRIES + 10 {
            rec.log(entry(&format!("msg {i}"), LogLevel::Info));
        }
        let all = rec.query(&LogFilter::default());
        assert_eq!(all.len(), MAX_LOG_ENTRIES);
        assert_eq!(all[0].message, "msg 10");
    }

    #[test]
    fn metric_buffer_bounded() {
        let rec = Recorder::new();
        for _ in 0..MAX_METRICS + 3 {
            rec.metric(sample("s", 5, true));
        }
        assert_eq!(rec.metrics().len(), MAX_METRICS);
    }

    #[test]
    fn query_filters_compose() {
        let rec = Recorder::new();
        rec.log(entry("connect ok", LogLevel::Info));
        rec.log(entry("probe failed", LogLevel::Error));
        rec.log(entry("Probe recovered", LogLevel::Info));

        let errors = rec.query(&LogFilter {
            level: Some(LogLevel::Error),
            ..Default::default()
        });
        assert_eq!(errors.len(), 1);

        let probes = rec.query(&LogFilter {
            text: Some("probe".into()),
            ..Default::default()
        });
        assert_eq!(probes.len(), 2, "substring match is case-insensitive");
    }

    #[test]
    fn aggregate_per_server() {
        let rec = Recorder::new();
        rec.metric(sample("a", 10, true));
        rec.metric(sample("a", 30, false));
        rec.metric(sample("b", 8, true));

        let stats = rec.aggregate();
        assert_eq!(stats.len(), 2);
        let a = stats.iter().find(|s| s.server_id == "a").unwrap();
        assert_eq!(a.operation_count, 2);
        assert!((a.mean_duration_ms - 20.0).abs() < f64::EPSILON);
        assert!((a.success_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn clear_empties_both_buffers() {
        let rec = Recorder::new();
        rec.log(entry("x", LogLevel::Debug));
        rec.metric(sample("s", 1, true));
        rec.clear();
        assert!(rec.query(&LogFilter::default()).is_empty());
        assert!(rec.metrics().is_empty());
    }
}
