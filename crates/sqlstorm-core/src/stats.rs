//! Single-writer statistics aggregation and reporting.
//!
//! The [`Aggregator`] owns every piece of mutable run state and is only
//! ever driven by one task: it folds [`Event`]s in arrival order, renders
//! the one-second status line, and produces the final report. Because the
//! single-consumer discipline is upheld by the engine, no locking is
//! needed here.

use std::collections::HashMap;
use std::time::Instant;

use chrono_tz::Tz;

use crate::classify::classify;
use crate::event::{Event, Stage};
use crate::faillog::{FailureLogWriter, FailureRecord};
use crate::now_stamp;

/// Report ticks excluded from global network-latency statistics so that
/// cold-start samples do not skew the run totals.
const NET_PROBE_WARMUP_TICKS: u32 = 2;

/// Running sum/min/max/count for one duration series, plus the raw sample
/// buffer used for the p95 at report time. The buffer grows unboundedly
/// for the life of the run, which is acceptable for bounded-duration
/// benchmarks but a memory-growth caveat for indefinite ones.
#[derive(Debug, Default)]
pub struct DurationSeries {
    sum: f64,
    min: f64,
    max: f64,
    count: u64,
    samples: Vec<f64>,
}

impl DurationSeries {
    pub fn record(&mut self, value: f64) {
        if self.count == 0 || value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
        self.sum += value;
        self.count += 1;
        self.samples.push(value);
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    #[must_use]
    pub fn sum(&self) -> f64 {
        self.sum
    }

    #[must_use]
    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    #[must_use]
    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    #[must_use]
    pub fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// 95th percentile of the recorded samples, `None` when empty.
    #[must_use]
    pub fn p95(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        Some(sorted[percentile_index(sorted.len())])
    }
}

/// Index of the p95 sample in an ascending-sorted buffer of length `n`:
/// `ceil(0.95 * n) - 1`, clamped to `[0, n - 1]`.
#[must_use]
pub fn percentile_index(n: usize) -> usize {
    let idx = (0.95 * n as f64).ceil() as i64 - 1;
    idx.clamp(0, n as i64 - 1) as usize
}

/// Static run context the aggregator needs for rendering and for the
/// failure log: the target identity plus the reporting policy knobs.
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub driver_label: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub dbname: Option<String>,
    pub sql: String,
    pub retries: u32,
    pub backoff_ms: u64,
    pub debug: u8,
    pub concurrency: usize,
    pub net_probe_label: &'static str,
    pub tz: Tz,
}

/// All mutable run state, owned exclusively by the aggregator task.
pub struct Aggregator {
    info: RunInfo,
    fail_log: Option<FailureLogWriter>,

    // Lifetime counters. `total == success + fail` always holds.
    total: u64,
    success: u64,
    fail: u64,

    // Duration series.
    connect_attempt: DurationSeries,
    query_attempt: DurationSeries,
    request_connect_total: DurationSeries,
    /// Connect latency of successful connect attempts only.
    connect_latency: DurationSeries,
    connection_lifetime: DurationSeries,

    /// Failure counts keyed by classification category.
    errors: HashMap<String, u64>,

    // Interval (QPS) bookkeeping.
    last_total: u64,
    max_qps: u64,
    interval_success: u64,
    interval_fail: u64,
    interval_connected: u64,
    interval_backoff: u64,
    interval_backoff_requests: u64,

    // In-flight counts; floored at zero, must converge to zero at exit.
    inflight_connect: u64,
    inflight_query: u64,

    // Backoff lifetime accounting.
    backoff_events_total: u64,
    backoff_requests_count: u64,
    backoff_count_sum: u64,
    backoff_count_max: u32,
    final_requests_total: u64,

    // Network-latency double buffer: `curr` accumulates the in-progress
    // interval, `last` is what the status line reports (1 tick delayed).
    net_curr_sum: f64,
    net_curr_count: u64,
    net_last_sum: f64,
    net_last_count: u64,
    net_global_sum: f64,
    net_global_count: u64,
    net_samples: Vec<f64>,
    net_warmup_remaining: u32,
    net_collect_global: bool,

    started: Instant,
}

impl Aggregator {
    #[must_use]
    pub fn new(info: RunInfo, fail_log: Option<FailureLogWriter>) -> Self {
        Self {
            info,
            fail_log,
            total: 0,
            success: 0,
            fail: 0,
            connect_attempt: DurationSeries::default(),
            query_attempt: DurationSeries::default(),
            request_connect_total: DurationSeries::default(),
            connect_latency: DurationSeries::default(),
            connection_lifetime: DurationSeries::default(),
            errors: HashMap::new(),
            last_total: 0,
            max_qps: 0,
            interval_success: 0,
            interval_fail: 0,
            interval_connected: 0,
            interval_backoff: 0,
            interval_backoff_requests: 0,
            inflight_connect: 0,
            inflight_query: 0,
            backoff_events_total: 0,
            backoff_requests_count: 0,
            backoff_count_sum: 0,
            backoff_count_max: 0,
            final_requests_total: 0,
            net_curr_sum: 0.0,
            net_curr_count: 0,
            net_last_sum: 0.0,
            net_last_count: 0,
            net_global_sum: 0.0,
            net_global_count: 0,
            net_samples: Vec::new(),
            net_warmup_remaining: NET_PROBE_WARMUP_TICKS,
            net_collect_global: false,
            started: Instant::now(),
        }
    }

    /// Folds one event into the run state.
    pub fn fold(&mut self, event: Event) {
        match event {
            Event::AttemptConnectBegin => {
                self.inflight_connect += 1;
            }
            Event::AttemptConnectSuccess {
                attempt_connect_time,
            } => {
                self.interval_connected += 1;
                self.inflight_connect = self.inflight_connect.saturating_sub(1);
                self.inflight_query += 1;
                self.connect_attempt.record(attempt_connect_time);
                self.connect_latency.record(attempt_connect_time);
            }
            Event::AttemptConnectFailure {
                errno,
                message,
                connect_time,
                attempt,
                is_final,
                request_connect_total,
                request_backoff_count,
            } => {
                self.count_outcome(false);
                self.connect_attempt.record(connect_time);
                self.inflight_connect = self.inflight_connect.saturating_sub(1);
                if is_final {
                    if let Some(rct) = request_connect_total {
                        self.request_connect_total.record(rct);
                    }
                    self.note_final(request_backoff_count);
                }
                self.note_failure(Stage::Connect, errno, &message, connect_time, 0.0, attempt);
            }
            Event::AttemptQuerySuccess {
                connect_time: _,
                query_time,
                connection_lifetime,
                request_connect_total,
                request_backoff_count,
            } => {
                self.count_outcome(true);
                self.query_attempt.record(query_time);
                self.inflight_query = self.inflight_query.saturating_sub(1);
                self.request_connect_total.record(request_connect_total);
                self.connection_lifetime.record(connection_lifetime);
                self.note_final(Some(request_backoff_count));
            }
            Event::AttemptQueryFailure {
                errno,
                message,
                connect_time,
                query_time,
                attempt,
                is_final,
                request_connect_total,
                request_backoff_count,
            } => {
                self.count_outcome(false);
                self.query_attempt.record(query_time);
                self.inflight_query = self.inflight_query.saturating_sub(1);
                if is_final {
                    if let Some(rct) = request_connect_total {
                        self.request_connect_total.record(rct);
                    }
                    self.note_final(request_backoff_count);
                }
                self.note_failure(Stage::Query, errno, &message, connect_time, query_time, attempt);
            }
            Event::Backoff => {
                self.interval_backoff += 1;
                self.backoff_events_total += 1;
            }
            Event::Cleanup {
                inflight_connect_delta,
                inflight_query_delta,
            } => {
                self.inflight_connect = apply_delta(self.inflight_connect, inflight_connect_delta);
                self.inflight_query = apply_delta(self.inflight_query, inflight_query_delta);
            }
            Event::NetworkProbeSample { ok, latency_seconds } => {
                if let (true, Some(latency)) = (ok, latency_seconds) {
                    self.net_curr_sum += latency;
                    self.net_curr_count += 1;
                    if self.net_collect_global {
                        self.net_global_sum += latency;
                        self.net_global_count += 1;
                        self.net_samples.push(latency);
                    }
                }
            }
        }
    }

    fn count_outcome(&mut self, ok: bool) {
        self.total += 1;
        if ok {
            self.success += 1;
            self.interval_success += 1;
        } else {
            self.fail += 1;
            self.interval_fail += 1;
        }
    }

    fn note_final(&mut self, backoff_count: Option<u32>) {
        self.final_requests_total += 1;
        if let Some(b) = backoff_count {
            if b > 0 {
                self.interval_backoff_requests += 1;
                self.backoff_requests_count += 1;
                self.backoff_count_sum += u64::from(b);
                self.backoff_count_max = self.backoff_count_max.max(b);
            }
        }
    }

    fn note_failure(
        &mut self,
        stage: Stage,
        errno: u32,
        message: &str,
        connect_time: f64,
        query_time: f64,
        attempt: u32,
    ) {
        let category = classify(errno, message, stage);
        *self.errors.entry(category).or_insert(0) += 1;
        if let Some(writer) = self.fail_log.as_mut() {
            let record = FailureRecord {
                ts: now_stamp(self.info.tz),
                stage,
                driver: self.info.driver_label.clone(),
                host: self.info.host.clone(),
                port: self.info.port,
                user: self.info.user.clone(),
                dbname: self.info.dbname.clone().unwrap_or_default(),
                sql: self.info.sql.clone(),
                errno,
                message: crate::classify::normalize_message(message),
                message_raw: message.to_string(),
                connect_time,
                query_time,
                attempt,
            };
            writer.write(&record);
        }
    }

    /// One reporting tick: renders the status line, flips the network
    /// double buffer, advances warm-up, and resets interval counters.
    /// Returns the line for the caller to print.
    pub fn interval_tick(&mut self) -> String {
        let qps = self.total - self.last_total;
        self.max_qps = self.max_qps.max(qps);
        self.last_total = self.total;
        let active = self.inflight_connect + self.inflight_query;
        // "connections" is deliberately the in-flight query count; the
        // derived metric can drift from true active workers under
        // boundary timing.
        let connected = self.inflight_query;

        let mut line = format!(
            "[{}] QPS: {} | max QPS: {} | connections: {} | new connections: {} | inflight connect: {} | inflight query: {} | backoff events: {} | ok: {} | err: {} | active workers: {}",
            now_stamp(self.info.tz),
            qps,
            self.max_qps,
            connected,
            self.interval_connected,
            self.inflight_connect,
            self.inflight_query,
            self.interval_backoff,
            self.interval_success,
            self.interval_fail,
            active,
        );
        if self.net_last_count > 0 && self.net_warmup_remaining == 0 {
            line.push_str(&format!(
                " | net latency ({}): {:.6}s",
                self.info.net_probe_label,
                self.net_last_sum / self.net_last_count as f64
            ));
        }
        if self.info.debug >= 1 && active as usize != self.info.concurrency {
            line.push_str(&format!(
                " | drift={}",
                active as i64 - self.info.concurrency as i64
            ));
        }

        self.flip_net_buffer();
        if self.net_warmup_remaining > 0 {
            self.net_warmup_remaining -= 1;
            if self.net_warmup_remaining == 0 {
                self.net_collect_global = true;
            }
        }
        self.interval_success = 0;
        self.interval_fail = 0;
        self.interval_connected = 0;
        self.interval_backoff = 0;
        self.interval_backoff_requests = 0;

        line
    }

    /// Forces one double-buffer flip so the most recent interval is
    /// visible in the final report.
    pub fn force_net_flip(&mut self) {
        self.flip_net_buffer();
    }

    fn flip_net_buffer(&mut self) {
        self.net_last_sum = self.net_curr_sum;
        self.net_last_count = self.net_curr_count;
        self.net_curr_sum = 0.0;
        self.net_curr_count = 0;
    }

    /// Applies a compensating cleanup for any still-nonzero in-flight
    /// counters, forcing convergence to zero at shutdown.
    pub fn compensate_inflight(&mut self) {
        let dc = -(self.inflight_connect as i64);
        let dq = -(self.inflight_query as i64);
        if dc != 0 || dq != 0 {
            self.fold(Event::Cleanup {
                inflight_connect_delta: dc,
                inflight_query_delta: dq,
            });
        }
    }

    /// Flushes and releases the failure log.
    pub fn close_fail_log(&mut self) {
        if let Some(writer) = self.fail_log.as_mut() {
            writer.close();
        }
    }

    /// Renders the final report. Any in-flight counter still nonzero here
    /// is a reportable anomaly, not a fatal error.
    #[must_use]
    pub fn final_report(&self) -> String {
        let mut out = String::new();
        out.push_str("----------------------------------------\n");
        out.push_str("final statistics:\n");

        let rate = if self.total > 0 {
            format!("{:.2}%", self.success as f64 * 100.0 / self.total as f64)
        } else {
            "N/A".to_string()
        };
        out.push_str(&format!(
            "total: {} | ok: {} | err: {} | success rate: {}\n",
            self.total, self.success, self.fail, rate
        ));

        let elapsed = self.started.elapsed().as_secs_f64().max(1.0);
        let net_summary = if self.net_global_count > 0 {
            let avg = self.net_global_sum / self.net_global_count as f64;
            let p95 = net_p95(&self.net_samples)
                .map_or_else(|| "N/A".to_string(), |v| format!("{v:.6}s"));
            format!("avg={avg:.6}s p95={p95}")
        } else {
            "avg=N/A p95=N/A".to_string()
        };
        out.push_str(&format!(
            "avg QPS: {:.2} (total / elapsed) | net latency ({}): {}\n",
            self.total as f64 / elapsed,
            self.info.net_probe_label,
            net_summary
        ));

        if !self.errors.is_empty() {
            out.push_str("failure breakdown:\n");
            let mut categories: Vec<(&String, &u64)> = self.errors.iter().collect();
            categories.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
            for (category, count) in categories {
                out.push_str(&format!("  {category}: {count}\n"));
            }
        }

        out.push_str(&summary_line("attempt connect time", &self.connect_attempt));
        out.push_str(&summary_line(
            "request connect total",
            &self.request_connect_total,
        ));
        out.push_str(&sampled_line("query time", &self.query_attempt));
        out.push_str(&latency_line(
            "connect latency (successful)",
            &self.connect_latency,
        ));
        out.push_str(&sampled_line(
            "connection lifetime (incl. connect)",
            &self.connection_lifetime,
        ));

        out.push_str("backoff summary:\n");
        out.push_str(&format!(
            "  total backoff events: {}\n",
            self.backoff_events_total
        ));
        let share = if self.final_requests_total > 0 {
            self.backoff_requests_count as f64 * 100.0 / self.final_requests_total as f64
        } else {
            0.0
        };
        out.push_str(&format!(
            "  requests with backoff: {} / share: {:.2}% (of final events)\n",
            self.backoff_requests_count, share
        ));
        let avg_all = if self.final_requests_total > 0 {
            self.backoff_count_sum as f64 / self.final_requests_total as f64
        } else {
            0.0
        };
        let avg_backoff_only = if self.backoff_requests_count > 0 {
            self.backoff_count_sum as f64 / self.backoff_requests_count as f64
        } else {
            0.0
        };
        out.push_str(&format!(
            "  avg backoffs per request (all / backoff-only): {avg_all:.4} / {avg_backoff_only:.4}\n"
        ));
        out.push_str(&format!(
            "  max backoffs per request: {}\n",
            self.backoff_count_max
        ));
        out.push_str(&format!(
            "  policy: retries={}, backoff-ms={}\n",
            self.info.retries, self.info.backoff_ms
        ));

        if self.inflight_connect != 0 || self.inflight_query != 0 {
            out.push_str(&format!(
                "[WARN] in-flight counters nonzero at exit: inflight_connect={} inflight_query={}\n",
                self.inflight_connect, self.inflight_query
            ));
        }
        out
    }

    #[must_use]
    pub fn totals(&self) -> (u64, u64, u64) {
        (self.total, self.success, self.fail)
    }

    #[must_use]
    pub fn inflight(&self) -> (u64, u64) {
        (self.inflight_connect, self.inflight_query)
    }
}

fn apply_delta(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value + delta as u64
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

fn net_p95(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    Some(sorted[percentile_index(sorted.len())])
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map_or_else(|| "N/A".to_string(), |v| format!("{v:.6}s"))
}

/// sum/min/max/avg line in the style of the attempt-level series: empty
/// series print zeros rather than N/A.
fn summary_line(name: &str, s: &DurationSeries) -> String {
    format!(
        "{name}: sum={:.6}s min={:.6}s max={:.6}s avg={:.6}s\n",
        s.sum(),
        s.min().unwrap_or(0.0),
        s.max().unwrap_or(0.0),
        s.avg().unwrap_or(0.0),
    )
}

/// sum/min/max/avg/p95 line; empty series print N/A.
fn sampled_line(name: &str, s: &DurationSeries) -> String {
    if s.count() == 0 {
        return format!("{name}: sum=0.000000s min=N/A max=N/A avg=N/A p95=N/A\n");
    }
    format!(
        "{name}: sum={:.6}s min={} max={} avg={} p95={}\n",
        s.sum(),
        fmt_opt(s.min()),
        fmt_opt(s.max()),
        fmt_opt(s.avg()),
        fmt_opt(s.p95()),
    )
}

/// p95/min/max/avg line for the successful-connect latency series.
fn latency_line(name: &str, s: &DurationSeries) -> String {
    format!(
        "{name}: p95={} min={} max={} avg={}\n",
        fmt_opt(s.p95()),
        fmt_opt(s.min()),
        fmt_opt(s.max()),
        fmt_opt(s.avg()),
    )
}
