use serde::Serialize;

/// Phase of an attempt in which an outcome was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Connect,
    Query,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Connect => f.write_str("connect"),
            Stage::Query => f.write_str("query"),
        }
    }
}

/// One observation pushed by a worker agent or the network prober and
/// folded by the statistics aggregator.
///
/// Exactly one of `AttemptQuerySuccess` or a final `AttemptQueryFailure` /
/// `AttemptConnectFailure` is emitted per logical request; every other
/// event for that request is non-final and excluded from throughput
/// counting. Durations are wall-clock seconds.
#[derive(Debug, Clone)]
pub enum Event {
    /// An attempt entered the connect phase. Maintains `inflight_connect`.
    AttemptConnectBegin,

    /// The connect phase of an attempt succeeded. Not counted toward QPS.
    AttemptConnectSuccess { attempt_connect_time: f64 },

    /// The connect phase of an attempt failed. `request_connect_total` and
    /// `request_backoff_count` are carried only on the final attempt;
    /// `None` signals "not yet decided".
    AttemptConnectFailure {
        errno: u32,
        message: String,
        connect_time: f64,
        attempt: u32,
        is_final: bool,
        request_connect_total: Option<f64>,
        request_backoff_count: Option<u32>,
    },

    /// A request completed successfully. Always final.
    AttemptQuerySuccess {
        connect_time: f64,
        query_time: f64,
        /// Wall time from connect-begin to query completion, including
        /// connection teardown.
        connection_lifetime: f64,
        request_connect_total: f64,
        request_backoff_count: u32,
    },

    /// The query phase of an attempt failed. Field semantics match
    /// `AttemptConnectFailure`.
    AttemptQueryFailure {
        errno: u32,
        message: String,
        connect_time: f64,
        query_time: f64,
        attempt: u32,
        is_final: bool,
        request_connect_total: Option<f64>,
        request_backoff_count: Option<u32>,
    },

    /// A worker is about to suspend before its next retry.
    Backoff,

    /// Compensates in-flight counters for work abandoned mid-flight
    /// during shutdown. Deltas are usually zero or negative.
    Cleanup {
        inflight_connect_delta: i64,
        inflight_query_delta: i64,
    },

    /// One latency sample from the network prober. Failed probes carry
    /// `ok: false` and no latency, and are ignored by the aggregator.
    NetworkProbeSample {
        ok: bool,
        latency_seconds: Option<f64>,
    },
}
