//! Run orchestration: shared run state, the shutdown coordinator, and
//! the aggregator loop that owns all statistics.
//!
//! The aggregator runs on the main task and is the only consumer of the
//! event queue, so folding needs no synchronization. Shutdown can be
//! triggered by an operator signal, the run-time deadline, or natural
//! worker completion; whichever fires first wins and the sequence runs
//! exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::info;

use sqlstorm_core::config::BenchConfig;
use sqlstorm_core::faillog::FailureLogWriter;
use sqlstorm_core::stats::{Aggregator, RunInfo};
use sqlstorm_core::{BenchResult, Event};

use crate::client::DatabaseClient;
use crate::prober::{run_prober, ProberContext};
use crate::worker::{run_worker, WorkerContext};

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Bounded wait before the final queue drain, letting in-flight workers
/// land their last events.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Shared run flags handed to every task. `stopping` tells producers to
/// wind down; `shutdown_started` is the one-shot latch guarding the
/// drain-and-report sequence.
#[derive(Debug, Default)]
pub struct RunState {
    stopping: AtomicBool,
    shutdown_started: AtomicBool,
}

impl RunState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Relaxed)
    }

    pub fn request_stop(&self) {
        self.stopping.store(true, Ordering::Relaxed);
    }

    /// Latches the shutdown; true only for the first caller.
    pub fn begin_shutdown(&self) -> bool {
        self.shutdown_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// What tipped the run into shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Interrupt,
    Deadline,
    Completed,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interrupt => f.write_str("interrupt signal received"),
            Self::Deadline => f.write_str("run-time limit reached"),
            Self::Completed => f.write_str("all workers finished"),
        }
    }
}

/// Fan-in point for the three shutdown triggers.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    run: Arc<RunState>,
    tx: mpsc::Sender<ShutdownReason>,
}

impl ShutdownCoordinator {
    #[must_use]
    pub fn new(run: Arc<RunState>, tx: mpsc::Sender<ShutdownReason>) -> Self {
        Self { run, tx }
    }

    /// Enters shutdown exactly once; later calls are no-ops. Returns
    /// whether this call won the latch.
    pub fn begin(&self, reason: ShutdownReason) -> bool {
        if !self.run.begin_shutdown() {
            return false;
        }
        self.run.request_stop();
        let _ = self.tx.try_send(reason);
        true
    }
}

/// Queue sizing: generous rather than tight, so retry storms never
/// starve producers against the single blocked consumer.
#[must_use]
fn queue_capacity(concurrency: usize) -> usize {
    (concurrency * 2).max(2048)
}

fn build_aggregator(cfg: &BenchConfig, driver_label: &'static str) -> Aggregator {
    let info = RunInfo {
        driver_label: driver_label.to_string(),
        host: cfg.host.clone(),
        port: cfg.port,
        user: cfg.user.clone(),
        dbname: cfg.dbname.clone(),
        sql: cfg.sql.clone(),
        retries: cfg.retries,
        backoff_ms: cfg.backoff.as_millis() as u64,
        debug: cfg.debug,
        concurrency: cfg.concurrency,
        net_probe_label: cfg.net_probe_mode.label(),
        tz: cfg.tz,
    };
    let fail_log = cfg
        .fail_log
        .as_ref()
        .map(|fl| FailureLogWriter::open(&fl.path, fl.format));
    Aggregator::new(info, fail_log)
}

/// Runs the whole benchmark and returns the final report.
pub async fn run_bench(
    cfg: BenchConfig,
    client: Arc<dyn DatabaseClient>,
) -> BenchResult<String> {
    cfg.validate()?;

    let run = Arc::new(RunState::new());
    let (events_tx, mut events_rx) = mpsc::channel::<Event>(queue_capacity(cfg.concurrency));
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<ShutdownReason>(4);
    let (done_tx, mut done_rx) = mpsc::channel::<usize>(cfg.concurrency);
    let coordinator = ShutdownCoordinator::new(run.clone(), shutdown_tx);

    let mut aggregator = build_aggregator(&cfg, client.label());

    for id in 0..cfg.concurrency {
        let ctx = WorkerContext {
            id,
            client: client.clone(),
            sql: cfg.sql.clone(),
            retries: cfg.retries,
            backoff: cfg.backoff,
            run: run.clone(),
            events: events_tx.clone(),
            done: done_tx.clone(),
        };
        tokio::spawn(run_worker(ctx));
    }
    tokio::spawn(run_prober(ProberContext {
        mode: cfg.net_probe_mode,
        host: cfg.host.clone(),
        port: cfg.port,
        timeout: cfg.net_probe_timeout,
        run: run.clone(),
        events: events_tx.clone(),
    }));
    drop(events_tx);
    drop(done_tx);

    {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                coordinator.begin(ShutdownReason::Interrupt);
            }
        });
    }
    #[cfg(unix)]
    {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            let Ok(mut term) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            else {
                return;
            };
            if term.recv().await.is_some() {
                coordinator.begin(ShutdownReason::Interrupt);
            }
        });
    }
    if let Some(limit) = cfg.max_run_time {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            coordinator.begin(ShutdownReason::Deadline);
        });
    }
    {
        let coordinator = coordinator.clone();
        let workers = cfg.concurrency;
        tokio::spawn(async move {
            let mut finished = 0usize;
            while done_rx.recv().await.is_some() {
                finished += 1;
                if finished == workers {
                    break;
                }
            }
            // The done channel closing early also means no worker is left.
            coordinator.begin(ShutdownReason::Completed);
        });
    }

    let mut ticker = tokio::time::interval(REPORT_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let reason = loop {
        tokio::select! {
            maybe_event = events_rx.recv() => {
                if let Some(event) = maybe_event {
                    aggregator.fold(event);
                }
            }
            _ = ticker.tick() => {
                println!("{}", aggregator.interval_tick());
            }
            reason = shutdown_rx.recv() => {
                break reason.unwrap_or(ShutdownReason::Completed);
            }
        }
    };

    info!("{reason}, draining and reporting");
    aggregator.force_net_flip();
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    events_rx.close();
    while let Some(event) = events_rx.recv().await {
        aggregator.fold(event);
    }
    aggregator.compensate_inflight();
    aggregator.close_fail_log();
    Ok(aggregator.final_report())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use sqlstorm_core::config::{FailLogFormat, NetProbeMode, SqlTimeoutMode};
    use sqlstorm_core::ClientError;

    use crate::client::testing::{ConnectOutcome, ScriptedClient};

    fn test_config(concurrency: usize) -> BenchConfig {
        BenchConfig {
            driver: "scripted".into(),
            host: "db.example".into(),
            port: 3306,
            user: "bench".into(),
            password: "secret".into(),
            dbname: Some("test".into()),
            sql: "SELECT 1".into(),
            concurrency,
            connect_timeout: Duration::from_secs(3),
            connect_timeout_raw: "3".into(),
            retries: 1,
            backoff: Duration::from_millis(20),
            debug: 0,
            tz: chrono_tz::UTC,
            sql_exec_timeout: Duration::ZERO,
            sql_timeout_mode: SqlTimeoutMode::Client,
            max_run_time: None,
            net_probe_mode: NetProbeMode::None,
            net_probe_timeout: Duration::from_secs(1),
            fail_log: None,
        }
    }

    #[test]
    fn shutdown_latch_admits_only_the_first_trigger() {
        let run = Arc::new(RunState::new());
        let (tx, mut rx) = mpsc::channel(4);
        let coordinator = ShutdownCoordinator::new(run.clone(), tx);
        assert!(coordinator.begin(ShutdownReason::Interrupt));
        assert!(!coordinator.begin(ShutdownReason::Completed));
        assert!(run.is_stopping());
        assert_eq!(rx.try_recv(), Ok(ShutdownReason::Interrupt));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn queue_capacity_has_a_generous_floor() {
        assert_eq!(queue_capacity(4), 2048);
        assert_eq!(queue_capacity(2000), 4000);
    }

    #[tokio::test(start_paused = true)]
    async fn run_completes_naturally_and_counters_converge() {
        let script: Vec<ConnectOutcome> = vec![
            Ok(Ok(())),
            Ok(Ok(())),
            Err(ClientError::new(2002, "connection refused")),
            Ok(Ok(())),
            Ok(Err(ClientError::new(0, "read timed out"))),
            Ok(Ok(())),
        ];
        let run_flag = Arc::new(RunState::new());
        let client = Arc::new(ScriptedClient::new(script, run_flag));
        let report = run_bench(test_config(2), client).await.unwrap();

        assert!(report.contains("final statistics:"));
        // Every request resolved, so in-flight counters converged without
        // a compensation warning.
        assert!(!report.contains("[WARN]"));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_reach_the_breakdown_and_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("bench_fail.log");
        let script: Vec<ConnectOutcome> = vec![
            Err(ClientError::new(2002, "connection refused")),
            Err(ClientError::new(2002, "connection refused")),
            Ok(Ok(())),
        ];
        let run_flag = Arc::new(RunState::new());
        let client = Arc::new(ScriptedClient::new(script, run_flag));
        let mut cfg = test_config(1);
        cfg.fail_log = Some(sqlstorm_core::config::FailLogConfig {
            path: log_path.clone(),
            format: FailLogFormat::Text,
        });
        let report = run_bench(cfg, client).await.unwrap();

        assert!(report.contains("connection refused"));
        let body = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(body.lines().count(), 2);
        assert!(body.contains("stage=connect"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_trigger_stops_an_endless_run() {
        // Connects fail forever with a 20ms backoff between attempts, so
        // only the 3s deadline can end the run.
        let script: Vec<ConnectOutcome> = (0..10_000)
            .map(|_| Err(ClientError::new(2002, "connection refused")))
            .collect();
        let run_flag = Arc::new(RunState::new());
        let client = Arc::new(ScriptedClient::new(script, run_flag));
        let mut cfg = test_config(1);
        cfg.retries = 10_000;
        cfg.max_run_time = Some(Duration::from_secs(3));
        let report = run_bench(cfg, client).await.unwrap();
        assert!(report.contains("final statistics:"));
        assert!(report.contains("connection refused"));
        assert!(!report.contains("[WARN]"));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_concurrency_is_rejected_before_starting() {
        let run_flag = Arc::new(RunState::new());
        let client = Arc::new(ScriptedClient::new(Vec::new(), run_flag));
        let cfg = test_config(0);
        assert!(run_bench(cfg, client).await.is_err());
    }
}
