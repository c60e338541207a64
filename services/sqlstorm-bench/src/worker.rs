//! Worker agent: the per-connection request loop.
//!
//! Each worker drives request cycles until the shared stop flag flips.
//! A cycle makes up to `retries + 1` attempts, each on a fresh
//! connection, and emits exactly one final event.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::debug;

use sqlstorm_core::Event;

use crate::client::DatabaseClient;
use crate::engine::RunState;

/// Everything one worker needs, cloned per spawned task.
#[derive(Clone)]
pub struct WorkerContext {
    pub id: usize,
    pub client: Arc<dyn DatabaseClient>,
    pub sql: String,
    pub retries: u32,
    pub backoff: Duration,
    pub run: Arc<RunState>,
    pub events: mpsc::Sender<Event>,
    pub done: mpsc::Sender<usize>,
}

impl WorkerContext {
    async fn emit(&self, event: Event) {
        // A closed queue means shutdown already drained; nothing to report.
        let _ = self.events.send(event).await;
    }
}

/// Runs request cycles until stopped, then signals completion.
pub async fn run_worker(ctx: WorkerContext) {
    while !ctx.run.is_stopping() {
        run_request(&ctx).await;
    }
    let _ = ctx.done.send(ctx.id).await;
}

/// One logical request: connect, query, retry with backoff. Emits the
/// per-attempt events and exactly one final event, or a compensating
/// `Cleanup` when abandoned mid-flight by shutdown.
async fn run_request(ctx: &WorkerContext) {
    let mut backoff_count: u32 = 0;
    let mut connect_total: f64 = 0.0;

    for attempt in 0..=ctx.retries {
        let is_final = attempt == ctx.retries;
        ctx.emit(Event::AttemptConnectBegin).await;
        let attempt_start = Instant::now();

        let connect_result = ctx.client.connect().await;
        let connect_time = attempt_start.elapsed().as_secs_f64();
        connect_total += connect_time;
        let session = match connect_result {
            Ok(session) => {
                ctx.emit(Event::AttemptConnectSuccess {
                    attempt_connect_time: connect_time,
                })
                .await;
                session
            }
            Err(err) => {
                debug!(
                    worker = ctx.id,
                    attempt, "connect failed after {connect_time:.6}s: {err}"
                );
                ctx.emit(Event::AttemptConnectFailure {
                    errno: err.errno,
                    message: err.message,
                    connect_time,
                    attempt,
                    is_final,
                    request_connect_total: is_final.then_some(connect_total),
                    request_backoff_count: is_final.then_some(backoff_count),
                })
                .await;
                if is_final {
                    return;
                }
                backoff_count += 1;
                if back_off(ctx).await {
                    return;
                }
                continue;
            }
        };

        // Stop may have flipped while connecting; the connect-success
        // event already raised inflight_query, so compensate it.
        if ctx.run.is_stopping() {
            session.close().await;
            ctx.emit(Event::Cleanup {
                inflight_connect_delta: 0,
                inflight_query_delta: -1,
            })
            .await;
            return;
        }

        let query_start = Instant::now();
        let mut session = session;
        match session.execute(&ctx.sql).await {
            Ok(()) => {
                let query_time = query_start.elapsed().as_secs_f64();
                session.close().await;
                let connection_lifetime = attempt_start.elapsed().as_secs_f64();
                debug!(
                    worker = ctx.id,
                    attempt, "query ok in {query_time:.6}s"
                );
                ctx.emit(Event::AttemptQuerySuccess {
                    connect_time,
                    query_time,
                    connection_lifetime,
                    request_connect_total: connect_total,
                    request_backoff_count: backoff_count,
                })
                .await;
                return;
            }
            Err(err) => {
                let query_time = query_start.elapsed().as_secs_f64();
                session.close().await;
                debug!(
                    worker = ctx.id,
                    attempt, "query failed after {query_time:.6}s: {err}"
                );
                ctx.emit(Event::AttemptQueryFailure {
                    errno: err.errno,
                    message: err.message,
                    connect_time,
                    query_time,
                    attempt,
                    is_final,
                    request_connect_total: is_final.then_some(connect_total),
                    request_backoff_count: is_final.then_some(backoff_count),
                })
                .await;
                if is_final {
                    return;
                }
                backoff_count += 1;
                if back_off(ctx).await {
                    return;
                }
            }
        }
    }
}

/// Emits the backoff event and suspends. Returns true when the stop flag
/// flipped during the suspension and the cycle should be abandoned.
async fn back_off(ctx: &WorkerContext) -> bool {
    ctx.emit(Event::Backoff).await;
    tokio::time::sleep(ctx.backoff).await;
    ctx.run.is_stopping()
}
