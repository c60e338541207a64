//! Periodic network-latency prober.
//!
//! Runs alongside the workers, pushing one latency sample per second
//! into the event queue. TCP mode measures transport connect latency
//! against the target port; ICMP mode shells out to `ping`. Probe
//! failures yield no sample and are surfaced once per run.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::warn;

use sqlstorm_core::config::NetProbeMode;
use sqlstorm_core::Event;

use crate::engine::RunState;

const PROBE_INTERVAL: Duration = Duration::from_secs(1);

static PING_TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"time[=<]\s*([0-9]+(?:\.[0-9]+)?)\s*ms").expect("ping time regex"));
static PING_RTT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"rtt [^=]+= *[0-9.]+/([0-9.]+)/").expect("ping rtt regex")
});

#[derive(Clone)]
pub struct ProberContext {
    pub mode: NetProbeMode,
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
    pub run: Arc<RunState>,
    pub events: mpsc::Sender<Event>,
}

pub async fn run_prober(ctx: ProberContext) {
    if ctx.mode == NetProbeMode::None {
        return;
    }
    let mut failure_reported = false;
    while !ctx.run.is_stopping() {
        let sample = match ctx.mode {
            NetProbeMode::Tcp => probe_tcp(&ctx).await,
            NetProbeMode::Icmp => probe_icmp(&ctx).await,
            NetProbeMode::None => return,
        };
        if sample.is_none() && !failure_reported {
            warn!(
                "network probe ({}) against {}:{} is failing; latency sampling degraded",
                ctx.mode.label(),
                ctx.host,
                ctx.port
            );
            failure_reported = true;
        }
        let event = Event::NetworkProbeSample {
            ok: sample.is_some(),
            latency_seconds: sample,
        };
        if ctx.events.send(event).await.is_err() {
            return;
        }
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
}

async fn probe_tcp(ctx: &ProberContext) -> Option<f64> {
    let start = Instant::now();
    let connect = TcpStream::connect((ctx.host.as_str(), ctx.port));
    match tokio::time::timeout(ctx.timeout, connect).await {
        Ok(Ok(stream)) => {
            let latency = start.elapsed().as_secs_f64();
            drop(stream);
            Some(latency)
        }
        _ => None,
    }
}

async fn probe_icmp(ctx: &ProberContext) -> Option<f64> {
    let wait_secs = ctx.timeout.as_secs_f64().ceil().max(1.0) as u64;
    let output = Command::new("ping")
        .arg("-c")
        .arg("1")
        .arg("-W")
        .arg(wait_secs.to_string())
        .arg(&ctx.host)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output();
    // One extra second of slack over ping's own wait covers process
    // startup without letting a hung child stall the loop.
    let slack = ctx.timeout + Duration::from_secs(1);
    match tokio::time::timeout(slack, output).await {
        Ok(Ok(out)) if out.status.success() => {
            parse_ping_latency(&String::from_utf8_lossy(&out.stdout))
        }
        _ => None,
    }
}

/// Extracts the round-trip time from `ping` output, in seconds. Falls
/// back to the avg of the `rtt min/avg/max/mdev` summary line for pings
/// that omit a per-reply time.
fn parse_ping_latency(stdout: &str) -> Option<f64> {
    if let Some(caps) = PING_TIME_RE.captures(stdout) {
        return caps[1].parse::<f64>().ok().map(|ms| ms / 1000.0);
    }
    let caps = PING_RTT_RE.captures(stdout)?;
    caps[1].parse::<f64>().ok().map(|ms| ms / 1000.0)
}
