//! Benchmark configuration types and lenient value parsing.
//!
//! Parsing follows the tool's long-standing tolerance policy: a malformed
//! `--timeout` or `--max_run_time` warns on the diagnostic stream and
//! falls back to a safe default instead of aborting. Only missing
//! required parameters and a non-positive concurrency are fatal.

use std::path::PathBuf;
use std::time::Duration;

use chrono_tz::Tz;
use tracing::warn;

use crate::error::{BenchError, BenchResult};

/// Fallback connect timeout when `--timeout` cannot be parsed.
const DEFAULT_CONNECT_TIMEOUT_SECS: f64 = 3.0;

/// How a query-phase execution limit is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlTimeoutMode {
    /// Client-side deadline: abandon the wait and drop the connection.
    Client,
    /// Server-side limit via `SET SESSION MAX_EXECUTION_TIME`.
    Server,
}

impl SqlTimeoutMode {
    /// Parses the mode, warning and defaulting to `client` on bad input.
    pub fn parse_lossy(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "client" => Self::Client,
            "server" => Self::Server,
            other => {
                warn!("unknown --sql_timeout_mode `{other}`, using `client`");
                Self::Client
            }
        }
    }
}

/// How the network prober measures latency against the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetProbeMode {
    /// Transport-level connect latency against the target port.
    Tcp,
    /// Round-trip latency via the external `ping` utility.
    Icmp,
    /// No probing.
    None,
}

impl NetProbeMode {
    /// Parses the mode, warning and defaulting to `tcp` on bad input.
    pub fn parse_lossy(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "tcp" => Self::Tcp,
            "icmp" => Self::Icmp,
            "none" => Self::None,
            other => {
                warn!("unknown --net_probe_mode `{other}`, using `tcp`");
                Self::Tcp
            }
        }
    }

    /// Human-readable label used in the banner and status lines.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Tcp => "TCP connect",
            Self::Icmp => "ICMP ping",
            Self::None => "disabled",
        }
    }
}

/// Serialization form of the failure log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailLogFormat {
    /// One human-readable line per failure.
    Text,
    /// One JSON object per line, preserving the raw message.
    Jsonl,
}

impl FailLogFormat {
    /// Parses the format, warning and defaulting to `text` on bad input.
    pub fn parse_lossy(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "text" => Self::Text,
            "jsonl" => Self::Jsonl,
            other => {
                warn!("unknown --fail-log-format `{other}`, using `text`");
                Self::Text
            }
        }
    }

    /// Default file extension for this format.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Text => "log",
            Self::Jsonl => "jsonl",
        }
    }
}

/// Failure-log destination and form.
#[derive(Debug, Clone)]
pub struct FailLogConfig {
    pub path: PathBuf,
    pub format: FailLogFormat,
}

/// Fully validated run configuration.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub driver: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: Option<String>,
    pub sql: String,
    pub concurrency: usize,
    /// Connect-phase timeout. Applies to every attempt independently.
    pub connect_timeout: Duration,
    /// The user's original `--timeout` spelling, kept for the banner.
    pub connect_timeout_raw: String,
    /// Maximum retries per request; a request makes `retries + 1` attempts.
    pub retries: u32,
    pub backoff: Duration,
    pub debug: u8,
    pub tz: Tz,
    /// Query-phase execution limit; zero means unlimited.
    pub sql_exec_timeout: Duration,
    pub sql_timeout_mode: SqlTimeoutMode,
    /// Wall-clock deadline for the whole run; `None` means unlimited.
    pub max_run_time: Option<Duration>,
    pub net_probe_mode: NetProbeMode,
    pub net_probe_timeout: Duration,
    pub fail_log: Option<FailLogConfig>,
}

impl BenchConfig {
    /// Startup-time validation of the constraints that are fatal.
    pub fn validate(&self) -> BenchResult<()> {
        if self.host.is_empty() {
            return Err(BenchError::config("--host must not be empty"));
        }
        if self.user.is_empty() {
            return Err(BenchError::config("--user must not be empty"));
        }
        if self.sql.trim().is_empty() {
            return Err(BenchError::config("--sql must not be empty"));
        }
        if self.concurrency == 0 {
            return Err(BenchError::config("--c must be greater than 0"));
        }
        Ok(())
    }
}

/// Parses a connect timeout: bare or decimal seconds, `Ns`, or `Nms`.
/// Invalid input warns and falls back to 3.0 s.
pub fn parse_timeout(raw: &str) -> Duration {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        warn!("empty --timeout value, falling back to 3.0s");
        return Duration::from_secs_f64(DEFAULT_CONNECT_TIMEOUT_SECS);
    }
    let lower = trimmed.to_ascii_lowercase();
    let (number, scale) = if let Some(v) = lower.strip_suffix("ms") {
        (v.trim_end(), 0.001)
    } else if let Some(v) = lower.strip_suffix('s') {
        (v.trim_end(), 1.0)
    } else {
        (lower.as_str(), 1.0)
    };
    match number.parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 => Duration::from_secs_f64(v * scale),
        _ => {
            warn!("invalid --timeout value `{raw}`, falling back to 3.0s");
            Duration::from_secs_f64(DEFAULT_CONNECT_TIMEOUT_SECS)
        }
    }
}

/// Parses a run-time limit: bare seconds or `Ns`/`Nm`/`Nh`. Zero or
/// invalid input means unlimited; invalid input additionally warns.
pub fn parse_run_time(raw: &str) -> Option<Duration> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "0" {
        return None;
    }
    let lower = trimmed.to_ascii_lowercase();
    let (number, scale) = if let Some(v) = lower.strip_suffix('h') {
        (v.trim_end(), 3600.0)
    } else if let Some(v) = lower.strip_suffix('m') {
        (v.trim_end(), 60.0)
    } else if let Some(v) = lower.strip_suffix('s') {
        (v.trim_end(), 1.0)
    } else {
        (lower.as_str(), 1.0)
    };
    match number.parse::<f64>() {
        Ok(v) if v.is_finite() && v > 0.0 => Some(Duration::from_secs_f64(v * scale)),
        Ok(_) => None,
        Err(_) => {
            warn!("invalid --max_run_time value `{raw}`, running unlimited");
            None
        }
    }
}

/// Parses an IANA zone name, warning and defaulting to Asia/Shanghai on
/// bad input.
pub fn parse_tz_lossy(raw: &str) -> Tz {
    raw.parse().unwrap_or_else(|_| {
        warn!("unknown time zone `{raw}`, using Asia/Shanghai");
        chrono_tz::Asia::Shanghai
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(d: Duration) -> f64 {
        d.as_secs_f64()
    }

    #[test]
    fn timeout_accepts_all_documented_spellings() {
        assert!((secs(parse_timeout("300ms")) - 0.3).abs() < 1e-9);
        assert!((secs(parse_timeout("0.3")) - 0.3).abs() < 1e-9);
        assert!((secs(parse_timeout("2s")) - 2.0).abs() < 1e-9);
        assert!((secs(parse_timeout("2.5")) - 2.5).abs() < 1e-9);
        assert!((secs(parse_timeout(" 1500 ms ")) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn timeout_falls_back_on_garbage() {
        assert!((secs(parse_timeout("soon")) - 3.0).abs() < 1e-9);
        assert!((secs(parse_timeout("")) - 3.0).abs() < 1e-9);
        assert!((secs(parse_timeout("-5")) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn run_time_accepts_suffixes_and_zero() {
        assert_eq!(parse_run_time("0"), None);
        assert_eq!(parse_run_time("300"), Some(Duration::from_secs(300)));
        assert_eq!(parse_run_time("300s"), Some(Duration::from_secs(300)));
        assert_eq!(parse_run_time("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_run_time("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_run_time("later"), None);
    }

    #[test]
    fn mode_parsing_is_lossy() {
        assert_eq!(SqlTimeoutMode::parse_lossy("SERVER"), SqlTimeoutMode::Server);
        assert_eq!(SqlTimeoutMode::parse_lossy("bogus"), SqlTimeoutMode::Client);
        assert_eq!(NetProbeMode::parse_lossy("icmp"), NetProbeMode::Icmp);
        assert_eq!(NetProbeMode::parse_lossy("bogus"), NetProbeMode::Tcp);
        assert_eq!(FailLogFormat::parse_lossy("JSONL"), FailLogFormat::Jsonl);
    }

    #[test]
    fn validation_rejects_zero_concurrency() {
        let cfg = BenchConfig {
            driver: "mysql".into(),
            host: "db.example".into(),
            port: 3306,
            user: "bench".into(),
            password: "secret".into(),
            dbname: None,
            sql: "SELECT 1".into(),
            concurrency: 0,
            connect_timeout: Duration::from_secs(3),
            connect_timeout_raw: "3".into(),
            retries: 0,
            backoff: Duration::from_millis(200),
            debug: 0,
            tz: chrono_tz::Asia::Shanghai,
            sql_exec_timeout: Duration::ZERO,
            sql_timeout_mode: SqlTimeoutMode::Client,
            max_run_time: None,
            net_probe_mode: NetProbeMode::Tcp,
            net_probe_timeout: Duration::from_secs(1),
            fail_log: None,
        };
        assert!(cfg.validate().is_err());
    }
}
