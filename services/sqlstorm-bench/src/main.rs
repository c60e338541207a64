use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

mod client;
mod engine;
mod prober;
mod worker;

use client::{DatabaseClient, MySqlClient};
use sqlstorm_core::config::{
    parse_run_time, parse_timeout, parse_tz_lossy, BenchConfig, FailLogConfig, FailLogFormat,
    NetProbeMode, SqlTimeoutMode,
};

#[derive(Parser, Debug)]
#[command(name = "sqlstorm-bench")]
#[command(about = "Concurrent MySQL load-testing harness", long_about = None)]
#[command(version)]
struct Cli {
    /// Database client capability
    #[arg(long, default_value = "mysql")]
    driver: String,

    /// Target host (required)
    #[arg(long)]
    host: Option<String>,

    /// Target port
    #[arg(long, default_value_t = 3306)]
    port: u16,

    /// User name (required)
    #[arg(long)]
    user: Option<String>,

    /// Password (required)
    #[arg(long, env = "SQLSTORM_PASSWORD")]
    password: Option<String>,

    /// Database name
    #[arg(long)]
    dbname: Option<String>,

    /// Statement to execute repeatedly (required)
    #[arg(long)]
    sql: Option<String>,

    /// Concurrency: simultaneous worker agents (required, > 0)
    #[arg(long)]
    c: Option<usize>,

    /// Connect timeout: bare/decimal seconds, `Ns`, or `Nms`
    #[arg(long, default_value = "3")]
    timeout: String,

    /// Retries per request after the first attempt
    #[arg(long, default_value_t = 0)]
    retries: u32,

    /// Delay between retry attempts, milliseconds
    #[arg(long = "backoff-ms", default_value_t = 200)]
    backoff_ms: u64,

    /// Verbosity: 1 adds drift annotations, 2 adds per-attempt logging
    #[arg(long, default_value_t = 0)]
    debug: u8,

    /// IANA time zone for report timestamps
    #[arg(long, default_value = "Asia/Shanghai")]
    tz: String,

    /// Query execution limit in seconds, 0 = unlimited
    #[arg(long = "sql_exec_timeout", default_value_t = 0.0)]
    sql_exec_timeout: f64,

    /// Where the execution limit is enforced: client or server
    #[arg(long = "sql_timeout_mode", default_value = "client")]
    sql_timeout_mode: String,

    /// Run-time limit: bare seconds or `Ns`/`Nm`/`Nh`, 0 = unlimited
    #[arg(long = "max_run_time", default_value = "0")]
    max_run_time: String,

    /// Latency probe: tcp, icmp, or none
    #[arg(long = "net_probe_mode", default_value = "tcp")]
    net_probe_mode: String,

    /// Probe timeout, same spellings as --timeout
    #[arg(long = "net_probe_timeout", default_value = "1")]
    net_probe_timeout: String,

    /// Record failed attempts to a log file
    #[arg(long = "fail-log-enable", default_value_t = false)]
    fail_log_enable: bool,

    /// Failure log path; implies --fail-log-enable
    #[arg(long = "fail-log")]
    fail_log: Option<PathBuf>,

    /// Failure log form: text or jsonl
    #[arg(long = "fail-log-format", default_value = "text")]
    fail_log_format: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let cfg = match build_config(&cli) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("error: {err}");
            eprintln!("usage: sqlstorm-bench --host <HOST> --user <USER> --password <PASSWORD> --sql <SQL> --c <N> [options]");
            eprintln!("run `sqlstorm-bench --help` for the full option list");
            std::process::exit(1);
        }
    };

    let client: Arc<dyn DatabaseClient> = match cfg.driver.as_str() {
        "mysql" | "mysql_async" => Arc::new(MySqlClient::new(&cfg)),
        other => {
            eprintln!("error: no usable database client for --driver `{other}`");
            std::process::exit(1);
        }
    };

    print_banner(&cfg, client.label());

    match engine::run_bench(cfg, client).await {
        Ok(report) => print!("{report}"),
        Err(err) => {
            eprintln!("fatal: {err}");
            std::process::exit(1);
        }
    }
}

fn init_logging(debug: u8) {
    let default = match debug {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Assembles and validates the run configuration. Missing required
/// parameters are the only fatal CLI errors; malformed optional values
/// warn and fall back per the tolerance policy.
fn build_config(cli: &Cli) -> Result<BenchConfig, String> {
    let mut missing = Vec::new();
    if cli.host.is_none() {
        missing.push("--host");
    }
    if cli.user.is_none() {
        missing.push("--user");
    }
    if cli.password.is_none() {
        missing.push("--password");
    }
    if cli.sql.is_none() {
        missing.push("--sql");
    }
    if cli.c.is_none() {
        missing.push("--c");
    }
    if !missing.is_empty() {
        return Err(format!("missing required parameter(s): {}", missing.join(", ")));
    }

    let tz = parse_tz_lossy(&cli.tz);
    let fail_log_format = FailLogFormat::parse_lossy(&cli.fail_log_format);
    let fail_log = (cli.fail_log_enable || cli.fail_log.is_some()).then(|| FailLogConfig {
        path: cli
            .fail_log
            .clone()
            .unwrap_or_else(|| default_fail_log_path(tz, fail_log_format)),
        format: fail_log_format,
    });

    let cfg = BenchConfig {
        driver: cli.driver.clone(),
        host: cli.host.clone().unwrap_or_default(),
        port: cli.port,
        user: cli.user.clone().unwrap_or_default(),
        password: cli.password.clone().unwrap_or_default(),
        dbname: cli.dbname.clone(),
        sql: cli.sql.clone().unwrap_or_default(),
        concurrency: cli.c.unwrap_or_default(),
        connect_timeout: parse_timeout(&cli.timeout),
        connect_timeout_raw: cli.timeout.clone(),
        retries: cli.retries,
        backoff: Duration::from_millis(cli.backoff_ms),
        debug: cli.debug,
        tz,
        sql_exec_timeout: if cli.sql_exec_timeout > 0.0 {
            Duration::from_secs_f64(cli.sql_exec_timeout)
        } else {
            Duration::ZERO
        },
        sql_timeout_mode: SqlTimeoutMode::parse_lossy(&cli.sql_timeout_mode),
        max_run_time: parse_run_time(&cli.max_run_time),
        net_probe_mode: NetProbeMode::parse_lossy(&cli.net_probe_mode),
        net_probe_timeout: parse_timeout(&cli.net_probe_timeout),
        fail_log,
    };
    cfg.validate().map_err(|err| err.to_string())?;
    Ok(cfg)
}

/// Default failure-log name, stamped with the run start in the reporting
/// time zone: `bench_fail_20260825_120000.log`.
fn default_fail_log_path(tz: chrono_tz::Tz, format: FailLogFormat) -> PathBuf {
    let stamp = chrono::Utc::now()
        .with_timezone(&tz)
        .format("%Y%m%d_%H%M%S");
    PathBuf::from(format!("bench_fail_{stamp}.{}", format.extension()))
}

fn print_banner(cfg: &BenchConfig, driver_label: &str) {
    let target_db = cfg
        .dbname
        .as_deref()
        .map(|db| format!("/{db}"))
        .unwrap_or_default();
    let exec_timeout = if cfg.sql_exec_timeout.is_zero() {
        "unlimited".to_string()
    } else {
        format!(
            "{:.3}s ({:?} side)",
            cfg.sql_exec_timeout.as_secs_f64(),
            cfg.sql_timeout_mode
        )
        .to_lowercase()
    };
    let run_limit = cfg
        .max_run_time
        .map_or_else(|| "unlimited".to_string(), |d| format!("{}s", d.as_secs()));
    let fail_log = cfg.fail_log.as_ref().map_or_else(
        || "disabled".to_string(),
        |fl| format!("{} ({:?})", fl.path.display(), fl.format).to_lowercase(),
    );

    println!("----------------------------------------");
    println!("sqlstorm-bench starting");
    println!(
        "target: {}@{}:{}{target_db} | driver: {driver_label}",
        cfg.user, cfg.host, cfg.port
    );
    println!(
        "concurrency: {} | connect timeout: {} ({:.3}s) | retries: {} | backoff: {}ms",
        cfg.concurrency,
        cfg.connect_timeout_raw,
        cfg.connect_timeout.as_secs_f64(),
        cfg.retries,
        cfg.backoff.as_millis()
    );
    println!(
        "sql timeout: {exec_timeout} | run limit: {run_limit} | net probe: {} | tz: {}",
        cfg.net_probe_mode.label(),
        cfg.tz
    );
    println!("fail log: {fail_log}");
    println!("sql: {}", cfg.sql.trim());
    println!("note: reported connections are in-flight queries and may drift from active workers at tick boundaries");
    println!("----------------------------------------");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_args() -> Vec<&'static str> {
        vec![
            "sqlstorm-bench",
            "--host",
            "db.example",
            "--user",
            "bench",
            "--password",
            "secret",
            "--sql",
            "SELECT 1",
            "--c",
            "8",
        ]
    }

    #[test]
    fn minimal_invocation_builds_a_valid_config() {
        let cli = Cli::try_parse_from(full_args()).unwrap();
        let cfg = build_config(&cli).unwrap();
        assert_eq!(cfg.concurrency, 8);
        assert_eq!(cfg.port, 3306);
        assert!((cfg.connect_timeout.as_secs_f64() - 3.0).abs() < 1e-9);
        assert_eq!(cfg.net_probe_mode, NetProbeMode::Tcp);
        assert!(cfg.fail_log.is_none());
        assert!(cfg.max_run_time.is_none());
    }

    #[test]
    fn missing_required_parameters_are_reported_together() {
        let cli = Cli::try_parse_from(["sqlstorm-bench", "--host", "db.example"]).unwrap();
        let err = build_config(&cli).unwrap_err();
        assert!(err.contains("--user"));
        assert!(err.contains("--password"));
        assert!(err.contains("--sql"));
        assert!(err.contains("--c"));
        assert!(!err.contains("--host"));
    }

    #[test]
    fn fail_log_enable_without_path_gets_a_stamped_default() {
        let mut args = full_args();
        args.push("--fail-log-enable");
        args.extend(["--fail-log-format", "jsonl"]);
        let cli = Cli::try_parse_from(args).unwrap();
        let cfg = build_config(&cli).unwrap();
        let fl = cfg.fail_log.unwrap();
        let name = fl.path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("bench_fail_"));
        assert!(name.ends_with(".jsonl"));
    }

    #[test]
    fn explicit_fail_log_path_implies_enable() {
        let mut args = full_args();
        args.extend(["--fail-log", "/tmp/failures.log"]);
        let cli = Cli::try_parse_from(args).unwrap();
        let cfg = build_config(&cli).unwrap();
        assert_eq!(
            cfg.fail_log.unwrap().path,
            PathBuf::from("/tmp/failures.log")
        );
    }

    #[test]
    fn lossy_options_never_fail_the_parse() {
        let mut args = full_args();
        args.extend([
            "--timeout",
            "soon",
            "--net_probe_mode",
            "quantum",
            "--max_run_time",
            "whenever",
            "--tz",
            "Mars/Olympus",
        ]);
        let cli = Cli::try_parse_from(args).unwrap();
        let cfg = build_config(&cli).unwrap();
        assert!((cfg.connect_timeout.as_secs_f64() - 3.0).abs() < 1e-9);
        assert_eq!(cfg.net_probe_mode, NetProbeMode::Tcp);
        assert!(cfg.max_run_time.is_none());
        assert_eq!(cfg.tz, chrono_tz::Asia::Shanghai);
    }
}
