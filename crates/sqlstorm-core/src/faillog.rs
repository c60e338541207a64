//! Best-effort failure log with size-based rotation.
//!
//! The writer must never abort the run: open and write errors degrade it
//! (one reopen attempt, then permanently disabled) and surface a single
//! diagnostic. Rotation replaces the sink with `<base>.partNN<ext>` once
//! the current file would exceed the threshold.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::FailLogFormat;
use crate::event::Stage;

/// Rotation threshold for the failure log (100 MiB).
pub const FAIL_LOG_MAX_BYTES: u64 = 100 * 1024 * 1024;

/// One failed attempt, fully resolved for durable logging.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub ts: String,
    pub stage: Stage,
    pub driver: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(rename = "db")]
    pub dbname: String,
    pub sql: String,
    pub errno: u32,
    /// Normalized message, as used for the failure breakdown.
    pub message: String,
    /// Raw message exactly as the client produced it.
    pub message_raw: String,
    pub connect_time: f64,
    pub query_time: f64,
    pub attempt: u32,
}

/// Appending failure-log sink with rotation and crash-resilient reopen.
pub struct FailureLogWriter {
    enabled: bool,
    format: FailLogFormat,
    base_path: PathBuf,
    path: PathBuf,
    file: Option<File>,
    cur_size: u64,
    part_index: u32,
    reopen_attempted: bool,
    rotate_threshold: u64,
}

impl FailureLogWriter {
    /// Opens (or creates) the sink in append mode. An unopenable path
    /// yields a disabled writer and one warning, not an error.
    pub fn open(path: &Path, format: FailLogFormat) -> Self {
        Self::with_threshold(path, format, FAIL_LOG_MAX_BYTES)
    }

    fn with_threshold(path: &Path, format: FailLogFormat, rotate_threshold: u64) -> Self {
        let mut writer = Self {
            enabled: true,
            format,
            base_path: path.to_path_buf(),
            path: path.to_path_buf(),
            file: None,
            cur_size: 0,
            part_index: 0,
            reopen_attempted: false,
            rotate_threshold,
        };
        match append_handle(path) {
            Ok(file) => {
                writer.cur_size = file.metadata().map(|m| m.len()).unwrap_or(0);
                writer.file = Some(file);
            }
            Err(err) => {
                warn!("cannot open failure log {}: {err}", path.display());
                writer.enabled = false;
            }
        }
        writer
    }

    /// Appends one record. Best effort: rotation and reopen are handled
    /// internally and failures disable the writer for the rest of the run.
    pub fn write(&mut self, record: &FailureRecord) {
        if !self.enabled {
            return;
        }
        let line = self.render(record);
        if line.is_empty() {
            return;
        }
        let entry_size = line.len() as u64 + 1;
        if self.cur_size + entry_size > self.rotate_threshold {
            self.rotate();
            if !self.enabled {
                return;
            }
        }
        if self.file.is_none() && !self.try_reopen() {
            return;
        }
        if let Some(file) = self.file.as_mut() {
            match writeln!(file, "{line}") {
                Ok(()) => self.cur_size += entry_size,
                Err(err) => {
                    warn!("failure log write error: {err}");
                    if self.try_reopen() {
                        if let Some(file) = self.file.as_mut() {
                            if writeln!(file, "{line}").is_ok() {
                                self.cur_size += entry_size;
                                return;
                            }
                        }
                    }
                    self.enabled = false;
                    warn!("failure log disabled for the remainder of the run");
                }
            }
        }
    }

    /// Flushes and releases the sink.
    pub fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(err) = file.flush() {
                warn!("failure log flush error on close: {err}");
            }
        }
        self.enabled = false;
    }

    /// Path of the sink currently being written.
    #[must_use]
    pub fn current_path(&self) -> &Path {
        &self.path
    }

    fn render(&self, r: &FailureRecord) -> String {
        match self.format {
            FailLogFormat::Jsonl => serde_json::to_string(r).unwrap_or_default(),
            FailLogFormat::Text => {
                let context = match r.stage {
                    Stage::Connect => format!(
                        "target={}:{} user={} db={}",
                        r.host, r.port, r.user, r.dbname
                    ),
                    Stage::Query => format!("sql={}", r.sql.trim()),
                };
                let message = if r.message.is_empty() { "-" } else { &r.message };
                let mut line = format!(
                    "[{}] stage={} driver={} attempt={} {} errno={} message={} connect={:.6}s",
                    r.ts, r.stage, r.driver, r.attempt, context, r.errno, message, r.connect_time
                );
                if r.query_time > 0.0 {
                    line.push_str(&format!(" query={:.6}s", r.query_time));
                }
                line
            }
        }
    }

    fn rotate(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }
        self.part_index += 1;
        self.path = part_path(&self.base_path, self.part_index);
        // One retry on open, then degrade.
        let handle = append_handle(&self.path).or_else(|_| append_handle(&self.path));
        match handle {
            Ok(file) => {
                self.file = Some(file);
                self.cur_size = 0;
                info!("failure log rotated to {}", self.path.display());
            }
            Err(err) => {
                warn!(
                    "failure log rotation to {} failed, disabling: {err}",
                    self.path.display()
                );
                self.enabled = false;
            }
        }
    }

    fn try_reopen(&mut self) -> bool {
        if self.reopen_attempted {
            self.enabled = false;
            return false;
        }
        self.reopen_attempted = true;
        match append_handle(&self.path) {
            Ok(file) => {
                self.cur_size = file.metadata().map(|m| m.len()).unwrap_or(0);
                self.file = Some(file);
                true
            }
            Err(err) => {
                warn!(
                    "failure log reopen of {} failed, disabling: {err}",
                    self.path.display()
                );
                self.enabled = false;
                false
            }
        }
    }
}

fn append_handle(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Rotation naming: the first file keeps the user's name; later parts
/// insert a zero-padded sequence before the extension
/// (`bench_fail.log` -> `bench_fail.part01.log`).
fn part_path(base: &Path, index: u32) -> PathBuf {
    if index == 0 {
        return base.to_path_buf();
    }
    let stem = base
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("bench_fail");
    let name = match base.extension().and_then(|s| s.to_str()) {
        Some(ext) => format!("{stem}.part{index:02}.{ext}"),
        None => format!("{stem}.part{index:02}"),
    };
    base.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Stage;

    fn record(message_raw: &str) -> FailureRecord {
        FailureRecord {
            ts: "2026-08-25 12:00:00".to_string(),
            stage: Stage::Connect,
            driver: "mysql_async".to_string(),
            host: "db.example".to_string(),
            port: 3306,
            user: "bench".to_string(),
            dbname: "test".to_string(),
            sql: "SELECT 1".to_string(),
            errno: 2002,
            message: crate::classify::normalize_message(message_raw),
            message_raw: message_raw.to_string(),
            connect_time: 0.012345,
            query_time: 0.0,
            attempt: 0,
        }
    }

    #[test]
    fn part_paths_increment_before_the_extension() {
        let base = Path::new("/tmp/bench_fail.log");
        assert_eq!(part_path(base, 0), PathBuf::from("/tmp/bench_fail.log"));
        assert_eq!(part_path(base, 1), PathBuf::from("/tmp/bench_fail.part01.log"));
        assert_eq!(part_path(base, 12), PathBuf::from("/tmp/bench_fail.part12.log"));
        assert_eq!(
            part_path(Path::new("/tmp/noext"), 2),
            PathBuf::from("/tmp/noext.part02")
        );
    }

    #[test]
    fn rotation_moves_subsequent_entries_to_the_next_part() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path().join("bench_fail.log");
        // Threshold small enough that the second entry must rotate.
        let rec = record("connection refused");
        let entry_len = {
            let probe = FailureLogWriter::with_threshold(&base, FailLogFormat::Text, u64::MAX);
            probe.render(&rec).len() as u64 + 1
        };
        let mut writer =
            FailureLogWriter::with_threshold(&base, FailLogFormat::Text, entry_len + 10);

        writer.write(&rec);
        writer.write(&rec);
        writer.write(&rec);
        writer.close();

        let part1 = dir.path().join("bench_fail.part01.log");
        let part2 = dir.path().join("bench_fail.part02.log");
        let first = std::fs::read_to_string(&base).expect("base file");
        let second = std::fs::read_to_string(&part1).expect("part01 file");
        let third = std::fs::read_to_string(&part2).expect("part02 file");
        assert_eq!(first.lines().count(), 1);
        assert_eq!(second.lines().count(), 1);
        assert_eq!(third.lines().count(), 1);
    }

    #[test]
    fn jsonl_preserves_raw_and_normalized_messages() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path().join("bench_fail.jsonl");
        let mut writer = FailureLogWriter::open(&base, FailLogFormat::Jsonl);
        writer.write(&record("refused   by peer (connection id: 99)"));
        writer.close();

        let body = std::fs::read_to_string(&base).expect("jsonl file");
        let parsed: serde_json::Value = serde_json::from_str(body.trim()).expect("valid json");
        assert_eq!(parsed["message"], "refused by peer");
        assert_eq!(parsed["message_raw"], "refused   by peer (connection id: 99)");
        assert_eq!(parsed["stage"], "connect");
        assert_eq!(parsed["db"], "test");
    }

    #[test]
    fn text_form_switches_context_by_stage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path().join("bench_fail.log");
        let mut writer = FailureLogWriter::open(&base, FailLogFormat::Text);
        let mut query_rec = record("MAX_EXECUTION_TIME exceeded");
        query_rec.stage = Stage::Query;
        query_rec.query_time = 1.5;
        writer.write(&record("connection refused"));
        writer.write(&query_rec);
        writer.close();

        let body = std::fs::read_to_string(&base).expect("log file");
        let lines: Vec<&str> = body.lines().collect();
        assert!(lines[0].contains("stage=connect"));
        assert!(lines[0].contains("target=db.example:3306"));
        assert!(!lines[0].contains("query="));
        assert!(lines[1].contains("stage=query"));
        assert!(lines[1].contains("sql=SELECT 1"));
        assert!(lines[1].contains("query=1.500000s"));
    }
}
