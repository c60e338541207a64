//! Error normalization and classification for the failure breakdown.
//!
//! Semantically identical failures must group together regardless of
//! per-instance detail, so normalization strips the dynamic fragments
//! MySQL clients embed in messages: addresses, connection ids, bracketed
//! numeric codes, and trailing source locators.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::event::Stage;

/// MySQL error code for a server-side `MAX_EXECUTION_TIME` timeout.
pub const SERVER_EXEC_TIMEOUT_ERRNO: u32 = 3024;

/// Message marker for the same condition, matched case-insensitively.
const SERVER_EXEC_TIMEOUT_MARKER: &str = "max_execution_time exceeded";

static WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));
static AT_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s+at\s+[^:]+:\s*line\s*\d+\s*$").expect("locator regex"));
static CONN_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s+\(connection id:\s*\d+\)\s*$").expect("connection id regex"));
static IP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,3}\.){3}\d{1,3}(:\d+)?").expect("address regex"));
static BRACKET_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[[0-9]{3,5}\]").expect("bracketed code regex"));
static BRACKET_CAPTURE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(\d{3,5})\]").expect("bracketed capture regex"));
static ERRNO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)errno\s*(\d{3,5})").expect("errno regex"));
static TIMEOUT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)timeout|timed out").expect("timeout regex"));

/// Strips incidental dynamic fragments from an error message so that
/// repeated occurrences of the same failure collapse into one category.
pub fn normalize_message(msg: &str) -> String {
    let m = msg.trim();
    if m.is_empty() {
        return String::new();
    }
    let m = WS_RE.replace_all(m, " ");
    let m = AT_LINE_RE.replace(&m, "");
    let m = CONN_ID_RE.replace(&m, "");
    let m = IP_RE.replace_all(&m, "");
    let m = BRACKET_CODE_RE.replace_all(&m, "");
    m.trim().to_string()
}

/// Pulls a numeric error code out of message text, for clients that only
/// report `SQLSTATE[HY000] [2002] ...` style strings. Returns 0 when no
/// code is present.
pub fn extract_errno(msg: &str) -> u32 {
    if let Some(caps) = BRACKET_CAPTURE_RE.captures(msg) {
        if let Ok(n) = caps[1].parse() {
            return n;
        }
    }
    if let Some(caps) = ERRNO_RE.captures(msg) {
        if let Ok(n) = caps[1].parse() {
            return n;
        }
    }
    0
}

/// Maps a failure to its reporting category.
///
/// Order matters: the server-side execution-limit timeout is recognized
/// first (by code or marker), then a client-side query timeout, then the
/// normalized message text, then a synthesized `errno=N` label, and
/// finally `Unknown`.
pub fn classify(errno: u32, message: &str, stage: Stage) -> String {
    if errno == SERVER_EXEC_TIMEOUT_ERRNO
        || message.to_ascii_lowercase().contains(SERVER_EXEC_TIMEOUT_MARKER)
    {
        return "Execution time exceeded".to_string();
    }
    if stage == Stage::Query && TIMEOUT_RE.is_match(message) {
        return "Client query timed out".to_string();
    }
    let normalized = normalize_message(message);
    if !normalized.is_empty() {
        return normalized;
    }
    if errno > 0 {
        return format!("errno={errno}");
    }
    "Unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_strips_dynamic_fragments() {
        assert_eq!(
            normalize_message("Connection refused   by  server (connection id: 4821)"),
            "Connection refused by server"
        );
        // Address removal happens after whitespace collapse, so the gap
        // where the address sat is preserved.
        assert_eq!(
            normalize_message("can't reach 10.0.3.17:3306 for handshake"),
            "can't reach  for handshake"
        );
        assert_eq!(
            normalize_message("SQLSTATE[HY000] [2002] No route to host"),
            "SQLSTATE[HY000]  No route to host"
        );
        assert_eq!(normalize_message("  "), "");
    }

    #[test]
    fn errno_extraction_handles_sqlstate_and_errno_forms() {
        assert_eq!(extract_errno("SQLSTATE[HY000] [2002] Connection timed out"), 2002);
        assert_eq!(extract_errno("server gone, errno 2013"), 2013);
        assert_eq!(extract_errno("no code here"), 0);
    }

    #[test]
    fn execution_time_exceeded_wins_regardless_of_message() {
        assert_eq!(
            classify(3024, "whatever the server said", Stage::Query),
            "Execution time exceeded"
        );
        assert_eq!(
            classify(0, "Query aborted: MAX_EXECUTION_TIME exceeded", Stage::Query),
            "Execution time exceeded"
        );
        // Same code on the connect stage still wins.
        assert_eq!(classify(3024, "", Stage::Connect), "Execution time exceeded");
    }

    #[test]
    fn query_stage_timeouts_group_as_client_timeout() {
        assert_eq!(
            classify(0, "read timed out after 2.0s", Stage::Query),
            "Client query timed out"
        );
        // Connect-stage timeouts keep their message category instead.
        assert_eq!(
            classify(2002, "connection timed out", Stage::Connect),
            "connection timed out"
        );
    }

    #[test]
    fn fallback_chain_reaches_errno_and_unknown() {
        assert_eq!(classify(1040, "", Stage::Connect), "errno=1040");
        assert_eq!(classify(0, "", Stage::Connect), "Unknown");
    }
}
