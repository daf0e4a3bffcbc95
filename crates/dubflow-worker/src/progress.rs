//! Progress line parsing.
//!
//! Workers interleave two recognizable shapes with free-form log text:
//! `[Stage] <event>` lines and `<current>/<total>` counters. Everything is
//! parsed defensively; unrecognized lines yield nothing.

use regex::Regex;
use std::sync::OnceLock;

use dubflow_core::worker::WorkerProgress;

fn ratio_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|\s)(\d{1,7})\s*/\s*(\d{1,7})(?:\s|$)").unwrap())
}

fn event_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[([A-Za-z][\w ]*)\]\s*(.+)$").unwrap())
}

/// Parse one output line into a progress observation.
pub fn parse_line(line: &str) -> Option<WorkerProgress> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Some(caps) = event_regex().captures(line) {
        return Some(WorkerProgress {
            percent: None,
            message: Some(format!("[{}] {}", &caps[1], caps[2].trim())),
        });
    }

    if let Some(caps) = ratio_regex().captures(line) {
        let current: u64 = caps[1].parse().ok()?;
        let total: u64 = caps[2].parse().ok()?;
        if total > 0 && current <= total {
            return Some(WorkerProgress {
                percent: Some((current * 100 / total) as u8),
                message: None,
            });
        }
    }

    None
}
