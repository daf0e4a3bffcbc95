//! SRT subtitle parsing and rendering.
//!
//! The pipeline treats the source subtitle as the line-level unit of work:
//! diarization labels align with these lines, translation preserves their
//! count and time ranges, and cloning produces one segment per line.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::{Error, Result};

/// One subtitle line with times in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleLine {
    pub index: usize,
    pub start_time: f64,
    pub end_time: f64,
    pub text: String,
}

fn timing_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d{1,2}):(\d{2}):(\d{2})[,.](\d{1,3})\s*-->\s*(\d{1,2}):(\d{2}):(\d{2})[,.](\d{1,3})")
            .unwrap()
    })
}

fn captured_seconds(caps: &regex::Captures<'_>, offset: usize) -> f64 {
    let field = |i: usize| caps[i + offset].parse::<f64>().unwrap_or(0.0);
    field(1) * 3600.0 + field(2) * 60.0 + field(3) + field(4) / 1000.0
}

/// Parse SRT text into lines. Blocks are renumbered sequentially from 1;
/// malformed blocks are an error, not silently dropped.
pub fn parse_srt(content: &str) -> Result<Vec<SubtitleLine>> {
    let normalized = content.replace("\r\n", "\n").replace('\u{feff}', "");
    let mut lines = Vec::new();

    for block in normalized.split("\n\n").map(str::trim).filter(|b| !b.is_empty()) {
        let mut rows = block.lines();
        let first = rows.next().unwrap_or_default().trim();

        // The counter row is optional in the wild; the timing row is not.
        let timing_row = if timing_regex().is_match(first) {
            first.to_string()
        } else {
            if first.parse::<usize>().is_err() {
                return Err(Error::InvalidInput(format!(
                    "malformed subtitle block: {first:?}"
                )));
            }
            rows.next().unwrap_or_default().trim().to_string()
        };

        let caps = timing_regex().captures(&timing_row).ok_or_else(|| {
            Error::InvalidInput(format!("malformed subtitle timing: {timing_row:?}"))
        })?;
        let start_time = captured_seconds(&caps, 0);
        let end_time = captured_seconds(&caps, 4);

        let text = rows.collect::<Vec<_>>().join("\n").trim().to_string();
        lines.push(SubtitleLine {
            index: lines.len() + 1,
            start_time,
            end_time,
            text,
        });
    }

    if lines.is_empty() {
        return Err(Error::InvalidInput("subtitle file has no entries".to_string()));
    }
    Ok(lines)
}

/// Format seconds as `HH:MM:SS,mmm`.
pub fn format_timestamp(seconds: f64) -> String {
    let total_millis = (seconds.max(0.0) * 1000.0).round() as u64;
    let millis = total_millis % 1000;
    let total_secs = total_millis / 1000;
    format!(
        "{:02}:{:02}:{:02},{:03}",
        total_secs / 3600,
        (total_secs % 3600) / 60,
        total_secs % 60,
        millis
    )
}

/// Render lines back to SRT text.
pub fn render_srt(lines: &[SubtitleLine]) -> String {
    let mut out = String::new();
    for (i, line) in lines.iter().enumerate() {
        out.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            i + 1,
            format_timestamp(line.start_time),
            format_timestamp(line.end_time),
            line.text
        ));
    }
    out
}
