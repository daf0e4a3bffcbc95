//! Video metadata probing via ffprobe.

use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use tokio::process::Command;

use dubflow_core::{Error, Result};

/// Probed metadata of an uploaded video.
#[derive(Debug, Clone, Serialize)]
pub struct VideoInfo {
    pub size: u64,
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub resolution: String,
    pub bitrate: u64,
    pub codec: String,
}

/// Run ffprobe against a stored video.
pub async fn probe_video(path: &Path) -> Result<VideoInfo> {
    let size = tokio::fs::metadata(path)
        .await
        .map_err(|_| Error::NotFound(format!("video file {} missing", path.display())))?
        .len();

    let output = Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .output()
        .await
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => {
                Error::WorkerUnavailable("ffprobe is not installed".to_string())
            }
            _ => Error::Internal(err.to_string()),
        })?;

    if !output.status.success() {
        return Err(Error::WorkerFailed(format!(
            "ffprobe failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let probe: Value = serde_json::from_slice(&output.stdout)
        .map_err(|e| Error::WorkerFailed(format!("ffprobe output unreadable: {e}")))?;
    Ok(parse_probe(&probe, size))
}

fn parse_probe(probe: &Value, size: u64) -> VideoInfo {
    let format = &probe["format"];
    let duration = format["duration"]
        .as_str()
        .and_then(|d| d.parse().ok())
        .unwrap_or(0.0);
    let bitrate = format["bit_rate"]
        .as_str()
        .and_then(|b| b.parse().ok())
        .unwrap_or(0);

    let video_stream = probe["streams"]
        .as_array()
        .and_then(|streams| {
            streams
                .iter()
                .find(|s| s["codec_type"].as_str() == Some("video"))
        })
        .cloned()
        .unwrap_or_default();
    let width = video_stream["width"].as_u64().unwrap_or(0) as u32;
    let height = video_stream["height"].as_u64().unwrap_or(0) as u32;

    VideoInfo {
        size,
        duration,
        width,
        height,
        resolution: format!("{width}x{height}"),
        bitrate,
        codec: video_stream["codec_name"]
            .as_str()
            .unwrap_or("unknown")
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_a_typical_probe_document() {
        let probe = json!({
            "format": {"duration": "12.480000", "bit_rate": "1205000"},
            "streams": [
                {"codec_type": "audio", "codec_name": "aac"},
                {"codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080},
            ]
        });
        let info = parse_probe(&probe, 1024);
        assert_eq!(info.size, 1024);
        assert_eq!(info.duration, 12.48);
        assert_eq!(info.resolution, "1920x1080");
        assert_eq!(info.codec, "h264");
        assert_eq!(info.bitrate, 1_205_000);
    }

    #[test]
    fn missing_fields_degrade_to_defaults() {
        let info = parse_probe(&json!({}), 0);
        assert_eq!(info.duration, 0.0);
        assert_eq!(info.resolution, "0x0");
        assert_eq!(info.codec, "unknown");
    }
}
