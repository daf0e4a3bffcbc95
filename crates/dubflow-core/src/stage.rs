//! Pipeline stage vocabulary.

use serde::{Deserialize, Serialize};

/// One stage of the dubbing pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Task-global speaker diarization, runs on the `default` language tag.
    SpeakerDiarization,
    /// Subtitle translation for one target language.
    Translation,
    /// Per-line neural voice cloning.
    VoiceCloning,
    /// Stitch cloned segments into one audio track.
    Stitch,
    /// Mux stitched audio with the original video.
    Export,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::SpeakerDiarization => "speaker_diarization",
            Stage::Translation => "translation",
            Stage::VoiceCloning => "voice_cloning",
            Stage::Stitch => "stitch",
            Stage::Export => "export",
        }
    }

    pub fn parse(s: &str) -> Option<Stage> {
        match s {
            "speaker_diarization" => Some(Stage::SpeakerDiarization),
            "translation" => Some(Stage::Translation),
            "voice_cloning" => Some(Stage::VoiceCloning),
            "stitch" => Some(Stage::Stitch),
            "export" => Some(Stage::Export),
            _ => None,
        }
    }

    /// Whether this stage runs once per task on the `default` language tag
    /// rather than once per target language.
    pub fn is_task_global(&self) -> bool {
        matches!(self, Stage::SpeakerDiarization)
    }

    /// The ordered per-language stage chain, diarization excluded.
    pub fn language_chain() -> [Stage; 4] {
        [
            Stage::Translation,
            Stage::VoiceCloning,
            Stage::Stitch,
            Stage::Export,
        ]
    }

    /// Every stage, in pipeline order.
    pub fn all() -> [Stage; 5] {
        [
            Stage::SpeakerDiarization,
            Stage::Translation,
            Stage::VoiceCloning,
            Stage::Stitch,
            Stage::Export,
        ]
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
