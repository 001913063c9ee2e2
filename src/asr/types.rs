//! Value types shared by the pipeline, formatter and engines.

use crate::error::AppError;
use serde::Serialize;

/// Type of inference task requested by the client.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Task {
    /// Convert speech to text in the spoken language.
    Transcribe,
    /// Convert speech to English text.
    Translate,
}

impl Task {
    pub fn as_str(self) -> &'static str {
        match self {
            Task::Transcribe => "transcribe",
            Task::Translate => "translate",
        }
    }
}

impl std::str::FromStr for Task {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, AppError> {
        match s {
            "transcribe" => Ok(Task::Transcribe),
            "translate" => Ok(Task::Translate),
            other => Err(AppError::InvalidRequest(format!(
                "unknown task '{}', expected 'transcribe' or 'translate'",
                other
            ))),
        }
    }
}

/// One recognized utterance span.
///
/// Produced incrementally by the engine in non-decreasing start order and
/// consumed exactly once by the formatter; `start <= end` always holds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    /// Start time in seconds
    pub start: f64,
    /// End time in seconds
    pub end: f64,
    /// Recognized text
    pub text: String,
    /// Per-word timing, when word timestamps were requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub words: Option<Vec<Word>>,
    /// Speaker label, when diarization ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
}

impl Segment {
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
            words: None,
            speaker: None,
        }
    }
}

/// Timing for a single word within a segment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Word {
    pub word: String,
    pub start: f64,
    pub end: f64,
}

/// Diarization sub-options; only meaningful on engines that declare the
/// capability.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiarizationOptions {
    pub enabled: bool,
    pub min_speakers: Option<u32>,
    pub max_speakers: Option<u32>,
}

/// Immutable per-request option bundle, constructed once from validated
/// query input and passed by value into the pipeline.
#[derive(Debug, Clone)]
pub struct TranscriptionOptions {
    pub task: Task,
    /// Language hint; `None` means auto-detect
    pub language: Option<String>,
    pub initial_prompt: Option<String>,
    pub vad_filter: bool,
    pub word_timestamps: bool,
    pub diarization: DiarizationOptions,
}

impl Default for TranscriptionOptions {
    fn default() -> Self {
        Self {
            task: Task::Transcribe,
            language: None,
            initial_prompt: None,
            vad_filter: false,
            word_timestamps: false,
            diarization: DiarizationOptions::default(),
        }
    }
}

/// Result of a language-detection pass. Ephemeral: returned to the caller,
/// never stored. Confidence is engine-reported, in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    pub language_code: String,
    pub confidence: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_round_trips() {
        assert_eq!("transcribe".parse::<Task>().unwrap(), Task::Transcribe);
        assert_eq!("translate".parse::<Task>().unwrap(), Task::Translate);
        assert!("summarize".parse::<Task>().is_err());
    }

    #[test]
    fn segment_serializes_without_empty_options() {
        let seg = Segment::new(0.0, 1.5, "hello");
        let json = serde_json::to_value(&seg).unwrap();
        assert!(json.get("words").is_none());
        assert!(json.get("speaker").is_none());
        assert_eq!(json["text"], "hello");
    }
}
