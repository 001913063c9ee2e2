//! # Engine Abstraction
//!
//! Capability interface over the concrete recognition engines plus the
//! factory that selects exactly one variant from configuration at process
//! start. The constructed engine is a process-wide, long-lived resource:
//! it is created once, `load_model()` runs once before any request is
//! served, and there is no hot-swap path.
//!
//! ## Variants:
//! - **whisper**: candle-based Whisper; voice-activity filtering and word
//!   timestamps, no diarization
//! - **whisper_diarize**: same recognizer plus a speaker-attribution pass;
//!   requires a HuggingFace token to be configured

pub mod diarize;
pub mod model;
pub mod vad;
pub mod whisper;

use crate::asr::types::{DetectionResult, Segment, TranscriptionOptions};
use crate::audio::DecodedAudio;
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use candle_core::Device;
use futures_util::stream::BoxStream;
use std::sync::Arc;

/// Lazy, pull-based segment sequence. The consumer drives pace: the engine
/// is only asked for the next window of work when the stream is polled, so
/// a slow or disconnected client never makes the producer run ahead.
pub type SegmentStream = BoxStream<'static, Result<Segment, AppError>>;

/// Output of a transcription call: the language that will be used (hint or
/// engine-detected) plus the lazily produced segments.
pub struct Transcription {
    pub language: String,
    pub segments: SegmentStream,
}

impl std::fmt::Debug for Transcription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transcription")
            .field("language", &self.language)
            .field("segments", &"<stream>")
            .finish()
    }
}

/// Static declaration of which request options an engine variant honors.
///
/// Checked by the pipeline before dispatch; engine-specific tunables that
/// the core must not hard-code (detection window, concurrency policy) are
/// surfaced here as well.
#[derive(Debug, Clone, Copy)]
pub struct EngineCapabilities {
    /// Selector name, also reported in the `Asr-Engine` response header
    pub name: &'static str,
    pub vad_filter: bool,
    pub word_timestamps: bool,
    pub diarization: bool,
    /// Whether the variant tolerates concurrent inference calls; when false
    /// the engine serializes access internally
    pub concurrent_inference: bool,
    /// Leading-audio window used for language detection, in seconds
    pub detect_window_secs: f32,
}

/// Capability interface implemented by every engine variant.
///
/// Variants must ignore or explicitly reject options they do not honor
/// (rejection is `AppError::UnsupportedOption` naming the option) rather
/// than silently mis-applying them.
#[async_trait]
pub trait AsrEngine: Send + Sync {
    fn capabilities(&self) -> &EngineCapabilities;

    /// One-time, potentially slow model initialization. Idempotent; invoked
    /// exactly once at process start before any request is served.
    async fn load_model(&self) -> AppResult<()>;

    /// Produce segments for the decoded audio as a lazy sequence.
    async fn transcribe(
        &self,
        audio: DecodedAudio,
        options: TranscriptionOptions,
    ) -> AppResult<Transcription>;

    /// Single-shot language classification over a bounded leading window.
    async fn detect_language(&self, audio: &DecodedAudio) -> AppResult<DetectionResult>;
}

impl std::fmt::Debug for dyn AsrEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsrEngine")
            .field("name", &self.capabilities().name)
            .finish()
    }
}

/// Construct the engine variant named by the configuration selector.
///
/// Fails fast with a configuration error for an unknown selector or a
/// missing required credential; callers treat this as startup-fatal.
pub fn create_engine(config: &AppConfig) -> AppResult<Arc<dyn AsrEngine>> {
    match config.asr.engine.as_str() {
        "whisper" => Ok(Arc::new(whisper::CandleWhisperEngine::new(&config.asr)?)),
        "whisper_diarize" => Ok(Arc::new(diarize::DiarizingWhisperEngine::new(&config.asr)?)),
        other => Err(AppError::Config(format!(
            "unsupported ASR engine: {}",
            other
        ))),
    }
}

/// Pick the inference device, preferring CUDA when compiled in.
pub(crate) fn select_device() -> Device {
    match Device::cuda_if_available(0) {
        Ok(device) => device,
        Err(e) => {
            tracing::warn!("CUDA unavailable ({}), falling back to CPU", e);
            Device::Cpu
        }
    }
}
