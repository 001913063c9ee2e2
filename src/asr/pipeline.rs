//! # Transcription Pipeline
//!
//! Thin orchestration between the request surface and the engine: validate
//! the requested options against the engine's declared capabilities, then
//! dispatch exactly once. Validation failures never reach the engine, so a
//! request for an unsupported option costs no inference time.

use crate::asr::types::{DetectionResult, TranscriptionOptions};
use crate::audio::DecodedAudio;
use crate::engine::{AsrEngine, EngineCapabilities, Transcription};
use crate::error::{AppError, AppResult};
use crate::lang;

/// Detected language with its display name resolved from the language table.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DetectedLanguage {
    pub detected_language: String,
    pub language_code: String,
    pub confidence: f32,
}

/// Check the requested options against what the engine declares it honors.
///
/// Runs before any audio is decoded or inference scheduled; each rejected
/// option names itself in the error message.
pub fn validate_options(
    options: &TranscriptionOptions,
    capabilities: &EngineCapabilities,
) -> AppResult<()> {
    if options.diarization.enabled && !capabilities.diarization {
        return Err(AppError::InvalidRequest(format!(
            "engine '{}' does not support diarization",
            capabilities.name
        )));
    }
    if options.vad_filter && !capabilities.vad_filter {
        return Err(AppError::InvalidRequest(format!(
            "engine '{}' does not support vad_filter",
            capabilities.name
        )));
    }
    if options.word_timestamps && !capabilities.word_timestamps {
        return Err(AppError::InvalidRequest(format!(
            "engine '{}' does not support word_timestamps",
            capabilities.name
        )));
    }
    if let (Some(min), Some(max)) = (
        options.diarization.min_speakers,
        options.diarization.max_speakers,
    ) {
        if min > max {
            return Err(AppError::InvalidRequest(format!(
                "min_speakers ({}) exceeds max_speakers ({})",
                min, max
            )));
        }
    }
    Ok(())
}

/// Run a transcription: validate, then hand the audio to the engine.
///
/// No retry, no queueing. Any engine error propagates to the caller as-is.
pub async fn run(
    engine: &dyn AsrEngine,
    audio: DecodedAudio,
    options: TranscriptionOptions,
) -> AppResult<Transcription> {
    validate_options(&options, engine.capabilities())?;
    tracing::info!(
        engine = engine.capabilities().name,
        duration_secs = audio.duration_secs(),
        task = options.task.as_str(),
        "Starting transcription"
    );
    engine.transcribe(audio, options).await
}

/// Classify the spoken language and resolve its display name.
///
/// An engine returning a code absent from the language table is a server
/// fault, not a client one.
pub async fn detect(engine: &dyn AsrEngine, audio: DecodedAudio) -> AppResult<DetectedLanguage> {
    let DetectionResult {
        language_code,
        confidence,
    } = engine.detect_language(&audio).await?;

    let name = lang::language_name(&language_code).ok_or_else(|| {
        AppError::UnknownLanguage(format!(
            "engine returned unrecognized language code '{}'",
            language_code
        ))
    })?;

    Ok(DetectedLanguage {
        detected_language: name.to_string(),
        language_code,
        confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asr::types::{DiarizationOptions, Segment};
    use crate::audio::SAMPLE_RATE;
    use crate::engine::SegmentStream;
    use async_trait::async_trait;
    use futures_util::stream::{self, StreamExt};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubEngine {
        capabilities: EngineCapabilities,
        calls: AtomicUsize,
        detect_code: &'static str,
    }

    impl StubEngine {
        fn new(capabilities: EngineCapabilities) -> Self {
            Self {
                capabilities,
                calls: AtomicUsize::new(0),
                detect_code: "en",
            }
        }

        fn plain() -> Self {
            Self::new(EngineCapabilities {
                name: "stub",
                vad_filter: false,
                word_timestamps: false,
                diarization: false,
                concurrent_inference: true,
                detect_window_secs: 30.0,
            })
        }
    }

    #[async_trait]
    impl AsrEngine for StubEngine {
        fn capabilities(&self) -> &EngineCapabilities {
            &self.capabilities
        }

        async fn load_model(&self) -> AppResult<()> {
            Ok(())
        }

        async fn transcribe(
            &self,
            _audio: DecodedAudio,
            _options: TranscriptionOptions,
        ) -> AppResult<Transcription> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let segments: SegmentStream =
                stream::iter(vec![Ok(Segment::new(0.0, 1.0, "stub"))]).boxed();
            Ok(Transcription {
                language: "en".to_string(),
                segments,
            })
        }

        async fn detect_language(&self, _audio: &DecodedAudio) -> AppResult<DetectionResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(DetectionResult {
                language_code: self.detect_code.to_string(),
                confidence: 0.87,
            })
        }
    }

    fn silence() -> DecodedAudio {
        DecodedAudio {
            samples: vec![0.0; SAMPLE_RATE as usize],
            sample_rate: SAMPLE_RATE,
        }
    }

    #[tokio::test]
    async fn unsupported_diarize_never_reaches_the_engine() {
        let engine = StubEngine::plain();
        let options = TranscriptionOptions {
            diarization: DiarizationOptions {
                enabled: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = run(&engine, silence(), options).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidRequest(_)));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unsupported_vad_and_word_timestamps_are_rejected() {
        let engine = StubEngine::plain();
        for options in [
            TranscriptionOptions {
                vad_filter: true,
                ..Default::default()
            },
            TranscriptionOptions {
                word_timestamps: true,
                ..Default::default()
            },
        ] {
            let err = run(&engine, silence(), options).await.unwrap_err();
            assert!(matches!(err, AppError::InvalidRequest(_)));
        }
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn inverted_speaker_bounds_are_rejected_even_with_diarization() {
        let mut caps = *StubEngine::plain().capabilities();
        caps.diarization = true;
        let engine = StubEngine::new(caps);
        let options = TranscriptionOptions {
            diarization: DiarizationOptions {
                enabled: true,
                min_speakers: Some(5),
                max_speakers: Some(2),
            },
            ..Default::default()
        };
        let err = run(&engine, silence(), options).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidRequest(_)));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn supported_options_dispatch_once() {
        let engine = StubEngine::plain();
        let transcription = run(&engine, silence(), TranscriptionOptions::default())
            .await
            .unwrap();
        assert_eq!(transcription.language, "en");
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn detection_resolves_the_display_name() {
        let engine = StubEngine::plain();
        let detected = detect(&engine, silence()).await.unwrap();
        assert_eq!(detected.detected_language, "english");
        assert_eq!(detected.language_code, "en");
        assert!((detected.confidence - 0.87).abs() < 1e-6);
    }

    #[tokio::test]
    async fn unknown_detection_code_is_a_server_error() {
        let mut engine = StubEngine::plain();
        engine.detect_code = "zz";
        let err = detect(&engine, silence()).await.unwrap_err();
        assert!(matches!(err, AppError::UnknownLanguage(_)));
    }
}
