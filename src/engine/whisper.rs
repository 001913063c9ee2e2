//! # `whisper` Engine Variant
//!
//! Candle-based Whisper recognizer. Declares voice-activity filtering and
//! word timestamps; no diarization. Inference mutates decoder caches, so
//! access is serialized behind the model mutex
//! (`concurrent_inference: false`).

use crate::asr::types::{DetectionResult, Segment, TranscriptionOptions, Word};
use crate::audio::{DecodedAudio, SAMPLE_RATE};
use crate::config::AsrConfig;
use crate::engine::model::{ModelHandle, ModelSize, WINDOW_SECS};
use crate::engine::vad::{self, SpeechSpan};
use crate::engine::{select_device, AsrEngine, EngineCapabilities, Transcription};
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::VecDeque;

static CAPABILITIES: EngineCapabilities = EngineCapabilities {
    name: "whisper",
    vad_filter: true,
    word_timestamps: true,
    diarization: false,
    concurrent_inference: false,
    detect_window_secs: 30.0,
};

pub struct CandleWhisperEngine {
    handle: ModelHandle,
}

impl CandleWhisperEngine {
    pub fn new(cfg: &AsrConfig) -> AppResult<Self> {
        let size: ModelSize = cfg
            .model
            .parse()
            .map_err(|e: anyhow::Error| AppError::Config(e.to_string()))?;
        Ok(Self {
            handle: ModelHandle::new(size, cfg.hf_token.clone(), select_device()),
        })
    }

    async fn detect(&self, audio: &DecodedAudio) -> AppResult<DetectionResult> {
        let window = audio.leading_window(CAPABILITIES.detect_window_secs);
        let mut guard = self.handle.acquire().await;
        let model = guard
            .as_mut()
            .ok_or_else(|| AppError::Engine("model not loaded".to_string()))?;
        model.detect_language(&window).map_err(AppError::from)
    }
}

#[async_trait]
impl AsrEngine for CandleWhisperEngine {
    fn capabilities(&self) -> &EngineCapabilities {
        &CAPABILITIES
    }

    async fn load_model(&self) -> AppResult<()> {
        self.handle.load().await.map_err(AppError::from)
    }

    async fn transcribe(
        &self,
        audio: DecodedAudio,
        options: TranscriptionOptions,
    ) -> AppResult<Transcription> {
        // Resolve the language up front (hint or a detection pass on the
        // leading window) so the formatter can report it immediately.
        let language = match &options.language {
            Some(code) => code.clone(),
            None => self.detect(&audio).await?.language_code,
        };

        let windows: VecDeque<(f64, Vec<f32>)> =
            plan_windows(&audio.samples, options.vad_filter).into();
        tracing::debug!(
            windows = windows.len(),
            vad = options.vad_filter,
            language = %language,
            "Planned transcription"
        );

        let state = DecodeState {
            handle: self.handle.clone(),
            windows,
            pending: VecDeque::new(),
            options: options.clone(),
            language: language.clone(),
        };

        // Pull-based: each window is decoded only when the consumer asks
        // for a segment none of the prior windows produced. Dropping the
        // stream (client disconnect) abandons the remaining windows.
        let segments = stream::try_unfold(state, |mut st| async move {
            loop {
                if let Some(segment) = st.pending.pop_front() {
                    return Ok(Some((segment, st)));
                }
                let Some((offset, samples)) = st.windows.pop_front() else {
                    return Ok(None);
                };

                let mut guard = st.handle.acquire().await;
                let model = guard
                    .as_mut()
                    .ok_or_else(|| AppError::Engine("model not loaded".to_string()))?;
                let mut segments = model
                    .transcribe_window(
                        &samples,
                        offset,
                        st.options.task,
                        &st.language,
                        st.options.initial_prompt.as_deref(),
                    )
                    .map_err(AppError::from)?;
                drop(guard);

                if st.options.word_timestamps {
                    for segment in &mut segments {
                        segment.words = Some(allocate_word_timings(segment));
                    }
                }
                st.pending.extend(segments);
            }
        })
        .boxed();

        Ok(Transcription { language, segments })
    }

    async fn detect_language(&self, audio: &DecodedAudio) -> AppResult<DetectionResult> {
        self.detect(audio).await
    }
}

struct DecodeState {
    handle: ModelHandle,
    windows: VecDeque<(f64, Vec<f32>)>,
    pending: VecDeque<Segment>,
    options: TranscriptionOptions,
    language: String,
}

/// Slice audio into decoding windows of at most [`WINDOW_SECS`], keyed by
/// their offset in the source timeline. With VAD enabled only speech spans
/// are windowed, so silent regions are never decoded.
pub(crate) fn plan_windows(samples: &[f32], vad_filter: bool) -> Vec<(f64, Vec<f32>)> {
    let window_len = (WINDOW_SECS * SAMPLE_RATE as f64) as usize;
    let spans = if vad_filter {
        vad::speech_spans(samples)
    } else if samples.is_empty() {
        Vec::new()
    } else {
        vec![SpeechSpan {
            start: 0,
            end: samples.len(),
        }]
    };

    let mut windows = Vec::new();
    for span in spans {
        let mut pos = span.start;
        while pos < span.end {
            let end = (pos + window_len).min(span.end);
            windows.push((
                pos as f64 / SAMPLE_RATE as f64,
                samples[pos..end].to_vec(),
            ));
            pos = end;
        }
    }
    windows
}

/// Distribute a segment's time span across its words proportionally to
/// character length. An approximation of true alignment (attention-based
/// DTW would be exact); keeps words ordered and inside the segment bounds.
pub(crate) fn allocate_word_timings(segment: &Segment) -> Vec<Word> {
    let words: Vec<&str> = segment.text.split_whitespace().collect();
    if words.is_empty() {
        return Vec::new();
    }

    let span = (segment.end - segment.start).max(0.0);
    let total_chars: usize = words.iter().map(|w| w.chars().count() + 1).sum();
    let mut cursor = segment.start;
    let mut out = Vec::with_capacity(words.len());
    for word in words {
        let weight = (word.chars().count() + 1) as f64 / total_chars as f64;
        let end = (cursor + span * weight).min(segment.end);
        out.push(Word {
            word: word.to_string(),
            start: cursor,
            end,
        });
        cursor = end;
    }
    // Close any rounding slack on the final word
    if let Some(last) = out.last_mut() {
        last.end = segment.end;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_cover_audio_in_order() {
        let samples = vec![0.1f32; (WINDOW_SECS as usize * SAMPLE_RATE as usize) * 2 + 16_000];
        let windows = plan_windows(&samples, false);
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].0, 0.0);
        assert_eq!(windows[1].0, WINDOW_SECS);
        assert_eq!(windows[2].0, WINDOW_SECS * 2.0);
        assert_eq!(windows[2].1.len(), 16_000);
        let covered: usize = windows.iter().map(|(_, w)| w.len()).sum();
        assert_eq!(covered, samples.len());
    }

    #[test]
    fn vad_windows_skip_silence() {
        let mut samples = vec![0.0f32; 96_000];
        for (i, s) in samples[32_000..64_000].iter_mut().enumerate() {
            *s = 0.5 * (i as f32 * 0.3).sin();
        }
        let windows = plan_windows(&samples, true);
        assert_eq!(windows.len(), 1);
        // offset reflects the source timeline, not the filtered one
        assert!((windows[0].0 - 2.0).abs() < 0.1);
    }

    #[test]
    fn empty_audio_plans_nothing() {
        assert!(plan_windows(&[], false).is_empty());
        assert!(plan_windows(&[], true).is_empty());
    }

    #[test]
    fn word_timings_partition_the_segment() {
        let segment = Segment::new(10.0, 12.0, "hello brave new world");
        let words = allocate_word_timings(&segment);
        assert_eq!(words.len(), 4);
        assert_eq!(words[0].start, 10.0);
        assert_eq!(words.last().unwrap().end, 12.0);
        for pair in words.windows(2) {
            assert!(pair[0].end <= pair[1].start + 1e-9);
            assert!(pair[0].start <= pair[0].end);
        }
        // longer words get more time
        let hello = &words[0];
        let new = &words[2];
        assert!((hello.end - hello.start) > (new.end - new.start));
    }

    #[test]
    fn word_timings_of_empty_text() {
        let segment = Segment::new(0.0, 1.0, "   ");
        assert!(allocate_word_timings(&segment).is_empty());
    }
}
