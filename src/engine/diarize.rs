//! # `whisper_diarize` Engine Variant
//!
//! The Whisper recognizer plus a speaker-attribution pass. Requires a
//! HuggingFace token to be configured (construction fails without one, so
//! the process refuses to start rather than surfacing the problem per
//! request).
//!
//! Attribution clusters per-segment acoustic features (RMS energy,
//! zero-crossing rate, band tilt) with a deterministic k-means bounded by
//! the requested speaker counts. The clustering needs every segment before
//! any label can be assigned, so this variant buffers internally and then
//! exposes the buffered result as a lazy sequence.

use crate::asr::types::{DetectionResult, Segment, TranscriptionOptions};
use crate::audio::DecodedAudio;
use crate::config::AsrConfig;
use crate::engine::model::{ModelHandle, ModelSize};
use crate::engine::whisper::plan_windows;
use crate::engine::{select_device, AsrEngine, EngineCapabilities, Transcription};
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};

static CAPABILITIES: EngineCapabilities = EngineCapabilities {
    name: "whisper_diarize",
    vad_filter: false,
    word_timestamps: false,
    diarization: true,
    concurrent_inference: false,
    detect_window_secs: 30.0,
};

pub struct DiarizingWhisperEngine {
    handle: ModelHandle,
}

impl DiarizingWhisperEngine {
    pub fn new(cfg: &AsrConfig) -> AppResult<Self> {
        let token = match &cfg.hf_token {
            Some(token) if !token.trim().is_empty() => token.clone(),
            _ => {
                return Err(AppError::Config(
                    "whisper_diarize requires asr.hf_token (or HF_TOKEN) to be configured"
                        .to_string(),
                ))
            }
        };
        let size: ModelSize = cfg
            .model
            .parse()
            .map_err(|e: anyhow::Error| AppError::Config(e.to_string()))?;
        Ok(Self {
            handle: ModelHandle::new(size, Some(token), select_device()),
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
impl AsrEngine for DiarizingWhisperEngine {
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
        // Prompt conditioning is not wired through the attribution pass;
        // reject rather than silently mis-apply.
        if options.initial_prompt.is_some() {
            return Err(AppError::UnsupportedOption("initial_prompt".to_string()));
        }

        let language = match &options.language {
            Some(code) => code.clone(),
            None => self.detect(&audio).await?.language_code,
        };

        let mut segments: Vec<Segment> = Vec::new();
        {
            let mut guard = self.handle.acquire().await;
            let model = guard
                .as_mut()
                .ok_or_else(|| AppError::Engine("model not loaded".to_string()))?;
            for (offset, samples) in plan_windows(&audio.samples, false) {
                let decoded = model
                    .transcribe_window(&samples, offset, options.task, &language, None)
                    .map_err(AppError::from)?;
                segments.extend(decoded);
            }
        }

        if options.diarization.enabled {
            assign_speakers(
                &mut segments,
                &audio,
                options.diarization.min_speakers,
                options.diarization.max_speakers,
            );
        }

        let stream = stream::iter(segments.into_iter().map(Ok)).boxed();
        Ok(Transcription {
            language,
            segments: stream,
        })
    }

    async fn detect_language(&self, audio: &DecodedAudio) -> AppResult<DetectionResult> {
        self.detect(audio).await
    }
}

/// Label each segment with a speaker via k-means over acoustic features.
/// Labels are `SPEAKER_00`, `SPEAKER_01`, ... in order of first appearance.
fn assign_speakers(
    segments: &mut [Segment],
    audio: &DecodedAudio,
    min_speakers: Option<u32>,
    max_speakers: Option<u32>,
) {
    if segments.is_empty() {
        return;
    }

    let features: Vec<[f32; 3]> = segments
        .iter()
        .map(|seg| segment_features(audio, seg))
        .collect();
    let features = normalize(features);

    let n = segments.len();
    let min_k = (min_speakers.unwrap_or(1).max(1) as usize).min(n);
    let max_k = (max_speakers.unwrap_or(2).max(min_k as u32) as usize).min(n);
    let (assignments, _) = cluster(&features, min_k, max_k);

    // Stable labels in order of first appearance
    let mut label_of_cluster: Vec<Option<usize>> = vec![None; max_k];
    let mut next_label = 0usize;
    for (segment, &cluster_idx) in segments.iter_mut().zip(&assignments) {
        let label = *label_of_cluster[cluster_idx].get_or_insert_with(|| {
            let l = next_label;
            next_label += 1;
            l
        });
        segment.speaker = Some(format!("SPEAKER_{:02}", label));
    }
}

/// Coarse per-segment voice features: RMS energy, zero-crossing rate and a
/// band-tilt proxy (first-difference energy over signal energy).
fn segment_features(audio: &DecodedAudio, segment: &Segment) -> [f32; 3] {
    let sr = audio.sample_rate as f64;
    let start = ((segment.start * sr) as usize).min(audio.samples.len());
    let end = ((segment.end * sr) as usize).clamp(start, audio.samples.len());
    let slice = &audio.samples[start..end];
    if slice.len() < 2 {
        return [0.0; 3];
    }

    let energy: f32 = slice.iter().map(|s| s * s).sum();
    let rms = (energy / slice.len() as f32).sqrt();

    let crossings = slice
        .windows(2)
        .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
        .count();
    let zcr = crossings as f32 / slice.len() as f32;

    let diff_energy: f32 = slice.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
    let mean_abs: f32 = slice.iter().map(|s| s.abs()).sum::<f32>() / slice.len() as f32;
    let tilt = diff_energy / slice.len() as f32 / (mean_abs + 1e-6);

    [rms, zcr, tilt]
}

/// Z-score normalization per feature dimension.
fn normalize(mut features: Vec<[f32; 3]>) -> Vec<[f32; 3]> {
    for dim in 0..3 {
        let n = features.len() as f32;
        let mean: f32 = features.iter().map(|f| f[dim]).sum::<f32>() / n;
        let var: f32 = features.iter().map(|f| (f[dim] - mean).powi(2)).sum::<f32>() / n;
        let std = var.sqrt().max(1e-6);
        for f in &mut features {
            f[dim] = (f[dim] - mean) / std;
        }
    }
    features
}

/// Deterministic k-means over the feature vectors, picking the cluster
/// count in `[min_k, max_k]` by diminishing within-cluster improvement.
fn cluster(features: &[[f32; 3]], min_k: usize, max_k: usize) -> (Vec<usize>, usize) {
    let mut best = kmeans(features, min_k);
    let mut best_k = min_k;
    for k in (min_k + 1)..=max_k {
        let candidate = kmeans(features, k);
        // accept an extra speaker only for a substantial fit improvement
        if candidate.1 < best.1 * 0.75 {
            best = candidate;
            best_k = k;
        } else {
            break;
        }
    }
    (best.0, best_k)
}

/// Plain k-means with deterministic spread initialization. Returns the
/// assignment vector and the within-cluster sum of squared distances.
fn kmeans(features: &[[f32; 3]], k: usize) -> (Vec<usize>, f32) {
    let n = features.len();
    let mut centroids: Vec<[f32; 3]> = (0..k).map(|i| features[i * n / k]).collect();
    let mut assignments = vec![0usize; n];

    for _ in 0..25 {
        let mut changed = false;
        for (i, f) in features.iter().enumerate() {
            let nearest = (0..k)
                .min_by(|&a, &b| dist2(f, &centroids[a]).total_cmp(&dist2(f, &centroids[b])))
                .unwrap_or(0);
            if assignments[i] != nearest {
                assignments[i] = nearest;
                changed = true;
            }
        }

        let mut sums = vec![[0.0f32; 3]; k];
        let mut counts = vec![0usize; k];
        for (f, &a) in features.iter().zip(&assignments) {
            for dim in 0..3 {
                sums[a][dim] += f[dim];
            }
            counts[a] += 1;
        }
        for c in 0..k {
            if counts[c] > 0 {
                for dim in 0..3 {
                    centroids[c][dim] = sums[c][dim] / counts[c] as f32;
                }
            }
        }

        if !changed {
            break;
        }
    }

    let wss = features
        .iter()
        .zip(&assignments)
        .map(|(f, &a)| dist2(f, &centroids[a]))
        .sum();
    (assignments, wss)
}

fn dist2(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    (0..3).map(|d| (a[d] - b[d]).powi(2)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SAMPLE_RATE;

    fn audio_with_two_voices() -> (DecodedAudio, Vec<Segment>) {
        // Alternating low-pitch loud and high-pitch quiet spans
        let sr = SAMPLE_RATE as usize;
        let mut samples = vec![0.0f32; sr * 8];
        for seg in 0..4 {
            let start = seg * 2 * sr;
            let (freq_step, amp) = if seg % 2 == 0 { (0.05, 0.6) } else { (0.9, 0.15) };
            for i in 0..(2 * sr) {
                samples[start + i] = amp * ((i as f32) * freq_step).sin();
            }
        }
        let audio = DecodedAudio {
            samples,
            sample_rate: SAMPLE_RATE,
        };
        let segments = (0..4)
            .map(|i| Segment::new(i as f64 * 2.0, i as f64 * 2.0 + 2.0, format!("utterance {}", i)))
            .collect();
        (audio, segments)
    }

    #[test]
    fn alternating_voices_get_two_speakers() {
        let (audio, mut segments) = audio_with_two_voices();
        assign_speakers(&mut segments, &audio, Some(2), Some(2));

        let labels: Vec<_> = segments.iter().map(|s| s.speaker.clone().unwrap()).collect();
        assert_eq!(labels[0], "SPEAKER_00"); // first appearance gets label 00
        assert_eq!(labels[0], labels[2]);
        assert_eq!(labels[1], labels[3]);
        assert_ne!(labels[0], labels[1]);
    }

    #[test]
    fn single_segment_is_single_speaker() {
        let audio = DecodedAudio {
            samples: vec![0.3; SAMPLE_RATE as usize],
            sample_rate: SAMPLE_RATE,
        };
        let mut segments = vec![Segment::new(0.0, 1.0, "hello")];
        assign_speakers(&mut segments, &audio, None, None);
        assert_eq!(segments[0].speaker.as_deref(), Some("SPEAKER_00"));
    }

    #[tokio::test]
    async fn initial_prompt_is_rejected_before_any_inference() {
        let cfg = AsrConfig {
            engine: "whisper_diarize".to_string(),
            model: "base".to_string(),
            hf_token: Some("hf_dummy".to_string()),
            ffmpeg_path: "ffmpeg".to_string(),
        };
        let engine = DiarizingWhisperEngine::new(&cfg).unwrap();
        let audio = DecodedAudio {
            samples: vec![0.0; SAMPLE_RATE as usize],
            sample_rate: SAMPLE_RATE,
        };
        let options = TranscriptionOptions {
            initial_prompt: Some("meeting context".to_string()),
            ..Default::default()
        };
        // rejected up front, before the model would even be touched
        let err = engine.transcribe(audio, options).await.unwrap_err();
        assert!(matches!(err, AppError::UnsupportedOption(_)));
    }

    #[test]
    fn speaker_bounds_cap_the_cluster_count() {
        let (audio, mut segments) = audio_with_two_voices();
        assign_speakers(&mut segments, &audio, Some(1), Some(1));
        let labels: Vec<_> = segments.iter().map(|s| s.speaker.clone().unwrap()).collect();
        assert!(labels.iter().all(|l| l == "SPEAKER_00"));
    }
}
