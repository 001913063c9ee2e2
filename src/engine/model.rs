//! # Whisper Model Management
//!
//! Loading and inference for Whisper models via Candle-rs, pure Rust with no
//! FFI to whisper.cpp.
//!
//! ## Model Loading Process:
//! 1. Download model files from HuggingFace if not cached locally
//! 2. Load model weights, config and tokenizer
//! 3. Initialize model on the selected device (CPU/GPU)
//!
//! ## Decoding:
//! Audio is processed in 30-second windows. Decoding is greedy with a
//! repetition guard; timestamp tokens (0.02 s granularity) delimit the
//! emitted segments.

use crate::asr::types::{DetectionResult, Segment, Task};
use crate::lang;
use anyhow::{anyhow, Result};
use candle_core::{Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, audio, Config};
use std::sync::Arc;
use tokenizers::Tokenizer;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Seconds of audio per decoding window.
pub const WINDOW_SECS: f64 = m::CHUNK_LENGTH as f64;

/// Granularity of Whisper timestamp tokens, in seconds.
const TIMESTAMP_STEP: f64 = 0.02;

/// Available Whisper model sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelSize {
    /// HuggingFace model repository for this size.
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "openai/whisper-tiny",
            ModelSize::Base => "openai/whisper-base",
            ModelSize::Small => "openai/whisper-small",
            ModelSize::Medium => "openai/whisper-medium",
            ModelSize::Large => "openai/whisper-large-v2",
        }
    }
}

impl std::str::FromStr for ModelSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large" => Ok(ModelSize::Large),
            _ => Err(anyhow!("Unknown model size: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
        };
        write!(f, "{}", name)
    }
}

/// A loaded Whisper model ready for inference.
///
/// Inference mutates decoder state (KV caches), so access goes through a
/// mutex held by [`ModelHandle`]; the engine variants declare
/// `concurrent_inference: false` accordingly.
pub struct WhisperModel {
    model: m::model::Whisper,
    config: Config,
    device: Device,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    size: ModelSize,

    // Special-token ids, resolved from the tokenizer at load time
    sot_token: u32,
    eot_token: u32,
    transcribe_token: u32,
    translate_token: u32,
    sot_prev_token: u32,
    timestamp_begin: u32,
}

impl WhisperModel {
    /// Download (or reuse cached) model files and initialize the weights.
    pub async fn load(size: ModelSize, device: Device, hf_token: Option<String>) -> Result<Self> {
        tracing::info!("Loading Whisper {} model...", size);
        let start_time = std::time::Instant::now();

        let api = {
            use hf_hub::api::tokio::ApiBuilder;
            let mut builder = ApiBuilder::new().with_progress(false);
            builder = builder.with_token(hf_token);
            if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
                builder = builder.with_cache_dir(cache_dir.into());
            }
            builder.build()?
        };

        let repo = api.model(size.repo_name().to_string());
        let config_filename = repo
            .get("config.json")
            .await
            .map_err(|e| anyhow!("Failed to download config.json from {}: {}", size.repo_name(), e))?;
        let tokenizer_filename = repo
            .get("tokenizer.json")
            .await
            .map_err(|e| anyhow!("Failed to download tokenizer.json from {}: {}", size.repo_name(), e))?;
        let model_filename = repo
            .get("model.safetensors")
            .await
            .map_err(|e| anyhow!("Failed to download model weights from {}: {}", size.repo_name(), e))?;

        let config: Config = serde_json::from_reader(std::fs::File::open(config_filename)?)?;
        let tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

        let mel_filters = mel_filter_bank(m::N_FFT / 2 + 1, config.num_mel_bins, m::SAMPLE_RATE as f32);

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[model_filename], m::DTYPE, &device)? };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        let special = |name: &str| {
            tokenizer
                .token_to_id(name)
                .ok_or_else(|| anyhow!("tokenizer is missing special token {}", name))
        };
        let sot_token = special("<|startoftranscript|>")?;
        let eot_token = special("<|endoftext|>")?;
        let transcribe_token = special("<|transcribe|>")?;
        let translate_token = special("<|translate|>")?;
        let sot_prev_token = special("<|startofprev|>")?;
        // Timestamp ids follow <|notimestamps|> contiguously; resolving the
        // base this way also covers tokenizers that don't list them as
        // added tokens.
        let timestamp_begin = special("<|notimestamps|>")? + 1;

        let load_time = start_time.elapsed();
        tracing::info!("Whisper {} model loaded in {:.2}s", size, load_time.as_secs_f64());

        Ok(Self {
            model,
            config,
            device,
            tokenizer,
            mel_filters,
            size,
            sot_token,
            eot_token,
            transcribe_token,
            translate_token,
            sot_prev_token,
            timestamp_begin,
        })
    }

    /// Transcribe one window of audio, returning timed segments with the
    /// window offset already applied.
    pub fn transcribe_window(
        &mut self,
        samples: &[f32],
        offset_secs: f64,
        task: Task,
        language: &str,
        initial_prompt: Option<&str>,
    ) -> Result<Vec<Segment>> {
        if samples.is_empty() {
            return Ok(Vec::new());
        }

        let start_time = std::time::Instant::now();
        let window_secs = samples.len() as f64 / m::SAMPLE_RATE as f64;
        let encoder_output = self.encode_window(samples)?;

        // Decoder prefix: optional previous-context prompt, then SOT,
        // language and task tokens. No <|notimestamps|> token, so the model
        // emits timestamp tokens we can segment on.
        let mut prefix = Vec::new();
        if let Some(prompt) = initial_prompt {
            let encoded = self
                .tokenizer
                .encode(prompt, false)
                .map_err(|e| anyhow!("failed to tokenize initial prompt: {}", e))?;
            let ids = encoded.get_ids();
            let keep = ids.len().min(self.config.max_target_positions / 2 - 1);
            prefix.push(self.sot_prev_token);
            prefix.extend_from_slice(&ids[ids.len() - keep..]);
        }
        prefix.push(self.sot_token);
        if let Some(lang_token) = self.language_token(language) {
            prefix.push(lang_token);
        }
        prefix.push(match task {
            Task::Transcribe => self.transcribe_token,
            Task::Translate => self.translate_token,
        });

        // The prompt prefix occupies decoder context; decoding past the
        // remaining positions would overflow the model's position range.
        let max_new_tokens = decode_budget(self.config.max_target_positions, prefix.len());
        let mut tokens = prefix;
        let mut output_tokens: Vec<u32> = Vec::new();

        for _ in 0..max_new_tokens {
            let next_token = self.decode_step(&tokens, &encoder_output)?;

            if next_token == self.eot_token {
                break;
            }
            if is_repetitive(&output_tokens, next_token) {
                // degenerate loop; keep what the window produced so far
                tracing::debug!(
                    "Repetition guard stopped decoding after {} tokens",
                    output_tokens.len()
                );
                break;
            }

            tokens.push(next_token);
            output_tokens.push(next_token);
        }

        let segments = self.segments_from_tokens(&output_tokens, offset_secs, window_secs)?;
        tracing::debug!(
            "Decoded {:.2}s window at +{:.2}s into {} segments in {:.2}s",
            window_secs,
            offset_secs,
            segments.len(),
            start_time.elapsed().as_secs_f64()
        );
        Ok(segments)
    }

    /// Identify the spoken language from a window of audio.
    ///
    /// One decoder step after SOT; the confidence is the softmax probability
    /// of the winning language token, reported unmodified.
    pub fn detect_language(&mut self, samples: &[f32]) -> Result<DetectionResult> {
        if samples.is_empty() {
            return Err(anyhow!("no audio to detect language from"));
        }

        let encoder_output = self.encode_window(samples)?;
        let logits = self.step_logits(&[self.sot_token], &encoder_output)?;

        let ids = lang::LANGUAGES
            .iter()
            .filter_map(|&(code, _)| self.language_token(code).map(|id| (code, id)));
        let candidates = language_candidates(&logits, ids);

        let (language_code, confidence) = pick_language(&candidates)
            .ok_or_else(|| anyhow!("tokenizer exposes no language tokens"))?;

        Ok(DetectionResult {
            language_code: language_code.to_string(),
            confidence,
        })
    }

    /// Run the mel front end and the encoder over one padded window.
    fn encode_window(&mut self, samples: &[f32]) -> Result<Tensor> {
        let mel = audio::pcm_to_mel(&self.config, samples, &self.mel_filters);
        let mel_len = mel.len();
        let n_mels = self.config.num_mel_bins;
        let mel = Tensor::from_vec(mel, (1, n_mels, mel_len / n_mels), &self.device)?;
        Ok(self.model.encoder.forward(&mel, true)?)
    }

    /// One greedy decoder step over the full token prefix.
    fn decode_step(&mut self, tokens: &[u32], encoder_output: &Tensor) -> Result<u32> {
        let logits = self.step_logits(tokens, encoder_output)?;
        let mut best = (0usize, f32::NEG_INFINITY);
        for (i, &l) in logits.iter().enumerate() {
            if l > best.1 {
                best = (i, l);
            }
        }
        Ok(best.0 as u32)
    }

    /// Raw vocabulary logits for the position after `tokens`.
    ///
    /// The KV cache is flushed on every call because the full prefix is
    /// re-fed each step; slower than incremental decoding but stateless
    /// between requests.
    fn step_logits(&mut self, tokens: &[u32], encoder_output: &Tensor) -> Result<Vec<f32>> {
        let tokens_t = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        let hidden = self.model.decoder.forward(&tokens_t, encoder_output, true)?;
        let (_, seq_len, _) = hidden.dims3()?;
        let last = hidden.i((.., seq_len - 1.., ..))?;
        let logits = self.model.decoder.final_linear(&last)?.i(0)?.i(0)?;
        Ok(logits.to_vec1::<f32>()?)
    }

    fn language_token(&self, code: &str) -> Option<u32> {
        self.tokenizer.token_to_id(&format!("<|{}|>", code))
    }

    /// Split a decoded token run on timestamp tokens into timed segments.
    ///
    /// Text between a pair of timestamp tokens becomes one segment; text
    /// with no opening timestamp starts at the window boundary, and an
    /// unterminated trailing segment ends at the window boundary.
    fn segments_from_tokens(
        &self,
        tokens: &[u32],
        offset_secs: f64,
        window_secs: f64,
    ) -> Result<Vec<Segment>> {
        let mut segments = Vec::new();
        let mut current_start = offset_secs;
        let mut text_tokens: Vec<u32> = Vec::new();

        let mut flush = |start: f64, end: f64, text_tokens: &mut Vec<u32>, segments: &mut Vec<Segment>| -> Result<()> {
            if !text_tokens.is_empty() {
                let text = self.decode_text(text_tokens)?;
                if !text.is_empty() {
                    segments.push(Segment::new(start, end.max(start), text));
                }
                text_tokens.clear();
            }
            Ok(())
        };

        for &token in tokens {
            if token >= self.timestamp_begin {
                let time = offset_secs + (token - self.timestamp_begin) as f64 * TIMESTAMP_STEP;
                if text_tokens.is_empty() {
                    // Opening timestamp of the next segment
                    current_start = time;
                } else {
                    flush(current_start, time, &mut text_tokens, &mut segments)?;
                    current_start = time;
                }
            } else {
                text_tokens.push(token);
            }
        }
        // Trailing segment the model never closed
        flush(
            current_start,
            offset_secs + window_secs,
            &mut text_tokens,
            &mut segments,
        )?;

        Ok(segments)
    }

    /// Decode text tokens, dropping timestamp ids and special markers.
    fn decode_text(&self, tokens: &[u32]) -> Result<String> {
        let plain: Vec<u32> = tokens
            .iter()
            .copied()
            .filter(|&t| t < self.timestamp_begin)
            .collect();
        let text = self
            .tokenizer
            .decode(&plain, true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;
        Ok(text.trim().to_string())
    }
}

/// Decoder positions left after the prefix; zero when the prefix alone
/// fills (or overfills) the context.
fn decode_budget(max_positions: usize, prefix_len: usize) -> usize {
    max_positions.saturating_sub(prefix_len)
}

/// Pair each language code with its logit. Ids outside the logit vector
/// are skipped: a tokenizer/model vocabulary mismatch must surface as a
/// detection error, not an index panic.
fn language_candidates(
    logits: &[f32],
    tokens: impl IntoIterator<Item = (&'static str, u32)>,
) -> Vec<(&'static str, f32)> {
    tokens
        .into_iter()
        .filter_map(|(code, id)| logits.get(id as usize).map(|&logit| (code, logit)))
        .collect()
}

/// Softmax over the candidate logits, returning the winning code and its
/// probability. `None` for an empty candidate set.
fn pick_language(candidates: &[(&'static str, f32)]) -> Option<(&'static str, f32)> {
    let max_logit = candidates
        .iter()
        .map(|(_, l)| *l)
        .fold(f32::NEG_INFINITY, f32::max);
    let denom: f32 = candidates.iter().map(|(_, l)| (l - max_logit).exp()).sum();
    let (code, logit) = candidates
        .iter()
        .copied()
        .max_by(|a, b| a.1.total_cmp(&b.1))?;
    Some((code, (logit - max_logit).exp() / denom))
}

/// Triangular mel filter bank over `n_freqs` FFT bins (HTK mel scale),
/// laid out as `n_mels` rows of `n_freqs` columns as the mel front end
/// expects.
fn mel_filter_bank(n_freqs: usize, n_mels: usize, sample_rate: f32) -> Vec<f32> {
    let f_max = sample_rate / 2.0;
    let to_mel = |f: f32| 2595.0 * (1.0 + f / 700.0).log10();
    let from_mel = |mel: f32| 700.0 * (10f32.powf(mel / 2595.0) - 1.0);

    let mel_max = to_mel(f_max);
    let edges: Vec<f32> = (0..n_mels + 2)
        .map(|i| from_mel(mel_max * i as f32 / (n_mels + 1) as f32))
        .collect();

    let mut filters = vec![0.0f32; n_mels * n_freqs];
    for mel_bin in 0..n_mels {
        let (lo, mid, hi) = (edges[mel_bin], edges[mel_bin + 1], edges[mel_bin + 2]);
        for freq_bin in 0..n_freqs {
            let f = freq_bin as f32 * f_max / (n_freqs - 1) as f32;
            let weight = if f <= lo || f >= hi {
                0.0
            } else if f <= mid {
                (f - lo) / (mid - lo)
            } else {
                (hi - f) / (hi - mid)
            };
            filters[mel_bin * n_freqs + freq_bin] = weight.max(0.0);
        }
    }
    filters
}

/// Repetition guard for the greedy decode loop: immediate triple repeats or
/// a repeated trailing trigram abort the current temperature pass.
fn is_repetitive(tokens: &[u32], new_token: u32) -> bool {
    if tokens.len() >= 2 {
        let n = tokens.len();
        if tokens[n - 1] == new_token && tokens[n - 2] == new_token {
            return true;
        }
    }
    if tokens.len() >= 6 {
        let last_3 = &tokens[tokens.len() - 3..];
        let prev_3 = &tokens[tokens.len() - 6..tokens.len() - 3];
        if last_3 == prev_3 {
            return true;
        }
    }
    false
}

/// Shared, lazily loaded model slot handed to the engine variants.
///
/// Cloning shares the same underlying slot; `load` is idempotent so the
/// startup path can call it exactly once while tests construct handles
/// freely.
#[derive(Clone)]
pub struct ModelHandle {
    slot: Arc<Mutex<Option<WhisperModel>>>,
    size: ModelSize,
    hf_token: Option<String>,
    device: Device,
}

impl ModelHandle {
    pub fn new(size: ModelSize, hf_token: Option<String>, device: Device) -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            size,
            hf_token,
            device,
        }
    }

    /// Load the model into the slot; a no-op when already loaded.
    pub async fn load(&self) -> Result<()> {
        let mut slot = self.slot.lock().await;
        if slot.is_some() {
            tracing::debug!("Whisper {} model already loaded", self.size);
            return Ok(());
        }
        let model = WhisperModel::load(self.size, self.device.clone(), self.hf_token.clone()).await?;
        *slot = Some(model);
        Ok(())
    }

    /// Exclusive access to the model slot; `'static` so segment streams can
    /// hold the handle across request lifetimes.
    pub async fn acquire(&self) -> OwnedMutexGuard<Option<WhisperModel>> {
        self.slot.clone().lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_size_parsing() {
        assert_eq!("base".parse::<ModelSize>().unwrap(), ModelSize::Base);
        assert_eq!("LARGE".parse::<ModelSize>().unwrap(), ModelSize::Large);
        assert!("invalid".parse::<ModelSize>().is_err());
    }

    #[test]
    fn mel_filter_bank_shape_and_weights() {
        let n_freqs = m::N_FFT / 2 + 1;
        let filters = mel_filter_bank(n_freqs, 80, 16000.0);
        assert_eq!(filters.len(), 80 * n_freqs);
        assert!(filters.iter().all(|&w| (0.0..=1.0).contains(&w)));
        // every filter has some mass
        for mel_bin in 0..80 {
            let row = &filters[mel_bin * n_freqs..(mel_bin + 1) * n_freqs];
            assert!(row.iter().any(|&w| w > 0.0), "empty mel filter {}", mel_bin);
        }
    }

    #[test]
    fn decode_budget_shrinks_with_the_prompt_prefix() {
        assert_eq!(decode_budget(448, 4), 444);
        // a maximal prompt prefix leaves nothing to decode, never a
        // negative budget
        assert_eq!(decode_budget(448, 448), 0);
        assert_eq!(decode_budget(448, 500), 0);
    }

    #[test]
    fn language_candidates_skip_out_of_vocabulary_ids() {
        let logits = vec![0.0f32, 1.0, 3.0];
        let candidates =
            language_candidates(&logits, [("en", 1u32), ("de", 2), ("yue", 9_000)]);
        assert_eq!(candidates, vec![("en", 1.0), ("de", 3.0)]);
    }

    #[test]
    fn language_pick_is_a_probability() {
        let candidates = vec![("en", 1.0f32), ("de", 3.0), ("fr", 0.5)];
        let (code, confidence) = pick_language(&candidates).unwrap();
        assert_eq!(code, "de");
        assert!(confidence > 0.5 && confidence <= 1.0);
        assert!(pick_language(&[]).is_none());
    }

    #[test]
    fn repetition_guard_trips_on_triples_and_trigrams() {
        assert!(is_repetitive(&[7, 7], 7));
        assert!(!is_repetitive(&[7, 8], 7));
        assert!(is_repetitive(&[1, 2, 3, 1, 2], 3));
        assert!(!is_repetitive(&[1, 2, 3, 4, 5], 6));
    }
}
