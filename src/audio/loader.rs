//! # Audio Loader
//!
//! Decodes an uploaded byte stream into a request-scoped waveform. When the
//! upload is in an arbitrary container/codec, the bytes are piped through an
//! external ffmpeg process configured to emit raw PCM at the engine's
//! required rate; otherwise they are parsed directly as raw s16le PCM.

use crate::error::AppError;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

/// Sample rate every engine variant consumes.
pub const SAMPLE_RATE: u32 = 16_000;

/// Upper bound on a single transcode; guards against a wedged ffmpeg child
/// holding the request (and its pipes) open forever.
const TRANSCODE_TIMEOUT: Duration = Duration::from_secs(300);

/// Mono PCM sample buffer at [`SAMPLE_RATE`], owned by the request scope.
/// Consumed by transcription or language detection, never persisted.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// A copy of at most the leading `secs` seconds of audio.
    pub fn leading_window(&self, secs: f32) -> Vec<f32> {
        let n = ((secs as f64) * self.sample_rate as f64) as usize;
        self.samples[..n.min(self.samples.len())].to_vec()
    }
}

/// Decode an uploaded byte stream.
///
/// With `encode=true` the bytes are transcoded through ffmpeg to 16 kHz mono
/// s16le; with `encode=false` they are assumed to already be raw s16le PCM
/// at that rate and are parsed directly.
pub async fn load_audio(data: &[u8], encode: bool, ffmpeg_path: &str) -> Result<DecodedAudio, AppError> {
    if data.is_empty() {
        return Err(AppError::AudioDecode("uploaded audio is empty".to_string()));
    }

    let pcm_bytes = if encode {
        transcode(data, ffmpeg_path).await?
    } else {
        data.to_vec()
    };

    let samples = parse_s16le(&pcm_bytes)?;
    tracing::debug!(
        samples = samples.len(),
        duration_secs = samples.len() as f64 / SAMPLE_RATE as f64,
        encoded = encode,
        "Decoded upload"
    );

    Ok(DecodedAudio {
        samples,
        sample_rate: SAMPLE_RATE,
    })
}

/// Pipe the upload through ffmpeg and collect raw s16le output.
///
/// The child is spawned with `kill_on_drop` so an abandoned request (client
/// disconnect, handler error) reaps the process rather than leaking it, and
/// the whole drain is bounded by [`TRANSCODE_TIMEOUT`].
async fn transcode(data: &[u8], ffmpeg_path: &str) -> Result<Vec<u8>, AppError> {
    let mut child = Command::new(ffmpeg_path)
        .args([
            "-nostdin",
            "-hide_banner",
            "-loglevel",
            "error",
            "-i",
            "pipe:0",
            "-f",
            "s16le",
            "-ac",
            "1",
            "-acodec",
            "pcm_s16le",
            "-ar",
            "16000",
            "pipe:1",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AppError::AudioDecode(format!("failed to spawn transcoder: {}", e)))?;

    // Feed stdin from a separate task so a full stdout pipe can't deadlock
    // against an unread stdin buffer; dropping the handle closes the pipe.
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::AudioDecode("transcoder stdin unavailable".to_string()))?;
    let input = data.to_vec();
    let writer = tokio::spawn(async move {
        let _ = stdin.write_all(&input).await;
        let _ = stdin.shutdown().await;
    });

    let output = timeout(TRANSCODE_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| AppError::AudioDecode("transcoder timed out".to_string()))?
        .map_err(|e| AppError::AudioDecode(format!("transcoder failed: {}", e)))?;
    let _ = writer.await;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AppError::AudioDecode(format!(
            "transcoder exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    if output.stdout.is_empty() {
        return Err(AppError::AudioDecode(
            "transcoder produced no output (unrecognized or empty audio?)".to_string(),
        ));
    }

    Ok(output.stdout)
}

/// Parse little-endian signed 16-bit PCM into f32 samples in [-1.0, 1.0].
fn parse_s16le(bytes: &[u8]) -> Result<Vec<f32>, AppError> {
    if bytes.is_empty() {
        return Err(AppError::AudioDecode("no PCM data to decode".to_string()));
    }
    if bytes.len() % 2 != 0 {
        return Err(AppError::AudioDecode(
            "truncated PCM stream: byte count must be even for 16-bit samples".to_string(),
        ));
    }

    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample as f32 / 32768.0);
    }

    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
        let mut out = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }

    #[tokio::test]
    async fn raw_pcm_parses_without_transcoding() {
        let bytes = pcm_bytes(&[0, 16384, -16384, 32767, -32768]);
        let audio = load_audio(&bytes, false, "ffmpeg").await.unwrap();
        assert_eq!(audio.sample_rate, SAMPLE_RATE);
        assert_eq!(audio.samples.len(), 5);
        assert!((audio.samples[1] - 0.5).abs() < 1e-3);
        assert!((audio.samples[3] - 0.99997).abs() < 1e-3);
    }

    #[tokio::test]
    async fn empty_upload_is_a_decode_error() {
        let err = load_audio(&[], false, "ffmpeg").await.unwrap_err();
        assert!(matches!(err, AppError::AudioDecode(_)));
    }

    #[tokio::test]
    async fn odd_byte_count_is_truncated() {
        let err = load_audio(&[0u8; 15], false, "ffmpeg").await.unwrap_err();
        assert!(matches!(err, AppError::AudioDecode(_)));
    }

    #[test]
    fn leading_window_is_bounded() {
        let audio = DecodedAudio {
            samples: vec![0.0; SAMPLE_RATE as usize * 4],
            sample_rate: SAMPLE_RATE,
        };
        assert_eq!(audio.leading_window(2.0).len(), SAMPLE_RATE as usize * 2);
        // shorter audio than the window: everything
        assert_eq!(audio.leading_window(10.0).len(), audio.samples.len());
        assert!((audio.duration_secs() - 4.0).abs() < 1e-9);
    }
}
