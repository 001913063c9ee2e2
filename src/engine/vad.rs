//! Energy-based voice activity gate.
//!
//! Frame-wise RMS thresholding against an adaptive noise floor, used by the
//! engine variant that declares the `vad_filter` capability to skip
//! non-speech regions before windowing. Spans keep their original sample
//! positions so segment timestamps stay aligned to the source audio.

/// Half-open sample range `[start, end)` judged to contain speech.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeechSpan {
    pub start: usize,
    pub end: usize,
}

/// Analysis frame length (30 ms at 16 kHz).
const FRAME_SAMPLES: usize = 480;

/// Absolute RMS floor below which a frame is never speech.
const MIN_SPEECH_RMS: f32 = 0.004;

/// Speech must exceed the estimated noise floor by this factor.
const NOISE_FLOOR_FACTOR: f32 = 2.5;

/// Gaps shorter than this many frames are bridged into one span.
const MAX_BRIDGE_FRAMES: usize = 10; // 300 ms

/// Detect speech spans in 16 kHz mono audio.
///
/// Returns the whole buffer as a single span when the audio is shorter than
/// one analysis frame; returns no spans for silence.
pub fn speech_spans(samples: &[f32]) -> Vec<SpeechSpan> {
    if samples.is_empty() {
        return Vec::new();
    }
    if samples.len() < FRAME_SAMPLES {
        return vec![SpeechSpan {
            start: 0,
            end: samples.len(),
        }];
    }

    let frame_rms: Vec<f32> = samples
        .chunks(FRAME_SAMPLES)
        .map(|frame| {
            let energy: f32 = frame.iter().map(|s| s * s).sum();
            (energy / frame.len() as f32).sqrt()
        })
        .collect();

    // Noise floor: 10th-percentile frame RMS
    let mut sorted = frame_rms.clone();
    sorted.sort_by(f32::total_cmp);
    let noise_floor = sorted[sorted.len() / 10];
    let threshold = MIN_SPEECH_RMS.max(noise_floor * NOISE_FLOOR_FACTOR);

    let speech: Vec<bool> = frame_rms.iter().map(|&rms| rms >= threshold).collect();

    let mut spans: Vec<SpeechSpan> = Vec::new();
    let mut open: Option<usize> = None;
    for (i, &is_speech) in speech.iter().enumerate() {
        match (open, is_speech) {
            (None, true) => open = Some(i),
            (Some(start_frame), false) => {
                // Bridge short gaps rather than splitting the span
                let gap_end = (i + MAX_BRIDGE_FRAMES).min(speech.len());
                if speech[i..gap_end].iter().any(|&s| s) {
                    continue;
                }
                spans.push(frames_to_span(start_frame, i, samples.len()));
                open = None;
            }
            _ => {}
        }
    }
    if let Some(start_frame) = open {
        spans.push(frames_to_span(start_frame, speech.len(), samples.len()));
    }

    spans
}

fn frames_to_span(start_frame: usize, end_frame: usize, total_samples: usize) -> SpeechSpan {
    SpeechSpan {
        start: start_frame * FRAME_SAMPLES,
        end: (end_frame * FRAME_SAMPLES).min(total_samples),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (i as f32 * 0.3).sin())
            .collect()
    }

    #[test]
    fn silence_yields_no_spans() {
        let samples = vec![0.0f32; 16_000];
        assert!(speech_spans(&samples).is_empty());
    }

    #[test]
    fn tone_in_silence_is_localized() {
        let mut samples = vec![0.0f32; 48_000];
        samples[16_000..32_000].copy_from_slice(&tone(16_000, 0.5));
        let spans = speech_spans(&samples);
        assert_eq!(spans.len(), 1);
        // span boundaries are frame-aligned but must bracket the tone
        assert!(spans[0].start <= 16_000);
        assert!(spans[0].end >= 32_000 - FRAME_SAMPLES);
        assert!(spans[0].end <= 33_000);
    }

    #[test]
    fn short_gaps_are_bridged() {
        let mut samples = tone(48_000, 0.5);
        // 100 ms of silence mid-utterance
        for s in &mut samples[24_000..25_600] {
            *s = 0.0;
        }
        let spans = speech_spans(&samples);
        assert_eq!(spans.len(), 1);
    }

    #[test]
    fn tiny_buffers_pass_through() {
        let samples = tone(100, 0.5);
        let spans = speech_spans(&samples);
        assert_eq!(spans, vec![SpeechSpan { start: 0, end: 100 }]);
    }
}
