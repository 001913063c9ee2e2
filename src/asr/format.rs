//! # Output Formatter
//!
//! Renders a transcription as one of five result formats. The subtitle and
//! text formats are incremental: each segment becomes an output chunk as
//! soon as the engine produces it, so the client sees the first line while
//! later audio is still being decoded. `json` is the exception: a JSON
//! document cannot be emitted piecewise and stay valid, so it drains the
//! segment sequence first and serializes once.

use crate::asr::types::Segment;
use crate::engine::Transcription;
use crate::error::AppError;
use actix_web::web::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::fmt;
use std::str::FromStr;

pub type FormattedStream = BoxStream<'static, Result<Bytes, AppError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Txt,
    Vtt,
    Srt,
    Tsv,
    Json,
}

impl OutputFormat {
    /// File extension, used for the download filename.
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Txt => "txt",
            OutputFormat::Vtt => "vtt",
            OutputFormat::Srt => "srt",
            OutputFormat::Tsv => "tsv",
            OutputFormat::Json => "json",
        }
    }

    /// Whether the format emits chunks as segments arrive. `json` buffers.
    pub fn is_streaming(&self) -> bool {
        !matches!(self, OutputFormat::Json)
    }
}

impl FromStr for OutputFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "txt" => Ok(OutputFormat::Txt),
            "vtt" => Ok(OutputFormat::Vtt),
            "srt" => Ok(OutputFormat::Srt),
            "tsv" => Ok(OutputFormat::Tsv),
            "json" => Ok(OutputFormat::Json),
            other => Err(AppError::InvalidRequest(format!(
                "unknown output format '{}' (expected txt, vtt, srt, tsv or json)",
                other
            ))),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Render the transcription into the chosen format as a byte-chunk stream.
pub fn format(transcription: Transcription, output: OutputFormat) -> FormattedStream {
    let Transcription { language, segments } = transcription;
    match output {
        OutputFormat::Txt => segments
            .map_ok(|seg| Bytes::from(format!("{}\n", line_text(&seg))))
            .boxed(),
        OutputFormat::Vtt => {
            let header = stream::once(async { Ok(Bytes::from_static(b"WEBVTT\n\n")) });
            header
                .chain(segments.map_ok(|seg| {
                    Bytes::from(format!(
                        "{} --> {}\n{}\n\n",
                        timestamp(seg.start, '.'),
                        timestamp(seg.end, '.'),
                        line_text(&seg),
                    ))
                }))
                .boxed()
        }
        OutputFormat::Srt => segments
            .enumerate()
            .map(|(i, res)| {
                res.map(|seg| {
                    Bytes::from(format!(
                        "{}\n{} --> {}\n{}\n\n",
                        i + 1,
                        timestamp(seg.start, ','),
                        timestamp(seg.end, ','),
                        line_text(&seg),
                    ))
                })
            })
            .boxed(),
        OutputFormat::Tsv => {
            let header = stream::once(async { Ok(Bytes::from_static(b"start\tend\ttext\n")) });
            header
                .chain(segments.map_ok(|seg| {
                    Bytes::from(format!(
                        "{}\t{}\t{}\n",
                        (seg.start * 1000.0).round() as i64,
                        (seg.end * 1000.0).round() as i64,
                        seg.text.trim(),
                    ))
                }))
                .boxed()
        }
        OutputFormat::Json => stream::once(async move {
            let collected: Vec<Segment> = segments.try_collect().await?;
            let text: String = collected
                .iter()
                .map(|seg| seg.text.trim())
                .collect::<Vec<_>>()
                .join(" ");
            let doc = serde_json::json!({
                "text": text,
                "segments": collected,
                "language": language,
            });
            let body = serde_json::to_vec(&doc)
                .map_err(|e| AppError::Engine(format!("failed to serialize result: {}", e)))?;
            Ok(Bytes::from(body))
        })
        .boxed(),
    }
}

/// Segment line with the speaker label prefixed when attribution ran.
fn line_text(segment: &Segment) -> String {
    match &segment.speaker {
        Some(speaker) => format!("{}: {}", speaker, segment.text.trim()),
        None => segment.text.trim().to_string(),
    }
}

/// `HH:MM:SS<sep>mmm` with the subtitle-format-specific millisecond separator.
fn timestamp(seconds: f64, sep: char) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let s = (total_ms / 1000) % 60;
    let m = (total_ms / 60_000) % 60;
    let h = total_ms / 3_600_000;
    format!("{:02}:{:02}:{:02}{}{:03}", h, m, s, sep, ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SegmentStream;
    use std::time::Duration;

    fn transcription(segments: Vec<Segment>) -> Transcription {
        let stream: SegmentStream = stream::iter(segments.into_iter().map(Ok)).boxed();
        Transcription {
            language: "en".to_string(),
            segments: stream,
        }
    }

    /// One ready segment followed by a tail that never resolves, to prove
    /// where buffering happens.
    fn stalled_transcription() -> Transcription {
        let head = stream::iter(vec![Ok(Segment::new(0.0, 2.5, "first line"))]);
        let stream: SegmentStream = head.chain(stream::pending()).boxed();
        Transcription {
            language: "en".to_string(),
            segments: stream,
        }
    }

    fn sample_segments() -> Vec<Segment> {
        vec![
            Segment::new(0.0, 2.5, "hello there"),
            Segment::new(2.5, 61.234, "general remarks"),
        ]
    }

    async fn collect(stream: FormattedStream) -> String {
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        let bytes: Vec<u8> = chunks.into_iter().flatten().collect();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn format_parses_and_rejects() {
        assert_eq!("vtt".parse::<OutputFormat>().unwrap(), OutputFormat::Vtt);
        let err = "docx".parse::<OutputFormat>().unwrap_err();
        assert!(matches!(err, AppError::InvalidRequest(_)));
    }

    #[test]
    fn timestamps_roll_over_units() {
        assert_eq!(timestamp(0.0, '.'), "00:00:00.000");
        assert_eq!(timestamp(61.234, ','), "00:01:01,234");
        assert_eq!(timestamp(3661.5, '.'), "01:01:01.500");
    }

    #[tokio::test]
    async fn txt_is_one_line_per_segment() {
        let out = collect(format(transcription(sample_segments()), OutputFormat::Txt)).await;
        assert_eq!(out, "hello there\ngeneral remarks\n");
    }

    #[tokio::test]
    async fn vtt_has_header_and_cue_blocks() {
        let out = collect(format(transcription(sample_segments()), OutputFormat::Vtt)).await;
        assert!(out.starts_with("WEBVTT\n\n"));
        assert!(out.contains("00:00:00.000 --> 00:00:02.500\nhello there\n\n"));
        assert!(out.contains("00:00:02.500 --> 00:01:01.234\ngeneral remarks\n\n"));
    }

    #[tokio::test]
    async fn srt_numbers_cues_from_one() {
        let out = collect(format(transcription(sample_segments()), OutputFormat::Srt)).await;
        assert!(out.starts_with("1\n00:00:00,000 --> 00:00:02,500\nhello there\n\n"));
        assert!(out.contains("2\n00:00:02,500 --> 00:01:01,234\ngeneral remarks\n\n"));
    }

    #[tokio::test]
    async fn tsv_uses_integer_milliseconds() {
        let out = collect(format(transcription(sample_segments()), OutputFormat::Tsv)).await;
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "start\tend\ttext");
        assert_eq!(lines[1], "0\t2500\thello there");
        assert_eq!(lines[2], "2500\t61234\tgeneral remarks");
    }

    #[tokio::test]
    async fn speaker_labels_prefix_subtitle_lines() {
        let mut seg = Segment::new(0.0, 1.0, "good morning");
        seg.speaker = Some("SPEAKER_01".to_string());
        let out = collect(format(transcription(vec![seg]), OutputFormat::Txt)).await;
        assert_eq!(out, "SPEAKER_01: good morning\n");
    }

    #[tokio::test]
    async fn json_collects_into_one_valid_document() {
        let out = collect(format(transcription(sample_segments()), OutputFormat::Json)).await;
        let doc: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(doc["language"], "en");
        assert_eq!(doc["text"], "hello there general remarks");
        assert_eq!(doc["segments"].as_array().unwrap().len(), 2);
        assert_eq!(doc["segments"][1]["text"], "general remarks");
    }

    #[tokio::test]
    async fn json_of_no_segments_is_still_valid() {
        let out = collect(format(transcription(Vec::new()), OutputFormat::Json)).await;
        let doc: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(doc["segments"].as_array().unwrap().len(), 0);
        assert_eq!(doc["text"], "");
    }

    #[tokio::test]
    async fn streaming_formats_emit_before_the_engine_finishes() {
        for output in [
            OutputFormat::Txt,
            OutputFormat::Vtt,
            OutputFormat::Srt,
            OutputFormat::Tsv,
        ] {
            let mut stream = format(stalled_transcription(), output);
            let first = tokio::time::timeout(Duration::from_millis(100), stream.next())
                .await
                .unwrap_or_else(|_| panic!("{} did not stream its first chunk", output))
                .unwrap()
                .unwrap();
            assert!(!first.is_empty());
        }
    }

    #[tokio::test]
    async fn json_waits_for_the_full_sequence() {
        let mut stream = format(stalled_transcription(), OutputFormat::Json);
        let first = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(first.is_err(), "json must not emit before segments end");
    }

    #[tokio::test]
    async fn formatting_is_repeatable() {
        let a = collect(format(transcription(sample_segments()), OutputFormat::Srt)).await;
        let b = collect(format(transcription(sample_segments()), OutputFormat::Srt)).await;
        assert_eq!(a, b);
    }
}
