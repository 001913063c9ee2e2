//! # Request Surface
//!
//! The two transcription endpoints. Both take a multipart upload in the
//! `audio_file` field plus query parameters; `POST /asr` answers with the
//! formatted transcript as a streaming body, `POST /detect-language` with a
//! small JSON document.
//!
//! Option parsing and capability validation run before the audio is
//! decoded, so an invalid request never pays for ffmpeg or inference.

use crate::asr::format::{self, OutputFormat};
use crate::asr::pipeline;
use crate::asr::types::{DiarizationOptions, Task, TranscriptionOptions};
use crate::audio;
use crate::error::{AppError, AppResult};
use crate::lang;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use futures_util::stream::StreamExt;
use serde::Deserialize;

/// Uploads larger than this are rejected before decoding.
const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

fn default_true() -> bool {
    true
}

fn default_task() -> String {
    "transcribe".to_string()
}

fn default_output() -> String {
    "txt".to_string()
}

#[derive(Debug, Deserialize)]
pub struct AsrParams {
    /// Run the upload through ffmpeg before decoding (set to false only
    /// for raw 16 kHz mono s16le PCM)
    #[serde(default = "default_true")]
    pub encode: bool,
    #[serde(default = "default_task")]
    pub task: String,
    pub language: Option<String>,
    pub initial_prompt: Option<String>,
    #[serde(default)]
    pub vad_filter: bool,
    #[serde(default)]
    pub word_timestamps: bool,
    #[serde(default)]
    pub diarize: bool,
    pub min_speakers: Option<u32>,
    pub max_speakers: Option<u32>,
    #[serde(default = "default_output")]
    pub output: String,
}

#[derive(Debug, Deserialize)]
pub struct DetectParams {
    #[serde(default = "default_true")]
    pub encode: bool,
}

impl AsrParams {
    fn to_options(&self) -> AppResult<TranscriptionOptions> {
        let task: Task = self.task.parse()?;
        if let Some(code) = &self.language {
            if !lang::is_supported(code) {
                return Err(AppError::InvalidRequest(format!(
                    "unknown language code '{}'",
                    code
                )));
            }
        }
        Ok(TranscriptionOptions {
            task,
            language: self.language.clone(),
            initial_prompt: self.initial_prompt.clone(),
            vad_filter: self.vad_filter,
            word_timestamps: self.word_timestamps,
            diarization: DiarizationOptions {
                enabled: self.diarize,
                min_speakers: self.min_speakers,
                max_speakers: self.max_speakers,
            },
        })
    }
}

/// `POST /asr` — transcribe an uploaded file into the requested format.
pub async fn transcribe(
    state: web::Data<AppState>,
    params: web::Query<AsrParams>,
    payload: actix_multipart::Multipart,
) -> AppResult<HttpResponse> {
    let output: OutputFormat = params.output.parse()?;
    let options = params.to_options()?;
    pipeline::validate_options(&options, state.engine.capabilities())?;

    let upload = read_audio_field(payload).await?;
    let audio = audio::load_audio(&upload.data, params.encode, &state.config.asr.ffmpeg_path).await?;

    state.increment_active_transcriptions();
    let transcription = match pipeline::run(state.engine.as_ref(), audio, options).await {
        Ok(t) => t,
        Err(e) => {
            state.decrement_active_transcriptions();
            return Err(e);
        }
    };

    // The guard lives inside the body stream, so the active counter drops
    // whether the client reads to the end or disconnects early.
    let guard = ActiveGuard(state.clone());
    let body = format::format(transcription, output).map(move |chunk| {
        let _held = &guard;
        chunk
    });

    Ok(HttpResponse::Ok()
        .content_type("text/plain")
        .insert_header(("Asr-Engine", state.engine.capabilities().name))
        .insert_header((
            "Content-Disposition",
            format!(
                "attachment; filename=\"{}.{}\"",
                sanitize_filename(&upload.filename),
                output.extension()
            ),
        ))
        .streaming(body))
}

/// `POST /detect-language` — classify the spoken language of an upload.
pub async fn detect_language(
    state: web::Data<AppState>,
    params: web::Query<DetectParams>,
    payload: actix_multipart::Multipart,
) -> AppResult<HttpResponse> {
    let upload = read_audio_field(payload).await?;
    let audio = audio::load_audio(&upload.data, params.encode, &state.config.asr.ffmpeg_path).await?;
    let detected = pipeline::detect(state.engine.as_ref(), audio).await?;
    Ok(HttpResponse::Ok().json(detected))
}

/// `GET /` — service index.
pub async fn index(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "engine": state.engine.capabilities().name,
        "endpoints": ["POST /asr", "POST /detect-language", "GET /health", "GET /metrics"]
    }))
}

struct AudioUpload {
    data: Vec<u8>,
    filename: String,
}

struct ActiveGuard(web::Data<AppState>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.decrement_active_transcriptions();
    }
}

/// Collect the `audio_file` multipart field into memory.
async fn read_audio_field(mut payload: actix_multipart::Multipart) -> AppResult<AudioUpload> {
    let mut upload: Option<AudioUpload> = None;

    while let Some(item) = payload.next().await {
        let mut field = item
            .map_err(|e| AppError::InvalidRequest(format!("malformed multipart body: {}", e)))?;

        let Some(content_disposition) = field.content_disposition() else {
            continue;
        };
        if content_disposition.get_name() != Some("audio_file") {
            continue;
        }
        let filename = content_disposition
            .get_filename()
            .unwrap_or("audio")
            .to_string();

        let mut data = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk
                .map_err(|e| AppError::InvalidRequest(format!("upload interrupted: {}", e)))?;
            if data.len() + chunk.len() > MAX_UPLOAD_BYTES {
                return Err(AppError::InvalidRequest(format!(
                    "upload exceeds {} bytes",
                    MAX_UPLOAD_BYTES
                )));
            }
            data.extend_from_slice(&chunk);
        }
        upload = Some(AudioUpload { data, filename });
    }

    upload.ok_or_else(|| {
        AppError::InvalidRequest("missing multipart field 'audio_file'".to_string())
    })
}

/// Strip characters that would break the Content-Disposition header.
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_control() && *c != '"' && *c != '\\')
        .collect()
}
