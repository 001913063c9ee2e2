//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment-platform variables (HOST, PORT, ASR_ENGINE, ASR_MODEL, HF_TOKEN)
//! 2. Environment variables (APP_SERVER_HOST, APP_ASR_ENGINE, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! The engine selector is read exactly once at process start; there is no
//! runtime reconfiguration path.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub asr: AsrConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// ASR engine selection and model settings.
///
/// ## Fields:
/// - `engine`: which engine variant to construct at startup
///   ("whisper" or "whisper_diarize")
/// - `model`: Whisper model size ("tiny", "base", "small", "medium", "large")
/// - `hf_token`: HuggingFace access token; required by the diarizing engine,
///   optional otherwise (speeds up / authenticates weight downloads)
/// - `ffmpeg_path`: external transcoder binary used when `encode=true`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrConfig {
    pub engine: String,
    pub model: String,
    pub hf_token: Option<String>,
    pub ffmpeg_path: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 9000,
            },
            asr: AsrConfig {
                engine: "whisper".to_string(),
                model: "base".to_string(),
                hf_token: None,
                ffmpeg_path: "ffmpeg".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER_PORT=9000`: override server port
    /// - `APP_ASR_MODEL=medium`: override whisper model size
    /// - `ASR_ENGINE=whisper_diarize`: engine selector (deployment shorthand)
    /// - `HF_TOKEN=hf_...`: HuggingFace credential for the diarizing engine
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Shorthand variables used by deployment platforms and the container
        // image; these don't follow the APP_ prefix convention.
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }
        if let Ok(engine) = env::var("ASR_ENGINE") {
            settings = settings.set_override("asr.engine", engine)?;
        }
        if let Ok(model) = env::var("ASR_MODEL") {
            settings = settings.set_override("asr.model", model)?;
        }
        if let Ok(token) = env::var("HF_TOKEN") {
            if !token.is_empty() {
                settings = settings.set_override("asr.hf_token", token)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Engine-selector validation lives in the engine factory, which owns the
    /// set of supported variants; this only checks structural problems.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.asr.engine.trim().is_empty() {
            return Err(anyhow::anyhow!("ASR engine selector cannot be empty"));
        }

        if self.asr.model.trim().is_empty() {
            return Err(anyhow::anyhow!("ASR model name cannot be empty"));
        }

        if self.asr.ffmpeg_path.trim().is_empty() {
            return Err(anyhow::anyhow!("ffmpeg path cannot be empty"));
        }

        Ok(())
    }
}
