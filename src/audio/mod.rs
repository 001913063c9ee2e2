//! # Audio Module
//!
//! Turns uploaded byte streams into the uniform decoded waveform the
//! recognition engines consume: 16 kHz mono PCM as 32-bit floats.
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: f32 samples in [-1.0, 1.0], converted from little-endian
//!   signed 16-bit PCM

pub mod loader;

pub use loader::{load_audio, DecodedAudio, SAMPLE_RATE};
