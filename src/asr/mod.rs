//! # ASR Core Module
//!
//! Request-to-transcript pipeline pieces that sit between the HTTP surface
//! and the recognition engine:
//!
//! - **types**: segments, words, request options, detection results
//! - **pipeline**: capability validation and engine dispatch
//! - **format**: lazy rendering of segment streams into output formats

pub mod format;
pub mod pipeline;
pub mod types;

pub use format::OutputFormat;
pub use types::{DetectionResult, Segment, Task, TranscriptionOptions, Word};
