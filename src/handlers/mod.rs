pub mod asr;

pub use asr::*;
