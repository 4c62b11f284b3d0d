//! CPAL implementation of the audio engine seam
//!
//! CPAL abstracts the platform APIs:
//! - Windows: WASAPI
//! - Linux: ALSA/PulseAudio
//! - macOS: CoreAudio

pub mod cpal_backend;
pub mod engine;
pub mod mixdown;

pub use cpal_backend::{CpalBackend, CpalSession};
pub use engine::{LoadMeter, OutputConfig, OutputStream, StreamError};
pub use mixdown::{mix_block, GroupFeed, MixGraph};
