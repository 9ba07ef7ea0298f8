//! Opal audio engine
//!
//! Real-time core of a polyphonic sample-based synthesizer: a fixed voice
//! pool with steal-under-pressure, an async sample-library loader with
//! reference-counted assets, three parallel layer signal paths and the
//! lock-free plumbing between the audio, loader and GUI threads.

pub mod constants;
pub mod device_selector;
pub mod dsp;
pub mod engine;
pub mod layer;
pub mod params;
pub mod sample_playback;
pub mod samplib;
pub mod smoothing;
pub mod sync;
pub mod timing;
pub mod types;
pub mod voice;
pub mod voice_pool;

pub use engine::{Engine, Prefs};
pub use samplib::loader::{Loader, LoadRequest};
pub use types::{EventPayload, HostEvent, LoadError};
