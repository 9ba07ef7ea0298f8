//! Core type definitions.
//!
//! Fundamental types shared across the engine: host event payloads, identifiers
//! and the loader error enum. All audio-thread types are zero-allocation.

/// Monotonically increasing id handed out for each load request.
pub type RequestId = u64;

/// A note paired with its MIDI channel. Used to match note-offs to the voices
/// a note-on started, so that the same note played on two channels releases
/// independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MidiChannelNote {
    pub channel: u8,
    pub note: u8,
}

/// Sample-accurate event delivered by the host for one processing block.
///
/// `frame_offset` is the frame within the current block at which the event
/// takes effect. Events must be sorted by offset; the engine applies them as
/// it reaches each frame position.
#[derive(Debug, Clone, Copy)]
pub struct HostEvent {
    pub frame_offset: u32,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Copy)]
pub enum EventPayload {
    NoteOn {
        channel: u8,
        note: u8,
        /// 0.0 to 1.0
        velocity: f32,
    },
    NoteOff {
        channel: u8,
        note: u8,
    },
    ControlChange {
        channel: u8,
        number: u8,
        /// 0.0 to 1.0
        value: f32,
    },
    ChannelPressure {
        channel: u8,
        /// 0.0 to 1.0
        value: f32,
    },
    ParamChange {
        /// Target layer, 0 to NUM_LAYERS-1.
        layer_index: u8,
        param: crate::params::LayerParamIndex,
        /// Linear value, 0.0 to 1.0.
        linear: f32,
    },
    Tempo {
        bpm: f64,
    },
}

/// Per-block processing context handed down from the host bridge.
#[derive(Debug, Clone, Copy)]
pub struct AudioContext {
    pub sample_rate: f32,
    pub tempo_bpm: f64,
}

/// Errors surfaced by the sample library loader.
///
/// Never constructed on the audio thread. Delivered per-request through the
/// `LoadResult` callback and, when user-facing, through the threadsafe error
/// notification list.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadError {
    FileNotFound { path: String },
    FileReadError { path: String, reason: String },
    DecodingError { path: String, reason: String },
    UnsupportedFormat { path: String, detail: String },
    OutOfMemory { requested_bytes: usize },
    NetworkError { url: String, reason: String },
    PathDoesNotExist { path: String },
    InvalidLibrary { library: String, reason: String },
    Cancelled,
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::FileNotFound { path } => {
                write!(f, "File not found: {}", path)
            }
            LoadError::FileReadError { path, reason } => {
                write!(f, "Failed to read '{}': {}", path, reason)
            }
            LoadError::DecodingError { path, reason } => {
                write!(f, "Failed to decode '{}': {}", path, reason)
            }
            LoadError::UnsupportedFormat { path, detail } => {
                write!(f, "Unsupported format in '{}': {}", path, detail)
            }
            LoadError::OutOfMemory { requested_bytes } => {
                write!(f, "Out of memory ({} bytes requested)", requested_bytes)
            }
            LoadError::NetworkError { url, reason } => {
                write!(f, "Network error fetching '{}': {}", url, reason)
            }
            LoadError::PathDoesNotExist { path } => {
                write!(f, "Path does not exist: {}", path)
            }
            LoadError::InvalidLibrary { library, reason } => {
                write!(f, "Invalid library '{}': {}", library, reason)
            }
            LoadError::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl std::error::Error for LoadError {}

/// Real-time safe logging - compiles to nothing when the `rt-safe` feature
/// (default) is enabled.
#[cfg(feature = "rt-safe")]
#[macro_export]
macro_rules! rt_eprintln {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "rt-safe"))]
#[macro_export]
macro_rules! rt_eprintln {
    ($($arg:tt)*) => {
        eprintln!($($arg)*);
    };
}
