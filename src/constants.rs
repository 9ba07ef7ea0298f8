//! Centralized constants for the Opal audio engine.
//! Contains only the constants that are actually used throughout the codebase.

// Voice pool limits - Used in voice_pool.rs, voice.rs and layer.rs
pub const NUM_VOICES: usize = 64;
pub const MAX_ACTIVE_VOICES: usize = 32;
pub const MAX_VOICE_SAMPLES: usize = 4;
pub const VOICE_CHUNK_FRAMES: usize = 64;

// Layer limits - Used in engine.rs and layer.rs
pub const NUM_LAYERS: usize = 3;
pub const NUM_LAYER_EQ_BANDS: usize = 2;

// Fade timings in milliseconds - Used in voice.rs, voice_pool.rs and layer.rs
pub const VOICE_STEAL_FADE_MS: f32 = 10.0;
pub const VOICE_START_FADE_MS: f32 = 0.25;
pub const INSTRUMENT_CHANGE_FADE_MS: f32 = 10.0;
pub const EQ_ENABLE_FADE_MS: f32 = 4.0;

// Envelope floor - Used in layer.rs
pub const MIN_ENVELOPE_MS: f32 = 0.2;

// Audio processing defaults - Used in main.rs CLI defaults and engine.rs
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;
pub const DEFAULT_BLOCK_SIZE: u32 = 512;
pub const DEFAULT_TEMPO_BPM: f64 = 120.0;

// Sample library defaults - Used in main.rs and samplib/loader.rs
pub const DEFAULT_SAMPLE_DIR: &str = "./samples";
pub const DEFAULT_MAX_SAMPLE_MEMORY: usize = 512 * 1024 * 1024;

// Thread priority - Used in main.rs
pub const DEFAULT_AUDIO_PRIORITY: u8 = 80;

// Per-layer parameter smoothing windows in milliseconds - Used in layer.rs
pub const PARAM_SMOOTHING_MIN_MS: f32 = 3.0;
pub const PARAM_SMOOTHING_MAX_MS: f32 = 30.0;
pub const VOICE_SMOOTHING_MS: f32 = 10.0;
