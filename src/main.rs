//! Opal standalone host
//!
//! Wires the engine core to a real output device: scans a directory of WAV
//! files into libraries, loads the first instrument (or falls back to the
//! sine waveform), and plays a built-in note pattern so the engine is
//! audible without a MIDI source.

use clap::Parser;
use cpal::traits::{DeviceTrait, StreamTrait};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thread_priority::{set_current_thread_priority, ThreadPriority, ThreadPriorityValue};

use opal_engine::constants::{
    DEFAULT_AUDIO_PRIORITY, DEFAULT_BLOCK_SIZE, DEFAULT_SAMPLE_DIR, DEFAULT_SAMPLE_RATE,
};
use opal_engine::device_selector;
use opal_engine::engine::{Engine, Prefs};
use opal_engine::samplib::decode::HoundDecoder;
use opal_engine::samplib::loader::Loader;
use opal_engine::samplib::{
    Instrument, InstrumentId, InstrumentMetadata, Library, LibraryId, LibraryProvider, Region,
};
use opal_engine::sync::error_notifications::ErrorNotifications;
use opal_engine::types::{EventPayload, HostEvent, LoadError};
use opal_engine::voice::WaveformType;

/// Command line arguments for the Opal standalone host
#[derive(Parser)]
#[command(name = "Opal")]
#[command(about = "Polyphonic sample-based synthesizer engine")]
struct Args {
    /// Audio sample rate in Hz
    #[arg(short, long, default_value_t = DEFAULT_SAMPLE_RATE)]
    sample_rate: u32,

    /// Audio processing block size in frames
    #[arg(short, long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: u32,

    /// Specific audio output device name
    #[arg(long)]
    output_device: Option<String>,

    /// Directory of sample folders (each folder becomes a library)
    #[arg(long, default_value = DEFAULT_SAMPLE_DIR)]
    sample_dir: String,

    /// Audio thread priority (0-99, 0 = disable, mapped to platform ranges)
    #[arg(long, default_value_t = DEFAULT_AUDIO_PRIORITY)]
    audio_priority: u8,

    /// Host tempo in BPM (drives tempo-synced LFO rates)
    #[arg(long, default_value_t = 120.0)]
    tempo: f64,

    /// List available audio output devices and exit
    #[arg(long)]
    list_devices: bool,
}

/// Maps user priority (0-99) to a platform-appropriate range.
fn map_to_platform_priority(user_priority: u8) -> u8 {
    let user_priority = user_priority.min(99);

    #[cfg(target_os = "macos")]
    {
        // macOS: range 15-47
        15 + ((user_priority as u16 * 32) / 99) as u8
    }

    #[cfg(target_os = "linux")]
    {
        // Linux: 1-99 for SCHED_FIFO/SCHED_RR
        user_priority.max(1)
    }

    #[cfg(target_os = "windows")]
    {
        user_priority.min(31)
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        user_priority.min(50)
    }
}

// ---------------------------------------------------------------------------
// Directory-scan library provider

/// Each subfolder of the root becomes a library; each WAV file inside it an
/// instrument with a single full-range region rooted at middle C.
struct DirectoryProvider {
    root: PathBuf,
}

impl DirectoryProvider {
    fn new(root: &str) -> Self {
        Self {
            root: PathBuf::from(root),
        }
    }
}

fn folder_content_hash(paths: &[PathBuf]) -> u64 {
    let mut hash = 0xcbf29ce484222325u64;
    for path in paths {
        for byte in path.display().to_string().bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
    }
    hash
}

impl LibraryProvider for DirectoryProvider {
    fn read_libraries(&self) -> Result<Vec<Library>, LoadError> {
        if !self.root.exists() {
            return Err(LoadError::PathDoesNotExist {
                path: self.root.display().to_string(),
            });
        }

        let mut libraries = Vec::new();
        let entries = std::fs::read_dir(&self.root).map_err(|e| LoadError::FileReadError {
            path: self.root.display().to_string(),
            reason: e.to_string(),
        })?;

        for entry in entries.flatten() {
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let folder_name = entry.file_name().to_string_lossy().to_string();
            let mut wavs: Vec<PathBuf> = std::fs::read_dir(entry.path())
                .into_iter()
                .flatten()
                .flatten()
                .map(|f| f.path())
                .filter(|p| p.extension().map(|e| e == "wav").unwrap_or(false))
                .collect();
            wavs.sort();
            if wavs.is_empty() {
                continue;
            }

            let instruments = wavs
                .iter()
                .map(|path| {
                    let name = path
                        .file_stem()
                        .map(|s| s.to_string_lossy().to_string())
                        .unwrap_or_else(|| "untitled".to_string());
                    Instrument {
                        name,
                        metadata: InstrumentMetadata {
                            folder: folder_name.clone(),
                            ..Default::default()
                        },
                        regions: vec![Region {
                            path: path
                                .strip_prefix(&entry.path())
                                .unwrap_or(path.as_path())
                                .to_path_buf(),
                            root_key: 60,
                            key_range: (0, 128),
                            velocity_range: (0, 128),
                            round_robin_index: None,
                            timbre_layer_range: None,
                            builtin_loop: None,
                            always_loop: false,
                            gain_db: 0.0,
                        }],
                    }
                })
                .collect();

            libraries.push(Library {
                id: LibraryId {
                    author: "Local".to_string(),
                    name: folder_name,
                },
                version: "1.0.0".to_string(),
                url: String::new(),
                path: entry.path(),
                content_hash: folder_content_hash(&wavs),
                instruments,
                irs: Vec::new(),
            });
        }

        Ok(libraries)
    }
}

// ---------------------------------------------------------------------------
// Built-in note pattern

/// A slow arpeggio so the standalone binary makes sound on its own.
struct Pattern {
    frames_per_step: u32,
    frame_counter: u32,
    step: usize,
    active_note: Option<u8>,
}

const PATTERN_NOTES: [u8; 6] = [48, 60, 63, 67, 70, 72];

impl Pattern {
    fn new(sample_rate: u32) -> Self {
        Self {
            frames_per_step: sample_rate / 2,
            frame_counter: 0,
            step: 0,
            active_note: None,
        }
    }

    /// Events for the next `num_frames` frames.
    fn advance(&mut self, num_frames: u32, events: &mut Vec<HostEvent>) {
        let mut frame = 0;
        while frame < num_frames {
            let frames_until_step = self.frames_per_step - self.frame_counter;
            if frames_until_step >= num_frames - frame {
                self.frame_counter += num_frames - frame;
                break;
            }
            frame += frames_until_step;
            self.frame_counter = 0;

            if let Some(note) = self.active_note.take() {
                events.push(HostEvent {
                    frame_offset: frame.saturating_sub(1),
                    payload: EventPayload::NoteOff { channel: 0, note },
                });
            }
            let note = PATTERN_NOTES[self.step % PATTERN_NOTES.len()];
            self.step += 1;
            events.push(HostEvent {
                frame_offset: frame,
                payload: EventPayload::NoteOn {
                    channel: 0,
                    note,
                    velocity: 0.75,
                },
            });
            self.active_note = Some(note);
        }
    }
}

// ---------------------------------------------------------------------------

fn print_banner(args: &Args) {
    println!();
    println!("  Opal engine");
    println!("  Sample rate: {}", args.sample_rate);
    println!("  Block size:  {}", args.block_size);
    println!("  Sample dir:  {}", args.sample_dir);
    println!("  Tempo:       {} BPM", args.tempo);
    println!();
}

fn main() {
    let args = Args::parse();

    if args.list_devices {
        device_selector::list_output_devices(args.sample_rate);
        return;
    }

    print_banner(&args);

    let prefs = Prefs::default();
    let error_notifications = Arc::new(ErrorNotifications::new());
    let loader = Loader::new(
        Box::new(DirectoryProvider::new(&args.sample_dir)),
        Box::new(HoundDecoder),
        Arc::clone(&error_notifications),
        prefs.num_decode_threads,
    );

    let max_sample_memory = prefs.max_sample_memory_bytes as u64;
    let mut engine = Engine::new(&loader, prefs);
    engine.prepare(args.sample_rate as f32, args.block_size);
    engine.set_tempo(args.tempo);

    // Wait briefly for the library scan, then pick the first instrument.
    std::thread::sleep(std::time::Duration::from_millis(200));
    let mut first_instrument: Option<InstrumentId> = None;
    loader.for_each_library(|library| {
        if first_instrument.is_none() {
            if let Some(instrument) = library.instruments.first() {
                first_instrument = Some(InstrumentId {
                    library: library.id.clone(),
                    instrument_name: instrument.name.clone(),
                });
            }
        }
    });
    match &first_instrument {
        Some(id) => {
            println!("Loading instrument: {} from {}", id.instrument_name, id.library);
            engine.load_instrument(0, id.clone());
        }
        None => {
            println!("No samples found under {}; using the sine waveform", args.sample_dir);
            engine.set_waveform_instrument(0, WaveformType::Sine);
        }
    }

    let selected = match device_selector::select_output_device(
        args.sample_rate,
        args.output_device.as_deref(),
    ) {
        Ok(selected) => {
            if let Some(reason) = &selected.fallback_reason {
                println!("Audio device fallback: {}", reason);
            }
            println!(
                "Output device: {}{}",
                selected.name,
                if selected.is_default { " (default)" } else { "" }
            );
            selected
        }
        Err(e) => {
            eprintln!("Failed to select audio device: {}", e);
            std::process::exit(1);
        }
    };

    let config = cpal::StreamConfig {
        channels: 2,
        sample_rate: cpal::SampleRate(args.sample_rate),
        buffer_size: cpal::BufferSize::Fixed(args.block_size),
    };

    let audio_priority = args.audio_priority;
    let mut pattern = Pattern::new(args.sample_rate);
    let mut events: Vec<HostEvent> = Vec::with_capacity(64);
    let mut priority_set = false;

    let stream = selected
        .device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                // cpal gives no pre-start hook on the audio thread, so the
                // priority is raised on the first callback.
                if !priority_set {
                    priority_set = true;
                    if audio_priority > 0 {
                        let platform = map_to_platform_priority(audio_priority);
                        match ThreadPriorityValue::try_from(platform) {
                            Ok(value) => {
                                if let Err(e) = set_current_thread_priority(
                                    ThreadPriority::Crossplatform(value),
                                ) {
                                    eprintln!("Warning: could not set audio priority: {:?}", e);
                                }
                            }
                            Err(e) => {
                                eprintln!("Warning: invalid priority {}: {}", platform, e)
                            }
                        }
                    }
                }

                let num_frames = (data.len() / 2) as u32;
                events.clear();
                pattern.advance(num_frames, &mut events);
                engine.process(data, &events, None);
            },
            |e| eprintln!("Audio stream error: {}", e),
            None,
        )
        .expect("Failed to build output stream");

    stream.play().expect("Failed to start output stream");
    println!("Playing. Press Enter to quit.");

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        let _ = spawn_quit_watcher(move || running.store(false, Ordering::Relaxed));
    }
    let mut warned_about_memory = false;
    while running.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(100));
        error_notifications.for_each(|notice| {
            eprintln!("[{}] {}", notice.title, notice.message);
            error_notifications.remove(notice.id);
        });
        if !warned_about_memory && loader.total_bytes_used_by_samples() > max_sample_memory {
            warned_about_memory = true;
            eprintln!(
                "Warning: sample memory above the configured budget ({} MB)",
                max_sample_memory / (1024 * 1024)
            );
        }
    }

    drop(stream);
    println!("Stopped.");
}

/// Waits for a line (or EOF) on stdin, then fires the quit callback.
fn spawn_quit_watcher(on_quit: impl FnOnce() + Send + 'static) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("quit-watch".to_string())
        .spawn(move || {
            let mut line = String::new();
            let _ = std::io::stdin().read_line(&mut line);
            on_quit();
        })
        .map(|_| ())
}
