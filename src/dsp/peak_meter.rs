//! Stereo peak meter with exponential falldown and clipping detection.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const FALLDOWN_RATE_MS: f32 = 500.0;
const CLIPPING_DETECTION_WINDOW_MS: f32 = 500.0;
const SMOOTHING_AMOUNT: f32 = 0.001;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PeakSnapshot {
    pub left: f32,
    pub right: f32,
}

pub struct StereoPeakMeter {
    falldown_steps: [f32; 2],
    levels: [f32; 2],
    smoothed_levels: [f32; 2],
    prev_levels: [f32; 2],
    falldown_divisor: f32,
    clipping_detection_start_counter: u32,
    clipping_detection_counter: u32,

    // Read by the GUI thread, relaxed.
    clipping_counter_atomic: AtomicU32,
    snapshot: AtomicU64,
}

impl Default for StereoPeakMeter {
    fn default() -> Self {
        Self {
            falldown_steps: [0.0; 2],
            levels: [0.0; 2],
            smoothed_levels: [0.0; 2],
            prev_levels: [0.0; 2],
            falldown_divisor: 1.0,
            clipping_detection_start_counter: 0,
            clipping_detection_counter: 0,
            clipping_counter_atomic: AtomicU32::new(0),
            snapshot: AtomicU64::new(0),
        }
    }
}

fn pack_snapshot(s: PeakSnapshot) -> u64 {
    ((s.left.to_bits() as u64) << 32) | s.right.to_bits() as u64
}

fn unpack_snapshot(v: u64) -> PeakSnapshot {
    PeakSnapshot {
        left: f32::from_bits((v >> 32) as u32),
        right: f32::from_bits(v as u32),
    }
}

impl StereoPeakMeter {
    // not thread-safe
    pub fn prepare_to_play(&mut self, sample_rate: f32) {
        self.falldown_divisor = sample_rate * (FALLDOWN_RATE_MS / 1000.0);
        self.clipping_detection_start_counter =
            (sample_rate * (CLIPPING_DETECTION_WINDOW_MS / 1000.0)) as u32;
        self.zero();
    }

    // not thread-safe
    pub fn zero(&mut self) {
        self.levels = [0.0; 2];
        self.smoothed_levels = [0.0; 2];
        self.prev_levels = [0.0; 2];
        self.falldown_steps = [0.0; 2];
        self.clipping_detection_counter = 0;
        self.clipping_counter_atomic.store(0, Ordering::Relaxed);
        self.snapshot
            .store(pack_snapshot(PeakSnapshot::default()), Ordering::Relaxed);
    }

    // not thread-safe; `frames` is interleaved stereo
    pub fn add_buffer(&mut self, frames: &[f32]) {
        for frame in frames.chunks_exact(2) {
            let mut clipped = false;
            for (ch, &sample) in frame.iter().enumerate() {
                let abs = sample.abs();
                if abs > self.levels[ch] {
                    self.levels[ch] = abs;
                    self.falldown_steps[ch] = abs / self.falldown_divisor;
                } else {
                    self.levels[ch] = (self.levels[ch] - self.falldown_steps[ch]).max(0.0);
                }
                if abs > 1.0 {
                    clipped = true;
                }
            }

            if clipped {
                self.clipping_detection_counter = self.clipping_detection_start_counter;
            } else if self.clipping_detection_counter != 0 {
                self.clipping_detection_counter -= 1;
            }

            for ch in 0..2 {
                let result = self.prev_levels[ch]
                    + SMOOTHING_AMOUNT * (self.levels[ch] - self.prev_levels[ch]);
                self.prev_levels[ch] = result;
                self.smoothed_levels[ch] = result;
            }
        }

        self.snapshot.store(
            pack_snapshot(PeakSnapshot {
                left: self.smoothed_levels[0],
                right: self.smoothed_levels[1],
            }),
            Ordering::Relaxed,
        );
        self.clipping_counter_atomic
            .store(self.clipping_detection_counter, Ordering::Relaxed);
    }

    // not thread-safe
    pub fn silent(&self) -> bool {
        self.levels == [0.0; 2]
    }

    // thread-safe
    pub fn snapshot(&self) -> PeakSnapshot {
        unpack_snapshot(self.snapshot.load(Ordering::Relaxed))
    }

    // thread-safe
    pub fn did_clip_recently(&self) -> bool {
        self.clipping_counter_atomic.load(Ordering::Relaxed) != 0
    }
}
