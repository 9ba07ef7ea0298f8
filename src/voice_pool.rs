//! Fixed-size voice pool: allocation, stealing and block fan-out.
//!
//! The pool owns 64 voice slots and one scratch buffer per slot. A soft cap
//! of 32 simultaneously active voices smooths out stealing under load: once
//! the cap is hit, the oldest non-fading voice gets a 10 ms fade-out. Only
//! when every slot is genuinely busy does the allocator terminate a voice
//! outright, and then it picks the quietest of the oldest quarter so a
//! still-loud note is never audibly truncated.
//!
//! Per block the pool renders every active voice - optionally in parallel on
//! a host-provided task pool, each task touching disjoint state - then mixes
//! voice buffers into per-layer buffers and publishes GUI markers.

use std::sync::atomic::{AtomicI16, AtomicU32, Ordering};

use crate::constants::{
    MAX_ACTIVE_VOICES, NUM_LAYERS, NUM_VOICES, VOICE_STEAL_FADE_MS,
};
use crate::dsp::math::{fast_rand, fast_rand_seed_from_time};
use crate::smoothing::SmoothedValueSystem;
use crate::sync::swap_buffer::AtomicSwapBuffer;
use crate::types::MidiChannelNote;
use crate::voice::{
    Voice, VoiceController, VoiceEnvelopeMarker, VoiceStartParams, VoiceWaveformMarker,
};

/// Optional host-provided pool for parallel voice rendering. `request_exec`
/// must run `tasks.run(i)` for every `i` in `0..num_tasks` (on any threads)
/// and return true once all have completed; returning false makes the caller
/// fall back to serial processing.
pub trait AudioThreadPool {
    fn request_exec(&self, tasks: &VoiceTasks, num_tasks: u32) -> bool;
}

/// One block's worth of per-voice render work, splittable across threads.
pub struct VoiceTasks<'a> {
    voices: *mut Voice,
    buffers: *mut Vec<f32>,
    master: &'a SmoothedValueSystem,
    controllers: [&'a VoiceController; NUM_LAYERS],
    num_frames: u32,
    sample_rate: f32,
}

// Safety: each task index addresses a disjoint voice slot and scratch
// buffer; the shared references are read-only.
unsafe impl Send for VoiceTasks<'_> {}
unsafe impl Sync for VoiceTasks<'_> {}

impl VoiceTasks<'_> {
    pub fn run(&self, task_index: u32) {
        debug_assert!((task_index as usize) < NUM_VOICES);
        // Safety: disjoint per-index state, see above.
        let voice = unsafe { &mut *self.voices.add(task_index as usize) };
        if !voice.is_active {
            return;
        }
        let buffer = unsafe { &mut *self.buffers.add(task_index as usize) };
        let controller = self.controllers[voice.layer_index];
        let result = voice.process_block(
            self.num_frames,
            buffer.as_mut_slice(),
            self.master,
            controller,
            self.sample_rate,
        );
        voice.written_to_buffer_this_block = result.wrote_any;
        voice.pending_termination = result.finished;
    }
}

pub struct VoicePool {
    pub voices: Vec<Voice>,
    buffer_pool: Vec<Vec<f32>>,
    layer_buffers: Vec<Vec<f32>>,

    voice_age_counter: u64,
    voice_id_counter: u16,
    sample_rate: f32,
    random_seed: u32,

    pub num_active_voices: AtomicU32,
    pub voices_per_midi_note_for_gui: [AtomicI16; 128],

    waveform_markers_for_gui: AtomicSwapBuffer<[VoiceWaveformMarker; NUM_VOICES]>,
    vol_env_markers_for_gui: AtomicSwapBuffer<[VoiceEnvelopeMarker; NUM_VOICES]>,
    fil_env_markers_for_gui: AtomicSwapBuffer<[VoiceEnvelopeMarker; NUM_VOICES]>,
}

impl Default for VoicePool {
    fn default() -> Self {
        Self::new()
    }
}

impl VoicePool {
    pub fn new() -> Self {
        let mut seed = fast_rand_seed_from_time();
        let voices = (0..NUM_VOICES)
            .map(|index| Voice::new(index as u8, fast_rand(&mut seed)))
            .collect();
        Self {
            voices,
            buffer_pool: Vec::new(),
            layer_buffers: Vec::new(),
            voice_age_counter: 0,
            voice_id_counter: 0,
            sample_rate: 0.0,
            random_seed: seed,
            num_active_voices: AtomicU32::new(0),
            voices_per_midi_note_for_gui: [(); 128].map(|_| AtomicI16::new(0)),
            waveform_markers_for_gui: AtomicSwapBuffer::new(
                [VoiceWaveformMarker::default(); NUM_VOICES],
            ),
            vol_env_markers_for_gui: AtomicSwapBuffer::new(
                [VoiceEnvelopeMarker::default(); NUM_VOICES],
            ),
            fil_env_markers_for_gui: AtomicSwapBuffer::new(
                [VoiceEnvelopeMarker::default(); NUM_VOICES],
            ),
        }
    }

    pub fn prepare_to_play(&mut self, sample_rate: f32, max_block_size: u32) {
        self.sample_rate = sample_rate;
        self.buffer_pool = (0..NUM_VOICES)
            .map(|_| vec![0.0; max_block_size as usize * 2])
            .collect();
        self.layer_buffers = (0..NUM_LAYERS)
            .map(|_| vec![0.0; max_block_size as usize * 2])
            .collect();
        for voice in &mut self.voices {
            voice.prepare_to_play(sample_rate);
        }
    }

    pub fn random_phase(&mut self) -> u32 {
        fast_rand(&mut self.random_seed).wrapping_mul(1 << 17)
    }

    /// Allocate a slot and start a note on it.
    pub fn start_voice(
        &mut self,
        controller: &VoiceController,
        params: VoiceStartParams,
        master: &SmoothedValueSystem,
    ) {
        let voice_index = self.find_voice();
        let age = self.voice_age_counter;
        self.voice_age_counter += 1;
        let id = self.voice_id_counter;
        self.voice_id_counter = self.voice_id_counter.wrapping_add(1);

        let pan_value = master.value(
            controller.pan_pos_smoother_id,
            params
                .num_frames_before_starting
                .min(master.max_block_size().saturating_sub(1)),
        );

        let note = params.note_num as usize;
        self.voices[voice_index].start(
            controller,
            &params,
            self.sample_rate,
            age,
            id,
            pan_value,
        );
        self.num_active_voices.fetch_add(1, Ordering::Relaxed);
        self.voices_per_midi_note_for_gui[note].fetch_add(1, Ordering::Relaxed);
    }

    fn fade_out_voices_to_ensure_max_active(&mut self) {
        if self.num_active_voices.load(Ordering::Relaxed) < MAX_ACTIVE_VOICES as u32 {
            return;
        }
        let mut oldest_age = u64::MAX;
        let mut oldest_index = None;
        for (index, voice) in self.voices.iter().enumerate() {
            if voice.is_active && !voice.volume_fade.is_fading_out() && voice.age < oldest_age {
                oldest_age = voice.age;
                oldest_index = Some(index);
            }
        }
        if let Some(index) = oldest_index {
            self.voices[index]
                .volume_fade
                .set_as_fade_out(self.sample_rate, VOICE_STEAL_FADE_MS);
        }
    }

    /// The allocation policy: prefer silence, then fading, then sacrifice
    /// the quietest of the oldest quarter.
    fn find_voice(&mut self) -> usize {
        self.fade_out_voices_to_ensure_max_active();

        for (index, voice) in self.voices.iter().enumerate() {
            if !voice.is_active {
                return index;
            }
        }

        let mut indexes = [0usize; NUM_VOICES];
        for (slot, index) in indexes.iter_mut().zip(0..NUM_VOICES) {
            *slot = index;
        }
        indexes.sort_unstable_by_key(|&i| self.voices[i].age);

        let mut quietest_gain = f32::MAX;
        let mut quietest_index = indexes[0];
        for &index in indexes.iter().take(NUM_VOICES / 4) {
            if self.voices[index].current_gain < quietest_gain {
                quietest_gain = self.voices[index].current_gain;
                quietest_index = index;
            }
        }

        self.end_voice_instantly(quietest_index);
        quietest_index
    }

    /// Synchronous termination with counter bookkeeping.
    pub fn end_voice_instantly(&mut self, voice_index: usize) {
        let voice = &mut self.voices[voice_index];
        debug_assert!(voice.is_active);
        if !voice.is_active {
            return;
        }
        self.num_active_voices.fetch_sub(1, Ordering::Relaxed);
        self.voices_per_midi_note_for_gui[voice.note_num as usize]
            .fetch_sub(1, Ordering::Relaxed);
        voice.reset_to_inactive();
    }

    pub fn end_all_voices_instantly(&mut self) {
        for index in 0..NUM_VOICES {
            if self.voices[index].is_active {
                self.end_voice_instantly(index);
            }
        }
    }

    /// Release every active voice of a layer matching `note`.
    pub fn note_off(&mut self, layer_index: usize, note: MidiChannelNote) {
        for voice in &mut self.voices {
            if voice.is_active
                && voice.layer_index == layer_index
                && voice.midi_key_trigger == note
            {
                voice.end();
            }
        }
    }

    pub fn for_each_active_voice(&mut self, mut f: impl FnMut(&mut Voice)) {
        if self.num_active_voices.load(Ordering::Relaxed) == 0 {
            return;
        }
        for voice in &mut self.voices {
            if voice.is_active {
                f(voice);
            }
        }
    }

    pub fn for_each_active_layer_voice(
        &mut self,
        layer_index: usize,
        mut f: impl FnMut(&mut Voice),
    ) {
        if self.num_active_voices.load(Ordering::Relaxed) == 0 {
            return;
        }
        for voice in &mut self.voices {
            if voice.is_active && voice.layer_index == layer_index {
                f(voice);
            }
        }
    }

    /// Render all active voices and mix them into per-layer buffers.
    /// Returns which layers received any audio.
    pub fn process_voices(
        &mut self,
        num_frames: u32,
        master: &SmoothedValueSystem,
        controllers: [&VoiceController; NUM_LAYERS],
        host_pool: Option<&dyn AudioThreadPool>,
    ) -> [bool; NUM_LAYERS] {
        let mut layers_written = [false; NUM_LAYERS];
        let num_samples = num_frames as usize * 2;

        if self.num_active_voices.load(Ordering::Relaxed) == 0 {
            for buffer in &mut self.layer_buffers {
                buffer[..num_samples].fill(0.0);
            }
            self.publish_markers(controllers);
            return layers_written;
        }

        for voice in &mut self.voices {
            voice.written_to_buffer_this_block = false;
            voice.pending_termination = false;
        }

        let mut processed_in_parallel = false;
        {
            let tasks = VoiceTasks {
                voices: self.voices.as_mut_ptr(),
                buffers: self.buffer_pool.as_mut_ptr(),
                master,
                controllers,
                num_frames,
                sample_rate: self.sample_rate,
            };
            if let Some(pool) = host_pool {
                processed_in_parallel = pool.request_exec(&tasks, NUM_VOICES as u32);
            }
            if !processed_in_parallel {
                for index in 0..NUM_VOICES as u32 {
                    tasks.run(index);
                }
            }
        }

        for index in 0..NUM_VOICES {
            if self.voices[index].pending_termination {
                self.voices[index].pending_termination = false;
                self.end_voice_instantly(index);
            }
        }

        for buffer in &mut self.layer_buffers {
            buffer[..num_samples].fill(0.0);
        }
        for (index, voice) in self.voices.iter().enumerate() {
            if !voice.written_to_buffer_this_block {
                continue;
            }
            let layer = voice.layer_index;
            let source = &self.buffer_pool[index][..num_samples];
            let target = &mut self.layer_buffers[layer][..num_samples];
            for (out, sample) in target.iter_mut().zip(source) {
                *out += sample;
            }
            layers_written[layer] = true;
        }

        self.publish_markers(controllers);
        layers_written
    }

    fn publish_markers(&mut self, controllers: [&VoiceController; NUM_LAYERS]) {
        {
            let markers = self.waveform_markers_for_gui.write();
            for (index, voice) in self.voices.iter().enumerate() {
                markers[index] = if voice.written_to_buffer_this_block {
                    voice.waveform_marker()
                } else {
                    VoiceWaveformMarker::default()
                };
            }
        }
        {
            let markers = self.vol_env_markers_for_gui.write();
            for (index, voice) in self.voices.iter().enumerate() {
                markers[index] = if voice.written_to_buffer_this_block {
                    voice.vol_env_marker(controllers[voice.layer_index])
                } else {
                    VoiceEnvelopeMarker::default()
                };
            }
        }
        {
            let markers = self.fil_env_markers_for_gui.write();
            for (index, voice) in self.voices.iter().enumerate() {
                markers[index] = if voice.written_to_buffer_this_block {
                    voice.fil_env_marker(controllers[voice.layer_index])
                } else {
                    VoiceEnvelopeMarker::default()
                };
            }
        }
        self.waveform_markers_for_gui.publish();
        self.vol_env_markers_for_gui.publish();
        self.fil_env_markers_for_gui.publish();
    }

    pub fn reset_markers(&mut self) {
        *self.waveform_markers_for_gui.write() = [VoiceWaveformMarker::default(); NUM_VOICES];
        *self.vol_env_markers_for_gui.write() = [VoiceEnvelopeMarker::default(); NUM_VOICES];
        *self.fil_env_markers_for_gui.write() = [VoiceEnvelopeMarker::default(); NUM_VOICES];
        self.waveform_markers_for_gui.publish();
        self.vol_env_markers_for_gui.publish();
        self.fil_env_markers_for_gui.publish();
    }

    pub fn layer_buffer(&self, layer_index: usize, num_frames: u32) -> &[f32] {
        &self.layer_buffers[layer_index][..num_frames as usize * 2]
    }

    pub fn layer_buffer_mut(&mut self, layer_index: usize, num_frames: u32) -> &mut [f32] {
        &mut self.layer_buffers[layer_index][..num_frames as usize * 2]
    }

    // GUI-side reads.
    pub fn waveform_markers(&self) -> [VoiceWaveformMarker; NUM_VOICES] {
        self.waveform_markers_for_gui.read()
    }

    pub fn vol_env_markers(&self) -> [VoiceEnvelopeMarker; NUM_VOICES] {
        self.vol_env_markers_for_gui.read()
    }

    pub fn voices_for_note(&self, note: u8) -> i16 {
        self.voices_per_midi_note_for_gui[note as usize].load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_BLOCK_SIZE;
    use crate::types::MidiChannelNote;
    use crate::voice::{VoiceStartInstrument, WaveformStart, WaveformType};

    struct Rig {
        pool: VoicePool,
        master: SmoothedValueSystem,
        controller: VoiceController,
    }

    fn rig() -> Rig {
        let mut master = SmoothedValueSystem::new();
        let pan_id = master.create_smoother();
        let mut controller = VoiceController::new(0, pan_id);
        // Give the volume envelope sane, fast settings.
        let sample_rate = 48000.0;
        controller.vol_env.set_attack_samples(0.001 * sample_rate, 2.0);
        controller.vol_env.set_sustain_amp(1.0);
        controller.vol_env.set_decay_samples(0.01 * sample_rate, 0.1);
        controller.vol_env.set_release_samples(0.02 * sample_rate, 0.1);
        controller.fil_env.set_attack_samples(0.001 * sample_rate, 2.0);
        controller.fil_env.set_sustain_amp(1.0);
        controller.fil_env.set_decay_samples(0.01 * sample_rate, 0.1);
        controller.fil_env.set_release_samples(0.02 * sample_rate, 0.1);

        master.prepare_to_play(DEFAULT_BLOCK_SIZE, sample_rate);
        let mut pool = VoicePool::new();
        pool.prepare_to_play(sample_rate, DEFAULT_BLOCK_SIZE);
        Rig {
            pool,
            master,
            controller,
        }
    }

    fn sine_note(note: u8) -> VoiceStartParams {
        VoiceStartParams {
            initial_pitch: 0.0,
            midi_key_trigger: MidiChannelNote { channel: 0, note },
            note_num: note,
            note_vel: 0.8,
            lfo_start_phase: 0,
            num_frames_before_starting: 0,
            instrument: VoiceStartInstrument::Waveform(WaveformStart {
                kind: WaveformType::Sine,
                amp: 1.0,
            }),
        }
    }

    fn process_block(rig: &mut Rig, num_frames: u32) -> [bool; NUM_LAYERS] {
        rig.master.process_block(num_frames);
        let controller_refs = [&rig.controller; NUM_LAYERS];
        rig.pool
            .process_voices(num_frames, &rig.master, controller_refs, None)
    }

    #[test]
    fn note_on_produces_audible_output_within_one_block() {
        let mut rig = rig();
        rig.pool
            .start_voice(&rig.controller, sine_note(60), &rig.master);
        let written = process_block(&mut rig, 512);
        assert!(written[0]);

        let buffer = rig.pool.layer_buffer(0, 512);
        let peak = buffer.iter().fold(0.0f32, |a, &b| a.max(b.abs()));
        assert!(peak > 0.01, "voice inaudible, peak {}", peak);
    }

    #[test]
    fn voices_per_note_counter_tracks_lifecycle() {
        let mut rig = rig();
        rig.pool
            .start_voice(&rig.controller, sine_note(64), &rig.master);
        rig.pool
            .start_voice(&rig.controller, sine_note(64), &rig.master);
        assert_eq!(rig.pool.voices_for_note(64), 2);

        rig.pool
            .note_off(0, MidiChannelNote { channel: 0, note: 64 });
        // Run until the release (20ms = 960 frames) finishes.
        for _ in 0..10 {
            process_block(&mut rig, 512);
        }
        assert_eq!(rig.pool.voices_for_note(64), 0);
        assert_eq!(rig.pool.num_active_voices.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn soft_cap_fades_the_oldest_voice() {
        let mut rig = rig();
        for i in 0..MAX_ACTIVE_VOICES as u8 {
            rig.pool
                .start_voice(&rig.controller, sine_note(30 + i), &rig.master);
        }
        assert!(!rig.pool.voices[0].volume_fade.is_fading_out());

        // One over the soft cap: the oldest (first started) voice fades.
        rig.pool
            .start_voice(&rig.controller, sine_note(100), &rig.master);
        assert!(rig.pool.voices[0].volume_fade.is_fading_out());
        assert_eq!(
            rig.pool.num_active_voices.load(Ordering::Relaxed),
            MAX_ACTIVE_VOICES as u32 + 1
        );
    }

    #[test]
    fn faded_voice_is_silent_after_ten_milliseconds() {
        let mut rig = rig();
        for i in 0..=MAX_ACTIVE_VOICES as u8 {
            rig.pool
                .start_voice(&rig.controller, sine_note(30 + i), &rig.master);
        }
        // 480 frames at 48kHz = 10ms; run a little over.
        process_block(&mut rig, 512);
        // The faded voice terminated once its fade reached silence.
        assert!(
            !rig.pool.voices[0].is_active,
            "stolen voice still active after fade"
        );
        assert_eq!(
            rig.pool.num_active_voices.load(Ordering::Relaxed),
            MAX_ACTIVE_VOICES as u32
        );
    }

    #[test]
    fn full_pool_steals_instantly_and_never_exceeds_capacity() {
        let mut rig = rig();
        for i in 0..NUM_VOICES {
            rig.pool
                .start_voice(&rig.controller, sine_note((i % 120) as u8), &rig.master);
        }
        assert_eq!(
            rig.pool.num_active_voices.load(Ordering::Relaxed),
            NUM_VOICES as u32
        );
        rig.pool
            .start_voice(&rig.controller, sine_note(120), &rig.master);
        assert_eq!(
            rig.pool.num_active_voices.load(Ordering::Relaxed),
            NUM_VOICES as u32
        );
    }

    #[test]
    fn parallel_and_serial_processing_agree() {
        struct InlinePool;
        impl AudioThreadPool for InlinePool {
            fn request_exec(&self, tasks: &VoiceTasks, num_tasks: u32) -> bool {
                // Spread the work across a couple of real threads.
                std::thread::scope(|scope| {
                    let mid = num_tasks / 2;
                    scope.spawn(move || {
                        for i in 0..mid {
                            tasks.run(i);
                        }
                    });
                    scope.spawn(move || {
                        for i in mid..num_tasks {
                            tasks.run(i);
                        }
                    });
                });
                true
            }
        }

        let mut serial = rig();
        let mut parallel = rig();
        for r in [&mut serial, &mut parallel] {
            r.pool.start_voice(&r.controller, sine_note(60), &r.master);
            r.pool.start_voice(&r.controller, sine_note(67), &r.master);
        }

        serial.master.process_block(256);
        parallel.master.process_block(256);
        let serial_controllers = [&serial.controller; NUM_LAYERS];
        let parallel_controllers = [&parallel.controller; NUM_LAYERS];
        serial
            .pool
            .process_voices(256, &serial.master, serial_controllers, None);
        parallel.pool.process_voices(
            256,
            &parallel.master,
            parallel_controllers,
            Some(&InlinePool),
        );

        let a = serial.pool.layer_buffer(0, 256);
        let b = parallel.pool.layer_buffer(0, 256);
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn delayed_note_start_is_sample_accurate() {
        let mut rig = rig();
        let mut params = sine_note(60);
        params.num_frames_before_starting = 100;
        rig.pool.start_voice(&rig.controller, params, &rig.master);
        process_block(&mut rig, 512);

        let buffer = rig.pool.layer_buffer(0, 512);
        for frame in 0..100 {
            assert_eq!(buffer[frame * 2], 0.0, "audio before the start offset");
        }
        let peak_after: f32 = buffer[200..]
            .iter()
            .fold(0.0f32, |a, &b| a.max(b.abs()));
        assert!(peak_after > 0.001);
    }
}
