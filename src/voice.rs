//! A voice is the run-time playback allocation for a single note: up to four
//! contributing sample streams, a volume and a filter envelope, an LFO, a
//! state-variable filter and a handful of per-voice smoothers.
//!
//! Voices process audio in fixed 64-frame chunks. Per chunk the smoothers
//! advance, the LFO buffer fills, sample data sums into a stack buffer, and
//! the envelope/fade/pan/filter stages run in order. All buffers are stack
//! or pool allocated; nothing here touches the heap.

use std::ptr::NonNull;

use crate::constants::{MAX_VOICE_SAMPLES, VOICE_CHUNK_FRAMES, VOICE_SMOOTHING_MS, VOICE_START_FADE_MS};
use crate::dsp::adsr::{Adsr, AdsrState};
use crate::dsp::lfo::{Lfo, LfoWaveform};
use crate::dsp::math::{
    db_to_amp, fast_rand, midi_note_to_hz, sin_turns, OnePoleLowPass,
};
use crate::dsp::random_lfo::{RandomLfo, RandomLfoStyle};
use crate::dsp::svf::{self, SvfCoeffs, SvfState, SvfType};
use crate::dsp::volume_fade::VolumeFade;
use crate::params::{LfoDestination, LfoShapeParam, LoopModeParam};
use crate::sample_playback::{
    correct_loop_flags_if_needed, increment_playback_pos, loop_flags, sample_get_data,
};
use crate::samplib::loader::InstrumentHandle;
use crate::samplib::{
    create_bounds_checked_loop, AudioData, CheckedLoop, LoopMode, Region,
};
use crate::smoothing::{DoubleId, FloatId, SmoothedValueSystem};
use crate::types::MidiChannelNote;

const LFO_LOWPASS_SMOOTHING: f32 = 0.9;
/// Arbitrary scale keeping the sine waveform level in line with sampled
/// material. Must stay fixed for patch compatibility.
const SINE_SCALE: f32 = 0.2;
const NOISE_SCALE: f32 = 0.5 * 0.2;

/// Audio-thread data shared by every voice of a layer; the layer mutates it
/// on parameter changes and voices read it each chunk.
pub struct VoiceController {
    pub layer_index: usize,
    pub velocity_volume_modifier: f32,

    pub lfo_on: bool,
    pub lfo_shape: LfoShapeParam,
    pub lfo_destination: LfoDestination,
    pub lfo_amount: f32,
    pub lfo_time_hz: f32,

    /// Custom loop points as fractions of the file.
    pub loop_start: f32,
    pub loop_end: f32,
    pub loop_crossfade: f32,
    pub loop_mode: LoopModeParam,
    pub reverse: bool,

    pub tune_semitones: f32,
    /// Slot in the engine-wide smoothing system; -1..1.
    pub pan_pos_smoother_id: FloatId,

    pub sv_filter_cutoff_linear: f32,
    pub sv_filter_resonance: f32,
    pub filter_type: SvfType,
    pub filter_on: bool,

    pub vol_env_on: bool,
    pub vol_env: crate::dsp::adsr::AdsrParams,
    pub fil_env: crate::dsp::adsr::AdsrParams,
    pub fil_env_amount: f32,

    pub no_key_tracking: bool,
}

impl VoiceController {
    pub fn new(layer_index: usize, pan_pos_smoother_id: FloatId) -> Self {
        Self {
            layer_index,
            velocity_volume_modifier: 0.5,
            lfo_on: false,
            lfo_shape: LfoShapeParam::Sine,
            lfo_destination: LfoDestination::Volume,
            lfo_amount: 0.0,
            lfo_time_hz: 1.0,
            loop_start: 0.0,
            loop_end: 1.0,
            loop_crossfade: 0.0,
            loop_mode: LoopModeParam::InstrumentDefault,
            reverse: false,
            tune_semitones: 0.0,
            pan_pos_smoother_id,
            sv_filter_cutoff_linear: 1.0,
            sv_filter_resonance: 0.0,
            filter_type: SvfType::Lowpass,
            filter_on: false,
            vol_env_on: true,
            vol_env: Default::default(),
            fil_env: Default::default(),
            fil_env_amount: 0.0,
            no_key_tracking: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveformType {
    Sine,
    WhiteNoiseMono,
    WhiteNoiseStereo,
}

/// One stream within a voice.
pub enum Generator {
    Sampler {
        region: NonNull<Region>,
        data: NonNull<AudioData>,
        loop_points: Option<CheckedLoop>,
        loop_and_reverse_flags: u32,
    },
    Waveform {
        kind: WaveformType,
    },
}

// Safety: the raw region/audio pointers target loader-owned allocations
// kept alive by the owning voice's instrument retain.
unsafe impl Send for VoiceSample {}
unsafe impl Sync for VoiceSample {}

pub struct VoiceSample {
    pub is_active: bool,
    pitch_ratio_smoother_id: DoubleId,
    xfade_vol_smoother_id: FloatId,
    /// Frame position for samplers, phase in turns for waveforms.
    pub pos: f64,
    pub amp: f32,
    pub generator: Generator,
}

impl VoiceSample {
    fn new(smoothing: &mut SmoothedValueSystem) -> Self {
        Self {
            is_active: false,
            pitch_ratio_smoother_id: smoothing.create_double_smoother(),
            xfade_vol_smoother_id: smoothing.create_smoother(),
            pos: 0.0,
            amp: 1.0,
            generator: Generator::Waveform {
                kind: WaveformType::Sine,
            },
        }
    }

    fn region(&self) -> Option<&Region> {
        match &self.generator {
            // Safety: the voice retains its instrument until it terminates.
            Generator::Sampler { region, .. } => Some(unsafe { region.as_ref() }),
            Generator::Waveform { .. } => None,
        }
    }

    fn audio(&self) -> Option<&AudioData> {
        match &self.generator {
            Generator::Sampler { data, .. } => Some(unsafe { data.as_ref() }),
            Generator::Waveform { .. } => None,
        }
    }
}

/// Sampler start info for one region.
#[derive(Clone, Copy)]
pub struct SamplerRegionStart {
    pub region_index: usize,
    pub amp: f32,
}

pub struct SamplerStart {
    pub handle: InstrumentHandle,
    pub regions: [SamplerRegionStart; MAX_VOICE_SAMPLES],
    pub num_regions: usize,
    pub initial_sample_offset_01: f32,
    pub initial_timbre_01: f32,
}

pub struct WaveformStart {
    pub kind: WaveformType,
    pub amp: f32,
}

pub enum VoiceStartInstrument {
    Sampler(SamplerStart),
    Waveform(WaveformStart),
}

pub struct VoiceStartParams {
    pub initial_pitch: f32,
    pub midi_key_trigger: MidiChannelNote,
    pub note_num: u8,
    pub note_vel: f32,
    pub lfo_start_phase: u32,
    pub num_frames_before_starting: u32,
    pub instrument: VoiceStartInstrument,
}

/// Published once per block for GUI drawing.
#[derive(Debug, Clone, Copy, Default)]
pub struct VoiceWaveformMarker {
    pub layer_index: u8,
    pub position: u16,
    pub intensity: u16,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VoiceEnvelopeMarker {
    pub on: bool,
    pub layer_index: u8,
    pub state: u8,
    pub pos: u16,
    pub sustain_level: u16,
    pub id: u16,
}

pub struct Voice {
    pub smoothing: SmoothedValueSystem,

    pub is_active: bool,
    pub written_to_buffer_this_block: bool,
    /// Set by block processing when the voice ran out mid-block; the pool
    /// terminates it after the parallel fan-out completes.
    pub pending_termination: bool,
    pub layer_index: usize,
    pub age: u64,
    pub id: u16,
    pub index: u8,
    pub frames_before_starting: u32,
    pub current_gain: f32,

    pub num_active_voice_samples: u8,
    pub voice_samples: [VoiceSample; MAX_VOICE_SAMPLES],

    filter_changed: bool,
    filter_coeffs: SvfCoeffs,
    filters: SvfState,
    filter_mix_smoother_id: FloatId,
    sv_filter_cutoff_smoother_id: FloatId,
    sv_filter_resonance_smoother_id: FloatId,

    pub note_num: u8,
    pub midi_key_trigger: MidiChannelNote,

    pub lfo: Lfo,
    random_lfo: RandomLfo,
    lfo_smoother: OnePoleLowPass,

    pub volume_fade: VolumeFade,
    pub vol_env: Adsr,
    pub fil_env: Adsr,
    amp_l: f32,
    amp_r: f32,
    pub aftertouch_multiplier: f32,

    instrument_retain: Option<InstrumentHandle>,
    noise_rng: u32,

    // Latest GUI marker values; the pool publishes them.
    pub waveform_position_01: f32,
}

pub struct VoiceBlockResult {
    pub wrote_any: bool,
    pub finished: bool,
}

impl Voice {
    pub fn new(index: u8, random_seed: u32) -> Self {
        let mut smoothing = SmoothedValueSystem::new();
        let voice_samples =
            [(); MAX_VOICE_SAMPLES].map(|_| VoiceSample::new(&mut smoothing));
        let filter_mix_smoother_id = smoothing.create_smoother();
        let sv_filter_cutoff_smoother_id = smoothing.create_smoother();
        let sv_filter_resonance_smoother_id = smoothing.create_smoother();

        Self {
            smoothing,
            is_active: false,
            written_to_buffer_this_block: false,
            pending_termination: false,
            layer_index: 0,
            age: u64::MAX,
            id: 0,
            index,
            frames_before_starting: 0,
            current_gain: 0.0,
            num_active_voice_samples: 0,
            voice_samples,
            filter_changed: false,
            filter_coeffs: SvfCoeffs::default(),
            filters: SvfState::default(),
            filter_mix_smoother_id,
            sv_filter_cutoff_smoother_id,
            sv_filter_resonance_smoother_id,
            note_num: 0,
            midi_key_trigger: MidiChannelNote::default(),
            lfo: Lfo::default(),
            random_lfo: RandomLfo::new(RandomLfoStyle::Perlin, random_seed),
            lfo_smoother: OnePoleLowPass::default(),
            volume_fade: VolumeFade::default(),
            vol_env: Adsr::default(),
            fil_env: Adsr::default(),
            amp_l: 1.0,
            amp_r: 1.0,
            aftertouch_multiplier: 1.0,
            instrument_retain: None,
            noise_rng: random_seed.wrapping_mul(0x9E3779B9) | 1,
            waveform_position_01: 0.0,
        }
    }

    pub fn prepare_to_play(&mut self, sample_rate: f32) {
        self.smoothing
            .prepare_to_play(VOICE_CHUNK_FRAMES as u32, sample_rate);
    }

    // -----------------------------------------------------------------------
    // Controller-driven updates

    pub fn update_lfo_waveform(&mut self, controller: &VoiceController) {
        match controller.lfo_shape {
            LfoShapeParam::Sine => self.set_table_waveform(LfoWaveform::Sine),
            LfoShapeParam::Triangle => self.set_table_waveform(LfoWaveform::Triangle),
            LfoShapeParam::Sawtooth => self.set_table_waveform(LfoWaveform::Sawtooth),
            LfoShapeParam::Square => self.set_table_waveform(LfoWaveform::Square),
            LfoShapeParam::RandomSmooth => self.random_lfo.set_style(RandomLfoStyle::Perlin),
            LfoShapeParam::RandomStep => {
                self.random_lfo.set_style(RandomLfoStyle::SampleAndHold)
            }
        }
    }

    fn set_table_waveform(&mut self, waveform: LfoWaveform) {
        if waveform != self.lfo.waveform {
            self.lfo.set_waveform(waveform);
        }
    }

    pub fn update_lfo_time(&mut self, controller: &VoiceController, sample_rate: f32) {
        self.lfo.set_rate(sample_rate, controller.lfo_time_hz);
        self.random_lfo.set_rate(sample_rate, controller.lfo_time_hz);
    }

    pub fn set_filter_on(&mut self, on: bool) {
        self.smoothing.set(
            self.filter_mix_smoother_id,
            if on { 1.0 } else { 0.0 },
            VOICE_SMOOTHING_MS,
        );
    }

    pub fn set_filter_cutoff(&mut self, cutoff01: f32) {
        self.filter_changed = true;
        self.smoothing.set(
            self.sv_filter_cutoff_smoother_id,
            cutoff01,
            VOICE_SMOOTHING_MS,
        );
    }

    pub fn set_filter_res(&mut self, resonance: f32) {
        self.filter_changed = true;
        self.smoothing.set(
            self.sv_filter_resonance_smoother_id,
            resonance,
            VOICE_SMOOTHING_MS,
        );
    }

    fn calculate_pitch_ratio(
        &self,
        note: i32,
        sample_index: usize,
        pitch: f32,
        sample_rate: f32,
    ) -> f64 {
        let sample = &self.voice_samples[sample_index];
        match &sample.generator {
            Generator::Sampler { region, data, .. } => {
                let source_root = unsafe { region.as_ref() }.root_key as f64;
                let source_sample_rate = unsafe { data.as_ref() }.sample_rate as f64;
                let pitch_delta = ((note as f64 + pitch as f64) - source_root) / 12.0;
                pitch_delta.exp2() * source_sample_rate / sample_rate as f64
            }
            Generator::Waveform { kind } => match kind {
                WaveformType::Sine => {
                    midi_note_to_hz(note as f64 + pitch as f64) / sample_rate as f64
                }
                // Noise has no pitch.
                _ => 1.0,
            },
        }
    }

    pub fn set_voice_pitch(&mut self, controller: &VoiceController, pitch: f32, sample_rate: f32) {
        for i in 0..MAX_VOICE_SAMPLES {
            if !self.voice_samples[i].is_active {
                continue;
            }
            let note = if controller.no_key_tracking && self.voice_samples[i].region().is_some() {
                self.voice_samples[i].region().unwrap().root_key as i32
            } else {
                self.note_num as i32
            };
            let ratio = self.calculate_pitch_ratio(note, i, pitch, sample_rate);
            self.smoothing.set_f64(
                self.voice_samples[i].pitch_ratio_smoother_id,
                ratio,
                VOICE_SMOOTHING_MS,
            );
        }
    }

    /// Drive the per-sample crossfade gains from the timbre knob so that
    /// two overlapping regions sum with equal power.
    pub fn update_xfade(&mut self, knob_pos_01: f32, hard_set: bool) {
        let knob_pos = knob_pos_01 * 99.0;

        let mut overlapping: [Option<usize>; 2] = [None, None];
        for i in 0..MAX_VOICE_SAMPLES {
            if !self.voice_samples[i].is_active {
                continue;
            }
            let Some(region) = self.voice_samples[i].region() else {
                continue;
            };
            let xfade_id = self.voice_samples[i].xfade_vol_smoother_id;
            match region.timbre_layer_range {
                Some(range) => {
                    if knob_pos >= range.start && knob_pos < range.end {
                        // More than two overlapping regions cannot happen by
                        // construction of the region set.
                        if overlapping[0].is_none() {
                            overlapping[0] = Some(i);
                        } else {
                            overlapping[1] = Some(i);
                        }
                    } else {
                        self.set_xfade(xfade_id, 0.0, hard_set);
                    }
                }
                None => self.set_xfade(xfade_id, 1.0, hard_set),
            }
        }

        match overlapping {
            [Some(single), None] => {
                let id = self.voice_samples[single].xfade_vol_smoother_id;
                self.set_xfade(id, 1.0, hard_set);
            }
            [Some(first), Some(second)] => {
                let mut lower = first;
                let mut upper = second;
                let range = |i: usize| self.voice_samples[i].region().unwrap().timbre_layer_range.unwrap();
                if range(second).start < range(first).start {
                    std::mem::swap(&mut lower, &mut upper);
                }
                let overlap_low = range(upper).start;
                let overlap_high = range(lower).end;
                debug_assert!(overlap_high > overlap_low);
                let pos = (knob_pos - overlap_low) / (overlap_high - overlap_low);
                let pos = pos.clamp(0.0, 1.0);
                let lower_id = self.voice_samples[lower].xfade_vol_smoother_id;
                let upper_id = self.voice_samples[upper].xfade_vol_smoother_id;
                self.set_xfade(lower_id, sin_turns((1.0 - pos) * 0.25), hard_set);
                self.set_xfade(upper_id, sin_turns(pos * 0.25), hard_set);
            }
            _ => {}
        }
    }

    fn set_xfade(&mut self, id: FloatId, value: f32, hard_set: bool) {
        debug_assert!((0.0..=1.0).contains(&value));
        if hard_set {
            self.smoothing.hard_set(id, value);
        } else {
            self.smoothing.set(id, value, VOICE_SMOOTHING_MS);
        }
    }

    /// Recompute each sampler stream's normalised loop from the controller
    /// state, keeping flags consistent with the current position.
    pub fn update_loop_info(&mut self, controller: &VoiceController) {
        for sample in &mut self.voice_samples {
            if !sample.is_active {
                continue;
            }
            let Generator::Sampler {
                region,
                data,
                loop_points,
                loop_and_reverse_flags,
            } = &mut sample.generator
            else {
                continue;
            };
            let region = unsafe { region.as_ref() };
            let num_frames = unsafe { data.as_ref() }.num_frames;

            *loop_points = if controller.vol_env_on {
                configure_loop(controller, region, num_frames)
            } else {
                None
            };

            *loop_and_reverse_flags = 0;
            if controller.reverse {
                *loop_and_reverse_flags = loop_flags::CURRENTLY_REVERSED;
            }
            if let Some(checked) = loop_points {
                *loop_and_reverse_flags =
                    correct_loop_flags_if_needed(*loop_and_reverse_flags, checked, sample.pos);
            }
        }
    }

    fn set_equal_pan(&mut self, pan_pos: f32) {
        let angle = pan_pos * 0.125;
        let sin = sin_turns(angle);
        let cos = sin_turns(angle + 0.25);

        let root_2_over_2 = std::f32::consts::SQRT_2 / 2.0;
        let left = root_2_over_2 * (cos - sin);
        let right = root_2_over_2 * (cos + sin);
        debug_assert!(left >= 0.0 && right >= 0.0);

        self.amp_l = left;
        self.amp_r = right;
    }

    // -----------------------------------------------------------------------
    // Lifecycle

    /// Initialise this (inactive) slot for a new note. Smoothers are
    /// hard-set so nothing ramps at note start.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        &mut self,
        controller: &VoiceController,
        params: &VoiceStartParams,
        sample_rate: f32,
        age: u64,
        voice_id: u16,
        pan_value: f32,
    ) {
        debug_assert!(!self.is_active);
        debug_assert!(sample_rate > 0.0);

        self.layer_index = controller.layer_index;
        self.lfo.phase = params.lfo_start_phase;
        self.update_lfo_waveform(controller);
        self.update_lfo_time(controller, sample_rate);
        self.lfo_smoother.reset();

        self.volume_fade
            .force_set_as_fade_in(sample_rate, VOICE_START_FADE_MS);
        self.set_equal_pan(pan_value);
        self.vol_env.reset();
        self.vol_env.gate(true);
        self.fil_env.reset();
        self.fil_env.gate(true);
        self.age = age;
        self.id = voice_id;
        self.midi_key_trigger = params.midi_key_trigger;
        self.note_num = params.note_num;
        self.frames_before_starting = params.num_frames_before_starting;
        self.aftertouch_multiplier = 1.0;
        self.filter_changed = true;
        self.filters.reset();
        self.smoothing.hard_set(
            self.sv_filter_resonance_smoother_id,
            controller.sv_filter_resonance,
        );
        self.smoothing.hard_set(
            self.sv_filter_cutoff_smoother_id,
            controller.sv_filter_cutoff_linear,
        );
        self.smoothing.hard_set(
            self.filter_mix_smoother_id,
            if controller.filter_on { 1.0 } else { 0.0 },
        );

        match &params.instrument {
            VoiceStartInstrument::Sampler(sampler) => {
                sampler.handle.retain();
                self.instrument_retain = Some(sampler.handle);
                let loaded = sampler.handle.loaded();

                self.num_active_voice_samples = sampler.num_regions as u8;
                for i in 0..sampler.num_regions {
                    let start = &sampler.regions[i];
                    let region: &Region = &loaded.instrument.regions[start.region_index];
                    let audio: &AudioData = loaded.audio_for_region(start.region_index);

                    let sample = &mut self.voice_samples[i];
                    sample.is_active = true;
                    sample.amp = start.amp * db_to_amp(region.gain_db);
                    sample.generator = Generator::Sampler {
                        region: NonNull::from(region),
                        data: NonNull::from(audio),
                        loop_points: None,
                        loop_and_reverse_flags: 0,
                    };

                    let offset = (sampler.initial_sample_offset_01
                        * (audio.num_frames.saturating_sub(1)) as f32)
                        as f64;
                    sample.pos = offset;
                    if controller.reverse {
                        sample.pos = audio.num_frames as f64 - offset.max(1.0);
                    }

                    let note = if controller.no_key_tracking {
                        region.root_key as i32
                    } else {
                        self.note_num as i32
                    };
                    let ratio =
                        self.calculate_pitch_ratio(note, i, params.initial_pitch, sample_rate);
                    self.smoothing.hard_set_f64(
                        self.voice_samples[i].pitch_ratio_smoother_id,
                        ratio,
                    );
                }
                for i in sampler.num_regions..MAX_VOICE_SAMPLES {
                    self.voice_samples[i].is_active = false;
                }

                self.update_loop_info(controller);
                self.update_xfade(sampler.initial_timbre_01, true);
            }
            VoiceStartInstrument::Waveform(waveform) => {
                self.instrument_retain = None;
                self.num_active_voice_samples = 1;
                for i in 1..MAX_VOICE_SAMPLES {
                    self.voice_samples[i].is_active = false;
                }
                let sample = &mut self.voice_samples[0];
                sample.is_active = true;
                sample.amp = waveform.amp;
                sample.pos = 0.0;
                sample.generator = Generator::Waveform {
                    kind: waveform.kind,
                };
                let ratio = self.calculate_pitch_ratio(
                    self.note_num as i32,
                    0,
                    params.initial_pitch,
                    sample_rate,
                );
                self.smoothing
                    .hard_set_f64(self.voice_samples[0].pitch_ratio_smoother_id, ratio);
                self.smoothing
                    .hard_set(self.voice_samples[0].xfade_vol_smoother_id, 1.0);
            }
        }

        self.current_gain = 1.0;
        self.waveform_position_01 = 0.0;
        self.written_to_buffer_this_block = false;
        self.pending_termination = false;
        self.is_active = true;
    }

    /// Gate both envelopes into release; the voice terminates on its own.
    pub fn end(&mut self) {
        debug_assert!(self.is_active);
        self.vol_env.gate(false);
        self.fil_env.gate(false);
    }

    /// Synchronous reset, used by the allocator and when a stream exhausts.
    /// Counter bookkeeping is the pool's job.
    pub fn reset_to_inactive(&mut self) {
        self.is_active = false;
        if let Some(handle) = self.instrument_retain.take() {
            handle.release();
        }
    }

    // -----------------------------------------------------------------------
    // Block processing

    /// Render `num_frames` into `write_buffer` (interleaved stereo, length
    /// 2*num_frames). `block_frame_offset` positions this voice's frames
    /// within the engine block for reads of engine-wide smoothers.
    pub fn process_block(
        &mut self,
        num_frames: u32,
        write_buffer: &mut [f32],
        master: &SmoothedValueSystem,
        controller: &VoiceController,
        sample_rate: f32,
    ) -> VoiceBlockResult {
        debug_assert!(write_buffer.len() >= num_frames as usize * 2);

        let mut num_frames = num_frames;
        let mut write_offset = 0usize;

        if self.frames_before_starting != 0 {
            let frames_to_skip = num_frames.min(self.frames_before_starting);
            let samples_to_skip = frames_to_skip as usize * 2;
            write_buffer[..samples_to_skip].fill(0.0);
            write_offset = samples_to_skip;
            num_frames -= frames_to_skip;
            self.frames_before_starting -= frames_to_skip;
        }

        let mut block_frame_index = (write_offset / 2) as u32;
        let mut wrote_any = write_offset != 0;
        let mut finished = false;
        let mut lfo_amounts = [0.0f32; VOICE_CHUNK_FRAMES];
        let mut chunk_buffer = [0.0f32; VOICE_CHUNK_FRAMES * 2];

        while num_frames > 0 {
            let chunk_size = num_frames.min(VOICE_CHUNK_FRAMES as u32);

            self.smoothing.process_block(chunk_size);
            self.fill_lfo_buffer(&mut lfo_amounts, chunk_size, controller);

            chunk_buffer.fill(0.0);
            self.fill_buffer_with_sample_data(
                &mut chunk_buffer,
                &lfo_amounts,
                chunk_size,
                controller,
            );

            let mut chunk_gain = 1.0f32;
            let mut valid_frames = self.apply_volume_envelope(
                &mut chunk_buffer,
                chunk_size,
                controller,
                &mut chunk_gain,
            );
            valid_frames = self.apply_gain(&mut chunk_buffer, valid_frames, &mut chunk_gain);
            self.apply_volume_lfo(
                &mut chunk_buffer,
                &lfo_amounts,
                valid_frames,
                controller,
                &mut chunk_gain,
            );
            self.apply_pan(
                &mut chunk_buffer,
                &lfo_amounts,
                valid_frames,
                master,
                controller,
                block_frame_index,
            );
            self.apply_filter(
                &mut chunk_buffer,
                &lfo_amounts,
                valid_frames,
                controller,
                sample_rate,
            );

            let samples_to_write = valid_frames as usize * 2;
            write_buffer[write_offset..write_offset + samples_to_write]
                .copy_from_slice(&chunk_buffer[..samples_to_write]);
            write_offset += samples_to_write;
            if samples_to_write > 0 {
                wrote_any = true;
            }

            self.current_gain = chunk_gain;

            if valid_frames != chunk_size || self.num_active_voice_samples == 0 {
                write_buffer[write_offset..].fill(0.0);
                finished = true;
                break;
            }

            num_frames -= chunk_size;
            block_frame_index += chunk_size;
        }

        VoiceBlockResult { wrote_any, finished }
    }

    pub fn waveform_marker(&self) -> VoiceWaveformMarker {
        VoiceWaveformMarker {
            layer_index: self.layer_index as u8,
            position: (self.waveform_position_01.clamp(0.0, 1.0) * u16::MAX as f32) as u16,
            intensity: (self.current_gain.clamp(0.0, 1.0) * u16::MAX as f32) as u16,
        }
    }

    pub fn vol_env_marker(&self, controller: &VoiceController) -> VoiceEnvelopeMarker {
        VoiceEnvelopeMarker {
            on: controller.vol_env_on && !self.vol_env.is_idle(),
            layer_index: self.layer_index as u8,
            state: self.vol_env.state as u8,
            pos: (self.vol_env.output.clamp(0.0, 1.0) * u16::MAX as f32) as u16,
            sustain_level: (controller.vol_env.sustain_amount.clamp(0.0, 1.0)
                * u16::MAX as f32) as u16,
            id: self.id,
        }
    }

    pub fn fil_env_marker(&self, controller: &VoiceController) -> VoiceEnvelopeMarker {
        VoiceEnvelopeMarker {
            on: controller.fil_env_amount != 0.0 && !self.fil_env.is_idle(),
            layer_index: self.layer_index as u8,
            state: self.fil_env.state as u8,
            pos: (self.fil_env.output.clamp(0.0, 1.0) * u16::MAX as f32) as u16,
            sustain_level: (controller.fil_env.sustain_amount.clamp(0.0, 1.0)
                * u16::MAX as f32) as u16,
            id: self.id,
        }
    }

    // -----------------------------------------------------------------------
    // Chunk stages

    fn fill_lfo_buffer(
        &mut self,
        lfo_amounts: &mut [f32; VOICE_CHUNK_FRAMES],
        num_frames: u32,
        controller: &VoiceController,
    ) {
        let random = matches!(
            controller.lfo_shape,
            LfoShapeParam::RandomSmooth | LfoShapeParam::RandomStep
        );
        for amount in lfo_amounts.iter_mut().take(num_frames as usize) {
            let raw = if random {
                self.random_lfo.tick()
            } else {
                self.lfo.tick()
            };
            let smoothed = self.lfo_smoother.low_pass(raw, LFO_LOWPASS_SMOOTHING);
            *amount = -smoothed;
        }
    }

    fn pitch_ratio_at(
        &self,
        sample_index: usize,
        frame: u32,
        lfo_amounts: &[f32; VOICE_CHUNK_FRAMES],
        controller: &VoiceController,
    ) -> f64 {
        let mut ratio = self
            .smoothing
            .value_f64(self.voice_samples[sample_index].pitch_ratio_smoother_id, frame);
        if controller.lfo_on && controller.lfo_destination == LfoDestination::Pitch {
            const MAX_SEMITONES: f64 = 1.0;
            let addition_semitones =
                lfo_amounts[frame as usize] as f64 * controller.lfo_amount as f64 * MAX_SEMITONES;
            ratio *= (addition_semitones / 12.0).exp2();
        }
        ratio
    }

    fn fill_buffer_with_sample_data(
        &mut self,
        buffer: &mut [f32; VOICE_CHUNK_FRAMES * 2],
        lfo_amounts: &[f32; VOICE_CHUNK_FRAMES],
        num_frames: u32,
        controller: &VoiceController,
    ) {
        for sample_index in 0..MAX_VOICE_SAMPLES {
            if !self.voice_samples[sample_index].is_active {
                continue;
            }
            let waveform_kind = match &self.voice_samples[sample_index].generator {
                Generator::Sampler { .. } => None,
                Generator::Waveform { kind } => Some(*kind),
            };
            match waveform_kind {
                None => {
                    let still_going = self.add_sampler_data_onto_buffer(
                        sample_index,
                        buffer,
                        lfo_amounts,
                        num_frames,
                        controller,
                    );
                    if let Some(audio) = self.voice_samples[sample_index].audio() {
                        self.waveform_position_01 = (self.voice_samples[sample_index].pos
                            / audio.num_frames as f64)
                            as f32;
                    }
                    if !still_going {
                        self.voice_samples[sample_index].is_active = false;
                        self.num_active_voice_samples -= 1;
                    }
                }
                Some(WaveformType::Sine) => self.fill_buffer_with_sine(
                    sample_index,
                    buffer,
                    lfo_amounts,
                    num_frames,
                    controller,
                ),
                Some(WaveformType::WhiteNoiseMono) => {
                    let amp = self.voice_samples[sample_index].amp;
                    fill_buffer_with_mono_white_noise(
                        buffer,
                        num_frames,
                        amp,
                        &mut self.noise_rng,
                    );
                }
                Some(WaveformType::WhiteNoiseStereo) => {
                    let amp = self.voice_samples[sample_index].amp;
                    fill_buffer_with_stereo_white_noise(
                        buffer,
                        num_frames,
                        amp,
                        &mut self.noise_rng,
                    );
                }
            }
        }
    }

    fn add_sampler_data_onto_buffer(
        &mut self,
        sample_index: usize,
        buffer: &mut [f32; VOICE_CHUNK_FRAMES * 2],
        lfo_amounts: &[f32; VOICE_CHUNK_FRAMES],
        num_frames: u32,
        controller: &VoiceController,
    ) -> bool {
        let amp = self.voice_samples[sample_index].amp;
        let has_timbre_range = self.voice_samples[sample_index]
            .region()
            .map(|r| r.timbre_layer_range.is_some())
            .unwrap_or(false);
        let xfade_id = self.voice_samples[sample_index].xfade_vol_smoother_id;

        for frame in 0..num_frames {
            let pitch_ratio = self.pitch_ratio_at(sample_index, frame, lfo_amounts, controller);
            let xfade_gain = if has_timbre_range {
                self.smoothing.value(xfade_id, frame)
            } else {
                1.0
            };

            let sample = &mut self.voice_samples[sample_index];
            let Generator::Sampler {
                data,
                loop_points,
                loop_and_reverse_flags,
                ..
            } = &mut sample.generator
            else {
                // Impossible state: panic in debug, silence the voice in
                // release.
                debug_assert!(false, "sampler stream without sampler generator");
                crate::rt_eprintln!("voice {}: bad generator state", self.id);
                return false;
            };
            let audio = unsafe { data.as_ref() };

            // Skip the read entirely while this region is crossfaded out,
            // but keep the position moving so a fade back in stays in sync.
            if xfade_gain != 0.0 {
                let (l, r) = sample_get_data(
                    audio,
                    loop_points.as_ref(),
                    *loop_and_reverse_flags,
                    sample.pos,
                );
                let position = frame as usize * 2;
                buffer[position] += l * xfade_gain * amp;
                buffer[position + 1] += r * xfade_gain * amp;
            }

            let still_going = increment_playback_pos(
                loop_points.as_ref(),
                loop_and_reverse_flags,
                &mut sample.pos,
                pitch_ratio,
                audio.num_frames as f64,
            );
            if !still_going {
                return false;
            }
        }
        true
    }

    fn fill_buffer_with_sine(
        &mut self,
        sample_index: usize,
        buffer: &mut [f32; VOICE_CHUNK_FRAMES * 2],
        lfo_amounts: &[f32; VOICE_CHUNK_FRAMES],
        num_frames: u32,
        controller: &VoiceController,
    ) {
        let amp = self.voice_samples[sample_index].amp * SINE_SCALE;
        for frame in 0..num_frames {
            let pitch_ratio = self.pitch_ratio_at(sample_index, frame, lfo_amounts, controller);
            let sample = &mut self.voice_samples[sample_index];
            let value = sin_turns(sample.pos as f32) * amp;
            let position = frame as usize * 2;
            buffer[position] = value;
            buffer[position + 1] = value;

            sample.pos += pitch_ratio;
            // Keep the phase small so f32 conversion stays accurate.
            if sample.pos > (1 << 24) as f64 {
                sample.pos -= (1 << 24) as f64;
            }
        }
    }

    /// Returns how many frames remain valid; fewer than `num_frames` means
    /// the envelope finished and the voice should terminate.
    fn apply_volume_envelope(
        &mut self,
        buffer: &mut [f32; VOICE_CHUNK_FRAMES * 2],
        num_frames: u32,
        controller: &VoiceController,
        chunk_gain: &mut f32,
    ) -> u32 {
        let env_on = controller.vol_env_on;
        let mut last_env = 0.0;
        for frame in 0..num_frames {
            last_env = self.vol_env.process(&controller.vol_env);
            if env_on {
                let position = frame as usize * 2;
                buffer[position] *= last_env;
                buffer[position + 1] *= last_env;
                if self.vol_env.is_idle() {
                    *chunk_gain = 0.0;
                    return frame;
                }
            }
        }
        *chunk_gain *= if env_on { last_env } else { 1.0 };
        num_frames
    }

    fn apply_gain(
        &mut self,
        buffer: &mut [f32; VOICE_CHUNK_FRAMES * 2],
        num_frames: u32,
        chunk_gain: &mut f32,
    ) -> u32 {
        let mut last_fade = 0.0;
        for frame in 0..num_frames {
            last_fade = self.volume_fade.get_fade() * self.aftertouch_multiplier;
            let position = frame as usize * 2;
            buffer[position] *= last_fade;
            buffer[position + 1] *= last_fade;

            if self.volume_fade.is_silent() {
                *chunk_gain = 0.0;
                return frame;
            }
        }
        *chunk_gain *= last_fade;
        num_frames
    }

    fn apply_volume_lfo(
        &mut self,
        buffer: &mut [f32; VOICE_CHUNK_FRAMES * 2],
        lfo_amounts: &[f32; VOICE_CHUNK_FRAMES],
        num_frames: u32,
        controller: &VoiceController,
        chunk_gain: &mut f32,
    ) {
        if !(controller.lfo_on && controller.lfo_destination == LfoDestination::Volume) {
            return;
        }
        let lfo_amp = controller.lfo_amount;
        // Centre the modulation below unity; cutting sounds better than
        // boosting into clip.
        let base = 1.0 - lfo_amp.abs() / 2.0;
        let half_amp = lfo_amp / 2.0;
        let mut last_gain = 1.0;
        for frame in 0..num_frames {
            last_gain = (base + lfo_amounts[frame as usize] * half_amp).clamp(0.0, 1.0);
            let position = frame as usize * 2;
            buffer[position] *= last_gain;
            buffer[position + 1] *= last_gain;
        }
        *chunk_gain *= last_gain;
    }

    fn apply_pan(
        &mut self,
        buffer: &mut [f32; VOICE_CHUNK_FRAMES * 2],
        lfo_amounts: &[f32; VOICE_CHUNK_FRAMES],
        num_frames: u32,
        master: &SmoothedValueSystem,
        controller: &VoiceController,
        block_frame_index: u32,
    ) {
        let has_pan_lfo =
            controller.lfo_on && controller.lfo_destination == LfoDestination::Pan;
        let pan_target = master.target_value(controller.pan_pos_smoother_id);

        for frame in 0..num_frames {
            let mut pan_pos = master.value(
                controller.pan_pos_smoother_id,
                block_frame_index + frame,
            );
            let mut pan_changed = pan_pos != pan_target;
            if has_pan_lfo {
                pan_pos += lfo_amounts[frame as usize] * controller.lfo_amount;
                pan_pos = pan_pos.clamp(-1.0, 1.0);
                pan_changed = true;
            }
            if pan_changed {
                self.set_equal_pan(pan_pos);
            }
            let position = frame as usize * 2;
            buffer[position] *= self.amp_l;
            buffer[position + 1] *= self.amp_r;
        }
    }

    fn apply_filter(
        &mut self,
        buffer: &mut [f32; VOICE_CHUNK_FRAMES * 2],
        lfo_amounts: &[f32; VOICE_CHUNK_FRAMES],
        num_frames: u32,
        controller: &VoiceController,
        sample_rate: f32,
    ) {
        let has_filter_lfo =
            controller.lfo_on && controller.lfo_destination == LfoDestination::Filter;

        for frame in 0..num_frames {
            let env = self.fil_env.process(&controller.fil_env);
            let filter_mix = self.smoothing.value(self.filter_mix_smoother_id, frame);
            if filter_mix == 0.0 {
                // Clear state so re-engaging the filter does not step.
                self.filters.reset();
                continue;
            }

            self.filter_changed |= self
                .smoothing
                .is_smoothing(self.sv_filter_cutoff_smoother_id, frame)
                || self
                    .smoothing
                    .is_smoothing(self.sv_filter_resonance_smoother_id, frame);

            let mut cutoff = self
                .smoothing
                .value(self.sv_filter_cutoff_smoother_id, frame)
                + (env - 0.5) * controller.fil_env_amount;
            let resonance = self
                .smoothing
                .value(self.sv_filter_resonance_smoother_id, frame);

            if has_filter_lfo {
                self.filter_changed = true;
                cutoff += (lfo_amounts[frame as usize] * controller.lfo_amount) / 2.0;
            }
            if self.fil_env.state != AdsrState::Sustain && controller.fil_env_amount != 0.0 {
                self.filter_changed = true;
            }

            if self.filter_changed {
                let hz = svf::linear_to_hz(cutoff.clamp(0.0, 1.0));
                self.filter_coeffs.update(sample_rate, hz, resonance);
                self.filter_changed = false;
            }

            let position = frame as usize * 2;
            let dry = (buffer[position], buffer[position + 1]);
            let wet = svf::process(
                &mut self.filters,
                controller.filter_type,
                &self.filter_coeffs,
                dry,
            );
            if filter_mix != 1.0 {
                buffer[position] = dry.0 + filter_mix * (wet.0 - dry.0);
                buffer[position + 1] = dry.1 + filter_mix * (wet.1 - dry.1);
            } else {
                buffer[position] = wet.0;
                buffer[position + 1] = wet.1;
            }
        }
    }
}

/// Resolve the effective loop for a region from the user's desired mode and
/// the region's built-in loop, honouring lock flags.
fn configure_loop(
    controller: &VoiceController,
    region: &Region,
    num_frames: u32,
) -> Option<CheckedLoop> {
    use LoopModeParam::*;

    if let Some(builtin) = &region.builtin_loop {
        let mut result = create_bounds_checked_loop(
            builtin.start_frame,
            builtin.end_frame,
            builtin.crossfade_frames,
            builtin.mode,
            num_frames,
        )?;

        match controller.loop_mode {
            InstrumentDefault => return Some(result),
            BuiltInLoopStandard => {
                if !builtin.lock_mode {
                    result.mode = LoopMode::Standard;
                }
                return Some(result);
            }
            BuiltInLoopPingPong => {
                if !builtin.lock_mode {
                    result.mode = LoopMode::PingPong;
                }
                return Some(result);
            }
            None => {
                if region.always_loop {
                    return Some(result);
                }
                return Option::None;
            }
            Standard | PingPong => {
                if builtin.lock_loop_points {
                    return Some(result);
                }
                // Fall through to the custom loop below.
            }
        }
    }

    match controller.loop_mode {
        InstrumentDefault | BuiltInLoopStandard | BuiltInLoopPingPong | None => {
            if region.always_loop {
                // Legacy regions must keep looping somehow.
                let n = num_frames as f32;
                return create_bounds_checked_loop(
                    0,
                    (0.9 * n) as i64,
                    (0.1 * n) as u32,
                    LoopMode::Standard,
                    num_frames,
                );
            }
            Option::None
        }
        Standard | PingPong => {
            let n = num_frames as f32;
            create_bounds_checked_loop(
                (controller.loop_start * n) as i64,
                (controller.loop_end * n) as i64,
                (controller.loop_crossfade * n) as u32,
                if controller.loop_mode == PingPong {
                    LoopMode::PingPong
                } else {
                    LoopMode::Standard
                },
                num_frames,
            )
        }
    }
}

fn fill_buffer_with_mono_white_noise(
    buffer: &mut [f32; VOICE_CHUNK_FRAMES * 2],
    num_frames: u32,
    amp: f32,
    rng_state: &mut u32,
) {
    let scale = NOISE_SCALE * amp / 0x7FFF as f32;
    for frame in 0..num_frames as usize {
        let value = ((fast_rand(rng_state) as f32 * scale) * 2.0) - NOISE_SCALE * amp;
        buffer[frame * 2] = value;
        buffer[frame * 2 + 1] = value;
    }
}

fn fill_buffer_with_stereo_white_noise(
    buffer: &mut [f32; VOICE_CHUNK_FRAMES * 2],
    num_frames: u32,
    amp: f32,
    rng_state: &mut u32,
) {
    let scale = NOISE_SCALE * amp / 0x7FFF as f32;
    for frame in 0..num_frames as usize {
        let left = ((fast_rand(rng_state) as f32 * scale) * 2.0) - NOISE_SCALE * amp;
        let right = ((fast_rand(rng_state) as f32 * scale) * 2.0) - NOISE_SCALE * amp;
        let (l, r) = stereo_widen(0.7, left, right);
        buffer[frame * 2] = l;
        buffer[frame * 2 + 1] = r;
    }
}

fn stereo_widen(width: f32, left: f32, right: f32) -> (f32, f32) {
    let mid = (left + right) * 0.5;
    let side = (right - left) * 0.5 * width;
    (mid - side, mid + side)
}
