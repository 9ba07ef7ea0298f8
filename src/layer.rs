//! Layer processor: one of the three parallel signal paths.
//!
//! A layer translates sparse parameter changes into voice-controller fields
//! and smoothed-value targets, routes notes into the voice pool, applies the
//! layer-wide EQ / volume / mute-solo mix, and meters its output. Instrument
//! changes arrive through an atomic "desired instrument" slot so any thread
//! can publish a change and the audio thread consumes it exactly once
//! between blocks.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::constants::{
    EQ_ENABLE_FADE_MS, INSTRUMENT_CHANGE_FADE_MS, MAX_VOICE_SAMPLES, MIN_ENVELOPE_MS,
    NUM_LAYER_EQ_BANDS, PARAM_SMOOTHING_MAX_MS, PARAM_SMOOTHING_MIN_MS,
};
use crate::dsp::biquad::{BiquadParams, BiquadType, StereoBiquadState};
use crate::dsp::math::{map_from_01, map_from_01_skew};
use crate::dsp::peak_meter::StereoPeakMeter;
use crate::dsp::svf::{hz_to_linear, skew_resonance, SvfType};
use crate::dsp::volume_fade::{FadeState, VolumeFade};
use crate::params::{
    ChangedLayerParams, EqType, LayerFilterType, LayerParamIndex, LfoRestartMode,
    VelocityMappingMode,
};
use crate::samplib::loader::InstrumentHandle;
use crate::samplib::TimbreLayerRange;
use crate::smoothing::{FilterId, FloatId, SmoothedValueSystem};
use crate::sync::signal::WorkSignaller;
use crate::timing::SyncedRate;
use crate::types::{AudioContext, MidiChannelNote};
use crate::voice::{
    SamplerRegionStart, SamplerStart, VoiceController, VoiceStartInstrument, VoiceStartParams,
    WaveformStart, WaveformType,
};
use crate::voice_pool::VoicePool;

// ---------------------------------------------------------------------------
// Desired-instrument slot

/// What a layer is currently playing.
pub enum LayerInstrument {
    None,
    Waveform(WaveformType),
    Sampler(InstrumentHandle),
}

/// A consumed update from the desired-instrument slot. Instrument pointers
/// come back as identity pointers; the engine rebuilds the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredUpdate {
    None,
    Waveform(WaveformType),
    Instrument(*const ()),
}

/// Encodes {none, waveform variant, instrument pointer} plus a "consumed"
/// sentinel into one atomic word. Instrument pointers are at least 8-byte
/// aligned, so small odd-ish values are free for the other states:
/// 1 = consumed, 0 = none, 2 + 4*w = waveform w.
pub struct DesiredInst {
    value: AtomicU64,
}

const CONSUMED: u64 = 1;

fn encode_waveform(waveform: WaveformType) -> u64 {
    let index = match waveform {
        WaveformType::Sine => 0u64,
        WaveformType::WhiteNoiseMono => 1,
        WaveformType::WhiteNoiseStereo => 2,
    };
    2 + 4 * index
}

fn decode_waveform(value: u64) -> Option<WaveformType> {
    match value {
        2 => Some(WaveformType::Sine),
        6 => Some(WaveformType::WhiteNoiseMono),
        10 => Some(WaveformType::WhiteNoiseStereo),
        _ => None,
    }
}

impl Default for DesiredInst {
    fn default() -> Self {
        Self {
            value: AtomicU64::new(CONSUMED),
        }
    }
}

impl DesiredInst {
    /// Publish from any thread. Returns the identity pointer of a previously
    /// published but never consumed instrument, whose retain the publisher
    /// must release.
    pub fn set_waveform(&self, waveform: WaveformType) -> Option<*const ()> {
        self.publish(encode_waveform(waveform))
    }

    pub fn set_instrument(&self, identity: *const ()) -> Option<*const ()> {
        debug_assert!(identity as u64 % 8 == 0 && !identity.is_null());
        self.publish(identity as u64)
    }

    pub fn set_none(&self) -> Option<*const ()> {
        self.publish(0)
    }

    fn publish(&self, new_value: u64) -> Option<*const ()> {
        let old = self.value.swap(new_value, Ordering::SeqCst);
        if old != CONSUMED && old != 0 && decode_waveform(old).is_none() {
            Some(old as *const ())
        } else {
            None
        }
    }

    /// Audio thread, between blocks. Each published value comes back exactly
    /// once; with nothing new published this returns None.
    pub fn consume(&self) -> Option<DesiredUpdate> {
        let value = self.value.swap(CONSUMED, Ordering::SeqCst);
        if value == CONSUMED {
            return None;
        }
        if value == 0 {
            return Some(DesiredUpdate::None);
        }
        if let Some(waveform) = decode_waveform(value) {
            return Some(DesiredUpdate::Waveform(waveform));
        }
        Some(DesiredUpdate::Instrument(value as *const ()))
    }

    pub fn is_consumed(&self) -> bool {
        self.value.load(Ordering::SeqCst) == CONSUMED
    }
}

// ---------------------------------------------------------------------------
// Layer EQ

struct EqBand {
    eq_coeffs_smoother_id: FilterId,
    eq_data: StereoBiquadState,
    eq_params: BiquadParams,
}

impl EqBand {
    fn new(master: &mut SmoothedValueSystem) -> Self {
        Self {
            eq_coeffs_smoother_id: master.create_filter_smoother(),
            eq_data: StereoBiquadState::default(),
            eq_params: BiquadParams::default(),
        }
    }

    #[inline]
    fn process(
        &mut self,
        master: &SmoothedValueSystem,
        input: (f32, f32),
        frame_index: u32,
    ) -> (f32, f32) {
        let state = master.filter_value(self.eq_coeffs_smoother_id, frame_index);
        self.eq_data.process(&state.coeffs, input)
    }

    fn on_param_change(
        &mut self,
        band_num: usize,
        changed_params: &ChangedLayerParams,
        master: &mut SmoothedValueSystem,
        sample_rate: f32,
    ) {
        let (freq_param, reso_param, gain_param, type_param) = match band_num {
            0 => (
                LayerParamIndex::EqFreq1,
                LayerParamIndex::EqResonance1,
                LayerParamIndex::EqGain1,
                LayerParamIndex::EqType1,
            ),
            1 => (
                LayerParamIndex::EqFreq2,
                LayerParamIndex::EqResonance2,
                LayerParamIndex::EqGain2,
                LayerParamIndex::EqType2,
            ),
            _ => unreachable!(),
        };

        let mut changed = false;
        if let Some(p) = changed_params.param(freq_param) {
            self.eq_params.sample_rate = sample_rate;
            self.eq_params.fc = p.projected;
            changed = true;
        }
        if let Some(p) = changed_params.param(reso_param) {
            self.eq_params.sample_rate = sample_rate;
            self.eq_params.q = map_from_01_skew(p.projected, 0.5, 8.0, 5.0);
            changed = true;
        }
        if let Some(p) = changed_params.param(gain_param) {
            self.eq_params.sample_rate = sample_rate;
            self.eq_params.peak_gain_db = p.projected;
            changed = true;
        }
        if let Some(p) = changed_params.param(type_param) {
            self.eq_params.sample_rate = sample_rate;
            self.eq_params.kind = match p.as_int::<EqType>().unwrap_or_default() {
                EqType::Peak => BiquadType::Peaking,
                EqType::LowShelf => BiquadType::LowShelf,
                EqType::HighShelf => BiquadType::HighShelf,
            };
            changed = true;
        }

        if changed {
            master.set_filter(self.eq_coeffs_smoother_id, &self.eq_params);
        }
    }
}

struct EqBands {
    bands: [EqBand; NUM_LAYER_EQ_BANDS],
    eq_mix_smoother_id: FloatId,
}

impl EqBands {
    fn new(master: &mut SmoothedValueSystem) -> Self {
        Self {
            bands: [EqBand::new(master), EqBand::new(master)],
            eq_mix_smoother_id: master.create_smoother(),
        }
    }

    fn set_on(&self, master: &mut SmoothedValueSystem, on: bool) {
        master.set(
            self.eq_mix_smoother_id,
            if on { 1.0 } else { 0.0 },
            EQ_ENABLE_FADE_MS,
        );
    }

    #[inline]
    fn process(
        &mut self,
        master: &SmoothedValueSystem,
        input: (f32, f32),
        frame_index: u32,
    ) -> (f32, f32) {
        let mix = master.value(self.eq_mix_smoother_id, frame_index);
        if mix == 0.0 {
            return input;
        }
        let mut result = input;
        for band in &mut self.bands {
            result = band.process(master, result, frame_index);
        }
        if mix != 1.0 {
            result = (
                input.0 + mix * (result.0 - input.0),
                input.1 + mix * (result.1 - input.1),
            );
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Velocity zones

struct VelocityRegion {
    point_most_intense: u8,
    point_least_intense: u8,
    /// Always fades down from the bottom.
    no_fade_size: i32,
}

const VELO_REGIONS_HALF: [VelocityRegion; 2] = [
    VelocityRegion {
        point_most_intense: 127,
        point_least_intense: 20,
        no_fade_size: 20,
    },
    VelocityRegion {
        point_most_intense: 0,
        point_least_intense: 107,
        no_fade_size: 20,
    },
];

const VELO_REGIONS_THIRD: [VelocityRegion; 4] = [
    VelocityRegion {
        point_most_intense: 127,
        point_least_intense: 64,
        no_fade_size: 20,
    },
    VelocityRegion {
        point_most_intense: 64,
        point_least_intense: 127,
        no_fade_size: 0,
    },
    VelocityRegion {
        point_most_intense: 64,
        point_least_intense: 20,
        no_fade_size: 0,
    },
    VelocityRegion {
        point_most_intense: 0,
        point_least_intense: 64,
        no_fade_size: 20,
    },
];

fn process_velo_region(region: &VelocityRegion, velo: u8) -> f32 {
    let min = region.point_least_intense.min(region.point_most_intense);
    let max = region.point_least_intense.max(region.point_most_intense);
    if velo < min || velo > max {
        return 0.0;
    }

    if region.point_most_intense > region.point_least_intense {
        let fade_end = region.point_most_intense as i32 - region.no_fade_size;
        if (velo as i32) > fade_end {
            return 1.0;
        }
        let bottom = region.point_least_intense as i32;
        (velo as i32 - bottom) as f32 / (fade_end - bottom) as f32
    } else if region.point_least_intense > region.point_most_intense {
        let fade_end = region.point_most_intense as i32 + region.no_fade_size;
        if (velo as i32) < fade_end {
            return 1.0;
        }
        let span = region.point_least_intense as i32 - fade_end;
        1.0 - (velo as i32 - fade_end) as f32 / span as f32
    } else {
        0.0
    }
}

fn process_velo_regions(regions: &[VelocityRegion], active_regions: u8, velo: u8) -> f32 {
    let mut sum = 0.0;
    for (index, region) in regions.iter().enumerate() {
        if active_regions & (1 << index) != 0 {
            sum += process_velo_region(region, velo);
        }
    }
    sum
}

// ---------------------------------------------------------------------------
// The layer processor

pub struct LayerProcessor {
    pub index: usize,
    pub controller: VoiceController,

    pub desired_inst: Arc<DesiredInst>,
    pub inst: LayerInstrument,

    vol_smoother_id: FloatId,
    mute_solo_mix_smoother_id: FloatId,

    pub midi_transpose: i32,
    tune_semitone: f32,
    tune_cents: f32,
    pub sample_offset_01: f32,
    pub monophonic: bool,
    pub mute: bool,
    pub solo: bool,

    lfo_restart_mode: LfoRestartMode,
    lfo_synced_rate: SyncedRate,
    lfo_unsynced_hz: f32,
    lfo_is_synced: bool,

    pub is_silent: AtomicBool,

    eq_bands: EqBands,

    num_velocity_regions: usize,
    active_velocity_regions: u8,

    pub peak_meter: StereoPeakMeter,
    inst_change_fade: VolumeFade,

    pub note_on_rr_pos: AtomicU32,
}

impl LayerProcessor {
    pub fn new(index: usize, master: &mut SmoothedValueSystem) -> Self {
        let pan_id = master.create_smoother();
        Self {
            index,
            controller: VoiceController::new(index, pan_id),
            desired_inst: Arc::new(DesiredInst::default()),
            inst: LayerInstrument::None,
            vol_smoother_id: master.create_smoother(),
            mute_solo_mix_smoother_id: master.create_smoother(),
            midi_transpose: 0,
            tune_semitone: 0.0,
            tune_cents: 0.0,
            sample_offset_01: 0.0,
            monophonic: false,
            mute: false,
            solo: false,
            lfo_restart_mode: LfoRestartMode::Retrigger,
            lfo_synced_rate: SyncedRate::default(),
            lfo_unsynced_hz: 1.0,
            lfo_is_synced: false,
            is_silent: AtomicBool::new(false),
            eq_bands: EqBands::new(master),
            num_velocity_regions: 1,
            active_velocity_regions: 0,
            peak_meter: StereoPeakMeter::default(),
            inst_change_fade: VolumeFade::new(FadeState::FullVolume),
            note_on_rr_pos: AtomicU32::new(0),
        }
    }

    pub fn prepare_to_play(&mut self, master: &mut SmoothedValueSystem, ctx: &AudioContext) {
        self.peak_meter.prepare_to_play(ctx.sample_rate);
        self.inst_change_fade.force_set_full_volume();
        master.hard_set(self.vol_smoother_id, 1.0);
        master.hard_set(self.mute_solo_mix_smoother_id, 1.0);
    }

    // -----------------------------------------------------------------------
    // Parameters

    fn set_velocity_mapping(&mut self, mode: VelocityMappingMode) {
        self.active_velocity_regions = 0;
        match mode {
            VelocityMappingMode::None => {
                self.num_velocity_regions = 1;
            }
            VelocityMappingMode::TopToBottom => {
                self.num_velocity_regions = 2;
                self.active_velocity_regions |= 1 << 0;
            }
            VelocityMappingMode::BottomToTop => {
                self.num_velocity_regions = 2;
                self.active_velocity_regions |= 1 << 1;
            }
            VelocityMappingMode::TopToMiddle => {
                self.num_velocity_regions = 3;
                self.active_velocity_regions |= 1 << 0;
            }
            VelocityMappingMode::MiddleOutwards => {
                self.num_velocity_regions = 3;
                self.active_velocity_regions |= 1 << 1;
                self.active_velocity_regions |= 1 << 2;
            }
            VelocityMappingMode::MiddleToBottom => {
                self.num_velocity_regions = 3;
                self.active_velocity_regions |= 1 << 3;
            }
        }
    }

    fn velocity_region_level(&self, velocity: f32, velocity_to_volume: f32) -> f32 {
        let mut level = map_from_01(velocity, 1.0 - velocity_to_volume, 1.0);
        let velo = (velocity * 127.0) as u8;
        if self.num_velocity_regions == 2 {
            level *= process_velo_regions(&VELO_REGIONS_HALF, self.active_velocity_regions, velo);
        } else if self.num_velocity_regions == 3 {
            level *= process_velo_regions(&VELO_REGIONS_THIRD, self.active_velocity_regions, velo);
        }
        level
    }

    fn update_voice_lfo_times(&self, pool: &mut VoicePool, ctx: &AudioContext) {
        let controller = &self.controller;
        pool.for_each_active_layer_voice(self.index, |voice| {
            voice.update_lfo_time(controller, ctx.sample_rate);
        });
    }

    pub fn set_tempo(&mut self, pool: &mut VoicePool, ctx: &AudioContext) {
        if self.lfo_is_synced {
            self.controller.lfo_time_hz = self.lfo_synced_rate.hz(ctx.tempo_bpm) as f32;
        }
        self.update_voice_lfo_times(pool, ctx);
    }

    pub fn on_param_change(
        &mut self,
        master: &mut SmoothedValueSystem,
        pool: &mut VoicePool,
        ctx: &AudioContext,
        changed_params: ChangedLayerParams,
    ) {
        let sample_rate = ctx.sample_rate;

        // Main controls
        // ===================================================================
        if let Some(p) = changed_params.param(LayerParamIndex::VelocityMapping) {
            self.set_velocity_mapping(p.as_int().unwrap_or_default());
        }

        if let Some(p) = changed_params.param(LayerParamIndex::Volume) {
            master.set_variable_length(
                self.vol_smoother_id,
                p.projected,
                PARAM_SMOOTHING_MIN_MS,
                PARAM_SMOOTHING_MAX_MS,
                1.0,
            );
        }

        if let Some(p) = changed_params.param(LayerParamIndex::Pan) {
            master.set_variable_length(
                self.controller.pan_pos_smoother_id,
                p.projected,
                PARAM_SMOOTHING_MIN_MS,
                PARAM_SMOOTHING_MAX_MS,
                2.0,
            );
        }

        {
            let mut set_tune = false;
            if let Some(p) = changed_params.param(LayerParamIndex::TuneSemitone) {
                self.tune_semitone = p.projected;
                set_tune = true;
            }
            if let Some(p) = changed_params.param(LayerParamIndex::TuneCents) {
                self.tune_cents = p.projected;
                set_tune = true;
            }
            if set_tune {
                self.controller.tune_semitones = self.tune_semitone + self.tune_cents / 100.0;
                let controller = &self.controller;
                pool.for_each_active_layer_voice(self.index, |voice| {
                    voice.set_voice_pitch(controller, controller.tune_semitones, sample_rate);
                });
            }
        }

        // Volume envelope
        // ===================================================================
        if let Some(p) = changed_params.param(LayerParamIndex::VolEnvOn) {
            self.controller.vol_env_on = p.as_bool();
            if self.controller.vol_env_on {
                pool.for_each_active_layer_voice(self.index, |voice| {
                    voice.vol_env.gate(false);
                });
            }
        }
        if let Some(p) = changed_params.param(LayerParamIndex::VolumeAttack) {
            self.controller
                .vol_env
                .set_attack_samples(p.projected.max(MIN_ENVELOPE_MS) / 1000.0 * sample_rate, 2.0);
        }
        if let Some(p) = changed_params.param(LayerParamIndex::VolumeDecay) {
            self.controller
                .vol_env
                .set_decay_samples(p.projected.max(MIN_ENVELOPE_MS) / 1000.0 * sample_rate, 0.1);
        }
        if let Some(p) = changed_params.param(LayerParamIndex::VolumeSustain) {
            self.controller.vol_env.set_sustain_amp(p.projected);
        }
        if let Some(p) = changed_params.param(LayerParamIndex::VolumeRelease) {
            self.controller
                .vol_env
                .set_release_samples(p.projected.max(MIN_ENVELOPE_MS) / 1000.0 * sample_rate, 0.1);
        }

        // Filter
        // ===================================================================
        if let Some(p) = changed_params.param(LayerParamIndex::FilterEnvAmount) {
            self.controller.fil_env_amount = p.projected;
        }
        if let Some(p) = changed_params.param(LayerParamIndex::FilterAttack) {
            self.controller
                .fil_env
                .set_attack_samples(p.projected.max(MIN_ENVELOPE_MS) / 1000.0 * sample_rate, 2.0);
        }
        if let Some(p) = changed_params.param(LayerParamIndex::FilterDecay) {
            self.controller
                .fil_env
                .set_decay_samples(p.projected.max(MIN_ENVELOPE_MS) / 1000.0 * sample_rate, 0.1);
        }
        if let Some(p) = changed_params.param(LayerParamIndex::FilterSustain) {
            self.controller.fil_env.set_sustain_amp(p.projected);
        }
        if let Some(p) = changed_params.param(LayerParamIndex::FilterRelease) {
            self.controller
                .fil_env
                .set_release_samples(p.projected.max(MIN_ENVELOPE_MS) / 1000.0 * sample_rate, 0.1);
        }
        if let Some(p) = changed_params.param(LayerParamIndex::FilterCutoff) {
            self.controller.sv_filter_cutoff_linear = hz_to_linear(p.projected);
            let cutoff = self.controller.sv_filter_cutoff_linear;
            pool.for_each_active_layer_voice(self.index, |voice| {
                voice.set_filter_cutoff(cutoff);
            });
        }
        if let Some(p) = changed_params.param(LayerParamIndex::FilterResonance) {
            self.controller.sv_filter_resonance = skew_resonance(p.projected);
            let resonance = self.controller.sv_filter_resonance;
            pool.for_each_active_layer_voice(self.index, |voice| {
                voice.set_filter_res(resonance);
            });
        }
        if let Some(p) = changed_params.param(LayerParamIndex::FilterOn) {
            self.controller.filter_on = p.as_bool();
            let on = self.controller.filter_on;
            pool.for_each_active_layer_voice(self.index, |voice| {
                voice.set_filter_on(on);
            });
        }
        if let Some(p) = changed_params.param(LayerParamIndex::FilterType) {
            // Remapping like this separates values that cannot change (the
            // parameter value) from values we control (DSP code).
            self.controller.filter_type = match p.as_int().unwrap_or_default() {
                LayerFilterType::Lowpass => SvfType::Lowpass,
                LayerFilterType::Bandpass => SvfType::Bandpass,
                LayerFilterType::Highpass => SvfType::Highpass,
                LayerFilterType::UnitGainBandpass => SvfType::UnitGainBandpass,
                LayerFilterType::BandShelving => SvfType::BandShelving,
                LayerFilterType::Notch => SvfType::Notch,
                LayerFilterType::Allpass => SvfType::Allpass,
                LayerFilterType::Peak => SvfType::Peak,
            };
        }

        // Midi
        // ===================================================================
        if let Some(p) = changed_params.param(LayerParamIndex::Keytrack) {
            self.controller.no_key_tracking = !p.as_bool();
        }
        if let Some(p) = changed_params.param(LayerParamIndex::Monophonic) {
            self.monophonic = p.as_bool();
        }

        // LFO
        // ===================================================================
        if let Some(p) = changed_params.param(LayerParamIndex::LfoShape) {
            self.controller.lfo_shape = p.as_int().unwrap_or_default();
            let controller = &self.controller;
            pool.for_each_active_layer_voice(self.index, |voice| {
                voice.update_lfo_waveform(controller);
            });
        }
        if let Some(p) = changed_params.param(LayerParamIndex::LfoAmount) {
            self.controller.lfo_amount = p.projected;
        }
        if let Some(p) = changed_params.param(LayerParamIndex::LfoDestination) {
            self.controller.lfo_destination = p.as_int().unwrap_or_default();
        }
        if let Some(p) = changed_params.param(LayerParamIndex::LfoOn) {
            self.controller.lfo_on = p.as_bool();
        }

        {
            let mut update_times = false;
            if let Some(p) = changed_params.param(LayerParamIndex::LfoRateTempoSynced) {
                self.lfo_synced_rate = p.as_int().unwrap_or_default();
                update_times = true;
            }
            if let Some(p) = changed_params.param(LayerParamIndex::LfoRateHz) {
                self.lfo_unsynced_hz = p.projected;
                update_times = true;
            }
            if let Some(p) = changed_params.param(LayerParamIndex::LfoSyncSwitch) {
                self.lfo_is_synced = p.as_bool();
                update_times = true;
            }
            if update_times {
                self.controller.lfo_time_hz = if self.lfo_is_synced {
                    self.lfo_synced_rate.hz(ctx.tempo_bpm) as f32
                } else {
                    self.lfo_unsynced_hz
                };
                self.update_voice_lfo_times(pool, ctx);
            }
        }

        if let Some(p) = changed_params.param(LayerParamIndex::LfoRestart) {
            self.lfo_restart_mode = p.as_int().unwrap_or_default();
        }

        // Loop
        // ===================================================================
        {
            let mut update_loop_info = false;
            if let Some(p) = changed_params.param(LayerParamIndex::LoopStart) {
                self.controller.loop_start = p.projected;
                update_loop_info = true;
            }
            if let Some(p) = changed_params.param(LayerParamIndex::LoopEnd) {
                self.controller.loop_end = p.projected;
                update_loop_info = true;
            }
            if let Some(p) = changed_params.param(LayerParamIndex::LoopCrossfade) {
                self.controller.loop_crossfade = p.projected;
                update_loop_info = true;
            }
            if let Some(p) = changed_params.param(LayerParamIndex::Reverse) {
                self.controller.reverse = p.as_bool();
                update_loop_info = true;
            }
            if let Some(p) = changed_params.param(LayerParamIndex::LoopMode) {
                self.controller.loop_mode = p.as_int().unwrap_or_default();
                update_loop_info = true;
            }
            if let Some(p) = changed_params.param(LayerParamIndex::SampleOffset) {
                self.sample_offset_01 = p.projected;
            }

            if update_loop_info {
                let controller = &self.controller;
                pool.for_each_active_layer_voice(self.index, |voice| {
                    voice.update_loop_info(controller);
                });
            }
        }

        // EQ
        // ===================================================================
        if let Some(p) = changed_params.param(LayerParamIndex::EqOn) {
            self.eq_bands.set_on(master, p.as_bool());
        }
        for band_index in 0..NUM_LAYER_EQ_BANDS {
            self.eq_bands.bands[band_index].on_param_change(
                band_index,
                &changed_params,
                master,
                sample_rate,
            );
        }

        // Mute and solo resolve engine-wide; just record the flags here.
        if let Some(p) = changed_params.param(LayerParamIndex::Mute) {
            self.mute = p.as_bool();
        }
        if let Some(p) = changed_params.param(LayerParamIndex::Solo) {
            self.solo = p.as_bool();
        }
    }

    pub fn set_silent(&mut self, master: &mut SmoothedValueSystem, state: bool) {
        master.set(
            self.mute_solo_mix_smoother_id,
            if state { 0.0 } else { 1.0 },
            10.0,
        );
        self.is_silent.store(state, Ordering::Relaxed);
    }

    // -----------------------------------------------------------------------
    // Notes

    #[allow(clippy::too_many_arguments)]
    pub fn handle_note_on(
        &mut self,
        master: &SmoothedValueSystem,
        pool: &mut VoicePool,
        note: MidiChannelNote,
        velocity: f32,
        frame_offset: u32,
        dynamics_01: f32,
        velocity_to_volume_01: f32,
    ) {
        let note_num = {
            let transposed = note.note as i32 + self.midi_transpose;
            if !(0..=127).contains(&transposed) {
                return;
            }
            transposed as u8
        };

        if self.monophonic {
            pool.for_each_active_layer_voice(self.index, |voice| voice.end());
        }

        let amp = self.velocity_region_level(velocity, velocity_to_volume_01);
        let lfo_start_phase = match self.lfo_restart_mode {
            LfoRestartMode::Retrigger => 0,
            LfoRestartMode::Free => pool.random_phase(),
        };

        let instrument = match &self.inst {
            LayerInstrument::None => return,
            LayerInstrument::Waveform(kind) => VoiceStartInstrument::Waveform(WaveformStart {
                kind: *kind,
                amp,
            }),
            LayerInstrument::Sampler(handle) => {
                let Some(sampler) =
                    self.select_regions(handle, note_num, velocity, dynamics_01, amp)
                else {
                    return;
                };
                VoiceStartInstrument::Sampler(sampler)
            }
        };

        let params = VoiceStartParams {
            initial_pitch: self.controller.tune_semitones,
            midi_key_trigger: note,
            note_num,
            note_vel: velocity,
            lfo_start_phase,
            num_frames_before_starting: frame_offset,
            instrument,
        };
        pool.start_voice(&self.controller, params, master);
    }

    /// Pick the up-to-four regions this note should stream: key and
    /// velocity windows, round-robin groups, plus every region overlapping
    /// in the timbre dimension so the dynamics knob can crossfade live.
    fn select_regions(
        &self,
        handle: &InstrumentHandle,
        note_num: u8,
        velocity: f32,
        dynamics_01: f32,
        amp: f32,
    ) -> Option<SamplerStart> {
        let loaded = handle.loaded();
        let instrument = &loaded.instrument;
        let velocity_127 = (velocity * 127.0).clamp(0.0, 127.0) as u8;

        let num_round_robins = instrument.num_round_robins();
        let round_robin = if num_round_robins > 0 {
            self.note_on_rr_pos.fetch_add(1, Ordering::Relaxed) % num_round_robins
        } else {
            0
        };

        let mut regions = [SamplerRegionStart {
            region_index: 0,
            amp: 0.0,
        }; MAX_VOICE_SAMPLES];
        let mut num_regions = 0usize;

        for (region_index, region) in instrument.regions.iter().enumerate() {
            if !region.matches_key(note_num) || !region.matches_velocity(velocity_127) {
                continue;
            }
            if let Some(rr) = region.round_robin_index {
                if rr != round_robin {
                    continue;
                }
            }
            if num_regions == MAX_VOICE_SAMPLES {
                break;
            }
            regions[num_regions] = SamplerRegionStart { region_index, amp };
            num_regions += 1;
        }

        if num_regions == 0 {
            return None;
        }

        Some(SamplerStart {
            handle: *handle,
            regions,
            num_regions,
            initial_sample_offset_01: self.sample_offset_01,
            initial_timbre_01: dynamics_01,
        })
    }

    pub fn handle_note_off(&mut self, pool: &mut VoicePool, note: MidiChannelNote) {
        pool.note_off(self.index, note);
    }

    // -----------------------------------------------------------------------
    // Instrument changes

    /// Between blocks: consume a pending instrument change. Fades out the
    /// current voices and swaps the instrument exactly once per publish.
    pub fn change_instrument_if_needed(
        &mut self,
        pool: &mut VoicePool,
        ctx: &AudioContext,
        signaller: &WorkSignaller,
    ) -> bool {
        let Some(update) = self.desired_inst.consume() else {
            return false;
        };

        let sample_rate = ctx.sample_rate;
        pool.for_each_active_layer_voice(self.index, |voice| {
            voice
                .volume_fade
                .set_as_fade_out_if_not_already(sample_rate, INSTRUMENT_CHANGE_FADE_MS);
        });

        let new_inst = match update {
            DesiredUpdate::None => LayerInstrument::None,
            DesiredUpdate::Waveform(kind) => LayerInstrument::Waveform(kind),
            DesiredUpdate::Instrument(identity) => {
                // Safety: the publisher retained this instrument for us; we
                // inherit that retain.
                let handle = unsafe { InstrumentHandle::from_identity_ptr(identity, signaller) };
                LayerInstrument::Sampler(handle)
            }
        };

        let old = std::mem::replace(&mut self.inst, new_inst);
        if let LayerInstrument::Sampler(old_handle) = old {
            old_handle.release();
        }

        self.inst_change_fade
            .force_set_as_fade_in(sample_rate, INSTRUMENT_CHANGE_FADE_MS);
        true
    }

    /// Release the current instrument retain. For shutdown/reset.
    pub fn drop_instrument(&mut self) {
        let old = std::mem::replace(&mut self.inst, LayerInstrument::None);
        if let LayerInstrument::Sampler(old_handle) = old {
            old_handle.release();
        }
    }

    // -----------------------------------------------------------------------
    // Block processing

    /// Apply EQ, volume, mute/solo mix and metering in place over the summed
    /// voice output of this layer.
    pub fn process(
        &mut self,
        master: &SmoothedValueSystem,
        num_frames: u32,
        buffer: &mut [f32],
    ) {
        debug_assert!(buffer.len() >= num_frames as usize * 2);

        for frame in 0..num_frames {
            let position = frame as usize * 2;
            let input = (buffer[position], buffer[position + 1]);
            let mut output = self.eq_bands.process(master, input, frame);

            let gain = master.value(self.vol_smoother_id, frame)
                * master.value(self.mute_solo_mix_smoother_id, frame)
                * self.inst_change_fade.get_fade();
            output.0 *= gain;
            output.1 *= gain;

            buffer[position] = output.0;
            buffer[position + 1] = output.1;
        }

        self.peak_meter
            .add_buffer(&buffer[..num_frames as usize * 2]);
    }

    pub fn reset_audio_processing(&mut self) {
        self.peak_meter.zero();
        self.inst_change_fade.force_set_full_volume();
    }

    /// True when any region of the current instrument defines a timbre
    /// crossfade window - the dynamics knob is live for this layer.
    pub fn uses_timbre_layering(&self) -> Option<TimbreLayerRange> {
        if let LayerInstrument::Sampler(handle) = &self.inst {
            for region in &handle.loaded().instrument.regions {
                if let Some(range) = region.timbre_layer_range {
                    return Some(range);
                }
            }
        }
        None
    }

    /// Drive the timbre crossfade of every active voice from the dynamics
    /// knob.
    pub fn set_dynamics(&mut self, pool: &mut VoicePool, dynamics_01: f32) {
        pool.for_each_active_layer_voice(self.index, |voice| {
            voice.update_xfade(dynamics_01, false);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Desired-instrument slot

    #[test]
    fn consume_returns_each_publish_exactly_once() {
        let slot = DesiredInst::default();
        assert!(slot.consume().is_none());

        slot.set_waveform(WaveformType::Sine);
        assert_eq!(
            slot.consume(),
            Some(DesiredUpdate::Waveform(WaveformType::Sine))
        );
        assert!(slot.consume().is_none(), "second consume must be empty");
        assert!(slot.is_consumed());
    }

    #[test]
    fn waveform_encodings_are_disjoint_from_pointers() {
        for kind in [
            WaveformType::Sine,
            WaveformType::WhiteNoiseMono,
            WaveformType::WhiteNoiseStereo,
        ] {
            let value = encode_waveform(kind);
            assert_ne!(value, 0);
            assert_ne!(value, CONSUMED);
            assert_ne!(value % 8, 0, "collides with an aligned pointer");
            assert_eq!(decode_waveform(value), Some(kind));
        }
    }

    #[test]
    fn publish_overwrite_returns_unconsumed_instrument() {
        let slot = DesiredInst::default();
        let fake_instrument = 0x1000 as *const ();
        assert!(slot.set_instrument(fake_instrument).is_none());
        // Overwriting before a consume hands back the old pointer so its
        // retain can be released.
        let old = slot.set_waveform(WaveformType::Sine);
        assert_eq!(old, Some(fake_instrument));
        assert_eq!(
            slot.consume(),
            Some(DesiredUpdate::Waveform(WaveformType::Sine))
        );
    }

    #[test]
    fn set_none_publishes_a_clear() {
        let slot = DesiredInst::default();
        slot.set_none();
        assert_eq!(slot.consume(), Some(DesiredUpdate::None));
    }

    #[test]
    fn concurrent_publishers_never_lose_a_retain() {
        use std::sync::atomic::AtomicUsize;

        // Each publisher counts how many old pointers it got back; total
        // published pointers == consumed + returned, so no retain leaks.
        let slot = Arc::new(DesiredInst::default());
        let returned = Arc::new(AtomicUsize::new(0));
        let consumed = Arc::new(AtomicUsize::new(0));

        let publishers: Vec<_> = (1..=4usize)
            .map(|thread_index| {
                let slot = Arc::clone(&slot);
                let returned = Arc::clone(&returned);
                std::thread::spawn(move || {
                    for i in 0..1000usize {
                        let fake = ((thread_index * 1_000_000 + i * 8 + 8) as *const ()) as usize;
                        if slot.set_instrument(fake as *const ()).is_some() {
                            returned.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();

        let consumer = {
            let slot = Arc::clone(&slot);
            let consumed = Arc::clone(&consumed);
            std::thread::spawn(move || {
                for _ in 0..20_000 {
                    if let Some(DesiredUpdate::Instrument(_)) = slot.consume() {
                        consumed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        };

        for p in publishers {
            p.join().unwrap();
        }
        consumer.join().unwrap();
        if let Some(DesiredUpdate::Instrument(_)) = slot.consume() {
            consumed.fetch_add(1, Ordering::Relaxed);
        }

        assert_eq!(
            consumed.load(Ordering::Relaxed) + returned.load(Ordering::Relaxed),
            4000
        );
    }

    // -----------------------------------------------------------------------
    // Velocity zones

    #[test]
    fn no_mapping_passes_velocity_through() {
        let mut master = SmoothedValueSystem::new();
        let mut layer = LayerProcessor::new(0, &mut master);
        layer.set_velocity_mapping(VelocityMappingMode::None);
        // Full velocity-to-volume: level equals velocity.
        assert!((layer.velocity_region_level(0.5, 1.0) - 0.5).abs() < 1e-6);
        // No velocity-to-volume: level is constant 1.
        assert!((layer.velocity_region_level(0.2, 0.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn top_to_bottom_fades_out_low_velocities() {
        let mut master = SmoothedValueSystem::new();
        let mut layer = LayerProcessor::new(0, &mut master);
        layer.set_velocity_mapping(VelocityMappingMode::TopToBottom);

        let high = layer.velocity_region_level(1.0, 0.0);
        let low = layer.velocity_region_level(0.05, 0.0);
        assert!((high - 1.0).abs() < 1e-6);
        assert_eq!(low, 0.0, "velocity below the zone should be silent");

        let mid = layer.velocity_region_level(0.5, 0.0);
        assert!(mid > 0.0 && mid < 1.0);
    }

    #[test]
    fn middle_outwards_peaks_at_centre() {
        let mut master = SmoothedValueSystem::new();
        let mut layer = LayerProcessor::new(0, &mut master);
        layer.set_velocity_mapping(VelocityMappingMode::MiddleOutwards);

        let centre = layer.velocity_region_level(0.5, 0.0);
        let bottom = layer.velocity_region_level(0.02, 0.0);
        let top = layer.velocity_region_level(1.0, 0.0);
        assert!(centre > bottom);
        assert!(centre > top * 0.5);
    }

    // -----------------------------------------------------------------------
    // Layer processing

    #[test]
    fn disabled_eq_is_transparent() {
        let mut master = SmoothedValueSystem::new();
        let mut layer = LayerProcessor::new(0, &mut master);
        master.prepare_to_play(64, 48000.0);
        let ctx = AudioContext {
            sample_rate: 48000.0,
            tempo_bpm: 120.0,
        };
        layer.prepare_to_play(&mut master, &ctx);
        master.process_block(64);

        let mut buffer: Vec<f32> = (0..128).map(|i| ((i as f32) * 0.1).sin()).collect();
        let original = buffer.clone();
        layer.process(&master, 64, &mut buffer);
        for (processed, raw) in buffer.iter().zip(&original) {
            assert!((processed - raw).abs() < 1e-5);
        }
    }

    #[test]
    fn muted_layer_ramps_to_silence() {
        let mut master = SmoothedValueSystem::new();
        let mut layer = LayerProcessor::new(0, &mut master);
        master.prepare_to_play(512, 48000.0);
        let ctx = AudioContext {
            sample_rate: 48000.0,
            tempo_bpm: 120.0,
        };
        layer.prepare_to_play(&mut master, &ctx);
        layer.set_silent(&mut master, true);

        // After the 10ms mute ramp, output is zero.
        let mut last_frame = (1.0f32, 1.0f32);
        for _ in 0..3 {
            master.process_block(512);
            let mut buffer = vec![1.0f32; 1024];
            layer.process(&master, 512, &mut buffer);
            last_frame = (buffer[1022], buffer[1023]);
        }
        assert_eq!(last_frame, (0.0, 0.0));
        assert!(layer.is_silent.load(Ordering::Relaxed));
    }

    #[test]
    fn peak_meter_sees_layer_output() {
        let mut master = SmoothedValueSystem::new();
        let mut layer = LayerProcessor::new(0, &mut master);
        master.prepare_to_play(512, 48000.0);
        let ctx = AudioContext {
            sample_rate: 48000.0,
            tempo_bpm: 120.0,
        };
        layer.prepare_to_play(&mut master, &ctx);

        for _ in 0..20 {
            master.process_block(512);
            let mut buffer = vec![0.5f32; 1024];
            layer.process(&master, 512, &mut buffer);
        }
        assert!(layer.peak_meter.snapshot().left > 0.1);
    }
}
