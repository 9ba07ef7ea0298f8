//! The host bridge: event routing, parameter fan-out and the per-block
//! processing pipeline.
//!
//! The host calls `prepare`, then `process` with a block of frames and
//! sample-accurate events. Events route to layers; note-ons allocate voices
//! from the shared pool; voices render (optionally fanned out on a host
//! thread pool); each layer applies EQ, volume and mute/solo to its summed
//! voices; layer buffers mix into the output under the master volume.
//!
//! Instrument loads go through a loader connection whose completion callback
//! publishes into the target layer's desired-instrument slot; the audio
//! thread consumes pending changes between blocks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::constants::{DEFAULT_TEMPO_BPM, NUM_LAYERS};
use crate::params::{
    default_linear, project_global, ChangedLayerParams, GlobalParamIndex, LayerParamIndex,
    ParamValue, LAYER_PARAM_COUNT,
};
use crate::samplib::loader::{
    AssetRef, Connection, InstrumentHandle, IrHandle, Loader, LoaderClient, LoadOutcome,
    LoadRequest, LoadResult,
};
use crate::samplib::{InstrumentId, IrId};
use crate::smoothing::{FloatId, SmoothedValueSystem};
use crate::types::{AudioContext, EventPayload, HostEvent, MidiChannelNote, RequestId};
use crate::voice::{VoiceController, WaveformType};
use crate::voice_pool::{AudioThreadPool, VoicePool};
use crate::layer::LayerProcessor;

/// Constructor-injected preferences.
#[derive(Debug, Clone)]
pub struct Prefs {
    /// Override for the loader's decode worker count.
    pub num_decode_threads: Option<usize>,
    /// Initial position of the dynamics (timbre) knob.
    pub default_dynamics: f32,
    /// Soft budget for decoded sample memory, surfaced to the GUI.
    pub max_sample_memory_bytes: usize,
}

impl Default for Prefs {
    fn default() -> Self {
        Self {
            num_decode_threads: None,
            default_dynamics: 0.5,
            max_sample_memory_bytes: crate::constants::DEFAULT_MAX_SAMPLE_MEMORY,
        }
    }
}

struct CurrentIr {
    handle: IrHandle,
}

pub struct Engine {
    ctx: AudioContext,
    max_block_size: u32,
    prepared: bool,

    smoothing: SmoothedValueSystem,
    master_vol_smoother_id: FloatId,
    layers: Vec<LayerProcessor>,
    pool: VoicePool,

    layer_params: Vec<[ParamValue; LAYER_PARAM_COUNT]>,
    layer_changed: [u64; NUM_LAYERS],
    global_params: [f32; crate::params::GLOBAL_PARAM_COUNT],

    sustain_pedal_on: [bool; 16],
    sustained_notes: [u128; 16],

    client: LoaderClient,
    connection: Arc<Connection>,
    pending_instrument_loads: Arc<Mutex<HashMap<RequestId, usize>>>,
    current_ir: Arc<Mutex<Option<CurrentIr>>>,

    pub prefs: Prefs,
}

impl Engine {
    pub fn new(loader: &Loader, prefs: Prefs) -> Self {
        let mut smoothing = SmoothedValueSystem::new();
        let master_vol_smoother_id = smoothing.create_smoother();
        let layers: Vec<LayerProcessor> = (0..NUM_LAYERS)
            .map(|index| LayerProcessor::new(index, &mut smoothing))
            .collect();

        let pending_instrument_loads: Arc<Mutex<HashMap<RequestId, usize>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let current_ir: Arc<Mutex<Option<CurrentIr>>> = Arc::new(Mutex::new(None));

        let client = loader.client();
        let connection = {
            let desired: Vec<_> = layers
                .iter()
                .map(|layer| Arc::clone(&layer.desired_inst))
                .collect();
            let pending = Arc::clone(&pending_instrument_loads);
            let ir_slot = Arc::clone(&current_ir);
            let callback_client = client.clone();
            loader.open_connection(Box::new(move |result: &LoadResult| {
                on_load_completed(result, &desired, &pending, &ir_slot, &callback_client);
            }))
        };

        let engine = Self {
            ctx: AudioContext {
                sample_rate: 0.0,
                tempo_bpm: DEFAULT_TEMPO_BPM,
            },
            max_block_size: 0,
            prepared: false,
            smoothing,
            master_vol_smoother_id,
            layers,
            pool: VoicePool::new(),
            layer_params: (0..NUM_LAYERS)
                .map(|_| std::array::from_fn(|i| default_param_value(i)))
                .collect(),
            layer_changed: [0; NUM_LAYERS],
            global_params: [
                project_global(GlobalParamIndex::MasterVolume, 0.5),
                prefs.default_dynamics,
                project_global(GlobalParamIndex::VelocityToVolume, 1.0),
            ],
            sustain_pedal_on: [false; 16],
            sustained_notes: [0; 16],
            client,
            connection,
            pending_instrument_loads,
            current_ir,
            prefs,
        };
        engine
    }

    // -----------------------------------------------------------------------
    // Audio callback interface

    pub fn prepare(&mut self, sample_rate: f32, max_block_size: u32) {
        debug_assert!(sample_rate > 0.0 && max_block_size > 0);
        self.ctx.sample_rate = sample_rate;
        self.max_block_size = max_block_size;

        self.smoothing.prepare_to_play(max_block_size, sample_rate);
        self.smoothing.hard_set(
            self.master_vol_smoother_id,
            self.global_params[GlobalParamIndex::MasterVolume as usize],
        );
        self.pool.prepare_to_play(sample_rate, max_block_size);

        let ctx = self.ctx;
        for layer in &mut self.layers {
            layer.prepare_to_play(&mut self.smoothing, &ctx);
        }

        // Push the full parameter bank through each layer once so every
        // derived value (envelope coefficients, filter state, ...) is
        // consistent with the sample rate.
        for layer_index in 0..NUM_LAYERS {
            let view = ChangedLayerParams::all(&self.layer_params[layer_index]);
            self.layers[layer_index].on_param_change(
                &mut self.smoothing,
                &mut self.pool,
                &ctx,
                view,
            );
        }

        self.prepared = true;
    }

    pub fn reset(&mut self) {
        self.pool.end_all_voices_instantly();
        self.pool.reset_markers();
        self.smoothing.reset_all();
        for layer in &mut self.layers {
            layer.reset_audio_processing();
        }
        self.sustain_pedal_on = [false; 16];
        self.sustained_notes = [0; 16];
    }

    /// Render `events` into `output` (interleaved stereo). Blocks larger
    /// than the prepared maximum are processed in internal chunks.
    pub fn process(
        &mut self,
        output: &mut [f32],
        events: &[HostEvent],
        host_pool: Option<&dyn AudioThreadPool>,
    ) {
        debug_assert!(self.prepared);
        debug_assert!(output.len() % 2 == 0);
        let total_frames = (output.len() / 2) as u32;

        let mut chunk_start = 0u32;
        let mut event_cursor = 0usize;
        while chunk_start < total_frames {
            let chunk_frames = (total_frames - chunk_start).min(self.max_block_size);

            // Events for this chunk, offsets rebased to the chunk start.
            let chunk_end = chunk_start + chunk_frames;
            let events_start = event_cursor;
            while event_cursor < events.len()
                && events[event_cursor].frame_offset < chunk_end
            {
                event_cursor += 1;
            }
            let chunk_events = &events[events_start..event_cursor];

            let out_range =
                chunk_start as usize * 2..(chunk_start as usize + chunk_frames as usize) * 2;
            self.process_chunk(
                &mut output[out_range],
                chunk_frames,
                chunk_events,
                chunk_start,
                host_pool,
            );
            chunk_start = chunk_end;
        }
    }

    fn process_chunk(
        &mut self,
        output: &mut [f32],
        num_frames: u32,
        events: &[HostEvent],
        frame_base: u32,
        host_pool: Option<&dyn AudioThreadPool>,
    ) {
        // Consume pending instrument changes first so a note-on in this
        // very block already plays the new instrument.
        let ctx = self.ctx;
        for layer in &mut self.layers {
            layer.change_instrument_if_needed(
                &mut self.pool,
                &ctx,
                self.client.work_signaller(),
            );
        }

        for event in events {
            let offset = event.frame_offset.saturating_sub(frame_base);
            self.handle_event(event.payload, offset);
        }
        self.flush_param_changes();

        self.smoothing.process_block(num_frames);

        let controllers: [&VoiceController; NUM_LAYERS] =
            std::array::from_fn(|i| &self.layers[i].controller);
        let _layers_written =
            self.pool
                .process_voices(num_frames, &self.smoothing, controllers, host_pool);

        output.fill(0.0);
        for layer_index in 0..NUM_LAYERS {
            let buffer = self.pool.layer_buffer_mut(layer_index, num_frames);
            self.layers[layer_index].process(&self.smoothing, num_frames, buffer);

            for (out, sample) in output.iter_mut().zip(buffer.iter()) {
                *out += sample;
            }
        }

        // Master volume on the summed output.
        for frame in 0..num_frames {
            let gain = self.smoothing.value(self.master_vol_smoother_id, frame);
            output[frame as usize * 2] *= gain;
            output[frame as usize * 2 + 1] *= gain;
        }
    }

    fn handle_event(&mut self, payload: EventPayload, frame_offset: u32) {
        match payload {
            EventPayload::NoteOn {
                channel,
                note,
                velocity,
            } => {
                self.note_on(channel, note, velocity, frame_offset);
            }
            EventPayload::NoteOff { channel, note } => {
                self.note_off(channel, note, false);
            }
            EventPayload::ControlChange {
                channel,
                number,
                value,
            } => {
                if number == 64 {
                    self.set_sustain_pedal(channel, value >= 0.5);
                }
            }
            EventPayload::ChannelPressure { channel, value } => {
                self.pool.for_each_active_voice(|voice| {
                    if voice.midi_key_trigger.channel == channel {
                        voice.aftertouch_multiplier = 1.0 + value * 0.5;
                    }
                });
            }
            EventPayload::ParamChange {
                layer_index,
                param,
                linear,
            } => {
                if (layer_index as usize) < NUM_LAYERS {
                    self.stage_layer_param(layer_index as usize, param, linear);
                }
            }
            EventPayload::Tempo { bpm } => {
                self.set_tempo(bpm);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Playback API

    pub fn note_on(&mut self, channel: u8, note: u8, velocity: f32, frame_offset: u32) {
        for layer_index in 0..NUM_LAYERS {
            self.layer_note_on(layer_index, channel, note, velocity, frame_offset);
        }
    }

    /// Note-on routed to a single layer.
    pub fn layer_note_on(
        &mut self,
        layer_index: usize,
        channel: u8,
        note: u8,
        velocity: f32,
        frame_offset: u32,
    ) {
        let dynamics = self.global_params[GlobalParamIndex::Dynamics as usize];
        let velocity_to_volume =
            self.global_params[GlobalParamIndex::VelocityToVolume as usize];
        self.layers[layer_index].handle_note_on(
            &self.smoothing,
            &mut self.pool,
            MidiChannelNote { channel, note },
            velocity.clamp(0.0, 1.0),
            frame_offset,
            dynamics,
            velocity_to_volume,
        );
    }

    /// Note-off routed to a single layer.
    pub fn layer_note_off(
        &mut self,
        layer_index: usize,
        channel: u8,
        note: u8,
        is_cc64_triggered: bool,
    ) {
        let ch = (channel & 0x0F) as usize;
        if !is_cc64_triggered && self.sustain_pedal_on[ch] {
            self.sustained_notes[ch] |= 1u128 << note.min(127);
            return;
        }
        self.layers[layer_index].handle_note_off(&mut self.pool, MidiChannelNote { channel, note });
    }

    pub fn note_off(&mut self, channel: u8, note: u8, is_cc64_triggered: bool) {
        let ch = (channel & 0x0F) as usize;
        if !is_cc64_triggered && self.sustain_pedal_on[ch] {
            self.sustained_notes[ch] |= 1u128 << note.min(127);
            return;
        }
        let key = MidiChannelNote { channel, note };
        for layer in &mut self.layers {
            layer.handle_note_off(&mut self.pool, key);
        }
    }

    fn set_sustain_pedal(&mut self, channel: u8, down: bool) {
        let ch = (channel & 0x0F) as usize;
        if self.sustain_pedal_on[ch] == down {
            return;
        }
        self.sustain_pedal_on[ch] = down;
        if !down {
            let held = std::mem::take(&mut self.sustained_notes[ch]);
            for note in 0u8..128 {
                if held & (1u128 << note) != 0 {
                    self.note_off(channel, note, true);
                }
            }
        }
    }

    pub fn set_tempo(&mut self, bpm: f64) {
        if bpm <= 0.0 || bpm == self.ctx.tempo_bpm {
            return;
        }
        self.ctx.tempo_bpm = bpm;
        let ctx = self.ctx;
        for layer in &mut self.layers {
            layer.set_tempo(&mut self.pool, &ctx);
        }
    }

    // -----------------------------------------------------------------------
    // Parameter API

    /// Audio-thread entry for a layer parameter change; applied to the DSP
    /// state before the next chunk renders.
    pub fn stage_layer_param(
        &mut self,
        layer_index: usize,
        param: LayerParamIndex,
        linear: f32,
    ) {
        debug_assert!(layer_index < NUM_LAYERS);
        self.layer_params[layer_index][param as usize] = ParamValue::new(param, linear);
        self.layer_changed[layer_index] |= 1u64 << param as usize;
    }

    pub fn set_global_param(&mut self, param: GlobalParamIndex, linear: f32) {
        let projected = project_global(param, linear);
        self.global_params[param as usize] = projected;
        match param {
            GlobalParamIndex::MasterVolume => {
                self.smoothing.set_variable_length(
                    self.master_vol_smoother_id,
                    projected,
                    crate::constants::PARAM_SMOOTHING_MIN_MS,
                    crate::constants::PARAM_SMOOTHING_MAX_MS,
                    1.0,
                );
            }
            GlobalParamIndex::Dynamics => {
                for layer in &mut self.layers {
                    layer.set_dynamics(&mut self.pool, projected);
                }
            }
            GlobalParamIndex::VelocityToVolume => {}
        }
    }

    fn flush_param_changes(&mut self) {
        let ctx = self.ctx;
        let mut solo_changed = false;
        for layer_index in 0..NUM_LAYERS {
            let changed = std::mem::take(&mut self.layer_changed[layer_index]);
            if changed == 0 {
                continue;
            }
            let mute_solo_mask = (1u64 << LayerParamIndex::Mute as usize)
                | (1u64 << LayerParamIndex::Solo as usize);
            if changed & mute_solo_mask != 0 {
                solo_changed = true;
            }
            let view = ChangedLayerParams::new(&self.layer_params[layer_index], changed);
            self.layers[layer_index].on_param_change(
                &mut self.smoothing,
                &mut self.pool,
                &ctx,
                view,
            );
        }

        if solo_changed {
            self.update_mute_solo_states();
        }
    }

    /// A soloed layer silences every non-soloed one; otherwise mute flags
    /// rule.
    fn update_mute_solo_states(&mut self) {
        let any_solo = self.layers.iter().any(|layer| layer.solo);
        for layer_index in 0..NUM_LAYERS {
            let layer = &self.layers[layer_index];
            let silent = if any_solo {
                !layer.solo
            } else {
                layer.mute
            };
            self.layers[layer_index].set_silent(&mut self.smoothing, silent);
        }
    }

    // -----------------------------------------------------------------------
    // Load API

    pub fn load_instrument(&self, layer_index: usize, id: InstrumentId) -> RequestId {
        debug_assert!(layer_index < NUM_LAYERS);
        let request = LoadRequest::Instrument {
            layer_index: layer_index as u32,
            id,
        };
        // Map the request to its layer before sending so the callback can
        // never observe an unknown id.
        let mut pending = self.pending_instrument_loads.lock().unwrap();
        let request_id = self.client.send_load_request(&self.connection, request);
        pending.insert(request_id, layer_index);
        request_id
    }

    pub fn load_ir(&self, id: IrId) -> RequestId {
        self.client
            .send_load_request(&self.connection, LoadRequest::Ir { id })
    }

    /// Swap a layer to a built-in waveform, bypassing the loader.
    pub fn set_waveform_instrument(&self, layer_index: usize, kind: WaveformType) {
        if let Some(old) = self.layers[layer_index].desired_inst.set_waveform(kind) {
            self.release_identity(old);
        }
    }

    pub fn clear_instrument(&self, layer_index: usize) {
        if let Some(old) = self.layers[layer_index].desired_inst.set_none() {
            self.release_identity(old);
        }
    }

    fn release_identity(&self, identity: *const ()) {
        // Safety: identity pointers in the desired slots always carry a
        // retain taken by their publisher.
        unsafe { InstrumentHandle::from_identity_ptr(identity, self.client.work_signaller()) }
            .release();
    }

    pub fn loading_percent(&self, layer_index: usize) -> i32 {
        self.connection.instrument_loading_percents[layer_index]
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // Introspection

    pub fn layer(&self, layer_index: usize) -> &LayerProcessor {
        &self.layers[layer_index]
    }

    pub fn pool(&self) -> &VoicePool {
        &self.pool
    }

    pub fn context(&self) -> AudioContext {
        self.ctx
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.pool.end_all_voices_instantly();
        let client = self.client.clone();
        for layer in &mut self.layers {
            layer.drop_instrument();
            if let Some(crate::layer::DesiredUpdate::Instrument(identity)) =
                layer.desired_inst.consume()
            {
                // Safety: unconsumed publishes always carry a retain.
                unsafe {
                    InstrumentHandle::from_identity_ptr(identity, client.work_signaller())
                }
                .release();
            }
        }
        if let Some(ir) = self.current_ir.lock().unwrap().take() {
            ir.handle.release();
        }
        self.client.close_connection(&self.connection);
    }
}

fn default_param_value(param_index: usize) -> ParamValue {
    let param = LayerParamIndex::from_repr(param_index).expect("valid param index");
    ParamValue::new(param, default_linear(param))
}

fn on_load_completed(
    result: &LoadResult,
    desired: &[Arc<crate::layer::DesiredInst>],
    pending: &Mutex<HashMap<RequestId, usize>>,
    ir_slot: &Mutex<Option<CurrentIr>>,
    client: &LoaderClient,
) {
    match &result.outcome {
        LoadOutcome::Success(AssetRef::Instrument(handle)) => {
            let Some(layer_index) = pending.lock().unwrap().remove(&result.id) else {
                return;
            };
            // The retain for the slot transfers to whoever consumes it.
            handle.retain();
            if let Some(old) = desired[layer_index].set_instrument(handle.ptr_for_identity()) {
                // Safety: the overwritten pointer still carries its
                // publisher's retain.
                unsafe { InstrumentHandle::from_identity_ptr(old, client.work_signaller()) }
                    .release();
            }
        }
        LoadOutcome::Success(AssetRef::Ir(handle)) => {
            handle.retain();
            let old = ir_slot.lock().unwrap().replace(CurrentIr { handle: *handle });
            if let Some(old) = old {
                old.handle.release();
            }
        }
        LoadOutcome::Error(_) | LoadOutcome::Cancelled => {
            pending.lock().unwrap().remove(&result.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samplib::loader::Loader;
    use crate::samplib::{
        AudioData, AudioDecoder, Instrument, InstrumentMetadata, Library, LibraryId,
        LibraryProvider, Region,
    };
    use crate::sync::error_notifications::ErrorNotifications;
    use crate::types::LoadError;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    const TEST_SOURCE_FRAMES: u32 = 8192;
    const TEST_SOURCE_RATE: u32 = 44100;

    fn source_sample(frame: u32) -> f32 {
        // A gentle low-frequency sine; linear interpolation error stays far
        // below the comparison tolerance.
        ((frame as f32) * 0.003).sin() * 0.5
    }

    struct RampProvider;

    impl LibraryProvider for RampProvider {
        fn read_libraries(&self) -> Result<Vec<Library>, LoadError> {
            Ok(vec![Library {
                id: LibraryId {
                    author: "Tests".to_string(),
                    name: "Engine".to_string(),
                },
                version: "1.0.0".to_string(),
                url: String::new(),
                path: PathBuf::from("/virtual"),
                content_hash: 7,
                instruments: vec![Instrument {
                    name: "Ramp".to_string(),
                    metadata: InstrumentMetadata::default(),
                    regions: vec![Region {
                        path: PathBuf::from("ramp.wav"),
                        root_key: 60,
                        key_range: (0, 128),
                        velocity_range: (0, 128),
                        round_robin_index: None,
                        timbre_layer_range: None,
                        builtin_loop: None,
                        always_loop: false,
                        gain_db: 0.0,
                    }],
                }],
                irs: Vec::new(),
            }])
        }
    }

    struct RampDecoder;

    impl AudioDecoder for RampDecoder {
        fn decode(&self, _path: &Path) -> Result<AudioData, LoadError> {
            let samples: Vec<f32> = (0..TEST_SOURCE_FRAMES)
                .flat_map(|i| {
                    let v = source_sample(i);
                    [v, v]
                })
                .collect();
            Ok(AudioData {
                num_frames: TEST_SOURCE_FRAMES,
                sample_rate: TEST_SOURCE_RATE,
                channels: 2,
                samples: samples.into_boxed_slice(),
            })
        }
    }

    fn engine_with_loader() -> (Loader, Engine) {
        let loader = Loader::new(
            Box::new(RampProvider),
            Box::new(RampDecoder),
            Arc::new(ErrorNotifications::new()),
            Some(1),
        );
        let engine = Engine::new(&loader, Prefs::default());
        (loader, engine)
    }

    fn ramp_instrument_id() -> InstrumentId {
        InstrumentId {
            library: LibraryId {
                author: "Tests".to_string(),
                name: "Engine".to_string(),
            },
            instrument_name: "Ramp".to_string(),
        }
    }

    fn wait_for_instrument(engine: &mut Engine) {
        // The load callback publishes into the desired slot; consuming
        // happens at the next process call. Give the loader a moment.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let mut silence = [0.0f32; 64];
            engine.process(&mut silence, &[], None);
            if matches!(
                engine.layer(0).inst,
                crate::layer::LayerInstrument::Sampler(_)
            ) {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "instrument never arrived");
            std::thread::sleep(Duration::from_millis(5));
        }
        // Let the layer's instrument-change fade-in complete.
        let mut silence = vec![0.0f32; 256];
        for _ in 0..10 {
            engine.process(&mut silence, &[], None);
        }
    }

    #[test]
    fn sine_layer_produces_audio_and_note_off_silences_it() {
        let (_loader, mut engine) = engine_with_loader();
        engine.prepare(48000.0, 512);
        engine.set_waveform_instrument(0, WaveformType::Sine);

        // Short release so the tail dies quickly.
        engine.stage_layer_param(0, LayerParamIndex::VolumeRelease, 0.08);

        let events = [HostEvent {
            frame_offset: 0,
            payload: EventPayload::NoteOn {
                channel: 0,
                note: 69,
                velocity: 0.9,
            },
        }];
        let mut output = vec![0.0f32; 1024];
        engine.process(&mut output, &events, None);
        let peak = output.iter().fold(0.0f32, |a, &b| a.max(b.abs()));
        assert!(peak > 0.01, "no audio after note on: {}", peak);

        engine.note_off(0, 69, false);
        // Run long enough for the release to finish.
        for _ in 0..100 {
            engine.process(&mut output, &[], None);
        }
        let tail_peak = output.iter().fold(0.0f32, |a, &b| a.max(b.abs()));
        assert!(tail_peak < 1e-5, "voice still audible: {}", tail_peak);
        assert_eq!(
            engine
                .pool()
                .num_active_voices
                .load(std::sync::atomic::Ordering::Relaxed),
            0
        );
    }

    #[test]
    fn sampler_note_plays_at_the_source_to_output_rate_ratio() {
        let (_loader, mut engine) = engine_with_loader();
        engine.prepare(48000.0, 512);
        // No envelope shaping; we want the raw stream.
        engine.stage_layer_param(0, LayerParamIndex::VolEnvOn, 0.0);
        engine.load_instrument(0, ramp_instrument_id());
        wait_for_instrument(&mut engine);

        engine.note_on(0, 60, 1.0, 0);
        let mut output = vec![0.0f32; 1024];
        engine.process(&mut output, &[], None);

        // root key 60 played at 60: ratio is purely the rate conversion.
        let ratio = TEST_SOURCE_RATE as f64 / 48000.0;
        // Equal-power centre pan leaves cos(45deg) per side.
        let pan_gain = std::f32::consts::SQRT_2 / 2.0;

        // Skip the start fade-in (0.25ms = 12 frames); compare the rest.
        for frame in 50..256u32 {
            let source_pos = frame as f64 * ratio;
            let base = source_pos.floor() as u32;
            let frac = (source_pos - base as f64) as f32;
            let expected =
                (source_sample(base) + frac * (source_sample(base + 1) - source_sample(base)))
                    * pan_gain;
            let actual = output[frame as usize * 2];
            assert!(
                (actual - expected).abs() < 1e-4,
                "frame {}: {} vs {}",
                frame,
                actual,
                expected
            );
        }
    }

    #[test]
    fn superseded_load_leaves_the_layer_with_the_newest_instrument() {
        let (_loader, mut engine) = engine_with_loader();
        engine.prepare(48000.0, 256);
        let a = engine.load_instrument(0, ramp_instrument_id());
        let b = engine.load_instrument(0, ramp_instrument_id());
        assert!(b > a);
        wait_for_instrument(&mut engine);
        // The slot was consumed exactly once and holds no stale publish.
        assert!(engine.layer(0).desired_inst.is_consumed());
    }

    #[test]
    fn blocks_larger_than_prepared_max_are_chunked() {
        let (_loader, mut engine) = engine_with_loader();
        engine.prepare(48000.0, 128);
        engine.set_waveform_instrument(0, WaveformType::Sine);

        let events = [HostEvent {
            frame_offset: 300, // beyond the first internal chunk
            payload: EventPayload::NoteOn {
                channel: 0,
                note: 60,
                velocity: 1.0,
            },
        }];
        let mut output = vec![0.0f32; 2048]; // 1024 frames > 128 max
        engine.process(&mut output, &events, None);

        let before: f32 = output[..280 * 2].iter().map(|s| s.abs()).sum();
        let after = output[600 * 2..].iter().fold(0.0f32, |a, &b| a.max(b.abs()));
        assert!(before < 1e-6, "audio before the scheduled note-on");
        assert!(after > 0.001, "no audio after the scheduled note-on");
    }

    #[test]
    fn sustain_pedal_defers_note_offs() {
        let (_loader, mut engine) = engine_with_loader();
        engine.prepare(48000.0, 256);
        engine.set_waveform_instrument(0, WaveformType::Sine);

        let mut output = vec![0.0f32; 512];
        // Consume the waveform publish before playing directly.
        engine.process(&mut output, &[], None);
        engine.note_on(0, 72, 0.8, 0);
        engine.process(&mut output, &[], None);

        // Pedal down, note off: the voice must keep sounding.
        engine.handle_event(
            EventPayload::ControlChange {
                channel: 0,
                number: 64,
                value: 1.0,
            },
            0,
        );
        engine.note_off(0, 72, false);
        engine.process(&mut output, &[], None);
        assert!(
            engine
                .pool()
                .num_active_voices
                .load(std::sync::atomic::Ordering::Relaxed)
                > 0,
            "sustained voice released early"
        );

        // Pedal up: the deferred note-off fires and the voice releases.
        engine.handle_event(
            EventPayload::ControlChange {
                channel: 0,
                number: 64,
                value: 0.0,
            },
            0,
        );
        for _ in 0..400 {
            engine.process(&mut output, &[], None);
        }
        assert_eq!(
            engine
                .pool()
                .num_active_voices
                .load(std::sync::atomic::Ordering::Relaxed),
            0
        );
    }

    #[test]
    fn solo_silences_other_layers() {
        let (_loader, mut engine) = engine_with_loader();
        engine.prepare(48000.0, 256);
        engine.stage_layer_param(1, LayerParamIndex::Solo, 1.0);
        let mut output = vec![0.0f32; 512];
        engine.process(&mut output, &[], None);

        assert!(engine
            .layer(0)
            .is_silent
            .load(std::sync::atomic::Ordering::Relaxed));
        assert!(!engine
            .layer(1)
            .is_silent
            .load(std::sync::atomic::Ordering::Relaxed));
    }
}
