//! Smoothed value system: a bank of per-parameter ramps.
//!
//! Every audio-rate parameter gets a slot here instead of being applied
//! directly, which is what prevents zipper noise. Slots come in three kinds:
//! float ramps, double ramps (pitch ratios need the precision) and biquad
//! coefficient blends. Slots are created up front; `prepare_to_play` sizes
//! the per-block result buffers once and nothing allocates after that.
//!
//! Ids are distinct newtypes per kind so a float id can never be used to read
//! a double slot.

use crate::dsp::biquad::{BiquadParams, SmoothedBiquadCoeffs, SmoothedCoeffsFrame};
use crate::dsp::math::map;

/// Id of a float smoothing slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FloatId(u16);

/// Id of a double smoothing slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoubleId(u16);

/// Id of a filter-coefficient smoothing slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterId(u16);

pub trait SmoothedScalar:
    Copy
    + PartialEq
    + PartialOrd
    + std::ops::Add<Output = Self>
    + std::ops::Sub<Output = Self>
    + std::ops::Div<Output = Self>
    + std::ops::AddAssign
{
    const ZERO: Self;
    fn from_u32(v: u32) -> Self;
    fn abs_value(self) -> Self;
    fn to_f32(self) -> f32;
    fn from_f32(v: f32) -> Self;
}

impl SmoothedScalar for f32 {
    const ZERO: Self = 0.0;
    fn from_u32(v: u32) -> Self {
        v as f32
    }
    fn abs_value(self) -> Self {
        self.abs()
    }
    fn to_f32(self) -> f32 {
        self
    }
    fn from_f32(v: f32) -> Self {
        v
    }
}

impl SmoothedScalar for f64 {
    const ZERO: Self = 0.0;
    fn from_u32(v: u32) -> Self {
        v as f64
    }
    fn abs_value(self) -> Self {
        self.abs()
    }
    fn to_f32(self) -> f32 {
        self as f32
    }
    fn from_f32(v: f32) -> Self {
        v as f64
    }
}

#[derive(Clone, Copy, Default)]
struct SmoothedValue<T> {
    current: T,
    target: T,
}

struct ValueSmoother<T> {
    result_buffer: Vec<T>,
    smoothed_values: Vec<SmoothedValue<T>>,
    remaining_steps: Vec<u32>,
    frames_smoothed_this_block: Vec<u32>,
    block_size: u32,
}

impl<T: SmoothedScalar + Default> ValueSmoother<T> {
    fn new() -> Self {
        Self {
            result_buffer: Vec::new(),
            smoothed_values: Vec::new(),
            remaining_steps: Vec::new(),
            frames_smoothed_this_block: Vec::new(),
            block_size: 0,
        }
    }

    fn prepare_to_play(&mut self, block_size: u32) {
        self.block_size = block_size;
        self.result_buffer = vec![T::ZERO; block_size as usize * self.smoothed_values.len()];
    }

    fn create_smoother(&mut self) -> u16 {
        debug_assert!(self.block_size == 0, "create smoothers before prepare_to_play");
        let id = self.smoothed_values.len() as u16;
        self.smoothed_values.push(SmoothedValue::default());
        self.remaining_steps.push(0);
        self.frames_smoothed_this_block.push(0);
        id
    }

    fn set(&mut self, id: u16, value: T, transition_ms: f32, sample_rate: f32) {
        let slot = &mut self.smoothed_values[id as usize];
        if value == slot.target {
            return;
        }
        slot.target = value;
        let num = (sample_rate as f64 * (transition_ms as f64 / 1000.0)) as u32;
        if num == 0 {
            return;
        }
        self.remaining_steps[id as usize] = num;
    }

    fn set_variable_length(
        &mut self,
        id: u16,
        value: T,
        min_transition_ms: f32,
        max_transition_ms: f32,
        max_expected_change: f32,
        sample_rate: f32,
    ) {
        let delta = (value - self.smoothed_values[id as usize].current)
            .abs_value()
            .to_f32();
        let transition_ms = map(
            delta.min(max_expected_change),
            0.0,
            max_expected_change,
            min_transition_ms,
            max_transition_ms,
        );
        self.set(id, value, transition_ms, sample_rate);
    }

    fn hard_set(&mut self, id: u16, value: T) {
        let slot = &mut self.smoothed_values[id as usize];
        slot.target = value;
        slot.current = value;
        self.remaining_steps[id as usize] = 0;
    }

    fn reset_all(&mut self) {
        for slot in &mut self.smoothed_values {
            slot.current = slot.target;
        }
        for r in &mut self.remaining_steps {
            *r = 0;
        }
        for n in &mut self.frames_smoothed_this_block {
            *n = 0;
        }
    }

    #[inline]
    fn value(&self, id: u16, frame_index: u32) -> T {
        debug_assert!(frame_index < self.block_size);
        if frame_index < self.frames_smoothed_this_block[id as usize] {
            self.result_buffer[id as usize * self.block_size as usize + frame_index as usize]
        } else {
            self.smoothed_values[id as usize].target
        }
    }

    #[inline]
    fn is_smoothing(&self, id: u16, frame_index: u32) -> bool {
        frame_index < self.frames_smoothed_this_block[id as usize]
    }

    fn all_values(&mut self, id: u16, block_size: u32) -> &[T] {
        let offset = id as usize * self.block_size as usize;
        let smoothed = self.frames_smoothed_this_block[id as usize];
        if smoothed < block_size {
            let target = self.smoothed_values[id as usize].target;
            for v in
                &mut self.result_buffer[offset + smoothed as usize..offset + block_size as usize]
            {
                *v = target;
            }
        }
        &self.result_buffer[offset..offset + block_size as usize]
    }

    fn target_value(&self, id: u16) -> T {
        self.smoothed_values[id as usize].target
    }

    fn process_block(&mut self, block_size: u32) {
        debug_assert!(block_size <= self.block_size);
        for n in &mut self.frames_smoothed_this_block {
            *n = 0;
        }

        for index in 0..self.smoothed_values.len() {
            let remaining = &mut self.remaining_steps[index];
            if *remaining == 0 {
                continue;
            }
            let initial_remaining = *remaining;
            let slot = &mut self.smoothed_values[index];
            let offset = index * self.block_size as usize;
            let mut i = 0;
            while i < block_size && *remaining > 0 {
                slot.current += (slot.target - slot.current) / T::from_u32(*remaining);
                *remaining -= 1;
                self.result_buffer[offset + i as usize] = slot.current;
                i += 1;
            }
            self.frames_smoothed_this_block[index] = initial_remaining - *remaining;
        }
    }
}

pub struct SmoothedValueSystem {
    sample_rate: f32,
    num_valid_frames: u32,
    float_smoothers: ValueSmoother<f32>,
    double_smoothers: ValueSmoother<f64>,
    filter_smoothers: Vec<SmoothedBiquadCoeffs>,
    filter_result_buffer: Vec<SmoothedCoeffsFrame>,
    filter_processed_this_block: Vec<bool>,
    filter_block_size: u32,
}

impl Default for SmoothedValueSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl SmoothedValueSystem {
    pub fn new() -> Self {
        Self {
            sample_rate: 1.0,
            num_valid_frames: 0,
            float_smoothers: ValueSmoother::new(),
            double_smoothers: ValueSmoother::new(),
            filter_smoothers: Vec::new(),
            filter_result_buffer: Vec::new(),
            filter_processed_this_block: Vec::new(),
            filter_block_size: 0,
        }
    }

    pub fn prepare_to_play(&mut self, block_size: u32, sample_rate: f32) {
        self.sample_rate = sample_rate;
        self.filter_block_size = block_size;
        self.float_smoothers.prepare_to_play(block_size);
        self.double_smoothers.prepare_to_play(block_size);
        self.filter_result_buffer = vec![
            SmoothedCoeffsFrame {
                coeffs: Default::default(),
                mix: 1.0
            };
            block_size as usize * self.filter_smoothers.len()
        ];
    }

    pub fn create_smoother(&mut self) -> FloatId {
        FloatId(self.float_smoothers.create_smoother())
    }

    pub fn create_double_smoother(&mut self) -> DoubleId {
        DoubleId(self.double_smoothers.create_smoother())
    }

    pub fn create_filter_smoother(&mut self) -> FilterId {
        let id = self.filter_smoothers.len() as u16;
        let mut smoother = SmoothedBiquadCoeffs::default();
        smoother.reset_smoothing();
        self.filter_smoothers.push(smoother);
        self.filter_processed_this_block.push(false);
        FilterId(id)
    }

    pub fn set(&mut self, id: FloatId, value: f32, transition_ms: f32) {
        self.float_smoothers
            .set(id.0, value, transition_ms, self.sample_rate);
    }

    pub fn set_f64(&mut self, id: DoubleId, value: f64, transition_ms: f32) {
        self.double_smoothers
            .set(id.0, value, transition_ms, self.sample_rate);
    }

    pub fn set_variable_length(
        &mut self,
        id: FloatId,
        value: f32,
        min_transition_ms: f32,
        max_transition_ms: f32,
        max_expected_change: f32,
    ) {
        self.float_smoothers.set_variable_length(
            id.0,
            value,
            min_transition_ms,
            max_transition_ms,
            max_expected_change,
            self.sample_rate,
        );
    }

    pub fn hard_set(&mut self, id: FloatId, value: f32) {
        self.float_smoothers.hard_set(id.0, value);
    }

    pub fn hard_set_f64(&mut self, id: DoubleId, value: f64) {
        self.double_smoothers.hard_set(id.0, value);
    }

    pub fn set_filter(&mut self, id: FilterId, params: &BiquadParams) {
        self.filter_smoothers[id.0 as usize].set(params);
    }

    #[inline]
    pub fn value(&self, id: FloatId, frame_index: u32) -> f32 {
        self.float_smoothers.value(id.0, frame_index)
    }

    #[inline]
    pub fn value_f64(&self, id: DoubleId, frame_index: u32) -> f64 {
        self.double_smoothers.value(id.0, frame_index)
    }

    #[inline]
    pub fn is_smoothing(&self, id: FloatId, frame_index: u32) -> bool {
        self.float_smoothers.is_smoothing(id.0, frame_index)
    }

    #[inline]
    pub fn filter_value(&self, id: FilterId, frame_index: u32) -> SmoothedCoeffsFrame {
        debug_assert!(frame_index < self.num_valid_frames);
        if self.filter_processed_this_block[id.0 as usize] {
            self.filter_result_buffer
                [id.0 as usize * self.num_valid_frames as usize + frame_index as usize]
        } else {
            SmoothedCoeffsFrame {
                coeffs: self.filter_smoothers[id.0 as usize].coeffs(),
                mix: 1.0,
            }
        }
    }

    pub fn all_values(&mut self, id: FloatId) -> &[f32] {
        self.float_smoothers.all_values(id.0, self.num_valid_frames)
    }

    pub fn target_value(&self, id: FloatId) -> f32 {
        self.float_smoothers.target_value(id.0)
    }

    pub fn target_value_f64(&self, id: DoubleId) -> f64 {
        self.double_smoothers.target_value(id.0)
    }

    /// The block size given to `prepare_to_play`.
    pub fn max_block_size(&self) -> u32 {
        self.float_smoothers.block_size
    }

    pub fn reset_all(&mut self) {
        self.float_smoothers.reset_all();
        self.double_smoothers.reset_all();
        for f in &mut self.filter_smoothers {
            f.reset_smoothing();
        }
        for p in &mut self.filter_processed_this_block {
            *p = false;
        }
    }

    pub fn process_block(&mut self, block_size: u32) {
        self.float_smoothers.process_block(block_size);
        self.double_smoothers.process_block(block_size);

        if !self.filter_smoothers.is_empty() {
            for p in &mut self.filter_processed_this_block {
                *p = false;
            }
            for (index, smoother) in self.filter_smoothers.iter_mut().enumerate() {
                if smoother.needs_update() {
                    self.filter_processed_this_block[index] = true;
                    smoother.begin_block(block_size);
                    for i in 0..block_size as usize {
                        self.filter_result_buffer[index * block_size as usize + i] =
                            smoother.value();
                    }
                }
            }
        }

        self.num_valid_frames = block_size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepared_system(block_size: u32, sample_rate: f32, num_floats: usize) -> (SmoothedValueSystem, Vec<FloatId>) {
        let mut system = SmoothedValueSystem::new();
        let ids: Vec<FloatId> = (0..num_floats).map(|_| system.create_smoother()).collect();
        system.prepare_to_play(block_size, sample_rate);
        (system, ids)
    }

    #[test]
    fn ramp_reaches_target_exactly_on_time() {
        // 50ms at 48kHz = 2400 samples.
        let (mut system, ids) = prepared_system(512, 48000.0, 1);
        let id = ids[0];
        system.hard_set(id, 0.2);
        system.set(id, 0.8, 50.0);

        let mut values = Vec::new();
        let mut frames_done = 0;
        while frames_done < 2400 {
            system.process_block(512);
            for i in 0..512.min(2400 - frames_done) {
                values.push(system.value(id, i as u32));
            }
            frames_done += 512;
        }

        assert!((values[2399] - 0.8).abs() < 1e-6, "end: {}", values[2399]);
        // Monotonic linear ramp.
        let mut prev = 0.2;
        for (i, &v) in values.iter().enumerate() {
            assert!(v >= prev - 1e-6, "non-monotonic at {}", i);
            prev = v;
        }
        // Spot-check linearity at the midpoint.
        assert!((values[1199] - 0.5).abs() < 1e-3, "mid: {}", values[1199]);
    }

    #[test]
    fn value_past_ramp_returns_target() {
        let (mut system, ids) = prepared_system(512, 48000.0, 1);
        let id = ids[0];
        system.set(id, 1.0, 1.0); // 48 samples
        system.process_block(512);
        assert!(system.is_smoothing(id, 0));
        assert!(!system.is_smoothing(id, 48));
        assert_eq!(system.value(id, 100), 1.0);
    }

    #[test]
    fn hard_set_jumps_immediately() {
        let (mut system, ids) = prepared_system(64, 48000.0, 1);
        let id = ids[0];
        system.set(id, 1.0, 100.0);
        system.hard_set(id, 0.5);
        system.process_block(64);
        assert_eq!(system.value(id, 0), 0.5);
        assert!(!system.is_smoothing(id, 0));
    }

    #[test]
    fn all_values_backfills_with_target() {
        let (mut system, ids) = prepared_system(64, 48000.0, 1);
        let id = ids[0];
        system.hard_set(id, 0.0);
        system.set(id, 1.0, 0.5); // 24 samples
        system.process_block(64);
        let values = system.all_values(id).to_vec();
        assert_eq!(values.len(), 64);
        assert!(values[0] < 1.0);
        for &v in &values[24..] {
            assert_eq!(v, 1.0);
        }
    }

    #[test]
    fn variable_length_scales_with_delta() {
        let (mut system, ids) = prepared_system(64, 48000.0, 2);
        let (small, large) = (ids[0], ids[1]);
        system.hard_set(small, 0.0);
        system.hard_set(large, 0.0);
        // Small delta gets near min_ms, large delta near max_ms.
        system.set_variable_length(small, 0.01, 3.0, 30.0, 1.0);
        system.set_variable_length(large, 1.0, 3.0, 30.0, 1.0);
        system.process_block(64);
        // After 64 frames the small-delta ramp (about 157 samples) has
        // covered a much larger share of its distance than the large one.
        let small_progress = system.value(small, 63) / 0.01;
        let large_progress = system.value(large, 63) / 1.0;
        assert!(small_progress > large_progress);
    }

    #[test]
    fn doubles_smooth_independently_of_floats() {
        let mut system = SmoothedValueSystem::new();
        let fid = system.create_smoother();
        let did = system.create_double_smoother();
        system.prepare_to_play(64, 48000.0);

        system.hard_set(fid, 1.0);
        system.hard_set_f64(did, 2.0);
        system.set_f64(did, 4.0, 1.0);
        system.process_block(64);
        assert_eq!(system.value(fid, 0), 1.0);
        assert!(system.value_f64(did, 0) < 4.0);
        assert_eq!(system.value_f64(did, 63), 4.0);
    }

    #[test]
    fn filter_smoother_ramps_mix_over_block() {
        let mut system = SmoothedValueSystem::new();
        let id = system.create_filter_smoother();
        system.prepare_to_play(64, 48000.0);

        let mut params = BiquadParams::default();
        params.peak_gain_db = 6.0;
        system.set_filter(id, &params);
        system.process_block(64);

        let first = system.filter_value(id, 0);
        let last = system.filter_value(id, 63);
        assert!(first.mix < last.mix);
        assert!((last.mix - 1.0).abs() < 1e-6);

        // Next block: no change pending, mix pinned at 1.
        system.process_block(64);
        assert_eq!(system.filter_value(id, 0).mix, 1.0);
    }
}
