//! Per-voice stereo state-variable filter.
//!
//! Trapezoidal-integration SVF. The three integrator taps are mixed into the
//! eight response types with per-type mix coefficients, so one topology
//! serves every filter mode and coefficients can be recomputed mid-stream
//! without resetting state.

use crate::dsp::math::flush_denormal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SvfType {
    #[default]
    Lowpass,
    Bandpass,
    Highpass,
    UnitGainBandpass,
    BandShelving,
    Notch,
    Allpass,
    Peak,
}

const MIN_CUTOFF_HZ: f32 = 20.0;
const MAX_CUTOFF_HZ: f32 = 20000.0;

/// Map a linear [0, 1] control value to Hz logarithmically.
#[inline]
pub fn linear_to_hz(linear: f32) -> f32 {
    MIN_CUTOFF_HZ * (MAX_CUTOFF_HZ / MIN_CUTOFF_HZ).powf(linear.clamp(0.0, 1.0))
}

/// Inverse of `linear_to_hz`.
#[inline]
pub fn hz_to_linear(hz: f32) -> f32 {
    let clamped = hz.clamp(MIN_CUTOFF_HZ, MAX_CUTOFF_HZ);
    (clamped / MIN_CUTOFF_HZ).ln() / (MAX_CUTOFF_HZ / MIN_CUTOFF_HZ).ln()
}

/// Non-linear skew of the resonance control so the lower half of the knob
/// covers the subtle range.
#[inline]
pub fn skew_resonance(linear: f32) -> f32 {
    linear.clamp(0.0, 1.0).powf(1.5)
}

/// Cached filter coefficients; recomputed only when cutoff or resonance
/// actually change.
#[derive(Debug, Clone, Copy, Default)]
pub struct SvfCoeffs {
    k: f32,
    a1: f32,
    a2: f32,
    a3: f32,
    resonance: f32,
}

impl SvfCoeffs {
    pub fn update(&mut self, sample_rate: f32, cutoff_hz: f32, resonance01: f32) {
        // Keep the pre-warp argument below a quarter turn so tan() stays
        // finite; the filter remains stable right up to Nyquist.
        let fc = cutoff_hz.clamp(1.0, sample_rate * 0.49);
        let res = resonance01.clamp(0.0, 0.98);

        let g = (std::f32::consts::PI * fc / sample_rate).tan();
        let k = 2.0 - 2.0 * res;

        self.k = k;
        self.a1 = 1.0 / (1.0 + g * (g + k));
        self.a2 = g * self.a1;
        self.a3 = g * self.a2;
        self.resonance = res;
    }
}

/// Stereo integrator state.
#[derive(Debug, Clone, Copy, Default)]
pub struct SvfState {
    ic1: [f32; 2],
    ic2: [f32; 2],
}

impl SvfState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[inline]
fn mix_coefficients(filter_type: SvfType, k: f32, resonance: f32) -> (f32, f32, f32) {
    match filter_type {
        SvfType::Lowpass => (0.0, 0.0, 1.0),
        SvfType::Bandpass => (0.0, 1.0, 0.0),
        SvfType::Highpass => (1.0, -k, -1.0),
        SvfType::UnitGainBandpass => (0.0, k, 0.0),
        SvfType::BandShelving => {
            // Bell gain rides the resonance control.
            let a = 1.0 + 2.0 * resonance;
            (1.0, k * (a * a - 1.0), 0.0)
        }
        SvfType::Notch => (1.0, -k, 0.0),
        SvfType::Allpass => (1.0, -2.0 * k, 0.0),
        SvfType::Peak => (1.0, -k, -2.0),
    }
}

/// Process one stereo frame.
#[inline]
pub fn process(
    state: &mut SvfState,
    filter_type: SvfType,
    coeffs: &SvfCoeffs,
    input: (f32, f32),
) -> (f32, f32) {
    let (m0, m1, m2) = mix_coefficients(filter_type, coeffs.k, coeffs.resonance);
    let inputs = [input.0, input.1];
    let mut outputs = [0.0f32; 2];

    for ch in 0..2 {
        let v0 = inputs[ch];
        let v3 = v0 - state.ic2[ch];
        let v1 = coeffs.a1 * state.ic1[ch] + coeffs.a2 * v3;
        let v2 = state.ic2[ch] + coeffs.a2 * state.ic1[ch] + coeffs.a3 * v3;
        state.ic1[ch] = flush_denormal(2.0 * v1 - state.ic1[ch]);
        state.ic2[ch] = flush_denormal(2.0 * v2 - state.ic2[ch]);

        outputs[ch] = m0 * v0 + m1 * v1 + m2 * v2;
    }

    (outputs[0], outputs[1])
}
