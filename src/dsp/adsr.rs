//! ADSR envelope with exponential-approach segments.
//!
//! Each segment runs `output = base + output * coef` toward an overshoot
//! target so the curve lands on its endpoint in exactly the configured number
//! of samples. The 'target ratio' sets the curve of a segment: values near
//! 0.0001 are virtually exponential, values near 100 virtually linear.

/// Per-layer envelope configuration, shared by every voice of the layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdsrParams {
    attack_coef: f32,
    attack_base: f32,
    decay_coef: f32,
    decay_base: f32,
    decay_target_ratio: f32,
    release_coef: f32,
    release_base: f32,
    pub sustain_amount: f32,
}

impl AdsrParams {
    #[inline]
    fn calc_coef(num_samples: f32, one_plus_target_ratio: f32, target_ratio: f32) -> f32 {
        debug_assert!(num_samples > 0.0);
        debug_assert!(target_ratio >= 1e-9);
        (-(one_plus_target_ratio / target_ratio).ln() / num_samples).exp()
    }

    pub fn set_attack_samples(&mut self, num_samples: f32, target_ratio: f32) {
        let one_plus_target_ratio = target_ratio + 1.0;
        self.attack_coef = Self::calc_coef(num_samples, one_plus_target_ratio, target_ratio);
        self.attack_base = one_plus_target_ratio * (1.0 - self.attack_coef);
    }

    pub fn set_decay_samples(&mut self, num_samples: f32, target_ratio: f32) {
        self.decay_coef = Self::calc_coef(num_samples, 1.0 + target_ratio, target_ratio);
        self.decay_base = (self.sustain_amount - target_ratio) * (1.0 - self.decay_coef);
        self.decay_target_ratio = target_ratio;
    }

    pub fn set_release_samples(&mut self, num_samples: f32, target_ratio: f32) {
        self.release_coef = Self::calc_coef(num_samples, 1.0 + target_ratio, target_ratio);
        self.release_base = -target_ratio * (1.0 - self.release_coef);
    }

    pub fn set_sustain_amp(&mut self, volume_amp: f32) {
        self.sustain_amount = volume_amp;
        self.decay_base = (self.sustain_amount - self.decay_target_ratio) * (1.0 - self.decay_coef);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdsrState {
    #[default]
    Idle,
    Attack,
    Decay,
    Sustain,
    Release,
}

/// Per-voice envelope state.
#[derive(Debug, Clone, Copy, Default)]
pub struct Adsr {
    prev_output: f32,
    pub output: f32,
    pub state: AdsrState,
}

impl Adsr {
    pub fn gate(&mut self, set_to_active: bool) {
        if set_to_active {
            self.state = AdsrState::Attack;
        } else if self.state != AdsrState::Idle {
            self.state = AdsrState::Release;
        }
    }

    pub fn reset(&mut self) {
        self.state = AdsrState::Idle;
        self.output = 0.0;
        self.prev_output = 0.0;
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.state == AdsrState::Idle
    }

    // Smoothing hides the stair-step when a state transition lands on a DSP
    // block boundary.
    #[inline]
    fn smooth_output(&mut self) -> f32 {
        const SMOOTHING_AMOUNT: f32 = 0.10;
        let result = self.prev_output + SMOOTHING_AMOUNT * (self.output - self.prev_output);
        self.prev_output = result;
        result
    }

    #[inline]
    pub fn process(&mut self, params: &AdsrParams) -> f32 {
        match self.state {
            AdsrState::Idle => {}
            AdsrState::Attack => {
                self.output = params.attack_base + self.output * params.attack_coef;
                if self.output >= 1.0 {
                    self.output = 1.0;
                    self.prev_output = 1.0;
                    self.state = AdsrState::Decay;
                }
            }
            AdsrState::Decay => {
                self.output = params.decay_base + self.output * params.decay_coef;
                if self.output <= params.sustain_amount {
                    self.output = params.sustain_amount;
                    self.state = AdsrState::Sustain;
                }
            }
            AdsrState::Sustain => {
                self.output = params.sustain_amount;
            }
            AdsrState::Release => {
                self.output = params.release_base + self.output * params.release_coef;
                if self.output <= 0.0 {
                    self.reset();
                }
            }
        }
        self.smooth_output().clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params_ms(
        sample_rate: f32,
        attack_ms: f32,
        decay_ms: f32,
        sustain: f32,
        release_ms: f32,
    ) -> AdsrParams {
        let mut p = AdsrParams::default();
        p.set_attack_samples(attack_ms / 1000.0 * sample_rate, 2.0);
        p.set_sustain_amp(sustain);
        p.set_decay_samples(decay_ms / 1000.0 * sample_rate, 0.1);
        p.set_release_samples(release_ms / 1000.0 * sample_rate, 0.1);
        p
    }

    #[test]
    fn attack_reaches_full_level_on_time() {
        // 10ms attack at 48kHz = 480 samples. The raw segment lands exactly
        // on 480; the 0.10 output lowpass needs a few dozen samples to
        // settle on top of that.
        let p = params_ms(48000.0, 10.0, 20.0, 0.5, 100.0);
        let mut env = Adsr::default();
        env.gate(true);

        let mut peak = 0.0f32;
        for i in 0..500 {
            let out = env.process(&p);
            peak = peak.max(out);
            if i == 482 {
                assert!(
                    env.state != AdsrState::Attack,
                    "raw attack still running at 483 samples"
                );
            }
        }
        assert!(peak >= 0.97, "attack peak too low: {}", peak);
    }

    #[test]
    fn holds_at_sustain_until_gate_off() {
        let p = params_ms(48000.0, 10.0, 20.0, 0.5, 100.0);
        let mut env = Adsr::default();
        env.gate(true);

        // Run well past attack + decay.
        let mut out = 0.0;
        for _ in 0..48000 {
            out = env.process(&p);
        }
        assert!((out - 0.5).abs() < 0.01, "sustain off target: {}", out);
        assert_eq!(env.state, AdsrState::Sustain);
    }

    #[test]
    fn release_decays_to_silence_within_configured_time() {
        let p = params_ms(48000.0, 10.0, 20.0, 0.5, 100.0);
        let mut env = Adsr::default();
        env.gate(true);
        for _ in 0..48000 {
            env.process(&p);
        }

        env.gate(false);
        let release_samples = (48000.0_f32 * 0.1) as usize;
        let mut out = 1.0;
        for _ in 0..release_samples + VOICE_CHUNK_SLACK {
            out = env.process(&p);
        }
        assert!(out < 1e-4, "release did not finish: {}", out);
        assert!(env.is_idle());
    }

    // Allow one chunk of slack for the output lowpass to settle.
    const VOICE_CHUNK_SLACK: usize = 64;

    #[test]
    fn gate_true_restarts_from_any_state() {
        let p = params_ms(48000.0, 10.0, 20.0, 0.5, 100.0);
        let mut env = Adsr::default();
        env.gate(true);
        for _ in 0..2000 {
            env.process(&p);
        }
        env.gate(false);
        for _ in 0..100 {
            env.process(&p);
        }
        env.gate(true);
        assert_eq!(env.state, AdsrState::Attack);
    }

    #[test]
    fn output_is_monotonic_during_attack() {
        let p = params_ms(48000.0, 10.0, 20.0, 0.5, 100.0);
        let mut env = Adsr::default();
        env.gate(true);

        let mut prev = 0.0;
        for _ in 0..400 {
            let out = env.process(&p);
            assert!(out >= prev - 1e-6);
            prev = out;
        }
    }
}
