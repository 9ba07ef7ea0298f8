//! Equal-power volume fade state machine.
//!
//! The fade follows a quarter of a sine cycle: phase 0 is silent, phase 0.25
//! is full volume, phase 0.5 is silent again. Fading in runs the phase from 0
//! to 0.25, fading out from 0.25 to 0.5.

use crate::dsp::math::sin_turns;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeState {
    FullVolume,
    Silent,
    FadeIn,
    FadeOut,
}

#[derive(Debug, Clone, Copy)]
pub struct VolumeFade {
    state: FadeState,
    increment: f32,
    phase_sine_turns: f32,
}

impl Default for VolumeFade {
    fn default() -> Self {
        Self::new(FadeState::Silent)
    }
}

impl VolumeFade {
    pub fn new(initial_state: FadeState) -> Self {
        let phase = match initial_state {
            FadeState::FullVolume | FadeState::FadeOut => 0.25,
            FadeState::Silent | FadeState::FadeIn => 0.0,
        };
        Self {
            state: initial_state,
            increment: 0.0,
            phase_sine_turns: phase,
        }
    }

    pub fn force_set_as_fade_in(&mut self, sample_rate: f32, ms_for_fade_in: f32) {
        self.state = FadeState::FadeIn;
        self.phase_sine_turns = 0.0;
        let samples_for_fade = sample_rate * (ms_for_fade_in / 1000.0);
        self.increment = 0.25 / samples_for_fade;
    }

    pub fn force_set_full_volume(&mut self) {
        self.state = FadeState::FullVolume;
        self.phase_sine_turns = 0.25;
        self.increment = 0.0;
    }

    pub fn set_as_fade_in(&mut self, sample_rate: f32, ms_for_fade_in: f32) {
        if self.is_full_volume() {
            return;
        }
        let samples_for_fade = sample_rate * (ms_for_fade_in / 1000.0);
        debug_assert!((0.0..=0.5).contains(&self.phase_sine_turns));
        // Mirror a partial fade-out so the level is continuous.
        if self.phase_sine_turns > 0.25 {
            self.phase_sine_turns = 0.5 - self.phase_sine_turns;
        }
        self.increment = 0.25 / samples_for_fade;
        self.state = FadeState::FadeIn;
    }

    pub fn set_as_fade_out(&mut self, sample_rate: f32, ms_for_fade_out: f32) {
        if self.is_silent() {
            return;
        }
        let samples_for_fade = sample_rate * (ms_for_fade_out / 1000.0);
        if self.phase_sine_turns < 0.25 {
            self.phase_sine_turns = 0.5 - self.phase_sine_turns;
        }
        self.increment = 0.25 / samples_for_fade;
        self.state = FadeState::FadeOut;
    }

    pub fn set_as_fade_out_if_not_already(&mut self, sample_rate: f32, ms_for_fade_out: f32) {
        if self.state == FadeState::FadeOut {
            return;
        }
        self.set_as_fade_out(sample_rate, ms_for_fade_out);
    }

    #[inline]
    pub fn get_fade(&mut self) -> f32 {
        match self.state {
            FadeState::FullVolume => return 1.0,
            FadeState::Silent => return 0.0,
            FadeState::FadeIn => {
                if self.phase_sine_turns >= 0.25 {
                    self.state = FadeState::FullVolume;
                    self.phase_sine_turns = 0.25;
                    return 1.0;
                }
            }
            FadeState::FadeOut => {
                if self.phase_sine_turns >= 0.5 {
                    self.state = FadeState::Silent;
                    self.phase_sine_turns = 0.0;
                    return 0.0;
                }
            }
        }
        let result = sin_turns(self.phase_sine_turns);
        self.phase_sine_turns += self.increment;
        result
    }

    /// Advance the fade as if `get_fade` had been called `steps` times.
    /// Returns the new state if the jump completed the fade.
    pub fn jump_multiple_steps(&mut self, steps: u32) -> Option<FadeState> {
        if self.state == FadeState::FullVolume || self.state == FadeState::Silent {
            return None;
        }

        self.phase_sine_turns += self.increment * steps as f32;
        if self.state == FadeState::FadeOut && self.phase_sine_turns >= 0.5 {
            self.state = FadeState::Silent;
            self.phase_sine_turns = 0.0;
            return Some(self.state);
        }
        if self.state == FadeState::FadeIn && self.phase_sine_turns >= 0.25 {
            self.state = FadeState::FullVolume;
            self.phase_sine_turns = 0.25;
            return Some(self.state);
        }
        None
    }

    #[inline]
    pub fn is_silent(&self) -> bool {
        self.state == FadeState::Silent
    }

    #[inline]
    pub fn is_full_volume(&self) -> bool {
        self.state == FadeState::FullVolume
    }

    #[inline]
    pub fn is_fading_out(&self) -> bool {
        self.state == FadeState::FadeOut
    }

    #[inline]
    pub fn state(&self) -> FadeState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fade_out_reaches_silence_in_configured_time() {
        let mut fade = VolumeFade::new(FadeState::FullVolume);
        // 10ms at 48kHz = 480 samples
        fade.set_as_fade_out(48000.0, 10.0);
        for _ in 0..481 {
            fade.get_fade();
        }
        assert_eq!(fade.get_fade(), 0.0);
        assert!(fade.is_silent());
    }

    #[test]
    fn fade_in_reaches_full_volume() {
        let mut fade = VolumeFade::new(FadeState::Silent);
        fade.force_set_as_fade_in(48000.0, 10.0);
        for _ in 0..481 {
            fade.get_fade();
        }
        assert_eq!(fade.get_fade(), 1.0);
        assert!(fade.is_full_volume());
    }

    #[test]
    fn fade_is_monotonic() {
        let mut fade = VolumeFade::new(FadeState::FullVolume);
        fade.set_as_fade_out(48000.0, 10.0);
        let mut prev = 1.0;
        for _ in 0..480 {
            let v = fade.get_fade();
            assert!(v <= prev + 1e-6);
            prev = v;
        }
    }

    #[test]
    fn reversing_a_partial_fade_keeps_level_continuous() {
        let mut fade = VolumeFade::new(FadeState::FullVolume);
        fade.set_as_fade_out(48000.0, 10.0);
        let mut level = 1.0;
        for _ in 0..240 {
            level = fade.get_fade();
        }
        fade.set_as_fade_in(48000.0, 10.0);
        let resumed = fade.get_fade();
        assert!((resumed - level).abs() < 0.02, "{} vs {}", resumed, level);
    }

    #[test]
    fn jump_multiple_steps_completes_fade() {
        let mut fade = VolumeFade::new(FadeState::FullVolume);
        fade.set_as_fade_out(48000.0, 10.0);
        let changed = fade.jump_multiple_steps(10_000);
        assert_eq!(changed, Some(FadeState::Silent));
    }
}
