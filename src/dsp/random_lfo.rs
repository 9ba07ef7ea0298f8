//! Non-periodic LFO for modulation destinations that want random motion.
//!
//! Keeps its own value history per instance so stereo instances seeded
//! differently stay decorrelated.

use crate::dsp::math::{fast_rand_01, lerp, sin_turns};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RandomLfoStyle {
    Perlin,
    SampleAndHold,
    SineInterpolate,
    LorenzAttractor,
}

#[derive(Clone)]
pub struct RandomLfo {
    style: RandomLfoStyle,
    /// Normalized phase in [0, 1); a wrap picks the next random target.
    offset: f32,
    phase_increment_per_tick: f32,
    last_random_value: f32,
    next_random_value: f32,
    // Lorenz attractor state
    state1: f32,
    state2: f32,
    state3: f32,
    rng_state: u32,
}

impl RandomLfo {
    pub fn new(style: RandomLfoStyle, seed: u32) -> Self {
        Self {
            style,
            offset: 0.0,
            phase_increment_per_tick: 0.0,
            last_random_value: 0.0,
            next_random_value: 0.0,
            state1: 0.1,
            state2: 0.0,
            state3: 0.0,
            rng_state: seed | 1,
        }
    }

    pub fn set_style(&mut self, style: RandomLfoStyle) {
        self.style = style;
    }

    pub fn set_rate(&mut self, sample_rate: f32, rate_hz: f32) {
        self.phase_increment_per_tick = rate_hz / sample_rate;
    }

    fn next_target(&mut self) -> f32 {
        fast_rand_01(&mut self.rng_state) * 2.0 - 1.0
    }

    /// Returns a value in [-1, 1].
    #[inline]
    pub fn tick(&mut self) -> f32 {
        if self.style == RandomLfoStyle::LorenzAttractor {
            return self.tick_lorenz();
        }

        self.offset += self.phase_increment_per_tick;
        if self.offset >= 1.0 {
            self.offset -= self.offset.floor();
            self.last_random_value = self.next_random_value;
            self.next_random_value = self.next_target();
        }

        match self.style {
            RandomLfoStyle::SampleAndHold => self.last_random_value,
            RandomLfoStyle::SineInterpolate => {
                // Half a sine turn eases between the two held values.
                let t = 0.5 - 0.5 * sin_turns(0.25 + 0.5 * self.offset);
                lerp(self.last_random_value, self.next_random_value, t)
            }
            RandomLfoStyle::Perlin => {
                let t = self.offset * self.offset * (3.0 - 2.0 * self.offset);
                lerp(self.last_random_value, self.next_random_value, t)
            }
            RandomLfoStyle::LorenzAttractor => unreachable!(),
        }
    }

    fn tick_lorenz(&mut self) -> f32 {
        const SIGMA: f32 = 10.0;
        const RHO: f32 = 28.0;
        const BETA: f32 = 8.0 / 3.0;

        // Integration step scales with the rate so "faster" sweeps the
        // attractor faster.
        let dt = (self.phase_increment_per_tick * 0.4).min(0.01);
        let dx = SIGMA * (self.state2 - self.state1);
        let dy = self.state1 * (RHO - self.state3) - self.state2;
        let dz = self.state1 * self.state2 - BETA * self.state3;
        self.state1 += dx * dt;
        self.state2 += dy * dt;
        self.state3 += dz * dt;

        (self.state1 / 20.0).clamp(-1.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_styles_stay_in_range() {
        for style in [
            RandomLfoStyle::Perlin,
            RandomLfoStyle::SampleAndHold,
            RandomLfoStyle::SineInterpolate,
            RandomLfoStyle::LorenzAttractor,
        ] {
            let mut lfo = RandomLfo::new(style, 777);
            lfo.set_rate(48000.0, 8.0);
            for _ in 0..50_000 {
                let v = lfo.tick();
                assert!((-1.0..=1.0).contains(&v), "{:?} out of range: {}", style, v);
            }
        }
    }

    #[test]
    fn sample_and_hold_holds_between_steps() {
        let mut lfo = RandomLfo::new(RandomLfoStyle::SampleAndHold, 9);
        lfo.set_rate(1000.0, 10.0); // 100 ticks per step
        lfo.tick();
        let held = lfo.tick();
        for _ in 0..50 {
            assert_eq!(lfo.tick(), held);
        }
    }

    #[test]
    fn differently_seeded_instances_decorrelate() {
        let mut a = RandomLfo::new(RandomLfoStyle::Perlin, 1);
        let mut b = RandomLfo::new(RandomLfoStyle::Perlin, 2);
        a.set_rate(1000.0, 50.0);
        b.set_rate(1000.0, 50.0);

        let mut any_difference = false;
        for _ in 0..1000 {
            if (a.tick() - b.tick()).abs() > 1e-6 {
                any_difference = true;
            }
        }
        assert!(any_difference);
    }
}
