pub mod adsr;
pub mod biquad;
pub mod lfo;
pub mod math;
pub mod peak_meter;
pub mod random_lfo;
pub mod svf;
pub mod volume_fade;
