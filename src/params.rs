//! Stable parameter indices and value projection.
//!
//! Hosts deal in linear [0, 1] values addressed by a stable enum; the engine
//! works in natural units (Hz, ms, semitones). `project` is the single place
//! that mapping lives. Stepped parameters carry their integer choice in the
//! linear value directly.

use strum::{EnumCount, FromRepr};

use crate::dsp::math::{map_from_01, map_from_01_skew};
use crate::dsp::svf::linear_to_hz;
use crate::timing::SyncedRate;

/// Conversion from a stepped parameter's integer value. Implemented for every
/// enum a host can address through a stepped parameter.
pub trait SteppedParam: Sized {
    fn from_step(step: usize) -> Option<Self>;
}

macro_rules! impl_stepped_param {
    ($($ty:ty),* $(,)?) => {
        $(impl SteppedParam for $ty {
            fn from_step(step: usize) -> Option<Self> {
                Self::from_repr(step)
            }
        })*
    };
}

impl_stepped_param!(
    VelocityMappingMode,
    LayerFilterType,
    LfoShapeParam,
    LfoDestination,
    LfoRestartMode,
    LoopModeParam,
    EqType,
    SyncedRate,
);

/// Per-layer parameters, indexed stably for host automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumCount, FromRepr)]
#[repr(usize)]
pub enum LayerParamIndex {
    Volume,
    Mute,
    Solo,
    Pan,
    TuneSemitone,
    TuneCents,
    VelocityMapping,
    Keytrack,
    Monophonic,
    VolEnvOn,
    VolumeAttack,
    VolumeDecay,
    VolumeSustain,
    VolumeRelease,
    FilterOn,
    FilterType,
    FilterCutoff,
    FilterResonance,
    FilterEnvAmount,
    FilterAttack,
    FilterDecay,
    FilterSustain,
    FilterRelease,
    LfoOn,
    LfoShape,
    LfoAmount,
    LfoDestination,
    LfoRateHz,
    LfoRateTempoSynced,
    LfoSyncSwitch,
    LfoRestart,
    LoopMode,
    LoopStart,
    LoopEnd,
    LoopCrossfade,
    Reverse,
    SampleOffset,
    EqOn,
    EqFreq1,
    EqResonance1,
    EqGain1,
    EqType1,
    EqFreq2,
    EqResonance2,
    EqGain2,
    EqType2,
}

pub const LAYER_PARAM_COUNT: usize = LayerParamIndex::COUNT;

/// Engine-wide parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumCount, FromRepr)]
#[repr(usize)]
pub enum GlobalParamIndex {
    MasterVolume,
    /// The timbre knob driving region crossfades.
    Dynamics,
    VelocityToVolume,
}

pub const GLOBAL_PARAM_COUNT: usize = GlobalParamIndex::COUNT;

// Stepped parameter value enums. The linear value of a stepped parameter is
// the variant index.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumCount, FromRepr)]
#[repr(usize)]
pub enum VelocityMappingMode {
    #[default]
    None,
    TopToBottom,
    BottomToTop,
    TopToMiddle,
    MiddleOutwards,
    MiddleToBottom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumCount, FromRepr)]
#[repr(usize)]
pub enum LayerFilterType {
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumCount, FromRepr)]
#[repr(usize)]
pub enum LfoShapeParam {
    #[default]
    Sine,
    Triangle,
    Sawtooth,
    Square,
    RandomSmooth,
    RandomStep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumCount, FromRepr)]
#[repr(usize)]
pub enum LfoDestination {
    #[default]
    Volume,
    Pitch,
    Pan,
    Filter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumCount, FromRepr)]
#[repr(usize)]
pub enum LfoRestartMode {
    #[default]
    Retrigger,
    Free,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumCount, FromRepr)]
#[repr(usize)]
pub enum LoopModeParam {
    #[default]
    InstrumentDefault,
    BuiltInLoopStandard,
    BuiltInLoopPingPong,
    None,
    Standard,
    PingPong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumCount, FromRepr)]
#[repr(usize)]
pub enum EqType {
    #[default]
    Peak,
    LowShelf,
    HighShelf,
}

/// A parameter's linear host value plus its projection into natural units.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParamValue {
    pub linear: f32,
    pub projected: f32,
}

impl ParamValue {
    pub fn new(param: LayerParamIndex, linear: f32) -> Self {
        Self {
            linear,
            projected: project(param, linear),
        }
    }

    #[inline]
    pub fn as_bool(&self) -> bool {
        self.linear >= 0.5
    }

    #[inline]
    pub fn as_int<T: SteppedParam>(&self) -> Option<T> {
        T::from_step(self.linear.round().max(0.0) as usize)
    }
}

/// Map a linear [0, 1] host value into the parameter's natural unit.
/// Stepped parameters pass their variant index through unchanged.
pub fn project(param: LayerParamIndex, linear: f32) -> f32 {
    use LayerParamIndex::*;
    match param {
        Volume => map_from_01(linear, 0.0, 2.0),
        Pan => map_from_01(linear, -1.0, 1.0),
        TuneSemitone => map_from_01(linear, -24.0, 24.0).round(),
        TuneCents => map_from_01(linear, -100.0, 100.0),
        VolumeAttack | VolumeDecay | VolumeRelease | FilterAttack | FilterDecay
        | FilterRelease => map_from_01_skew(linear, 0.0, 10_000.0, 4.0),
        VolumeSustain | FilterSustain => linear,
        FilterCutoff => linear_to_hz(linear),
        FilterResonance | EqResonance1 | EqResonance2 => linear,
        FilterEnvAmount | LfoAmount => map_from_01(linear, -1.0, 1.0),
        LfoRateHz => map_from_01_skew(linear, 0.01, 40.0, 3.0),
        LoopStart | LoopEnd | LoopCrossfade | SampleOffset => linear,
        EqFreq1 | EqFreq2 => map_from_01_skew(linear, 40.0, 18_000.0, 3.0),
        EqGain1 | EqGain2 => map_from_01(linear, -15.0, 15.0),
        // Stepped and boolean parameters project to themselves.
        Mute | Solo | VelocityMapping | Keytrack | Monophonic | VolEnvOn | FilterOn
        | FilterType | LfoOn | LfoShape | LfoDestination | LfoRateTempoSynced | LfoSyncSwitch
        | LfoRestart | LoopMode | Reverse | EqOn | EqType1 | EqType2 => linear,
    }
}

pub fn project_global(param: GlobalParamIndex, linear: f32) -> f32 {
    match param {
        GlobalParamIndex::MasterVolume => map_from_01(linear, 0.0, 2.0),
        GlobalParamIndex::Dynamics => linear,
        GlobalParamIndex::VelocityToVolume => linear,
    }
}

/// Sparse "these just changed" view over a layer's parameter bank, delivered
/// to the layer per processing call.
#[derive(Clone, Copy)]
pub struct ChangedLayerParams<'a> {
    values: &'a [ParamValue; LAYER_PARAM_COUNT],
    changed: u64,
}

impl<'a> ChangedLayerParams<'a> {
    pub fn new(values: &'a [ParamValue; LAYER_PARAM_COUNT], changed: u64) -> Self {
        debug_assert!(LAYER_PARAM_COUNT <= 64);
        Self { values, changed }
    }

    /// Every parameter marked changed - used when a layer is (re)initialised.
    pub fn all(values: &'a [ParamValue; LAYER_PARAM_COUNT]) -> Self {
        Self {
            values,
            changed: u64::MAX,
        }
    }

    #[inline]
    pub fn param(&self, index: LayerParamIndex) -> Option<ParamValue> {
        if self.changed & (1u64 << index as usize) != 0 {
            Some(self.values[index as usize])
        } else {
            None
        }
    }
}

/// Host-facing defaults, as linear values.
pub fn default_linear(param: LayerParamIndex) -> f32 {
    use LayerParamIndex::*;
    match param {
        Volume => 0.5,              // unity gain
        Pan => 0.5,                 // centre
        TuneSemitone => 0.5,        // no transpose
        TuneCents => 0.5,           // no detune
        VolumeSustain | FilterSustain => 1.0,
        VolumeAttack | FilterAttack => 0.05,
        VolumeDecay | FilterDecay => 0.25,
        VolumeRelease | FilterRelease => 0.3,
        VolEnvOn => 1.0,
        Keytrack => 1.0,
        FilterCutoff => 1.0,
        LfoRateHz => 0.4,
        LfoAmount => 0.5,
        LoopEnd => 1.0,
        EqFreq1 => 0.4,
        EqFreq2 => 0.7,
        EqGain1 | EqGain2 => 0.5,
        EqResonance1 | EqResonance2 => 0.3,
        FilterResonance => 0.0,
        FilterEnvAmount => 0.5,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stepped_params_round_trip_through_as_int() {
        let value = ParamValue::new(LayerParamIndex::FilterType, 4.0);
        assert_eq!(
            value.as_int::<LayerFilterType>(),
            Some(LayerFilterType::BandShelving)
        );
        let value = ParamValue::new(LayerParamIndex::LoopMode, 5.0);
        assert_eq!(value.as_int::<LoopModeParam>(), Some(LoopModeParam::PingPong));
    }

    #[test]
    fn out_of_range_step_is_none() {
        let value = ParamValue::new(LayerParamIndex::FilterType, 99.0);
        assert_eq!(value.as_int::<LayerFilterType>(), None);
    }

    #[test]
    fn cutoff_projection_is_logarithmic() {
        assert!((project(LayerParamIndex::FilterCutoff, 0.0) - 20.0).abs() < 0.01);
        assert!((project(LayerParamIndex::FilterCutoff, 1.0) - 20_000.0).abs() < 1.0);
        let mid = project(LayerParamIndex::FilterCutoff, 0.5);
        assert!((600.0..650.0).contains(&mid), "midpoint {}", mid);
    }

    #[test]
    fn changed_view_exposes_only_changed_params() {
        let mut values = [ParamValue::default(); LAYER_PARAM_COUNT];
        values[LayerParamIndex::Pan as usize] = ParamValue::new(LayerParamIndex::Pan, 1.0);

        let changed = 1u64 << LayerParamIndex::Pan as usize;
        let view = ChangedLayerParams::new(&values, changed);
        assert!(view.param(LayerParamIndex::Pan).is_some());
        assert!(view.param(LayerParamIndex::Volume).is_none());

        let all = ChangedLayerParams::all(&values);
        assert!(all.param(LayerParamIndex::Volume).is_some());
    }

    #[test]
    fn defaults_are_valid_linear_values() {
        for i in 0..LAYER_PARAM_COUNT {
            let param = LayerParamIndex::from_repr(i).unwrap();
            let linear = default_linear(param);
            assert!((0.0..=1.0).contains(&linear) || linear.fract() == 0.0, "{:?}", param);
        }
    }
}
