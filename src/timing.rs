//! Tempo-synced rate table.
//!
//! Note lengths are held as exact fractions of a whole note so triplet and
//! dotted variants never accumulate float error before the final conversion
//! to Hz at the host tempo.

use fraction::Fraction;

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::EnumCount, strum::FromRepr)]
#[repr(usize)]
pub enum SyncedRate {
    _1_64T,
    _1_64,
    _1_64D,
    _1_32T,
    _1_32,
    _1_32D,
    _1_16T,
    _1_16,
    _1_16D,
    _1_8T,
    _1_8,
    _1_8D,
    _1_4T,
    #[default]
    _1_4,
    _1_4D,
    _1_2T,
    _1_2,
    _1_2D,
    _1_1T,
    _1_1,
    _1_1D,
    _2_1T,
    _2_1,
    _2_1D,
    _4_1T,
    _4_1,
    _4_1D,
}

impl SyncedRate {
    /// Length as a fraction of a whole note.
    fn whole_note_fraction(self) -> Fraction {
        use SyncedRate::*;
        let (base_num, base_den) = match self {
            _1_64T | _1_64 | _1_64D => (1u64, 64u64),
            _1_32T | _1_32 | _1_32D => (1, 32),
            _1_16T | _1_16 | _1_16D => (1, 16),
            _1_8T | _1_8 | _1_8D => (1, 8),
            _1_4T | _1_4 | _1_4D => (1, 4),
            _1_2T | _1_2 | _1_2D => (1, 2),
            _1_1T | _1_1 | _1_1D => (1, 1),
            _2_1T | _2_1 | _2_1D => (2, 1),
            _4_1T | _4_1 | _4_1D => (4, 1),
        };
        let base = Fraction::new(base_num, base_den);
        match self {
            _1_64T | _1_32T | _1_16T | _1_8T | _1_4T | _1_2T | _1_1T | _2_1T | _4_1T => {
                base * Fraction::new(2u64, 3u64)
            }
            _1_64D | _1_32D | _1_16D | _1_8D | _1_4D | _1_2D | _1_1D | _2_1D | _4_1D => {
                base * Fraction::new(3u64, 2u64)
            }
            _ => base,
        }
    }

    /// Duration in milliseconds at the given tempo.
    pub fn ms(self, tempo_bpm: f64) -> f64 {
        let fraction = self.whole_note_fraction();
        let ratio = *fraction.numer().unwrap() as f64 / *fraction.denom().unwrap() as f64;
        // A whole note is 4 beats.
        let whole_note_ms = 4.0 * 60_000.0 / tempo_bpm;
        ratio * whole_note_ms
    }

    pub fn hz(self, tempo_bpm: f64) -> f64 {
        1000.0 / self.ms(tempo_bpm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quarter_note_at_120_bpm_is_500ms() {
        assert!((SyncedRate::_1_4.ms(120.0) - 500.0).abs() < 1e-9);
        assert!((SyncedRate::_1_4.hz(120.0) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn triplet_and_dotted_scale_exactly() {
        let straight = SyncedRate::_1_8.ms(97.3);
        assert!((SyncedRate::_1_8T.ms(97.3) - straight * 2.0 / 3.0).abs() < 1e-9);
        assert!((SyncedRate::_1_8D.ms(97.3) - straight * 1.5).abs() < 1e-9);
    }

    #[test]
    fn triplet_straight_dotted_are_ordered_within_each_group() {
        use strum::EnumCount;
        for group in 0..SyncedRate::COUNT / 3 {
            let triplet = SyncedRate::from_repr(group * 3).unwrap().ms(120.0);
            let straight = SyncedRate::from_repr(group * 3 + 1).unwrap().ms(120.0);
            let dotted = SyncedRate::from_repr(group * 3 + 2).unwrap().ms(120.0);
            assert!(triplet < straight && straight < dotted, "group {}", group);
        }
    }

    #[test]
    fn whole_note_at_60_bpm_is_4_seconds() {
        assert!((SyncedRate::_1_1.ms(60.0) - 4000.0).abs() < 1e-9);
    }
}
