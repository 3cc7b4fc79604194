use std::ops::RangeInclusive;

use rand::Rng;

pub const DANGER_THRESHOLD: u16 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading {
    pub value: u16,
    pub danger: bool,
}

/// Distribution the simulated sensor draws from: mostly calm values, with an occasional
/// excursion into the elevated band.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadingProfile {
    pub normal: RangeInclusive<u16>,
    pub elevated: RangeInclusive<u16>,
    pub elevated_probability: f64,
    pub danger_threshold: u16,
}

impl Default for ReadingProfile {
    fn default() -> Self {
        Self {
            normal: 1..=50,
            elevated: 51..=110,
            elevated_probability: 0.1,
            danger_threshold: DANGER_THRESHOLD,
        }
    }
}

impl ReadingProfile {
    pub fn is_danger(&self, value: u16) -> bool {
        value >= self.danger_threshold
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Reading {
        let range = if rng.gen_bool(self.elevated_probability.clamp(0.0, 1.0)) {
            self.elevated.clone()
        } else {
            self.normal.clone()
        };
        let value = rng.gen_range(range);
        Reading {
            value,
            danger: self.is_danger(value),
        }
    }
}
