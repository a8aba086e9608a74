//! Bus clock divider solver
//!
//! The bus rate is derived from the input clock by two divider fields:
//!
//! `rate = input / ((step + 1) * (sample + 1) * 2)`

use crate::reg::Divider;
use fugit::HertzU32;

/// Largest value of the step divisor field
pub const MAX_STEP: u8 = 15;
/// Largest value of the sample divisor field
pub const MAX_SAMPLE: u8 = 255;

/// Failures of [`Dividers::solve`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimingError {
    /// The requested rate is zero
    ZeroRate,
    /// The input clock is too slow to produce any non-zero rate
    Unreachable,
}

/// Divider field values
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Dividers {
    /// Sample divisor, `0..=MAX_SAMPLE`
    pub sample: u8,
    /// Step divisor, `0..=MAX_STEP`
    pub step: u8,
}

impl Dividers {
    fn divisor(self) -> u32 {
        (u32::from(self.step) + 1) * (u32::from(self.sample) + 1) * 2
    }

    /// Bus rate produced from `input` by these dividers
    pub fn rate(self, input: HertzU32) -> HertzU32 {
        HertzU32::from_raw(input.raw() / self.divisor())
    }

    /// Closest achievable rate to `target`
    ///
    /// Every step value is tried; for each of them the sample value is found
    /// by binary search, as the rate falls monotonically with it. On equal
    /// error the pair found first is kept.
    pub fn solve(target: HertzU32, input: HertzU32) -> Result<Self, TimingError> {
        if target.raw() == 0 {
            return Err(TimingError::ZeroRate);
        }
        let target = target.raw();
        let mut best: Option<(Self, u32)> = None;
        for step in 0..=MAX_STEP {
            for candidate in Self::nearest_samples(step, target, input) {
                let error = candidate.rate(input).raw().abs_diff(target);
                if best.map_or(true, |(_, e)| error < e) {
                    best = Some((candidate, error));
                }
            }
        }
        match best {
            Some((dividers, _)) if dividers.rate(input).raw() > 0 => Ok(dividers),
            _ => Err(TimingError::Unreachable),
        }
    }

    /// Sample values around the point where the rate crosses `target`
    fn nearest_samples(step: u8, target: u32, input: HertzU32) -> impl Iterator<Item = Self> {
        let at = |sample: u8| Self { sample, step };
        // First sample whose rate does not exceed the target
        let (mut low, mut high) = (0u16, u16::from(MAX_SAMPLE) + 1);
        while low < high {
            let mid = (low + high) / 2;
            if at(mid as u8).rate(input).raw() <= target {
                high = mid;
            } else {
                low = mid + 1;
            }
        }
        let above = low.checked_sub(1).map(|s| at(s as u8));
        let below = (low <= u16::from(MAX_SAMPLE)).then(|| at(low as u8));
        above.into_iter().chain(below)
    }
}

impl From<Divider> for Dividers {
    fn from(value: Divider) -> Self {
        Self {
            sample: value.sample(),
            step: value.step(),
        }
    }
}

impl From<Dividers> for Divider {
    fn from(value: Dividers) -> Self {
        let mut divider = Divider(0);
        divider.set_sample(value.sample);
        divider.set_step(value.step.min(MAX_STEP));
        divider
    }
}
