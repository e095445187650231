//! Fixed-Point Race Progress
//!
//! Progress along the track is accumulated as integer units so that repeated
//! per-tap increments land exactly on the finish line. Floats only appear at
//! the edges (configuration in, store/wire out).
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  0 ──────────────────────────────────────────────── 10_000  │
//! │  start                                              finish  │
//! │                                                             │
//! │  0.02 per tap = 200 units  ->  50 taps = 10_000 = 1.0       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Units in a complete track (1.0).
pub const PROGRESS_SCALE: u32 = 10_000;

/// Race progress in fixed-point units, clamped to `[0, PROGRESS_SCALE]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Progress(u32);

impl Progress {
    /// Start line.
    pub const ZERO: Progress = Progress(0);

    /// Finish line.
    pub const COMPLETE: Progress = Progress(PROGRESS_SCALE);

    /// Create from raw units, clamping to the finish line.
    pub const fn from_units(units: u32) -> Self {
        if units > PROGRESS_SCALE {
            Self(PROGRESS_SCALE)
        } else {
            Self(units)
        }
    }

    /// Convert a fraction of the track (e.g. `0.02`) to units.
    ///
    /// Non-finite and negative inputs map to zero.
    pub fn from_fraction(fraction: f32) -> Self {
        if !fraction.is_finite() || fraction <= 0.0 {
            return Self::ZERO;
        }
        let units = (f64::from(fraction) * f64::from(PROGRESS_SCALE)).round();
        if units >= f64::from(PROGRESS_SCALE) {
            Self::COMPLETE
        } else {
            // In range [0, PROGRESS_SCALE) after the checks above.
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            Self(units as u32)
        }
    }

    /// Raw units.
    #[inline]
    pub const fn units(self) -> u32 {
        self.0
    }

    /// Fraction of the track in `[0.0, 1.0]`.
    #[inline]
    pub fn as_fraction(self) -> f32 {
        #[allow(clippy::cast_precision_loss)]
        let fraction = self.0 as f32 / PROGRESS_SCALE as f32;
        fraction
    }

    /// Advance by `step`, stopping at the finish line.
    #[inline]
    #[must_use]
    pub const fn advance(self, step: Progress) -> Self {
        Self::from_units(self.0.saturating_add(step.0))
    }

    /// Has the finish line been reached.
    #[inline]
    pub const fn is_complete(self) -> bool {
        self.0 >= PROGRESS_SCALE
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}%", self.0 / 100, self.0 % 100)
    }
}
