//! Cumulative volume delta tracking and zero-cross detection
//!
//! CVD is the running sum of signed aggregate deltas since session start. A
//! delta flip fires when CVD changes sign and the previous extreme had
//! enough magnitude to matter; chop around zero stays silent.

use crate::types::Direction;

/// Zero-cross detected on a CVD update
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZeroCross {
    pub direction: Direction,
    pub cvd: i64,
}

pub struct CvdTracker {
    cvd: i64,
    /// Sign of the regime CVD is in: the last non-zero sign observed. A
    /// sample landing exactly on zero neither emits nor resets anything.
    regime: i8,
    /// Largest |CVD| reached in the current regime; this is the magnitude
    /// the hysteresis tests, so a gradual unwind through zero still flips
    extreme: i64,
    threshold: i64,
}

impl CvdTracker {
    pub fn new(threshold: i64) -> Self {
        Self {
            cvd: 0,
            regime: 0,
            extreme: 0,
            threshold,
        }
    }

    pub fn value(&self) -> i64 {
        self.cvd
    }

    /// Sign of the current CVD: -1, 0 or +1
    pub fn sign(&self) -> i8 {
        self.cvd.signum() as i8
    }

    /// Fold one aggregate delta into the running sum, reporting a
    /// zero-cross when the sign flips and the previous regime reached the
    /// hysteresis threshold.
    pub fn apply(&mut self, delta: i64) -> Option<ZeroCross> {
        self.cvd += delta;
        let sign = self.cvd.signum() as i8;

        if sign == 0 {
            return None;
        }

        if sign == self.regime || self.regime == 0 {
            self.regime = sign;
            self.extreme = self.extreme.max(self.cvd.abs());
            return None;
        }

        // Sign changed; flip only if the old regime had real magnitude
        let crossed = self.extreme >= self.threshold;
        self.regime = sign;
        self.extreme = self.cvd.abs();

        crossed.then(|| ZeroCross {
            direction: if self.cvd > 0 {
                Direction::Bullish
            } else {
                Direction::Bearish
            },
            cvd: self.cvd,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_sum() {
        let mut t = CvdTracker::new(300);
        assert!(t.apply(-10).is_none());
        assert_eq!(t.value(), -10);
        assert!(t.apply(5).is_none());
        assert_eq!(t.value(), -5);
        assert_eq!(t.sign(), -1);
    }

    #[test]
    fn test_flip_requires_hysteresis() {
        let mut t = CvdTracker::new(300);
        t.apply(299);
        // Sign flips but |prev| < 300: no emission
        assert!(t.apply(-400).is_none());
        assert_eq!(t.value(), -101);
    }

    #[test]
    fn test_flip_bearish() {
        let mut t = CvdTracker::new(300);
        t.apply(400);
        let cross = t.apply(-500).expect("should flip");
        assert_eq!(cross.direction, Direction::Bearish);
        assert_eq!(cross.cvd, -100);
    }

    #[test]
    fn test_flip_bullish() {
        let mut t = CvdTracker::new(300);
        t.apply(-350);
        let cross = t.apply(400).expect("should flip");
        assert_eq!(cross.direction, Direction::Bullish);
        assert_eq!(cross.cvd, 50);
    }

    /// +400 then exactly to zero then negative: one bearish flip total
    #[test]
    fn test_exact_zero_sample_does_not_swallow_flip() {
        let mut t = CvdTracker::new(300);
        t.apply(400);
        assert!(t.apply(-400).is_none()); // lands exactly on zero
        let cross = t.apply(-1).expect("flip on leaving zero");
        assert_eq!(cross.direction, Direction::Bearish);
        // No second flip while staying negative
        assert!(t.apply(-50).is_none());
    }

    #[test]
    fn test_no_repeat_flip_same_side() {
        let mut t = CvdTracker::new(300);
        t.apply(400);
        assert!(t.apply(-500).is_some());
        assert!(t.apply(-100).is_none());
        // Flip back needs |prev| >= 300 again: prev is -200 here
        assert!(t.apply(300).is_none());
    }
}
