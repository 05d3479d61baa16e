//! Millisecond to platform tick conversion.
//!
//! Every wait bound that crosses the channel boundary, and every blocking wait
//! in [`SyncEventHandler`](crate::SyncEventHandler), is expressed in [`Ticks`].
//! The conversions below are the only place milliseconds become ticks.

use core::time::Duration;

/// Platform scheduler tick rate.
pub const TICK_RATE_HZ: u32 = 1000;

/// A wait bound in scheduler ticks.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ticks(u32);

impl Ticks {
    /// Do not wait at all.
    pub const ZERO: Ticks = Ticks(0);

    /// Wait forever.
    pub const MAX_DELAY: Ticks = Ticks(u32::MAX);

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Ticks(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Convert milliseconds to ticks, rounding down.
    ///
    /// Finite waits never saturate into [`Ticks::MAX_DELAY`]; a huge finite wait
    /// stays finite.
    pub const fn from_millis(ms: u64) -> Self {
        let ticks = (ms as u128 * TICK_RATE_HZ as u128) / 1000;
        if ticks >= u32::MAX as u128 {
            Ticks(u32::MAX - 1)
        } else {
            Ticks(ticks as u32)
        }
    }

    /// Convert a [`Duration`] to ticks. `Duration::MAX` maps to [`Ticks::MAX_DELAY`].
    pub fn from_duration(duration: Duration) -> Self {
        if duration == Duration::MAX {
            return Ticks::MAX_DELAY;
        }
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        Self::from_millis(ms)
    }

    /// The wall-clock length of this wait, or `None` for [`Ticks::MAX_DELAY`].
    pub fn to_duration(self) -> Option<Duration> {
        if self.is_forever() {
            return None;
        }
        let ms = (self.0 as u64 * 1000) / TICK_RATE_HZ as u64;
        Some(Duration::from_millis(ms))
    }

    #[inline]
    pub const fn is_forever(self) -> bool {
        self.0 == u32::MAX
    }
}

impl From<Duration> for Ticks {
    fn from(duration: Duration) -> Self {
        Ticks::from_duration(duration)
    }
}

#[cfg(test)]
mod tests {
    use super::{Ticks, TICK_RATE_HZ};
    use core::time::Duration;

    #[test]
    fn millis_round_trip_at_tick_rate() {
        let ticks = Ticks::from_millis(250);
        assert_eq!(ticks.raw(), 250 * TICK_RATE_HZ / 1000);
        assert_eq!(ticks.to_duration(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn sub_tick_waits_round_down_to_zero() {
        assert_eq!(Ticks::from_duration(Duration::from_micros(400)), Ticks::ZERO);
        assert_eq!(Ticks::from_duration(Duration::ZERO), Ticks::ZERO);
    }

    #[test]
    fn max_duration_is_forever() {
        let ticks = Ticks::from_duration(Duration::MAX);
        assert!(ticks.is_forever());
        assert_eq!(ticks.to_duration(), None);
    }

    #[test]
    fn large_finite_waits_stay_finite() {
        let ticks = Ticks::from_millis(u64::MAX);
        assert!(!ticks.is_forever());
        assert!(ticks.to_duration().is_some());
    }
}
