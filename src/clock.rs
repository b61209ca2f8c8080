//! Canonical playback offset arithmetic.
//!
//! Every scheduling and drift decision in the orchestrator is expressed in
//! terms of [`offset`], so pause bookkeeping lives here and nowhere else.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use failure::Fail;
use serde::Serialize;
use tokio::time::Instant;

/// Milliseconds, either since the unix epoch or since the start of the media.
pub type Millis = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PauseInterval {
    pub started_at: Millis,
    pub resumed_at: Option<Millis>,
}

impl PauseInterval {
    pub fn open(started_at: Millis) -> Self {
        PauseInterval {
            started_at,
            resumed_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.resumed_at.is_none()
    }

    /// Paused time covered by this interval as of `now`.
    pub fn paused_ms(&self, now: Millis) -> Millis {
        self.resumed_at
            .unwrap_or(now)
            .saturating_sub(self.started_at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Fail)]
pub enum ClockError {
    #[fail(display = "now ({}) precedes start time ({})", now, start)]
    NowBeforeStart { start: Millis, now: Millis },
    #[fail(display = "pause interval {} begins before the start time", _0)]
    PauseBeforeStart(usize),
    #[fail(display = "pause interval {} resumes before it starts", _0)]
    Inverted(usize),
    #[fail(display = "pause interval {} overlaps the previous one", _0)]
    Overlap(usize),
    #[fail(display = "pause interval {} is open but not the last one", _0)]
    OpenNotLast(usize),
    #[fail(display = "pause interval {} lies after now", _0)]
    PauseInFuture(usize),
    #[fail(display = "paused time {} exceeds elapsed time {}", paused, elapsed)]
    Negative { elapsed: Millis, paused: Millis },
}

/// Checks the interval invariants: chronological, non-overlapping, inside
/// `[start_time, now]`, with at most one open interval which must be last.
pub fn validate(
    start_time: Millis,
    pause_intervals: &[PauseInterval],
    now: Millis,
) -> Result<(), ClockError> {
    if now < start_time {
        return Err(ClockError::NowBeforeStart {
            start: start_time,
            now,
        });
    }
    let mut previous_end = start_time;
    let last = pause_intervals.len().saturating_sub(1);
    for (index, interval) in pause_intervals.iter().enumerate() {
        if interval.started_at < start_time {
            return Err(ClockError::PauseBeforeStart(index));
        }
        if interval.started_at < previous_end {
            return Err(ClockError::Overlap(index));
        }
        if interval.started_at > now {
            return Err(ClockError::PauseInFuture(index));
        }
        match interval.resumed_at {
            Some(resumed_at) if resumed_at < interval.started_at => {
                return Err(ClockError::Inverted(index));
            }
            Some(resumed_at) if resumed_at > now => {
                return Err(ClockError::PauseInFuture(index));
            }
            Some(resumed_at) => previous_end = resumed_at,
            None if index != last => return Err(ClockError::OpenNotLast(index)),
            None => previous_end = now,
        }
    }
    Ok(())
}

/// Canonical playback offset at `now`.
///
/// `(now - start) - closed pauses - (now - open pause start)`. While a pause
/// is open the result stays frozen at the value it had when the pause began.
pub fn offset(
    start_time: Millis,
    pause_intervals: &[PauseInterval],
    now: Millis,
) -> Result<Millis, ClockError> {
    validate(start_time, pause_intervals, now)?;
    let elapsed = now - start_time;
    let paused: Millis = pause_intervals.iter().map(|p| p.paused_ms(now)).sum();
    elapsed
        .checked_sub(paused)
        .ok_or(ClockError::Negative { elapsed, paused })
}

/// Bounds an offset to the media runtime.
pub fn clamp(offset: Millis, duration_ms: Millis) -> Millis {
    offset.min(duration_ms)
}

/// Process clock. Reads epoch milliseconds as the boot-time wall clock plus
/// monotonic elapsed time, so readings never go backwards.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch_ms: Millis,
    base: Instant,
}

impl Clock {
    pub fn new() -> Self {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as Millis;
        Clock {
            epoch_ms,
            base: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> Millis {
        self.epoch_ms + self.base.elapsed().as_millis() as Millis
    }

    /// Monotonic deadline for an epoch timestamp. Past timestamps map to
    /// deadlines that are already due.
    pub fn deadline_at(&self, at: Millis) -> Instant {
        self.base + Duration::from_millis(at.saturating_sub(self.epoch_ms))
    }

    /// Monotonic deadline `ms` milliseconds from now.
    pub fn deadline_in(&self, ms: Millis) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed(started_at: Millis, resumed_at: Millis) -> PauseInterval {
        PauseInterval {
            started_at,
            resumed_at: Some(resumed_at),
        }
    }

    #[test]
    fn offset_without_pauses_is_elapsed_time() {
        let t = 1_700_000_000_000;
        assert_eq!(offset(t, &[], t + 5000), Ok(5000));
    }

    #[test]
    fn closed_interval_is_subtracted() {
        assert_eq!(offset(0, &[closed(1000, 4000)], 5000), Ok(2000));
    }

    #[test]
    fn open_interval_freezes_offset() {
        let intervals = [closed(2000, 5000), PauseInterval::open(7000)];
        // 7000 elapsed at the pause, 3000 of it paused before.
        assert_eq!(offset(0, &intervals, 7000), Ok(4000));
        assert_eq!(offset(0, &intervals, 10_000), Ok(4000));
        assert_eq!(offset(0, &intervals, 99_000), Ok(4000));
    }

    #[test]
    fn pause_at_start_yields_zero() {
        assert_eq!(offset(100, &[PauseInterval::open(100)], 5000), Ok(0));
    }

    #[test]
    fn clamp_bounds_to_duration() {
        assert_eq!(clamp(12_000, 10_000), 10_000);
        assert_eq!(clamp(3_000, 10_000), 3_000);
    }

    #[test]
    fn rejects_now_before_start() {
        assert_eq!(
            offset(5000, &[], 4000),
            Err(ClockError::NowBeforeStart {
                start: 5000,
                now: 4000
            })
        );
    }

    #[test]
    fn rejects_overlapping_intervals() {
        let intervals = [closed(1000, 4000), closed(3000, 4500)];
        assert_eq!(offset(0, &intervals, 5000), Err(ClockError::Overlap(1)));
    }

    #[test]
    fn rejects_open_interval_that_is_not_last() {
        let intervals = [PauseInterval::open(1000), closed(2000, 3000)];
        assert_eq!(
            offset(0, &intervals, 5000),
            Err(ClockError::OpenNotLast(0))
        );
    }

    #[test]
    fn rejects_inverted_and_early_intervals() {
        assert_eq!(
            offset(0, &[closed(3000, 2000)], 5000),
            Err(ClockError::Inverted(0))
        );
        assert_eq!(
            offset(1000, &[closed(500, 2000)], 5000),
            Err(ClockError::PauseBeforeStart(0))
        );
        assert_eq!(
            offset(0, &[closed(1000, 6000)], 5000),
            Err(ClockError::PauseInFuture(0))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn clock_follows_tokio_time() {
        let clock = Clock::new();
        let before = clock.now_ms();
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(clock.now_ms() - before, 1500);
        assert!(clock.deadline_at(0) <= Instant::now());
    }
}
