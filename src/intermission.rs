use serde::{Deserialize, Serialize};

use crate::clock::Millis;

const MINUTE_MS: Millis = 60 * 1000;

/// When automatic intermissions are inserted, in canonical playback time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntermissionPolicy {
    /// Playback time between intermissions.
    pub interval_ms: Millis,
    /// Wall-clock length of each intermission.
    pub length_ms: Millis,
    /// Later intermissions are skipped unless more than this much runtime
    /// remains after them.
    pub min_remaining_ms: Millis,
}

impl Default for IntermissionPolicy {
    fn default() -> Self {
        IntermissionPolicy {
            interval_ms: 60 * MINUTE_MS,
            length_ms: 10 * MINUTE_MS,
            min_remaining_ms: 30 * MINUTE_MS,
        }
    }
}

impl IntermissionPolicy {
    /// Canonical offset of the next intermission strictly after `offset`, if
    /// one is due before the end of a `duration_ms` long media.
    pub fn next_target(&self, offset: Millis, duration_ms: Millis) -> Option<Millis> {
        if self.interval_ms == 0 {
            return None;
        }
        let k = offset / self.interval_ms + 1;
        let target = k.checked_mul(self.interval_ms)?;
        let remaining = duration_ms.checked_sub(target)?;
        let due = if k == 1 {
            remaining > 0
        } else {
            remaining > self.min_remaining_ms
        };
        due.then_some(target)
    }

    /// All intermission targets for an uninterrupted playback of the media.
    pub fn plan(&self, duration_ms: Millis) -> Vec<Millis> {
        let mut targets = Vec::new();
        let mut offset = 0;
        while let Some(target) = self.next_target(offset, duration_ms) {
            targets.push(target);
            offset = target;
        }
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Millis = 60 * MINUTE_MS;

    #[test]
    fn two_hour_session_gets_one_intermission() {
        let policy = IntermissionPolicy::default();
        assert_eq!(policy.next_target(0, 2 * HOUR), Some(3_600_000));
        // Resuming at the first target leaves nothing worth pausing for.
        assert_eq!(policy.next_target(3_600_000, 2 * HOUR), None);
        assert_eq!(policy.plan(7_200_000), vec![3_600_000]);
    }

    #[test]
    fn ninety_minute_session_gets_exactly_one() {
        let policy = IntermissionPolicy::default();
        assert_eq!(policy.plan(5_400_000), vec![3_600_000]);
    }

    #[test]
    fn three_hour_session_pauses_hourly() {
        let policy = IntermissionPolicy::default();
        assert_eq!(policy.plan(3 * HOUR), vec![3_600_000, 7_200_000]);
    }

    #[test]
    fn long_tail_needs_more_than_thirty_minutes() {
        let policy = IntermissionPolicy::default();
        assert_eq!(policy.plan(2 * HOUR + 30 * MINUTE_MS), vec![HOUR]);
        assert_eq!(
            policy.plan(2 * HOUR + 31 * MINUTE_MS),
            vec![HOUR, 2 * HOUR]
        );
    }

    #[test]
    fn short_media_gets_none() {
        let policy = IntermissionPolicy::default();
        assert!(policy.plan(50 * MINUTE_MS).is_empty());
        assert!(policy.plan(HOUR).is_empty());
        assert_eq!(policy.plan(HOUR + 1), vec![HOUR]);
    }

    #[test]
    fn target_follows_current_offset() {
        let policy = IntermissionPolicy::default();
        // After a manual pause mid-hour, the target stays at the hour mark.
        assert_eq!(policy.next_target(30 * MINUTE_MS, 3 * HOUR), Some(HOUR));
        assert_eq!(policy.next_target(HOUR + 1, 3 * HOUR), Some(2 * HOUR));
    }
}
