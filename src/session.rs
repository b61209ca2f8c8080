use std::collections::BTreeMap;

use serde::Serialize;

use crate::clock::{self, ClockError, Millis, PauseInterval};
use crate::error::{OrchestratorError, Result};
use crate::message::{CommandTemplate, Device};

pub type SessionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Pending,
    Active,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseCause {
    Manual,
    Intermission,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Participant {
    pub device: Device,
    pub joined_at: Millis,
}

/// Where a newly added participant landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Prequeued,
    LateJoin,
}

/// One watch party. All methods are pure bookkeeping; dispatching commands
/// and arming timers is up to the caller.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub filename: String,
    pub duration_ms: Millis,
    pub scheduled_start_time: Option<Millis>,
    pub start_time: Option<Millis>,
    pub pause_intervals: Vec<PauseInterval>,
    pub pause_cause: Option<PauseCause>,
    pub prequeue: Vec<String>,
    pub participants: BTreeMap<String, Participant>,
    pub state: SessionState,
    pub created_at: Millis,
    pub stopped_at: Option<Millis>,
}

impl Session {
    pub fn new(
        id: SessionId,
        filename: String,
        duration_ms: Millis,
        scheduled_start_time: Option<Millis>,
        now: Millis,
    ) -> Self {
        Session {
            id,
            filename,
            duration_ms,
            scheduled_start_time,
            start_time: None,
            pause_intervals: Vec::new(),
            pause_cause: None,
            prequeue: Vec::new(),
            participants: BTreeMap::new(),
            state: SessionState::Pending,
            created_at: now,
            stopped_at: None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.state, SessionState::Active | SessionState::Paused)
    }

    /// Canonical offset at `now`, clamped to the runtime. Zero before start.
    pub fn offset(&self, now: Millis) -> std::result::Result<Millis, ClockError> {
        match self.start_time {
            None => Ok(0),
            Some(start) => {
                // A stopped session stays frozen where it ended.
                let now = self.stopped_at.map_or(now, |stopped| stopped.min(now));
                let raw = clock::offset(start, &self.pause_intervals, now)?;
                Ok(clock::clamp(raw, self.duration_ms))
            }
        }
    }

    pub fn recipients(&self) -> Vec<(String, Device)> {
        self.participants
            .iter()
            .map(|(username, p)| (username.clone(), p.device.clone()))
            .collect()
    }

    pub fn add_participant(
        &mut self,
        username: &str,
        device: Device,
        now: Millis,
    ) -> Result<Placement> {
        if self.state == SessionState::Stopped {
            return Err(OrchestratorError::SessionStopped(self.id.clone()));
        }
        self.participants.insert(
            username.to_string(),
            Participant {
                device,
                joined_at: now,
            },
        );
        if self.state == SessionState::Pending {
            if !self.prequeue.iter().any(|u| u == username) {
                self.prequeue.push(username.to_string());
            }
            Ok(Placement::Prequeued)
        } else {
            Ok(Placement::LateJoin)
        }
    }

    pub fn remove_participant(&mut self, username: &str) -> Result<Participant> {
        let participant =
            self.participants
                .remove(username)
                .ok_or_else(|| OrchestratorError::NotParticipant {
                    username: username.to_string(),
                    session: self.id.clone(),
                })?;
        if self.state == SessionState::Pending {
            self.prequeue.retain(|u| u != username);
        }
        Ok(participant)
    }

    /// `PENDING -> ACTIVE`. Returns the prequeued participants that should
    /// receive the initial PLAY; usernames without a participant entry are
    /// skipped.
    pub fn start(&mut self, now: Millis) -> Result<Vec<(String, Device)>> {
        if self.state != SessionState::Pending {
            return Err(OrchestratorError::AlreadyStarted(self.id.clone()));
        }
        self.state = SessionState::Active;
        self.start_time = Some(now);
        Ok(self
            .prequeue
            .iter()
            .filter_map(|u| {
                self.participants
                    .get(u)
                    .map(|p| (u.clone(), p.device.clone()))
            })
            .collect())
    }

    pub fn pause(&mut self, now: Millis, cause: PauseCause) -> Result<()> {
        if self.state != SessionState::Active {
            return Err(OrchestratorError::NotActive(self.id.clone()));
        }
        self.pause_intervals.push(PauseInterval::open(now));
        self.pause_cause = Some(cause);
        self.state = SessionState::Paused;
        Ok(())
    }

    pub fn resume(&mut self, now: Millis) -> Result<()> {
        if self.state != SessionState::Paused {
            return Err(OrchestratorError::NotPaused(self.id.clone()));
        }
        self.close_open_interval(now);
        self.pause_cause = None;
        self.state = SessionState::Active;
        Ok(())
    }

    /// Moves to `STOPPED`. Returns false if the session was already stopped.
    pub fn stop(&mut self, now: Millis) -> bool {
        if self.state == SessionState::Stopped {
            return false;
        }
        self.close_open_interval(now);
        self.pause_cause = None;
        self.state = SessionState::Stopped;
        self.stopped_at = Some(now);
        true
    }

    fn close_open_interval(&mut self, now: Millis) {
        if let Some(last) = self.pause_intervals.last_mut() {
            if last.is_open() {
                last.resumed_at = Some(now.max(last.started_at));
            }
        }
    }

    /// Commands that bring a single client in line with the session as it is
    /// now: PLAY at the canonical offset, followed by PAUSE while paused.
    pub fn catch_up(&self, now: Millis) -> std::result::Result<Vec<CommandTemplate>, ClockError> {
        let play = CommandTemplate::Play {
            filename: self.filename.clone(),
            offset_ms: self.offset(now)?,
        };
        Ok(match self.state {
            SessionState::Active => vec![play],
            SessionState::Paused => vec![play, CommandTemplate::Pause],
            SessionState::Pending | SessionState::Stopped => vec![],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("ABCDE".to_string(), "movie.mkv".to_string(), 10_000, None, 0)
    }

    fn local() -> Device {
        Device::new("Local", "m1")
    }

    fn assert_intervals_well_formed(session: &Session) {
        let mut previous_end = session.start_time.unwrap_or(0);
        let open = session
            .pause_intervals
            .iter()
            .filter(|p| p.is_open())
            .count();
        assert!(open <= 1);
        for (i, p) in session.pause_intervals.iter().enumerate() {
            assert!(p.started_at >= previous_end, "interval {} overlaps", i);
            match p.resumed_at {
                Some(end) => previous_end = end,
                None => assert_eq!(i, session.pause_intervals.len() - 1),
            }
        }
    }

    #[test]
    fn prequeue_records_each_user_once() {
        let mut s = session();
        assert_eq!(s.add_participant("alice", local(), 0), Ok(Placement::Prequeued));
        assert_eq!(s.add_participant("alice", local(), 1), Ok(Placement::Prequeued));
        assert_eq!(s.add_participant("bob", local(), 2), Ok(Placement::Prequeued));
        assert_eq!(s.prequeue, vec!["alice", "bob"]);
    }

    #[test]
    fn start_returns_prequeued_recipients_and_freezes_prequeue() {
        let mut s = session();
        s.add_participant("alice", local(), 0).unwrap();
        s.prequeue.push("ghost".to_string());
        let recipients = s.start(100).unwrap();
        assert_eq!(recipients, vec![("alice".to_string(), local())]);
        assert_eq!(s.start_time, Some(100));
        assert_eq!(s.state, SessionState::Active);

        assert_eq!(s.add_participant("bob", local(), 200), Ok(Placement::LateJoin));
        assert_eq!(s.prequeue, vec!["alice", "ghost"]);
        assert_eq!(
            s.start(300),
            Err(OrchestratorError::AlreadyStarted("ABCDE".to_string()))
        );
    }

    #[test]
    fn pause_and_resume_follow_the_state_machine() {
        let mut s = session();
        assert_eq!(
            s.pause(0, PauseCause::Manual),
            Err(OrchestratorError::NotActive("ABCDE".to_string()))
        );
        s.start(0).unwrap();
        assert_eq!(
            s.resume(10),
            Err(OrchestratorError::NotPaused("ABCDE".to_string()))
        );
        s.pause(1000, PauseCause::Manual).unwrap();
        assert_eq!(
            s.pause(1500, PauseCause::Manual),
            Err(OrchestratorError::NotActive("ABCDE".to_string()))
        );
        s.resume(4000).unwrap();
        assert_eq!(s.offset(5000), Ok(2000));
        assert_intervals_well_formed(&s);
    }

    #[test]
    fn any_sequence_of_valid_calls_keeps_intervals_well_formed() {
        let mut s = session();
        s.start(0).unwrap();
        let mut now = 0;
        for step in 0..50 {
            now += 37 * (step % 5) + 1;
            if step % 3 == 0 {
                let _ = s.pause(now, PauseCause::Manual);
            } else {
                let _ = s.resume(now);
            }
            assert_intervals_well_formed(&s);
        }
    }

    #[test]
    fn offset_is_clamped_to_duration() {
        let mut s = session();
        s.start(0).unwrap();
        assert_eq!(s.offset(25_000), Ok(10_000));
    }

    #[test]
    fn stop_is_idempotent_and_freezes_offset() {
        let mut s = session();
        s.start(0).unwrap();
        s.pause(2000, PauseCause::Intermission).unwrap();
        assert!(s.stop(3000));
        assert!(!s.stop(4000));
        assert_eq!(s.state, SessionState::Stopped);
        assert_eq!(s.pause_intervals[0].resumed_at, Some(3000));
        assert_eq!(s.offset(9000), Ok(2000));
        assert_eq!(
            s.add_participant("late", local(), 9000),
            Err(OrchestratorError::SessionStopped("ABCDE".to_string()))
        );
    }

    #[test]
    fn catch_up_depends_on_state() {
        let mut s = session();
        assert!(s.catch_up(0).unwrap().is_empty());
        s.start(0).unwrap();
        let play = |offset_ms| CommandTemplate::Play {
            filename: "movie.mkv".to_string(),
            offset_ms,
        };
        assert_eq!(s.catch_up(1500).unwrap(), vec![play(1500)]);
        s.pause(2000, PauseCause::Manual).unwrap();
        assert_eq!(
            s.catch_up(6000).unwrap(),
            vec![play(2000), CommandTemplate::Pause]
        );
    }

    #[test]
    fn remove_participant_drops_from_prequeue() {
        let mut s = session();
        s.add_participant("alice", local(), 0).unwrap();
        s.remove_participant("alice").unwrap();
        assert!(s.prequeue.is_empty());
        assert_eq!(
            s.remove_participant("alice"),
            Err(OrchestratorError::NotParticipant {
                username: "alice".to_string(),
                session: "ABCDE".to_string()
            })
        );
    }
}
