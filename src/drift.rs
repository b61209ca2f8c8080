//! Compares client-reported positions with the canonical offset.
//!
//! The verdict only ever names a corrective command; session state is never
//! touched, so the canonical offset stays the clock model's value and not a
//! client's self-report.

use crate::clock::{ClockError, Millis};
use crate::message::CommandTemplate;
use crate::session::Session;

pub const DEFAULT_DRIFT_THRESHOLD_MS: Millis = 5000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The session is not playing; nothing to compare against.
    Idle,
    InSync { drift_ms: Millis },
    /// Playing the right file at the wrong position.
    Drifted { expected_ms: Millis, drift_ms: Millis },
    /// Playing a different file altogether.
    WrongFile { reported: String, expected: String },
}

impl Verdict {
    /// The commands that correct this verdict, in order.
    pub fn corrections(
        &self,
        session: &Session,
        now: Millis,
    ) -> Result<Vec<CommandTemplate>, ClockError> {
        match self {
            Verdict::Idle | Verdict::InSync { .. } => Ok(vec![]),
            Verdict::Drifted { expected_ms, .. } => Ok(vec![CommandTemplate::Seek {
                offset_ms: *expected_ms,
            }]),
            Verdict::WrongFile { .. } => session.catch_up(now),
        }
    }
}

pub fn assess(
    session: &Session,
    filename: &str,
    offset_ms: Millis,
    now: Millis,
    threshold_ms: Millis,
) -> Result<Verdict, ClockError> {
    if !session.is_live() {
        return Ok(Verdict::Idle);
    }
    if filename != session.filename {
        return Ok(Verdict::WrongFile {
            reported: filename.to_string(),
            expected: session.filename.clone(),
        });
    }
    let expected_ms = session.offset(now)?;
    let drift_ms = offset_ms.abs_diff(expected_ms);
    if drift_ms > threshold_ms {
        Ok(Verdict::Drifted {
            expected_ms,
            drift_ms,
        })
    } else {
        Ok(Verdict::InSync { drift_ms })
    }
}
