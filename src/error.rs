use failure::Fail;

use crate::clock::ClockError;

#[derive(Debug, Clone, PartialEq, Eq, Fail)]
pub enum OrchestratorError {
    #[fail(display = "duration must be positive, got {}", _0)]
    InvalidDuration(i64),
    #[fail(display = "session {} does not exist", _0)]
    SessionNotFound(String),
    #[fail(display = "session {} has been stopped", _0)]
    SessionStopped(String),
    #[fail(display = "session {} has already started", _0)]
    AlreadyStarted(String),
    #[fail(display = "session {} is not playing", _0)]
    NotActive(String),
    #[fail(display = "session {} is not paused", _0)]
    NotPaused(String),
    #[fail(display = "device {} is not authorized for {}", device, username)]
    UnauthorizedDevice { username: String, device: String },
    #[fail(display = "{} is offline", _0)]
    UserOffline(String),
    #[fail(display = "credential validation failed: {}", _0)]
    ValidationFailed(String),
    #[fail(display = "{} already participates in session {}", username, session)]
    AlreadyInSession { username: String, session: String },
    #[fail(display = "{} does not participate in session {}", username, session)]
    NotParticipant { username: String, session: String },
    #[fail(display = "clock invariant violated: {}", _0)]
    Clock(#[cause] ClockError),
}

impl From<ClockError> for OrchestratorError {
    fn from(e: ClockError) -> Self {
        OrchestratorError::Clock(e)
    }
}

impl OrchestratorError {
    /// State-machine violations the caller can recover from by re-checking
    /// the session state.
    pub fn is_state_conflict(&self) -> bool {
        matches!(
            self,
            OrchestratorError::AlreadyStarted(_)
                | OrchestratorError::NotActive(_)
                | OrchestratorError::NotPaused(_)
                | OrchestratorError::SessionStopped(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
