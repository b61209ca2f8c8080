use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use log::{debug, error, info, warn};
use rand::distributions::Distribution;
use rand::{thread_rng, Rng};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::clock::{Clock, Millis, PauseInterval};
use crate::drift::{self, Verdict, DEFAULT_DRIFT_THRESHOLD_MS};
use crate::error::{OrchestratorError, Result};
use crate::intermission::IntermissionPolicy;
use crate::message::{Command, CommandTemplate};
use crate::metrics;
use crate::registry::{ClientStatus, ConnectionId, ConnectionRegistry};
use crate::scheduler::{Ticket, TimerSlot, Transition};
use crate::session::{
    Participant, PauseCause, Placement, Session, SessionId, SessionState,
};

const SESSION_ID_LEN: usize = 6;

fn generate_session_id(len: usize) -> SessionId {
    pub struct UserFriendlyAlphabet;
    impl Distribution<u8> for UserFriendlyAlphabet {
        fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> u8 {
            const GEN_ASCII_STR_CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
            GEN_ASCII_STR_CHARSET[(rng.next_u32() >> (32 - 5)) as usize]
        }
    }

    thread_rng()
        .sample_iter(&UserFriendlyAlphabet)
        .take(len)
        .map(char::from)
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct Settings {
    pub drift_threshold_ms: Millis,
    pub intermission: IntermissionPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            drift_threshold_ms: DEFAULT_DRIFT_THRESHOLD_MS,
            intermission: IntermissionPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub filename: String,
    pub duration_ms: Millis,
    pub state: SessionState,
    pub scheduled_start_time: Option<Millis>,
    pub start_time: Option<Millis>,
    /// `None` if the session's pause bookkeeping is inconsistent.
    pub offset_ms: Option<Millis>,
    pub pause_intervals: Vec<PauseInterval>,
    pub pause_cause: Option<PauseCause>,
    pub prequeue: Vec<String>,
    pub participants: BTreeMap<String, Participant>,
    pub next_transition: Option<Transition>,
    pub next_transition_in_ms: Option<Millis>,
    /// Canonical offsets of the intermissions the policy inserts.
    pub planned_intermissions: Vec<Millis>,
}

struct Entry {
    session: Session,
    timer: TimerSlot,
}

type EntryRef = Arc<Mutex<Entry>>;

/// Process-wide registry of sessions and the entry point for every session
/// operation. Each session sits behind its own mutex, so operations and timer
/// callbacks on one session are serialized while different sessions proceed
/// in parallel.
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, EntryRef>>,
    /// username -> the one session that user participates in. Locked after a
    /// session entry, never before.
    memberships: Mutex<HashMap<String, SessionId>>,
    registry: Arc<ConnectionRegistry>,
    clock: Clock,
    settings: Settings,
    this: Weak<SessionManager>,
}

impl SessionManager {
    pub fn new(registry: Arc<ConnectionRegistry>, settings: Settings) -> Arc<Self> {
        Arc::new_cyclic(|this| SessionManager {
            sessions: Default::default(),
            memberships: Default::default(),
            registry,
            clock: Clock::new(),
            settings,
            this: this.clone(),
        })
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub async fn create_session(
        &self,
        filename: &str,
        duration_ms: i64,
        scheduled_start_time: Option<Millis>,
    ) -> Result<SessionSnapshot> {
        if duration_ms <= 0 {
            return Err(OrchestratorError::InvalidDuration(duration_ms));
        }
        let now = self.clock.now_ms();
        let mut sessions = self.sessions.write().await;
        let mut id = generate_session_id(SESSION_ID_LEN);
        while sessions.contains_key(&id) {
            id = generate_session_id(SESSION_ID_LEN);
        }
        let mut entry = Entry {
            session: Session::new(
                id.clone(),
                filename.to_string(),
                duration_ms as Millis,
                scheduled_start_time,
                now,
            ),
            timer: TimerSlot::default(),
        };
        if let Some(at) = scheduled_start_time {
            self.arm(&mut entry, Transition::Start, self.clock.deadline_at(at));
        }
        let snapshot = self.snapshot_of(&entry, now);
        sessions.insert(id.clone(), Arc::new(Mutex::new(entry)));
        metrics::NUM_ONGOING_SESSIONS.inc();
        info!(
            "Created session {} for {} ({} ms, scheduled start {:?})",
            id, filename, duration_ms, scheduled_start_time
        );
        Ok(snapshot)
    }

    pub async fn add_participant(
        &self,
        session_id: &str,
        username: &str,
        device_title: &str,
    ) -> Result<()> {
        let entry = self.entry(session_id).await?;
        let mut entry = entry.lock().await;
        if entry.session.state == SessionState::Stopped {
            return Err(OrchestratorError::SessionStopped(session_id.to_string()));
        }
        let device = self
            .registry
            .authorized_clients(username)
            .await
            .into_iter()
            .find(|d| d.title == device_title)
            .ok_or_else(|| OrchestratorError::UnauthorizedDevice {
                username: username.to_string(),
                device: device_title.to_string(),
            })?;
        self.claim_membership(username, session_id).await?;
        let now = self.clock.now_ms();
        let placement = entry.session.add_participant(username, device, now)?;
        info!(
            "{} joined session {} on {} ({:?})",
            username, session_id, device_title, placement
        );

        match placement {
            // Unscheduled sessions start with their first participant.
            Placement::Prequeued if entry.session.scheduled_start_time.is_none() => {
                self.start_locked(&mut entry).await
            }
            Placement::Prequeued => Ok(()),
            Placement::LateJoin => self.catch_up_locked(&entry, username).await,
        }
    }

    pub async fn remove_participant(&self, session_id: &str, username: &str) -> Result<()> {
        let entry = self.entry(session_id).await?;
        let mut entry = entry.lock().await;
        let participant = entry.session.remove_participant(username)?;
        {
            let mut memberships = self.memberships.lock().await;
            if memberships.get(username).map(String::as_str) == Some(session_id) {
                memberships.remove(username);
            }
        }
        info!("{} left session {}", username, session_id);
        if entry.session.is_live() {
            let stop = Command::Stop {
                device: participant.device,
            };
            if let Err(e) = self.registry.dispatch(username, stop).await {
                info!("STOP for departing {} dropped: {}", username, e);
            }
        }
        Ok(())
    }

    pub async fn start_session(&self, session_id: &str) -> Result<()> {
        let entry = self.entry(session_id).await?;
        let mut entry = entry.lock().await;
        self.start_locked(&mut entry).await
    }

    pub async fn pause_session(&self, session_id: &str) -> Result<()> {
        let entry = self.entry(session_id).await?;
        let mut entry = entry.lock().await;
        self.pause_locked(&mut entry, PauseCause::Manual).await
    }

    pub async fn resume_session(&self, session_id: &str) -> Result<()> {
        let entry = self.entry(session_id).await?;
        let mut entry = entry.lock().await;
        self.resume_locked(&mut entry).await
    }

    /// Stops the session. Stopping an already stopped session is a no-op.
    pub async fn stop_session(&self, session_id: &str) -> Result<()> {
        let entry = self.entry(session_id).await?;
        let mut entry = entry.lock().await;
        self.stop_locked(&mut entry).await;
        Ok(())
    }

    /// Stops the session if it is still running and drops it from the
    /// manager. Returns its final state.
    pub async fn remove_session(&self, session_id: &str) -> Result<SessionSnapshot> {
        let entry = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))?;
        let mut entry = entry.lock().await;
        self.stop_locked(&mut entry).await;
        info!("Session {} removed", session_id);
        Ok(self.snapshot_of(&entry, self.clock.now_ms()))
    }

    pub async fn session(&self, session_id: &str) -> Result<SessionSnapshot> {
        let entry = self.entry(session_id).await?;
        let entry = entry.lock().await;
        Ok(self.snapshot_of(&entry, self.clock.now_ms()))
    }

    pub async fn list_sessions(&self) -> Vec<SessionSnapshot> {
        let entries: Vec<EntryRef> = self.sessions.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(entries.len());
        for entry in entries {
            let entry = entry.lock().await;
            snapshots.push(self.snapshot_of(&entry, self.clock.now_ms()));
        }
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Records a client's playback report and corrects it if it strayed from
    /// its session's canonical position.
    pub async fn status_update(
        &self,
        username: &str,
        filename: &str,
        offset_ms: Millis,
    ) -> Result<Verdict> {
        let now = self.clock.now_ms();
        self.registry
            .record_status(
                username,
                ClientStatus {
                    filename: filename.to_string(),
                    offset_ms,
                    reported_at: now,
                },
            )
            .await;

        let session_id = self.memberships.lock().await.get(username).cloned();
        let session_id = match session_id {
            Some(id) => id,
            None => return Ok(Verdict::Idle),
        };
        let entry = self.entry(&session_id).await?;
        let entry = entry.lock().await;
        let device = match entry.session.participants.get(username) {
            Some(p) => p.device.clone(),
            None => return Ok(Verdict::Idle),
        };

        let verdict = drift::assess(
            &entry.session,
            filename,
            offset_ms,
            now,
            self.settings.drift_threshold_ms,
        )?;
        match &verdict {
            Verdict::Drifted {
                expected_ms,
                drift_ms,
            } => {
                info!(
                    "{} drifted {} ms in session {}, seeking to {}",
                    username, drift_ms, session_id, expected_ms
                );
                metrics::DRIFT_CORRECTIONS.inc();
            }
            Verdict::WrongFile { reported, expected } => {
                warn!(
                    "{} is playing {} but session {} plays {}, restarting playback",
                    username, reported, session_id, expected
                );
                metrics::DRIFT_CORRECTIONS.inc();
            }
            Verdict::Idle | Verdict::InSync { .. } => {}
        }
        for template in verdict.corrections(&entry.session, now)? {
            if let Err(e) = self
                .registry
                .dispatch(username, template.for_device(device.clone()))
                .await
            {
                info!("Correction for {} dropped: {}", username, e);
                break;
            }
        }
        Ok(verdict)
    }

    /// A user (re)registered. If they belong to a live session they are
    /// brought to its current position; they do not rejoin the prequeue.
    pub async fn on_register(&self, username: &str) {
        let session_id = self.memberships.lock().await.get(username).cloned();
        let entry = match session_id {
            Some(id) => match self.entry(&id).await {
                Ok(entry) => entry,
                Err(_) => return,
            },
            None => return,
        };
        let entry = entry.lock().await;
        if entry.session.is_live() {
            info!(
                "{} reconnected to session {}, catching up",
                username, entry.session.id
            );
            if let Err(e) = self.catch_up_locked(&entry, username).await {
                warn!("Catch-up for {} failed: {}", username, e);
            }
        }
    }

    /// The user's connection closed. Session membership is kept so a
    /// reconnect resumes without re-adding.
    pub async fn on_disconnect(&self, username: &str, connection: ConnectionId) {
        if self.registry.unregister(username, connection).await {
            if let Some(id) = self.memberships.lock().await.get(username) {
                info!("{} disconnected, keeping their place in session {}", username, id);
            }
        }
    }

    /// Cancels every armed timer.
    pub async fn shutdown(&self) {
        let entries: Vec<EntryRef> = self.sessions.read().await.values().cloned().collect();
        let mut cancelled = 0;
        for entry in entries {
            if entry.lock().await.timer.cancel().is_some() {
                cancelled += 1;
            }
        }
        info!("Cancelled {} scheduled transitions", cancelled);
    }

    async fn entry(&self, session_id: &str) -> Result<EntryRef> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))
    }

    async fn claim_membership(&self, username: &str, session_id: &str) -> Result<()> {
        let mut memberships = self.memberships.lock().await;
        match memberships.get(username) {
            Some(current) if current != session_id => Err(OrchestratorError::AlreadyInSession {
                username: username.to_string(),
                session: current.clone(),
            }),
            _ => {
                memberships.insert(username.to_string(), session_id.to_string());
                Ok(())
            }
        }
    }

    async fn start_locked(&self, entry: &mut Entry) -> Result<()> {
        let now = self.clock.now_ms();
        let recipients = entry.session.start(now)?;
        entry.timer.cancel();
        info!(
            "Session {} started, initial PLAY to {:?}",
            entry.session.id, entry.session.prequeue
        );
        let play = CommandTemplate::Play {
            filename: entry.session.filename.clone(),
            offset_ms: 0,
        };
        let report = self.registry.broadcast(recipients, &play).await;
        if !report.failed.is_empty() {
            warn!(
                "Session {} started without {} of {} prequeued participants",
                entry.session.id,
                report.failed.len(),
                report.failed.len() + report.delivered.len()
            );
        }
        self.schedule_next(entry);
        Ok(())
    }

    async fn pause_locked(&self, entry: &mut Entry, cause: PauseCause) -> Result<()> {
        let now = self.clock.now_ms();
        entry.session.pause(now, cause)?;
        entry.timer.cancel();
        info!(
            "Session {} paused ({:?}) at offset {:?}",
            entry.session.id,
            cause,
            entry.session.offset(now)
        );
        self.registry
            .broadcast(entry.session.recipients(), &CommandTemplate::Pause)
            .await;
        if cause == PauseCause::Intermission {
            let deadline = self.clock.deadline_in(self.settings.intermission.length_ms);
            self.arm(entry, Transition::Resume, deadline);
        }
        Ok(())
    }

    async fn resume_locked(&self, entry: &mut Entry) -> Result<()> {
        let now = self.clock.now_ms();
        entry.session.resume(now)?;
        entry.timer.cancel();
        let offset_ms = match entry.session.offset(now) {
            Ok(offset) => offset,
            Err(e) => {
                error!(
                    "Session {} cannot resume consistently: {}",
                    entry.session.id, e
                );
                return Err(e.into());
            }
        };
        info!("Session {} resumed at offset {}", entry.session.id, offset_ms);
        let play = CommandTemplate::Play {
            filename: entry.session.filename.clone(),
            offset_ms,
        };
        self.registry
            .broadcast(entry.session.recipients(), &play)
            .await;
        self.schedule_next(entry);
        Ok(())
    }

    async fn stop_locked(&self, entry: &mut Entry) -> bool {
        let now = self.clock.now_ms();
        if !entry.session.stop(now) {
            debug!("Session {} already stopped", entry.session.id);
            return false;
        }
        entry.timer.cancel();
        info!("Session {} stopped", entry.session.id);
        self.registry
            .broadcast(entry.session.recipients(), &CommandTemplate::Stop)
            .await;
        self.memberships
            .lock()
            .await
            .retain(|_, session| *session != entry.session.id);
        metrics::NUM_ONGOING_SESSIONS.dec();
        metrics::SESSION_DURATION_SEC
            .observe(now.saturating_sub(entry.session.created_at) as f64 / 1000.0);
        true
    }

    async fn catch_up_locked(&self, entry: &Entry, username: &str) -> Result<()> {
        let device = match entry.session.participants.get(username) {
            Some(p) => p.device.clone(),
            None => return Ok(()),
        };
        let now = self.clock.now_ms();
        for template in entry.session.catch_up(now)? {
            if let Err(e) = self
                .registry
                .dispatch(username, template.for_device(device.clone()))
                .await
            {
                info!("Catch-up for {} dropped: {}", username, e);
                break;
            }
        }
        Ok(())
    }

    /// Arms the next automatic transition of an active session: the next
    /// intermission if one is due, otherwise the end of playback.
    fn schedule_next(&self, entry: &mut Entry) {
        if entry.session.state != SessionState::Active {
            return;
        }
        let offset = match entry.session.offset(self.clock.now_ms()) {
            Ok(offset) => offset,
            Err(e) => {
                error!(
                    "Clock invariant violated in session {}: {}; automatic transitions disabled",
                    entry.session.id, e
                );
                entry.timer.cancel();
                return;
            }
        };
        let duration_ms = entry.session.duration_ms;
        let (transition, target) = match self
            .settings
            .intermission
            .next_target(offset, duration_ms)
        {
            Some(target) => (Transition::Intermission, target),
            None => (Transition::End, duration_ms),
        };
        debug!(
            "Session {} arms {:?} at offset {} (now {})",
            entry.session.id, transition, target, offset
        );
        let deadline = self.clock.deadline_in(target.saturating_sub(offset));
        self.arm(entry, transition, deadline);
    }

    fn arm(&self, entry: &mut Entry, transition: Transition, deadline: Instant) {
        let manager = self.this.clone();
        let session_id = entry.session.id.clone();
        entry.timer.arm(transition, deadline, move |ticket| async move {
            if let Some(manager) = manager.upgrade() {
                manager.on_timer(&session_id, ticket).await;
            }
        });
    }

    async fn on_timer(&self, session_id: &str, ticket: Ticket) {
        let entry = match self.entry(session_id).await {
            Ok(entry) => entry,
            Err(_) => return,
        };
        let mut entry = entry.lock().await;
        if !entry.timer.claim(ticket) {
            debug!(
                "Ignoring stale {:?} timer for session {}",
                ticket.transition, session_id
            );
            return;
        }
        let result = match ticket.transition {
            Transition::Start => self.start_locked(&mut entry).await,
            Transition::Intermission => {
                self.pause_locked(&mut entry, PauseCause::Intermission)
                    .await
            }
            Transition::Resume => self.resume_locked(&mut entry).await,
            Transition::End => {
                self.stop_locked(&mut entry).await;
                Ok(())
            }
        };
        match result {
            Ok(()) => {}
            Err(e) if e.is_state_conflict() => debug!(
                "Scheduled {:?} for session {} no longer applies: {}",
                ticket.transition, session_id, e
            ),
            Err(e) => warn!(
                "Scheduled {:?} for session {} failed: {}",
                ticket.transition, session_id, e
            ),
        }
    }

    fn snapshot_of(&self, entry: &Entry, now: Millis) -> SessionSnapshot {
        let session = &entry.session;
        let offset_ms = match session.offset(now) {
            Ok(offset) => Some(offset),
            Err(e) => {
                error!("Session {} offset unavailable: {}", session.id, e);
                None
            }
        };
        let pending = entry.timer.pending();
        SessionSnapshot {
            id: session.id.clone(),
            filename: session.filename.clone(),
            duration_ms: session.duration_ms,
            state: session.state,
            scheduled_start_time: session.scheduled_start_time,
            start_time: session.start_time,
            offset_ms,
            pause_intervals: session.pause_intervals.clone(),
            pause_cause: session.pause_cause,
            prequeue: session.prequeue.clone(),
            participants: session.participants.clone(),
            next_transition: pending.map(|(transition, _)| transition),
            next_transition_in_ms: pending.map(|(_, deadline)| {
                deadline.saturating_duration_since(Instant::now()).as_millis() as Millis
            }),
            planned_intermissions: self.settings.intermission.plan(session.duration_ms),
        }
    }
}
