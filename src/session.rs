use crate::error::{Error, Result};
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

pub type SessionId = String;

#[derive(Debug)]
struct ActiveSession {
    id: SessionId,
    cancel_requested: bool,
}

/// Tracks the one image-generation run that may be cancelled from outside.
///
/// Cancellation is cooperative: a long job calls [`check_cancelled`] at each
/// step boundary. Ids from earlier sessions are stale and never cancel.
///
/// [`check_cancelled`]: SessionController::check_cancelled
#[derive(Debug, Default)]
pub struct SessionController {
    active: Mutex<Option<ActiveSession>>,
}

impl SessionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a session, making any previous id stale.
    pub fn start(&self) -> SessionId {
        let id = Uuid::new_v4().to_string();
        let mut active = self.lock();
        if let Some(prev) = active.as_ref() {
            debug!(previous = %prev.id, "replacing active generation session");
        }
        *active = Some(ActiveSession {
            id: id.clone(),
            cancel_requested: false,
        });
        info!(session = %id, "generation session started");
        id
    }

    /// End `session` if it is still the active one.
    pub fn finish(&self, session: &str) {
        let mut active = self.lock();
        if active.as_ref().is_some_and(|s| s.id == session) {
            *active = None;
            debug!(session, "generation session finished");
        }
    }

    /// Flag the active session for cancellation. Returns false when idle.
    pub fn request_cancel(&self) -> bool {
        let mut active = self.lock();
        match active.as_mut() {
            Some(s) => {
                s.cancel_requested = true;
                info!(session = %s.id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn active(&self) -> Option<SessionId> {
        self.lock().as_ref().map(|s| s.id.clone())
    }

    pub fn check_cancelled(&self, session: &str) -> Result<()> {
        let active = self.lock();
        match active.as_ref() {
            Some(s) if s.id == session && s.cancel_requested => Err(Error::Cancelled {
                session: session.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Borrowed cancellation check for `session`, handed to multi-step jobs.
    pub fn checkpoint<'a>(&'a self, session: &'a str) -> Checkpoint<'a> {
        Checkpoint {
            sessions: Some(self),
            session,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<ActiveSession>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Checkpoint<'a> {
    sessions: Option<&'a SessionController>,
    session: &'a str,
}

impl Checkpoint<'static> {
    /// A checkpoint that never cancels, for callers outside any session.
    pub fn none() -> Self {
        Checkpoint {
            sessions: None,
            session: "",
        }
    }
}

impl Checkpoint<'_> {
    pub fn check(&self) -> Result<()> {
        match self.sessions {
            Some(sessions) => sessions.check_cancelled(self.session),
            None => Ok(()),
        }
    }
}
