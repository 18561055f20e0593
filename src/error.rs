use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

static RATE_LIMIT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)resource_exhausted|rate.?limit|quota|too many requests")
        .expect("rate limit pattern")
});

static OVERLOAD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bunavailable\b|overloaded|temporarily").expect("overload pattern")
});

/// Coarse class of a vendor failure, used by rotation and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceErrorKind {
    RateLimited,
    Unavailable,
    Auth,
    Transport,
    Timeout,
    Other,
}

/// A failure reported by one of the third-party services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceError {
    pub service: &'static str,
    pub status: Option<u16>,
    pub kind: ServiceErrorKind,
    pub message: String,
}

impl ServiceError {
    /// Classify an HTTP status plus body text.
    pub fn from_status(service: &'static str, status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = match status {
            429 => ServiceErrorKind::RateLimited,
            503 => ServiceErrorKind::Unavailable,
            401 | 403 if RATE_LIMIT_RE.is_match(&message) => ServiceErrorKind::RateLimited,
            401 | 403 => ServiceErrorKind::Auth,
            _ if RATE_LIMIT_RE.is_match(&message) => ServiceErrorKind::RateLimited,
            _ => ServiceErrorKind::Other,
        };
        Self {
            service,
            status: Some(status),
            kind,
            message,
        }
    }

    pub fn transport(service: &'static str, message: impl Into<String>) -> Self {
        Self {
            service,
            status: None,
            kind: ServiceErrorKind::Transport,
            message: message.into(),
        }
    }

    /// Classify a failure that carries no status, only provider text.
    pub fn from_message(service: &'static str, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = if RATE_LIMIT_RE.is_match(&message) {
            ServiceErrorKind::RateLimited
        } else if OVERLOAD_RE.is_match(&message) {
            ServiceErrorKind::Unavailable
        } else {
            ServiceErrorKind::Other
        };
        Self {
            service,
            status: None,
            kind,
            message,
        }
    }

    pub fn with_kind(mut self, kind: ServiceErrorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn is_rate_limit(&self) -> bool {
        self.kind == ServiceErrorKind::RateLimited
    }

    pub fn is_unavailable(&self) -> bool {
        self.kind == ServiceErrorKind::Unavailable
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ServiceErrorKind::Timeout
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} HTTP {}: {}", self.service, status, self.message),
            None => write!(f, "{}: {}", self.service, self.message),
        }
    }
}

impl std::error::Error for ServiceError {}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Service(#[from] ServiceError),

    #[error("queue {queue} is busy draining run {active_run}; wait for it to finish")]
    QueueBusy { queue: String, active_run: String },

    #[error("invalid task for queue {queue}: {reason}")]
    InvalidTask { queue: String, reason: String },

    #[error("queue {queue} task {label} panicked: {message}")]
    TaskPanicked {
        queue: String,
        label: String,
        message: String,
    },

    #[error("queue {queue} dropped task {label} before it completed")]
    TaskDropped { queue: String, label: String },

    #[error("no credentials available for {context}")]
    NoCredentials { context: String },

    #[error(
        "{context} primary credential failed {failures} consecutive times, giving up: {last_failure}"
    )]
    CircuitOpen {
        context: String,
        failures: u32,
        last_failure: String,
    },

    #[error("{service} launch script not found: {}", .path.display())]
    LaunchScriptMissing { service: String, path: PathBuf },

    #[error("{service} did not become healthy after {attempts} probes")]
    StartupTimeout { service: String, attempts: u32 },

    #[error("{service} generation timed out after {}ms", .elapsed.as_millis())]
    GenerationTimeout { service: String, elapsed: Duration },

    #[error("{service} generation failed: {message}")]
    GenerationFailed { service: String, message: String },

    #[error("{service} produced no artifact within {}s", .waited.as_secs())]
    ArtifactTimeout { service: String, waited: Duration },

    #[error("generation session {session} was cancelled")]
    Cancelled { session: String },

    #[error("process command failed: {0}")]
    Process(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Primary-credential exhaustion; callers abort the whole run on this.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::CircuitOpen { .. })
    }

    /// Transient provider overload, worth another attempt after a pause.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Service(e) if e.is_unavailable())
    }

    pub fn is_generation_timeout(&self) -> bool {
        matches!(self, Error::GenerationTimeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    pub fn as_service(&self) -> Option<&ServiceError> {
        match self {
            Error::Service(e) => Some(e),
            _ => None,
        }
    }
}
