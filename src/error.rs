use std::path::PathBuf;
use thiserror::Error;

// ─── Error taxonomy ──────────────────────────────────────────────────────────

/// How a failure should be treated by the run orchestrator.
///
/// Components only report typed failures; the orchestrator is the single place
/// that turns a class into "skip and continue" or "abort the run".
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorClass {
    /// Timeouts and 5xx responses, already retried before surfacing.
    Transient,
    /// Auth failures, unknown images, malformed declarations.
    PermanentExternal,
    /// Anything that risks corrupting repository state. Always fatal.
    Integrity,
    /// Expected outcomes of overlapping triggers (lock held, timeout).
    Coordination,
}

// ─── Config errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Scanner errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("invalid glob pattern {pattern:?}")]
    Pattern { pattern: String },

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to walk {}: {message}", root.display())]
    Walk { root: PathBuf, message: String },
}

// ─── Registry errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry unavailable for {image} after {attempts} attempt(s): {message}")]
    Unavailable {
        image: String,
        attempts: u32,
        message: String,
    },

    #[error("registry rejected credentials for {image} (HTTP {status})")]
    Auth { image: String, status: u16 },

    #[error("image {image} not found in registry")]
    ImageNotFound { image: String },

    #[error("registry refused request for {image} (HTTP {status})")]
    Rejected { image: String, status: u16 },

    #[error("image {image} is hosted on unsupported registry {host}")]
    UnsupportedRegistry { image: String, host: String },

    #[error("failed to decode tag listing for {image}: {message}")]
    Decode { image: String, message: String },
}

impl RegistryError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Unavailable { .. } => ErrorClass::Transient,
            Self::Auth { .. }
            | Self::ImageNotFound { .. }
            | Self::Rejected { .. }
            | Self::UnsupportedRegistry { .. }
            | Self::Decode { .. } => ErrorClass::PermanentExternal,
        }
    }
}

// ─── Patcher errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("{} changed since it was scanned (expected {expected}, found {actual})", path.display())]
    FileIntegrity {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("verification failed for {}:{line}: {message}", path.display())]
    Verification {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("{}:{line} no longer declares {declared}", path.display())]
    LineMismatch {
        path: PathBuf,
        line: usize,
        declared: String,
    },

    #[error("no scan fingerprint recorded for {}", .0.display())]
    MissingFingerprint(PathBuf),

    #[error("io on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ─── Branch errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum BranchError {
    #[error("branch {branch} exists remotely but was not created by evergreen")]
    OwnershipConflict { branch: String },

    #[error("push of {branch} failed: {message}")]
    PushFailed { branch: String, message: String },

    #[error(
        "working copy HEAD {head} is not the tip of {remote}/{base} ({tip}); check out {base} and pull before running"
    )]
    BaseMismatch {
        remote: String,
        base: String,
        head: String,
        tip: String,
    },

    #[error("git {command} failed: {message}")]
    Git { command: String, message: String },
}

// ─── Publisher errors ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("merge request host rejected credentials (HTTP {status})")]
    Auth { status: u16 },

    #[error("merge request host request failed: {message}")]
    Request { message: String },

    #[error("merge request host returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

// ─── Run state errors ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file {} is corrupt: {message}", path.display())]
    Corrupt { path: PathBuf, message: String },

    #[error("state guard {} is held by another process", path.display())]
    GuardBusy { path: PathBuf },

    #[error("state io on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ─── Run errors ──────────────────────────────────────────────────────────────

/// Terminal failure of one orchestrated run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("another run is in progress (holder {holder}, since {since})")]
    RunAlreadyInProgress { holder: String, since: String },

    #[error("run exceeded its {budget_secs}s budget during {phase}")]
    RunTimeout { budget_secs: u64, phase: String },

    #[error("run cancelled before {phase}")]
    Cancelled { phase: String },

    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("scan: {0}")]
    Scan(#[from] ScanError),

    #[error("patch: {0}")]
    Patch(#[from] PatchError),

    #[error("branch: {0}")]
    Branch(#[from] BranchError),

    #[error("publish: {0}")]
    Publish(#[from] PublishError),

    #[error("state: {0}")]
    State(#[from] StateError),

    #[error("run finished but its lock could not be released ({source}); clear it with `evergreen unlock --force`")]
    LockNotReleased {
        #[source]
        source: StateError,
    },
}

/// Exit code for a run that completed, with or without changes.
pub const EXIT_OK: i32 = 0;
/// Exit code for any hard failure worth investigating.
pub const EXIT_FAILED: i32 = 1;
/// Exit code when the single-flight lock is held by another run (`EX_TEMPFAIL`).
pub const EXIT_ALREADY_RUNNING: i32 = 75;
/// Exit code for a run that hit its wall-clock budget or was cancelled.
pub const EXIT_TIMED_OUT: i32 = 124;

impl RunError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RunAlreadyInProgress { .. } | Self::RunTimeout { .. } | Self::Cancelled { .. } => {
                ErrorClass::Coordination
            }
            Self::Patch(_) | Self::State(_) | Self::LockNotReleased { .. } => {
                ErrorClass::Integrity
            }
            Self::Branch(BranchError::OwnershipConflict { .. }) => ErrorClass::Integrity,
            Self::Branch(BranchError::PushFailed { .. }) | Self::Publish(_) => {
                ErrorClass::Transient
            }
            Self::Branch(BranchError::Git { .. }) => ErrorClass::Integrity,
            Self::Branch(BranchError::BaseMismatch { .. }) | Self::Config(_) | Self::Scan(_) => {
                ErrorClass::PermanentExternal
            }
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::RunAlreadyInProgress { .. } => EXIT_ALREADY_RUNNING,
            Self::RunTimeout { .. } | Self::Cancelled { .. } => EXIT_TIMED_OUT,
            _ => EXIT_FAILED,
        }
    }
}
