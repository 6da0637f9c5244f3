//! Error types and handling
//!
//! Domain-specific error enums nested under a single top-level error, with a
//! crate-wide `Result` alias. Where a failure has an obvious remedy the
//! message carries a single-sentence remediation.

use crate::transaction::FileOpKind;
use thiserror::Error;

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file parsing error
    #[error("Failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    /// A file includes or extends itself, possibly transitively
    #[error("Circular include detected: {path} is already on the include chain")]
    CircularInclude { path: String },

    /// A literal (non-glob) include/extends entry does not exist
    #[error("Configuration file not found: {path}")]
    MissingInclude { path: String },

    /// Configuration validation error
    #[error("Configuration validation error: {message}")]
    Validation { message: String },

    /// Configuration file I/O error
    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Project state persistence errors
#[derive(Error, Debug)]
pub enum StateError {
    /// State file I/O error
    #[error("Failed to read state file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// State file parsing error
    #[error("Failed to parse state file {path}: {message}")]
    Parse { path: String, message: String },
}

/// Container runtime errors
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The requested container backend cannot be used on this host
    #[error("Container backend '{name}' is unavailable: {reason}")]
    BackendUnavailable { name: String, reason: String },

    /// An operation that requires a running container found none
    #[error("Container '{name}' is not running; run `up` first")]
    ContainerNotRunning { name: String },

    /// A container CLI invocation failed
    #[error("{runtime} command failed: {message}")]
    Cli { runtime: String, message: String },
}

/// File-sync session errors
#[derive(Error, Debug)]
pub enum SyncError {
    /// The sync binary is missing or not runnable
    #[error("File sync is unavailable: {reason}")]
    Unavailable { reason: String },

    /// The installed sync binary is too old for this platform
    #[error(
        "mutagen {found} has a known session-handshake bug on macOS; upgrade to >= {minimum}"
    )]
    VersionUnsupported { found: String, minimum: String },

    /// Mount excludes cannot be honored under rootless Podman
    #[error(
        "Mount excludes are not supported with rootless Podman. Alternatives: \
         (1) remove the exclude patterns, (2) switch to rootful Podman, (3) use Docker"
    )]
    RootlessPodmanExcludes,

    /// A session-level sync CLI failure
    #[error("Sync session '{session}' failed: {message}")]
    Session { session: String, message: String },
}

/// Firewall backend and helper errors
#[derive(Error, Debug)]
pub enum FirewallError {
    /// Reloading the composed ruleset failed
    #[error("Firewall reload failed: {message}")]
    Reload { message: String },

    /// Activating or deactivating the platform helper failed
    #[error("Firewall helper error: {message}")]
    Helper { message: String },
}

/// A staged filesystem commit failure, tagged with the run index and the
/// first op inside that run which failed. Earlier runs are not rolled back.
#[derive(Error, Debug)]
#[error("Commit failed in run {run} while applying {op} {path}: {cause}")]
pub struct CommitError {
    /// Index of the contiguous same-privilege run that failed
    pub run: usize,
    /// Kind of the failing op
    pub op: FileOpKind,
    /// Path of the failing op
    pub path: String,
    /// Underlying cause (I/O error or sudo batch stderr)
    pub cause: String,
}

/// Top-level error for the sandbox core
#[derive(Error, Debug)]
pub enum AlcatrazError {
    /// Configuration-related errors
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// State persistence errors
    #[error(transparent)]
    State(#[from] StateError),

    /// Container runtime errors
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// File-sync errors
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Firewall errors
    #[error(transparent)]
    Firewall(#[from] FirewallError),

    /// Transactional filesystem commit errors
    #[error(transparent)]
    Commit(#[from] CommitError),

    /// The user declined the rebuild required by configuration drift
    #[error("Rebuild declined; the applied configuration no longer matches the file on disk")]
    DriftRebuildDeclined,

    /// The user declined installation of the firewall helper in a context
    /// that cannot proceed without it
    #[error("Firewall helper installation declined")]
    HelperInstallDeclined,

    /// Uncategorized I/O errors
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Results with AlcatrazError
pub type Result<T> = std::result::Result<T, AlcatrazError>;
