//! Error types for `vaultlab-core`.
//!
//! Each component has its own error enum; [`LabError`] aggregates them for
//! the lifecycle controller. Every variant names the path, URL, or port
//! involved so a failure can be diagnosed from the message alone.

use std::path::PathBuf;

/// Errors from loading or validating the persisted lab configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A key in the config file carried a value outside its domain.
    #[error("invalid value '{value}' for {key} in {}", .path.display())]
    InvalidValue {
        path: PathBuf,
        key: String,
        value: String,
    },

    /// A flag or prompt answer could not be parsed.
    #[error("invalid {what}: '{value}' (expected one of: {expected})")]
    InvalidChoice {
        what: &'static str,
        value: String,
        expected: &'static str,
    },

    /// Reading or writing the config file failed.
    #[error("config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from resolving and downloading release binaries.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// Required host tools are missing.
    #[error("missing required system tools: {} (install them and retry)", .tools.join(", "))]
    MissingTools { tools: Vec<String> },

    /// The release index could not be fetched or parsed.
    #[error("failed to query release index {url}: {reason}")]
    ReleaseIndex { url: String, reason: String },

    /// No stable version was published for the product.
    #[error("no stable {product} release found in {url}")]
    NoStableRelease { product: String, url: String },

    /// A pinned version string is not `MAJOR.MINOR.PATCH`.
    #[error("invalid version specifier '{value}'")]
    InvalidVersion { value: String },

    /// The running host has no published build.
    #[error("unsupported platform {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    /// Downloading the release archive failed.
    #[error("download of {url} failed: {reason}")]
    Download { url: String, reason: String },

    /// Extracting the release archive failed.
    #[error("extraction of {} failed: {reason}", .archive.display())]
    Extract { archive: PathBuf, reason: String },

    /// Filesystem error while installing the binary.
    #[error("failed to install {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from launching, probing, and stopping server processes.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The executable could not be spawned.
    #[error("failed to launch {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The server never answered its readiness probe with HTTP 200.
    #[error(
        "{name} did not become ready at {url} within {timeout_secs}s (process left running, see {})\n{log_tail}",
        .log_path.display()
    )]
    ReadinessTimeout {
        name: String,
        url: String,
        timeout_secs: u64,
        log_path: PathBuf,
        log_tail: String,
    },

    /// A target port is already bound by some other process.
    #[error("port {port} is already in use; stop the process holding it before starting {name}")]
    PortInUse { name: String, port: u16 },

    /// A managed process is alive already.
    #[error("{name} is already running (pid {pid}); use `restart` or `stop` first")]
    AlreadyRunning { name: String, pid: u32 },

    /// Filesystem error on a PID or log file.
    #[error("process file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the Vault/Consul HTTP APIs.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The HTTP request did not complete.
    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },

    /// The server answered with a non-success status.
    #[error("{url} returned {status}: {body}")]
    Status { url: String, status: u16, body: String },

    /// The response body was not the expected JSON shape.
    #[error("unexpected response from {url}: {reason}")]
    Decode { url: String, reason: String },

    /// The HTTP client could not be built (bad CA bundle etc.).
    #[error("failed to build HTTP client: {reason}")]
    Client { reason: String },
}

impl ApiError {
    /// Whether this is a Vault "already exists" style rejection that
    /// idempotent configuration may ignore.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::Status { status, body, .. } => {
                *status == 400
                    && (body.contains("already in use") || body.contains("already exists"))
            }
            _ => false,
        }
    }
}

/// Errors from the Vault initialize/unseal state machine.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    /// Vault reports initialized storage but no unseal key exists locally.
    #[error(
        "vault at {addr} is already initialized but {} is missing; refusing to re-initialize populated storage (run `reset` to start fresh)",
        .key_path.display()
    )]
    MissingUnsealMaterial { addr: String, key_path: PathBuf },

    /// The init response carried no key share.
    #[error("init response from {addr} contained no unseal key")]
    EmptyInitResponse { addr: String },

    /// Vault never reported initialized and unsealed.
    #[error("vault at {addr} still sealed after {timeout_secs}s")]
    UnsealTimeout { addr: String, timeout_secs: u64 },

    /// API failure during init/unseal.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Persisting or reading unseal material failed.
    #[error("unseal material {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the backup manager.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// Backup names are restricted to a filename-safe alphabet.
    #[error("invalid backup name '{name}': use letters, digits, '.', '_' or '-' (max 64, not starting with a symbol)")]
    InvalidName { name: String },

    /// A backup with this name exists already.
    #[error("backup '{name}' already exists")]
    AlreadyExists { name: String },

    /// No backup with this name exists.
    #[error("backup '{name}' not found in {}", .dir.display())]
    NotFound { name: String, dir: PathBuf },

    /// There is no lab state to back up.
    #[error("nothing to back up: {} does not exist", .path.display())]
    NothingToBackUp { path: PathBuf },

    /// Checksum verification failed; nothing was changed.
    #[error("integrity check failed for backup '{name}': {}", .problems.join("; "))]
    Integrity { name: String, problems: Vec<String> },

    /// The user declined a destructive confirmation.
    #[error("operation cancelled")]
    Cancelled,

    /// Confirmation was required but no terminal is attached.
    #[error("confirmation required: re-run with --force to {action} without prompting")]
    ConfirmationRequired { action: &'static str },

    /// An export target file already exists.
    #[error("refusing to overwrite existing file {}", .path.display())]
    TargetExists { path: PathBuf },

    /// An imported archive is not a single-directory backup.
    #[error("archive {} is not a backup export: {reason}", .path.display())]
    InvalidArchive { path: PathBuf, reason: String },

    /// Metadata could not be serialized.
    #[error("backup metadata: {reason}")]
    Metadata { reason: String },

    /// Filesystem error.
    #[error("backup I/O on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from generating the lab's self-signed TLS material.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// Certificate or key generation failed.
    #[error("certificate generation failed: {reason}")]
    Generation { reason: String },

    /// Writing PEM files failed.
    #[error("failed to write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by lifecycle commands.
#[derive(Debug, thiserror::Error)]
pub enum LabError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Init(#[from] InitError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    /// Another invocation holds the lab lock.
    #[error("another vault-lab-ctl command is running against {} (pid {holder})", .base.display())]
    Locked { base: PathBuf, holder: String },

    /// The lab is not running but the command needs it.
    #[error("the lab is not running; run `start` first")]
    NotRunning,

    /// Generic filesystem failure in the controller.
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

macro_rules! io_ctor {
    ($($ty:ident),+ $(,)?) => {
        $(
            impl $ty {
                /// Build a closure mapping an `io::Error` on `path` to this error type.
                pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
                    let path = path.into();
                    move |source| Self::Io { path, source }
                }
            }
        )+
    };
}

io_ctor!(
    ConfigError,
    ProvisionError,
    ProcessError,
    InitError,
    BackupError,
    TlsError,
    LabError,
);
