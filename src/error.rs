//! Error types for the EdgeVPN manager

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the manager
#[derive(Error, Debug)]
pub enum ManagerError {
    /// Input rejected before any side effect
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Profile storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// External process errors
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    /// Release API errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Input validation errors
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Invalid CIDR notation '{value}': {reason}")]
    InvalidCidr { value: String, reason: String },

    #[error("Invalid slug format. It should be 'owner/name': {slug}")]
    InvalidSlug { slug: String },

    #[error("Invalid profile name '{name}': {reason}")]
    InvalidName { name: String, reason: String },
}

/// Profile store errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Profile not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Malformed profile record at {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Supervised process errors
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("{binary} is not installed and no versions were downloaded")]
    BinaryNotInstalled { binary: String },

    #[error("No version found for '{version}'")]
    VersionNotFound { version: String },

    #[error("Network '{name}' is already running")]
    AlreadyRunning { name: String },

    #[error("Failed to launch '{name}': {reason}")]
    LaunchFailed { name: String, reason: String },

    #[error("Failed to kill process {pid}: {reason}")]
    KillFailed { pid: i32, reason: String },

    #[error("Token generation failed: {reason}")]
    TokenGeneration { reason: String },
}

/// Release API errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Release API returned {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("Cannot find asset for '{slug}' '{version}'")]
    AssetNotFound { slug: String, version: String },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot determine home directory; set EDGEVPN_STATE_DIR")]
    NoHomeDir,

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

impl ManagerError {
    /// Get a user-friendly error message with suggested action
    pub fn user_message(&self) -> String {
        match self {
            Self::Process(ProcessError::BinaryNotInstalled { binary }) => {
                format!(
                    "{} was not found in PATH and no versions were downloaded.\n  \
                    Install it, or place a binary at <state-dir>/bin/{}-<version>.",
                    binary, binary
                )
            }

            Self::Validation(ValidationError::InvalidCidr { value, .. }) => {
                format!(
                    "Invalid IP '{}'. Expected an address with prefix, e.g. 10.1.0.5/24.",
                    value
                )
            }

            Self::Storage(StorageError::NotFound { path }) => {
                format!(
                    "Profile not found at {}\n  Run `edgevpn-manager list` to see existing profiles.",
                    path.display()
                )
            }

            Self::Process(ProcessError::KillFailed { pid, .. }) => {
                format!(
                    "Process {} survived termination.\n  Try: sudo kill -9 {}",
                    pid, pid
                )
            }

            _ => format!("{}", self),
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) => 1,
            Self::Config(_) => 2,
            Self::Storage(_) => 3,
            Self::Process(_) => 4,
            Self::Network(_) => 5,
            Self::System(_) => 7,
        }
    }
}
