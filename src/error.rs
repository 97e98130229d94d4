//! Unified error types for lxe-net

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// CNI error code for "container unknown or does not exist"
const CNI_CODE_UNKNOWN_CONTAINER: u32 = 3;

/// Main error type for lxe-net operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    // Resource errors
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("Expected '{name}' to be a {expected}, but is {actual}")]
    TypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("Concurrent modification: {0}")]
    Conflict(String),

    #[error("Network controller returned {status}: {message}")]
    Controller { status: u16, message: String },

    // Address errors
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid address range {start}-{end} for subnet {subnet}")]
    InvalidAddressRange {
        subnet: String,
        start: String,
        end: String,
    },

    #[error("No free address left in {subnet}")]
    AddressSpaceExhausted { subnet: String },

    // CNI errors
    #[error("Invalid CNI configuration: {0}")]
    CniConfig(String),

    #[error("CNI plugin '{plugin}' failed on {command} (code {code}): {message}")]
    Cni {
        plugin: String,
        command: String,
        code: u32,
        message: String,
    },

    #[error("Invalid network state transition: {0}")]
    InvalidTransition(String),

    #[error("Container '{0}' has no running process to attach to")]
    NoProcess(String),

    // Context errors
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation deadline exceeded")]
    DeadlineExceeded,

    #[error("{op} {target}: {source}")]
    Operation {
        op: &'static str,
        target: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Shorthand for a not-found error
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Attach the operation and its target (sandbox, container) to an error
    pub fn context(self, op: &'static str, target: impl Into<String>) -> Self {
        Error::Operation {
            op,
            target: target.into(),
            source: Box::new(self),
        }
    }

    /// Whether the underlying resource is absent
    ///
    /// Looks through operation context, so wrapped errors keep their kind.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Cni { code, .. } => *code == CNI_CODE_UNKNOWN_CONTAINER,
            Error::Operation { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Whether an update lost an optimistic-concurrency race
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::Operation { source, .. } => source.is_conflict(),
            _ => false,
        }
    }
}

/// Result type alias for lxe-net operations
pub type Result<T> = std::result::Result<T, Error>;
