use std::path::PathBuf;
use thiserror::Error;

/// How a caller should react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad request shape. Rejected before any backup or mutation.
    Input,
    /// Tag conflicts, missing units, lock contention. Also rejected pre-mutation.
    State,
    /// Write/delete/rename failures. The directory was rolled back.
    Mutation,
    /// The external hook rejected the resulting directory. Rolled back.
    Validation,
    /// Backup/restore failures.
    Backup,
}

impl ErrorKind {
    /// Process exit code used by the CLI.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Input => 2,
            ErrorKind::State => 3,
            ErrorKind::Validation => 4,
            ErrorKind::Backup => 5,
            ErrorKind::Mutation => 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfError {
    #[error("protocol not supported: {name}")]
    ProtocolNotSupported { name: String },

    #[error("tag '{tag}' already in use by {}", path.display())]
    ConfigConflict { tag: String, path: PathBuf },

    #[error("no protocol unit with tag '{tag}'")]
    TagNotFound { tag: String },

    #[error("file not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    #[error("xray rejected {}: {output}", dir.display())]
    ValidationFailed { dir: PathBuf, output: String },

    #[error("port {port} is unavailable")]
    PortUnavailable { port: u16 },

    #[error("no free port in range {start}-{end}")]
    NoPortAvailable { start: u16, end: u16 },

    #[error("invalid {field}: {message}")]
    InvalidInput { field: String, message: String },

    #[error("template '{template}': {message}")]
    Template { template: String, message: String },

    #[error("backup {}: {message}", path.display())]
    Backup { path: PathBuf, message: String },

    #[error("another xrayctl process holds {}", path.display())]
    Locked { path: PathBuf },
}

impl ConfError {
    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        ConfError::InvalidInput { field: field.to_string(), message: message.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfError::ProtocolNotSupported { .. }
            | ConfError::InvalidInput { .. }
            | ConfError::PortUnavailable { .. }
            | ConfError::NoPortAvailable { .. } => ErrorKind::Input,
            ConfError::ConfigConflict { .. }
            | ConfError::TagNotFound { .. }
            | ConfError::FileNotFound { .. }
            | ConfError::Locked { .. } => ErrorKind::State,
            ConfError::ValidationFailed { .. } => ErrorKind::Validation,
            ConfError::Backup { .. } => ErrorKind::Backup,
            ConfError::Template { .. } => ErrorKind::Mutation,
        }
    }
}

/// Find the categorized error anywhere in an `anyhow` chain.
pub fn find(err: &anyhow::Error) -> Option<&ConfError> {
    err.chain().find_map(|e| e.downcast_ref::<ConfError>())
}

/// Uncategorized failures are treated as mutation errors.
pub fn kind_of(err: &anyhow::Error) -> ErrorKind {
    find(err).map(ConfError::kind).unwrap_or(ErrorKind::Mutation)
}
