//! Install-time and persistence error types.
//!
//! Guest-visible protocol errors never surface here: they are recorded
//! in the offending device's own status registers.  Only configuration
//! mistakes (caught while the machine is being assembled) and save-state
//! corruption abort an operation.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("port 0x{port:04X} already bound by {owner}")]
    PortAlreadyBound { port: u16, owner: &'static str },

    #[error("unknown drive type \"{0}\"")]
    InvalidDriveType(String),

    #[error("image file not found: {0}")]
    MissingImage(PathBuf),

    #[error("image {path}: {reason}")]
    BadImage { path: PathBuf, reason: String },

    #[error("COM{0} backend \"{1}\" is not valid")]
    InvalidSerialBackend(usize, String),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SaveStateError {
    #[error("state lump \"{found}\" where \"{expected}\" was expected")]
    BadHeader { expected: String, found: String },

    #[error("state lump \"{name}\": {found} bytes, {expected} expected")]
    SizeMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("state buffer exhausted reading \"{0}\"")]
    Truncated(String),
}
