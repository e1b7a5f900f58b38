//! Error taxonomy for a backup run

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackupError>;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("invalid email address {address:?}: {reason}")]
    AddressParse { address: String, reason: String },

    #[error("{0} is not a supported domain")]
    UnsupportedDomain(String),

    #[error("could not connect to {server}: {reason}")]
    Connection { server: String, reason: String },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("account does not contain mailbox {0}")]
    MailboxNotFound(String),

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("message {seq} could not be parsed: {reason}")]
    Parse { seq: u32, reason: String },

    #[error("could not write archive {path}: {source}")]
    ArchiveWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{what} timed out after {after:?}")]
    Timeout { what: &'static str, after: Duration },

    #[error("backup cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("could not read password: {0}")]
    Credentials(#[source] std::io::Error),
}

impl BackupError {
    pub fn archive(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BackupError::ArchiveWrite {
            path: path.into(),
            source,
        }
    }
}
