//! Error types for Passage Core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PassageError {
    #[error("Core not initialized")]
    NotInitialized,

    #[error("Core already initialized")]
    AlreadyInitialized,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("NAT table full")]
    NatTableFull,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Rule parse error at line {line}: {detail}")]
    RuleParse { line: usize, detail: String },

    #[error("IO error: {0}")]
    IoError(String),
}

pub type Result<T> = std::result::Result<T, PassageError>;

impl From<std::io::Error> for PassageError {
    fn from(err: std::io::Error) -> Self {
        PassageError::IoError(err.to_string())
    }
}
