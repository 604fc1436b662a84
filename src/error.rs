use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[source] io::Error),

    #[error("Invalid {0} signature")]
    InvalidSignature(&'static str),

    #[error("Invalid UTF signature")]
    InvalidUtfSignature,

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid archive format: {0}")]
    InvalidFormat(String),

    #[error("Unexpected end of data: {0}")]
    Truncated(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Compressed output exceeds capacity: {0}")]
    Capacity(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported feature: {0}")]
    Unsupported(String),
}

impl From<io::Error> for ArchiveError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => ArchiveError::Truncated(err.to_string()),
            _ => ArchiveError::Io(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, ArchiveError>;
