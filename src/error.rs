use thiserror::Error;

#[derive(Error, Debug)]
pub enum CloakError {
    #[error("file is not open for reading")]
    NotReadable,

    #[error("file is not open for writing")]
    NotWritable,

    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("entry already exists: {0}")]
    AlreadyExists(String),

    #[error("folder not empty: {0}")]
    NotEmpty(String),

    #[error("out of space: no free blocks available")]
    OutOfSpace,

    #[error("wrong password for container")]
    WrongPassword,

    #[error("seek position out of range")]
    SeekOutOfRange,

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("corrupt container: {0}")]
    Corrupt(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CloakError>;
