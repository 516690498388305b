use std::{error::Error, fmt, io, time::Duration};

use crate::protocol::messages::ResultCode;

/// Errors raised while checkpointing, transferring or restoring a container
#[derive(Debug)]
pub enum MigrationError {
    /// Settings could not be loaded or contain invalid values
    Config(String),
    /// The container is in a state that does not allow the operation
    InvalidState(String),
    /// The runtime does not know the container
    ContainerNotFound(String),
    /// The checkpoint/restore runtime reported a failure
    Runtime(String),
    /// The peer violated the transfer protocol
    Protocol(String),
    /// The peer answered a request with a failure code
    Remote { code: ResultCode, message: String },
    /// A frame announced more bytes than allowed
    FrameTooLarge(usize),
    /// The channel was closed before the expected reply arrived
    ChannelClosed,
    /// A call did not make progress in time
    Timeout(Duration),
    /// Standard I/O errors
    Io(io::Error),
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationError::Config(msg) => write!(f, "Configuration error: {}", msg),
            MigrationError::InvalidState(msg) => write!(f, "Invalid container state: {}", msg),
            MigrationError::ContainerNotFound(id) => write!(f, "Container {} does not exist", id),
            MigrationError::Runtime(msg) => write!(f, "Runtime error: {}", msg),
            MigrationError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            MigrationError::Remote { code, message } => {
                write!(f, "Server replied {}: {}", code.as_str_name(), message)
            }
            MigrationError::FrameTooLarge(size) => write!(f, "Frame of {} bytes exceeds the limit", size),
            MigrationError::ChannelClosed => write!(f, "Channel closed by peer"),
            MigrationError::Timeout(after) => write!(f, "No progress after {:?}", after),
            MigrationError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl Error for MigrationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MigrationError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for MigrationError {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::UnexpectedEof => MigrationError::ChannelClosed,
            _ => MigrationError::Io(error),
        }
    }
}

impl From<config::ConfigError> for MigrationError {
    fn from(error: config::ConfigError) -> Self {
        MigrationError::Config(error.to_string())
    }
}

impl From<prost::DecodeError> for MigrationError {
    fn from(error: prost::DecodeError) -> Self {
        MigrationError::Protocol(error.to_string())
    }
}

impl From<prost::EncodeError> for MigrationError {
    fn from(error: prost::EncodeError) -> Self {
        MigrationError::Protocol(error.to_string())
    }
}

impl MigrationError {
    /// Result code reported to the peer when this error ends a request.
    pub fn result_code(&self) -> ResultCode {
        match self {
            MigrationError::Remote { code, .. } => *code,
            MigrationError::Protocol(_) | MigrationError::FrameTooLarge(_) => ResultCode::Protocol,
            MigrationError::Runtime(_)
            | MigrationError::ContainerNotFound(_)
            | MigrationError::InvalidState(_)
            | MigrationError::Config(_) => ResultCode::RestoreFailed,
            MigrationError::Io(e) if e.kind() == io::ErrorKind::AlreadyExists => ResultCode::AlreadyExists,
            MigrationError::Io(_) | MigrationError::ChannelClosed | MigrationError::Timeout(_) => ResultCode::Io,
        }
    }
}

/// Convenience type alias for function return types
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Errors raised while setting up logging
#[derive(Debug)]
pub enum LoggerError {
    IoError(io::Error),
    LoggerInitError(String),
}

impl fmt::Display for LoggerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoggerError::IoError(e) => write!(f, "Failed to open log file: {}", e),
            LoggerError::LoggerInitError(msg) => write!(f, "Failed to initialize logger: {}", msg),
        }
    }
}

impl Error for LoggerError {}

impl From<io::Error> for LoggerError {
    fn from(error: io::Error) -> Self {
        LoggerError::IoError(error)
    }
}

pub type LoggerResult<T> = Result<T, LoggerError>;
