use std::fmt;
use std::io;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Failures reported by a [`Connection`](crate::rtmp::connection::Connection).
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Invalid RTMP url: {0}")]
    BadPath(String),

    #[error("Failed to connect to {addr}: {reason}")]
    ConnectFailed { addr: String, reason: String },

    #[error("Server rejected stream: {0}")]
    InvalidStream(String),

    #[error("Connection lost: {0}")]
    Disconnected(String),

    #[error("Not connected")]
    NotConnected,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ConnectionError {
    /// Maps a connection failure to the stop code reported to the embedder.
    pub fn stop_code(&self) -> StopCode {
        match self {
            ConnectionError::BadPath(_) => StopCode::BadPath,
            ConnectionError::ConnectFailed { .. } => StopCode::ConnectFailed,
            ConnectionError::InvalidStream(_) => StopCode::InvalidStream,
            ConnectionError::Disconnected(_) | ConnectionError::NotConnected | ConnectionError::Io(_) => {
                StopCode::Disconnected
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Encoder is not initialized")]
    NotInitialized,

    #[error("Invalid codec header: {0}")]
    InvalidHeader(String),

    #[error("Invalid input frame: {0}")]
    InvalidFrame(String),

    #[error("Encoder has been destroyed")]
    Destroyed,
}

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Output is already active")]
    AlreadyActive,

    #[error("Output has no encoders")]
    NoEncoders,

    #[error("Failed to initialize encoders: {0}")]
    EncoderInit(#[from] EncodeError),

    #[error("Thread exited")]
    ThreadExited,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session is already streaming")]
    AlreadyStreaming,

    #[error("Session is not streaming")]
    NotStreaming,

    #[error("Video info is not set")]
    MissingVideoInfo,
}

/// Terminal status of an output, as surfaced to the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopCode {
    Success,
    BadPath,
    ConnectFailed,
    InvalidStream,
    Error,
    Disconnected,
}

impl StopCode {
    pub fn code(self) -> i32 {
        match self {
            StopCode::Success => 0,
            StopCode::BadPath => -1,
            StopCode::ConnectFailed => -2,
            StopCode::InvalidStream => -3,
            StopCode::Error => -4,
            StopCode::Disconnected => -5,
        }
    }

    pub fn from_code(code: i32) -> Option<StopCode> {
        match code {
            0 => Some(StopCode::Success),
            -1 => Some(StopCode::BadPath),
            -2 => Some(StopCode::ConnectFailed),
            -3 => Some(StopCode::InvalidStream),
            -4 => Some(StopCode::Error),
            -5 => Some(StopCode::Disconnected),
            _ => None,
        }
    }

    pub fn is_success(self) -> bool {
        self == StopCode::Success
    }
}

impl fmt::Display for StopCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopCode::Success => "success",
            StopCode::BadPath => "bad path",
            StopCode::ConnectFailed => "connect failed",
            StopCode::InvalidStream => "invalid stream",
            StopCode::Error => "error",
            StopCode::Disconnected => "disconnected",
        };
        write!(f, "{s} ({})", self.code())
    }
}
