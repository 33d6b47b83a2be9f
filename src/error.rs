use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToneError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Audio write failed: {0}")]
    WriteFailure(String),

    #[error("Engine has been released")]
    EngineDisposed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures reported by an [`AudioSink`](crate::sink::AudioSink) or its factory.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    #[error("Failed to open output stream: {0}")]
    Open(String),

    #[error("Failed to write to output stream: {0}")]
    Write(String),
}

impl From<SinkError> for ToneError {
    fn from(err: SinkError) -> Self {
        match err {
            SinkError::Open(msg) => ToneError::DeviceUnavailable(msg),
            SinkError::Write(msg) => ToneError::WriteFailure(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, ToneError>;
