/// Result alias that carries the custom [`BridgeError`] type.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The session configuration is missing, structurally invalid, or was
    /// supplied at the wrong point in the session lifecycle.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The engine rejected the instrument or score definitions.
    #[error("compilation error at line {line}: {message}")]
    Compilation { line: usize, message: String },
    /// Runtime failure inside the render loop. Fatal to the session.
    #[error("engine fault: {0}")]
    EngineFault(String),
    /// A bounded event queue is full. The event was not enqueued.
    #[error("control queue is full ({capacity} events pending)")]
    QueueOverflow { capacity: usize },
    /// A control event could not be built from its textual form.
    #[error("invalid control event: {0}")]
    InvalidEvent(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Configuration file could not be decoded.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    /// Failure while writing a WAV recording.
    #[error("{0}")]
    Wav(#[from] hound::Error),
}

impl BridgeError {
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn compile<T: Into<String>>(line: usize, msg: T) -> Self {
        Self::Compilation {
            line,
            message: msg.into(),
        }
    }

    pub fn fault<T: Into<String>>(msg: T) -> Self {
        Self::EngineFault(msg.into())
    }

    /// Whether the error ended a running session.
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::EngineFault(_))
    }
}
