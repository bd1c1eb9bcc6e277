use thiserror::Error;

/// Coarse error classification surfaced to the host through
/// [`EngineEvent::Error`](crate::engine::EngineEvent).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Network,
    Activation,
    Protocol,
    State,
    Audio,
    HeartbeatTimeout,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("config: {0}")]
    Config(String),

    #[error("network: {0}")]
    Network(String),

    #[error("activation: {0}")]
    Activation(String),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("state: {op} refused in {state}")]
    State { op: &'static str, state: String },

    #[error("audio: {0}")]
    Audio(String),

    #[error("heartbeat timeout after {0} missed pongs")]
    HeartbeatTimeout(u32),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Config(_) => ErrorKind::Config,
            EngineError::Network(_) => ErrorKind::Network,
            EngineError::Activation(_) => ErrorKind::Activation,
            EngineError::Protocol(_) => ErrorKind::Protocol,
            EngineError::State { .. } => ErrorKind::State,
            EngineError::Audio(_) => ErrorKind::Audio,
            EngineError::HeartbeatTimeout(_) => ErrorKind::HeartbeatTimeout,
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        EngineError::Network(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for EngineError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        EngineError::Network(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Protocol(e.to_string())
    }
}

// Store I/O failures surface as Config: the persisted identity/session file
// is part of the device configuration contract.
impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Config(format!("storage: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
