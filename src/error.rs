use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("gRPC status: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Connect error: {0}")]
    Connect(#[from] tonic::transport::Error),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Stream reset by peer: {0}")]
    StreamReset(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Circuit breaker is open")]
    CircuitOpen,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("No healthy endpoints available")]
    NoHealthyEndpoints,

    #[error("Pool is not running")]
    NotRunning,

    #[error("Invalid subscription request: {0}")]
    InvalidSubscription(String),

    #[error("Endpoint is not connected")]
    NotConnected,
}

impl Error {
    /// Locally-initiated cancellations terminate streams without being
    /// treated as connection failures.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Grpc(status) => status.code() == tonic::Code::Cancelled,
            _ => false,
        }
    }

    /// Reset-type protocol errors get a slower stream-start retry schedule.
    #[must_use]
    pub fn is_reset(&self) -> bool {
        match self {
            Self::StreamReset(_) => true,
            Self::Grpc(status) => {
                status.code() == tonic::Code::Unavailable
                    && status.message().to_ascii_lowercase().contains("reset")
            }
            _ => false,
        }
    }

    /// Errors raised by the breaker refusing an attempt. These keep the
    /// retry timer alive but are never surfaced as a connection loss.
    #[must_use]
    pub const fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
