//! Public events emitted on the pool's merged stream.
//!
//! Consumers read a continuous flow of [`PoolEvent::TransactionDelivered`]
//! events, punctuated by `ConnectionLost`/`ConnectionRecovered` pairs
//! during disruptions. Per-endpoint order is preserved; across endpoints
//! events interleave by arrival time.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::ConnectionMetrics;
use crate::transport::frame::TransactionUpdate;

/// Endpoint identifier - newtype for type safety.
///
/// The inner String is private to ensure all construction goes through
/// the defined constructors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointId(String);

impl EndpointId {
    /// Create a new `EndpointId` from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the endpoint ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EndpointId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for EndpointId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Opaque event signature used as the deduplication key.
///
/// Extracted verbatim from a data frame; equality is byte-equality.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Signature(Vec<u8>);

impl Signature {
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({self})")
    }
}

impl From<Vec<u8>> for Signature {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Signature {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

/// Why a connection left the `Connected` state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Too many consecutive unanswered in-stream pings.
    PingTimeout,
    /// No data frame arrived within the configured message timeout.
    MessageTimeout,
    /// Consecutive out-of-band liveness probes failed.
    HealthCheckFailed,
    /// The stream terminated with a non-cancellation error.
    StreamError(String),
    /// The transport connection itself failed.
    TransportError(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PingTimeout => write!(f, "ping timeout"),
            Self::MessageTimeout => write!(f, "message timeout"),
            Self::HealthCheckFailed => write!(f, "health check failed"),
            Self::StreamError(detail) => write!(f, "stream error: {detail}"),
            Self::TransportError(detail) => write!(f, "transport error: {detail}"),
        }
    }
}

/// Event received from the pool's merged stream.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// An endpoint's connection came up and passed its initial probe.
    ///
    /// Always precedes any `TransactionDelivered` sourced from that
    /// endpoint.
    ConnectionEstablished {
        endpoint: EndpointId,
        at: DateTime<Utc>,
    },

    /// An endpoint's connection left the `Connected` state.
    ///
    /// Emitted exactly once per transition; reconnection is already
    /// scheduled by the time consumers observe this.
    ConnectionLost {
        endpoint: EndpointId,
        reason: DisconnectReason,
        at: DateTime<Utc>,
    },

    /// An endpoint that previously lost its connection is connected again.
    ConnectionRecovered {
        endpoint: EndpointId,
        at: DateTime<Utc>,
    },

    /// A connection was lost while at least one other endpoint remained
    /// healthy. `to` is the first healthy endpoint in declaration order.
    Failover {
        from: EndpointId,
        to: EndpointId,
        reason: DisconnectReason,
        at: DateTime<Utc>,
    },

    /// A unique event: its signature had not been seen within the dedup
    /// window on any source.
    TransactionDelivered {
        message: TransactionUpdate,
        signature: Signature,
        source: EndpointId,
        at: DateTime<Utc>,
    },

    /// A duplicate event was filtered. `source` received the copy;
    /// `original_source` delivered the first sighting.
    DuplicateFiltered {
        signature: Signature,
        source: EndpointId,
        original_source: EndpointId,
        at: DateTime<Utc>,
    },

    /// Periodic per-endpoint metrics snapshot.
    HealthCheck {
        metrics: Vec<ConnectionMetrics>,
        at: DateTime<Utc>,
    },

    /// A recoverable error the pool absorbed, surfaced for observability.
    Error {
        error: String,
        context: &'static str,
        at: DateTime<Utc>,
    },
}

impl PoolEvent {
    /// Return the source endpoint if this event is tied to one.
    #[must_use]
    pub fn endpoint(&self) -> Option<&EndpointId> {
        match self {
            Self::ConnectionEstablished { endpoint, .. }
            | Self::ConnectionLost { endpoint, .. }
            | Self::ConnectionRecovered { endpoint, .. } => Some(endpoint),
            Self::Failover { from, .. } => Some(from),
            Self::TransactionDelivered { source, .. }
            | Self::DuplicateFiltered { source, .. } => Some(source),
            Self::HealthCheck { .. } | Self::Error { .. } => None,
        }
    }

    /// Return the signature if this event carries one.
    #[must_use]
    pub fn signature(&self) -> Option<&Signature> {
        match self {
            Self::TransactionDelivered { signature, .. }
            | Self::DuplicateFiltered { signature, .. } => Some(signature),
            _ => None,
        }
    }
}
