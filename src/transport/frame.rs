//! Wire messages exchanged on a subscription stream.
//!
//! The client writes one [`SubscribeRequest`] as the first message on each
//! stream and may follow with ping frames (a `SubscribeRequest` carrying
//! only a [`PingPayload`]). The server writes a mixed sequence of data
//! frames and pong frames, modeled here as a [`ServerFrame`] oneof.
//!
//! Messages are defined with prost derives; the tonic transport encodes
//! them with its standard prost codec.

use std::collections::HashMap;

/// Commitment level requested for the subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum CommitmentLevel {
    Processed = 0,
    Confirmed = 1,
    Finalized = 2,
}

/// Filter specification for one named transaction subscription.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TransactionFilter {
    /// Include transactions that failed execution.
    #[prost(bool, optional, tag = "1")]
    pub include_failed: Option<bool>,
    /// Only transactions mentioning one of these accounts.
    #[prost(string, repeated, tag = "2")]
    pub account_include: Vec<String>,
    /// Exclude transactions mentioning any of these accounts.
    #[prost(string, repeated, tag = "3")]
    pub account_exclude: Vec<String>,
}

/// Client-to-server ping carrying an id the server must echo back.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PingPayload {
    #[prost(uint64, tag = "1")]
    pub id: u64,
}

/// Server-to-client pong mirroring a ping id.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PongPayload {
    #[prost(uint64, tag = "1")]
    pub id: u64,
}

/// The client's subscription request.
///
/// The first message on every stream. Subsequent messages on the same
/// stream carry only the `ping` field.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscribeRequest {
    /// Named transaction filters; an empty map subscribes to everything.
    #[prost(map = "string, message", tag = "1")]
    pub transactions: HashMap<String, TransactionFilter>,
    /// Requested commitment level.
    #[prost(enumeration = "CommitmentLevel", optional, tag = "2")]
    pub commitment: Option<i32>,
    /// Set on keep-alive frames only, never on the initial request.
    #[prost(message, optional, tag = "3")]
    pub ping: Option<PingPayload>,
}

impl SubscribeRequest {
    /// A subscription over the given named filters.
    #[must_use]
    pub fn new(
        transactions: HashMap<String, TransactionFilter>,
        commitment: CommitmentLevel,
    ) -> Self {
        Self {
            transactions,
            commitment: Some(commitment as i32),
            ping: None,
        }
    }

    /// A keep-alive frame carrying only a ping id.
    #[must_use]
    pub fn ping(id: u64) -> Self {
        Self {
            transactions: HashMap::new(),
            commitment: None,
            ping: Some(PingPayload { id }),
        }
    }

    /// The requested commitment level, if one was set and is known.
    #[must_use]
    pub fn commitment_level(&self) -> Option<CommitmentLevel> {
        self.commitment.and_then(|v| CommitmentLevel::try_from(v).ok())
    }

    /// Reject requests that are not valid as an initial subscription.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidSubscription`] when the request
    /// carries a ping payload: keep-alive frames are written by the pool
    /// itself and must never be stored as the active subscription.
    pub fn validate_for_subscribe(&self) -> crate::Result<()> {
        if self.ping.is_some() {
            return Err(crate::Error::InvalidSubscription(
                "subscription request must not carry a ping payload".to_string(),
            ));
        }
        Ok(())
    }
}

/// A transaction notification from the upstream server.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TransactionUpdate {
    /// Opaque signature bytes; the deduplication key.
    #[prost(bytes = "vec", tag = "1")]
    pub signature: Vec<u8>,
    /// Slot the transaction was observed in.
    #[prost(uint64, tag = "2")]
    pub slot: u64,
    /// Encoded transaction body, opaque to the pool.
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

/// One frame received from the server.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerFrame {
    #[prost(oneof = "server_frame::Payload", tags = "1, 2")]
    pub payload: Option<server_frame::Payload>,
}

/// Nested payload types for [`ServerFrame`].
pub mod server_frame {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "1")]
        Transaction(super::TransactionUpdate),
        #[prost(message, tag = "2")]
        Pong(super::PongPayload),
    }
}

impl ServerFrame {
    /// A data frame wrapping a transaction update.
    #[must_use]
    pub fn transaction(update: TransactionUpdate) -> Self {
        Self {
            payload: Some(server_frame::Payload::Transaction(update)),
        }
    }

    /// A pong frame echoing `id`.
    #[must_use]
    pub fn pong(id: u64) -> Self {
        Self {
            payload: Some(server_frame::Payload::Pong(PongPayload { id })),
        }
    }

    /// The echoed ping id when this frame is a pong.
    ///
    /// A frame is a pong if and only if it carries the pong field and no
    /// data payload; everything else is treated as a data frame.
    #[must_use]
    pub fn pong_id(&self) -> Option<u64> {
        match &self.payload {
            Some(server_frame::Payload::Pong(pong)) => Some(pong.id),
            _ => None,
        }
    }

    /// The signature bytes when this is a data frame that carries one.
    ///
    /// Data frames without a signature are dropped from dedup
    /// consideration but still count toward liveness.
    #[must_use]
    pub fn signature(&self) -> Option<&[u8]> {
        match &self.payload {
            Some(server_frame::Payload::Transaction(update)) if !update.signature.is_empty() => {
                Some(&update.signature)
            }
            _ => None,
        }
    }

    /// The transaction update when this is a data frame carrying one.
    #[must_use]
    pub fn transaction_update(&self) -> Option<&TransactionUpdate> {
        match &self.payload {
            Some(server_frame::Payload::Transaction(update)) => Some(update),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pong_frame_classification() {
        let frame = ServerFrame::pong(7);
        assert_eq!(frame.pong_id(), Some(7));
        assert!(frame.signature().is_none());
    }

    #[test]
    fn test_data_frame_exposes_signature() {
        let frame = ServerFrame::transaction(TransactionUpdate {
            signature: vec![0xAA, 0xBB],
            slot: 42,
            payload: vec![1, 2, 3],
        });
        assert_eq!(frame.pong_id(), None);
        assert_eq!(frame.signature(), Some(&[0xAA, 0xBB][..]));
    }

    #[test]
    fn test_data_frame_without_signature() {
        let frame = ServerFrame::transaction(TransactionUpdate {
            signature: Vec::new(),
            slot: 42,
            payload: vec![1],
        });
        assert_eq!(frame.pong_id(), None);
        assert!(frame.signature().is_none());
    }

    #[test]
    fn test_empty_frame_is_not_a_pong() {
        let frame = ServerFrame::default();
        assert_eq!(frame.pong_id(), None);
        assert!(frame.signature().is_none());
    }

    #[test]
    fn test_ping_request_shape() {
        let ping = SubscribeRequest::ping(9);
        assert_eq!(ping.ping.as_ref().map(|p| p.id), Some(9));
        assert!(ping.transactions.is_empty());
        assert!(ping.validate_for_subscribe().is_err());
    }

    #[test]
    fn test_subscription_request_valid() {
        let mut filters = HashMap::new();
        filters.insert(
            "all".to_string(),
            TransactionFilter {
                include_failed: Some(false),
                account_include: vec![],
                account_exclude: vec![],
            },
        );
        let request = SubscribeRequest::new(filters, CommitmentLevel::Confirmed);
        assert!(request.validate_for_subscribe().is_ok());
        assert_eq!(request.commitment_level(), Some(CommitmentLevel::Confirmed));
    }
}
