//! Transport seam between the pool and the upstream gRPC protocol.
//!
//! The pool never talks to tonic directly; it drives these traits. That
//! keeps the connection lifecycle testable against in-memory mocks and
//! confines protocol details to [`grpc`].
//!
//! # Overview
//!
//! - [`SubscriptionTransport`]: dials an endpoint, yielding a client
//! - [`TransportClient`]: opens bidirectional streams and answers
//!   out-of-band liveness probes
//! - [`StreamSink`] / [`StreamSource`]: the two halves of one open stream
//!
//! Every release path follows the same closure discipline: cancel, end
//! the writer side, then drop. `cancel` and `finish`/`release` exist as
//! separate steps so instrumented transports can observe each one.

pub mod frame;
pub mod grpc;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::EndpointConfig;
use crate::error::Result;
use frame::{ServerFrame, SubscribeRequest};

/// Factory for transport clients, shared by every connection in a pool.
pub type TransportFactory = Arc<dyn SubscriptionTransport>;

/// Dials upstream endpoints.
#[async_trait]
pub trait SubscriptionTransport: Send + Sync {
    /// Establish a transport client to `endpoint`.
    ///
    /// The caller applies the endpoint's connection timeout; this method
    /// only needs to not hang forever on its own.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is unreachable or rejects the
    /// connection.
    async fn connect(&self, endpoint: &EndpointConfig) -> Result<Box<dyn TransportClient>>;
}

/// One established transport connection to one endpoint.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Open a new bidirectional stream, writing `request` as its first
    /// message.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be opened or the initial
    /// write is rejected.
    async fn open_stream(&mut self, request: SubscribeRequest) -> Result<StreamPair>;

    /// Out-of-band liveness probe, independent of any open stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint fails to answer.
    async fn probe_liveness(&mut self) -> Result<()>;

    /// Tear down the client (cancel, end writes, destroy). Infallible:
    /// errors during teardown are expected and handled by the
    /// implementation.
    async fn release(&mut self);
}

/// The two halves of one open subscription stream.
pub struct StreamPair {
    pub sink: Box<dyn StreamSink>,
    pub source: Box<dyn StreamSource>,
}

/// Writer half of a stream: the initial request has already been written
/// by [`TransportClient::open_stream`]; this half carries keep-alive
/// frames afterwards.
#[async_trait]
pub trait StreamSink: Send {
    /// Write one frame to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is closed or the write fails.
    async fn send(&mut self, frame: SubscribeRequest) -> Result<()>;

    /// Signal writer-side end of stream. Further `send` calls fail.
    async fn finish(&mut self);

    /// Cancel the write half without the end-of-stream handshake.
    fn cancel(&mut self);
}

/// Reader half of a stream.
#[async_trait]
pub trait StreamSource: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` when the server closed the stream cleanly, and
    /// `Some(Err(_))` on stream errors, including the cancellation-class
    /// error that follows a local [`cancel`](Self::cancel).
    async fn next_frame(&mut self) -> Option<Result<ServerFrame>>;

    /// Cancel the read half, resetting the stream.
    fn cancel(&mut self);
}
