//! Tributary - Active-active gRPC subscription pool.
//!
//! Fans a single logical subscription out across N redundant upstream
//! endpoints, merges their streams into one deduplicated event flow, and
//! keeps every connection alive indefinitely through ping/pong
//! keep-alive, staleness detection and unbounded reconnect.
//!
//! # Architecture
//!
//! ```text
//! src/
//! ├── pool/         # Pool manager: fan-out, merge, monitor
//! ├── connection/   # Per-endpoint lifecycle + keep-alive
//! ├── transport/    # gRPC seam (traits, frames, tonic impl)
//! ├── dedup         # Cross-source signature cache
//! ├── breaker       # Per-endpoint circuit breaker
//! ├── backoff       # Reconnect + stream-start retry schedules
//! └── shutdown      # Process-wide graceful shutdown
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use tributary::config::{EndpointConfig, PoolConfig};
//! use tributary::transport::frame::{CommitmentLevel, SubscribeRequest};
//! use tributary::transport::grpc::GrpcTransport;
//! use tributary::SubscriptionPool;
//!
//! # async fn run() -> tributary::Result<()> {
//! let config = PoolConfig::with_endpoints(vec![
//!     EndpointConfig::new("https://grpc-a.example.com").with_token("secret"),
//!     EndpointConfig::new("https://grpc-b.example.com"),
//! ]);
//! let mut pool = SubscriptionPool::new(config, Arc::new(GrpcTransport::new()))?;
//!
//! pool.start().await?;
//! pool.subscribe(SubscribeRequest::new(HashMap::new(), CommitmentLevel::Confirmed))
//!     .await?;
//!
//! while let Some(event) = pool.next_event().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod breaker;
pub mod config;
pub mod dedup;
pub mod error;
pub mod event;
pub mod metrics;
pub mod pool;
pub mod shutdown;
pub mod transport;

mod connection;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use error::{Error, Result};
pub use event::{DisconnectReason, EndpointId, PoolEvent, Signature};
pub use pool::SubscriptionPool;
