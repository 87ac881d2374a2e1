//! Real gRPC transport over tonic.
//!
//! Dials endpoints with connect/request timeouts, attaches the endpoint's
//! `x-token` as call metadata, opens the bidirectional subscription stream
//! through tonic's generic client with the standard prost codec, and
//! answers liveness probes with the gRPC health checking protocol.

use std::time::Duration;

use async_trait::async_trait;
use http::uri::PathAndQuery;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::client::Grpc;
use tonic::codec::{ProstCodec, Streaming};
use tonic::metadata::AsciiMetadataValue;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::{Channel, Endpoint};
use tonic::Request;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;
use tracing::debug;

use super::frame::{ServerFrame, SubscribeRequest};
use super::{StreamPair, StreamSink, StreamSource, SubscriptionTransport, TransportClient};
use crate::config::EndpointConfig;
use crate::error::{Error, Result};

/// Fully-qualified gRPC method path of the bidirectional subscription.
const SUBSCRIBE_PATH: &str = "/subscription.v1.SubscriptionService/Subscribe";

/// Buffered outbound frames per stream. Writes beyond this apply
/// backpressure to the ping loop, which is harmless.
const OUTBOUND_BUFFER: usize = 64;

/// Attaches the endpoint credential to every outgoing request.
#[derive(Clone)]
struct XTokenInterceptor {
    x_token: Option<AsciiMetadataValue>,
}

impl tonic::service::Interceptor for XTokenInterceptor {
    fn call(&mut self, mut request: Request<()>) -> std::result::Result<Request<()>, tonic::Status> {
        if let Some(token) = &self.x_token {
            request.metadata_mut().insert("x-token", token.clone());
        }
        Ok(request)
    }
}

/// Production [`SubscriptionTransport`] backed by tonic channels.
#[derive(Debug, Default, Clone, Copy)]
pub struct GrpcTransport;

impl GrpcTransport {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

/// Apply the endpoint's opaque option bag to the channel builder.
///
/// Unknown keys and unparseable values are logged and skipped so a config
/// written for a newer build does not break an older one.
fn apply_options(
    mut builder: Endpoint,
    options: &std::collections::HashMap<String, String>,
) -> Endpoint {
    for (key, value) in options {
        match key.as_str() {
            "http2_keep_alive_interval_ms" => {
                if let Ok(ms) = value.parse::<u64>() {
                    builder = builder.http2_keep_alive_interval(Duration::from_millis(ms));
                }
            }
            "tcp_nodelay" => {
                if let Ok(flag) = value.parse::<bool>() {
                    builder = builder.tcp_nodelay(flag);
                }
            }
            "concurrency_limit" => {
                if let Ok(limit) = value.parse::<usize>() {
                    builder = builder.concurrency_limit(limit);
                }
            }
            _ => {
                tracing::warn!(option = %key, "Ignoring unknown transport option");
            }
        }
    }
    builder
}

#[async_trait]
impl SubscriptionTransport for GrpcTransport {
    async fn connect(&self, endpoint: &EndpointConfig) -> Result<Box<dyn TransportClient>> {
        let builder = Endpoint::from_shared(endpoint.address.clone())?
            .connect_timeout(Duration::from_millis(endpoint.connection_timeout_ms))
            .timeout(Duration::from_millis(endpoint.request_timeout_ms));
        let channel = apply_options(builder, &endpoint.options).connect().await?;

        let x_token = if endpoint.x_token.is_empty() {
            None
        } else {
            Some(
                AsciiMetadataValue::try_from(endpoint.x_token.as_str())
                    .map_err(|e| Error::Transport(format!("invalid x-token: {e}")))?,
            )
        };
        let interceptor = XTokenInterceptor { x_token };

        debug!(address = %endpoint.address, "Transport channel established");

        Ok(Box::new(GrpcClient {
            grpc: Grpc::new(InterceptedService::new(channel.clone(), interceptor.clone())),
            health: HealthClient::with_interceptor(channel, interceptor),
        }))
    }
}

struct GrpcClient {
    grpc: Grpc<InterceptedService<Channel, XTokenInterceptor>>,
    health: HealthClient<InterceptedService<Channel, XTokenInterceptor>>,
}

#[async_trait]
impl TransportClient for GrpcClient {
    async fn open_stream(&mut self, request: SubscribeRequest) -> Result<StreamPair> {
        self.grpc
            .ready()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let (tx, rx) = mpsc::channel::<SubscribeRequest>(OUTBOUND_BUFFER);
        tx.try_send(request)
            .map_err(|_| Error::Stream("failed to queue initial request".to_string()))?;

        let codec: ProstCodec<SubscribeRequest, ServerFrame> = ProstCodec::default();
        let response = self
            .grpc
            .streaming(
                Request::new(ReceiverStream::new(rx)),
                PathAndQuery::from_static(SUBSCRIBE_PATH),
                codec,
            )
            .await?;

        Ok(StreamPair {
            sink: Box::new(GrpcStreamSink { tx: Some(tx) }),
            source: Box::new(GrpcStreamSource {
                inner: Some(response.into_inner()),
            }),
        })
    }

    async fn probe_liveness(&mut self) -> Result<()> {
        self.health
            .check(HealthCheckRequest {
                service: String::new(),
            })
            .await?;
        Ok(())
    }

    async fn release(&mut self) {
        // Dropping the channel closes outstanding HTTP/2 state; there is
        // no transport-level flush to wait on.
        debug!("Transport client released");
    }
}

struct GrpcStreamSink {
    tx: Option<mpsc::Sender<SubscribeRequest>>,
}

#[async_trait]
impl StreamSink for GrpcStreamSink {
    async fn send(&mut self, frame: SubscribeRequest) -> Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|_| Error::Stream("request stream closed".to_string())),
            None => Err(Error::Cancelled),
        }
    }

    async fn finish(&mut self) {
        // Dropping the sender half-closes the write side of the stream.
        self.tx.take();
    }

    fn cancel(&mut self) {
        self.tx.take();
    }
}

struct GrpcStreamSource {
    inner: Option<Streaming<ServerFrame>>,
}

#[async_trait]
impl StreamSource for GrpcStreamSource {
    async fn next_frame(&mut self) -> Option<Result<ServerFrame>> {
        let stream = self.inner.as_mut()?;
        match stream.message().await {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => None,
            Err(status) => Some(Err(status.into())),
        }
    }

    fn cancel(&mut self) {
        // Dropping the inbound half sends RST_STREAM upstream.
        self.inner.take();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_apply_options_accepts_known_keys() {
        let mut options = HashMap::new();
        options.insert("http2_keep_alive_interval_ms".to_string(), "15000".to_string());
        options.insert("tcp_nodelay".to_string(), "true".to_string());
        options.insert("concurrency_limit".to_string(), "32".to_string());

        let builder = Endpoint::from_static("http://127.0.0.1:50051");
        // Builder application must not panic or reject valid values.
        let _ = apply_options(builder, &options);
    }

    #[test]
    fn test_apply_options_skips_unknown_and_invalid() {
        let mut options = HashMap::new();
        options.insert("no_such_option".to_string(), "1".to_string());
        options.insert("tcp_nodelay".to_string(), "not-a-bool".to_string());

        let builder = Endpoint::from_static("http://127.0.0.1:50051");
        let _ = apply_options(builder, &options);
    }
}
