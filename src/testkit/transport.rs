//! Instrumented in-memory transport for tests.
//!
//! One [`MockTransport`] serves a whole pool; each endpoint address gets
//! its own [`MockEndpoint`] control handle for scripting failures,
//! feeding frames on demand, and asserting call counts: connects,
//! probes, stream opens, cancels and client releases.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::EndpointConfig;
use crate::error::{Error, Result};
use crate::transport::frame::{ServerFrame, SubscribeRequest};
use crate::transport::{
    StreamPair, StreamSink, StreamSource, SubscriptionTransport, TransportClient,
};

/// In-memory [`SubscriptionTransport`] with per-endpoint instrumentation.
#[derive(Default)]
pub struct MockTransport {
    endpoints: Mutex<HashMap<String, Arc<MockEndpoint>>>,
}

impl MockTransport {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Control handle for `address`, created on first use.
    pub fn endpoint(&self, address: &str) -> Arc<MockEndpoint> {
        Arc::clone(
            self.endpoints
                .lock()
                .entry(address.to_string())
                .or_default(),
        )
    }
}

#[async_trait]
impl SubscriptionTransport for MockTransport {
    async fn connect(&self, endpoint: &EndpointConfig) -> Result<Box<dyn TransportClient>> {
        let state = self.endpoint(&endpoint.address);
        state.connect_count.fetch_add(1, Ordering::SeqCst);
        pop_result(&state.connect_results)?;
        Ok(Box::new(MockClient { state }))
    }
}

/// Per-endpoint mock state and test control handle.
pub struct MockEndpoint {
    connect_results: Mutex<VecDeque<Result<()>>>,
    probe_results: Mutex<VecDeque<Result<()>>>,
    open_results: Mutex<VecDeque<Result<()>>>,
    connect_count: AtomicU32,
    probe_count: AtomicU32,
    open_count: AtomicU32,
    release_count: AtomicU32,
    cancel_count: AtomicU32,
    finish_count: AtomicU32,
    /// When set (the default), every ping written by the client is
    /// answered with a matching pong.
    auto_pong: AtomicBool,
    requests: Mutex<Vec<SubscribeRequest>>,
    frame_tx: Mutex<Option<mpsc::UnboundedSender<Result<ServerFrame>>>>,
}

impl Default for MockEndpoint {
    fn default() -> Self {
        Self {
            connect_results: Mutex::new(VecDeque::new()),
            probe_results: Mutex::new(VecDeque::new()),
            open_results: Mutex::new(VecDeque::new()),
            connect_count: AtomicU32::new(0),
            probe_count: AtomicU32::new(0),
            open_count: AtomicU32::new(0),
            release_count: AtomicU32::new(0),
            cancel_count: AtomicU32::new(0),
            finish_count: AtomicU32::new(0),
            auto_pong: AtomicBool::new(true),
            requests: Mutex::new(Vec::new()),
            frame_tx: Mutex::new(None),
        }
    }
}

/// Pop the next scripted result, defaulting to `Ok(())` when exhausted.
fn pop_result(queue: &Mutex<VecDeque<Result<()>>>) -> Result<()> {
    queue.lock().pop_front().unwrap_or(Ok(()))
}

impl MockEndpoint {
    // -- Scripting ---------------------------------------------------------

    pub fn script_connect_results(&self, results: Vec<Result<()>>) {
        *self.connect_results.lock() = results.into();
    }

    pub fn script_probe_results(&self, results: Vec<Result<()>>) {
        *self.probe_results.lock() = results.into();
    }

    pub fn script_open_results(&self, results: Vec<Result<()>>) {
        *self.open_results.lock() = results.into();
    }

    /// Stop answering pings (the server goes mute for keep-alive).
    pub fn set_auto_pong(&self, enabled: bool) {
        self.auto_pong.store(enabled, Ordering::SeqCst);
    }

    // -- Driving the stream ------------------------------------------------

    /// Deliver a frame on the endpoint's current stream, if one is open.
    pub fn send_frame(&self, frame: ServerFrame) {
        if let Some(tx) = self.frame_tx.lock().as_ref() {
            let _ = tx.send(Ok(frame));
        }
    }

    /// Deliver a data frame carrying `signature`.
    pub fn send_transaction(&self, signature: &[u8]) {
        self.send_frame(super::frames::transaction(signature));
    }

    /// Terminate the current stream with `error`, as the network would.
    pub fn fail_stream(&self, error: Error) {
        if let Some(tx) = self.frame_tx.lock().take() {
            let _ = tx.send(Err(error));
        }
    }

    /// End the current stream cleanly (server-side close).
    pub fn close_stream(&self) {
        self.frame_tx.lock().take();
    }

    /// Whether a stream is currently open on this endpoint.
    #[must_use]
    pub fn has_stream(&self) -> bool {
        self.frame_tx
            .lock()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    // -- Assertions --------------------------------------------------------

    #[must_use]
    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn probe_count(&self) -> u32 {
        self.probe_count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn release_count(&self) -> u32 {
        self.release_count.load(Ordering::SeqCst)
    }

    /// How many read halves were cancelled locally.
    #[must_use]
    pub fn cancel_count(&self) -> u32 {
        self.cancel_count.load(Ordering::SeqCst)
    }

    /// How many write halves were finished (end-of-stream).
    #[must_use]
    pub fn finish_count(&self) -> u32 {
        self.finish_count.load(Ordering::SeqCst)
    }

    /// Every frame the client wrote, pings included, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<SubscribeRequest> {
        self.requests.lock().clone()
    }

    /// Initial subscription requests only (ping frames filtered out).
    #[must_use]
    pub fn subscribe_requests(&self) -> Vec<SubscribeRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.ping.is_none())
            .cloned()
            .collect()
    }

    /// Ping frames the client wrote.
    #[must_use]
    pub fn ping_count(&self) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.ping.is_some())
            .count()
    }
}

struct MockClient {
    state: Arc<MockEndpoint>,
}

#[async_trait]
impl TransportClient for MockClient {
    async fn open_stream(&mut self, request: SubscribeRequest) -> Result<StreamPair> {
        self.state.open_count.fetch_add(1, Ordering::SeqCst);
        pop_result(&self.state.open_results)?;

        self.state.requests.lock().push(request);

        let (tx, rx) = mpsc::unbounded_channel();
        *self.state.frame_tx.lock() = Some(tx);

        Ok(StreamPair {
            sink: Box::new(MockSink {
                state: Arc::clone(&self.state),
                closed: AtomicBool::new(false),
            }),
            source: Box::new(MockSource {
                rx: Some(rx),
                state: Arc::clone(&self.state),
            }),
        })
    }

    async fn probe_liveness(&mut self) -> Result<()> {
        self.state.probe_count.fetch_add(1, Ordering::SeqCst);
        pop_result(&self.state.probe_results)
    }

    async fn release(&mut self) {
        self.state.release_count.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockSink {
    state: Arc<MockEndpoint>,
    closed: AtomicBool,
}

#[async_trait]
impl StreamSink for MockSink {
    async fn send(&mut self, frame: SubscribeRequest) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        let ping_id = frame.ping.as_ref().map(|p| p.id);
        self.state.requests.lock().push(frame);

        if let Some(id) = ping_id {
            if self.state.auto_pong.load(Ordering::SeqCst) {
                self.state.send_frame(ServerFrame::pong(id));
            }
        }
        Ok(())
    }

    async fn finish(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.state.finish_count.fetch_add(1, Ordering::SeqCst);
    }

    fn cancel(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct MockSource {
    rx: Option<mpsc::UnboundedReceiver<Result<ServerFrame>>>,
    state: Arc<MockEndpoint>,
}

#[async_trait]
impl StreamSource for MockSource {
    async fn next_frame(&mut self) -> Option<Result<ServerFrame>> {
        self.rx.as_mut()?.recv().await
    }

    fn cancel(&mut self) {
        self.state.cancel_count.fetch_add(1, Ordering::SeqCst);
        self.rx.take();
    }
}
