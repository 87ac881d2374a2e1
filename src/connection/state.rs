//! Connection internal state and stream closure discipline.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::event::EndpointId;
use crate::metrics::ConnectionStatus;
use crate::transport::StreamSink;

/// Deadline for each half of the stream closure sequence.
pub(super) const STREAM_CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Consecutive liveness-probe failures tolerated before the connection is
/// failed.
pub(super) const MAX_PROBE_FAILURES: u32 = 3;

/// Shared writer half of the current stream.
///
/// The ping loop and the fan-out path both write; the async mutex
/// serializes them without blocking the reader.
pub(super) type SharedSink = Arc<tokio::sync::Mutex<Box<dyn StreamSink>>>;

/// Everything attached to one open stream.
pub(super) struct ActiveStream {
    pub(super) sink: SharedSink,
    /// Cancellation signal observed by the reader task.
    pub(super) close_tx: watch::Sender<bool>,
    pub(super) reader_task: JoinHandle<()>,
    pub(super) ping_task: Option<JoinHandle<()>>,
    /// Stream generation; stale timers and callbacks carry the generation
    /// they were armed for and are ignored when it no longer matches.
    pub(super) generation: u64,
}

/// Mutable connection state, guarded by a sync mutex that is never held
/// across an await point.
pub(super) struct Inner {
    pub(super) status: ConnectionStatus,
    pub(super) stream: Option<ActiveStream>,
    pub(super) started: bool,
    pub(super) ever_connected: bool,
    pub(super) reconnect_attempts: u32,
    pub(super) probe_failures: u32,
    pub(super) next_ping_id: u64,
    pub(super) pending_pongs: HashSet<u64>,
    pub(super) missed_pongs: u32,
    pub(super) last_any_frame_at: Option<Instant>,
    pub(super) last_data_frame_at: Option<Instant>,
    pub(super) health_task: Option<JoinHandle<()>>,
    pub(super) reconnect_task: Option<JoinHandle<()>>,
    /// Incremented every time a stream is installed.
    pub(super) epoch: u64,
}

impl Inner {
    pub(super) fn new() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            stream: None,
            started: false,
            ever_connected: false,
            reconnect_attempts: 0,
            probe_failures: 0,
            next_ping_id: 0,
            pending_pongs: HashSet::new(),
            missed_pongs: 0,
            last_any_frame_at: None,
            last_data_frame_at: None,
            health_task: None,
            reconnect_task: None,
            epoch: 0,
        }
    }
}

/// Run the closure discipline on a discarded stream: cancel, end the
/// writer side, then destroy local resources.
///
/// Errors raised here are expected (the peer may already be gone) and are
/// logged, never propagated.
pub(super) async fn close_stream(mut stream: ActiveStream, endpoint: &EndpointId) {
    debug!(endpoint = %endpoint, generation = stream.generation, "Closing stream");

    // Step 1: cancellation signal. The reader observes it, resets the
    // read half and exits; if the reader already exited this is a no-op.
    let _ = stream.close_tx.send(true);

    // Step 2: writer-side end of stream.
    let sink = Arc::clone(&stream.sink);
    let finish = async move {
        sink.lock().await.finish().await;
    };
    if tokio::time::timeout(STREAM_CLOSE_TIMEOUT, finish)
        .await
        .is_err()
    {
        warn!(endpoint = %endpoint, "Writer-side stream close timed out");
    }

    // Step 3: force-destroy local resources.
    if let Some(ping) = stream.ping_task.take() {
        ping.abort();
    }
    if tokio::time::timeout(STREAM_CLOSE_TIMEOUT, &mut stream.reader_task)
        .await
        .is_err()
    {
        debug!(endpoint = %endpoint, "Reader did not exit in time, aborting");
        stream.reader_task.abort();
    }
}
