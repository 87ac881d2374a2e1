//! Inbound frame consumer for one stream.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::transport::StreamSource;

use super::Connection;

enum Step {
    Cancelled,
    Frame(Option<crate::Result<crate::transport::frame::ServerFrame>>),
}

/// Drive one stream's read half until the stream ends, errors, or the
/// connection cancels it.
///
/// This task is the single reader for its endpoint, which is what
/// preserves per-endpoint ordering end-to-end.
pub(super) async fn read_loop(
    conn: Arc<Connection>,
    mut source: Box<dyn StreamSource>,
    generation: u64,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        let step = tokio::select! {
            biased;

            _ = close_rx.changed() => Step::Cancelled,
            frame = source.next_frame() => Step::Frame(frame),
        };

        match step {
            Step::Cancelled => {
                source.cancel();
                debug!(endpoint = %conn.endpoint_id(), generation, "Reader cancelled");
                return;
            }
            Step::Frame(Some(Ok(frame))) => conn.handle_frame(frame, generation),
            Step::Frame(Some(Err(error))) => {
                conn.handle_stream_error(error, generation);
                return;
            }
            Step::Frame(None) => {
                conn.handle_stream_error(
                    crate::Error::Stream("stream ended by server".to_string()),
                    generation,
                );
                return;
            }
        }
    }
}
