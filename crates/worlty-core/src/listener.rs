//! Listener loop: the only reader of the gateway socket.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use worlty_rpc::{FrameReader, ReadOutcome};

use crate::session::LinkEvent;

/// Why the listener stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenExit {
    /// The connection token was cancelled (watchdog or disconnect)
    Cancelled,
    /// The socket closed or produced a message without data
    Ended,
    /// The session actor is gone
    SessionGone,
}

/// True when a frame carries a `data` payload.
///
/// An empty object still counts and keeps the listener going. Only a frame
/// with `data` missing or null ends it.
pub fn carries_data(frame: &Value) -> bool {
    frame.get("data").is_some_and(|data| !data.is_null())
}

/// Poll the socket until it stops producing data.
///
/// Data frames refresh `liveness` and are forwarded to the session; timeout
/// and error markers are ignored.
pub async fn listen(
    reader: &mut FrameReader,
    poll_timeout: Duration,
    cancel: &CancellationToken,
    liveness: &watch::Sender<Instant>,
    events: &mpsc::UnboundedSender<LinkEvent>,
    label: &str,
) -> ListenExit {
    debug!("[{label}] Listen for gateway messages");

    loop {
        let outcome = tokio::select! {
            () = cancel.cancelled() => {
                debug!("[{label}] Listener cancelled");
                return ListenExit::Cancelled;
            }
            outcome = reader.read(poll_timeout) => outcome,
        };

        match outcome {
            ReadOutcome::Message(frame) if carries_data(&frame) => {
                liveness.send_replace(Instant::now());
                if events.send(LinkEvent::Frame(frame)).is_err() {
                    return ListenExit::SessionGone;
                }
            }
            marker if marker.is_marker() => {}
            other => {
                debug!("[{label}] Subscribe message failed, [{other:?}]");
                return ListenExit::Ended;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_carries_data() {
        assert!(carries_data(&json!({"type": "update", "data": {"devices": []}})));
        // Empty data is a heartbeat, not the end of the stream
        assert!(carries_data(&json!({"type": "update", "data": {}})));
        assert!(!carries_data(&json!({"type": "update", "data": null})));
        assert!(!carries_data(&json!({"type": "auth_required"})));
    }
}
