//! Transport layer.
//!
//! The request and stream state machines never touch sockets. They hand a
//! [`TransportRequest`] to a [`Transport`] and consume the events it yields.
//! The event stream is lazy: nothing moves until the driver polls it, which
//! is how a redirect is held until `follow_redirect()` and how a dropped
//! stream cancels the exchange.

pub mod http;
pub mod retry;
pub mod scripted;

pub use self::http::{HttpTransport, HttpTransportConfig};
pub use retry::RetryConfig;
pub use scripted::{ScriptedTransport, Step};

use crate::base::loadstate::LoadState;
use crate::base::neterror::NetError;
use crate::upload::UploadDataStream;
use ::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use url::Url;

/// Opens exchanges on behalf of the engine. Called on the network thread.
pub trait Transport: Send + Sync + 'static {
    fn open(&self, request: TransportRequest) -> BoxStream<'static, TransportEvent>;
}

/// Everything a transport needs to run one request or stream.
pub struct TransportRequest {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    /// Request body. Length has already been queried.
    pub upload: Option<UploadDataStream>,
    /// Present for bidirectional streams.
    pub stream: Option<StreamWrites>,
    pub load_state: LoadStateReporter,
}

/// Write side of a bidirectional stream.
pub struct StreamWrites {
    pub frames: mpsc::UnboundedReceiver<WriteFrame>,
    /// One message per frame handed to the network, in frame order. Kept
    /// apart from the event stream so that acks flow while reading is paused.
    pub acks: mpsc::UnboundedSender<()>,
    /// Hold the request headers back until the first flushed write.
    pub delay_headers_until_flush: bool,
}

/// One buffer written on a bidirectional stream.
#[derive(Debug, Clone)]
pub struct WriteFrame {
    pub data: Bytes,
    pub end_of_stream: bool,
}

/// Status line and headers of one response (or redirect hop).
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub status_text: String,
    pub headers: HeaderMap,
    pub negotiated_protocol: String,
    pub was_cached: bool,
}

impl ResponseHead {
    pub fn new(status: StatusCode, headers: HeaderMap) -> Self {
        Self {
            status,
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            negotiated_protocol: "http/1.1".to_string(),
            was_cached: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A redirect hop. Polling again follows it.
    Redirect { head: ResponseHead, location: Url },
    /// Stream established; writes may be sent.
    StreamReady,
    ResponseStarted(ResponseHead),
    Data(Bytes),
    Trailers(HeaderMap),
    /// Response body complete.
    Done,
    Failed(NetError),
    /// The peer abandoned the exchange.
    Canceled,
}

/// Publishes a request's [`LoadState`]. Only ever moves forward.
#[derive(Debug, Clone)]
pub struct LoadStateReporter {
    sender: Arc<watch::Sender<LoadState>>,
}

impl LoadStateReporter {
    pub(crate) fn channel() -> (Self, watch::Receiver<LoadState>) {
        let (tx, rx) = watch::channel(LoadState::Idle);
        (
            Self {
                sender: Arc::new(tx),
            },
            rx,
        )
    }

    pub fn set(&self, state: LoadState) {
        self.sender.send_if_modified(|current| {
            if state > *current {
                *current = state;
                true
            } else {
                false
            }
        });
    }

    pub fn get(&self) -> LoadState {
        *self.sender.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_state_only_advances() {
        let (reporter, rx) = LoadStateReporter::channel();
        reporter.set(LoadState::Connecting);
        reporter.set(LoadState::ResolvingHost);
        assert_eq!(*rx.borrow(), LoadState::Connecting);
        reporter.set(LoadState::ReadingResponse);
        assert_eq!(reporter.get(), LoadState::ReadingResponse);
    }
}
