use super::stream::BidirectionalStream;
use crate::base::buffer::ByteBuffer;
use crate::base::neterror::{BoxError, NetError};
use crate::urlrequest::UrlResponseInfo;

#[derive(Debug)]
pub enum StreamEvent {
    /// Request headers were sent, or will be with the first flush. Writes
    /// may be flushed from now on.
    StreamReady,
    ResponseHeadersReceived { info: UrlResponseInfo },
    /// A read finished. At the end of the body one last read completes with
    /// no bytes and `end_of_stream` set.
    ReadCompleted {
        info: UrlResponseInfo,
        buffer: ByteBuffer,
        end_of_stream: bool,
    },
    /// The oldest outstanding write was sent. Its buffer is returned with
    /// `position == limit`.
    WriteCompleted {
        info: Option<UrlResponseInfo>,
        buffer: ByteBuffer,
        end_of_stream: bool,
    },
    ResponseTrailersReceived {
        info: UrlResponseInfo,
        trailers: Vec<(String, String)>,
    },
    Succeeded { info: UrlResponseInfo },
    Failed {
        info: Option<UrlResponseInfo>,
        error: NetError,
    },
    Canceled { info: Option<UrlResponseInfo> },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::Succeeded { .. } | StreamEvent::Failed { .. } | StreamEvent::Canceled { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::StreamReady => "on_stream_ready",
            StreamEvent::ResponseHeadersReceived { .. } => "on_response_headers_received",
            StreamEvent::ReadCompleted { .. } => "on_read_completed",
            StreamEvent::WriteCompleted { .. } => "on_write_completed",
            StreamEvent::ResponseTrailersReceived { .. } => "on_response_trailers_received",
            StreamEvent::Succeeded { .. } => "on_succeeded",
            StreamEvent::Failed { .. } => "on_failed",
            StreamEvent::Canceled { .. } => "on_canceled",
        }
    }

    pub(crate) fn clone_terminal(&self) -> Option<StreamEvent> {
        match self {
            StreamEvent::Succeeded { info } => Some(StreamEvent::Succeeded { info: info.clone() }),
            StreamEvent::Failed { info, error } => Some(StreamEvent::Failed {
                info: info.clone(),
                error: error.clone(),
            }),
            StreamEvent::Canceled { info } => Some(StreamEvent::Canceled { info: info.clone() }),
            _ => None,
        }
    }
}

/// Receives the events of one stream, on the stream's executor, one at a
/// time. Error handling matches
/// [`UrlRequestCallback`](crate::urlrequest::UrlRequestCallback).
pub trait BidirectionalStreamCallback: Send + 'static {
    fn on_event(&mut self, stream: &BidirectionalStream, event: StreamEvent)
        -> Result<(), BoxError>;
}

impl<F> BidirectionalStreamCallback for F
where
    F: FnMut(&BidirectionalStream, StreamEvent) -> Result<(), BoxError> + Send + 'static,
{
    fn on_event(
        &mut self,
        stream: &BidirectionalStream,
        event: StreamEvent,
    ) -> Result<(), BoxError> {
        self(stream, event)
    }
}
