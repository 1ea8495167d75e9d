use super::info::UrlResponseInfo;
use super::request::UrlRequest;
use crate::base::buffer::ByteBuffer;
use crate::base::neterror::{BoxError, NetError};
use std::any::Any;

/// One step of a request, as seen by the application.
#[derive(Debug)]
pub enum RequestEvent {
    /// A redirect was received. Call [`UrlRequest::follow_redirect`] to
    /// continue or [`UrlRequest::cancel`] to stop.
    RedirectReceived {
        info: UrlResponseInfo,
        new_location: String,
    },
    /// Final response headers arrived. Call [`UrlRequest::read`] to fetch
    /// the body.
    ResponseStarted { info: UrlResponseInfo },
    /// A read finished. The bytes read sit between the buffer's position at
    /// the `read` call and its current position.
    ReadCompleted {
        info: UrlResponseInfo,
        buffer: ByteBuffer,
    },
    Succeeded { info: UrlResponseInfo },
    Failed {
        info: Option<UrlResponseInfo>,
        error: NetError,
    },
    Canceled { info: Option<UrlResponseInfo> },
}

impl RequestEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestEvent::Succeeded { .. }
                | RequestEvent::Failed { .. }
                | RequestEvent::Canceled { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            RequestEvent::RedirectReceived { .. } => "on_redirect_received",
            RequestEvent::ResponseStarted { .. } => "on_response_started",
            RequestEvent::ReadCompleted { .. } => "on_read_completed",
            RequestEvent::Succeeded { .. } => "on_succeeded",
            RequestEvent::Failed { .. } => "on_failed",
            RequestEvent::Canceled { .. } => "on_canceled",
        }
    }

    /// Copy of a terminal event, used to re-post it when the first post
    /// was rejected.
    pub(crate) fn clone_terminal(&self) -> Option<RequestEvent> {
        match self {
            RequestEvent::Succeeded { info } => Some(RequestEvent::Succeeded { info: info.clone() }),
            RequestEvent::Failed { info, error } => Some(RequestEvent::Failed {
                info: info.clone(),
                error: error.clone(),
            }),
            RequestEvent::Canceled { info } => Some(RequestEvent::Canceled { info: info.clone() }),
            _ => None,
        }
    }
}

/// Receives the events of one request, on the request's executor, one at a
/// time.
///
/// Returning `Err` (or panicking) from a non-terminal event fails the
/// request with [`NetError::Callback`]; the step that was being reported
/// still counts as done. Errors from terminal events are logged and dropped.
pub trait UrlRequestCallback: Send + 'static {
    fn on_event(&mut self, request: &UrlRequest, event: RequestEvent) -> Result<(), BoxError>;
}

impl<F> UrlRequestCallback for F
where
    F: FnMut(&UrlRequest, RequestEvent) -> Result<(), BoxError> + Send + 'static,
{
    fn on_event(&mut self, request: &UrlRequest, event: RequestEvent) -> Result<(), BoxError> {
        self(request, event)
    }
}

/// Turn a caught panic payload into an error value.
pub(crate) fn panic_to_error(payload: Box<dyn Any + Send>) -> BoxError {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "callback panicked".to_string()
    };
    message.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::catch_unwind;

    #[test]
    fn test_panic_message_kept() {
        let payload = catch_unwind(|| panic!("boom {}", 7)).unwrap_err();
        assert_eq!(panic_to_error(payload).to_string(), "boom 7");
        let payload = catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_to_error(payload).to_string(), "static");
    }

    #[test]
    fn test_terminal_events() {
        let canceled = RequestEvent::Canceled { info: None };
        assert!(canceled.is_terminal());
        assert_eq!(canceled.name(), "on_canceled");
        assert!(canceled.clone_terminal().is_some());
    }
}
