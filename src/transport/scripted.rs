//! In-memory transport that plays back a fixed script.
//!
//! Every exchange opened on a [`ScriptedTransport`] replays the same list of
//! [`Step`]s. Request bodies (uploads and stream writes) are consumed the way
//! a server would consume them and recorded for inspection.

use super::{
    LoadStateReporter, ResponseHead, StreamWrites, Transport, TransportEvent, TransportRequest,
};
use crate::base::loadstate::LoadState;
use crate::base::neterror::NetError;
use crate::upload::UploadDataStream;
use ::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use url::Url;

const UPLOAD_CHUNK: usize = 8192;

#[derive(Debug, Clone)]
pub enum Step {
    /// Redirect to `location`, resolved against the current URL. Following
    /// it re-sends the request body.
    Redirect { status: u16, location: String },
    /// Consume the whole request body before continuing.
    ReadBody,
    Response {
        status: u16,
        headers: Vec<(String, String)>,
    },
    Data(Bytes),
    Trailers(Vec<(String, String)>),
    Fail(NetError),
    /// The peer abandons the exchange.
    Cancel,
    /// Never make progress again.
    Hang,
}

impl Step {
    pub fn ok() -> Self {
        Step::Response {
            status: 200,
            headers: Vec::new(),
        }
    }

    pub fn data(bytes: impl Into<Bytes>) -> Self {
        Step::Data(bytes.into())
    }
}

/// What one exchange sent, as seen by the script.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

#[derive(Clone)]
pub struct ScriptedTransport {
    steps: Arc<Vec<Step>>,
    recorded: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl ScriptedTransport {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Arc::new(steps),
            recorded: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A `200 OK` whose body is `chunks`.
    pub fn ok_with_body<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let mut steps = vec![Step::ReadBody, Step::ok()];
        steps.extend(chunks.into_iter().map(Step::data));
        Self::new(steps)
    }

    /// Requests sent so far, one entry per hop.
    pub fn recorded(&self) -> Vec<RecordedRequest> {
        self.recorded.lock().clone()
    }
}

impl Transport for ScriptedTransport {
    fn open(&self, request: TransportRequest) -> BoxStream<'static, TransportEvent> {
        let exchange = ScriptedExchange {
            steps: self.steps.iter().cloned().collect(),
            recorded: Arc::clone(&self.recorded),
            url: request.url,
            method: request.method,
            headers: request.headers,
            upload: request.upload,
            writes: request.stream,
            load_state: request.load_state,
            written: Vec::new(),
            writes_done: false,
            hop_recorded: false,
            started: false,
            finished: false,
        };
        stream::unfold(exchange, |mut exchange| async move {
            let event = exchange.next_event().await?;
            Some((event, exchange))
        })
        .boxed()
    }
}

struct ScriptedExchange {
    steps: VecDeque<Step>,
    recorded: Arc<Mutex<Vec<RecordedRequest>>>,
    url: Url,
    method: Method,
    headers: HeaderMap,
    upload: Option<UploadDataStream>,
    writes: Option<StreamWrites>,
    load_state: LoadStateReporter,
    written: Vec<u8>,
    writes_done: bool,
    hop_recorded: bool,
    started: bool,
    finished: bool,
}

impl ScriptedExchange {
    async fn next_event(&mut self) -> Option<TransportEvent> {
        if self.finished {
            return None;
        }
        if !self.started {
            self.started = true;
            self.load_state.set(LoadState::SendingRequest);
            if self.writes.is_some() {
                return Some(TransportEvent::StreamReady);
            }
        }
        loop {
            while self.try_take_write() {}

            let Some(step) = self.steps.pop_front() else {
                // Like a server, finish reading the request before completing.
                while self.take_write().await {}
                return Some(self.finish(TransportEvent::Done));
            };

            return match step {
                Step::ReadBody => {
                    if self.writes.is_some() {
                        while self.take_write().await {}
                        self.record_hop(Vec::new());
                    } else if let Err(e) = self.read_upload().await {
                        return Some(self.finish(TransportEvent::Failed(e)));
                    }
                    self.load_state.set(LoadState::WaitingForResponse);
                    continue;
                }
                Step::Redirect { status, location } => {
                    self.record_hop(Vec::new());
                    let location = match self.url.join(&location) {
                        Ok(location) => location,
                        Err(_) => {
                            return Some(self.finish(TransportEvent::Failed(NetError::InvalidRedirect)))
                        }
                    };
                    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::FOUND);
                    let mut headers = HeaderMap::new();
                    if let Ok(value) = HeaderValue::from_str(location.as_str()) {
                        headers.insert(::http::header::LOCATION, value);
                    }
                    self.url = location.clone();
                    self.hop_recorded = false;
                    if let Some(upload) = &self.upload {
                        upload.reset();
                    }
                    Some(TransportEvent::Redirect {
                        head: ResponseHead::new(status, headers),
                        location,
                    })
                }
                Step::Response { status, headers } => {
                    self.record_hop(Vec::new());
                    self.load_state.set(LoadState::ReadingResponse);
                    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
                    Some(TransportEvent::ResponseStarted(ResponseHead::new(
                        status,
                        to_header_map(&headers),
                    )))
                }
                Step::Data(bytes) => Some(TransportEvent::Data(bytes)),
                Step::Trailers(trailers) => {
                    Some(TransportEvent::Trailers(to_header_map(&trailers)))
                }
                Step::Fail(e) => Some(self.finish(TransportEvent::Failed(e))),
                Step::Cancel => Some(self.finish(TransportEvent::Canceled)),
                Step::Hang => futures::future::pending::<Option<TransportEvent>>().await,
            };
        }
    }

    fn finish(&mut self, event: TransportEvent) -> TransportEvent {
        self.finished = true;
        event
    }

    /// Consume a write that is already queued.
    fn try_take_write(&mut self) -> bool {
        if self.writes_done {
            return false;
        }
        let Some(writes) = self.writes.as_mut() else {
            return false;
        };
        match writes.frames.try_recv() {
            Ok(frame) => {
                self.ack(frame.data, frame.end_of_stream);
                true
            }
            Err(_) => false,
        }
    }

    /// Wait for the next write; `false` once the write side has ended.
    async fn take_write(&mut self) -> bool {
        if self.writes_done {
            return false;
        }
        let Some(writes) = self.writes.as_mut() else {
            return false;
        };
        match writes.frames.recv().await {
            Some(frame) => {
                self.ack(frame.data, frame.end_of_stream);
                true
            }
            None => {
                self.writes_done = true;
                false
            }
        }
    }

    fn ack(&mut self, data: Bytes, end_of_stream: bool) {
        self.written.extend_from_slice(&data);
        if let Some(writes) = &self.writes {
            let _ = writes.acks.send(());
        }
        if end_of_stream {
            self.writes_done = true;
            let body = std::mem::take(&mut self.written);
            self.record_hop(body);
        }
    }

    async fn read_upload(&mut self) -> Result<(), NetError> {
        let Some(upload) = self.upload.clone() else {
            self.record_hop(Vec::new());
            return Ok(());
        };
        upload.init()?.ready().await?;
        let mut body = Vec::new();
        loop {
            let chunk = upload.read(UPLOAD_CHUNK).await?;
            body.extend_from_slice(&chunk.data);
            if chunk.final_chunk {
                break;
            }
        }
        self.record_hop(body);
        Ok(())
    }

    fn record_hop(&mut self, body: Vec<u8>) {
        if self.hop_recorded {
            return;
        }
        self.hop_recorded = true;
        self.recorded.lock().push(RecordedRequest {
            url: self.url.clone(),
            method: self.method.clone(),
            headers: self.headers.clone(),
            body,
        });
    }
}

fn to_header_map(headers: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            map.append(name, value);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str) -> TransportRequest {
        let (load_state, _rx) = LoadStateReporter::channel();
        TransportRequest {
            url: Url::parse(url).unwrap(),
            method: Method::GET,
            headers: HeaderMap::new(),
            upload: None,
            stream: None,
            load_state,
        }
    }

    #[tokio::test]
    async fn test_plays_back_script() {
        let transport = ScriptedTransport::new(vec![
            Step::Redirect {
                status: 302,
                location: "/final".into(),
            },
            Step::ok(),
            Step::data("hello"),
        ]);
        let events: Vec<_> = transport.open(request("http://test/start")).collect().await;

        assert_eq!(events.len(), 4);
        match &events[0] {
            TransportEvent::Redirect { location, head } => {
                assert_eq!(location.as_str(), "http://test/final");
                assert_eq!(head.status, StatusCode::FOUND);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(events[1], TransportEvent::ResponseStarted(_)));
        assert!(matches!(&events[2], TransportEvent::Data(b) if &b[..] == b"hello"));
        assert!(matches!(events[3], TransportEvent::Done));

        let recorded = transport.recorded();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[1].url.as_str(), "http://test/final");
    }

    #[tokio::test]
    async fn test_failure_ends_stream() {
        let transport = ScriptedTransport::new(vec![Step::Fail(NetError::ConnectionRefused), Step::ok()]);
        let events: Vec<_> = transport.open(request("http://test/")).collect().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], TransportEvent::Failed(NetError::ConnectionRefused)));
    }
}
