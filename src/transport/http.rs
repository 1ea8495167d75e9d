//! HTTP/1.1 transport over tokio TCP, built on hyper client connections.
//!
//! One connection per hop. Redirects are surfaced as events and followed on
//! the next poll: 307/308 re-send the body (the upload is reset and rewound),
//! 301/302 turn a POST into a GET and 303 turns anything but HEAD into a GET,
//! dropping the body. Connection failures before a response are retried per
//! [`RetryConfig`].

use super::retry::RetryConfig;
use super::{ResponseHead, StreamWrites, Transport, TransportEvent, TransportRequest};
use super::LoadStateReporter;
use crate::base::context::{net_error_from_hyper, IoResultExt};
use crate::base::loadstate::LoadState;
use crate::base::neterror::{BoxError, NetError};
use crate::upload::UploadDataStream;
use ::http::header::{self, HeaderMap, HeaderValue};
use ::http::{Method, Request, Response, StatusCode};
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::pin::Pin;
use tokio::net::TcpStream;
use url::Url;

type RequestBody = UnsyncBoxBody<Bytes, BoxError>;
type ResponseFuture = Pin<Box<dyn Future<Output = Result<Response<Incoming>, hyper::Error>> + Send>>;

/// Transport settings, usually derived from the engine configuration.
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub user_agent: String,
    pub retry: RetryConfig,
    pub upload_chunk_size: usize,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("cronet-rs/", env!("CARGO_PKG_VERSION")).to_string(),
            retry: RetryConfig::default(),
            upload_chunk_size: 8192,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    config: HttpTransportConfig,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Self {
        Self { config }
    }
}

impl Transport for HttpTransport {
    fn open(&self, request: TransportRequest) -> BoxStream<'static, TransportEvent> {
        let exchange = HttpExchange::new(self.config.clone(), request);
        stream::unfold(exchange, |mut exchange| async move {
            let event = exchange.next_event().await?;
            Some((event, exchange))
        })
        .boxed()
    }
}

enum State {
    Connect,
    SendRequest(http1::SendRequest<RequestBody>),
    ReadHeaders(ResponseFuture),
    ReadBody(Incoming),
    Done,
    Finished,
}

/// Equivalent of Chromium's `HttpNetworkTransaction` for a single exchange.
struct HttpExchange {
    config: HttpTransportConfig,
    url: Url,
    method: Method,
    headers: HeaderMap,
    upload: Option<UploadDataStream>,
    writes: Option<StreamWrites>,
    is_stream: bool,
    load_state: LoadStateReporter,
    state: State,
    attempts: usize,
    body_sent: bool,
    // Keeps the connection open while the response is read.
    sender: Option<http1::SendRequest<RequestBody>>,
}

impl HttpExchange {
    fn new(config: HttpTransportConfig, request: TransportRequest) -> Self {
        let is_stream = request.stream.is_some();
        Self {
            config,
            url: request.url,
            method: request.method,
            headers: request.headers,
            upload: request.upload,
            writes: request.stream,
            is_stream,
            load_state: request.load_state,
            state: State::Connect,
            attempts: 0,
            body_sent: false,
            sender: None,
        }
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            match std::mem::replace(&mut self.state, State::Finished) {
                State::Connect => match self.connect().await {
                    Ok(sender) => {
                        self.state = State::SendRequest(sender);
                        if self.is_stream {
                            return Some(TransportEvent::StreamReady);
                        }
                    }
                    Err(e) => {
                        if self.retry(&e).await {
                            continue;
                        }
                        return Some(TransportEvent::Failed(e));
                    }
                },
                State::SendRequest(mut sender) => {
                    let request = match self.build_request().await {
                        Ok(request) => request,
                        Err(e) => return Some(TransportEvent::Failed(e)),
                    };
                    self.load_state.set(LoadState::SendingRequest);
                    self.state = State::ReadHeaders(Box::pin(sender.send_request(request)));
                    self.sender = Some(sender);
                }
                State::ReadHeaders(response) => {
                    match response.await {
                        Ok(response) => return Some(self.on_response(response)),
                        Err(e) => {
                            let e = net_error_from_hyper(&e);
                            tracing::debug!(url = %self.url, error = %e, "request failed before response");
                            if self.retry(&e).await {
                                continue;
                            }
                            return Some(TransportEvent::Failed(e));
                        }
                    }
                }
                State::ReadBody(mut body) => {
                    match body.frame().await {
                        Some(Ok(frame)) => match frame.into_data() {
                            Ok(data) => {
                                self.state = State::ReadBody(body);
                                if !data.is_empty() {
                                    return Some(TransportEvent::Data(data));
                                }
                            }
                            Err(frame) => {
                                if let Ok(trailers) = frame.into_trailers() {
                                    self.state = State::Done;
                                    return Some(TransportEvent::Trailers(trailers));
                                }
                                self.state = State::ReadBody(body);
                            }
                        },
                        Some(Err(e)) => {
                            return Some(TransportEvent::Failed(net_error_from_hyper(&e)));
                        }
                        None => self.state = State::Done,
                    }
                }
                State::Done => {
                    self.sender = None;
                    return Some(TransportEvent::Done);
                }
                State::Finished => return None,
            }
        }
    }

    async fn connect(&mut self) -> Result<http1::SendRequest<RequestBody>, NetError> {
        if self.url.scheme() != "http" {
            tracing::debug!(url = %self.url, "scheme not supported by the http transport");
            return Err(NetError::DisallowedUrlScheme);
        }
        let host = self
            .url
            .host_str()
            .ok_or(NetError::InvalidUrl)?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = self.url.port_or_known_default().ok_or(NetError::InvalidUrl)?;

        self.load_state.set(LoadState::ResolvingHost);
        let addrs: Vec<_> = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| {
                tracing::debug!(host = %host, error = %e, "host resolution failed");
                NetError::NameNotResolved
            })?
            .collect();
        if addrs.is_empty() {
            return Err(NetError::NameNotResolved);
        }

        self.load_state.set(LoadState::Connecting);
        let socket = TcpStream::connect(&addrs[..])
            .await
            .connection_context(&host, port)?;
        let _ = socket.set_nodelay(true);

        let (sender, conn) = http1::handshake(TokioIo::new(socket))
            .await
            .map_err(|e| net_error_from_hyper(&e))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "connection closed with error");
            }
        });
        Ok(sender)
    }

    /// Prepare another attempt after `error` if the policy allows it.
    async fn retry(&mut self, error: &NetError) -> bool {
        if self.is_stream && self.body_sent {
            return false;
        }
        let Some(delay) = self.config.retry.next_delay(self.attempts, error) else {
            return false;
        };
        self.attempts += 1;
        tracing::debug!(url = %self.url, attempt = self.attempts, error = %error, "retrying request");
        if let Some(upload) = &self.upload {
            upload.reset();
        }
        self.sender = None;
        tokio::time::sleep(delay).await;
        self.state = State::Connect;
        true
    }

    async fn build_request(&mut self) -> Result<Request<RequestBody>, NetError> {
        let mut headers = self.headers.clone();
        if !headers.contains_key(header::HOST) {
            let host = match self.url.port() {
                Some(port) => format!("{}:{}", self.url.host_str().unwrap_or_default(), port),
                None => self.url.host_str().unwrap_or_default().to_string(),
            };
            let host = HeaderValue::from_str(&host).map_err(|_| NetError::InvalidUrl)?;
            headers.insert(header::HOST, host);
        }
        if !headers.contains_key(header::USER_AGENT) && !self.config.user_agent.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&self.config.user_agent) {
                headers.insert(header::USER_AGENT, value);
            }
        }

        let body = if let Some(writes) = self.writes.take() {
            self.stream_body(writes).await
        } else if let Some(upload) = self.upload.clone() {
            upload.init()?.ready().await?;
            if let Some(length) = upload.length() {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            }
            upload_body(upload, self.config.upload_chunk_size, self.load_state.clone())
        } else {
            self.load_state.set(LoadState::WaitingForResponse);
            empty_body()
        };
        self.body_sent = true;

        let path = match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        };
        let mut request = Request::builder()
            .method(self.method.clone())
            .uri(path)
            .body(body)
            .map_err(|_| NetError::InvalidUrl)?;
        *request.headers_mut() = headers;
        Ok(request)
    }

    async fn stream_body(&mut self, writes: StreamWrites) -> RequestBody {
        if self.method == Method::GET || self.method == Method::HEAD {
            self.load_state.set(LoadState::WaitingForResponse);
            return empty_body();
        }
        let StreamWrites {
            mut frames,
            acks,
            delay_headers_until_flush,
        } = writes;
        // Headers go out with the first flushed write.
        let first = if delay_headers_until_flush {
            frames.recv().await
        } else {
            None
        };

        let load_state = self.load_state.clone();
        let frames = stream::unfold(
            (first, Some(frames), acks),
            move |(first, frames, ack)| {
                let load_state = load_state.clone();
                async move {
                    let mut frames = frames?;
                    let frame = match first {
                        Some(frame) => frame,
                        None => frames.recv().await?,
                    };
                    let _ = ack.send(());
                    let next = if frame.end_of_stream {
                        load_state.set(LoadState::WaitingForResponse);
                        None
                    } else {
                        Some(frames)
                    };
                    Some((Ok::<_, BoxError>(Frame::data(frame.data)), (None, next, ack)))
                }
            },
        );
        StreamBody::new(frames).boxed_unsync()
    }

    fn on_response(&mut self, response: Response<Incoming>) -> TransportEvent {
        let (parts, body) = response.into_parts();
        let head = ResponseHead::new(parts.status, parts.headers);

        if parts.status.is_redirection() && !self.is_stream {
            if let Some(location) = head.headers.get(header::LOCATION) {
                let location = match location.to_str().ok().and_then(|l| self.url.join(l).ok()) {
                    Some(location) => location,
                    None => return TransportEvent::Failed(NetError::InvalidRedirect),
                };
                self.prepare_redirect(parts.status, location.clone());
                return TransportEvent::Redirect { head, location };
            }
        }

        self.load_state.set(LoadState::ReadingResponse);
        self.state = State::ReadBody(body);
        TransportEvent::ResponseStarted(head)
    }

    fn prepare_redirect(&mut self, status: StatusCode, location: Url) {
        let to_get = match status.as_u16() {
            303 => self.method != Method::HEAD,
            301 | 302 => self.method == Method::POST,
            _ => false,
        };
        if to_get {
            self.method = Method::GET;
            self.upload = None;
            for name in [
                header::CONTENT_TYPE,
                header::CONTENT_LENGTH,
                header::CONTENT_ENCODING,
                header::CONTENT_LANGUAGE,
            ] {
                self.headers.remove(name);
            }
        } else if let Some(upload) = &self.upload {
            upload.reset();
        }
        tracing::debug!(from = %self.url, to = %location, status = status.as_u16(), "redirect");
        self.url = location;
        self.attempts = 0;
        self.sender = None;
        self.state = State::Connect;
    }
}

fn empty_body() -> RequestBody {
    Empty::<Bytes>::new()
        .map_err(|never: std::convert::Infallible| -> BoxError { match never {} })
        .boxed_unsync()
}

fn upload_body(
    upload: UploadDataStream,
    chunk_size: usize,
    load_state: LoadStateReporter,
) -> RequestBody {
    let frames = stream::unfold(Some(upload), move |upload| {
        let load_state = load_state.clone();
        async move {
            let upload = upload?;
            match upload.read(chunk_size).await {
                Ok(chunk) => {
                    let next = if chunk.final_chunk {
                        load_state.set(LoadState::WaitingForResponse);
                        None
                    } else {
                        Some(upload)
                    };
                    Some((Ok(Frame::data(chunk.data)), next))
                }
                Err(e) => Some((Err(BoxError::from(e)), None)),
            }
        }
    });
    StreamBody::new(frames).boxed_unsync()
}
