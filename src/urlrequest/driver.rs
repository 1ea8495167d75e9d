//! Network-side half of a URL request.
//!
//! One `RequestDriver` task per started request runs on the engine's network
//! runtime. It consumes the transport's event stream only when the
//! application is ready for the next step, buffers body bytes between reads
//! and posts every callback through the request's task queue.

use super::builder::ValidatedRequest;
use super::callback::RequestEvent;
use super::info::UrlResponseInfo;
use super::request::{Phase, UrlRequest};
use super::terminal::Outcome;
use crate::base::buffer::ByteBuffer;
use crate::base::neterror::NetError;
use crate::transport::{LoadStateReporter, ResponseHead, TransportEvent, TransportRequest};
use crate::upload::UploadDataStream;
use bytes::{Buf, Bytes};
use futures::stream::{BoxStream, StreamExt};
use std::collections::VecDeque;
use tokio::sync::mpsc;

/// Application requests forwarded to the driver.
#[derive(Debug)]
pub(crate) enum Command {
    Read(ByteBuffer),
    FollowRedirect,
    /// The terminal slot was already claimed by `cancel()`.
    Cancel,
    /// A callback failed.
    Fail(NetError),
}

enum Next {
    Command(Option<Command>),
    Event(Option<TransportEvent>),
}

enum Finish {
    Succeeded,
    Failed(NetError),
    Canceled,
}

pub(crate) struct RequestDriver {
    request: UrlRequest,
    commands: mpsc::UnboundedReceiver<Command>,
    pending: Option<TransportRequest>,
    events: Option<BoxStream<'static, TransportEvent>>,
    upload: Option<UploadDataStream>,
    url_chain: Vec<String>,
    info: Option<UrlResponseInfo>,
    received: u64,
    redirects: usize,
    max_redirects: usize,
    awaiting_follow: bool,
    body: VecDeque<Bytes>,
    body_done: bool,
    pending_read: Option<ByteBuffer>,
    finished: bool,
}

impl RequestDriver {
    pub(crate) fn new(
        request: UrlRequest,
        commands: mpsc::UnboundedReceiver<Command>,
        validated: ValidatedRequest,
        upload: Option<UploadDataStream>,
        load_state: LoadStateReporter,
    ) -> Self {
        let max_redirects = request.inner.engine.config().max_redirects;
        let url_chain = vec![validated.url.to_string()];
        let pending = TransportRequest {
            url: validated.url,
            method: validated.method,
            headers: validated.headers,
            upload: upload.clone(),
            stream: None,
            load_state,
        };
        Self {
            request,
            commands,
            pending: Some(pending),
            events: None,
            upload,
            url_chain,
            info: None,
            received: 0,
            redirects: 0,
            max_redirects,
            awaiting_follow: false,
            body: VecDeque::new(),
            body_done: false,
            pending_read: None,
            finished: false,
        }
    }

    fn id(&self) -> u64 {
        self.request.inner.id
    }

    pub(crate) async fn run(mut self) {
        if let Some(upload) = self.upload.clone() {
            // Length is needed before the first byte goes out.
            let length = upload.query_length();
            tokio::pin!(length);
            loop {
                tokio::select! {
                    biased;
                    cmd = self.commands.recv() => {
                        self.on_command(cmd);
                        if self.finished {
                            return;
                        }
                    }
                    result = &mut length => {
                        if let Err(e) = result {
                            self.finish(Finish::Failed(e.into()));
                            return;
                        }
                        break;
                    }
                }
            }
        }

        if let Some(request) = self.pending.take() {
            let transport = self.request.inner.engine.transport();
            self.events = Some(transport.open(request));
        }

        while !self.finished {
            let poll_transport = self.wants_transport_event();
            let next = tokio::select! {
                biased;
                cmd = self.commands.recv() => Next::Command(cmd),
                event = next_event(&mut self.events), if poll_transport => Next::Event(event),
            };
            match next {
                Next::Command(cmd) => self.on_command(cmd),
                Next::Event(event) => self.on_transport_event(event),
            }
        }
    }

    /// The transport is only polled when its next event could be delivered:
    /// never while a redirect waits for `follow_redirect()`, and during the
    /// body only when a read is waiting on an empty buffer queue.
    fn wants_transport_event(&self) -> bool {
        if self.awaiting_follow || self.body_done {
            return false;
        }
        self.info.is_none() || (self.pending_read.is_some() && self.body.is_empty())
    }

    fn on_command(&mut self, cmd: Option<Command>) {
        match cmd {
            Some(Command::Read(buffer)) => {
                self.pending_read = Some(buffer);
                self.complete_read();
            }
            Some(Command::FollowRedirect) => {
                tracing::debug!(request_id = self.id(), redirects = self.redirects, "following redirect");
                self.awaiting_follow = false;
            }
            Some(Command::Cancel) | None => self.finish(Finish::Canceled),
            Some(Command::Fail(error)) => self.finish(Finish::Failed(error)),
        }
    }

    fn on_transport_event(&mut self, event: Option<TransportEvent>) {
        let Some(event) = event else {
            // Stream ended without an explicit Done.
            if self.info.is_none() {
                self.finish(Finish::Failed(NetError::EmptyResponse));
            } else {
                self.body_done = true;
                self.complete_read();
            }
            return;
        };

        match event {
            TransportEvent::Redirect { head, location } => {
                self.redirects += 1;
                if self.redirects > self.max_redirects {
                    self.finish(Finish::Failed(NetError::TooManyRedirects));
                    return;
                }
                let info = self.snapshot(&head);
                self.url_chain.push(location.to_string());
                self.awaiting_follow = true;
                self.request.set_phase(Phase::AwaitingFollow);
                self.post(RequestEvent::RedirectReceived {
                    info,
                    new_location: location.to_string(),
                });
            }
            TransportEvent::ResponseStarted(head) => {
                let info = self.snapshot(&head);
                self.info = Some(info.clone());
                self.request.set_phase(Phase::AwaitingRead);
                self.post(RequestEvent::ResponseStarted { info });
            }
            TransportEvent::Data(data) => {
                if self.info.is_none() {
                    self.finish(Finish::Failed(NetError::InvalidResponse));
                    return;
                }
                if !data.is_empty() {
                    self.body.push_back(data);
                }
                self.complete_read();
            }
            TransportEvent::Done => {
                self.body_done = true;
                self.complete_read();
            }
            TransportEvent::Failed(error) => self.finish(Finish::Failed(error)),
            TransportEvent::Canceled => self.finish(Finish::Canceled),
            // Unary requests have no write side, and trailers are not surfaced.
            TransportEvent::StreamReady | TransportEvent::Trailers(_) => {}
        }
    }

    fn snapshot(&self, head: &ResponseHead) -> UrlResponseInfo {
        UrlResponseInfo::from_head(self.url_chain.clone(), head, self.received)
    }

    /// Satisfy the pending read from buffered body bytes, or succeed if the
    /// body is exhausted.
    fn complete_read(&mut self) {
        let Some(mut buffer) = self.pending_read.take() else {
            return;
        };

        if let Some(front) = self.body.front_mut() {
            let n = buffer.put(&front[..]);
            front.advance(n);
            if front.is_empty() {
                self.body.pop_front();
            }
            self.received += n as u64;
            let Some(info) = self.info.as_mut() else {
                return;
            };
            info.set_received_byte_count(self.received);
            let info = info.clone();
            self.request.set_phase(Phase::AwaitingRead);
            self.post(RequestEvent::ReadCompleted { info, buffer });
        } else if self.body_done {
            self.finish(Finish::Succeeded);
        } else {
            self.pending_read = Some(buffer);
        }
    }

    fn post(&mut self, event: RequestEvent) {
        let request = self.request.clone();
        if let Err(e) = self
            .request
            .inner
            .queue
            .post(Box::new(move || request.deliver(event)))
        {
            self.finish(Finish::Failed(e));
        }
    }

    fn finish(&mut self, finish: Finish) {
        if self.finished {
            return;
        }
        self.finished = true;

        let outcome = match &finish {
            Finish::Succeeded => Outcome::Succeeded,
            Finish::Failed(_) => Outcome::Failed,
            Finish::Canceled => Outcome::Canceled,
        };
        // Losing the claim means cancel() got there first.
        let won = self.request.inner.terminal.claim(outcome);

        self.events = None;
        self.pending = None;
        self.pending_read = None;
        self.body.clear();
        if let Some(upload) = self.upload.take() {
            upload.close();
        }
        self.request.inner.engine.unregister(self.id());
        self.request.set_phase(Phase::Finished);

        let info = self.info.clone();
        let event = match finish {
            _ if !won => RequestEvent::Canceled { info },
            Finish::Succeeded => match info {
                Some(info) => RequestEvent::Succeeded { info },
                None => RequestEvent::Failed {
                    info: None,
                    error: NetError::EmptyResponse,
                },
            },
            Finish::Failed(error) => RequestEvent::Failed { info, error },
            Finish::Canceled => RequestEvent::Canceled { info },
        };
        tracing::debug!(request_id = self.id(), outcome = event.name(), "request finished");
        self.post_terminal(event);
    }

    fn post_terminal(&self, event: RequestEvent) {
        let queue = &self.request.inner.queue;
        let retry = event.clone_terminal();
        let request = self.request.clone();
        if queue.post(Box::new(move || request.deliver(event))).is_ok() {
            return;
        }
        // The terminal callback must still reach the application, even
        // through an executor that refuses queued or inline work.
        let Some(event) = retry else {
            return;
        };
        let request = self.request.clone();
        if let Err(e) = queue.post_unchecked(Box::new(move || request.deliver(event))) {
            tracing::error!(request_id = self.id(), error = %e, "terminal callback lost");
        }
    }
}

async fn next_event(events: &mut Option<BoxStream<'static, TransportEvent>>) -> Option<TransportEvent> {
    match events {
        Some(events) => events.next().await,
        None => futures::future::pending().await,
    }
}
