//! Network-side half of a bidirectional stream.

use super::callback::StreamEvent;
use super::stream::{BidirectionalStream, ReadPhase};
use crate::base::buffer::ByteBuffer;
use crate::base::neterror::NetError;
use crate::transport::{
    LoadStateReporter, StreamWrites, TransportEvent, TransportRequest, WriteFrame,
};
use crate::urlrequest::terminal::Outcome;
use crate::urlrequest::{UrlResponseInfo, ValidatedRequest};
use bytes::{Buf, Bytes};
use futures::stream::{BoxStream, StreamExt};
use http::{HeaderMap, Method};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;

#[derive(Debug)]
pub(crate) enum StreamCommand {
    Read(ByteBuffer),
    /// Buffers written since the last flush, with their end-of-stream flag.
    Flush(Vec<(ByteBuffer, bool)>),
    Cancel,
    Fail(NetError),
    /// Every callback queued before the success check has returned.
    Succeed,
}

enum Next {
    Command(Option<StreamCommand>),
    Ack(Option<()>),
    Event(Option<TransportEvent>),
}

enum Finish {
    Succeeded,
    Failed(NetError),
    Canceled,
}

pub(crate) struct StreamDriver {
    stream: BidirectionalStream,
    commands: mpsc::UnboundedReceiver<StreamCommand>,
    pending: Option<TransportRequest>,
    events: Option<BoxStream<'static, TransportEvent>>,
    frames: Option<mpsc::UnboundedSender<WriteFrame>>,
    acks: Option<mpsc::UnboundedReceiver<()>>,
    url: String,
    info: Option<UrlResponseInfo>,
    received: u64,
    stream_ready: bool,
    /// Flushed, waiting for the stream to become ready.
    flushed: VecDeque<(ByteBuffer, bool)>,
    /// Handed to the transport, waiting for acknowledgement.
    in_flight: VecDeque<(ByteBuffer, bool)>,
    writes_done: bool,
    body: VecDeque<Bytes>,
    body_done: bool,
    read_done: bool,
    pending_read: Option<ByteBuffer>,
    /// A success check is queued behind the last read or write callback.
    success_posted: bool,
    finished: bool,
}

impl StreamDriver {
    pub(crate) fn new(
        stream: BidirectionalStream,
        commands: mpsc::UnboundedReceiver<StreamCommand>,
        validated: ValidatedRequest,
        delay_headers_until_flush: bool,
        load_state: LoadStateReporter,
    ) -> Self {
        let writes_done = validated.method == Method::GET || validated.method == Method::HEAD;
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (acks_tx, acks_rx) = mpsc::unbounded_channel();
        let url = validated.url.to_string();
        let pending = TransportRequest {
            url: validated.url,
            method: validated.method,
            headers: validated.headers,
            upload: None,
            stream: Some(StreamWrites {
                frames: frames_rx,
                acks: acks_tx,
                delay_headers_until_flush,
            }),
            load_state,
        };
        Self {
            stream,
            commands,
            pending: Some(pending),
            events: None,
            // GET and HEAD never write, so the write side is closed up front.
            frames: (!writes_done).then_some(frames_tx),
            acks: Some(acks_rx),
            url,
            info: None,
            received: 0,
            stream_ready: false,
            flushed: VecDeque::new(),
            in_flight: VecDeque::new(),
            writes_done,
            body: VecDeque::new(),
            body_done: false,
            read_done: false,
            pending_read: None,
            success_posted: false,
            finished: false,
        }
    }

    fn id(&self) -> u64 {
        self.stream.inner.id
    }

    pub(crate) async fn run(mut self) {
        if let Some(request) = self.pending.take() {
            let transport = self.stream.inner.engine.transport();
            self.events = Some(transport.open(request));
        }

        while !self.finished {
            let poll_transport = self.wants_transport_event();
            let next = tokio::select! {
                biased;
                cmd = self.commands.recv() => Next::Command(cmd),
                ack = next_ack(&mut self.acks) => Next::Ack(ack),
                event = next_event(&mut self.events), if poll_transport => Next::Event(event),
            };
            match next {
                Next::Command(cmd) => self.on_command(cmd),
                Next::Ack(Some(())) => self.write_completed(),
                Next::Ack(None) => self.acks_closed(),
                Next::Event(event) => {
                    self.drain_acks();
                    if !self.finished {
                        self.on_transport_event(event);
                    }
                }
            }
        }
    }

    /// Frames the network took before this event was produced complete
    /// ahead of it.
    fn drain_acks(&mut self) {
        while !self.finished {
            let Some(acks) = self.acks.as_mut() else {
                return;
            };
            match acks.try_recv() {
                Ok(()) => self.write_completed(),
                Err(_) => return,
            }
        }
    }

    /// Response bytes are pulled only for a waiting read, so a paused
    /// reader buffers at most one chunk.
    fn wants_transport_event(&self) -> bool {
        if self.events.is_none() || self.body_done {
            return false;
        }
        self.info.is_none() || (self.pending_read.is_some() && self.body.is_empty())
    }

    fn on_command(&mut self, cmd: Option<StreamCommand>) {
        match cmd {
            Some(StreamCommand::Read(buffer)) => {
                self.pending_read = Some(buffer);
                self.complete_read();
            }
            Some(StreamCommand::Flush(batch)) => {
                self.flushed.extend(batch);
                if self.stream_ready {
                    self.send_flushed();
                }
            }
            Some(StreamCommand::Cancel) | None => self.finish(Finish::Canceled),
            Some(StreamCommand::Fail(error)) => self.finish(Finish::Failed(error)),
            Some(StreamCommand::Succeed) => self.finish(Finish::Succeeded),
        }
    }

    fn on_transport_event(&mut self, event: Option<TransportEvent>) {
        let Some(event) = event else {
            self.events = None;
            if self.info.is_none() {
                self.finish(Finish::Failed(NetError::EmptyResponse));
            } else if !self.body_done {
                self.body_done = true;
                self.complete_read();
            }
            return;
        };

        match event {
            TransportEvent::StreamReady => {
                self.stream_ready = true;
                self.post(StreamEvent::StreamReady);
                self.send_flushed();
            }
            TransportEvent::ResponseStarted(head) => {
                let info = UrlResponseInfo::from_head(vec![self.url.clone()], &head, self.received);
                self.info = Some(info.clone());
                self.stream.set_read_phase(ReadPhase::AwaitingRead);
                self.post(StreamEvent::ResponseHeadersReceived { info });
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
            TransportEvent::Trailers(trailers) => {
                let Some(info) = self.info.clone() else {
                    self.finish(Finish::Failed(NetError::InvalidResponse));
                    return;
                };
                self.post(StreamEvent::ResponseTrailersReceived {
                    info,
                    trailers: header_list(&trailers),
                });
            }
            TransportEvent::Done => {
                self.body_done = true;
                self.complete_read();
            }
            TransportEvent::Failed(error) => self.finish(Finish::Failed(error)),
            TransportEvent::Canceled => self.finish(Finish::Canceled),
            // Streams are never redirected.
            TransportEvent::Redirect { .. } => {
                self.finish(Finish::Failed(NetError::InvalidResponse));
            }
        }
    }

    fn send_flushed(&mut self) {
        let Some(frames) = self.frames.as_ref() else {
            return;
        };
        let mut closed = false;
        while let Some((buffer, end_of_stream)) = self.flushed.pop_front() {
            let data = Bytes::copy_from_slice(buffer.remaining_slice());
            closed |= frames
                .send(WriteFrame {
                    data,
                    end_of_stream,
                })
                .is_err();
            self.in_flight.push_back((buffer, end_of_stream));
            self.stream.inner.flushing.fetch_sub(1, Ordering::SeqCst);
        }
        if closed {
            self.finish(Finish::Failed(NetError::ConnectionClosed));
        }
    }

    /// The transport dropped its write side; nothing still in flight can be
    /// acknowledged any more.
    fn acks_closed(&mut self) {
        self.acks = None;
        if !self.in_flight.is_empty() {
            self.finish(Finish::Failed(NetError::ConnectionClosed));
        }
    }

    fn write_completed(&mut self) {
        let Some((mut buffer, end_of_stream)) = self.in_flight.pop_front() else {
            tracing::warn!(stream_id = self.id(), "write acknowledged with nothing in flight");
            return;
        };
        let limit = buffer.limit();
        buffer.set_position(limit);
        if end_of_stream {
            self.writes_done = true;
        }
        self.post(StreamEvent::WriteCompleted {
            info: self.info.clone(),
            buffer,
            end_of_stream,
        });
        self.maybe_succeed();
    }

    fn complete_read(&mut self) {
        let Some(mut buffer) = self.pending_read.take() else {
            return;
        };
        let Some(info) = self.info.as_mut() else {
            self.pending_read = Some(buffer);
            return;
        };

        if let Some(front) = self.body.front_mut() {
            let n = buffer.put(&front[..]);
            front.advance(n);
            if front.is_empty() {
                self.body.pop_front();
            }
            self.received += n as u64;
            info.set_received_byte_count(self.received);
            let info = info.clone();
            self.stream.set_read_phase(ReadPhase::AwaitingRead);
            self.post(StreamEvent::ReadCompleted {
                info,
                buffer,
                end_of_stream: false,
            });
        } else if self.body_done {
            let info = info.clone();
            self.read_done = true;
            self.stream.set_read_phase(ReadPhase::Done);
            self.post(StreamEvent::ReadCompleted {
                info,
                buffer,
                end_of_stream: true,
            });
            self.maybe_succeed();
        } else {
            self.pending_read = Some(buffer);
        }
    }

    /// Succeed once both directions are complete. The claim is made by a
    /// task queued behind the final read or write callback, so an error or
    /// `cancel()` raised by that callback still decides the outcome.
    fn maybe_succeed(&mut self) {
        if self.success_posted
            || !(self.read_done
                && self.writes_done
                && self.in_flight.is_empty()
                && self.flushed.is_empty())
        {
            return;
        }
        self.success_posted = true;
        let stream = self.stream.clone();
        if let Err(e) = self
            .stream
            .inner
            .queue
            .post(Box::new(move || stream.send(StreamCommand::Succeed)))
        {
            self.finish(Finish::Failed(e));
        }
    }

    fn post(&mut self, event: StreamEvent) {
        if self.finished {
            return;
        }
        let stream = self.stream.clone();
        if let Err(e) = self
            .stream
            .inner
            .queue
            .post(Box::new(move || stream.deliver(event)))
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
        let won = self.stream.inner.terminal.claim(outcome);

        self.events = None;
        self.frames = None;
        self.acks = None;
        self.pending = None;
        self.pending_read = None;
        self.body.clear();
        let unsent = self.flushed.len();
        self.flushed.clear();
        self.stream.inner.flushing.fetch_sub(unsent, Ordering::SeqCst);
        self.in_flight.clear();
        self.stream.inner.engine.unregister(self.id());
        self.stream.set_read_phase(ReadPhase::Done);

        let info = self.info.clone();
        let event = match finish {
            _ if !won => StreamEvent::Canceled { info },
            Finish::Succeeded => match info {
                Some(info) => StreamEvent::Succeeded { info },
                None => StreamEvent::Failed {
                    info: None,
                    error: NetError::EmptyResponse,
                },
            },
            Finish::Failed(error) => StreamEvent::Failed { info, error },
            Finish::Canceled => StreamEvent::Canceled { info },
        };
        tracing::debug!(stream_id = self.id(), outcome = event.name(), "stream finished");

        let queue = &self.stream.inner.queue;
        let retry = event.clone_terminal();
        let stream = self.stream.clone();
        if queue.post(Box::new(move || stream.deliver(event))).is_ok() {
            return;
        }
        let Some(event) = retry else {
            return;
        };
        let stream = self.stream.clone();
        if let Err(e) = queue.post_unchecked(Box::new(move || stream.deliver(event))) {
            tracing::error!(stream_id = self.id(), error = %e, "terminal callback lost");
        }
    }
}

fn header_list(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

async fn next_ack(acks: &mut Option<mpsc::UnboundedReceiver<()>>) -> Option<()> {
    match acks {
        Some(acks) => acks.recv().await,
        None => futures::future::pending().await,
    }
}

async fn next_event(
    events: &mut Option<BoxStream<'static, TransportEvent>>,
) -> Option<TransportEvent> {
    match events {
        Some(events) => events.next().await,
        None => futures::future::pending().await,
    }
}
