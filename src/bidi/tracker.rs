//! A recording [`BidirectionalStreamCallback`].
//!
//! `StreamTracker` writes a prepared list of buffers, flushing where asked,
//! reads the response to its end and checks that every write comes back in
//! the order it was submitted.

use super::callback::{BidirectionalStreamCallback, StreamEvent};
use super::stream::BidirectionalStream;
use crate::base::buffer::ByteBuffer;
use crate::base::neterror::{BoxError, NetError};
use crate::executor::current_task_owner;
use crate::urlrequest::{FailureType, UrlResponseInfo};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{watch, Notify};

const DEFAULT_READ_BUFFER_SIZE: usize = 32 * 1024;

/// Last event a stream tracker saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamStep {
    NotStarted,
    OnStreamReady,
    OnResponseStarted,
    OnReadCompleted,
    OnWriteCompleted,
    OnTrailers,
    OnSucceeded,
    OnFailed,
    OnCanceled,
}

impl StreamStep {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamStep::OnSucceeded | StreamStep::OnFailed | StreamStep::OnCanceled
        )
    }
}

struct PendingWrite {
    data: Vec<u8>,
    flush: bool,
}

#[derive(Clone)]
pub struct StreamTracker {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<TrackerState>,
    step_changed: Notify,
    done: watch::Sender<bool>,
    released: Mutex<bool>,
    release_signal: Condvar,
}

struct TrackerState {
    read_buffer_size: usize,
    failure: Option<(StreamStep, FailureType)>,
    block_on_terminal: bool,

    step: StreamStep,
    steps: Vec<StreamStep>,
    stream_ready: bool,
    response_started: bool,
    read_ended: bool,
    write_queue: VecDeque<PendingWrite>,
    to_be_acked: VecDeque<u64>,
    written: Vec<u8>,
    write_completed_count: usize,
    response_info: Option<UrlResponseInfo>,
    trailers: Vec<(String, String)>,
    body: Vec<u8>,
    read_start: Option<usize>,
    read_completed_count: usize,
    error: Option<NetError>,
    violations: Vec<String>,
}

impl Default for StreamTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamTracker {
    pub fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(TrackerState {
                    read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
                    failure: None,
                    block_on_terminal: false,
                    step: StreamStep::NotStarted,
                    steps: Vec::new(),
                    stream_ready: false,
                    response_started: false,
                    read_ended: false,
                    write_queue: VecDeque::new(),
                    to_be_acked: VecDeque::new(),
                    written: Vec::new(),
                    write_completed_count: 0,
                    response_info: None,
                    trailers: Vec::new(),
                    body: Vec::new(),
                    read_start: None,
                    read_completed_count: 0,
                    error: None,
                    violations: Vec::new(),
                }),
                step_changed: Notify::new(),
                done,
                released: Mutex::new(false),
                release_signal: Condvar::new(),
            }),
        }
    }

    /// Queue `data` for writing once the stream is ready. With `flush` set
    /// the tracker flushes after writing it and waits for every outstanding
    /// write to complete before writing more. The last queued buffer carries
    /// end of stream.
    pub fn add_write_data(&self, data: impl Into<Vec<u8>>, flush: bool) {
        self.shared.state.lock().write_queue.push_back(PendingWrite {
            data: data.into(),
            flush,
        });
    }

    pub fn with_read_buffer_size(self, size: usize) -> Self {
        self.shared.state.lock().read_buffer_size = size.max(1);
        self
    }

    pub fn with_failure(self, step: StreamStep, failure: FailureType) -> Self {
        self.shared.state.lock().failure = Some((step, failure));
        self
    }

    pub fn with_blocking_terminal(self) -> Self {
        self.shared.state.lock().block_on_terminal = true;
        self
    }

    pub fn release_terminal(&self) {
        *self.shared.released.lock() = true;
        self.shared.release_signal.notify_all();
    }

    pub async fn wait_for_next_step(&self) {
        self.shared.step_changed.notified().await;
    }

    pub async fn done(&self) {
        let mut rx = self.shared.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    pub fn is_done(&self) -> bool {
        *self.shared.done.borrow()
    }

    /// Write queued buffers up to and including the next one marked for
    /// flushing, then flush.
    pub fn start_next_write(&self, stream: &BidirectionalStream) -> Result<(), NetError> {
        loop {
            let (buffer, end_of_stream, flush) = {
                let mut state = self.shared.state.lock();
                let Some(next) = state.write_queue.pop_front() else {
                    break;
                };
                let buffer = ByteBuffer::wrap(next.data);
                state.to_be_acked.push_back(buffer.id());
                (buffer, state.write_queue.is_empty(), next.flush)
            };
            stream.write(buffer, end_of_stream)?;
            if flush || end_of_stream {
                break;
            }
        }
        stream.flush();
        Ok(())
    }

    pub fn start_next_read(&self, stream: &BidirectionalStream) -> Result<(), NetError> {
        let size = self.shared.state.lock().read_buffer_size;
        self.start_next_read_with(stream, ByteBuffer::allocate(size))
    }

    pub fn start_next_read_with(
        &self,
        stream: &BidirectionalStream,
        buffer: ByteBuffer,
    ) -> Result<(), NetError> {
        let start = buffer.position();
        self.shared.state.lock().read_start = Some(start);
        stream.read(buffer)
    }

    pub fn response_step(&self) -> StreamStep {
        self.shared.state.lock().step
    }

    pub fn steps(&self) -> Vec<StreamStep> {
        self.shared.state.lock().steps.clone()
    }

    pub fn response_info(&self) -> Option<UrlResponseInfo> {
        self.shared.state.lock().response_info.clone()
    }

    pub fn trailers(&self) -> Vec<(String, String)> {
        self.shared.state.lock().trailers.clone()
    }

    pub fn response_bytes(&self) -> Vec<u8> {
        self.shared.state.lock().body.clone()
    }

    pub fn response_as_string(&self) -> String {
        String::from_utf8_lossy(&self.shared.state.lock().body).into_owned()
    }

    /// Bytes of every acknowledged write, in acknowledgement order.
    pub fn written_bytes(&self) -> Vec<u8> {
        self.shared.state.lock().written.clone()
    }

    pub fn write_completed_count(&self) -> usize {
        self.shared.state.lock().write_completed_count
    }

    pub fn read_completed_count(&self) -> usize {
        self.shared.state.lock().read_completed_count
    }

    pub fn error(&self) -> Option<NetError> {
        self.shared.state.lock().error.clone()
    }

    pub fn violations(&self) -> Vec<String> {
        self.shared.state.lock().violations.clone()
    }

    fn record(&self, stream: &BidirectionalStream, step: StreamStep, legal: bool) {
        let mut state = self.shared.state.lock();
        if current_task_owner() != Some(stream.id()) {
            state.violations.push(format!(
                "{:?} for stream {} ran outside its task queue",
                step,
                stream.id()
            ));
        }
        let previous = state.step;
        if !legal || previous.is_terminal() {
            state
                .violations
                .push(format!("{:?} after {:?}", step, previous));
        }
        state.step = step;
        state.steps.push(step);
    }

    fn inject_failure(
        &self,
        stream: &BidirectionalStream,
        step: StreamStep,
    ) -> Result<bool, BoxError> {
        let failure = match self.shared.state.lock().failure {
            Some((at, failure)) if at == step => failure,
            _ => return Ok(false),
        };
        match failure {
            FailureType::CancelSync => {
                stream.cancel();
                Ok(true)
            }
            FailureType::CancelAsync | FailureType::CancelAsyncWithoutPause => {
                let stream = stream.clone();
                std::thread::spawn(move || stream.cancel());
                Ok(failure == FailureType::CancelAsync)
            }
            FailureType::ThrowSync => Err(format!("Callback exception at {:?}", step).into()),
        }
    }

    fn finish(&self) {
        let block = self.shared.state.lock().block_on_terminal;
        self.shared.done.send_replace(true);
        self.shared.step_changed.notify_one();
        if block {
            let mut released = self.shared.released.lock();
            while !*released {
                self.shared.release_signal.wait(&mut released);
            }
        }
    }

    fn advance(&self, stream: &BidirectionalStream, event: StreamEvent) -> Result<(), BoxError> {
        match event {
            StreamEvent::StreamReady => {
                let legal = self.shared.state.lock().step == StreamStep::NotStarted;
                self.record(stream, StreamStep::OnStreamReady, legal);
                self.shared.state.lock().stream_ready = true;
                if self.inject_failure(stream, StreamStep::OnStreamReady)? {
                    return Ok(());
                }
                self.start_next_write(stream)?;
            }
            StreamEvent::ResponseHeadersReceived { info } => {
                let legal = {
                    let state = self.shared.state.lock();
                    state.stream_ready && !state.response_started
                };
                self.record(stream, StreamStep::OnResponseStarted, legal);
                {
                    let mut state = self.shared.state.lock();
                    state.response_started = true;
                    state.response_info = Some(info);
                }
                if self.inject_failure(stream, StreamStep::OnResponseStarted)? {
                    return Ok(());
                }
                self.start_next_read(stream)?;
            }
            StreamEvent::ReadCompleted {
                info,
                mut buffer,
                end_of_stream,
            } => {
                let legal = {
                    let state = self.shared.state.lock();
                    state.response_started && !state.read_ended
                };
                self.record(stream, StreamStep::OnReadCompleted, legal);
                {
                    let mut state = self.shared.state.lock();
                    let start = state.read_start.take().unwrap_or(0);
                    let end = buffer.position();
                    if end > start {
                        state.body.extend_from_slice(buffer.contents(start, end));
                    }
                    state.read_completed_count += 1;
                    state.read_ended = end_of_stream;
                    state.response_info = Some(info);
                }
                if self.inject_failure(stream, StreamStep::OnReadCompleted)? {
                    return Ok(());
                }
                if !end_of_stream {
                    buffer.clear();
                    self.start_next_read_with(stream, buffer)?;
                }
            }
            StreamEvent::WriteCompleted { info, buffer, .. } => {
                let legal = self.shared.state.lock().stream_ready;
                self.record(stream, StreamStep::OnWriteCompleted, legal);
                let drained = {
                    let mut state = self.shared.state.lock();
                    match state.to_be_acked.pop_front() {
                        Some(id) if id == buffer.id() => {}
                        expected => state.violations.push(format!(
                            "write completed for buffer {} but expected {:?}",
                            buffer.id(),
                            expected
                        )),
                    }
                    if buffer.has_remaining() {
                        state
                            .violations
                            .push(format!("buffer {} returned unconsumed", buffer.id()));
                    }
                    state.written.extend_from_slice(buffer.contents(0, buffer.limit()));
                    state.write_completed_count += 1;
                    if info.is_some() {
                        state.response_info = info;
                    }
                    state.to_be_acked.is_empty()
                };
                if self.inject_failure(stream, StreamStep::OnWriteCompleted)? {
                    return Ok(());
                }
                if drained {
                    self.start_next_write(stream)?;
                }
            }
            StreamEvent::ResponseTrailersReceived { trailers, .. } => {
                let legal = self.shared.state.lock().response_started;
                self.record(stream, StreamStep::OnTrailers, legal);
                self.shared.state.lock().trailers = trailers;
                if self.inject_failure(stream, StreamStep::OnTrailers)? {
                    return Ok(());
                }
            }
            StreamEvent::Succeeded { info } => {
                let legal = {
                    let state = self.shared.state.lock();
                    state.read_ended && state.to_be_acked.is_empty()
                };
                self.record(stream, StreamStep::OnSucceeded, legal);
                self.shared.state.lock().response_info = Some(info);
                self.finish();
            }
            StreamEvent::Failed { info, error } => {
                self.record(stream, StreamStep::OnFailed, true);
                {
                    let mut state = self.shared.state.lock();
                    if info.is_some() {
                        state.response_info = info;
                    }
                    state.error = Some(error);
                }
                self.finish();
            }
            StreamEvent::Canceled { info } => {
                self.record(stream, StreamStep::OnCanceled, true);
                if info.is_some() {
                    self.shared.state.lock().response_info = info;
                }
                self.finish();
            }
        }
        Ok(())
    }
}

impl BidirectionalStreamCallback for StreamTracker {
    fn on_event(
        &mut self,
        stream: &BidirectionalStream,
        event: StreamEvent,
    ) -> Result<(), BoxError> {
        let terminal = event.is_terminal();
        let result = self.advance(stream, event);
        if !terminal {
            self.shared.step_changed.notify_one();
        }
        result
    }
}

impl std::fmt::Debug for StreamTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("StreamTracker")
            .field("step", &state.step)
            .field("writes_completed", &state.write_completed_count)
            .field("body_len", &state.body.len())
            .field("error", &state.error)
            .finish()
    }
}
