use super::provider::{RewindSink, UploadDataProvider, UploadDataSink};
use super::UploadError;
use crate::base::buffer::ByteBuffer;
use crate::base::neterror::BoxError;
use crate::executor::{Executor, Task, TaskQueue};
use bytes::Bytes;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

type SharedProvider = Arc<Mutex<Box<dyn UploadDataProvider>>>;
type InitWaiter = oneshot::Sender<Result<(), UploadError>>;
type ReadReply = oneshot::Sender<Result<UploadChunk, UploadError>>;

/// One slice of body data handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadChunk {
    pub data: Bytes,
    /// No more data follows.
    pub final_chunk: bool,
}

/// Outcome of [`UploadDataStream::init`].
#[derive(Debug)]
pub enum InitStatus {
    /// The body can be read from its start right away.
    Ready,
    /// A read or rewind has to settle first.
    Pending(PendingInit),
}

/// Resolves when a pending [`UploadDataStream::init`] is ready.
#[derive(Debug)]
pub struct PendingInit {
    rx: oneshot::Receiver<Result<(), UploadError>>,
}

impl Future for PendingInit {
    type Output = Result<(), UploadError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(UploadError::Destroyed)))
    }
}

impl InitStatus {
    /// Wait until the stream is ready, whichever way `init` answered.
    pub async fn ready(self) -> Result<(), UploadError> {
        match self {
            InitStatus::Ready => Ok(()),
            InitStatus::Pending(pending) => pending.await,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, InitStatus::Ready)
    }
}

/// Engine-side view of a request body.
///
/// Consumers `read` the body chunk by chunk. To send it again (redirect,
/// retry) they `reset` and then `init`, which rewinds the provider only if
/// it already delivered bytes, and only once however many `reset`/`init`
/// pairs arrive while that rewind is outstanding. A read still in flight at
/// `reset` is discarded when it lands and does not count as consumption.
///
/// Clones share state. Provider completions that arrive after the last
/// clone is dropped are ignored.
#[derive(Clone)]
pub struct UploadDataStream {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    state: Mutex<State>,
    provider: SharedProvider,
    queue: TaskQueue,
    buffer_size: usize,
}

#[derive(Default)]
struct State {
    /// Outer `None` until the provider was asked; inner `None` means chunked.
    length: Option<Option<u64>>,
    position: u64,
    /// Bytes were delivered since the last rewind.
    dirty: bool,
    eof: bool,
    next_op: u64,
    read: Option<PendingRead>,
    rewind: Option<u64>,
    in_call: Option<u64>,
    dropped_in_call: Option<u64>,
    init_waiters: Vec<InitWaiter>,
    buffer: Option<ByteBuffer>,
    failed: Option<UploadError>,
    closing: bool,
    closed: bool,
    rewinds: u64,
}

struct PendingRead {
    op: u64,
    /// `None` once a reset made this read stale.
    reply: Option<ReadReply>,
}

#[derive(Clone, Copy)]
enum OpKind {
    Read,
    Rewind,
}

enum Followup {
    Nothing,
    Resolve(Vec<InitWaiter>, Result<(), UploadError>),
    Rewind(u64),
    Close,
}

impl State {
    fn next_op(&mut self) -> u64 {
        self.next_op += 1;
        self.next_op
    }

    fn begin_rewind(&mut self) -> u64 {
        let op = self.next_op();
        self.rewind = Some(op);
        self.rewinds += 1;
        op
    }

    fn fail(&mut self, err: &UploadError) {
        if self.failed.is_none() {
            self.failed = Some(err.clone());
        }
    }

    fn accept_read(
        &mut self,
        result: Result<(ByteBuffer, bool), UploadError>,
    ) -> Result<UploadChunk, UploadError> {
        let (buffer, final_chunk) = result?;
        let read = buffer.position();
        let data = Bytes::copy_from_slice(buffer.contents(0, read));
        self.buffer = Some(buffer);

        let read = read as u64;
        let length = self.length.flatten();
        if let Some(expected) = length {
            if final_chunk {
                return Err(UploadError::FinalChunkOnFixedLength);
            }
            if self.position + read > expected {
                return Err(UploadError::ExceedsLength {
                    read: self.position + read,
                    expected,
                });
            }
        }
        if read == 0 && !final_chunk {
            return Err(UploadError::ZeroLengthRead);
        }

        self.position += read;
        if read > 0 {
            self.dirty = true;
        }
        self.eof = final_chunk || length == Some(self.position);
        Ok(UploadChunk {
            data,
            final_chunk: self.eof,
        })
    }

    /// Decide what the queued `init` callers get once nothing is in flight.
    fn service_init_waiters(&mut self) -> Followup {
        if self.init_waiters.is_empty() || self.read.is_some() || self.rewind.is_some() {
            return Followup::Nothing;
        }
        if let Some(err) = self.failed.clone() {
            return Followup::Resolve(std::mem::take(&mut self.init_waiters), Err(err));
        }
        if self.dirty {
            return Followup::Rewind(self.begin_rewind());
        }
        self.position = 0;
        self.eof = false;
        Followup::Resolve(std::mem::take(&mut self.init_waiters), Ok(()))
    }
}

impl UploadDataStream {
    pub(crate) fn new(
        provider: Box<dyn UploadDataProvider>,
        executor: Arc<dyn Executor>,
        allow_inline: bool,
        owner: u64,
        buffer_size: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                provider: Arc::new(Mutex::new(provider)),
                queue: TaskQueue::new(owner, executor, allow_inline),
                buffer_size: buffer_size.max(1),
            }),
        }
    }

    /// Ask the provider for the body length. Cached after the first answer.
    pub async fn query_length(&self) -> Result<Option<u64>, UploadError> {
        {
            let state = self.shared.state.lock();
            if let Some(err) = &state.failed {
                return Err(err.clone());
            }
            if state.closing {
                return Err(UploadError::Destroyed);
            }
            if let Some(length) = state.length {
                return Ok(length);
            }
        }

        let (tx, rx) = oneshot::channel();
        let provider = Arc::clone(&self.shared.provider);
        let task: Task = Box::new(move || {
            let _ = tx.send(provider.lock().length());
        });
        let outcome = match self.shared.queue.post(task) {
            Err(e) => Err(UploadError::executor(e)),
            Ok(()) => match rx.await {
                Ok(Ok(length)) => Ok(length),
                Ok(Err(e)) => Err(UploadError::provider(e)),
                Err(_) => Err(UploadError::Destroyed),
            },
        };

        let mut state = self.shared.state.lock();
        match outcome {
            Ok(length) => {
                state.length = Some(length);
                Ok(length)
            }
            Err(e) => {
                state.fail(&e);
                Err(e)
            }
        }
    }

    /// Known body length. `None` for chunked uploads or before
    /// [`query_length`](Self::query_length).
    pub fn length(&self) -> Option<u64> {
        self.shared.state.lock().length.flatten()
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self.shared.state.lock().length, Some(None))
    }

    /// Bytes delivered since the body was last at its start.
    pub fn position(&self) -> u64 {
        self.shared.state.lock().position
    }

    /// Number of rewinds issued to the provider so far.
    pub fn rewind_count(&self) -> u64 {
        self.shared.state.lock().rewinds
    }

    /// Prepare to read the body from its start.
    pub fn init(&self) -> Result<InitStatus, UploadError> {
        let (rewind, rx) = {
            let mut state = self.shared.state.lock();
            if let Some(err) = &state.failed {
                return Err(err.clone());
            }
            if state.closing {
                return Err(UploadError::Destroyed);
            }
            let idle = state.read.is_none() && state.rewind.is_none();
            if idle && !state.dirty {
                state.position = 0;
                state.eof = false;
                return Ok(InitStatus::Ready);
            }

            let (tx, rx) = oneshot::channel();
            state.init_waiters.push(tx);
            let rewind = if idle { Some(state.begin_rewind()) } else { None };
            (rewind, rx)
        };

        if let Some(op) = rewind {
            self.shared.start_rewind(op);
        }
        Ok(InitStatus::Pending(PendingInit { rx }))
    }

    /// Read up to `max` bytes of the body.
    pub async fn read(&self, max: usize) -> Result<UploadChunk, UploadError> {
        let (op, buffer, rx) = {
            let mut state = self.shared.state.lock();
            if let Some(err) = &state.failed {
                return Err(err.clone());
            }
            if state.closing {
                return Err(UploadError::Destroyed);
            }
            if state.read.is_some() || state.rewind.is_some() || !state.init_waiters.is_empty() {
                return Err(UploadError::NotReady);
            }
            let length = state.length.ok_or(UploadError::NotInitialized)?;
            if state.eof || length == Some(state.position) {
                return Ok(UploadChunk {
                    data: Bytes::new(),
                    final_chunk: true,
                });
            }

            let mut buffer = state
                .buffer
                .take()
                .filter(|buffer| buffer.capacity() > 0)
                .unwrap_or_else(|| ByteBuffer::allocate(self.shared.buffer_size));
            buffer.clear();
            let limit = max.clamp(1, buffer.capacity());
            buffer.set_limit(limit);

            let op = state.next_op();
            let (tx, rx) = oneshot::channel();
            state.read = Some(PendingRead { op, reply: Some(tx) });
            (op, buffer, rx)
        };

        self.shared.run_provider_call(op, OpKind::Read, move |provider, weak| {
            provider.read(UploadDataSink::new(weak, op), buffer)
        });
        rx.await.unwrap_or(Err(UploadError::Interrupted))
    }

    /// Forget the current read position. A read in flight is discarded.
    pub fn reset(&self) {
        let stale = {
            let mut state = self.shared.state.lock();
            state.read.as_mut().and_then(|read| read.reply.take())
        };
        drop(stale);
    }

    /// Stop using the stream. The provider is closed once any in-flight
    /// read or rewind reports back, or when the last handle is dropped.
    pub(crate) fn close(&self) {
        let (stale, waiters, in_flight) = {
            let mut state = self.shared.state.lock();
            if state.closing {
                return;
            }
            state.closing = true;
            let stale = state.read.as_mut().and_then(|read| read.reply.take());
            let in_flight = state.read.is_some() || state.rewind.is_some();
            (stale, std::mem::take(&mut state.init_waiters), in_flight)
        };
        drop(stale);
        for waiter in waiters {
            let _ = waiter.send(Err(UploadError::Destroyed));
        }
        if !in_flight {
            self.shared.post_close();
        }
    }
}

impl std::fmt::Debug for UploadDataStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("UploadDataStream")
            .field("length", &state.length)
            .field("position", &state.position)
            .field("dirty", &state.dirty)
            .field("read_pending", &state.read.is_some())
            .field("rewind_pending", &state.rewind.is_some())
            .field("closing", &state.closing)
            .finish()
    }
}

impl Shared {
    fn run_provider_call<F>(self: &Arc<Self>, op: u64, kind: OpKind, call: F)
    where
        F: FnOnce(&mut dyn UploadDataProvider, Weak<Shared>) -> Result<(), BoxError>
            + Send
            + 'static,
    {
        let provider = Arc::clone(&self.provider);
        let weak = Arc::downgrade(self);
        let task: Task = Box::new(move || {
            match weak.upgrade() {
                Some(shared) => shared.state.lock().in_call = Some(op),
                None => return,
            }
            let result = {
                let mut provider = provider.lock();
                call(&mut **provider, weak.clone())
            };
            if let Some(shared) = weak.upgrade() {
                shared.call_returned(op, kind, result.err().map(UploadError::provider));
            }
        });
        if let Err(e) = self.queue.post(task) {
            self.complete(op, kind, Err(UploadError::executor(e)));
        }
    }

    /// A sink dropped while its provider call is still on the stack is
    /// reported after the call returns, so an `Err` it returns wins.
    pub(super) fn sink_dropped(self: &Arc<Self>, op: u64, report: impl FnOnce(&Arc<Self>, u64)) {
        {
            let mut state = self.state.lock();
            if state.in_call == Some(op) {
                state.dropped_in_call = Some(op);
                return;
            }
        }
        report(self, op);
    }

    fn call_returned(self: &Arc<Self>, op: u64, kind: OpKind, err: Option<UploadError>) {
        let dropped = {
            let mut state = self.state.lock();
            if state.in_call == Some(op) {
                state.in_call = None;
            }
            state.dropped_in_call.take() == Some(op)
        };
        let err = match err {
            Some(err) => Some(err),
            None if dropped => Some(UploadError::SinkDropped),
            None => None,
        };
        if let Some(err) = err {
            self.complete(op, kind, Err(err));
        }
    }

    fn complete(self: &Arc<Self>, op: u64, kind: OpKind, result: Result<(), UploadError>) {
        match (kind, result) {
            (OpKind::Read, Err(err)) => self.read_completed(op, Err(err)),
            (OpKind::Rewind, result) => self.rewind_completed(op, result),
            (OpKind::Read, Ok(())) => {}
        }
    }

    pub(super) fn read_completed(
        self: &Arc<Self>,
        op: u64,
        result: Result<(ByteBuffer, bool), UploadError>,
    ) {
        let mut state = self.state.lock();
        let pending = match state.read.take() {
            Some(pending) if pending.op == op => pending,
            other => {
                state.read = other;
                return;
            }
        };

        if state.closing {
            drop(state);
            self.post_close();
            return;
        }

        let reply = match pending.reply {
            Some(reply) => {
                let outcome = state.accept_read(result);
                if let Err(e) = &outcome {
                    state.fail(e);
                }
                Some((reply, outcome))
            }
            None => {
                tracing::debug!(op, "discarding upload read completed after reset");
                if let Ok((buffer, _)) = result {
                    state.buffer = Some(buffer);
                }
                None
            }
        };
        let followup = state.service_init_waiters();
        drop(state);

        if let Some((reply, outcome)) = reply {
            let _ = reply.send(outcome);
        }
        self.run_followup(followup);
    }

    pub(super) fn rewind_completed(self: &Arc<Self>, op: u64, result: Result<(), UploadError>) {
        let mut state = self.state.lock();
        if state.rewind != Some(op) {
            return;
        }
        state.rewind = None;

        let followup = if state.closing {
            Followup::Close
        } else {
            match &result {
                Ok(()) => {
                    state.dirty = false;
                    state.position = 0;
                    state.eof = false;
                }
                Err(e) => state.fail(e),
            }
            Followup::Resolve(std::mem::take(&mut state.init_waiters), result)
        };
        drop(state);
        self.run_followup(followup);
    }

    fn start_rewind(self: &Arc<Self>, op: u64) {
        tracing::debug!(op, "rewinding upload data provider");
        self.run_provider_call(op, OpKind::Rewind, move |provider, weak| {
            provider.rewind(RewindSink::new(weak, op))
        });
    }

    fn run_followup(self: &Arc<Self>, followup: Followup) {
        match followup {
            Followup::Nothing => {}
            Followup::Resolve(waiters, result) => {
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }
            }
            Followup::Rewind(op) => self.start_rewind(op),
            Followup::Close => self.post_close(),
        }
    }

    fn post_close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        post_close_task(&self.queue, &self.provider);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if !self.state.get_mut().closed {
            post_close_task(&self.queue, &self.provider);
        }
    }
}

fn post_close_task(queue: &TaskQueue, provider: &SharedProvider) {
    let close = |provider: SharedProvider| -> Task {
        Box::new(move || {
            if let Err(e) = provider.lock().close() {
                tracing::warn!(error = %e, "upload data provider failed to close");
            }
        })
    };
    if queue.post(close(Arc::clone(provider))).is_ok() {
        return;
    }
    if let Err(e) = queue.post_unchecked(close(Arc::clone(provider))) {
        tracing::error!(owner = queue.owner(), error = %e, "could not close upload data provider");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::DirectExecutor;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct Control {
        length: Option<u64>,
        script: VecDeque<(Vec<u8>, bool)>,
        throw_on_read: bool,
        reads: usize,
        rewinds: usize,
        closes: usize,
        read_sinks: Vec<(UploadDataSink, ByteBuffer)>,
        rewind_sinks: Vec<RewindSink>,
    }

    /// Completes scripted reads inline; otherwise parks the sink for the
    /// test to complete later.
    struct TestProvider(Arc<Mutex<Control>>);

    impl UploadDataProvider for TestProvider {
        fn length(&mut self) -> Result<Option<u64>, BoxError> {
            Ok(self.0.lock().length)
        }

        fn read(&mut self, sink: UploadDataSink, mut buffer: ByteBuffer) -> Result<(), BoxError> {
            let mut control = self.0.lock();
            control.reads += 1;
            if control.throw_on_read {
                return Err("read exploded".into());
            }
            match control.script.pop_front() {
                Some((data, final_chunk)) => {
                    drop(control);
                    buffer.put(&data);
                    sink.on_read_succeeded(buffer, final_chunk);
                }
                None => control.read_sinks.push((sink, buffer)),
            }
            Ok(())
        }

        fn rewind(&mut self, sink: RewindSink) -> Result<(), BoxError> {
            let mut control = self.0.lock();
            control.rewinds += 1;
            control.rewind_sinks.push(sink);
            Ok(())
        }

        fn close(&mut self) -> Result<(), BoxError> {
            self.0.lock().closes += 1;
            Ok(())
        }
    }

    fn test_stream(length: Option<u64>) -> (UploadDataStream, Arc<Mutex<Control>>) {
        let control = Arc::new(Mutex::new(Control {
            length,
            ..Default::default()
        }));
        let stream = UploadDataStream::new(
            Box::new(TestProvider(Arc::clone(&control))),
            Arc::new(DirectExecutor),
            true,
            1,
            16,
        );
        (stream, control)
    }

    async fn wait_until(control: &Arc<Mutex<Control>>, cond: impl Fn(&Control) -> bool) {
        for _ in 0..1000 {
            if cond(&control.lock()) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition never became true");
    }

    fn spawn_read(
        stream: &UploadDataStream,
    ) -> tokio::task::JoinHandle<Result<UploadChunk, UploadError>> {
        let stream = stream.clone();
        tokio::spawn(async move { stream.read(16).await })
    }

    fn complete_parked_read(control: &Arc<Mutex<Control>>, data: &[u8]) {
        let (sink, mut buffer) = control.lock().read_sinks.remove(0);
        buffer.put(data);
        sink.on_read_succeeded(buffer, false);
    }

    fn pending(status: InitStatus) -> PendingInit {
        match status {
            InitStatus::Pending(pending) => pending,
            InitStatus::Ready => panic!("expected init to be pending"),
        }
    }

    #[test]
    fn test_init_without_activity_is_ready() {
        let (stream, control) = test_stream(Some(4));
        assert!(stream.init().unwrap().is_ready());
        assert!(stream.init().unwrap().is_ready());
        assert_eq!(control.lock().rewinds, 0);
        assert_eq!(stream.rewind_count(), 0);
    }

    #[tokio::test]
    async fn test_overlapping_resets_share_one_rewind() {
        let (stream, control) = test_stream(Some(4));
        stream.query_length().await.unwrap();
        assert!(stream.init().unwrap().is_ready());

        let read = spawn_read(&stream);
        wait_until(&control, |c| c.read_sinks.len() == 1).await;
        complete_parked_read(&control, b"ab");
        let chunk = read.await.unwrap().unwrap();
        assert_eq!(&chunk.data[..], b"ab");
        assert!(!chunk.final_chunk);

        let mut waiters = Vec::new();
        for _ in 0..3 {
            stream.reset();
            waiters.push(pending(stream.init().unwrap()));
        }
        assert_eq!(control.lock().rewinds, 1);

        let sink = control.lock().rewind_sinks.remove(0);
        sink.on_rewind_succeeded();
        for waiter in waiters {
            waiter.await.unwrap();
        }

        assert_eq!(control.lock().rewinds, 1);
        assert_eq!(stream.position(), 0);
        assert!(stream.init().unwrap().is_ready());
    }

    #[tokio::test]
    async fn test_reset_before_read_lands_skips_rewind() {
        let (stream, control) = test_stream(Some(4));
        stream.query_length().await.unwrap();
        assert!(stream.init().unwrap().is_ready());

        let read = spawn_read(&stream);
        wait_until(&control, |c| c.read_sinks.len() == 1).await;
        stream.reset();
        let waiter = pending(stream.init().unwrap());

        complete_parked_read(&control, b"abcd");
        assert!(matches!(read.await.unwrap(), Err(UploadError::Interrupted)));
        waiter.await.unwrap();

        assert_eq!(control.lock().rewinds, 0);
        assert!(stream.init().unwrap().is_ready());
        assert_eq!(stream.position(), 0);
    }

    #[tokio::test]
    async fn test_completion_after_destroy_is_ignored() {
        for _ in 0..100 {
            let (stream, control) = test_stream(Some(4));
            stream.query_length().await.unwrap();
            let read = spawn_read(&stream);
            wait_until(&control, |c| c.read_sinks.len() == 1).await;

            stream.close();
            assert!(read.await.unwrap().is_err());
            drop(stream);
            assert_eq!(control.lock().closes, 1);

            complete_parked_read(&control, b"late");
            assert_eq!(control.lock().closes, 1);
        }
    }

    #[tokio::test]
    async fn test_rewind_completion_after_destroy_is_ignored() {
        let (stream, control) = test_stream(Some(2));
        stream.query_length().await.unwrap();
        control.lock().script.push_back((b"ab".to_vec(), false));
        stream.read(16).await.unwrap();
        stream.reset();
        let waiter = pending(stream.init().unwrap());

        drop(stream);
        assert!(matches!(waiter.await, Err(UploadError::Destroyed)));
        let sink = control.lock().rewind_sinks.remove(0);
        sink.on_rewind_succeeded();
        assert_eq!(control.lock().closes, 1);
    }

    #[tokio::test]
    async fn test_close_waits_for_in_flight_read() {
        let (stream, control) = test_stream(Some(4));
        stream.query_length().await.unwrap();
        let read = spawn_read(&stream);
        wait_until(&control, |c| c.read_sinks.len() == 1).await;

        stream.close();
        let _ = read.await;
        assert_eq!(control.lock().closes, 0);

        complete_parked_read(&control, b"ab");
        assert_eq!(control.lock().closes, 1);
        drop(stream);
        assert_eq!(control.lock().closes, 1);
    }

    #[tokio::test]
    async fn test_zero_length_read_fails() {
        let (stream, control) = test_stream(Some(10));
        stream.query_length().await.unwrap();
        control.lock().script.push_back((Vec::new(), false));

        let err = stream.read(16).await.unwrap_err();
        assert_eq!(err.to_string(), "Bytes read can't be zero except for last chunk!");
        assert!(matches!(stream.read(16).await, Err(UploadError::ZeroLengthRead)));
    }

    #[tokio::test]
    async fn test_read_past_declared_length_fails() {
        let (stream, control) = test_stream(Some(2));
        stream.query_length().await.unwrap();
        control.lock().script.push_back((b"abc".to_vec(), false));

        let err = stream.read(16).await.unwrap_err();
        assert_eq!(err.to_string(), "Read upload data length 3 exceeds expected length 2");
    }

    #[tokio::test]
    async fn test_thrown_read_error_wins_over_dropped_sink() {
        let (stream, control) = test_stream(Some(2));
        stream.query_length().await.unwrap();
        control.lock().throw_on_read = true;

        let err = stream.read(16).await.unwrap_err();
        assert_eq!(err.to_string(), "read exploded");
        assert!(stream.init().is_err());
    }

    #[tokio::test]
    async fn test_chunked_upload_ends_on_final_chunk() {
        let (stream, control) = test_stream(None);
        assert_eq!(stream.query_length().await.unwrap(), None);
        assert!(stream.is_chunked());
        {
            let mut c = control.lock();
            c.script.push_back((b"hello ".to_vec(), false));
            c.script.push_back((b"world".to_vec(), true));
        }

        let first = stream.read(16).await.unwrap();
        let second = stream.read(16).await.unwrap();
        assert!(!first.final_chunk);
        assert!(second.final_chunk);
        assert_eq!(&second.data[..], b"world");

        let after = stream.read(16).await.unwrap();
        assert!(after.final_chunk && after.data.is_empty());
        assert_eq!(control.lock().reads, 2);
    }

    #[tokio::test]
    async fn test_empty_body_issues_no_read() {
        let (stream, control) = test_stream(Some(0));
        stream.query_length().await.unwrap();
        let chunk = stream.read(16).await.unwrap();
        assert!(chunk.final_chunk);
        assert_eq!(control.lock().reads, 0);
    }

    #[tokio::test]
    async fn test_inline_executor_rejected() {
        let control = Arc::new(Mutex::new(Control::default()));
        let stream = UploadDataStream::new(
            Box::new(TestProvider(Arc::clone(&control))),
            Arc::new(DirectExecutor),
            false,
            1,
            16,
        );
        let err = stream.query_length().await.unwrap_err();
        assert_eq!(err.to_string(), "Exception posting task to executor");
    }

    #[tokio::test]
    async fn test_bytes_provider_rewinds() {
        let stream = UploadDataStream::new(
            crate::upload::UploadDataProviders::from_bytes("abcdef"),
            Arc::new(DirectExecutor),
            true,
            1,
            4,
        );
        assert_eq!(stream.query_length().await.unwrap(), Some(6));
        assert_eq!(&stream.read(4).await.unwrap().data[..], b"abcd");
        let last = stream.read(4).await.unwrap();
        assert_eq!(&last.data[..], b"ef");
        assert!(last.final_chunk);

        stream.reset();
        stream.init().unwrap().ready().await.unwrap();
        assert_eq!(stream.rewind_count(), 1);
        assert_eq!(&stream.read(4).await.unwrap().data[..], b"abcd");
    }
}
