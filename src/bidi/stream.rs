use super::builder::StreamParams;
use super::callback::{BidirectionalStreamCallback, StreamEvent};
use super::driver::{StreamCommand, StreamDriver};
use crate::base::buffer::ByteBuffer;
use crate::base::neterror::NetError;
use crate::engine::Engine;
use crate::executor::{Executor, TaskQueue};
use crate::transport::LoadStateReporter;
use crate::urlrequest::panic_to_error;
use crate::urlrequest::terminal::{Outcome, TerminalSlot};
use http::Method;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadPhase {
    NotStarted,
    WaitingForHeaders,
    AwaitingRead,
    Reading,
    /// End of stream was read, or the stream finished.
    Done,
}

#[derive(Debug, Default)]
struct WriteState {
    started: bool,
    end_of_stream_written: bool,
    /// Written and not yet flushed.
    pending: Vec<(ByteBuffer, bool)>,
}

/// Handle to one bidirectional stream. Cheap to clone.
#[derive(Clone)]
pub struct BidirectionalStream {
    pub(crate) inner: Arc<StreamInner>,
}

pub(crate) struct StreamInner {
    pub(crate) id: u64,
    pub(crate) engine: Engine,
    pub(crate) queue: TaskQueue,
    pub(crate) terminal: TerminalSlot,
    /// Flushed buffers not yet handed to the transport.
    pub(crate) flushing: AtomicUsize,
    callback: Mutex<Box<dyn BidirectionalStreamCallback>>,
    params: Mutex<Option<StreamParams>>,
    read_phase: Mutex<ReadPhase>,
    writes: Mutex<WriteState>,
    commands: Mutex<Option<mpsc::UnboundedSender<StreamCommand>>>,
}

impl BidirectionalStream {
    pub(crate) fn new(
        engine: Engine,
        callback: Box<dyn BidirectionalStreamCallback>,
        executor: Arc<dyn Executor>,
        params: StreamParams,
    ) -> Self {
        let id = engine.next_request_id();
        let queue = TaskQueue::new(id, executor, params.allow_direct_executor);
        Self {
            inner: Arc::new(StreamInner {
                id,
                engine,
                queue,
                terminal: TerminalSlot::new(),
                flushing: AtomicUsize::new(0),
                callback: Mutex::new(callback),
                params: Mutex::new(Some(params)),
                read_phase: Mutex::new(ReadPhase::NotStarted),
                writes: Mutex::new(WriteState::default()),
                commands: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Open the stream. Invalid method or headers are reported here and
    /// leave the stream unstarted.
    pub fn start(&self) -> Result<(), NetError> {
        let mut read_phase = self.inner.read_phase.lock();
        if *read_phase != ReadPhase::NotStarted {
            return Err(NetError::invalid_state("Stream is already started."));
        }
        let mut params_slot = self.inner.params.lock();
        let (validated, delay_headers_until_flush) = match params_slot.as_ref() {
            Some(params) => (params.validate()?, params.delay_headers_until_flush),
            None => return Err(NetError::invalid_state("Stream is already started.")),
        };
        params_slot.take();

        let can_write = validated.method != Method::GET && validated.method != Method::HEAD;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (reporter, _) = LoadStateReporter::channel();
        let driver = StreamDriver::new(
            self.clone(),
            commands_rx,
            validated,
            delay_headers_until_flush,
            reporter,
        );

        *self.inner.commands.lock() = Some(commands_tx);
        if let Err(e) = self.inner.engine.start_driver(self.inner.id, driver.run()) {
            self.inner.commands.lock().take();
            return Err(e);
        }

        {
            let mut writes = self.inner.writes.lock();
            writes.started = true;
            if !can_write {
                writes.end_of_stream_written = true;
                if !writes.pending.is_empty() {
                    tracing::debug!(
                        stream_id = self.inner.id,
                        dropped = writes.pending.len(),
                        "method has no request body, dropping writes"
                    );
                    writes.pending.clear();
                }
            }
        }
        *read_phase = ReadPhase::WaitingForHeaders;
        tracing::debug!(stream_id = self.inner.id, "stream started");
        Ok(())
    }

    /// Read response bytes into `buffer` between its position and limit.
    pub fn read(&self, buffer: ByteBuffer) -> Result<(), NetError> {
        if !buffer.has_remaining() {
            return Err(NetError::invalid_argument("ByteBuffer is already full."));
        }
        {
            let mut phase = self.inner.read_phase.lock();
            if *phase != ReadPhase::AwaitingRead {
                return Err(NetError::invalid_state("Unexpected read attempt."));
            }
            *phase = ReadPhase::Reading;
        }
        if self.inner.terminal.is_set() {
            return Ok(());
        }
        self.send(StreamCommand::Read(buffer));
        Ok(())
    }

    /// Queue the bytes between `buffer`'s position and limit. Nothing is
    /// sent until [`flush`](Self::flush). After an `end_of_stream` write no
    /// further writes are accepted. Writes on a finished stream are dropped.
    pub fn write(&self, buffer: ByteBuffer, end_of_stream: bool) -> Result<(), NetError> {
        if !buffer.has_remaining() && !end_of_stream {
            return Err(NetError::invalid_argument("Empty buffer"));
        }
        let mut writes = self.inner.writes.lock();
        if writes.end_of_stream_written {
            return Err(NetError::invalid_argument(
                "Write after writing end of stream.",
            ));
        }
        if self.inner.terminal.is_set() {
            return Ok(());
        }
        writes.pending.push((buffer, end_of_stream));
        if end_of_stream {
            writes.end_of_stream_written = true;
        }
        Ok(())
    }

    /// Send every buffer written so far. A no-op before `start()` and once
    /// the stream finished.
    pub fn flush(&self) {
        let batch = {
            let mut writes = self.inner.writes.lock();
            if !writes.started || self.inner.terminal.is_set() || writes.pending.is_empty() {
                return;
            }
            std::mem::take(&mut writes.pending)
        };
        self.inner.flushing.fetch_add(batch.len(), Ordering::SeqCst);
        self.send(StreamCommand::Flush(batch));
    }

    /// Buffers written but not yet flushed.
    pub fn pending_write_count(&self) -> usize {
        self.inner.writes.lock().pending.len()
    }

    /// Buffers flushed but not yet handed to the network.
    pub fn flush_write_count(&self) -> usize {
        self.inner.flushing.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        if *self.inner.read_phase.lock() == ReadPhase::NotStarted {
            return;
        }
        if self.inner.terminal.claim(Outcome::Canceled) {
            tracing::debug!(stream_id = self.inner.id, "stream canceled");
            self.send(StreamCommand::Cancel);
        }
    }

    pub fn is_done(&self) -> bool {
        self.inner.terminal.is_set()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.inner.terminal.get()
    }

    pub(crate) fn set_read_phase(&self, phase: ReadPhase) {
        *self.inner.read_phase.lock() = phase;
    }

    pub(crate) fn send(&self, command: StreamCommand) {
        if let Some(tx) = self.inner.commands.lock().as_ref() {
            let _ = tx.send(command);
        }
    }

    pub(crate) fn deliver(&self, event: StreamEvent) {
        let terminal = event.is_terminal();
        let name = event.name();
        if !terminal && self.inner.terminal.is_set() {
            tracing::debug!(stream_id = self.inner.id, callback = name, "skipped, stream is done");
            return;
        }

        let result = {
            let mut callback = self.inner.callback.lock();
            catch_unwind(AssertUnwindSafe(|| callback.on_event(self, event)))
        };
        let error = match result {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(panic) => panic_to_error(panic),
        };

        if terminal {
            tracing::warn!(
                stream_id = self.inner.id,
                callback = name,
                error = %error,
                "error in terminal callback suppressed"
            );
            return;
        }
        tracing::warn!(stream_id = self.inner.id, callback = name, error = %error, "callback failed");
        self.send(StreamCommand::Fail(NetError::callback_with_message(
            "Exception in BidirectionalStream",
            error,
        )));
    }
}

impl std::fmt::Debug for BidirectionalStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BidirectionalStream")
            .field("id", &self.inner.id)
            .field("read_phase", &*self.inner.read_phase.lock())
            .field("outcome", &self.inner.terminal.get())
            .finish()
    }
}
