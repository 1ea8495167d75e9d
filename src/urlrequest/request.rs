use super::builder::{RequestParams, UploadParams};
use super::callback::{panic_to_error, RequestEvent, UrlRequestCallback};
use super::driver::{Command, RequestDriver};
use super::terminal::{Outcome, TerminalSlot};
use crate::base::buffer::ByteBuffer;
use crate::base::loadstate::{LoadState, RequestStatus};
use crate::base::neterror::NetError;
use crate::engine::Engine;
use crate::executor::{Executor, TaskQueue};
use crate::transport::LoadStateReporter;
use crate::upload::UploadDataStream;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Where the application stands in the request protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    NotStarted,
    /// Waiting on the network for a redirect or the response.
    Started,
    AwaitingFollow,
    AwaitingRead,
    Reading,
    Finished,
}

/// Handle to one URL request. Cheap to clone; all clones drive the same
/// request.
#[derive(Clone)]
pub struct UrlRequest {
    pub(crate) inner: Arc<RequestInner>,
}

pub(crate) struct RequestInner {
    pub(crate) id: u64,
    pub(crate) engine: Engine,
    pub(crate) queue: TaskQueue,
    pub(crate) terminal: TerminalSlot,
    callback: Mutex<Box<dyn UrlRequestCallback>>,
    params: Mutex<Option<RequestParams>>,
    phase: Mutex<Phase>,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    load_state: Mutex<Option<watch::Receiver<LoadState>>>,
}

impl UrlRequest {
    pub(crate) fn new(
        engine: Engine,
        callback: Box<dyn UrlRequestCallback>,
        executor: Arc<dyn Executor>,
        params: RequestParams,
    ) -> Self {
        let id = engine.next_request_id();
        let queue = TaskQueue::new(id, executor, params.allow_direct_executor);
        Self {
            inner: Arc::new(RequestInner {
                id,
                engine,
                queue,
                terminal: TerminalSlot::new(),
                callback: Mutex::new(callback),
                params: Mutex::new(Some(params)),
                phase: Mutex::new(Phase::NotStarted),
                commands: Mutex::new(None),
                load_state: Mutex::new(None),
            }),
        }
    }

    /// Engine-unique id. Also the owner tag of this request's callback
    /// tasks, see [`current_task_owner`](crate::executor::current_task_owner).
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Begin the request.
    ///
    /// Malformed input (URL, method, headers, an upload without
    /// `Content-Type`) is reported here as `Err`, never through the
    /// callback, and leaves the request unstarted.
    pub fn start(&self) -> Result<(), NetError> {
        let mut phase = self.inner.phase.lock();
        if *phase != Phase::NotStarted {
            return Err(NetError::invalid_state("Request is already started."));
        }

        let mut params_slot = self.inner.params.lock();
        let validated = match params_slot.as_ref() {
            Some(params) => params.validate()?,
            None => return Err(NetError::invalid_state("Request is already started.")),
        };
        let Some(params) = params_slot.take() else {
            return Err(NetError::invalid_state("Request is already started."));
        };

        let upload = params.upload.map(|UploadParams { provider, executor }| {
            UploadDataStream::new(
                provider,
                executor,
                params.allow_direct_executor,
                self.inner.id,
                self.inner.engine.config().upload_buffer_size,
            )
        });

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (reporter, load_state) = LoadStateReporter::channel();
        let driver = RequestDriver::new(
            self.clone(),
            commands_rx,
            validated,
            upload,
            reporter,
        );

        *self.inner.commands.lock() = Some(commands_tx);
        *self.inner.load_state.lock() = Some(load_state);
        if let Err(e) = self.inner.engine.start_driver(self.inner.id, driver.run()) {
            self.inner.commands.lock().take();
            self.inner.load_state.lock().take();
            return Err(e);
        }
        *phase = Phase::Started;
        tracing::debug!(request_id = self.inner.id, "request started");
        Ok(())
    }

    /// Continue after [`RequestEvent::RedirectReceived`].
    pub fn follow_redirect(&self) -> Result<(), NetError> {
        {
            let mut phase = self.inner.phase.lock();
            if *phase != Phase::AwaitingFollow {
                return Err(NetError::invalid_state("No redirect to follow."));
            }
            *phase = Phase::Started;
        }
        if self.inner.terminal.is_set() {
            return Ok(());
        }
        self.send(Command::FollowRedirect);
        Ok(())
    }

    /// Read body bytes into `buffer` between its position and limit. The
    /// buffer comes back with [`RequestEvent::ReadCompleted`]; at the end of
    /// the body the request succeeds instead.
    pub fn read(&self, buffer: ByteBuffer) -> Result<(), NetError> {
        if !buffer.has_remaining() {
            return Err(NetError::invalid_argument("ByteBuffer is already full."));
        }
        {
            let mut phase = self.inner.phase.lock();
            if *phase != Phase::AwaitingRead {
                return Err(NetError::invalid_state("Unexpected read attempt."));
            }
            *phase = Phase::Reading;
        }
        if self.inner.terminal.is_set() {
            return Ok(());
        }
        self.send(Command::Read(buffer));
        Ok(())
    }

    /// Cancel the request. A no-op before `start()` or once a terminal
    /// outcome was reached; otherwise `Canceled` is delivered.
    pub fn cancel(&self) {
        if *self.inner.phase.lock() == Phase::NotStarted {
            return;
        }
        if self.inner.terminal.claim(Outcome::Canceled) {
            tracing::debug!(request_id = self.inner.id, "request canceled");
            self.send(Command::Cancel);
        }
    }

    /// Whether a terminal outcome was reached.
    pub fn is_done(&self) -> bool {
        self.inner.terminal.is_set()
    }

    /// The terminal outcome, once reached.
    pub fn outcome(&self) -> Option<Outcome> {
        self.inner.terminal.get()
    }

    /// Ask for the request's status. `listener` runs later on the request's
    /// executor and sees the status as of that moment; the caller never
    /// blocks. Works on an engine that was shut down.
    pub fn get_status<F>(&self, listener: F)
    where
        F: FnOnce(RequestStatus) + Send + 'static,
    {
        let request = self.clone();
        let task: crate::executor::Task = Box::new(move || listener(request.current_status()));
        if let Err(e) = self.inner.queue.post(task) {
            tracing::error!(request_id = self.inner.id, error = %e, "cannot deliver status");
        }
    }

    /// Current status: [`RequestStatus::Invalid`] before `start()` and once
    /// done, otherwise the furthest phase the transport has reached.
    pub async fn status(&self) -> RequestStatus {
        self.current_status()
    }

    pub(crate) fn current_status(&self) -> RequestStatus {
        if self.inner.terminal.is_set() {
            return RequestStatus::Invalid;
        }
        match self.inner.load_state.lock().as_ref() {
            Some(rx) => RequestStatus::from(*rx.borrow()),
            None => RequestStatus::Invalid,
        }
    }

    pub(crate) fn set_phase(&self, next: Phase) {
        *self.inner.phase.lock() = next;
    }

    fn send(&self, command: Command) {
        if let Some(tx) = self.inner.commands.lock().as_ref() {
            // The driver is gone only once the request finished.
            let _ = tx.send(command);
        }
    }

    /// Run the callback for `event`. Called on the request's executor.
    pub(crate) fn deliver(&self, event: RequestEvent) {
        let terminal = event.is_terminal();
        let name = event.name();
        if !terminal && self.inner.terminal.is_set() {
            tracing::debug!(request_id = self.inner.id, callback = name, "skipped, request is done");
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
                request_id = self.inner.id,
                callback = name,
                error = %error,
                "error in terminal callback suppressed"
            );
            return;
        }
        tracing::warn!(request_id = self.inner.id, callback = name, error = %error, "callback failed");
        self.send(Command::Fail(NetError::callback(error)));
    }
}

impl std::fmt::Debug for UrlRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlRequest")
            .field("id", &self.inner.id)
            .field("phase", &*self.inner.phase.lock())
            .field("outcome", &self.inner.terminal.get())
            .finish()
    }
}
