//! A recording [`UrlRequestCallback`].
//!
//! `RequestTracker` follows a request step by step, checks that every event
//! arrives in a legal order on the request's own task queue, accumulates the
//! body and signals completion through futures. It is what the integration
//! tests drive requests with, and a reasonable starting point for embedders
//! who want the whole body in memory.

use super::callback::{RequestEvent, UrlRequestCallback};
use super::info::UrlResponseInfo;
use super::request::UrlRequest;
use crate::base::buffer::ByteBuffer;
use crate::base::neterror::{BoxError, NetError};
use crate::executor::current_task_owner;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use tokio::sync::{watch, Notify};

const DEFAULT_READ_BUFFER_SIZE: usize = 32 * 1024;

/// Last event a tracker saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStep {
    NotStarted,
    OnReceivedRedirect,
    OnResponseStarted,
    OnReadCompleted,
    OnSucceeded,
    OnFailed,
    OnCanceled,
}

impl ResponseStep {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ResponseStep::OnSucceeded | ResponseStep::OnFailed | ResponseStep::OnCanceled
        )
    }
}

/// Misbehaviour injected at a chosen step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Call `cancel()` from inside the callback and stop advancing.
    CancelSync,
    /// Call `cancel()` from another thread and stop advancing.
    CancelAsync,
    /// Call `cancel()` from another thread and keep advancing.
    CancelAsyncWithoutPause,
    /// Return an error from the callback.
    ThrowSync,
}

/// Recording callback. Clones share state: hand one clone to the request
/// builder and inspect another.
#[derive(Clone)]
pub struct RequestTracker {
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
    auto_advance: bool,
    read_buffer_size: usize,
    failure: Option<(ResponseStep, FailureType)>,
    block_on_terminal: bool,

    step: ResponseStep,
    steps: Vec<ResponseStep>,
    redirect_infos: Vec<UrlResponseInfo>,
    redirect_urls: Vec<String>,
    response_info: Option<UrlResponseInfo>,
    body: Vec<u8>,
    read_start: Option<usize>,
    read_completed_count: usize,
    error: Option<NetError>,
    violations: Vec<String>,
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTracker {
    pub fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(TrackerState {
                    auto_advance: true,
                    read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
                    failure: None,
                    block_on_terminal: false,
                    step: ResponseStep::NotStarted,
                    steps: Vec::new(),
                    redirect_infos: Vec::new(),
                    redirect_urls: Vec::new(),
                    response_info: None,
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

    /// When off, the tracker neither follows redirects nor reads; the test
    /// drives the request by hand after [`wait_for_next_step`](Self::wait_for_next_step).
    pub fn with_auto_advance(self, auto_advance: bool) -> Self {
        self.shared.state.lock().auto_advance = auto_advance;
        self
    }

    pub fn with_read_buffer_size(self, size: usize) -> Self {
        self.shared.state.lock().read_buffer_size = size.max(1);
        self
    }

    pub fn with_failure(self, step: ResponseStep, failure: FailureType) -> Self {
        self.shared.state.lock().failure = Some((step, failure));
        self
    }

    /// Hold the executor inside the terminal callback until
    /// [`release_terminal`](Self::release_terminal).
    pub fn with_blocking_terminal(self) -> Self {
        self.shared.state.lock().block_on_terminal = true;
        self
    }

    pub fn release_terminal(&self) {
        *self.shared.released.lock() = true;
        self.shared.release_signal.notify_all();
    }

    /// Resolves after the next callback, or immediately if one ran since
    /// the previous wait.
    pub async fn wait_for_next_step(&self) {
        self.shared.step_changed.notified().await;
    }

    /// Resolves once a terminal callback ran.
    pub async fn done(&self) {
        let mut rx = self.shared.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    pub fn is_done(&self) -> bool {
        *self.shared.done.borrow()
    }

    /// Issue a read with a fresh buffer of the configured size.
    pub fn start_next_read(&self, request: &UrlRequest) -> Result<(), NetError> {
        let size = self.shared.state.lock().read_buffer_size;
        self.start_next_read_with(request, ByteBuffer::allocate(size))
    }

    /// Issue a read into `buffer`, remembering where it starts so the body
    /// can be taken from the position delta.
    pub fn start_next_read_with(
        &self,
        request: &UrlRequest,
        buffer: ByteBuffer,
    ) -> Result<(), NetError> {
        let start = buffer.position();
        self.shared.state.lock().read_start = Some(start);
        request.read(buffer)
    }

    pub fn response_step(&self) -> ResponseStep {
        self.shared.state.lock().step
    }

    /// Every step seen, in order.
    pub fn steps(&self) -> Vec<ResponseStep> {
        self.shared.state.lock().steps.clone()
    }

    pub fn redirect_count(&self) -> usize {
        self.shared.state.lock().redirect_infos.len()
    }

    pub fn redirect_response_infos(&self) -> Vec<UrlResponseInfo> {
        self.shared.state.lock().redirect_infos.clone()
    }

    pub fn redirect_urls(&self) -> Vec<String> {
        self.shared.state.lock().redirect_urls.clone()
    }

    pub fn response_info(&self) -> Option<UrlResponseInfo> {
        self.shared.state.lock().response_info.clone()
    }

    pub fn response_bytes(&self) -> Vec<u8> {
        self.shared.state.lock().body.clone()
    }

    pub fn response_as_string(&self) -> String {
        String::from_utf8_lossy(&self.shared.state.lock().body).into_owned()
    }

    pub fn read_completed_count(&self) -> usize {
        self.shared.state.lock().read_completed_count
    }

    pub fn error(&self) -> Option<NetError> {
        self.shared.state.lock().error.clone()
    }

    /// Ordering or threading rules a callback found broken. Empty for a
    /// well-behaved request.
    pub fn violations(&self) -> Vec<String> {
        self.shared.state.lock().violations.clone()
    }

    fn record(&self, request: &UrlRequest, step: ResponseStep, allowed_from: &[ResponseStep]) {
        let mut state = self.shared.state.lock();
        if current_task_owner() != Some(request.id()) {
            state.violations.push(format!(
                "{:?} for request {} ran outside its task queue",
                step,
                request.id()
            ));
        }
        let previous = state.step;
        if !allowed_from.contains(&previous) {
            state
                .violations
                .push(format!("{:?} after {:?}", step, previous));
        }
        state.step = step;
        state.steps.push(step);
    }

    /// Apply an injected failure for `step`. Returns `Ok(true)` when the
    /// callback should stop advancing the request.
    fn inject_failure(&self, request: &UrlRequest, step: ResponseStep) -> Result<bool, BoxError> {
        let failure = match self.shared.state.lock().failure {
            Some((at, failure)) if at == step => failure,
            _ => return Ok(false),
        };
        match failure {
            FailureType::CancelSync => {
                request.cancel();
                Ok(true)
            }
            FailureType::CancelAsync | FailureType::CancelAsyncWithoutPause => {
                let request = request.clone();
                std::thread::spawn(move || request.cancel());
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

    fn advance(&self, request: &UrlRequest, event: RequestEvent) -> Result<(), BoxError> {
        use ResponseStep::*;

        match event {
            RequestEvent::RedirectReceived { info, new_location } => {
                self.record(request, OnReceivedRedirect, &[NotStarted, OnReceivedRedirect]);
                {
                    let mut state = self.shared.state.lock();
                    state.redirect_infos.push(info);
                    state.redirect_urls.push(new_location);
                }
                if self.inject_failure(request, OnReceivedRedirect)? {
                    return Ok(());
                }
                if self.shared.state.lock().auto_advance {
                    request.follow_redirect()?;
                }
            }
            RequestEvent::ResponseStarted { info } => {
                self.record(request, OnResponseStarted, &[NotStarted, OnReceivedRedirect]);
                self.shared.state.lock().response_info = Some(info);
                if self.inject_failure(request, OnResponseStarted)? {
                    return Ok(());
                }
                if self.shared.state.lock().auto_advance {
                    self.start_next_read(request)?;
                }
            }
            RequestEvent::ReadCompleted { info, mut buffer } => {
                self.record(request, OnReadCompleted, &[OnResponseStarted, OnReadCompleted]);
                let auto_advance = {
                    let mut state = self.shared.state.lock();
                    let start = state.read_start.take().unwrap_or(0);
                    let end = buffer.position();
                    if end > start {
                        state.body.extend_from_slice(buffer.contents(start, end));
                    }
                    state.read_completed_count += 1;
                    state.response_info = Some(info);
                    state.auto_advance
                };
                if self.inject_failure(request, OnReadCompleted)? {
                    return Ok(());
                }
                if auto_advance {
                    buffer.clear();
                    self.start_next_read_with(request, buffer)?;
                }
            }
            RequestEvent::Succeeded { info } => {
                self.record(request, OnSucceeded, &[OnResponseStarted, OnReadCompleted]);
                self.shared.state.lock().response_info = Some(info);
                self.finish();
            }
            RequestEvent::Failed { info, error } => {
                self.record(
                    request,
                    OnFailed,
                    &[NotStarted, OnReceivedRedirect, OnResponseStarted, OnReadCompleted],
                );
                {
                    let mut state = self.shared.state.lock();
                    if info.is_some() {
                        state.response_info = info;
                    }
                    state.error = Some(error);
                }
                self.finish();
            }
            RequestEvent::Canceled { info } => {
                self.record(
                    request,
                    OnCanceled,
                    &[NotStarted, OnReceivedRedirect, OnResponseStarted, OnReadCompleted],
                );
                if info.is_some() {
                    self.shared.state.lock().response_info = info;
                }
                self.finish();
            }
        }
        Ok(())
    }
}

impl UrlRequestCallback for RequestTracker {
    fn on_event(&mut self, request: &UrlRequest, event: RequestEvent) -> Result<(), BoxError> {
        let terminal = event.is_terminal();
        let result = self.advance(request, event);
        if !terminal {
            self.shared.step_changed.notify_one();
        }
        result
    }
}

impl std::fmt::Debug for RequestTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("RequestTracker")
            .field("step", &state.step)
            .field("redirects", &state.redirect_infos.len())
            .field("body_len", &state.body.len())
            .field("error", &state.error)
            .finish()
    }
}
