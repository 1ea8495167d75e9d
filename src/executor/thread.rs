use super::{Executor, Task};
use crate::base::neterror::NetError;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tokio::sync::mpsc;

/// A single dedicated thread draining a FIFO of tasks.
///
/// Cloning shares the same thread. The thread exits once [`shutdown`] was
/// called (or every handle dropped) and the queued tasks have run.
///
/// [`shutdown`]: ThreadExecutor::shutdown
#[derive(Clone)]
pub struct ThreadExecutor {
    inner: Arc<Inner>,
}

struct Inner {
    sender: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl ThreadExecutor {
    /// Spawn the executor thread.
    pub fn new(name: &str) -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Some(task) = rx.blocking_recv() {
                    if catch_unwind(AssertUnwindSafe(task)).is_err() {
                        tracing::error!("task panicked on executor thread");
                    }
                }
            })?;
        let thread_id = handle.thread().id();
        Ok(Self {
            inner: Arc::new(Inner {
                sender: Mutex::new(Some(tx)),
                handle: Mutex::new(Some(handle)),
                thread_id,
            }),
        })
    }

    /// Whether the caller is running on this executor's thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    pub fn thread_id(&self) -> ThreadId {
        self.inner.thread_id
    }

    /// Stop accepting tasks. Already queued tasks still run.
    pub fn shutdown(&self) {
        self.inner.sender.lock().take();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.sender.lock().is_none()
    }

    /// Shut down and wait for the queued tasks to finish.
    ///
    /// Must not be called from the executor's own thread.
    pub fn shutdown_and_wait(&self) {
        self.shutdown();
        if self.is_current() {
            return;
        }
        if let Some(handle) = self.inner.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Executor for ThreadExecutor {
    fn execute(&self, task: Task) -> Result<(), NetError> {
        let sender = self.inner.sender.lock();
        match sender.as_ref() {
            Some(tx) => tx.send(task).map_err(|_| NetError::ExecutorShutdown),
            None => Err(NetError::ExecutorShutdown),
        }
    }
}

impl std::fmt::Debug for ThreadExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadExecutor")
            .field("thread_id", &self.inner.thread_id)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
