use super::{Executor, Task};
use crate::base::neterror::NetError;
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_QUEUE_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Owner id of the task currently running on this thread.
    static CURRENT_OWNER: Cell<Option<u64>> = const { Cell::new(None) };
    /// Token of the queue whose `Executor::execute` call is on this thread's stack.
    static POSTING: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Id of the request or stream whose callback is running on this thread,
/// or `None` outside of engine callbacks.
pub fn current_task_owner() -> Option<u64> {
    CURRENT_OWNER.with(|c| c.get())
}

/// Serial, owner-tagged task queue over an [`Executor`].
///
/// Tasks posted to one queue never overlap and run in posting order, even
/// when the executor is multi-threaded or runs tasks inline.
#[derive(Clone)]
pub(crate) struct TaskQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    owner: u64,
    token: u64,
    executor: Arc<dyn Executor>,
    allow_inline: bool,
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<Task>,
    draining: bool,
}

impl TaskQueue {
    pub(crate) fn new(owner: u64, executor: Arc<dyn Executor>, allow_inline: bool) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                owner,
                token: NEXT_QUEUE_TOKEN.fetch_add(1, Ordering::Relaxed),
                executor,
                allow_inline,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    pub(crate) fn owner(&self) -> u64 {
        self.inner.owner
    }

    /// Queue `task`. On `Err` the task (and anything queued behind it) was
    /// dropped without running.
    pub(crate) fn post(&self, task: Task) -> Result<(), NetError> {
        {
            let mut state = self.inner.state.lock();
            state.tasks.push_back(task);
            if state.draining {
                return Ok(());
            }
            state.draining = true;
        }
        self.dispatch()
    }

    /// Hand `task` straight to the executor, skipping the inline check.
    ///
    /// Used to report a failure that was itself caused by posting, so the
    /// application hears about it even through a prohibited direct executor.
    pub(crate) fn post_unchecked(&self, task: Task) -> Result<(), NetError> {
        let owner = self.inner.owner;
        self.inner.executor.execute(Box::new(move || {
            run_tagged(owner, task);
        }))
    }

    fn dispatch(&self) -> Result<(), NetError> {
        let inner = Arc::clone(&self.inner);
        let ran_inline = Arc::new(AtomicBool::new(false));
        let ran_inline_flag = Arc::clone(&ran_inline);
        let token = inner.token;

        let drain: Task = Box::new(move || {
            if !inner.allow_inline && POSTING.with(|p| p.get()) == Some(token) {
                ran_inline_flag.store(true, Ordering::SeqCst);
                return;
            }
            inner.drain();
        });

        let previous = POSTING.with(|p| p.replace(Some(token)));
        let result = self.inner.executor.execute(drain);
        POSTING.with(|p| p.set(previous));

        let result = match result {
            Ok(()) if ran_inline.load(Ordering::SeqCst) => Err(NetError::InlineExecutionProhibited),
            other => other,
        };

        if let Err(e) = result {
            let mut state = self.inner.state.lock();
            state.draining = false;
            state.tasks.clear();
            tracing::error!(owner = self.inner.owner, error = %e, "Exception posting task to executor");
            return Err(NetError::executor(e));
        }
        Ok(())
    }
}

impl QueueInner {
    fn drain(&self) {
        loop {
            let task = {
                let mut state = self.state.lock();
                match state.tasks.pop_front() {
                    Some(task) => task,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };
            run_tagged(self.owner, task);
        }
    }
}

fn run_tagged(owner: u64, task: Task) {
    let previous = CURRENT_OWNER.with(|c| c.replace(Some(owner)));
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        tracing::error!(owner, "task panicked");
    }
    CURRENT_OWNER.with(|c| c.set(previous));
}
