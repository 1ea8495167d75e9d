//! Callback executors.
//!
//! Every request and stream delivers its callbacks through a [`TaskQueue`]
//! layered over an application-supplied [`Executor`]. The queue runs tasks
//! strictly one after another and tags each with the id of the request that
//! posted it, so code running inside a callback can ask which request it is
//! serving with [`current_task_owner`].
//!
//! Executors that run tasks inline on the posting thread ([`DirectExecutor`])
//! are rejected unless the request opted in with `allow_direct_executor`,
//! since the posting thread is usually the network thread.

mod direct;
mod queue;
mod thread;

pub use direct::DirectExecutor;
pub(crate) use queue::TaskQueue;
pub use queue::current_task_owner;
pub use thread::ThreadExecutor;

use crate::base::neterror::NetError;

/// A unit of work handed to an [`Executor`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks on behalf of the engine.
///
/// Returning `Err` means the task was rejected and will never run; the
/// request that posted it fails with [`NetError::ExecutorRejected`].
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, task: Task) -> Result<(), NetError>;
}

impl<F> Executor for F
where
    F: Fn(Task) -> Result<(), NetError> + Send + Sync + 'static,
{
    fn execute(&self, task: Task) -> Result<(), NetError> {
        self(task)
    }
}
