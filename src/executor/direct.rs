use super::{Executor, Task};
use crate::base::neterror::NetError;

/// Runs every task immediately on the calling thread.
///
/// Only usable with requests built with `allow_direct_executor(true)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectExecutor;

impl Executor for DirectExecutor {
    fn execute(&self, task: Task) -> Result<(), NetError> {
        task();
        Ok(())
    }
}
