//! Registry of in-flight streams, keyed by task id

use crate::cancel::StreamCancellationHandle;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

#[derive(Debug, Default)]
pub struct StreamTaskManager {
    tasks: Mutex<HashMap<String, StreamCancellationHandle>>,
}

impl StreamTaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the router's handle once the stream has been committed
    pub fn bind(&self, task_id: &str, handle: StreamCancellationHandle) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id.to_string(), handle);
        debug!(task_id, "Stream task bound");
    }

    /// Stop a task. Returns whether a live task was found; unknown or
    /// finished ids are a no-op.
    pub fn cancel(&self, task_id: &str) -> bool {
        let handle = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .cloned();

        match handle {
            Some(handle) => {
                handle.cancel();
                debug!(task_id, "Stream task cancelled");
                true
            }
            None => false,
        }
    }

    pub fn unregister(&self, task_id: &str) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id);
    }

    pub fn active_count(&self) -> usize {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
