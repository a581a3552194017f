//! Non-reentrant execution guard.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Lets at most one execution of a named task run at a time.
///
/// Entering returns a permit that releases the guard on drop, including
/// when the task panics or its future is cancelled.
#[derive(Debug, Clone)]
pub struct TaskGuard {
    name: &'static str,
    busy: Arc<AtomicBool>,
}

impl TaskGuard {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// `None` if another execution holds the guard.
    pub fn try_enter(&self) -> Option<TaskPermit> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TaskPermit {
                busy: Arc::clone(&self.busy),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Held while a guarded task runs.
#[derive(Debug)]
pub struct TaskPermit {
    busy: Arc<AtomicBool>,
}

impl Drop for TaskPermit {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}
