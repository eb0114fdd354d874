//! Counting background work so shutdown can wait for it.

use std::sync::Arc;
use tokio::sync::watch;

/// Number of live tasks, shared by every clone
#[derive(Clone)]
pub struct TaskCounter {
    active: Arc<watch::Sender<usize>>,
}

/// Held by a task for as long as it counts as live. Dropping it (on return,
/// panic or abort) takes the task off the count.
pub struct TaskGuard {
    active: Arc<watch::Sender<usize>>,
}

impl TaskCounter {
    pub fn new() -> Self {
        let (active, _) = watch::channel(0);
        Self {
            active: Arc::new(active),
        }
    }

    pub fn enter(&self) -> TaskGuard {
        self.active.send_modify(|n| *n += 1);
        TaskGuard {
            active: self.active.clone(),
        }
    }

    pub fn active(&self) -> usize {
        *self.active.borrow()
    }

    /// Resolve once no guard is alive
    pub async fn idle(&self) {
        let mut rx = self.active.subscribe();
        // The sender lives in `self`, so this cannot see a closed channel
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for TaskCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.active.send_modify(|n| *n = n.saturating_sub(1));
    }
}
