//! Tracks the long-running forwarder task of each tenant
//!
//! Teardown aborts the task, which drops the public listener. The handle is
//! handed back so callers can await full termination before releasing the
//! tenant's port.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::task::JoinHandle;

pub struct TaskTracker {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Track the forwarder task for a tenant; a previous task for the same
    /// tenant is aborted
    pub fn register(&self, tenant_id: String, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(old) = tasks.insert(tenant_id, handle) {
            old.abort();
        }
    }

    /// Stop tracking a tenant, returning its handle for the caller to abort
    /// and await
    pub fn remove(&self, tenant_id: &str) -> Option<JoinHandle<()>> {
        self.tasks.lock().unwrap().remove(tenant_id)
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_remove_hands_back_handle() {
        let tracker = TaskTracker::new();

        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        tracker.register("tenant-a".to_string(), handle);

        let handle = tracker.remove("tenant-a").expect("tracked task");
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert!(tracker.remove("tenant-a").is_none());
    }

    #[tokio::test]
    async fn test_register_replaces_and_aborts_old_task() {
        let tracker = TaskTracker::new();

        let first = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let first_abort = first.abort_handle();
        tracker.register("tenant-a".to_string(), first);

        let second = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        tracker.register("tenant-a".to_string(), second);

        // The replaced task was aborted
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(first_abort.is_finished());
    }
}
