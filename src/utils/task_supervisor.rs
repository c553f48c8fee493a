use tokio::task::JoinHandle;
use std::collections::HashMap;
use crate::error::{Error, Result};
use tracing::{info, error};

/// Tracks the long-running loops of the service (scheduler, health monitor, API server)
/// and reports any that stop on their own.
///
/// ```ignore
/// let mut supervisor = TaskSupervisor::new();
/// supervisor.spawn("scheduler", scheduler.run(shutdown_rx));
///
/// if let Err(e) = supervisor.check_health().await {
///     error!("Task failure detected: {:?}", e);
/// }
/// ```
pub struct TaskSupervisor {
    tasks: HashMap<String, JoinHandle<()>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        TaskSupervisor {
            tasks: HashMap::new(),
        }
    }

    pub fn spawn<F>(&mut self, name: impl Into<String>, future: F) -> &mut Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let handle = tokio::spawn(future);

        info!("Spawned background task: {}", name);
        self.tasks.insert(name, handle);
        self
    }

    /// Err if any registered task has terminated. Finished tasks are dropped from tracking.
    pub async fn check_health(&mut self) -> Result<()> {
        let failed_tasks: Vec<String> = self.tasks.iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect();

        if failed_tasks.is_empty() {
            return Ok(());
        }

        let error_msg = format!("Tasks terminated unexpectedly: {:?}", failed_tasks);
        error!("{}", error_msg);
        for name in &failed_tasks {
            self.tasks.remove(name);
        }
        Err(Error::TaskFailed(error_msg))
    }

    pub fn active_task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every task to finish, e.g. after a shutdown signal was broadcast.
    pub async fn join_all(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        for (name, handle) in self.tasks.drain() {
            match handle.await {
                Ok(()) => info!("Task {} completed", name),
                Err(e) => failures.push(format!("{}: {}", name, e)),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::TaskFailed(failures.join(", ")))
        }
    }

    pub async fn shutdown_all(&mut self) {
        info!("Shutting down {} background tasks", self.tasks.len());

        for (name, handle) in self.tasks.drain() {
            handle.abort();
            info!("Aborted task: {}", name);
        }
    }
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
