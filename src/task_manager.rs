//! Task management for the daemon's long running services.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use log::{error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long [`TaskManager::shutdown_all`] waits for each task by default.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the background tasks of the daemon and stops them together.
///
/// Every task receives a child of the global token, so cancelling the global
/// token reaches all of them.
pub struct TaskManager {
    tasks: HashMap<String, JoinHandle<Result<()>>>,
    global_token: CancellationToken,
    shutdown_timeout: Duration,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::with_shutdown_timeout(SHUTDOWN_TIMEOUT)
    }

    pub fn with_shutdown_timeout(shutdown_timeout: Duration) -> Self {
        Self {
            tasks: HashMap::new(),
            global_token: CancellationToken::new(),
            shutdown_timeout,
        }
    }

    /// Token cancelled by [`TaskManager::shutdown_all`].
    pub fn token(&self) -> CancellationToken {
        self.global_token.clone()
    }

    /// Spawns and registers a task with the given name.
    ///
    /// Fails when a task with that name is already registered.
    pub fn spawn_task<F, Fut>(&mut self, name: impl Into<String>, task_fn: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        if self.tasks.contains_key(&name) {
            anyhow::bail!("Task '{name}' is already running");
        }

        let task_token = self.global_token.child_token();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            info!("Starting task: {task_name}");
            let result = task_fn(task_token).await;
            match &result {
                Ok(()) => info!("Task '{task_name}' completed successfully"),
                Err(e) => error!("Task '{task_name}' failed: {e:#}"),
            }
            result
        });

        self.tasks.insert(name.clone(), handle);
        info!("Task '{name}' spawned");
        Ok(())
    }

    /// Cancels every task and waits for each of them.
    ///
    /// Returns the first error encountered, if any.
    pub async fn shutdown_all(&mut self) -> Result<()> {
        info!("Stopping all {} tasks", self.tasks.len());

        self.global_token.cancel();

        let mut first_error = None;
        for (name, handle) in self.tasks.drain() {
            let error = match tokio::time::timeout(self.shutdown_timeout, handle).await {
                Ok(Ok(Ok(()))) => continue,
                Ok(Ok(Err(e))) => {
                    warn!("Task '{name}' failed during shutdown: {e:#}");
                    e.context(format!("Task '{name}' failed"))
                }
                Ok(Err(e)) => {
                    let error = anyhow!("Task '{name}' panicked: {e}");
                    error!("{error}");
                    error
                }
                Err(_) => {
                    let error = anyhow!("Task '{name}' did not stop within {:?}", self.shutdown_timeout);
                    error!("{error}");
                    error
                }
            };
            first_error.get_or_insert(error);
        }

        match first_error {
            Some(error) => Err(error).context("One or more tasks failed during shutdown"),
            None => {
                info!("All tasks stopped");
                Ok(())
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.tasks
            .get(name)
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}
