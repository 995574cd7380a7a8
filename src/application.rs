//! Application entry point and builder pattern implementation.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use log::info;
use tokio_util::sync::CancellationToken;

use crate::{
    config::ConfigManager,
    device_io::{CancellableIo, DeviceIo, SysfsIo},
    inventory::Inventory,
    scheduler::Scheduler,
    task_manager::TaskManager,
};

/// The running daemon: one scheduler task driving every controller.
///
/// # Example
///
/// ```no_run
/// use fancontrold::{application::Application, config::ConfigManager};
///
/// # async fn example() -> anyhow::Result<()> {
/// let config_manager = ConfigManager::load(None).await?;
/// let mut app = Application::builder()
///     .with_config_manager(config_manager)
///     .build()
///     .await?;
///
/// app.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Application {
    task_manager: TaskManager,
    scheduler: Option<Scheduler>,
}

impl Application {
    pub fn builder() -> ApplicationBuilder {
        ApplicationBuilder::new()
    }

    /// Cancelling this token stops the daemon like a termination signal.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.task_manager.token()
    }

    /// Starts the scheduler and blocks until a shutdown is requested.
    pub async fn run(&mut self) -> Result<()> {
        let scheduler = self
            .scheduler
            .take()
            .ok_or_else(|| anyhow!("Application is already running"))?;

        self.task_manager
            .spawn_task("scheduler", move |cancel| async move {
                scheduler.run(cancel).await
            })?;

        let token = self.task_manager.token();
        wait_for_shutdown(&token).await?;

        info!("Initiating graceful shutdown...");
        self.task_manager.shutdown_all().await?;
        info!("Shutdown complete");
        Ok(())
    }
}

/// Resolves on Ctrl-C, SIGTERM, or when `token` is cancelled from inside.
async fn wait_for_shutdown(token: &CancellationToken) -> Result<()> {
    #[cfg(unix)]
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    #[cfg(unix)]
    let sigterm = terminate.recv();
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<Option<()>>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("Received Ctrl+C");
        }
        _ = sigterm => info!("Received SIGTERM"),
        () = token.cancelled() => info!("Shutdown requested"),
    }
    Ok(())
}

/// Builder pattern for creating Application instances.
pub struct ApplicationBuilder {
    config_manager: Option<ConfigManager>,
    io: Option<Arc<dyn DeviceIo>>,
}

impl ApplicationBuilder {
    fn new() -> Self {
        Self {
            config_manager: None,
            io: None,
        }
    }

    pub fn with_config_manager(mut self, config_manager: ConfigManager) -> Self {
        self.config_manager = Some(config_manager);
        self
    }

    /// Replaces the sysfs backend, e.g. with an in-memory one.
    pub fn with_device_io(mut self, io: Arc<dyn DeviceIo>) -> Self {
        self.io = Some(io);
        self
    }

    /// Attaches the fans and assembles the scheduler.
    pub async fn build(self) -> Result<Application> {
        let config_manager = self
            .config_manager
            .ok_or_else(|| anyhow!("Configuration manager is required"))?;
        let config = config_manager.config();

        let task_manager = TaskManager::new();
        let backend = self
            .io
            .unwrap_or_else(|| Arc::new(SysfsIo::new(config.smartctl.clone())));
        let io: Arc<dyn DeviceIo> = Arc::new(CancellableIo::new(backend, task_manager.token()));

        let inventory = Inventory::build(config, io)
            .await
            .with_context(|| format!("Failed to set up hardware from {}", config_manager.path().display()))?;
        let scheduler = Scheduler::new(inventory.into_loops(), config.poll)?;

        Ok(Application {
            task_manager,
            scheduler: Some(scheduler),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeIo;
    use pretty_assertions::assert_eq;
    use std::{io::Write, time::Duration};
    use tempfile::NamedTempFile;

    const YAML: &str = r#"
version: 1
sensors:
  - { kind: hwmon, name: cpu, device: /sys/hwmon1/temp1, crit: 80 }
fans:
  - { kind: pwm, name: case, device: /sys/hwmon2/pwm1, min_output: 0 }
controllers:
  - name: main
    inputs: [{ name: cpu }]
    outputs: [{ name: case }]
"#;

    async fn config_manager() -> (NamedTempFile, ConfigManager) {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(YAML.as_bytes()).unwrap();
        let manager = ConfigManager::load(Some(file.path().to_path_buf()))
            .await
            .unwrap();
        (file, manager)
    }

    #[tokio::test]
    async fn build_requires_config() {
        assert!(Application::builder().build().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn runs_until_shutdown_requested() {
        let (_file, manager) = config_manager().await;
        let io = Arc::new(FakeIo::new());
        io.set("/sys/hwmon1/temp1_input", 85_000);
        io.set("/sys/hwmon2/pwm1", 100);

        let mut app = Application::builder()
            .with_config_manager(manager)
            .with_device_io(io.clone())
            .build()
            .await
            .unwrap();
        let shutdown = app.shutdown_token();

        let running = tokio::spawn(async move { app.run().await });
        tokio::time::sleep(Duration::from_millis(2500)).await;
        shutdown.cancel();
        running.await.unwrap().unwrap();

        assert_eq!(io.value("/sys/hwmon2/pwm1_enable"), Some(1));
        let writes = io.writes_to("/sys/hwmon2/pwm1");
        assert!(writes.len() >= 2, "{writes:?}");
        assert!(writes.iter().all(|&duty| duty == 255));
    }

    #[tokio::test]
    async fn attach_failure_fails_build() {
        let (_file, manager) = config_manager().await;
        let io = Arc::new(FakeIo::new());
        io.fail("/sys/hwmon2/pwm1_enable");

        let result = Application::builder()
            .with_config_manager(manager)
            .with_device_io(io)
            .build()
            .await;
        assert!(result.is_err());
    }
}
