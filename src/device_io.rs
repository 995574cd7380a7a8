//! Raw device access for hwmon attributes and SMART capable disks.
//!
//! Everything the control loop knows about hardware goes through
//! [`DeviceIo`], so sensors and fans can be driven by an in-memory fake in
//! tests and by [`SysfsIo`] on a real host.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use log::debug;
#[cfg(test)]
use mockall::automock;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::smart;

/// Default location of the smartmontools binary.
pub const DEFAULT_SMARTCTL: &str = "/usr/sbin/smartctl";

/// Builds a sibling attribute path, e.g. `temp1` + `_input`.
pub fn attribute(base: &Path, suffix: &str) -> PathBuf {
    let mut path = base.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}

/// Scaled-integer device access.
///
/// hwmon exposes every attribute as a single decimal integer per file; the
/// caller owns the scaling (millidegrees, duty cycle, RPM).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeviceIo: Send + Sync {
    /// Reads one integer attribute.
    async fn read_value(&self, path: &Path) -> Result<i64>;

    /// Writes one integer attribute.
    async fn write_value(&self, path: &Path, value: i64) -> Result<()>;

    /// Asks the disk diagnostic tool for the drive temperature in °C.
    ///
    /// `Ok(None)` means the tool ran but reported no temperature attribute.
    async fn read_smart_temperature(&self, device: &Path) -> Result<Option<i64>>;
}

/// [`DeviceIo`] backed by sysfs files and `smartctl`.
#[derive(Debug, Clone)]
pub struct SysfsIo {
    smartctl: PathBuf,
}

impl SysfsIo {
    pub fn new(smartctl: impl Into<PathBuf>) -> Self {
        Self {
            smartctl: smartctl.into(),
        }
    }
}

impl Default for SysfsIo {
    fn default() -> Self {
        Self::new(DEFAULT_SMARTCTL)
    }
}

#[async_trait]
impl DeviceIo for SysfsIo {
    async fn read_value(&self, path: &Path) -> Result<i64> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;

        raw.trim()
            .parse()
            .with_context(|| format!("Malformed value {:?} in {}", raw.trim(), path.display()))
    }

    async fn write_value(&self, path: &Path, value: i64) -> Result<()> {
        debug!("Writing {value} to {}", path.display());
        tokio::fs::write(path, value.to_string())
            .await
            .with_context(|| format!("Failed to write {value} to {}", path.display()))
    }

    async fn read_smart_temperature(&self, device: &Path) -> Result<Option<i64>> {
        // smartctl encodes warnings in its exit status bitmask, so the output
        // is parsed even when the status is non-zero.
        let output = Command::new(&self.smartctl)
            .arg("-A")
            .arg(device)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.smartctl.display()))?;

        if output.stdout.is_empty() {
            return Err(anyhow!(
                "{} produced no output for {} (status {})",
                self.smartctl.display(),
                device.display(),
                output.status
            ));
        }

        Ok(smart::parse_temperature(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }
}

/// Wraps another [`DeviceIo`] and abandons any call that is still in flight
/// when the token is cancelled.
pub struct CancellableIo {
    inner: Arc<dyn DeviceIo>,
    cancel: CancellationToken,
}

impl CancellableIo {
    pub fn new(inner: Arc<dyn DeviceIo>, cancel: CancellationToken) -> Self {
        Self { inner, cancel }
    }

    async fn guard<T>(&self, op: impl Future<Output = Result<T>> + Send) -> Result<T> {
        if self.cancel.is_cancelled() {
            bail!("Device access cancelled");
        }
        tokio::select! {
            () = self.cancel.cancelled() => bail!("Device access cancelled"),
            result = op => result,
        }
    }
}

#[async_trait]
impl DeviceIo for CancellableIo {
    async fn read_value(&self, path: &Path) -> Result<i64> {
        self.guard(self.inner.read_value(path)).await
    }

    async fn write_value(&self, path: &Path, value: i64) -> Result<()> {
        self.guard(self.inner.write_value(path, value)).await
    }

    async fn read_smart_temperature(&self, device: &Path) -> Result<Option<i64>> {
        self.guard(self.inner.read_smart_temperature(device)).await
    }
}
