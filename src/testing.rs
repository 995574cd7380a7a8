//! In-memory hardware used by unit tests.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use crate::device_io::DeviceIo;

/// Fake sysfs tree: attribute values keyed by path, with injectable failures
/// and a log of every successful write.
#[derive(Debug, Default)]
pub struct FakeIo {
    values: Mutex<HashMap<PathBuf, i64>>,
    smart: Mutex<HashMap<PathBuf, i64>>,
    failing: Mutex<HashSet<PathBuf>>,
    writes: Mutex<Vec<(PathBuf, i64)>>,
    delay: Duration,
}

impl FakeIo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps for `delay` before answering.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn set(&self, path: impl Into<PathBuf>, value: i64) {
        self.values.lock().unwrap().insert(path.into(), value);
    }

    pub fn set_smart(&self, device: impl Into<PathBuf>, value: i64) {
        self.smart.lock().unwrap().insert(device.into(), value);
    }

    pub fn fail(&self, path: impl Into<PathBuf>) {
        self.failing.lock().unwrap().insert(path.into());
    }

    pub fn recover(&self, path: impl AsRef<Path>) {
        self.failing.lock().unwrap().remove(path.as_ref());
    }

    pub fn value(&self, path: impl AsRef<Path>) -> Option<i64> {
        self.values.lock().unwrap().get(path.as_ref()).copied()
    }

    pub fn writes(&self) -> Vec<(PathBuf, i64)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn writes_to(&self, path: impl AsRef<Path>) -> Vec<i64> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == path.as_ref())
            .map(|(_, v)| *v)
            .collect()
    }

    fn check(&self, path: &Path) -> Result<()> {
        if self.failing.lock().unwrap().contains(path) {
            return Err(anyhow!("Injected failure on {}", path.display()));
        }
        Ok(())
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl DeviceIo for FakeIo {
    async fn read_value(&self, path: &Path) -> Result<i64> {
        self.pause().await;
        self.check(path)?;
        self.value(path)
            .ok_or_else(|| anyhow!("No such attribute {}", path.display()))
    }

    async fn write_value(&self, path: &Path, value: i64) -> Result<()> {
        self.pause().await;
        self.check(path)?;
        self.values
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), value);
        self.writes
            .lock()
            .unwrap()
            .push((path.to_path_buf(), value));
        Ok(())
    }

    async fn read_smart_temperature(&self, device: &Path) -> Result<Option<i64>> {
        self.pause().await;
        self.check(device)?;
        Ok(self.smart.lock().unwrap().get(device).copied())
    }
}
