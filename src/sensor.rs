//! Temperature sources.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use log::{debug, error};
use tokio::sync::RwLock;

use crate::device_io::{self, DeviceIo};

/// Where a sensor gets its reading from.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorSource {
    /// hwmon `tempN_input`, scaled down by `divisor`.
    Hwmon { input: PathBuf, divisor: f64 },
    /// Drive temperature reported by smartctl, whole degrees.
    Smart { device: PathBuf },
}

impl SensorSource {
    /// hwmon source for an attribute prefix such as `.../hwmon1/temp1`.
    pub fn hwmon(device: &Path, divisor: f64) -> Self {
        Self::Hwmon {
            input: device_io::attribute(device, "_input"),
            divisor,
        }
    }
}

/// A named temperature source with a critical threshold.
///
/// The outcome of the most recent read is cached so criticality can be
/// judged without touching the hardware a second time in the same tick.
pub struct Sensor {
    name: String,
    source: SensorSource,
    critical: f64,
    io: Arc<dyn DeviceIo>,
    last: RwLock<Option<f64>>,
}

impl std::fmt::Debug for Sensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sensor")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("critical", &self.critical)
            .finish_non_exhaustive()
    }
}

impl Sensor {
    pub fn new(
        name: impl Into<String>,
        source: SensorSource,
        critical: f64,
        io: Arc<dyn DeviceIo>,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            critical,
            io,
            last: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &SensorSource {
        &self.source
    }

    pub const fn critical_temperature(&self) -> f64 {
        self.critical
    }

    /// Reads the current temperature in °C.
    ///
    /// Any device failure is logged and reported as `None`.
    pub async fn temperature(&self) -> Option<f64> {
        let reading = match self.read().await {
            Ok(temp) => {
                debug!("Temperature of {}: {temp:.2}°C", self.name);
                Some(temp)
            }
            Err(e) => {
                error!("Failed to read temperature of {}: {e:#}", self.name);
                None
            }
        };

        *self.last.write().await = reading;
        reading
    }

    /// Outcome of the most recent [`Sensor::temperature`] call.
    pub async fn last_reading(&self) -> Option<f64> {
        *self.last.read().await
    }

    /// True above the critical threshold, and whenever the last read failed.
    pub async fn is_critical(&self) -> bool {
        self.is_critical_at(self.last_reading().await)
    }

    /// Judges a reading taken by [`Sensor::temperature`]; `None` is critical.
    pub fn is_critical_at(&self, reading: Option<f64>) -> bool {
        reading.is_none_or(|temp| temp > self.critical)
    }

    async fn read(&self) -> Result<f64> {
        match &self.source {
            SensorSource::Hwmon { input, divisor } => {
                let raw = self.io.read_value(input).await?;
                Ok(raw as f64 / divisor)
            }
            SensorSource::Smart { device } => self
                .io
                .read_smart_temperature(device)
                .await?
                .map(|temp| temp as f64)
                .ok_or_else(|| anyhow!("No temperature attribute for {}", device.display())),
        }
    }
}

/// Reads the critical threshold an hwmon device reports in `<device>_crit`.
pub async fn read_critical(io: &dyn DeviceIo, device: &Path, divisor: f64) -> Result<f64> {
    let path = device_io::attribute(device, "_crit");
    let raw = io
        .read_value(&path)
        .await
        .with_context(|| format!("No critical temperature at {}", path.display()))?;
    Ok(raw as f64 / divisor)
}
