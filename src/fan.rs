//! Fan outputs: PWM duty cycle or rotation setpoint.

use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::{Context, Result, bail};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{
    device_io::{self, DeviceIo},
    fan_curve::{FanCurve, MAX_PWM},
};

/// Hysteresis step for PWM fans, in duty cycle units.
pub const PWM_STEP: i64 = 5;

/// Hysteresis step for rotation fans, as a fraction of `max_rot`.
pub const ROTATION_STEP: f64 = 0.05;

/// Who drives the fan: the software loop or the chip itself.
///
/// Mirrors hwmon `pwmN_enable` semantics; the two modes are exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnableMode {
    /// Software control (sysfs value 1).
    #[default]
    Manual,
    /// Chip controlled (sysfs value 2).
    Automatic,
}

impl EnableMode {
    pub const fn sysfs_value(self) -> i64 {
        match self {
            EnableMode::Manual => 1,
            EnableMode::Automatic => 2,
        }
    }
}

/// Output unit of a fan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanKind {
    /// Duty cycle 0-255; values below `min_output` may stall the fan.
    Pwm { min_output: u8 },
    /// Rotation setpoint bounded by the device range.
    Rotation { min_rot: i64, max_rot: i64 },
}

/// A named fan output.
pub struct Fan {
    name: String,
    device: PathBuf,
    kind: FanKind,
    enable: EnableMode,
    io: Arc<dyn DeviceIo>,
}

impl fmt::Debug for Fan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fan")
            .field("name", &self.name)
            .field("device", &self.device)
            .field("kind", &self.kind)
            .field("enable", &self.enable)
            .finish_non_exhaustive()
    }
}

impl Fan {
    /// `device` is the hwmon attribute prefix, `pwmN` or `fanN`.
    ///
    /// # Errors
    ///
    /// A rotation range that is negative or inverted is rejected.
    pub fn new(
        name: impl Into<String>,
        device: impl Into<PathBuf>,
        kind: FanKind,
        enable: EnableMode,
        io: Arc<dyn DeviceIo>,
    ) -> Result<Self> {
        let name = name.into();
        if let FanKind::Rotation { min_rot, max_rot } = kind {
            if min_rot < 0 {
                bail!("Fan {name}: min_rot {min_rot} is negative");
            }
            if min_rot > max_rot {
                bail!("Fan {name}: min_rot {min_rot} exceeds max_rot {max_rot}");
            }
        }
        Ok(Self {
            name,
            device: device.into(),
            kind,
            enable,
            io,
        })
    }

    /// Pushes the enable mode to the device.
    pub async fn attach(&self) -> Result<()> {
        let path = device_io::attribute(&self.device, "_enable");
        self.io
            .write_value(&path, self.enable.sysfs_value())
            .await
            .with_context(|| format!("Failed to set enable mode of fan {}", self.name))?;
        info!("Fan {} attached in {:?} mode", self.name, self.enable);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn is_pwm(&self) -> bool {
        matches!(self.kind, FanKind::Pwm { .. })
    }

    /// Lowest value [`Fan::set_output`] will write.
    pub const fn min_output(&self) -> i64 {
        match self.kind {
            FanKind::Pwm { min_output } => min_output as i64,
            FanKind::Rotation { min_rot, .. } => min_rot,
        }
    }

    /// Rotation ceiling; `None` for PWM fans.
    pub const fn max_rot(&self) -> Option<i64> {
        match self.kind {
            FanKind::Pwm { .. } => None,
            FanKind::Rotation { max_rot, .. } => Some(max_rot),
        }
    }

    /// Full speed in the fan's own unit.
    pub const fn max_output(&self) -> i64 {
        match self.kind {
            FanKind::Pwm { .. } => MAX_PWM as i64,
            FanKind::Rotation { max_rot, .. } => max_rot,
        }
    }

    /// Hysteresis adjustment in the fan's own unit.
    pub fn step(&self) -> i64 {
        match self.kind {
            FanKind::Pwm { .. } => PWM_STEP,
            FanKind::Rotation { max_rot, .. } => ((max_rot as f64 * ROTATION_STEP).round() as i64).max(1),
        }
    }

    pub fn clamp(&self, value: i64) -> i64 {
        value.clamp(self.min_output(), self.max_output())
    }

    /// Current duty cycle, or measured rotation for rotation fans.
    pub async fn current_output(&self) -> Result<i64> {
        let path = match self.kind {
            FanKind::Pwm { .. } => self.device.clone(),
            FanKind::Rotation { .. } => device_io::attribute(&self.device, "_input"),
        };
        self.io
            .read_value(&path)
            .await
            .with_context(|| format!("Failed to read output of fan {}", self.name))
    }

    /// Writes `value` clamped to the fan's bounds.
    pub async fn set_output(&self, value: i64) -> Result<()> {
        let clamped = self.clamp(value);
        let path = match self.kind {
            FanKind::Pwm { .. } => self.device.clone(),
            FanKind::Rotation { .. } => device_io::attribute(&self.device, "_target"),
        };

        debug!("Setting output {clamped} on fan {}", self.name);
        self.io
            .write_value(&path, clamped)
            .await
            .with_context(|| format!("Failed to set output of fan {}", self.name))
    }

    pub async fn set_maximum(&self) -> Result<()> {
        self.set_output(self.max_output()).await
    }

    /// Moves the output by `steps` hysteresis steps from its current value.
    pub async fn nudge(&self, steps: i64) -> Result<()> {
        let current = self.current_output().await?;
        self.set_output(current + steps * self.step()).await
    }

    /// Applies `curve` at `temperature`; `ceiling` is where the curve reaches
    /// full speed past its last point.
    pub async fn follow_curve(&self, curve: &FanCurve, temperature: f64, ceiling: f64) -> Result<()> {
        let duty = curve.output_at(temperature, ceiling);
        let value = match self.kind {
            FanKind::Pwm { .. } => duty,
            FanKind::Rotation { max_rot, .. } => duty / f64::from(MAX_PWM) * max_rot as f64,
        };
        self.set_output(value.round() as i64).await
    }
}
