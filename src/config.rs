//! Configuration management for the fancontrold daemon.
//!
//! Handles loading, parsing, and validation of the YAML file that declares
//! sensors, fans, and the controllers tying them together.

use crate::{
    device_io::DEFAULT_SMARTCTL,
    fan::EnableMode,
    fan_curve::{CurvePoint, FanCurve},
};
use anyhow::{Context, Result, bail};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    env, fmt,
    path::{Path, PathBuf},
    time::Duration,
};

/// Only configuration version understood by this build.
pub const CONFIG_VERSION: u8 = 1;

/// Environment variable overriding the configuration search.
pub const CONFIG_ENV: &str = "FANCONTROLD_CONFIG";

/// Upper bound on the samples a controller keeps: one day at one per second.
pub const MAX_HISTORY_SAMPLES: usize = 86_400;

/// Main configuration structure.
///
/// Time settings take a bare number of seconds (`poll: 2`) or a string with
/// units (`poll: 500ms`, `history: 1m30s`).
///
/// # Example
///
/// ```yaml
/// version: 1
/// poll: 1s
/// sensors:
///   - kind: hwmon
///     name: cpu
///     device: /sys/class/hwmon/hwmon1/temp1
/// fans:
///   - kind: pwm
///     name: case
///     device: /sys/class/hwmon/hwmon2/pwm1
/// controllers:
///   - name: main
///     inputs:
///       - { name: cpu }
///     outputs:
///       - name: case
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Configuration version for compatibility checking.
    pub version: u8,

    /// Tick period.
    #[serde(default = "defaults::poll", alias = "poll_seconds", with = "duration")]
    pub poll: Duration,

    /// Path of the smartctl binary used by SMART sensors.
    #[serde(default = "defaults::smartctl")]
    pub smartctl: PathBuf,

    #[serde(default)]
    pub sensors: Vec<SensorCfg>,

    #[serde(default)]
    pub fans: Vec<FanCfg>,

    #[serde(default)]
    pub controllers: Vec<ControllerCfg>,
}

/// Temperature sensor configuration variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SensorCfg {
    /// hwmon temperature attribute, e.g. `/sys/class/hwmon/hwmon1/temp1`.
    Hwmon {
        name: String,
        device: PathBuf,
        /// Raw value per degree; hwmon reports millidegrees.
        #[serde(default = "defaults::divisor")]
        divisor: f64,
        /// Falls back to the device's own `_crit` attribute when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        crit: Option<f64>,
    },
    /// Drive temperature queried through smartctl.
    Smart {
        name: String,
        device: PathBuf,
        #[serde(default = "defaults::crit")]
        crit: f64,
    },
}

impl SensorCfg {
    pub fn name(&self) -> &str {
        match self {
            SensorCfg::Hwmon { name, .. } | SensorCfg::Smart { name, .. } => name,
        }
    }

    /// Configured critical threshold; `None` means ask the device.
    pub fn crit(&self) -> Option<f64> {
        match self {
            SensorCfg::Hwmon { crit, .. } => *crit,
            SensorCfg::Smart { crit, .. } => Some(*crit),
        }
    }
}

/// Fan output configuration variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FanCfg {
    /// PWM duty cycle output, e.g. `/sys/class/hwmon/hwmon2/pwm1`.
    Pwm {
        name: String,
        device: PathBuf,
        #[serde(default = "defaults::min_output")]
        min_output: u8,
        #[serde(default)]
        enable: EnableMode,
    },
    /// Rotation setpoint output, e.g. `/sys/class/hwmon/hwmon2/fan2`.
    Rotation {
        name: String,
        device: PathBuf,
        #[serde(default)]
        min_rot: i64,
        #[serde(default = "defaults::max_rot")]
        max_rot: i64,
        #[serde(default)]
        enable: EnableMode,
    },
}

impl FanCfg {
    pub fn name(&self) -> &str {
        match self {
            FanCfg::Pwm { name, .. } | FanCfg::Rotation { name, .. } => name,
        }
    }
}

/// A control loop: weighted inputs driving a set of outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerCfg {
    pub name: String,

    /// Span of weighted temperatures kept in history.
    #[serde(default = "defaults::history", alias = "history_seconds", with = "duration")]
    pub history: Duration,

    /// Change in °C needed before hysteresis fans are stepped.
    #[serde(default = "defaults::fluctuation_threshold")]
    pub fluctuation_threshold: f64,

    pub inputs: Vec<InputCfg>,

    pub outputs: Vec<OutputCfg>,
}

impl ControllerCfg {
    /// Number of history samples: `ceil(history / poll)`, saturating.
    pub fn history_capacity(&self, poll: Duration) -> usize {
        if poll.is_zero() {
            return 0;
        }
        (self.history.as_secs_f64() / poll.as_secs_f64()).ceil() as usize
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputCfg {
    /// Sensor name.
    pub name: String,

    #[serde(default = "defaults::weight")]
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputCfg {
    /// Fan name.
    pub name: String,

    /// Follow this curve instead of hysteresis stepping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub curve: Option<Vec<CurvePoint>>,
}

impl Config {
    /// Parses a YAML document and validates it.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content).context("Failed to parse YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration for consistency.
    ///
    /// Checks name uniqueness, that every reference resolves, that each fan
    /// is driven by one controller at most, and every numeric bound.
    pub fn validate(&self) -> Result<()> {
        if self.version != CONFIG_VERSION {
            bail!("Unsupported config version {}", self.version);
        }
        if self.poll.is_zero() {
            bail!("poll interval must be positive");
        }

        let mut sensors = HashSet::new();
        for sensor in &self.sensors {
            if !sensors.insert(sensor.name()) {
                bail!("Duplicate sensor name '{}'", sensor.name());
            }
            if let Some(crit) = sensor.crit().filter(|c| !c.is_finite()) {
                bail!("Sensor '{}' has invalid crit {crit}", sensor.name());
            }
            if let SensorCfg::Hwmon { name, divisor, .. } = sensor {
                if !divisor.is_finite() || *divisor <= 0.0 {
                    bail!("Sensor '{name}' has invalid divisor {divisor}");
                }
            }
        }

        let mut fans = HashSet::new();
        for fan in &self.fans {
            if !fans.insert(fan.name()) {
                bail!("Duplicate fan name '{}'", fan.name());
            }
            if let FanCfg::Rotation {
                name,
                min_rot,
                max_rot,
                ..
            } = fan
            {
                if min_rot > max_rot {
                    bail!("Fan '{name}': min_rot {min_rot} exceeds max_rot {max_rot}");
                }
                if *min_rot < 0 {
                    bail!("Fan '{name}': min_rot must not be negative");
                }
            }
        }

        let mut controllers = HashSet::new();
        let mut bound: HashMap<&str, &str> = HashMap::new();
        for controller in &self.controllers {
            let name = controller.name.as_str();
            if !controllers.insert(name) {
                bail!("Duplicate controller name '{name}'");
            }
            if controller.inputs.is_empty() {
                bail!("Controller '{name}' has no inputs");
            }
            if controller.outputs.is_empty() {
                bail!("Controller '{name}' has no outputs");
            }
            match controller.history_capacity(self.poll) {
                0 => bail!(
                    "Controller '{name}': history of {:?} gives an empty history",
                    controller.history
                ),
                n if n > MAX_HISTORY_SAMPLES => bail!(
                    "Controller '{name}': history of {:?} needs {n} samples, at most {MAX_HISTORY_SAMPLES} allowed",
                    controller.history
                ),
                _ => {}
            }
            if !controller.fluctuation_threshold.is_finite() || controller.fluctuation_threshold < 0.0 {
                bail!(
                    "Controller '{name}' has invalid fluctuation_threshold {}",
                    controller.fluctuation_threshold
                );
            }

            let mut inputs = HashSet::new();
            for input in &controller.inputs {
                if !sensors.contains(input.name.as_str()) {
                    bail!("Controller '{name}' references unknown sensor '{}'", input.name);
                }
                if !inputs.insert(input.name.as_str()) {
                    bail!("Controller '{name}' lists sensor '{}' twice", input.name);
                }
                if !input.weight.is_finite() || input.weight <= 0.0 {
                    bail!(
                        "Controller '{name}': sensor '{}' has invalid weight {}",
                        input.name,
                        input.weight
                    );
                }
            }

            for output in &controller.outputs {
                if !fans.contains(output.name.as_str()) {
                    bail!("Controller '{name}' references unknown fan '{}'", output.name);
                }
                if let Some(other) = bound.insert(&output.name, name) {
                    if other == name {
                        bail!("Controller '{name}' lists fan '{}' twice", output.name);
                    }
                    bail!(
                        "Fan '{}' is bound to both '{other}' and '{name}'",
                        output.name
                    );
                }
                if let Some(points) = &output.curve {
                    FanCurve::new(points.clone()).with_context(|| {
                        format!("Controller '{name}': invalid curve for fan '{}'", output.name)
                    })?;
                }
            }
        }

        for fan in &self.fans {
            if !bound.contains_key(fan.name()) {
                warn!("Fan '{}' is not driven by any controller", fan.name());
            }
        }

        Ok(())
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} sensors, {} fans, {} controllers, polling every {:?}",
            self.sensors.len(),
            self.fans.len(),
            self.controllers.len(),
            self.poll
        )?;
        for controller in &self.controllers {
            let inputs: Vec<_> = controller.inputs.iter().map(|i| i.name.as_str()).collect();
            let outputs: Vec<_> = controller
                .outputs
                .iter()
                .map(|o| {
                    if o.curve.is_some() {
                        format!("{} (curve)", o.name)
                    } else {
                        o.name.clone()
                    }
                })
                .collect();
            writeln!(
                f,
                "  {}: [{}] -> [{}], history {} samples",
                controller.name,
                inputs.join(", "),
                outputs.join(", "),
                controller.history_capacity(self.poll)
            )?;
        }
        Ok(())
    }
}

mod defaults {
    use std::{path::PathBuf, time::Duration};

    pub fn poll() -> Duration {
        Duration::from_secs(1)
    }

    pub fn smartctl() -> PathBuf {
        PathBuf::from(super::DEFAULT_SMARTCTL)
    }

    pub fn divisor() -> f64 {
        1000.0
    }

    pub fn crit() -> f64 {
        90.0
    }

    pub fn min_output() -> u8 {
        80
    }

    pub fn max_rot() -> i64 {
        1500
    }

    pub fn history() -> Duration {
        Duration::from_secs(5)
    }

    pub fn fluctuation_threshold() -> f64 {
        5.0
    }

    pub fn weight() -> f64 {
        1.0
    }
}

/// Time settings: bare seconds or a string such as `500ms`, `2s`, `1m30s`.
pub mod duration {
    use std::time::Duration;

    use anyhow::{Context, Result, bail};
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    /// Parses a sequence of `<number><unit>` terms; a term without a unit
    /// counts as seconds.
    pub fn parse(text: &str) -> Result<Duration> {
        let text = text.trim();
        if text.is_empty() {
            bail!("Empty duration");
        }

        let mut seconds = 0.0;
        let mut rest = text;
        while !rest.is_empty() {
            let number_end = rest
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .unwrap_or(rest.len());
            let (number, tail) = rest.split_at(number_end);
            let value: f64 = number
                .parse()
                .with_context(|| format!("Invalid duration '{text}'"))?;

            let unit_end = tail
                .find(|c: char| c.is_ascii_digit() || c == '.')
                .unwrap_or(tail.len());
            let (unit, next) = tail.split_at(unit_end);
            let scale = match unit.trim() {
                "" | "s" | "sec" | "secs" | "second" | "seconds" => 1.0,
                "ms" | "msec" | "millis" => 0.001,
                "m" | "min" | "mins" | "minute" | "minutes" => 60.0,
                "h" | "hour" | "hours" => 3600.0,
                other => bail!("Unknown unit '{other}' in duration '{text}'"),
            };

            seconds += value * scale;
            rest = next.trim_start();
        }

        Duration::try_from_secs_f64(seconds).with_context(|| format!("Duration '{text}' out of range"))
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(f64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(seconds) => Duration::try_from_secs_f64(seconds).map_err(D::Error::custom),
            Raw::Text(text) => parse(&text).map_err(|e| D::Error::custom(format!("{e:#}"))),
        }
    }

    pub fn serialize<S>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(value.as_secs_f64())
    }
}

fn locate_config() -> Result<PathBuf> {
    if let Ok(env_path) = env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(env_path));
    }

    if let Some(mut cfg_dir) = env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|h| Path::new(&h).join(".config")))
    {
        cfg_dir.push("fancontrold/config.yml");
        if cfg_dir.exists() {
            return Ok(cfg_dir);
        }
    }

    let etc = Path::new("/etc/fancontrold/config.yml");
    if etc.exists() {
        return Ok(etc.to_path_buf());
    }

    bail!("Configuration file not found in any standard location")
}

/// A validated configuration together with the file it came from.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: Config,
    path: PathBuf,
}

impl ConfigManager {
    /// Loads configuration from file or standard locations.
    ///
    /// Searches for configuration in the following order:
    /// 1. Provided path parameter
    /// 2. `FANCONTROLD_CONFIG` environment variable
    /// 3. `$XDG_CONFIG_HOME/fancontrold/config.yml` or `~/.config/fancontrold/config.yml`
    /// 4. `/etc/fancontrold/config.yml`
    pub async fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = match path {
            Some(p) => p,
            None => locate_config().context("No configuration file found")?,
        };

        info!("Loading config from: {}", path.display());
        let config = Self::load_config_from_path(&path).await?;

        Ok(Self { config, path })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load_config_from_path(path: &Path) -> Result<Config> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML in: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Configuration validation failed for: {}", path.display()))?;

        Ok(config)
    }
}
