//! Builds the runtime object graph from a validated [`Config`].
//!
//! Sensors are created once and shared between every controller naming
//! them. Fans are attached (enable mode written) and then moved into the one
//! controller that drives them.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use futures::future::try_join_all;
use log::{info, warn};

use crate::{
    config::{Config, ControllerCfg, FanCfg, SensorCfg},
    controller::{ControlledFan, ControlledSensor, Controller, FanPolicy},
    device_io::DeviceIo,
    fan::{Fan, FanKind},
    fan_curve::FanCurve,
    scheduler::ControlLoop,
    sensor::{Sensor, SensorSource, read_critical},
};

pub struct Inventory {
    sensors: BTreeMap<String, Arc<Sensor>>,
    controllers: Vec<Controller>,
}

impl Inventory {
    /// Validates `config`, attaches every driven fan and assembles the
    /// controllers. A sensor without a critical threshold, or any attach
    /// failure, aborts the build.
    pub async fn build(config: &Config, io: Arc<dyn DeviceIo>) -> Result<Self> {
        config.validate()?;

        let sensors: BTreeMap<_, _> =
            try_join_all(config.sensors.iter().map(|cfg| build_sensor(cfg, &io)))
                .await?
                .into_iter()
                .map(|sensor| (sensor.name().to_string(), Arc::new(sensor)))
                .collect();

        let driven: Vec<&str> = config
            .controllers
            .iter()
            .flat_map(|c| c.outputs.iter().map(|o| o.name.as_str()))
            .collect();

        let mut fans: HashMap<String, Fan> = HashMap::new();
        for cfg in &config.fans {
            if driven.contains(&cfg.name()) {
                fans.insert(cfg.name().to_string(), build_fan(cfg, &io)?);
            } else {
                warn!("Leaving fan '{}' untouched, no controller drives it", cfg.name());
            }
        }

        try_join_all(fans.values().map(Fan::attach))
            .await
            .context("Failed to attach fans")?;

        let controllers = config
            .controllers
            .iter()
            .map(|cfg| build_controller(cfg, config.poll, &sensors, &mut fans))
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Inventory ready: {} sensors, {} controllers",
            sensors.len(),
            controllers.len()
        );

        Ok(Self {
            sensors,
            controllers,
        })
    }

    pub fn sensor(&self, name: &str) -> Option<&Arc<Sensor>> {
        self.sensors.get(name)
    }

    pub fn sensors(&self) -> impl Iterator<Item = &Arc<Sensor>> {
        self.sensors.values()
    }

    pub fn controllers(&self) -> &[Controller] {
        &self.controllers
    }

    /// Hands the controllers over to a scheduler.
    pub fn into_loops(self) -> Vec<Box<dyn ControlLoop>> {
        self.controllers
            .into_iter()
            .map(|c| Box::new(c) as Box<dyn ControlLoop>)
            .collect()
    }
}

/// hwmon sensors without a configured `crit` take the device's own.
async fn build_sensor(cfg: &SensorCfg, io: &Arc<dyn DeviceIo>) -> Result<Sensor> {
    let sensor = match cfg {
        SensorCfg::Hwmon {
            name,
            device,
            divisor,
            crit,
        } => {
            let crit = match crit {
                Some(crit) => *crit,
                None => read_critical(io.as_ref(), device, *divisor)
                    .await
                    .with_context(|| format!("Sensor '{name}' has no crit configured"))?,
            };
            Sensor::new(
                name.as_str(),
                SensorSource::hwmon(device, *divisor),
                crit,
                Arc::clone(io),
            )
        }
        SensorCfg::Smart { name, device, crit } => Sensor::new(
            name.as_str(),
            SensorSource::Smart {
                device: device.clone(),
            },
            *crit,
            Arc::clone(io),
        ),
    };
    info!(
        "Sensor {} critical at {:.1}°C",
        sensor.name(),
        sensor.critical_temperature()
    );
    Ok(sensor)
}

fn build_fan(cfg: &FanCfg, io: &Arc<dyn DeviceIo>) -> Result<Fan> {
    match cfg {
        FanCfg::Pwm {
            name,
            device,
            min_output,
            enable,
        } => Fan::new(
            name.as_str(),
            device.clone(),
            FanKind::Pwm {
                min_output: *min_output,
            },
            *enable,
            Arc::clone(io),
        ),
        FanCfg::Rotation {
            name,
            device,
            min_rot,
            max_rot,
            enable,
        } => Fan::new(
            name.as_str(),
            device.clone(),
            FanKind::Rotation {
                min_rot: *min_rot,
                max_rot: *max_rot,
            },
            *enable,
            Arc::clone(io),
        ),
    }
}

fn build_controller(
    cfg: &ControllerCfg,
    poll: Duration,
    sensors: &BTreeMap<String, Arc<Sensor>>,
    fans: &mut HashMap<String, Fan>,
) -> Result<Controller> {
    let inputs = cfg
        .inputs
        .iter()
        .map(|input| {
            sensors
                .get(&input.name)
                .map(|sensor| ControlledSensor::new(Arc::clone(sensor), input.weight))
                .with_context(|| {
                    format!("Controller '{}': unknown sensor '{}'", cfg.name, input.name)
                })
        })
        .collect::<Result<Vec<_>>>()?;

    let outputs = cfg
        .outputs
        .iter()
        .map(|output| {
            let fan = fans.remove(&output.name).with_context(|| {
                format!(
                    "Controller '{}': fan '{}' is unknown or already bound",
                    cfg.name, output.name
                )
            })?;
            let policy = match &output.curve {
                Some(points) => FanPolicy::Curve(FanCurve::new(points.clone())?),
                None => FanPolicy::Hysteresis,
            };
            Ok(ControlledFan::new(fan, policy))
        })
        .collect::<Result<Vec<_>>>()?;

    Controller::new(
        cfg.name.as_str(),
        inputs,
        outputs,
        cfg.history_capacity(poll),
        cfg.fluctuation_threshold,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{controller::TickOutcome, testing::FakeIo};
    use std::path::PathBuf;
    use pretty_assertions::assert_eq;

    const YAML: &str = r#"
version: 1
poll: 2s
sensors:
  - { kind: hwmon, name: cpu, device: /sys/hwmon1/temp1, crit: 85 }
  - { kind: smart, name: sda, device: /dev/sda, crit: 55 }
fans:
  - { kind: pwm, name: case, device: /sys/hwmon2/pwm1, min_output: 60 }
  - { kind: rotation, name: rear, device: /sys/hwmon2/fan2, enable: automatic }
  - { kind: pwm, name: spare, device: /sys/hwmon2/pwm3 }
controllers:
  - name: cpu
    history: 10s
    inputs:
      - { name: cpu, weight: 3 }
      - { name: sda }
    outputs:
      - name: case
        curve:
          - { temp: 30, output: 60 }
          - { temp: 70, output: 255 }
  - name: disks
    inputs:
      - { name: sda }
    outputs:
      - { name: rear }
"#;

    fn config() -> Config {
        Config::from_yaml(YAML).unwrap()
    }

    #[tokio::test]
    async fn builds_controllers_and_attaches_driven_fans() {
        let io = Arc::new(FakeIo::new());
        let inventory = Inventory::build(&config(), io.clone()).await.unwrap();

        let names: Vec<_> = inventory.controllers().iter().map(Controller::name).collect();
        assert_eq!(names, vec!["cpu", "disks"]);
        assert_eq!(inventory.controllers()[0].history().capacity(), 5);

        assert_eq!(io.value("/sys/hwmon2/pwm1_enable"), Some(1));
        assert_eq!(io.value("/sys/hwmon2/fan2_enable"), Some(2));
        assert_eq!(io.value("/sys/hwmon2/pwm3_enable"), None);
    }

    #[tokio::test]
    async fn sensors_are_shared_between_controllers() {
        let io = Arc::new(FakeIo::new());
        let inventory = Inventory::build(&config(), io).await.unwrap();

        let sda = inventory.sensor("sda").unwrap();
        // inventory, controller "cpu", controller "disks"
        assert_eq!(Arc::strong_count(sda), 3);
        assert_eq!(
            sda.source(),
            &SensorSource::Smart {
                device: "/dev/sda".into()
            }
        );
        assert_eq!(inventory.sensors().count(), 2);
    }

    #[tokio::test]
    async fn attach_failure_aborts_build() {
        let io = Arc::new(FakeIo::new());
        io.fail("/sys/hwmon2/fan2_enable");

        let err = Inventory::build(&config(), io).await.err().unwrap();
        assert!(format!("{err:#}").contains("rear"));
    }

    fn without_crit(config: &mut Config) {
        config.sensors[0] = SensorCfg::Hwmon {
            name: "cpu".into(),
            device: PathBuf::from("/sys/hwmon1/temp1"),
            divisor: 1000.0,
            crit: None,
        };
    }

    #[tokio::test]
    async fn missing_crit_is_read_from_device() {
        let mut config = config();
        without_crit(&mut config);
        let io = Arc::new(FakeIo::new());
        io.set("/sys/hwmon1/temp1_crit", 95_000);

        let inventory = Inventory::build(&config, io).await.unwrap();
        assert_eq!(inventory.sensor("cpu").unwrap().critical_temperature(), 95.0);
        assert_eq!(inventory.sensor("sda").unwrap().critical_temperature(), 55.0);
    }

    #[tokio::test]
    async fn configured_crit_wins_over_device() {
        let io = Arc::new(FakeIo::new());
        io.set("/sys/hwmon1/temp1_crit", 95_000);

        let inventory = Inventory::build(&config(), io).await.unwrap();
        assert_eq!(inventory.sensor("cpu").unwrap().critical_temperature(), 85.0);
    }

    #[tokio::test]
    async fn sensor_without_any_crit_aborts_build() {
        let mut config = config();
        without_crit(&mut config);
        let io = Arc::new(FakeIo::new());

        let err = Inventory::build(&config, io.clone()).await.err().unwrap();
        assert!(format!("{err:#}").contains("Sensor 'cpu' has no crit configured"));
        assert!(io.writes().is_empty());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut config = config();
        config.controllers[1].outputs[0].name = "case".into();

        let result = Inventory::build(&config, Arc::new(FakeIo::new())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn built_controllers_drive_hardware() {
        let io = Arc::new(FakeIo::new());
        io.set("/sys/hwmon1/temp1_input", 50_000);
        io.set_smart("/dev/sda", 30);
        io.set("/sys/hwmon2/fan2_input", 900);

        let inventory = Inventory::build(&config(), io.clone()).await.unwrap();
        let mut loops = inventory.into_loops();
        for control in &mut loops {
            control.iterate().await;
        }

        // (50 * 3 + 30) / 4 = 45, on the (30, 60) -> (70, 255) segment
        assert_eq!(io.value("/sys/hwmon2/pwm1"), Some(133));
        assert!(io.writes_to("/sys/hwmon2/fan2_target").is_empty());
    }

    #[tokio::test]
    async fn tick_outcome_reflects_weights() {
        let io = Arc::new(FakeIo::new());
        io.set("/sys/hwmon1/temp1_input", 50_000);
        io.set_smart("/dev/sda", 30);

        let mut inventory = Inventory::build(&config(), io).await.unwrap();
        let outcome = inventory.controllers[0].tick().await;
        assert!(matches!(outcome, TickOutcome::Regulated { weighted, .. } if weighted == 45.0));
    }
}
