//! Closed-loop evaluation of one group of sensors and fans.
//!
//! Each tick a [`Controller`] reads its sensors, folds them into a weighted
//! temperature, and drives its fans: full speed when any sensor is critical,
//! along the configured curve for curve-bound fans, and in coarse hysteresis
//! steps for the rest.

use std::{
    collections::{BTreeMap, btree_map::Entry},
    sync::Arc,
};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, error, info, warn};

use crate::{
    fan::Fan,
    fan_curve::FanCurve,
    ring_buffer::RingBuffer,
    scheduler::ControlLoop,
    sensor::Sensor,
};

/// A sensor as seen by one controller.
#[derive(Debug, Clone)]
pub struct ControlledSensor {
    pub sensor: Arc<Sensor>,
    pub weight: f64,
}

impl ControlledSensor {
    pub fn new(sensor: Arc<Sensor>, weight: f64) -> Self {
        Self { sensor, weight }
    }
}

/// How a fan reacts to the weighted temperature.
#[derive(Debug, Clone, PartialEq)]
pub enum FanPolicy {
    /// Step-wise adjustment once the temperature moved past the threshold.
    Hysteresis,
    /// Continuous tracking of a curve.
    Curve(FanCurve),
}

/// A fan owned by one controller together with its policy.
#[derive(Debug)]
pub struct ControlledFan {
    pub fan: Fan,
    pub policy: FanPolicy,
}

impl ControlledFan {
    pub fn new(fan: Fan, policy: FanPolicy) -> Self {
        Self { fan, policy }
    }
}

/// Direction of a hysteresis adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Hold,
    Increase,
    Decrease,
}

impl Adjustment {
    /// Compares `weighted` with the temperature acted on last.
    ///
    /// Only a change strictly larger than `threshold` triggers an adjustment.
    pub fn decide(last_acted: f64, weighted: f64, threshold: f64) -> Self {
        let delta = weighted - last_acted;
        if delta > threshold {
            Adjustment::Increase
        } else if -delta > threshold {
            Adjustment::Decrease
        } else {
            Adjustment::Hold
        }
    }

    const fn steps(self) -> i64 {
        match self {
            Adjustment::Hold => 0,
            Adjustment::Increase => 1,
            Adjustment::Decrease => -1,
        }
    }
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    /// No sensor delivered a reading; fans untouched.
    NoData,
    /// A sensor was critical or unreadable; every fan driven to maximum.
    Critical { weighted: f64 },
    /// Normal regulation.
    Regulated { weighted: f64, adjustment: Adjustment },
}

/// Weighted mean over the sensors that produced a reading.
pub fn weighted_temperature(readings: impl IntoIterator<Item = (f64, Option<f64>)>) -> Option<f64> {
    let (sum, weights) = readings
        .into_iter()
        .filter_map(|(weight, temp)| temp.map(|t| (t * weight, weight)))
        .fold((0.0, 0.0), |(sum, weights), (value, weight)| {
            (sum + value, weights + weight)
        });

    (weights > 0.0).then(|| sum / weights)
}

pub struct Controller {
    name: String,
    inputs: BTreeMap<String, ControlledSensor>,
    outputs: BTreeMap<String, ControlledFan>,
    history: RingBuffer<f64>,
    last_acted: Option<f64>,
    fluctuation_threshold: f64,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.name)
            .field("inputs", &self.inputs.keys().collect::<Vec<_>>())
            .field("outputs", &self.outputs.keys().collect::<Vec<_>>())
            .field("last_acted", &self.last_acted)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Assembles a controller.
    ///
    /// # Errors
    ///
    /// Rejects an empty input or output set, a sensor or fan named twice,
    /// non-positive weights, and a zero history capacity.
    pub fn new(
        name: impl Into<String>,
        inputs: Vec<ControlledSensor>,
        outputs: Vec<ControlledFan>,
        history_capacity: usize,
        fluctuation_threshold: f64,
    ) -> Result<Self> {
        let name = name.into();

        if inputs.is_empty() {
            bail!("Controller '{name}' has no inputs");
        }
        if outputs.is_empty() {
            bail!("Controller '{name}' has no outputs");
        }

        let mut input_map = BTreeMap::new();
        for input in inputs {
            if !(input.weight.is_finite() && input.weight > 0.0) {
                bail!(
                    "Controller '{name}': sensor '{}' has invalid weight {}",
                    input.sensor.name(),
                    input.weight
                );
            }
            match input_map.entry(input.sensor.name().to_string()) {
                Entry::Occupied(e) => bail!("Controller '{name}' uses sensor '{}' twice", e.key()),
                Entry::Vacant(e) => {
                    e.insert(input);
                }
            }
        }

        let mut output_map = BTreeMap::new();
        for output in outputs {
            match output_map.entry(output.fan.name().to_string()) {
                Entry::Occupied(e) => bail!("Controller '{name}' drives fan '{}' twice", e.key()),
                Entry::Vacant(e) => {
                    e.insert(output);
                }
            }
        }

        let history = RingBuffer::new(history_capacity)
            .with_context(|| format!("Controller '{name}'"))?;

        Ok(Self {
            name,
            inputs: input_map,
            outputs: output_map,
            history,
            last_acted: None,
            fluctuation_threshold,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn history(&self) -> &RingBuffer<f64> {
        &self.history
    }

    pub const fn last_acted(&self) -> Option<f64> {
        self.last_acted
    }

    /// Lowest critical threshold among the inputs; curves reach full speed
    /// there at the latest.
    pub fn lowest_critical_temperature(&self) -> f64 {
        self.inputs
            .values()
            .map(|input| input.sensor.critical_temperature())
            .fold(f64::INFINITY, f64::min)
    }

    /// Runs one evaluation. Device failures are logged, never returned.
    pub async fn tick(&mut self) -> TickOutcome {
        let readings = join_all(self.inputs.values().map(|input| async move {
            let temp = input.sensor.temperature().await;
            (input, temp)
        }))
        .await;

        let Some(weighted) =
            weighted_temperature(readings.iter().map(|(input, temp)| (input.weight, *temp)))
        else {
            warn!("Controller {}: no sensor delivered a temperature, skipping tick", self.name);
            return TickOutcome::NoData;
        };

        self.history.push(weighted);
        debug!(
            "Controller {}: weighted temperature {weighted:.2}°C, mean over {} samples {:.2}°C",
            self.name,
            self.history.len(),
            self.history.mean().unwrap_or(weighted)
        );

        let critical: Vec<&str> = readings
            .iter()
            .filter(|(input, temp)| input.sensor.is_critical_at(*temp))
            .map(|(input, _)| input.sensor.name())
            .collect();

        if !critical.is_empty() {
            warn!(
                "Controller {}: sensors {critical:?} critical or unreadable, full speed",
                self.name
            );
            self.drive_maximum().await;
            self.last_acted = Some(weighted);
            return TickOutcome::Critical { weighted };
        }

        self.follow_curves(weighted).await;

        let adjustment = match self.last_acted {
            None => {
                self.last_acted = Some(weighted);
                Adjustment::Hold
            }
            Some(last) => Adjustment::decide(last, weighted, self.fluctuation_threshold),
        };

        if adjustment != Adjustment::Hold {
            info!(
                "Controller {}: temperature moved to {weighted:.2}°C, {adjustment:?}",
                self.name
            );
            self.step_fans(adjustment).await;
            self.last_acted = Some(weighted);
        }

        TickOutcome::Regulated {
            weighted,
            adjustment,
        }
    }

    async fn drive_maximum(&self) {
        for output in self.outputs.values() {
            if let Err(e) = output.fan.set_maximum().await {
                error!("Controller {}: {e:#}", self.name);
            }
        }
    }

    async fn follow_curves(&self, weighted: f64) {
        let ceiling = self.lowest_critical_temperature();
        for output in self.outputs.values() {
            if let FanPolicy::Curve(curve) = &output.policy {
                if let Err(e) = output.fan.follow_curve(curve, weighted, ceiling).await {
                    error!("Controller {}: {e:#}", self.name);
                }
            }
        }
    }

    async fn step_fans(&self, adjustment: Adjustment) {
        for output in self.outputs.values() {
            if output.policy == FanPolicy::Hysteresis {
                if let Err(e) = output.fan.nudge(adjustment.steps()).await {
                    error!("Controller {}: {e:#}", self.name);
                }
            }
        }
    }
}

#[async_trait]
impl ControlLoop for Controller {
    fn name(&self) -> &str {
        &self.name
    }

    async fn iterate(&mut self) {
        let outcome = self.tick().await;
        debug!("Controller {}: {outcome:?}", self.name);
    }
}
