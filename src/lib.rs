//! # fancontrold
//!
//! A Linux daemon that keeps fans driven through hwmon sysfs in step with
//! the temperatures of the machine.
//!
//! ## Architecture
//!
//! - [`Sensor`](sensor::Sensor) reads an hwmon attribute or asks smartctl.
//! - [`Fan`](fan::Fan) writes a PWM duty cycle or a rotation setpoint.
//! - [`Controller`](controller::Controller) folds weighted sensor readings
//!   into one temperature and moves its fans along a curve or in hysteresis
//!   steps, falling back to full speed when a sensor is critical.
//! - [`Scheduler`](scheduler::Scheduler) runs every controller once per tick
//!   and waits for all of them before arming the next tick.
//!
//! ## Example
//!
//! ```no_run
//! use fancontrold::{application::Application, config::ConfigManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config_manager = ConfigManager::load(None).await?;
//!     Application::builder()
//!         .with_config_manager(config_manager)
//!         .build()
//!         .await?
//!         .run()
//!         .await
//! }
//! ```

pub mod application;
pub mod cli;
pub mod config;
pub mod controller;
pub mod device_io;
pub mod fan;
pub mod fan_curve;
pub mod inventory;
pub mod latch;
pub mod ring_buffer;
pub mod scheduler;
pub mod sensor;
pub mod smart;
pub mod task_manager;

#[cfg(test)]
mod testing;
