//! Periodic driver for the control loops.
//!
//! Every tick runs each loop once on its own task and waits for all of them
//! before the interval is re-armed, so ticks never overlap and a slow loop
//! delays the next tick for everybody.

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use anyhow::{Result, bail};
use async_trait::async_trait;
use futures::FutureExt;
use log::{debug, error, info, warn};
use tokio::{
    sync::Mutex,
    time::{MissedTickBehavior, interval, timeout},
};
use tokio_util::sync::CancellationToken;

use crate::latch::CountdownLatch;

/// How long a cancelled scheduler waits for loops still in their tick.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// One unit of work driven once per tick.
#[async_trait]
pub trait ControlLoop: Send + Sync {
    fn name(&self) -> &str;

    /// Runs one evaluation. Failures are handled inside the loop.
    async fn iterate(&mut self);
}

struct Scheduled {
    name: String,
    control: Arc<Mutex<Box<dyn ControlLoop>>>,
}

pub struct Scheduler {
    loops: Vec<Scheduled>,
    period: Duration,
    grace: Duration,
}

impl Scheduler {
    /// # Errors
    ///
    /// Fails for a zero period.
    pub fn new(loops: Vec<Box<dyn ControlLoop>>, period: Duration) -> Result<Self> {
        if period.is_zero() {
            bail!("Scheduler period must be positive");
        }

        let loops = loops
            .into_iter()
            .map(|control| Scheduled {
                name: control.name().to_string(),
                control: Arc::new(Mutex::new(control)),
            })
            .collect();

        Ok(Self {
            loops,
            period,
            grace: SHUTDOWN_GRACE,
        })
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Ticks until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            "Scheduler started: {} control loops every {:?}",
            self.loops.len(),
            self.period
        );

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            ticks += 1;
            debug!("Tick {ticks}");
            let latch = self.dispatch();

            tokio::select! {
                () = latch.wait() => ticker.reset(),
                () = cancel.cancelled() => {
                    info!(
                        "Waiting up to {:?} for {} control loops to finish",
                        self.grace,
                        latch.remaining()
                    );
                    if timeout(self.grace, latch.wait()).await.is_err() {
                        warn!(
                            "{} control loops still running after {:?}, abandoning them",
                            latch.remaining(),
                            self.grace
                        );
                    }
                    break;
                }
            }
        }

        info!("Scheduler stopped after {ticks} ticks");
        Ok(())
    }

    /// Spawns one worker per loop and returns the latch they count down.
    fn dispatch(&self) -> Arc<CountdownLatch> {
        let latch = Arc::new(CountdownLatch::new(self.loops.len()));

        for scheduled in &self.loops {
            let done = latch.guard();
            let name = scheduled.name.clone();
            let control = Arc::clone(&scheduled.control);

            tokio::spawn(async move {
                let _done = done;
                let tick = AssertUnwindSafe(async { control.lock().await.iterate().await });
                if tick.catch_unwind().await.is_err() {
                    error!("Control loop '{name}' panicked during its tick");
                }
            });
        }

        latch
    }
}
