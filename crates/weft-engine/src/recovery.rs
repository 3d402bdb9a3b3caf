//! Background reaper
//!
//! Periodically sweeps for runs whose executor lease expired (process
//! death, partition) and for runs alive past the configured maximum
//! lifetime. Works entirely through the engine's recovery entry point so
//! the resume-vs-orphan decision lives in one place.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;

pub struct Reaper {
    engine: Arc<Engine>,
    interval: Duration,
    shutdown: CancellationToken,
}

impl Reaper {
    pub fn new(engine: Arc<Engine>, interval: Duration) -> Self {
        Self { engine, interval, shutdown: CancellationToken::new() }
    }

    /// Spawns the sweep loop. The returned handle stops when `stop` is
    /// called.
    pub fn spawn(&self) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let interval = self.interval;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("reaper stopping");
                        return;
                    }
                    _ = ticker.tick() => {}
                }
                engine.sweep_finished().await;
                match engine.recover().await {
                    Ok(0) => {}
                    Ok(handled) => info!("reaper handled {handled} expired run(s)"),
                    Err(err) => warn!("reaper sweep failed: {err}"),
                }
            }
        })
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}
