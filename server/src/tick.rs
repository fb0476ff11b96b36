//! Fixed-rate server tick loop.
//!
//! Each tick drains the simulation command queue, advances the simulation by
//! exactly one step, flushes broadcasts queued since the previous tick and,
//! every few ticks, evicts idle sessions.
//!
//! Ticks start on fixed boundaries `start + n * period`. A tick that runs
//! past its period is logged and the loop waits for the *next* boundary
//! instead of running extra steps to catch up, so a slow tick never turns
//! into a burst of simulation work.

use crate::context::{ServerContext, TickInputs};
use crate::world::Simulation;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};

/// Reason given to sessions evicted for inactivity.
pub const IDLE_REASON: &str = "Connection timed out";

/// Boundary bookkeeping for a fixed-period loop.
#[derive(Debug, Clone)]
pub struct TickSchedule {
    period: Duration,
    next: Instant,
}

impl TickSchedule {
    /// First tick is due one period after `start`.
    pub fn new(period: Duration, start: Instant) -> Self {
        Self {
            period,
            next: start + period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// When the next tick should begin.
    pub fn deadline(&self) -> Instant {
        self.next
    }

    /// Moves to the boundary after the tick that just finished at `now`.
    ///
    /// Returns how many boundaries were missed. Zero means the tick fit in
    /// its period; otherwise the next deadline is the first boundary at or
    /// after `now`.
    pub fn advance(&mut self, now: Instant) -> u32 {
        self.next += self.period;
        if now <= self.next {
            return 0;
        }

        let behind = (now - self.next).as_nanos();
        let period = self.period.as_nanos().max(1);
        let missed = (behind + period - 1) / period;
        self.next += self.period * missed as u32;
        missed as u32
    }
}

/// Counters readable from other tasks.
#[derive(Debug, Default)]
pub struct TickStats {
    ticks: AtomicU64,
    overruns: AtomicU64,
    cps_bits: AtomicU64,
}

impl TickStats {
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Measured ticks per second over the last full second.
    pub fn cps(&self) -> f64 {
        f64::from_bits(self.cps_bits.load(Ordering::Relaxed))
    }

    fn set_cps(&self, cps: f64) {
        self.cps_bits.store(cps.to_bits(), Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
pub struct TickSettings {
    pub period: Duration,
    pub idle_timeout: Duration,
    pub maintenance_interval_ticks: u32,
    pub overrun_report_threshold: u32,
}

pub struct TickLoop {
    context: Arc<ServerContext>,
    inputs: TickInputs,
    simulation: Box<dyn Simulation>,
    settings: TickSettings,
}

impl TickLoop {
    pub fn new(
        context: Arc<ServerContext>,
        inputs: TickInputs,
        simulation: Box<dyn Simulation>,
        settings: TickSettings,
    ) -> Self {
        Self {
            context,
            inputs,
            simulation,
            settings,
        }
    }

    /// Runs until `shutdown` flips to true or its sender goes away.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let period = self.settings.period;
        let max_delta = period * 2;
        let mut schedule = TickSchedule::new(period, Instant::now());
        let mut last_step = Instant::now();
        let mut consecutive_overruns = 0u32;
        let mut tick: u64 = 0;
        let mut window_start = Instant::now();
        let mut window_ticks = 0u32;

        info!("Tick loop running at {:.1} ticks/s", 1.0 / period.as_secs_f64());

        loop {
            tokio::select! {
                _ = sleep_until(schedule.deadline()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let started = Instant::now();
            tick += 1;

            // Cap the step so one long stall doesn't become one huge step.
            let delta = (started - last_step).min(max_delta);
            last_step = started;

            self.run_tick(tick, delta);

            let finished = Instant::now();
            self.context.stats.ticks.fetch_add(1, Ordering::Relaxed);

            let missed = schedule.advance(finished);
            if missed > 0 {
                consecutive_overruns += 1;
                self.context.stats.overruns.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Tick {} overran its {:?} period ({:?}), skipping {} boundaries",
                    tick,
                    period,
                    finished - started,
                    missed
                );
                if consecutive_overruns == self.settings.overrun_report_threshold {
                    error!(
                        "Sustained overrun: {} consecutive ticks over budget",
                        consecutive_overruns
                    );
                }
            } else {
                if consecutive_overruns >= self.settings.overrun_report_threshold {
                    info!(
                        "Tick loop back within budget after {} overruns",
                        consecutive_overruns
                    );
                }
                consecutive_overruns = 0;
            }

            window_ticks += 1;
            let window = finished - window_start;
            if window >= Duration::from_secs(1) {
                self.context
                    .stats
                    .set_cps(f64::from(window_ticks) / window.as_secs_f64());
                window_start = finished;
                window_ticks = 0;
            }
        }

        info!("Tick loop stopped after {} ticks", tick);
    }

    fn run_tick(&mut self, tick: u64, delta: Duration) {
        while let Ok(command) = self.inputs.world.try_recv() {
            self.simulation.apply(command);
        }
        self.simulation.step(delta);

        while let Ok(broadcast) = self.inputs.broadcasts.try_recv() {
            self.context
                .registry
                .broadcast(&broadcast.packet, broadcast.exclude);
        }

        if tick % u64::from(self.settings.maintenance_interval_ticks.max(1)) == 0 {
            self.evict_idle();
        }
    }

    fn evict_idle(&self) {
        for (slot, connection_id) in self.context.registry.stale(self.settings.idle_timeout) {
            if self
                .context
                .end_session(slot, connection_id, Some(IDLE_REASON))
                .is_some()
            {
                info!("Evicted idle session {}", slot);
            } else {
                debug!("Idle session {} already gone", slot);
            }
        }
    }
}
