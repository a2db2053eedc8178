use std::time::Duration;

/// Length of one work/sleep cycle.
pub const ROUND: Duration = Duration::from_millis(100);
pub const MIN_BATCH: u64 = 64;
pub const MAX_BATCH: u64 = 1 << 24;

const SMOOTHING: f64 = 0.1;
const LOWER_BAND: f64 = 0.84;
const UPPER_BAND: f64 = 1.2;

/// Computes the next batch size from smoothed observations.
///
/// The batch shrinks by `batch / 256` (at least one trial) when either the
/// smoothed load or the smoothed round length is above 1.2× its target, and
/// grows by the same step when either is below 0.84×. Inside the band the
/// batch is left alone.
pub fn next_batch_size(
    batch: u64,
    smoothed_load: f64,
    smoothed_round: Duration,
    target_load: f64,
    round: Duration,
) -> u64 {
    let step = (batch / 256).max(1);
    let round_ratio = smoothed_round.as_secs_f64() / round.as_secs_f64().max(f64::EPSILON);
    let load_ratio = smoothed_load / target_load.max(f64::EPSILON);
    let next = if load_ratio > UPPER_BAND || round_ratio > UPPER_BAND {
        batch.saturating_sub(step)
    } else if load_ratio < LOWER_BAND || round_ratio < LOWER_BAND {
        batch.saturating_add(step)
    } else {
        batch
    };
    next.clamp(MIN_BATCH, MAX_BATCH)
}

/// Duty-cycle controller owned by a single search worker.
#[derive(Clone, Debug)]
pub struct Throttle {
    target_load: f64,
    round: Duration,
    batch: u64,
    load_ema: f64,
    round_ema: Duration,
}

impl Throttle {
    pub fn new(target_load: f64, batch: u64) -> Self {
        let target_load = if target_load.is_finite() {
            target_load.clamp(0.01, 1.0)
        } else {
            1.0
        };
        Self {
            target_load,
            round: ROUND,
            batch: batch.clamp(MIN_BATCH, MAX_BATCH),
            load_ema: target_load,
            round_ema: ROUND,
        }
    }

    pub fn batch(&self) -> u64 {
        self.batch
    }

    pub fn target_load(&self) -> f64 {
        self.target_load
    }

    /// Sleep needed after `busy` so the cycle runs at the target load.
    pub fn pause_after(&self, busy: Duration) -> Duration {
        if self.target_load >= 1.0 {
            return Duration::ZERO;
        }
        let idle = busy.as_secs_f64() * (1.0 - self.target_load) / self.target_load;
        Duration::from_secs_f64(idle).min(self.round)
    }

    /// Feeds one finished cycle into the controller and returns the new batch.
    pub fn observe(&mut self, busy: Duration, slept: Duration) -> u64 {
        let cycle = busy + slept;
        let load = if cycle.is_zero() {
            self.target_load
        } else {
            busy.as_secs_f64() / cycle.as_secs_f64()
        };
        self.load_ema = SMOOTHING * load + (1.0 - SMOOTHING) * self.load_ema;
        let round =
            SMOOTHING * cycle.as_secs_f64() + (1.0 - SMOOTHING) * self.round_ema.as_secs_f64();
        self.round_ema = Duration::from_secs_f64(round);
        self.batch = next_batch_size(
            self.batch,
            self.load_ema,
            self.round_ema,
            self.target_load,
            self.round,
        );
        self.batch
    }
}
