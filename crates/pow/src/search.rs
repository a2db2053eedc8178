use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Instant;

use tracing::debug;

use crate::error::PowError;
use crate::hash::{initial_hash, trial_value};
use crate::target::{PowParams, target};
use crate::throttle::Throttle;

/// Tuning knobs for a nonce search.
#[derive(Clone, Debug)]
pub struct SearchOptions {
    /// Number of worker threads sharing the nonce space.
    pub workers: usize,
    /// Fraction of each worker's time spent hashing, in `(0, 1]`.
    pub target_load: f64,
    /// Trials per duty cycle the workers start from.
    pub batch_size: u64,
    /// Raised by the caller to abandon the search.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map_or(1, |n| n.get()),
            target_load: 0.5,
            batch_size: 4096,
            cancel: None,
        }
    }
}

/// Result of a successful search.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Solution {
    pub nonce: u64,
    /// Total trials across all workers.
    pub trials: u64,
    /// Batch size learned by the throttles, to seed the next search.
    pub batch_size: u64,
}

struct Shared {
    found: AtomicBool,
    nonce: AtomicU64,
    trials: AtomicU64,
}

/// Nonces tried by `worker` out of `workers`: `worker, worker + workers, ...`.
pub fn nonce_sequence(worker: usize, workers: usize) -> impl Iterator<Item = u64> {
    (worker as u64..=u64::MAX).step_by(workers.max(1))
}

/// Searches for a nonce whose trial value lands in `0..=target`.
///
/// Workers stop cooperatively: the first one to succeed raises a shared flag
/// that the others check between batches.
pub fn search(
    target: i64,
    initial: &[u8; 64],
    options: &SearchOptions,
) -> Result<Solution, PowError> {
    if target < 0 {
        return Err(PowError::InvalidTarget(target));
    }
    let workers = options.workers.max(1);
    let shared = Shared {
        found: AtomicBool::new(false),
        nonce: AtomicU64::new(0),
        trials: AtomicU64::new(0),
    };
    let cancel = options.cancel.as_deref();

    let learned = thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|index| {
                let shared = &shared;
                let throttle = Throttle::new(options.target_load, options.batch_size);
                scope.spawn(move || {
                    run_worker(index, workers, target, initial, shared, cancel, throttle)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().map_err(|_| PowError::WorkerPanicked))
            .collect::<Result<Vec<u64>, PowError>>()
    })?;

    if !shared.found.load(Ordering::Acquire) {
        if cancel.is_some_and(|flag| flag.load(Ordering::Acquire)) {
            return Err(PowError::Cancelled);
        }
        return Err(PowError::Exhausted);
    }
    let batch_size = learned.iter().sum::<u64>() / learned.len() as u64;
    Ok(Solution {
        nonce: shared.nonce.load(Ordering::Acquire),
        trials: shared.trials.load(Ordering::Relaxed),
        batch_size,
    })
}

/// Computes the target for `payload` and searches for a nonce satisfying it.
pub fn solve(
    payload: &[u8],
    params: &PowParams,
    options: &SearchOptions,
) -> Result<Solution, PowError> {
    let target = target(payload.len(), params);
    let started = Instant::now();
    let solution = search(target, &initial_hash(payload), options)?;
    debug!(
        len = payload.len(),
        target,
        nonce = solution.nonce,
        trials = solution.trials,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "proof of work found"
    );
    Ok(solution)
}

fn run_worker(
    index: usize,
    workers: usize,
    target: i64,
    initial: &[u8; 64],
    shared: &Shared,
    cancel: Option<&AtomicBool>,
    mut throttle: Throttle,
) -> u64 {
    let mut nonces = nonce_sequence(index, workers);
    loop {
        if shared.found.load(Ordering::Acquire)
            || cancel.is_some_and(|flag| flag.load(Ordering::Acquire))
        {
            return throttle.batch();
        }
        let started = Instant::now();
        let mut tried = 0u64;
        for _ in 0..throttle.batch() {
            let Some(nonce) = nonces.next() else {
                shared.trials.fetch_add(tried, Ordering::Relaxed);
                return throttle.batch();
            };
            tried += 1;
            if (0..=target).contains(&trial_value(nonce, initial)) {
                shared.trials.fetch_add(tried, Ordering::Relaxed);
                if shared
                    .found
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    shared.nonce.store(nonce, Ordering::Release);
                }
                return throttle.batch();
            }
        }
        shared.trials.fetch_add(tried, Ordering::Relaxed);
        let busy = started.elapsed();
        let pause = throttle.pause_after(busy);
        if !pause.is_zero() {
            thread::sleep(pause);
        }
        throttle.observe(busy, pause);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::target::valid;

    fn easy() -> PowParams {
        PowParams {
            trials_per_byte: 1,
            extra_bytes: 0,
        }
    }

    fn fast_options(workers: usize) -> SearchOptions {
        SearchOptions {
            workers,
            target_load: 1.0,
            batch_size: 256,
            cancel: None,
        }
    }

    #[test]
    fn worker_sequences_partition_the_nonce_space() {
        for workers in 1..=7 {
            let mut seen = HashSet::new();
            for worker in 0..workers {
                for nonce in nonce_sequence(worker, workers).take(500) {
                    assert!(seen.insert(nonce), "nonce {nonce} tried twice");
                }
            }
            let covered = (500 * workers) as u64;
            assert!((0..covered).all(|nonce| seen.contains(&nonce)));
        }
    }

    #[test]
    fn solved_nonce_is_valid() {
        let payload = b"a payload worth protecting";
        for workers in [1, 3, 8] {
            let solution = solve(payload, &easy(), &fast_options(workers)).expect("solve");
            assert!(valid(payload, solution.nonce, &easy()));
            assert!(solution.trials >= 1);
        }
    }

    #[test]
    fn single_worker_matches_brute_force_boundary() {
        let payload = vec![7u8; 300];
        let params = easy();
        let expected = (0u64..)
            .find(|nonce| valid(&payload, *nonce, &params))
            .expect("some nonce");
        let solution = solve(&payload, &params, &fast_options(1)).expect("solve");
        assert_eq!(solution.nonce, expected);
    }

    #[test]
    fn cancelled_search_reports_cancellation() {
        let cancel = Arc::new(AtomicBool::new(true));
        let options = SearchOptions {
            cancel: Some(cancel),
            ..fast_options(2)
        };
        let err = search(0, &initial_hash(b"hopeless"), &options).expect_err("cancelled");
        assert!(matches!(err, PowError::Cancelled));
    }

    #[test]
    fn negative_target_is_rejected() {
        let err = search(-1, &initial_hash(b"x"), &fast_options(1)).expect_err("invalid");
        assert!(matches!(err, PowError::InvalidTarget(-1)));
    }
}
