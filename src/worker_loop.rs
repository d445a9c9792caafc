use crate::GatherError;
use std::time::Instant;
use tracing::info;

const DEFAULT_LOG_EVERY: usize = 200;

/// Per-item compute step. Closures taking `&I` work directly.
pub trait Compute<I, R> {
    fn compute(&mut self, item: &I) -> Result<R, GatherError>;
}

impl<I, R, F> Compute<I, R> for F
where
    F: FnMut(&I) -> Result<R, GatherError>,
{
    fn compute(&mut self, item: &I) -> Result<R, GatherError> {
        self(item)
    }
}

/// Progress reporting for the worker loop.
///
/// Only the coordinator reports. Each local item advances the counter by
/// `world_size`, so rank 0 approximates global progress across all shards.
#[derive(Debug)]
pub struct Progress {
    enabled: bool,
    total: usize,
    done: usize,
    step: usize,
    every: usize,
    last_logged: usize,
    started: Instant,
}

impl Progress {
    pub fn for_rank(rank: usize, world_size: usize, total: usize) -> Self {
        Self {
            enabled: rank == 0,
            total,
            done: 0,
            step: world_size.max(1),
            every: DEFAULT_LOG_EVERY,
            last_logged: 0,
            started: Instant::now(),
        }
    }

    pub fn silent() -> Self {
        let mut progress = Self::for_rank(0, 1, 0);
        progress.enabled = false;
        progress
    }

    pub fn log_every(mut self, every: usize) -> Self {
        self.every = every.max(1);
        self
    }

    pub fn done(&self) -> usize {
        self.done
    }

    pub fn advance(&mut self, items: usize) {
        self.done = (self.done + items * self.step).min(self.total.max(self.done));
        if !self.enabled {
            return;
        }
        let reached_end = self.done >= self.total && self.done != self.last_logged;
        if self.done - self.last_logged >= self.every || reached_end {
            self.last_logged = self.done;
            let elapsed = self.started.elapsed().as_secs_f64();
            let rate = if elapsed > 0.0 { self.done as f64 / elapsed } else { 0.0 };
            info!(done = self.done, total = self.total, rate = %format!("{:.1}/s", rate), "progress");
        }
    }
}

/// Run `compute` over one shard and keep the results in shard order.
///
/// Compute errors are returned as-is; there is no retry at this layer.
pub fn run_shard<'a, T, R, C>(
    shard: impl IntoIterator<Item = &'a T>,
    compute: &mut C,
    progress: &mut Progress,
) -> Result<Vec<R>, GatherError>
where
    T: 'a,
    C: Compute<T, R> + ?Sized,
{
    let shard = shard.into_iter();
    let mut results = Vec::with_capacity(shard.size_hint().0);
    for item in shard {
        results.push(compute.compute(item)?);
        progress.advance(1);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_shard_preserves_order() {
        let items = vec![3, 1, 4, 1, 5];
        let mut square = |x: &i32| -> Result<i32, GatherError> { Ok(x * x) };
        let out = run_shard(&items, &mut square, &mut Progress::silent()).unwrap();
        assert_eq!(out, vec![9, 1, 16, 1, 25]);
    }

    #[test]
    fn test_run_shard_stops_at_first_compute_error() {
        let items = vec![1, 2, 3];
        let mut calls = 0;
        let mut failing = |x: &i32| -> Result<i32, GatherError> {
            calls += 1;
            if *x == 2 {
                Err(GatherError::Compute("bad item".to_string()))
            } else {
                Ok(*x)
            }
        };
        let result = run_shard(&items, &mut failing, &mut Progress::silent());
        assert!(matches!(result, Err(GatherError::Compute(_))));
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_progress_counts_world_size_per_item() {
        let mut progress = Progress::for_rank(0, 4, 10).log_every(1);
        progress.advance(1);
        assert_eq!(progress.done(), 4);
        progress.advance(1);
        progress.advance(1);
        assert_eq!(progress.done(), 10);
    }
}
