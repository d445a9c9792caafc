//! Distributed result collection.
//!
//! Each rank runs the worker loop over its own shard, writes the results to
//! the shared rendezvous directory and waits at the barrier. Rank 0 then reads
//! every part back, restores dataset order, trims padding and deletes the
//! directory. Other ranks come back with `None`.
//!
//! Per rank: `Computing -> Writing -> AwaitingBarrier -> (Merging ->) Done`.
//! A crashed rank leaves the others blocked at the barrier unless the
//! communicator was built with a timeout.

use crate::comm::Communicator;
use crate::merge;
use crate::part_file;
use crate::rendezvous;
use crate::shard::ShardPlan;
use crate::worker_loop::{self, Compute, Progress};
use crate::GatherError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Computing,
    Writing,
    AwaitingBarrier,
    Merging,
    Done,
}

impl Phase {
    pub fn can_advance_to(self, next: Phase, coordinator: bool) -> bool {
        matches!(
            (self, next),
            (Phase::Computing, Phase::Writing)
                | (Phase::Writing, Phase::AwaitingBarrier)
                | (Phase::AwaitingBarrier, Phase::Done)
                | (Phase::Merging, Phase::Done)
        ) || (coordinator && self == Phase::AwaitingBarrier && next == Phase::Merging)
    }
}

struct PhaseLog {
    rank: usize,
    coordinator: bool,
    phase: Phase,
}

impl PhaseLog {
    fn new(rank: usize, coordinator: bool, phase: Phase) -> Self {
        Self { rank, coordinator, phase }
    }

    fn advance(&mut self, next: Phase) {
        debug_assert!(
            self.phase.can_advance_to(next, self.coordinator),
            "illegal transition {:?} -> {:?}",
            self.phase,
            next
        );
        debug!(rank = self.rank, from = ?self.phase, to = ?next, "collect phase");
        self.phase = next;
    }
}

/// Where the rendezvous directory comes from.
#[derive(Debug, Clone, Default)]
pub struct CollectOptions {
    /// Use this directory on every rank instead of negotiating one.
    pub tmpdir: Option<PathBuf>,
    /// Parent for the coordinator's fresh temporary directory.
    pub temp_root: Option<PathBuf>,
}

/// Gather every rank's `part` into one sequence of exactly `size` results.
///
/// Returns `Some` on rank 0 and `None` on every other rank.
pub fn collect_results<R>(
    comm: &dyn Communicator,
    part: Vec<R>,
    size: usize,
    options: &CollectOptions,
) -> Result<Option<Vec<R>>, GatherError>
where
    R: Serialize + DeserializeOwned,
{
    let rank = comm.rank();
    let world_size = comm.world_size();
    let coordinator = comm.is_coordinator();
    let mut phase = PhaseLog::new(rank, coordinator, Phase::Computing);

    phase.advance(Phase::Writing);
    let dir = rendezvous::establish(comm, options.tmpdir.as_deref(), options.temp_root.as_deref())?;
    let part_path = part_file::write_part(dir.path(), rank, world_size, &part)?;
    debug!(rank, items = part.len(), path = %part_path.display(), "wrote partial results");
    drop(part);

    phase.advance(Phase::AwaitingBarrier);
    comm.barrier()?;

    if !coordinator {
        phase.advance(Phase::Done);
        return Ok(None);
    }

    phase.advance(Phase::Merging);
    let merged = merge::merge_parts(dir.path(), world_size, size)?;
    merge::cleanup(dir.path())?;
    info!(items = merged.len(), world_size, "collected results");

    phase.advance(Phase::Done);
    Ok(Some(merged))
}

/// Compute every item in one process, in dataset order.
pub fn run_single<T, R, C>(items: &[T], compute: &mut C) -> Result<Vec<R>, GatherError>
where
    C: Compute<T, R> + ?Sized,
{
    let mut progress = Progress::for_rank(0, 1, items.len());
    worker_loop::run_shard(items, compute, &mut progress)
}

/// Compute this rank's round-robin shard of `items` and collect the results.
///
/// `padded` mirrors samplers that repeat items so every shard has the same
/// length; the padding never reaches the returned sequence.
pub fn run_distributed<T, R, C>(
    comm: &dyn Communicator,
    items: &[T],
    compute: &mut C,
    padded: bool,
    options: &CollectOptions,
) -> Result<Option<Vec<R>>, GatherError>
where
    R: Serialize + DeserializeOwned,
    C: Compute<T, R> + ?Sized,
{
    let mut plan = ShardPlan::new(items.len(), comm.world_size())?;
    if padded {
        plan = plan.padded();
    }
    let shard = plan.shard(items, comm.rank())?;
    let mut progress = Progress::for_rank(comm.rank(), comm.world_size(), items.len());
    let part = worker_loop::run_shard(shard, compute, &mut progress)?;
    collect_results(comm, part, items.len(), options)
}
