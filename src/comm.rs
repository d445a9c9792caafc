//! Collective communication between the workers of one job.
//!
//! The collection protocol only needs three things from the job's
//! communication layer: rank/world-size introspection, a broadcast from
//! rank 0 to everyone, and a barrier. Three backends are provided:
//!
//! - [`SingleProcess`]: the degenerate one-worker job.
//! - [`ThreadGroup`]: ranks are threads of one process.
//! - [`FileStore`]: ranks are separate processes that share a directory.
//!
//! Every rank must issue the same collectives in the same order.

use crate::GatherError;
use crossbeam_channel::{Receiver, Sender};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub const COORDINATOR_RANK: usize = 0;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub trait Communicator {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Broadcast a byte payload from the coordinator to every rank.
    ///
    /// The coordinator passes `Some(payload)`; every other rank passes `None`
    /// and receives a copy of the coordinator's bytes.
    fn broadcast(&self, payload: Option<Vec<u8>>) -> Result<Vec<u8>, GatherError>;

    /// Block until every rank has called `barrier`.
    fn barrier(&self) -> Result<(), GatherError>;

    fn is_coordinator(&self) -> bool {
        self.rank() == COORDINATOR_RANK
    }
}

fn validate_rank(rank: usize, world_size: usize) -> Result<(), GatherError> {
    if world_size == 0 {
        return Err(GatherError::Config("world size must be at least 1".to_string()));
    }
    if rank >= world_size {
        return Err(GatherError::Config(format!(
            "rank {} is out of range for world size {}",
            rank, world_size
        )));
    }
    Ok(())
}

fn root_payload(payload: Option<Vec<u8>>) -> Result<Vec<u8>, GatherError> {
    payload.ok_or_else(|| GatherError::Comm("coordinator must supply the broadcast payload".to_string()))
}

/// A job with exactly one worker.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        COORDINATOR_RANK
    }

    fn world_size(&self) -> usize {
        1
    }

    fn broadcast(&self, payload: Option<Vec<u8>>) -> Result<Vec<u8>, GatherError> {
        root_payload(payload)
    }

    fn barrier(&self) -> Result<(), GatherError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
}

/// Reusable barrier that can give up after a deadline.
#[derive(Debug)]
struct GroupBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

impl GroupBarrier {
    fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(BarrierState::default()),
            cvar: Condvar::new(),
        }
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<(), GatherError> {
        let poisoned = |_| GatherError::Comm("barrier state poisoned".to_string());
        let mut state = self.state.lock().map_err(poisoned)?;
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation += 1;
            self.cvar.notify_all();
            return Ok(());
        }

        match timeout {
            None => {
                let _released = self
                    .cvar
                    .wait_while(state, |s| s.generation == generation)
                    .map_err(|_| GatherError::Comm("barrier state poisoned".to_string()))?;
                Ok(())
            }
            Some(limit) => {
                let (mut state, result) = self
                    .cvar
                    .wait_timeout_while(state, limit, |s| s.generation == generation)
                    .map_err(|_| GatherError::Comm("barrier state poisoned".to_string()))?;
                if result.timed_out() && state.generation == generation {
                    state.arrived -= 1;
                    return Err(GatherError::CollectionTimeout(format!(
                        "barrier not reached by all {} ranks within {:?}",
                        self.parties, limit
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Factory for in-process ranks: each [`ThreadMember`] is moved onto its own
/// thread and behaves like a separate worker.
pub struct ThreadGroup;

impl ThreadGroup {
    pub fn new(world_size: usize) -> Result<Vec<ThreadMember>, GatherError> {
        Self::with_timeout(world_size, None)
    }

    pub fn with_timeout(
        world_size: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<ThreadMember>, GatherError> {
        validate_rank(0, world_size)?;
        let barrier = Arc::new(GroupBarrier::new(world_size));
        let (senders, receivers): (Vec<Sender<Vec<u8>>>, Vec<Receiver<Vec<u8>>>) =
            (0..world_size).map(|_| crossbeam_channel::unbounded()).unzip();

        Ok(receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| ThreadMember {
                rank,
                world_size,
                inbox,
                peers: if rank == COORDINATOR_RANK { senders.clone() } else { Vec::new() },
                barrier: Arc::clone(&barrier),
                timeout,
            })
            .collect())
    }
}

pub struct ThreadMember {
    rank: usize,
    world_size: usize,
    inbox: Receiver<Vec<u8>>,
    peers: Vec<Sender<Vec<u8>>>,
    barrier: Arc<GroupBarrier>,
    timeout: Option<Duration>,
}

impl Communicator for ThreadMember {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn broadcast(&self, payload: Option<Vec<u8>>) -> Result<Vec<u8>, GatherError> {
        if self.is_coordinator() {
            let payload = root_payload(payload)?;
            for (rank, peer) in self.peers.iter().enumerate().skip(1) {
                peer.send(payload.clone())
                    .map_err(|_| GatherError::Comm(format!("rank {} hung up before broadcast", rank)))?;
            }
            return Ok(payload);
        }

        match self.timeout {
            None => self
                .inbox
                .recv()
                .map_err(|_| GatherError::Comm("coordinator hung up before broadcast".to_string())),
            Some(limit) => self.inbox.recv_timeout(limit).map_err(|e| match e {
                crossbeam_channel::RecvTimeoutError::Timeout => GatherError::CollectionTimeout(format!(
                    "no broadcast from coordinator within {:?}",
                    limit
                )),
                crossbeam_channel::RecvTimeoutError::Disconnected => {
                    GatherError::Comm("coordinator hung up before broadcast".to_string())
                }
            }),
        }
    }

    fn barrier(&self) -> Result<(), GatherError> {
        self.barrier.wait(self.timeout)
    }
}

/// Multi-process communicator over a directory every rank can see.
///
/// Broadcasts are files renamed into place by the coordinator; barriers are
/// per-rank marker files. The directory must be fresh for each job.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    rank: usize,
    world_size: usize,
    seq: AtomicU64,
    timeout: Option<Duration>,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>, rank: usize, world_size: usize) -> Result<Self, GatherError> {
        validate_rank(rank, world_size)?;
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            rank,
            world_size,
            seq: AtomicU64::new(0),
            timeout: None,
        })
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    fn broadcast_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("bcast_{:08}.msg", seq))
    }

    fn marker_path(&self, seq: u64, rank: usize) -> PathBuf {
        self.dir.join(format!("barrier_{:08}_{}", seq, rank))
    }

    fn wait_until<F>(&self, what: &str, mut ready: F) -> Result<(), GatherError>
    where
        F: FnMut() -> bool,
    {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        loop {
            if ready() {
                return Ok(());
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(GatherError::CollectionTimeout(format!(
                        "rank {} gave up waiting for {} in {}",
                        self.rank,
                        what,
                        self.dir.display()
                    )));
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Communicator for FileStore {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn broadcast(&self, payload: Option<Vec<u8>>) -> Result<Vec<u8>, GatherError> {
        let seq = self.next_seq();
        let path = self.broadcast_path(seq);

        if self.is_coordinator() {
            let payload = root_payload(payload)?;
            let tmp = self.dir.join(format!(".bcast_{:08}.tmp", seq));
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&payload)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)?;
            return Ok(payload);
        }

        self.wait_until("broadcast", || path.exists())?;
        Ok(fs::read(&path)?)
    }

    fn barrier(&self) -> Result<(), GatherError> {
        let seq = self.next_seq();
        fs::write(self.marker_path(seq, self.rank), self.rank.to_string())?;
        let world_size = self.world_size;
        self.wait_until("barrier", || {
            (0..world_size).all(|rank| self.marker_path(seq, rank).exists())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_single_process_is_coordinator() {
        let comm = SingleProcess;
        assert!(comm.is_coordinator());
        assert_eq!(comm.world_size(), 1);
        assert_eq!(comm.broadcast(Some(vec![1, 2, 3])).unwrap(), vec![1, 2, 3]);
        comm.barrier().unwrap();
    }

    #[test]
    fn test_single_process_broadcast_requires_payload() {
        assert!(matches!(SingleProcess.broadcast(None), Err(GatherError::Comm(_))));
    }

    #[test]
    fn test_thread_group_rejects_empty_world() {
        assert!(matches!(ThreadGroup::new(0), Err(GatherError::Config(_))));
    }

    #[test]
    fn test_thread_group_broadcast_reaches_every_rank() {
        let members = ThreadGroup::new(4).unwrap();
        let handles: Vec<_> = members
            .into_iter()
            .map(|member| {
                thread::spawn(move || {
                    let payload = if member.is_coordinator() { Some(b"hello".to_vec()) } else { None };
                    let got = member.broadcast(payload).unwrap();
                    member.barrier().unwrap();
                    got
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), b"hello".to_vec());
        }
    }

    #[test]
    fn test_thread_group_barrier_is_reusable() {
        let members = ThreadGroup::new(3).unwrap();
        let handles: Vec<_> = members
            .into_iter()
            .map(|member| {
                thread::spawn(move || {
                    for _ in 0..5 {
                        member.barrier().unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_thread_group_barrier_times_out_when_a_rank_is_missing() {
        let mut members =
            ThreadGroup::with_timeout(2, Some(Duration::from_millis(50))).unwrap();
        let _absent = members.pop().unwrap();
        let coordinator = members.pop().unwrap();
        let result = coordinator.barrier();
        assert!(matches!(result, Err(GatherError::CollectionTimeout(_))));
    }

    #[test]
    fn test_file_store_rejects_out_of_range_rank() {
        let dir = tempfile::tempdir().unwrap();
        let result = FileStore::new(dir.path(), 2, 2);
        assert!(matches!(result, Err(GatherError::Config(_))));
    }

    #[test]
    fn test_file_store_broadcast_and_barrier() {
        let dir = tempfile::tempdir().unwrap();
        let world_size = 3;
        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let path = dir.path().to_path_buf();
                thread::spawn(move || {
                    let store = FileStore::new(path, rank, world_size).unwrap();
                    let payload = if rank == 0 { Some(vec![7u8; 16]) } else { None };
                    let got = store.broadcast(payload).unwrap();
                    store.barrier().unwrap();
                    got
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec![7u8; 16]);
        }
    }

    #[test]
    fn test_file_store_barrier_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path(), 0, 2)
            .unwrap()
            .with_timeout(Some(Duration::from_millis(40)));
        assert!(matches!(store.barrier(), Err(GatherError::CollectionTimeout(_))));
    }
}
