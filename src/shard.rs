//! Round-robin shard assignment.
//!
//! Rank `r` owns dataset positions `r, r + world_size, r + 2 * world_size, ...`.
//! The merger rebuilds global order by interleaving the partial sequences in
//! rank order, so any producer of partial results must follow this layout.

use crate::GatherError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardPlan {
    size: usize,
    world_size: usize,
    padded: bool,
}

impl ShardPlan {
    pub fn new(size: usize, world_size: usize) -> Result<Self, GatherError> {
        if world_size == 0 {
            return Err(GatherError::Config("world size must be at least 1".to_string()));
        }
        Ok(Self {
            size,
            world_size,
            padded: false,
        })
    }

    /// Pad every shard to `ceil(size / world_size)` items by cycling from the
    /// start of the dataset, the way distributed samplers do.
    pub fn padded(mut self) -> Self {
        self.padded = true;
        self
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn is_padded(&self) -> bool {
        self.padded
    }

    /// Number of positions handed out across all shards.
    pub fn total_len(&self) -> usize {
        if self.padded {
            self.size.div_ceil(self.world_size) * self.world_size
        } else {
            self.size
        }
    }

    pub fn shard_len(&self, rank: usize) -> usize {
        let total = self.total_len();
        if rank >= self.world_size || rank >= total {
            return 0;
        }
        (total - rank).div_ceil(self.world_size)
    }

    /// Dataset indices owned by `rank`, in the order the rank must process them.
    pub fn indices(&self, rank: usize) -> impl Iterator<Item = usize> + '_ {
        let total = if rank < self.world_size { self.total_len() } else { 0 };
        let size = self.size;
        (rank..total)
            .step_by(self.world_size)
            .map(move |position| position % size)
    }

    pub fn shard<'a, T>(&self, items: &'a [T], rank: usize) -> Result<Vec<&'a T>, GatherError> {
        if items.len() != self.size {
            return Err(GatherError::Config(format!(
                "shard plan covers {} items but {} were supplied",
                self.size,
                items.len()
            )));
        }
        Ok(self.indices(rank).map(|i| &items[i]).collect())
    }
}
