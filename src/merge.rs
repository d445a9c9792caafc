use crate::part_file;
use crate::GatherError;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Round-robin interleave: round `k` takes element `k` of every part in rank
/// order, skipping parts that are already exhausted.
pub fn interleave<R>(parts: Vec<Vec<R>>) -> Vec<R> {
    let total: usize = parts.iter().map(Vec::len).sum();
    let mut iters: Vec<_> = parts.into_iter().map(Vec::into_iter).collect();
    let mut ordered = Vec::with_capacity(total);
    while ordered.len() < total {
        for iter in iters.iter_mut() {
            if let Some(item) = iter.next() {
                ordered.push(item);
            }
        }
    }
    ordered
}

/// Cut padding off the tail. Fewer than `size` results means a shard went
/// missing, which is an error rather than a short answer.
pub fn truncate_to_size<R>(mut ordered: Vec<R>, size: usize) -> Result<Vec<R>, GatherError> {
    if ordered.len() < size {
        return Err(GatherError::ShortResults {
            expected: size,
            got: ordered.len(),
        });
    }
    ordered.truncate(size);
    Ok(ordered)
}

/// Read every rank's part from `dir` and rebuild dataset order.
///
/// Only reads; running it twice over the same files gives the same answer.
pub fn merge_parts<R: DeserializeOwned>(
    dir: &Path,
    world_size: usize,
    size: usize,
) -> Result<Vec<R>, GatherError> {
    let parts = (0..world_size)
        .map(|rank| part_file::read_part(dir, rank, world_size))
        .collect::<Result<Vec<Vec<R>>, _>>()?;
    debug!(
        dir = %dir.display(),
        lens = ?parts.iter().map(Vec::len).collect::<Vec<_>>(),
        "loaded partial results"
    );
    truncate_to_size(interleave(parts), size)
}

/// Remove the rendezvous directory and every file in it.
pub fn cleanup(dir: &Path) -> Result<(), GatherError> {
    fs::remove_dir_all(dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interleave_unequal_shards() {
        let parts = vec![vec![0, 3, 6], vec![1, 4], vec![2, 5]];
        assert_eq!(interleave(parts), vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_interleave_skips_exhausted_parts_in_middle() {
        let parts = vec![vec!['a', 'd'], vec!['b'], vec!['c', 'e', 'f']];
        assert_eq!(interleave(parts), vec!['a', 'b', 'c', 'd', 'e', 'f']);
    }

    #[test]
    fn test_padding_is_truncated() {
        // size 7 over 3 ranks padded to 9 positions
        let parts = vec![vec![0, 3, 6], vec![1, 4, 0], vec![2, 5, 1]];
        let merged = truncate_to_size(interleave(parts), 7).unwrap();
        assert_eq!(merged, (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn test_short_results_are_an_error() {
        let result = truncate_to_size(vec![1, 2], 3);
        assert!(matches!(
            result,
            Err(GatherError::ShortResults { expected: 3, got: 2 })
        ));
    }

    #[test]
    fn test_empty_inputs() {
        let parts: Vec<Vec<u8>> = vec![vec![], vec![]];
        assert!(truncate_to_size(interleave(parts), 0).unwrap().is_empty());
        assert!(interleave::<u8>(Vec::new()).is_empty());
    }

    #[test]
    fn test_merge_parts_is_repeatable_before_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let rdv = dir.path().join("rdv");
        fs::create_dir_all(&rdv).unwrap();
        part_file::write_part(&rdv, 0, 2, &["i0".to_string(), "i2".to_string()]).unwrap();
        part_file::write_part(&rdv, 1, 2, &["i1".to_string()]).unwrap();

        let first: Vec<String> = merge_parts(&rdv, 2, 3).unwrap();
        let second: Vec<String> = merge_parts(&rdv, 2, 3).unwrap();
        assert_eq!(first, vec!["i0", "i1", "i2"]);
        assert_eq!(first, second);

        cleanup(&rdv).unwrap();
        assert!(!rdv.exists());
    }

    #[test]
    fn test_merge_parts_fails_on_missing_rank() {
        let dir = tempfile::tempdir().unwrap();
        part_file::write_part(dir.path(), 0, 2, &[10u32, 12]).unwrap();
        let result: Result<Vec<u32>, _> = merge_parts(dir.path(), 2, 4);
        assert!(matches!(result, Err(GatherError::MissingPart { rank: 1, .. })));
    }

    #[test]
    fn test_cleanup_of_missing_dir_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("never_created");
        assert!(matches!(cleanup(&gone), Err(GatherError::Io(_))));
    }
}
