use std::ops::Range;

use crate::{config::ClusterConfig, error::ConfigurationError};

/// The samples of a batch a worker is responsible for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardAssignment {
    pub owner: String,
    pub sample_range: Range<usize>,
}

/// Splits `[0, batch_size)` across the workers of `config`.
///
/// With `prefer_gpu` and at least one GPU worker, only GPU workers take part,
/// weighted by their GPU count. Otherwise every worker takes part with the same
/// weight. Shards are proportional to the weights, whatever truncation leaves
/// over goes to the first active worker, and a worker left with no samples takes
/// one from the largest shard.
///
/// # Arguments
/// * `batch_size` - Amount of samples to split.
/// * `config` - The workers to split over.
///
/// # Returns
/// Contiguous assignments in configuration order that tile the whole batch, or a
/// `ConfigurationError` if there are no workers or fewer samples than active workers.
pub fn partition(
    batch_size: usize,
    config: &ClusterConfig,
) -> Result<Vec<ShardAssignment>, ConfigurationError> {
    if config.is_empty() {
        return Err(ConfigurationError::NoWorkers);
    }

    let use_gpus = config.prefer_gpu() && config.workers().any(|(_, d)| d.gpu_count() > 0);

    let active: Vec<(&str, usize)> = config
        .workers()
        .filter_map(|(name, d)| match use_gpus {
            true if d.gpu_count() == 0 => None,
            true => Some((name, d.gpu_count())),
            false => Some((name, 1)),
        })
        .collect();

    if batch_size < active.len() {
        return Err(ConfigurationError::BatchTooSmall {
            batch_size,
            active: active.len(),
        });
    }

    let total: u128 = active.iter().map(|&(_, w)| w as u128).sum();

    let mut counts: Vec<usize> = active
        .iter()
        .map(|&(_, w)| (batch_size as u128 * w as u128 / total) as usize)
        .collect();

    let assigned: usize = counts.iter().sum();
    counts[0] += batch_size - assigned;

    while let Some(empty) = counts.iter().position(|&c| c == 0) {
        let largest = (0..counts.len()).max_by_key(|&i| counts[i]).unwrap_or(0);
        counts[largest] -= 1;
        counts[empty] += 1;
    }

    let mut start = 0;
    let assignments = active
        .iter()
        .zip(counts)
        .map(|(&(name, _), count)| {
            let sample_range = start..start + count;
            start += count;
            ShardAssignment {
                owner: name.to_string(),
                sample_range,
            }
        })
        .collect();

    Ok(assignments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResourceDescriptor, create_config};

    fn worker(gpus: u32) -> ResourceDescriptor {
        ResourceDescriptor::new("h").with_gpus(0..gpus).unwrap()
    }

    fn sizes(assignments: &[ShardAssignment]) -> Vec<(&str, usize)> {
        assignments
            .iter()
            .map(|a| (a.owner.as_str(), a.sample_range.len()))
            .collect()
    }

    fn assert_tiles(assignments: &[ShardAssignment], batch_size: usize) {
        let mut next = 0;
        for a in assignments {
            assert_eq!(a.sample_range.start, next);
            assert!(!a.sample_range.is_empty());
            next = a.sample_range.end;
        }
        assert_eq!(next, batch_size);
    }

    #[test]
    fn gpu_workers_weighted_by_gpu_count() {
        let config = create_config([("a", worker(1)), ("b", worker(3)), ("c", worker(0))], 1, true)
            .unwrap();

        let assignments = partition(8, &config).unwrap();
        assert_eq!(sizes(&assignments), [("a", 2), ("b", 6)]);
        assert_tiles(&assignments, 8);

        for (batch_size, split) in [(4, [1, 3]), (12, [3, 9]), (16, [4, 12])] {
            let assignments = partition(batch_size, &config).unwrap();
            assert_eq!(sizes(&assignments), [("a", split[0]), ("b", split[1])]);
        }
    }

    #[test]
    fn truncation_remainder_goes_to_the_first_gpu_worker() {
        let config = create_config([("a", worker(1)), ("b", worker(3))], 1, true).unwrap();

        // 10 / 4 per gpu leaves 2 + 7, the missing sample goes to a.
        let assignments = partition(10, &config).unwrap();
        assert_eq!(sizes(&assignments), [("a", 3), ("b", 7)]);
    }

    #[test]
    fn starved_worker_takes_one_from_the_largest_shard() {
        let config = create_config([("a", worker(8)), ("b", worker(1))], 1, true).unwrap();

        // a gets 3 * 8 / 9 = 2 plus the 1 left over, b gets 3 * 1 / 9 = 0.
        let assignments = partition(3, &config).unwrap();
        assert_eq!(sizes(&assignments), [("a", 2), ("b", 1)]);
        assert_tiles(&assignments, 3);
    }

    #[test]
    fn remainder_goes_to_the_first_worker() {
        let config =
            create_config([("a", worker(1)), ("b", worker(1)), ("c", worker(1))], 1, true).unwrap();

        let assignments = partition(8, &config).unwrap();
        assert_eq!(sizes(&assignments), [("a", 4), ("b", 2), ("c", 2)]);
        assert_tiles(&assignments, 8);
    }

    #[test]
    fn cpu_only_cluster_splits_evenly() {
        let config = create_config([("a", worker(0)), ("b", worker(0))], 1, true).unwrap();

        let assignments = partition(6, &config).unwrap();
        assert_eq!(sizes(&assignments), [("a", 3), ("b", 3)]);
    }

    #[test]
    fn gpus_are_ignored_without_preference() {
        let config = create_config([("a", worker(4)), ("b", worker(0))], 1, false).unwrap();

        let assignments = partition(5, &config).unwrap();
        assert_eq!(sizes(&assignments), [("a", 3), ("b", 2)]);
    }

    #[test]
    fn batch_smaller_than_active_workers() {
        let config = create_config([("a", worker(1)), ("b", worker(1))], 1, true).unwrap();

        assert_eq!(
            partition(1, &config),
            Err(ConfigurationError::BatchTooSmall {
                batch_size: 1,
                active: 2
            })
        );
    }

    #[test]
    fn empty_config_is_rejected() {
        let config = create_config(Vec::<(String, ResourceDescriptor)>::new(), 1, true).unwrap();
        assert_eq!(partition(4, &config), Err(ConfigurationError::NoWorkers));
    }

    #[test]
    fn tiles_for_many_shapes() {
        for gpus in [[0, 0, 0], [1, 2, 3], [0, 5, 1], [7, 0, 0]] {
            for prefer_gpu in [true, false] {
                let config = create_config(
                    [("a", worker(gpus[0])), ("b", worker(gpus[1])), ("c", worker(gpus[2]))],
                    1,
                    prefer_gpu,
                )
                .unwrap();

                for batch_size in 3..64 {
                    let assignments = partition(batch_size, &config).unwrap();
                    assert_tiles(&assignments, batch_size);
                }
            }
        }
    }
}
