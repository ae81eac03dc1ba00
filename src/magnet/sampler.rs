//! Loss-weighted, neighbour-aware batch construction.
//!
//! A batch is `m` clusters × `d` examples: one seed cluster, chosen in
//! proportion to its mean loss, plus the `m - 1` foreign-class clusters
//! whose centroids lie closest to the seed centroid. Examples are laid out
//! in contiguous blocks of `d`, seed block first.

use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::state::ClusterState;
use super::MagnetError;

/// One sampled training batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Training-example indices, `m` blocks of `d`.
    pub indices: Vec<usize>,
    /// Batch-local class id of every example, numbered by first appearance.
    /// The loss needs global class indices: see [`Batch::global_classes`].
    pub local_class_ids: Vec<usize>,
    /// Global cluster id of every block (seed first, then impostors by distance).
    pub clusters: Vec<usize>,
    /// Global class index of every local class id.
    pub class_map: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Seed cluster of the batch.
    pub fn seed_cluster(&self) -> Option<usize> {
        self.clusters.first().copied()
    }

    /// Global class index of every example.
    pub fn global_classes(&self) -> Vec<usize> {
        self.local_class_ids
            .iter()
            .map(|&local| self.class_map[local])
            .collect()
    }
}

/// Draws structured `m × d` batches from the current cluster state.
#[derive(Debug, Clone, Copy)]
pub struct BatchSampler {
    m: usize,
    d: usize,
}

impl BatchSampler {
    pub fn new(m: usize, d: usize) -> Self {
        Self { m, d }
    }

    /// Clusters per batch.
    pub fn m(&self) -> usize {
        self.m
    }

    /// Examples per cluster per batch.
    pub fn d(&self) -> usize {
        self.d
    }

    /// Sample one batch.
    ///
    /// `cluster_losses` are the tracker's mean cluster losses, or `None`
    /// before any loss has been recorded (uniform seed choice). Requires at
    /// least `m - 1` non-empty clusters belonging to classes other than the
    /// seed's.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        state: &ClusterState,
        cluster_losses: Option<&[f64]>,
        rng: &mut R,
    ) -> Result<Batch, MagnetError> {
        let seed = self.pick_seed(state, cluster_losses, rng)?;
        let impostors = self.impostors(state, seed)?;

        let mut clusters = Vec::with_capacity(self.m);
        clusters.push(seed);
        clusters.extend(impostors);

        let mut indices = Vec::with_capacity(self.m * self.d);
        for &c in &clusters {
            let members = state.members(c);
            if members.is_empty() {
                return Err(MagnetError::EmptyCluster(c));
            }
            // With replacement regardless of cluster size
            indices.extend((0..self.d).map(|_| members[rng.gen_range(0..members.len())]));
        }

        let mut class_map: Vec<usize> = Vec::new();
        let mut local_class_ids = Vec::with_capacity(self.m * self.d);
        for &c in &clusters {
            let class = state.class_of(c);
            let local = match class_map.iter().position(|&seen| seen == class) {
                Some(local) => local,
                None => {
                    class_map.push(class);
                    class_map.len() - 1
                }
            };
            local_class_ids.extend(std::iter::repeat(local).take(self.d));
        }

        debug!(
            seed,
            impostors = ?&clusters[1..],
            classes = class_map.len(),
            "Sampled batch"
        );

        Ok(Batch {
            indices,
            local_class_ids,
            clusters,
            class_map,
        })
    }

    /// Seed cluster: proportional to cluster loss when losses exist,
    /// otherwise uniform. Empty clusters are never chosen.
    fn pick_seed<R: Rng + ?Sized>(
        &self,
        state: &ClusterState,
        cluster_losses: Option<&[f64]>,
        rng: &mut R,
    ) -> Result<usize, MagnetError> {
        let candidates: Vec<usize> = (0..state.num_clusters())
            .filter(|&c| !state.members(c).is_empty())
            .collect();

        if let Some(losses) = cluster_losses {
            let weights: Vec<f64> = (0..state.num_clusters())
                .map(|c| {
                    let loss = losses.get(c).copied().unwrap_or(0.0);
                    if state.members(c).is_empty() || !loss.is_finite() {
                        0.0
                    } else {
                        loss.max(0.0)
                    }
                })
                .collect();

            match WeightedIndex::new(&weights) {
                Ok(dist) => return Ok(dist.sample(rng)),
                Err(e) => {
                    warn!(error = %e, "Cluster losses unusable as weights; seeding uniformly");
                }
            }
        }

        candidates
            .choose(rng)
            .copied()
            .ok_or(MagnetError::EmptyCluster(0))
    }

    /// The `m - 1` closest non-empty clusters of a different class.
    ///
    /// Ties in distance resolve to the lower cluster id. Distances that
    /// overflowed to infinity rank last but stay eligible.
    fn impostors(&self, state: &ClusterState, seed: usize) -> Result<Vec<usize>, MagnetError> {
        let needed = self.m.saturating_sub(1);
        let seed_class = state.class_of(seed);
        let seed_centroid = state.centroid(seed);

        let distances = state.distances_from(seed_centroid);
        let mut ranked: Vec<(f64, usize)> = distances
            .into_iter()
            .enumerate()
            .filter(|&(c, _)| state.class_of(c) != seed_class && !state.members(c).is_empty())
            .map(|(c, dist)| (dist, c))
            .collect();

        let available = ranked.len();
        if available < needed {
            return Err(MagnetError::InsufficientImpostors { needed, available });
        }

        ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        Ok(ranked.into_iter().take(needed).map(|(_, c)| c).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// 3 classes, k = 2, 1-d centroids; every cluster has two members.
    ///
    /// class 0: clusters 0 (at 0.0), 1 (at 1.0)
    /// class 1: clusters 2 (at 2.0), 3 (at 10.0)
    /// class 2: clusters 4 (at 3.0), 5 (at 20.0)
    fn state() -> ClusterState {
        ClusterState::from_parts(
            3,
            2,
            1,
            vec![0.0, 1.0, 2.0, 10.0, 3.0, 20.0],
            vec![0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5],
        )
    }

    #[test]
    fn test_batch_shape_and_blocks() {
        let state = state();
        let sampler = BatchSampler::new(3, 4);
        let mut rng = StdRng::seed_from_u64(5);

        for _ in 0..50 {
            let batch = sampler.sample(&state, None, &mut rng).unwrap();
            assert_eq!(batch.len(), 12);
            assert_eq!(batch.local_class_ids.len(), 12);
            assert_eq!(batch.clusters.len(), 3);
            for (block, &cluster) in batch.clusters.iter().enumerate() {
                let ids = &batch.indices[block * 4..(block + 1) * 4];
                assert!(ids.iter().all(|&i| state.assignment(i) == cluster));
                let labels = &batch.local_class_ids[block * 4..(block + 1) * 4];
                assert!(labels.iter().all(|&l| l == labels[0]));
            }
            assert_eq!(batch.local_class_ids[0], 0);
        }
    }

    #[test]
    fn test_impostors_are_nearest_foreign_clusters() {
        let state = state();
        let sampler = BatchSampler::new(3, 1);
        // Seed cluster 1 at 1.0: foreign clusters by distance are 2 (2.0), 4 (3.0)
        assert_eq!(sampler.impostors(&state, 1).unwrap(), vec![2, 4]);
        // Seed cluster 3 at 10.0: foreign are 4 (3.0, d=49), 1 (1.0, d=81), 0, 5
        assert_eq!(sampler.impostors(&state, 3).unwrap(), vec![4, 1]);
    }

    #[test]
    fn test_impostor_ties_prefer_lower_id() {
        // Seed cluster 0 at 0.0, foreign clusters 2 and 3 both at distance 1
        let state = ClusterState::from_parts(2, 2, 1, vec![0.0, 5.0, 1.0, -1.0], vec![0, 1, 2, 3]);
        let sampler = BatchSampler::new(2, 1);
        assert_eq!(sampler.impostors(&state, 0).unwrap(), vec![2]);
    }

    #[test]
    fn test_overflowed_distance_still_counts_as_impostor() {
        // Seed cluster 0 at 0.0; foreign clusters at 1e200 (distance inf) and 2.0
        let state = ClusterState::from_parts(3, 1, 1, vec![0.0, 1e200, 2.0], vec![0, 1, 2]);
        let sampler = BatchSampler::new(3, 1);
        assert_eq!(sampler.impostors(&state, 0).unwrap(), vec![2, 1]);
    }

    #[test]
    fn test_too_few_impostors_is_an_error() {
        let state = state();
        let sampler = BatchSampler::new(6, 1);
        let err = sampler.impostors(&state, 0).unwrap_err();
        assert!(matches!(
            err,
            MagnetError::InsufficientImpostors { needed: 5, available: 4 }
        ));
    }

    #[test]
    fn test_loss_weighted_seed_only_picks_lossy_clusters() {
        let state = state();
        let sampler = BatchSampler::new(2, 2);
        let mut rng = StdRng::seed_from_u64(17);
        let losses = [0.0, 0.0, 0.0, 2.0, 0.0, 0.0];
        for _ in 0..30 {
            let batch = sampler.sample(&state, Some(&losses), &mut rng).unwrap();
            assert_eq!(batch.seed_cluster(), Some(3));
        }
    }

    #[test]
    fn test_all_zero_losses_fall_back_to_uniform() {
        let state = state();
        let sampler = BatchSampler::new(2, 1);
        let mut rng = StdRng::seed_from_u64(3);
        let losses = [0.0; 6];
        let mut seen = [false; 6];
        for _ in 0..200 {
            let batch = sampler.sample(&state, Some(&losses), &mut rng).unwrap();
            seen[batch.clusters[0]] = true;
        }
        assert!(seen.iter().all(|&s| s), "uniform seed should reach every cluster");
    }

    #[test]
    fn test_local_class_ids_follow_first_appearance() {
        let state = state();
        let sampler = BatchSampler::new(3, 2);
        let mut rng = StdRng::seed_from_u64(1);
        // Force seed cluster 3 (class 1); impostors 4 (class 2), 1 (class 0)
        let losses = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0];
        let batch = sampler.sample(&state, Some(&losses), &mut rng).unwrap();
        assert_eq!(batch.clusters, vec![3, 4, 1]);
        assert_eq!(batch.local_class_ids, vec![0, 0, 1, 1, 2, 2]);
        assert_eq!(batch.class_map, vec![1, 2, 0]);
        assert_eq!(batch.global_classes(), vec![1, 1, 2, 2, 0, 0]);
    }

    #[test]
    fn test_empty_clusters_are_never_sampled() {
        // Cluster 1 (class 0) and cluster 2 (class 1) are empty
        let state = ClusterState::from_parts(
            2,
            2,
            1,
            vec![0.0, 0.5, 0.6, 3.0],
            vec![0, 0, 3, 3],
        );
        let sampler = BatchSampler::new(2, 2);
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..40 {
            let batch = sampler.sample(&state, None, &mut rng).unwrap();
            assert!(!batch.clusters.contains(&1));
            assert!(!batch.clusters.contains(&2));
        }
    }

    #[test]
    fn test_same_seed_same_batch() {
        let state = state();
        let sampler = BatchSampler::new(3, 3);
        let a = sampler.sample(&state, None, &mut StdRng::seed_from_u64(42)).unwrap();
        let b = sampler.sample(&state, None, &mut StdRng::seed_from_u64(42)).unwrap();
        assert_eq!(a, b);
    }
}
