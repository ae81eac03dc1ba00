//! Per-class clustering primitive.
//!
//! `ClusterManager` treats clustering as a black box behind the
//! [`Clusterer`] trait: one `fit_predict` call per class per recluster.
//! [`KMeans`] is the bundled implementation (k-means++ seeding, a single
//! initialisation, Lloyd iterations up to a cap).

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use thiserror::Error;

use super::state::squared_distance;

/// Centroid movement (squared) below which Lloyd iterations stop early.
const CONVERGENCE_TOL_SQ: f64 = 1e-12;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("k must be at least 1")]
    ZeroClusters,

    #[error("cannot fit {need} clusters to {have} points")]
    TooFewPoints { have: usize, need: usize },

    #[error("point {index} has dimension {got}, expected {expected}")]
    RaggedInput {
        index: usize,
        expected: usize,
        got: usize,
    },

    #[error("clusterer returned a malformed fit: {0}")]
    MalformedFit(String),
}

/// Result of clustering one class: `k` centroids and a local cluster index
/// (`0..k`) per input point.
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansFit {
    pub centroids: Vec<Vec<f64>>,
    pub assignments: Vec<usize>,
}

/// Clustering routine invoked once per class during a recluster.
pub trait Clusterer: Send + Sync + std::fmt::Debug {
    /// Partition `points` into exactly `k` clusters, running at most
    /// `max_iterations` refinement steps.
    fn fit_predict(
        &self,
        k: usize,
        max_iterations: usize,
        points: &[&[f64]],
    ) -> Result<KMeansFit, ClusterError>;
}

/// Lloyd's k-means with k-means++ initialisation.
///
/// With a seed set, repeated fits on the same points are identical.
#[derive(Debug, Clone, Default)]
pub struct KMeans {
    seed: Option<u64>,
}

impl KMeans {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fix the RNG seed used for k-means++ initialisation.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// k-means++: first centre uniform, then proportional to squared
    /// distance from the nearest chosen centre.
    fn seed_centroids(points: &[&[f64]], k: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
        let mut centroids: Vec<Vec<f64>> = Vec::with_capacity(k);
        centroids.push(points[rng.gen_range(0..points.len())].to_vec());

        let mut nearest: Vec<f64> = points
            .iter()
            .map(|p| squared_distance(p, &centroids[0]))
            .collect();

        while centroids.len() < k {
            // All-zero weights means every point coincides with a centre already
            let next = match WeightedIndex::new(&nearest) {
                Ok(dist) => dist.sample(rng),
                Err(_) => rng.gen_range(0..points.len()),
            };
            let centre = points[next].to_vec();
            for (d, p) in nearest.iter_mut().zip(points.iter()) {
                *d = d.min(squared_distance(p, &centre));
            }
            centroids.push(centre);
        }
        centroids
    }

    fn assign(points: &[&[f64]], centroids: &[Vec<f64>]) -> Vec<usize> {
        points
            .par_iter()
            .map(|p| nearest_centroid(p, centroids).0)
            .collect()
    }

    /// Mean of each cluster's points; empty clusters keep their old centre.
    fn update(points: &[&[f64]], assignments: &[usize], centroids: &[Vec<f64>]) -> Vec<Vec<f64>> {
        let dim = centroids.first().map_or(0, Vec::len);
        let mut sums = vec![vec![0.0; dim]; centroids.len()];
        let mut counts = vec![0usize; centroids.len()];

        for (p, &c) in points.iter().zip(assignments.iter()) {
            counts[c] += 1;
            for (s, x) in sums[c].iter_mut().zip(p.iter()) {
                *s += x;
            }
        }

        sums.into_iter()
            .zip(counts)
            .zip(centroids.iter())
            .map(|((sum, count), old)| {
                if count == 0 {
                    old.clone()
                } else {
                    sum.into_iter().map(|s| s / count as f64).collect()
                }
            })
            .collect()
    }

    /// Give every empty cluster one point, taken from the largest-error
    /// position among clusters that can spare a member.
    fn repair_empty(points: &[&[f64]], assignments: &mut [usize], centroids: &mut [Vec<f64>]) {
        let k = centroids.len();
        let mut counts = vec![0usize; k];
        for &c in assignments.iter() {
            counts[c] += 1;
        }

        for empty in 0..k {
            if counts[empty] > 0 {
                continue;
            }
            let donor = (0..points.len())
                .filter(|&i| counts[assignments[i]] > 1)
                .max_by(|&a, &b| {
                    let da = squared_distance(points[a], &centroids[assignments[a]]);
                    let db = squared_distance(points[b], &centroids[assignments[b]]);
                    da.total_cmp(&db).then(b.cmp(&a))
                });
            let Some(i) = donor else {
                // Fewer points than clusters; validated before fitting
                return;
            };
            counts[assignments[i]] -= 1;
            counts[empty] += 1;
            assignments[i] = empty;
            centroids[empty] = points[i].to_vec();
        }
    }
}

impl Clusterer for KMeans {
    fn fit_predict(
        &self,
        k: usize,
        max_iterations: usize,
        points: &[&[f64]],
    ) -> Result<KMeansFit, ClusterError> {
        if k == 0 {
            return Err(ClusterError::ZeroClusters);
        }
        if points.len() < k {
            return Err(ClusterError::TooFewPoints {
                have: points.len(),
                need: k,
            });
        }
        let dim = points[0].len();
        if let Some((index, p)) = points.iter().enumerate().find(|(_, p)| p.len() != dim) {
            return Err(ClusterError::RaggedInput {
                index,
                expected: dim,
                got: p.len(),
            });
        }

        let mut rng = self.rng();
        let mut centroids = Self::seed_centroids(points, k, &mut rng);

        for _ in 0..max_iterations {
            let assignments = Self::assign(points, &centroids);
            let updated = Self::update(points, &assignments, &centroids);
            let shift = centroids
                .iter()
                .zip(updated.iter())
                .map(|(a, b)| squared_distance(a, b))
                .fold(0.0_f64, f64::max);
            centroids = updated;
            if shift < CONVERGENCE_TOL_SQ {
                break;
            }
        }

        let mut assignments = Self::assign(points, &centroids);
        Self::repair_empty(points, &mut assignments, &mut centroids);

        Ok(KMeansFit {
            centroids,
            assignments,
        })
    }
}

/// Index and squared distance of the closest centroid (lowest index on ties).
fn nearest_centroid(point: &[f64], centroids: &[Vec<f64>]) -> (usize, f64) {
    let mut best = 0usize;
    let mut best_dist = f64::MAX;
    for (i, c) in centroids.iter().enumerate() {
        let dist = squared_distance(point, c);
        if dist < best_dist {
            best_dist = dist;
            best = i;
        }
    }
    (best, best_dist)
}
