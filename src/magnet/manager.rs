//! Rebuilds the cluster state from a full pass over the embedding table.

use tracing::{debug, info, warn};

use super::classes::ClassIndex;
use super::kmeans::{ClusterError, Clusterer, KMeans};
use super::state::{cluster_id, ClusterState};
use super::MagnetError;

/// Re-clusters every class independently into `k` sub-clusters.
#[derive(Debug)]
pub struct ClusterManager {
    k: usize,
    clusterer: Box<dyn Clusterer>,
}

impl ClusterManager {
    /// Manager using the bundled k-means.
    pub fn new(k: usize, clusterer_seed: Option<u64>) -> Self {
        let kmeans = match clusterer_seed {
            Some(seed) => KMeans::new().with_seed(seed),
            None => KMeans::new(),
        };
        Self::with_clusterer(k, Box::new(kmeans))
    }

    /// Manager delegating to a caller-supplied clustering routine.
    pub fn with_clusterer(k: usize, clusterer: Box<dyn Clusterer>) -> Self {
        Self { k, clusterer }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Cluster each class's embeddings and assemble a fresh [`ClusterState`].
    ///
    /// `embeddings[i]` is the current representation of training example
    /// `i`. Errors from the clustering routine (e.g. a class with fewer than
    /// `k` examples) are returned unchanged inside [`MagnetError::Clustering`].
    pub fn recluster<L>(
        &self,
        classes: &ClassIndex<L>,
        embeddings: &[Vec<f64>],
        max_iterations: usize,
    ) -> Result<ClusterState, MagnetError> {
        if embeddings.len() != classes.num_examples() {
            return Err(MagnetError::LengthMismatch {
                what: "embeddings",
                expected: classes.num_examples(),
                got: embeddings.len(),
            });
        }
        let dim = embeddings.first().map_or(0, Vec::len);
        if dim == 0 {
            return Err(MagnetError::DimensionMismatch { expected: 1, got: 0 });
        }
        if let Some(row) = embeddings.iter().find(|row| row.len() != dim) {
            return Err(MagnetError::DimensionMismatch {
                expected: dim,
                got: row.len(),
            });
        }

        let k = self.k;
        let num_classes = classes.num_classes();
        let mut centroids = vec![0.0; num_classes * k * dim];
        let mut assignments = vec![0usize; embeddings.len()];

        for class in 0..num_classes {
            let examples = classes.examples_of(class);
            let points: Vec<&[f64]> = examples.iter().map(|&i| embeddings[i].as_slice()).collect();

            let fit = self.clusterer.fit_predict(k, max_iterations, &points)?;
            check_fit(&fit.centroids, &fit.assignments, k, dim, points.len())?;

            let start = cluster_id(class, 0, k) * dim;
            for (slot, centroid) in centroids[start..start + k * dim]
                .chunks_exact_mut(dim)
                .zip(fit.centroids.iter())
            {
                slot.copy_from_slice(centroid);
            }
            for (&example, &local) in examples.iter().zip(fit.assignments.iter()) {
                assignments[example] = cluster_id(class, local, k);
            }

            debug!(class, examples = examples.len(), "Class re-clustered");
        }

        let state = ClusterState::from_parts(num_classes, k, dim, centroids, assignments);

        let empty = state.empty_clusters();
        if !empty.is_empty() {
            warn!(clusters = ?empty, "Re-clustering left empty clusters; they will not be sampled");
        }
        info!(
            classes = num_classes,
            clusters = state.num_clusters(),
            examples = state.num_examples(),
            dim,
            "Cluster state rebuilt"
        );

        Ok(state)
    }
}

/// Reject fits whose shape does not match the request.
fn check_fit(
    centroids: &[Vec<f64>],
    assignments: &[usize],
    k: usize,
    dim: usize,
    points: usize,
) -> Result<(), ClusterError> {
    if centroids.len() != k {
        return Err(ClusterError::MalformedFit(format!(
            "{} centroids for k = {k}",
            centroids.len()
        )));
    }
    if let Some(c) = centroids.iter().find(|c| c.len() != dim) {
        return Err(ClusterError::MalformedFit(format!(
            "centroid of dimension {} (expected {dim})",
            c.len()
        )));
    }
    if assignments.len() != points {
        return Err(ClusterError::MalformedFit(format!(
            "{} assignments for {points} points",
            assignments.len()
        )));
    }
    if let Some(&a) = assignments.iter().find(|&&a| a >= k) {
        return Err(ClusterError::MalformedFit(format!(
            "local cluster {a} out of range for k = {k}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::magnet::kmeans::KMeansFit;

    /// Puts every point in local cluster 0 and reports a fixed centroid.
    #[derive(Debug)]
    struct Lumping;

    impl Clusterer for Lumping {
        fn fit_predict(
            &self,
            k: usize,
            _max_iterations: usize,
            points: &[&[f64]],
        ) -> Result<KMeansFit, ClusterError> {
            Ok(KMeansFit {
                centroids: vec![vec![0.0; points[0].len()]; k],
                assignments: vec![0; points.len()],
            })
        }
    }

    /// Returns the wrong number of centroids.
    #[derive(Debug)]
    struct Broken;

    impl Clusterer for Broken {
        fn fit_predict(
            &self,
            _k: usize,
            _max_iterations: usize,
            points: &[&[f64]],
        ) -> Result<KMeansFit, ClusterError> {
            Ok(KMeansFit {
                centroids: vec![],
                assignments: vec![0; points.len()],
            })
        }
    }

    fn blobs() -> (ClassIndex<u8>, Vec<Vec<f64>>) {
        let labels = [0u8, 0, 0, 0, 1, 1, 1, 1];
        let embeddings = vec![
            vec![0.0, 0.0], vec![0.2, 0.0], vec![5.0, 0.0], vec![5.2, 0.0],
            vec![0.0, 5.0], vec![0.0, 5.2], vec![5.0, 5.0], vec![5.2, 5.0],
        ];
        (ClassIndex::new(&labels), embeddings)
    }

    #[test]
    fn test_assignments_stay_within_own_class() {
        let (classes, embeddings) = blobs();
        let manager = ClusterManager::new(2, Some(11));
        let state = manager.recluster(&classes, &embeddings, 20).unwrap();

        assert_eq!(state.num_clusters(), 4);
        for i in 0..embeddings.len() {
            assert_eq!(state.class_of(state.assignment(i)), classes.class_of(i));
        }
        assert!(state.is_consistent());
    }

    #[test]
    fn test_custom_clusterer_is_used() {
        let (classes, embeddings) = blobs();
        let manager = ClusterManager::with_clusterer(2, Box::new(Lumping));
        let state = manager.recluster(&classes, &embeddings, 5).unwrap();
        assert_eq!(state.members(0), &[0, 1, 2, 3]);
        assert_eq!(state.members(2), &[4, 5, 6, 7]);
        assert_eq!(state.empty_clusters(), vec![1, 3]);
    }

    #[test]
    fn test_malformed_fit_rejected() {
        let (classes, embeddings) = blobs();
        let manager = ClusterManager::with_clusterer(2, Box::new(Broken));
        let err = manager.recluster(&classes, &embeddings, 5).unwrap_err();
        assert!(matches!(err, MagnetError::Clustering(ClusterError::MalformedFit(_))));
    }

    #[test]
    fn test_class_smaller_than_k_surfaces_clustering_error() {
        let (classes, embeddings) = blobs();
        let manager = ClusterManager::new(5, Some(1));
        let err = manager.recluster(&classes, &embeddings, 5).unwrap_err();
        assert!(matches!(
            err,
            MagnetError::Clustering(ClusterError::TooFewPoints { have: 4, need: 5 })
        ));
    }

    #[test]
    fn test_embedding_count_must_match_labels() {
        let (classes, mut embeddings) = blobs();
        embeddings.pop();
        let manager = ClusterManager::new(2, Some(1));
        let err = manager.recluster(&classes, &embeddings, 5).unwrap_err();
        assert!(matches!(err, MagnetError::LengthMismatch { expected: 8, got: 7, .. }));
    }

    #[test]
    fn test_ragged_embeddings_rejected() {
        let (classes, mut embeddings) = blobs();
        embeddings[3] = vec![1.0];
        let manager = ClusterManager::new(2, Some(1));
        let err = manager.recluster(&classes, &embeddings, 5).unwrap_err();
        assert!(matches!(err, MagnetError::DimensionMismatch { expected: 2, got: 1 }));
    }
}
