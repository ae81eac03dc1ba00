//! Magnet loss over a batch, nearest-centroid prediction and accuracy.
//!
//! For example `i` with class `y_i`, squared centroid distances
//! `s_ic = |x_i - mu_c|^2` are taken against the full centroid table:
//!
//! ```text
//! a_i    = min_{c : class(c) = y_i} s_ic
//! var    = sum_i a_i / (N - 1)
//! lambda = -1 / (2 var^2)
//! L_i    = max(0, -ln( exp(lambda a_i - alpha) / (sum_{c : class(c) != y_i} exp(lambda s_ic) + eps) + eps ))
//! ```
//!
//! The total loss is the mean of `L_i`. Gradients with respect to every
//! embedding are returned alongside (centroids are constants here).

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use tracing::warn;

use super::classes::ClassIndex;
use super::state::ClusterState;
use super::MagnetError;

/// Guards the ratio and the logarithm against zero.
pub const EPSILON: f64 = 1e-8;

/// Smallest variance used for the normaliser; lower values are clamped.
pub const VARIANCE_FLOOR: f64 = 1e-8;

/// Output of one loss evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossReport {
    /// Mean of the per-example losses.
    pub total_loss: f64,
    /// Rectified loss of every example.
    pub losses: Vec<f64>,
    /// Fraction of examples whose nearest centroid belongs to their class.
    pub accuracy: f64,
    /// Variance estimate actually used (after flooring).
    pub variance: f64,
    /// Mean embedding of each batch cluster.
    pub batch_cluster_means: Vec<Vec<f64>>,
    /// d(total_loss) / d(embedding) for every example.
    pub gradients: Vec<Vec<f64>>,
}

/// Magnet loss for a batch partitioned into `num_clusters` equal groups.
///
/// `classes[i]` is the global class index of example `i`, `clusters[i]` its
/// batch cluster (`0..num_clusters`) and `cluster_classes[g]` the class of
/// batch cluster `g`.
pub fn compute(
    state: &ClusterState,
    embeddings: &[Vec<f64>],
    classes: &[usize],
    clusters: &[usize],
    cluster_classes: &[usize],
    num_clusters: usize,
    alpha: f64,
) -> Result<LossReport, MagnetError> {
    let n = embeddings.len();
    check_batch(state, embeddings, classes, clusters, cluster_classes, num_clusters)?;

    let batch_cluster_means = batch_means(embeddings, clusters, num_clusters, state.dim());
    let cluster_of = state.cluster_classes();
    let num_total = state.num_clusters();

    // Squared distance of every example to every centroid
    let costs: Vec<Vec<f64>> = embeddings.iter().map(|x| state.distances_from(x)).collect();
    if let Some(example) = costs.iter().position(|row| row.iter().any(|s| !s.is_finite())) {
        return Err(MagnetError::NonFiniteDistance { example });
    }

    // Closest same-class centroid per example
    let mut intra = Vec::with_capacity(n);
    let mut intra_cluster = Vec::with_capacity(n);
    for (row, &class) in costs.iter().zip(classes.iter()) {
        let (best, cost) = (0..num_total)
            .filter(|&c| cluster_of[c] == class)
            .map(|c| (c, row[c]))
            .fold((0usize, f64::MAX), |acc, cur| if cur.1 < acc.1 { cur } else { acc });
        intra_cluster.push(best);
        intra.push(cost);
    }

    let divisor = n.saturating_sub(1).max(1) as f64;
    let raw_variance = intra.iter().sum::<f64>() / divisor;
    if raw_variance.is_infinite() {
        return Err(MagnetError::NonFiniteVariance);
    }
    let floored = raw_variance.is_nan() || raw_variance <= VARIANCE_FLOOR;
    let variance = if floored {
        warn!(variance = raw_variance, floor = VARIANCE_FLOOR, "Batch variance below floor; clamping");
        VARIANCE_FLOOR
    } else {
        raw_variance
    };
    let normalizer = -1.0 / (2.0 * variance * variance);

    let mut losses = Vec::with_capacity(n);
    let mut ratios = Vec::with_capacity(n);
    let mut denominators = Vec::with_capacity(n);
    // exp(normalizer * s_ic) for foreign clusters, 0 for same-class ones
    let mut foreign_terms: Vec<Vec<f64>> = Vec::with_capacity(n);

    for i in 0..n {
        let numerator = (normalizer * intra[i] - alpha).exp();
        let terms: Vec<f64> = (0..num_total)
            .map(|c| {
                if cluster_of[c] == classes[i] {
                    0.0
                } else {
                    (normalizer * costs[i][c]).exp()
                }
            })
            .collect();
        let denominator = terms.iter().sum::<f64>() + EPSILON;
        let ratio = numerator / denominator;

        losses.push((-(ratio + EPSILON).ln()).max(0.0));
        ratios.push(ratio);
        denominators.push(denominator);
        foreign_terms.push(terms);
    }

    let total_loss = losses.iter().mean();

    let correct = costs
        .iter()
        .zip(classes.iter())
        .filter(|(row, class)| cluster_of[argmin(row)] == **class)
        .count();
    let accuracy = correct as f64 / n as f64;

    // Backward pass. w_i = dTotal/dL_i * dL_i/d(ln r_i); zero where rectified.
    let weights: Vec<f64> = (0..n)
        .map(|i| {
            if losses[i] > 0.0 {
                -ratios[i] / (ratios[i] + EPSILON) / n as f64
            } else {
                0.0
            }
        })
        .collect();

    // dTotal/d(normalizer)
    let d_normalizer: f64 = (0..n)
        .map(|i| {
            let weighted_costs: f64 = foreign_terms[i]
                .iter()
                .zip(costs[i].iter())
                .map(|(e, s)| e * s)
                .sum();
            weights[i] * (intra[i] - weighted_costs / denominators[i])
        })
        .sum();
    // Clamped variance does not depend on the embeddings
    let d_intra = if floored {
        0.0
    } else {
        d_normalizer / (variance * variance * variance) / divisor
    };

    let gradients: Vec<Vec<f64>> = (0..n)
        .map(|i| {
            let x = &embeddings[i];
            let own = state.centroid(intra_cluster[i]);
            let mut grad: Vec<f64> = x
                .iter()
                .zip(own.iter())
                .map(|(xv, mv)| 2.0 * (xv - mv) * (weights[i] * normalizer + d_intra))
                .collect();

            if weights[i] != 0.0 {
                for (c, &e) in foreign_terms[i].iter().enumerate() {
                    if e == 0.0 {
                        continue;
                    }
                    let scale = weights[i] * normalizer * e / denominators[i];
                    for ((g, xv), mv) in grad.iter_mut().zip(x.iter()).zip(state.centroid(c).iter()) {
                        *g -= scale * 2.0 * (xv - mv);
                    }
                }
            }
            grad
        })
        .collect();

    Ok(LossReport {
        total_loss,
        losses,
        accuracy,
        variance,
        batch_cluster_means,
        gradients,
    })
}

/// Magnet loss for a batch of `m` contiguous blocks of `d` examples, as
/// produced by `BatchSampler`.
///
/// `classes` are global class indices (see `Batch::global_classes`).
pub fn compute_minibatch(
    state: &ClusterState,
    embeddings: &[Vec<f64>],
    classes: &[usize],
    m: usize,
    d: usize,
    alpha: f64,
) -> Result<LossReport, MagnetError> {
    if m == 0 || d == 0 || embeddings.len() != m * d {
        return Err(MagnetError::UnevenBatch {
            batch: embeddings.len(),
            clusters: m,
        });
    }
    if classes.len() != embeddings.len() {
        return Err(MagnetError::LengthMismatch {
            what: "classes",
            expected: embeddings.len(),
            got: classes.len(),
        });
    }

    let clusters: Vec<usize> = (0..m * d).map(|i| i / d).collect();
    let cluster_classes: Vec<usize> = classes.chunks_exact(d).map(|block| block[0]).collect();

    compute(state, embeddings, classes, &clusters, &cluster_classes, m, alpha)
}

/// Nearest-centroid label for every embedding.
pub fn predict<L: Clone>(
    state: &ClusterState,
    labels: &ClassIndex<L>,
    embeddings: &[Vec<f64>],
) -> Result<Vec<L>, MagnetError> {
    embeddings
        .iter()
        .map(|x| {
            check_dim(state, x)?;
            if x.iter().any(|v| !v.is_finite()) {
                return Err(MagnetError::NonFiniteEmbedding);
            }
            let class = state.class_of(state.nearest_cluster(x));
            labels
                .label(class)
                .cloned()
                .ok_or(MagnetError::IndexOutOfRange {
                    index: class,
                    len: labels.num_classes(),
                })
        })
        .collect()
}

/// Fraction of embeddings whose predicted label equals the true label.
pub fn accuracy<L: Clone + PartialEq>(
    state: &ClusterState,
    labels: &ClassIndex<L>,
    embeddings: &[Vec<f64>],
    true_labels: &[L],
) -> Result<f64, MagnetError> {
    if embeddings.is_empty() {
        return Err(MagnetError::EmptyBatch);
    }
    if true_labels.len() != embeddings.len() {
        return Err(MagnetError::LengthMismatch {
            what: "labels",
            expected: embeddings.len(),
            got: true_labels.len(),
        });
    }
    let predicted = predict(state, labels, embeddings)?;
    Ok(predicted
        .iter()
        .zip(true_labels.iter())
        .map(|(p, t)| if p == t { 1.0 } else { 0.0 })
        .mean())
}

fn check_dim(state: &ClusterState, x: &[f64]) -> Result<(), MagnetError> {
    if x.len() == state.dim() {
        Ok(())
    } else {
        Err(MagnetError::DimensionMismatch {
            expected: state.dim(),
            got: x.len(),
        })
    }
}

fn check_batch(
    state: &ClusterState,
    embeddings: &[Vec<f64>],
    classes: &[usize],
    clusters: &[usize],
    cluster_classes: &[usize],
    num_clusters: usize,
) -> Result<(), MagnetError> {
    let n = embeddings.len();
    if n == 0 {
        return Err(MagnetError::EmptyBatch);
    }
    if num_clusters == 0 || n % num_clusters != 0 {
        return Err(MagnetError::UnevenBatch {
            batch: n,
            clusters: num_clusters,
        });
    }
    for (what, len, expected) in [
        ("classes", classes.len(), n),
        ("clusters", clusters.len(), n),
        ("cluster_classes", cluster_classes.len(), num_clusters),
    ] {
        if len != expected {
            return Err(MagnetError::LengthMismatch {
                what,
                expected,
                got: len,
            });
        }
    }
    for x in embeddings {
        check_dim(state, x)?;
    }

    let num_classes = state.num_clusters() / state.k().max(1);
    let mut group_sizes = vec![0usize; num_clusters];
    for (example, (&class, &cluster)) in classes.iter().zip(clusters.iter()).enumerate() {
        if class >= num_classes {
            return Err(MagnetError::IndexOutOfRange {
                index: class,
                len: num_classes,
            });
        }
        if cluster >= num_clusters {
            return Err(MagnetError::IndexOutOfRange {
                index: cluster,
                len: num_clusters,
            });
        }
        if cluster_classes[cluster] != class {
            return Err(MagnetError::ClassMismatch {
                example,
                class,
                cluster_class: cluster_classes[cluster],
            });
        }
        group_sizes[cluster] += 1;
    }
    let per_group = n / num_clusters;
    if group_sizes.iter().any(|&size| size != per_group) {
        return Err(MagnetError::UnevenBatch {
            batch: n,
            clusters: num_clusters,
        });
    }
    Ok(())
}

fn batch_means(
    embeddings: &[Vec<f64>],
    clusters: &[usize],
    num_clusters: usize,
    dim: usize,
) -> Vec<Vec<f64>> {
    let mut sums = vec![vec![0.0; dim]; num_clusters];
    let mut counts = vec![0usize; num_clusters];
    for (x, &c) in embeddings.iter().zip(clusters.iter()) {
        counts[c] += 1;
        for (s, v) in sums[c].iter_mut().zip(x.iter()) {
            *s += v;
        }
    }
    sums.into_iter()
        .zip(counts)
        .map(|(sum, count)| sum.into_iter().map(|s| s / count.max(1) as f64).collect())
        .collect()
}

/// Index of the smallest value (first on ties).
fn argmin(row: &[f64]) -> usize {
    let mut best = 0usize;
    for (i, &v) in row.iter().enumerate() {
        if v < row[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 2 classes, k = 2, centroids at the corners of a 4 × 3 rectangle.
    fn state() -> ClusterState {
        ClusterState::from_parts(
            2,
            2,
            2,
            vec![0.0, 0.0, 4.0, 0.0, 0.0, 3.0, 4.0, 3.0],
            vec![0, 1, 2, 3],
        )
    }

    fn confusable_batch() -> Vec<Vec<f64>> {
        vec![
            vec![0.4, 1.2],
            vec![3.1, 1.9],
            vec![0.7, 1.8],
            vec![3.4, 1.3],
        ]
    }

    #[test]
    fn test_reference_values() {
        let report =
            compute_minibatch(&state(), &confusable_batch(), &[0, 0, 1, 1], 2, 2, 1.0).unwrap();

        let expected = [
            1.425_110_464_575_479,
            1.633_805_723_896_024,
            1.459_330_302_567_986_7,
            1.555_347_434_714_126_5,
        ];
        for (got, want) in report.losses.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-9, "{got} vs {want}");
        }
        assert!((report.total_loss - 1.518_398_481_438_404).abs() < 1e-9);
        assert!((report.variance - 3.733_333_333_333_333).abs() < 1e-9);
        assert!((report.accuracy - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        let state = state();
        let batch = confusable_batch();
        let classes = [0, 0, 1, 1];
        let report = compute_minibatch(&state, &batch, &classes, 2, 2, 1.0).unwrap();

        let h = 1e-6;
        for i in 0..batch.len() {
            for k in 0..2 {
                let mut plus = batch.clone();
                plus[i][k] += h;
                let mut minus = batch.clone();
                minus[i][k] -= h;
                let lp = compute_minibatch(&state, &plus, &classes, 2, 2, 1.0).unwrap().total_loss;
                let lm = compute_minibatch(&state, &minus, &classes, 2, 2, 1.0).unwrap().total_loss;
                let numeric = (lp - lm) / (2.0 * h);
                let analytic = report.gradients[i][k];
                assert!(
                    (numeric - analytic).abs() < 1e-6,
                    "example {i} dim {k}: numeric {numeric}, analytic {analytic}"
                );
            }
        }
    }

    #[test]
    fn test_batch_cluster_means() {
        let report =
            compute_minibatch(&state(), &confusable_batch(), &[0, 0, 1, 1], 2, 2, 1.0).unwrap();
        let means = &report.batch_cluster_means;
        assert!((means[0][0] - 1.75).abs() < 1e-12);
        assert!((means[0][1] - 1.55).abs() < 1e-12);
        assert!((means[1][0] - 2.05).abs() < 1e-12);
        assert!((means[1][1] - 1.55).abs() < 1e-12);
    }

    #[test]
    fn test_well_separated_batch_has_zero_loss() {
        let batch = vec![
            vec![0.5, -0.5],
            vec![4.5, -0.5],
            vec![-0.5, 3.5],
            vec![4.5, 3.5],
        ];
        let report = compute_minibatch(&state(), &batch, &[0, 0, 1, 1], 2, 2, 1.0).unwrap();
        assert_eq!(report.total_loss, 0.0);
        assert!(report.losses.iter().all(|&l| l == 0.0));
        assert_eq!(report.accuracy, 1.0);
        assert!(report.gradients.iter().flatten().all(|&g| g == 0.0));
    }

    #[test]
    fn test_one_example_per_cluster_is_finite() {
        // N == num_clusters
        let batch = vec![vec![1.0, 1.0], vec![2.0, 2.5]];
        let report = compute(&state(), &batch, &[0, 1], &[0, 1], &[0, 1], 2, 1.0).unwrap();
        assert!(report.total_loss.is_finite());
        assert!(report.losses.iter().all(|l| l.is_finite() && *l >= 0.0));
    }

    #[test]
    fn test_single_example_batch_is_finite() {
        let report = compute(&state(), &[vec![1.0, 1.0]], &[0], &[0], &[0], 1, 1.0).unwrap();
        // Variance divisor falls back to 1: a = 2.0
        assert!((report.variance - 2.0).abs() < 1e-12);
        assert!(report.total_loss.is_finite());
        assert!(report.gradients[0].iter().all(|g| g.is_finite()));
    }

    #[test]
    fn test_zero_variance_is_clamped() {
        // Every example sits exactly on a same-class centroid
        let batch = vec![
            vec![0.0, 0.0],
            vec![4.0, 0.0],
            vec![0.0, 3.0],
            vec![4.0, 3.0],
        ];
        let report = compute_minibatch(&state(), &batch, &[0, 0, 1, 1], 2, 2, 1.0).unwrap();
        assert_eq!(report.variance, VARIANCE_FLOOR);
        assert!(report.total_loss.is_finite());
        assert!(report.gradients.iter().flatten().all(|g| g.is_finite()));
    }

    #[test]
    fn test_overflowing_distances_rejected() {
        let state = ClusterState::from_parts(2, 1, 1, vec![0.0, 1.0], vec![0, 1]);
        let err = compute(&state, &[vec![1e200], vec![-1e200]], &[0, 1], &[0, 1], &[0, 1], 2, 1.0)
            .unwrap_err();
        assert!(matches!(err, MagnetError::NonFiniteDistance { example: 0 }));
    }

    #[test]
    fn test_nan_embedding_rejected() {
        let batch = vec![vec![0.4, 1.2], vec![f64::NAN, 1.0]];
        let err = compute(&state(), &batch, &[0, 1], &[0, 1], &[0, 1], 2, 1.0).unwrap_err();
        assert!(matches!(err, MagnetError::NonFiniteDistance { example: 1 }));

        let labels = ClassIndex::new(&["ant", "bee"]);
        let err = predict(&state(), &labels, &[vec![f64::INFINITY, 0.0]]).unwrap_err();
        assert!(matches!(err, MagnetError::NonFiniteEmbedding));
    }

    #[test]
    fn test_overflowing_variance_rejected() {
        // Each distance is finite (~1.6e308) but their sum is not
        let state = ClusterState::from_parts(2, 1, 1, vec![0.0, 1.0], vec![0, 1]);
        let batch = vec![vec![9e153], vec![-9e153], vec![1.0 + 9e153], vec![1.0 - 9e153]];
        let err = compute_minibatch(&state, &batch, &[0, 0, 1, 1], 2, 2, 1.0).unwrap_err();
        assert!(matches!(err, MagnetError::NonFiniteVariance));
    }

    #[test]
    fn test_intra_cost_uses_closest_same_class_cluster() {
        // Example of class 0 labelled into batch cluster 0 but nearest to
        // centroid 1 (also class 0); both examples sit on their centroids.
        let batch = vec![vec![4.0, 0.0], vec![0.0, 3.0]];
        let report = compute(&state(), &batch, &[0, 1], &[0, 1], &[0, 1], 2, 1.0).unwrap();
        assert_eq!(report.variance, VARIANCE_FLOOR);
        assert_eq!(report.accuracy, 1.0);
    }

    #[test]
    fn test_uneven_batch_rejected() {
        let batch = vec![vec![0.0, 0.0]; 3];
        let err = compute(&state(), &batch, &[0, 0, 1], &[0, 0, 1], &[0, 1], 2, 1.0).unwrap_err();
        assert!(matches!(err, MagnetError::UnevenBatch { batch: 3, clusters: 2 }));

        let err = compute_minibatch(&state(), &batch, &[0, 0, 1], 2, 2, 1.0).unwrap_err();
        assert!(matches!(err, MagnetError::UnevenBatch { .. }));
    }

    #[test]
    fn test_class_mismatch_rejected() {
        let batch = vec![vec![0.0, 0.0]; 2];
        let err = compute(&state(), &batch, &[0, 0], &[0, 1], &[0, 1], 2, 1.0).unwrap_err();
        assert!(matches!(
            err,
            MagnetError::ClassMismatch { example: 1, class: 0, cluster_class: 1 }
        ));
    }

    #[test]
    fn test_wrong_dimension_rejected() {
        let batch = vec![vec![0.0, 0.0, 0.0]; 2];
        let err = compute_minibatch(&state(), &batch, &[0, 1], 2, 1, 1.0).unwrap_err();
        assert!(matches!(err, MagnetError::DimensionMismatch { expected: 2, got: 3 }));
    }

    #[test]
    fn test_predict_maps_back_to_labels() {
        let labels = ClassIndex::new(&["ant", "bee"]);
        let state = state();
        let preds = predict(
            &state,
            &labels,
            &[vec![0.2, 0.1], vec![3.8, 2.9], vec![3.9, 0.2]],
        )
        .unwrap();
        assert_eq!(preds, vec!["ant", "bee", "ant"]);

        let acc = accuracy(
            &state,
            &labels,
            &[vec![0.2, 0.1], vec![3.8, 2.9]],
            &["ant", "ant"],
        )
        .unwrap();
        assert!((acc - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_accuracy_requires_examples() {
        let labels = ClassIndex::new(&[0, 1]);
        let err = accuracy(&state(), &labels, &[], &[]).unwrap_err();
        assert!(matches!(err, MagnetError::EmptyBatch));
    }
}
