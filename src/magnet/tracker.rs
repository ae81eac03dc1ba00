//! Per-example and per-cluster running losses.
//!
//! Example losses persist across reclusters. A cluster's loss is the mean
//! over its *current* members that have a recorded loss, and is only
//! recomputed for clusters touched by a `record` call (or by `refresh`).

use statrs::statistics::Statistics;
use tracing::debug;

use super::state::ClusterState;
use super::MagnetError;

#[derive(Debug, Clone)]
struct LossTables {
    example_losses: Vec<f64>,
    has_loss: Vec<bool>,
    cluster_losses: Vec<f64>,
}

impl LossTables {
    fn new(num_examples: usize, num_clusters: usize) -> Self {
        Self {
            example_losses: vec![f64::NAN; num_examples],
            has_loss: vec![false; num_examples],
            cluster_losses: vec![0.0; num_clusters],
        }
    }

    /// Mean recorded loss over the cluster's members; 0 if none recorded.
    fn cluster_mean(&self, state: &ClusterState, cluster: usize) -> f64 {
        let recorded: Vec<f64> = state
            .members(cluster)
            .iter()
            .filter(|&&i| self.has_loss[i])
            .map(|&i| self.example_losses[i])
            .collect();
        if recorded.is_empty() {
            0.0
        } else {
            recorded.mean()
        }
    }
}

/// Loss bookkeeping feeding the loss-weighted seed-cluster choice.
#[derive(Debug, Clone, Default)]
pub struct LossTracker {
    tables: Option<LossTables>,
}

impl LossTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store freshly computed losses and update the mean loss of every
    /// cluster owning one of the updated examples.
    ///
    /// Duplicate indices are allowed; the last value wins. Returns the
    /// (sorted, deduplicated) clusters whose loss was recomputed.
    pub fn record(
        &mut self,
        state: &ClusterState,
        indices: &[usize],
        losses: &[f64],
    ) -> Result<Vec<usize>, MagnetError> {
        if indices.len() != losses.len() {
            return Err(MagnetError::LengthMismatch {
                what: "losses",
                expected: indices.len(),
                got: losses.len(),
            });
        }
        let num_examples = state.num_examples();
        if let Some(&index) = indices.iter().find(|&&i| i >= num_examples) {
            return Err(MagnetError::IndexOutOfRange {
                index,
                len: num_examples,
            });
        }
        if let Some(pos) = losses.iter().position(|l| !l.is_finite()) {
            return Err(MagnetError::NonFiniteLoss { index: indices[pos] });
        }

        let tables = self
            .tables
            .get_or_insert_with(|| LossTables::new(num_examples, state.num_clusters()));

        for (&i, &loss) in indices.iter().zip(losses.iter()) {
            tables.example_losses[i] = loss;
            tables.has_loss[i] = true;
        }

        let mut touched: Vec<usize> = indices.iter().map(|&i| state.assignment(i)).collect();
        touched.sort_unstable();
        touched.dedup();

        for &cluster in &touched {
            tables.cluster_losses[cluster] = tables.cluster_mean(state, cluster);
        }

        debug!(
            examples = indices.len(),
            clusters = touched.len(),
            "Recorded example losses"
        );
        Ok(touched)
    }

    /// Recompute every cluster loss from the current assignments.
    ///
    /// No-op before the first `record`.
    pub fn refresh(&mut self, state: &ClusterState) {
        if let Some(tables) = self.tables.as_mut() {
            tables.cluster_losses = (0..state.num_clusters())
                .map(|c| tables.cluster_mean(state, c))
                .collect();
        }
    }

    /// Mean loss per cluster, once any loss has been recorded.
    pub fn cluster_losses(&self) -> Option<&[f64]> {
        self.tables.as_ref().map(|t| t.cluster_losses.as_slice())
    }

    /// Most recent loss of example `i`, if it has been in a computed batch.
    pub fn example_loss(&self, example: usize) -> Option<f64> {
        let tables = self.tables.as_ref()?;
        match tables.has_loss.get(example) {
            Some(true) => Some(tables.example_losses[example]),
            _ => None,
        }
    }

    /// Number of examples with a recorded loss.
    pub fn examples_with_loss(&self) -> usize {
        self.tables
            .as_ref()
            .map_or(0, |t| t.has_loss.iter().filter(|&&h| h).count())
    }
}
