//! Magnet Loss
//!
//! Distance-metric-learning bookkeeping around an external embedding model:
//! every class is split into `k` sub-clusters in embedding space, training
//! batches are built around a loss-weighted seed cluster and its nearest
//! foreign-class neighbours, and the loss pulls each example towards its own
//! cluster while pushing it away from the impostors.
//!
//! ## Training loop
//!
//! ```text
//! recluster(full embedding table)          every few hundred steps
//!   └── loop:
//!         sample()            → Batch (m clusters × d examples)
//!         model(batch)        → batch embeddings          (caller)
//!         batch_loss(batch)   → LossReport + record(losses)
//!         optimiser step      with LossReport::gradients   (caller)
//! ```
//!
//! ## Cluster ids
//!
//! Cluster `c` belongs to class `c / k`; the clusters of class `y` are
//! `y*k .. y*k + k`. Class indices follow the sorted order of the labels
//! (see [`ClassIndex`]).

pub mod classes;
pub mod kmeans;
pub mod loss;
pub mod manager;
pub mod sampler;
pub mod state;
pub mod tracker;

pub use classes::ClassIndex;
pub use kmeans::{ClusterError, Clusterer, KMeans, KMeansFit};
pub use loss::LossReport;
pub use manager::ClusterManager;
pub use sampler::{Batch, BatchSampler};
pub use state::ClusterState;
pub use tracker::LossTracker;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{ConfigError, MagnetConfig};

#[derive(Debug, Error)]
pub enum MagnetError {
    #[error("cluster state not initialised; call recluster first")]
    NotInitialized,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("need at least 2 classes, got {classes}")]
    TooFewClasses { classes: usize },

    #[error("embedding dimension {got}, expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("{what}: expected length {expected}, got {got}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("batch of {batch} examples cannot be split into {clusters} equal clusters")]
    UnevenBatch { batch: usize, clusters: usize },

    #[error("empty batch")]
    EmptyBatch,

    #[error("example {example} has class {class} but its batch cluster has class {cluster_class}")]
    ClassMismatch {
        example: usize,
        class: usize,
        cluster_class: usize,
    },

    #[error("need {needed} impostor clusters, only {available} available")]
    InsufficientImpostors { needed: usize, available: usize },

    #[error("cluster {0} has no members")]
    EmptyCluster(usize),

    #[error("non-finite loss for example {index}")]
    NonFiniteLoss { index: usize },

    #[error("embedding contains a non-finite value")]
    NonFiniteEmbedding,

    #[error("non-finite centroid distance for batch example {example}")]
    NonFiniteDistance { example: usize },

    #[error("batch variance overflowed")]
    NonFiniteVariance,

    #[error("clustering failed: {0}")]
    Clustering(#[from] ClusterError),
}

/// Serializable snapshot of the facade's bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MagnetStats {
    pub num_classes: usize,
    pub num_clusters: usize,
    pub num_examples: usize,
    /// Clusters with no members after the last recluster.
    pub empty_clusters: usize,
    pub examples_with_loss: usize,
    /// Mean of the per-cluster losses; `None` before the first record.
    pub mean_cluster_loss: Option<f64>,
    pub reclusters: u64,
    pub batches_sampled: u64,
}

/// Owns the cluster state and loss bookkeeping for one training set.
///
/// Every operation except construction requires a prior
/// [`recluster`](Self::recluster) and fails with
/// [`MagnetError::NotInitialized`] otherwise.
#[derive(Debug)]
pub struct MagnetLoss<L> {
    config: MagnetConfig,
    classes: ClassIndex<L>,
    manager: ClusterManager,
    sampler: BatchSampler,
    tracker: LossTracker,
    state: Option<ClusterState>,
    rng: StdRng,
    reclusters: u64,
    batches_sampled: u64,
}

impl<L: Ord + Clone> MagnetLoss<L> {
    /// Set up for the given training labels (one per example) using the
    /// bundled k-means, seeded from `config.seed`.
    pub fn new(labels: &[L], config: MagnetConfig) -> Result<Self, MagnetError> {
        let manager = ClusterManager::new(config.k, config.seed);
        Self::build(labels, config, manager)
    }

    /// Same as [`new`](Self::new) with a caller-supplied clustering routine.
    pub fn with_clusterer(
        labels: &[L],
        config: MagnetConfig,
        clusterer: Box<dyn Clusterer>,
    ) -> Result<Self, MagnetError> {
        let manager = ClusterManager::with_clusterer(config.k, clusterer);
        Self::build(labels, config, manager)
    }

    fn build(
        labels: &[L],
        config: MagnetConfig,
        manager: ClusterManager,
    ) -> Result<Self, MagnetError> {
        config.validate()?;

        let classes = ClassIndex::new(labels);
        if classes.num_classes() < 2 {
            return Err(MagnetError::TooFewClasses {
                classes: classes.num_classes(),
            });
        }
        let available = (classes.num_classes() - 1) * config.k;
        if available < config.m - 1 {
            return Err(MagnetError::InsufficientImpostors {
                needed: config.m - 1,
                available,
            });
        }

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        info!(
            examples = classes.num_examples(),
            classes = classes.num_classes(),
            k = config.k,
            m = config.m,
            d = config.d,
            alpha = config.alpha,
            "Magnet loss initialised"
        );

        Ok(Self {
            sampler: BatchSampler::new(config.m, config.d),
            tracker: LossTracker::new(),
            state: None,
            rng,
            reclusters: 0,
            batches_sampled: 0,
            config,
            classes,
            manager,
        })
    }

    /// Re-cluster every class from the full embedding table
    /// (`embeddings[i]` belongs to training example `i`).
    ///
    /// Recorded example losses survive. Cluster losses are kept as they
    /// were unless `refresh_losses_on_recluster` is set.
    pub fn recluster(&mut self, embeddings: &[Vec<f64>]) -> Result<&ClusterState, MagnetError> {
        let state = self
            .manager
            .recluster(&self.classes, embeddings, self.config.max_iterations)?;
        if self.config.refresh_losses_on_recluster {
            self.tracker.refresh(&state);
            debug!("Cluster losses refreshed from new assignments");
        }
        self.reclusters += 1;
        Ok(self.state.insert(state))
    }

    /// Predicted label for every embedding.
    pub fn predict(&self, embeddings: &[Vec<f64>]) -> Result<Vec<L>, MagnetError> {
        loss::predict(self.require_state()?, &self.classes, embeddings)
    }

    /// Fraction of embeddings whose predicted label matches `true_labels`.
    pub fn accuracy(&self, embeddings: &[Vec<f64>], true_labels: &[L]) -> Result<f64, MagnetError> {
        loss::accuracy(self.require_state()?, &self.classes, embeddings, true_labels)
    }
}

impl<L> MagnetLoss<L> {
    fn require_state(&self) -> Result<&ClusterState, MagnetError> {
        self.state.as_ref().ok_or(MagnetError::NotInitialized)
    }

    pub fn config(&self) -> &MagnetConfig {
        &self.config
    }

    pub fn classes(&self) -> &ClassIndex<L> {
        &self.classes
    }

    /// Current cluster state, once [`recluster`](MagnetLoss::recluster) has run.
    pub fn state(&self) -> Option<&ClusterState> {
        self.state.as_ref()
    }

    /// Draw the next training batch.
    pub fn sample(&mut self) -> Result<Batch, MagnetError> {
        let state = self.state.as_ref().ok_or(MagnetError::NotInitialized)?;
        let batch = self
            .sampler
            .sample(state, self.tracker.cluster_losses(), &mut self.rng)?;
        self.batches_sampled += 1;
        Ok(batch)
    }

    /// Store per-example losses; returns the clusters whose loss changed.
    pub fn record(&mut self, indices: &[usize], losses: &[f64]) -> Result<Vec<usize>, MagnetError> {
        let state = self.state.as_ref().ok_or(MagnetError::NotInitialized)?;
        self.tracker.record(state, indices, losses)
    }

    /// Loss over an arbitrary partition of a batch into equal groups.
    /// `classes` are global class indices (see [`Batch::global_classes`]).
    pub fn compute(
        &self,
        embeddings: &[Vec<f64>],
        classes: &[usize],
        clusters: &[usize],
        cluster_classes: &[usize],
        num_clusters: usize,
    ) -> Result<LossReport, MagnetError> {
        loss::compute(
            self.require_state()?,
            embeddings,
            classes,
            clusters,
            cluster_classes,
            num_clusters,
            self.config.alpha,
        )
    }

    /// Loss over `m` contiguous blocks of `d` embeddings.
    ///
    /// `classes` are global class indices, not `Batch::local_class_ids`;
    /// use [`compute_batch`](Self::compute_batch) for a sampled batch.
    pub fn compute_minibatch(
        &self,
        embeddings: &[Vec<f64>],
        classes: &[usize],
    ) -> Result<LossReport, MagnetError> {
        loss::compute_minibatch(
            self.require_state()?,
            embeddings,
            classes,
            self.config.m,
            self.config.d,
            self.config.alpha,
        )
    }

    /// Loss of a sampled batch. `embeddings[j]` is the model output for
    /// `batch.indices[j]`.
    ///
    /// Translates the batch-local class ids through `batch.class_map`, so a
    /// `Batch` from [`sample`](Self::sample) can be passed as is.
    pub fn compute_batch(
        &self,
        batch: &Batch,
        embeddings: &[Vec<f64>],
    ) -> Result<LossReport, MagnetError> {
        if embeddings.len() != batch.len() {
            return Err(MagnetError::LengthMismatch {
                what: "batch embeddings",
                expected: batch.len(),
                got: embeddings.len(),
            });
        }
        if batch.local_class_ids.len() != batch.len() {
            return Err(MagnetError::LengthMismatch {
                what: "local class ids",
                expected: batch.len(),
                got: batch.local_class_ids.len(),
            });
        }
        if let Some(&local) = batch
            .local_class_ids
            .iter()
            .find(|&&local| local >= batch.class_map.len())
        {
            return Err(MagnetError::IndexOutOfRange {
                index: local,
                len: batch.class_map.len(),
            });
        }
        self.compute_minibatch(embeddings, &batch.global_classes())
    }

    /// [`compute_batch`](Self::compute_batch) followed by recording the
    /// per-example losses.
    pub fn batch_loss(
        &mut self,
        batch: &Batch,
        embeddings: &[Vec<f64>],
    ) -> Result<LossReport, MagnetError> {
        let report = self.compute_batch(batch, embeddings)?;
        self.record(&batch.indices, &report.losses)?;
        Ok(report)
    }

    /// Mean loss per cluster, once any loss has been recorded.
    pub fn cluster_losses(&self) -> Option<&[f64]> {
        self.tracker.cluster_losses()
    }

    pub fn example_loss(&self, example: usize) -> Option<f64> {
        self.tracker.example_loss(example)
    }

    /// Flat `C*k × dim` centroid table.
    pub fn centroids(&self) -> Option<&[f64]> {
        self.state.as_ref().map(ClusterState::centroids)
    }

    pub fn assignments(&self) -> Option<&[usize]> {
        self.state.as_ref().map(ClusterState::assignments)
    }

    /// Members of cluster `c`; `None` before the first recluster or for an
    /// unknown cluster id.
    pub fn members(&self, cluster: usize) -> Option<&[usize]> {
        let state = self.state.as_ref()?;
        (cluster < state.num_clusters()).then(|| state.members(cluster))
    }

    pub fn stats(&self) -> MagnetStats {
        let num_clusters = self.classes.num_classes() * self.config.k;
        MagnetStats {
            num_classes: self.classes.num_classes(),
            num_clusters,
            num_examples: self.classes.num_examples(),
            empty_clusters: self.state.as_ref().map_or(0, |s| s.empty_clusters().len()),
            examples_with_loss: self.tracker.examples_with_loss(),
            mean_cluster_loss: self.tracker.cluster_losses().map(|l| l.mean()),
            reclusters: self.reclusters,
            batches_sampled: self.batches_sampled,
        }
    }
}
