//! Magnet loss: cluster-aware distance metric learning.
//!
//! Maintains per-class sub-clusters of an embedding space, draws
//! neighbourhood-structured training batches and evaluates the magnet loss
//! (with gradients) for an external embedding model.
//!
//! ## Modules
//!
//! - **config**: TOML-backed hyper-parameters (`k`, `m`, `d`, `alpha`, ...)
//! - **magnet**: cluster state, re-clustering, loss tracking, batch sampling
//!   and the loss itself, tied together by [`MagnetLoss`]

pub mod config;
pub mod magnet;

// Re-export configuration
pub use config::{ConfigError, MagnetConfig};

// Re-export the facade and its data types
pub use magnet::{
    Batch, BatchSampler, ClassIndex, ClusterError, ClusterManager, ClusterState, Clusterer,
    KMeans, KMeansFit, LossReport, LossTracker, MagnetError, MagnetLoss, MagnetStats,
};
