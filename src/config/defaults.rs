//! Built-in defaults for every `MagnetConfig` field.
//!
//! The values follow the settings commonly used with magnet loss: a
//! handful of sub-clusters per class, batches of `m` clusters with `d`
//! examples each and a unit margin.

/// Sub-clusters per class.
pub const K: usize = 4;

/// Clusters per batch (seed plus `M - 1` impostors).
pub const M: usize = 8;

/// Examples drawn per cluster.
pub const D: usize = 4;

/// Margin between the intra-cluster and nearest impostor distance.
pub const ALPHA: f64 = 1.0;

/// Lloyd iteration cap per class per recluster.
pub const MAX_ITERATIONS: usize = 20;

/// Environment variable naming a config file.
pub const CONFIG_ENV_VAR: &str = "MAGNET_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "magnet.toml";
