//! Magnet Loss Configuration
//!
//! Hyper-parameters for clustering, batch construction and the loss,
//! loaded from TOML.
//!
//! ## Loading Order
//!
//! 1. `MAGNET_CONFIG` environment variable (path to TOML file)
//! 2. `magnet.toml` in the current working directory
//! 3. Built-in defaults
//!
//! ## Usage
//!
//! ```ignore
//! let config = MagnetConfig::load();
//! let mut magnet = MagnetLoss::new(&labels, config)?;
//! ```
//!
//! The configuration is passed explicitly to whoever needs it; there is no
//! process-wide instance.

mod magnet_config;
pub mod defaults;
pub mod validation;

pub use magnet_config::*;
