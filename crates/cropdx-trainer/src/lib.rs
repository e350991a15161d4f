//! # cropdx Trainer
//!
//! Fits a crop disease classifier: the epoch loop with its checkpoint,
//! learning-rate and early-stopping controllers, and the end-to-end driver
//! behind the `cropdx-train` binary.

pub mod callbacks;
pub mod config;
pub mod job;
pub mod pipeline;

pub use callbacks::{EarlyStoppingConfig, LrPlateauConfig};
pub use config::{DeviceChoice, TrainingConfig};
pub use job::{Learner, TrainingJob};
pub use pipeline::{run_training, TrainingReport};
