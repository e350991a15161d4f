//! # cropdx
//!
//! Crop disease classification from leaf photos. Point it at a folder with
//! one subfolder per class and it trains a small head on a frozen,
//! ImageNet-pretrained MobileNetV2.
//!
//! ```rust,no_run
//! use cropdx::{run_training, TrainingConfig};
//!
//! let report = run_training(&TrainingConfig::default().with_data_dir("data"))?;
//! println!("{} classes, stopped: {:?}", report.classes.len(), report.history.stop_reason);
//! # Ok::<(), cropdx::CropdxError>(())
//! ```

pub use cropdx_core::*;
pub use cropdx_trainer::{
    callbacks, config, job, pipeline, run_training, DeviceChoice, EarlyStoppingConfig, Learner,
    LrPlateauConfig, TrainingConfig, TrainingJob, TrainingReport,
};
