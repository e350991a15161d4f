//! # Dataset Loader
//!
//! Turns a `root/<class_name>/<images>` directory into a class list and two
//! lazy batch streams (train, validation).

pub mod batch;
pub mod discover;
pub mod preprocess;
pub mod split;

use std::path::PathBuf;
use std::sync::Arc;

use candle_core::Device;
use tracing::info;

use crate::error::{CropdxError, Result};
use crate::types::{ClassIndexMap, LabeledImageSet};

pub use batch::{Batch, BatchSource, BatchStream, EpochBatches};
pub use discover::{discover_classes, is_image_file, scan_dataset, IMAGE_EXTENSIONS};
pub use preprocess::{ImagePreprocessor, Normalization};
pub use split::split_dataset;

/// Settings for [`DatasetLoader`].
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetConfig {
    /// Directory containing one subdirectory per class.
    pub root: PathBuf,
    /// Edge length images are resized to.
    pub image_size: usize,
    pub batch_size: usize,
    /// Share of each class held out for validation, in `(0, 1)`.
    pub validation_fraction: f64,
    /// Seed for the split and the per-epoch training reshuffle.
    pub seed: u64,
    /// Batches prepared ahead in the background (0 disables prefetch).
    pub prefetch: usize,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data"),
            image_size: 224,
            batch_size: 8,
            validation_fraction: 0.2,
            seed: 123,
            prefetch: 2,
        }
    }
}

impl DatasetConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn with_image_size(mut self, image_size: usize) -> Self {
        self.image_size = image_size;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_validation_fraction(mut self, fraction: f64) -> Self {
        self.validation_fraction = fraction;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_prefetch(mut self, depth: usize) -> Self {
        self.prefetch = depth;
        self
    }

    /// Rejects settings that cannot produce a usable dataset.
    pub fn validate(&self) -> Result<()> {
        if self.image_size == 0 {
            return Err(CropdxError::Configuration("image size must be positive".into()));
        }
        preprocess::image_edge(self.image_size)?;
        if self.batch_size == 0 {
            return Err(CropdxError::Configuration("batch size must be positive".into()));
        }
        split::validate_fraction(self.validation_fraction)
    }
}

/// Output of [`DatasetLoader::load`].
#[derive(Debug, Clone)]
pub struct LoadedDataset {
    pub train: BatchStream,
    pub validation: BatchStream,
    pub classes: ClassIndexMap,
    /// Files skipped because their header could not be read.
    pub skipped: Vec<PathBuf>,
}

impl LoadedDataset {
    pub fn class_names(&self) -> &[String] {
        self.classes.names()
    }
}

/// Discovers classes, splits images and builds the batch streams.
#[derive(Debug, Clone)]
pub struct DatasetLoader {
    config: DatasetConfig,
}

impl DatasetLoader {
    pub fn new(config: DatasetConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    /// Loads the dataset, normalizing pixels the way the consuming feature
    /// extractor expects.
    pub fn load(&self, normalization: Normalization, device: &Device) -> Result<LoadedDataset> {
        self.config.validate()?;
        let set = scan_dataset(&self.config.root)?;
        info!(
            "Found {} classes: {:?}",
            set.classes().len(),
            set.classes().names()
        );
        self.build_streams(set, normalization, device)
    }

    fn build_streams(
        &self,
        set: LabeledImageSet,
        normalization: Normalization,
        device: &Device,
    ) -> Result<LoadedDataset> {
        let (train, validation) =
            split_dataset(&set, self.config.validation_fraction, self.config.seed)?;

        if train.is_empty() || validation.is_empty() {
            return Err(CropdxError::Configuration(format!(
                "not enough images in '{}' for a train/validation split ({} train, {} validation)",
                self.config.root.display(),
                train.len(),
                validation.len()
            )));
        }
        info!(
            "Using {} images for training, {} for validation ({} skipped)",
            train.len(),
            validation.len(),
            set.skipped().len()
        );

        let preprocessor = Arc::new(ImagePreprocessor::new(
            self.config.image_size,
            normalization,
        )?);
        let train = BatchStream::new(
            train,
            Arc::clone(&preprocessor),
            self.config.batch_size,
            device.clone(),
        )
        .with_shuffle(self.config.seed)
        .with_prefetch(self.config.prefetch);
        let validation = BatchStream::new(
            validation,
            preprocessor,
            self.config.batch_size,
            device.clone(),
        )
        .with_prefetch(self.config.prefetch);

        Ok(LoadedDataset {
            train,
            validation,
            classes: set.classes().clone(),
            skipped: set.skipped().to_vec(),
        })
    }
}
