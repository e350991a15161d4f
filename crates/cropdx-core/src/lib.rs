//! # cropdx Core
//!
//! Building blocks of the crop disease classifier: dataset discovery and
//! batching, a frozen MobileNetV2 feature extractor with a trainable head,
//! and the on-disk formats for the model and its label map.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use candle_core::Device;
//! use cropdx_core::dataset::{DatasetConfig, DatasetLoader};
//! use cropdx_core::model::{
//!     BackboneSource, FeatureExtractor, MobileNetV2Config, ModelFactory, ModelSpec,
//! };
//!
//! let device = Device::Cpu;
//! let backbone = BackboneSource::Pretrained("weights/mobilenetv2_100.safetensors".into())
//!     .load(MobileNetV2Config::default(), &device)?;
//! let data = DatasetLoader::new(DatasetConfig::new("data"))
//!     .load(backbone.normalization(), &device)?;
//! let model = ModelFactory::new(device)
//!     .build(&ModelSpec::new(data.classes.len(), 224, 1e-4), Box::new(backbone))?;
//! assert_eq!(model.output_width(), data.classes.len());
//! # Ok::<(), cropdx_core::CropdxError>(())
//! ```

pub mod artifact;
pub mod dataset;
pub mod error;
pub mod io;
pub mod model;
pub mod types;

// Re-export primary API
pub use artifact::{load_classifier, save_classifier, ArchitectureDescriptor};
pub use dataset::{
    Batch, BatchSource, BatchStream, DatasetConfig, DatasetLoader, ImagePreprocessor,
    LoadedDataset, Normalization,
};
pub use error::{CropdxError, Result};
pub use model::{
    BackboneDescriptor, BackboneSource, Classifier, CompiledClassifier, FeatureExtractor,
    MobileNetV2, MobileNetV2Config, ModelFactory, ModelSpec, ParameterSnapshot,
};
pub use types::{
    BatchMetrics, ClassIndexMap, EpochRecord, LabeledImage, LabeledImageSet, Split, SplitKind,
    StopReason, TrainingHistory,
};
