pub mod class_map;
pub mod history;
pub mod metrics;
pub mod sample;

pub use class_map::ClassIndexMap;
pub use history::{EpochRecord, StopReason, TrainingHistory};
pub use metrics::BatchMetrics;
pub use sample::{LabeledImage, LabeledImageSet, Split, SplitKind};
