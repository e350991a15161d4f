//! # Model Factory
//!
//! A frozen [`FeatureExtractor`] followed by a small trainable
//! [`ClassifierHead`], compiled with an Adam optimizer over the head only.

pub mod backbone;
pub mod classifier;
pub mod factory;
pub mod head;

pub use backbone::{
    BackboneDescriptor, BackboneSource, FeatureExtractor, MobileNetV2, MobileNetV2Config,
};
pub use classifier::{Classifier, CompiledClassifier, ParameterSnapshot};
pub use factory::{ModelFactory, ModelSpec};
pub use head::{ClassifierHead, HeadConfig};
