//! Assembles a trainable classifier from a backbone and a class count.

use candle_core::{DType, Device};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use tracing::info;

use super::backbone::FeatureExtractor;
use super::classifier::{Classifier, CompiledClassifier};
use super::head::{ClassifierHead, HeadConfig};
use crate::error::{CropdxError, Result};

/// What the factory needs to know about the task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelSpec {
    pub num_classes: usize,
    pub image_size: usize,
    pub learning_rate: f64,
    pub head: HeadConfig,
}

impl ModelSpec {
    pub fn new(num_classes: usize, image_size: usize, learning_rate: f64) -> Self {
        Self {
            num_classes,
            image_size,
            learning_rate,
            head: HeadConfig::default(),
        }
    }

    pub fn with_head(mut self, head: HeadConfig) -> Self {
        self.head = head;
        self
    }
}

/// Builds [`CompiledClassifier`]s on one device.
#[derive(Debug, Clone)]
pub struct ModelFactory {
    device: Device,
}

impl ModelFactory {
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Puts a fresh head on `backbone` and attaches an Adam optimizer to the
    /// head's parameters only.
    pub fn build(
        &self,
        spec: &ModelSpec,
        backbone: Box<dyn FeatureExtractor>,
    ) -> Result<CompiledClassifier> {
        if spec.num_classes < 2 {
            return Err(CropdxError::ModelBuild(format!(
                "need at least 2 classes to train a classifier, found {}",
                spec.num_classes
            )));
        }
        if spec.image_size < backbone.min_input_size() {
            return Err(CropdxError::ModelBuild(format!(
                "image size {} is below the backbone minimum of {}",
                spec.image_size,
                backbone.min_input_size()
            )));
        }
        if !(spec.learning_rate.is_finite() && spec.learning_rate > 0.0) {
            return Err(CropdxError::ModelBuild(format!(
                "learning rate must be a positive number, got {}",
                spec.learning_rate
            )));
        }
        if spec.head.hidden_units == 0 {
            return Err(CropdxError::ModelBuild("head needs at least one hidden unit".into()));
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &self.device);
        let head = ClassifierHead::new(backbone.output_channels(), spec.num_classes, spec.head, vb)
            .map_err(|e| CropdxError::ModelBuild(e.to_string()))?;

        let params = ParamsAdamW {
            lr: spec.learning_rate,
            weight_decay: 0.0,
            ..Default::default()
        };
        let optimizer = AdamW::new(varmap.all_vars(), params)
            .map_err(|e| CropdxError::ModelBuild(e.to_string()))?;

        info!(
            "Built classifier: {:?} backbone ({} channels) -> {} hidden -> {} classes, lr={}",
            backbone.descriptor(),
            backbone.output_channels(),
            spec.head.hidden_units,
            spec.num_classes,
            spec.learning_rate
        );

        let classifier = Classifier::new(backbone, head, spec.image_size, self.device.clone());
        Ok(CompiledClassifier::new(classifier, varmap, optimizer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BackboneSource, MobileNetV2, MobileNetV2Config};

    fn backbone() -> Box<MobileNetV2> {
        Box::new(
            BackboneSource::RandomInit
                .load(MobileNetV2Config::new(0.35).unwrap(), &Device::Cpu)
                .unwrap(),
        )
    }

    #[test]
    fn output_width_matches_class_count() {
        let factory = ModelFactory::new(Device::Cpu);
        for classes in [2, 7, 38] {
            let model = factory
                .build(&ModelSpec::new(classes, 64, 1e-4), backbone())
                .unwrap();
            assert_eq!(model.output_width(), classes);
        }
    }

    #[test]
    fn single_class_is_rejected() {
        let err = ModelFactory::new(Device::Cpu)
            .build(&ModelSpec::new(1, 224, 1e-4), backbone())
            .unwrap_err();
        assert!(matches!(err, CropdxError::ModelBuild(_)));
    }

    #[test]
    fn image_smaller_than_backbone_minimum_is_rejected() {
        let err = ModelFactory::new(Device::Cpu)
            .build(&ModelSpec::new(3, 16, 1e-4), backbone())
            .unwrap_err();
        assert!(matches!(err, CropdxError::ModelBuild(msg) if msg.contains("minimum")));
    }

    #[test]
    fn bad_learning_rate_is_rejected() {
        for lr in [0.0, -1e-4, f64::INFINITY] {
            let err = ModelFactory::new(Device::Cpu)
                .build(&ModelSpec::new(3, 64, lr), backbone())
                .unwrap_err();
            assert!(err.is_setup_error());
        }
    }
}
