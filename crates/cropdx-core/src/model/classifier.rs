//! Backbone + head classifier, and its trainable (compiled) form.

use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, VarMap};

use super::backbone::FeatureExtractor;
use super::head::ClassifierHead;
use crate::artifact::{self, ArchitectureDescriptor};
use crate::dataset::{Batch, Normalization};
use crate::error::{CropdxError, Result};
use crate::types::BatchMetrics;

/// Frozen feature extractor followed by a classification head.
#[derive(Debug)]
pub struct Classifier {
    backbone: Box<dyn FeatureExtractor>,
    head: ClassifierHead,
    image_size: usize,
    device: Device,
}

impl Classifier {
    pub fn new(
        backbone: Box<dyn FeatureExtractor>,
        head: ClassifierHead,
        image_size: usize,
        device: Device,
    ) -> Self {
        Self {
            backbone,
            head,
            image_size,
            device,
        }
    }

    /// Logits of shape `[B, num_classes]`.
    pub fn forward_t(&self, images: &Tensor, train: bool) -> Result<Tensor> {
        let features = self.backbone.extract(images)?;
        self.head.forward_t(&features, train)
    }

    /// Class probabilities of shape `[B, num_classes]`; each row sums to 1.
    pub fn predict_proba(&self, images: &Tensor) -> Result<Tensor> {
        let logits = self.forward_t(images, false)?;
        Ok(candle_nn::ops::softmax_last_dim(&logits)?)
    }

    /// Loss and accuracy on one batch, without updating anything.
    pub fn evaluate(&self, batch: &Batch) -> Result<BatchMetrics> {
        let logits = self.forward_t(&batch.images, false)?;
        batch_metrics(&logits, &batch.labels, batch.len())
    }

    pub fn num_classes(&self) -> usize {
        self.head.output_width()
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn normalization(&self) -> Normalization {
        self.backbone.normalization()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn backbone(&self) -> &dyn FeatureExtractor {
        self.backbone.as_ref()
    }

    pub fn head(&self) -> &ClassifierHead {
        &self.head
    }

    /// Everything needed to rebuild this network from its tensors.
    pub fn architecture(&self) -> ArchitectureDescriptor {
        ArchitectureDescriptor {
            backbone: self.backbone.descriptor(),
            image_size: self.image_size,
            num_classes: self.num_classes(),
            head: self.head.config(),
            normalization: self.normalization(),
        }
    }

    /// Writes the model artifact atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        artifact::save_classifier(self, path)
    }
}

fn batch_metrics(logits: &Tensor, labels: &Tensor, count: usize) -> Result<BatchMetrics> {
    let loss = candle_nn::loss::cross_entropy(logits, labels)?;
    metrics_from_loss(&loss, logits, labels, count)
}

fn metrics_from_loss(
    loss: &Tensor,
    logits: &Tensor,
    labels: &Tensor,
    count: usize,
) -> Result<BatchMetrics> {
    let mean_loss = loss.to_scalar::<f32>()?;
    let correct = logits
        .argmax(1)?
        .eq(labels)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(BatchMetrics::from_mean_loss(
        f64::from(mean_loss),
        correct.round() as usize,
        count,
    ))
}

/// Copies of the trainable parameters, keyed by name.
#[derive(Debug, Clone)]
pub struct ParameterSnapshot {
    tensors: Vec<(String, Tensor)>,
}

impl ParameterSnapshot {
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }
}

/// A classifier bound to its trainable variables and optimizer.
pub struct CompiledClassifier {
    classifier: Classifier,
    varmap: VarMap,
    optimizer: AdamW,
}

impl std::fmt::Debug for CompiledClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledClassifier")
            .field("classifier", &self.classifier)
            .field("learning_rate", &self.optimizer.learning_rate())
            .finish()
    }
}

impl CompiledClassifier {
    pub(crate) fn new(classifier: Classifier, varmap: VarMap, optimizer: AdamW) -> Self {
        Self {
            classifier,
            varmap,
            optimizer,
        }
    }

    /// One optimizer step on `batch`. Returns the batch's pre-update metrics.
    pub fn train_step(&mut self, batch: &Batch) -> Result<BatchMetrics> {
        let logits = self.classifier.forward_t(&batch.images, true)?;
        let loss = candle_nn::loss::cross_entropy(&logits, &batch.labels)?;
        self.optimizer.backward_step(&loss)?;
        metrics_from_loss(&loss, &logits, &batch.labels, batch.len())
    }

    pub fn evaluate(&self, batch: &Batch) -> Result<BatchMetrics> {
        self.classifier.evaluate(batch)
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.optimizer.set_learning_rate(lr);
    }

    /// Copies the current trainable parameters.
    pub fn snapshot(&self) -> Result<ParameterSnapshot> {
        let vars = self.vars()?;
        let tensors = vars
            .into_iter()
            .map(|(name, var)| Ok((name, var.as_tensor().copy()?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(ParameterSnapshot { tensors })
    }

    /// Overwrites the trainable parameters with `snapshot`.
    pub fn restore(&mut self, snapshot: &ParameterSnapshot) -> Result<()> {
        for (name, var) in self.vars()? {
            let saved = snapshot.get(&name).ok_or_else(|| {
                CropdxError::Candle(format!("snapshot is missing parameter '{name}'"))
            })?;
            var.set(saved)?;
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.classifier.save(path)
    }

    pub fn output_width(&self) -> usize {
        self.classifier.num_classes()
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn into_classifier(self) -> Classifier {
        self.classifier
    }

    fn vars(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| CropdxError::Candle("parameter store lock poisoned".into()))?;
        let mut vars: Vec<_> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }
}
