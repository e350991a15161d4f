//! Trainable classification head placed on top of a frozen backbone.

use candle_core::Tensor;
use candle_nn::{Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{CropdxError, Result};

/// Head layout: GAP → dropout → dense+ReLU → dropout → dense.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeadConfig {
    pub hidden_units: usize,
    /// Dropout applied to pooled features.
    pub feature_dropout: f32,
    /// Dropout applied to the hidden layer output.
    pub hidden_dropout: f32,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            hidden_units: 128,
            feature_dropout: 0.2,
            hidden_dropout: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassifierHead {
    config: HeadConfig,
    hidden: Linear,
    output: Linear,
    num_classes: usize,
}

impl ClassifierHead {
    /// Creates (or loads, depending on `vb`) the head's two dense layers,
    /// named `hidden` and `output`.
    pub fn new(
        in_features: usize,
        num_classes: usize,
        config: HeadConfig,
        vb: VarBuilder<'_>,
    ) -> Result<Self> {
        let hidden = candle_nn::linear(in_features, config.hidden_units, vb.pp("hidden"))?;
        let output = candle_nn::linear(config.hidden_units, num_classes, vb.pp("output"))?;
        Ok(Self {
            config,
            hidden,
            output,
            num_classes,
        })
    }

    pub fn config(&self) -> HeadConfig {
        self.config
    }

    /// Width of the final layer, equal to the class count.
    pub fn output_width(&self) -> usize {
        self.num_classes
    }

    /// Maps backbone features to logits. Dropout is active only when `train`.
    pub fn forward_t(&self, features: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = global_average_pool(features)?;
        if train {
            x = candle_nn::ops::dropout(&x, self.config.feature_dropout)?;
        }
        x = self.hidden.forward(&x)?.relu()?;
        if train {
            x = candle_nn::ops::dropout(&x, self.config.hidden_dropout)?;
        }
        Ok(self.output.forward(&x)?)
    }

    pub fn named_tensors(&self) -> Vec<(String, Tensor)> {
        let mut tensors = Vec::with_capacity(4);
        for (name, layer) in [("hidden", &self.hidden), ("output", &self.output)] {
            tensors.push((format!("{name}.weight"), layer.weight().clone()));
            if let Some(bias) = layer.bias() {
                tensors.push((format!("{name}.bias"), bias.clone()));
            }
        }
        tensors
    }
}

/// `[B, C, H, W]` → `[B, C]`; already pooled `[B, C]` passes through.
fn global_average_pool(features: &Tensor) -> Result<Tensor> {
    match features.rank() {
        4 => Ok(features.mean((2, 3))?),
        2 => Ok(features.clone()),
        rank => Err(CropdxError::Candle(format!(
            "expected a rank 2 or 4 feature tensor, got rank {rank}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn head(num_classes: usize) -> (ClassifierHead, VarMap) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let head = ClassifierHead::new(16, num_classes, HeadConfig::default(), vb).unwrap();
        (head, varmap)
    }

    #[test]
    fn output_width_is_class_count() {
        let (head, varmap) = head(5);
        assert_eq!(head.output_width(), 5);
        assert_eq!(varmap.all_vars().len(), 4);

        let features = Tensor::randn(0f32, 1.0, (3, 16, 2, 2), &Device::Cpu).unwrap();
        let logits = head.forward_t(&features, false).unwrap();
        assert_eq!(logits.dims(), &[3, 5]);
    }

    #[test]
    fn pooling_averages_spatial_dims() {
        let x = Tensor::arange(0f32, 8.0, &Device::Cpu)
            .unwrap()
            .reshape((1, 2, 2, 2))
            .unwrap();
        let pooled = global_average_pool(&x).unwrap();
        assert_eq!(pooled.to_vec2::<f32>().unwrap(), vec![vec![1.5, 5.5]]);

        let flat = Tensor::zeros((4, 3), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(global_average_pool(&flat).unwrap().dims(), &[4, 3]);
    }

    #[test]
    fn inference_is_deterministic() {
        let (head, _varmap) = head(2);
        let features = Tensor::randn(0f32, 1.0, (2, 16), &Device::Cpu).unwrap();
        let a = head.forward_t(&features, false).unwrap().to_vec2::<f32>().unwrap();
        let b = head.forward_t(&features, false).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn named_tensors_cover_both_layers() {
        let (head, _varmap) = head(3);
        let names: Vec<_> = head.named_tensors().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            ["hidden.weight", "hidden.bias", "output.weight", "output.bias"]
        );
    }
}
