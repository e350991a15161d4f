//! # Feature Extractors
//!
//! Frozen convolutional backbones. A backbone maps `[B, 3, S, S]` images to a
//! `[B, C, H', W']` feature map and never takes part in optimization: its
//! tensors are plain (non-variable) tensors and its output is detached.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::init::DEFAULT_KAIMING_NORMAL;
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, Init, ModuleT, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dataset::Normalization;
use crate::error::{CropdxError, Result};

/// Contract between the classifier and whatever produces its features.
pub trait FeatureExtractor: Send + Sync + fmt::Debug {
    /// Runs the backbone in inference mode. The result carries no gradient.
    fn extract(&self, images: &Tensor) -> Result<Tensor>;

    /// Channel count `C` of the produced feature map.
    fn output_channels(&self) -> usize;

    /// Smallest square input edge the backbone accepts.
    fn min_input_size(&self) -> usize;

    /// Pixel normalization the backbone was trained with.
    fn normalization(&self) -> Normalization;

    /// Serializable description sufficient to rebuild the architecture.
    fn descriptor(&self) -> BackboneDescriptor;

    /// Parameters and buffers, keyed by their safetensors name.
    fn named_tensors(&self) -> Vec<(String, Tensor)>;
}

/// Identifies a backbone architecture inside a model artifact.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum BackboneDescriptor {
    #[serde(rename = "mobilenet_v2")]
    MobileNetV2 { width_multiplier: f64 },
}

impl BackboneDescriptor {
    /// Rebuilds the described backbone from named tensors.
    pub fn build(
        &self,
        tensors: HashMap<String, Tensor>,
        device: &Device,
    ) -> Result<Box<dyn FeatureExtractor>> {
        match *self {
            Self::MobileNetV2 { width_multiplier } => {
                let config = MobileNetV2Config::new(width_multiplier)?;
                Ok(Box::new(MobileNetV2::from_tensors(tensors, config, device)?))
            }
        }
    }
}

/// Where backbone weights come from.
#[derive(Debug, Clone, PartialEq)]
pub enum BackboneSource {
    /// timm `mobilenetv2_*` weights in a safetensors file.
    Pretrained(PathBuf),
    /// Random weights. Only useful for smoke runs and tests.
    RandomInit,
}

impl BackboneSource {
    pub fn load(&self, config: MobileNetV2Config, device: &Device) -> Result<MobileNetV2> {
        match self {
            Self::Pretrained(path) => MobileNetV2::from_safetensors(path, config, device),
            Self::RandomInit => MobileNetV2::random_init(config, device),
        }
    }
}

/// MobileNetV2 hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MobileNetV2Config {
    pub width_multiplier: f64,
}

impl Default for MobileNetV2Config {
    fn default() -> Self {
        Self {
            width_multiplier: 1.0,
        }
    }
}

impl MobileNetV2Config {
    pub fn new(width_multiplier: f64) -> Result<Self> {
        if !(width_multiplier.is_finite() && width_multiplier > 0.0) {
            return Err(CropdxError::ModelBuild(format!(
                "width multiplier must be positive, got {width_multiplier}"
            )));
        }
        Ok(Self { width_multiplier })
    }

    fn channels(&self, base: usize) -> usize {
        make_divisible(base as f64 * self.width_multiplier, 8)
    }

    fn head_channels(&self) -> usize {
        HEAD_CHANNELS.max(self.channels(HEAD_CHANNELS))
    }
}

const STEM_CHANNELS: usize = 32;
const HEAD_CHANNELS: usize = 1280;
const BN_EPS: f64 = 1e-5;
/// Five stride-2 stages reduce 32 pixels to one.
const MIN_INPUT: usize = 32;

/// (expansion, output channels, repeats, first stride) per stage.
const STAGES: [(usize, usize, usize, usize); 7] = [
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

/// Rounds `value` to a multiple of `divisor`, never dropping more than 10%.
fn make_divisible(value: f64, divisor: usize) -> usize {
    let d = divisor as f64;
    let mut rounded = (((value + d / 2.0) / d).floor() * d).max(d);
    if rounded < 0.9 * value {
        rounded += d;
    }
    rounded as usize
}

fn relu6(x: &Tensor) -> candle_core::Result<Tensor> {
    x.clamp(0f32, 6f32)
}

#[derive(Debug, Clone)]
struct ConvBn {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ConvBn {
    fn forward(&self, x: &Tensor, activate: bool) -> candle_core::Result<Tensor> {
        let x = x.apply(&self.conv)?;
        let x = self.bn.forward_t(&x, false)?;
        if activate { relu6(&x) } else { Ok(x) }
    }
}

#[derive(Debug, Clone)]
enum Block {
    /// Depthwise 3x3 then linear pointwise projection (first stage).
    DepthwiseSeparable {
        dw: ConvBn,
        pw: ConvBn,
        residual: bool,
    },
    /// Pointwise expansion, depthwise 3x3, linear pointwise projection.
    InvertedResidual {
        pw: ConvBn,
        dw: ConvBn,
        pwl: ConvBn,
        residual: bool,
    },
}

impl Block {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::DepthwiseSeparable { dw, pw, residual } => {
                let y = dw.forward(x, true)?;
                let y = pw.forward(&y, false)?;
                if *residual { y + x } else { Ok(y) }
            }
            Self::InvertedResidual {
                pw,
                dw,
                pwl,
                residual,
            } => {
                let y = pw.forward(x, true)?;
                let y = dw.forward(&y, true)?;
                let y = pwl.forward(&y, false)?;
                if *residual { y + x } else { Ok(y) }
            }
        }
    }
}

/// Pulls tensors out of a [`VarBuilder`] and remembers every name it served.
struct LayerBuilder<'a> {
    vb: VarBuilder<'a>,
    tensors: Vec<(String, Tensor)>,
}

impl<'a> LayerBuilder<'a> {
    fn new(vb: VarBuilder<'a>) -> Self {
        Self {
            vb,
            tensors: Vec::new(),
        }
    }

    fn get<S: Into<candle_core::Shape>>(
        &mut self,
        shape: S,
        name: String,
        init: Init,
    ) -> candle_core::Result<Tensor> {
        let tensor = self.vb.get_with_hints(shape, &name, init)?.detach();
        self.tensors.push((name, tensor.clone()));
        Ok(tensor)
    }

    #[allow(clippy::too_many_arguments)]
    fn conv_bn(
        &mut self,
        conv_path: &str,
        bn_path: &str,
        c_in: usize,
        c_out: usize,
        kernel: usize,
        stride: usize,
        groups: usize,
    ) -> candle_core::Result<ConvBn> {
        let weight = self.get(
            (c_out, c_in / groups, kernel, kernel),
            format!("{conv_path}.weight"),
            DEFAULT_KAIMING_NORMAL,
        )?;
        let config = Conv2dConfig {
            padding: kernel / 2,
            stride,
            groups,
            ..Default::default()
        };
        let conv = Conv2d::new(weight, None, config);

        let weight = self.get(c_out, format!("{bn_path}.weight"), Init::Const(1.0))?;
        let bias = self.get(c_out, format!("{bn_path}.bias"), Init::Const(0.0))?;
        let mean = self.get(c_out, format!("{bn_path}.running_mean"), Init::Const(0.0))?;
        let var = self.get(c_out, format!("{bn_path}.running_var"), Init::Const(1.0))?;
        let bn = BatchNorm::new(c_out, mean, var, weight, bias, BN_EPS)?;

        Ok(ConvBn { conv, bn })
    }
}

/// MobileNetV2 feature extractor, parameter names following timm's
/// `mobilenetv2_100` checkpoint.
#[derive(Debug, Clone)]
pub struct MobileNetV2 {
    config: MobileNetV2Config,
    stem: ConvBn,
    blocks: Vec<Block>,
    head: ConvBn,
    out_channels: usize,
    tensors: Vec<(String, Tensor)>,
}

impl MobileNetV2 {
    /// Pixel statistics of the ImageNet-pretrained weights.
    pub const NORMALIZATION: Normalization = Normalization::IMAGENET;

    /// Loads pretrained weights from a safetensors file.
    pub fn from_safetensors(
        path: impl AsRef<Path>,
        config: MobileNetV2Config,
        device: &Device,
    ) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(CropdxError::BackboneWeights(format!(
                "not found at '{}'",
                path.display()
            )));
        }
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device) }
            .map_err(|e| CropdxError::BackboneWeights(format!("cannot read: {e}")))?;
        let model = Self::build(vb, config)?;
        info!(
            "Loaded MobileNetV2 (width {}) from {}",
            config.width_multiplier,
            path.display()
        );
        Ok(model)
    }

    /// Builds the backbone from an in-memory tensor map.
    pub fn from_tensors(
        tensors: HashMap<String, Tensor>,
        config: MobileNetV2Config,
        device: &Device,
    ) -> Result<Self> {
        Self::build(VarBuilder::from_tensors(tensors, DType::F32, device), config)
    }

    /// Randomly initialised backbone with identity batch-norm statistics.
    pub fn random_init(config: MobileNetV2Config, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        Self::build(VarBuilder::from_varmap(&varmap, DType::F32, device), config)
    }

    fn build(vb: VarBuilder<'_>, config: MobileNetV2Config) -> Result<Self> {
        Self::assemble(vb, config)
            .map_err(|e| CropdxError::BackboneWeights(format!("unusable: {e}")))
    }

    fn assemble(vb: VarBuilder<'_>, config: MobileNetV2Config) -> candle_core::Result<Self> {
        let mut lb = LayerBuilder::new(vb);

        let stem_channels = config.channels(STEM_CHANNELS);
        let stem = lb.conv_bn("conv_stem", "bn1", 3, stem_channels, 3, 2, 1)?;

        let mut blocks = Vec::new();
        let mut c_in = stem_channels;
        for (stage, &(expansion, base_out, repeats, first_stride)) in STAGES.iter().enumerate() {
            let c_out = config.channels(base_out);
            for i in 0..repeats {
                let stride = if i == 0 { first_stride } else { 1 };
                let residual = stride == 1 && c_in == c_out;
                let p = format!("blocks.{stage}.{i}");
                let block = if expansion == 1 {
                    Block::DepthwiseSeparable {
                        dw: lb.conv_bn(
                            &format!("{p}.conv_dw"),
                            &format!("{p}.bn1"),
                            c_in,
                            c_in,
                            3,
                            stride,
                            c_in,
                        )?,
                        pw: lb.conv_bn(
                            &format!("{p}.conv_pw"),
                            &format!("{p}.bn2"),
                            c_in,
                            c_out,
                            1,
                            1,
                            1,
                        )?,
                        residual,
                    }
                } else {
                    let mid = make_divisible((c_in * expansion) as f64, 8);
                    Block::InvertedResidual {
                        pw: lb.conv_bn(
                            &format!("{p}.conv_pw"),
                            &format!("{p}.bn1"),
                            c_in,
                            mid,
                            1,
                            1,
                            1,
                        )?,
                        dw: lb.conv_bn(
                            &format!("{p}.conv_dw"),
                            &format!("{p}.bn2"),
                            mid,
                            mid,
                            3,
                            stride,
                            mid,
                        )?,
                        pwl: lb.conv_bn(
                            &format!("{p}.conv_pwl"),
                            &format!("{p}.bn3"),
                            mid,
                            c_out,
                            1,
                            1,
                            1,
                        )?,
                        residual,
                    }
                };
                blocks.push(block);
                c_in = c_out;
            }
        }

        let out_channels = config.head_channels();
        let head = lb.conv_bn("conv_head", "bn2", c_in, out_channels, 1, 1, 1)?;

        Ok(Self {
            config,
            stem,
            blocks,
            head,
            out_channels,
            tensors: lb.tensors,
        })
    }

    pub fn config(&self) -> MobileNetV2Config {
        self.config
    }

    fn forward(&self, images: &Tensor) -> candle_core::Result<Tensor> {
        let mut x = self.stem.forward(images, true)?;
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        self.head.forward(&x, true)
    }
}

impl FeatureExtractor for MobileNetV2 {
    fn extract(&self, images: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = images.dims4()?;
        if h < MIN_INPUT || w < MIN_INPUT {
            return Err(CropdxError::Candle(format!(
                "input {h}x{w} is smaller than the {MIN_INPUT}x{MIN_INPUT} minimum"
            )));
        }
        Ok(self.forward(images)?.detach())
    }

    fn output_channels(&self) -> usize {
        self.out_channels
    }

    fn min_input_size(&self) -> usize {
        MIN_INPUT
    }

    fn normalization(&self) -> Normalization {
        Self::NORMALIZATION
    }

    fn descriptor(&self) -> BackboneDescriptor {
        BackboneDescriptor::MobileNetV2 {
            width_multiplier: self.config.width_multiplier,
        }
    }

    fn named_tensors(&self) -> Vec<(String, Tensor)> {
        self.tensors.clone()
    }
}
