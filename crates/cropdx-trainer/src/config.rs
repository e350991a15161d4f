//! Training run configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use candle_core::Device;
use cropdx_core::dataset::DatasetConfig;
use cropdx_core::model::BackboneSource;
use cropdx_core::{CropdxError, Result};

use crate::callbacks::{EarlyStoppingConfig, LrPlateauConfig};

/// Compute device for training and inference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeviceChoice {
    #[default]
    Cpu,
    /// CUDA device by ordinal.
    Cuda(usize),
}

impl DeviceChoice {
    pub fn to_device(self) -> Result<Device> {
        match self {
            Self::Cpu => Ok(Device::Cpu),
            Self::Cuda(ordinal) => Device::new_cuda(ordinal).map_err(|e| {
                CropdxError::Configuration(format!("CUDA device {ordinal} unavailable: {e}"))
            }),
        }
    }
}

impl FromStr for DeviceChoice {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|n| n.parse().ok())
                .map(Self::Cuda)
                .ok_or_else(|| format!("unknown device '{s}' (expected cpu, cuda or cuda:N)")),
        }
    }
}

impl fmt::Display for DeviceChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(n) => write!(f, "cuda:{n}"),
        }
    }
}

/// Everything a training run needs.
///
/// Defaults reproduce the reference setup: `./data` in, `./models` out,
/// 224px images, batch 8, 20 epochs, 20% validation, lr 1e-4, seed 123.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingConfig {
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub image_size: usize,
    pub batch_size: usize,
    pub epochs: usize,
    pub validation_fraction: f64,
    pub learning_rate: f64,
    pub seed: u64,
    pub backbone: BackboneSource,
    pub width_multiplier: f64,
    pub prefetch: usize,
    pub device: DeviceChoice,
    pub early_stopping: EarlyStoppingConfig,
    pub lr_plateau: LrPlateauConfig,
    pub model_file: String,
    pub labels_file: String,
    pub history_file: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            output_dir: PathBuf::from("./models"),
            image_size: 224,
            batch_size: 8,
            epochs: 20,
            validation_fraction: 0.2,
            learning_rate: 1e-4,
            seed: 123,
            backbone: BackboneSource::Pretrained(PathBuf::from(
                "./weights/mobilenetv2_100.safetensors",
            )),
            width_multiplier: 1.0,
            prefetch: 2,
            device: DeviceChoice::Cpu,
            early_stopping: EarlyStoppingConfig::default(),
            lr_plateau: LrPlateauConfig::default(),
            model_file: "crop_disease_model.safetensors".into(),
            labels_file: "class_indices.json".into(),
            history_file: "training_history.json".into(),
        }
    }
}

impl TrainingConfig {
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_image_size(mut self, image_size: usize) -> Self {
        self.image_size = image_size;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_validation_fraction(mut self, fraction: f64) -> Self {
        self.validation_fraction = fraction;
        self
    }

    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_backbone(mut self, backbone: BackboneSource) -> Self {
        self.backbone = backbone;
        self
    }

    pub fn with_width_multiplier(mut self, width_multiplier: f64) -> Self {
        self.width_multiplier = width_multiplier;
        self
    }

    pub fn with_prefetch(mut self, depth: usize) -> Self {
        self.prefetch = depth;
        self
    }

    pub fn with_device(mut self, device: DeviceChoice) -> Self {
        self.device = device;
        self
    }

    pub fn model_path(&self) -> PathBuf {
        self.output_dir.join(&self.model_file)
    }

    pub fn labels_path(&self) -> PathBuf {
        self.output_dir.join(&self.labels_file)
    }

    pub fn history_path(&self) -> PathBuf {
        self.output_dir.join(&self.history_file)
    }

    pub fn dataset_config(&self) -> DatasetConfig {
        DatasetConfig::new(&self.data_dir)
            .with_image_size(self.image_size)
            .with_batch_size(self.batch_size)
            .with_validation_fraction(self.validation_fraction)
            .with_seed(self.seed)
            .with_prefetch(self.prefetch)
    }

    /// Checks settings that are independent of the data and the backbone.
    pub fn validate(&self) -> Result<()> {
        self.dataset_config().validate()?;
        if self.epochs == 0 {
            return Err(CropdxError::Configuration("epochs must be at least 1".into()));
        }
        let lr = &self.lr_plateau;
        if !(lr.factor > 0.0 && lr.factor < 1.0) {
            return Err(CropdxError::Configuration(format!(
                "learning-rate reduction factor must be in (0, 1), got {}",
                lr.factor
            )));
        }
        if !(lr.min_lr >= 0.0 && lr.min_lr.is_finite()) {
            return Err(CropdxError::Configuration(format!(
                "minimum learning rate must be non-negative, got {}",
                lr.min_lr
            )));
        }
        for (what, name) in [
            ("model", &self.model_file),
            ("label map", &self.labels_file),
            ("history", &self.history_file),
        ] {
            if name.trim().is_empty() {
                return Err(CropdxError::Configuration(format!(
                    "{what} file name must not be empty"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_setup() {
        let config = TrainingConfig::default();
        assert_eq!(config.image_size, 224);
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.epochs, 20);
        assert_eq!(config.seed, 123);
        assert_eq!(config.labels_path(), PathBuf::from("./models/class_indices.json"));
        assert_eq!(
            config.model_path(),
            PathBuf::from("./models/crop_disease_model.safetensors")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_feeds_dataset_config() {
        let config = TrainingConfig::default()
            .with_data_dir("/tmp/leaves")
            .with_batch_size(4)
            .with_seed(9);
        let data = config.dataset_config();
        assert_eq!(data.root, PathBuf::from("/tmp/leaves"));
        assert_eq!(data.batch_size, 4);
        assert_eq!(data.seed, 9);
    }

    #[test]
    fn invalid_values_are_configuration_errors() {
        let cases = [
            TrainingConfig::default().with_epochs(0),
            TrainingConfig::default().with_batch_size(0),
            TrainingConfig::default().with_validation_fraction(1.0),
        ];
        for config in cases {
            assert!(matches!(
                config.validate(),
                Err(CropdxError::Configuration(_))
            ));
        }
    }

    #[test]
    fn device_parsing() {
        assert_eq!("cpu".parse::<DeviceChoice>(), Ok(DeviceChoice::Cpu));
        assert_eq!("CUDA".parse::<DeviceChoice>(), Ok(DeviceChoice::Cuda(0)));
        assert_eq!("cuda:1".parse::<DeviceChoice>(), Ok(DeviceChoice::Cuda(1)));
        assert!("tpu".parse::<DeviceChoice>().is_err());
        assert_eq!(DeviceChoice::Cuda(2).to_string(), "cuda:2");
    }
}
