//! End-to-end training driver: data → model → label map → fit → history.

use std::path::PathBuf;

use cropdx_core::dataset::DatasetLoader;
use cropdx_core::model::{MobileNetV2, MobileNetV2Config, ModelFactory, ModelSpec};
use cropdx_core::{ClassIndexMap, Result, TrainingHistory};
use tracing::info;

use crate::config::TrainingConfig;
use crate::job::TrainingJob;

/// What a finished run produced.
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub classes: ClassIndexMap,
    pub history: TrainingHistory,
    pub train_examples: usize,
    pub validation_examples: usize,
    /// Files skipped during discovery because they could not be read.
    pub skipped: Vec<PathBuf>,
    pub model_path: PathBuf,
    pub labels_path: PathBuf,
    pub history_path: PathBuf,
}

/// Runs a full training session.
///
/// Setup failures (bad config, missing data, unusable backbone) return before
/// anything is written. The label map is written once data and model are
/// ready; the model file is written by the first checkpoint.
pub fn run_training(config: &TrainingConfig) -> Result<TrainingReport> {
    config.validate()?;
    let device = config.device.to_device()?;

    let data = DatasetLoader::new(config.dataset_config())
        .load(MobileNetV2::NORMALIZATION, &device)?;

    let backbone = config.backbone.load(
        MobileNetV2Config::new(config.width_multiplier)?,
        &device,
    )?;
    let spec = ModelSpec::new(data.classes.len(), config.image_size, config.learning_rate);
    let mut model = ModelFactory::new(device).build(&spec, Box::new(backbone))?;

    let labels_path = config.labels_path();
    data.classes.save(&labels_path)?;
    info!("Class indices saved to {}", labels_path.display());

    let job = TrainingJob::new(config.epochs, config.model_path())
        .with_early_stopping(config.early_stopping)
        .with_lr_plateau(config.lr_plateau);
    let history = job.run(&mut model, &data.train, &data.validation)?;

    let history_path = config.history_path();
    history.save(&history_path)?;
    info!("Training history saved to {}", history_path.display());

    Ok(TrainingReport {
        classes: data.classes,
        history,
        train_examples: data.train.len(),
        validation_examples: data.validation.len(),
        skipped: data.skipped,
        model_path: config.model_path(),
        labels_path,
        history_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use cropdx_core::dataset::{ImagePreprocessor, Normalization};
    use cropdx_core::model::BackboneSource;
    use cropdx_core::{load_classifier, CropdxError};
    use image::{Rgb, RgbImage};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn toy_cat_dog(root: &Path) {
        for (name, color) in [("cat", [200u8, 120, 40]), ("dog", [40u8, 80, 200])] {
            let dir = root.join(name);
            fs::create_dir_all(&dir).unwrap();
            for i in 0..6u8 {
                let shade = i * 5;
                RgbImage::from_pixel(40, 36, Rgb([color[0], color[1] + shade, color[2]]))
                    .save(dir.join(format!("{name}_{i}.png")))
                    .unwrap();
            }
        }
    }

    fn toy_config(data: &Path, out: &Path) -> TrainingConfig {
        TrainingConfig::default()
            .with_data_dir(data)
            .with_output_dir(out)
            .with_image_size(32)
            .with_batch_size(4)
            .with_epochs(2)
            .with_learning_rate(1e-3)
            .with_backbone(BackboneSource::RandomInit)
            .with_width_multiplier(0.35)
    }

    #[test]
    fn trains_toy_dataset_end_to_end() {
        let data = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        toy_cat_dog(data.path());
        let config = toy_config(data.path(), &out.path().join("models"));

        let report = run_training(&config).unwrap();

        assert_eq!(report.classes.names(), &["cat", "dog"]);
        assert_eq!(report.train_examples, 10);
        assert_eq!(report.validation_examples, 2);
        assert!(!report.history.is_empty() && report.history.len() <= 2);
        assert!(report.history.stop_reason.is_some());

        let labels: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&report.labels_path).unwrap()).unwrap();
        assert_eq!(labels, serde_json::json!({"0": "cat", "1": "dog"}));

        assert!(report.model_path.is_file());
        assert!(report.history_path.is_file());

        let classifier = load_classifier(&report.model_path, &Device::Cpu).unwrap();
        assert_eq!(classifier.num_classes(), 2);
        assert_eq!(classifier.image_size(), 32);

        let pre = ImagePreprocessor::new(32, classifier.normalization()).unwrap();
        let image = pre
            .load_tensor(&data.path().join("cat").join("cat_0.png"), &Device::Cpu)
            .unwrap();
        let probs: Vec<f32> = classifier
            .predict_proba(&image)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert_eq!(classifier.normalization(), Normalization::IMAGENET);
    }

    #[test]
    fn missing_data_dir_writes_nothing() {
        let out = TempDir::new().unwrap();
        let models = out.path().join("models");
        let config = toy_config(&out.path().join("nope"), &models);

        let err = run_training(&config).unwrap_err();
        assert!(matches!(err, CropdxError::Configuration(_)));
        assert!(!models.exists());
    }

    #[test]
    fn single_class_fails_model_build_without_outputs() {
        let data = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        toy_cat_dog(data.path());
        fs::remove_dir_all(data.path().join("dog")).unwrap();
        let models = out.path().join("models");

        let err = run_training(&toy_config(data.path(), &models)).unwrap_err();
        assert!(matches!(err, CropdxError::ModelBuild(_)));
        assert!(err.is_setup_error());
        assert!(!models.join("class_indices.json").exists());
    }

    #[test]
    fn missing_backbone_weights_is_a_setup_error() {
        let data = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        toy_cat_dog(data.path());
        let config = toy_config(data.path(), out.path())
            .with_backbone(BackboneSource::Pretrained(out.path().join("absent.safetensors")));

        let err = run_training(&config).unwrap_err();
        assert!(matches!(err, CropdxError::BackboneWeights(_)));
        assert!(err.is_setup_error());
    }
}
