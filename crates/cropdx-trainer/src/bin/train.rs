use std::path::PathBuf;

use clap::Parser;
use cropdx_core::model::BackboneSource;
use cropdx_core::CropdxError;
use cropdx_trainer::{run_training, DeviceChoice, TrainingConfig};
use tracing_subscriber::EnvFilter;

/// Train a crop disease classifier on a folder of labelled leaf images.
#[derive(Parser)]
#[command(name = "cropdx-train")]
#[command(version)]
struct Cli {
    /// Dataset root with one subfolder per class
    #[arg(short, long, env = "CROPDX_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Where the model, label map and history are written
    #[arg(short, long, env = "CROPDX_OUTPUT_DIR", default_value = "./models")]
    output_dir: PathBuf,

    /// Square edge images are resized to
    #[arg(long, env = "CROPDX_IMAGE_SIZE", default_value_t = 224)]
    image_size: usize,

    #[arg(short, long, env = "CROPDX_BATCH_SIZE", default_value_t = 8)]
    batch_size: usize,

    /// Maximum number of epochs
    #[arg(short, long, env = "CROPDX_EPOCHS", default_value_t = 20)]
    epochs: usize,

    /// Share of each class held out for validation
    #[arg(long, env = "CROPDX_VALIDATION_SPLIT", default_value_t = 0.2)]
    validation_split: f64,

    #[arg(long, env = "CROPDX_LEARNING_RATE", default_value_t = 1e-4)]
    learning_rate: f64,

    /// Seed for the split and the per-epoch shuffle
    #[arg(long, env = "CROPDX_SEED", default_value_t = 123)]
    seed: u64,

    /// Pretrained MobileNetV2 weights (timm layout, safetensors)
    #[arg(
        long,
        env = "CROPDX_BACKBONE_WEIGHTS",
        default_value = "./weights/mobilenetv2_100.safetensors"
    )]
    backbone_weights: PathBuf,

    /// Use a randomly initialised backbone instead of pretrained weights
    #[arg(long, env = "CROPDX_RANDOM_BACKBONE")]
    random_backbone: bool,

    #[arg(long, env = "CROPDX_WIDTH_MULTIPLIER", default_value_t = 1.0)]
    width_multiplier: f64,

    /// Batches decoded ahead in the background (0 disables)
    #[arg(long, env = "CROPDX_PREFETCH", default_value_t = 2)]
    prefetch: usize,

    /// cpu, cuda or cuda:N
    #[arg(long, env = "CROPDX_DEVICE", default_value = "cpu")]
    device: DeviceChoice,
}

impl Cli {
    fn into_config(self) -> TrainingConfig {
        let backbone = if self.random_backbone {
            BackboneSource::RandomInit
        } else {
            BackboneSource::Pretrained(self.backbone_weights)
        };
        TrainingConfig::default()
            .with_data_dir(self.data_dir)
            .with_output_dir(self.output_dir)
            .with_image_size(self.image_size)
            .with_batch_size(self.batch_size)
            .with_epochs(self.epochs)
            .with_validation_fraction(self.validation_split)
            .with_learning_rate(self.learning_rate)
            .with_seed(self.seed)
            .with_backbone(backbone)
            .with_width_multiplier(self.width_multiplier)
            .with_prefetch(self.prefetch)
            .with_device(self.device)
    }
}

fn tip(err: &CropdxError, config: &TrainingConfig) -> Option<String> {
    match err {
        CropdxError::Configuration(_) => Some(format!(
            "Put your images in {}/<class_name>/ with one folder per crop/disease class.",
            config.data_dir.display()
        )),
        CropdxError::BackboneWeights(_) => Some(
            "Export timm's mobilenetv2_100 weights to safetensors, \
             or pass --random-backbone for a smoke run."
                .to_string(),
        ),
        CropdxError::ModelBuild(_) => {
            Some("Check the number of class folders and the image size.".to_string())
        }
        _ => None,
    }
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Cli::parse().into_config();

    match run_training(&config) {
        Ok(report) => {
            let best = report.history.best_by_val_accuracy();
            println!(
                "Training finished ({}) after {} epochs.",
                report
                    .history
                    .stop_reason
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "unknown".into()),
                report.history.len()
            );
            if let Some(best) = best {
                println!(
                    "Best val_accuracy {:.2}% at epoch {}",
                    best.val_accuracy * 100.0,
                    best.epoch
                );
            }
            println!("Model saved to {}", report.model_path.display());
            println!("Class indices saved to {}", report.labels_path.display());
        }
        Err(e) => {
            eprintln!("Training failed: {}", e);
            if let Some(tip) = tip(&e, &config) {
                eprintln!("Tip: {}", tip);
            }
            std::process::exit(1);
        }
    }
}
