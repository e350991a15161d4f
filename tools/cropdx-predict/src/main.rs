//! Classify leaf images with a trained model.
//!
//! Prints one JSON object per input on stdout. Images that fail are reported
//! in the `error` field and do not stop the run.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use candle_core::Device;
use clap::Parser;
use cropdx::dataset::ImagePreprocessor;
use cropdx::{load_classifier, ClassIndexMap, Classifier, DeviceChoice};
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cropdx-predict")]
#[command(about = "Classify leaf images with a trained cropdx model")]
#[command(version)]
struct Cli {
    /// Model artifact written by cropdx-train
    #[arg(
        short,
        long,
        env = "CROPDX_MODEL",
        default_value = "./models/crop_disease_model.safetensors"
    )]
    model: PathBuf,

    /// Label map written by cropdx-train
    #[arg(
        short,
        long,
        env = "CROPDX_LABELS",
        default_value = "./models/class_indices.json"
    )]
    labels: PathBuf,

    /// Number of ranked classes to report per image
    #[arg(short = 'k', long, default_value_t = 3)]
    top_k: usize,

    /// cpu, cuda or cuda:N
    #[arg(long, env = "CROPDX_DEVICE", default_value = "cpu")]
    device: DeviceChoice,

    /// Images to classify
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

#[derive(Debug, Serialize)]
struct Ranked {
    label: String,
    index: usize,
    confidence: f32,
}

#[derive(Debug, Serialize)]
struct PredictOutput {
    input: String,
    label: Option<String>,
    index: Option<usize>,
    confidence: Option<f32>,
    top_k: Vec<Ranked>,
    error: Option<String>,
}

impl PredictOutput {
    fn failed(input: &Path, error: impl ToString) -> Self {
        Self {
            input: input.display().to_string(),
            label: None,
            index: None,
            confidence: None,
            top_k: Vec::new(),
            error: Some(error.to_string()),
        }
    }
}

struct Predictor {
    classifier: Classifier,
    labels: ClassIndexMap,
    preprocessor: ImagePreprocessor,
    device: Device,
}

impl Predictor {
    fn load(model: &Path, labels: &Path, device: Device) -> Result<Self> {
        let classifier = load_classifier(model, &device)
            .with_context(|| format!("Failed to load model {}", model.display()))?;
        let labels = ClassIndexMap::load(labels)
            .with_context(|| format!("Failed to load label map {}", labels.display()))?;
        if labels.len() != classifier.num_classes() {
            bail!(
                "label map has {} classes but the model predicts {}",
                labels.len(),
                classifier.num_classes()
            );
        }
        let preprocessor =
            ImagePreprocessor::new(classifier.image_size(), classifier.normalization())?;
        info!(
            "Loaded {}-class model at {}px: {}",
            labels.len(),
            classifier.image_size(),
            labels
        );
        Ok(Self {
            classifier,
            labels,
            preprocessor,
            device,
        })
    }

    fn predict(&self, path: &Path, top_k: usize) -> Result<PredictOutput> {
        let image = self.preprocessor.load_tensor(path, &self.device)?;
        let probs: Vec<f32> = self
            .classifier
            .predict_proba(&image)?
            .flatten_all()?
            .to_vec1()?;

        let mut ranked: Vec<(usize, f32)> = probs.into_iter().enumerate().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        let ranked: Vec<Ranked> = ranked
            .into_iter()
            .take(top_k.max(1))
            .map(|(index, confidence)| Ranked {
                label: self.labels.label(index).unwrap_or("?").to_string(),
                index,
                confidence,
            })
            .collect();

        let best = ranked.first().context("model produced no scores")?;
        debug!("{} -> {} ({:.3})", path.display(), best.label, best.confidence);
        Ok(PredictOutput {
            input: path.display().to_string(),
            label: Some(best.label.clone()),
            index: Some(best.index),
            confidence: Some(best.confidence),
            top_k: ranked,
            error: None,
        })
    }
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let device = cli.device.to_device()?;
    let predictor = Predictor::load(&cli.model, &cli.labels, device)?;

    for input in &cli.inputs {
        let output = predictor
            .predict(input, cli.top_k)
            .unwrap_or_else(|e| PredictOutput::failed(input, format!("{e:#}")));
        println!("{}", serde_json::to_string(&output)?);
    }
    Ok(())
}
