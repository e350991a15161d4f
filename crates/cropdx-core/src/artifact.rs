//! # Model Artifact
//!
//! A trained classifier is stored as one safetensors file. Backbone tensors are
//! prefixed `backbone.`, head tensors `head.`, and the header metadata carries
//! an [`ArchitectureDescriptor`] so the network can be rebuilt from the file
//! alone.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dataset::Normalization;
use crate::error::{CropdxError, Result};
use crate::io::write_atomic;
use crate::model::{BackboneDescriptor, Classifier, ClassifierHead, HeadConfig};

/// Value of the `format` metadata key.
pub const ARTIFACT_FORMAT: &str = "cropdx-classifier";
/// Bumped whenever the tensor naming or metadata layout changes.
pub const ARTIFACT_VERSION: u32 = 1;

const BACKBONE_PREFIX: &str = "backbone.";
const HEAD_PREFIX: &str = "head.";

/// Serialized description of a classifier's architecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureDescriptor {
    pub backbone: BackboneDescriptor,
    pub image_size: usize,
    pub num_classes: usize,
    pub head: HeadConfig,
    pub normalization: Normalization,
}

/// Serializes `classifier` and writes it to `path` atomically.
pub fn save_classifier(classifier: &Classifier, path: &Path) -> Result<()> {
    let bytes = to_bytes(classifier)?;
    write_atomic(path, &bytes)?;
    debug!("Wrote {} bytes to {}", bytes.len(), path.display());
    Ok(())
}

fn to_bytes(classifier: &Classifier) -> Result<Vec<u8>> {
    let architecture = classifier.architecture();
    let tensors: Vec<(String, Tensor)> = classifier
        .backbone()
        .named_tensors()
        .into_iter()
        .map(|(name, t)| (format!("{BACKBONE_PREFIX}{name}"), t))
        .chain(
            classifier
                .head()
                .named_tensors()
                .into_iter()
                .map(|(name, t)| (format!("{HEAD_PREFIX}{name}"), t)),
        )
        .collect();

    let metadata = HashMap::from([
        ("format".to_string(), ARTIFACT_FORMAT.to_string()),
        ("format_version".to_string(), ARTIFACT_VERSION.to_string()),
        (
            "architecture".to_string(),
            serde_json::to_string(&architecture)?,
        ),
    ]);
    Ok(safetensors::serialize(
        tensors.iter().map(|(name, t)| (name.as_str(), t)),
        &Some(metadata),
    )?)
}

/// Reads the architecture from an artifact's header without touching tensors.
pub fn read_architecture(bytes: &[u8]) -> Result<ArchitectureDescriptor> {
    let (_, header) = SafeTensors::read_metadata(bytes)
        .map_err(|e| CropdxError::Artifact(format!("not a safetensors file: {e}")))?;
    let info = header
        .metadata()
        .as_ref()
        .ok_or_else(|| CropdxError::Artifact("missing metadata header".into()))?;

    match info.get("format").map(String::as_str) {
        Some(ARTIFACT_FORMAT) => {}
        other => {
            return Err(CropdxError::Artifact(format!(
                "unexpected format {other:?}, expected \"{ARTIFACT_FORMAT}\""
            )));
        }
    }
    let version: u32 = info
        .get("format_version")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| CropdxError::Artifact("missing or invalid format_version".into()))?;
    if version != ARTIFACT_VERSION {
        return Err(CropdxError::Artifact(format!(
            "unsupported format_version {version} (this build reads {ARTIFACT_VERSION})"
        )));
    }

    let json = info
        .get("architecture")
        .ok_or_else(|| CropdxError::Artifact("missing architecture metadata".into()))?;
    serde_json::from_str(json).map_err(|e| CropdxError::Artifact(format!("architecture: {e}")))
}

/// Rebuilds a classifier from an artifact written by [`save_classifier`].
pub fn load_classifier(path: &Path, device: &Device) -> Result<Classifier> {
    let bytes = fs::read(path)?;
    let architecture = read_architecture(&bytes)?;
    let tensors = candle_core::safetensors::load_buffer(&bytes, device)?;

    let mut backbone_tensors = HashMap::new();
    let mut head_tensors = HashMap::new();
    for (name, tensor) in tensors {
        if let Some(rest) = name.strip_prefix(BACKBONE_PREFIX) {
            backbone_tensors.insert(rest.to_string(), tensor);
        } else if let Some(rest) = name.strip_prefix(HEAD_PREFIX) {
            head_tensors.insert(rest.to_string(), tensor);
        }
    }

    let backbone = architecture
        .backbone
        .build(backbone_tensors, device)
        .map_err(|e| CropdxError::Artifact(format!("{}: {e}", path.display())))?;
    let head = ClassifierHead::new(
        backbone.output_channels(),
        architecture.num_classes,
        architecture.head,
        VarBuilder::from_tensors(head_tensors, DType::F32, device),
    )
    .map_err(|e| CropdxError::Artifact(format!("{}: head: {e}", path.display())))?;

    debug!(
        "Loaded {} classes at {}px from {}",
        architecture.num_classes,
        architecture.image_size,
        path.display()
    );
    Ok(Classifier::new(
        backbone,
        head,
        architecture.image_size,
        device.clone(),
    ))
}
