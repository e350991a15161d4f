//! Class and image discovery from a `root/<class_name>/<images>` layout.

use std::fs;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::error::{CropdxError, Result};
use crate::types::{ClassIndexMap, LabeledImage, LabeledImageSet};

/// File extensions treated as images (compared case-insensitively).
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "gif"];

/// Returns `true` if the path has one of [`IMAGE_EXTENSIONS`].
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Lists the class directories under `root`, sorted by name.
///
/// The sorted position of a directory is its class index. Sorting pins the
/// mapping independently of the platform's directory listing order.
pub fn discover_classes(root: &Path) -> Result<Vec<String>> {
    if !root.exists() {
        return Err(CropdxError::Configuration(format!(
            "data directory '{}' not found",
            root.display()
        )));
    }
    if !root.is_dir() {
        return Err(CropdxError::Configuration(format!(
            "data path '{}' is not a directory",
            root.display()
        )));
    }

    let mut classes: Vec<String> = fs::read_dir(root)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| !name.starts_with('.'))
        .collect();
    classes.sort();

    if classes.is_empty() {
        return Err(CropdxError::Configuration(format!(
            "no class folders found in '{}'; add one subfolder per crop/disease",
            root.display()
        )));
    }
    Ok(classes)
}

/// Scans `root` into a [`LabeledImageSet`].
///
/// Each candidate file's header is probed; files that cannot be identified as
/// an image are skipped with a warning rather than failing the whole dataset.
pub fn scan_dataset(root: &Path) -> Result<LabeledImageSet> {
    let classes = discover_classes(root)?;
    let mut images = Vec::new();
    let mut skipped = Vec::new();

    for (class_index, class_name) in classes.iter().enumerate() {
        let mut files: Vec<PathBuf> = fs::read_dir(root.join(class_name))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_image_file(path))
            .collect();
        files.sort();

        let probed: Vec<(PathBuf, std::result::Result<(), String>)> = files
            .into_par_iter()
            .map(|path| {
                let status = probe(&path);
                (path, status)
            })
            .collect();

        let before = images.len();
        for (path, status) in probed {
            match status {
                Ok(()) => images.push(LabeledImage::new(path, class_index)),
                Err(reason) => {
                    warn!("Skipping unreadable image {}: {}", path.display(), reason);
                    skipped.push(path);
                }
            }
        }

        let found = images.len() - before;
        if found == 0 {
            warn!("Class '{}' has no readable images", class_name);
        }
        debug!("Class {}: {} ({} images)", class_index, class_name, found);
    }

    Ok(LabeledImageSet::new(
        ClassIndexMap::new(classes),
        images,
        skipped,
    ))
}

/// Reads just enough of the file to learn its format and dimensions.
fn probe(path: &Path) -> std::result::Result<(), String> {
    let (width, height) = image::ImageReader::open(path)
        .map_err(|e| e.to_string())?
        .with_guessed_format()
        .map_err(|e| e.to_string())?
        .into_dimensions()
        .map_err(|e| e.to_string())?;
    if width == 0 || height == 0 {
        return Err(format!("empty image ({width}x{height})"));
    }
    Ok(())
}
