use std::fmt;
use std::path::PathBuf;

use super::class_map::ClassIndexMap;

/// One image file and the class it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LabeledImage {
    pub path: PathBuf,
    pub class_index: usize,
}

impl LabeledImage {
    pub fn new(path: impl Into<PathBuf>, class_index: usize) -> Self {
        Self {
            path: path.into(),
            class_index,
        }
    }
}

/// Every image found under a dataset root, labeled by its class directory.
///
/// Images are grouped by class index and, within a class, ordered by file name.
#[derive(Debug, Clone)]
pub struct LabeledImageSet {
    classes: ClassIndexMap,
    images: Vec<LabeledImage>,
    skipped: Vec<PathBuf>,
}

impl LabeledImageSet {
    pub fn new(classes: ClassIndexMap, images: Vec<LabeledImage>, skipped: Vec<PathBuf>) -> Self {
        Self {
            classes,
            images,
            skipped,
        }
    }

    pub fn classes(&self) -> &ClassIndexMap {
        &self.classes
    }

    pub fn images(&self) -> &[LabeledImage] {
        &self.images
    }

    /// Files that looked like images but could not be read.
    pub fn skipped(&self) -> &[PathBuf] {
        &self.skipped
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.images.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Number of images per class, indexed by class index.
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.classes.len()];
        for image in &self.images {
            counts[image.class_index] += 1;
        }
        counts
    }
}

/// Which side of the train/validation partition a split is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SplitKind {
    Train,
    Validation,
}

impl fmt::Display for SplitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Train => write!(f, "train"),
            Self::Validation => write!(f, "validation"),
        }
    }
}

/// One side of a train/validation partition.
#[derive(Debug, Clone)]
pub struct Split {
    pub kind: SplitKind,
    pub images: Vec<LabeledImage>,
}

impl Split {
    #[must_use]
    pub fn len(&self) -> usize {
        self.images.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}
