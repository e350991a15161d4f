//! Deterministic train/validation partitioning.
//!
//! Each class is shuffled on its own with a seeded generator. The validation
//! total is `round(N × validation_fraction)` over the whole set, shared out
//! to the classes by largest remainder, and each class gives its last
//! images to validation. The split is therefore stratified and reproducible
//! for a given directory and seed.

use oorandom::Rand64;

use crate::error::{CropdxError, Result};
use crate::types::{LabeledImage, LabeledImageSet, Split, SplitKind};

/// In-place Fisher-Yates shuffle driven by `rng`.
pub fn shuffle<T>(items: &mut [T], rng: &mut Rand64) {
    for i in (1..items.len()).rev() {
        let j = rng.rand_range(0..(i as u64 + 1)) as usize;
        items.swap(i, j);
    }
}

/// Generator for the epoch-`epoch` reshuffle of a stream seeded with `seed`.
pub fn epoch_rng(seed: u64, epoch: usize) -> Rand64 {
    Rand64::new((u128::from(seed) << 64) | epoch as u128)
}

/// Checks that a validation fraction leaves both sides non-trivial.
pub fn validate_fraction(validation_fraction: f64) -> Result<()> {
    if !(validation_fraction > 0.0 && validation_fraction < 1.0) {
        return Err(CropdxError::Configuration(format!(
            "validation fraction must be between 0 and 1 (exclusive), got {validation_fraction}"
        )));
    }
    Ok(())
}

/// Shares `round(total × fraction)` validation slots across classes of the
/// given sizes. Each class gets the floor of its exact share; leftover slots
/// go to the largest fractional parts, lower class index first on ties.
pub fn allocate_validation(class_sizes: &[usize], validation_fraction: f64) -> Vec<usize> {
    let total: usize = class_sizes.iter().sum();
    let target = ((total as f64) * validation_fraction).round() as usize;

    let exact: Vec<f64> = class_sizes
        .iter()
        .map(|&n| n as f64 * validation_fraction)
        .collect();
    let mut counts: Vec<usize> = exact
        .iter()
        .zip(class_sizes)
        .map(|(&share, &n)| (share.floor() as usize).min(n))
        .collect();

    let mut order: Vec<usize> = (0..class_sizes.len()).collect();
    order.sort_by(|&a, &b| {
        let ra = exact[a] - exact[a].floor();
        let rb = exact[b] - exact[b].floor();
        rb.total_cmp(&ra).then(a.cmp(&b))
    });

    let mut remaining = target.saturating_sub(counts.iter().sum());
    for class in order.into_iter().cycle().take(class_sizes.len() * 2) {
        if remaining == 0 {
            break;
        }
        if counts[class] < class_sizes[class] {
            counts[class] += 1;
            remaining -= 1;
        }
    }
    counts
}

/// Splits `set` into (train, validation).
pub fn split_dataset(
    set: &LabeledImageSet,
    validation_fraction: f64,
    seed: u64,
) -> Result<(Split, Split)> {
    validate_fraction(validation_fraction)?;

    let mut per_class: Vec<Vec<LabeledImage>> = vec![Vec::new(); set.classes().len()];
    for image in set.images() {
        per_class[image.class_index].push(image.clone());
    }

    let sizes: Vec<usize> = per_class.iter().map(Vec::len).collect();
    let val_counts = allocate_validation(&sizes, validation_fraction);

    let mut rng = Rand64::new(u128::from(seed));
    let mut train = Vec::with_capacity(set.len());
    let mut validation = Vec::new();

    for (mut images, val_count) in per_class.into_iter().zip(val_counts) {
        shuffle(&mut images, &mut rng);
        let cut = images.len() - val_count.min(images.len());
        validation.extend(images.drain(cut..));
        train.extend(images);
    }

    Ok((
        Split {
            kind: SplitKind::Train,
            images: train,
        },
        Split {
            kind: SplitKind::Validation,
            images: validation,
        },
    ))
}
