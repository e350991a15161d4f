//! Lazy, restartable batch streams with optional background prefetch.

use std::path::PathBuf;
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;

use candle_core::{Device, Tensor};
use rayon::prelude::*;

use super::preprocess::ImagePreprocessor;
use super::split::{epoch_rng, shuffle};
use crate::error::Result;
use crate::types::{LabeledImage, Split, SplitKind};

/// A group of preprocessed images and their class indices.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `f32` tensor of shape `[B, 3, S, S]`.
    pub images: Tensor,
    /// `u32` tensor of shape `[B]`.
    pub labels: Tensor,
    /// Source file of each example, in batch order.
    pub sources: Vec<PathBuf>,
}

impl Batch {
    pub fn new(images: Tensor, labels: Tensor, sources: Vec<PathBuf>) -> Self {
        Self {
            images,
            labels,
            sources,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Anything that can produce one epoch's worth of batches on demand.
pub trait BatchSource {
    /// Total examples yielded per epoch.
    fn num_examples(&self) -> usize;

    /// Batches for `epoch` (0-based). Calling again restarts the pass.
    fn batches(&self, epoch: usize) -> Box<dyn Iterator<Item = Result<Batch>> + '_>;
}

/// Batches drawn from one [`Split`].
///
/// Training streams reshuffle at every epoch with a generator derived from
/// `(seed, epoch)`; validation streams keep their order. The order is fixed
/// before any decoding starts, so prefetching never changes batch content.
#[derive(Debug, Clone)]
pub struct BatchStream {
    kind: SplitKind,
    samples: Arc<[LabeledImage]>,
    preprocessor: Arc<ImagePreprocessor>,
    batch_size: usize,
    shuffle_seed: Option<u64>,
    prefetch: usize,
    device: Device,
}

impl BatchStream {
    pub fn new(
        split: Split,
        preprocessor: Arc<ImagePreprocessor>,
        batch_size: usize,
        device: Device,
    ) -> Self {
        Self {
            kind: split.kind,
            samples: split.images.into(),
            preprocessor,
            batch_size: batch_size.max(1),
            shuffle_seed: None,
            prefetch: 0,
            device,
        }
    }

    /// Reshuffle at the start of every epoch.
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }

    /// Prepare up to `depth` batches ahead on a background thread (0 disables).
    pub fn with_prefetch(mut self, depth: usize) -> Self {
        self.prefetch = depth;
        self
    }

    pub fn kind(&self) -> SplitKind {
        self.kind
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn samples(&self) -> &[LabeledImage] {
        &self.samples
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Batches per epoch; the last one may be short.
    pub fn num_batches(&self) -> usize {
        self.samples.len().div_ceil(self.batch_size)
    }

    /// Sample indices in the order they are visited during `epoch`.
    pub fn epoch_order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.samples.len()).collect();
        if let Some(seed) = self.shuffle_seed {
            shuffle(&mut order, &mut epoch_rng(seed, epoch));
        }
        order
    }

    /// Iterator over the batches of `epoch`.
    pub fn iter_epoch(&self, epoch: usize) -> EpochBatches {
        let order = self.epoch_order(epoch);
        let assembler = Assembler {
            samples: Arc::clone(&self.samples),
            preprocessor: Arc::clone(&self.preprocessor),
            device: self.device.clone(),
        };

        if self.prefetch == 0 {
            return EpochBatches {
                inner: Producer::Inline {
                    assembler,
                    order,
                    batch_size: self.batch_size,
                    cursor: 0,
                },
            };
        }

        let (tx, rx) = sync_channel(self.prefetch);
        let batch_size = self.batch_size;
        let worker = std::thread::spawn(move || {
            for chunk in order.chunks(batch_size) {
                let batch = assembler.assemble(chunk);
                let failed = batch.is_err();
                if tx.send(batch).is_err() || failed {
                    break;
                }
            }
        });
        EpochBatches {
            inner: Producer::Prefetched {
                rx: Some(rx),
                worker: Some(worker),
            },
        }
    }
}

impl BatchSource for BatchStream {
    fn num_examples(&self) -> usize {
        self.len()
    }

    fn batches(&self, epoch: usize) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        Box::new(self.iter_epoch(epoch))
    }
}

/// Decodes a list of sample indices into a [`Batch`].
#[derive(Debug, Clone)]
struct Assembler {
    samples: Arc<[LabeledImage]>,
    preprocessor: Arc<ImagePreprocessor>,
    device: Device,
}

impl Assembler {
    fn assemble(&self, indices: &[usize]) -> Result<Batch> {
        let picked: Vec<&LabeledImage> = indices.iter().map(|&i| &self.samples[i]).collect();
        let pixels = picked
            .par_iter()
            .map(|sample| self.preprocessor.load(&sample.path))
            .collect::<Result<Vec<_>>>()?;

        let n = picked.len();
        let side = self.preprocessor.image_size();
        let mut data = Vec::with_capacity(n * self.preprocessor.values_per_image());
        for image in pixels {
            data.extend_from_slice(&image);
        }

        let images = Tensor::from_vec(data, (n, 3, side, side), &self.device)?;
        let labels: Vec<u32> = picked.iter().map(|s| s.class_index as u32).collect();
        let labels = Tensor::from_vec(labels, n, &self.device)?;
        let sources = picked.iter().map(|s| s.path.clone()).collect();
        Ok(Batch::new(images, labels, sources))
    }
}

/// One epoch's batches, produced in place or by a prefetch thread.
pub struct EpochBatches {
    inner: Producer,
}

enum Producer {
    Inline {
        assembler: Assembler,
        order: Vec<usize>,
        batch_size: usize,
        cursor: usize,
    },
    Prefetched {
        rx: Option<Receiver<Result<Batch>>>,
        worker: Option<JoinHandle<()>>,
    },
}

impl Iterator for EpochBatches {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            Producer::Inline {
                assembler,
                order,
                batch_size,
                cursor,
            } => {
                if *cursor >= order.len() {
                    return None;
                }
                let end = (*cursor + *batch_size).min(order.len());
                let batch = assembler.assemble(&order[*cursor..end]);
                // A failed batch ends the pass.
                *cursor = if batch.is_ok() { end } else { order.len() };
                Some(batch)
            }
            Producer::Prefetched { rx, .. } => rx.as_ref()?.recv().ok(),
        }
    }
}

impl Drop for EpochBatches {
    fn drop(&mut self) {
        if let Producer::Prefetched { rx, worker } = &mut self.inner {
            // Closing the channel first unblocks a worker waiting on a full queue.
            drop(rx.take());
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::preprocess::Normalization;
    use image::{Rgb, RgbImage};
    use std::collections::HashSet;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_images(dir: &Path, count: usize) -> Vec<LabeledImage> {
        (0..count)
            .map(|i| {
                let path = dir.join(format!("leaf_{i:02}.png"));
                RgbImage::from_pixel(6, 4, Rgb([i as u8 * 10, 80, 20]))
                    .save(&path)
                    .unwrap();
                LabeledImage::new(path, i % 3)
            })
            .collect()
    }

    fn stream(images: Vec<LabeledImage>, batch_size: usize) -> BatchStream {
        let split = Split {
            kind: SplitKind::Train,
            images,
        };
        let pre = Arc::new(ImagePreprocessor::new(4, Normalization::default()).unwrap());
        BatchStream::new(split, pre, batch_size, Device::Cpu)
    }

    #[test]
    fn batches_are_full_except_the_last() {
        let dir = TempDir::new().unwrap();
        let s = stream(write_images(dir.path(), 10), 4).with_shuffle(123);
        assert_eq!(s.num_batches(), 3);

        let sizes: Vec<usize> = s.iter_epoch(0).map(|b| b.unwrap().len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);

        let first = s.iter_epoch(0).next().unwrap().unwrap();
        assert_eq!(first.images.dims(), &[4, 3, 4, 4]);
        assert_eq!(first.labels.dims(), &[4]);
    }

    #[test]
    fn every_example_appears_once_per_epoch() {
        let dir = TempDir::new().unwrap();
        let images = write_images(dir.path(), 11);
        let expected: HashSet<PathBuf> = images.iter().map(|i| i.path.clone()).collect();
        let s = stream(images, 4).with_shuffle(9);

        for epoch in 0..3 {
            let seen: Vec<PathBuf> = s
                .iter_epoch(epoch)
                .flat_map(|b| b.unwrap().sources)
                .collect();
            assert_eq!(seen.len(), expected.len());
            assert_eq!(seen.into_iter().collect::<HashSet<_>>(), expected);
        }
    }

    #[test]
    fn training_order_changes_between_epochs_only() {
        let dir = TempDir::new().unwrap();
        let s = stream(write_images(dir.path(), 12), 4).with_shuffle(1);
        assert_eq!(s.epoch_order(2), s.epoch_order(2));
        assert_ne!(s.epoch_order(0), s.epoch_order(1));
    }

    #[test]
    fn unshuffled_stream_keeps_split_order() {
        let dir = TempDir::new().unwrap();
        let images = write_images(dir.path(), 5);
        let s = stream(images.clone(), 2);
        let seen: Vec<PathBuf> = s.iter_epoch(4).flat_map(|b| b.unwrap().sources).collect();
        let expected: Vec<PathBuf> = images.into_iter().map(|i| i.path).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn prefetch_yields_identical_batches() {
        let dir = TempDir::new().unwrap();
        let images = write_images(dir.path(), 9);
        let plain = stream(images.clone(), 4).with_shuffle(77);
        let prefetched = stream(images, 4).with_shuffle(77).with_prefetch(2);

        for (a, b) in plain.iter_epoch(3).zip(prefetched.iter_epoch(3)) {
            let (a, b) = (a.unwrap(), b.unwrap());
            assert_eq!(a.sources, b.sources);
            let a_px: Vec<f32> = a.images.flatten_all().unwrap().to_vec1().unwrap();
            let b_px: Vec<f32> = b.images.flatten_all().unwrap().to_vec1().unwrap();
            assert_eq!(a_px, b_px);
            let a_lb: Vec<u32> = a.labels.to_vec1().unwrap();
            let b_lb: Vec<u32> = b.labels.to_vec1().unwrap();
            assert_eq!(a_lb, b_lb);
        }
    }

    #[test]
    fn dropping_a_prefetched_epoch_early_does_not_hang() {
        let dir = TempDir::new().unwrap();
        let s = stream(write_images(dir.path(), 12), 2).with_prefetch(1);
        let mut batches = s.iter_epoch(0);
        assert!(batches.next().is_some());
        drop(batches);
    }

    #[test]
    fn decode_failure_ends_the_pass() {
        let dir = TempDir::new().unwrap();
        let mut images = write_images(dir.path(), 4);
        let broken = dir.path().join("broken.png");
        std::fs::write(&broken, b"not a png").unwrap();
        images.insert(0, LabeledImage::new(broken, 0));

        for depth in [0, 2] {
            let s = stream(images.clone(), 2).with_prefetch(depth);
            let results: Vec<_> = s.iter_epoch(0).collect();
            assert_eq!(results.len(), 1);
            assert!(results[0].is_err());
        }
    }
}
