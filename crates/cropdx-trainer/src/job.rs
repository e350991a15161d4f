//! # Training Job
//!
//! The fit loop. Each epoch trains on every training batch, evaluates on every
//! validation batch, then runs the epoch-end controllers in order:
//! checkpoint on better validation accuracy, learning-rate decay on a
//! validation-loss plateau, early stop (with weight restore) on a longer one.

use std::path::{Path, PathBuf};

use cropdx_core::dataset::{Batch, BatchSource};
use cropdx_core::model::{CompiledClassifier, ParameterSnapshot};
use cropdx_core::{BatchMetrics, CropdxError, EpochRecord, Result, StopReason, TrainingHistory};
use tracing::{debug, info, warn};

use crate::callbacks::{
    BestCheckpoint, EarlyStopDecision, EarlyStopping, EarlyStoppingConfig, LrPlateau,
    LrPlateauConfig,
};

/// Anything the training job can step, evaluate, snapshot and checkpoint.
pub trait Learner {
    /// Saved copy of the trainable state.
    type Snapshot;

    /// One optimization step. Returns the batch's loss and accuracy.
    fn train_batch(&mut self, batch: &Batch) -> Result<BatchMetrics>;

    /// Loss and accuracy without updating anything.
    fn eval_batch(&self, batch: &Batch) -> Result<BatchMetrics>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    fn snapshot(&self) -> Result<Self::Snapshot>;

    fn restore(&mut self, snapshot: &Self::Snapshot) -> Result<()>;

    /// Persists the current model to `path`, replacing any previous file.
    fn save_checkpoint(&self, path: &Path) -> Result<()>;
}

impl Learner for CompiledClassifier {
    type Snapshot = ParameterSnapshot;

    fn train_batch(&mut self, batch: &Batch) -> Result<BatchMetrics> {
        self.train_step(batch)
    }

    fn eval_batch(&self, batch: &Batch) -> Result<BatchMetrics> {
        self.evaluate(batch)
    }

    fn learning_rate(&self) -> f64 {
        CompiledClassifier::learning_rate(self)
    }

    fn set_learning_rate(&mut self, lr: f64) {
        CompiledClassifier::set_learning_rate(self, lr);
    }

    fn snapshot(&self) -> Result<ParameterSnapshot> {
        CompiledClassifier::snapshot(self)
    }

    fn restore(&mut self, snapshot: &ParameterSnapshot) -> Result<()> {
        CompiledClassifier::restore(self, snapshot)
    }

    fn save_checkpoint(&self, path: &Path) -> Result<()> {
        self.save(path)
    }
}

/// Settings of one fit run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingJob {
    pub max_epochs: usize,
    /// Where the best-by-validation-accuracy model is written.
    pub checkpoint_path: PathBuf,
    pub early_stopping: EarlyStoppingConfig,
    pub lr_plateau: LrPlateauConfig,
}

/// Controller state carried across epochs.
struct Controls<S> {
    checkpoint: BestCheckpoint,
    lr_plateau: LrPlateau,
    early_stopping: EarlyStopping,
    best_snapshot: Option<(usize, S)>,
}

impl TrainingJob {
    pub fn new(max_epochs: usize, checkpoint_path: impl Into<PathBuf>) -> Self {
        Self {
            max_epochs,
            checkpoint_path: checkpoint_path.into(),
            early_stopping: EarlyStoppingConfig::default(),
            lr_plateau: LrPlateauConfig::default(),
        }
    }

    pub fn with_early_stopping(mut self, config: EarlyStoppingConfig) -> Self {
        self.early_stopping = config;
        self
    }

    pub fn with_lr_plateau(mut self, config: LrPlateauConfig) -> Self {
        self.lr_plateau = config;
        self
    }

    /// Runs the fit loop and returns the per-epoch history.
    ///
    /// Any failure inside an epoch aborts the run with
    /// [`CropdxError::Training`], which carries the history up to that point.
    pub fn run<L, T, V>(
        &self,
        learner: &mut L,
        train: &T,
        validation: &V,
    ) -> Result<TrainingHistory>
    where
        L: Learner,
        T: BatchSource + ?Sized,
        V: BatchSource + ?Sized,
    {
        let mut history = TrainingHistory::new();
        let mut controls = Controls {
            checkpoint: BestCheckpoint::default(),
            lr_plateau: LrPlateau::new(self.lr_plateau),
            early_stopping: EarlyStopping::new(self.early_stopping),
            best_snapshot: None,
        };

        info!(
            "Training for up to {} epochs ({} train / {} validation examples)",
            self.max_epochs,
            train.num_examples(),
            validation.num_examples()
        );

        for epoch in 1..=self.max_epochs {
            let stop = self
                .run_epoch(epoch, learner, train, validation, &mut controls, &mut history)
                .map_err(|source| CropdxError::Training {
                    epoch,
                    history: history.clone(),
                    source: Box::new(source),
                })?;
            if stop {
                history.stop_reason = Some(StopReason::EarlyStopped);
                return Ok(history);
            }
        }

        history.stop_reason = Some(StopReason::Completed);
        info!("Training completed after {} epochs", history.len());
        Ok(history)
    }

    /// One epoch plus the controllers. Returns `true` when training should stop.
    fn run_epoch<L, T, V>(
        &self,
        epoch: usize,
        learner: &mut L,
        train: &T,
        validation: &V,
        controls: &mut Controls<L::Snapshot>,
        history: &mut TrainingHistory,
    ) -> Result<bool>
    where
        L: Learner,
        T: BatchSource + ?Sized,
        V: BatchSource + ?Sized,
    {
        let learning_rate = learner.learning_rate();

        let mut train_metrics = BatchMetrics::default();
        for batch in train.batches(epoch - 1) {
            train_metrics.merge(learner.train_batch(&batch?)?);
        }
        if train_metrics.count == 0 {
            return Err(CropdxError::Configuration(
                "training split yielded no examples".into(),
            ));
        }

        let mut val_metrics = BatchMetrics::default();
        for batch in validation.batches(epoch - 1) {
            val_metrics.merge(learner.eval_batch(&batch?)?);
        }
        if val_metrics.count == 0 {
            return Err(CropdxError::Configuration(
                "validation split yielded no examples".into(),
            ));
        }

        let record = EpochRecord {
            epoch,
            train_loss: train_metrics.mean_loss(),
            train_accuracy: train_metrics.accuracy(),
            val_loss: val_metrics.mean_loss(),
            val_accuracy: val_metrics.accuracy(),
            learning_rate,
        };
        info!("Epoch {}/{} - {}", epoch, self.max_epochs, record);
        history.push(record.clone());

        if controls.checkpoint.should_save(record.val_accuracy) {
            learner.save_checkpoint(&self.checkpoint_path)?;
            info!(
                "val_accuracy improved to {:.4}, saved model to {}",
                record.val_accuracy,
                self.checkpoint_path.display()
            );
        } else {
            debug!(
                "val_accuracy {:.4} did not improve on {:.4}",
                record.val_accuracy,
                controls.checkpoint.best().unwrap_or(f64::NAN)
            );
        }

        if let Some(new_lr) = controls.lr_plateau.on_epoch_end(record.val_loss, learning_rate) {
            learner.set_learning_rate(new_lr);
            info!("Reducing learning rate from {:.2e} to {:.2e}", learning_rate, new_lr);
        }

        match controls.early_stopping.on_epoch_end(record.val_loss) {
            EarlyStopDecision::Improved => {
                controls.best_snapshot = Some((epoch, learner.snapshot()?));
            }
            EarlyStopDecision::Continue => {}
            EarlyStopDecision::Stop => {
                info!(
                    "Early stopping at epoch {}: val_loss has not improved for {} epochs",
                    epoch, self.early_stopping.patience
                );
                match &controls.best_snapshot {
                    Some((best_epoch, snapshot)) => {
                        learner.restore(snapshot)?;
                        info!("Restored weights from epoch {}", best_epoch);
                    }
                    None => warn!("No improving epoch recorded; keeping current weights"),
                }
                return Ok(true);
            }
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};
    use std::cell::RefCell;

    /// Learner whose validation metrics follow a script, one entry per epoch.
    /// Its "weights" are the number of the epoch that last trained them.
    struct ScriptedLearner {
        val_losses: Vec<f64>,
        val_accuracies: Vec<f64>,
        epochs_trained: usize,
        weights: usize,
        lr: f64,
        lr_per_epoch: Vec<f64>,
        checkpoints: RefCell<Vec<usize>>,
        restored: Option<usize>,
    }

    impl ScriptedLearner {
        fn new(val_losses: &[f64]) -> Self {
            Self::with_accuracies(val_losses, &vec![0.5; val_losses.len()])
        }

        fn with_accuracies(val_losses: &[f64], val_accuracies: &[f64]) -> Self {
            Self {
                val_losses: val_losses.to_vec(),
                val_accuracies: val_accuracies.to_vec(),
                epochs_trained: 0,
                weights: 0,
                lr: 1e-4,
                lr_per_epoch: Vec::new(),
                checkpoints: RefCell::new(Vec::new()),
                restored: None,
            }
        }
    }

    impl Learner for ScriptedLearner {
        type Snapshot = usize;

        fn train_batch(&mut self, batch: &Batch) -> Result<BatchMetrics> {
            self.epochs_trained += 1;
            self.weights = self.epochs_trained;
            self.lr_per_epoch.push(self.lr);
            Ok(BatchMetrics::from_mean_loss(1.0, 0, batch.len()))
        }

        fn eval_batch(&self, batch: &Batch) -> Result<BatchMetrics> {
            let i = self.epochs_trained - 1;
            let correct = (self.val_accuracies[i] * batch.len() as f64).round() as usize;
            Ok(BatchMetrics::from_mean_loss(
                self.val_losses[i],
                correct,
                batch.len(),
            ))
        }

        fn learning_rate(&self) -> f64 {
            self.lr
        }

        fn set_learning_rate(&mut self, lr: f64) {
            self.lr = lr;
        }

        fn snapshot(&self) -> Result<usize> {
            Ok(self.weights)
        }

        fn restore(&mut self, snapshot: &usize) -> Result<()> {
            self.weights = *snapshot;
            self.restored = Some(*snapshot);
            Ok(())
        }

        fn save_checkpoint(&self, _path: &Path) -> Result<()> {
            self.checkpoints.borrow_mut().push(self.weights);
            Ok(())
        }
    }

    /// One 10-example batch per epoch, optionally failing at a given epoch.
    struct ScriptedSource {
        fail_at_epoch: Option<usize>,
    }

    impl ScriptedSource {
        fn ok() -> Self {
            Self {
                fail_at_epoch: None,
            }
        }
    }

    impl BatchSource for ScriptedSource {
        fn num_examples(&self) -> usize {
            10
        }

        fn batches(&self, epoch: usize) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
            if self.fail_at_epoch == Some(epoch) {
                return Box::new(std::iter::once(Err(CropdxError::ImageDecode {
                    path: "leaf_07.jpg".into(),
                    message: "truncated".into(),
                })));
            }
            let images = Tensor::zeros((10, 1), candle_core::DType::F32, &Device::Cpu).unwrap();
            let labels = Tensor::zeros(10, candle_core::DType::U32, &Device::Cpu).unwrap();
            let sources = (0..10).map(|i| format!("{i}.jpg").into()).collect();
            Box::new(std::iter::once(Ok(Batch::new(images, labels, sources))))
        }
    }

    fn job(epochs: usize) -> TrainingJob {
        TrainingJob::new(epochs, "unused.safetensors")
    }

    #[test]
    fn long_plateau_stops_early_and_restores_best_weights() {
        let mut learner = ScriptedLearner::new(&[1.0, 0.8, 0.9, 0.85, 0.95, 0.7, 0.6]);
        let history = job(20)
            .run(&mut learner, &ScriptedSource::ok(), &ScriptedSource::ok())
            .unwrap();

        assert_eq!(history.len(), 5);
        assert_eq!(history.stop_reason, Some(StopReason::EarlyStopped));
        assert_eq!(learner.restored, Some(2));
        assert_eq!(learner.weights, 2);
        assert_eq!(history.best_by_val_loss().map(|r| r.epoch), Some(2));
    }

    #[test]
    fn two_epoch_plateau_reduces_lr_and_continues() {
        let mut learner = ScriptedLearner::new(&[1.0, 0.8, 0.8, 0.8, 0.5, 0.4]);
        let history = job(6)
            .run(&mut learner, &ScriptedSource::ok(), &ScriptedSource::ok())
            .unwrap();

        assert_eq!(history.len(), 6);
        assert_eq!(history.stop_reason, Some(StopReason::Completed));
        let lrs = history.learning_rates();
        assert!((lrs[3] - 1e-4).abs() < 1e-12);
        assert!((lrs[4] - 2e-5).abs() < 1e-12);
        assert!((lrs[5] - 2e-5).abs() < 1e-12);
        assert_eq!(learner.restored, None);
        assert_eq!(learner.lr_per_epoch, lrs);
    }

    #[test]
    fn first_epoch_always_checkpoints_then_only_on_strict_gain() {
        let mut learner = ScriptedLearner::with_accuracies(
            &[1.0, 0.9, 0.8, 0.7],
            &[0.0, 0.0, 0.6, 0.5],
        );
        job(4)
            .run(&mut learner, &ScriptedSource::ok(), &ScriptedSource::ok())
            .unwrap();
        assert_eq!(*learner.checkpoints.borrow(), vec![1, 3]);
    }

    #[test]
    fn learning_rate_is_floored() {
        let mut learner = ScriptedLearner::new(&[1.0; 20]);
        let job = job(20).with_early_stopping(EarlyStoppingConfig {
            patience: 100,
            min_delta: 0.0,
        });
        let history = job
            .run(&mut learner, &ScriptedSource::ok(), &ScriptedSource::ok())
            .unwrap();
        assert!(history.learning_rates().iter().all(|&lr| lr >= 1e-5));
        assert!((learner.lr - 1e-5).abs() < 1e-15);
    }

    #[test]
    fn failure_carries_epoch_and_history() {
        let mut learner = ScriptedLearner::new(&[1.0, 0.9, 0.8, 0.7]);
        let train = ScriptedSource {
            fail_at_epoch: Some(2),
        };
        let err = job(4)
            .run(&mut learner, &train, &ScriptedSource::ok())
            .unwrap_err();

        match err {
            CropdxError::Training {
                epoch,
                history,
                source,
            } => {
                assert_eq!(epoch, 3);
                assert_eq!(history.len(), 2);
                assert!(matches!(*source, CropdxError::ImageDecode { .. }));
            }
            other => panic!("expected training failure, got {other:?}"),
        }
    }

    #[test]
    fn empty_validation_is_a_training_failure() {
        struct Empty;
        impl BatchSource for Empty {
            fn num_examples(&self) -> usize {
                0
            }
            fn batches(&self, _: usize) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
                Box::new(std::iter::empty())
            }
        }

        let mut learner = ScriptedLearner::new(&[1.0]);
        let err = job(1)
            .run(&mut learner, &ScriptedSource::ok(), &Empty)
            .unwrap_err();
        assert!(matches!(err, CropdxError::Training { epoch: 1, .. }));
    }
}
