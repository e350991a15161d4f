//! Epoch-end controllers: checkpointing, learning-rate decay, early stopping.
//!
//! Each controller sees one scalar per epoch and keeps its own counter; none
//! of them resets another's.

use serde::{Deserialize, Serialize};

/// Direction in which a monitored metric improves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Min,
    Max,
}

/// Remembers the best value of a metric and how long ago it was seen.
#[derive(Debug, Clone)]
pub struct PlateauTracker {
    mode: Mode,
    min_delta: f64,
    best: Option<f64>,
    wait: usize,
}

impl PlateauTracker {
    pub fn new(mode: Mode, min_delta: f64) -> Self {
        Self {
            mode,
            min_delta: min_delta.abs(),
            best: None,
            wait: 0,
        }
    }

    /// Feeds one epoch's value. Returns `true` if it is a new best.
    pub fn update(&mut self, value: f64) -> bool {
        if self.is_improvement(value) {
            self.best = Some(value);
            self.wait = 0;
            true
        } else {
            self.wait += 1;
            false
        }
    }

    fn is_improvement(&self, value: f64) -> bool {
        match (self.best, self.mode) {
            _ if value.is_nan() => false,
            (None, _) => true,
            (Some(best), Mode::Min) => value < best - self.min_delta,
            (Some(best), Mode::Max) => value > best + self.min_delta,
        }
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    /// Epochs since the last improvement.
    pub fn wait(&self) -> usize {
        self.wait
    }

    pub fn reset_wait(&mut self) {
        self.wait = 0;
    }
}

/// Early stopping on validation loss.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EarlyStoppingConfig {
    pub patience: usize,
    pub min_delta: f64,
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        Self {
            patience: 3,
            min_delta: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EarlyStopDecision {
    /// New best validation loss; the caller should snapshot the weights.
    Improved,
    Continue,
    Stop,
}

#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    tracker: PlateauTracker,
}

impl EarlyStopping {
    pub fn new(config: EarlyStoppingConfig) -> Self {
        Self {
            patience: config.patience,
            tracker: PlateauTracker::new(Mode::Min, config.min_delta),
        }
    }

    pub fn on_epoch_end(&mut self, val_loss: f64) -> EarlyStopDecision {
        if self.tracker.update(val_loss) {
            EarlyStopDecision::Improved
        } else if self.tracker.wait() >= self.patience {
            EarlyStopDecision::Stop
        } else {
            EarlyStopDecision::Continue
        }
    }

    pub fn best(&self) -> Option<f64> {
        self.tracker.best()
    }
}

/// Learning-rate decay when validation loss plateaus.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LrPlateauConfig {
    pub patience: usize,
    pub factor: f64,
    pub min_lr: f64,
    pub min_delta: f64,
}

impl Default for LrPlateauConfig {
    fn default() -> Self {
        Self {
            patience: 2,
            factor: 0.2,
            min_lr: 1e-5,
            min_delta: 1e-4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LrPlateau {
    config: LrPlateauConfig,
    tracker: PlateauTracker,
}

impl LrPlateau {
    pub fn new(config: LrPlateauConfig) -> Self {
        Self {
            config,
            tracker: PlateauTracker::new(Mode::Min, config.min_delta),
        }
    }

    /// Returns the new learning rate if this epoch triggers a reduction.
    pub fn on_epoch_end(&mut self, val_loss: f64, current_lr: f64) -> Option<f64> {
        if self.tracker.update(val_loss) || self.tracker.wait() < self.config.patience {
            return None;
        }
        // At the floor the counter keeps running but nothing changes.
        if current_lr <= self.config.min_lr {
            return None;
        }
        self.tracker.reset_wait();
        Some((current_lr * self.config.factor).max(self.config.min_lr))
    }
}

/// Save-best-only checkpoint policy on validation accuracy.
#[derive(Debug, Clone)]
pub struct BestCheckpoint {
    tracker: PlateauTracker,
}

impl Default for BestCheckpoint {
    fn default() -> Self {
        Self {
            tracker: PlateauTracker::new(Mode::Max, 0.0),
        }
    }
}

impl BestCheckpoint {
    /// `true` when `val_accuracy` strictly beats every previous epoch.
    pub fn should_save(&mut self, val_accuracy: f64) -> bool {
        self.tracker.update(val_accuracy)
    }

    pub fn best(&self) -> Option<f64> {
        self.tracker.best()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn early_stop_after_patience_non_improving_epochs() {
        let mut es = EarlyStopping::new(EarlyStoppingConfig::default());
        assert_eq!(es.on_epoch_end(1.0), EarlyStopDecision::Improved);
        assert_eq!(es.on_epoch_end(1.0), EarlyStopDecision::Continue);
        assert_eq!(es.on_epoch_end(1.2), EarlyStopDecision::Continue);
        assert_eq!(es.on_epoch_end(1.1), EarlyStopDecision::Stop);
        assert_eq!(es.best(), Some(1.0));
    }

    #[test]
    fn improvement_resets_early_stop_counter() {
        let mut es = EarlyStopping::new(EarlyStoppingConfig::default());
        es.on_epoch_end(1.0);
        es.on_epoch_end(1.1);
        es.on_epoch_end(1.1);
        assert_eq!(es.on_epoch_end(0.9), EarlyStopDecision::Improved);
        assert_eq!(es.on_epoch_end(0.95), EarlyStopDecision::Continue);
    }

    #[test]
    fn lr_reduced_after_two_flat_epochs_then_counter_resets() {
        let mut lr = LrPlateau::new(LrPlateauConfig::default());
        assert_eq!(lr.on_epoch_end(1.0, 1e-4), None);
        assert_eq!(lr.on_epoch_end(1.0, 1e-4), None);
        let reduced = lr.on_epoch_end(1.0, 1e-4).unwrap();
        assert!((reduced - 2e-5).abs() < 1e-12);
        assert_eq!(lr.on_epoch_end(1.0, reduced), None);
        let floored = lr.on_epoch_end(1.0, reduced).unwrap();
        assert!((floored - 1e-5).abs() < 1e-12);
    }

    #[test]
    fn lr_ignores_tiny_improvements() {
        let mut lr = LrPlateau::new(LrPlateauConfig::default());
        lr.on_epoch_end(1.0, 1e-3);
        lr.on_epoch_end(0.99995, 1e-3);
        assert!(lr.on_epoch_end(0.99992, 1e-3).is_some());
    }

    #[test]
    fn lr_never_goes_below_floor() {
        let mut lr = LrPlateau::new(LrPlateauConfig::default());
        let mut current = 1e-4;
        lr.on_epoch_end(1.0, current);
        for _ in 0..20 {
            if let Some(next) = lr.on_epoch_end(1.0, current) {
                current = next;
            }
            assert!(current >= 1e-5);
        }
        assert!((current - 1e-5).abs() < 1e-15);
    }

    #[test]
    fn checkpoint_requires_strict_improvement() {
        let mut ckpt = BestCheckpoint::default();
        assert!(ckpt.should_save(0.0));
        assert!(!ckpt.should_save(0.0));
        assert!(ckpt.should_save(0.5));
        assert!(!ckpt.should_save(0.4));
        assert!(!ckpt.should_save(f64::NAN));
        assert_eq!(ckpt.best(), Some(0.5));
    }
}
