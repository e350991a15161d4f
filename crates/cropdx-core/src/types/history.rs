use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::io::write_atomic;

/// Metrics collected at the end of one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// 1-based epoch number.
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    /// Learning rate the epoch was trained with.
    pub learning_rate: f64,
}

impl fmt::Display for EpochRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "epoch {}: loss={:.4} acc={:.2}% val_loss={:.4} val_acc={:.2}% lr={:.2e}",
            self.epoch,
            self.train_loss,
            self.train_accuracy * 100.0,
            self.val_loss,
            self.val_accuracy * 100.0,
            self.learning_rate
        )
    }
}

/// Why the fit loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Ran for the full epoch budget.
    Completed,
    /// Validation loss stopped improving.
    EarlyStopped,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::EarlyStopped => write!(f, "early stopped"),
        }
    }
}

/// Per-epoch training history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochRecord>,
    /// `None` while training is still running or after a failure.
    pub stop_reason: Option<StopReason>,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: EpochRecord) {
        self.epochs.push(record);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn last(&self) -> Option<&EpochRecord> {
        self.epochs.last()
    }

    /// First epoch with the lowest validation loss.
    pub fn best_by_val_loss(&self) -> Option<&EpochRecord> {
        self.epochs.iter().fold(None, |best, r| match best {
            Some(b) if b.val_loss <= r.val_loss => Some(b),
            _ => Some(r),
        })
    }

    /// First epoch with the highest validation accuracy.
    pub fn best_by_val_accuracy(&self) -> Option<&EpochRecord> {
        self.epochs.iter().fold(None, |best, r| match best {
            Some(b) if b.val_accuracy >= r.val_accuracy => Some(b),
            _ => Some(r),
        })
    }

    /// Learning rate of every recorded epoch, in order.
    pub fn learning_rates(&self) -> Vec<f64> {
        self.epochs.iter().map(|r| r.learning_rate).collect()
    }

    /// Atomically writes the history as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, serde_json::to_string_pretty(self)?.as_bytes())
    }
}
