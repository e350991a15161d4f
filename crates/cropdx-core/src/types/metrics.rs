/// Loss and accuracy accumulated over one or more batches.
///
/// Loss is stored as a sum over examples so that epoch means weight every
/// example equally, including the ones in a short final batch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatchMetrics {
    pub loss_sum: f64,
    pub correct: usize,
    pub count: usize,
}

impl BatchMetrics {
    /// Metrics for one batch given its mean loss.
    pub fn from_mean_loss(mean_loss: f64, correct: usize, count: usize) -> Self {
        Self {
            loss_sum: mean_loss * count as f64,
            correct,
            count,
        }
    }

    pub fn merge(&mut self, other: BatchMetrics) {
        self.loss_sum += other.loss_sum;
        self.correct += other.correct;
        self.count += other.count;
    }

    #[must_use]
    pub fn mean_loss(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.loss_sum / self.count as f64
        }
    }

    #[must_use]
    pub fn accuracy(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.correct as f64 / self.count as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn means_are_example_weighted() {
        let mut total = BatchMetrics::from_mean_loss(1.0, 3, 4);
        total.merge(BatchMetrics::from_mean_loss(4.0, 0, 1));
        assert_eq!(total.count, 5);
        assert!((total.mean_loss() - 1.6).abs() < 1e-9);
        assert!((total.accuracy() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn empty_metrics_are_zero() {
        let m = BatchMetrics::default();
        assert_eq!(m.mean_loss(), 0.0);
        assert_eq!(m.accuracy(), 0.0);
    }
}
