//! Threshold adaptation from confirmed feedback.
//!
//! The threshold τ is the maximum effective distance at which a proposal
//! still populates a cell. It starts at a global default and is recomputed
//! after every feedback round from the recorded distances of confirmed
//! positives and negatives.

use tracing::debug;

/// Recomputes the admissible distance threshold after each feedback round.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdAdaptor {
    default: f64,
}

impl ThresholdAdaptor {
    /// Create an adaptor with the given default threshold, used whenever
    /// either feedback class is still empty.
    pub fn new(default: f64) -> Self {
        Self { default }
    }

    /// The default threshold.
    pub fn default_threshold(&self) -> f64 {
        self.default
    }

    /// Recompute τ from the recorded positive and negative distances.
    ///
    /// With either class empty, τ is the default. With the classes
    /// separated (`max(d_P) < min(d_N)`), τ is their midpoint. With
    /// overlapping classes, τ is chosen from the sorted union of all
    /// recorded distances to maximize `|{p: d_p <= τ}| − |{n: d_n <= τ}|`,
    /// ties resolved toward the smaller τ (precision over recall).
    pub fn recompute(&self, positives: &[f64], negatives: &[f64]) -> f64 {
        if positives.is_empty() || negatives.is_empty() {
            return self.default;
        }

        let max_p = positives.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min_n = negatives.iter().copied().fold(f64::INFINITY, f64::min);
        if max_p < min_n {
            let tau = (max_p + min_n) / 2.0;
            debug!(tau, "threshold from separated classes");
            return tau;
        }

        let mut candidates: Vec<f64> =
            positives.iter().chain(negatives.iter()).copied().collect();
        candidates.sort_by(f64::total_cmp);
        candidates.dedup();

        let mut best_tau = candidates[0];
        let mut best_score = i64::MIN;
        for &tau in &candidates {
            let covered = positives.iter().filter(|d| **d <= tau).count() as i64;
            let admitted = negatives.iter().filter(|d| **d <= tau).count() as i64;
            let score = covered - admitted;
            // Strict improvement only, so ties keep the smaller candidate.
            if score > best_score {
                best_score = score;
                best_tau = tau;
            }
        }
        debug!(tau = best_tau, "threshold from overlapping classes");
        best_tau
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT: f64 = 0.35;

    #[test]
    fn default_while_either_class_is_empty() {
        let adaptor = ThresholdAdaptor::new(DEFAULT);
        assert_eq!(adaptor.recompute(&[], &[]), DEFAULT);
        assert_eq!(adaptor.recompute(&[0.0], &[]), DEFAULT);
        assert_eq!(adaptor.recompute(&[], &[0.85]), DEFAULT);
    }

    #[test]
    fn separated_classes_take_the_midpoint() {
        let adaptor = ThresholdAdaptor::new(DEFAULT);
        let tau = adaptor.recompute(&[0.0, 0.1], &[0.5, 0.9]);
        assert!((tau - 0.3).abs() < 1e-9);
        assert!(tau >= 0.1 && tau <= 0.5);
    }

    #[test]
    fn overlapping_classes_maximize_the_margin() {
        let adaptor = ThresholdAdaptor::new(DEFAULT);
        // Positives at 0.1, 0.2, 0.6; negatives at 0.3, 0.9.
        // τ=0.2 covers 2 positives, 0 negatives (score 2) and beats
        // τ=0.6 (3 positives, 1 negative, score 2 as well) on the tie.
        let tau = adaptor.recompute(&[0.1, 0.2, 0.6], &[0.3, 0.9]);
        assert_eq!(tau, 0.2);
    }

    #[test]
    fn ties_resolve_toward_the_smaller_threshold() {
        let adaptor = ThresholdAdaptor::new(DEFAULT);
        // The single candidate scores 0 either way and wins by default.
        let tau = adaptor.recompute(&[0.4], &[0.4]);
        assert_eq!(tau, 0.4);
        // 0.2 scores -1, 0.5 scores 0: the larger candidate genuinely wins.
        let tau = adaptor.recompute(&[0.5], &[0.2]);
        assert_eq!(tau, 0.5);
    }
}
