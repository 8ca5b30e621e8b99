//! Configuration for the interactive matching stages.

use serde::{Deserialize, Serialize};

use crate::error::{MatchError, Result};

/// Parameters of the feedback loop and cell decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Default distance threshold, used until both confirmed positives and
    /// confirmed negatives exist.
    pub default_max_distance: f64,
    /// Maximum number of feedback rounds per attribute.
    pub max_feedback: usize,
    /// Number of candidates offered per request. 1 asks a plain
    /// confirm-or-reject question; larger values send a shortlist of the
    /// document's best nuggets.
    pub shortlist_len: usize,
    /// Ask about a seeded-random unconfirmed document every n-th round
    /// instead of the best one. 0 disables exploration.
    pub explore_every: usize,
    /// Whether to adapt the threshold from feedback. When false the default
    /// threshold is used throughout.
    pub adjust_threshold: bool,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            default_max_distance: 0.35,
            max_feedback: 25,
            shortlist_len: 1,
            explore_every: 0,
            adjust_threshold: true,
        }
    }
}

impl MatcherConfig {
    /// Create a new builder for constructing a [`MatcherConfig`].
    pub fn builder() -> MatcherConfigBuilder {
        MatcherConfigBuilder::default()
    }

    /// Check that the parameters are consistent.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::Config`] if `default_max_distance` is outside
    /// `[0, 2]` or `shortlist_len` is zero.
    pub fn validate(&self) -> Result<()> {
        let threshold = self.default_max_distance;
        if !threshold.is_finite() || !(0.0..=2.0).contains(&threshold) {
            return Err(MatchError::Config(format!(
                "default_max_distance ({threshold}) must lie in [0, 2]"
            )));
        }
        if self.shortlist_len == 0 {
            return Err(MatchError::Config("shortlist_len must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Builder for constructing a validated [`MatcherConfig`].
#[derive(Debug, Clone, Default)]
pub struct MatcherConfigBuilder {
    config: MatcherConfig,
}

impl MatcherConfigBuilder {
    /// Set the default distance threshold.
    pub fn default_max_distance(mut self, threshold: f64) -> Self {
        self.config.default_max_distance = threshold;
        self
    }

    /// Set the feedback budget per attribute.
    pub fn max_feedback(mut self, rounds: usize) -> Self {
        self.config.max_feedback = rounds;
        self
    }

    /// Set the number of candidates offered per request.
    pub fn shortlist_len(mut self, len: usize) -> Self {
        self.config.shortlist_len = len;
        self
    }

    /// Ask about a random unconfirmed document every n-th round.
    pub fn explore_every(mut self, every: usize) -> Self {
        self.config.explore_every = every;
        self
    }

    /// Enable or disable threshold adaptation.
    pub fn adjust_threshold(mut self, adjust: bool) -> Self {
        self.config.adjust_threshold = adjust;
        self
    }

    /// Build the [`MatcherConfig`], validating that parameters are
    /// consistent.
    ///
    /// # Errors
    ///
    /// See [`MatcherConfig::validate`].
    pub fn build(self) -> Result<MatcherConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = MatcherConfig::builder().build().unwrap();
        assert_eq!(config, MatcherConfig::default());
        assert_eq!(config.default_max_distance, 0.35);
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        assert!(MatcherConfig::builder().default_max_distance(2.5).build().is_err());
        assert!(MatcherConfig::builder().default_max_distance(f64::NAN).build().is_err());
    }

    #[test]
    fn zero_shortlist_is_rejected() {
        assert!(MatcherConfig::builder().shortlist_len(0).build().is_err());
    }
}
