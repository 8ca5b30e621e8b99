//! Distance functions between nuggets and attributes.
//!
//! A [`Distance`] scores a pair of signal maps; the ranking code combines
//! pairwise scores into the effective distance that drives every cell
//! decision: the minimum of the distance to the attribute label and the
//! distance to the nearest confirmed positive.

use tabula_core::signals::{ids, SignalMap};
use tabula_core::CoreError;

use crate::error::{MatchError, Result};

/// Cosine distance `1 − u·v/(‖u‖‖v‖)`, clamped to `[0, 2]`.
///
/// Zero-magnitude inputs have no direction; the distance is defined as 1.
///
/// # Errors
///
/// Returns an error if the vectors have different lengths.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> Result<f64> {
    if a.len() != b.len() {
        return Err(MatchError::Core(CoreError::ConsistencyViolation(format!(
            "embedding dimensions differ: {} vs {}",
            a.len(),
            b.len()
        ))));
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(1.0);
    }
    Ok((1.0 - dot / (norm_a * norm_b)).clamp(0.0, 2.0))
}

/// Pairwise distance over the signals of two entities.
///
/// Implementations may be applied to nugget/nugget, nugget/attribute, or
/// attribute/attribute pairs; only the signal maps matter.
pub trait Distance: Send + Sync {
    /// Stable identifier used in configuration.
    fn identifier(&self) -> &'static str;

    /// Distance between two entities, `>= 0`, 0 meaning identical.
    fn between(&self, x: &SignalMap, y: &SignalMap) -> Result<f64>;
}

/// Effective distance of a nugget to an attribute given the confirmed
/// positives: `min(d_label, min over P of d_P)`, or `d_label` alone while no
/// positive has been confirmed yet.
pub fn effective_distance(
    distance: &dyn Distance,
    nugget: &SignalMap,
    attribute: &SignalMap,
    positives: &[SignalMap],
) -> Result<f64> {
    let mut best = distance.between(nugget, attribute)?;
    for positive in positives {
        best = best.min(distance.between(nugget, positive)?);
    }
    Ok(best)
}

/// Cosine distance over the `text-embedding` signal of both operands.
///
/// This is the distance the default matching stages rank with.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextEmbeddingDistance;

impl TextEmbeddingDistance {
    fn embedding<'a>(&self, map: &'a SignalMap) -> Result<&'a [f32]> {
        map.vector(ids::TEXT_EMBEDDING).ok_or_else(|| {
            MatchError::Core(CoreError::MissingSignal {
                entity: "distance operand".into(),
                signal: ids::TEXT_EMBEDDING.into(),
                stage: self.identifier().into(),
            })
        })
    }
}

impl Distance for TextEmbeddingDistance {
    fn identifier(&self) -> &'static str {
        "text-embedding-distance"
    }

    fn between(&self, x: &SignalMap, y: &SignalMap) -> Result<f64> {
        cosine_distance(self.embedding(x)?, self.embedding(y)?)
    }
}

/// Mean of the cosine distances over every embedding channel both operands
/// carry (text, context, and label embeddings).
///
/// A softer cold-start ranking than [`TextEmbeddingDistance`]: a channel
/// missing on either side simply drops out of the mean. With no shared
/// channel at all the entities are considered maximally unrelated.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalBlendDistance;

const BLEND_CHANNELS: &[&str] =
    &[ids::TEXT_EMBEDDING, ids::CONTEXT_EMBEDDING, ids::LABEL_EMBEDDING];

impl Distance for SignalBlendDistance {
    fn identifier(&self) -> &'static str {
        "signal-blend-distance"
    }

    fn between(&self, x: &SignalMap, y: &SignalMap) -> Result<f64> {
        let mut sum = 0.0;
        let mut present = 0usize;
        for channel in BLEND_CHANNELS {
            if let (Some(a), Some(b)) = (x.vector(channel), y.vector(channel)) {
                sum += cosine_distance(a, b)?.min(1.0);
                present += 1;
            }
        }
        if present == 0 {
            return Ok(1.0);
        }
        Ok(sum / present as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabula_core::signals::SignalValue;

    fn with_text_embedding(v: Vec<f32>) -> SignalMap {
        let mut map = SignalMap::new();
        map.set(ids::TEXT_EMBEDDING, SignalValue::FloatVec(v));
        map
    }

    #[test]
    fn cosine_of_identical_vectors_is_zero() {
        let d = cosine_distance(&[0.6, 0.8], &[0.6, 0.8]).unwrap();
        assert!(d.abs() < 1e-9);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_one() {
        let d = cosine_distance(&[1.0, 0.0], &[0.0, 1.0]).unwrap();
        assert!((d - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_of_opposite_vectors_is_two() {
        let d = cosine_distance(&[1.0, 0.0], &[-1.0, 0.0]).unwrap();
        assert!((d - 2.0).abs() < 1e-9);
    }

    #[test]
    fn zero_vector_has_distance_one() {
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 0.0]).unwrap(), 1.0);
    }

    #[test]
    fn dimension_mismatch_is_an_error() {
        assert!(cosine_distance(&[1.0], &[1.0, 0.0]).is_err());
    }

    #[test]
    fn effective_distance_takes_nearest_positive() {
        let distance = TextEmbeddingDistance;
        let nugget = with_text_embedding(vec![1.0, 0.0]);
        let attribute = with_text_embedding(vec![0.0, 1.0]); // d_label = 1.0
        let near = with_text_embedding(vec![1.0, 0.0]); // d = 0.0
        let far = with_text_embedding(vec![-1.0, 0.0]); // d = 2.0

        let label_only = effective_distance(&distance, &nugget, &attribute, &[]).unwrap();
        assert!((label_only - 1.0).abs() < 1e-9);

        let with_positives =
            effective_distance(&distance, &nugget, &attribute, &[far, near]).unwrap();
        assert!(with_positives.abs() < 1e-9);
    }

    #[test]
    fn blend_averages_available_channels_only() {
        let mut x = with_text_embedding(vec![1.0, 0.0]);
        let mut y = with_text_embedding(vec![1.0, 0.0]); // text channel: 0.0
        x.set(ids::CONTEXT_EMBEDDING, SignalValue::FloatVec(vec![0.0, 1.0]));
        y.set(ids::CONTEXT_EMBEDDING, SignalValue::FloatVec(vec![1.0, 0.0])); // context: 1.0
        // label channel only on one side: dropped
        x.set(ids::LABEL_EMBEDDING, SignalValue::FloatVec(vec![1.0, 0.0]));

        let d = SignalBlendDistance.between(&x, &y).unwrap();
        assert!((d - 0.5).abs() < 1e-9);

        let empty = SignalMap::new();
        assert_eq!(SignalBlendDistance.between(&empty, &empty).unwrap(), 1.0);
    }
}
