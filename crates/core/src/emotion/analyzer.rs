use crate::device::DeviceError;
use crate::emotion::{EmotionClass, EmotionSet, ExpressionSample};
use crate::health::ConnectionError;
use std::collections::BTreeMap;

const LOG_TARGET: &str = "affect::perception";

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PerceptionError {
    #[error("expression sample missing")]
    MissingSample,
    #[error("expression sample has {got} scores, expected {expected}")]
    WrongLength { expected: usize, got: usize },
    #[error("expression sample contains a non-finite score")]
    NonFinite,
    #[error("perception read failed: {0}")]
    Device(#[from] DeviceError),
    #[error("device unreachable: {0}")]
    Connection(#[from] ConnectionError),
}

/// Resolves expression samples by thresholded argmax over the configured class set.
#[derive(Clone, Debug)]
pub struct ThresholdClassifier {
    classes: EmotionSet,
    thresholds: Vec<f32>,
}

impl ThresholdClassifier {
    /// Classes without an explicit threshold use `default_threshold`.
    pub fn new(
        classes: EmotionSet,
        thresholds: &BTreeMap<EmotionClass, f32>,
        default_threshold: f32,
    ) -> Self {
        let thresholds = classes
            .iter()
            .map(|class| thresholds.get(&class).copied().unwrap_or(default_threshold))
            .collect();
        Self {
            classes,
            thresholds,
        }
    }

    pub fn classes(&self) -> &EmotionSet {
        &self.classes
    }

    /// A class is a candidate only if its score strictly exceeds its threshold; the
    /// highest candidate wins and ties go to the class listed first.
    pub fn try_classify(
        &self,
        sample: Option<&ExpressionSample>,
    ) -> Result<Option<EmotionClass>, PerceptionError> {
        let sample = sample.ok_or(PerceptionError::MissingSample)?;
        if sample.scores.len() != self.classes.len() {
            return Err(PerceptionError::WrongLength {
                expected: self.classes.len(),
                got: sample.scores.len(),
            });
        }
        if sample.scores.iter().any(|s| !s.is_finite()) {
            return Err(PerceptionError::NonFinite);
        }

        let mut best: Option<(EmotionClass, f32)> = None;
        for ((class, score), threshold) in self
            .classes
            .iter()
            .zip(sample.scores.iter().copied())
            .zip(self.thresholds.iter().copied())
        {
            if score <= threshold {
                continue;
            }
            match best {
                Some((_, best_score)) if best_score >= score => {}
                _ => best = Some((class, score)),
            }
        }
        Ok(best.map(|(class, _)| class))
    }

    /// Never fails: malformed samples and samples where nothing clears its threshold
    /// resolve to `neutral`.
    pub fn classify(&self, sample: Option<&ExpressionSample>) -> EmotionClass {
        match self.try_classify(sample) {
            Ok(Some(class)) => class,
            Ok(None) => EmotionClass::Neutral,
            Err(e) => {
                tracing::debug!(target: LOG_TARGET, error = %e, "unusable expression sample, using neutral");
                EmotionClass::Neutral
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier(threshold: f32) -> ThresholdClassifier {
        ThresholdClassifier::new(EmotionSet::default(), &BTreeMap::new(), threshold)
    }

    fn sample(scores: &[f32]) -> ExpressionSample {
        ExpressionSample::new(scores.to_vec())
    }

    #[test]
    fn neutral_dominant_sample_resolves_to_neutral() {
        // neutral, happy, surprised, angry, sad
        let c = classifier(0.3);
        assert_eq!(
            c.classify(Some(&sample(&[1.0, 0.0, 0.0, 0.0, 0.0]))),
            EmotionClass::Neutral
        );
    }

    #[test]
    fn happy_dominant_sample_resolves_to_happy() {
        let c = classifier(0.3);
        assert_eq!(
            c.classify(Some(&sample(&[0.1, 0.8, 0.0, 0.0, 0.1]))),
            EmotionClass::Happy
        );
    }

    #[test]
    fn nothing_above_threshold_is_neutral() {
        let c = classifier(0.3);
        let s = sample(&[0.2, 0.25, 0.3, 0.1, 0.15]);
        assert_eq!(c.try_classify(Some(&s)), Ok(None));
        assert_eq!(c.classify(Some(&s)), EmotionClass::Neutral);
    }

    #[test]
    fn per_class_thresholds_gate_candidates() {
        let mut thresholds = BTreeMap::new();
        thresholds.insert(EmotionClass::Angry, 0.6);
        let c = ThresholdClassifier::new(EmotionSet::default(), &thresholds, 0.3);
        // angry has the highest score but does not clear its own threshold
        let s = sample(&[0.0, 0.4, 0.0, 0.55, 0.05]);
        assert_eq!(c.classify(Some(&s)), EmotionClass::Happy);
    }

    #[test]
    fn ties_go_to_first_listed_class() {
        let c = classifier(0.3);
        let s = sample(&[0.0, 0.5, 0.5, 0.0, 0.0]);
        assert_eq!(c.classify(Some(&s)), EmotionClass::Happy);
    }

    #[test]
    fn malformed_samples_resolve_to_neutral() {
        let c = classifier(0.3);
        assert_eq!(c.try_classify(None), Err(PerceptionError::MissingSample));
        assert_eq!(
            c.try_classify(Some(&sample(&[0.0, 0.9]))),
            Err(PerceptionError::WrongLength {
                expected: 5,
                got: 2
            })
        );
        assert_eq!(
            c.try_classify(Some(&sample(&[0.0, f32::NAN, 0.0, 0.0, 0.0]))),
            Err(PerceptionError::NonFinite)
        );

        for bad in [None, Some(sample(&[])), Some(sample(&[0.0, 0.9, 0.0, 0.0, 0.0, 0.0]))] {
            assert_eq!(c.classify(bad.as_ref()), EmotionClass::Neutral);
        }
    }
}
