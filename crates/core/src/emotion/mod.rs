mod analyzer;
mod state;

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use analyzer::{PerceptionError, ThresholdClassifier};
pub use state::{emotion_cell, EmotionReader, EmotionSnapshot, EmotionWriter};

/// Discrete label for the dominant affect detected on the interlocutor.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum EmotionClass {
    Neutral,
    Happy,
    Sad,
    Angry,
    Surprised,
    Disgust,
    Fear,
    Confused,
}

impl EmotionClass {
    pub const ALL: [EmotionClass; 8] = [
        EmotionClass::Neutral,
        EmotionClass::Happy,
        EmotionClass::Sad,
        EmotionClass::Angry,
        EmotionClass::Surprised,
        EmotionClass::Disgust,
        EmotionClass::Fear,
        EmotionClass::Confused,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmotionClass::Neutral => "neutral",
            EmotionClass::Happy => "happy",
            EmotionClass::Sad => "sad",
            EmotionClass::Angry => "angry",
            EmotionClass::Surprised => "surprised",
            EmotionClass::Disgust => "disgust",
            EmotionClass::Fear => "fear",
            EmotionClass::Confused => "confused",
        }
    }

    /// Parses a classifier label. Casing and surrounding whitespace are ignored and the
    /// spellings used by common expression classifiers are accepted.
    pub fn parse_label(label: &str) -> Option<Self> {
        let normalized = label.trim().to_lowercase();
        let class = match normalized.as_str() {
            "neutral" => EmotionClass::Neutral,
            "happy" | "happiness" | "joy" => EmotionClass::Happy,
            "sad" | "sadness" => EmotionClass::Sad,
            "angry" | "anger" => EmotionClass::Angry,
            "surprised" | "surprise" => EmotionClass::Surprised,
            "disgust" | "disgusted" => EmotionClass::Disgust,
            "fear" | "fearful" | "afraid" => EmotionClass::Fear,
            "confused" | "confusion" => EmotionClass::Confused,
            _ => return None,
        };
        Some(class)
    }
}

impl fmt::Display for EmotionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of classes a deployment works with. `neutral` is always a member and
/// the order defines how expression score vectors are indexed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "Vec<EmotionClass>", into = "Vec<EmotionClass>")]
pub struct EmotionSet {
    classes: Vec<EmotionClass>,
}

impl EmotionSet {
    pub fn new(classes: Vec<EmotionClass>) -> Result<Self, ConfigError> {
        if !classes.contains(&EmotionClass::Neutral) {
            return Err(ConfigError::MissingNeutral);
        }
        for (i, class) in classes.iter().enumerate() {
            if classes[..i].contains(class) {
                return Err(ConfigError::DuplicateClass(*class));
            }
        }
        Ok(Self { classes })
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn contains(&self, class: EmotionClass) -> bool {
        self.classes.contains(&class)
    }

    pub fn iter(&self) -> impl Iterator<Item = EmotionClass> + '_ {
        self.classes.iter().copied()
    }

    pub fn position(&self, class: EmotionClass) -> Option<usize> {
        self.classes.iter().position(|c| *c == class)
    }

    /// Maps a class outside the set to `neutral`.
    pub fn restrict(&self, class: EmotionClass) -> EmotionClass {
        if self.contains(class) {
            class
        } else {
            EmotionClass::Neutral
        }
    }

    /// Resolves an inbound label to a member of the set; anything unrecognized is `neutral`.
    pub fn classify_label(&self, label: &str) -> EmotionClass {
        EmotionClass::parse_label(label)
            .map(|class| self.restrict(class))
            .unwrap_or(EmotionClass::Neutral)
    }
}

impl Default for EmotionSet {
    fn default() -> Self {
        Self {
            classes: vec![
                EmotionClass::Neutral,
                EmotionClass::Happy,
                EmotionClass::Surprised,
                EmotionClass::Angry,
                EmotionClass::Sad,
            ],
        }
    }
}

impl TryFrom<Vec<EmotionClass>> for EmotionSet {
    type Error = ConfigError;

    fn try_from(classes: Vec<EmotionClass>) -> Result<Self, Self::Error> {
        Self::new(classes)
    }
}

impl From<EmotionSet> for Vec<EmotionClass> {
    fn from(set: EmotionSet) -> Self {
        set.classes
    }
}

/// Per-class confidence scores from a single perception read, in the order of the
/// configured [`EmotionSet`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExpressionSample {
    pub scores: Vec<f32>,
}

impl ExpressionSample {
    pub fn new(scores: Vec<f32>) -> Self {
        Self { scores }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_label_normalizes_case_and_whitespace() {
        assert_eq!(EmotionClass::parse_label("  Happy\n"), Some(EmotionClass::Happy));
        assert_eq!(EmotionClass::parse_label("SURPRISE"), Some(EmotionClass::Surprised));
        assert_eq!(EmotionClass::parse_label("fearful"), Some(EmotionClass::Fear));
        assert_eq!(EmotionClass::parse_label("bored"), None);
        assert_eq!(EmotionClass::parse_label(""), None);
    }

    #[test]
    fn set_requires_neutral() {
        let err = EmotionSet::new(vec![EmotionClass::Happy]).unwrap_err();
        assert_eq!(err, ConfigError::MissingNeutral);
    }

    #[test]
    fn set_rejects_duplicates() {
        let err = EmotionSet::new(vec![
            EmotionClass::Neutral,
            EmotionClass::Sad,
            EmotionClass::Sad,
        ])
        .unwrap_err();
        assert_eq!(err, ConfigError::DuplicateClass(EmotionClass::Sad));
    }

    #[test]
    fn classify_label_falls_back_to_neutral() {
        let set = EmotionSet::default();
        assert_eq!(set.classify_label("Angry "), EmotionClass::Angry);
        // known label, but outside the configured set
        assert_eq!(set.classify_label("disgust"), EmotionClass::Neutral);
        assert_eq!(set.classify_label("???"), EmotionClass::Neutral);
    }

    #[test]
    fn set_deserializes_from_label_list() {
        let set: EmotionSet = serde_json::from_str(r#"["neutral","happy","fear"]"#).unwrap();
        assert_eq!(set.position(EmotionClass::Fear), Some(2));
        assert!(serde_json::from_str::<EmotionSet>(r#"["happy"]"#).is_err());
    }
}
