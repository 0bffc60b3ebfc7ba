use crate::config::{ControllerConfig, ProsodyEntry};
use crate::emotion::EmotionClass;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

const LOG_TARGET: &str = "affect::selector";

#[derive(Clone, Debug, PartialEq)]
pub struct Selection {
    pub prosody: ProsodyEntry,
    pub gesture: Option<String>,
}

/// Maps an emotion class to voice shaping and, at most once per cooldown window, to
/// the next gesture of that class in round-robin order.
///
/// The cooldown is shared by all classes: a gesture for `happy` blocks a gesture for
/// `sad` issued a moment later.
#[derive(Clone, Debug)]
pub struct GestureSelector {
    prosody: BTreeMap<EmotionClass, ProsodyEntry>,
    gestures: BTreeMap<EmotionClass, Vec<String>>,
    cooldown: Duration,
    next_index: BTreeMap<EmotionClass, usize>,
    last_emission: Option<Instant>,
}

impl GestureSelector {
    pub fn new(
        prosody: BTreeMap<EmotionClass, ProsodyEntry>,
        gestures: BTreeMap<EmotionClass, Vec<String>>,
        cooldown: Duration,
    ) -> Self {
        Self {
            prosody,
            gestures,
            cooldown,
            next_index: BTreeMap::new(),
            last_emission: None,
        }
    }

    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::new(
            config.prosody.clone(),
            config.gestures.clone(),
            config.timing.animation_cooldown(),
        )
    }

    /// Pure lookup, falling back to the stock voice.
    pub fn prosody_for(&self, class: EmotionClass) -> ProsodyEntry {
        self.prosody.get(&class).copied().unwrap_or_default()
    }

    pub fn select(&mut self, class: EmotionClass) -> Selection {
        self.select_at(class, Instant::now())
    }

    pub fn select_at(&mut self, class: EmotionClass, now: Instant) -> Selection {
        Selection {
            prosody: self.prosody_for(class),
            gesture: self.next_gesture(class, now),
        }
    }

    fn next_gesture(&mut self, class: EmotionClass, now: Instant) -> Option<String> {
        if let Some(last) = self.last_emission {
            if now.saturating_duration_since(last) < self.cooldown {
                tracing::trace!(target: LOG_TARGET, emotion = %class, "gesture suppressed by cooldown");
                return None;
            }
        }
        let list = self.gestures.get(&class).filter(|l| !l.is_empty())?;
        let slot = self.next_index.entry(class).or_insert(0);
        let gesture = list[*slot % list.len()].clone();
        *slot = (*slot + 1) % list.len();
        self.last_emission = Some(now);
        tracing::debug!(target: LOG_TARGET, emotion = %class, %gesture, "gesture selected");
        Some(gesture)
    }
}
