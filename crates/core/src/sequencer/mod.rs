//! Storytelling variant: classification events pushed from outside decide when the
//! next phrase of a fixed story is spoken, and which emotional variant of it.

mod receiver;

use crate::actuator::{Actuator, Utterance};
use crate::config::{ConfigError, ControllerConfig};
use crate::emotion::{EmotionClass, EmotionSet};
use crate::selector::GestureSelector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub use receiver::{LabelReceiver, ReceiverError, MAX_LABEL_BYTES};

const LOG_TARGET: &str = "affect::sequencer";

/// Ordered phrases, each with per-emotion variants and a mandatory neutral one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<BTreeMap<EmotionClass, String>>")]
#[serde(into = "Vec<BTreeMap<EmotionClass, String>>")]
pub struct PhraseTable {
    entries: Vec<BTreeMap<EmotionClass, String>>,
}

impl PhraseTable {
    pub fn new(entries: Vec<BTreeMap<EmotionClass, String>>) -> Result<Self, ConfigError> {
        if entries.is_empty() {
            return Err(ConfigError::EmptyPhraseTable);
        }
        for (i, entry) in entries.iter().enumerate() {
            let has_neutral = entry
                .get(&EmotionClass::Neutral)
                .is_some_and(|text| !text.trim().is_empty());
            if !has_neutral {
                return Err(ConfigError::PhraseMissingNeutral(i));
            }
        }
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            details: e.to_string(),
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Variant for `class`, falling back to the neutral text. Blank variants count as
    /// missing.
    pub fn phrase(&self, index: usize, class: EmotionClass) -> Option<&str> {
        let entry = self.entries.get(index)?;
        entry
            .get(&class)
            .filter(|text| !text.trim().is_empty())
            .or_else(|| entry.get(&EmotionClass::Neutral))
            .map(String::as_str)
    }
}

impl TryFrom<Vec<BTreeMap<EmotionClass, String>>> for PhraseTable {
    type Error = ConfigError;

    fn try_from(entries: Vec<BTreeMap<EmotionClass, String>>) -> Result<Self, Self::Error> {
        Self::new(entries)
    }
}

impl From<PhraseTable> for Vec<BTreeMap<EmotionClass, String>> {
    fn from(table: PhraseTable) -> Self {
        table.entries
    }
}

/// The phrase the sequencer wants spoken next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cue {
    pub index: usize,
    pub class: EmotionClass,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Gate {
    Advance(Cue),
    Hold { streak: u32 },
    /// Every phrase has been spoken.
    Finished,
}

/// Decides, per classification event, whether the story moves on.
///
/// A phrase is released on the first event of a new class or once the same class has
/// been reported `streak_threshold` times in a row, and in both cases only if
/// `min_delay` has passed since the last phrase. The position only moves when the
/// caller confirms the phrase was spoken.
#[derive(Clone, Debug)]
pub struct AdaptiveSequencer {
    phrases: PhraseTable,
    index: usize,
    last_class: Option<EmotionClass>,
    streak: u32,
    last_spoken_at: Option<Instant>,
    min_delay: Duration,
    streak_threshold: u32,
}

impl AdaptiveSequencer {
    pub fn new(phrases: PhraseTable, min_delay: Duration, streak_threshold: u32) -> Self {
        Self {
            phrases,
            index: 0,
            last_class: None,
            streak: 0,
            last_spoken_at: None,
            min_delay,
            streak_threshold,
        }
    }

    pub fn from_config(phrases: PhraseTable, config: &ControllerConfig) -> Self {
        Self::new(
            phrases,
            config.timing.min_utterance_delay(),
            config.streak_threshold,
        )
    }

    pub fn position(&self) -> usize {
        self.index
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }

    pub fn is_finished(&self) -> bool {
        self.index >= self.phrases.len()
    }

    pub fn on_event(&mut self, class: EmotionClass, now: Instant) -> Gate {
        if self.is_finished() {
            return Gate::Finished;
        }

        if self.last_class == Some(class) {
            self.streak = self.streak.saturating_add(1);
        } else {
            self.last_class = Some(class);
            self.streak = 1;
        }

        let rested = self
            .last_spoken_at
            .map_or(true, |at| now.saturating_duration_since(at) >= self.min_delay);
        let fresh = self.streak == 1;
        let sustained = self.streak >= self.streak_threshold;
        if !(rested && (fresh || sustained)) {
            return Gate::Hold {
                streak: self.streak,
            };
        }

        match self.phrases.phrase(self.index, class) {
            Some(text) => Gate::Advance(Cue {
                index: self.index,
                class,
                text: text.to_owned(),
            }),
            None => Gate::Finished,
        }
    }

    /// Records that the cue at the current position was spoken at `now`.
    pub fn confirm_spoken(&mut self, now: Instant) {
        if !self.is_finished() {
            self.index += 1;
        }
        self.last_spoken_at = Some(now);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoryReport {
    pub events: u64,
    pub spoken: u64,
    pub failed: u64,
    pub finished: bool,
}

/// Consumes pushed labels, runs them through the sequencer and speaks released cues.
pub struct StoryTeller {
    sequencer: AdaptiveSequencer,
    selector: GestureSelector,
    actuator: Arc<dyn Actuator>,
    classes: EmotionSet,
    speech_timeout: Duration,
}

impl StoryTeller {
    pub fn new(
        sequencer: AdaptiveSequencer,
        selector: GestureSelector,
        actuator: Arc<dyn Actuator>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            sequencer,
            selector,
            actuator,
            classes: config.classes.clone(),
            speech_timeout: config.timing.speech_wait_timeout(),
        }
    }

    /// Runs until the story ends, the label channel closes or `cancel` fires.
    pub async fn run(
        mut self,
        mut labels: mpsc::Receiver<String>,
        cancel: CancellationToken,
    ) -> StoryReport {
        let mut report = StoryReport::default();
        tracing::info!(target: LOG_TARGET, phrases = self.sequencer.phrases.len(), "story started");

        loop {
            let label = tokio::select! {
                () = cancel.cancelled() => break,
                label = labels.recv() => match label {
                    Some(label) => label,
                    None => {
                        tracing::warn!(target: LOG_TARGET, "label channel closed");
                        break;
                    }
                },
            };
            report.events += 1;

            let class = self.classes.classify_label(&label);
            match self.sequencer.on_event(class, Instant::now()) {
                Gate::Advance(cue) => self.speak(cue, &mut report).await,
                Gate::Hold { streak } => {
                    tracing::debug!(target: LOG_TARGET, emotion = %class, streak, "holding position");
                }
                Gate::Finished => {}
            }

            if self.sequencer.is_finished() {
                report.finished = true;
                tracing::info!(target: LOG_TARGET, spoken = report.spoken, "story finished");
                break;
            }
        }
        report
    }

    async fn speak(&mut self, cue: Cue, report: &mut StoryReport) {
        let selection = self.selector.select(cue.class);
        let utterance = Utterance {
            text: cue.text,
            prosody: selection.prosody,
            gesture: selection.gesture,
        };
        let spoken = match self.actuator.speak_detached(utterance).await {
            Ok(task) => self.actuator.wait(task, self.speech_timeout).await,
            Err(e) => Err(e),
        };
        match spoken {
            Ok(()) => {
                report.spoken += 1;
                self.sequencer.confirm_spoken(Instant::now());
                tracing::info!(target: LOG_TARGET, index = cue.index, emotion = %cue.class, "phrase spoken");
            }
            Err(e) => {
                report.failed += 1;
                tracing::warn!(target: LOG_TARGET, index = cue.index, error = %e, "phrase not spoken, position kept");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::ActuatorError;
    use crate::device::{DeviceError, SpeechTask};
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::sync::Mutex;

    const MIN_DELAY: Duration = Duration::from_secs(3);

    fn table(n: usize) -> PhraseTable {
        PhraseTable::new(
            (0..n)
                .map(|i| {
                    BTreeMap::from([
                        (EmotionClass::Neutral, format!("neutral {i}")),
                        (EmotionClass::Happy, format!("happy {i}")),
                    ])
                })
                .collect(),
        )
        .unwrap()
    }

    fn advanced(gate: &Gate) -> bool {
        matches!(gate, Gate::Advance(_))
    }

    #[test]
    fn phrase_table_requires_neutral_variant() {
        assert_eq!(PhraseTable::new(vec![]), Err(ConfigError::EmptyPhraseTable));
        let missing = vec![
            BTreeMap::from([(EmotionClass::Neutral, "a".to_owned())]),
            BTreeMap::from([(EmotionClass::Sad, "b".to_owned())]),
        ];
        assert_eq!(
            PhraseTable::new(missing),
            Err(ConfigError::PhraseMissingNeutral(1))
        );
    }

    #[test]
    fn phrase_table_parses_json_and_falls_back_to_neutral() {
        let t = PhraseTable::parse(r#"[{"neutral": "Hello.", "happy": "Hello!!", "sad": " "}]"#)
            .unwrap();
        assert_eq!(t.phrase(0, EmotionClass::Happy), Some("Hello!!"));
        assert_eq!(t.phrase(0, EmotionClass::Angry), Some("Hello."));
        assert_eq!(t.phrase(0, EmotionClass::Sad), Some("Hello."));
        assert_eq!(t.phrase(1, EmotionClass::Neutral), None);
        assert!(matches!(
            PhraseTable::parse(r#"[{"happy": "x"}]"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn sustained_class_advances_at_first_and_fifth_event_only() {
        let mut s = AdaptiveSequencer::new(table(10), MIN_DELAY, 5);
        let t0 = Instant::now();
        let mut advanced_at = Vec::new();
        for i in 0..5u32 {
            let now = t0 + MIN_DELAY * (i + 1);
            let gate = s.on_event(EmotionClass::Happy, now);
            assert_eq!(s.streak(), i + 1);
            if advanced(&gate) {
                advanced_at.push(s.streak());
                s.confirm_spoken(now);
            }
        }
        assert_eq!(advanced_at, vec![1, 5]);
        assert_eq!(s.position(), 2);
    }

    #[test]
    fn class_change_resets_streak_and_advances_immediately() {
        let mut s = AdaptiveSequencer::new(table(10), MIN_DELAY, 5);
        let t0 = Instant::now();
        assert!(advanced(&s.on_event(EmotionClass::Happy, t0)));
        s.confirm_spoken(t0);
        assert!(!advanced(&s.on_event(EmotionClass::Happy, t0 + MIN_DELAY)));

        let gate = s.on_event(EmotionClass::Sad, t0 + MIN_DELAY * 2);
        assert_eq!(s.streak(), 1);
        assert_eq!(
            gate,
            Gate::Advance(Cue {
                index: 1,
                class: EmotionClass::Sad,
                text: "neutral 1".into()
            })
        );
    }

    #[test]
    fn min_delay_blocks_both_gates() {
        let mut s = AdaptiveSequencer::new(table(10), MIN_DELAY, 2);
        let t0 = Instant::now();
        assert!(advanced(&s.on_event(EmotionClass::Happy, t0)));
        s.confirm_spoken(t0);

        let soon = t0 + Duration::from_secs(1);
        assert_eq!(s.on_event(EmotionClass::Happy, soon), Gate::Hold { streak: 2 });
        assert_eq!(s.on_event(EmotionClass::Sad, soon), Gate::Hold { streak: 1 });
        assert!(advanced(&s.on_event(EmotionClass::Sad, t0 + MIN_DELAY)));
    }

    #[test]
    fn unconfirmed_cue_is_offered_again() {
        let mut s = AdaptiveSequencer::new(table(3), MIN_DELAY, 5);
        let t0 = Instant::now();
        let Gate::Advance(first) = s.on_event(EmotionClass::Happy, t0) else {
            panic!("expected advance");
        };
        let Gate::Advance(again) = s.on_event(EmotionClass::Neutral, t0) else {
            panic!("expected advance");
        };
        assert_eq!(first.index, again.index);
        assert_eq!(s.position(), 0);
    }

    #[test]
    fn end_of_table_is_terminal() {
        let mut s = AdaptiveSequencer::new(table(2), Duration::ZERO, 5);
        let t0 = Instant::now();
        for class in [EmotionClass::Happy, EmotionClass::Sad] {
            assert!(advanced(&s.on_event(class, t0)));
            s.confirm_spoken(t0);
        }
        assert!(s.is_finished());
        assert_eq!(s.on_event(EmotionClass::Angry, t0), Gate::Finished);
        s.confirm_spoken(t0);
        assert_eq!(s.position(), 2);
    }

    #[derive(Default)]
    struct Recording {
        spoken: Mutex<Vec<Utterance>>,
        fail: Mutex<bool>,
    }

    impl Actuator for Recording {
        fn speak(&self, _utterance: Utterance) -> BoxFuture<'_, Result<(), ActuatorError>> {
            async { Ok(()) }.boxed()
        }

        fn speak_detached(
            &self,
            utterance: Utterance,
        ) -> BoxFuture<'_, Result<SpeechTask, ActuatorError>> {
            async move {
                if *self.fail.lock().unwrap() {
                    return Err(ActuatorError::Device(DeviceError::NotConnected));
                }
                let mut spoken = self.spoken.lock().unwrap();
                spoken.push(utterance);
                Ok(SpeechTask(spoken.len() as u64))
            }
            .boxed()
        }

        fn wait(
            &self,
            _task: SpeechTask,
            _timeout: Duration,
        ) -> BoxFuture<'_, Result<(), ActuatorError>> {
            async { Ok(()) }.boxed()
        }

        fn play_gesture(&self, _gesture: String) -> BoxFuture<'_, Result<(), ActuatorError>> {
            async { Ok(()) }.boxed()
        }
    }

    fn teller(actuator: Arc<Recording>, phrases: usize) -> StoryTeller {
        let config = ControllerConfig::default();
        StoryTeller::new(
            AdaptiveSequencer::from_config(table(phrases), &config),
            GestureSelector::from_config(&config),
            actuator,
            &config,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn story_speaks_variants_and_completes() {
        let actuator = Arc::new(Recording::default());
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(teller(actuator.clone(), 2).run(rx, CancellationToken::new()));

        tx.send("  HAPPY\n".into()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        tx.send("something odd".into()).await.unwrap();

        let report = handle.await.unwrap();
        assert!(report.finished);
        assert_eq!(report.spoken, 2);
        let texts: Vec<_> = actuator
            .spoken
            .lock()
            .unwrap()
            .iter()
            .map(|u| u.text.clone())
            .collect();
        assert_eq!(texts, vec!["happy 0", "neutral 1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_phrase_keeps_position() {
        let actuator = Arc::new(Recording::default());
        *actuator.fail.lock().unwrap() = true;
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(teller(actuator.clone(), 2).run(rx, cancel.clone()));

        tx.send("happy".into()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        *actuator.fail.lock().unwrap() = false;
        tx.send("sad".into()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let report = handle.await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.spoken, 1);
        assert!(!report.finished);
        assert_eq!(actuator.spoken.lock().unwrap()[0].text, "neutral 0");
    }

    #[tokio::test]
    async fn closed_channel_ends_story() {
        let actuator = Arc::new(Recording::default());
        let (tx, rx) = mpsc::channel::<String>(1);
        drop(tx);
        let report = teller(actuator, 1).run(rx, CancellationToken::new()).await;
        assert_eq!(report, StoryReport::default());
    }
}
