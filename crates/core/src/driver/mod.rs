//! Output loop: speaks a text unit by unit, shaping each unit with the emotion that is
//! current when the unit starts.

use crate::actuator::{Actuator, Utterance};
use crate::config::ControllerConfig;
use crate::emotion::EmotionReader;
use crate::selector::GestureSelector;
use crate::util::sleep_or_cancel;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const LOG_TARGET: &str = "affect::driver";

/// Splits `text` on `boundary`, keeping the boundary's punctuation on every unit but
/// the last. Units without any alphanumeric content are dropped.
pub fn split_units(text: &str, boundary: &str) -> Vec<String> {
    if boundary.is_empty() {
        let unit = text.trim();
        return if unit.chars().any(char::is_alphanumeric) {
            vec![unit.to_owned()]
        } else {
            Vec::new()
        };
    }

    let terminator = boundary.trim_end();
    let pieces: Vec<&str> = text.split(boundary).collect();
    let last = pieces.len().saturating_sub(1);
    pieces
        .into_iter()
        .enumerate()
        .filter_map(|(i, piece)| {
            let piece = piece.trim();
            if !piece.chars().any(char::is_alphanumeric) {
                return None;
            }
            if i < last && !piece.ends_with(terminator) {
                Some(format!("{piece}{terminator}"))
            } else {
                Some(piece.to_owned())
            }
        })
        .collect()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DriverReport {
    /// Passes that reached their last unit.
    pub passes: u64,
    pub spoken: u64,
    pub failed: u64,
}

pub struct OutputDriver {
    emotion: EmotionReader,
    selector: GestureSelector,
    actuator: Arc<dyn Actuator>,
    boundary: String,
    unit_spacing: Duration,
    pass_spacing: Duration,
}

impl OutputDriver {
    pub fn new(
        emotion: EmotionReader,
        selector: GestureSelector,
        actuator: Arc<dyn Actuator>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            emotion,
            selector,
            actuator,
            boundary: config.sentence_boundary.clone(),
            unit_spacing: config.timing.unit_spacing(),
            pass_spacing: config.timing.pass_spacing(),
        }
    }

    /// Repeats `text` until `cancel` fires. The token is checked before every unit, so
    /// a stop request lands within one unit.
    pub async fn run(mut self, text: &str, cancel: CancellationToken) -> DriverReport {
        let units = split_units(text, &self.boundary);
        let mut report = DriverReport::default();
        if units.is_empty() {
            tracing::warn!(target: LOG_TARGET, "nothing to say; output loop idle");
            cancel.cancelled().await;
            return report;
        }
        tracing::info!(target: LOG_TARGET, units = units.len(), "output loop started");

        while !cancel.is_cancelled() {
            if !self.speak_pass(&units, &cancel, &mut report).await {
                break;
            }
            report.passes += 1;
            if !sleep_or_cancel(self.pass_spacing, &cancel).await {
                break;
            }
        }

        tracing::info!(
            target: LOG_TARGET,
            passes = report.passes,
            spoken = report.spoken,
            failed = report.failed,
            "output loop stopped"
        );
        report
    }

    /// One pass over `units`. Returns `false` if cancelled before the pass finished.
    pub async fn speak_pass(
        &mut self,
        units: &[String],
        cancel: &CancellationToken,
        report: &mut DriverReport,
    ) -> bool {
        for (i, unit) in units.iter().enumerate() {
            if cancel.is_cancelled() {
                return false;
            }

            let snapshot = self.emotion.snapshot();
            let selection = self.selector.select(snapshot.current);
            let utterance = Utterance {
                text: unit.clone(),
                prosody: selection.prosody,
                gesture: selection.gesture,
            };
            match self.actuator.speak(utterance).await {
                Ok(()) => report.spoken += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(target: LOG_TARGET, unit = i, emotion = %snapshot.current, error = %e, "unit skipped");
                }
            }

            if i + 1 < units.len() && !sleep_or_cancel(self.unit_spacing, cancel).await {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::ActuatorError;
    use crate::device::{DeviceError, SpeechTask};
    use crate::emotion::{emotion_cell, EmotionClass};
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Default)]
    struct Recording {
        spoken: Mutex<Vec<Utterance>>,
        cancel_after: Option<(usize, CancellationToken)>,
        fail_on: Option<usize>,
    }

    impl Recording {
        fn texts(&self) -> Vec<String> {
            self.spoken
                .lock()
                .unwrap()
                .iter()
                .map(|u| u.text.clone())
                .collect()
        }
    }

    impl Actuator for Recording {
        fn speak(&self, utterance: Utterance) -> BoxFuture<'_, Result<(), ActuatorError>> {
            async move {
                let count = {
                    let mut spoken = self.spoken.lock().unwrap();
                    spoken.push(utterance);
                    spoken.len()
                };
                if let Some((after, token)) = &self.cancel_after {
                    if count == *after {
                        token.cancel();
                    }
                }
                if self.fail_on == Some(count) {
                    return Err(ActuatorError::Device(DeviceError::NotConnected));
                }
                Ok(())
            }
            .boxed()
        }

        fn speak_detached(
            &self,
            _utterance: Utterance,
        ) -> BoxFuture<'_, Result<SpeechTask, ActuatorError>> {
            async { Ok(SpeechTask(0)) }.boxed()
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

    const STORY: &str = "Once upon a time. There was a robot. It liked to talk. The end";

    fn driver(actuator: Arc<Recording>, reader: EmotionReader) -> OutputDriver {
        let config = ControllerConfig::default();
        OutputDriver::new(
            reader,
            GestureSelector::from_config(&config),
            actuator,
            &config,
        )
    }

    #[test]
    fn splits_on_boundary_and_keeps_terminators() {
        assert_eq!(
            split_units(STORY, ". "),
            vec![
                "Once upon a time.",
                "There was a robot.",
                "It liked to talk.",
                "The end"
            ]
        );
    }

    #[test]
    fn split_drops_empty_and_punctuation_only_units() {
        assert_eq!(split_units(" . Hi there. . ", ". "), vec!["Hi there."]);
        assert!(split_units("   ", ". ").is_empty());
        assert_eq!(split_units("one unit", ""), vec!["one unit"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_mid_text_halts_before_next_unit() {
        let cancel = CancellationToken::new();
        let actuator = Arc::new(Recording {
            cancel_after: Some((2, cancel.clone())),
            ..Recording::default()
        });
        let (_writer, reader) = emotion_cell();

        let report = driver(actuator.clone(), reader).run(STORY, cancel).await;

        assert_eq!(actuator.texts(), vec!["Once upon a time.", "There was a robot."]);
        assert_eq!(report.passes, 0);
        assert_eq!(report.spoken, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_unit_is_skipped_and_pass_continues() {
        let cancel = CancellationToken::new();
        let actuator = Arc::new(Recording {
            fail_on: Some(2),
            cancel_after: Some((4, cancel.clone())),
            ..Recording::default()
        });
        let (_writer, reader) = emotion_cell();

        let report = driver(actuator.clone(), reader).run(STORY, cancel).await;

        assert_eq!(actuator.texts().len(), 4);
        assert_eq!(report.failed, 1);
        assert_eq!(report.spoken, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn text_repeats_until_stopped() {
        let cancel = CancellationToken::new();
        let actuator = Arc::new(Recording {
            cancel_after: Some((6, cancel.clone())),
            ..Recording::default()
        });
        let (_writer, reader) = emotion_cell();

        let report = driver(actuator.clone(), reader).run(STORY, cancel).await;

        let texts = actuator.texts();
        assert_eq!(texts[4], "Once upon a time.");
        assert_eq!(texts[5], "There was a robot.");
        assert_eq!(report.passes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn each_unit_uses_emotion_current_at_its_start() {
        let cancel = CancellationToken::new();
        let actuator = Arc::new(Recording::default());
        let (writer, reader) = emotion_cell();
        let mut d = driver(actuator.clone(), reader);
        let units = split_units("First. Second", ". ");
        let mut report = DriverReport::default();

        writer.publish(EmotionClass::Sad, Instant::now());
        assert!(d.speak_pass(&units[..1], &cancel, &mut report).await);
        writer.publish(EmotionClass::Happy, Instant::now());
        assert!(d.speak_pass(&units[1..], &cancel, &mut report).await);

        let spoken = actuator.spoken.lock().unwrap().clone();
        let config = ControllerConfig::default();
        assert_eq!(spoken[0].prosody, config.prosody[&EmotionClass::Sad]);
        assert_eq!(spoken[1].prosody, config.prosody[&EmotionClass::Happy]);
        // the first unit used up the shared cooldown
        assert!(spoken[0].gesture.is_some());
        assert!(spoken[1].gesture.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn units_are_spaced_apart() {
        let cancel = CancellationToken::new();
        let actuator = Arc::new(Recording::default());
        let (_writer, reader) = emotion_cell();
        let mut d = driver(actuator, reader);
        let units = split_units(STORY, ". ");
        let mut report = DriverReport::default();

        let started = Instant::now();
        assert!(d.speak_pass(&units, &cancel, &mut report).await);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1500) && elapsed < Duration::from_secs(2));
    }
}
