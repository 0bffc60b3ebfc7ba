//! Perception loop: polls presence and expression scores and publishes the resolved
//! emotion to the shared state.

use crate::config::ControllerConfig;
use crate::emotion::{
    EmotionClass, EmotionWriter, ExpressionSample, PerceptionError,
    ThresholdClassifier,
};
use crate::health::ConnectionMonitor;
use crate::util::sleep_or_cancel;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const LOG_TARGET: &str = "affect::perception";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nobody, or more than one person, in view. Neutral was published.
    NoSingleSubject { subjects: usize },
    /// Exactly one person, but the previous sample is too recent.
    Throttled,
    Sampled { class: EmotionClass, changed: bool },
}

pub struct PerceptionSampler {
    monitor: Arc<ConnectionMonitor>,
    writer: EmotionWriter,
    classifier: ThresholdClassifier,
    poll_interval: Duration,
    min_sample_interval: Duration,
    settle_delay: Duration,
    last_sample: Option<Instant>,
}

impl PerceptionSampler {
    pub fn new(
        monitor: Arc<ConnectionMonitor>,
        writer: EmotionWriter,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            monitor,
            writer,
            classifier: ThresholdClassifier::new(
                config.classes.clone(),
                &config.thresholds,
                config.default_threshold,
            ),
            poll_interval: config.timing.poll_interval(),
            min_sample_interval: config.timing.min_sample_interval(),
            settle_delay: config.timing.settle_delay(),
            last_sample: None,
        }
    }

    /// One polling step. Device faults are returned; the health gate at the start of
    /// the next tick takes care of reconnecting.
    pub async fn tick(&mut self) -> Result<TickOutcome, PerceptionError> {
        let session = self.monitor.ensure_connected().await?;
        let subjects = session.list_present_subjects().await?;

        let [subject] = subjects.as_slice() else {
            let changed = self.writer.publish(EmotionClass::Neutral, Instant::now());
            if changed {
                tracing::info!(target: LOG_TARGET, subjects = subjects.len(), "no single subject in view, emotion reset to neutral");
            }
            return Ok(TickOutcome::NoSingleSubject {
                subjects: subjects.len(),
            });
        };
        let subject = *subject;

        if let Some(last) = self.last_sample {
            if last.elapsed() < self.min_sample_interval {
                return Ok(TickOutcome::Throttled);
            }
        }

        session.request_expression_analysis(subject).await?;
        tokio::time::sleep(self.settle_delay).await;
        let scores = session.read_expression_scores(subject).await?;
        self.last_sample = Some(Instant::now());

        let sample = scores.map(ExpressionSample::new);
        let class = self.classifier.classify(sample.as_ref());
        let changed = self.writer.publish(class, Instant::now());
        if changed {
            tracing::info!(target: LOG_TARGET, %subject, emotion = %class, "emotion changed");
        } else {
            tracing::debug!(target: LOG_TARGET, %subject, emotion = %class, "emotion unchanged");
        }
        Ok(TickOutcome::Sampled { class, changed })
    }

    /// Ticks until `cancel` fires. Failures are logged and the loop carries on after
    /// the normal poll delay.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(target: LOG_TARGET, "perception loop started");
        let mut failures: u64 = 0;
        while !cancel.is_cancelled() {
            let outcome = tokio::select! {
                () = cancel.cancelled() => break,
                outcome = self.tick() => outcome,
            };
            match outcome {
                Ok(outcome) => {
                    tracing::trace!(target: LOG_TARGET, ?outcome, "tick");
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(target: LOG_TARGET, error = %e, failures, "perception tick failed");
                }
            }
            if !sleep_or_cancel(self.poll_interval, &cancel).await {
                break;
            }
        }
        tracing::info!(target: LOG_TARGET, failures, "perception loop stopped");
    }
}
