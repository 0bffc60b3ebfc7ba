mod annotation;

use crate::config::ProsodyEntry;
use crate::device::{DeviceError, DeviceSession, SpeechTask, PARAM_PITCH_SHIFT, PARAM_SPEED};
use crate::health::{ConnectionError, ConnectionMonitor};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub use annotation::annotate;

const LOG_TARGET: &str = "affect::actuator";

/// One sentence together with the voice shaping and optional gesture to apply.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Utterance {
    pub text: String,
    pub prosody: ProsodyEntry,
    pub gesture: Option<String>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ActuatorError {
    #[error("device unreachable: {0}")]
    Connection(#[from] ConnectionError),
    #[error("device call failed: {0}")]
    Device(#[from] DeviceError),
    #[error("speech did not finish within {0:?}")]
    Timeout(Duration),
}

pub trait Actuator: Send + Sync {
    /// Resolves once the utterance has been fully vocalized.
    fn speak(&self, utterance: Utterance) -> BoxFuture<'_, Result<(), ActuatorError>>;

    /// Starts the utterance and resolves immediately with a handle for [`Actuator::wait`].
    fn speak_detached(
        &self,
        utterance: Utterance,
    ) -> BoxFuture<'_, Result<SpeechTask, ActuatorError>>;

    fn wait(
        &self,
        task: SpeechTask,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<(), ActuatorError>>;

    fn play_gesture(&self, gesture: String) -> BoxFuture<'_, Result<(), ActuatorError>>;
}

/// Actuator backed by the monitored device session.
#[derive(Clone)]
pub struct DeviceActuator {
    monitor: Arc<ConnectionMonitor>,
}

impl DeviceActuator {
    pub fn new(monitor: Arc<ConnectionMonitor>) -> Self {
        Self { monitor }
    }

    /// Engine-level parameters are applied best effort; the inline tokens carry the
    /// same shaping, so a failure here does not cancel the utterance.
    async fn prepare(
        &self,
        utterance: &Utterance,
    ) -> Result<(Arc<dyn DeviceSession>, String), ActuatorError> {
        let session = self.monitor.ensure_connected().await?;
        for (name, value) in [
            (PARAM_PITCH_SHIFT, utterance.prosody.pitch),
            (PARAM_SPEED, utterance.prosody.rate),
        ] {
            if let Err(e) = session.set_prosody_parameter(name, value).await {
                tracing::warn!(target: LOG_TARGET, parameter = name, error = %e, "failed to set speech parameter");
            }
        }
        Ok((session, annotate(utterance)))
    }
}

impl Actuator for DeviceActuator {
    fn speak(&self, utterance: Utterance) -> BoxFuture<'_, Result<(), ActuatorError>> {
        async move {
            let (session, annotated) = self.prepare(&utterance).await?;
            tracing::debug!(target: LOG_TARGET, text = %annotated, "speaking");
            session.say(annotated).await?;
            Ok(())
        }
        .boxed()
    }

    fn speak_detached(
        &self,
        utterance: Utterance,
    ) -> BoxFuture<'_, Result<SpeechTask, ActuatorError>> {
        async move {
            let (session, annotated) = self.prepare(&utterance).await?;
            tracing::debug!(target: LOG_TARGET, text = %annotated, "posting speech");
            Ok(session.post_say(annotated).await?)
        }
        .boxed()
    }

    fn wait(
        &self,
        task: SpeechTask,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<(), ActuatorError>> {
        async move {
            let session = self.monitor.ensure_connected().await?;
            match tokio::time::timeout(timeout, session.wait(task)).await {
                Ok(result) => Ok(result?),
                Err(_) => Err(ActuatorError::Timeout(timeout)),
            }
        }
        .boxed()
    }

    fn play_gesture(&self, gesture: String) -> BoxFuture<'_, Result<(), ActuatorError>> {
        async move {
            let session = self.monitor.ensure_connected().await?;
            tracing::debug!(target: LOG_TARGET, %gesture, "playing gesture");
            session.play_gesture(gesture).await?;
            Ok(())
        }
        .boxed()
    }
}
