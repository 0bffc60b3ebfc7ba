//! Boundary contracts for the robot session.
//!
//! A [`SessionFactory`] creates sessions against a device address; a [`DeviceSession`]
//! exposes the handful of speech, gesture, perception and liveness calls the controller
//! needs. Two implementations live here: an HTTP bridge for real hardware and an
//! in-process simulation.

mod bridge;
mod simulated;

use crate::config::DeviceAddress;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};

pub use bridge::{BridgeSessionFactory, REQUIRED_SERVICES};
pub use simulated::SimulatedDevice;

/// Speech-engine parameter names understood by `set_prosody_parameter`.
pub const PARAM_PITCH_SHIFT: &str = "pitchShift";
pub const PARAM_SPEED: &str = "speed";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct SubjectId(pub i64);

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to an utterance posted without waiting for it to finish.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct SpeechTask(pub u64);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("session is not connected")]
    NotConnected,
    #[error("service {0} unavailable")]
    ServiceUnavailable(String),
    #[error("{call} failed: {details}")]
    CallFailed { call: String, details: String },
    #[error("unexpected reply to {call}: {details}")]
    BadReply { call: String, details: String },
    #[error("transport error: {0}")]
    Transport(String),
}

pub trait DeviceSession: Send + Sync {
    fn ping(&self) -> BoxFuture<'_, Result<(), DeviceError>>;

    fn list_present_subjects(&self) -> BoxFuture<'_, Result<Vec<SubjectId>, DeviceError>>;

    /// Fire-and-forget trigger; results land in the device's result store later.
    fn request_expression_analysis(
        &self,
        subject: SubjectId,
    ) -> BoxFuture<'_, Result<(), DeviceError>>;

    /// `None` when the result store has nothing for this subject.
    fn read_expression_scores(
        &self,
        subject: SubjectId,
    ) -> BoxFuture<'_, Result<Option<Vec<f32>>, DeviceError>>;

    fn set_prosody_parameter(
        &self,
        name: &'static str,
        value: f32,
    ) -> BoxFuture<'_, Result<(), DeviceError>>;

    /// Resolves once the annotated text has been fully vocalized.
    fn say(&self, annotated: String) -> BoxFuture<'_, Result<(), DeviceError>>;

    /// Starts vocalizing and resolves immediately.
    fn post_say(&self, annotated: String) -> BoxFuture<'_, Result<SpeechTask, DeviceError>>;

    fn wait(&self, task: SpeechTask) -> BoxFuture<'_, Result<(), DeviceError>>;

    fn play_gesture(&self, gesture: String) -> BoxFuture<'_, Result<(), DeviceError>>;

    fn start_awareness(&self) -> BoxFuture<'_, Result<(), DeviceError>>;

    fn stop_awareness(&self) -> BoxFuture<'_, Result<(), DeviceError>>;

    /// Best effort; errors are swallowed by implementations.
    fn close(&self) -> BoxFuture<'_, ()>;
}

pub trait SessionFactory: Send + Sync {
    /// Opens a session and resolves every service handle the controller uses. A
    /// session is only returned when all of them are available.
    fn connect(
        &self,
        address: DeviceAddress,
    ) -> BoxFuture<'_, Result<Arc<dyn DeviceSession>, DeviceError>>;
}
