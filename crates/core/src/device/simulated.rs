use crate::config::DeviceAddress;
use crate::device::{DeviceError, DeviceSession, SessionFactory, SpeechTask, SubjectId};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const LOG_TARGET: &str = "affect::device::simulated";

#[derive(Default)]
struct SimState {
    link_up: bool,
    generation: u64,
    connect_failures_left: Option<u32>,
    connect_attempts: u32,
    closes: u32,
    presence: Vec<SubjectId>,
    scores: Option<Vec<f32>>,
    score_script: VecDeque<Option<Vec<f32>>>,
    analysis_requests: Vec<SubjectId>,
    fail_presence: bool,
    fail_speech: bool,
    stall_pings: bool,
    speech_duration: Duration,
    spoken: Vec<String>,
    gestures: Vec<String>,
    parameters: Vec<(&'static str, f32)>,
    next_task: u64,
    awareness: bool,
}

/// In-process stand-in for the robot. Every knob is shared between clones, so a test
/// can keep one handle to script the device while the controller holds sessions.
#[derive(Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                link_up: true,
                ..SimState::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn with_speech_duration(self, duration: Duration) -> Self {
        self.lock().speech_duration = duration;
        self
    }

    pub fn set_presence(&self, subjects: Vec<SubjectId>) {
        self.lock().presence = subjects;
    }

    /// Scores returned by every read until changed.
    pub fn set_scores(&self, scores: Option<Vec<f32>>) {
        let mut s = self.lock();
        s.score_script.clear();
        s.scores = scores;
    }

    /// Scores handed out in turn, one per read, cycling.
    pub fn script_scores(&self, script: Vec<Option<Vec<f32>>>) {
        self.lock().score_script = script.into();
    }

    /// Drops the link: live sessions stop answering until a new one is created.
    pub fn break_link(&self) {
        self.lock().link_up = false;
    }

    /// `None` makes every connect attempt fail, `Some(n)` fails the next `n`.
    pub fn fail_connects(&self, count: Option<u32>) {
        let mut s = self.lock();
        s.connect_failures_left = match count {
            Some(0) => None,
            Some(n) => Some(n),
            None => Some(u32::MAX),
        };
    }

    pub fn fail_presence(&self, fail: bool) {
        self.lock().fail_presence = fail;
    }

    pub fn fail_speech(&self, fail: bool) {
        self.lock().fail_speech = fail;
    }

    /// Pings never answer while set, as on a link that hangs instead of failing.
    pub fn stall_pings(&self, stall: bool) {
        self.lock().stall_pings = stall;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    pub fn closes(&self) -> u32 {
        self.lock().closes
    }

    pub fn spoken(&self) -> Vec<String> {
        self.lock().spoken.clone()
    }

    pub fn gestures(&self) -> Vec<String> {
        self.lock().gestures.clone()
    }

    pub fn parameters(&self) -> Vec<(&'static str, f32)> {
        self.lock().parameters.clone()
    }

    pub fn analysis_requests(&self) -> Vec<SubjectId> {
        self.lock().analysis_requests.clone()
    }

    pub fn awareness_running(&self) -> bool {
        self.lock().awareness
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionFactory for SimulatedDevice {
    fn connect(
        &self,
        address: DeviceAddress,
    ) -> BoxFuture<'_, Result<Arc<dyn DeviceSession>, DeviceError>> {
        async move {
            let mut s = self.lock();
            s.connect_attempts += 1;
            if let Some(left) = s.connect_failures_left {
                if left != u32::MAX {
                    s.connect_failures_left = left.checked_sub(1).filter(|n| *n > 0);
                }
                tracing::debug!(target: LOG_TARGET, %address, "refusing simulated connect");
                return Err(DeviceError::Transport(format!("cannot reach {address}")));
            }
            s.link_up = true;
            s.generation += 1;
            let session: Arc<dyn DeviceSession> = Arc::new(SimulatedSession {
                device: self.clone(),
                generation: s.generation,
            });
            Ok(session)
        }
        .boxed()
    }
}

struct SimulatedSession {
    device: SimulatedDevice,
    generation: u64,
}

impl SimulatedSession {
    fn live(&self) -> Result<MutexGuard<'_, SimState>, DeviceError> {
        let s = self.device.lock();
        if s.link_up && s.generation == self.generation {
            Ok(s)
        } else {
            Err(DeviceError::NotConnected)
        }
    }

    fn record_speech(&self, annotated: String) -> Result<(SpeechTask, Duration), DeviceError> {
        let mut s = self.live()?;
        if s.fail_speech {
            return Err(DeviceError::CallFailed {
                call: "ALAnimatedSpeech.say".into(),
                details: "simulated speech failure".into(),
            });
        }
        tracing::info!(target: LOG_TARGET, text = %annotated, "robot says");
        s.spoken.push(annotated);
        s.next_task += 1;
        Ok((SpeechTask(s.next_task), s.speech_duration))
    }
}

impl DeviceSession for SimulatedSession {
    fn ping(&self) -> BoxFuture<'_, Result<(), DeviceError>> {
        async move {
            let stalled = self.live()?.stall_pings;
            if stalled {
                futures::future::pending::<()>().await;
            }
            Ok(())
        }
        .boxed()
    }

    fn list_present_subjects(&self) -> BoxFuture<'_, Result<Vec<SubjectId>, DeviceError>> {
        async move {
            let s = self.live()?;
            if s.fail_presence {
                return Err(DeviceError::CallFailed {
                    call: "ALMemory.getData".into(),
                    details: "simulated presence failure".into(),
                });
            }
            Ok(s.presence.clone())
        }
        .boxed()
    }

    fn request_expression_analysis(
        &self,
        subject: SubjectId,
    ) -> BoxFuture<'_, Result<(), DeviceError>> {
        async move {
            self.live()?.analysis_requests.push(subject);
            Ok(())
        }
        .boxed()
    }

    fn read_expression_scores(
        &self,
        _subject: SubjectId,
    ) -> BoxFuture<'_, Result<Option<Vec<f32>>, DeviceError>> {
        async move {
            let mut s = self.live()?;
            match s.score_script.pop_front() {
                Some(next) => {
                    s.score_script.push_back(next.clone());
                    Ok(next)
                }
                None => Ok(s.scores.clone()),
            }
        }
        .boxed()
    }

    fn set_prosody_parameter(
        &self,
        name: &'static str,
        value: f32,
    ) -> BoxFuture<'_, Result<(), DeviceError>> {
        async move {
            self.live()?.parameters.push((name, value));
            Ok(())
        }
        .boxed()
    }

    fn say(&self, annotated: String) -> BoxFuture<'_, Result<(), DeviceError>> {
        async move {
            let (_, duration) = self.record_speech(annotated)?;
            tokio::time::sleep(duration).await;
            Ok(())
        }
        .boxed()
    }

    fn post_say(&self, annotated: String) -> BoxFuture<'_, Result<SpeechTask, DeviceError>> {
        async move { self.record_speech(annotated).map(|(task, _)| task) }.boxed()
    }

    fn wait(&self, _task: SpeechTask) -> BoxFuture<'_, Result<(), DeviceError>> {
        async move {
            let duration = self.live()?.speech_duration;
            tokio::time::sleep(duration).await;
            Ok(())
        }
        .boxed()
    }

    fn play_gesture(&self, gesture: String) -> BoxFuture<'_, Result<(), DeviceError>> {
        async move {
            self.live()?.gestures.push(gesture);
            Ok(())
        }
        .boxed()
    }

    fn start_awareness(&self) -> BoxFuture<'_, Result<(), DeviceError>> {
        async move {
            self.live()?.awareness = true;
            Ok(())
        }
        .boxed()
    }

    fn stop_awareness(&self) -> BoxFuture<'_, Result<(), DeviceError>> {
        async move {
            self.live()?.awareness = false;
            Ok(())
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        async move {
            self.device.lock().closes += 1;
        }
        .boxed()
    }
}
