//! Wires the components into the running system and owns the shutdown order: stop
//! the loops, join them, stop awareness, then release the session.

use crate::actuator::{Actuator, DeviceActuator};
use crate::config::{ConfigError, ControllerConfig};
use crate::device::SessionFactory;
use crate::driver::{DriverReport, OutputDriver};
use crate::emotion::emotion_cell;
use crate::health::{ConnectionError, ConnectionMonitor};
use crate::perception::PerceptionSampler;
use crate::selector::GestureSelector;
use crate::sequencer::{
    AdaptiveSequencer, LabelReceiver, PhraseTable, ReceiverError, StoryReport, StoryTeller,
};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const LOG_TARGET: &str = "affect::controller";
const LABEL_CHANNEL_CAPACITY: usize = 32;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Receiver(#[from] ReceiverError),
    #[error("{0} loop exited unexpectedly")]
    LoopExited(&'static str),
    #[error("task failed: {0}")]
    TaskFailed(String),
}

#[derive(Clone, Debug)]
pub enum Mode {
    /// Repeat `text` while adapting delivery to the sampled emotion.
    Narrate { text: String },
    /// Tell `phrases` in order, driven by labels pushed over TCP.
    Story { phrases: PhraseTable },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunStatus {
    /// Stop was requested.
    Stopped,
    /// The story reached its last phrase.
    Completed,
    Faulted(ControllerError),
}

impl RunStatus {
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Faulted(_))
    }
}

enum LoopExit {
    Perception,
    Output(DriverReport),
    Receiver,
    Story(StoryReport),
}

impl LoopExit {
    fn name(&self) -> &'static str {
        match self {
            Self::Perception => "perception",
            Self::Output(_) => "output",
            Self::Receiver => "receiver",
            Self::Story(_) => "story",
        }
    }
}

pub struct Controller {
    config: ControllerConfig,
    monitor: Arc<ConnectionMonitor>,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        factory: Arc<dyn SessionFactory>,
    ) -> Result<Self, ControllerError> {
        config.validate()?;
        let monitor = Arc::new(
            ConnectionMonitor::new(factory, config.device_address.clone(), config.reconnect)
                .with_probe_timeout(config.timing.probe_timeout()),
        );
        Ok(Self { config, monitor })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<ConnectionMonitor> {
        &self.monitor
    }

    /// Runs `mode` until `cancel` fires, the story completes or a fault makes going on
    /// pointless. The device session is always released before returning.
    pub async fn run(&self, mode: Mode, cancel: CancellationToken) -> RunStatus {
        tracing::info!(target: LOG_TARGET, address = %self.config.device_address, "connecting to device");
        if let Err(e) = self.monitor.connect().await {
            tracing::error!(target: LOG_TARGET, error = %e, "initial connection failed");
            self.monitor.shutdown().await;
            return RunStatus::Faulted(e.into());
        }

        self.start_awareness().await;
        let status = match mode {
            Mode::Narrate { text } => self.narrate(text, &cancel).await,
            Mode::Story { phrases } => self.tell_story(phrases, &cancel).await,
        };
        self.stop_awareness().await;
        self.monitor.shutdown().await;

        match &status {
            RunStatus::Faulted(e) => {
                tracing::error!(target: LOG_TARGET, error = %e, "controller stopped on fault");
            }
            other => tracing::info!(target: LOG_TARGET, status = ?other, "controller stopped"),
        }
        status
    }

    fn actuator(&self) -> Arc<dyn Actuator> {
        Arc::new(DeviceActuator::new(self.monitor.clone()))
    }

    async fn narrate(&self, text: String, cancel: &CancellationToken) -> RunStatus {
        let loops = cancel.child_token();
        let (writer, reader) = emotion_cell();
        let sampler = PerceptionSampler::new(self.monitor.clone(), writer, &self.config);
        let driver = OutputDriver::new(
            reader,
            GestureSelector::from_config(&self.config),
            self.actuator(),
            &self.config,
        );

        let mut tasks = JoinSet::new();
        {
            let loops = loops.clone();
            tasks.spawn(async move {
                sampler.run(loops).await;
                LoopExit::Perception
            });
        }
        {
            let loops = loops.clone();
            tasks.spawn(async move { LoopExit::Output(driver.run(&text, loops).await) });
        }

        let status = tokio::select! {
            () = cancel.cancelled() => RunStatus::Stopped,
            Some(joined) = tasks.join_next() => match joined {
                Ok(exit) => RunStatus::Faulted(ControllerError::LoopExited(exit.name())),
                Err(e) => RunStatus::Faulted(ControllerError::TaskFailed(e.to_string())),
            },
        };
        loops.cancel();
        drain(tasks).await;
        status
    }

    async fn tell_story(&self, phrases: PhraseTable, cancel: &CancellationToken) -> RunStatus {
        let receiver = match self.config.listen_socket_addr() {
            Ok(addr) => LabelReceiver::bind(addr)
                .await
                .map(|r| r.with_read_timeout(self.config.timing.label_read_timeout()))
                .map_err(ControllerError::from),
            Err(e) => Err(e.into()),
        };
        let receiver = match receiver {
            Ok(receiver) => receiver,
            Err(e) => return RunStatus::Faulted(e),
        };

        let loops = cancel.child_token();
        let (tx, rx) = tokio::sync::mpsc::channel(LABEL_CHANNEL_CAPACITY);
        let teller = StoryTeller::new(
            AdaptiveSequencer::from_config(phrases, &self.config),
            GestureSelector::from_config(&self.config),
            self.actuator(),
            &self.config,
        );

        let mut tasks = JoinSet::new();
        {
            let loops = loops.clone();
            tasks.spawn(async move {
                receiver.run(tx, loops).await;
                LoopExit::Receiver
            });
        }
        {
            let loops = loops.clone();
            tasks.spawn(async move { LoopExit::Story(teller.run(rx, loops).await) });
        }

        let status = tokio::select! {
            () = cancel.cancelled() => RunStatus::Stopped,
            Some(joined) = tasks.join_next() => match joined {
                Ok(LoopExit::Story(report)) if report.finished => RunStatus::Completed,
                Ok(exit) => RunStatus::Faulted(ControllerError::LoopExited(exit.name())),
                Err(e) => RunStatus::Faulted(ControllerError::TaskFailed(e.to_string())),
            },
        };
        loops.cancel();
        drain(tasks).await;
        status
    }

    async fn start_awareness(&self) {
        match self.monitor.ensure_connected().await {
            Ok(session) => match session.start_awareness().await {
                Ok(()) => tracing::debug!(target: LOG_TARGET, "awareness started"),
                Err(e) => {
                    tracing::warn!(target: LOG_TARGET, error = %e, "failed to start awareness")
                }
            },
            Err(e) => tracing::warn!(target: LOG_TARGET, error = %e, "awareness not started"),
        }
    }

    /// No reconnect here: a dead session has nothing left to stop.
    async fn stop_awareness(&self) {
        if let Some(session) = self.monitor.session().await {
            if let Err(e) = session.stop_awareness().await {
                tracing::warn!(target: LOG_TARGET, error = %e, "failed to stop awareness");
            }
        }
    }
}

async fn drain(mut tasks: JoinSet<LoopExit>) {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(LoopExit::Output(report)) => {
                tracing::info!(target: LOG_TARGET, passes = report.passes, spoken = report.spoken, failed = report.failed, "output loop joined");
            }
            Ok(LoopExit::Story(report)) => {
                tracing::info!(target: LOG_TARGET, events = report.events, spoken = report.spoken, "story joined");
            }
            Ok(exit) => tracing::debug!(target: LOG_TARGET, task = exit.name(), "loop joined"),
            Err(e) => tracing::error!(target: LOG_TARGET, error = %e, "loop task failed"),
        }
    }
}
