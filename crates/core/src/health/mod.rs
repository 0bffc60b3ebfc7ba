//! Liveness probing and serialized reconnection for the shared device session.

use crate::config::{DeviceAddress, ReconnectConfig, TimingConfig};
use crate::device::{DeviceError, DeviceSession, SessionFactory};
use crate::util::{retry_with_backoff, RetryConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

const LOG_TARGET: &str = "affect::monitor";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("initial connection failed: {0}")]
    InitialConnect(DeviceError),
    #[error("reconnect gave up after {attempts} attempts: {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: DeviceError },
}

/// Owns the device session shared by every loop. Only the monitor replaces the
/// session; concurrent reconnect requests are serialized and a caller that finds the
/// session already restored returns without another attempt.
pub struct ConnectionMonitor {
    factory: Arc<dyn SessionFactory>,
    address: DeviceAddress,
    policy: ReconnectConfig,
    probe_timeout: Duration,
    session: RwLock<Option<Arc<dyn DeviceSession>>>,
    reconnecting: Mutex<()>,
    connected: AtomicBool,
}

impl ConnectionMonitor {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        address: DeviceAddress,
        policy: ReconnectConfig,
    ) -> Self {
        Self {
            factory,
            address,
            policy,
            probe_timeout: TimingConfig::default().probe_timeout(),
            session: RwLock::new(None),
            reconnecting: Mutex::new(()),
            connected: AtomicBool::new(false),
        }
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    pub fn state(&self) -> ConnectionState {
        if self.connected.load(Ordering::Acquire) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub async fn session(&self) -> Option<Arc<dyn DeviceSession>> {
        self.session.read().await.clone()
    }

    /// Single attempt used at startup.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let _guard = self.reconnecting.lock().await;
        self.establish().await.map_err(ConnectionError::InitialConnect)
    }

    /// Round-trip probe. Never errors: any fault, including a probe that does not come
    /// back in time, reads as unhealthy.
    pub async fn is_healthy(&self) -> bool {
        let Some(session) = self.session().await else {
            self.connected.store(false, Ordering::Release);
            return false;
        };
        let healthy = matches!(
            tokio::time::timeout(self.probe_timeout, session.ping()).await,
            Ok(Ok(()))
        );
        if !healthy && self.connected.swap(false, Ordering::AcqRel) {
            tracing::warn!(target: LOG_TARGET, address = %self.address, "device session stopped answering");
        }
        healthy
    }

    /// Tears down and recreates the session, retrying with a fixed delay.
    pub async fn reconnect(
        &self,
        max_attempts: u32,
        backoff: Duration,
    ) -> Result<(), ConnectionError> {
        let _guard = self.reconnecting.lock().await;
        if self.is_healthy().await {
            tracing::debug!(target: LOG_TARGET, "session already restored by another caller");
            return Ok(());
        }

        tracing::warn!(target: LOG_TARGET, address = %self.address, max_attempts, "attempting to reconnect");
        retry_with_backoff(
            &RetryConfig::fixed(max_attempts, backoff),
            || self.establish(),
            |_| true,
        )
        .await
        .map(|()| {
            tracing::info!(target: LOG_TARGET, address = %self.address, "reconnection successful");
        })
        .map_err(|exhausted| {
            tracing::error!(
                target: LOG_TARGET,
                attempts = exhausted.attempts,
                error = %exhausted.last_error,
                "reconnection attempts exhausted"
            );
            ConnectionError::ExhaustedRetries {
                attempts: exhausted.attempts,
                last_error: exhausted.last_error,
            }
        })
    }

    /// Health gate used before touching the device: probe, reconnect with the
    /// configured policy if needed, and hand out the live session.
    pub async fn ensure_connected(&self) -> Result<Arc<dyn DeviceSession>, ConnectionError> {
        if !self.is_healthy().await {
            self.reconnect(self.policy.max_attempts, self.policy.backoff())
                .await?;
        }
        self.session()
            .await
            .ok_or(ConnectionError::ExhaustedRetries {
                attempts: 0,
                last_error: DeviceError::NotConnected,
            })
    }

    /// Releases the session. Callers must have stopped every loop first.
    pub async fn shutdown(&self) {
        let _guard = self.reconnecting.lock().await;
        let old = self.session.write().await.take();
        self.connected.store(false, Ordering::Release);
        if let Some(old) = old {
            old.close().await;
            tracing::info!(target: LOG_TARGET, "device session released");
        }
    }

    /// Caller must hold `reconnecting`.
    async fn establish(&self) -> Result<(), DeviceError> {
        let old = self.session.write().await.take();
        self.connected.store(false, Ordering::Release);
        if let Some(old) = old {
            old.close().await;
        }

        let fresh = self.factory.connect(self.address.clone()).await?;
        *self.session.write().await = Some(fresh);
        self.connected.store(true, Ordering::Release);
        tracing::debug!(target: LOG_TARGET, address = %self.address, "session established");
        Ok(())
    }
}
