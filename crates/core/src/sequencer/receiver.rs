use crate::config::TimingConfig;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const LOG_TARGET: &str = "affect::receiver";

/// Upper bound on one inbound label; anything beyond is ignored.
pub const MAX_LABEL_BYTES: usize = 1024;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ReceiverError {
    #[error("cannot listen on {addr}: {details}")]
    Bind { addr: String, details: String },
}

/// Accepts connections that each carry one emotion label and forwards the normalized
/// label downstream.
pub struct LabelReceiver {
    listener: TcpListener,
    local_addr: SocketAddr,
    read_timeout: Duration,
}

impl LabelReceiver {
    pub async fn bind(addr: SocketAddr) -> Result<Self, ReceiverError> {
        let bind_error = |e: std::io::Error| ReceiverError::Bind {
            addr: addr.to_string(),
            details: e.to_string(),
        };
        let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        tracing::info!(target: LOG_TARGET, %local_addr, "listening for emotion labels");
        Ok(Self {
            listener,
            local_addr,
            read_timeout: TimingConfig::default().label_read_timeout(),
        })
    }

    /// A sender that stays silent longer than this is dropped so the next one is served.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves connections one at a time, so labels reach the channel in arrival order.
    pub async fn run(self, labels: mpsc::Sender<String>, cancel: CancellationToken) {
        loop {
            let (mut stream, peer) = tokio::select! {
                () = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(target: LOG_TARGET, error = %e, "accept failed");
                        continue;
                    }
                },
            };

            let label = match tokio::time::timeout(self.read_timeout, read_label(&mut stream)).await {
                Ok(Ok(Some(label))) => label,
                Ok(Ok(None)) => {
                    tracing::debug!(target: LOG_TARGET, %peer, "empty label ignored");
                    continue;
                }
                Ok(Err(e)) => {
                    tracing::warn!(target: LOG_TARGET, %peer, error = %e, "failed to read label");
                    continue;
                }
                Err(_) => {
                    tracing::warn!(target: LOG_TARGET, %peer, "peer sent nothing in time");
                    continue;
                }
            };

            tracing::debug!(target: LOG_TARGET, %peer, %label, "label received");
            if labels.send(label).await.is_err() {
                tracing::debug!(target: LOG_TARGET, "label consumer gone");
                break;
            }
        }
        tracing::info!(target: LOG_TARGET, "label receiver stopped");
    }
}

/// One read per connection, as senders write a single label and close.
async fn read_label(stream: &mut TcpStream) -> std::io::Result<Option<String>> {
    let mut buf = BytesMut::with_capacity(MAX_LABEL_BYTES);
    stream
        .take(MAX_LABEL_BYTES as u64)
        .read_buf(&mut buf)
        .await?;
    Ok(normalize_label(&buf))
}

fn normalize_label(raw: &[u8]) -> Option<String> {
    let label = String::from_utf8_lossy(raw).trim().to_lowercase();
    (!label.is_empty()).then_some(label)
}
