use crate::session::Session;
use forgeterm_ssh::{RemoteFs, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Hands out the session's SFTP channel, opening it on first use and again
/// whenever the cached one has gone stale.
#[derive(Clone)]
pub struct SftpBroker {
    session: Session,
    op_timeout: Duration,
    open_lock: Arc<Mutex<()>>,
}

impl SftpBroker {
    pub fn new(session: Session, op_timeout: Duration) -> Self {
        Self {
            session,
            op_timeout,
            open_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// `None` means no channel can be had right now; the caller aborts or
    /// retries later.
    pub async fn channel(&self) -> Option<Arc<dyn RemoteFs>> {
        if !self.session.is_connected() {
            return None;
        }
        let _guard = self.open_lock.lock().await;

        if let Some(cached) = self.session.sftp() {
            if !cached.is_closed() {
                return Some(cached);
            }
            debug!("cached sftp channel is closed, reopening");
            self.discard_stale().await;
        }

        let transport = self.session.transport()?;
        match transport.open_sftp(self.op_timeout).await {
            Ok(channel) => match self.session.set_sftp(channel.clone()) {
                Ok(()) => {
                    debug!(timeout_secs = self.op_timeout.as_secs(), "sftp channel opened");
                    Some(channel)
                }
                Err(orphan) => {
                    let _ = orphan.close().await;
                    None
                }
            },
            Err(err) => {
                error!(error = %err, "failed to open sftp channel");
                if connection_gone(&err) || transport.is_closed() {
                    self.session.mark_dropped("sftp open failed on a dead session");
                }
                None
            }
        }
    }

    /// Best effort: errors are logged, the cache is always cleared.
    pub async fn close_channel(&self) {
        if let Some(channel) = self.session.take_sftp() {
            if let Err(err) = channel.close().await {
                warn!(error = %err, "closing sftp channel failed");
            }
        }
    }

    async fn discard_stale(&self) {
        if let Some(stale) = self.session.take_sftp() {
            let _ = stale.close().await;
        }
    }
}

fn connection_gone(err: &TransportError) -> bool {
    if matches!(err, TransportError::Closed) {
        return true;
    }
    let text = err.to_string().to_lowercase();
    ["not connected", "eof", "closed", "disconnect"]
        .iter()
        .any(|needle| text.contains(needle))
}
