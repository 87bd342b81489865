use crate::error::CoreError;
use crate::events::{Event, EventBus};
use forgeterm_ssh::{AuthMethod, RemoteFs, ShellWriter, Transport};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use zeroize::Zeroizing;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub hostname: String,
    pub port: u16,
    pub username: String,
}

impl Endpoint {
    pub fn new(hostname: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            username: username.into(),
        }
    }
}

#[derive(Clone, Default)]
pub struct Credentials {
    pub password: Option<Zeroizing<String>>,
    pub key_path: Option<PathBuf>,
}

impl Credentials {
    pub fn password(password: impl Into<String>) -> Self {
        Self {
            password: Some(Zeroizing::new(password.into())),
            key_path: None,
        }
    }

    pub fn key(path: impl Into<PathBuf>, passphrase: Option<String>) -> Self {
        Self {
            password: passphrase.map(Zeroizing::new),
            key_path: Some(path.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        let no_password = self.password.as_ref().map_or(true, |p| p.is_empty());
        no_password && self.key_path.is_none()
    }

    /// A key path takes precedence; the password then unlocks the key.
    pub fn auth_method(&self) -> Option<AuthMethod> {
        if let Some(path) = &self.key_path {
            return Some(AuthMethod::Key {
                private_key_path: path.clone(),
                passphrase: self.password.clone().filter(|p| !p.is_empty()),
            });
        }
        self.password
            .clone()
            .filter(|p| !p.is_empty())
            .map(|password| AuthMethod::Password { password })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("key_path", &self.key_path)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessRecord {
    pub name: String,
    pub pid: u32,
}

/// Live handles of a connected session. Taken out of the record before
/// they are closed so concurrent tasks see them as gone.
#[derive(Default)]
pub(crate) struct Handles {
    pub transport: Option<Arc<dyn Transport>>,
    pub shell: Option<Arc<dyn ShellWriter>>,
    pub sftp: Option<Arc<dyn RemoteFs>>,
}

impl Handles {
    pub fn is_empty(&self) -> bool {
        self.transport.is_none() && self.shell.is_none() && self.sftp.is_none()
    }

    /// Closes every handle independently. Returns false if any close failed.
    pub async fn close_all(self) -> bool {
        let mut clean = true;
        if let Some(shell) = self.shell {
            if let Err(err) = shell.close().await {
                warn!(error = %err, "closing shell failed");
                clean = false;
            }
        }
        if let Some(sftp) = self.sftp {
            if let Err(err) = sftp.close().await {
                warn!(error = %err, "closing sftp channel failed");
                clean = false;
            }
        }
        if let Some(transport) = self.transport {
            if let Err(err) = transport.close().await {
                warn!(error = %err, "closing transport failed");
                clean = false;
            }
        }
        clean
    }
}

#[derive(Default)]
struct SessionRecord {
    endpoint: Option<Endpoint>,
    handles: Handles,
    processes: HashMap<String, u32>,
}

struct SessionInner {
    record: Mutex<SessionRecord>,
    state: watch::Sender<ConnectionState>,
    disconnecting: AtomicBool,
    bus: EventBus,
}

/// The one SSH session of the application, shared by the connection
/// manager, the SFTP broker and the background loops.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(bus: EventBus) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(SessionInner {
                record: Mutex::new(SessionRecord::default()),
                state,
                disconnecting: AtomicBool::new(false),
                bus,
            }),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.inner.record.lock().endpoint.clone()
    }

    /// Processes seen in shell output, ordered by name.
    pub fn known_processes(&self) -> Vec<ProcessRecord> {
        let record = self.inner.record.lock();
        let mut out: Vec<ProcessRecord> = record
            .processes
            .iter()
            .map(|(name, pid)| ProcessRecord {
                name: name.clone(),
                pid: *pid,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Disconnected -> Connecting. Anything else is a live or pending session.
    pub(crate) fn begin_connect(&self, endpoint: &Endpoint) -> Result<(), CoreError> {
        let moved = self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !moved {
            let current = self
                .endpoint()
                .map(|e| e.hostname)
                .unwrap_or_else(|| endpoint.hostname.clone());
            return Err(CoreError::AlreadyConnected(current));
        }
        let mut record = self.inner.record.lock();
        record.endpoint = Some(endpoint.clone());
        record.processes.clear();
        Ok(())
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.inner.state.send_replace(state);
    }

    /// Stores the live handles and moves Connecting -> Connected. Returns
    /// false if a disconnect got in first; the handles are then left for
    /// the caller to take back and close.
    pub(crate) fn install(
        &self,
        transport: Arc<dyn Transport>,
        shell: Arc<dyn ShellWriter>,
    ) -> bool {
        self.inner.record.lock().handles = Handles {
            transport: Some(transport),
            shell: Some(shell),
            sftp: None,
        };
        self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Connected;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn transport(&self) -> Option<Arc<dyn Transport>> {
        if !self.is_connected() {
            return None;
        }
        self.inner.record.lock().handles.transport.clone()
    }

    pub(crate) fn shell(&self) -> Option<Arc<dyn ShellWriter>> {
        if !self.is_connected() {
            return None;
        }
        self.inner.record.lock().handles.shell.clone()
    }

    pub(crate) fn sftp(&self) -> Option<Arc<dyn RemoteFs>> {
        self.inner.record.lock().handles.sftp.clone()
    }

    /// Caches a freshly opened channel. Refused (and handed back) when the
    /// session stopped being Connected while it was opening.
    pub(crate) fn set_sftp(&self, sftp: Arc<dyn RemoteFs>) -> Result<(), Arc<dyn RemoteFs>> {
        let mut record = self.inner.record.lock();
        if self.state() != ConnectionState::Connected {
            return Err(sftp);
        }
        record.handles.sftp = Some(sftp);
        Ok(())
    }

    pub(crate) fn take_sftp(&self) -> Option<Arc<dyn RemoteFs>> {
        self.inner.record.lock().handles.sftp.take()
    }

    pub(crate) fn take_handles(&self) -> Handles {
        std::mem::take(&mut self.inner.record.lock().handles)
    }

    pub(crate) fn try_begin_disconnect(&self) -> Option<DisconnectGuard> {
        self.inner
            .disconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| DisconnectGuard {
                session: self.clone(),
            })
    }

    /// Connected -> Disconnected after the remote end went away. The handles
    /// are released on a background task. Returns false if the session was
    /// not Connected, e.g. because a disconnect already owns the teardown.
    pub(crate) fn mark_dropped(&self, reason: &str) -> bool {
        let moved = self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
        if !moved {
            return false;
        }
        info!(reason, "session dropped");
        let handles = self.take_handles();
        if !handles.is_empty() {
            tokio::spawn(async move {
                handles.close_all().await;
            });
        }
        self.emit_state_change(false);
        self.bus().status("Disconnected");
        true
    }

    pub(crate) fn emit_state_change(&self, connected: bool) {
        let (host, user) = self
            .endpoint()
            .map(|e| (e.hostname, e.username))
            .unwrap_or_default();
        self.bus().send(Event::ConnectionStateChanged {
            connected,
            host,
            user,
        });
    }

    pub(crate) fn record_process(&self, record: &ProcessRecord) {
        self.inner
            .record
            .lock()
            .processes
            .insert(record.name.clone(), record.pid);
    }

    /// Removes the first known process with `pid`.
    pub(crate) fn remove_process(&self, pid: u32) -> Option<ProcessRecord> {
        let mut record = self.inner.record.lock();
        let name = record
            .processes
            .iter()
            .find(|(_, p)| **p == pid)
            .map(|(name, _)| name.clone())?;
        record.processes.remove(&name);
        Some(ProcessRecord { name, pid })
    }
}

/// Held for the duration of one disconnect; releases the guard on drop.
pub(crate) struct DisconnectGuard {
    session: Session,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.session
            .inner
            .disconnecting
            .store(false, Ordering::SeqCst);
    }
}
