use crate::classifier::{ChunkDecoder, LineBuffer, LineEvent, OutputClassifier};
use crate::error::CoreError;
use crate::events::{Event, StatUpdate};
use crate::monitor::{spawn_stats_poller, StatsSchedule};
use crate::session::{ConnectionState, Credentials, Endpoint, ProcessRecord, Session};
use forgeterm_config::SessionConfig;
use forgeterm_ssh::{
    AuthMethod, Connector, HostKeyPolicy, ShellChannel, ShellRead, ShellReader, ShellWriter,
    SshConnectConfig, TransportError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const KILL_PREFIX: &str = "kill-process:";

/// Owns the session lifecycle: connect, disconnect, command input and the
/// background reader and stats loops.
#[derive(Clone)]
pub struct ConnectionManager {
    session: Session,
    connector: Arc<dyn Connector>,
    settings: SessionConfig,
    host_key_policy: HostKeyPolicy,
}

impl ConnectionManager {
    pub fn new(session: Session, connector: Arc<dyn Connector>, settings: SessionConfig) -> Self {
        Self {
            session,
            connector,
            settings,
            host_key_policy: HostKeyPolicy::AcceptAny,
        }
    }

    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = policy;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn known_processes(&self) -> Vec<ProcessRecord> {
        self.session.known_processes()
    }

    /// Missing credentials and a session that is already up are rejected
    /// before any task is spawned; the handle then resolves immediately.
    pub fn connect(
        &self,
        endpoint: Endpoint,
        credentials: Credentials,
    ) -> JoinHandle<Result<(), CoreError>> {
        let Some(auth) = credentials.auth_method() else {
            warn!(host = %endpoint.hostname, "connect refused: no credentials");
            return tokio::spawn(async { Err(CoreError::NoCredentials) });
        };
        if let Err(err) = self.session.begin_connect(&endpoint) {
            warn!(host = %endpoint.hostname, error = %err, "connect refused");
            return tokio::spawn(async move { Err(err) });
        }
        let manager = self.clone();
        tokio::spawn(async move { manager.run_connect(endpoint, auth).await })
    }

    fn connect_config(&self, endpoint: &Endpoint, auth: AuthMethod) -> SshConnectConfig {
        let mut cfg = SshConnectConfig::new(
            endpoint.hostname.clone(),
            endpoint.port,
            endpoint.username.clone(),
            auth,
        );
        cfg.host_key_policy = self.host_key_policy.clone();
        cfg.connect_timeout_ms = self.settings.connect_timeout_ms;
        cfg.keepalive_interval_secs = self.settings.keepalive_interval_secs;
        cfg
    }

    async fn run_connect(&self, endpoint: Endpoint, auth: AuthMethod) -> Result<(), CoreError> {
        let bus = self.session.bus();
        bus.status(format!("Connecting to {}...", endpoint.hostname));
        info!(
            host = %endpoint.hostname,
            port = endpoint.port,
            user = %endpoint.username,
            "connecting"
        );

        let transport = match self.connector.connect(self.connect_config(&endpoint, auth)).await {
            Ok(transport) => transport,
            Err(err) => return Err(self.connect_failed(&endpoint, err)),
        };
        let ShellChannel { reader, writer } = match transport.open_shell().await {
            Ok(shell) => shell,
            Err(err) => {
                if let Err(close_err) = transport.close().await {
                    debug!(error = %close_err, "closing half-open transport failed");
                }
                return Err(self.connect_failed(&endpoint, err));
            }
        };

        if !self.session.install(transport, writer) {
            self.session.take_handles().close_all().await;
            warn!(host = %endpoint.hostname, "disconnect arrived while connecting");
            return Err(CoreError::ConnectionFailed(
                "disconnected while connecting".to_string(),
            ));
        }

        self.spawn_reader(reader);
        if self.settings.stats_enabled {
            spawn_stats_poller(
                self.session.clone(),
                StatsSchedule::from_config(&self.settings),
            );
        }
        info!(host = %endpoint.hostname, user = %endpoint.username, "connected");
        self.session.emit_state_change(true);
        bus.status(format!("Connected to {}", endpoint.hostname));
        Ok(())
    }

    fn connect_failed(&self, endpoint: &Endpoint, err: TransportError) -> CoreError {
        self.session.set_state(ConnectionState::Disconnected);
        error!(host = %endpoint.hostname, error = %err, "connection failed");
        match err {
            TransportError::Auth(msg) => {
                self.session.bus().status("Authentication failed");
                CoreError::AuthenticationFailed(msg)
            }
            other => {
                self.session.bus().status("Connection failed");
                CoreError::ConnectionFailed(other.to_string())
            }
        }
    }

    /// A second call while one is running fails with
    /// `DisconnectInProgress`; it is never queued.
    pub fn disconnect(&self) -> JoinHandle<Result<(), CoreError>> {
        let Some(guard) = self.session.try_begin_disconnect() else {
            warn!("disconnect already in progress");
            return tokio::spawn(async { Err(CoreError::DisconnectInProgress) });
        };
        if self.session.state() == ConnectionState::Disconnected {
            debug!("not connected, nothing to disconnect");
            drop(guard);
            return tokio::spawn(async { Ok(()) });
        }
        let manager = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            manager.run_disconnect().await
        })
    }

    async fn run_disconnect(&self) -> Result<(), CoreError> {
        let bus = self.session.bus();
        bus.status("Disconnecting...");
        self.session.set_state(ConnectionState::Disconnecting);
        tokio::time::sleep(Duration::from_millis(self.settings.disconnect_grace_ms)).await;

        let clean = self.session.take_handles().close_all().await;
        self.session.set_state(ConnectionState::Disconnected);
        self.session.emit_state_change(false);
        bus.status("Disconnected");
        if let Some(endpoint) = self.session.endpoint() {
            bus.output(format!(
                "[Disconnected from {}@{}]\n",
                endpoint.username, endpoint.hostname
            ));
        }
        info!(clean, "disconnected");
        if clean {
            Ok(())
        } else {
            Err(CoreError::CloseIncomplete)
        }
    }

    /// Writes `command` and a newline to the shell. `kill-process:<pid>` is
    /// handled here instead of being sent verbatim.
    pub async fn send_command(&self, command: &str) -> bool {
        let bus = self.session.bus();
        let Some(shell) = self.session.shell() else {
            bus.output("[Not connected to server]\n");
            return false;
        };

        if let Some(arg) = command.strip_prefix(KILL_PREFIX) {
            return match self.kill_process(shell.as_ref(), arg).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(command, error = %err, "kill-process failed");
                    false
                }
            };
        }

        match shell.write(format!("{command}\n").as_bytes()).await {
            Ok(()) => {
                info!("Command: {command}");
                true
            }
            Err(err) => {
                bus.output(format!("[Error sending command] {err}\n"));
                error!(command, error = %err, "sending command failed");
                false
            }
        }
    }

    async fn kill_process(&self, shell: &dyn ShellWriter, arg: &str) -> Result<(), CoreError> {
        if arg.contains(':') {
            return Err(CoreError::InvalidCommand(format!("{KILL_PREFIX}{arg}")));
        }
        let pid: u32 = arg
            .trim()
            .parse()
            .map_err(|_| CoreError::InvalidCommand(format!("{KILL_PREFIX}{arg}")))?;
        shell
            .write(format!("kill {pid}\n").as_bytes())
            .await
            .map_err(|e| CoreError::ConnectionFailed(e.to_string()))?;
        info!(pid, "sent kill");

        if let Some(record) = self.session.remove_process(pid) {
            self.session.bus().output(format!(
                "[Killed process: {} (PID: {})]\n",
                record.name, record.pid
            ));
            self.session.bus().send(Event::ProcessKilled(record));
        }
        Ok(())
    }

    fn spawn_reader(&self, reader: Box<dyn ShellReader>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move { manager.read_loop(reader).await })
    }

    async fn read_loop(&self, mut reader: Box<dyn ShellReader>) {
        let bus = self.session.bus();
        let timeout = Duration::from_millis(self.settings.shell_read_timeout_ms);
        let classifier = OutputClassifier::new(self.settings.stats_disk_path.clone());
        let mut decoder = ChunkDecoder::default();
        let mut lines = LineBuffer::default();
        let mut state = self.session.watch_state();

        loop {
            if *state.borrow_and_update() != ConnectionState::Connected {
                break;
            }
            let read = tokio::select! {
                read = reader.read(timeout) => read,
                _ = state.changed() => continue,
            };
            match read {
                ShellRead::Data(bytes) => {
                    let text = decoder.decode(&bytes);
                    if text.is_empty() {
                        continue;
                    }
                    bus.output(text.clone());
                    for line in lines.push(&text) {
                        self.handle_line(&classifier, &line);
                    }
                }
                ShellRead::Timeout => continue,
                ShellRead::Closed => {
                    info!("shell closed by remote end");
                    self.session.mark_dropped("shell closed");
                    break;
                }
                ShellRead::Error(msg) => {
                    if self.session.is_connected() {
                        bus.output(format!("[Error reading from server] {msg}\n"));
                        error!(error = %msg, "shell read failed, disconnecting");
                        drop(self.disconnect());
                    }
                    break;
                }
            }
        }
        debug!(state = ?self.session.state(), "shell reader finished");
    }

    fn handle_line(&self, classifier: &OutputClassifier, line: &str) {
        for event in classifier.classify(line) {
            let update = match event {
                LineEvent::ProcessStart { name, pid } => {
                    let record = ProcessRecord { name, pid };
                    info!(name = %record.name, pid, "detected process");
                    self.session.record_process(&record);
                    self.session.bus().send(Event::ProcessStarted(record));
                    continue;
                }
                LineEvent::Cpu { .. } => event.stat_text().map(StatUpdate::Cpu),
                LineEvent::Memory { .. } => event.stat_text().map(StatUpdate::Memory),
                LineEvent::Disk { .. } => event.stat_text().map(StatUpdate::Disk),
            };
            if let Some(update) = update {
                self.session.bus().send(Event::Stat(update));
            }
        }
    }
}
