use crate::config::{AuthMethod, HostKeyPolicy, SshConnectConfig};
use crate::sftp::SftpClient;
use crate::transport::{
    Connector, RemoteFs, ShellChannel, ShellRead, ShellReader, ShellWriter, Transport,
    TransportError,
};
use async_trait::async_trait;
use russh::client::{Config as ClientConfig, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{load_secret_key, Algorithm, HashAlg};
use russh::{client, ChannelMsg, ChannelWriteHalf, Disconnect};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct SshClient;

/// `Connector` backed by [`SshClient::connect`].
#[derive(Clone, Default)]
pub struct SshConnector;

#[derive(Clone)]
pub struct SshSession {
    handle: Arc<Handle<ClientHandler>>,
    config: Arc<SshConnectConfig>,
    closed: Arc<AtomicBool>,
}

struct SshShellReader {
    output: mpsc::Receiver<Vec<u8>>,
}

struct SshShellWriter {
    writer: Mutex<ChannelWriteHalf<russh::client::Msg>>,
    closed: Arc<AtomicBool>,
}

impl SshClient {
    pub async fn connect(cfg: SshConnectConfig) -> Result<SshSession, TransportError> {
        let client_config = Arc::new(build_client_config(&cfg));
        let handler = ClientHandler {
            host: cfg.host.clone(),
            port: cfg.port,
            policy: cfg.host_key_policy.clone(),
        };

        let addr = (cfg.host.as_str(), cfg.port);
        let timeout = Duration::from_millis(cfg.connect_timeout_ms);
        let mut handle = match tokio::time::timeout(
            timeout,
            client::connect(client_config, addr, handler),
        )
        .await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(err)) => return Err(TransportError::Connect(err.to_string())),
            Err(_) => {
                return Err(TransportError::Connect(format!(
                    "timed out after {}ms",
                    cfg.connect_timeout_ms
                )))
            }
        };

        authenticate(&mut handle, &cfg.username, &cfg.auth_method).await?;
        info!(host = %cfg.host, port = cfg.port, user = %cfg.username, "ssh authenticated");

        Ok(SshSession {
            handle: Arc::new(handle),
            config: Arc::new(cfg),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

impl SshSession {
    pub fn config(&self) -> &SshConnectConfig {
        &self.config
    }

    pub async fn open_shell(&self) -> Result<ShellChannel, TransportError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(channel_err)?;
        channel
            .request_pty(
                true,
                &self.config.term,
                self.config.term_width,
                self.config.term_height,
                0,
                0,
                &[],
            )
            .await
            .map_err(channel_err)?;
        channel.request_shell(true).await.map_err(channel_err)?;

        let (mut reader, writer) = channel.split();
        let (tx, rx) = mpsc::channel(1024);
        let closed = Arc::new(AtomicBool::new(false));
        let pump_closed = closed.clone();

        tokio::spawn(async move {
            while let Some(msg) = reader.wait().await {
                match msg {
                    ChannelMsg::Data { data } => {
                        if tx.send(data.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    ChannelMsg::ExtendedData { data, .. } => {
                        if tx.send(data.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        debug!(exit_status, "shell exit status");
                    }
                    ChannelMsg::Eof | ChannelMsg::Close => break,
                    _ => {}
                }
            }
            pump_closed.store(true, Ordering::SeqCst);
        });

        Ok(ShellChannel {
            reader: Box::new(SshShellReader { output: rx }),
            writer: Arc::new(SshShellWriter {
                writer: Mutex::new(writer),
                closed,
            }),
        })
    }

    pub async fn open_sftp(&self, op_timeout: Duration) -> Result<SftpClient, TransportError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(channel_err)?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(channel_err)?;
        SftpClient::new(channel.into_stream(), op_timeout)
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.handle.is_closed()
    }
}

#[async_trait]
impl Transport for SshSession {
    async fn open_shell(&self) -> Result<ShellChannel, TransportError> {
        SshSession::open_shell(self).await
    }

    async fn open_sftp(&self, op_timeout: Duration) -> Result<Arc<dyn RemoteFs>, TransportError> {
        let client = SshSession::open_sftp(self, op_timeout).await?;
        Ok(Arc::new(client))
    }

    async fn close(&self) -> Result<(), TransportError> {
        SshSession::close(self).await
    }

    fn is_closed(&self) -> bool {
        SshSession::is_closed(self)
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, cfg: SshConnectConfig) -> Result<Arc<dyn Transport>, TransportError> {
        let session = SshClient::connect(cfg).await?;
        Ok(Arc::new(session))
    }
}

#[async_trait]
impl ShellReader for SshShellReader {
    async fn read(&mut self, timeout: Duration) -> ShellRead {
        match tokio::time::timeout(timeout, self.output.recv()).await {
            Ok(Some(data)) => ShellRead::Data(data),
            Ok(None) => ShellRead::Closed,
            Err(_) => ShellRead::Timeout,
        }
    }
}

#[async_trait]
impl ShellWriter for SshShellWriter {
    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let writer = self.writer.lock().await;
        let mut stream = writer.make_writer();
        stream
            .write_all(data)
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let writer = self.writer.lock().await;
        writer.close().await.map_err(channel_err)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> impl std::future::Future<Output = Result<bool, Self::Error>> + Send {
        let host = self.host.clone();
        let port = self.port;
        let policy = self.policy.clone();
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        async move {
            match policy {
                HostKeyPolicy::AcceptAny => {
                    warn!(%fingerprint, "accepting host key for {}:{}", host, port);
                    Ok(true)
                }
                HostKeyPolicy::Pinned { fingerprints } => {
                    let known = fingerprints.iter().any(|f| f == &fingerprint);
                    if !known {
                        warn!(%fingerprint, "host key for {}:{} is not pinned", host, port);
                    }
                    Ok(known)
                }
            }
        }
    }
}

fn build_client_config(cfg: &SshConnectConfig) -> ClientConfig {
    ClientConfig {
        keepalive_interval: Some(Duration::from_secs(cfg.keepalive_interval_secs)),
        keepalive_max: 3,
        ..Default::default()
    }
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    username: &str,
    auth: &AuthMethod,
) -> Result<(), TransportError> {
    let user = username.to_string();
    let res = match auth {
        AuthMethod::Password { password } => handle
            .authenticate_password(user, password.to_string())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?,
        AuthMethod::Key {
            private_key_path,
            passphrase,
        } => {
            let key = load_private_key(private_key_path, passphrase.as_ref().map(|v| v.as_str()))?;
            let hash = if matches!(key.algorithm(), Algorithm::Rsa { .. }) {
                handle
                    .best_supported_rsa_hash()
                    .await
                    .map_err(|e| TransportError::Connect(e.to_string()))?
                    .flatten()
            } else {
                None
            };
            let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), hash);
            handle
                .authenticate_publickey(user, key_with_hash)
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?
        }
    };
    match res {
        russh::client::AuthResult::Success => Ok(()),
        russh::client::AuthResult::Failure { .. } => {
            Err(TransportError::Auth("credentials rejected".to_string()))
        }
    }
}

fn load_private_key(
    path: &Path,
    passphrase: Option<&str>,
) -> Result<russh::keys::PrivateKey, TransportError> {
    load_secret_key(path, passphrase)
        .map_err(|e| TransportError::Auth(format!("cannot load key {}: {}", path.display(), e)))
}

fn channel_err(err: russh::Error) -> TransportError {
    TransportError::Channel(err.to_string())
}
