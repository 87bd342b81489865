//! In-memory stand-ins for the SSH transport, used by the unit tests.

use crate::events::EventBus;
use crate::session::{Endpoint, Session};
use async_trait::async_trait;
use forgeterm_ssh::transport::ProgressSink;
use forgeterm_ssh::{
    Connector, FileKind, FsError, RemoteEntry, RemoteFs, RemoteMetadata, ShellChannel, ShellRead,
    ShellReader, ShellWriter, SshConnectConfig, Transport, TransportError,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const HOME: &str = "/home/test";
const MTIME: u64 = 1_700_000_000;

#[derive(Clone, Debug)]
enum Node {
    Dir,
    File(Vec<u8>),
    Symlink,
}

impl Node {
    fn metadata(&self) -> RemoteMetadata {
        let (mode, size) = match self {
            Node::Dir => (FileKind::DIR_BITS | 0o755, 4096),
            Node::File(data) => (FileKind::FILE_BITS | 0o644, data.len() as u64),
            Node::Symlink => (FileKind::LINK_BITS | 0o777, 0),
        };
        RemoteMetadata {
            size,
            mode,
            mtime: Some(MTIME),
        }
    }
}

#[derive(Default)]
struct FsState {
    nodes: BTreeMap<String, Node>,
    fail_download: HashMap<String, Option<usize>>,
    fail_upload: HashSet<String>,
    fail_remove: HashSet<String>,
    fail_read_dir: HashSet<String>,
    download_attempts: HashMap<String, usize>,
    upload_attempts: HashMap<String, usize>,
    close_on_failure: bool,
}

/// A shared remote tree. Every SFTP channel opened on a [`FakeTransport`]
/// sees the same tree.
#[derive(Default)]
pub struct FakeFs {
    state: Mutex<FsState>,
    mkdir_calls: AtomicUsize,
    rename_calls: AtomicUsize,
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

fn is_under(path: &str, dir: &str) -> bool {
    if dir == "/" {
        return path != "/";
    }
    path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}

impl FakeFs {
    fn new() -> Self {
        let fs = Self::default();
        fs.state.lock().nodes.insert("/".to_string(), Node::Dir);
        fs
    }

    fn ensure_parents(nodes: &mut BTreeMap<String, Node>, path: &str) {
        let mut current = parent_of(path);
        while let Some(dir) = current {
            nodes.entry(dir.to_string()).or_insert(Node::Dir);
            current = parent_of(dir);
        }
    }

    pub fn add_dir(&self, path: &str) {
        let mut state = self.state.lock();
        Self::ensure_parents(&mut state.nodes, path);
        state.nodes.insert(path.to_string(), Node::Dir);
    }

    pub fn add_file(&self, path: &str, data: &[u8]) {
        let mut state = self.state.lock();
        Self::ensure_parents(&mut state.nodes, path);
        state.nodes.insert(path.to_string(), Node::File(data.to_vec()));
    }

    pub fn add_symlink(&self, path: &str) {
        let mut state = self.state.lock();
        Self::ensure_parents(&mut state.nodes, path);
        state.nodes.insert(path.to_string(), Node::Symlink);
    }

    pub fn fail_download(&self, path: &str) {
        self.state.lock().fail_download.insert(path.to_string(), None);
    }

    /// Fails the first `times` downloads of `path`.
    pub fn fail_download_times(&self, path: &str, times: usize) {
        self.state
            .lock()
            .fail_download
            .insert(path.to_string(), Some(times));
    }

    pub fn fail_upload(&self, path: &str) {
        self.state.lock().fail_upload.insert(path.to_string());
    }

    pub fn fail_remove(&self, path: &str) {
        self.state.lock().fail_remove.insert(path.to_string());
    }

    pub fn fail_read_dir(&self, path: &str) {
        self.state.lock().fail_read_dir.insert(path.to_string());
    }

    /// A failed transfer also closes the channel it ran on.
    pub fn close_channel_on_failure(&self, on: bool) {
        self.state.lock().close_on_failure = on;
    }

    pub fn download_attempts(&self, path: &str) -> usize {
        self.state
            .lock()
            .download_attempts
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    pub fn upload_attempts(&self, path: &str) -> usize {
        self.state
            .lock()
            .upload_attempts
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    pub fn mkdir_calls(&self) -> usize {
        self.mkdir_calls.load(Ordering::SeqCst)
    }

    pub fn rename_calls(&self) -> usize {
        self.rename_calls.load(Ordering::SeqCst)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().nodes.contains_key(path)
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.state.lock().nodes.get(path), Some(Node::Dir))
    }

    pub fn content(&self, path: &str) -> Option<Vec<u8>> {
        match self.state.lock().nodes.get(path) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn paths_under(&self, dir: &str) -> Vec<String> {
        self.state
            .lock()
            .nodes
            .keys()
            .filter(|p| is_under(p, dir))
            .cloned()
            .collect()
    }

    fn stat(&self, path: &str) -> Result<RemoteMetadata, FsError> {
        self.state
            .lock()
            .nodes
            .get(path)
            .map(Node::metadata)
            .ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, FsError> {
        let state = self.state.lock();
        if state.fail_read_dir.contains(path) {
            return Err(FsError::Io(format!("{path}: permission denied")));
        }
        match state.nodes.get(path) {
            Some(Node::Dir) => {}
            Some(_) => return Err(FsError::Io(format!("{path}: not a directory"))),
            None => return Err(FsError::NotFound(path.to_string())),
        }
        Ok(state
            .nodes
            .iter()
            .filter(|(p, _)| parent_of(p) == Some(path) && p.as_str() != path)
            .map(|(p, node)| RemoteEntry {
                name: p.rsplit('/').next().unwrap_or_default().to_string(),
                metadata: node.metadata(),
            })
            .collect())
    }

    /// Returns true when this attempt should fail.
    fn take_download_failure(&self, path: &str) -> bool {
        let mut state = self.state.lock();
        *state.download_attempts.entry(path.to_string()).or_default() += 1;
        match state.fail_download.get_mut(path) {
            Some(None) => true,
            Some(Some(0)) => false,
            Some(Some(left)) => {
                *left -= 1;
                true
            }
            None => false,
        }
    }

    fn close_on_failure(&self) -> bool {
        self.state.lock().close_on_failure
    }

    fn put(&self, path: &str, data: Vec<u8>) -> Result<(), FsError> {
        let mut state = self.state.lock();
        match parent_of(path).and_then(|p| state.nodes.get(p)) {
            Some(Node::Dir) => {}
            _ => return Err(FsError::NotFound(path.to_string())),
        }
        if matches!(state.nodes.get(path), Some(Node::Dir)) {
            return Err(FsError::Io(format!("{path}: is a directory")));
        }
        state.nodes.insert(path.to_string(), Node::File(data));
        Ok(())
    }
}

/// One SFTP channel over the shared tree.
pub struct FakeChannel {
    fs: Arc<FakeFs>,
    closed: AtomicBool,
}

impl FakeChannel {
    fn check(&self) -> Result<(), FsError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FsError::Closed("channel closed".to_string()));
        }
        Ok(())
    }

    fn failed(&self, err: FsError) -> FsError {
        if self.fs.close_on_failure() {
            self.closed.store(true, Ordering::SeqCst);
        }
        err
    }
}

#[async_trait]
impl RemoteFs for FakeChannel {
    async fn canonicalize(&self, path: &str) -> Result<String, FsError> {
        self.check()?;
        let resolved = if path == "." || path.is_empty() {
            HOME.to_string()
        } else {
            path.to_string()
        };
        self.fs.stat(&resolved)?;
        Ok(resolved)
    }

    async fn stat(&self, path: &str) -> Result<RemoteMetadata, FsError> {
        self.check()?;
        self.fs.stat(path)
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, FsError> {
        self.check()?;
        self.fs.read_dir(path)
    }

    async fn download(
        &self,
        remote: &str,
        local: &Path,
        progress: ProgressSink<'_>,
    ) -> Result<u64, FsError> {
        self.check()?;
        if self.fs.take_download_failure(remote) {
            return Err(self.failed(FsError::Io(format!("{remote}: connection reset"))));
        }
        let data = self
            .fs
            .content(remote)
            .ok_or_else(|| FsError::NotFound(remote.to_string()))?;
        let total = data.len() as u64;
        progress(0, total);
        std::fs::write(local, &data).map_err(|e| FsError::Io(e.to_string()))?;
        progress(total, total);
        Ok(total)
    }

    async fn upload(
        &self,
        local: &Path,
        remote: &str,
        progress: ProgressSink<'_>,
    ) -> Result<u64, FsError> {
        self.check()?;
        {
            let mut state = self.fs.state.lock();
            *state.upload_attempts.entry(remote.to_string()).or_default() += 1;
            if state.fail_upload.contains(remote) {
                return Err(FsError::Io(format!("{remote}: write failed")));
            }
        }
        let data = std::fs::read(local).map_err(|e| FsError::Io(e.to_string()))?;
        let total = data.len() as u64;
        progress(0, total);
        self.fs.put(remote, data)?;
        progress(total, total);
        Ok(total)
    }

    async fn remove_file(&self, path: &str) -> Result<(), FsError> {
        self.check()?;
        let mut state = self.fs.state.lock();
        if state.fail_remove.contains(path) {
            return Err(FsError::Io(format!("{path}: permission denied")));
        }
        match state.nodes.get(path) {
            Some(Node::Dir) => Err(FsError::Io(format!("{path}: is a directory"))),
            Some(_) => {
                state.nodes.remove(path);
                Ok(())
            }
            None => Err(FsError::NotFound(path.to_string())),
        }
    }

    async fn remove_dir(&self, path: &str) -> Result<(), FsError> {
        self.check()?;
        let mut state = self.fs.state.lock();
        match state.nodes.get(path) {
            Some(Node::Dir) => {}
            Some(_) => return Err(FsError::Io(format!("{path}: not a directory"))),
            None => return Err(FsError::NotFound(path.to_string())),
        }
        if state.nodes.keys().any(|p| is_under(p, path)) {
            return Err(FsError::Io(format!("{path}: directory not empty")));
        }
        state.nodes.remove(path);
        Ok(())
    }

    async fn create_dir(&self, path: &str) -> Result<(), FsError> {
        self.check()?;
        self.fs.mkdir_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.fs.state.lock();
        if state.nodes.contains_key(path) {
            return Err(FsError::Io(format!("{path}: file exists")));
        }
        match parent_of(path).and_then(|p| state.nodes.get(p)) {
            Some(Node::Dir) => {}
            _ => return Err(FsError::NotFound(path.to_string())),
        }
        state.nodes.insert(path.to_string(), Node::Dir);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        self.check()?;
        self.fs.rename_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.fs.state.lock();
        if !state.nodes.contains_key(from) {
            return Err(FsError::NotFound(from.to_string()));
        }
        if state.nodes.contains_key(to) {
            return Err(FsError::Io(format!("{to}: file exists")));
        }
        let moved: Vec<String> = state
            .nodes
            .keys()
            .filter(|p| p.as_str() == from || is_under(p, from))
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = state.nodes.remove(&old) {
                let new = format!("{to}{}", &old[from.len()..]);
                state.nodes.insert(new, node);
            }
        }
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, FsError> {
        self.check()?;
        self.fs
            .content(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), FsError> {
        self.check()?;
        self.fs.put(path, data.to_vec())
    }

    async fn close(&self) -> Result<(), FsError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Records everything written to the shell.
#[derive(Default)]
pub struct FakeShellWriter {
    written: Mutex<Vec<u8>>,
    closed: AtomicBool,
    fail_writes: AtomicBool,
}

impl FakeShellWriter {
    pub fn written(&self) -> String {
        String::from_utf8_lossy(&self.written.lock()).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.written().lines().map(str::to_string).collect()
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ShellWriter for FakeShellWriter {
    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Channel("broken pipe".to_string()));
        }
        self.written.lock().extend_from_slice(data);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Yields whatever the test pushes; a dropped sender reads as Closed.
pub struct FakeShellReader {
    input: mpsc::UnboundedReceiver<ShellRead>,
}

#[async_trait]
impl ShellReader for FakeShellReader {
    async fn read(&mut self, timeout: Duration) -> ShellRead {
        match tokio::time::timeout(timeout, self.input.recv()).await {
            Ok(Some(read)) => read,
            Ok(None) => ShellRead::Closed,
            Err(_) => ShellRead::Timeout,
        }
    }
}

pub struct FakeTransport {
    fs: Arc<FakeFs>,
    pub writer: Arc<FakeShellWriter>,
    shell_input: Mutex<Option<mpsc::UnboundedSender<ShellRead>>>,
    sftp_failure: Mutex<Option<TransportError>>,
    fail_close: AtomicBool,
    closed: AtomicBool,
    pub sftp_opens: AtomicUsize,
    pub close_calls: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fs: Arc::new(FakeFs::new()),
            writer: Arc::new(FakeShellWriter::default()),
            shell_input: Mutex::new(None),
            sftp_failure: Mutex::new(None),
            fail_close: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sftp_opens: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
        })
    }

    pub fn fs(&self) -> Arc<FakeFs> {
        self.fs.clone()
    }

    /// The next sftp open fails with `err`.
    pub fn fail_sftp_open(&self, err: TransportError) {
        *self.sftp_failure.lock() = Some(err);
    }

    pub fn fail_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }

    /// Feeds the open shell's reader. Returns false if no shell is open.
    pub fn push_shell(&self, read: ShellRead) -> bool {
        match self.shell_input.lock().as_ref() {
            Some(tx) => tx.send(read).is_ok(),
            None => false,
        }
    }

    /// Drops the sender so the reader sees the channel close.
    pub fn hang_up_shell(&self) {
        self.shell_input.lock().take();
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open_shell(&self) -> Result<ShellChannel, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.shell_input.lock() = Some(tx);
        Ok(ShellChannel {
            reader: Box::new(FakeShellReader { input: rx }),
            writer: self.writer.clone(),
        })
    }

    async fn open_sftp(&self, _op_timeout: Duration) -> Result<Arc<dyn RemoteFs>, TransportError> {
        if let Some(err) = self.sftp_failure.lock().take() {
            return Err(err);
        }
        self.sftp_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeChannel {
            fs: self.fs.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(TransportError::Channel("close failed".to_string()));
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Hands out one shared [`FakeTransport`], or a scripted failure.
pub struct FakeConnector {
    pub transport: Arc<FakeTransport>,
    failure: Mutex<Option<TransportError>>,
    delay: Mutex<Option<Duration>>,
    pub last_config: Mutex<Option<SshConnectConfig>>,
    pub calls: AtomicUsize,
}

impl FakeConnector {
    pub fn new(transport: Arc<FakeTransport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            failure: Mutex::new(None),
            delay: Mutex::new(None),
            last_config: Mutex::new(None),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn fail_next(&self, err: TransportError) {
        *self.failure.lock() = Some(err);
    }

    pub fn delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, cfg: SshConnectConfig) -> Result<Arc<dyn Transport>, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_config.lock() = Some(cfg);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.failure.lock().take() {
            return Err(err);
        }
        Ok(self.transport.clone())
    }
}

/// A session already in the Connected state over `transport`.
pub fn connected_session(transport: Arc<FakeTransport>) -> Session {
    let session = Session::new(EventBus::new(1024));
    let endpoint = Endpoint::new("fake.example", 22, "tester");
    session
        .begin_connect(&endpoint)
        .expect("fresh session accepts connect");
    let writer = transport.writer.clone();
    assert!(session.install(transport, writer));
    session
}
