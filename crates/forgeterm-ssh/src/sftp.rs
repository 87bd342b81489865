use crate::transport::{FileKind, FsError, ProgressSink, RemoteEntry, RemoteFs, RemoteMetadata};
use async_trait::async_trait;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::fs::Metadata;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{OpenFlags, StatusCode};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const CHUNK_SIZE: usize = 32 * 1024;

pub struct SftpClient {
    inner: SftpSession,
    op_timeout: Duration,
    closed: AtomicBool,
}

impl SftpClient {
    pub async fn new<S>(stream: S, op_timeout: Duration) -> anyhow::Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let inner = tokio::time::timeout(op_timeout, SftpSession::new(stream))
            .await
            .map_err(|_| anyhow::anyhow!("sftp handshake timed out"))??;
        Ok(Self {
            inner,
            op_timeout,
            closed: AtomicBool::new(false),
        })
    }

    async fn timed<T, F>(&self, path: &str, fut: F) -> Result<T, FsError>
    where
        F: Future<Output = Result<T, SftpError>>,
    {
        if self.is_closed() {
            return Err(FsError::Closed("channel already closed".to_string()));
        }
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(self.map_err(path, err)),
            Err(_) => {
                self.closed.store(true, Ordering::SeqCst);
                Err(FsError::Timeout)
            }
        }
    }

    async fn timed_io<T, F>(&self, fut: F) -> Result<T, FsError>
    where
        F: Future<Output = std::io::Result<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(FsError::Io(err.to_string())),
            Err(_) => {
                self.closed.store(true, Ordering::SeqCst);
                Err(FsError::Timeout)
            }
        }
    }

    fn map_err(&self, path: &str, err: SftpError) -> FsError {
        match err {
            SftpError::Status(status) if matches!(status.status_code, StatusCode::NoSuchFile) => {
                FsError::NotFound(path.to_string())
            }
            SftpError::Status(status) => FsError::Io(format!("{}: {}", path, status.error_message)),
            SftpError::Timeout => {
                self.closed.store(true, Ordering::SeqCst);
                FsError::Timeout
            }
            other => {
                self.closed.store(true, Ordering::SeqCst);
                FsError::Closed(other.to_string())
            }
        }
    }

    fn metadata_from(meta: &Metadata) -> RemoteMetadata {
        let file_type = meta.file_type();
        let kind = if file_type.is_dir() {
            FileKind::Directory
        } else if file_type.is_symlink() {
            FileKind::Symlink
        } else {
            FileKind::File
        };
        let mut mode = meta.permissions.unwrap_or(0);
        if mode & FileKind::TYPE_MASK == 0 {
            mode |= kind.type_bits();
        }
        RemoteMetadata {
            size: meta.size.unwrap_or(0),
            mode,
            mtime: meta.mtime.map(|t| t as u64),
        }
    }
}

#[async_trait]
impl RemoteFs for SftpClient {
    async fn canonicalize(&self, path: &str) -> Result<String, FsError> {
        self.timed(path, self.inner.canonicalize(path)).await
    }

    async fn stat(&self, path: &str) -> Result<RemoteMetadata, FsError> {
        let meta = self.timed(path, self.inner.metadata(path)).await?;
        Ok(Self::metadata_from(&meta))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, FsError> {
        let rd = self.timed(path, self.inner.read_dir(path)).await?;
        let entries = rd
            .into_iter()
            .filter(|entry| {
                let name = entry.file_name();
                name != "." && name != ".."
            })
            .map(|entry| RemoteEntry {
                name: entry.file_name(),
                metadata: Self::metadata_from(&entry.metadata()),
            })
            .collect();
        Ok(entries)
    }

    async fn download(
        &self,
        remote: &str,
        local: &Path,
        progress: ProgressSink<'_>,
    ) -> Result<u64, FsError> {
        let total = self.stat(remote).await?.size;
        let mut src = self.timed(remote, self.inner.open(remote)).await?;
        let mut dest = tokio::fs::File::create(local)
            .await
            .map_err(|e| FsError::Io(format!("{}: {}", local.display(), e)))?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut transferred = 0u64;
        progress(0, total);
        loop {
            let n = self.timed_io(src.read(&mut buf)).await?;
            if n == 0 {
                break;
            }
            dest.write_all(&buf[..n])
                .await
                .map_err(|e| FsError::Io(format!("{}: {}", local.display(), e)))?;
            transferred += n as u64;
            progress(transferred, total);
        }
        dest.flush()
            .await
            .map_err(|e| FsError::Io(format!("{}: {}", local.display(), e)))?;
        debug!(remote, bytes = transferred, "sftp download finished");
        Ok(transferred)
    }

    async fn upload(
        &self,
        local: &Path,
        remote: &str,
        progress: ProgressSink<'_>,
    ) -> Result<u64, FsError> {
        let mut src = tokio::fs::File::open(local)
            .await
            .map_err(|e| FsError::Io(format!("{}: {}", local.display(), e)))?;
        let total = src
            .metadata()
            .await
            .map_err(|e| FsError::Io(format!("{}: {}", local.display(), e)))?
            .len();
        let flags = OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE;
        let mut dest = self
            .timed(remote, self.inner.open_with_flags(remote, flags))
            .await?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut transferred = 0u64;
        progress(0, total);
        loop {
            let n = src
                .read(&mut buf)
                .await
                .map_err(|e| FsError::Io(format!("{}: {}", local.display(), e)))?;
            if n == 0 {
                break;
            }
            self.timed_io(dest.write_all(&buf[..n])).await?;
            transferred += n as u64;
            progress(transferred, total);
        }
        self.timed_io(dest.shutdown()).await?;
        debug!(remote, bytes = transferred, "sftp upload finished");
        Ok(transferred)
    }

    async fn remove_file(&self, path: &str) -> Result<(), FsError> {
        self.timed(path, self.inner.remove_file(path)).await
    }

    async fn remove_dir(&self, path: &str) -> Result<(), FsError> {
        self.timed(path, self.inner.remove_dir(path)).await
    }

    async fn create_dir(&self, path: &str) -> Result<(), FsError> {
        self.timed(path, self.inner.create_dir(path)).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        self.timed(from, self.inner.rename(from, to)).await
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let mut file = self.timed(path, self.inner.open(path)).await?;
        let mut out = Vec::new();
        self.timed_io(file.read_to_end(&mut out)).await?;
        Ok(out)
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), FsError> {
        let flags = OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE;
        let mut file = self
            .timed(path, self.inner.open_with_flags(path, flags))
            .await?;
        self.timed_io(file.write_all(data)).await?;
        self.timed_io(file.shutdown()).await
    }

    async fn close(&self) -> Result<(), FsError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner
            .close()
            .await
            .map_err(|e| FsError::Io(e.to_string()))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
