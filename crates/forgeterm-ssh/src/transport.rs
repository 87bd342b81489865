//! The capability set the rest of forgeterm is written against.
//!
//! `client` and `sftp` implement these traits on top of russh; anything else
//! (an in-memory fake, a recorded session) can stand in for them.

use crate::config::SshConnectConfig;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("channel error: {0}")]
    Channel(String),
    #[error("session closed")]
    Closed,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FsError {
    #[error("no such file: {0}")]
    NotFound(String),
    #[error("{0}")]
    Io(String),
    #[error("sftp channel closed: {0}")]
    Closed(String),
    #[error("sftp operation timed out")]
    Timeout,
}

impl FsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }

    /// True when the error means the channel (or the session under it) is gone.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, FsError::Closed(_) | FsError::Timeout)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    Symlink,
    File,
}

impl FileKind {
    pub const TYPE_MASK: u32 = 0o170000;
    pub const DIR_BITS: u32 = 0o040000;
    pub const LINK_BITS: u32 = 0o120000;
    pub const FILE_BITS: u32 = 0o100000;

    pub fn from_mode(mode: u32) -> Self {
        match mode & Self::TYPE_MASK {
            Self::DIR_BITS => FileKind::Directory,
            Self::LINK_BITS => FileKind::Symlink,
            _ => FileKind::File,
        }
    }

    pub fn type_bits(self) -> u32 {
        match self {
            FileKind::Directory => Self::DIR_BITS,
            FileKind::Symlink => Self::LINK_BITS,
            FileKind::File => Self::FILE_BITS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteMetadata {
    pub size: u64,
    /// Full `st_mode`, type bits included.
    pub mode: u32,
    pub mtime: Option<u64>,
}

impl RemoteMetadata {
    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == FileKind::Directory
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub metadata: RemoteMetadata,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ShellRead {
    Data(Vec<u8>),
    /// Nothing arrived within the read timeout.
    Timeout,
    /// The remote end closed the channel or the shell exited.
    Closed,
    Error(String),
}

#[async_trait]
pub trait ShellReader: Send {
    async fn read(&mut self, timeout: Duration) -> ShellRead;
}

#[async_trait]
pub trait ShellWriter: Send + Sync {
    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
    fn is_closed(&self) -> bool;
}

pub struct ShellChannel {
    pub reader: Box<dyn ShellReader>,
    pub writer: Arc<dyn ShellWriter>,
}

/// Called with `(bytes_transferred, bytes_total)` while a file moves.
pub type ProgressSink<'a> = &'a mut (dyn FnMut(u64, u64) + Send);

#[async_trait]
pub trait RemoteFs: Send + Sync {
    async fn canonicalize(&self, path: &str) -> Result<String, FsError>;
    async fn stat(&self, path: &str) -> Result<RemoteMetadata, FsError>;
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, FsError>;
    async fn download(
        &self,
        remote: &str,
        local: &Path,
        progress: ProgressSink<'_>,
    ) -> Result<u64, FsError>;
    async fn upload(
        &self,
        local: &Path,
        remote: &str,
        progress: ProgressSink<'_>,
    ) -> Result<u64, FsError>;
    async fn remove_file(&self, path: &str) -> Result<(), FsError>;
    async fn remove_dir(&self, path: &str) -> Result<(), FsError>;
    async fn create_dir(&self, path: &str) -> Result<(), FsError>;
    async fn rename(&self, from: &str, to: &str) -> Result<(), FsError>;
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, FsError>;
    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), FsError>;
    async fn close(&self) -> Result<(), FsError>;
    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_shell(&self) -> Result<ShellChannel, TransportError>;
    async fn open_sftp(&self, op_timeout: Duration) -> Result<Arc<dyn RemoteFs>, TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, cfg: SshConnectConfig) -> Result<Arc<dyn Transport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_mode_bits() {
        assert_eq!(FileKind::from_mode(0o040755), FileKind::Directory);
        assert_eq!(FileKind::from_mode(0o120777), FileKind::Symlink);
        assert_eq!(FileKind::from_mode(0o100644), FileKind::File);
        assert_eq!(FileKind::from_mode(0o644), FileKind::File);
    }

    #[test]
    fn lost_connection_errors() {
        assert!(FsError::Timeout.is_connection_lost());
        assert!(FsError::Closed("eof".into()).is_connection_lost());
        assert!(!FsError::NotFound("/x".into()).is_connection_lost());
    }
}
