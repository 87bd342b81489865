pub mod client;
pub mod config;
pub mod sftp;
pub mod transport;

pub use client::{SshClient, SshConnector, SshSession};
pub use config::{AuthMethod, HostKeyPolicy, SshConnectConfig};
pub use sftp::SftpClient;
pub use transport::{
    Connector, FileKind, FsError, RemoteEntry, RemoteFs, RemoteMetadata, ShellChannel,
    ShellRead, ShellReader, ShellWriter, Transport, TransportError,
};
