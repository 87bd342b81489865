use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("No password or SSH key provided")]
    NoCredentials,
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("Connection error: {0}")]
    ConnectionFailed(String),
    #[error("already connected to {0}")]
    AlreadyConnected(String),
    #[error("Disconnect operation already in progress.")]
    DisconnectInProgress,
    #[error("Error closing some resources.")]
    CloseIncomplete,
    #[error("Could not establish SFTP connection")]
    ChannelUnavailable,
    #[error("{0}")]
    RemoteNotFound(String),
    #[error("{0}")]
    RemoteIo(String),
    #[error("{0}")]
    AlreadyExists(String),
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
