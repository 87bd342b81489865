pub mod broker;
pub mod classifier;
pub mod error;
pub mod events;
pub mod listing;
pub mod manager;
pub mod monitor;
pub mod path;
pub mod session;
pub mod transfer;

#[cfg(test)]
mod testing;

pub use broker::SftpBroker;
pub use classifier::{classify_line, ChunkDecoder, LineBuffer, LineEvent, OutputClassifier};
pub use error::CoreError;
pub use events::{Event, EventBus, EventHandlers, StatKind, StatUpdate};
pub use listing::{format_permissions, format_size, is_text_file, ItemKind, RemoteItem};
pub use manager::ConnectionManager;
pub use monitor::StatsSchedule;
pub use session::{ConnectionState, Credentials, Endpoint, ProcessRecord, Session};
pub use transfer::{
    DirectoryListing, ProgressFn, TransferEngine, TransferItem, TransferProgress, TransferReport,
};
