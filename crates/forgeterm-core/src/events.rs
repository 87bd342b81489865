use crate::listing::RemoteItem;
use crate::session::ProcessRecord;
use crate::transfer::TransferProgress;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Clone, Debug)]
pub enum Event {
    /// Raw decoded shell output chunk.
    Output(String),
    /// Human-readable status line.
    Status(String),
    ConnectionStateChanged {
        connected: bool,
        host: String,
        user: String,
    },
    Stat(StatUpdate),
    TransferProgress(TransferProgress),
    DirectoryListed {
        path: String,
        items: Vec<RemoteItem>,
    },
    ProcessStarted(ProcessRecord),
    ProcessKilled(ProcessRecord),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatKind {
    Cpu,
    Memory,
    Disk,
}

/// Formatted system stat, e.g. `CPU Load: 0.42`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatUpdate {
    Cpu(String),
    Memory(String),
    Disk(String),
}

impl StatUpdate {
    pub fn kind(&self) -> StatKind {
        match self {
            StatUpdate::Cpu(_) => StatKind::Cpu,
            StatUpdate::Memory(_) => StatKind::Memory,
            StatUpdate::Disk(_) => StatKind::Disk,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            StatUpdate::Cpu(s) | StatUpdate::Memory(s) | StatUpdate::Disk(s) => s,
        }
    }
}

#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn send(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn output(&self, text: impl Into<String>) {
        self.send(Event::Output(text.into()));
    }

    pub fn status(&self, text: impl Into<String>) {
        self.send(Event::Status(text.into()));
    }
}

type TextHandler = Box<dyn Fn(&str) + Send + Sync>;
type ConnectionHandler = Box<dyn Fn(bool, &str, &str) + Send + Sync>;

/// Callback-style view of the bus for front ends that prefer slots over
/// matching on [`Event`]. Slots are fixed when the dispatcher is spawned.
#[derive(Default)]
pub struct EventHandlers {
    pub on_output: Option<TextHandler>,
    pub on_status_change: Option<TextHandler>,
    pub on_connection_state_change: Option<ConnectionHandler>,
    pub on_cpu_update: Option<TextHandler>,
    pub on_memory_update: Option<TextHandler>,
    pub on_disk_update: Option<TextHandler>,
}

impl EventHandlers {
    fn stat_slot(&self, kind: StatKind) -> Option<&TextHandler> {
        match kind {
            StatKind::Cpu => self.on_cpu_update.as_ref(),
            StatKind::Memory => self.on_memory_update.as_ref(),
            StatKind::Disk => self.on_disk_update.as_ref(),
        }
    }

    pub fn dispatch(&self, event: &Event) {
        match event {
            Event::Output(text) => {
                if let Some(cb) = &self.on_output {
                    cb(text);
                }
            }
            Event::Status(text) => {
                if let Some(cb) = &self.on_status_change {
                    cb(text);
                }
            }
            Event::ConnectionStateChanged {
                connected,
                host,
                user,
            } => {
                if let Some(cb) = &self.on_connection_state_change {
                    cb(*connected, host, user);
                }
            }
            Event::Stat(update) => {
                if let Some(cb) = self.stat_slot(update.kind()) {
                    cb(update.text());
                }
            }
            _ => {}
        }
    }

    /// Runs until the bus is dropped.
    pub fn spawn(self, bus: &EventBus) -> JoinHandle<()> {
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => self.dispatch(&event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "event handlers lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
