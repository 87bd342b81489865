//! Periodic system stats.
//!
//! The poller types its diagnostic commands into the interactive shell; the
//! answers come back through the shell reader and the output classifier.
//! Polling output therefore interleaves with whatever the user is running.

use crate::session::{ConnectionState, Session};
use forgeterm_config::SessionConfig;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct StatsSchedule {
    pub interval: Duration,
    pub spacing: Duration,
    pub disk_path: String,
}

impl StatsSchedule {
    pub fn from_config(cfg: &SessionConfig) -> Self {
        Self {
            interval: Duration::from_secs(cfg.stats_interval_secs),
            spacing: Duration::from_millis(cfg.stats_command_spacing_ms),
            disk_path: cfg.stats_disk_path.clone(),
        }
    }

    pub fn commands(&self) -> [String; 3] {
        [
            "uptime".to_string(),
            "free -h | grep '^Mem:'".to_string(),
            format!("df -h {} | tail -n 1", self.disk_path),
        ]
    }
}

pub fn spawn_stats_poller(session: Session, schedule: StatsSchedule) -> JoinHandle<()> {
    tokio::spawn(async move { run(session, schedule).await })
}

async fn run(session: Session, schedule: StatsSchedule) {
    let mut state = session.watch_state();
    let commands = schedule.commands();
    'poll: loop {
        for (index, command) in commands.iter().enumerate() {
            if index > 0 && wait_or_stop(&mut state, schedule.spacing).await {
                break 'poll;
            }
            let Some(shell) = session.shell() else {
                break 'poll;
            };
            if let Err(err) = shell.write(format!("{command}\n").as_bytes()).await {
                if session.is_connected() {
                    warn!(error = %err, "stats command failed");
                }
                break 'poll;
            }
        }
        if wait_or_stop(&mut state, schedule.interval).await {
            break;
        }
    }
    debug!("stats poller finished");
}

/// Sleeps for `period`; returns true as soon as the session stops being
/// Connected.
async fn wait_or_stop(state: &mut watch::Receiver<ConnectionState>, period: Duration) -> bool {
    if *state.borrow_and_update() != ConnectionState::Connected {
        return true;
    }
    let sleep = tokio::time::sleep(period);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return *state.borrow() != ConnectionState::Connected,
            changed = state.changed() => {
                if changed.is_err() || *state.borrow_and_update() != ConnectionState::Connected {
                    return true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{connected_session, FakeTransport};
    use std::time::Instant;

    #[test]
    fn commands_target_disk_path() {
        let schedule = StatsSchedule::from_config(&SessionConfig {
            stats_disk_path: "/srv".to_string(),
            ..SessionConfig::default()
        });
        assert_eq!(schedule.interval, Duration::from_secs(60));
        assert_eq!(schedule.commands()[2], "df -h /srv | tail -n 1");
    }

    #[tokio::test]
    async fn sends_three_commands_then_stops_on_disconnect() {
        let transport = FakeTransport::new();
        let session = connected_session(transport.clone());
        let schedule = StatsSchedule {
            interval: Duration::from_secs(600),
            spacing: Duration::from_millis(1),
            disk_path: "/".to_string(),
        };
        let handle = spawn_stats_poller(session.clone(), schedule);

        let start = Instant::now();
        while transport.writer.lines().len() < 3 {
            assert!(start.elapsed() < Duration::from_secs(2), "poller too slow");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            transport.writer.lines(),
            vec!["uptime", "free -h | grep '^Mem:'", "df -h / | tail -n 1"]
        );

        session.set_state(ConnectionState::Disconnecting);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("poller exits promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn exits_without_session() {
        let transport = FakeTransport::new();
        let session = connected_session(transport.clone());
        session.set_state(ConnectionState::Disconnected);
        let handle = spawn_stats_poller(
            session,
            StatsSchedule {
                interval: Duration::from_secs(600),
                spacing: Duration::from_millis(1),
                disk_path: "/".to_string(),
            },
        );
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(transport.writer.lines().is_empty());
    }
}
