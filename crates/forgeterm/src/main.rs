use anyhow::{anyhow, bail, Result};
use clap::Parser;
use forgeterm_cli::{Cli, Command};
use forgeterm_config::{AppConfig, AppPaths, ConfigManager};
use forgeterm_core::path::{file_name_remote, normalize_remote, parent_remote};
use forgeterm_core::{
    format_size, is_text_file, ConnectionManager, ConnectionState, Credentials, Endpoint,
    EventBus, EventHandlers, ProgressFn, RemoteItem, Session, SftpBroker, TransferEngine,
    TransferProgress, TransferReport,
};
use forgeterm_ssh::SshConnector;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

const PASSWORD_ENV: &str = "FORGETERM_PASSWORD";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let paths = AppPaths::new()?;
    let config_manager = ConfigManager::new(paths.clone());
    let overrides = cli
        .config
        .as_deref()
        .map(ConfigManager::load_layer)
        .transpose()?;
    let cwd = cli
        .project
        .clone()
        .or_else(|| std::env::current_dir().ok());
    let mut config = config_manager.load(cwd.as_deref(), overrides)?;
    let command = cli.command.unwrap_or(Command::Shell { no_stats: false });
    let interactive = command.is_interactive();
    let _log_guard = init_logging(&config, &paths, config.logging.stdout && !interactive)?;

    if let Command::Config { init } = command {
        if init {
            config_manager.save_default()?;
            println!("config initialized at {}", paths.config_file.display());
        } else {
            println!("{}", paths.config_file.display());
        }
        return Ok(());
    }

    let (endpoint, credentials) =
        resolve_target(&config, cli.target.as_deref(), cli.port, cli.identity)?;
    match &command {
        Command::Shell { no_stats } => config.session.stats_enabled &= !no_stats,
        _ => config.session.stats_enabled = false,
    }

    let bus = EventBus::new(1024);
    let session = Session::new(bus.clone());
    let manager = ConnectionManager::new(
        session.clone(),
        Arc::new(SshConnector),
        config.session.clone(),
    );
    let broker = SftpBroker::new(session, Duration::from_secs(config.sftp.op_timeout_secs));
    let engine = TransferEngine::new(broker.clone(), config.sftp.clone());
    let _handlers = handlers(interactive).spawn(&bus);

    manager.connect(endpoint, credentials).await??;

    let result = run_command(command, &manager, &engine, &config).await;

    broker.close_channel().await;
    if manager.session().state() != ConnectionState::Disconnected {
        if let Err(err) = manager.disconnect().await? {
            warn!(error = %err, "disconnect incomplete");
        }
    }
    result
}

async fn run_command(
    command: Command,
    manager: &ConnectionManager,
    engine: &TransferEngine,
    config: &AppConfig,
) -> Result<()> {
    match command {
        Command::Shell { .. } => run_shell(manager, config).await,
        Command::Ls { path } => {
            let listing = engine.list_directory(path).await??;
            println!("{}", listing.path);
            for item in listing.items.iter().filter(|item| !item.is_parent()) {
                println!(
                    "{:<10} {:>10} {:<19} {}{}",
                    item.permissions,
                    format_size(item.size),
                    item.modified,
                    item.name,
                    if item.is_dir() { "/" } else { "" }
                );
            }
            Ok(())
        }
        Command::Get { remote, dest } => {
            let mut items = Vec::with_capacity(remote.len());
            for path in &remote {
                items.push(resolve_item(engine, path).await?);
            }
            let report = engine
                .download_files(items, dest, Some(progress_printer()))
                .await?;
            finish_transfer("downloaded", &report)
        }
        Command::Put {
            local,
            dest,
            overwrite,
        } => {
            let dest = match dest {
                Some(dest) => dest,
                None => engine.list_directory(None).await??.path,
            };
            let report = engine
                .upload_files(local, dest, overwrite, Some(progress_printer()))
                .await?;
            finish_transfer("uploaded", &report)
        }
        Command::Cat { path } => {
            if !is_text_file(file_name_remote(&path)) {
                bail!("{path} does not look like a text file");
            }
            let content = engine.get_file_content(path).await??;
            print!("{content}");
            std::io::stdout().flush()?;
            Ok(())
        }
        Command::Edit { path, from } => {
            let content = tokio::fs::read_to_string(&from).await?;
            engine.save_file_content(path, content).await??;
            Ok(())
        }
        Command::Mkdir { path } => {
            let path = normalize_remote(&path);
            let name = file_name_remote(&path).to_string();
            engine.create_directory(parent_remote(&path), name).await??;
            Ok(())
        }
        Command::Rm { path } => {
            let item = resolve_item(engine, &path).await?;
            engine.delete_item(item).await??;
            Ok(())
        }
        Command::Mv { path, new_name } => {
            let item = resolve_item(engine, &path).await?;
            engine.rename_item(item, new_name).await??;
            Ok(())
        }
        Command::Config { .. } => Ok(()),
    }
}

/// Lines from stdin go to the remote shell until stdin closes or the
/// server goes away. `:procs` lists started processes, `:<name>` runs a
/// configured quick command.
async fn run_shell(manager: &ConnectionManager, config: &AppConfig) -> Result<()> {
    let mut state = manager.session().watch_state();
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                shell_line(manager, config, line.trim_end()).await;
            }
            changed = state.changed() => {
                if changed.is_err() || *state.borrow_and_update() != ConnectionState::Connected {
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn shell_line(manager: &ConnectionManager, config: &AppConfig, line: &str) {
    let Some(name) = line.strip_prefix(':') else {
        manager.send_command(line).await;
        return;
    };
    if name == "procs" {
        for process in manager.known_processes() {
            println!("{:>8}  {}", process.pid, process.name);
        }
        return;
    }
    match config.commands.get(name) {
        Some(command) => {
            manager.send_command(command).await;
        }
        None => eprintln!("unknown quick command: {name}"),
    }
}

fn handlers(interactive: bool) -> EventHandlers {
    let mut handlers = EventHandlers {
        on_cpu_update: Some(Box::new(|text: &str| info!(stat = text, "cpu"))),
        on_memory_update: Some(Box::new(|text: &str| info!(stat = text, "memory"))),
        on_disk_update: Some(Box::new(|text: &str| info!(stat = text, "disk"))),
        ..EventHandlers::default()
    };
    if interactive {
        handlers.on_output = Some(Box::new(|text: &str| {
            let mut stdout = std::io::stdout();
            let _ = stdout.write_all(text.as_bytes());
            let _ = stdout.flush();
        }));
        handlers.on_status_change = Some(Box::new(|text: &str| eprintln!("-- {text}")));
    } else {
        handlers.on_status_change = Some(Box::new(|text: &str| debug!(status = text, "status")));
    }
    handlers
}

fn progress_printer() -> ProgressFn {
    Arc::new(|progress: &TransferProgress| {
        eprint!(
            "\r{} {}/{} ({:.1}%)",
            progress.file_name,
            format_size(progress.bytes_transferred),
            format_size(progress.bytes_total),
            progress.percent
        );
        if progress.bytes_transferred >= progress.bytes_total {
            eprintln!();
        }
    })
}

fn finish_transfer(verb: &str, report: &TransferReport) -> Result<()> {
    if let Some(err) = &report.error {
        bail!("{err}");
    }
    let mut summary = format!("{} files {verb}", report.succeeded);
    if report.skipped > 0 {
        summary.push_str(&format!(", {} skipped", report.skipped));
    }
    if report.failed > 0 {
        summary.push_str(&format!(", {} failed", report.failed));
    }
    println!("{summary}");
    if report.failed > 0 {
        bail!("some files failed");
    }
    Ok(())
}

/// Looks `path` up in its parent listing so the item carries its real kind.
async fn resolve_item(engine: &TransferEngine, path: &str) -> Result<RemoteItem> {
    let path = normalize_remote(path);
    if path == "/" {
        return Ok(RemoteItem::directory("/"));
    }
    let listing = engine.list_directory(Some(parent_remote(&path))).await??;
    let name = file_name_remote(&path);
    listing
        .items
        .into_iter()
        .find(|item| !item.is_parent() && item.name == name)
        .ok_or_else(|| anyhow!("{path}: no such file or directory"))
}

fn resolve_target(
    config: &AppConfig,
    target: Option<&str>,
    port: Option<u16>,
    identity: Option<PathBuf>,
) -> Result<(Endpoint, Credentials)> {
    let server = &config.server;
    let (user, host, target_port) = match target {
        Some(target) => parse_target(target)?,
        None => {
            if server.hostname.is_empty() {
                bail!("no target given and no [server] hostname configured");
            }
            let user = if server.username.is_empty() {
                whoami::username()
            } else {
                server.username.clone()
            };
            (user, server.hostname.clone(), server.port)
        }
    };
    let endpoint = Endpoint::new(host, port.unwrap_or(target_port), user);

    let password = std::env::var(PASSWORD_ENV)
        .ok()
        .or_else(|| server.password.clone());
    let credentials = match identity.or_else(|| server.key_path.clone()) {
        Some(key) => Credentials::key(key, password),
        None => match password {
            Some(password) => Credentials::password(password),
            None => Credentials::default(),
        },
    };
    Ok((endpoint, credentials))
}

fn init_logging(
    config: &AppConfig,
    paths: &AppPaths,
    enable_stdout: bool,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(&paths.log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&paths.log_dir, "forgeterm.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    let file_layer = if config.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed()
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer);

    if enable_stdout {
        let stdout_layer = if config.logging.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .boxed()
        };
        tracing::subscriber::set_global_default(subscriber.with(stdout_layer))?;
    } else {
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(guard)
}

fn parse_target(target: &str) -> Result<(String, String, u16)> {
    let mut user_host = target;
    let mut user = whoami::username();
    let mut port = 22;

    if let Some(at) = target.rfind('@') {
        user = target[..at].to_string();
        user_host = &target[at + 1..];
    }
    let host = match user_host.rfind(':') {
        Some(colon) => match user_host[colon + 1..].parse::<u16>() {
            Ok(p) => {
                port = p;
                &user_host[..colon]
            }
            Err(_) => user_host,
        },
        None => user_host,
    };
    if host.is_empty() {
        bail!("invalid target: {target}");
    }
    Ok((user, host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_target_variants() {
        let (user, host, port) = parse_target("deploy@build.local:2222").unwrap();
        assert_eq!((user.as_str(), host.as_str(), port), ("deploy", "build.local", 2222));

        let (_, host, port) = parse_target("build.local").unwrap();
        assert_eq!((host.as_str(), port), ("build.local", 22));

        assert!(parse_target("deploy@").is_err());
    }

    #[test]
    fn target_falls_back_to_server_config() {
        let mut config = AppConfig::default();
        assert!(resolve_target(&config, None, None, None).is_err());

        config.server.hostname = "10.0.0.5".to_string();
        config.server.username = "ops".to_string();
        config.server.key_path = Some(PathBuf::from("/keys/id_ed25519"));
        let (endpoint, credentials) = resolve_target(&config, None, Some(2200), None).unwrap();
        assert_eq!(endpoint.hostname, "10.0.0.5");
        assert_eq!(endpoint.username, "ops");
        assert_eq!(endpoint.port, 2200);
        assert!(!credentials.is_empty());
    }
}
