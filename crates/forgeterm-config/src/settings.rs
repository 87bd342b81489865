use crate::paths::AppPaths;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub sftp: SftpConfig,
    pub logging: LoggingConfig,
    pub commands: BTreeMap<String, String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            session: SessionConfig::default(),
            sftp: SftpConfig::default(),
            logging: LoggingConfig::default(),
            commands: default_commands(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct AppConfigLayer {
    pub server: Option<ServerConfigLayer>,
    pub session: Option<SessionConfigLayer>,
    pub sftp: Option<SftpConfigLayer>,
    pub logging: Option<LoggingConfigLayer>,
    pub commands: Option<BTreeMap<String, String>>,
}

impl AppConfigLayer {
    pub fn apply_to(self, cfg: &mut AppConfig) {
        if let Some(layer) = self.server {
            cfg.server.apply(layer);
        }
        if let Some(layer) = self.session {
            cfg.session.apply(layer);
        }
        if let Some(layer) = self.sftp {
            cfg.sftp.apply(layer);
        }
        if let Some(layer) = self.logging {
            cfg.logging.apply(layer);
        }
        // commands merge by key so a partial file keeps the built-in set
        if let Some(commands) = self.commands {
            cfg.commands.extend(commands);
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub key_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            port: 22,
            username: String::new(),
            password: None,
            key_path: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct ServerConfigLayer {
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub key_path: Option<PathBuf>,
}

impl ServerConfig {
    fn apply(&mut self, layer: ServerConfigLayer) {
        if let Some(v) = layer.hostname {
            self.hostname = v;
        }
        if let Some(v) = layer.port {
            self.port = v;
        }
        if let Some(v) = layer.username {
            self.username = v;
        }
        if layer.password.is_some() {
            self.password = layer.password;
        }
        if layer.key_path.is_some() {
            self.key_path = layer.key_path;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    pub connect_timeout_ms: u64,
    pub keepalive_interval_secs: u64,
    pub shell_read_timeout_ms: u64,
    pub disconnect_grace_ms: u64,
    pub stats_enabled: bool,
    pub stats_interval_secs: u64,
    pub stats_command_spacing_ms: u64,
    pub stats_disk_path: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 15000,
            keepalive_interval_secs: 15,
            shell_read_timeout_ms: 100,
            disconnect_grace_ms: 200,
            stats_enabled: true,
            stats_interval_secs: 60,
            stats_command_spacing_ms: 200,
            stats_disk_path: "/".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct SessionConfigLayer {
    pub connect_timeout_ms: Option<u64>,
    pub keepalive_interval_secs: Option<u64>,
    pub shell_read_timeout_ms: Option<u64>,
    pub disconnect_grace_ms: Option<u64>,
    pub stats_enabled: Option<bool>,
    pub stats_interval_secs: Option<u64>,
    pub stats_command_spacing_ms: Option<u64>,
    pub stats_disk_path: Option<String>,
}

impl SessionConfig {
    fn apply(&mut self, layer: SessionConfigLayer) {
        if let Some(v) = layer.connect_timeout_ms {
            self.connect_timeout_ms = v;
        }
        if let Some(v) = layer.keepalive_interval_secs {
            self.keepalive_interval_secs = v;
        }
        if let Some(v) = layer.shell_read_timeout_ms {
            self.shell_read_timeout_ms = v;
        }
        if let Some(v) = layer.disconnect_grace_ms {
            self.disconnect_grace_ms = v;
        }
        if let Some(v) = layer.stats_enabled {
            self.stats_enabled = v;
        }
        if let Some(v) = layer.stats_interval_secs {
            self.stats_interval_secs = v;
        }
        if let Some(v) = layer.stats_command_spacing_ms {
            self.stats_command_spacing_ms = v;
        }
        if let Some(v) = layer.stats_disk_path {
            self.stats_disk_path = v;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SftpConfig {
    pub op_timeout_secs: u64,
    pub default_remote_path: String,
    pub download_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for SftpConfig {
    fn default() -> Self {
        Self {
            op_timeout_secs: 30,
            default_remote_path: ".".to_string(),
            download_retries: 2,
            retry_backoff_ms: 1000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct SftpConfigLayer {
    pub op_timeout_secs: Option<u64>,
    pub default_remote_path: Option<String>,
    pub download_retries: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
}

impl SftpConfig {
    fn apply(&mut self, layer: SftpConfigLayer) {
        if let Some(v) = layer.op_timeout_secs {
            self.op_timeout_secs = v;
        }
        if let Some(v) = layer.default_remote_path {
            self.default_remote_path = v;
        }
        if let Some(v) = layer.download_retries {
            self.download_retries = v;
        }
        if let Some(v) = layer.retry_backoff_ms {
            self.retry_backoff_ms = v;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    pub stdout: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            stdout: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct LoggingConfigLayer {
    pub level: Option<String>,
    pub json: Option<bool>,
    pub stdout: Option<bool>,
}

impl LoggingConfig {
    fn apply(&mut self, layer: LoggingConfigLayer) {
        if let Some(v) = layer.level {
            self.level = v;
        }
        if let Some(v) = layer.json {
            self.json = v;
        }
        if let Some(v) = layer.stdout {
            self.stdout = v;
        }
    }
}

fn default_commands() -> BTreeMap<String, String> {
    [
        ("kill_uvicorn", "pkill -f uvicorn"),
        ("reload_nginx", "sudo systemctl reload nginx"),
        ("restart_nginx", "systemctl restart nginx"),
        ("nginx_status", "systemctl status nginx"),
        ("test_nginx", "nginx -t"),
        ("cd_nginx", "cd /etc/nginx/sites-available"),
        ("cd_home", "cd ~"),
        ("list_files", "ls -l"),
        ("python_processes", "ps aux | grep python"),
        ("check_memory", "free -h"),
        ("check_disk", "df -h"),
        ("check_cpu", "top -bn1 | head -n 5"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

#[derive(Clone, Debug)]
pub struct ConfigManager {
    pub paths: AppPaths,
}

impl ConfigManager {
    pub fn new(paths: AppPaths) -> Self {
        Self { paths }
    }

    pub fn load(&self, cwd: Option<&Path>, overrides: Option<AppConfigLayer>) -> Result<AppConfig> {
        let mut cfg = AppConfig::default();

        if self.paths.config_file.exists() {
            debug!(path = %self.paths.config_file.display(), "loading config");
            let layer = Self::load_layer(&self.paths.config_file)?;
            layer.apply_to(&mut cfg);
        }

        if let Some(dir) = cwd {
            let project_path = AppPaths::project_config_path(dir);
            if project_path.exists() {
                debug!(path = %project_path.display(), "loading project config");
                let layer = Self::load_layer(&project_path)?;
                layer.apply_to(&mut cfg);
            }
        }

        if let Some(layer) = overrides {
            layer.apply_to(&mut cfg);
        }

        Ok(cfg)
    }

    pub fn load_layer(path: &Path) -> Result<AppConfigLayer> {
        let content = fs::read_to_string(path).map_err(ConfigError::from)?;
        let layer: AppConfigLayer = toml::from_str(&content).map_err(ConfigError::from)?;
        Ok(layer)
    }

    pub fn save_default(&self) -> Result<()> {
        self.save_config(&AppConfig::default())
    }

    pub fn save_config(&self, cfg: &AppConfig) -> Result<()> {
        if let Some(parent) = self.paths.config_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(cfg).map_err(|e| anyhow::anyhow!(e))?;
        fs::write(&self.paths.config_file, content)?;
        Ok(())
    }
}
