use std::path::PathBuf;
use zeroize::Zeroizing;

#[derive(Clone, Debug)]
pub struct SshConnectConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_method: AuthMethod,
    pub host_key_policy: HostKeyPolicy,
    pub keepalive_interval_secs: u64,
    pub connect_timeout_ms: u64,
    pub term: String,
    pub term_width: u32,
    pub term_height: u32,
}

impl SshConnectConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        auth_method: AuthMethod,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            auth_method,
            host_key_policy: HostKeyPolicy::AcceptAny,
            keepalive_interval_secs: 15,
            connect_timeout_ms: 15000,
            term: "xterm-256color".to_string(),
            term_width: 120,
            term_height: 40,
        }
    }
}

#[derive(Clone, Debug)]
pub enum AuthMethod {
    Password {
        password: Zeroizing<String>,
    },
    Key {
        private_key_path: PathBuf,
        passphrase: Option<Zeroizing<String>>,
    },
}

/// Server key acceptance.
///
/// `AcceptAny` trusts whatever key the server presents, logging a warning.
/// `Pinned` accepts only keys whose SHA-256 fingerprint (as printed by
/// `ssh-keygen -l`, e.g. `SHA256:...`) is listed.
#[derive(Clone, Debug)]
pub enum HostKeyPolicy {
    AcceptAny,
    Pinned { fingerprints: Vec<String> },
}
