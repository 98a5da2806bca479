use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Root of all per-user state (keys, mail, logs).
    pub state_root: PathBuf,

    /// The status UNIX socket; default lives under the state root.
    pub status_sock: Option<PathBuf>,

    /// The domain reported on the status socket.
    #[serde(default = "default_fulldomain")]
    pub fulldomain: String,

    pub imap: ImapConfig,
    pub upstream: UpstreamConfig,
    pub tls: Option<TlsConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ImapConfig {
    pub listen_addr: SocketAddr,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UpstreamConfig {
    /// host:port to dial.
    pub addr: String,
    /// TLS name; defaults to the host part of `addr`.
    pub host: Option<String>,
    /// Plaintext upstream, for tests against local servers.
    #[serde(default)]
    pub insecure: bool,
    /// Extra CA bundle to trust.
    pub trust_ca: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
    /// Plaintext listener offering STARTTLS instead of implicit TLS.
    #[serde(default)]
    pub starttls: bool,
}

impl Config {
    pub fn status_sock(&self) -> PathBuf {
        self.status_sock
            .clone()
            .unwrap_or_else(|| self.state_root.join("citm.sock"))
    }

    pub fn upstream_host(&self) -> String {
        match &self.upstream.host {
            Some(host) => host.clone(),
            None => self
                .upstream
                .addr
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| self.upstream.addr.clone()),
        }
    }
}

fn default_fulldomain() -> String {
    "splintermail.com".into()
}

pub fn read_config(config_file: PathBuf) -> Result<Config> {
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .open(config_file.as_path())?;

    let mut config = String::new();
    file.read_to_string(&mut config)?;

    Ok(toml::from_str(&config)?)
}
