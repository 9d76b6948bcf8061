use std::{collections::HashMap, net::IpAddr, path::PathBuf};
use chrono::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamKind {
    Http,
    Https,
    Socks5,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct UpstreamSettings {
    pub host: String,
    pub port: u16,
    pub kind: UpstreamKind,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Display name carried over from the profile store; never interpreted.
    #[serde(default)]
    pub label: Option<String>,
    /// Extra trust anchors for an HTTPS-kind upstream presenting a private CA.
    #[serde(default)]
    pub cacert_file: Option<PathBuf>,
}

impl UpstreamSettings {
    /// Credentials count as present when the username is non-blank; the
    /// password may legitimately be empty.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match self.username.as_deref() {
            Some(user) if !user.trim().is_empty() => {
                Some((user, self.password.as_deref().unwrap_or("")))
            }
            _ => None,
        }
    }
}

fn default_listen_host() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

fn default_handshake_timeout() -> Duration {
    Duration::seconds(15)
}

#[serde_with::serde_as]
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Settings {
    /// Address the proxy listens on; loopback unless told otherwise.
    #[serde(default = "default_listen_host")]
    pub listen_host: IpAddr,
    pub listen_port: u16,

    /// Bound on connect and upstream handshakes. Never applied to the tunnel
    /// phase, so idle long-lived tunnels survive.
    #[serde_as(as = "serde_with::DurationSeconds<i64>")]
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: Duration,

    /// Named upstream profiles supplied by the operator's profile store.
    #[serde(default)]
    pub upstreams: HashMap<String, UpstreamSettings>,

    /// Profile to chain through; absent means direct connections.
    #[serde(default)]
    pub active_upstream: Option<String>,
}

impl Settings {
    pub fn resolve_upstream(&self) -> anyhow::Result<Option<UpstreamSettings>> {
        match self.active_upstream {
            None => Ok(None),
            Some(ref name) => self
                .upstreams
                .get(name)
                .cloned()
                .map(Some)
                .ok_or_else(|| anyhow::anyhow!("active-upstream {name:?} is not a configured profile")),
        }
    }

    pub fn handshake_timeout_std(&self) -> std::time::Duration {
        self.handshake_timeout
            .to_std()
            .unwrap_or_else(|_| std::time::Duration::from_secs(15))
    }
}

pub fn init() -> Settings {
    toml::from_str(&std::fs::read_to_string("./config.toml").expect("Failed to read config file"))
        .expect("Failed to parse config file")
}
