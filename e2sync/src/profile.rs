//! Receiver connection profiles.
//!
//! A profile bundles everything needed to reach one receiver: host,
//! credentials, per-protocol ports and the receiver-side directory layout.
//! Profiles are loaded from a TOML file; every field beyond host and
//! credentials has a sensible default matching a stock Enigma2 image.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Which channel is used to quiesce and revive the receiver UI around an
/// upload: raw telnet `init` commands or the OpenWebif-style HTTP API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlSurface {
    Telnet,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Profile name, also used as the per-receiver subdirectory under the
    /// local data and picon roots.
    pub name: String,
    pub host: String,
    pub user: String,
    pub password: String,

    #[serde(default = "default_ftp_port")]
    pub ftp_port: u16,
    #[serde(default = "default_telnet_port")]
    pub telnet_port: u16,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default)]
    pub http_use_ssl: bool,

    #[serde(default = "default_control")]
    pub control: ControlSurface,

    /// Fixed settle delay between telnet steps, seconds.
    #[serde(default = "default_telnet_timeout")]
    pub telnet_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Receiver-side directories.
    #[serde(default = "default_services_path")]
    pub services_path: String,
    #[serde(default = "default_satellites_xml_path")]
    pub satellites_xml_path: String,
    #[serde(default = "default_box_picon_path")]
    pub box_picon_path: String,

    /// Local roots; the profile name is appended to keep receivers apart.
    pub data_path: PathBuf,
    pub picon_path: PathBuf,
    #[serde(default)]
    pub backup_path: Option<PathBuf>,
}

fn default_ftp_port() -> u16 {
    21
}

fn default_telnet_port() -> u16 {
    23
}

fn default_http_port() -> u16 {
    80
}

fn default_control() -> ControlSurface {
    ControlSurface::Http
}

fn default_telnet_timeout() -> u64 {
    5
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_services_path() -> String {
    "/etc/enigma2/".to_string()
}

fn default_satellites_xml_path() -> String {
    "/etc/tuxbox/".to_string()
}

fn default_box_picon_path() -> String {
    "/usr/share/enigma2/picon/".to_string()
}

impl Profile {
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|e| SyncError::Connection(format!("Invalid profile {}: {}", path.display(), e)))
    }

    /// Local directory holding this receiver's downloaded data set.
    pub fn data_dir(&self) -> PathBuf {
        self.data_path.join(&self.name)
    }

    /// Local directory holding this receiver's picons.
    pub fn picon_dir(&self) -> PathBuf {
        self.picon_path.join(&self.name)
    }

    pub fn backup_dir(&self) -> PathBuf {
        match &self.backup_path {
            Some(p) => p.clone(),
            None => self.data_dir().join("backup"),
        }
    }

    pub fn telnet_timeout(&self) -> Duration {
        Duration::from_secs(self.telnet_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
