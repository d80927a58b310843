use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::credential::Mode;
use crate::error::Result;

const APP_DIR: &str = "PuffVPN";
const SETTINGS_FILE: &str = "settings.json";
const PROXY_CONFIG_FILE: &str = "config.json";
const TUNNEL_CONFIG_FILE: &str = "singbox-config.json";
const ENGINE_DIR: &str = "xray";
const XRAY_BIN: &str = "xray";
const SINGBOX_BIN: &str = "sing-box";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub listen: String,
    pub socks_port: u16,
    pub http_port: u16,
    /// How long a silent engine is given before the session counts as connected.
    pub grace_period_ms: u64,
    pub log_level: String,
    pub engine_dir: Option<PathBuf>,
    /// Windows `ProxyOverride` list.
    pub bypass: String,
    pub tun: TunSettings,
    pub dns: DnsSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1".to_string(),
            socks_port: 10808,
            http_port: 10809,
            grace_period_ms: 3000,
            log_level: "info".to_string(),
            engine_dir: None,
            bypass: "localhost;127.*;10.*;192.168.*;<local>".to_string(),
            tun: TunSettings::default(),
            dns: DnsSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TunSettings {
    pub interface_name: String,
    pub inet4_address: String,
    pub mtu: u32,
    pub stack: String,
}

impl Default for TunSettings {
    fn default() -> Self {
        Self {
            interface_name: "PuffVPN".to_string(),
            inet4_address: "172.19.0.1/30".to_string(),
            mtu: 1500,
            stack: "system".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DnsSettings {
    /// Resolver reached through the tunnel.
    pub remote: String,
    /// Resolver reached directly.
    pub local: String,
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            remote: "8.8.8.8".to_string(),
            local: "223.5.5.5".to_string(),
        }
    }
}

impl Settings {
    /// Reads `settings.json` from the data directory. Missing or unreadable files fall
    /// back to defaults.
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join(SETTINGS_FILE);
        if !path.exists() {
            return Self::default();
        }
        let raw = match fs::read_to_string(&path) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "settings unreadable, using defaults");
                return Self::default();
            }
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "settings malformed, using defaults");
            Self::default()
        })
    }

    pub fn save(&self, data_dir: &Path) -> Result<()> {
        fs::create_dir_all(data_dir)?;
        let content = serde_json::to_string_pretty(self)?;
        fs::write(data_dir.join(SETTINGS_FILE), content)?;
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Address published as the system-wide HTTP proxy.
    pub fn http_proxy_address(&self) -> String {
        format!("{}:{}", self.listen, self.http_port)
    }
}

/// Filesystem locations used by a session.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub data_dir: PathBuf,
    pub engine_dir: PathBuf,
}

impl AppPaths {
    pub fn new(data_dir: impl Into<PathBuf>, engine_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            engine_dir: engine_dir.into(),
        }
    }

    /// Platform data directory plus the engine directory next to the executable,
    /// unless `settings.engine_dir` overrides it.
    pub fn discover(settings: &Settings) -> Self {
        let data_dir = Self::default_data_dir();
        let engine_dir = settings.engine_dir.clone().unwrap_or_else(|| {
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(|dir| dir.join(ENGINE_DIR)))
                .unwrap_or_else(|| PathBuf::from(ENGINE_DIR))
        });
        Self {
            data_dir,
            engine_dir,
        }
    }

    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_DIR)
    }

    pub fn config_path(&self, mode: Mode) -> PathBuf {
        let file = match mode {
            Mode::Proxy => PROXY_CONFIG_FILE,
            Mode::Tunnel => TUNNEL_CONFIG_FILE,
        };
        self.data_dir.join(file)
    }

    /// Places the engine executable may live, most preferred first.
    pub fn engine_candidates(&self, mode: Mode) -> [PathBuf; 2] {
        let name = engine_file_name(mode);
        [
            self.engine_dir.join(&name),
            self.engine_dir.join(ENGINE_DIR).join(&name),
        ]
    }
}

pub fn engine_file_name(mode: Mode) -> String {
    let stem = match mode {
        Mode::Proxy => XRAY_BIN,
        Mode::Tunnel => SINGBOX_BIN,
    };
    format!("{stem}{}", std::env::consts::EXE_SUFFIX)
}
