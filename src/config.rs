//! Client configuration.
//!
//! Stored as JSON under the platform config directory (`config.json`). Missing
//! fields fall back to defaults, and command-line flags override whatever the
//! file says.

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const CONFIG_FILE_NAME: &str = "config.json";
const DEFAULT_DOWNLOAD_DIR: &str = "~/Downloads/PeerSend";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// WebSocket URL of the room relay
    #[serde(default = "default_relay_url")]
    pub relay_url: String,

    /// Address the peer transport listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Host advertised to other peers instead of the bound IP
    #[serde(default)]
    pub advertise_host: Option<String>,

    /// Name shown to other peers; generated when unset
    #[serde(default)]
    pub display_name: Option<String>,

    /// Where finished downloads are written, `~` is expanded
    #[serde(default = "default_download_dir")]
    pub download_dir: String,

    /// Delay between a meta channel opening and the handshake
    #[serde(default = "default_handshake_delay_ms")]
    pub handshake_delay_ms: u64,
}

fn default_relay_url() -> String {
    "ws://127.0.0.1:3333".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:0".to_string()
}

fn default_download_dir() -> String {
    DEFAULT_DOWNLOAD_DIR.to_string()
}

fn default_handshake_delay_ms() -> u64 {
    1000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            listen_addr: default_listen_addr(),
            advertise_host: None,
            display_name: None,
            download_dir: default_download_dir(),
            handshake_delay_ms: default_handshake_delay_ms(),
        }
    }
}

impl ClientConfig {
    /// Load from `path`, or return defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("Config file {} does not exist, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: ClientConfig =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let json = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, json).context("Failed to write config file")?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Fill in a generated display name if none is configured.
    pub fn with_display_name(mut self) -> Self {
        if self.display_name.as_deref().map(str::trim).unwrap_or("").is_empty() {
            self.display_name = Some(generate_display_name());
        }
        self
    }

    pub fn display_name(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(generate_display_name)
    }

    pub fn download_dir(&self) -> PathBuf {
        expand_tilde(&self.download_dir)
    }

    pub fn handshake_delay(&self) -> Duration {
        Duration::from_millis(self.handshake_delay_ms)
    }
}

/// `<platform config dir>/peersend/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "peersend")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path.starts_with("~/") || path == "~" {
        if let Some(base_dirs) = directories::BaseDirs::new() {
            return base_dirs
                .home_dir()
                .join(path.strip_prefix("~/").unwrap_or(""));
        }
    }
    PathBuf::from(path)
}

/// Random `adjective-animal-NN` name.
pub fn generate_display_name() -> String {
    const ADJECTIVES: &[&str] = &[
        "amber", "brisk", "calm", "dusty", "eager", "fuzzy", "gentle", "hollow", "icy", "jolly",
        "lucky", "mellow", "nimble", "quiet", "rusty", "swift",
    ];
    const ANIMALS: &[&str] = &[
        "otter", "heron", "lynx", "marten", "newt", "owl", "panda", "quail", "raven", "seal",
        "tapir", "vole", "wombat", "yak", "zebra", "badger",
    ];

    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quiet");
    let animal = ANIMALS.choose(&mut rng).copied().unwrap_or("otter");
    format!("{}-{}-{:02}", adjective, animal, rng.gen_range(0..100))
}
