use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub segments: usize,
    pub download_dir: String,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    /// Require `206 Partial Content` with a matching `Content-Range` on
    /// every segment instead of accepting any 2xx.
    pub strict_status: bool,
}

impl Default for Config {
    fn default() -> Self {
        let download_dir = dirs::download_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join("Downloads")))
            .unwrap_or_else(|| PathBuf::from("."))
            .to_string_lossy()
            .to_string();

        Self {
            segments: 10,
            download_dir,
            user_agent: format!("sdm/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
            strict_status: true,
        }
    }
}

pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sdm")
        .join("config.toml")
}

impl Config {
    pub fn load() -> Self {
        let path = config_path();
        match std::fs::read_to_string(&path) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable config");
                Config::default()
            }),
            Err(_) => {
                let cfg = Config::default();
                let _ = cfg.save();
                cfg
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Failed to parse config file")
    }

    pub fn save(&self) -> Result<()> {
        let path = config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }
        let toml = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;
        std::fs::write(&path, toml)
            .context("Failed to write config file")?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn resolve_output_path(&self, filename: &str) -> PathBuf {
        let path = std::path::Path::new(filename);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            PathBuf::from(&self.download_dir).join(filename)
        }
    }

    pub fn print(&self) {
        eprintln!("  Config        : {}", config_path().display());
        eprintln!("  Download dir  : {}", self.download_dir);
        eprintln!("  Segments      : {}", self.segments);
        eprintln!("  User agent    : {}", self.user_agent);
        eprintln!("  Timeouts      : connect {}s, read {}s", self.connect_timeout_secs, self.read_timeout_secs);
        eprintln!("  Strict status : {}", if self.strict_status { "yes" } else { "no" });
    }
}
