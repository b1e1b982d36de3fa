use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub catalogue_path: PathBuf,
    /// Switches the keeper to the per-account preference store.
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub chains: Vec<String>,
    #[serde(default = "default_no_pass_period_secs")]
    pub no_pass_period_secs: u64,
    #[serde(default = "default_worst_case_delay_ms")]
    pub worst_case_delay_ms: u64,
    #[serde(default = "default_in_flight_ttl_secs")]
    pub in_flight_ttl_secs: u64,
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

fn default_no_pass_period_secs() -> u64 {
    1800
}

fn default_worst_case_delay_ms() -> u64 {
    5000
}

fn default_in_flight_ttl_secs() -> u64 {
    30
}

fn default_keepalive_interval_secs() -> u64 {
    10
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut cfg: Config = serde_json::from_str(&data).context("parse config json")?;
        cfg.config_path = Some(path.to_path_buf());
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn no_pass_period(&self) -> Duration {
        Duration::from_secs(self.no_pass_period_secs)
    }

    pub fn worst_case_delay(&self) -> Duration {
        Duration::from_millis(self.worst_case_delay_ms)
    }

    pub fn in_flight_ttl(&self) -> Duration {
        Duration::from_secs(self.in_flight_ttl_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    /// Directory holding one file per preference storage key.
    pub fn storage_dir(&self) -> PathBuf {
        self.data_dir.join("storage")
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("logs").join("chain-endpoints.log")
    }

    // Relative paths are taken from the config file's directory.
    fn normalize(&mut self) {
        let base = self
            .config_path
            .as_ref()
            .and_then(|p| p.parent())
            .map(Path::to_path_buf);
        self.data_dir = absolutize(&self.data_dir, base.as_deref());
        self.catalogue_path = absolutize(&self.catalogue_path, base.as_deref());
        for chain in &mut self.chains {
            *chain = chain.trim().to_lowercase();
        }
        let mut seen = HashSet::new();
        self.chains.retain(|c| seen.insert(c.clone()));
        if let Some(account) = &self.account {
            self.account = Some(account.trim().to_string());
        }
    }

    fn validate(&self) -> Result<()> {
        non_zero(self.no_pass_period_secs).context("no_pass_period_secs")?;
        non_zero(self.worst_case_delay_ms).context("worst_case_delay_ms")?;
        non_zero(self.in_flight_ttl_secs).context("in_flight_ttl_secs")?;
        non_zero(self.keepalive_interval_secs).context("keepalive_interval_secs")?;
        if self.chains.iter().any(|c| c.is_empty()) {
            anyhow::bail!("chains: empty chain id");
        }
        if matches!(self.account.as_deref(), Some("")) {
            anyhow::bail!("account: empty address");
        }
        Ok(())
    }
}

fn absolutize(path: &Path, base: Option<&Path>) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    let joined = match base {
        Some(base) if !base.as_os_str().is_empty() => base.join(path),
        _ => path.to_path_buf(),
    };
    std::fs::canonicalize(&joined).unwrap_or(joined)
}

fn non_zero(value: u64) -> Result<()> {
    if value == 0 {
        anyhow::bail!("must be greater than zero");
    }
    Ok(())
}
