use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::retry::RetryPolicy;

/// Backoff between attempts of a temporarily failed transfer (optional section in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Base delay in seconds for exponential backoff (e.g. 0.5 = 500ms).
    pub base_delay_secs: f64,
    /// Maximum backoff delay in seconds.
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 1.0,
            max_delay_secs: 60,
        }
    }
}

/// How transfers are grouped into fairness buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareType {
    /// Only the sub-share (download/upload) separates transfers.
    #[default]
    None,
    /// One share per local user.
    User,
    /// One share per job.
    Job,
}

/// Transfer share weighting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareConfig {
    #[serde(default)]
    pub share_type: ShareType,
    /// Weight of any share without a reference entry.
    #[serde(default = "default_share_priority")]
    pub default_priority: u32,
    /// Weights keyed by full transfer share (`_default-download`) or by base share name.
    #[serde(default)]
    pub reference: BTreeMap<String, u32>,
}

fn default_share_priority() -> u32 {
    50
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            share_type: ShareType::None,
            default_priority: default_share_priority(),
            reference: BTreeMap::new(),
        }
    }
}

/// Bandwidth floors and inactivity ceiling for running transfers. Zero disables a check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferLimitsConfig {
    /// Minimum current bandwidth (bytes/s) measured over `min_speed_time_secs`.
    #[serde(default)]
    pub min_speed: u64,
    /// Window for bandwidth measurements.
    #[serde(default = "default_min_speed_time")]
    pub min_speed_time_secs: u64,
    /// Minimum average bandwidth (bytes/s) over the whole transfer.
    #[serde(default)]
    pub min_average_speed: u64,
    /// Longest allowed period without any transferred byte.
    #[serde(default = "default_max_inactivity")]
    pub max_inactivity_time_secs: u64,
}

fn default_min_speed_time() -> u64 {
    300
}

fn default_max_inactivity() -> u64 {
    300
}

impl Default for TransferLimitsConfig {
    fn default() -> Self {
        Self {
            min_speed: 0,
            min_speed_time_secs: default_min_speed_time(),
            min_average_speed: 0,
            max_inactivity_time_secs: default_max_inactivity(),
        }
    }
}

/// Source URL rewrite applied during pre-processing (`from` prefix replaced by `to`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlMapRule {
    pub from: String,
    pub to: String,
}

/// Global staging configuration loaded from `~/.config/dstage/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Directory holding per-job control files (file lists, statistics, local info).
    pub control_dir: PathBuf,
    /// Concurrent pre-processing (cache lookup, resolution) slots.
    pub max_processor: usize,
    /// Concurrent transfer slots.
    pub max_delivery: usize,
    /// Extra transfer slots for DTRs at or above `emergency_priority`.
    pub max_emergency: usize,
    /// Concurrent post-processing (registration) slots.
    pub max_prepared: usize,
    #[serde(default = "default_emergency_priority")]
    pub emergency_priority: i32,
    /// Retries allowed for temporary failures (attempts = retries + 1).
    pub max_retries: u32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub share: ShareConfig,
    #[serde(default)]
    pub limits: TransferLimitsConfig,
    /// Remote delivery services for transfers above `remote_size_limit`.
    #[serde(default)]
    pub delivery_services: Vec<String>,
    #[serde(default)]
    pub remote_size_limit: Option<u64>,
    /// Recovery dump location (default `<control_dir>/dtrstate.log`).
    #[serde(default)]
    pub dtr_log: Option<PathBuf>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub url_map: Vec<UrlMapRule>,
    /// Wait between coordination passes when queues are idle.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_emergency_priority() -> i32 {
    90
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_control_dir() -> PathBuf {
    xdg::BaseDirectories::with_prefix("dstage")
        .map(|d| d.get_state_home().join("control"))
        .unwrap_or_else(|_| PathBuf::from("control"))
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            control_dir: default_control_dir(),
            max_processor: 10,
            max_delivery: 10,
            max_emergency: 1,
            max_prepared: 10,
            emergency_priority: default_emergency_priority(),
            max_retries: 10,
            retry: None,
            share: ShareConfig::default(),
            limits: TransferLimitsConfig::default(),
            delivery_services: Vec::new(),
            remote_size_limit: None,
            dtr_log: None,
            cache: CacheConfig::default(),
            url_map: Vec::new(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl StagingConfig {
    /// Recovery dump path: explicit `dtr_log` or `dtrstate.log` in the control dir.
    pub fn dump_path(&self) -> PathBuf {
        self.dtr_log
            .clone()
            .unwrap_or_else(|| self.control_dir.join("dtrstate.log"))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let retry = self.retry.clone().unwrap_or_default();
        RetryPolicy {
            base_delay: Duration::from_secs_f64(retry.base_delay_secs.max(0.0)),
            max_delay: Duration::from_secs(retry.max_delay_secs),
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("dstage")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<StagingConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = StagingConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }
    load_from_path(&path)
}

/// Load configuration from an explicit file.
pub fn load_from_path(path: &Path) -> Result<StagingConfig> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let cfg: StagingConfig =
        toml::from_str(&data).with_context(|| format!("parse config: {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        control_dir = "/var/spool/dstage"
        max_processor = 4
        max_delivery = 8
        max_emergency = 2
        max_prepared = 3
        max_retries = 2
    "#;

    #[test]
    fn default_config_values() {
        let cfg = StagingConfig::default();
        assert_eq!(cfg.max_processor, 10);
        assert_eq!(cfg.max_delivery, 10);
        assert_eq!(cfg.max_emergency, 1);
        assert_eq!(cfg.max_prepared, 10);
        assert_eq!(cfg.max_retries, 10);
        assert_eq!(cfg.share.share_type, ShareType::None);
        assert_eq!(cfg.share.default_priority, 50);
    }

    #[test]
    fn config_toml_roundtrip() {
        let cfg = StagingConfig::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: StagingConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.max_delivery, cfg.max_delivery);
        assert_eq!(parsed.control_dir, cfg.control_dir);
        assert_eq!(parsed.limits.max_inactivity_time_secs, 300);
    }

    #[test]
    fn minimal_config_fills_defaults() {
        let cfg: StagingConfig = toml::from_str(MINIMAL).unwrap();
        assert_eq!(cfg.max_delivery, 8);
        assert_eq!(cfg.emergency_priority, 90);
        assert_eq!(cfg.poll_interval_ms, 50);
        assert!(cfg.retry.is_none());
        assert!(cfg.delivery_services.is_empty());
        assert_eq!(
            cfg.dump_path(),
            PathBuf::from("/var/spool/dstage/dtrstate.log")
        );
    }

    #[test]
    fn shares_limits_and_url_map() {
        let toml = format!(
            "{MINIMAL}\n{}",
            r#"
            remote_size_limit = 1048576
            delivery_services = ["https://delivery.example.org:443/datadeliveryservice"]

            [share]
            share_type = "user"
            default_priority = 40

            [share.reference]
            "_default-download" = 80

            [limits]
            min_average_speed = 1000
            max_inactivity_time_secs = 30

            [[url_map]]
            from = "gsiftp://se.example.org/data"
            to = "file:/mnt/se/data"
            "#
        );
        let cfg: StagingConfig = toml::from_str(&toml).unwrap();
        assert_eq!(cfg.share.share_type, ShareType::User);
        assert_eq!(cfg.share.reference.get("_default-download"), Some(&80));
        assert_eq!(cfg.limits.min_average_speed, 1000);
        assert_eq!(cfg.limits.min_speed_time_secs, 300);
        assert_eq!(cfg.remote_size_limit, Some(1_048_576));
        assert_eq!(cfg.url_map.len(), 1);
        assert_eq!(cfg.url_map[0].to, "file:/mnt/se/data");
    }

    #[test]
    fn retry_section_builds_policy() {
        let toml = format!(
            "{MINIMAL}\n{}",
            r#"
            [retry]
            base_delay_secs = 0.5
            max_delay_secs = 15
            "#
        );
        let cfg: StagingConfig = toml::from_str(&toml).unwrap();
        let policy = cfg.retry_policy();
        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert_eq!(policy.max_delay, Duration::from_secs(15));
    }
}
