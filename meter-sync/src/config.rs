use std::{fs, path::PathBuf, time::Duration};

use anyhow::{anyhow, bail};
use chrono_tz::Tz;
use meter_client::domain::{SiteId, CHANNEL_COUNT};
use serde::Deserialize;

/// Postgres refuses statements with more bind parameters than this.
const PG_MAX_BIND_PARAMS: usize = 65_535;

fn default_timezone() -> Tz {
    chrono_tz::Europe::Brussels
}

fn default_sample_period_ms() -> u64 {
    500
}

fn default_flush_period_secs() -> u64 {
    60
}

fn default_read_timeout_ms() -> u64 {
    100
}

fn default_flush_queue_capacity() -> usize {
    4
}

fn default_max_connections() -> u32 {
    4
}

fn default_lookback_days() -> i64 {
    4
}

fn default_batch_size() -> usize {
    2000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_routing_table_path() -> PathBuf {
    PathBuf::from("/var/log/openvpn/openvpn-status.log")
}

fn default_remote_data_dir() -> PathBuf {
    PathBuf::from("/opt/meter/data")
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

/// Identity and storage of the edge site this process runs on.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    pub site_id: SiteId,
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SamplerConfig {
    pub primary_url: String,
    /// Present only on production-capable sites.
    pub production_url: Option<String>,
    #[serde(default = "default_sample_period_ms")]
    pub sample_period_ms: u64,
    #[serde(default = "default_flush_period_secs")]
    pub flush_period_secs: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_flush_queue_capacity")]
    pub flush_queue_capacity: usize,
}

impl SamplerConfig {
    pub fn sample_period(&self) -> Duration {
        Duration::from_millis(self.sample_period_ms)
    }

    pub fn flush_period(&self) -> Duration {
        Duration::from_secs(self.flush_period_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Ticks between two flushes.
    pub fn ticks_per_flush(&self) -> u64 {
        (self.flush_period_secs * 1000 / self.sample_period_ms.max(1)).max(1)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub uri: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
    Sftp,
    Local,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    pub kind: RemoteKind,
    /// Data directory on the edge host.
    #[serde(default = "default_remote_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// JSON file holding `{"pwd": "..."}` for SFTP logins.
    pub credentials_file: Option<PathBuf>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Root of mirrored site directories for the local transport.
    pub local_root: Option<PathBuf>,
}

impl RemoteConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,
    /// Concurrent site workers; defaults to min(cpu count, 4).
    pub workers: Option<usize>,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default = "default_routing_table_path")]
    pub routing_table_path: PathBuf,
    pub remote: RemoteConfig,
}

impl SyncConfig {
    pub fn worker_count(&self) -> usize {
        self.workers
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
                    .min(4)
            })
            .max(1)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub site: Option<SiteConfig>,
    pub sampler: Option<SamplerConfig>,
    pub store: Option<StoreConfig>,
    pub sync: Option<SyncConfig>,
    pub metrics: Option<MetricsConfig>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("METER_SYNC_CONFIG").unwrap_or_else(|_| "meter-sync.toml".to_string());
        let contents = fs::read_to_string(&path)
            .map_err(|e| anyhow!("failed to read config {path}: {e}"))?;
        let cfg = Self::from_toml_str(&contents)?;
        Ok(cfg)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(s) = &self.sampler {
            if s.sample_period_ms == 0 {
                bail!("sampler.sample_period_ms must be positive");
            }
            if (s.flush_period_secs * 1000) % s.sample_period_ms != 0 || s.flush_period_secs == 0 {
                bail!("sampler.flush_period_secs must be a whole multiple of the sample period");
            }
            if s.read_timeout_ms >= s.sample_period_ms {
                bail!("sampler.read_timeout_ms must be shorter than the sample period");
            }
            if s.flush_queue_capacity == 0 {
                bail!("sampler.flush_queue_capacity must be positive");
            }
        }

        if let Some(s) = &self.sync {
            if s.lookback_days <= 0 {
                bail!("sync.lookback_days must be positive");
            }
            if s.batch.batch_size == 0 {
                bail!("sync.batch.batch_size must be positive");
            }
            // site_id, day, ts + channels for the widest (raw) rows.
            let max_rows = PG_MAX_BIND_PARAMS / (3 + CHANNEL_COUNT);
            if s.batch.batch_size > max_rows {
                bail!("sync.batch.batch_size must not exceed {max_rows} rows");
            }
            if s.remote.kind == RemoteKind::Local && s.remote.local_root.is_none() {
                bail!("sync.remote.local_root is required for the local transport");
            }
            if s.remote.kind == RemoteKind::Sftp && s.remote.credentials_file.is_none() {
                bail!("sync.remote.credentials_file is required for the sftp transport");
            }
        }

        Ok(())
    }

    pub fn site(&self) -> anyhow::Result<&SiteConfig> {
        self.site.as_ref().ok_or_else(|| anyhow!("missing [site] section"))
    }

    pub fn sampler(&self) -> anyhow::Result<&SamplerConfig> {
        self.sampler.as_ref().ok_or_else(|| anyhow!("missing [sampler] section"))
    }

    pub fn store(&self) -> anyhow::Result<&StoreConfig> {
        self.store.as_ref().ok_or_else(|| anyhow!("missing [store] section"))
    }

    pub fn sync(&self) -> anyhow::Result<&SyncConfig> {
        self.sync.as_ref().ok_or_else(|| anyhow!("missing [sync] section"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EDGE: &str = r#"
        [site]
        site_id = "ECH001"
        data_dir = "/opt/meter/data"

        [sampler]
        primary_url = "http://192.168.1.59/api/v1/data"
        production_url = "http://192.168.1.101/api/v1/data"
    "#;

    #[test]
    fn edge_config_fills_defaults() {
        let cfg = AppConfig::from_toml_str(EDGE).unwrap();
        let sampler = cfg.sampler().unwrap();

        assert_eq!(cfg.site().unwrap().timezone, chrono_tz::Europe::Brussels);
        assert_eq!(sampler.sample_period(), Duration::from_millis(500));
        assert_eq!(sampler.flush_period(), Duration::from_secs(60));
        assert_eq!(sampler.read_timeout(), Duration::from_millis(100));
        assert_eq!(sampler.ticks_per_flush(), 120);
        assert!(cfg.sync().is_err());
    }

    #[test]
    fn sync_config_rejects_oversized_batches() {
        let raw = r#"
            [sync.batch]
            batch_size = 50000

            [sync.remote]
            kind = "local"
            local_root = "/srv/mirror"
        "#;
        assert!(AppConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn sftp_transport_requires_credentials() {
        let raw = r#"
            [sync.remote]
            kind = "sftp"
        "#;
        assert!(AppConfig::from_toml_str(raw).is_err());

        let raw = r#"
            [sync]
            workers = 2

            [sync.remote]
            kind = "sftp"
            credentials_file = "/etc/meter/credentials.json"
        "#;
        let cfg = AppConfig::from_toml_str(raw).unwrap();
        let sync = cfg.sync().unwrap();
        assert_eq!(sync.worker_count(), 2);
        assert_eq!(sync.lookback_days, 4);
        assert_eq!(sync.batch.batch_size, 2000);
        assert_eq!(sync.remote.port, 22);
    }

    #[test]
    fn read_timeout_must_fit_in_a_tick() {
        let raw = r#"
            [sampler]
            primary_url = "http://localhost/api/v1/data"
            read_timeout_ms = 600
        "#;
        assert!(AppConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn flush_period_must_hold_whole_ticks() {
        let raw = r#"
            [sampler]
            primary_url = "http://localhost/api/v1/data"
            sample_period_ms = 700
            read_timeout_ms = 100
            flush_period_secs = 1
        "#;
        assert!(AppConfig::from_toml_str(raw).is_err());
    }
}
