//! Configuration for the batch engine.
//!
//! Everything is sourced from environment variables; defaults keep a
//! development machine working without any of them set. Startup validation
//! failures surface as `BatchError::Config` and abort the process.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono_tz::Tz;

use crate::error::BatchError;
use crate::providers::Provider;

/// Default page size for list endpoints.
pub const DEFAULT_PAGE_SIZE: u32 = 100;
/// Default daily quota per key when the provider variable is unset.
pub const DEFAULT_DAILY_LIMIT: u32 = 1000;
/// Default worker pool size for concurrent job executions.
pub const DEFAULT_WORKERS: usize = 20;

/// Per-provider connection settings.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub base_url: String,
    /// Raw secrets, comma-separated in the environment. Never logged.
    pub keys: Vec<String>,
    pub daily_limit: u32,
    pub max_concurrent: usize,
}

/// Bulk-load tuning preset selected by `OPTIMIZATION_PRESET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuningPreset {
    Conservative,
    Balanced,
    Aggressive,
    MemoryConstrained,
}

impl TuningPreset {
    pub fn parse(s: &str) -> Option<TuningPreset> {
        match s.to_ascii_lowercase().as_str() {
            "conservative" => Some(TuningPreset::Conservative),
            "balanced" => Some(TuningPreset::Balanced),
            "aggressive" => Some(TuningPreset::Aggressive),
            "memory-constrained" | "memory_constrained" => Some(TuningPreset::MemoryConstrained),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TuningPreset::Conservative => "conservative",
            TuningPreset::Balanced => "balanced",
            TuningPreset::Aggressive => "aggressive",
            TuningPreset::MemoryConstrained => "memory-constrained",
        }
    }
}

/// Application settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base data directory.
    pub data_dir: PathBuf,
    /// Main relational database.
    pub database_path: PathBuf,
    /// Small side database for the per-day quota ledger.
    pub quota_db_path: PathBuf,
    pub kto: ProviderSettings,
    pub kma: ProviderSettings,
    /// Zone that defines the daily quota boundary and cron evaluation.
    pub timezone: Tz,
    /// Concurrent job executions.
    pub workers: usize,
    /// Default transform chunk size.
    pub batch_size: usize,
    pub preset: TuningPreset,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
    /// Cap on in-flight requests across both providers.
    pub max_concurrent_total: usize,
    /// Minimum wall-time between request starts to one provider.
    pub min_interval: Duration,
    /// Suppression window for duplicate alerts of one incident.
    pub alert_cooldown: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tourbatch");

        Self {
            database_path: data_dir.join("tourbatch.db"),
            quota_db_path: data_dir.join("quota.db"),
            data_dir,
            kto: ProviderSettings {
                base_url: "http://apis.data.go.kr/B551011/KorService2".to_string(),
                keys: Vec::new(),
                daily_limit: DEFAULT_DAILY_LIMIT,
                max_concurrent: 5,
            },
            kma: ProviderSettings {
                base_url: "http://apis.data.go.kr/1360000".to_string(),
                keys: Vec::new(),
                daily_limit: DEFAULT_DAILY_LIMIT,
                max_concurrent: 3,
            },
            timezone: chrono_tz::Asia::Seoul,
            workers: DEFAULT_WORKERS,
            batch_size: 1000,
            preset: TuningPreset::Balanced,
            request_timeout: Duration::from_secs(30),
            max_concurrent_total: 8,
            min_interval: Duration::from_millis(100),
            alert_cooldown: Duration::from_secs(3600),
        }
    }
}

impl Settings {
    /// Build settings from the process environment.
    pub fn from_env() -> Result<Self, BatchError> {
        let mut settings = Settings::default();

        if let Ok(dir) = env::var("DATA_DIR") {
            settings.data_dir = PathBuf::from(dir);
            settings.database_path = settings.data_dir.join("tourbatch.db");
            settings.quota_db_path = settings.data_dir.join("quota.db");
        }
        if let Ok(path) = env::var("DATABASE_PATH") {
            settings.database_path = PathBuf::from(path);
        }

        settings.kto.keys = parse_key_list(&env::var("KTO_API_KEY").unwrap_or_default());
        settings.kma.keys = parse_key_list(&env::var("KMA_API_KEY").unwrap_or_default());

        if let Ok(url) = env::var("KTO_BASE_URL") {
            validate_url(&url)?;
            settings.kto.base_url = url;
        }
        if let Ok(url) = env::var("KMA_BASE_URL") {
            validate_url(&url)?;
            settings.kma.base_url = url;
        }

        settings.kto.daily_limit = parse_var("KTO_API_DAILY_LIMIT", settings.kto.daily_limit)?;
        settings.kma.daily_limit = parse_var("KMA_API_DAILY_LIMIT", settings.kma.daily_limit)?;

        if let Ok(tz) = env::var("BATCH_TIMEZONE") {
            settings.timezone = tz.parse::<Tz>().map_err(|_| BatchError::Config {
                detail: format!("BATCH_TIMEZONE is not a known IANA zone: {tz}"),
            })?;
        }

        settings.workers = parse_var("BATCH_WORKERS", settings.workers)?;
        settings.batch_size = parse_var("BATCH_SIZE", settings.batch_size)?;

        if let Ok(preset) = env::var("OPTIMIZATION_PRESET") {
            settings.preset = TuningPreset::parse(&preset).ok_or_else(|| BatchError::Config {
                detail: format!("unknown OPTIMIZATION_PRESET: {preset}"),
            })?;
        }

        let timeout_secs: u64 = parse_var("REQUEST_TIMEOUT", 30)?;
        settings.request_timeout = Duration::from_secs(timeout_secs);

        settings.max_concurrent_total =
            parse_var("MAX_CONCURRENT_REQUESTS", settings.max_concurrent_total)?;
        let min_interval_ms: u64 = parse_var("MIN_REQUEST_INTERVAL_MS", 100)?;
        settings.min_interval = Duration::from_millis(min_interval_ms);

        let cooldown_secs: u64 = parse_var("ALERT_COOLDOWN_SECS", 3600)?;
        settings.alert_cooldown = Duration::from_secs(cooldown_secs);

        if settings.workers == 0 {
            return Err(BatchError::Config {
                detail: "BATCH_WORKERS must be at least 1".into(),
            });
        }
        if settings.batch_size == 0 {
            return Err(BatchError::Config {
                detail: "BATCH_SIZE must be at least 1".into(),
            });
        }

        Ok(settings)
    }

    pub fn provider(&self, provider: Provider) -> &ProviderSettings {
        match provider {
            Provider::Kto => &self.kto,
            Provider::Kma => &self.kma,
        }
    }

    /// Ensure all directories exist.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        if let Some(parent) = self.database_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Some(parent) = self.quota_db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

/// Comma-separated secrets, with placeholders filtered out.
fn parse_key_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty() && !k.contains("your_") && !k.contains("_here"))
        .map(str::to_string)
        .collect()
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, BatchError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| BatchError::Config {
            detail: format!("{name} is not a valid value: {raw}"),
        }),
        Err(_) => Ok(default),
    }
}

fn validate_url(raw: &str) -> Result<(), BatchError> {
    url::Url::parse(raw).map_err(|e| BatchError::Config {
        detail: format!("invalid base URL {raw}: {e}"),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_key_list_splits_and_filters() {
        let keys = parse_key_list("abc, def ,,your_kto_api_key_here");
        assert_eq!(keys, vec!["abc".to_string(), "def".to_string()]);
    }

    #[test]
    fn parse_key_list_single_key() {
        assert_eq!(parse_key_list("only-one"), vec!["only-one".to_string()]);
        assert!(parse_key_list("").is_empty());
    }

    #[test]
    fn preset_parsing() {
        assert_eq!(
            TuningPreset::parse("memory-constrained"),
            Some(TuningPreset::MemoryConstrained)
        );
        assert_eq!(TuningPreset::parse("balanced"), Some(TuningPreset::Balanced));
        assert!(TuningPreset::parse("turbo").is_none());
    }

    #[test]
    fn defaults_are_consistent() {
        let s = Settings::default();
        assert_eq!(s.timezone, chrono_tz::Asia::Seoul);
        assert_eq!(s.kto.max_concurrent, 5);
        assert!(s.database_path.starts_with(&s.data_dir));
    }
}
