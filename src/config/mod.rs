use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

use crate::logging::LoggingConfig;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub browser: BrowserConfig,
    pub executor: ExecutorConfig,
    pub frontier: FrontierConfig,
    pub recovery: RecoveryConfig,
    pub stats: StatsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Hard bound on concurrent sessions; `acquire` blocks once reached.
    pub max_sessions: usize,
    pub headless: bool,
    pub launch_timeout_seconds: u64,
    pub navigation_timeout_seconds: u64,
    pub user_agents: Vec<String>,
    /// Minimum spacing between requests to the same domain (HTTP driver).
    pub per_domain_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Concurrent task workers per execution, within one phase.
    pub workers: usize,
    pub dequeue_batch_size: usize,
    pub node_timeout_seconds: u64,
    /// Sleep between frontier polls when no pending work exists.
    pub idle_poll_ms: u64,
    /// Scaled-down limits consumed by health-check dry runs.
    pub max_urls_per_phase: Option<usize>,
    pub max_depth: Option<usize>,
    pub skip_data_storage: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontierConfig {
    /// A claimed task not completed within this window becomes
    /// dequeue-eligible again.
    pub visibility_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Retry budget when no rule matches the error signal.
    pub default_max_retries: u32,
    pub default_retry_delay_ms: u64,
    /// Rules with at least `demotion_min_outcomes` recorded outcomes and a
    /// success ratio below `demotion_success_ratio` lose this much
    /// effective priority at the next snapshot refresh.
    pub demotion_step: i64,
    pub demotion_min_outcomes: u64,
    pub demotion_success_ratio: f64,
    pub snapshot_refresh_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    pub flush_interval_ms: u64,
    /// Cap on buffered error-log rows between flushes.
    pub max_buffered_errors: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();

        Self {
            database: DatabaseConfig {
                path: data_dir.join("crawlgrid.db"),
                max_connections: 10,
            },
            browser: BrowserConfig {
                max_sessions: 8,
                headless: true,
                launch_timeout_seconds: 30,
                navigation_timeout_seconds: 30,
                user_agents: vec![
                    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
                    "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0".to_string(),
                ],
                per_domain_delay_ms: 1000,
            },
            executor: ExecutorConfig {
                workers: 4,
                dequeue_batch_size: 10,
                node_timeout_seconds: 30,
                idle_poll_ms: 250,
                max_urls_per_phase: None,
                max_depth: None,
                skip_data_storage: false,
            },
            frontier: FrontierConfig {
                visibility_timeout_seconds: 300,
            },
            recovery: RecoveryConfig {
                default_max_retries: 3,
                default_retry_delay_ms: 2000,
                demotion_step: 5,
                demotion_min_outcomes: 10,
                demotion_success_ratio: 0.2,
                snapshot_refresh_seconds: 60,
            },
            stats: StatsConfig {
                flush_interval_ms: 1000,
                max_buffered_errors: 10_000,
            },
            logging: LoggingConfig {
                log_directory: data_dir.join("logs"),
                ..LoggingConfig::default()
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from the default location, creating it with
    /// defaults on first run.
    pub async fn load() -> Result<Self> {
        let config_path = default_config_path();

        if config_path.exists() {
            Self::load_from_file(&config_path).await
        } else {
            info!("No configuration file found, using defaults");
            let config = Self::default();
            config.save(&config_path).await?;
            Ok(config)
        }
    }

    pub async fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let mut config: AppConfig = toml::from_str(&content)?;
        ConfigOverrides::apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub async fn save<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path.as_ref(), content).await?;
        info!("Configuration saved to: {}", path.as_ref().display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.max_connections == 0 {
            return Err(anyhow::anyhow!("database.max_connections must be > 0"));
        }
        if self.browser.max_sessions == 0 {
            return Err(anyhow::anyhow!("browser.max_sessions must be > 0"));
        }
        if self.browser.user_agents.is_empty() {
            return Err(anyhow::anyhow!("at least one user agent must be configured"));
        }
        if self.executor.workers == 0 {
            return Err(anyhow::anyhow!("executor.workers must be > 0"));
        }
        if self.executor.dequeue_batch_size == 0 {
            return Err(anyhow::anyhow!("executor.dequeue_batch_size must be > 0"));
        }
        if self.frontier.visibility_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("frontier.visibility_timeout_seconds must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.recovery.demotion_success_ratio) {
            return Err(anyhow::anyhow!(
                "recovery.demotion_success_ratio must be between 0.0 and 1.0"
            ));
        }
        if self.stats.flush_interval_ms == 0 {
            return Err(anyhow::anyhow!("stats.flush_interval_ms must be > 0"));
        }
        Ok(())
    }
}

/// Environment-based configuration overrides
pub struct ConfigOverrides;

impl ConfigOverrides {
    pub fn apply(config: &mut AppConfig) {
        if let Ok(db_path) = std::env::var("CG_DB_PATH") {
            config.database.path = PathBuf::from(db_path);
        }
        if let Ok(sessions) = std::env::var("CG_MAX_SESSIONS") {
            if let Ok(n) = sessions.parse::<usize>() {
                config.browser.max_sessions = n;
            }
        }
        if let Ok(workers) = std::env::var("CG_WORKERS") {
            if let Ok(n) = workers.parse::<usize>() {
                config.executor.workers = n;
            }
        }
        if let Ok(headless) = std::env::var("CG_HEADLESS") {
            config.browser.headless = headless.to_lowercase() == "true";
        }
        if let Ok(level) = std::env::var("CG_LOG_LEVEL") {
            config.logging.level = level;
        }
    }
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("io", "crawlgrid", "crawlgrid")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default().join("data"))
}

fn default_config_path() -> PathBuf {
    directories::ProjectDirs::from("io", "crawlgrid", "crawlgrid")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default().join("config.toml"))
}
