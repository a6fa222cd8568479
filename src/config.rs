//! TOML configuration for the casebench orchestrator.
//!
//! Layered the same way everywhere: an explicit path (CLI flag or the
//! `CASEBENCH_CONFIG` environment variable), then the system location, then
//! compiled-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming the config file to load.
pub const CONFIG_ENV: &str = "CASEBENCH_CONFIG";

/// Environment variable holding the credential master secret.
pub const SECRET_KEY_ENV: &str = "CASEBENCH_SECRET_KEY";

const SYSTEM_CONFIG_PATH: &str = "/etc/casebench/casebench.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the orchestrator process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded orchestrator configuration");
        Ok(config)
    }

    /// Resolve configuration from, in order:
    /// 1. `explicit` (usually the `--config` flag).
    /// 2. The path in `CASEBENCH_CONFIG`.
    /// 3. `/etc/casebench/casebench.toml`.
    /// 4. Compiled-in defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Self {
        let env_path = std::env::var(CONFIG_ENV).ok().map(PathBuf::from);
        for path in explicit.map(Path::to_path_buf).into_iter().chain(env_path) {
            match Self::load(&path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "config file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Filesystem locations used by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// SQLite database backing the bulletin-board tables.
    pub database: PathBuf,
    /// Root directory for per-job and per-case evidence.
    pub evidence_dir: PathBuf,
    /// Directory that case data files are resolved against.
    pub test_cases_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("data/casebench.db"),
            evidence_dir: PathBuf::from("data/evidence"),
            test_cases_dir: PathBuf::from("data/cases"),
        }
    }
}

// ---------------------------------------------------------------------------
// Docker / browser environment
// ---------------------------------------------------------------------------

/// Browser container provisioning parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Browser image started for every web-mode job.
    pub image: String,
    /// Docker network to attach containers to. When set, sessions are opened
    /// against the container name instead of the published host port.
    pub network: Option<String>,
    /// Host used to reach published WebDriver ports.
    pub webdriver_host: String,
    /// Memory limit in bytes.
    pub memory_limit: i64,
    /// Shared memory size in bytes. Chrome crashes with the Docker default.
    pub shm_size: i64,
    pub selenium_base_port: u16,
    pub display_base_port: u16,
    /// Number of consecutive port offsets probed before giving up.
    pub port_window: u16,
    pub startup_delay_secs: u64,
    pub ready_timeout_secs: u64,
    pub ready_poll_interval_ms: u64,
    pub session_warmup_secs: u64,
    pub session_attempts: u32,
    pub session_backoff_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: "selenium/standalone-chrome:latest".to_string(),
            network: None,
            webdriver_host: "127.0.0.1".to_string(),
            memory_limit: 2 * 1024 * 1024 * 1024,
            shm_size: 2 * 1024 * 1024 * 1024,
            selenium_base_port: 4444,
            display_base_port: 5900,
            port_window: 20,
            startup_delay_secs: 5,
            ready_timeout_secs: 45,
            ready_poll_interval_ms: 1000,
            session_warmup_secs: 10,
            session_attempts: 5,
            session_backoff_secs: 5,
        }
    }
}

impl DockerConfig {
    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    pub fn session_warmup(&self) -> Duration {
        Duration::from_secs(self.session_warmup_secs)
    }

    pub fn session_backoff(&self) -> Duration {
        Duration::from_secs(self.session_backoff_secs)
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// How web-mode jobs share the browser when more than one worker is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebConcurrency {
    /// Run web-mode jobs with a single worker driving a single session.
    Serialize,
    /// Open one session per worker against the job's container.
    SessionPerWorker,
}

/// Case execution limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub web_concurrency: WebConcurrency,
    /// Upper bound applied to the concurrency a job asks for.
    pub max_concurrency: usize,
    /// How long `highlight` keeps the marker before restoring the style.
    pub highlight_millis: u64,
    /// Interval between element lookups inside `wait_for`.
    pub element_poll_millis: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            web_concurrency: WebConcurrency::Serialize,
            max_concurrency: 16,
            highlight_millis: 300,
            element_poll_millis: 250,
        }
    }
}

impl ExecutionConfig {
    /// Worker count for a job asking for `requested` workers.
    pub fn effective_concurrency(&self, requested: usize, web: bool) -> usize {
        let capped = requested.clamp(1, self.max_concurrency.max(1));
        if web && self.web_concurrency == WebConcurrency::Serialize {
            1
        } else {
            capped
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound services
// ---------------------------------------------------------------------------

/// Endpoints that script capabilities forward requests to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub rest_api_url: Option<String>,
    pub database_api_url: Option<String>,
    pub queue_api_url: Option<String>,
    pub mail_api_url: Option<String>,
    pub spreadsheet_api_url: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            rest_api_url: None,
            database_api_url: None,
            queue_api_url: None,
            mail_api_url: None,
            spreadsheet_api_url: None,
            request_timeout_secs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Broker and channel names for lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// RabbitMQ management endpoint, e.g. `http://rabbit:15672`.
    pub broker_url: Option<String>,
    pub broker_user: Option<String>,
    pub broker_password: Option<String>,
    pub vhost: String,
    pub exchange: String,
    pub case_channel: String,
    pub job_channel: String,
    /// Interval of the outbox dispatcher loop.
    pub dispatch_interval_secs: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            broker_url: None,
            broker_user: None,
            broker_password: None,
            vhost: "/".to_string(),
            exchange: "amq.default".to_string(),
            case_channel: "tasks.insert_case_execution".to_string(),
            job_channel: "tasks.update_test_execution".to_string(),
            dispatch_interval_secs: 2,
        }
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Master secret for password credentials. Falls back to
    /// `CASEBENCH_SECRET_KEY` when unset.
    pub secret_key: Option<String>,
}

impl CredentialsConfig {
    pub fn resolve_secret(&self) -> Option<String> {
        self.secret_key
            .clone()
            .or_else(|| std::env::var(SECRET_KEY_ENV).ok())
            .filter(|s| !s.is_empty())
    }
}
