use anyhow::Result;
use config::{Config, Environment, File, Map};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "specflow.toml";
const ENV_PREFIX: &str = "SPECFLOW";

/// Engine configuration.
///
/// Loaded once at startup and handed to the components that need it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct SpecflowConfig {
    /// Worker pool and run limits
    pub engine: EngineConfig,
    /// Flow persistence during runs
    pub persistence: PersistenceConfig,
    /// Pipeline leases
    pub guard: GuardConfig,
    /// Logging
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Pipelines executed at the same time
    pub workers: usize,
    /// A run still going after this long is aborted and marked crashed
    pub flow_timeout_seconds: u64,
}

impl EngineConfig {
    pub fn flow_timeout(&self) -> Duration {
        Duration::from_secs(self.flow_timeout_seconds)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            flow_timeout_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    SavePerStep,
    Batched,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PersistenceConfig {
    pub policy: PolicyKind,
    /// Steps per save for the batched policy
    pub batch_size: usize,
    pub save_timeout_ms: u64,
    /// Extra attempts after a failed save
    pub save_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::SavePerStep,
            batch_size: 10,
            save_timeout_ms: 5000,
            save_retries: 2,
            retry_base_delay_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GuardConfig {
    /// Lease lifetime; running pipelines renew at a third of it
    pub lease_ttl_seconds: u64,
    /// Directory of lease files shared by all engine processes
    pub lock_dir: PathBuf,
}

impl GuardConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_seconds)
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            lease_ttl_seconds: 60,
            lock_dir: PathBuf::from(".specflow/leases"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Filter directive used when `RUST_LOG` is not set
    pub log_level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

impl SpecflowConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. `specflow.toml` in the working directory
    /// 3. Environment variables (`SPECFLOW_ENGINE__WORKERS=8`)
    pub fn load() -> Result<Self> {
        let file = Path::new(CONFIG_FILE);
        Self::load_from(file.exists().then_some(file), None)
    }

    /// `env` replaces the process environment when given.
    pub fn load_from(file: Option<&Path>, env: Option<Map<String, String>>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Some(file) = file {
            builder = builder.add_source(File::from(file));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}
