//! Agent configuration with builder pattern

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub host_uuid: String,
    pub host_address: String,
    pub pool_uuid: Option<String>,
    pub username: String,
    pub password: String,
    pub session: SessionSettings,
    pub tasks: TaskSettings,
    pub storage: StorageSettings,
    pub network: NetworkSettings,
    pub stats: StatsSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Re-login attempts per call after the session is reported invalid.
    pub max_reauth_attempts: u32,
    /// Credentials kept after password rotation, newest included.
    pub credential_history: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_reauth_attempts: 2,
            credential_history: 3,
        }
    }
}

/// Poll interval and per-operation wall-clock budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSettings {
    pub poll_interval_ms: u64,
    pub start_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    pub reboot_timeout_secs: u64,
    pub migrate_timeout_secs: u64,
    pub snapshot_timeout_secs: u64,
    pub copy_timeout_secs: u64,
    pub scan_timeout_secs: u64,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            start_timeout_secs: 600,
            stop_timeout_secs: 120,
            reboot_timeout_secs: 300,
            migrate_timeout_secs: 3600,
            snapshot_timeout_secs: 1800,
            copy_timeout_secs: 7200,
            scan_timeout_secs: 300,
        }
    }
}

impl TaskSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn reboot_timeout(&self) -> Duration {
        Duration::from_secs(self.reboot_timeout_secs)
    }

    pub fn migrate_timeout(&self) -> Duration {
        Duration::from_secs(self.migrate_timeout_secs)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_secs(self.snapshot_timeout_secs)
    }

    pub fn copy_timeout(&self) -> Duration {
        Duration::from_secs(self.copy_timeout_secs)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Bounded retries of the SR teardown sequence.
    pub teardown_passes: u32,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self { teardown_passes: 2 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Accept a management interface on a tagged VLAN.
    pub allow_management_vlan: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSettings {
    pub rrd_window_secs: u64,
    pub use_https: bool,
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            rrd_window_secs: 60,
            use_https: true,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host_uuid: String::new(),
            host_address: String::new(),
            pool_uuid: None,
            username: "root".into(),
            password: String::new(),
            session: SessionSettings::default(),
            tasks: TaskSettings::default(),
            storage: StorageSettings::default(),
            network: NetworkSettings::default(),
            stats: StatsSettings::default(),
        }
    }
}

impl AgentConfig {
    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder::default()
    }

    /// Load a JSON config file and validate it.
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: AgentConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.host_uuid.is_empty() {
            return Err(crate::Error::Config("host_uuid cannot be empty".into()));
        }
        if self.host_address.is_empty() {
            return Err(crate::Error::Config("host_address cannot be empty".into()));
        }
        if self.username.is_empty() {
            return Err(crate::Error::Config("username cannot be empty".into()));
        }
        if self.tasks.poll_interval_ms == 0 {
            return Err(crate::Error::Config("poll_interval_ms must be positive".into()));
        }
        if self.storage.teardown_passes < 1 {
            return Err(crate::Error::Config("teardown_passes must be at least 1".into()));
        }
        if self.session.credential_history < 1 {
            return Err(crate::Error::Config("credential_history must be at least 1".into()));
        }
        if self.stats.rrd_window_secs == 0 {
            return Err(crate::Error::Config("rrd_window_secs must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct AgentConfigBuilder {
    config: AgentConfig,
}

impl AgentConfigBuilder {
    pub fn host(mut self, uuid: impl Into<String>, address: impl Into<String>) -> Self {
        self.config.host_uuid = uuid.into();
        self.config.host_address = address.into();
        self
    }

    pub fn pool_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.config.pool_uuid = Some(uuid.into());
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.username = username.into();
        self.config.password = password.into();
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.tasks.poll_interval_ms = ms;
        self
    }

    pub fn task_settings(mut self, tasks: TaskSettings) -> Self {
        self.config.tasks = tasks;
        self
    }

    pub fn teardown_passes(mut self, passes: u32) -> Self {
        self.config.storage.teardown_passes = passes;
        self
    }

    pub fn allow_management_vlan(mut self, allow: bool) -> Self {
        self.config.network.allow_management_vlan = allow;
        self
    }

    pub fn max_reauth_attempts(mut self, attempts: u32) -> Self {
        self.config.session.max_reauth_attempts = attempts;
        self
    }

    pub fn use_https(mut self, https: bool) -> Self {
        self.config.stats.use_https = https;
        self
    }

    pub fn build(self) -> AgentConfig {
        self.config
    }

    pub fn build_validated(self) -> crate::Result<AgentConfig> {
        let config = self.build();
        config.validate()?;
        Ok(config)
    }
}
