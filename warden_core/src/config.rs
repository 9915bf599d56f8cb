use crate::instrument::InstrumentationKind;
use crate::supervisor::{Classpath, SessionKey, SupervisorConfig};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SupervisorSettings {
    /// Worker program and leading arguments. Unset means the binary that
    /// ships next to the driver.
    #[serde(default)]
    pub worker_command: Option<Vec<String>>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_setup_timeout_ms")]
    pub setup_timeout_ms: u64,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default)]
    pub warmup_on_start: bool,
    /// 0 disables the worker's idle watchdog.
    #[serde(default = "default_worker_idle_timeout_ms")]
    pub worker_idle_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    2000
}

fn default_setup_timeout_ms() -> u64 {
    10_000
}

fn default_stop_grace_ms() -> u64 {
    500
}

fn default_max_sessions() -> usize {
    1
}

pub fn default_worker_idle_timeout_ms() -> u64 {
    120_000
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            worker_command: None,
            working_dir: None,
            request_timeout_ms: default_request_timeout_ms(),
            setup_timeout_ms: default_setup_timeout_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            max_sessions: default_max_sessions(),
            warmup_on_start: false,
            worker_idle_timeout_ms: default_worker_idle_timeout_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SessionSettings {
    #[serde(default)]
    pub user_paths: Vec<PathBuf>,
    #[serde(default)]
    pub dependency_paths: Vec<PathBuf>,
    #[serde(default)]
    pub instrumentation: InstrumentationKind,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct LimitsSettings {
    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,
}

pub fn default_max_call_depth() -> usize {
    256
}

impl Default for LimitsSettings {
    fn default() -> Self {
        Self {
            max_call_depth: default_max_call_depth(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct WardenConfig {
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub limits: LimitsSettings,
}

impl WardenConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: WardenConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        let settings = &self.supervisor;
        let defaults = SupervisorConfig::default();
        SupervisorConfig {
            worker_command: settings
                .worker_command
                .clone()
                .filter(|command| !command.is_empty())
                .unwrap_or(defaults.worker_command),
            working_dir: settings.working_dir.clone(),
            request_timeout: Duration::from_millis(settings.request_timeout_ms),
            setup_timeout: Duration::from_millis(settings.setup_timeout_ms),
            stop_grace: Duration::from_millis(settings.stop_grace_ms),
            max_sessions: settings.max_sessions.max(1),
            warmup_on_start: settings.warmup_on_start,
            worker_idle_timeout: match settings.worker_idle_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            max_call_depth: self.limits.max_call_depth,
        }
    }

    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(
            Classpath {
                user_paths: self.session.user_paths.clone(),
                dependency_paths: self.session.dependency_paths.clone(),
            },
            self.session.instrumentation,
        )
    }
}
