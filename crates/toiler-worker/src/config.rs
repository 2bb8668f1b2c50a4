use crate::{Result, WorkerError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// When a worker should voluntarily exit so the supervisor replaces it
/// with a fresh process.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RestartPolicy {
    #[default]
    Never,
    /// After running for this many seconds.
    Lifetime { seconds: f64 },
    /// After this many select cycles.
    Cycles { count: u64 },
    /// When the file's mtime changes (deploy marker).
    Watch { path: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Default per-job timeout in seconds; a job's own timeout wins, 0
    /// disables the limit.
    pub timeout: f64,
    pub restart: RestartPolicy,
    /// Signal names that stop the loop at the next cycle boundary.
    pub stop_signals: Vec<String>,
    /// Seconds to doze between standby probes.
    pub standby_interval: f64,
    /// Seconds to pause after a transient backend error.
    pub error_pause: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            timeout: 60.0,
            restart: RestartPolicy::Never,
            stop_signals: vec!["term".to_string(), "int".to_string()],
            standby_interval: 10.0,
            error_pause: 0.1,
        }
    }
}

impl WorkerConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: WorkerConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for name in &self.stop_signals {
            // usr1 is the wake channel and alrm backs job timeouts
            if name == "usr1" || name == "alrm" {
                return Err(WorkerError::Config(format!("signal {name:?} is reserved")));
            }
            crate::signals::signal_kind(name)?;
        }
        if self.timeout < 0.0 {
            return Err(WorkerError::Config("timeout must not be negative".to_string()));
        }
        if self.standby_interval <= 0.0 {
            return Err(WorkerError::Config("standby_interval must be positive".to_string()));
        }
        Ok(())
    }
}
