//! Harness configuration.
//!
//! Loaded from `vmharness.yml`. Every field has a serde default so a partial
//! file (or none at all) yields a working configuration; `load_or_default`
//! writes the defaults back so operators have something to edit.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Top-level configuration for the harness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Path to the VM's `.vmx` descriptor.
    #[serde(default = "default_vmx_path")]
    pub vmx_path: String,

    /// VMware installation directory; `vmrun`/`vmware` are resolved in it.
    #[serde(default = "default_vmware_dir")]
    pub vmware_dir: String,

    /// Guest OS username for in-guest operations.
    #[serde(default = "default_guest_username")]
    pub guest_username: String,

    /// Guest OS password for in-guest operations.
    #[serde(default = "default_guest_password")]
    pub guest_password: String,

    /// Default snapshot to revert to before each task.
    #[serde(default = "default_snapshot_name")]
    pub snapshot_name: String,

    /// Whether to revert to the snapshot before tasks at all.
    #[serde(default = "default_true")]
    pub use_snapshots: bool,

    /// Start the VM in fullscreen presentation mode.
    #[serde(default = "default_true")]
    pub start_fullscreen: bool,

    /// Directory containing task descriptor JSON files.
    #[serde(default = "default_tasks_dir")]
    pub tasks_dir: PathBuf,

    /// Directory where run artifacts are written.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Guest-side paths and program resolution.
    #[serde(default)]
    pub guest: GuestConfig,

    /// Per-operation deadlines.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Retry budget for transient control-plane failures.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            vmx_path: default_vmx_path(),
            vmware_dir: default_vmware_dir(),
            guest_username: default_guest_username(),
            guest_password: default_guest_password(),
            snapshot_name: default_snapshot_name(),
            use_snapshots: true,
            start_fullscreen: true,
            tasks_dir: default_tasks_dir(),
            output_dir: default_output_dir(),
            guest: GuestConfig::default(),
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_vmx_path() -> String {
    "D:/VMs/Win11/Win11.vmx".to_string()
}

fn default_vmware_dir() -> String {
    "C:/Program Files (x86)/VMware/VMware Workstation".to_string()
}

fn default_guest_username() -> String {
    "user".to_string()
}

fn default_guest_password() -> String {
    "password".to_string()
}

fn default_snapshot_name() -> String {
    "clean".to_string()
}

fn default_true() -> bool {
    true
}

fn default_tasks_dir() -> PathBuf {
    PathBuf::from("./tasks/samples")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./runs")
}

impl HarnessConfig {
    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the file if present, otherwise writes and returns the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            debug!(path = %path.display(), "config file absent, writing defaults");
            let config = Self::default();
            std::fs::write(path, serde_yaml::to_string(&config)?)?;
            Ok(config)
        }
    }

    /// Rejects values that would make every later operation fail obscurely.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vmx_path.is_empty() {
            return Err(ConfigError::Invalid("vmx_path must not be empty".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.timeouts.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "timeouts.poll_interval_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Path to the `vmrun` executable.
    pub fn vmrun_path(&self) -> PathBuf {
        Path::new(&self.vmware_dir).join("vmrun.exe")
    }

    /// Path to the `vmware` executable (fullscreen front-end).
    pub fn vmware_path(&self) -> PathBuf {
        Path::new(&self.vmware_dir).join("vmware.exe")
    }
}

/// Guest-side layout: where task files land and how host-style program names
/// resolve to guest paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestConfig {
    /// Directory in the guest that holds per-task descriptor and result files.
    #[serde(default = "default_guest_task_dir")]
    pub task_dir: String,

    /// Directory in the guest where the evaluator tooling is installed.
    #[serde(default = "default_guest_evaluator_dir")]
    pub evaluator_dir: String,

    /// Program plus leading args that run the guest evaluator;
    /// `--task <path> --out <path>` is appended per invocation.
    #[serde(default = "default_evaluator_command")]
    pub evaluator_command: Vec<String>,

    /// Program plus leading args for the generic action interpreter;
    /// `--action <path>` is appended per invocation.
    #[serde(default = "default_generic_runner_command")]
    pub generic_runner_command: Vec<String>,

    /// Host-style program name to guest path translation table.
    #[serde(default = "default_program_map")]
    pub program_map: HashMap<String, String>,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            task_dir: default_guest_task_dir(),
            evaluator_dir: default_guest_evaluator_dir(),
            evaluator_command: default_evaluator_command(),
            generic_runner_command: default_generic_runner_command(),
            program_map: default_program_map(),
        }
    }
}

fn default_guest_task_dir() -> String {
    "C:\\Tasks".to_string()
}

fn default_guest_evaluator_dir() -> String {
    "C:\\evaluators".to_string()
}

fn default_evaluator_command() -> Vec<String> {
    vec![
        "C:\\Program Files\\Python311\\python.exe".to_string(),
        "C:\\evaluators\\eval.py".to_string(),
    ]
}

fn default_generic_runner_command() -> Vec<String> {
    vec![
        "C:\\Program Files\\Python311\\python.exe".to_string(),
        "C:\\evaluators\\generic_action_runner.py".to_string(),
    ]
}

fn default_program_map() -> HashMap<String, String> {
    const POWERSHELL: &str =
        "C:\\Windows\\System32\\WindowsPowerShell\\v1.0\\powershell.exe";
    const CHROME: &str = "C:\\Program Files\\Google\\Chrome\\Application\\chrome.exe";

    HashMap::from([
        ("chrome".to_string(), CHROME.to_string()),
        ("google-chrome".to_string(), CHROME.to_string()),
        (
            "notepad".to_string(),
            "C:\\Windows\\System32\\notepad.exe".to_string(),
        ),
        ("powershell".to_string(), POWERSHELL.to_string()),
    ])
}

impl GuestConfig {
    /// Resolves a host-style program name to its guest path; names without a
    /// mapping pass through unchanged.
    pub fn resolve_program<'a>(&'a self, name: &'a str) -> &'a str {
        self.program_map.get(name).map_or(name, String::as_str)
    }

    /// Guest path of the PowerShell interpreter.
    pub fn powershell(&self) -> &str {
        self.resolve_program("powershell")
    }
}

/// Joins guest path segments with the guest's backslash separator.
pub fn guest_join(dir: &str, name: &str) -> String {
    format!("{}\\{}", dir.trim_end_matches('\\'), name)
}

/// Per-operation deadlines, in seconds unless noted.
///
/// Reverts get the long deadline: they are slow and must not be interrupted
/// mid-flight by an impatient caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_power_on_secs")]
    pub power_on_secs: u64,

    #[serde(default = "default_shutdown_secs")]
    pub shutdown_secs: u64,

    #[serde(default = "default_revert_secs")]
    pub revert_secs: u64,

    #[serde(default = "default_guest_command_secs")]
    pub guest_command_secs: u64,

    #[serde(default = "default_copy_secs")]
    pub copy_secs: u64,

    #[serde(default = "default_evaluation_secs")]
    pub evaluation_secs: u64,

    #[serde(default = "default_list_secs")]
    pub list_secs: u64,

    /// Interval between polls while waiting for a power-state change.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            power_on_secs: default_power_on_secs(),
            shutdown_secs: default_shutdown_secs(),
            revert_secs: default_revert_secs(),
            guest_command_secs: default_guest_command_secs(),
            copy_secs: default_copy_secs(),
            evaluation_secs: default_evaluation_secs(),
            list_secs: default_list_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_power_on_secs() -> u64 {
    60
}
fn default_shutdown_secs() -> u64 {
    30
}
fn default_revert_secs() -> u64 {
    60
}
fn default_guest_command_secs() -> u64 {
    120
}
fn default_copy_secs() -> u64 {
    60
}
fn default_evaluation_secs() -> u64 {
    60
}
fn default_list_secs() -> u64 {
    10
}
fn default_poll_interval_ms() -> u64 {
    1000
}

impl TimeoutConfig {
    pub fn power_on(&self) -> Duration {
        Duration::from_secs(self.power_on_secs)
    }
    pub fn shutdown(&self) -> Duration {
        Duration::from_secs(self.shutdown_secs)
    }
    pub fn revert(&self) -> Duration {
        Duration::from_secs(self.revert_secs)
    }
    pub fn guest_command(&self) -> Duration {
        Duration::from_secs(self.guest_command_secs)
    }
    pub fn copy(&self) -> Duration {
        Duration::from_secs(self.copy_secs)
    }
    pub fn evaluation(&self) -> Duration {
        Duration::from_secs(self.evaluation_secs)
    }
    pub fn list(&self) -> Duration {
        Duration::from_secs(self.list_secs)
    }
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Retry budget for transient control-plane failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    8000
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// IO error reading or writing the config file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse error.
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Semantically invalid value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.snapshot_name, "clean");
        assert!(config.use_snapshots);
        assert!(config.start_fullscreen);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.timeouts.shutdown(), Duration::from_secs(30));
        assert_eq!(config.timeouts.revert(), Duration::from_secs(60));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
vmx_path: "E:/lab/win.vmx"
snapshot_name: "base"
timeouts:
  shutdown_secs: 45
"#;
        let config: HarnessConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.vmx_path, "E:/lab/win.vmx");
        assert_eq!(config.snapshot_name, "base");
        assert_eq!(config.timeouts.shutdown_secs, 45);
        // untouched fields keep defaults
        assert_eq!(config.timeouts.revert_secs, 60);
        assert_eq!(config.guest.task_dir, "C:\\Tasks");
    }

    #[test]
    fn test_validate_rejects_empty_vmx() {
        let mut config = HarnessConfig::default();
        config.vmx_path.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = HarnessConfig::default();
        config.retry.max_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_program_resolution() {
        let guest = GuestConfig::default();
        assert!(guest.resolve_program("chrome").ends_with("chrome.exe"));
        assert!(guest.resolve_program("google-chrome").ends_with("chrome.exe"));
        // unmapped names pass through
        assert_eq!(guest.resolve_program("C:\\custom\\tool.exe"), "C:\\custom\\tool.exe");
    }

    #[test]
    fn test_guest_join() {
        assert_eq!(guest_join("C:\\Tasks", "t1.json"), "C:\\Tasks\\t1.json");
        assert_eq!(guest_join("C:\\Tasks\\", "t1.json"), "C:\\Tasks\\t1.json");
    }

    #[test]
    fn test_load_or_default_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmharness.yml");

        let config = HarnessConfig::load_or_default(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.snapshot_name, "clean");

        // Second load reads the file it just wrote.
        let reloaded = HarnessConfig::load_or_default(&path).unwrap();
        assert_eq!(reloaded.vmx_path, config.vmx_path);
    }
}
