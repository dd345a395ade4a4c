use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;

/// Engine configuration, usually read from `asyncify.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Module used when no installed version is selected. Binary or text format.
    pub module: Option<PathBuf>,
    /// Issue the reserved initialize call before the first call on a fresh
    /// instance.
    #[serde(default = "default_initialize")]
    pub initialize: bool,
    #[serde(default)]
    pub wasm: WasmConfig,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub flow: FlowOptions,
}

fn default_initialize() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            module: None,
            initialize: default_initialize(),
            wasm: WasmConfig::default(),
            update: UpdateConfig::default(),
            flow: FlowOptions::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self, RuntimeError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, RuntimeError> {
        toml::from_str(content).map_err(|e| RuntimeError::Config(format!("Failed to parse config: {e}")))
    }

    /// Config that runs a single module file with everything else defaulted.
    pub fn for_module(path: impl Into<PathBuf>) -> Self {
        Self {
            module: Some(path.into()),
            ..Self::default()
        }
    }
}

/// Wasmtime memory tuning. Unset values keep wasmtime's defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WasmConfig {
    pub memory_reservation: Option<u64>,
    pub memory_reservation_for_growth: Option<u64>,
    pub memory_guard_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateConfig {
    #[serde(default = "default_bundle_dir")]
    pub bundle_dir: PathBuf,
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_updates_enabled")]
    pub enabled: bool,
}

fn default_bundle_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".asyncify")
        .join("bundles")
}
fn default_check_interval() -> u64 {
    6 * 60 * 60
}
fn default_updates_enabled() -> bool {
    true
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            bundle_dir: default_bundle_dir(),
            check_interval_secs: default_check_interval(),
            enabled: default_updates_enabled(),
        }
    }
}

impl UpdateConfig {
    pub fn policy(&self) -> UpdatePolicy {
        UpdatePolicy {
            enabled: self.enabled,
            check_interval: Duration::from_secs(self.check_interval_secs),
        }
    }
}

/// Whether and how often module updates may be installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdatePolicy {
    pub enabled: bool,
    pub check_interval: Duration,
}

impl UpdatePolicy {
    pub fn is_due(&self, last_check: Option<Instant>) -> bool {
        self.enabled && last_check.is_none_or(|at| at.elapsed() >= self.check_interval)
    }
}

/// Host-provided request options stamped on every outgoing command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowOptions {
    pub bundle_id: String,
    pub device_id: String,
    pub country_code: String,
    pub language_code: String,
    pub region_code: String,
    pub app_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let config = EngineConfig::from_toml(r#"module = "guest.wasm""#).unwrap();
        assert_eq!(config.module, Some(PathBuf::from("guest.wasm")));
        assert!(config.initialize);
        assert!(config.update.enabled);
        assert_eq!(config.update.check_interval_secs, 6 * 60 * 60);
        assert!(config.update.bundle_dir.ends_with(".asyncify/bundles"));
        assert_eq!(config.flow, FlowOptions::default());
    }

    #[test]
    fn parses_full_config() {
        let toml_str = r#"
module = "/opt/music.wasm"
initialize = false

[wasm]
memory_reservation = 16777216
memory_guard_size = 65536

[update]
bundle_dir = "/var/lib/asyncify"
check_interval_secs = 60
enabled = false

[flow]
bundle_id = "com.example.music"
country_code = "VN"
language_code = "vi"
app_version = "2.1.0"
"#;
        let config = EngineConfig::from_toml(toml_str).unwrap();
        assert!(!config.initialize);
        assert_eq!(config.wasm.memory_reservation, Some(16 * 1024 * 1024));
        assert_eq!(config.wasm.memory_reservation_for_growth, None);
        assert_eq!(config.update.bundle_dir, PathBuf::from("/var/lib/asyncify"));
        assert_eq!(config.flow.bundle_id, "com.example.music");
        assert_eq!(config.flow.region_code, "");
        assert!(!config.update.policy().is_due(None));
    }

    #[test]
    fn rejects_malformed_config() {
        let err = EngineConfig::from_toml("initialize = \"sometimes\"").unwrap_err();
        assert!(matches!(err, RuntimeError::Config(_)));
    }

    #[test]
    fn update_policy_waits_for_interval() {
        let policy = UpdatePolicy {
            enabled: true,
            check_interval: Duration::from_secs(3600),
        };
        assert!(policy.is_due(None));
        assert!(!policy.is_due(Some(Instant::now())));
        let zero = UpdatePolicy {
            check_interval: Duration::ZERO,
            ..policy
        };
        assert!(zero.is_due(Some(Instant::now())));
    }
}
