//! Configuration Management
//!
//! Provides functionality for:
//! - Loading/saving configuration
//! - Environment overrides for containerised deployments
//! - Configuration validation
//! - Default configuration

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cluster::LocalIdentity;
use crate::error::SwarmError;
use crate::tasks::{SingleTrigger, TaskOptions, TaskPolicy};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address other members know this node by
    #[serde(default = "default_address")]
    pub address: String,
    /// Further ids this node answers to
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Listening address of the message server
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Port used to serve and to reach peers given without a port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Client side bound on one round trip
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Server side bound on handling one inbound message
    #[serde(default = "default_request_timeout")]
    pub max_processing_time_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Kubernetes when a service account is mounted, standalone otherwise
    #[default]
    Auto,
    Standalone,
    Kubernetes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesConfig {
    #[serde(default = "default_service_account_path")]
    pub service_account_path: String,
    #[serde(default = "default_api_host")]
    pub api_host: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// Label selector for member pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// Used as `app=<name>` when no selector is given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    /// Read from the service account folder when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub kind: ProviderKind,
    /// Interval between full resyncs
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingConfig {
    /// Virtual nodes per member
    #[serde(default = "default_replicas")]
    pub replicas: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    #[serde(default = "default_task_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_true")]
    pub serialized: bool,
    #[serde(default)]
    pub single_trigger: SingleTrigger,
    #[serde(default = "default_max_queue_length")]
    pub max_queue_length: usize,
    /// Options applied to a task when it is registered under that name
    #[serde(default)]
    pub overrides: BTreeMap<String, TaskOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for rolling log files, console only when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    /// Write file logs as JSON lines
    #[serde(default = "default_true")]
    pub json: bool,
    /// Number of log files to keep
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwarmConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub ring: RingConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

// Default implementations
impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            aliases: Vec::new(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            request_timeout_ms: default_request_timeout(),
            max_processing_time_ms: default_request_timeout(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
            jitter: true,
        }
    }
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            service_account_path: default_service_account_path(),
            api_host: default_api_host(),
            api_port: default_api_port(),
            selector: None,
            app_name: None,
            namespace: None,
            token: None,
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            refresh_interval_ms: default_refresh_interval(),
            retry: RetryConfig::default(),
            kubernetes: KubernetesConfig::default(),
        }
    }
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
        }
    }
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_task_timeout(),
            serialized: true,
            single_trigger: SingleTrigger::Off,
            max_queue_length: default_max_queue_length(),
            overrides: BTreeMap::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
            json: true,
            max_files: default_max_files(),
        }
    }
}

// Default value functions
fn default_address() -> String {
    std::env::var("POD_IP")
        .ok()
        .filter(|ip| !ip.is_empty())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}
fn default_bind_addr() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 45892 }
fn default_request_timeout() -> u64 { 300_000 }
fn default_initial_delay() -> u64 { 1_000 }
fn default_max_delay() -> u64 { 30_000 }
fn default_multiplier() -> f64 { 2.0 }
fn default_true() -> bool { true }
fn default_service_account_path() -> String { "/var/run/secrets/kubernetes.io/serviceaccount".to_string() }
fn default_api_host() -> String { "kubernetes.default.svc.cluster.local".to_string() }
fn default_api_port() -> u16 { 443 }
fn default_refresh_interval() -> u64 { 10_000 }
fn default_replicas() -> u32 { crate::cluster::DEFAULT_REPLICAS }
fn default_task_timeout() -> u64 { 30_000 }
fn default_max_queue_length() -> usize { 20 }
fn default_log_level() -> String { "info".to_string() }
fn default_max_files() -> usize { 7 }

impl NodeConfig {
    pub fn identity(&self) -> LocalIdentity {
        LocalIdentity::new(self.address.as_str()).with_aliases(self.aliases.iter().map(String::as_str))
    }
}

impl TransportConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn max_processing_time(&self) -> Duration {
        Duration::from_millis(self.max_processing_time_ms)
    }
}

impl KubernetesConfig {
    pub fn effective_selector(&self) -> Option<String> {
        self.selector
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| self.app_name.as_ref().map(|app| format!("app={}", app)))
    }
}

impl TasksConfig {
    pub fn defaults(&self) -> TaskPolicy {
        TaskPolicy {
            timeout: Duration::from_millis(self.timeout_ms),
            serialized: self.serialized,
            single_trigger: self.single_trigger,
            max_queue_length: self.max_queue_length,
        }
    }

    pub fn override_for(&self, name: &str) -> TaskOptions {
        self.overrides.get(name).cloned().unwrap_or_default()
    }
}

/// OpenShift build names end in `-<build number>`; the app is what precedes it.
fn openshift_app_name(build: &str) -> Option<String> {
    let (app, number) = build.rsplit_once('-')?;
    if app.is_empty() || number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(app.to_string())
}

fn parse_port(var: &str, value: &str) -> Result<u16, SwarmError> {
    value
        .trim()
        .parse()
        .map_err(|_| SwarmError::config(format!("{} is not a valid port: {:?}", var, value)))
}

impl SwarmConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self, SwarmError> {
        if !path.exists() {
            debug!("Configuration file not found at {:?}, creating default", path);
            let config = SwarmConfig::default();
            config.save(path)?;
            return Ok(config);
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| SwarmError::config(format!("Failed to read config file: {}", e)))?;

        serde_yaml::from_str(&contents)
            .map_err(|e| SwarmError::config(format!("Failed to parse config file: {}", e)))
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), SwarmError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| SwarmError::config(format!("Failed to create config directory: {}", e)))?;
        }
        let contents = serde_yaml::to_string(&self)
            .map_err(|e| SwarmError::config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, contents)
            .map_err(|e| SwarmError::config(format!("Failed to write config file: {}", e)))?;
        Ok(())
    }

    /// Get configuration file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("swarm-kb")
            .join("config.yml")
    }

    /// Applies overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), SwarmError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from<F>(&mut self, var: F) -> Result<(), SwarmError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| var(key).filter(|v| !v.is_empty());

        if let Some(ip) = var("POD_IP") {
            self.node.address = ip;
        }
        if let Some(port) = var("SWARM_PORT") {
            self.transport.port = parse_port("SWARM_PORT", &port)?;
        }

        let k8s = &mut self.provider.kubernetes;
        if let Some(host) = var("KUBERNETES_SERVICE_HOST") {
            k8s.api_host = host;
        }
        if let Some(port) = var("KUBERNETES_SERVICE_PORT") {
            k8s.api_port = parse_port("KUBERNETES_SERVICE_PORT", &port)?;
        }
        if let Some(path) = var("KUBERNETES_FOLDER_PATH") {
            k8s.service_account_path = path;
        }
        if let Some(selector) = var("KUBERNETES_SELECTOR").or_else(|| var("kubernetes_selector")) {
            k8s.selector = Some(selector);
        }
        if k8s.app_name.is_none() {
            k8s.app_name = var("OPENSHIFT_BUILD_NAME").and_then(|b| openshift_app_name(&b));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SwarmError> {
        if self.node.address.trim().is_empty() {
            return Err(SwarmError::config("node.address must not be empty"));
        }
        if self.ring.replicas == 0 {
            return Err(SwarmError::config("ring.replicas must be at least 1"));
        }
        if self.transport.request_timeout_ms == 0 || self.transport.max_processing_time_ms == 0 {
            return Err(SwarmError::config("transport timeouts must be positive"));
        }
        if self.tasks.timeout_ms == 0 {
            return Err(SwarmError::config("tasks.timeout_ms must be positive"));
        }
        if self.provider.refresh_interval_ms == 0 {
            return Err(SwarmError::config("provider.refresh_interval_ms must be positive"));
        }
        let retry = &self.provider.retry;
        if retry.multiplier < 1.0 {
            return Err(SwarmError::config("provider.retry.multiplier must be at least 1.0"));
        }
        if retry.initial_delay_ms > retry.max_delay_ms {
            return Err(SwarmError::config(
                "provider.retry.initial_delay_ms must not exceed max_delay_ms",
            ));
        }
        for (name, options) in &self.tasks.overrides {
            if options.timeout_ms == Some(0) {
                return Err(SwarmError::config(format!(
                    "tasks.overrides.{}.timeout_ms must be positive",
                    name
                )));
            }
        }
        Ok(())
    }
}
