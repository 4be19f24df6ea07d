//! Configuration management for vantage
//!
//! Handles loading and saving the probing and comparison settings from a
//! YAML file. Every field has a default so a partial file is enough.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use tokio::fs;
use tracing::warn;

use crate::constants::{BATCH_SIZE, BROWSER_USER_AGENT, HTTP_PORT, INVALID_METHODS, MAX_HOPS, TRACE_BASE_PORT};
use crate::probe::IpVersion;
use crate::sink::ConfigValues;

/// Probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Address family to probe over
    #[serde(default)]
    pub ip_version: IpVersion,
    /// Name servers to query; empty uses the system resolver configuration
    #[serde(default)]
    pub nameservers: Vec<IpAddr>,
    /// Port of the configured name servers
    #[serde(default = "default_nameserver_port")]
    pub nameserver_port: u16,
    /// DNS query timeout in milliseconds
    #[serde(default = "default_dns_timeout_ms")]
    pub dns_timeout_ms: u64,
    /// DNS query attempts per lookup
    #[serde(default = "default_dns_attempts")]
    pub dns_attempts: usize,
    /// Port for the TCP handshake probe
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    /// TCP connect timeout in milliseconds
    #[serde(default = "default_tcp_timeout_ms")]
    pub tcp_timeout_ms: u64,
    /// ICMP echo timeout in milliseconds
    #[serde(default = "default_icmp_timeout_ms")]
    pub icmp_timeout_ms: u64,
    /// Per-hop traceroute timeout in milliseconds
    #[serde(default = "default_trace_hop_timeout_ms")]
    pub trace_hop_timeout_ms: u64,
    /// Highest TTL probed by traceroute
    #[serde(default = "default_max_hops")]
    pub max_hops: u8,
    /// UDP destination port for traceroute probes
    #[serde(default = "default_trace_port")]
    pub trace_port: u16,
    /// HTTP request timeout in milliseconds
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
    /// TLS handshake timeout in milliseconds
    #[serde(default = "default_tls_timeout_ms")]
    pub tls_timeout_ms: u64,
    /// User-Agent sent with HTTP requests
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Invented request methods for the invalid request line test
    #[serde(default = "default_invalid_methods")]
    pub invalid_methods: Vec<String>,
    /// Label prefix for names that should not exist
    #[serde(default = "default_nx_label")]
    pub nx_label: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            ip_version: IpVersion::default(),
            nameservers: Vec::new(),
            nameserver_port: default_nameserver_port(),
            dns_timeout_ms: default_dns_timeout_ms(),
            dns_attempts: default_dns_attempts(),
            tcp_port: default_tcp_port(),
            tcp_timeout_ms: default_tcp_timeout_ms(),
            icmp_timeout_ms: default_icmp_timeout_ms(),
            trace_hop_timeout_ms: default_trace_hop_timeout_ms(),
            max_hops: default_max_hops(),
            trace_port: default_trace_port(),
            http_timeout_ms: default_http_timeout_ms(),
            tls_timeout_ms: default_tls_timeout_ms(),
            user_agent: default_user_agent(),
            invalid_methods: default_invalid_methods(),
            nx_label: default_nx_label(),
        }
    }
}

/// Batch orchestration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Targets per result file
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Targets probed concurrently
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Minimum delay between targets in milliseconds
    #[serde(default = "default_pacing_min_ms")]
    pub pacing_min_ms: u64,
    /// Maximum delay between targets in milliseconds
    #[serde(default = "default_pacing_max_ms")]
    pub pacing_max_ms: u64,
    /// Optional cap on targets started per minute across all workers
    #[serde(default)]
    pub targets_per_minute: Option<u32>,
    /// Probe attempts per rate-limited target
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base of the exponential backoff in seconds
    #[serde(default = "default_backoff_base")]
    pub backoff_base: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            workers: default_workers(),
            pacing_min_ms: default_pacing_min_ms(),
            pacing_max_ms: default_pacing_max_ms(),
            targets_per_minute: None,
            max_attempts: default_max_attempts(),
            backoff_base: default_backoff_base(),
        }
    }
}

/// Result output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory result files are written to
    #[serde(default = "default_output_directory")]
    pub directory: String,
    /// Vantage point label embedded in result file names
    #[serde(default = "default_label")]
    pub label: String,
    /// Key in `values` holding the remote base path
    #[serde(default)]
    pub remote_base_key: Option<String>,
    /// Directory tree finished files are copied into
    #[serde(default)]
    pub remote_directory: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_directory(),
            label: default_label(),
            remote_base_key: None,
            remote_directory: None,
        }
    }
}

/// Cross-vantage comparison configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareConfig {
    /// Fields dropped before diffing
    #[serde(default = "default_volatile_fields")]
    pub volatile_fields: Vec<String>,
    /// Header names ignored when diffing headers (case-insensitive)
    #[serde(default = "default_ignored_headers")]
    pub ignored_headers: Vec<String>,
    /// Classification rules file; the built-in rules apply when unset
    #[serde(default)]
    pub rules_path: Option<String>,
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            volatile_fields: default_volatile_fields(),
            ignored_headers: default_ignored_headers(),
            rules_path: None,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Path to logging theme configuration file
    #[serde(default = "default_log_theme_path")]
    pub log_theme_path: String,
    /// Whether to log to file
    #[serde(default = "default_log_to_file")]
    pub log_to_file: bool,
    /// Path to log file (used when log_to_file is true)
    #[serde(default = "default_log_file_path")]
    pub log_file_path: Option<String>,
    /// Probe configuration
    #[serde(default)]
    pub probe: ProbeConfig,
    /// Orchestration configuration
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Output configuration
    #[serde(default)]
    pub output: OutputConfig,
    /// Comparison configuration
    #[serde(default)]
    pub compare: CompareConfig,
    /// Named values such as remote paths or credentials
    #[serde(default)]
    pub values: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_theme_path: default_log_theme_path(),
            log_to_file: default_log_to_file(),
            log_file_path: default_log_file_path(),
            probe: ProbeConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            output: OutputConfig::default(),
            compare: CompareConfig::default(),
            values: HashMap::new(),
        }
    }
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_log_theme_path() -> String {
    "config/logging_theme.yml".to_string()
}

fn default_log_to_file() -> bool {
    false
}

fn default_log_file_path() -> Option<String> {
    None
}

fn default_nameserver_port() -> u16 {
    53
}

fn default_dns_timeout_ms() -> u64 {
    5000
}

fn default_dns_attempts() -> usize {
    2
}

fn default_tcp_port() -> u16 {
    HTTP_PORT
}

fn default_tcp_timeout_ms() -> u64 {
    5000
}

fn default_icmp_timeout_ms() -> u64 {
    5000
}

fn default_trace_hop_timeout_ms() -> u64 {
    1000
}

fn default_max_hops() -> u8 {
    MAX_HOPS
}

fn default_trace_port() -> u16 {
    TRACE_BASE_PORT
}

fn default_http_timeout_ms() -> u64 {
    10000
}

fn default_tls_timeout_ms() -> u64 {
    5000
}

fn default_user_agent() -> String {
    BROWSER_USER_AGENT.to_string()
}

fn default_invalid_methods() -> Vec<String> {
    INVALID_METHODS.iter().map(|m| m.to_string()).collect()
}

fn default_nx_label() -> String {
    "vantage-nx".to_string()
}

fn default_batch_size() -> usize {
    BATCH_SIZE
}

fn default_workers() -> usize {
    1
}

fn default_pacing_min_ms() -> u64 {
    25000
}

fn default_pacing_max_ms() -> u64 {
    70000
}

fn default_max_attempts() -> u32 {
    6
}

fn default_backoff_base() -> u64 {
    5
}

fn default_output_directory() -> String {
    "results".to_string()
}

fn default_label() -> String {
    "local".to_string()
}

fn default_volatile_fields() -> Vec<String> {
    vec!["Time".to_string(), "Timestamp".to_string(), "HTML Content".to_string()]
}

fn default_ignored_headers() -> Vec<String> {
    vec!["Date".to_string(), "Server".to_string(), "Expires".to_string()]
}

impl Config {
    /// Load configuration from a YAML file
    pub async fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        match fs::read_to_string(&path).await {
            Ok(contents) => {
                let config: Config = serde_yaml::from_str(&contents)
                    .map_err(|e| anyhow::anyhow!("Failed to parse YAML configuration: {}", e))?;
                config.validate()?;
                Ok(config)
            }
            Err(e) => {
                if e.kind() == std::io::ErrorKind::NotFound {
                    warn!(
                        "Configuration file not found at '{}', using default configuration",
                        path.as_ref().display()
                    );
                    let config = Config::default();
                    config.validate()?;
                    Ok(config)
                } else {
                    Err(anyhow::anyhow!(
                        "Failed to read configuration file '{}': {}",
                        path.as_ref().display(),
                        e
                    ))
                }
            }
        }
    }

    /// Save configuration to a YAML file
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml).await?;
        Ok(())
    }

    /// Validate configuration fields
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.log_level.to_uppercase().as_str()) {
            return Err(anyhow::anyhow!("Invalid log level: {}", self.log_level));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if path.trim().is_empty() {
                    return Err(anyhow::anyhow!("Log file path cannot be empty when log_to_file is true"));
                }
            }
        }

        // Probes
        let probe = &self.probe;
        for (name, value) in [
            ("DNS", probe.dns_timeout_ms),
            ("TCP", probe.tcp_timeout_ms),
            ("ICMP", probe.icmp_timeout_ms),
            ("Trace hop", probe.trace_hop_timeout_ms),
            ("HTTP", probe.http_timeout_ms),
            ("TLS", probe.tls_timeout_ms),
        ] {
            if value == 0 {
                return Err(anyhow::anyhow!("{} timeout must be greater than 0", name));
            }
        }
        if probe.dns_attempts == 0 {
            return Err(anyhow::anyhow!("DNS attempts must be greater than 0"));
        }
        if probe.nameserver_port == 0 || probe.tcp_port == 0 || probe.trace_port == 0 {
            return Err(anyhow::anyhow!("Probe ports must be between 1 and 65535"));
        }
        if probe.max_hops == 0 {
            return Err(anyhow::anyhow!("Max hops must be greater than 0"));
        }
        if probe.nx_label.trim().is_empty() || probe.nx_label.contains('.') {
            return Err(anyhow::anyhow!("Invalid NXDOMAIN label: '{}'", probe.nx_label));
        }
        if let Some(method) = probe.invalid_methods.iter().find(|m| m.is_empty() || !m.chars().all(|c| c.is_ascii_alphabetic())) {
            return Err(anyhow::anyhow!("Invalid request method: '{}'", method));
        }

        // Orchestration
        let orchestrator = &self.orchestrator;
        if orchestrator.batch_size == 0 {
            return Err(anyhow::anyhow!("Batch size must be greater than 0"));
        }
        if orchestrator.workers == 0 {
            return Err(anyhow::anyhow!("Workers must be greater than 0"));
        }
        if orchestrator.pacing_min_ms > orchestrator.pacing_max_ms {
            return Err(anyhow::anyhow!(
                "Pacing minimum ({} ms) exceeds maximum ({} ms)",
                orchestrator.pacing_min_ms,
                orchestrator.pacing_max_ms
            ));
        }
        if orchestrator.targets_per_minute == Some(0) {
            return Err(anyhow::anyhow!("Targets per minute must be greater than 0 when set"));
        }
        if orchestrator.max_attempts == 0 {
            return Err(anyhow::anyhow!("Max attempts must be greater than 0"));
        }
        if orchestrator.backoff_base == 0 {
            return Err(anyhow::anyhow!("Backoff base must be greater than 0"));
        }

        // Output
        if self.output.directory.trim().is_empty() {
            return Err(anyhow::anyhow!("Output directory cannot be empty"));
        }
        if self.output.label.is_empty() || !self.output.label.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(anyhow::anyhow!(
                "Output label must be non-empty and alphanumeric: '{}'",
                self.output.label
            ));
        }
        if let Some(key) = &self.output.remote_base_key {
            if !self.values.contains_key(key) {
                warn!("Remote base key '{}' has no value, files are sent under their bare name", key);
            }
        }

        Ok(())
    }
}

impl ConfigValues for Config {
    fn value(&self, key: &str) -> Option<String> {
        self.values.value(key)
    }
}
