//! Proxy configuration
//!
//! Loaded from a single YAML file. Every section has defaults so a minimal
//! file only needs credentials and hosts. Durations are written as
//! `humantime` strings (`"60s"`, `"5m"`) or as plain integer seconds.

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::poll::OverlapPolicy;
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub keystone: KeystoneConfig,
    #[serde(default)]
    pub compute: ComputeConfig,
    #[serde(default)]
    pub ceilometer: CeilometerConfig,
    #[serde(default)]
    pub zabbix: ZabbixConfig,
    #[serde(default, rename = "zcp")]
    pub poll: PollConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize)]
pub struct KeystoneConfig {
    #[serde(default = "default_scheme")]
    pub scheme: String,
    pub host: String,
    #[serde(default = "default_keystone_public_port")]
    pub public_port: u16,
    #[serde(default = "default_keystone_admin_port")]
    pub admin_port: u16,
    #[serde(default = "default_admin_tenant")]
    pub admin_tenant: String,
    pub admin_user: String,
    pub admin_password: SecretString,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComputeConfig {
    /// Nova API host. Falls back to the Keystone host.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_compute_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CeilometerConfig {
    #[serde(default = "default_ceilometer_host")]
    pub api_host: String,
    #[serde(default = "default_ceilometer_port")]
    pub api_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZabbixConfig {
    #[serde(default = "default_zabbix_host")]
    pub host: String,
    #[serde(default = "default_zabbix_port")]
    pub port: u16,
    /// Identity this bridge reports as (the Zabbix proxy name).
    #[serde(default = "default_proxy_name")]
    pub proxy_name: String,
    #[serde(default = "default_connect_timeout", deserialize_with = "duration")]
    pub connect_timeout: Duration,
    /// Bound on writing one batch; a peer that stops reading fails the send.
    #[serde(default = "default_write_timeout", deserialize_with = "duration")]
    pub write_timeout: Duration,
    #[serde(default = "default_read_timeout", deserialize_with = "duration")]
    pub read_timeout: Duration,
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapMode {
    #[default]
    Skip,
    Queue,
    Concurrent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_polling_interval", deserialize_with = "duration")]
    pub polling_interval: Duration,
    /// Hosts with this name are placeholders and never polled.
    #[serde(default = "default_template_name")]
    pub template_name: String,
    #[serde(default)]
    pub overlap: OverlapMode,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_renewal_threshold", deserialize_with = "duration")]
    pub token_renewal_threshold: Duration,
    #[serde(default = "default_max_auth_retries")]
    pub max_auth_retries: u32,
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_request_timeout", deserialize_with = "duration")]
    pub request_timeout: Duration,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_base_delay", deserialize_with = "duration")]
    pub retry_base_delay: Duration,
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_keystone_public_port() -> u16 {
    5000
}

fn default_keystone_admin_port() -> u16 {
    35357
}

fn default_admin_tenant() -> String {
    "admin".to_string()
}

fn default_compute_port() -> u16 {
    8774
}

fn default_ceilometer_host() -> String {
    "localhost".to_string()
}

fn default_ceilometer_port() -> u16 {
    8777
}

fn default_zabbix_host() -> String {
    "localhost".to_string()
}

fn default_zabbix_port() -> u16 {
    10051
}

fn default_proxy_name() -> String {
    "zcp".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_write_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_send_attempts() -> u32 {
    3
}

fn default_polling_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_template_name() -> String {
    "Template ZCP".to_string()
}

fn default_max_in_flight() -> usize {
    2
}

fn default_renewal_threshold() -> Duration {
    Duration::from_secs(300)
}

fn default_max_auth_retries() -> u32 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> Duration {
    Duration::from_millis(200)
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_compute_port(),
        }
    }
}

impl Default for CeilometerConfig {
    fn default() -> Self {
        Self {
            api_host: default_ceilometer_host(),
            api_port: default_ceilometer_port(),
        }
    }
}

impl Default for ZabbixConfig {
    fn default() -> Self {
        Self {
            host: default_zabbix_host(),
            port: default_zabbix_port(),
            proxy_name: default_proxy_name(),
            connect_timeout: default_connect_timeout(),
            write_timeout: default_write_timeout(),
            read_timeout: default_read_timeout(),
            max_send_attempts: default_max_send_attempts(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            polling_interval: default_polling_interval(),
            template_name: default_template_name(),
            overlap: OverlapMode::default(),
            max_in_flight: default_max_in_flight(),
            token_renewal_threshold: default_renewal_threshold(),
            max_auth_retries: default_max_auth_retries(),
            log_file: None,
            log_level: default_log_level(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay: default_retry_base_delay(),
        }
    }
}

impl PollConfig {
    pub fn overlap_policy(&self) -> OverlapPolicy {
        match self.overlap {
            OverlapMode::Skip => OverlapPolicy::Skip,
            OverlapMode::Queue => OverlapPolicy::Queue,
            OverlapMode::Concurrent => OverlapPolicy::Concurrent {
                max_in_flight: self.max_in_flight,
            },
        }
    }
}

impl Config {
    /// Read and validate a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let config = Self::from_yaml(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(raw)
            .map_err(|e| Error::Config(format!("invalid YAML config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.keystone.host.trim().is_empty() {
            return Err(Error::Config("keystone.host cannot be empty".into()));
        }
        if self.keystone.admin_user.trim().is_empty() {
            return Err(Error::Config("keystone.admin_user cannot be empty".into()));
        }
        if self.zabbix.proxy_name.trim().is_empty() {
            return Err(Error::Config("zabbix.proxy_name cannot be empty".into()));
        }
        if self.zabbix.max_send_attempts == 0 {
            return Err(Error::Config("zabbix.max_send_attempts must be >= 1".into()));
        }
        if self.poll.polling_interval.is_zero() {
            return Err(Error::Config("zcp.polling_interval must be > 0".into()));
        }
        if self.poll.overlap == OverlapMode::Concurrent && self.poll.max_in_flight == 0 {
            return Err(Error::Config(
                "zcp.max_in_flight must be >= 1 with overlap=concurrent".into(),
            ));
        }
        if self.poll.max_in_flight > Semaphore::MAX_PERMITS {
            return Err(Error::Config(format!(
                "zcp.max_in_flight must be <= {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.http.retry_max_attempts == 0 {
            return Err(Error::Config("http.retry_max_attempts must be >= 1".into()));
        }
        Ok(())
    }

    pub fn keystone_public_base(&self) -> String {
        format!(
            "{}://{}:{}",
            self.keystone.scheme, self.keystone.host, self.keystone.public_port
        )
    }

    pub fn keystone_admin_base(&self) -> String {
        format!(
            "{}://{}:{}",
            self.keystone.scheme, self.keystone.host, self.keystone.admin_port
        )
    }

    pub fn compute_base(&self) -> String {
        let host = self
            .compute
            .host
            .as_deref()
            .unwrap_or(self.keystone.host.as_str());
        format!("{}://{}:{}", self.keystone.scheme, host, self.compute.port)
    }

    pub fn telemetry_base(&self) -> String {
        format!(
            "{}://{}:{}",
            self.keystone.scheme, self.ceilometer.api_host, self.ceilometer.api_port
        )
    }

    pub fn zabbix_addr(&self) -> String {
        format!("{}:{}", self.zabbix.host, self.zabbix.port)
    }
}

/// Accept `"90s"`-style strings or bare integer seconds.
fn duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => humantime::parse_duration(text.trim()).map_err(serde::de::Error::custom),
    }
}
