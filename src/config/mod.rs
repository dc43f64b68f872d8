use crate::error::{Result as WizResult, WizError};
use crate::protocol::{DEVICE_PORT, PUSH_PORT};
use crate::transport::RetrySchedule;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "wizlink.toml";
const ENV_PREFIX: &str = "WIZLINK_";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub devices: Vec<DeviceEntry>,
    pub transport: TransportConfig,
    pub push: PushConfig,
    pub dial: DialConfig,
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    pub device_port: u16,
    pub attempts: u32,
    pub first_interval_ms: u64,
    pub max_interval_ms: u64,
    pub timeout_ms: u64,
    pub commit_attempts: u32,
    pub commit_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            device_port: DEVICE_PORT,
            attempts: 6,
            first_interval_ms: 750,
            max_interval_ms: 3000,
            timeout_ms: 13_000,
            commit_attempts: 3,
            commit_timeout_ms: 5000,
        }
    }
}

impl TransportConfig {
    pub fn standard_schedule(&self) -> WizResult<RetrySchedule> {
        RetrySchedule::new(
            self.attempts,
            Duration::from_millis(self.first_interval_ms),
            Duration::from_millis(self.max_interval_ms),
            Duration::from_millis(self.timeout_ms),
        )
    }

    pub fn commit_schedule(&self) -> WizResult<RetrySchedule> {
        RetrySchedule::new(
            self.commit_attempts,
            Duration::from_millis(self.first_interval_ms),
            Duration::from_millis(self.max_interval_ms),
            Duration::from_millis(self.commit_timeout_ms),
        )
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PushConfig {
    pub listen_port: u16,
    pub device_port: u16,
    pub renewal_interval_ms: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            listen_port: PUSH_PORT,
            device_port: DEVICE_PORT,
            renewal_interval_ms: 20_000,
        }
    }
}

impl PushConfig {
    pub fn renewal_interval(&self) -> Duration {
        Duration::from_millis(self.renewal_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DialConfig {
    pub enabled: bool,
    pub listen_port: u16,
    pub debounce_window_ms: u64,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_port: DEVICE_PORT,
            debounce_window_ms: 400,
        }
    }
}

impl DialConfig {
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub broadcast_address: String,
    pub wait_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            broadcast_address: "255.255.255.255".to_string(),
            wait_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceEntry {
    pub ip: String,
    pub mac: String,
}

impl DeviceEntry {
    pub fn ip_addr(&self) -> WizResult<IpAddr> {
        self.ip
            .trim()
            .parse()
            .map_err(|_| WizError::Config(format!("device ip '{}' is not an address", self.ip)))
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            match toml::from_str::<Config>(&raw) {
                Ok(file_config) => config = file_config,
                Err(err) => {
                    tracing::warn!(path = %config_path.display(), error = %err, "ignoring unreadable config file")
                }
            }
        }

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(port) = env_parse(format!("{}DEVICE_PORT", ENV_PREFIX)) {
            self.transport.device_port = port;
            self.push.device_port = port;
        }
        if let Some(attempts) = env_parse(format!("{}ATTEMPTS", ENV_PREFIX)) {
            self.transport.attempts = attempts;
        }
        if let Some(ms) = env_parse(format!("{}TIMEOUT_MS", ENV_PREFIX)) {
            self.transport.timeout_ms = ms;
        }

        if let Some(port) = env_parse(format!("{}PUSH_PORT", ENV_PREFIX)) {
            self.push.listen_port = port;
        }
        if let Some(ms) = env_parse(format!("{}RENEWAL_INTERVAL_MS", ENV_PREFIX)) {
            self.push.renewal_interval_ms = ms;
        }

        if let Ok(val) = env::var(format!("{}DIAL_ENABLED", ENV_PREFIX)) {
            self.dial.enabled = val.parse().unwrap_or(true);
        }
        if let Some(port) = env_parse(format!("{}DIAL_PORT", ENV_PREFIX)) {
            self.dial.listen_port = port;
        }
        if let Some(ms) = env_parse(format!("{}DEBOUNCE_MS", ENV_PREFIX)) {
            self.dial.debounce_window_ms = ms;
        }

        if let Ok(val) = env::var(format!("{}BROADCAST", ENV_PREFIX)) {
            self.discovery.broadcast_address = val;
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.transport.device_port == 0 {
            return Err("transport.device_port must be non-zero".into());
        }
        self.transport.standard_schedule()?;
        self.transport.commit_schedule()?;

        if self.push.listen_port == 0 || self.push.device_port == 0 {
            return Err("push ports must be non-zero".into());
        }
        if self.push.renewal_interval_ms < 1000 {
            return Err("push.renewal_interval_ms must be >= 1000".into());
        }
        if self.dial.enabled && self.dial.listen_port == 0 {
            return Err("dial.listen_port must be non-zero".into());
        }
        if self.discovery.broadcast_address.trim().parse::<IpAddr>().is_err() {
            return Err("discovery.broadcast_address must be an IP address".into());
        }
        for device in &self.devices {
            device.ip_addr()?;
            if device.mac.trim().is_empty() {
                return Err(format!("device {} needs a mac", device.ip).into());
            }
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err(format!("{CONFIG_FILE} already exists").into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn env_parse<T: std::str::FromStr>(key: String) -> Option<T> {
    env::var(key).ok().and_then(|val| val.trim().parse().ok())
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    PathBuf::from(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = Config::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.push.listen_port, 38900);
        assert_eq!(parsed.transport.device_port, 38899);
    }

    #[test]
    fn default_schedules_match_transport_defaults() {
        let cfg = TransportConfig::default();
        assert_eq!(cfg.standard_schedule().unwrap(), RetrySchedule::standard());
        assert_eq!(cfg.commit_schedule().unwrap(), RetrySchedule::commit());
    }

    #[test]
    fn validate_rejects_timeout_before_last_send() {
        let mut cfg = Config::default();
        cfg.transport.timeout_ms = 11_000;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.transport.commit_timeout_ms = 2000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_ports_and_fast_renewal() {
        let mut cfg = Config::default();
        cfg.push.listen_port = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.push.renewal_interval_ms = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_checks_device_entries() {
        let mut cfg = Config::default();
        cfg.devices.push(DeviceEntry {
            ip: "not-an-ip".to_string(),
            mac: "a8bb50aabbcc".to_string(),
        });
        assert!(cfg.validate().is_err());

        cfg.devices[0].ip = "192.168.1.40".to_string();
        assert!(cfg.validate().is_ok());

        cfg.devices[0].mac = " ".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn devices_parse_from_toml() {
        let cfg: Config = toml::from_str(
            r#"
            [push]
            renewal_interval_ms = 5000

            [[devices]]
            ip = "192.168.1.40"
            mac = "a8bb50aabbcc"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.push.renewal_interval_ms, 5000);
        assert_eq!(cfg.push.listen_port, 38900);
        assert_eq!(cfg.devices.len(), 1);
        cfg.validate().unwrap();
    }
}
