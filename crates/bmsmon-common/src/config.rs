//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared configuration and identity primitives."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_battery_name() -> String {
    "Battery 1".to_owned()
}

fn default_battery_ip() -> String {
    "192.168.130.139".to_owned()
}

fn default_battery_port() -> u16 {
    4196
}

fn default_device_id() -> u8 {
    1
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_true() -> bool {
    true
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("logs")
}

const MASKED_SECRET: &str = "***";

/// Convert a display name into the stable identifier used for topics and ids.
///
/// Runs of characters outside `[a-z0-9]` collapse to a single `_` and
/// leading/trailing separators are stripped.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_separator = false;
    for ch in name.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            if pending_separator && !slug.is_empty() {
                slug.push('_');
            }
            pending_separator = false;
            slug.push(ch);
        } else {
            pending_separator = true;
        }
    }
    slug
}

/// Register layout spoken by a battery management unit.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    #[serde(alias = "eg4")]
    Standard,
    #[serde(alias = "pace")]
    Alternate,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Standard => "standard",
            Protocol::Alternate => "alternate",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "standard" | "eg4" => Ok(Protocol::Standard),
            "alternate" | "pace" => Ok(Protocol::Alternate),
            other => Err(format!("unknown protocol: {}", other)),
        }
    }
}

/// How a session reaches its registers.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    /// In-process register bank, used for bench setups without hardware.
    Simulated,
}

/// Connection and identity settings for a single battery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatteryConfig {
    #[serde(default = "default_battery_name")]
    pub name: String,
    #[serde(default = "default_battery_ip")]
    pub ip: String,
    #[serde(default = "default_battery_port")]
    pub port: u16,
    #[serde(default = "default_device_id")]
    pub device_id: u8,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub transport: TransportKind,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            name: default_battery_name(),
            ip: default_battery_ip(),
            port: default_battery_port(),
            device_id: default_device_id(),
            protocol: Protocol::default(),
            transport: TransportKind::default(),
        }
    }
}

impl BatteryConfig {
    pub fn slug(&self) -> String {
        slugify(&self.name)
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("battery name must not be empty");
        }
        if self.slug().is_empty() {
            bail!(
                "battery name '{}' must contain at least one letter or digit",
                self.name
            );
        }
        if self.ip.trim().is_empty() {
            bail!("battery '{}' has an empty ip address", self.name);
        }
        if self.port == 0 {
            bail!("battery '{}' has an invalid port 0", self.name);
        }
        Ok(())
    }
}

/// Limits driving the alarm evaluation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AlarmThresholds {
    pub pack_overvoltage: f64,
    pub pack_undervoltage: f64,
    pub cell_overvoltage: f64,
    pub cell_undervoltage: f64,
    pub cell_imbalance_mv: f64,
    pub high_temp: f64,
    pub low_temp: f64,
    pub critical_soc: f64,
    pub overcurrent: f64,
}

impl Default for AlarmThresholds {
    fn default() -> Self {
        Self {
            pack_overvoltage: 57.6,
            pack_undervoltage: 44.8,
            cell_overvoltage: 3.65,
            cell_undervoltage: 2.5,
            cell_imbalance_mv: 50.0,
            high_temp: 55.0,
            low_temp: -20.0,
            critical_soc: 10.0,
            overcurrent: 200.0,
        }
    }
}

impl AlarmThresholds {
    pub fn validate(&self) -> Result<()> {
        let values = [
            ("pack_overvoltage", self.pack_overvoltage),
            ("pack_undervoltage", self.pack_undervoltage),
            ("cell_overvoltage", self.cell_overvoltage),
            ("cell_undervoltage", self.cell_undervoltage),
            ("cell_imbalance_mv", self.cell_imbalance_mv),
            ("high_temp", self.high_temp),
            ("low_temp", self.low_temp),
            ("critical_soc", self.critical_soc),
            ("overcurrent", self.overcurrent),
        ];
        for (name, value) in values {
            if !value.is_finite() {
                bail!("threshold {} must be a finite number", name);
            }
        }
        if self.pack_undervoltage >= self.pack_overvoltage {
            bail!("pack_undervoltage must be below pack_overvoltage");
        }
        if self.cell_undervoltage >= self.cell_overvoltage {
            bail!("cell_undervoltage must be below cell_overvoltage");
        }
        if self.low_temp >= self.high_temp {
            bail!("low_temp must be below high_temp");
        }
        if self.cell_imbalance_mv < 0.0 {
            bail!("cell_imbalance_mv must not be negative");
        }
        if self.overcurrent <= 0.0 {
            bail!("overcurrent must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub broker: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub base_topic: String,
    /// Falls back to `bmsmon_<unix-seconds>` when empty.
    pub client_id: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            broker: "localhost".to_owned(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            base_topic: "homeassistant".to_owned(),
            client_id: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_owned(),
            port: 5000,
        }
    }
}

impl WebConfig {
    pub fn listen(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid web listen address {}:{}", self.host, self.port))
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub interval: Duration,
    #[serde(default = "default_true")]
    pub ui_enabled: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_read_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub read_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: default_poll_interval(),
            ui_enabled: true,
            debug: false,
            read_timeout: default_read_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default)]
    pub file_prefix: Option<String>,
    #[serde(default)]
    pub file_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            directory: default_logging_directory(),
            file_prefix: None,
            file_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Primary configuration object for the monitor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(from = "RawAppConfig")]
pub struct AppConfig {
    pub batteries: Vec<BatteryConfig>,
    pub mqtt: MqttConfig,
    pub web: WebConfig,
    pub monitor: MonitorConfig,
    pub thresholds: AlarmThresholds,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// On-disk shape, accepting the legacy single `battery` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawAppConfig {
    batteries: Option<Vec<BatteryConfig>>,
    battery: Option<BatteryConfig>,
    mqtt: MqttConfig,
    web: WebConfig,
    monitor: MonitorConfig,
    thresholds: AlarmThresholds,
    logging: LoggingConfig,
    metrics: MetricsConfig,
}

impl From<RawAppConfig> for AppConfig {
    fn from(raw: RawAppConfig) -> Self {
        let batteries = match (raw.batteries, raw.battery) {
            (Some(list), _) => list,
            (None, Some(single)) => vec![single],
            (None, None) => vec![BatteryConfig::default()],
        };
        Self {
            batteries,
            mqtt: raw.mqtt,
            web: raw.web,
            monitor: raw.monitor,
            thresholds: raw.thresholds,
            logging: raw.logging,
            metrics: raw.metrics,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        RawAppConfig::default().into()
    }
}

/// Configuration together with the file it was read from, if any.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: Option<PathBuf>,
}

/// Values layered on top of the file configuration (environment and CLI).
///
/// Battery fields apply to the first configured battery.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub battery_name: Option<String>,
    pub battery_ip: Option<String>,
    pub battery_port: Option<u16>,
    pub device_id: Option<u8>,
    pub protocol: Option<Protocol>,
    pub mqtt_broker: Option<String>,
    pub mqtt_port: Option<u16>,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_base_topic: Option<String>,
    pub poll_interval_secs: Option<u64>,
    pub no_ui: bool,
    pub debug: bool,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "BMSMON_CONFIG";
    pub const DEFAULT_CANDIDATES: [&'static str; 2] = ["config.yaml", "/etc/bmsmon/config.yaml"];

    /// Resolve the configuration file and load it.
    ///
    /// An explicit path (or `BMSMON_CONFIG`) must exist; otherwise the default
    /// candidates are probed and built-in defaults are used when none exists.
    pub fn resolve(explicit: Option<&Path>) -> Result<LoadedAppConfig> {
        let env_path = std::env::var(Self::ENV_CONFIG_PATH)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);
        if let Some(path) = explicit.map(Path::to_path_buf).or(env_path) {
            if !path.exists() {
                bail!("config file not found: {}", path.display());
            }
            let config = Self::from_path(&path)?;
            return Ok(LoadedAppConfig {
                config,
                source: Some(path),
            });
        }

        for candidate in Self::DEFAULT_CANDIDATES {
            let path = PathBuf::from(candidate);
            if path.exists() {
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        debug!("no configuration file found; using built-in defaults");
        Ok(LoadedAppConfig {
            config: Self::default(),
            source: None,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        serde_yaml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if self.batteries.is_empty() {
            self.batteries.push(BatteryConfig::default());
        }
        let battery = &mut self.batteries[0];
        if let Some(name) = &overrides.battery_name {
            battery.name = name.clone();
        }
        if let Some(ip) = &overrides.battery_ip {
            battery.ip = ip.clone();
        }
        if let Some(port) = overrides.battery_port {
            battery.port = port;
        }
        if let Some(device_id) = overrides.device_id {
            battery.device_id = device_id;
        }
        if let Some(protocol) = overrides.protocol {
            battery.protocol = protocol;
        }

        if let Some(broker) = &overrides.mqtt_broker {
            self.mqtt.broker = broker.clone();
        }
        if let Some(port) = overrides.mqtt_port {
            self.mqtt.port = port;
        }
        if let Some(username) = &overrides.mqtt_username {
            self.mqtt.username = username.clone();
        }
        if let Some(password) = &overrides.mqtt_password {
            self.mqtt.password = password.clone();
        }
        if let Some(topic) = &overrides.mqtt_base_topic {
            self.mqtt.base_topic = topic.clone();
        }

        if let Some(secs) = overrides.poll_interval_secs {
            self.monitor.interval = Duration::from_secs(secs);
        }
        if overrides.no_ui {
            self.monitor.ui_enabled = false;
        }
        if overrides.debug {
            self.monitor.debug = true;
        }
    }

    /// Validate structural invariants. Polling must not start when this fails.
    pub fn validate(&self) -> Result<()> {
        if self.batteries.is_empty() {
            return Err(anyhow!("configuration must contain at least one battery"));
        }
        let mut seen = HashSet::new();
        for battery in &self.batteries {
            battery.validate()?;
            let slug = battery.slug();
            if !seen.insert(slug.clone()) {
                bail!(
                    "battery '{}' maps to duplicate identifier '{}'",
                    battery.name,
                    slug
                );
            }
        }
        if self.monitor.interval.is_zero() {
            bail!("monitor interval must be at least one second");
        }
        if self.monitor.read_timeout.is_zero() {
            bail!("monitor read_timeout must be at least one second");
        }
        self.thresholds
            .validate()
            .context("invalid alarm thresholds")?;
        if self.mqtt.enabled {
            if self.mqtt.broker.trim().is_empty() {
                bail!("mqtt broker must not be empty when mqtt is enabled");
            }
            if self.mqtt.base_topic.trim().is_empty() {
                bail!("mqtt base_topic must not be empty when mqtt is enabled");
            }
        }
        if self.web.enabled {
            self.web.listen()?;
        }
        Ok(())
    }

    /// Copy of the configuration that is safe to print.
    pub fn redacted(&self) -> AppConfig {
        let mut copy = self.clone();
        if !copy.mqtt.password.is_empty() {
            copy.mqtt.password = MASKED_SECRET.to_owned();
        }
        copy
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("failed to serialise configuration")
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            serde_yaml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_single_battery_setup() {
        let config = AppConfig::default();
        assert_eq!(config.batteries.len(), 1);
        let battery = &config.batteries[0];
        assert_eq!(battery.ip, "192.168.130.139");
        assert_eq!(battery.port, 4196);
        assert_eq!(battery.device_id, 1);
        assert_eq!(battery.protocol, Protocol::Standard);
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.monitor.interval, Duration::from_secs(30));
        assert_eq!(config.monitor.read_timeout, Duration::from_secs(10));
        config.validate().unwrap();
    }

    #[test]
    fn parses_multi_battery_yaml() {
        let config: AppConfig = r#"
batteries:
  - name: "Rack A"
    ip: 10.0.0.10
    port: 502
    protocol: standard
  - name: "Rack B"
    ip: 10.0.0.11
    protocol: pace
mqtt:
  broker: mqtt.local
  username: test
monitor:
  interval: 60
"#
        .parse()
        .unwrap();

        assert_eq!(config.batteries.len(), 2);
        assert_eq!(config.batteries[0].slug(), "rack_a");
        assert_eq!(config.batteries[0].port, 502);
        assert_eq!(config.batteries[1].protocol, Protocol::Alternate);
        assert_eq!(config.batteries[1].port, 4196);
        assert_eq!(config.mqtt.broker, "mqtt.local");
        assert_eq!(config.mqtt.username, "test");
        assert_eq!(config.monitor.interval, Duration::from_secs(60));
    }

    #[test]
    fn legacy_single_battery_section_is_accepted() {
        let config: AppConfig = "battery:\n  ip: 10.0.0.100\n  port: 502\n".parse().unwrap();
        assert_eq!(config.batteries.len(), 1);
        assert_eq!(config.batteries[0].ip, "10.0.0.100");
        assert_eq!(config.batteries[0].port, 502);
    }

    #[test]
    fn unknown_protocol_tag_is_rejected() {
        let result = "batteries:\n  - name: x\n    protocol: canbus\n".parse::<AppConfig>();
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_identifiers_are_rejected() {
        let result = "batteries:\n  - name: Rack A\n  - name: rack-a\n".parse::<AppConfig>();
        let err = result.unwrap_err().to_string();
        assert!(err.contains("duplicate identifier"), "{err}");
    }

    #[test]
    fn empty_battery_list_is_rejected() {
        assert!("batteries: []\n".parse::<AppConfig>().is_err());
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let result = "thresholds:\n  pack_overvoltage: 40.0\n".parse::<AppConfig>();
        assert!(result.is_err());
    }

    #[test]
    fn overrides_apply_to_first_battery_and_monitor() {
        let mut config = AppConfig::default();
        config.apply_overrides(&ConfigOverrides {
            battery_ip: Some("192.168.1.1".into()),
            protocol: Some(Protocol::Alternate),
            mqtt_broker: Some("mqtt.example.com".into()),
            poll_interval_secs: Some(5),
            no_ui: true,
            ..ConfigOverrides::default()
        });
        assert_eq!(config.batteries[0].ip, "192.168.1.1");
        assert_eq!(config.batteries[0].protocol, Protocol::Alternate);
        assert_eq!(config.mqtt.broker, "mqtt.example.com");
        assert_eq!(config.monitor.interval, Duration::from_secs(5));
        assert!(!config.monitor.ui_enabled);
    }

    #[test]
    fn redacted_masks_password_only_when_set() {
        let mut config = AppConfig::default();
        assert_eq!(config.redacted().mqtt.password, "");
        config.mqtt.password = "hunter2".into();
        let yaml = config.redacted().to_yaml().unwrap();
        assert!(yaml.contains("***"));
        assert!(!yaml.contains("hunter2"));
    }

    #[test]
    fn yaml_round_trip_preserves_battery_order() {
        let mut config = AppConfig::default();
        config.batteries.push(BatteryConfig {
            name: "Second".into(),
            ..BatteryConfig::default()
        });
        let parsed: AppConfig = config.to_yaml().unwrap().parse().unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let err = AppConfig::resolve(Some(Path::new("/nonexistent/bmsmon.yaml"))).unwrap_err();
        assert!(err.to_string().contains("config file not found"));
    }

    #[test]
    fn explicit_path_is_loaded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "web:\n  port: 8081").unwrap();
        let loaded = AppConfig::resolve(Some(file.path())).unwrap();
        assert_eq!(loaded.config.web.port, 8081);
        assert_eq!(loaded.source.as_deref(), Some(file.path()));
    }

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("EG4 WallMount #1"), "eg4_wallmount_1");
        assert_eq!(slugify("  --Rack  A-- "), "rack_a");
        assert_eq!(slugify("***"), "");
    }
}
