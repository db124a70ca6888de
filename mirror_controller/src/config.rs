use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use utilities::backoff::BackoffPolicy;

use crate::axis::AxisSettings;
use crate::interlock::Interlock;
use crate::models::{AxisId, MotorInfo, SoftLimits, Unit};
use crate::registry::MotorRegistry;
use crate::session::{SessionDescriptor, SessionSettings, TransportKind};

/// Environment variables starting with this prefix override file values,
/// e.g. `MIRROR__SESSION__IO_TIMEOUT_MS=800`.
pub const ENV_PREFIX: &str = "MIRROR";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found at {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to load configuration: {source}")]
    LoadError { source: ::config::ConfigError },

    #[error("Failed to serialize configuration: {source}")]
    SerializeError { source: toml::ser::Error },

    #[error("Failed to write configuration file: {source}")]
    WriteError { source: std::io::Error },

    #[error("Configuration validation failed: {message}")]
    ValidationError { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub backoff_jitter: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 2000,
            io_timeout_ms: 500,
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
            backoff_jitter: 0.2,
        }
    }
}

impl SessionConfig {
    pub fn settings(&self) -> SessionSettings {
        SessionSettings {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            io_timeout: Duration::from_millis(self.io_timeout_ms),
            backoff: BackoffPolicy {
                base: Duration::from_millis(self.backoff_base_ms),
                cap: Duration::from_millis(self.backoff_cap_ms),
                jitter: self.backoff_jitter,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Status updates buffered per subscriber before coalescing kicks in.
    pub subscriber_buffer: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    pub time_limit_secs: u64,
    /// How often interlocks are checked against current positions.
    pub interlock_check_ms: u64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            time_limit_secs: 60,
            interlock_check_ms: 250,
        }
    }
}

impl MotionConfig {
    pub fn settings(&self) -> AxisSettings {
        AxisSettings {
            motion_time_limit: Duration::from_secs(self.time_limit_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for daily rotated JSON logs. Console only when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
    /// Log every status change, not only faults and health changes.
    pub log_status_changes: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            file_prefix: "mirror_controller".to_string(),
            log_status_changes: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortConfig {
    pub name: String,
    pub kind: TransportKind,
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

fn default_baud_rate() -> u32 {
    115_200
}

impl PortConfig {
    pub fn descriptor(&self) -> SessionDescriptor {
        SessionDescriptor {
            port: self.name.clone(),
            kind: self.kind,
            address: self.address.clone(),
            baud_rate: self.baud_rate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorConfig {
    pub id: String,
    pub label: String,
    pub port: String,
    pub device: u8,
    pub unit: Unit,
    pub steps_per_unit: f64,
    pub min: f64,
    pub max: f64,
    #[serde(default)]
    pub home_position: f64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    pub speed: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_speed: Option<f64>,
    #[serde(default = "default_homeable")]
    pub homeable: bool,
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_homeable() -> bool {
    true
}

impl From<&MotorConfig> for MotorInfo {
    fn from(config: &MotorConfig) -> Self {
        MotorInfo {
            id: AxisId::new(config.id.clone()),
            label: config.label.clone(),
            port: config.port.clone(),
            device: config.device,
            unit: config.unit,
            steps_per_unit: config.steps_per_unit,
            limits: SoftLimits::new(config.min, config.max),
            home_position: config.home_position,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            speed: config.speed,
            max_speed: config.max_speed,
            homeable: config.homeable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub events: EventsConfig,
    pub motion: MotionConfig,
    pub logging: LoggingConfig,
    pub ports: Vec<PortConfig>,
    pub motors: Vec<MotorConfig>,
    pub interlocks: Vec<Interlock>,
}

/// Bench layout: sixteen single-axis stages on one daisy chain.
const BENCH: [(&str, &str, Unit, f64); 16] = [
    ("PM1R", "PM1 Rotation", Unit::Degrees, 360.0),
    ("PM1Y", "PM1 Y", Unit::Millimetres, 304.8),
    ("PM1Z", "PM1 Z", Unit::Millimetres, 304.8),
    ("PM1D", "PM1 Diagnostic", Unit::Millimetres, 304.8),
    ("PM3Y", "PM3 Y", Unit::Millimetres, 304.8),
    ("PM3Z", "PM3 Z", Unit::Millimetres, 304.8),
    ("R2", "Rotation 2", Unit::Degrees, 360.0),
    ("XM", "X Mirror", Unit::Millimetres, 304.8),
    ("S2", "Slit 2", Unit::Millimetres, 304.8),
    ("PM2D", "PM2 Diagnostic", Unit::Millimetres, 304.8),
    ("PM2Y", "PM2 Y", Unit::Millimetres, 304.8),
    ("PM2Z", "PM2 Z", Unit::Millimetres, 304.8),
    ("PM2V", "PM2 Vertical", Unit::Millimetres, 304.8),
    ("PM3X", "PM3 X", Unit::Millimetres, 304.8),
    ("S3", "Slit 3", Unit::Millimetres, 304.8),
    ("PG", "Pinhole Grating", Unit::Millimetres, 304.8),
];

/// Microsteps per millimetre of the linear stages.
const LINEAR_STEPS_PER_MM: f64 = 4_266_667.0 / 203.2;
/// Microsteps per degree of the rotary stages.
const ROTARY_STEPS_PER_DEG: f64 = 4_266_667.0 / 1000.0;

impl Default for AppConfig {
    fn default() -> Self {
        let motors = BENCH
            .iter()
            .enumerate()
            .map(|(index, &(id, label, unit, span))| {
                let (steps_per_unit, speed) = match unit {
                    Unit::Millimetres => (LINEAR_STEPS_PER_MM, 50.0),
                    Unit::Degrees => (ROTARY_STEPS_PER_DEG, 90.0),
                };
                MotorConfig {
                    id: id.to_string(),
                    label: label.to_string(),
                    port: "bench".to_string(),
                    device: index as u8 + 1,
                    unit,
                    steps_per_unit,
                    min: 0.0,
                    max: span,
                    home_position: 0.0,
                    poll_interval_ms: default_poll_interval_ms(),
                    speed,
                    max_speed: Some(speed),
                    homeable: true,
                }
            })
            .collect();

        Self {
            session: SessionConfig::default(),
            events: EventsConfig::default(),
            motion: MotionConfig::default(),
            logging: LoggingConfig::default(),
            ports: vec![PortConfig {
                name: "bench".to_string(),
                kind: TransportKind::ZaberAsciiSerial,
                address: "/dev/ttyUSB0".to_string(),
                baud_rate: default_baud_rate(),
            }],
            motors,
            interlocks: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn registry(&self) -> Result<MotorRegistry, ConfigError> {
        MotorRegistry::with_motors(
            self.ports.iter().map(|port| port.name.clone()),
            self.motors.iter().map(MotorInfo::from).collect(),
        )
        .map_err(|e| ConfigError::ValidationError {
            message: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::ValidationError { message });

        for (index, port) in self.ports.iter().enumerate() {
            if self.ports[..index].iter().any(|other| other.name == port.name) {
                return invalid(format!("port {:?} is defined twice", port.name));
            }
            if port.kind != TransportKind::Simulated && port.address.is_empty() {
                return invalid(format!("port {:?} has no address", port.name));
            }
        }
        if self.session.io_timeout_ms == 0 || self.session.connect_timeout_ms == 0 {
            return invalid("session timeouts must be positive".to_string());
        }
        if self.session.backoff_base_ms == 0
            || self.session.backoff_cap_ms < self.session.backoff_base_ms
        {
            return invalid("backoff cap must be at least the positive base delay".to_string());
        }
        if self.motion.interlock_check_ms == 0 {
            return invalid("interlock check period must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.session.backoff_jitter) {
            return invalid("backoff jitter must lie in 0..=1".to_string());
        }

        let registry = self.registry()?;
        for interlock in &self.interlocks {
            if let Some(range) = interlock
                .ranges
                .iter()
                .find(|range| registry.get(&range.axis).is_none())
            {
                return invalid(format!(
                    "interlock {:?} refers to unknown axis {}",
                    interlock.label, range.axis
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ConfigOptions {
    pub config_path: PathBuf,
    pub create_if_missing: bool,
}

impl Default for ConfigOptions {
    fn default() -> Self {
        Self {
            config_path: Self::default_config_path(),
            create_if_missing: false,
        }
    }
}

impl ConfigOptions {
    pub fn default_config_path() -> PathBuf {
        std::env::var("CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("mirror_controller.toml"))
    }

    pub fn with_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            config_path: path.as_ref().to_path_buf(),
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub struct ConfigManager {
    options: ConfigOptions,
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigManager {
    pub fn new() -> Self {
        Self {
            options: ConfigOptions::default(),
        }
    }

    pub fn with_options(options: ConfigOptions) -> Self {
        Self { options }
    }

    pub fn path(&self) -> &Path {
        &self.options.config_path
    }

    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let config_path = &self.options.config_path;

        if !config_path.exists() {
            if self.options.create_if_missing {
                let default_config = AppConfig::default();
                self.save(&default_config)?;
            } else {
                return Err(ConfigError::FileNotFound {
                    path: config_path.clone(),
                });
            }
        }

        let config: AppConfig = ::config::Config::builder()
            .add_source(::config::File::from(config_path.as_path()).format(::config::FileFormat::Toml))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(::config::Config::try_deserialize)
            .map_err(|e| ConfigError::LoadError { source: e })?;

        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, config: &AppConfig) -> Result<(), ConfigError> {
        let config_path = &self.options.config_path;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError { source: e })?;
        }

        let content = toml::to_string_pretty(config)
            .map_err(|e| ConfigError::SerializeError { source: e })?;

        fs::write(config_path, content).map_err(|e| ConfigError::WriteError { source: e })?;

        Ok(())
    }
}

pub fn init_config() -> anyhow::Result<(ConfigManager, AppConfig)> {
    init_config_with_options(ConfigOptions::default())
}

pub fn init_config_with_options(
    options: ConfigOptions,
) -> anyhow::Result<(ConfigManager, AppConfig)> {
    let manager = ConfigManager::with_options(options);
    let config = manager.load()?;
    Ok((manager, config))
}

pub fn create_default_config<P: AsRef<Path>>(path: Option<P>) -> anyhow::Result<PathBuf> {
    let config_path = path
        .map(|p| p.as_ref().to_path_buf())
        .unwrap_or_else(ConfigOptions::default_config_path);

    let manager = ConfigManager::with_options(ConfigOptions {
        config_path: config_path.clone(),
        create_if_missing: true,
    });
    manager.save(&AppConfig::default())?;

    Ok(config_path)
}
