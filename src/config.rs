use crate::error::SetupError;
use crate::layout::{RegionLayout, DEFAULT_HEADER_SIZE, DEFAULT_PAYLOAD_SIZE};
use crate::lock::LockConfig;
use crate::rt::RealTimeConfig;
use crate::scheduler::check_period;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings of the control task, read from a TOML file.
///
/// ```toml
/// [device]
/// uio_device = "/dev/uio1"
/// map_size_path = "/sys/class/uio/uio1/maps/map0/size"
///
/// [layout]
/// header_size = 16
/// payload_size = 1024
///
/// [cycle]
/// period_us = 100000
///
/// [lock]
/// backoff_us = 10
///
/// [realtime]
/// fifo = true
/// priority = 81
/// pin_cpu = true
/// cpu = 1
/// lock_memory = true
/// ```
///
/// Every key is optional and defaults to the values above.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub device: DeviceConfig,
    pub layout: LayoutConfig,
    pub cycle: CycleConfig,
    pub lock: LockConfig,
    pub realtime: RealTimeConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    pub uio_device: PathBuf,
    pub map_size_path: PathBuf,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            uio_device: PathBuf::from("/dev/uio1"),
            map_size_path: PathBuf::from("/sys/class/uio/uio1/maps/map0/size"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LayoutConfig {
    pub header_size: usize,
    pub payload_size: usize,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            header_size: DEFAULT_HEADER_SIZE,
            payload_size: DEFAULT_PAYLOAD_SIZE,
        }
    }
}

impl LayoutConfig {
    pub fn region_layout(&self) -> Result<RegionLayout, SetupError> {
        RegionLayout::new(self.header_size, self.payload_size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CycleConfig {
    pub period_us: u64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self { period_us: 100_000 }
    }
}

impl CycleConfig {
    pub fn period(&self) -> Duration {
        Duration::from_micros(self.period_us)
    }
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self, SetupError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SetupError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SetupError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        log::debug!("loaded configuration from {}: {:?}", path.display(), config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SetupError> {
        check_period(self.cycle.period())?;
        self.layout.region_layout()?;
        self.realtime.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.device.uio_device, PathBuf::from("/dev/uio1"));
        assert_eq!(config.cycle.period(), Duration::from_millis(100));
        assert_eq!(config.lock.backoff(), Duration::from_micros(10));
        assert_eq!(
            config.layout.region_layout().unwrap(),
            RegionLayout::default()
        );
    }

    #[test]
    fn full_file_is_parsed() {
        let text = r#"
            [device]
            uio_device = "/dev/uio3"
            map_size_path = "/sys/class/uio/uio3/maps/map0/size"

            [layout]
            header_size = 8
            payload_size = 256

            [cycle]
            period_us = 1000

            [lock]
            backoff_us = 5

            [realtime]
            priority = 90
            lock_memory = false
        "#;
        let config = Config::from_toml_str(text).unwrap();
        assert_eq!(config.device.uio_device, PathBuf::from("/dev/uio3"));
        assert_eq!(config.layout.region_layout().unwrap().buffer_size(), 264);
        assert_eq!(config.cycle.period(), Duration::from_millis(1));
        assert_eq!(config.lock.backoff_us, 5);
        assert_eq!(config.realtime.priority, 90);
        // unspecified keys keep their defaults
        assert!(config.realtime.fifo);
        assert!(config.realtime.pin_cpu);
        assert_eq!(config.realtime.cpu, 1);
        assert!(!config.realtime.lock_memory);
    }

    #[test]
    fn every_realtime_step_can_be_switched_off() {
        let text = "[realtime]\nfifo = false\npin_cpu = false\nlock_memory = false\n";
        let config = Config::from_toml_str(text).unwrap();
        assert_eq!(config.realtime, RealTimeConfig::disabled());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let res = Config::from_toml_str("[cycle]\nperiod_ms = 5\n");
        assert!(matches!(res, Err(SetupError::ConfigParse(_))));
    }

    #[test]
    fn zero_period_is_rejected() {
        let res = Config::from_toml_str("[cycle]\nperiod_us = 0\n");
        assert!(matches!(res, Err(SetupError::ZeroPeriod)));
    }

    #[test]
    fn overlong_period_is_rejected() {
        assert!(Config::from_toml_str("[cycle]\nperiod_us = 3600000000\n").is_ok());
        let res = Config::from_toml_str("[cycle]\nperiod_us = 3600000001\n");
        assert!(matches!(res, Err(SetupError::Config(_))));
        let res = Config::from_toml_str("[cycle]\nperiod_us = 18446744073709551\n");
        assert!(matches!(res, Err(SetupError::Config(_))));
    }

    #[test]
    fn tiny_header_is_rejected() {
        let res = Config::from_toml_str("[layout]\nheader_size = 1\n");
        assert!(matches!(res, Err(SetupError::InvalidLayout(_))));
    }

    #[test]
    fn missing_file_is_reported() {
        let res = Config::load("/nonexistent/uio-triple-buffer.toml");
        assert!(matches!(res, Err(SetupError::ConfigRead { .. })));
    }
}
