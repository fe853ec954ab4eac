//! Engine configuration stored as JSON

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::printer::DeviceFileName;
use crate::protocol::{
    FirmwareVariant, ProtocolError, BEEVERYCREATIVE_VID, DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS,
    LONG_TIMEOUT_MS, SUPPORTED_PRODUCT_IDS,
};

/// Printer engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrinterConfig {
    /// USB vendor ID used for device discovery
    pub vendor_id: u16,

    /// USB product IDs accepted during discovery
    pub product_ids: Vec<u16>,

    /// Baud rate
    pub baud_rate: u32,

    /// Round-trip timeout for plain commands in milliseconds
    pub timeout_ms: u64,

    /// Timeout for macros and motion in milliseconds
    pub long_timeout_ms: u64,

    /// Bytes per transfer block
    pub chunk_size: usize,

    /// Storage name every transfer is written to
    pub device_file_name: String,

    /// Wait after a mode switch before looking for the device again
    pub reset_delay_ms: u64,

    /// Discovery attempts after a mode switch
    pub reconnect_attempts: u32,

    /// Wait between discovery attempts in milliseconds
    pub reconnect_interval_ms: u64,

    /// Status monitor poll interval in milliseconds
    pub monitor_interval_ms: u64,

    /// Temperature poll interval while heating in milliseconds
    pub heating_poll_ms: u64,

    /// Degrees within the target that count as reached
    pub heating_tolerance: f64,

    /// Give up heating after this many seconds (0 = wait forever)
    pub heating_timeout_secs: u64,

    /// Nozzle temperature used when none is given or found in the G-code
    pub default_temperature: f64,

    /// Status checks made when verifying that a print started
    pub start_checks: u32,

    /// Wait between start checks in milliseconds
    pub start_check_interval_ms: u64,

    /// Force the homing step before prints on or off
    pub home_before_print: Option<bool>,

    /// Force a firmware dialect instead of detecting it
    pub firmware: Option<FirmwareVariant>,
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            vendor_id: BEEVERYCREATIVE_VID,
            product_ids: SUPPORTED_PRODUCT_IDS.to_vec(),
            baud_rate: DEFAULT_BAUD_RATE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            long_timeout_ms: LONG_TIMEOUT_MS,
            chunk_size: 512,
            device_file_name: DeviceFileName::default().stored().to_string(),
            reset_delay_ms: 5000,
            reconnect_attempts: 5,
            reconnect_interval_ms: 1000,
            monitor_interval_ms: 5000,
            heating_poll_ms: 2000,
            heating_tolerance: 2.0,
            heating_timeout_secs: 300,
            default_temperature: 200.0,
            start_checks: 6,
            start_check_interval_ms: 5000,
            home_before_print: None,
            firmware: None,
        }
    }
}

impl PrinterConfig {
    /// Load from a JSON file; missing keys take their defaults
    pub fn load(path: &Path) -> Result<Self, ProtocolError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ProtocolError::Config(format!("{}: {}", path.display(), e)))?;
        let config: PrinterConfig = serde_json::from_str(&content)
            .map_err(|e| ProtocolError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ProtocolError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ProtocolError::Config(e.to_string()))?;
        fs::write(path, content)
            .map_err(|e| ProtocolError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.product_ids.is_empty() {
            return Err(ProtocolError::Config("product_ids must not be empty".into()));
        }
        if self.chunk_size == 0 {
            return Err(ProtocolError::Config("chunk_size must be positive".into()));
        }
        if self.baud_rate == 0 {
            return Err(ProtocolError::Config("baud_rate must be positive".into()));
        }
        let intervals = [
            ("timeout_ms", self.timeout_ms),
            ("long_timeout_ms", self.long_timeout_ms),
            ("monitor_interval_ms", self.monitor_interval_ms),
            ("heating_poll_ms", self.heating_poll_ms),
            ("reconnect_interval_ms", self.reconnect_interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ProtocolError::Config(format!("{} must be positive", name)));
            }
        }
        if self.heating_tolerance.is_nan() || self.heating_tolerance < 0.0 {
            return Err(ProtocolError::Config(
                "heating_tolerance must not be negative".into(),
            ));
        }
        let name = DeviceFileName::new(&self.device_file_name)?;
        if name.stored() != self.device_file_name {
            return Err(ProtocolError::Config(format!(
                "device_file_name '{}' is not a valid device name (would be stored as '{}')",
                self.device_file_name, name
            )));
        }
        Ok(())
    }

    /// Device file name, already known to be valid after `validate`
    pub fn device_file(&self) -> Result<DeviceFileName, ProtocolError> {
        DeviceFileName::new(&self.device_file_name)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn long_timeout(&self) -> Duration {
        Duration::from_millis(self.long_timeout_ms)
    }

    pub fn reset_delay(&self) -> Duration {
        Duration::from_millis(self.reset_delay_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn heating_poll_interval(&self) -> Duration {
        Duration::from_millis(self.heating_poll_ms)
    }

    /// Overall heating ceiling, if any
    pub fn heating_timeout(&self) -> Option<Duration> {
        (self.heating_timeout_secs > 0).then(|| Duration::from_secs(self.heating_timeout_secs))
    }

    pub fn start_check_interval(&self) -> Duration {
        Duration::from_millis(self.start_check_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_are_valid() {
        let config = PrinterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.vendor_id, 0x29c9);
        assert_eq!(config.device_file_name, "ABCDE");
        assert_eq!(config.heating_timeout(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: PrinterConfig =
            serde_json::from_str(r#"{ "chunk_size": 4096, "firmware": "Marlin" }"#).unwrap();
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.firmware, Some(FirmwareVariant::Marlin));
        assert_eq!(config.baud_rate, DEFAULT_BAUD_RATE);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PrinterConfig {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ProtocolError::Config(_))));

        config.chunk_size = 512;
        config.device_file_name = "cube.gcode".into();
        assert!(matches!(config.validate(), Err(ProtocolError::Config(_))));

        config.device_file_name = "ABCDE".into();
        config.product_ids.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("printer.json");
        let config = PrinterConfig {
            chunk_size: 1024,
            home_before_print: Some(true),
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(PrinterConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_missing_file() {
        let result = PrinterConfig::load(Path::new("/nonexistent/printer.json"));
        assert!(matches!(result, Err(ProtocolError::Config(_))));
    }
}
