//! Master bus configuration.
//!
//! `BusConfig` replaces process-wide settings: everything the bus needs at
//! init is read from this value. It can be stored as TOML:
//!
//! ```toml
//! client_name = "seqbus"
//! backend = "alsa"
//! manual_ports = false
//! ppqn = 192
//! bpm = 120.0
//! clock_modes = ["off", "pos", "mod"]
//! input_enabled = [true]
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::port::ClockMode;
use crate::tempo::{DEFAULT_BPM, DEFAULT_PPQN};

pub const DEFAULT_CLIENT_NAME: &str = "seqbus";
pub const DEFAULT_OUTPUT_BUFFER_SIZE: usize = 0x80000;
pub const DEFAULT_INPUT_BUFFER_SIZE: usize = 0x10000;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_SYSEX_CHUNK_SIZE: usize = 0x100;
/// Largest inbound SysEx message, terminator included.
pub const DEFAULT_MAX_SYSEX_SIZE: usize = 0x20000;
/// Sixteenth notes between Mod-clock start points.
pub const DEFAULT_CLOCK_MOD: u32 = 64;

/// Which MIDI transport drives the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Alsa,
    Jack,
    /// In-process transport; no host MIDI system involved.
    Memory,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Alsa => "alsa",
            BackendKind::Jack => "jack",
            BackendKind::Memory => "memory",
        }
    }
}

impl Default for BackendKind {
    fn default() -> Self {
        if cfg!(feature = "alsa") {
            BackendKind::Alsa
        } else if cfg!(feature = "jack") {
            BackendKind::Jack
        } else {
            BackendKind::Memory
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub client_name: String,
    pub backend: BackendKind,
    /// Create 16 virtual outputs and one virtual input instead of
    /// discovering the system's ports.
    pub manual_ports: bool,
    pub ppqn: u32,
    pub bpm: f64,
    /// Clock mode per output bus; missing entries are `Off`.
    pub clock_modes: Vec<ClockMode>,
    /// Input flag per input bus; missing entries are disabled.
    pub input_enabled: Vec<bool>,
    /// Follow port hot-plug through the transport's announce port.
    pub announce: bool,
    pub sysex_enabled: bool,
    pub poll_timeout_ms: u64,
    pub output_buffer_size: usize,
    pub input_buffer_size: usize,
    pub sysex_chunk_size: usize,
    /// Inbound SysEx longer than this is dropped.
    pub max_sysex_size: usize,
    pub clock_mod: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            backend: BackendKind::default(),
            manual_ports: false,
            ppqn: DEFAULT_PPQN,
            bpm: DEFAULT_BPM,
            clock_modes: Vec::new(),
            input_enabled: Vec::new(),
            announce: true,
            sysex_enabled: true,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            output_buffer_size: DEFAULT_OUTPUT_BUFFER_SIZE,
            input_buffer_size: DEFAULT_INPUT_BUFFER_SIZE,
            sysex_chunk_size: DEFAULT_SYSEX_CHUNK_SIZE,
            max_sysex_size: DEFAULT_MAX_SYSEX_SIZE,
            clock_mod: DEFAULT_CLOCK_MOD,
        }
    }
}

impl BusConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: BusConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ppqn == 0 {
            return Err(Error::InvalidConfig("ppqn must be positive".into()));
        }
        if !self.bpm.is_finite() || self.bpm <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "bpm must be positive, got {}",
                self.bpm
            )));
        }
        if self.sysex_chunk_size == 0 {
            return Err(Error::InvalidConfig("sysex_chunk_size must be positive".into()));
        }
        if self.max_sysex_size < 2 {
            return Err(Error::InvalidConfig("max_sysex_size must hold F0 and F7".into()));
        }
        if self.client_name.is_empty() {
            return Err(Error::InvalidConfig("client_name is empty".into()));
        }
        Ok(())
    }

    pub fn clock_mode(&self, bus: usize) -> ClockMode {
        self.clock_modes.get(bus).copied().unwrap_or_default()
    }

    pub fn set_clock_mode(&mut self, bus: usize, mode: ClockMode) {
        if self.clock_modes.len() <= bus {
            self.clock_modes.resize(bus + 1, ClockMode::Off);
        }
        self.clock_modes[bus] = mode;
    }

    pub fn input_enabled(&self, bus: usize) -> bool {
        self.input_enabled.get(bus).copied().unwrap_or(false)
    }

    pub fn set_input_enabled(&mut self, bus: usize, enabled: bool) {
        if self.input_enabled.len() <= bus {
            self.input_enabled.resize(bus + 1, false);
        }
        self.input_enabled[bus] = enabled;
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.ppqn, 192);
        assert_eq!(config.bpm, 120.0);
        assert_eq!(config.output_buffer_size, 0x80000);
        assert_eq!(config.input_buffer_size, 0x10000);
        assert_eq!(config.max_sysex_size, 0x20000);
        assert_eq!(config.poll_timeout(), Duration::from_millis(1000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_per_bus_settings_grow_on_demand() {
        let mut config = BusConfig::default();
        assert_eq!(config.clock_mode(5), ClockMode::Off);
        config.set_clock_mode(5, ClockMode::Pos);
        assert_eq!(config.clock_modes.len(), 6);
        assert_eq!(config.clock_mode(5), ClockMode::Pos);
        assert_eq!(config.clock_mode(4), ClockMode::Off);

        assert!(!config.input_enabled(0));
        config.set_input_enabled(2, true);
        assert!(config.input_enabled(2));
        assert!(!config.input_enabled(1));
    }

    #[test]
    fn test_validate_rejects_bad_tempo() {
        let config = BusConfig {
            ppqn: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = BusConfig {
            bpm: -1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BusConfig {
            bpm: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BusConfig {
            max_sysex_size: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_partial_document() {
        let config = BusConfig::from_toml_str(
            r#"
            backend = "memory"
            manual_ports = true
            bpm = 140.0
            clock_modes = ["off", "pos", "mod"]
            "#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendKind::Memory);
        assert!(config.manual_ports);
        assert_eq!(config.bpm, 140.0);
        assert_eq!(config.ppqn, 192);
        assert_eq!(config.clock_mode(2), ClockMode::Mod);
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = BusConfig {
            backend: BackendKind::Jack,
            ..Default::default()
        };
        config.set_input_enabled(1, true);
        let text = config.to_toml().unwrap();
        assert_eq!(BusConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_toml_rejects_invalid_values() {
        let err = BusConfig::from_toml_str("ppqn = 0").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        let err = BusConfig::from_toml_str("backend = \"coreaudio\"").unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }
}
