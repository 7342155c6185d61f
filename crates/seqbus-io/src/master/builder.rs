//! MasterBus builder.

use std::time::Duration;

use crate::backend::{create_driver, BackendDriver};
use crate::config::{BackendKind, BusConfig};
use crate::error::Result;
use crate::port::ClockMode;

use super::MasterBus;

#[derive(Default)]
pub struct MasterBusBuilder {
    config: BusConfig,
    driver: Option<Box<dyn BackendDriver>>,
}

impl MasterBusBuilder {
    /// Replaces every setting with `config`.
    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.config.client_name = name.into();
        self
    }

    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.config.backend = kind;
        self
    }

    /// Uses an already constructed driver instead of `backend`.
    pub fn driver(mut self, driver: impl BackendDriver + 'static) -> Self {
        self.config.backend = driver.kind();
        self.driver = Some(Box::new(driver));
        self
    }

    pub fn manual_ports(mut self, manual: bool) -> Self {
        self.config.manual_ports = manual;
        self
    }

    pub fn ppqn(mut self, ppqn: u32) -> Self {
        self.config.ppqn = ppqn;
        self
    }

    pub fn bpm(mut self, bpm: f64) -> Self {
        self.config.bpm = bpm;
        self
    }

    pub fn clock(mut self, bus: usize, mode: ClockMode) -> Self {
        self.config.set_clock_mode(bus, mode);
        self
    }

    pub fn input(mut self, bus: usize, enabled: bool) -> Self {
        self.config.set_input_enabled(bus, enabled);
        self
    }

    pub fn announce(mut self, enabled: bool) -> Self {
        self.config.announce = enabled;
        self
    }

    pub fn sysex(mut self, enabled: bool) -> Self {
        self.config.sysex_enabled = enabled;
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.poll_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn buffer_sizes(mut self, input: usize, output: usize) -> Self {
        self.config.input_buffer_size = input;
        self.config.output_buffer_size = output;
        self
    }

    pub fn sysex_chunk_size(mut self, size: usize) -> Self {
        self.config.sysex_chunk_size = size;
        self
    }

    pub fn max_sysex_size(mut self, size: usize) -> Self {
        self.config.max_sysex_size = size;
        self
    }

    /// Sixteenth notes between Mod-clock start points.
    pub fn clock_mod(mut self, sixteenths: u32) -> Self {
        self.config.clock_mod = sixteenths;
        self
    }

    /// Builds an uninitialized bus; call [`MasterBus::init`] next.
    pub fn build(self) -> Result<MasterBus> {
        self.config.validate()?;
        let driver = match self.driver {
            Some(driver) => driver,
            None => create_driver(&self.config)?,
        };
        MasterBus::new(self.config, driver)
    }

    /// Builds the bus and initializes it with the configured PPQN and BPM.
    pub fn build_and_init(self) -> Result<MasterBus> {
        let (ppqn, bpm) = (self.config.ppqn, self.config.bpm);
        let bus = self.build()?;
        bus.init(ppqn, bpm)?;
        Ok(bus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::error::Error;

    #[test]
    fn test_builder_collects_settings() {
        let bus = MasterBus::builder()
            .client_name("drums")
            .manual_ports(true)
            .clock(1, ClockMode::Mod)
            .input(0, true)
            .poll_timeout(Duration::from_millis(250))
            .driver(MemoryBackend::new())
            .build()
            .unwrap();
        let config = bus.config();
        assert_eq!(config.client_name, "drums");
        assert_eq!(config.backend, BackendKind::Memory);
        assert_eq!(config.poll_timeout_ms, 250);
        assert_eq!(config.clock_mode(1), ClockMode::Mod);
        assert!(config.input_enabled(0));
    }

    #[test]
    fn test_builder_memory_backend_by_kind() {
        let bus = MasterBus::builder()
            .backend(BackendKind::Memory)
            .manual_ports(true)
            .bpm(100.0)
            .build_and_init()
            .unwrap();
        assert_eq!(bus.backend_kind(), BackendKind::Memory);
        assert_eq!(bus.output_count(), 16);
        assert_eq!(bus.beats_per_minute(), 100.0);
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let result = MasterBus::builder()
            .driver(MemoryBackend::new())
            .ppqn(0)
            .build();
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_fatal_init_when_transport_refuses() {
        let driver = MemoryBackend::new();
        driver.handle().fail_open();
        let result = MasterBus::builder().driver(driver).build_and_init();
        assert!(matches!(result, Err(Error::FatalInit(_))));
    }
}
