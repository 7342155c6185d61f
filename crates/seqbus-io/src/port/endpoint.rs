//! One MIDI port on one back-end.

use std::fmt;

use seqbus_midi::Pulse;
use tracing::{debug, warn};

use super::{ClockMode, Direction, PortAddr, PortState, RemotePort};
use crate::backend::{BackendDriver, PortHandle};
use crate::clock::{ClockBurst, ClockState};
use crate::error::{Error, Result};

pub struct PortEndpoint {
    slot: usize,
    direction: Direction,
    is_virtual: bool,
    addr: PortAddr,
    client_name: String,
    port_name: String,
    clock: ClockState,
    input_enabled: bool,
    state: PortState,
    handle: Option<PortHandle>,
}

impl PortEndpoint {
    /// A port owned by this process. Its address is assigned by the
    /// back-end when the endpoint is initialized.
    pub fn new_virtual(
        slot: usize,
        direction: Direction,
        client_name: impl Into<String>,
        port_name: impl Into<String>,
    ) -> Self {
        Self {
            slot,
            direction,
            is_virtual: true,
            addr: PortAddr::new(-1, -1),
            client_name: client_name.into(),
            port_name: port_name.into(),
            clock: ClockState::default(),
            input_enabled: direction == Direction::Input,
            state: PortState::Allocated,
            handle: None,
        }
    }

    /// A proxy for a port owned by another client.
    pub fn new_external(slot: usize, direction: Direction, remote: &RemotePort) -> Self {
        Self {
            slot,
            direction,
            is_virtual: false,
            addr: remote.addr,
            client_name: remote.client_name.clone(),
            port_name: remote.port_name.clone(),
            clock: ClockState::default(),
            input_enabled: false,
            state: PortState::Allocated,
            handle: None,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub(crate) fn set_slot(&mut self, slot: usize) {
        self.slot = slot;
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    pub fn addr(&self) -> PortAddr {
        self.addr
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Display name, e.g. `[2] 128:0 Keystation:Keystation MIDI 1`.
    pub fn name(&self) -> String {
        format!(
            "[{}] {} {}:{}",
            self.slot, self.addr, self.client_name, self.port_name
        )
    }

    pub fn state(&self) -> PortState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == PortState::Active
    }

    pub fn handle(&self) -> Option<PortHandle> {
        self.handle
    }

    pub fn matches(&self, addr: PortAddr) -> bool {
        self.addr == addr
    }

    pub fn clock_mode(&self) -> ClockMode {
        self.clock.mode()
    }

    pub fn set_clock_mode(&mut self, mode: ClockMode) {
        self.clock.set_mode(mode);
    }

    pub(crate) fn clock_mut(&mut self) -> &mut ClockState {
        &mut self.clock
    }

    pub fn input_enabled(&self) -> bool {
        self.input_enabled
    }

    /// Sets the flag without touching the transport.
    pub(crate) fn set_input_flag(&mut self, enabled: bool) {
        self.input_enabled = enabled;
    }

    /// Registers the port and, for external ports, subscribes it.
    ///
    /// Registration failure leaves the endpoint `Dead`; a refused
    /// subscription leaves it `Allocated`.
    pub fn init(&mut self, driver: &mut dyn BackendDriver) -> Result<()> {
        let local_name = self.local_port_name();
        let registered = if self.is_virtual {
            driver
                .create_virtual(self.direction, &local_name)
                .map(|(handle, addr)| {
                    self.addr = addr;
                    handle
                })
        } else {
            driver.create_external(self.direction, self.addr, &local_name)
        };
        let handle = match registered {
            Ok(handle) => handle,
            Err(e) => {
                self.state = PortState::Dead;
                return Err(Error::PortRegistration {
                    name: self.name(),
                    reason: e.to_string(),
                });
            }
        };
        self.handle = Some(handle);

        let subscribe = !self.is_virtual
            && (self.direction == Direction::Output || self.input_enabled);
        if subscribe {
            if let Err(e) = driver.connect(handle) {
                self.state = PortState::Allocated;
                return Err(Error::Subscription {
                    addr: self.addr,
                    reason: e.to_string(),
                });
            }
        }
        self.state = PortState::Active;
        debug!(
            "Created MIDI {} port {}: {}",
            self.direction.as_str(),
            self.slot,
            self.name()
        );
        Ok(())
    }

    /// Enables or disables input; external inputs are subscribed or
    /// unsubscribed accordingly.
    pub fn set_input(&mut self, driver: &mut dyn BackendDriver, enabled: bool) -> Result<()> {
        self.input_enabled = enabled;
        if self.direction != Direction::Input || self.is_virtual {
            return Ok(());
        }
        let Some(handle) = self.handle else {
            return Ok(());
        };
        match self.state {
            PortState::Active | PortState::Allocated => {}
            PortState::Inactive | PortState::Dead => return Ok(()),
        }
        if enabled {
            match driver.connect(handle) {
                Ok(()) => self.state = PortState::Active,
                Err(e) => {
                    self.state = PortState::Allocated;
                    return Err(Error::Subscription {
                        addr: self.addr,
                        reason: e.to_string(),
                    });
                }
            }
        } else if let Err(e) = driver.disconnect(handle) {
            warn!("Cannot unsubscribe {}: {}", self.name(), e);
        }
        Ok(())
    }

    /// Hands `bytes` to the back-end. A failing send deactivates the port.
    pub fn send(&mut self, driver: &mut dyn BackendDriver, bytes: &[u8], tick: Pulse) -> Result<()> {
        let handle = match (self.state, self.handle) {
            (PortState::Active, Some(handle)) => handle,
            _ => {
                return Err(Error::SendFailure {
                    bus: self.slot,
                    reason: format!("port is {}", self.state.as_str()),
                })
            }
        };
        driver.send(handle, bytes, tick).map_err(|e| {
            self.state = PortState::Inactive;
            Error::SendFailure {
                bus: self.slot,
                reason: e.to_string(),
            }
        })
    }

    pub(crate) fn send_clock(&mut self, driver: &mut dyn BackendDriver, burst: ClockBurst) {
        for msg in &burst {
            if let Err(e) = self.send(driver, msg.as_bytes(), msg.tick) {
                warn!("{}", e);
                break;
            }
        }
    }

    pub fn mark_inactive(&mut self) {
        if self.state == PortState::Active {
            self.state = PortState::Inactive;
        }
    }

    /// Releases the back-end handle; the endpoint is `Dead` afterwards.
    pub fn retire(&mut self, driver: &mut dyn BackendDriver) {
        if let Some(handle) = self.handle.take() {
            driver.release(handle);
        }
        self.state = PortState::Dead;
    }

    fn local_port_name(&self) -> String {
        if self.is_virtual {
            self.port_name.clone()
        } else {
            format!("{} {}", self.client_name, self.direction.as_str())
        }
    }
}

impl fmt::Debug for PortEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortEndpoint")
            .field("slot", &self.slot)
            .field("direction", &self.direction)
            .field("virtual", &self.is_virtual)
            .field("addr", &self.addr)
            .field("state", &self.state)
            .field("clock", &self.clock.mode())
            .field("input_enabled", &self.input_enabled)
            .finish()
    }
}
