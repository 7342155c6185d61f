//! Ordered endpoints for one direction.
//!
//! Slot indices never move: a device that leaves keeps its slot and gets it
//! back when it returns, so per-bus settings survive hot-plug.

use tracing::{info, warn};

use super::{ClockMode, Direction, PortAddr, PortEndpoint, PortState};
use crate::backend::BackendDriver;

pub struct BusArray {
    direction: Direction,
    buses: Vec<PortEndpoint>,
}

impl BusArray {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            buses: Vec::new(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn count(&self) -> usize {
        self.buses.len()
    }

    pub fn get(&self, slot: usize) -> Option<&PortEndpoint> {
        self.buses.get(slot)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut PortEndpoint> {
        self.buses.get_mut(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PortEndpoint> {
        self.buses.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PortEndpoint> {
        self.buses.iter_mut()
    }

    /// Installs `endpoint` at its slot and initializes it.
    ///
    /// A slot inside the array is a replacement: the previous endpoint's
    /// clock mode and input flag carry over and its handle is released.
    /// Any other slot appends. Returns the slot used.
    pub fn add(&mut self, mut endpoint: PortEndpoint, driver: &mut dyn BackendDriver) -> usize {
        let slot = endpoint.slot();
        let slot = if slot < self.buses.len() {
            let old = &mut self.buses[slot];
            endpoint.set_clock_mode(old.clock_mode());
            endpoint.set_input_flag(old.input_enabled());
            old.retire(driver);
            slot
        } else {
            self.buses.len()
        };
        endpoint.set_slot(slot);

        match endpoint.init(driver) {
            Ok(()) => {}
            Err(e) => warn!("{}", e),
        }

        if slot < self.buses.len() {
            self.buses[slot] = endpoint;
        } else {
            self.buses.push(endpoint);
        }
        slot
    }

    /// First slot bound to `(client, port)` that is not active.
    pub fn replacement_port(&self, client: i32, port: i32) -> Option<usize> {
        let addr = PortAddr::new(client, port);
        self.buses
            .iter()
            .position(|bus| bus.matches(addr) && !bus.is_active())
    }

    pub fn active_slot(&self, addr: PortAddr) -> Option<usize> {
        self.buses
            .iter()
            .position(|bus| bus.matches(addr) && bus.is_active())
    }

    pub fn matches(&self, slot: usize, client: i32, port: i32) -> bool {
        self.buses
            .get(slot)
            .is_some_and(|bus| bus.matches(PortAddr::new(client, port)))
    }

    pub fn is_active(&self, slot: usize) -> bool {
        self.buses.get(slot).is_some_and(PortEndpoint::is_active)
    }

    pub fn set_clock(&mut self, slot: usize, mode: ClockMode) -> bool {
        match self.buses.get_mut(slot) {
            Some(bus) => {
                bus.set_clock_mode(mode);
                true
            }
            None => false,
        }
    }

    /// Applies saved clock modes by slot; slots past `modes` are `Off`.
    pub fn set_all_clocks(&mut self, modes: &[ClockMode]) {
        for bus in &mut self.buses {
            let mode = modes.get(bus.slot()).copied().unwrap_or_default();
            bus.set_clock_mode(mode);
        }
    }

    pub fn set_input(&mut self, slot: usize, enabled: bool, driver: &mut dyn BackendDriver) -> bool {
        let Some(bus) = self.buses.get_mut(slot) else {
            return false;
        };
        if let Err(e) = bus.set_input(driver, enabled) {
            warn!("{}", e);
        }
        true
    }

    /// Applies saved input flags by slot. Virtual inputs stay enabled.
    pub fn set_all_inputs(&mut self, flags: &[bool], driver: &mut dyn BackendDriver) {
        for bus in &mut self.buses {
            if bus.is_virtual() {
                continue;
            }
            let enabled = flags.get(bus.slot()).copied().unwrap_or(false);
            if let Err(e) = bus.set_input(driver, enabled) {
                warn!("{}", e);
            }
        }
    }

    /// Marks active endpoints bound to `addr` inactive; returns how many.
    pub fn port_exit(&mut self, addr: PortAddr) -> usize {
        let mut count = 0;
        for bus in self.buses.iter_mut().filter(|b| b.matches(addr)) {
            if bus.is_active() {
                bus.mark_inactive();
                info!("MIDI {} bus {} went away", self.direction.as_str(), bus.name());
                count += 1;
            }
        }
        count
    }

    pub fn teardown(&mut self, driver: &mut dyn BackendDriver) {
        for bus in &mut self.buses {
            if bus.state() != PortState::Dead || bus.handle().is_some() {
                bus.retire(driver);
            }
        }
    }
}

impl std::fmt::Debug for BusArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusArray")
            .field("direction", &self.direction)
            .field("count", &self.buses.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::port::{PortCaps, RemotePort};

    fn remote(client: i32, port: i32, name: &str) -> RemotePort {
        RemotePort {
            addr: PortAddr::new(client, port),
            client_name: name.to_string(),
            port_name: format!("{} MIDI 1", name),
            caps: PortCaps::FULL_READ | PortCaps::FULL_WRITE,
        }
    }

    fn open_driver() -> MemoryBackend {
        let mut driver = MemoryBackend::new();
        driver.open("test").unwrap();
        driver
    }

    #[test]
    fn test_add_appends_and_activates() {
        let mut driver = open_driver();
        let mut outs = BusArray::new(Direction::Output);
        let a = outs.add(
            PortEndpoint::new_external(0, Direction::Output, &remote(20, 0, "A")),
            &mut driver,
        );
        let b = outs.add(
            PortEndpoint::new_external(7, Direction::Output, &remote(21, 0, "B")),
            &mut driver,
        );
        assert_eq!((a, b), (0, 1));
        assert_eq!(outs.count(), 2);
        assert!(outs.is_active(0));
        assert!(outs.matches(1, 21, 0));
        assert!(!outs.matches(1, 20, 0));
    }

    #[test]
    fn test_refused_subscription_leaves_allocated() {
        let mut driver = open_driver();
        driver.handle().refuse_subscription(PortAddr::new(20, 0));
        let mut outs = BusArray::new(Direction::Output);
        outs.add(
            PortEndpoint::new_external(0, Direction::Output, &remote(20, 0, "A")),
            &mut driver,
        );
        assert_eq!(outs.get(0).unwrap().state(), PortState::Allocated);
        assert_eq!(outs.replacement_port(20, 0), Some(0));
    }

    #[test]
    fn test_replacement_keeps_slot_and_clock() {
        let mut driver = open_driver();
        let mut outs = BusArray::new(Direction::Output);
        for (i, client) in [20, 21, 128].into_iter().enumerate() {
            outs.add(
                PortEndpoint::new_external(i, Direction::Output, &remote(client, 0, "dev")),
                &mut driver,
            );
        }
        outs.set_clock(2, ClockMode::Pos);

        // active ports are never replacement candidates
        assert_eq!(outs.replacement_port(128, 0), None);
        assert_eq!(outs.port_exit(PortAddr::new(128, 0)), 1);
        assert_eq!(outs.get(2).unwrap().state(), PortState::Inactive);
        assert_eq!(outs.replacement_port(128, 0), Some(2));

        let slot = outs.add(
            PortEndpoint::new_external(2, Direction::Output, &remote(128, 0, "dev")),
            &mut driver,
        );
        assert_eq!(slot, 2);
        assert_eq!(outs.count(), 3);
        let bus = outs.get(2).unwrap();
        assert!(bus.is_active());
        assert_eq!(bus.clock_mode(), ClockMode::Pos);
        // old handle released, new one live
        assert_eq!(driver.handle().live_ports(), 3);
    }

    #[test]
    fn test_set_all_clocks_by_slot() {
        let mut driver = open_driver();
        let mut outs = BusArray::new(Direction::Output);
        for i in 0..3 {
            outs.add(
                PortEndpoint::new_virtual(i, Direction::Output, "test", format!("out {}", i)),
                &mut driver,
            );
        }
        outs.set_all_clocks(&[ClockMode::Off, ClockMode::Mod]);
        let modes: Vec<_> = outs.iter().map(|b| b.clock_mode()).collect();
        assert_eq!(modes, vec![ClockMode::Off, ClockMode::Mod, ClockMode::Off]);
        assert!(!outs.set_clock(3, ClockMode::Pos));
    }

    #[test]
    fn test_set_input_subscribes_external_inputs() {
        let mut driver = open_driver();
        let mut ins = BusArray::new(Direction::Input);
        ins.add(
            PortEndpoint::new_external(0, Direction::Input, &remote(20, 0, "Keys")),
            &mut driver,
        );
        assert!(ins.is_active(0));
        assert!(!driver.handle().is_connected(PortAddr::new(20, 0)));

        ins.set_all_inputs(&[true], &mut driver);
        assert!(driver.handle().is_connected(PortAddr::new(20, 0)));
        assert!(ins.get(0).unwrap().input_enabled());

        assert!(ins.set_input(0, false, &mut driver));
        assert!(!driver.handle().is_connected(PortAddr::new(20, 0)));
        assert!(!ins.set_input(5, true, &mut driver));
    }

    #[test]
    fn test_teardown_releases_everything() {
        let mut driver = open_driver();
        let mut outs = BusArray::new(Direction::Output);
        outs.add(
            PortEndpoint::new_virtual(0, Direction::Output, "test", "out 0"),
            &mut driver,
        );
        outs.teardown(&mut driver);
        assert_eq!(outs.get(0).unwrap().state(), PortState::Dead);
        assert_eq!(driver.handle().live_ports(), 0);
    }
}
