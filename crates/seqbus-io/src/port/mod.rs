//! MIDI port endpoints and the per-direction bus arrays that own them.

mod bus_array;
mod endpoint;

pub use bus_array::BusArray;
pub use endpoint::PortEndpoint;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transport address of a port: (client, port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortAddr {
    pub client: i32,
    pub port: i32,
}

impl PortAddr {
    pub const fn new(client: i32, port: i32) -> Self {
        Self { client, port }
    }
}

impl fmt::Display for PortAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Input => "in",
            Direction::Output => "out",
        }
    }
}

/// MIDI clock sent on an output bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockMode {
    #[default]
    Off,
    /// Clock plus Song Position Pointer on continue.
    Pos,
    /// Clock starting on `clock_mod` sixteenth-note boundaries.
    Mod,
}

impl ClockMode {
    pub fn is_on(self) -> bool {
        self != ClockMode::Off
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClockMode::Off => "off",
            ClockMode::Pos => "pos",
            ClockMode::Mod => "mod",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// Registered with the transport, but the subscription was refused.
    Allocated,
    Active,
    /// The remote port went away; the slot waits for it to return.
    Inactive,
    /// Torn down, or the transport refused to register the port.
    Dead,
}

impl PortState {
    pub fn as_str(self) -> &'static str {
        match self {
            PortState::Allocated => "allocated",
            PortState::Active => "active",
            PortState::Inactive => "inactive",
            PortState::Dead => "dead",
        }
    }
}

/// Transport capability bits of a remote port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortCaps(u8);

impl PortCaps {
    pub const READ: PortCaps = PortCaps(0x01);
    pub const WRITE: PortCaps = PortCaps(0x02);
    pub const SUBS_READ: PortCaps = PortCaps(0x04);
    pub const SUBS_WRITE: PortCaps = PortCaps(0x08);

    pub const FULL_READ: PortCaps = PortCaps(0x01 | 0x04);
    pub const FULL_WRITE: PortCaps = PortCaps(0x02 | 0x08);

    pub const fn empty() -> Self {
        PortCaps(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: PortCaps) -> bool {
        self.0 & other.0 == other.0
    }

    /// Another client can subscribe to write into this port.
    pub const fn can_subscribe_write(self) -> bool {
        self.contains(Self::SUBS_WRITE)
    }

    pub const fn can_subscribe_read(self) -> bool {
        self.contains(Self::SUBS_READ)
    }

    pub const fn is_full_write(self) -> bool {
        self.contains(Self::FULL_WRITE)
    }

    pub const fn is_full_read(self) -> bool {
        self.contains(Self::FULL_READ)
    }
}

impl std::ops::BitOr for PortCaps {
    type Output = PortCaps;

    fn bitor(self, rhs: PortCaps) -> PortCaps {
        PortCaps(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for PortCaps {
    fn bitor_assign(&mut self, rhs: PortCaps) {
        self.0 |= rhs.0;
    }
}

/// A port owned by another client, as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePort {
    pub addr: PortAddr,
    pub client_name: String,
    pub port_name: String,
    pub caps: PortCaps,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caps_full_checks_need_both_bits() {
        let subs_only = PortCaps::SUBS_WRITE;
        assert!(subs_only.can_subscribe_write());
        assert!(!subs_only.is_full_write());

        let full = PortCaps::WRITE | PortCaps::SUBS_WRITE;
        assert!(full.is_full_write());
        assert!(!full.is_full_read());

        let mut both = PortCaps::FULL_READ;
        both |= PortCaps::FULL_WRITE;
        assert!(both.is_full_read() && both.is_full_write());
    }

    #[test]
    fn test_addr_display() {
        assert_eq!(PortAddr::new(128, 0).to_string(), "128:0");
    }
}
