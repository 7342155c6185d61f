//! In-process back-end.
//!
//! Behaves like a small sequencer client: it has a client id, a table of
//! remote ports, a tempo queue and an inbound packet queue. A
//! [`MemoryHandle`] lets the owner play the part of the outside world:
//! plug and unplug devices, inject MIDI, inspect what was sent and make
//! subscriptions or sends fail.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use seqbus_midi::Pulse;
use tracing::debug;

use super::{
    BackendDriver, InputSignal, InputWaiter, Packet, PortHandle, QueueTempo, SignalWaiter,
};
use crate::config::BackendKind;
use crate::error::{Error, Result};
use crate::port::{Direction, PortAddr, PortCaps, RemotePort};
use crate::tempo::{tempo_us_from_bpm, DEFAULT_BPM, DEFAULT_PPQN};

pub const MEMORY_CLIENT_ID: i32 = 129;
pub const SYSTEM_CLIENT_ID: i32 = 0;

/// A message handed to [`BackendDriver::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub handle: PortHandle,
    /// Remote address for external ports, our own address for virtual ones.
    pub addr: PortAddr,
    pub tick: Pulse,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
enum Inbound {
    Midi {
        tick: Pulse,
        port: Option<PortHandle>,
        bytes: Vec<u8>,
    },
    Announce(Packet),
}

#[derive(Debug)]
struct LocalPort {
    direction: Direction,
    name: String,
    local: PortAddr,
    remote: Option<PortAddr>,
    connected: bool,
    released: bool,
}

#[derive(Debug)]
struct MemoryState {
    open: bool,
    fail_open: bool,
    client_id: i32,
    client_name: String,
    remotes: Vec<RemotePort>,
    ports: Vec<LocalPort>,
    inbound: VecDeque<Inbound>,
    sent: Vec<SentMessage>,
    tempo: QueueTempo,
    running: bool,
    start_tick: Pulse,
    announce: bool,
    refused: HashSet<PortAddr>,
    failing: HashSet<PortAddr>,
    loopback: bool,
    /// Messages `sent` may hold before further sends are dropped.
    output_capacity: Option<usize>,
    output_overflows: u64,
    buffer_sizes: Option<(usize, usize)>,
    poll_refreshes: usize,
    flushes: usize,
}

impl MemoryState {
    fn port(&self, handle: PortHandle) -> Result<&LocalPort> {
        self.ports
            .get(handle as usize)
            .filter(|p| !p.released)
            .ok_or_else(|| Error::Backend(format!("unknown port handle {}", handle)))
    }

    fn port_mut(&mut self, handle: PortHandle) -> Result<&mut LocalPort> {
        self.ports
            .get_mut(handle as usize)
            .filter(|p| !p.released)
            .ok_or_else(|| Error::Backend(format!("unknown port handle {}", handle)))
    }

    fn first_virtual_input(&self) -> Option<PortHandle> {
        self.ports
            .iter()
            .position(|p| !p.released && p.remote.is_none() && p.direction == Direction::Input)
            .map(|i| i as PortHandle)
    }
}

pub struct MemoryBackend {
    shared: Arc<Mutex<MemoryState>>,
    signal: InputSignal,
    waiter: Arc<SignalWaiter>,
    sysex_chunk_size: Option<usize>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (signal, waiter) = InputSignal::new();
        Self {
            shared: Arc::new(Mutex::new(MemoryState {
                open: false,
                fail_open: false,
                client_id: MEMORY_CLIENT_ID,
                client_name: String::new(),
                remotes: Vec::new(),
                ports: Vec::new(),
                inbound: VecDeque::new(),
                sent: Vec::new(),
                tempo: QueueTempo {
                    ppqn: DEFAULT_PPQN,
                    tempo_us: tempo_us_from_bpm(DEFAULT_BPM),
                },
                running: false,
                start_tick: 0,
                announce: false,
                refused: HashSet::new(),
                failing: HashSet::new(),
                loopback: false,
                output_capacity: None,
                output_overflows: 0,
                buffer_sizes: None,
                poll_refreshes: 0,
                flushes: 0,
            })),
            signal,
            waiter: Arc::new(waiter),
            sysex_chunk_size: None,
        }
    }

    pub fn with_sysex_chunk_size(mut self, size: Option<usize>) -> Self {
        self.sysex_chunk_size = size.filter(|&s| s > 0);
        self
    }

    pub fn handle(&self) -> MemoryHandle {
        MemoryHandle {
            shared: Arc::clone(&self.shared),
            signal: self.signal.clone(),
        }
    }
}

impl BackendDriver for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn open(&mut self, client_name: &str) -> Result<()> {
        let mut state = self.shared.lock();
        if state.fail_open {
            return Err(Error::FatalInit("memory transport refused the client".into()));
        }
        state.open = true;
        state.client_name = client_name.to_string();
        debug!("Opened memory MIDI client {} ({})", state.client_id, client_name);
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.shared.lock();
        state.running = false;
        for port in &mut state.ports {
            port.released = true;
            port.connected = false;
        }
        state.open = false;
    }

    fn client_id(&self) -> i32 {
        self.shared.lock().client_id
    }

    fn system_client(&self) -> Option<i32> {
        Some(SYSTEM_CLIENT_ID)
    }

    fn enumerate(&self) -> Result<Vec<RemotePort>> {
        Ok(self.shared.lock().remotes.clone())
    }

    fn port_info(&self, addr: PortAddr) -> Option<RemotePort> {
        self.shared
            .lock()
            .remotes
            .iter()
            .find(|r| r.addr == addr)
            .cloned()
    }

    fn create_virtual(&mut self, direction: Direction, name: &str) -> Result<(PortHandle, PortAddr)> {
        let mut state = self.shared.lock();
        let handle = state.ports.len() as PortHandle;
        let local = PortAddr::new(state.client_id, handle as i32);
        state.ports.push(LocalPort {
            direction,
            name: name.to_string(),
            local,
            remote: None,
            connected: false,
            released: false,
        });
        Ok((handle, local))
    }

    fn create_external(&mut self, direction: Direction, remote: PortAddr, name: &str) -> Result<PortHandle> {
        let mut state = self.shared.lock();
        let handle = state.ports.len() as PortHandle;
        let local = PortAddr::new(state.client_id, handle as i32);
        state.ports.push(LocalPort {
            direction,
            name: name.to_string(),
            local,
            remote: Some(remote),
            connected: false,
            released: false,
        });
        Ok(handle)
    }

    fn connect(&mut self, handle: PortHandle) -> Result<()> {
        let mut state = self.shared.lock();
        let remote = state.port(handle)?.remote;
        if let Some(remote) = remote {
            if state.refused.contains(&remote) || !state.remotes.iter().any(|r| r.addr == remote) {
                return Err(Error::Backend(format!("subscription to {} refused", remote)));
            }
        }
        state.port_mut(handle)?.connected = true;
        Ok(())
    }

    fn disconnect(&mut self, handle: PortHandle) -> Result<()> {
        let mut state = self.shared.lock();
        state.port_mut(handle)?.connected = false;
        Ok(())
    }

    fn release(&mut self, handle: PortHandle) {
        let mut state = self.shared.lock();
        if let Some(port) = state.ports.get_mut(handle as usize) {
            port.released = true;
            port.connected = false;
        }
    }

    fn send(&mut self, handle: PortHandle, bytes: &[u8], tick: Pulse) -> Result<()> {
        let mut state = self.shared.lock();
        let port = state.port(handle)?;
        if port.direction != Direction::Output {
            return Err(Error::Backend(format!("{} is not an output", port.name)));
        }
        let addr = port.remote.unwrap_or(port.local);
        if state.failing.contains(&addr) {
            return Err(Error::Backend(format!("write to {} failed", addr)));
        }
        if state.output_capacity.is_some_and(|cap| state.sent.len() >= cap) {
            state.output_overflows += 1;
            debug!("Memory MIDI output full, message to {} dropped", addr);
            return Ok(());
        }
        state.sent.push(SentMessage {
            handle,
            addr,
            tick,
            bytes: bytes.to_vec(),
        });
        if state.loopback {
            let port = state.first_virtual_input();
            state.inbound.push_back(Inbound::Midi {
                tick,
                port,
                bytes: bytes.to_vec(),
            });
            self.signal.notify();
        }
        Ok(())
    }

    fn sysex_chunk_size(&self) -> Option<usize> {
        self.sysex_chunk_size
    }

    fn output_overflows(&self) -> u64 {
        self.shared.lock().output_overflows
    }

    fn flush(&mut self) -> Result<()> {
        self.shared.lock().flushes += 1;
        Ok(())
    }

    fn waiter(&self) -> Arc<dyn InputWaiter> {
        self.waiter.clone()
    }

    fn refresh_poll_set(&mut self) -> Result<()> {
        self.shared.lock().poll_refreshes += 1;
        Ok(())
    }

    fn pending(&mut self) -> bool {
        !self.shared.lock().inbound.is_empty()
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<Packet>> {
        let mut state = self.shared.lock();
        let Some(item) = state.inbound.pop_front() else {
            return Ok(None);
        };
        self.signal.consume();
        match item {
            Inbound::Announce(packet) => Ok(Some(packet)),
            Inbound::Midi { tick, port, bytes } => {
                let len = bytes.len().min(buf.len());
                buf[..len].copy_from_slice(&bytes[..len]);
                if len < bytes.len() {
                    // the rest arrives as the next packet
                    state.inbound.push_front(Inbound::Midi {
                        tick,
                        port,
                        bytes: bytes[len..].to_vec(),
                    });
                    self.signal.notify();
                }
                Ok(Some(Packet::Midi { tick, port, len }))
            }
        }
    }

    fn set_queue_tempo(&mut self, ppqn: u32, tempo_us: u32) -> Result<()> {
        self.shared.lock().tempo = QueueTempo { ppqn, tempo_us };
        Ok(())
    }

    fn queue_tempo(&self) -> Result<QueueTempo> {
        Ok(self.shared.lock().tempo)
    }

    fn start_queue(&mut self) -> Result<()> {
        let mut state = self.shared.lock();
        state.running = true;
        state.start_tick = 0;
        Ok(())
    }

    fn continue_queue(&mut self, tick: Pulse) -> Result<()> {
        let mut state = self.shared.lock();
        state.running = true;
        state.start_tick = tick;
        Ok(())
    }

    fn stop_queue(&mut self) -> Result<()> {
        self.shared.lock().running = false;
        Ok(())
    }

    fn subscribe_announce(&mut self) -> Result<()> {
        self.shared.lock().announce = true;
        Ok(())
    }

    fn set_buffer_sizes(&mut self, input: usize, output: usize) -> Result<()> {
        self.shared.lock().buffer_sizes = Some((input, output));
        Ok(())
    }
}

/// Control side of a [`MemoryBackend`].
#[derive(Clone)]
pub struct MemoryHandle {
    shared: Arc<Mutex<MemoryState>>,
    signal: InputSignal,
}

impl MemoryHandle {
    pub fn add_remote(&self, port: RemotePort) {
        let mut state = self.shared.lock();
        state.remotes.retain(|r| r.addr != port.addr);
        state.remotes.push(port);
    }

    /// Adds a device port with full read and write capabilities.
    pub fn add_device(&self, addr: PortAddr, client_name: &str, port_name: &str) {
        self.add_remote(RemotePort {
            addr,
            client_name: client_name.to_string(),
            port_name: port_name.to_string(),
            caps: PortCaps::FULL_READ | PortCaps::FULL_WRITE,
        });
    }

    pub fn remove_remote(&self, addr: PortAddr) {
        self.shared.lock().remotes.retain(|r| r.addr != addr);
    }

    /// Adds the port and announces it.
    pub fn plug(&self, port: RemotePort) {
        let addr = port.addr;
        self.add_remote(port);
        self.announce(Packet::PortStart(addr));
    }

    /// Removes the port and announces its exit.
    pub fn unplug(&self, addr: PortAddr) {
        self.remove_remote(addr);
        self.announce(Packet::PortExit(addr));
    }

    pub fn announce(&self, packet: Packet) {
        self.shared.lock().inbound.push_back(Inbound::Announce(packet));
        self.signal.notify();
    }

    /// Queues inbound MIDI bytes as one packet.
    pub fn inject(&self, bytes: &[u8], tick: Pulse) {
        self.inject_on(None, bytes, tick);
    }

    pub fn inject_on(&self, port: Option<PortHandle>, bytes: &[u8], tick: Pulse) {
        self.shared.lock().inbound.push_back(Inbound::Midi {
            tick,
            port,
            bytes: bytes.to_vec(),
        });
        self.signal.notify();
    }

    /// Local handle subscribed to (or named after) `addr`.
    pub fn handle_for(&self, addr: PortAddr) -> Option<PortHandle> {
        self.shared
            .lock()
            .ports
            .iter()
            .position(|p| !p.released && (p.remote == Some(addr) || p.local == addr))
            .map(|i| i as PortHandle)
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.shared.lock().sent.clone()
    }

    pub fn take_sent(&self) -> Vec<SentMessage> {
        std::mem::take(&mut self.shared.lock().sent)
    }

    pub fn set_loopback(&self, enabled: bool) {
        self.shared.lock().loopback = enabled;
    }

    pub fn refuse_subscription(&self, addr: PortAddr) {
        self.shared.lock().refused.insert(addr);
    }

    pub fn allow_subscription(&self, addr: PortAddr) {
        self.shared.lock().refused.remove(&addr);
    }

    /// Bounds the recorded sends; `None` removes the bound.
    pub fn set_output_capacity(&self, capacity: Option<usize>) {
        self.shared.lock().output_capacity = capacity;
    }

    pub fn fail_sends_to(&self, addr: PortAddr) {
        self.shared.lock().failing.insert(addr);
    }

    pub fn fail_open(&self) {
        self.shared.lock().fail_open = true;
    }

    pub fn is_open(&self) -> bool {
        self.shared.lock().open
    }

    pub fn client_name(&self) -> String {
        self.shared.lock().client_name.clone()
    }

    pub fn is_connected(&self, remote: PortAddr) -> bool {
        self.shared
            .lock()
            .ports
            .iter()
            .any(|p| !p.released && p.connected && p.remote == Some(remote))
    }

    pub fn live_ports(&self) -> usize {
        self.shared.lock().ports.iter().filter(|p| !p.released).count()
    }

    /// Names of live local ports in registration order.
    pub fn port_names(&self) -> Vec<String> {
        self.shared
            .lock()
            .ports
            .iter()
            .filter(|p| !p.released)
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn queue_tempo(&self) -> QueueTempo {
        self.shared.lock().tempo
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    pub fn start_tick(&self) -> Pulse {
        self.shared.lock().start_tick
    }

    pub fn announce_subscribed(&self) -> bool {
        self.shared.lock().announce
    }

    pub fn buffer_sizes(&self) -> Option<(usize, usize)> {
        self.shared.lock().buffer_sizes
    }

    pub fn poll_refreshes(&self) -> usize {
        self.shared.lock().poll_refreshes
    }

    pub fn flushes(&self) -> usize {
        self.shared.lock().flushes
    }
}
