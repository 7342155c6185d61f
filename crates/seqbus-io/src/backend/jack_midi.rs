//! JACK MIDI back-end.
//!
//! JACK has no sequencer queue. The process callback plays the queue's
//! role: outbound messages wait in a per-port byte ring until their tick
//! falls inside the current cycle, inbound messages are stamped with the
//! tick of their frame. The callback never allocates, locks or logs.
//!
//! Ring framing, little endian:
//! - output: `tick: i64, len: u16, bytes`
//! - input:  `tick: i64, handle: u32, len: u16, bytes`

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use jack::{
    AsyncClient, Client, ClientOptions, Control, MidiIn, MidiOut, NotificationHandler, Port,
    PortFlags, PortId, ProcessHandler, ProcessScope, RawMidi,
};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};
use seqbus_midi::Pulse;
use tracing::{debug, info, warn};

use super::{BackendDriver, InputSignal, InputWaiter, Packet, PortHandle, QueueTempo, SignalWaiter};
use crate::config::{BackendKind, BusConfig};
use crate::error::{Error, Result};
use crate::port::{Direction, PortAddr, PortCaps, RemotePort};
use crate::tempo::{frames_to_ticks, tempo_us_from_bpm, ticks_to_frames, DEFAULT_BPM, DEFAULT_PPQN};

/// Ports the process callback can hold; slots are preallocated.
pub const MAX_PORTS: usize = 256;
const COMMAND_CAPACITY: usize = 64;
const OUTPUT_HEADER: usize = 10;
const INPUT_HEADER: usize = 14;
const MAX_MESSAGE: usize = u16::MAX as usize;
const MIDI_TYPE_PATTERN: &str = "midi";

// ====== Shared state ======

/// Transport state written by the driver and read by the process callback.
struct Transport {
    running: AtomicBool,
    ppqn: AtomicU32,
    tempo_us: AtomicU32,
    /// Set by start/continue: the next cycle starts at `rebase_tick`.
    rebase: AtomicBool,
    rebase_tick: AtomicI64,
    input_overflows: AtomicU64,
    output_overflows: AtomicU64,
}

impl Transport {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            ppqn: AtomicU32::new(DEFAULT_PPQN),
            tempo_us: AtomicU32::new(tempo_us_from_bpm(DEFAULT_BPM)),
            rebase: AtomicBool::new(false),
            rebase_tick: AtomicI64::new(0),
            input_overflows: AtomicU64::new(0),
            output_overflows: AtomicU64::new(0),
        }
    }
}

/// JACK names ports by string; buses address them as (client, port).
/// Ids are handed out in order of first sight, starting at 1.
#[derive(Default)]
struct NameTable {
    clients: HashMap<String, i32>,
    next_port: HashMap<i32, i32>,
    addrs: HashMap<String, PortAddr>,
    names: HashMap<PortAddr, String>,
}

impl NameTable {
    fn client_id(&mut self, client: &str) -> i32 {
        let next = self.clients.len() as i32 + 1;
        *self.clients.entry(client.to_string()).or_insert(next)
    }

    fn intern(&mut self, full_name: &str) -> PortAddr {
        if let Some(addr) = self.addrs.get(full_name) {
            return *addr;
        }
        let (client_name, _) = split_port_name(full_name);
        let client = self.client_id(client_name);
        let next = self.next_port.entry(client).or_insert(0);
        let addr = PortAddr::new(client, *next);
        *next += 1;
        self.addrs.insert(full_name.to_string(), addr);
        self.names.insert(addr, full_name.to_string());
        addr
    }

    fn name_of(&self, addr: PortAddr) -> Option<&str> {
        self.names.get(&addr).map(String::as_str)
    }
}

fn split_port_name(full_name: &str) -> (&str, &str) {
    full_name.split_once(':').unwrap_or(("", full_name))
}

fn caps_from_flags(flags: PortFlags) -> PortCaps {
    let mut caps = PortCaps::empty();
    if flags.contains(PortFlags::IS_OUTPUT) {
        caps |= PortCaps::FULL_READ;
    }
    if flags.contains(PortFlags::IS_INPUT) {
        caps |= PortCaps::FULL_WRITE;
    }
    caps
}

/// Hands out port handles below [`MAX_PORTS`], reusing released ones.
///
/// A handle is freed only after its `Remove` command is queued; commands
/// are applied in order, so the callback drops the old port before it sees
/// the new one.
#[derive(Default)]
struct HandleAllocator {
    next: usize,
    free: Vec<PortHandle>,
}

impl HandleAllocator {
    fn allocate(&mut self) -> Option<PortHandle> {
        if let Some(handle) = self.free.pop() {
            return Some(handle);
        }
        if self.next >= MAX_PORTS {
            return None;
        }
        self.next += 1;
        Some((self.next - 1) as PortHandle)
    }

    fn free(&mut self, handle: PortHandle) {
        debug_assert!(!self.free.contains(&handle));
        self.free.push(handle);
    }
}

/// Frames one outbound message into `ring`. Returns `false`, leaving the
/// ring untouched, when it does not fit.
fn push_output(ring: &mut HeapProd<u8>, tick: Pulse, bytes: &[u8]) -> bool {
    if ring.vacant_len() < OUTPUT_HEADER + bytes.len() {
        return false;
    }
    let mut header = [0u8; OUTPUT_HEADER];
    header[..8].copy_from_slice(&tick.to_le_bytes());
    header[8..].copy_from_slice(&(bytes.len() as u16).to_le_bytes());
    ring.push_slice(&header);
    ring.push_slice(bytes);
    true
}

// ====== Process callback ======

enum Command {
    AddOutput(PortHandle, Port<MidiOut>, HeapCons<u8>),
    AddInput(PortHandle, Port<MidiIn>),
    Remove(PortHandle),
}

enum Retired {
    Output(Port<MidiOut>),
    Input(Port<MidiIn>),
}

struct OutputSlot {
    port: Port<MidiOut>,
    ring: HeapCons<u8>,
    /// Header already read, body not yet due.
    pending: Option<(Pulse, usize)>,
}

enum Slot {
    Output(OutputSlot),
    Input(Port<MidiIn>),
}

#[derive(Clone, Copy)]
struct Timebase {
    origin_tick: Pulse,
    origin_frame: u64,
    ppqn: u32,
    tempo_us: u32,
    sample_rate: u32,
}

impl Timebase {
    fn tick_at(self, frame: u64) -> Pulse {
        let elapsed = frame.saturating_sub(self.origin_frame) as i64;
        self.origin_tick + frames_to_ticks(elapsed, self.tempo_us, self.ppqn, self.sample_rate)
    }

    fn frame_of(self, tick: Pulse) -> u64 {
        let offset = ticks_to_frames(tick - self.origin_tick, self.tempo_us, self.ppqn, self.sample_rate);
        (self.origin_frame as i64 + offset).max(0) as u64
    }
}

struct Processor {
    transport: Arc<Transport>,
    commands: HeapCons<Command>,
    retired: HeapProd<Retired>,
    input: HeapProd<u8>,
    signal: InputSignal,
    slots: Vec<Option<Slot>>,
    scratch: Vec<u8>,
    sample_rate: u32,
    frames: u64,
    origin_frame: u64,
    origin_tick: Pulse,
    ppqn: u32,
    tempo_us: u32,
}

impl Processor {
    fn apply_commands(&mut self) {
        while let Some(command) = self.commands.try_pop() {
            match command {
                Command::AddOutput(handle, port, ring) => {
                    self.slots[handle as usize] = Some(Slot::Output(OutputSlot {
                        port,
                        ring,
                        pending: None,
                    }));
                }
                Command::AddInput(handle, port) => {
                    self.slots[handle as usize] = Some(Slot::Input(port));
                }
                Command::Remove(handle) => {
                    let retired = match self.slots[handle as usize].take() {
                        Some(Slot::Output(slot)) => Retired::Output(slot.port),
                        Some(Slot::Input(port)) => Retired::Input(port),
                        None => continue,
                    };
                    let _ = self.retired.try_push(retired);
                }
            }
        }
    }

    /// Keeps tick and frame origins consistent across tempo changes.
    fn update_timebase(&mut self) {
        let ppqn = self.transport.ppqn.load(Ordering::Acquire).max(1);
        let tempo_us = self.transport.tempo_us.load(Ordering::Acquire).max(1);
        if self.transport.rebase.swap(false, Ordering::AcqRel) {
            self.origin_tick = self.transport.rebase_tick.load(Ordering::Acquire);
            self.origin_frame = self.frames;
        } else if ppqn != self.ppqn || tempo_us != self.tempo_us {
            self.origin_tick = self.tick_at(self.frames);
            self.origin_frame = self.frames;
        }
        self.ppqn = ppqn;
        self.tempo_us = tempo_us;
    }

    fn timebase(&self) -> Timebase {
        Timebase {
            origin_tick: self.origin_tick,
            origin_frame: self.origin_frame,
            ppqn: self.ppqn,
            tempo_us: self.tempo_us,
            sample_rate: self.sample_rate,
        }
    }

    fn tick_at(&self, frame: u64) -> Pulse {
        self.timebase().tick_at(frame)
    }

    fn read_inputs(&mut self, ps: &ProcessScope, running: bool) {
        let cycle_start = self.frames;
        for (handle, slot) in self.slots.iter().enumerate() {
            let Some(Slot::Input(port)) = slot else {
                continue;
            };
            for raw in port.iter(ps) {
                let total = INPUT_HEADER + raw.bytes.len();
                if raw.bytes.len() > MAX_MESSAGE || self.input.vacant_len() < total {
                    self.transport.input_overflows.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                let tick = if running {
                    self.tick_at(cycle_start + u64::from(raw.time))
                } else {
                    0
                };
                let mut header = [0u8; INPUT_HEADER];
                header[..8].copy_from_slice(&tick.to_le_bytes());
                header[8..12].copy_from_slice(&(handle as u32).to_le_bytes());
                header[12..].copy_from_slice(&(raw.bytes.len() as u16).to_le_bytes());
                self.input.push_slice(&header);
                self.input.push_slice(raw.bytes);
                self.signal.notify();
            }
        }
    }

    fn write_outputs(&mut self, ps: &ProcessScope, running: bool) {
        let n_frames = ps.n_frames();
        let cycle_start = self.frames;
        let cycle_end = cycle_start + u64::from(n_frames);
        let timebase = self.timebase();
        for index in 0..self.slots.len() {
            let Some(Slot::Output(slot)) = self.slots[index].as_mut() else {
                continue;
            };
            let mut writer = slot.port.writer(ps);
            let mut last_offset = 0u32;
            loop {
                if slot.pending.is_none() {
                    if slot.ring.occupied_len() < OUTPUT_HEADER {
                        break;
                    }
                    let mut header = [0u8; OUTPUT_HEADER];
                    slot.ring.pop_slice(&mut header);
                    let mut tick = [0u8; 8];
                    tick.copy_from_slice(&header[..8]);
                    let len = u16::from_le_bytes([header[8], header[9]]) as usize;
                    slot.pending = Some((Pulse::from_le_bytes(tick), len));
                }
                let Some((tick, len)) = slot.pending else {
                    break;
                };
                if slot.ring.occupied_len() < len {
                    break;
                }
                let offset = if running {
                    let due = timebase.frame_of(tick);
                    if due >= cycle_end {
                        break;
                    }
                    due.saturating_sub(cycle_start) as u32
                } else {
                    0
                };
                last_offset = offset.max(last_offset).min(n_frames.saturating_sub(1));
                let body = &mut self.scratch[..len];
                slot.ring.pop_slice(body);
                let _ = writer.write(&RawMidi {
                    time: last_offset,
                    bytes: body,
                });
                slot.pending = None;
            }
        }
    }
}

impl ProcessHandler for Processor {
    fn process(&mut self, _client: &Client, ps: &ProcessScope) -> Control {
        self.apply_commands();
        self.update_timebase();
        let running = self.transport.running.load(Ordering::Acquire);
        self.read_inputs(ps, running);
        self.write_outputs(ps, running);
        self.frames += u64::from(ps.n_frames());
        Control::Continue
    }
}

// ====== Notifications ======

struct Notifier {
    names: Arc<Mutex<NameTable>>,
    announce: Arc<AtomicBool>,
    tx: Sender<Packet>,
    signal: InputSignal,
    known: HashMap<PortId, PortAddr>,
}

impl Notifier {
    fn publish(&self, packet: Packet) {
        if self.announce.load(Ordering::Acquire) && self.tx.send(packet).is_ok() {
            self.signal.notify();
        }
    }
}

impl NotificationHandler for Notifier {
    unsafe fn shutdown(&mut self, status: jack::ClientStatus, reason: &str) {
        warn!("JACK server shut the client down: {:?} - {}", status, reason);
    }

    fn port_registration(&mut self, client: &Client, port_id: PortId, is_registered: bool) {
        if is_registered {
            let Some(name) = client.port_by_id(port_id).and_then(|p| p.name().ok()) else {
                return;
            };
            let addr = self.names.lock().intern(&name);
            self.known.insert(port_id, addr);
            self.publish(Packet::PortStart(addr));
        } else if let Some(addr) = self.known.remove(&port_id) {
            self.publish(Packet::PortExit(addr));
        }
    }

    fn port_rename(&mut self, _client: &Client, port_id: PortId, _old_name: &str, new_name: &str) -> Control {
        let addr = self.names.lock().intern(new_name);
        self.known.insert(port_id, addr);
        self.publish(Packet::PortChange(addr));
        Control::Continue
    }
}

// ====== Driver ======

struct JackPort {
    direction: Direction,
    local_name: String,
    remote: Option<PortAddr>,
    ring: Option<HeapProd<u8>>,
    connected: bool,
}

struct Active {
    client: AsyncClient<Notifier, Processor>,
    commands: HeapProd<Command>,
    retired: HeapCons<Retired>,
    input: HeapCons<u8>,
}

pub struct JackDriver {
    active: Option<Active>,
    transport: Arc<Transport>,
    names: Arc<Mutex<NameTable>>,
    announce: Arc<AtomicBool>,
    announce_tx: Sender<Packet>,
    announcements: Receiver<Packet>,
    signal: InputSignal,
    waiter: Arc<SignalWaiter>,
    ports: Vec<Option<JackPort>>,
    handles: HandleAllocator,
    /// Suffix that keeps external port names unique.
    registrations: u64,
    /// Header of the inbound message being read: (tick, handle, bytes left).
    input_pending: Option<(Pulse, PortHandle, usize)>,
    reported_input_overflows: u64,
    reported_output_overflows: u64,
    client_id: i32,
    input_buffer_size: usize,
    output_buffer_size: usize,
}

impl JackDriver {
    pub fn new(config: &BusConfig) -> Self {
        let (signal, waiter) = InputSignal::new();
        let (announce_tx, announcements) = unbounded();
        Self {
            active: None,
            transport: Arc::new(Transport::new()),
            names: Arc::new(Mutex::new(NameTable::default())),
            announce: Arc::new(AtomicBool::new(false)),
            announce_tx,
            announcements,
            signal,
            waiter: Arc::new(waiter),
            ports: Vec::new(),
            handles: HandleAllocator::default(),
            registrations: 0,
            input_pending: None,
            reported_input_overflows: 0,
            reported_output_overflows: 0,
            client_id: -1,
            input_buffer_size: config.input_buffer_size,
            output_buffer_size: config.output_buffer_size,
        }
    }

    fn active(&self) -> Result<&Active> {
        self.active
            .as_ref()
            .ok_or_else(|| Error::Backend("JACK client is not active".into()))
    }

    fn client(&self) -> Result<&Client> {
        Ok(self.active()?.client.as_client())
    }

    fn port(&self, handle: PortHandle) -> Result<&JackPort> {
        self.ports
            .get(handle as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::Backend(format!("unknown JACK port handle {}", handle)))
    }

    /// Per-port share of the output buffer.
    fn output_ring_size(&self) -> usize {
        (self.output_buffer_size / 16).max(OUTPUT_HEADER + MAX_MESSAGE)
    }

    fn register(&mut self, direction: Direction, name: &str, remote: Option<PortAddr>) -> Result<(PortHandle, String)> {
        let handle = self
            .handles
            .allocate()
            .ok_or_else(|| Error::Backend(format!("more than {} JACK ports", MAX_PORTS)))?;
        match self.register_at(handle, direction, name, remote) {
            Ok(local_name) => Ok((handle, local_name)),
            Err(e) => {
                self.handles.free(handle);
                Err(e)
            }
        }
    }

    fn register_at(&mut self, handle: PortHandle, direction: Direction, name: &str, remote: Option<PortAddr>) -> Result<String> {
        let ring_size = self.output_ring_size();
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| Error::Backend("JACK client is not active".into()))?;
        let client = active.client.as_client();

        let (command, local_name, ring) = match direction {
            Direction::Output => {
                let port = client.register_port(name, MidiOut::default())?;
                let local_name = port.name()?;
                let (producer, consumer) = HeapRb::<u8>::new(ring_size).split();
                (Command::AddOutput(handle, port, consumer), local_name, Some(producer))
            }
            Direction::Input => {
                let port = client.register_port(name, MidiIn::default())?;
                let local_name = port.name()?;
                (Command::AddInput(handle, port), local_name, None)
            }
        };
        if active.commands.try_push(command).is_err() {
            return Err(Error::Backend("JACK command queue full".into()));
        }

        let index = handle as usize;
        if self.ports.len() <= index {
            self.ports.resize_with(index + 1, || None);
        }
        self.ports[index] = Some(JackPort {
            direction,
            local_name: local_name.clone(),
            remote,
            ring,
            connected: false,
        });
        debug!("Registered JACK port '{}' as handle {}", local_name, handle);
        Ok(local_name)
    }

    /// Source and destination names for a subscription of `port`.
    fn endpoints(&self, port: &JackPort) -> Option<(String, String)> {
        let remote = self.names.lock().name_of(port.remote?)?.to_string();
        let local = port.local_name.clone();
        Some(match port.direction {
            Direction::Output => (local, remote),
            Direction::Input => (remote, local),
        })
    }

    fn collect_retired(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        while let Some(retired) = active.retired.try_pop() {
            let client = active.client.as_client();
            let result = match retired {
                Retired::Output(port) => client.unregister_port(port),
                Retired::Input(port) => client.unregister_port(port),
            };
            if let Err(e) = result {
                debug!("Unregistering JACK port: {}", e);
            }
        }
    }

    fn report_overflows(&mut self) {
        let input = self.transport.input_overflows.load(Ordering::Relaxed);
        if input > self.reported_input_overflows {
            warn!(
                "JACK MIDI input ring full, {} messages dropped",
                input - self.reported_input_overflows
            );
            self.reported_input_overflows = input;
        }
        let output = self.transport.output_overflows.load(Ordering::Relaxed);
        if output > self.reported_output_overflows {
            warn!(
                "JACK MIDI output ring full, {} messages dropped",
                output - self.reported_output_overflows
            );
            self.reported_output_overflows = output;
        }
    }

    fn input_ready(&self) -> bool {
        let Some(active) = self.active.as_ref() else {
            return false;
        };
        match self.input_pending {
            Some(_) => !active.input.is_empty(),
            None => active.input.occupied_len() >= INPUT_HEADER,
        }
    }

    fn read_input(&mut self, buf: &mut [u8]) -> Option<Packet> {
        let active = self.active.as_mut()?;
        if self.input_pending.is_none() {
            if active.input.occupied_len() < INPUT_HEADER {
                return None;
            }
            let mut header = [0u8; INPUT_HEADER];
            active.input.pop_slice(&mut header);
            let mut tick = [0u8; 8];
            tick.copy_from_slice(&header[..8]);
            let handle = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
            let len = u16::from_le_bytes([header[12], header[13]]) as usize;
            self.input_pending = Some((Pulse::from_le_bytes(tick), handle, len));
        }
        let (tick, handle, left) = self.input_pending?;
        let take = left.min(buf.len()).min(active.input.occupied_len());
        if take == 0 && left > 0 {
            return None;
        }
        active.input.pop_slice(&mut buf[..take]);

        // Messages larger than `buf` arrive as several packets.
        if left == take {
            self.input_pending = None;
            self.signal.consume();
        } else {
            self.input_pending = Some((tick, handle, left - take));
        }
        Some(Packet::Midi {
            tick,
            port: Some(handle),
            len: take,
        })
    }
}

impl BackendDriver for JackDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Jack
    }

    fn open(&mut self, client_name: &str) -> Result<()> {
        let (client, status) = Client::new(client_name, ClientOptions::NO_START_SERVER)
            .map_err(|e| Error::FatalInit(format!("cannot connect to JACK: {}", e)))?;
        debug!("JACK client status: {:?}", status);
        self.client_id = self.names.lock().client_id(client.name());
        let sample_rate = client.sample_rate() as u32;

        let (commands, command_rx) = HeapRb::<Command>::new(COMMAND_CAPACITY).split();
        let (retired_tx, retired) = HeapRb::<Retired>::new(MAX_PORTS).split();
        let (input_tx, input) = HeapRb::<u8>::new(self.input_buffer_size.max(INPUT_HEADER + MAX_MESSAGE)).split();

        let processor = Processor {
            transport: Arc::clone(&self.transport),
            commands: command_rx,
            retired: retired_tx,
            input: input_tx,
            signal: self.signal.clone(),
            slots: (0..MAX_PORTS).map(|_| None).collect(),
            scratch: vec![0; MAX_MESSAGE],
            sample_rate,
            frames: 0,
            origin_frame: 0,
            origin_tick: 0,
            ppqn: self.transport.ppqn.load(Ordering::Acquire),
            tempo_us: self.transport.tempo_us.load(Ordering::Acquire),
        };
        let notifier = Notifier {
            names: Arc::clone(&self.names),
            announce: Arc::clone(&self.announce),
            tx: self.announce_tx.clone(),
            signal: self.signal.clone(),
            known: HashMap::new(),
        };
        let name = client.name().to_string();
        let client = client
            .activate_async(notifier, processor)
            .map_err(|e| Error::FatalInit(format!("cannot activate JACK client: {}", e)))?;

        self.active = Some(Active {
            client,
            commands,
            retired,
            input,
        });
        info!("JACK client '{}' active at {} Hz", name, sample_rate);
        Ok(())
    }

    fn close(&mut self) {
        self.transport.running.store(false, Ordering::Release);
        let Some(active) = self.active.take() else {
            return;
        };
        if let Err(e) = active.client.deactivate() {
            warn!("Deactivating JACK client: {}", e);
        }
        self.ports.clear();
        self.handles = HandleAllocator::default();
        self.input_pending = None;
        self.signal.reset();
    }

    fn client_id(&self) -> i32 {
        self.client_id
    }

    fn enumerate(&self) -> Result<Vec<RemotePort>> {
        let client = self.client()?;
        let mut names = self.names.lock();
        let mut ports = Vec::new();
        for full_name in client.ports(None, Some(MIDI_TYPE_PATTERN), PortFlags::empty()) {
            let Some(port) = client.port_by_name(&full_name) else {
                continue;
            };
            let (client_name, port_name) = split_port_name(&full_name);
            ports.push(RemotePort {
                addr: names.intern(&full_name),
                client_name: client_name.to_string(),
                port_name: port_name.to_string(),
                caps: caps_from_flags(port.flags()),
            });
        }
        Ok(ports)
    }

    fn port_info(&self, addr: PortAddr) -> Option<RemotePort> {
        let client = self.client().ok()?;
        let full_name = self.names.lock().name_of(addr)?.to_string();
        let port = client.port_by_name(&full_name)?;
        let (client_name, port_name) = split_port_name(&full_name);
        Some(RemotePort {
            addr,
            client_name: client_name.to_string(),
            port_name: port_name.to_string(),
            caps: caps_from_flags(port.flags()),
        })
    }

    fn create_virtual(&mut self, direction: Direction, name: &str) -> Result<(PortHandle, PortAddr)> {
        let (handle, local_name) = self.register(direction, name, None)?;
        let addr = self.names.lock().intern(&local_name);
        Ok((handle, addr))
    }

    fn create_external(&mut self, direction: Direction, remote: PortAddr, name: &str) -> Result<PortHandle> {
        // local names must be unique within the client
        self.registrations += 1;
        let name = format!("{} {}", name, self.registrations);
        let (handle, _) = self.register(direction, &name, Some(remote))?;
        Ok(handle)
    }

    fn connect(&mut self, handle: PortHandle) -> Result<()> {
        let port = self.port(handle)?;
        if port.remote.is_none() {
            return Ok(());
        }
        let (source, destination) = self
            .endpoints(port)
            .ok_or_else(|| Error::Backend(format!("JACK port handle {} has no known peer", handle)))?;
        self.client()?.connect_ports_by_name(&source, &destination)?;
        if let Some(Some(port)) = self.ports.get_mut(handle as usize) {
            port.connected = true;
        }
        Ok(())
    }

    fn disconnect(&mut self, handle: PortHandle) -> Result<()> {
        let port = self.port(handle)?;
        if !port.connected {
            return Ok(());
        }
        if let Some((source, destination)) = self.endpoints(port) {
            self.client()?.disconnect_ports_by_name(&source, &destination)?;
        }
        if let Some(Some(port)) = self.ports.get_mut(handle as usize) {
            port.connected = false;
        }
        Ok(())
    }

    fn release(&mut self, handle: PortHandle) {
        if let Err(e) = self.disconnect(handle) {
            debug!("Disconnecting JACK port handle {}: {}", handle, e);
        }
        if self.ports.get_mut(handle as usize).and_then(Option::take).is_none() {
            return;
        }
        if let Some(active) = self.active.as_mut() {
            if active.commands.try_push(Command::Remove(handle)).is_err() {
                warn!("JACK command queue full; port handle {} stays registered", handle);
            } else {
                self.handles.free(handle);
            }
        }
        self.collect_retired();
    }

    fn send(&mut self, handle: PortHandle, bytes: &[u8], tick: Pulse) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        if bytes.len() > MAX_MESSAGE {
            return Err(Error::Backend(format!("{} byte message exceeds JACK limit", bytes.len())));
        }
        let ring = self
            .ports
            .get_mut(handle as usize)
            .and_then(Option::as_mut)
            .and_then(|p| p.ring.as_mut())
            .ok_or_else(|| Error::Backend(format!("JACK port handle {} is not an output", handle)))?;

        if !push_output(ring, tick, bytes) {
            self.transport.output_overflows.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn sysex_chunk_size(&self) -> Option<usize> {
        None
    }

    fn flush(&mut self) -> Result<()> {
        self.active()?;
        self.collect_retired();
        self.report_overflows();
        Ok(())
    }

    fn output_overflows(&self) -> u64 {
        self.transport.output_overflows.load(Ordering::Relaxed)
    }

    fn input_overflows(&self) -> u64 {
        self.transport.input_overflows.load(Ordering::Relaxed)
    }

    fn waiter(&self) -> Arc<dyn InputWaiter> {
        self.waiter.clone()
    }

    fn pending(&mut self) -> bool {
        self.report_overflows();
        !self.announcements.is_empty() || self.input_ready()
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<Packet>> {
        self.active()?;
        if let Ok(packet) = self.announcements.try_recv() {
            self.signal.consume();
            return Ok(Some(packet));
        }
        Ok(self.read_input(buf))
    }

    fn set_queue_tempo(&mut self, ppqn: u32, tempo_us: u32) -> Result<()> {
        self.transport.ppqn.store(ppqn, Ordering::Release);
        self.transport.tempo_us.store(tempo_us, Ordering::Release);
        Ok(())
    }

    fn queue_tempo(&self) -> Result<QueueTempo> {
        Ok(QueueTempo {
            ppqn: self.transport.ppqn.load(Ordering::Acquire),
            tempo_us: self.transport.tempo_us.load(Ordering::Acquire),
        })
    }

    fn start_queue(&mut self) -> Result<()> {
        self.continue_queue(0)
    }

    fn continue_queue(&mut self, tick: Pulse) -> Result<()> {
        self.active()?;
        self.transport.rebase_tick.store(tick, Ordering::Release);
        self.transport.rebase.store(true, Ordering::Release);
        self.transport.running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop_queue(&mut self) -> Result<()> {
        self.transport.running.store(false, Ordering::Release);
        Ok(())
    }

    fn subscribe_announce(&mut self) -> Result<()> {
        self.active()?;
        self.announce.store(true, Ordering::Release);
        Ok(())
    }

    /// Sizes apply to rings created from now on.
    fn set_buffer_sizes(&mut self, input: usize, output: usize) -> Result<()> {
        self.input_buffer_size = input;
        self.output_buffer_size = output;
        Ok(())
    }
}

impl Drop for JackDriver {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_table_interns_in_order() {
        let mut names = NameTable::default();
        assert_eq!(names.client_id("seqbus"), 1);
        let synth_in = names.intern("synth:midi_in");
        let synth_out = names.intern("synth:midi_out");
        let keys = names.intern("keys:capture");
        assert_eq!(synth_in, PortAddr::new(2, 0));
        assert_eq!(synth_out, PortAddr::new(2, 1));
        assert_eq!(keys, PortAddr::new(3, 0));
        assert_eq!(names.intern("synth:midi_in"), synth_in);
        assert_eq!(names.name_of(keys), Some("keys:capture"));
    }

    #[test]
    fn test_handles_are_reused_after_release() {
        let mut handles = HandleAllocator::default();
        for expected in 0..MAX_PORTS {
            assert_eq!(handles.allocate(), Some(expected as PortHandle));
        }
        assert_eq!(handles.allocate(), None);

        handles.free(7);
        assert_eq!(handles.allocate(), Some(7));
        assert_eq!(handles.allocate(), None);

        // unplug and replug far more often than there are slots
        for _ in 0..(4 * MAX_PORTS) {
            handles.free(42);
            assert_eq!(handles.allocate(), Some(42));
        }
    }

    #[test]
    fn test_full_output_ring_drops_without_waiting() {
        let (mut ring, mut reader) = HeapRb::<u8>::new(OUTPUT_HEADER + 6).split();
        assert!(push_output(&mut ring, 10, &[0x90, 60, 100]));

        let start = std::time::Instant::now();
        assert!(!push_output(&mut ring, 20, &[0x80, 60, 0]));
        assert!(start.elapsed() < std::time::Duration::from_millis(5));
        assert_eq!(reader.occupied_len(), OUTPUT_HEADER + 3);

        let mut header = [0u8; OUTPUT_HEADER];
        reader.pop_slice(&mut header);
        assert_eq!(&header[..8], &10i64.to_le_bytes());
        assert_eq!(u16::from_le_bytes([header[8], header[9]]), 3);
    }

    #[test]
    fn test_flags_map_to_caps() {
        assert!(caps_from_flags(PortFlags::IS_OUTPUT).is_full_read());
        assert!(caps_from_flags(PortFlags::IS_INPUT).is_full_write());
        assert_eq!(caps_from_flags(PortFlags::empty()), PortCaps::empty());
    }
}
