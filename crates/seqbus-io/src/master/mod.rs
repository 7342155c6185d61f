//! The master MIDI bus.
//!
//! Owns every MIDI port of the process, the transport's tempo queue and the
//! input poll loop. All mutating operations go through one mutex:
//!
//! - output thread: [`MasterBus::play`], [`MasterBus::sysex`], [`MasterBus::clock`], [`MasterBus::flush`]
//! - input thread: [`MasterBus::poll_for_midi`], [`MasterBus::get_midi_event`]
//! - UI thread: transport, tempo and per-bus settings
//!
//! Waiting for input happens outside the lock, so a blocked poll or a SysEx
//! message waiting for its next packet never delays output. One thread
//! reads input at a time.

mod builder;

pub use builder::MasterBusBuilder;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use seqbus_midi::{ByteContainer, Event, Pulse};
use tracing::{debug, error, info, trace, warn};

use crate::backend::{BackendDriver, InputWaiter, Packet, PortHandle, QueueTempo};
use crate::config::{BackendKind, BusConfig};
use crate::decode::{sysex_chunks, DecodeStep, EventDecoder, DECODE_BUFFER_SIZE};
use crate::error::{Error, Result};
use crate::port::{BusArray, ClockMode, Direction, PortAddr, PortEndpoint, PortState, RemotePort};
use crate::tempo::tempo_us_from_bpm;

/// Virtual output ports created in manual port mode.
pub const MANUAL_OUTPUT_BUSES: usize = 16;
/// Virtual input ports created in manual port mode.
pub const MANUAL_INPUT_BUSES: usize = 1;
/// How long an open SysEx message waits for its next packet.
pub const SYSEX_CONTINUATION_WAIT: Duration = Duration::from_millis(100);

pub struct MasterBus {
    inner: Mutex<MasterInner>,
    waiter: Arc<dyn InputWaiter>,
    poll_timeout: Duration,
    shutdown: AtomicBool,
}

struct MasterInner {
    config: BusConfig,
    driver: Box<dyn BackendDriver>,
    outputs: BusArray,
    inputs: BusArray,
    ppqn: u32,
    bpm: f64,
    decoder: EventDecoder,
    initialized: bool,
    closed: bool,
}

impl MasterBus {
    pub fn builder() -> MasterBusBuilder {
        MasterBusBuilder::default()
    }

    pub fn new(config: BusConfig, driver: Box<dyn BackendDriver>) -> Result<Self> {
        config.validate()?;
        let waiter = driver.waiter();
        Ok(Self {
            waiter,
            poll_timeout: config.poll_timeout(),
            shutdown: AtomicBool::new(false),
            inner: Mutex::new(MasterInner {
                ppqn: config.ppqn,
                bpm: config.bpm,
                decoder: EventDecoder::new(config.sysex_enabled, config.max_sysex_size),
                outputs: BusArray::new(Direction::Output),
                inputs: BusArray::new(Direction::Input),
                driver,
                config,
                initialized: false,
                closed: false,
            }),
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Opens the transport, creates the buses and programs the queue.
    ///
    /// Only a transport that cannot be opened is an error; ports that
    /// cannot be registered or subscribed are logged and kept in their
    /// slots.
    pub fn init(&self, ppqn: u32, bpm: f64) -> Result<()> {
        validate_tempo(ppqn, bpm)?;
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::Backend("master bus is closed".into()));
        }
        if inner.initialized {
            warn!("Master MIDI bus already initialized");
            return Ok(());
        }
        inner.init(ppqn, bpm)
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().initialized
    }

    /// Stops the queue, releases every port and closes the transport.
    pub fn close(&self) {
        self.shutdown();
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.close();
    }

    /// Asks the poll loop to exit. It notices within one poll timeout.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn client_id(&self) -> i32 {
        self.inner.lock().driver.client_id()
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.inner.lock().driver.kind()
    }

    /// Current settings, including per-bus changes made at runtime.
    pub fn config(&self) -> BusConfig {
        self.inner.lock().config.clone()
    }

    // =========================================================================
    // Transport
    // =========================================================================

    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.require_init()?;
        let inner = &mut *inner;
        inner.driver.start_queue()?;
        for bus in inner.outputs.iter_mut().filter(|b| b.is_active()) {
            let burst = bus.clock_mut().start();
            bus.send_clock(inner.driver.as_mut(), burst);
        }
        inner.flush();
        debug!("MIDI queue started");
        Ok(())
    }

    /// Drains output, then stops the queue.
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.require_init()?;
        let inner = &mut *inner;
        for bus in inner.outputs.iter_mut().filter(|b| b.is_active()) {
            let burst = bus.clock_mut().stop(0);
            bus.send_clock(inner.driver.as_mut(), burst);
        }
        inner.flush();
        inner.driver.stop_queue()?;
        debug!("MIDI queue stopped");
        Ok(())
    }

    /// Resumes playback at `tick`; clocked buses get a Song Position
    /// Pointer and Continue.
    pub fn continue_from(&self, tick: Pulse) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.require_init()?;
        let inner = &mut *inner;
        inner.driver.continue_queue(tick)?;
        let ppqn = inner.ppqn;
        for bus in inner.outputs.iter_mut().filter(|b| b.is_active()) {
            let burst = bus.clock_mut().continue_from(tick, ppqn);
            bus.send_clock(inner.driver.as_mut(), burst);
        }
        inner.flush();
        debug!("MIDI queue continued from tick {}", tick);
        Ok(())
    }

    /// Prepares clock output on every bus for playback from `tick`.
    pub fn init_clock(&self, tick: Pulse) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let (ppqn, clock_mod) = (inner.ppqn, inner.config.clock_mod);
        for bus in inner.outputs.iter_mut().filter(|b| b.is_active()) {
            let burst = bus.clock_mut().init(tick, ppqn, clock_mod);
            bus.send_clock(inner.driver.as_mut(), burst);
        }
    }

    /// Emits MIDI clock on clocked buses up to `tick`.
    pub fn clock(&self, tick: Pulse) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let ppqn = inner.ppqn;
        for bus in inner.outputs.iter_mut().filter(|b| b.is_active()) {
            if bus.clock_mode().is_on() {
                let burst = bus.clock_mut().clock(tick, ppqn);
                bus.send_clock(inner.driver.as_mut(), burst);
            }
        }
    }

    // =========================================================================
    // Tempo
    // =========================================================================

    pub fn set_ppqn(&self, ppqn: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        validate_tempo(ppqn, inner.bpm)?;
        inner.ppqn = ppqn;
        inner.config.ppqn = ppqn;
        inner.program_tempo()
    }

    pub fn set_beats_per_minute(&self, bpm: f64) -> Result<()> {
        let mut inner = self.inner.lock();
        validate_tempo(inner.ppqn, bpm)?;
        inner.bpm = bpm;
        inner.config.bpm = bpm;
        inner.program_tempo()
    }

    pub fn ppqn(&self) -> u32 {
        self.inner.lock().ppqn
    }

    pub fn beats_per_minute(&self) -> f64 {
        self.inner.lock().bpm
    }

    /// Tempo as the transport's queue reports it.
    pub fn queue_tempo(&self) -> Result<QueueTempo> {
        self.inner.lock().driver.queue_tempo()
    }

    // =========================================================================
    // Output
    // =========================================================================

    /// Sends `event` on output bus `bus` at the event's tick. Channel
    /// messages go out on `channel`.
    ///
    /// Returns `false` when the bus is missing or inactive, or the send
    /// failed; a failed send deactivates the bus.
    pub fn play(&self, bus: usize, event: &Event, channel: u8) -> bool {
        if event.is_sysex() {
            return self.sysex(bus, event);
        }
        let mut bytes = ByteContainer::new();
        event.write_to(&mut bytes, channel);

        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let Some(endpoint) = inner.outputs.get_mut(bus) else {
            return false;
        };
        if !endpoint.is_active() {
            trace!("Dropping event for inactive bus {}", bus);
            return false;
        }
        match endpoint.send(inner.driver.as_mut(), bytes.as_slice(), event.timestamp()) {
            Ok(()) => true,
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    /// Sends a SysEx event, split into transport-sized chunks.
    pub fn sysex(&self, bus: usize, event: &Event) -> bool {
        if !event.is_sysex() || event.sysex_bytes().is_empty() {
            return false;
        }
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let chunk = inner.driver.sysex_chunk_size();
        let Some(endpoint) = inner.outputs.get_mut(bus) else {
            return false;
        };
        if !endpoint.is_active() {
            return false;
        }
        for part in sysex_chunks(event.sysex_bytes(), chunk) {
            if let Err(e) = endpoint.send(inner.driver.as_mut(), part, event.timestamp()) {
                warn!("{}", e);
                return false;
            }
        }
        true
    }

    pub fn flush(&self) {
        self.inner.lock().flush();
    }

    // =========================================================================
    // Input
    // =========================================================================

    /// Blocks up to the poll timeout for input; returns the number of
    /// ready sources, 0 on timeout or after shutdown.
    pub fn poll_for_midi(&self) -> usize {
        if self.is_shutdown() {
            return 0;
        }
        match self.waiter.wait(self.poll_timeout) {
            Ok(ready) => ready,
            Err(e) => {
                warn!("MIDI poll failed: {}", e);
                0
            }
        }
    }

    pub fn is_more_input(&self) -> bool {
        if self.is_shutdown() {
            return false;
        }
        self.inner.lock().driver.pending()
    }

    /// Pulls one packet from the transport.
    ///
    /// Port announcements are handled here and return `false`; so do empty
    /// packets, truncated SysEx and input from disabled buses. Otherwise
    /// `event` holds the decoded message and `true` is returned.
    ///
    /// An unterminated SysEx message waits up to
    /// [`SYSEX_CONTINUATION_WAIT`] per packet, without holding the lock.
    pub fn get_midi_event(&self, event: &mut Event) -> bool {
        let mut step = self.inner.lock().read_event(event);
        let mut deadline = Instant::now() + SYSEX_CONTINUATION_WAIT;
        loop {
            match step {
                ReadStep::Ready => return true,
                ReadStep::Skipped => return false,
                ReadStep::SysExOpen { progress } => {
                    if progress {
                        deadline = Instant::now() + SYSEX_CONTINUATION_WAIT;
                    }
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() || self.is_shutdown() || !self.wait_for_input(remaining) {
                        self.inner.lock().truncate_sysex(event);
                        return false;
                    }
                    step = self.inner.lock().continue_sysex(event);
                }
            }
        }
    }

    fn wait_for_input(&self, timeout: Duration) -> bool {
        match self.waiter.wait(timeout) {
            Ok(ready) => ready > 0,
            Err(e) => {
                warn!("MIDI poll failed: {}", e);
                false
            }
        }
    }

    /// Outbound messages the transport dropped because its buffer was full.
    pub fn output_overflows(&self) -> u64 {
        self.inner.lock().driver.output_overflows()
    }

    /// Inbound messages the transport dropped because its buffer was full.
    pub fn input_overflows(&self) -> u64 {
        self.inner.lock().driver.input_overflows()
    }

    // =========================================================================
    // Buses
    // =========================================================================

    pub fn output_count(&self) -> usize {
        self.inner.lock().outputs.count()
    }

    pub fn input_count(&self) -> usize {
        self.inner.lock().inputs.count()
    }

    pub fn out_bus_name(&self, bus: usize) -> Option<String> {
        self.inner.lock().outputs.get(bus).map(PortEndpoint::name)
    }

    pub fn in_bus_name(&self, bus: usize) -> Option<String> {
        self.inner.lock().inputs.get(bus).map(PortEndpoint::name)
    }

    pub fn output_state(&self, bus: usize) -> Option<PortState> {
        self.inner.lock().outputs.get(bus).map(PortEndpoint::state)
    }

    pub fn input_state(&self, bus: usize) -> Option<PortState> {
        self.inner.lock().inputs.get(bus).map(PortEndpoint::state)
    }

    pub fn output_addr(&self, bus: usize) -> Option<PortAddr> {
        self.inner.lock().outputs.get(bus).map(PortEndpoint::addr)
    }

    pub fn input_addr(&self, bus: usize) -> Option<PortAddr> {
        self.inner.lock().inputs.get(bus).map(PortEndpoint::addr)
    }

    pub fn is_output_active(&self, bus: usize) -> bool {
        self.inner.lock().outputs.is_active(bus)
    }

    pub fn is_input_active(&self, bus: usize) -> bool {
        self.inner.lock().inputs.is_active(bus)
    }

    pub fn is_output_virtual(&self, bus: usize) -> bool {
        self.inner
            .lock()
            .outputs
            .get(bus)
            .is_some_and(PortEndpoint::is_virtual)
    }

    pub fn is_input_virtual(&self, bus: usize) -> bool {
        self.inner
            .lock()
            .inputs
            .get(bus)
            .is_some_and(PortEndpoint::is_virtual)
    }

    pub fn clock_mode(&self, bus: usize) -> ClockMode {
        self.inner
            .lock()
            .outputs
            .get(bus)
            .map(PortEndpoint::clock_mode)
            .unwrap_or_default()
    }

    /// Sets the clock mode of output bus `bus` and remembers it.
    pub fn set_clock(&self, bus: usize, mode: ClockMode) -> bool {
        let mut inner = self.inner.lock();
        if !inner.outputs.set_clock(bus, mode) {
            return false;
        }
        inner.config.set_clock_mode(bus, mode);
        true
    }

    pub fn input_enabled(&self, bus: usize) -> bool {
        self.inner
            .lock()
            .inputs
            .get(bus)
            .is_some_and(PortEndpoint::input_enabled)
    }

    /// Enables or disables input bus `bus` and remembers the choice.
    pub fn set_input(&self, bus: usize, enabled: bool) -> bool {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        if !inner.inputs.set_input(bus, enabled, inner.driver.as_mut()) {
            return false;
        }
        inner.config.set_input_enabled(bus, enabled);
        true
    }

    /// One line per bus: direction, name, state and clock or input setting.
    pub fn port_listing(&self) -> String {
        let inner = self.inner.lock();
        let mut out = String::new();
        for bus in inner.outputs.iter() {
            out.push_str(&format!(
                "out {} ({}, clock {})\n",
                bus.name(),
                bus.state().as_str(),
                bus.clock_mode().as_str()
            ));
        }
        for bus in inner.inputs.iter() {
            out.push_str(&format!(
                "in {} ({}, input {})\n",
                bus.name(),
                bus.state().as_str(),
                if bus.input_enabled() { "on" } else { "off" }
            ));
        }
        out
    }
}

impl Drop for MasterBus {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for MasterBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MasterBus")
            .field("backend", &inner.driver.kind())
            .field("outputs", &inner.outputs.count())
            .field("inputs", &inner.inputs.count())
            .field("ppqn", &inner.ppqn)
            .field("bpm", &inner.bpm)
            .field("initialized", &inner.initialized)
            .finish()
    }
}

fn validate_tempo(ppqn: u32, bpm: f64) -> Result<()> {
    if ppqn == 0 {
        return Err(Error::InvalidConfig("ppqn must be positive".into()));
    }
    if !bpm.is_finite() || bpm <= 0.0 {
        return Err(Error::InvalidConfig(format!("bpm must be positive, got {}", bpm)));
    }
    Ok(())
}

/// Outcome of one pull from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadStep {
    Ready,
    Skipped,
    /// A SysEx message is still open. `progress` is set when bytes were
    /// appended by this pull.
    SysExOpen { progress: bool },
}

impl MasterInner {
    fn require_init(&self) -> Result<()> {
        if self.initialized && !self.closed {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    fn init(&mut self, ppqn: u32, bpm: f64) -> Result<()> {
        let client_name = self.config.client_name.clone();
        if let Err(e) = self.driver.open(&client_name) {
            error!("Cannot open {} MIDI transport: {}", self.driver.kind().name(), e);
            return Err(match e {
                Error::FatalInit(_) => e,
                other => Error::FatalInit(other.to_string()),
            });
        }

        if self.config.manual_ports {
            self.create_manual_ports(&client_name);
        } else {
            self.discover_ports()?;
        }

        self.ppqn = ppqn;
        self.bpm = bpm;
        self.config.ppqn = ppqn;
        self.config.bpm = bpm;
        self.initialized = true;
        if let Err(e) = self.program_tempo() {
            warn!("Cannot program queue tempo: {}", e);
        }
        if let Err(e) = self.driver.refresh_poll_set() {
            warn!("Cannot read MIDI poll descriptors: {}", e);
        }
        if let Err(e) = self
            .driver
            .set_buffer_sizes(self.config.input_buffer_size, self.config.output_buffer_size)
        {
            warn!("Cannot size MIDI buffers: {}", e);
        }
        if !self.config.manual_ports && self.config.announce {
            if let Err(e) = self.driver.subscribe_announce() {
                warn!("Cannot follow port announcements: {}", e);
            }
        }

        self.outputs.set_all_clocks(&self.config.clock_modes);
        self.inputs
            .set_all_inputs(&self.config.input_enabled, self.driver.as_mut());

        info!(
            "Master MIDI bus ready on {} (client {}): {} outputs, {} inputs, {} ppqn, {} bpm",
            self.driver.kind().name(),
            self.driver.client_id(),
            self.outputs.count(),
            self.inputs.count(),
            ppqn,
            bpm
        );
        Ok(())
    }

    fn create_manual_ports(&mut self, client_name: &str) {
        for slot in 0..MANUAL_OUTPUT_BUSES {
            let endpoint = PortEndpoint::new_virtual(
                slot,
                Direction::Output,
                client_name,
                format!("{} out {}", client_name, slot),
            );
            self.outputs.add(endpoint, self.driver.as_mut());
        }
        for slot in 0..MANUAL_INPUT_BUSES {
            let endpoint = PortEndpoint::new_virtual(
                slot,
                Direction::Input,
                client_name,
                format!("{} in {}", client_name, slot),
            );
            self.inputs.add(endpoint, self.driver.as_mut());
        }
    }

    fn discover_ports(&mut self) -> Result<()> {
        let ours = self.driver.client_id();
        let system = self.driver.system_client();
        let remotes = self
            .driver
            .enumerate()
            .map_err(|e| Error::FatalInit(format!("cannot enumerate ports: {}", e)))?;

        for remote in remotes
            .iter()
            .filter(|r| r.addr.client != ours && Some(r.addr.client) != system)
        {
            if remote.caps.can_subscribe_write() {
                let slot = self.outputs.count();
                self.outputs.add(
                    PortEndpoint::new_external(slot, Direction::Output, remote),
                    self.driver.as_mut(),
                );
            }
            if remote.caps.can_subscribe_read() {
                let slot = self.inputs.count();
                self.inputs.add(
                    PortEndpoint::new_external(slot, Direction::Input, remote),
                    self.driver.as_mut(),
                );
            }
        }
        Ok(())
    }

    /// PPQN and tempo always go to the queue together.
    fn program_tempo(&mut self) -> Result<()> {
        if !self.initialized {
            return Ok(());
        }
        let tempo_us = tempo_us_from_bpm(self.bpm);
        self.driver.set_queue_tempo(self.ppqn, tempo_us)?;
        debug!(
            "MIDI queue tempo: {} ppqn, {} us/quarter ({} bpm)",
            self.ppqn, tempo_us, self.bpm
        );
        Ok(())
    }

    fn flush(&mut self) {
        if let Err(e) = self.driver.flush() {
            warn!("MIDI flush failed: {}", e);
        }
    }

    fn close(&mut self) {
        if self.initialized {
            if let Err(e) = self.driver.stop_queue() {
                debug!("Stopping MIDI queue at close: {}", e);
            }
        }
        self.outputs.teardown(self.driver.as_mut());
        self.inputs.teardown(self.driver.as_mut());
        self.driver.close();
        self.closed = true;
        info!("Master MIDI bus closed");
    }

    fn read_event(&mut self, event: &mut Event) -> ReadStep {
        let mut buffer = [0u8; DECODE_BUFFER_SIZE];
        let packet = match self.driver.recv(&mut buffer) {
            Ok(Some(packet)) => packet,
            Ok(None) => return ReadStep::Skipped,
            Err(e) => {
                warn!("MIDI receive failed: {}", e);
                return ReadStep::Skipped;
            }
        };
        match packet {
            Packet::Midi { tick, port, len } => {
                if let Some(handle) = port {
                    if !self.input_accepts(handle) {
                        trace!("Dropping input from disabled port handle {}", handle);
                        return ReadStep::Skipped;
                    }
                }
                match self.decoder.decode(&buffer[..len], tick, event) {
                    DecodeStep::Complete => ReadStep::Ready,
                    DecodeStep::NeedMore => self.continue_sysex(event),
                    DecodeStep::Overflow => self.truncate_sysex(event),
                    DecodeStep::Empty | DecodeStep::Dropped => ReadStep::Skipped,
                }
            }
            announcement => {
                self.handle_announcement(announcement);
                ReadStep::Skipped
            }
        }
    }

    /// Appends the continuation packets already pending to an open SysEx
    /// message. Never waits.
    fn continue_sysex(&mut self, event: &mut Event) -> ReadStep {
        let mut buffer = [0u8; DECODE_BUFFER_SIZE];
        let mut progress = false;
        loop {
            let len = match self.driver.recv(&mut buffer) {
                Ok(Some(Packet::Midi { len, .. })) => len,
                Ok(Some(announcement)) => {
                    self.handle_announcement(announcement);
                    continue;
                }
                Ok(None) => return ReadStep::SysExOpen { progress },
                Err(e) => {
                    debug!("MIDI receive failed inside SysEx: {}", e);
                    0
                }
            };
            match self.decoder.continue_sysex(&buffer[..len], event) {
                DecodeStep::Complete => return ReadStep::Ready,
                DecodeStep::NeedMore => progress = true,
                DecodeStep::Empty | DecodeStep::Dropped | DecodeStep::Overflow => {
                    return self.truncate_sysex(event)
                }
            }
        }
    }

    fn truncate_sysex(&mut self, event: &mut Event) -> ReadStep {
        warn!("{}", Error::SysExTruncated(event.sysex_bytes().len()));
        event.clear();
        ReadStep::Skipped
    }

    fn input_accepts(&self, handle: PortHandle) -> bool {
        self.inputs
            .iter()
            .find(|bus| bus.handle() == Some(handle))
            .map_or(true, |bus| bus.is_virtual() || bus.input_enabled())
    }

    fn handle_announcement(&mut self, packet: Packet) {
        if self.config.manual_ports {
            return;
        }
        match packet {
            Packet::PortStart(addr) => self.port_start(addr),
            Packet::PortExit(addr) => self.port_exit(addr),
            Packet::PortChange(addr) => debug!("MIDI port {} changed", addr),
            Packet::Midi { .. } => {}
        }
    }

    fn port_start(&mut self, addr: PortAddr) {
        if addr.client == self.driver.client_id() || Some(addr.client) == self.driver.system_client() {
            return;
        }
        let Some(remote) = self.driver.port_info(addr) else {
            debug!("MIDI port {} announced but not found", addr);
            return;
        };
        if remote.caps.is_full_write() {
            self.attach(Direction::Output, &remote);
        }
        if remote.caps.is_full_read() {
            self.attach(Direction::Input, &remote);
        }
        if let Err(e) = self.driver.refresh_poll_set() {
            warn!("Cannot read MIDI poll descriptors: {}", e);
        }
    }

    fn attach(&mut self, direction: Direction, remote: &RemotePort) {
        let buses = match direction {
            Direction::Output => &mut self.outputs,
            Direction::Input => &mut self.inputs,
        };
        if let Some(slot) = buses.active_slot(remote.addr) {
            debug!("MIDI port {} already active on bus {}", remote.addr, slot);
            return;
        }
        let count = buses.count();
        let replacement = buses.replacement_port(remote.addr.client, remote.addr.port);
        let slot = replacement.unwrap_or(count);

        let mut endpoint = PortEndpoint::new_external(slot, direction, remote);
        if replacement.is_none() {
            endpoint.set_clock_mode(self.config.clock_mode(slot));
            endpoint.set_input_flag(self.config.input_enabled(slot));
        }
        let slot = buses.add(endpoint, self.driver.as_mut());
        info!(
            "MIDI {} bus {} {}: {}:{}",
            direction.as_str(),
            slot,
            if replacement.is_some() { "reconnected" } else { "added" },
            remote.client_name,
            remote.port_name
        );
    }

    fn port_exit(&mut self, addr: PortAddr) {
        let gone = self.outputs.port_exit(addr) + self.inputs.port_exit(addr);
        if gone == 0 {
            debug!("MIDI port {} exited; no active bus bound to it", addr);
        }
    }
}
