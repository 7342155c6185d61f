//! ALSA sequencer back-end.
//!
//! One sequencer client with one queue. Outbound events are tick-scheduled
//! on the queue while it runs and sent direct otherwise. Inbound
//! subscriptions are timestamped on the queue, so input ticks line up with
//! output ticks.

use std::ffi::CString;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use alsa::poll::{pollfd, Descriptors};
use alsa::seq::{
    Addr, ClientIter, Event, EventType, MidiEvent, PortCap, PortInfo, PortIter, PortSubscribe,
    PortType, Seq,
};
use parking_lot::RwLock;
use seqbus_midi::{status, Pulse};
use tracing::{debug, warn};

use super::{BackendDriver, InputWaiter, Packet, PortHandle, QueueTempo};
use crate::config::{BackendKind, BusConfig};
use crate::decode::DECODE_BUFFER_SIZE;
use crate::error::{Error, Result};
use crate::port::{Direction, PortAddr, PortCaps, RemotePort};

pub const SND_SEQ_CLIENT_SYSTEM: i32 = 0;
pub const SND_SEQ_PORT_SYSTEM_ANNOUNCE: i32 = 1;

/// Size of `snd_seq_event_t`; pool sizes are counted in events.
const SEQ_EVENT_SIZE: usize = 28;

struct AlsaPort {
    direction: Direction,
    local: i32,
    remote: Option<Addr>,
    connected: bool,
}

pub struct AlsaDriver {
    seq: Option<Seq>,
    client_id: i32,
    queue: i32,
    running: bool,
    ports: Vec<Option<AlsaPort>>,
    announce_port: Option<i32>,
    fds: Arc<RwLock<Vec<pollfd>>>,
    sysex_chunk_size: usize,
}

impl AlsaDriver {
    pub fn new(config: &BusConfig) -> Self {
        Self {
            seq: None,
            client_id: -1,
            queue: -1,
            running: false,
            ports: Vec::new(),
            announce_port: None,
            fds: Arc::new(RwLock::new(Vec::new())),
            sysex_chunk_size: config.sysex_chunk_size,
        }
    }

    fn seq(&self) -> Result<&Seq> {
        self.seq
            .as_ref()
            .ok_or_else(|| Error::Backend("ALSA sequencer is not open".into()))
    }

    fn port(&self, handle: PortHandle) -> Result<&AlsaPort> {
        self.ports
            .get(handle as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::Backend(format!("unknown ALSA port handle {}", handle)))
    }

    fn ours(&self, port: i32) -> Addr {
        Addr {
            client: self.client_id,
            port,
        }
    }

    fn handle_of_local(&self, local: i32) -> Option<PortHandle> {
        self.ports
            .iter()
            .position(|p| p.as_ref().is_some_and(|p| p.local == local))
            .map(|i| i as PortHandle)
    }

    fn register(&mut self, direction: Direction, name: &str, caps: PortCap, remote: Option<Addr>) -> Result<PortHandle> {
        let seq = self.seq()?;
        let cname = CString::new(name).map_err(|e| Error::Backend(e.to_string()))?;
        let mut info = PortInfo::empty()?;
        info.set_name(&cname);
        info.set_capability(caps);
        info.set_type(PortType::MIDI_GENERIC | PortType::APPLICATION);
        if direction == Direction::Input {
            info.set_timestamping(true);
            info.set_timestamp_queue(self.queue);
        }
        seq.create_port(&info)?;
        let local = info.get_port();

        let handle = self.ports.len() as PortHandle;
        self.ports.push(Some(AlsaPort {
            direction,
            local,
            remote,
            connected: false,
        }));
        debug!("Registered ALSA port {}:{} '{}'", self.client_id, local, name);
        Ok(handle)
    }

    fn subscription(&self, port: &AlsaPort, remote: Addr) -> Result<PortSubscribe> {
        let sub = PortSubscribe::empty()?;
        match port.direction {
            Direction::Output => {
                sub.set_sender(self.ours(port.local));
                sub.set_dest(remote);
            }
            Direction::Input => {
                sub.set_sender(remote);
                sub.set_dest(self.ours(port.local));
                sub.set_queue(self.queue);
                sub.set_time_update(true);
            }
        }
        Ok(sub)
    }

    fn pending_count(&self) -> Result<u32> {
        Ok(self.seq()?.input().event_input_pending(true)?)
    }
}

fn remote_port(seq: &Seq, client_name: Option<&str>, info: &PortInfo) -> RemotePort {
    let client = info.get_client();
    let client_name = match client_name {
        Some(name) => name.to_string(),
        None => seq
            .get_any_client_info(client)
            .ok()
            .and_then(|c| c.get_name().ok().map(str::to_string))
            .unwrap_or_default(),
    };
    RemotePort {
        addr: PortAddr::new(client, info.get_port()),
        client_name,
        port_name: info.get_name().unwrap_or_default().to_string(),
        caps: caps_from_alsa(info.get_capability()),
    }
}

fn caps_from_alsa(cap: PortCap) -> PortCaps {
    let mut caps = PortCaps::empty();
    if cap.contains(PortCap::READ) {
        caps |= PortCaps::READ;
    }
    if cap.contains(PortCap::WRITE) {
        caps |= PortCaps::WRITE;
    }
    if cap.contains(PortCap::SUBS_READ) {
        caps |= PortCaps::SUBS_READ;
    }
    if cap.contains(PortCap::SUBS_WRITE) {
        caps |= PortCaps::SUBS_WRITE;
    }
    caps
}

fn to_addr(addr: Addr) -> PortAddr {
    PortAddr::new(addr.client, addr.port)
}

fn output_event(seq: &Seq, ev: &mut Event, local: i32, queue: Option<i32>, tick: Pulse) -> Result<()> {
    ev.set_source(local);
    ev.set_subs();
    match queue {
        Some(q) => ev.schedule_tick(q, false, tick.clamp(0, u32::MAX as Pulse) as u32),
        None => ev.set_direct(),
    }
    seq.event_output(ev)?;
    Ok(())
}

impl BackendDriver for AlsaDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Alsa
    }

    fn open(&mut self, client_name: &str) -> Result<()> {
        let seq = Seq::open(None, None, false)
            .map_err(|e| Error::FatalInit(format!("snd_seq_open: {}", e)))?;
        let cname = CString::new(client_name).map_err(|e| Error::FatalInit(e.to_string()))?;
        seq.set_client_name(&cname)?;
        self.client_id = seq.client_id()?;
        self.queue = seq.alloc_queue()?;
        self.seq = Some(seq);
        debug!(
            "Opened ALSA sequencer client {} with queue {}",
            self.client_id, self.queue
        );
        Ok(())
    }

    fn close(&mut self) {
        let Some(seq) = self.seq.take() else {
            return;
        };
        if self.running {
            let _ = seq.control_queue(self.queue, EventType::Stop, 0, None);
            let _ = seq.drain_output();
            self.running = false;
        }
        for port in self.ports.drain(..).flatten() {
            let _ = seq.delete_port(port.local);
        }
        if let Some(port) = self.announce_port.take() {
            let _ = seq.delete_port(port);
        }
        if let Err(e) = seq.free_queue(self.queue) {
            debug!("Cannot free ALSA queue {}: {}", self.queue, e);
        }
        self.fds.write().clear();
    }

    fn client_id(&self) -> i32 {
        self.client_id
    }

    fn system_client(&self) -> Option<i32> {
        Some(SND_SEQ_CLIENT_SYSTEM)
    }

    fn enumerate(&self) -> Result<Vec<RemotePort>> {
        let seq = self.seq()?;
        let mut ports = Vec::new();
        for client in ClientIter::new(seq) {
            let client_name = client.get_name().unwrap_or_default().to_string();
            for port in PortIter::new(seq, client.get_client()) {
                ports.push(remote_port(seq, Some(&client_name), &port));
            }
        }
        Ok(ports)
    }

    fn port_info(&self, addr: PortAddr) -> Option<RemotePort> {
        let seq = self.seq().ok()?;
        let info = seq
            .get_any_port_info(Addr {
                client: addr.client,
                port: addr.port,
            })
            .ok()?;
        Some(remote_port(seq, None, &info))
    }

    fn create_virtual(&mut self, direction: Direction, name: &str) -> Result<(PortHandle, PortAddr)> {
        let caps = match direction {
            Direction::Output => PortCap::READ | PortCap::SUBS_READ,
            Direction::Input => PortCap::WRITE | PortCap::SUBS_WRITE,
        };
        let handle = self.register(direction, name, caps, None)?;
        let local = self.port(handle)?.local;
        Ok((handle, PortAddr::new(self.client_id, local)))
    }

    fn create_external(&mut self, direction: Direction, remote: PortAddr, name: &str) -> Result<PortHandle> {
        let caps = match direction {
            Direction::Output => PortCap::NO_EXPORT | PortCap::READ,
            Direction::Input => PortCap::NO_EXPORT | PortCap::WRITE,
        };
        let remote = Addr {
            client: remote.client,
            port: remote.port,
        };
        self.register(direction, name, caps, Some(remote))
    }

    fn connect(&mut self, handle: PortHandle) -> Result<()> {
        let port = self.port(handle)?;
        let Some(remote) = port.remote else {
            return Ok(());
        };
        let sub = self.subscription(port, remote)?;
        self.seq()?.subscribe_port(&sub)?;
        if let Some(Some(port)) = self.ports.get_mut(handle as usize) {
            port.connected = true;
        }
        Ok(())
    }

    fn disconnect(&mut self, handle: PortHandle) -> Result<()> {
        let port = self.port(handle)?;
        let Some(remote) = port.remote else {
            return Ok(());
        };
        if !port.connected {
            return Ok(());
        }
        let ours = self.ours(port.local);
        let (sender, dest) = match port.direction {
            Direction::Output => (ours, remote),
            Direction::Input => (remote, ours),
        };
        self.seq()?.unsubscribe_port(sender, dest)?;
        if let Some(Some(port)) = self.ports.get_mut(handle as usize) {
            port.connected = false;
        }
        Ok(())
    }

    fn release(&mut self, handle: PortHandle) {
        if let Err(e) = self.disconnect(handle) {
            debug!("Unsubscribing ALSA port handle {}: {}", handle, e);
        }
        let Some(port) = self.ports.get_mut(handle as usize).and_then(Option::take) else {
            return;
        };
        if let Some(seq) = self.seq.as_ref() {
            if let Err(e) = seq.delete_port(port.local) {
                debug!("Deleting ALSA port {}: {}", port.local, e);
            }
        }
    }

    fn send(&mut self, handle: PortHandle, bytes: &[u8], tick: Pulse) -> Result<()> {
        let Some(&first) = bytes.first() else {
            return Ok(());
        };
        let local = self.port(handle)?.local;
        let queue = self.running.then_some(self.queue);
        let seq = self.seq()?;

        // every SysEx chunk, continuations and a bare terminator included
        if first == status::SYSEX || first == status::SYSEX_END || !status::is_status(first) {
            let mut ev = Event::new_ext(EventType::Sysex, bytes);
            return output_event(seq, &mut ev, local, queue, tick);
        }

        let mut encoder = MidiEvent::new(bytes.len().max(4) as u32)?;
        encoder.enable_running_status(false);
        match encoder.encode(bytes)? {
            (_, Some(mut ev)) => output_event(seq, &mut ev, local, queue, tick),
            (_, None) => Err(Error::Backend(format!(
                "incomplete MIDI message {:02X?}",
                bytes
            ))),
        }
    }

    fn sysex_chunk_size(&self) -> Option<usize> {
        Some(self.sysex_chunk_size)
    }

    fn flush(&mut self) -> Result<()> {
        self.seq()?.drain_output()?;
        Ok(())
    }

    fn waiter(&self) -> Arc<dyn InputWaiter> {
        Arc::new(AlsaWaiter {
            fds: Arc::clone(&self.fds),
        })
    }

    fn refresh_poll_set(&mut self) -> Result<()> {
        let seq = self.seq()?;
        let fds = Descriptors::get(&(seq, Some(alsa::Direction::Capture)))?;
        debug!("ALSA poll set: {} descriptors", fds.len());
        *self.fds.write() = fds;
        Ok(())
    }

    fn pending(&mut self) -> bool {
        self.pending_count().is_ok_and(|n| n > 0)
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<Packet>> {
        if self.pending_count()? == 0 {
            return Ok(None);
        }

        let seq = self.seq()?;
        let mut input = seq.input();
        let mut ev = input.event_input()?;
        let announced = |f: fn(PortAddr) -> Packet| ev.get_data::<Addr>().map(|a| f(to_addr(a)));
        let packet = match ev.get_type() {
            EventType::PortStart => announced(Packet::PortStart),
            EventType::PortExit => announced(Packet::PortExit),
            EventType::PortChange => announced(Packet::PortChange),
            _ => None,
        };
        if packet.is_some() {
            return Ok(packet);
        }

        let tick = ev.get_tick().map_or(0, Pulse::from);
        let dest = ev.get_dest().port;
        let decoder = MidiEvent::new(DECODE_BUFFER_SIZE as u32)?;
        decoder.enable_running_status(false);
        let len = decoder.decode(buf, &mut ev).unwrap_or(0);

        Ok(Some(Packet::Midi {
            tick,
            port: self.handle_of_local(dest),
            len,
        }))
    }

    fn set_queue_tempo(&mut self, ppqn: u32, tempo_us: u32) -> Result<()> {
        let seq = self.seq()?;
        let tempo = seq.get_queue_tempo(self.queue)?;
        tempo.set_ppq(ppqn as i32);
        tempo.set_tempo(tempo_us);
        seq.set_queue_tempo(self.queue, &tempo)?;
        Ok(())
    }

    fn queue_tempo(&self) -> Result<QueueTempo> {
        let tempo = self.seq()?.get_queue_tempo(self.queue)?;
        Ok(QueueTempo {
            ppqn: tempo.get_ppq().max(0) as u32,
            tempo_us: tempo.get_tempo(),
        })
    }

    fn start_queue(&mut self) -> Result<()> {
        let seq = self.seq()?;
        seq.control_queue(self.queue, EventType::Start, 0, None)?;
        seq.drain_output()?;
        self.running = true;
        Ok(())
    }

    /// Moves the queue to `tick`, then continues it. Output keeps being
    /// scheduled at absolute ticks.
    fn continue_queue(&mut self, tick: Pulse) -> Result<()> {
        let seq = self.seq()?;
        let position = tick.clamp(0, i32::MAX as Pulse) as i32;
        seq.control_queue(self.queue, EventType::SetposTick, position, None)?;
        seq.control_queue(self.queue, EventType::Continue, 0, None)?;
        seq.drain_output()?;
        self.running = true;
        debug!("ALSA queue {} continued at tick {}", self.queue, tick);
        Ok(())
    }

    fn stop_queue(&mut self) -> Result<()> {
        let seq = self.seq()?;
        seq.drain_output()?;
        seq.sync_output_queue()?;
        seq.control_queue(self.queue, EventType::Stop, 0, None)?;
        seq.drain_output()?;
        self.running = false;
        Ok(())
    }

    fn subscribe_announce(&mut self) -> Result<()> {
        let seq = self.seq()?;
        let name = CString::new("announce").map_err(|e| Error::Backend(e.to_string()))?;
        let port = seq.create_simple_port(
            &name,
            PortCap::WRITE | PortCap::SUBS_WRITE,
            PortType::MIDI_GENERIC | PortType::APPLICATION,
        )?;
        let sub = PortSubscribe::empty()?;
        sub.set_sender(Addr {
            client: SND_SEQ_CLIENT_SYSTEM,
            port: SND_SEQ_PORT_SYSTEM_ANNOUNCE,
        });
        sub.set_dest(self.ours(port));
        seq.subscribe_port(&sub)?;
        self.announce_port = Some(port);
        Ok(())
    }

    fn set_buffer_sizes(&mut self, input: usize, output: usize) -> Result<()> {
        let seq = self.seq()?;
        seq.set_client_pool_input((input / SEQ_EVENT_SIZE).max(1) as u32)?;
        seq.set_client_pool_output((output / SEQ_EVENT_SIZE).max(1) as u32)?;
        Ok(())
    }
}

impl Drop for AlsaDriver {
    fn drop(&mut self) {
        if self.seq.is_some() {
            warn!("ALSA driver dropped while open; closing");
            self.close();
        }
    }
}

/// Polls the sequencer's capture descriptors.
struct AlsaWaiter {
    fds: Arc<RwLock<Vec<pollfd>>>,
}

impl InputWaiter for AlsaWaiter {
    fn wait(&self, timeout: Duration) -> Result<usize> {
        let mut fds = self.fds.read().clone();
        if fds.is_empty() {
            thread::sleep(timeout);
            return Ok(0);
        }
        let ready = alsa::poll::poll(&mut fds, timeout.as_millis().min(i32::MAX as u128) as i32)?;
        Ok(ready)
    }
}
