//! MIDI transport back-ends.
//!
//! Every transport implements [`BackendDriver`]; the master bus only talks
//! to `Box<dyn BackendDriver>`. Direction is a parameter, not a type.
//!
//! - [`memory`]: in-process transport (always available)
//! - `alsa_seq`: ALSA sequencer (feature `alsa`)
//! - `jack_midi`: JACK MIDI (feature `jack`)

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use seqbus_midi::Pulse;

use crate::config::{BackendKind, BusConfig};
use crate::error::{Error, Result};
use crate::port::{Direction, PortAddr, RemotePort};

pub mod memory;

#[cfg(feature = "alsa")]
pub mod alsa_seq;

#[cfg(feature = "jack")]
pub mod jack_midi;

/// Back-end specific identifier of a port registered by this client.
pub type PortHandle = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueTempo {
    pub ppqn: u32,
    pub tempo_us: u32,
}

/// One unit of input pulled from a back-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet {
    /// `len` decoded MIDI bytes were written to the caller's buffer.
    Midi {
        tick: Pulse,
        port: Option<PortHandle>,
        len: usize,
    },
    PortStart(PortAddr),
    PortExit(PortAddr),
    PortChange(PortAddr),
}

/// Blocks until input is ready. Shared with the input thread so waiting
/// never holds the master bus lock.
pub trait InputWaiter: Send + Sync {
    /// Number of ready sources, 0 on timeout.
    fn wait(&self, timeout: Duration) -> Result<usize>;
}

pub trait BackendDriver: Send {
    fn kind(&self) -> BackendKind;

    /// Connects the client and allocates the timing queue.
    fn open(&mut self, client_name: &str) -> Result<()>;
    /// Drains output, stops the queue, releases every handle.
    fn close(&mut self);

    fn client_id(&self) -> i32;
    /// Client whose ports are never bound to buses, if the transport has one.
    fn system_client(&self) -> Option<i32> {
        None
    }

    fn enumerate(&self) -> Result<Vec<RemotePort>>;
    fn port_info(&self, addr: PortAddr) -> Option<RemotePort>;

    /// Registers a port owned by this client; returns its handle and address.
    fn create_virtual(&mut self, direction: Direction, name: &str) -> Result<(PortHandle, PortAddr)>;
    /// Registers a local port that will be subscribed to `remote`.
    fn create_external(&mut self, direction: Direction, remote: PortAddr, name: &str) -> Result<PortHandle>;
    fn connect(&mut self, handle: PortHandle) -> Result<()>;
    fn disconnect(&mut self, handle: PortHandle) -> Result<()>;
    fn release(&mut self, handle: PortHandle);

    /// Queues `bytes` for `tick`. Never blocks: when the transport's buffer
    /// is full the message is dropped and counted in
    /// [`output_overflows`](Self::output_overflows).
    fn send(&mut self, handle: PortHandle, bytes: &[u8], tick: Pulse) -> Result<()>;
    /// SysEx is split into chunks of this size; `None` sends whole messages.
    fn sysex_chunk_size(&self) -> Option<usize>;
    fn flush(&mut self) -> Result<()>;

    fn waiter(&self) -> Arc<dyn InputWaiter>;
    /// Re-reads the set of descriptors the waiter polls.
    fn refresh_poll_set(&mut self) -> Result<()> {
        Ok(())
    }
    fn pending(&mut self) -> bool;
    /// Pulls one packet, decoding MIDI into `buf`. `None` when nothing is
    /// available; never waits.
    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<Packet>>;

    /// Outbound messages dropped on a full buffer since open.
    fn output_overflows(&self) -> u64 {
        0
    }
    /// Inbound messages dropped on a full buffer since open.
    fn input_overflows(&self) -> u64 {
        0
    }

    fn set_queue_tempo(&mut self, ppqn: u32, tempo_us: u32) -> Result<()>;
    fn queue_tempo(&self) -> Result<QueueTempo>;
    fn start_queue(&mut self) -> Result<()>;
    /// Runs the queue from position `tick`; later sends are scheduled
    /// against that position.
    fn continue_queue(&mut self, tick: Pulse) -> Result<()>;
    fn stop_queue(&mut self) -> Result<()>;

    fn subscribe_announce(&mut self) -> Result<()>;
    fn set_buffer_sizes(&mut self, input: usize, output: usize) -> Result<()>;
}

/// Creates the driver selected by `config.backend`.
pub fn create_driver(config: &BusConfig) -> Result<Box<dyn BackendDriver>> {
    match config.backend {
        BackendKind::Memory => Ok(Box::new(
            memory::MemoryBackend::new().with_sysex_chunk_size(Some(config.sysex_chunk_size)),
        )),
        #[cfg(feature = "alsa")]
        BackendKind::Alsa => Ok(Box::new(alsa_seq::AlsaDriver::new(config))),
        #[cfg(feature = "jack")]
        BackendKind::Jack => Ok(Box::new(jack_midi::JackDriver::new(config))),
        #[allow(unreachable_patterns)]
        kind => Err(Error::BackendUnavailable(kind.name())),
    }
}

/// Producer side of a wake token used by transports without pollable
/// descriptors.
#[derive(Clone)]
pub struct InputSignal {
    pending: Arc<AtomicUsize>,
    tx: Sender<()>,
}

impl InputSignal {
    pub fn new() -> (Self, SignalWaiter) {
        let (tx, rx) = bounded(1);
        let pending = Arc::new(AtomicUsize::new(0));
        (
            Self {
                pending: Arc::clone(&pending),
                tx: tx.clone(),
            },
            SignalWaiter {
                pending,
                rx,
                _tx: tx,
            },
        )
    }

    /// One more packet is available. Lock-free and allocation-free.
    #[inline]
    pub fn notify(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        let _ = self.tx.try_send(());
    }

    /// One packet was consumed.
    #[inline]
    pub fn consume(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn reset(&self) {
        self.pending.store(0, Ordering::Release);
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

pub struct SignalWaiter {
    pending: Arc<AtomicUsize>,
    rx: Receiver<()>,
    // keeps the channel connected after the driver is gone
    _tx: Sender<()>,
}

impl InputWaiter for SignalWaiter {
    fn wait(&self, timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.pending.load(Ordering::Acquire) > 0 {
                return Ok(1);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(0);
            }
            match self.rx.recv_timeout(remaining) {
                Ok(()) => continue,
                Err(RecvTimeoutError::Timeout) => {
                    return Ok(usize::from(self.pending.load(Ordering::Acquire) > 0))
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_wait_times_out() {
        let (_signal, waiter) = InputSignal::new();
        let start = Instant::now();
        assert_eq!(waiter.wait(Duration::from_millis(30)).unwrap(), 0);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(30));
        assert!(elapsed < Duration::from_millis(30 + 50));
    }

    #[test]
    fn test_signal_wakes_waiter() {
        let (signal, waiter) = InputSignal::new();
        let t = std::thread::spawn(move || waiter.wait(Duration::from_secs(5)).unwrap());
        std::thread::sleep(Duration::from_millis(10));
        signal.notify();
        assert_eq!(t.join().unwrap(), 1);
    }

    #[test]
    fn test_stale_token_does_not_report_input() {
        let (signal, waiter) = InputSignal::new();
        signal.notify();
        signal.consume();
        assert_eq!(signal.pending(), 0);
        assert_eq!(waiter.wait(Duration::from_millis(20)).unwrap(), 0);
        signal.consume();
        assert_eq!(signal.pending(), 0);
    }

    #[test]
    fn test_unavailable_backend_is_reported() {
        if cfg!(feature = "jack") {
            return;
        }
        let config = BusConfig {
            backend: BackendKind::Jack,
            ..Default::default()
        };
        assert!(matches!(
            create_driver(&config),
            Err(Error::BackendUnavailable("jack"))
        ));
    }
}
