//! Input thread: polls the master bus and forwards decoded events.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use seqbus_midi::Event;
use tracing::{debug, warn};

use crate::error::Result;
use crate::master::MasterBus;

pub const DEFAULT_INPUT_CAPACITY: usize = 1024;

/// Runs `poll_for_midi` / `get_midi_event` on a dedicated thread.
///
/// Stops when the master bus shuts down, when the receiver is dropped, or
/// when the `InputThread` itself is dropped.
pub struct InputThread {
    master: Arc<MasterBus>,
    handle: Option<JoinHandle<()>>,
}

impl InputThread {
    pub fn spawn(master: Arc<MasterBus>, capacity: usize) -> Result<(Self, Receiver<Event>)> {
        let (sender, receiver) = bounded(capacity.max(1));
        let thread_master = Arc::clone(&master);
        let handle = thread::Builder::new()
            .name("midi-input-thread".to_string())
            .spawn(move || Self::run(thread_master, sender))?;
        Ok((
            Self {
                master,
                handle: Some(handle),
            },
            receiver,
        ))
    }

    fn run(master: Arc<MasterBus>, sender: Sender<Event>) {
        debug!("MIDI input thread started");
        let mut dropped = 0u64;
        'poll: while !master.is_shutdown() {
            if master.poll_for_midi() == 0 {
                continue;
            }
            while master.is_more_input() {
                let mut event = Event::default();
                if !master.get_midi_event(&mut event) {
                    continue;
                }
                match sender.try_send(event) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        dropped += 1;
                        if dropped.is_power_of_two() {
                            warn!("MIDI input channel full, {} events dropped", dropped);
                        }
                    }
                    Err(TrySendError::Disconnected(_)) => break 'poll,
                }
            }
        }
        debug!("MIDI input thread stopped");
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signals shutdown and waits for the thread, at most one poll timeout.
    pub fn stop(mut self) {
        self.join();
    }

    fn join(&mut self) {
        self.master.shutdown();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("MIDI input thread panicked");
            }
        }
    }
}

impl Drop for InputThread {
    fn drop(&mut self) {
        self.join();
    }
}
