//! Prints every MIDI event arriving on enabled input buses.
//!
//! `cargo run -p seqbus-io --example monitor --features alsa`

use std::sync::Arc;
use std::time::Duration;

use seqbus_io::{InputThread, MasterBus, DEFAULT_INPUT_CAPACITY};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let bus = Arc::new(
        MasterBus::builder()
            .client_name("seqbus-monitor")
            .poll_timeout(Duration::from_millis(100))
            .build_and_init()
            .unwrap(),
    );
    for slot in 0..bus.input_count() {
        bus.set_input(slot, true);
    }
    print!("{}", bus.port_listing());

    let (_input, events) = InputThread::spawn(Arc::clone(&bus), DEFAULT_INPUT_CAPACITY).unwrap();
    println!("Listening, Ctrl-C to quit");
    for ev in events {
        if ev.is_sysex() {
            println!("{:>8}  SysEx {:02X?}", ev.timestamp(), ev.sysex_bytes());
        } else {
            let (d1, d2) = ev.data();
            println!("{:>8}  {:02X} {:3} {:3}", ev.timestamp(), ev.status(), d1, d2);
        }
    }
}
