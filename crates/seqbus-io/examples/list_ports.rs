//! Lists the buses the master bus binds on this machine.
//!
//! `cargo run -p seqbus-io --example list_ports --features alsa [config.toml]`

use seqbus_io::{BusConfig, MasterBus};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => BusConfig::load(&path).unwrap(),
        None => BusConfig::default(),
    };
    println!("=== Backend: {} ===", config.backend.name());

    let bus = MasterBus::builder().config(config).build_and_init().unwrap();
    let listing = bus.port_listing();
    if listing.is_empty() {
        println!("  (no buses)");
    }
    for line in listing.lines() {
        println!("  {}", line);
    }
    bus.close();
}
