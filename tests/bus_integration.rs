//! Umbrella crate tests: configuration file to running bus.
//!
//! Run with:
//! ```bash
//! cargo test -p seqbus --test bus_integration
//! ```

use std::path::PathBuf;

use seqbus::prelude::*;
use seqbus::Error;

fn config_path(name: &str) -> PathBuf {
    std::env::temp_dir()
        .join(format!("seqbus-test-{}", std::process::id()))
        .join(name)
}

/// A saved configuration reopens into an initialized bus.
#[test]
fn test_open_from_saved_config() {
    let mut config = BusConfig {
        client_name: "pattern-player".into(),
        backend: BackendKind::Memory,
        manual_ports: true,
        ppqn: 96,
        bpm: 100.0,
        ..Default::default()
    };
    config.set_clock_mode(3, ClockMode::Pos);
    let path = config_path("saved.toml");
    config.save(&path).unwrap();

    let bus = seqbus::open(&path).unwrap();
    assert!(bus.is_initialized());
    assert_eq!(bus.output_count(), seqbus::io::MANUAL_OUTPUT_BUSES);
    assert_eq!(bus.ppqn(), 96);
    assert_eq!(bus.clock_mode(3), ClockMode::Pos);
    assert_eq!(bus.queue_tempo().unwrap().tempo_us, 600_000);

    assert!(bus.play(3, &Event::note_on(0, 0, 60, 100), 2));
    bus.close();
    assert_eq!(bus.output_state(3), Some(PortState::Dead));

    let _ = std::fs::remove_file(&path);
}

/// A missing file surfaces as a bus I/O error.
#[test]
fn test_open_missing_config() {
    let result = seqbus::open(config_path("missing.toml"));
    assert!(matches!(
        result,
        Err(Error::Bus(seqbus::io::Error::Io(_)))
    ));
}

/// Bad values are rejected before any port is created.
#[test]
fn test_open_invalid_config() {
    let path = config_path("invalid.toml");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "backend = \"memory\"\nppqn = 0\n").unwrap();

    let err = seqbus::open(&path).unwrap_err();
    assert!(err.to_string().starts_with("MIDI bus:"));
    assert!(matches!(
        err,
        Error::Bus(seqbus::io::Error::InvalidConfig(_))
    ));

    let _ = std::fs::remove_file(&path);
}
