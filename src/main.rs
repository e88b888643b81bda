//! Proxitone - ultrasonic co-location verification
//!
//! Demo entry point: runs a full verification round between an in-process
//! coordinator and two participants over the simulated acoustic channel,
//! then prints the resulting store records.

use anyhow::Result;
use proxitone::audio::emitter::PulseEmitter;
use proxitone::audio::engine::AudioEngine;
use proxitone::audio::loopback::LoopbackChannel;
use proxitone::session::coordinator::SessionCoordinator;
use proxitone::session::participant::Participant;
use proxitone::session::request::EmitterConfig;
use proxitone::session::store::{MemoryStore, SharedStore};
use proxitone::DEFAULT_SAMPLE_RATE;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("proxitone=info".parse().unwrap()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("--list" | "-l") => {
            list_devices()?;
            return Ok(());
        }
        Some("--version" | "-v") => {
            println!("proxitone {}", proxitone::VERSION);
            return Ok(());
        }
        Some("--help" | "-h") => {
            print_help();
            return Ok(());
        }
        Some(other) => {
            eprintln!("Unknown argument: {other}");
            print_help();
            return Ok(());
        }
        None => {}
    }

    info!(version = proxitone::VERSION, "proxitone demo starting");

    let store = Arc::new(MemoryStore::new());
    let channel = LoopbackChannel::new(DEFAULT_SAMPLE_RATE);
    let config = EmitterConfig::default();

    let coordinator = SessionCoordinator::new(
        Arc::clone(&store),
        PulseEmitter::new(channel.sink()),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let coordinator_handle = tokio::spawn(coordinator.run(shutdown_rx));

    let alice = Participant::new(
        Arc::clone(&store),
        channel.capture(),
        "alice",
        config.clone(),
    );
    let bob = Participant::new(
        Arc::clone(&store),
        channel.capture(),
        "bob",
        config.clone(),
    );

    let (alice_outcome, bob_outcome) = tokio::join!(
        tokio::spawn(alice.run()),
        tokio::spawn(bob.run()),
    );
    println!("alice: {:?}", alice_outcome??);
    println!("bob:   {:?}", bob_outcome??);

    shutdown_tx.send(true)?;
    coordinator_handle.await??;

    for record in store.list()? {
        println!("{}", serde_json::to_string_pretty(&record)?);
    }
    Ok(())
}

fn list_devices() -> Result<()> {
    let devices = AudioEngine::list_devices()?;
    if devices.is_empty() {
        println!("No audio devices found");
        return Ok(());
    }
    println!("Available audio devices:");
    for device in devices {
        println!(
            "  {}{} (in: {}, out: {})",
            device.name,
            if device.is_default { " [default]" } else { "" },
            device.input_channels,
            device.output_channels,
        );
    }
    Ok(())
}

fn print_help() {
    println!("proxitone {} - ultrasonic co-location verification", proxitone::VERSION);
    println!();
    println!("Usage: proxitone [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -l, --list      List audio devices");
    println!("  -v, --version   Print version");
    println!("  -h, --help      Show this help");
    println!();
    println!("With no options, runs a loopback verification round between");
    println!("an in-process coordinator and two simulated participants.");
}
