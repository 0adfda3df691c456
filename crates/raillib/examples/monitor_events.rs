//! Monitor reconciled command-station events.
//!
//! Connects to an ECoS, imports its locomotives and accessories into an
//! in-memory store, then prints every reconciled event for 60 seconds.
//! Throttle a locomotive, throw a turnout or occupy a block to generate
//! events.
//!
//! # Usage
//!
//! ```sh
//! cargo run -p raillib --example monitor_events -- 192.168.1.50
//! ```

use std::sync::Arc;
use std::time::Duration;

use raillib::{Dispatcher, InMemoryStore, StationConfig, StationEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let host = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "192.168.1.50".to_string());

    println!("Connecting to ECoS at {}...", host);

    let store = Arc::new(InMemoryStore::new());
    let dispatcher = Dispatcher::new(store.clone());
    dispatcher.connect(&StationConfig::ecos(&host)).await?;

    let info = dispatcher.station_info()?;
    println!(
        "Connected: {} {} ({})\n",
        info.manufacturer,
        info.model,
        info.application_version.as_deref().unwrap_or("unknown version")
    );

    let locos = dispatcher.synchronize_locomotives().await?;
    let accessories = dispatcher.synchronize_accessories().await?;
    let modules = dispatcher.feedback_modules().await?;
    println!(
        "Imported {} locomotives and {} accessories; {} feedback modules",
        locos,
        accessories,
        modules.len()
    );
    println!(
        "Track power: {}\n",
        if dispatcher.power().await? { "GO" } else { "STOP" }
    );

    let mut events = dispatcher.subscribe();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    let start = tokio::time::Instant::now();

    println!("{:<12} Event", "Timestamp");
    println!("{:-<12} {:-<50}", "", "");

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(event)) => {
                let elapsed = start.elapsed();
                let timestamp = format!("{:>6}.{:03}s", elapsed.as_secs(), elapsed.subsec_millis());

                match event {
                    StationEvent::PowerChanged { on } => {
                        let state = if on { "GO" } else { "STOP" };
                        println!("{} PowerChanged      -> {}", timestamp, state);
                    }
                    StationEvent::DirectionChanged { locomotive } => {
                        println!(
                            "{} DirectionChanged  {} -> {}",
                            timestamp, locomotive.name, locomotive.direction
                        );
                    }
                    StationEvent::VelocityChanged { locomotive } => {
                        println!(
                            "{} VelocityChanged   {} -> {}",
                            timestamp, locomotive.name, locomotive.velocity
                        );
                    }
                    StationEvent::FunctionChanged { locomotive, number } => {
                        let on = locomotive.function(number).is_some_and(|f| f.value);
                        println!(
                            "{} FunctionChanged   {} F{} -> {}",
                            timestamp,
                            locomotive.name,
                            number,
                            if on { "on" } else { "off" }
                        );
                    }
                    StationEvent::AccessoryChanged { accessory } => {
                        println!(
                            "{} AccessoryChanged  {} (addr {}) -> {} [{}]",
                            timestamp,
                            accessory.name,
                            accessory.address,
                            accessory.value,
                            accessory.position
                        );
                    }
                    StationEvent::SensorChanged { sensor } => {
                        println!(
                            "{} SensorChanged     {} ({}:{}) -> {}",
                            timestamp,
                            sensor.name,
                            sensor.device_id,
                            sensor.contact_id,
                            if sensor.active { "occupied" } else { "free" }
                        );
                    }
                    StationEvent::Connected => {
                        println!("{} Connected", timestamp);
                    }
                    StationEvent::Disconnected => {
                        println!("{} Disconnected", timestamp);
                        break;
                    }
                }
            }
            Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(n))) => {
                println!("(missed {} events due to lag)", n);
            }
            Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => {
                println!("Event channel closed.");
                break;
            }
            Err(_) => break,
        }
    }

    dispatcher.disconnect().await?;
    println!("\nMonitoring complete. {} records written.", store.writes());
    Ok(())
}
