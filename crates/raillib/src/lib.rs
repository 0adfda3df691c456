//! # raillib -- Command-Station Bridge for Model Railway Control
//!
//! `raillib` is an asynchronous Rust library that connects model railway
//! control software to digital command stations. It decodes the vendor
//! protocol into a normalized entity model (locomotives, turnouts and
//! signals, feedback modules) and reconciles live device state with the
//! application's persisted inventory.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use raillib::{Dispatcher, EventKind, InMemoryStore, StationConfig, StationEvent};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let dispatcher = Dispatcher::new(Arc::new(InMemoryStore::new()));
//!     dispatcher.connect(&StationConfig::ecos("192.168.1.50")).await?;
//!
//!     dispatcher.add_listener(EventKind::Sensor, |event| {
//!         if let StationEvent::SensorChanged { sensor } = event {
//!             println!("{} -> {}", sensor.name, sensor.active);
//!         }
//!     });
//!
//!     dispatcher.set_power(true).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! | Crate                  | Purpose                                            |
//! |------------------------|----------------------------------------------------|
//! | `raillib-core`         | Traits ([`CommandStation`], [`EntityStore`]), entity types, errors |
//! | `raillib-transport`    | TCP transport                                      |
//! | `raillib-ecos`         | ESU ECoS text protocol backend                     |
//! | **`raillib`**          | This facade crate -- [`Dispatcher`] and re-exports |
//!
//! Station backends implement [`CommandStation`] and publish raw
//! [`StationEvent`]s. The [`Dispatcher`] matches each one against the
//! [`EntityStore`], persists the device-side changes and re-emits the
//! event with the persisted record to registered listeners.

pub mod config;
pub mod dispatcher;
pub mod listeners;

pub use raillib_core::*;

pub use config::{StationConfig, StationKind};
pub use dispatcher::Dispatcher;
pub use listeners::{Listener, ListenerId, ListenerRegistry};

/// ESU ECoS backend.
///
/// Provides [`EcosStation`](ecos::EcosStation) and
/// [`EcosBuilder`](ecos::EcosBuilder) for the ECoS text protocol on TCP
/// port 15471.
pub mod ecos {
    pub use raillib_ecos::*;
}

/// Transport implementations.
pub mod transport {
    pub use raillib_transport::*;
}
