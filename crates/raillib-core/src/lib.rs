//! raillib-core: Core traits, entity types, and error definitions for raillib.
//!
//! This crate defines the vendor-agnostic abstractions that all raillib
//! station backends implement. Control software depends on these types
//! without pulling in any specific command-station driver.
//!
//! # Key types
//!
//! - [`CommandStation`] -- the unified trait for controlling a command station
//! - [`Transport`] -- byte-level communication channel
//! - [`StationEvent`] -- asynchronous state change notifications
//! - [`EntityStore`] -- find/persist access to the persisted inventory
//! - [`Error`] / [`Result`] -- error handling

pub mod error;
pub mod events;
pub mod station;
pub mod store;
pub mod transport;
pub mod types;

// Re-export key types at crate root for ergonomic `use raillib_core::*`.
pub use error::{Error, Result};
pub use events::{EventKind, StationEvent};
pub use station::CommandStation;
pub use store::{EntityStore, InMemoryStore};
pub use transport::Transport;
pub use types::*;
