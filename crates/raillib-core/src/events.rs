//! Domain events emitted when command-station state changes.
//!
//! Station backends emit [`StationEvent`]s through a
//! [`tokio::sync::broadcast`] channel as soon as an unsolicited device update
//! has been merged into their entity tables. The dispatcher reconciles each
//! event with the persisted inventory and re-emits it to its own listeners.

use crate::types::{Accessory, Locomotive, Sensor};

/// An event describing a change on the command station.
///
/// Entity-carrying variants always hold the *fully merged* entity, never a
/// partial update.
#[derive(Debug, Clone, PartialEq)]
pub enum StationEvent {
    /// Track power was switched on or off.
    PowerChanged {
        /// `true` if track power is on.
        on: bool,
    },

    /// A locomotive changed travel direction.
    DirectionChanged {
        /// The locomotive after the change.
        locomotive: Locomotive,
    },

    /// A locomotive changed velocity.
    VelocityChanged {
        /// The locomotive after the change.
        locomotive: Locomotive,
    },

    /// A locomotive function was switched.
    FunctionChanged {
        /// The locomotive after the change.
        locomotive: Locomotive,
        /// Number of the function that changed.
        number: u8,
    },

    /// A turnout or signal changed position.
    AccessoryChanged {
        /// The accessory after the change.
        accessory: Accessory,
    },

    /// A feedback contact changed state.
    SensorChanged {
        /// The sensor after the change.
        sensor: Sensor,
    },

    /// Connected to the command station.
    Connected,

    /// The connection to the command station was lost or closed.
    Disconnected,
}

/// Coarse classification of [`StationEvent`]s, used for listener
/// registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`StationEvent::PowerChanged`].
    Power,
    /// [`StationEvent::DirectionChanged`].
    Direction,
    /// [`StationEvent::VelocityChanged`].
    Velocity,
    /// [`StationEvent::FunctionChanged`].
    Function,
    /// [`StationEvent::AccessoryChanged`].
    Accessory,
    /// [`StationEvent::SensorChanged`].
    Sensor,
    /// [`StationEvent::Connected`] and [`StationEvent::Disconnected`].
    Connection,
}

impl StationEvent {
    /// The kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            StationEvent::PowerChanged { .. } => EventKind::Power,
            StationEvent::DirectionChanged { .. } => EventKind::Direction,
            StationEvent::VelocityChanged { .. } => EventKind::Velocity,
            StationEvent::FunctionChanged { .. } => EventKind::Function,
            StationEvent::AccessoryChanged { .. } => EventKind::Accessory,
            StationEvent::SensorChanged { .. } => EventKind::Sensor,
            StationEvent::Connected | StationEvent::Disconnected => EventKind::Connection,
        }
    }
}
