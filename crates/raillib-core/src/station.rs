//! The `CommandStation` trait -- unified interface for all station backends.
//!
//! Control software programs against `dyn CommandStation` without knowing
//! which vendor protocol is in use. Each backend (e.g. `raillib-ecos`)
//! provides a concrete type that implements this trait and keeps live
//! entity tables updated from the station's unsolicited events.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::events::StationEvent;
use crate::types::*;

/// Unified asynchronous interface for a model-railway command station.
///
/// Methods returning entity lists read the backend's live tables and return
/// cloned snapshots; they never observe a partially merged entity.
#[async_trait]
pub trait CommandStation: Send + Sync {
    /// Static information about the connected station.
    fn info(&self) -> &StationInfo;

    /// Query whether track power is on.
    async fn power(&self) -> Result<bool>;

    /// Switch track power on or off. Returns the resulting power state.
    async fn set_power(&self, on: bool) -> Result<bool>;

    /// Snapshot of all locomotives known to the station.
    async fn locomotives(&self) -> Result<Vec<Locomotive>>;

    /// Snapshot of all accessories known to the station.
    async fn accessories(&self) -> Result<Vec<Accessory>>;

    /// Snapshot of all feedback modules known to the station.
    async fn feedback_modules(&self) -> Result<Vec<FeedbackModule>>;

    /// Change the travel direction of a locomotive (by device id).
    async fn set_direction(&self, device_id: u32, direction: Direction) -> Result<()>;

    /// Change the velocity of a locomotive (by device id), in domain units.
    async fn set_velocity(&self, device_id: u32, velocity: u16) -> Result<()>;

    /// Switch a locomotive function on or off.
    async fn set_function(&self, device_id: u32, number: u8, on: bool) -> Result<()>;

    /// Drive one accessory output by decoder address.
    async fn switch_accessory(
        &self,
        address: u32,
        decoder_type: DecoderType,
        value: AccessoryValue,
    ) -> Result<()>;

    /// Subscribe to device-side events.
    fn subscribe(&self) -> Result<broadcast::Receiver<StationEvent>>;

    /// Whether the connection is alive.
    fn is_connected(&self) -> bool;

    /// Close the connection. Frame delivery stops afterwards.
    async fn disconnect(&self) -> Result<()>;
}
