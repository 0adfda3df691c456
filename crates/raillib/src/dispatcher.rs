//! Dispatcher -- owns the active station connection and reconciles its
//! events with the persisted inventory.
//!
//! Every event coming from the station is matched against the
//! [`EntityStore`] before it is passed on:
//!
//! 1. Look up the persisted record by the device's key: the id (then
//!    address and decoder type) for locomotives, the address for
//!    accessories, module and port for sensors.
//! 2. For accessories without a direct match, retry with `address - 1`. A
//!    multi-state signal found there owns the reported address as its
//!    secondary output, and the position is folded in with offset `+2`.
//! 3. Copy the device-side fields onto the persisted record, persist it,
//!    and re-emit the event carrying the persisted record.
//!
//! Events without a persisted counterpart are dropped after a log line.
//! Reconciliation runs on one task per connection, so the store is only
//! ever called sequentially.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use raillib_core::error::{Error, Result};
use raillib_core::events::{EventKind, StationEvent};
use raillib_core::station::CommandStation;
use raillib_core::store::EntityStore;
use raillib_core::types::*;

use crate::config::StationConfig;
use crate::listeners::{ListenerId, ListenerRegistry};

/// Capacity of the reconciled event channel.
const EVENT_CAPACITY: usize = 256;

/// State shared with the event task.
struct Shared {
    store: Arc<dyn EntityStore>,
    listeners: ListenerRegistry,
    event_tx: broadcast::Sender<StationEvent>,
}

/// Reconciling front end for one command station connection.
pub struct Dispatcher {
    shared: Arc<Shared>,
    station: RwLock<Option<Arc<dyn CommandStation>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

impl Dispatcher {
    /// Create a dispatcher backed by `store`. No connection is opened.
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Dispatcher {
            shared: Arc::new(Shared {
                store,
                listeners: ListenerRegistry::new(),
                event_tx,
            }),
            station: RwLock::new(None),
            pump: Mutex::new(None),
        }
    }

    // -----------------------------------------------------------------
    // Connection
    // -----------------------------------------------------------------

    /// Connect to the station described by `config`.
    pub async fn connect(&self, config: &StationConfig) -> Result<()> {
        let station = config.connect().await?;
        self.connect_station(station).await
    }

    /// Take over an already connected station. Any previous connection is
    /// closed first.
    pub async fn connect_station(&self, station: Arc<dyn CommandStation>) -> Result<()> {
        if self.station.read().is_some() {
            self.disconnect().await?;
        }

        let rx = station.subscribe()?;
        let pump = tokio::spawn(pump_events(Arc::clone(&self.shared), rx));
        *self.pump.lock() = Some(pump);
        *self.station.write() = Some(station);
        self.shared.dispatch(StationEvent::Connected);
        Ok(())
    }

    /// Close the connection. Does nothing when not connected.
    pub async fn disconnect(&self) -> Result<()> {
        let station = self.station.write().take();
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        let Some(station) = station else {
            return Ok(());
        };
        let result = station.disconnect().await;
        self.shared.dispatch(StationEvent::Disconnected);
        result
    }

    /// Whether a station is attached and its connection is alive.
    pub fn is_connected(&self) -> bool {
        self.station
            .read()
            .as_ref()
            .is_some_and(|s| s.is_connected())
    }

    /// Information about the connected station.
    pub fn station_info(&self) -> Result<StationInfo> {
        Ok(self.station()?.info().clone())
    }

    fn station(&self) -> Result<Arc<dyn CommandStation>> {
        self.station.read().clone().ok_or(Error::NotConnected)
    }

    // -----------------------------------------------------------------
    // Power and enumeration
    // -----------------------------------------------------------------

    /// Query track power.
    pub async fn power(&self) -> Result<bool> {
        self.station()?.power().await
    }

    /// Switch track power; returns the new state.
    pub async fn set_power(&self, on: bool) -> Result<bool> {
        self.station()?.set_power(on).await
    }

    /// Locomotives known to the station.
    pub async fn locomotives(&self) -> Result<Vec<Locomotive>> {
        self.station()?.locomotives().await
    }

    /// Accessories known to the station.
    pub async fn accessories(&self) -> Result<Vec<Accessory>> {
        self.station()?.accessories().await
    }

    /// Feedback modules known to the station.
    pub async fn feedback_modules(&self) -> Result<Vec<FeedbackModule>> {
        self.station()?.feedback_modules().await
    }

    // -----------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------

    /// Device object id of a persisted locomotive.
    ///
    /// The record id is tried first; otherwise the station's table is
    /// searched by address and decoder type.
    async fn device_locomotive_id(
        station: &dyn CommandStation,
        locomotive: &Locomotive,
    ) -> Result<u32> {
        let known = station.locomotives().await?;
        if let Ok(id) = locomotive.id.parse::<u32>() {
            if known.iter().any(|l| l.id == locomotive.id) {
                return Ok(id);
            }
        }
        known
            .iter()
            .find(|l| {
                l.address == locomotive.address && l.decoder_type == locomotive.decoder_type
            })
            .and_then(|l| l.id.parse::<u32>().ok())
            .ok_or(Error::UnknownObject(locomotive.address))
    }

    /// Change the travel direction of a locomotive.
    pub async fn change_direction(
        &self,
        locomotive: &Locomotive,
        direction: Direction,
    ) -> Result<()> {
        let station = self.station()?;
        let id = Self::device_locomotive_id(&*station, locomotive).await?;
        station.set_direction(id, direction).await
    }

    /// Change the velocity of a locomotive (domain units, 0..=1016).
    pub async fn change_velocity(&self, locomotive: &Locomotive, velocity: u16) -> Result<()> {
        let station = self.station()?;
        let id = Self::device_locomotive_id(&*station, locomotive).await?;
        station.set_velocity(id, velocity).await
    }

    /// Switch a locomotive function.
    pub async fn change_function(
        &self,
        locomotive: &Locomotive,
        number: u8,
        on: bool,
    ) -> Result<()> {
        let station = self.station()?;
        let id = Self::device_locomotive_id(&*station, locomotive).await?;
        station.set_function(id, number, on).await
    }

    /// Move an accessory to a combined position. Positions 2 and 3 of a
    /// multi-state signal drive its secondary address.
    pub async fn switch_accessory(&self, accessory: &Accessory, position: u8) -> Result<()> {
        if position >= accessory.states.max(2) {
            return Err(Error::InvalidParameter(format!(
                "position {position} out of range for {} states",
                accessory.states
            )));
        }
        self.station()?
            .switch_accessory(
                accessory.output_address(position),
                accessory.decoder_type,
                AccessoryValue::from_position(position),
            )
            .await
    }

    // -----------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------

    /// Register a callback for reconciled events of `kind`.
    pub fn add_listener<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&StationEvent) + Send + Sync + 'static,
    {
        self.shared.listeners.add(kind, Arc::new(listener))
    }

    /// Unregister a callback. Returns `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove(id)
    }

    /// Stream of reconciled events.
    pub fn subscribe(&self) -> broadcast::Receiver<StationEvent> {
        self.shared.event_tx.subscribe()
    }

    // -----------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------

    /// Reconcile one station event with the store.
    ///
    /// Returns the event to publish, carrying the persisted record, or
    /// `None` when the event has no persisted counterpart.
    pub fn reconcile(&self, event: StationEvent) -> Result<Option<StationEvent>> {
        self.shared.reconcile(event)
    }

    /// Import the station's locomotives into the store.
    ///
    /// Matched records get the device state carried over; unmatched
    /// locomotives are persisted under their device id. Returns the number
    /// of records written.
    pub async fn synchronize_locomotives(&self) -> Result<usize> {
        let station = self.station()?;
        let mut written = 0;
        for device in station.locomotives().await? {
            let record = match self.shared.match_locomotive(&device)? {
                Some(mut record) => {
                    carry_over_locomotive(&mut record, &device);
                    for (number, function) in &device.functions {
                        *record.function_mut(*number) = function.clone();
                    }
                    record
                }
                None => device,
            };
            self.shared.store.persist_locomotive(&record)?;
            written += 1;
        }
        debug!(written, "locomotives synchronised");
        Ok(written)
    }

    /// Import the station's accessories into the store. Returns the number
    /// of records written.
    pub async fn synchronize_accessories(&self) -> Result<usize> {
        let station = self.station()?;
        let mut written = 0;
        for device in station.accessories().await? {
            if device.address == 0 {
                continue;
            }
            let record = match self.shared.match_accessory(&device)? {
                Some((mut record, position)) => {
                    record.set_position(position);
                    record
                }
                None => device,
            };
            self.shared.store.persist_accessory(&record)?;
            written += 1;
        }
        debug!(written, "accessories synchronised");
        Ok(written)
    }
}

/// Copy the device-owned locomotive state onto a persisted record.
///
/// The device entity is the fully merged table row, so every event brings
/// the record up to date, not just the field that changed.
fn carry_over_locomotive(record: &mut Locomotive, device: &Locomotive) {
    record.velocity = device.velocity;
    record.direction = device.direction;
    record.active = device.active;
    for (number, function) in &device.functions {
        record.function_mut(*number).value = function.value;
    }
}

// ---------------------------------------------------------------------
// Event task
// ---------------------------------------------------------------------

async fn pump_events(shared: Arc<Shared>, mut rx: broadcast::Receiver<StationEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match shared.reconcile(event) {
                Ok(Some(event)) => shared.dispatch(event),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "reconciliation failed"),
            },
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "station events dropped, dispatcher fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("dispatcher event task finished");
}

impl Shared {
    fn dispatch(&self, event: StationEvent) {
        self.listeners.notify(&event);
        let _ = self.event_tx.send(event);
    }

    fn reconcile(&self, event: StationEvent) -> Result<Option<StationEvent>> {
        match event {
            StationEvent::PowerChanged { .. }
            | StationEvent::Connected
            | StationEvent::Disconnected => Ok(Some(event)),

            StationEvent::DirectionChanged { locomotive } => Ok(self
                .reconcile_locomotive(&locomotive)?
                .map(|locomotive| StationEvent::DirectionChanged { locomotive })),
            StationEvent::VelocityChanged { locomotive } => Ok(self
                .reconcile_locomotive(&locomotive)?
                .map(|locomotive| StationEvent::VelocityChanged { locomotive })),
            StationEvent::FunctionChanged { locomotive, number } => Ok(self
                .reconcile_locomotive(&locomotive)?
                .map(|locomotive| StationEvent::FunctionChanged { locomotive, number })),

            StationEvent::AccessoryChanged { accessory } => {
                let Some((mut record, position)) = self.match_accessory(&accessory)? else {
                    debug!(
                        address = accessory.address,
                        "accessory event without persisted record dropped"
                    );
                    return Ok(None);
                };
                record.set_position(position);
                record.id = self.store.persist_accessory(&record)?;
                Ok(Some(StationEvent::AccessoryChanged { accessory: record }))
            }

            StationEvent::SensorChanged { sensor } => {
                let Some(mut record) = self.store.find_sensor(sensor.device_id, sensor.contact_id)?
                else {
                    debug!(
                        device_id = sensor.device_id,
                        contact_id = sensor.contact_id,
                        "sensor event without persisted record dropped"
                    );
                    return Ok(None);
                };
                record.active = sensor.active;
                record.previously_active = sensor.previously_active;
                record.id = self.store.persist_sensor(&record)?;
                Ok(Some(StationEvent::SensorChanged { sensor: record }))
            }
        }
    }

    /// Match, carry over the device state, persist.
    fn reconcile_locomotive(&self, device: &Locomotive) -> Result<Option<Locomotive>> {
        let Some(mut record) = self.match_locomotive(device)? else {
            debug!(
                device_id = %device.id,
                address = device.address,
                "locomotive event without persisted record dropped"
            );
            return Ok(None);
        };
        carry_over_locomotive(&mut record, device);
        record.id = self.store.persist_locomotive(&record)?;
        Ok(Some(record))
    }

    fn match_locomotive(&self, device: &Locomotive) -> Result<Option<Locomotive>> {
        if !device.id.is_empty() {
            if let Some(record) = self.store.find_locomotive(&device.id)? {
                return Ok(Some(record));
            }
        }
        if device.address == 0 {
            return Ok(None);
        }
        self.store
            .find_locomotive_by_address(device.address, device.decoder_type)
    }

    /// Persisted accessory owning the device's address, with the combined
    /// position the device state maps to.
    fn match_accessory(&self, device: &Accessory) -> Result<Option<(Accessory, u8)>> {
        if device.address == 0 {
            return Ok(None);
        }
        if let Some(record) = self.store.find_accessory_by_address(device.address)? {
            return Ok(Some((record, device.position)));
        }
        if device.address > 1 {
            if let Some(record) = self.store.find_accessory_by_address(device.address - 1)? {
                if record.is_multi_state() {
                    let position = device.value.offset() + 2;
                    return Ok(Some((record, position)));
                }
            }
        }
        Ok(None)
    }
}
