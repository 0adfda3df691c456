//! EcosStation -- the [`CommandStation`] implementation for the ESU ECoS.
//!
//! Ties the text protocol ([`protocol`](crate::protocol),
//! [`commands`]) and the entity tables ([`managers`](crate::managers)) to
//! the IO task. Every block the IO task decodes is merged into the tables
//! by [`ManagerHandler`]; unsolicited blocks additionally produce
//! [`StationEvent`]s on the broadcast channel.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use raillib_core::error::{Error, Result};
use raillib_core::events::StationEvent;
use raillib_core::station::CommandStation;
use raillib_core::types::*;

use crate::commands::{
    self, ACCESSORY_MANAGER, BASE_OBJECT, FEEDBACK_MANAGER, LOCOMOTIVE_MANAGER,
};
use crate::io::{EventHandler, StationIo};
use crate::managers::{EntityManagers, velocity_to_device};
use crate::protocol::{EcosMessage, ObjectRow};

// ---------------------------------------------------------------
// Event handler
// ---------------------------------------------------------------

/// Merges every decoded block into the entity tables and publishes the
/// resulting events.
pub struct ManagerHandler {
    managers: Arc<EntityManagers>,
}

impl ManagerHandler {
    pub fn new(managers: Arc<EntityManagers>) -> Self {
        ManagerHandler { managers }
    }
}

impl EventHandler for ManagerHandler {
    fn handle(&self, msg: &EcosMessage, event_tx: &broadcast::Sender<StationEvent>) {
        for event in self.managers.apply(msg) {
            // No subscribers is not an error.
            let _ = event_tx.send(event);
        }
    }
}

// ---------------------------------------------------------------
// Station
// ---------------------------------------------------------------

/// A connected ESU ECoS command station.
///
/// Constructed via [`EcosBuilder`](crate::builder::EcosBuilder).
pub struct EcosStation {
    io: StationIo,
    managers: Arc<EntityManagers>,
    event_tx: broadcast::Sender<StationEvent>,
    info: StationInfo,
    command_timeout: Duration,
    function_count: u8,
    subscribe_events: bool,
    /// Locomotives we hold control of.
    controlled: Mutex<HashSet<u32>>,
}

impl Drop for EcosStation {
    fn drop(&mut self) {
        self.io.cancel.cancel();
        self.io.task.abort();
    }
}

impl EcosStation {
    /// Called by [`EcosBuilder`](crate::builder::EcosBuilder).
    pub(crate) fn new(
        io: StationIo,
        managers: Arc<EntityManagers>,
        event_tx: broadcast::Sender<StationEvent>,
        info: StationInfo,
        command_timeout: Duration,
        function_count: u8,
        subscribe_events: bool,
    ) -> Self {
        EcosStation {
            io,
            managers,
            event_tx,
            info,
            command_timeout,
            function_count,
            subscribe_events,
            controlled: Mutex::new(HashSet::new()),
        }
    }

    /// The live entity tables of this connection.
    pub fn managers(&self) -> &EntityManagers {
        &self.managers
    }

    /// Send a bulk/background command. A non-zero reply code becomes
    /// [`Error::CommandRejected`]; usable rows have been merged regardless.
    pub async fn query(&self, command: String) -> Result<EcosMessage> {
        let msg = self.io.command(command, self.command_timeout).await?;
        check_reply(msg)
    }

    /// Send a throttle command on the real-time channel.
    async fn execute(&self, command: String) -> Result<EcosMessage> {
        let msg = self.io.rt_command(command, self.command_timeout).await?;
        check_reply(msg)
    }

    /// Acquire control of a locomotive once per connection.
    async fn ensure_control(&self, id: u32) -> Result<()> {
        if self.controlled.lock().contains(&id) {
            return Ok(());
        }
        self.execute(commands::cmd_take_control(id)).await?;
        self.controlled.lock().insert(id);
        debug!(object_id = id, "acquired locomotive control");
        Ok(())
    }

    /// Object id of a known locomotive.
    fn locomotive_id(&self, device_id: u32) -> Result<u32> {
        if self.managers.locomotives.get(device_id).is_some() {
            Ok(device_id)
        } else {
            Err(Error::UnknownObject(device_id))
        }
    }

    /// Merge a value we set into the local table without emitting events.
    fn record(&self, id: u32, key: &str, value: String) {
        let mut row = ObjectRow::new(id);
        row.push(key, Some(value));
        self.managers.locomotives.apply_row(&row, false);
    }

    /// Read a per-object detail, logging and skipping objects the station
    /// refuses to describe.
    async fn read_detail(&self, id: u32, command: String) -> Result<()> {
        match self.query(command).await {
            Ok(_) => Ok(()),
            Err(Error::CommandRejected { code, reason }) => {
                tracing::warn!(object_id = id, code, reason = %reason, "detail read rejected");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Populate the entity tables from the station.
    ///
    /// Reads power, the locomotive list with per-locomotive details and
    /// functions, the accessory list with details, and the feedback
    /// modules. With event subscription enabled, a view is requested on
    /// the base object, every manager and every known object.
    pub async fn synchronize(&self) -> Result<()> {
        self.query(commands::cmd_read_power()).await?;

        self.query(commands::cmd_list_locomotives()).await?;
        for id in self.managers.locomotives.ids() {
            self.read_detail(id, commands::cmd_read_locomotive(id)).await?;
            if self.function_count > 0 {
                self.read_detail(id, commands::cmd_read_functions(id, self.function_count))
                    .await?;
                self.read_detail(
                    id,
                    commands::cmd_read_function_descriptors(id, self.function_count),
                )
                .await?;
            }
        }

        self.query(commands::cmd_list_accessories()).await?;
        for id in self.managers.accessories.ids() {
            self.read_detail(id, commands::cmd_read_accessory(id)).await?;
        }

        self.query(commands::cmd_read_feedback_count()).await?;
        for id in self.managers.feedback.ids() {
            self.read_detail(id, commands::cmd_read_feedback_module(id))
                .await?;
        }

        if self.subscribe_events {
            let mut ids = vec![
                BASE_OBJECT,
                LOCOMOTIVE_MANAGER,
                ACCESSORY_MANAGER,
                FEEDBACK_MANAGER,
            ];
            ids.extend(self.managers.locomotives.ids());
            ids.extend(self.managers.accessories.ids());
            ids.extend(self.managers.feedback.ids());
            for id in ids {
                self.read_detail(id, commands::cmd_view(id)).await?;
            }
        }

        debug!(
            locomotives = self.managers.locomotives.len(),
            accessories = self.managers.accessories.len(),
            feedback_modules = self.managers.feedback.len(),
            "ECoS tables synchronised"
        );
        Ok(())
    }
}

/// Turn a non-zero reply code into an error.
fn check_reply(msg: EcosMessage) -> Result<EcosMessage> {
    if msg.is_valid() {
        Ok(msg)
    } else {
        Err(Error::CommandRejected {
            code: msg.error_code(),
            reason: msg.status().to_string(),
        })
    }
}

// ---------------------------------------------------------------
// CommandStation implementation
// ---------------------------------------------------------------

#[async_trait]
impl CommandStation for EcosStation {
    fn info(&self) -> &StationInfo {
        &self.info
    }

    async fn power(&self) -> Result<bool> {
        self.query(commands::cmd_read_power()).await?;
        self.managers
            .power()
            .ok_or_else(|| Error::Protocol("station status missing from reply".into()))
    }

    async fn set_power(&self, on: bool) -> Result<bool> {
        self.execute(commands::cmd_set_power(on)).await?;
        self.managers.record_power(on);
        Ok(on)
    }

    async fn locomotives(&self) -> Result<Vec<Locomotive>> {
        Ok(self.managers.locomotives.all())
    }

    async fn accessories(&self) -> Result<Vec<Accessory>> {
        Ok(self.managers.accessories.all())
    }

    async fn feedback_modules(&self) -> Result<Vec<FeedbackModule>> {
        Ok(self.managers.feedback.all())
    }

    async fn set_direction(&self, device_id: u32, direction: Direction) -> Result<()> {
        let id = self.locomotive_id(device_id)?;
        self.ensure_control(id).await?;
        self.execute(commands::cmd_set_direction(id, direction))
            .await?;
        let dir = match direction {
            Direction::Forwards => "0",
            Direction::Backwards => "1",
        };
        self.record(id, "dir", dir.to_string());
        Ok(())
    }

    async fn set_velocity(&self, device_id: u32, velocity: u16) -> Result<()> {
        let id = self.locomotive_id(device_id)?;
        self.ensure_control(id).await?;
        let speed = velocity_to_device(velocity);
        self.execute(commands::cmd_set_speed(id, speed)).await?;
        self.record(id, "speed", speed.to_string());
        Ok(())
    }

    async fn set_function(&self, device_id: u32, number: u8, on: bool) -> Result<()> {
        let id = self.locomotive_id(device_id)?;
        self.ensure_control(id).await?;
        self.execute(commands::cmd_set_function(id, number, on))
            .await?;
        self.record(id, "func", format!("{number},{}", u8::from(on)));
        Ok(())
    }

    async fn switch_accessory(
        &self,
        address: u32,
        decoder_type: DecoderType,
        value: AccessoryValue,
    ) -> Result<()> {
        if address == 0 {
            return Err(Error::InvalidParameter(
                "accessory address must be at least 1".into(),
            ));
        }
        self.execute(commands::cmd_switch_accessory(address, decoder_type, value))
            .await?;
        let side = match value {
            AccessoryValue::Red => 'r',
            AccessoryValue::Green => 'g',
        };
        self.managers
            .accessories
            .apply_switch(&format!("{decoder_type}{address}{side}"), false);
        Ok(())
    }

    fn subscribe(&self) -> Result<broadcast::Receiver<StationEvent>> {
        Ok(self.event_tx.subscribe())
    }

    fn is_connected(&self) -> bool {
        self.io.is_connected()
    }

    async fn disconnect(&self) -> Result<()> {
        let released: Vec<u32> = self.controlled.lock().drain().collect();
        if self.io.is_connected() {
            for id in released {
                if let Err(e) = self.execute(commands::cmd_release_control(id)).await {
                    debug!(object_id = id, error = %e, "releasing control failed");
                }
            }
        }
        self.io.close().await?;
        let _ = self.event_tx.send(StationEvent::Disconnected);
        Ok(())
    }
}

// ---------------------------------------------------------------
// Tests
// ---------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::EcosBuilder;
    use raillib_test_harness::{MockHandle, MockTransport};

    const INFO_REPLY: &[u8] = b"<REPLY get(1, info)>\n1 ECoS\n1 ProtocolVersion[0.5]\n1 ApplicationVersion[4.2.13]\n1 HardwareVersion[2.0]\n<END 0 (OK)>\n";

    fn mock_with_info() -> MockTransport {
        let mut mock = MockTransport::new();
        mock.expect(b"get(1, info)\n", INFO_REPLY);
        mock
    }

    async fn make_station(mock: MockTransport) -> EcosStation {
        EcosBuilder::new("ecos.local")
            .command_timeout(Duration::from_millis(200))
            .auto_retry(false)
            .sync_on_connect(false)
            .subscribe_events(false)
            .build_with_transport(Box::new(mock))
            .await
            .unwrap()
    }

    fn seed_locomotive(station: &EcosStation, id: u32) {
        let mut row = ObjectRow::new(id);
        row.push("name", Some("\"BR 01\"".into()));
        row.push("addr", Some("3".into()));
        row.push("protocol", Some("DCC128".into()));
        station.managers.locomotives.apply_row(&row, false);
    }

    async fn next_event(rx: &mut broadcast::Receiver<StationEvent>) -> StationEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn info_read_on_build() {
        let station = make_station(mock_with_info()).await;
        let info = station.info();
        assert_eq!(info.manufacturer, "ESU");
        assert_eq!(info.model, "ECoS");
        assert_eq!(info.protocol_version.as_deref(), Some("0.5"));
        assert_eq!(info.application_version.as_deref(), Some("4.2.13"));
        assert!(station.is_connected());
    }

    #[tokio::test]
    async fn power_query_and_switch() {
        let mut mock = mock_with_info();
        mock.expect(
            b"get(1, status)\n",
            b"<REPLY get(1, status)>\n1 status[STOP]\n<END 0 (OK)>\n",
        );
        mock.expect(b"set(1, go)\n", b"<REPLY set(1, go)>\n<END 0 (OK)>\n");
        let station = make_station(mock).await;

        assert!(!station.power().await.unwrap());
        assert!(station.set_power(true).await.unwrap());
        assert_eq!(station.managers().power(), Some(true));
    }

    #[tokio::test]
    async fn rejected_command_is_an_error() {
        let mut mock = mock_with_info();
        mock.expect(
            b"set(1, go)\n",
            b"<REPLY set(1, go)>\n<END 15 (unknown option at 7)>\n",
        );
        let station = make_station(mock).await;

        match station.set_power(true).await {
            Err(Error::CommandRejected { code, reason }) => {
                assert_eq!(code, 15);
                assert_eq!(reason, "unknown option at 7");
            }
            other => panic!("expected CommandRejected, got {other:?}"),
        }
        assert_eq!(station.managers().power(), None);
    }

    #[tokio::test]
    async fn velocity_acquires_control_once() {
        let mut mock = mock_with_info();
        mock.expect(
            b"request(1000, control, force)\n",
            b"<REPLY request(1000, control, force)>\n<END 0 (OK)>\n",
        );
        mock.expect(
            b"set(1000, speed[64])\n",
            b"<REPLY set(1000, speed[64])>\n<END 0 (OK)>\n",
        );
        mock.expect(
            b"set(1000, dir[1])\n",
            b"<REPLY set(1000, dir[1])>\n<END 0 (OK)>\n",
        );
        let handle = mock.handle();
        let station = make_station(mock).await;
        seed_locomotive(&station, 1000);

        station.set_velocity(1000, 512).await.unwrap();
        station
            .set_direction(1000, Direction::Backwards)
            .await
            .unwrap();

        let loco = station.managers().locomotives.get(1000).unwrap();
        assert_eq!(loco.velocity, 512);
        assert_eq!(loco.direction, Direction::Backwards);
        assert_eq!(loco.name, "BR 01");
        assert_eq!(
            handle.sent_lines(),
            vec![
                "get(1, info)",
                "request(1000, control, force)",
                "set(1000, speed[64])",
                "set(1000, dir[1])",
            ]
        );
    }

    #[tokio::test]
    async fn function_switch_updates_table() {
        let mut mock = mock_with_info();
        mock.expect(
            b"request(1000, control, force)\n",
            b"<REPLY request(1000, control, force)>\n<END 0 (OK)>\n",
        );
        mock.expect(
            b"set(1000, func[2, 1])\n",
            b"<REPLY set(1000, func[2, 1])>\n<END 0 (OK)>\n",
        );
        let station = make_station(mock).await;
        seed_locomotive(&station, 1000);

        station.set_function(1000, 2, true).await.unwrap();
        let loco = station.managers().locomotives.get(1000).unwrap();
        let f2 = loco.function(2).unwrap();
        assert!(f2.value);
        assert_eq!(f2.function_type, 52);
    }

    #[tokio::test]
    async fn unknown_locomotive_is_rejected_without_traffic() {
        let mock = mock_with_info();
        let handle = mock.handle();
        let station = make_station(mock).await;

        let result = station.set_velocity(1234, 80).await;
        assert!(matches!(result, Err(Error::UnknownObject(1234))));
        assert_eq!(handle.sent_lines(), vec!["get(1, info)"]);
    }

    #[tokio::test]
    async fn switch_accessory_by_address() {
        let mut mock = mock_with_info();
        mock.expect(
            b"set(11, switch[DCC10g])\n",
            b"<REPLY set(11, switch[DCC10g])>\n<END 0 (OK)>\n",
        );
        let station = make_station(mock).await;
        let mut row = ObjectRow::new(20000);
        row.push("addr", Some("10".into()));
        row.push("protocol", Some("DCC".into()));
        station.managers.accessories.apply_row(&row, false);

        station
            .switch_accessory(10, DecoderType::Dcc, AccessoryValue::Green)
            .await
            .unwrap();
        let accessory = station.managers().accessories.get(20000).unwrap();
        assert_eq!(accessory.value, AccessoryValue::Green);
        assert_eq!(accessory.position, 1);
    }

    #[tokio::test]
    async fn unsolicited_events_are_published() {
        let mock = mock_with_info();
        let handle: MockHandle = mock.handle();
        let station = make_station(mock).await;
        seed_locomotive(&station, 1001);
        let mut rx = station.subscribe().unwrap();

        handle.inject(b"<EVENT 1001>\n1001 speed[64]\n<END 0 (OK)>\n");
        match next_event(&mut rx).await {
            StationEvent::VelocityChanged { locomotive } => {
                assert_eq!(locomotive.id, "1001");
                assert_eq!(locomotive.velocity, 512);
                assert_eq!(locomotive.name, "BR 01");
            }
            other => panic!("unexpected event {other:?}"),
        }

        handle.inject(b"<EVENT 1>\n1 status[GO]\n<END 0 (OK)>\n");
        assert_eq!(next_event(&mut rx).await, StationEvent::PowerChanged { on: true });
    }

    #[tokio::test]
    async fn synchronize_populates_tables() {
        let mut mock = mock_with_info();
        mock.expect(
            b"get(1, status)\n",
            b"<REPLY get(1, status)>\n1 status[GO]\n<END 0 (OK)>\n",
        );
        mock.expect(
            b"queryObjects(10, name, addr, protocol)\n",
            b"<REPLY queryObjects(10, name, addr, protocol)>\n1000 name[\"BR 01\"] addr[3] protocol[DCC128]\n<END 0 (OK)>\n",
        );
        mock.expect(
            b"get(1000, name, addr, protocol, speed, dir, symbol)\n",
            b"<REPLY get(1000, name, addr, protocol, speed, dir, symbol)>\n1000 name[\"BR 01\"] addr[3] protocol[DCC128] speed[10] dir[1] symbol[\"steam\"]\n<END 0 (OK)>\n",
        );
        mock.expect(
            b"get(1000, func[0], func[1])\n",
            b"<REPLY get(1000, func[0], func[1])>\n1000 func[0,1]\n1000 func[1,0]\n<END 0 (OK)>\n",
        );
        mock.expect(
            b"get(1000, funcdesc[0], funcdesc[1])\n",
            b"<REPLY get(1000, funcdesc[0], funcdesc[1])>\n1000 funcdesc[0,3]\n1000 funcdesc[1,7,moment]\n<END 0 (OK)>\n",
        );
        mock.expect(
            b"queryObjects(11, name1, addr, protocol)\n",
            b"<REPLY queryObjects(11, name1, addr, protocol)>\n20000 name1[\"W1\"] addr[1] protocol[DCC]\n<END 0 (OK)>\n",
        );
        mock.expect(
            b"get(20000, name1, addr, protocol, state, gates, addrext, symbol, duration)\n",
            b"<REPLY get(20000, name1, addr, protocol, state, gates, addrext, symbol, duration)>\n20000 name1[\"W1\"] addr[1] protocol[DCC] state[1] gates[2] addrext[1g,1r] symbol[0] duration[250]\n<END 0 (OK)>\n",
        );
        mock.expect(
            b"get(26, size)\n",
            b"<REPLY get(26, size)>\n26 size[1]\n<END 0 (OK)>\n",
        );
        mock.expect(
            b"get(100, ports, state)\n",
            b"<REPLY get(100, ports, state)>\n100 ports[16] state[0xc0]\n<END 0 (OK)>\n",
        );
        let station = EcosBuilder::new("ecos.local")
            .command_timeout(Duration::from_millis(200))
            .auto_retry(false)
            .function_count(2)
            .subscribe_events(false)
            .build_with_transport(Box::new(mock))
            .await
            .unwrap();

        assert_eq!(station.managers().power(), Some(true));

        let locos = station.locomotives().await.unwrap();
        assert_eq!(locos.len(), 1);
        assert_eq!(locos[0].name, "BR 01");
        assert_eq!(locos[0].velocity, 80);
        assert_eq!(locos[0].direction, Direction::Backwards);
        assert_eq!(locos[0].icon.as_deref(), Some("steam"));
        assert!(locos[0].function(0).unwrap().value);
        assert_eq!(locos[0].function(0).unwrap().function_type, 3);
        assert!(locos[0].function(1).unwrap().momentary);

        let accessories = station.accessories().await.unwrap();
        assert_eq!(accessories.len(), 1);
        assert_eq!(accessories[0].name, "W1");
        assert_eq!(accessories[0].value, AccessoryValue::Green);
        assert_eq!(accessories[0].switch_time, Some(250));

        let modules = station.feedback_modules().await.unwrap();
        assert_eq!(modules.len(), 1);
        assert!(modules[0].is_active(1));
        assert!(modules[0].is_active(2));
        assert!(!modules[0].is_active(3));
    }

    #[tokio::test]
    async fn disconnect_releases_control_and_closes() {
        let mut mock = mock_with_info();
        mock.expect(
            b"request(1000, control, force)\n",
            b"<REPLY request(1000, control, force)>\n<END 0 (OK)>\n",
        );
        mock.expect(
            b"set(1000, speed[0])\n",
            b"<REPLY set(1000, speed[0])>\n<END 0 (OK)>\n",
        );
        mock.expect(
            b"release(1000, control)\n",
            b"<REPLY release(1000, control)>\n<END 0 (OK)>\n",
        );
        let handle = mock.handle();
        let station = make_station(mock).await;
        seed_locomotive(&station, 1000);
        station.set_velocity(1000, 0).await.unwrap();
        let mut rx = station.subscribe().unwrap();

        station.disconnect().await.unwrap();
        assert!(!station.is_connected());
        assert_eq!(next_event(&mut rx).await, StationEvent::Disconnected);
        assert_eq!(
            handle.sent_lines().last().map(String::as_str),
            Some("release(1000, control)")
        );
    }
}
