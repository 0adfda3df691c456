//! Entity managers: live device-side tables merged from ECoS messages.
//!
//! There is one manager per object class. Each owns an id-keyed table that
//! lives as long as the connection. Rows are merged field by field: a
//! recognised key overwrites exactly one field, unknown keys are ignored,
//! and keys absent from a row never clear anything. A whole row is merged
//! under one write lock, so readers never see a half-applied update.
//!
//! For unsolicited events the merge also produces the matching
//! [`StationEvent`]s, built from the fully merged entity in the same pass.
//!
//! A value that fails to parse only loses its own field; the other fields
//! of the row are still applied.

use std::collections::HashMap;
use std::str::FromStr;

use parking_lot::RwLock;

use raillib_core::{
    Accessory, AccessoryValue, DecoderType, Direction, FEEDBACK_WORD_PORTS, FeedbackModule,
    Locomotive, StationEvent, StationInfo,
};

use crate::commands::{
    ACCESSORY_IDS, ACCESSORY_MANAGER, BASE_OBJECT, FEEDBACK_ID_OFFSET, FEEDBACK_IDS,
    FEEDBACK_MANAGER, LOCOMOTIVE_IDS, LOCOMOTIVE_MANAGER,
};
use crate::feedback::decode_status_word;
use crate::protocol::{EcosMessage, ObjectRow, unquote};

/// Factor between ECoS speed steps (0..=127) and domain velocity.
pub const VELOCITY_SCALE: u16 = 8;

/// Highest ECoS speed step.
pub const MAX_DEVICE_SPEED: u16 = 127;

/// Convert a device speed step to domain velocity.
pub fn velocity_from_device(speed: u16) -> u16 {
    speed.min(MAX_DEVICE_SPEED) * VELOCITY_SCALE
}

/// Convert a domain velocity to a device speed step.
pub fn velocity_to_device(velocity: u16) -> u8 {
    (velocity / VELOCITY_SCALE).min(MAX_DEVICE_SPEED) as u8
}

/// Parse one field value, logging and discarding it on failure.
fn parse_field<T: FromStr>(id: u32, key: &str, value: &str) -> Option<T> {
    match value.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(object_id = id, key, value, "unparseable field skipped");
            None
        }
    }
}

fn parse_decoder_type(id: u32, value: &str) -> DecoderType {
    match unquote(value).parse::<DecoderType>() {
        Ok(t) => t,
        Err(e) => {
            tracing::debug!(object_id = id, error = %e, "unrecognised decoder protocol");
            DecoderType::Unknown
        }
    }
}

// ---------------------------------------------------------------------------
// Pure merge functions
// ---------------------------------------------------------------------------

/// Which event-relevant locomotive fields a row touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocomotiveUpdate {
    /// `dir[...]` was present and applied.
    pub direction: bool,
    /// `speed[...]` was present and applied.
    pub velocity: bool,
    /// Function numbers whose value was present and applied.
    pub functions: Vec<u8>,
}

/// Merge one row into a locomotive.
pub fn merge_locomotive(loco: &mut Locomotive, row: &ObjectRow) -> LocomotiveUpdate {
    let id = row.id;
    let mut update = LocomotiveUpdate::default();

    for (key, value) in row.fields() {
        let Some(value) = value else { continue };
        match key {
            "name" => loco.name = unquote(value),
            "addr" => {
                if let Some(addr) = parse_field(id, key, value) {
                    loco.address = addr;
                }
            }
            "protocol" => loco.decoder_type = parse_decoder_type(id, value),
            "speed" => {
                if let Some(speed) = parse_field::<u16>(id, key, value) {
                    loco.velocity = velocity_from_device(speed);
                    update.velocity = true;
                }
            }
            "dir" => {
                if let Some(dir) = parse_field::<u8>(id, key, value) {
                    loco.direction = if dir == 0 {
                        Direction::Forwards
                    } else {
                        Direction::Backwards
                    };
                    update.direction = true;
                }
            }
            "active" => {
                if let Some(active) = parse_field::<u8>(id, key, value) {
                    loco.active = active != 0;
                }
            }
            "symbol" => loco.icon = Some(unquote(value)),
            "func" => {
                if let Some(number) = merge_function_value(loco, id, value) {
                    update.functions.push(number);
                }
            }
            "funcdesc" => merge_function_descriptor(loco, id, value),
            _ => {}
        }
    }

    update
}

/// Apply `func[n,v]`. Returns the function number on success.
fn merge_function_value(loco: &mut Locomotive, id: u32, value: &str) -> Option<u8> {
    let mut parts = value.split(',').map(str::trim);
    let number = parse_field::<u8>(id, "func", parts.next()?)?;
    let on = parse_field::<u8>(id, "func", parts.next()?)? != 0;
    loco.function_mut(number).value = on;
    Some(number)
}

/// Apply `funcdesc[n,type]` or `funcdesc[n,type,moment]`.
fn merge_function_descriptor(loco: &mut Locomotive, id: u32, value: &str) {
    let mut parts = value.split(',').map(str::trim);
    let Some(number) = parts.next().and_then(|n| parse_field::<u8>(id, "funcdesc", n)) else {
        return;
    };
    let function_type = parts
        .next()
        .and_then(|t| parse_field::<u16>(id, "funcdesc", t));
    let momentary = parts.next().is_some_and(|m| unquote(m) == "moment");

    let function = loco.function_mut(number);
    if let Some(function_type) = function_type {
        function.function_type = function_type;
    }
    function.momentary = momentary;
}

/// Whether an accessory row changed the position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessoryUpdate {
    /// `state[...]` was present and applied.
    pub position: bool,
}

/// Merge one row into an accessory.
pub fn merge_accessory(accessory: &mut Accessory, row: &ObjectRow) -> AccessoryUpdate {
    let id = row.id;
    let mut update = AccessoryUpdate::default();
    let mut addrext = None;

    for (key, value) in row.fields() {
        let Some(value) = value else { continue };
        match key {
            "name1" | "name" => accessory.name = unquote(value),
            "addr" => {
                if let Some(addr) = parse_field(id, key, value) {
                    accessory.address = addr;
                }
            }
            "protocol" => accessory.decoder_type = parse_decoder_type(id, value),
            "state" => {
                if let Some(position) = parse_field::<u8>(id, key, value) {
                    accessory.set_position(position);
                    update.position = true;
                }
            }
            "gates" => {
                if let Some(states) = parse_field::<u8>(id, key, value) {
                    accessory.states = states.clamp(2, 4);
                }
            }
            "addrext" => addrext = Some(value),
            "symbol" => accessory.icon = Some(unquote(value)),
            "duration" => {
                if let Some(ms) = parse_field(id, key, value) {
                    accessory.switch_time = Some(ms);
                }
            }
            _ => {}
        }
    }

    if let Some(addrext) = addrext {
        accessory.secondary_address = secondary_address(accessory.address, addrext);
    }

    update
}

/// First address in an `addrext` list (`10g,10r,11g,11r`) that differs
/// from the primary one.
fn secondary_address(primary: u32, addrext: &str) -> Option<u32> {
    addrext
        .split(',')
        .filter_map(|part| {
            part.trim()
                .trim_end_matches(|c: char| c.is_ascii_alphabetic())
                .parse::<u32>()
                .ok()
        })
        .find(|&addr| addr != primary)
}

/// Parse a `switch[DCC10g]` token into protocol, address and output value.
pub fn parse_switch_token(token: &str) -> Option<(DecoderType, u32, AccessoryValue)> {
    let token = unquote(token);
    let value = match token.chars().last()? {
        'g' | 'G' => AccessoryValue::Green,
        'r' | 'R' => AccessoryValue::Red,
        _ => return None,
    };
    let body = &token[..token.len() - 1];
    let digits_at = body.find(|c: char| c.is_ascii_digit())?;
    let address = body[digits_at..].parse::<u32>().ok()?;
    let decoder_type = body[..digits_at]
        .parse::<DecoderType>()
        .unwrap_or(DecoderType::Dcc);
    Some((decoder_type, address, value))
}

/// Merge one row into a feedback module. Returns the 1-based ports whose
/// state changed when a status word was applied.
pub fn merge_feedback_module(module: &mut FeedbackModule, row: &ObjectRow) -> Vec<u16> {
    let id = row.id;
    let mut changed = Vec::new();

    for (key, value) in row.fields() {
        let Some(value) = value else { continue };
        match key {
            "ports" => {
                if let Some(count) = parse_field::<u8>(id, key, value) {
                    module.port_count = count.clamp(1, FEEDBACK_WORD_PORTS as u8);
                }
            }
            "state" => match decode_status_word(value) {
                Ok(ports) => {
                    module.update(ports);
                    changed = module.changed_ports();
                }
                Err(e) => {
                    tracing::warn!(object_id = id, error = %e, "feedback word skipped");
                }
            },
            _ => {}
        }
    }

    changed
}

/// Read model and version strings from a `get(1, info)` row.
pub fn merge_station_info(info: &mut StationInfo, row: &ObjectRow) {
    for (key, value) in row.fields() {
        match (key, value) {
            ("ProtocolVersion", Some(v)) => info.protocol_version = Some(unquote(v)),
            ("ApplicationVersion", Some(v)) => info.application_version = Some(unquote(v)),
            ("HardwareVersion", Some(v)) => info.hardware_version = Some(unquote(v)),
            (model, None) if model.starts_with("ECoS") || model.starts_with("CentralStation") => {
                info.model = model.to_string();
            }
            _ => {}
        }
    }
    if info.manufacturer.is_empty() {
        info.manufacturer = "ESU".to_string();
    }
}

// ---------------------------------------------------------------------------
// Managers
// ---------------------------------------------------------------------------

/// Live locomotive table.
#[derive(Debug, Default)]
pub struct LocomotiveManager {
    table: RwLock<HashMap<u32, Locomotive>>,
}

impl LocomotiveManager {
    /// Snapshot of one locomotive.
    pub fn get(&self, id: u32) -> Option<Locomotive> {
        self.table.read().get(&id).cloned()
    }

    /// Snapshot of all locomotives, ordered by object id.
    pub fn all(&self) -> Vec<Locomotive> {
        let table = self.table.read();
        let mut ids: Vec<&u32> = table.keys().collect();
        ids.sort();
        ids.into_iter().map(|id| table[id].clone()).collect()
    }

    /// Object ids of all known locomotives, ascending.
    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.table.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of known locomotives.
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    /// Whether no locomotive is known.
    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    /// Merge a row, creating the locomotive on first sight.
    pub fn apply_row(&self, row: &ObjectRow, notify: bool) -> Vec<StationEvent> {
        let mut table = self.table.write();
        let loco = table
            .entry(row.id)
            .or_insert_with(|| Locomotive::new(row.id.to_string()));
        let update = merge_locomotive(loco, row);
        if !notify {
            return Vec::new();
        }

        let mut events = Vec::new();
        if update.direction {
            events.push(StationEvent::DirectionChanged {
                locomotive: loco.clone(),
            });
        }
        if update.velocity {
            events.push(StationEvent::VelocityChanged {
                locomotive: loco.clone(),
            });
        }
        for number in update.functions {
            events.push(StationEvent::FunctionChanged {
                locomotive: loco.clone(),
                number,
            });
        }
        events
    }
}

/// Live accessory table.
#[derive(Debug, Default)]
pub struct AccessoryManager {
    table: RwLock<HashMap<u32, Accessory>>,
}

impl AccessoryManager {
    /// Snapshot of one accessory.
    pub fn get(&self, id: u32) -> Option<Accessory> {
        self.table.read().get(&id).cloned()
    }

    /// Snapshot of all accessories, ordered by object id.
    pub fn all(&self) -> Vec<Accessory> {
        let table = self.table.read();
        let mut ids: Vec<&u32> = table.keys().collect();
        ids.sort();
        ids.into_iter().map(|id| table[id].clone()).collect()
    }

    /// Object ids of all known accessories, ascending.
    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.table.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of known accessories.
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    /// Whether no accessory is known.
    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    /// Snapshot of the accessory driven by `address`, with the combined
    /// position that `value` on that address selects.
    ///
    /// A multi-state signal also answers for its secondary address.
    pub fn find_by_output(&self, address: u32, value: AccessoryValue) -> Option<(u32, u8)> {
        let table = self.table.read();
        if let Some((id, _)) = table.iter().find(|(_, a)| a.address == address) {
            return Some((*id, value.offset()));
        }
        table
            .iter()
            .find(|(_, a)| {
                a.is_multi_state()
                    && (a.secondary_address == Some(address)
                        || a.address.checked_add(1) == Some(address))
            })
            .map(|(id, _)| (*id, 2 + value.offset()))
    }

    /// Merge a row, creating the accessory on first sight.
    pub fn apply_row(&self, row: &ObjectRow, notify: bool) -> Vec<StationEvent> {
        let mut table = self.table.write();
        let accessory = table
            .entry(row.id)
            .or_insert_with(|| Accessory::new(row.id.to_string()));
        let update = merge_accessory(accessory, row);
        if notify && update.position {
            vec![StationEvent::AccessoryChanged {
                accessory: accessory.clone(),
            }]
        } else {
            Vec::new()
        }
    }

    /// Apply a `switch[...]` report on the accessory manager.
    ///
    /// Known accessories are updated in place. An address without a device
    /// object still yields an event carrying a bare accessory with that
    /// address so it can be matched against the persisted inventory.
    pub fn apply_switch(&self, token: &str, notify: bool) -> Vec<StationEvent> {
        let Some((decoder_type, address, value)) = parse_switch_token(token) else {
            tracing::warn!(token, "unparseable switch report");
            return Vec::new();
        };

        let accessory = match self.find_by_output(address, value) {
            Some((id, position)) => {
                let mut table = self.table.write();
                let Some(accessory) = table.get_mut(&id) else {
                    return Vec::new();
                };
                accessory.set_position(position);
                accessory.clone()
            }
            None => {
                let mut accessory = Accessory {
                    address,
                    decoder_type,
                    ..Accessory::default()
                };
                accessory.set_position(value.offset());
                accessory
            }
        };

        if notify {
            vec![StationEvent::AccessoryChanged { accessory }]
        } else {
            Vec::new()
        }
    }
}

/// Live feedback module table.
#[derive(Debug, Default)]
pub struct FeedbackManager {
    table: RwLock<HashMap<u32, FeedbackModule>>,
}

impl FeedbackManager {
    /// Snapshot of one module.
    pub fn get(&self, id: u32) -> Option<FeedbackModule> {
        self.table.read().get(&id).cloned()
    }

    /// Snapshot of all modules, ordered by object id.
    pub fn all(&self) -> Vec<FeedbackModule> {
        let mut modules: Vec<FeedbackModule> = self.table.read().values().cloned().collect();
        modules.sort_by_key(|m| m.id);
        modules
    }

    /// Object ids of all known modules, ascending.
    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.table.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of known modules.
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    /// Whether no module is known.
    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    /// Make sure modules `0..count` exist.
    pub fn ensure_modules(&self, count: u32) {
        let mut table = self.table.write();
        for number in 0..count {
            let id = FEEDBACK_ID_OFFSET + number;
            if !FEEDBACK_IDS.contains(&id) {
                tracing::warn!(count, "feedback module count exceeds id range");
                break;
            }
            table
                .entry(id)
                .or_insert_with(|| FeedbackModule::new(id, number));
        }
    }

    /// Merge a row, creating the module on first sight.
    pub fn apply_row(&self, row: &ObjectRow, notify: bool) -> Vec<StationEvent> {
        let mut table = self.table.write();
        let module = table
            .entry(row.id)
            .or_insert_with(|| FeedbackModule::new(row.id, row.id - FEEDBACK_ID_OFFSET));
        let changed = merge_feedback_module(module, row);
        if !notify {
            return Vec::new();
        }
        changed
            .into_iter()
            .map(|port| StationEvent::SensorChanged {
                sensor: module.sensor(port),
            })
            .collect()
    }
}

/// All entity managers of one connection plus base-object state.
#[derive(Debug, Default)]
pub struct EntityManagers {
    /// Locomotives.
    pub locomotives: LocomotiveManager,
    /// Turnouts and signals.
    pub accessories: AccessoryManager,
    /// Feedback modules.
    pub feedback: FeedbackManager,
    power: RwLock<Option<bool>>,
    info: RwLock<StationInfo>,
}

impl EntityManagers {
    /// Empty tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last known track power state.
    pub fn power(&self) -> Option<bool> {
        *self.power.read()
    }

    /// Record a power state confirmed by an accepted command.
    pub fn record_power(&self, on: bool) {
        *self.power.write() = Some(on);
    }

    /// Station information gathered so far.
    pub fn info(&self) -> StationInfo {
        self.info.read().clone()
    }

    /// Merge every row of a message into the tables.
    ///
    /// Events are produced only for unsolicited messages. A non-zero error
    /// code does not stop usable rows from being merged.
    pub fn apply(&self, msg: &EcosMessage) -> Vec<StationEvent> {
        let notify = msg.is_event();
        if !msg.is_valid() {
            tracing::debug!(
                object_id = msg.object_id(),
                code = msg.error_code(),
                status = msg.status(),
                "merging rows of a failed reply"
            );
        }

        let mut events = Vec::new();
        for row in msg.rows() {
            events.extend(self.apply_row(row, notify));
        }
        events
    }

    fn apply_row(&self, row: &ObjectRow, notify: bool) -> Vec<StationEvent> {
        match row.id {
            BASE_OBJECT => self.apply_base(row, notify),
            LOCOMOTIVE_MANAGER => Vec::new(),
            ACCESSORY_MANAGER => row
                .values("switch")
                .flat_map(|token| self.accessories.apply_switch(token, notify))
                .collect(),
            FEEDBACK_MANAGER => {
                if let Some(size) = row.get("size") {
                    if let Some(count) = parse_field::<u32>(row.id, "size", size) {
                        self.feedback.ensure_modules(count);
                    }
                }
                Vec::new()
            }
            id if LOCOMOTIVE_IDS.contains(&id) => self.locomotives.apply_row(row, notify),
            id if ACCESSORY_IDS.contains(&id) => self.accessories.apply_row(row, notify),
            id if FEEDBACK_IDS.contains(&id) => self.feedback.apply_row(row, notify),
            id => {
                tracing::warn!(object_id = id, "row for unknown object ignored");
                Vec::new()
            }
        }
    }

    fn apply_base(&self, row: &ObjectRow, notify: bool) -> Vec<StationEvent> {
        let mut events = Vec::new();
        if let Some(status) = row.get("status") {
            let on = match status.trim() {
                "GO" => Some(true),
                "STOP" | "SHUTDOWN" => Some(false),
                other => {
                    tracing::warn!(status = other, "unknown station status");
                    None
                }
            };
            if let Some(on) = on {
                *self.power.write() = Some(on);
                if notify {
                    events.push(StationEvent::PowerChanged { on });
                }
            }
        }
        if row.fields().any(|(k, _)| k.ends_with("Version")) {
            merge_station_info(&mut self.info.write(), row);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(text: &str) -> EcosMessage {
        EcosMessage::parse(text).unwrap()
    }

    fn row(line: &str) -> ObjectRow {
        crate::protocol::tokenize_line(line).remove(0)
    }

    #[test]
    fn velocity_conversion() {
        assert_eq!(velocity_from_device(64), 512);
        assert_eq!(velocity_from_device(0), 0);
        assert_eq!(velocity_from_device(127), 1016);
        assert_eq!(velocity_from_device(200), 1016);
        assert_eq!(velocity_to_device(512), 64);
        assert_eq!(velocity_to_device(1016), 127);
        assert_eq!(velocity_to_device(u16::MAX), 127);
    }

    #[test]
    fn speed_scaled_once_per_merge() {
        let mut loco = Locomotive::new("1001");
        merge_locomotive(&mut loco, &row("1001 speed[64]"));
        assert_eq!(loco.velocity, 512);
        merge_locomotive(&mut loco, &row("1001 speed[64]"));
        assert_eq!(loco.velocity, 512);
    }

    #[test]
    fn partial_merge_keeps_other_fields() {
        let mut loco = Locomotive::new("1000");
        merge_locomotive(&mut loco, &row("1000 name[\"BR 01\"] addr[3] protocol[DCC128]"));
        let update = merge_locomotive(&mut loco, &row("1000 speed[10]"));
        assert!(update.velocity);
        assert!(!update.direction);
        assert_eq!(loco.velocity, 80);
        assert_eq!(loco.name, "BR 01");
        assert_eq!(loco.address, 3);
        assert_eq!(loco.decoder_type, DecoderType::Dcc);
    }

    #[test]
    fn bad_number_only_skips_its_field() {
        let mut loco = Locomotive::new("1000");
        loco.address = 7;
        merge_locomotive(&mut loco, &row("1000 addr[x7] speed[5] name[\"V100\"]"));
        assert_eq!(loco.address, 7);
        assert_eq!(loco.velocity, 40);
        assert_eq!(loco.name, "V100");
    }

    #[test]
    fn direction_mapping() {
        let mut loco = Locomotive::new("1000");
        merge_locomotive(&mut loco, &row("1000 dir[1]"));
        assert_eq!(loco.direction, Direction::Backwards);
        merge_locomotive(&mut loco, &row("1000 dir[0]"));
        assert_eq!(loco.direction, Direction::Forwards);
    }

    #[test]
    fn functions_values_and_descriptors() {
        let mut loco = Locomotive::new("1000");
        let update = merge_locomotive(
            &mut loco,
            &row("1000 func[0,1] func[1, 0] funcdesc[1,7,moment] funcdesc[0,3]"),
        );
        assert_eq!(update.functions, vec![0, 1]);

        let f0 = loco.function(0).unwrap();
        assert!(f0.value);
        assert_eq!(f0.function_type, 3);
        assert!(!f0.momentary);

        let f1 = loco.function(1).unwrap();
        assert!(!f1.value);
        assert_eq!(f1.function_type, 7);
        assert!(f1.momentary);

        // Value without descriptor gets the default type.
        merge_locomotive(&mut loco, &row("1000 func[4,1]"));
        assert_eq!(loco.function(4).unwrap().function_type, 54);
    }

    #[test]
    fn accessory_merge() {
        let mut signal = Accessory::new("20001");
        merge_accessory(
            &mut signal,
            &row("20001 name1[\"S1\"] addr[10] protocol[DCC] addrext[10g,10r,11g,11r] gates[4] duration[250]"),
        );
        assert_eq!(signal.name, "S1");
        assert_eq!(signal.address, 10);
        assert_eq!(signal.states, 4);
        assert_eq!(signal.secondary_address, Some(11));
        assert_eq!(signal.switch_time, Some(250));

        let update = merge_accessory(&mut signal, &row("20001 state[3]"));
        assert!(update.position);
        assert_eq!(signal.position, 3);
        assert_eq!(signal.value, AccessoryValue::Green);
        assert_eq!(signal.name, "S1");
    }

    #[test]
    fn signal_detail_with_two_gates() {
        let mut a = Accessory::new("20002");
        merge_accessory(&mut a, &row("20002 addr[10] addrext[10g,10r] gates[2]"));
        assert_eq!(a.states, 2);
        assert_eq!(a.secondary_address, None);
    }

    #[test]
    fn switch_token_parsing() {
        assert_eq!(
            parse_switch_token("DCC11g"),
            Some((DecoderType::Dcc, 11, AccessoryValue::Green))
        );
        assert_eq!(
            parse_switch_token("MM5r"),
            Some((DecoderType::Mm, 5, AccessoryValue::Red))
        );
        assert_eq!(parse_switch_token("DCC11"), None);
        assert_eq!(parse_switch_token("g"), None);
    }

    #[test]
    fn feedback_merge_tracks_changes() {
        let mut module = FeedbackModule::new(100, 0);
        assert_eq!(merge_feedback_module(&mut module, &row("100 ports[16] state[0xc0]")), vec![1, 2]);
        assert!(merge_feedback_module(&mut module, &row("100 state[0xc0]")).is_empty());
        assert_eq!(merge_feedback_module(&mut module, &row("100 state[0x80]")), vec![2]);
    }

    #[test]
    fn feedback_bad_word_keeps_state() {
        let mut module = FeedbackModule::new(100, 0);
        merge_feedback_module(&mut module, &row("100 state[0x80]"));
        let changed = merge_feedback_module(&mut module, &row("100 ports[8] state[0xzz]"));
        assert!(changed.is_empty());
        assert_eq!(module.port_count, 8);
        assert!(module.is_active(1));
    }

    #[test]
    fn station_info_parsing() {
        let mut info = StationInfo::default();
        merge_station_info(
            &mut info,
            &row("1 ECoS2 ProtocolVersion[0.5] ApplicationVersion[4.2.9] HardwareVersion[2.1]"),
        );
        assert_eq!(info.manufacturer, "ESU");
        assert_eq!(info.model, "ECoS2");
        assert_eq!(info.protocol_version.as_deref(), Some("0.5"));
        assert_eq!(info.application_version.as_deref(), Some("4.2.9"));
        assert_eq!(info.hardware_version.as_deref(), Some("2.1"));
    }

    #[test]
    fn reply_merges_without_events() {
        let managers = EntityManagers::new();
        let events = managers.apply(&msg(
            "<REPLY queryObjects(10, name, addr)>\n1000 name[\"A\"] addr[3]\n1001 name[\"B\"] addr[4]\n<END 0 (OK)>",
        ));
        assert!(events.is_empty());
        assert_eq!(managers.locomotives.len(), 2);
        assert_eq!(managers.locomotives.get(1001).unwrap().name, "B");
        assert_eq!(managers.locomotives.ids(), vec![1000, 1001]);
    }

    #[test]
    fn event_merges_and_notifies_with_full_entity() {
        let managers = EntityManagers::new();
        managers.apply(&msg("<REPLY get(1001, name)>\n1001 name[\"V200\"]\n<END 0 (OK)>"));
        let events = managers.apply(&msg("<EVENT 1001>\n1001 speed[64]\n<END 0 (OK)>"));
        assert_eq!(events.len(), 1);
        match &events[0] {
            StationEvent::VelocityChanged { locomotive } => {
                assert_eq!(locomotive.velocity, 512);
                assert_eq!(locomotive.name, "V200");
                assert_eq!(locomotive.id, "1001");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn event_with_several_changes() {
        let managers = EntityManagers::new();
        let events = managers.apply(&msg(
            "<EVENT 1002>\n1002 dir[1] speed[3]\n1002 func[2,1]\n<END 0 (OK)>",
        ));
        let kinds: Vec<_> = events.iter().map(StationEvent::kind).collect();
        assert_eq!(
            kinds,
            vec![
                raillib_core::EventKind::Direction,
                raillib_core::EventKind::Velocity,
                raillib_core::EventKind::Function,
            ]
        );
    }

    #[test]
    fn unknown_object_creates_nothing() {
        let managers = EntityManagers::new();
        let events = managers.apply(&msg("<EVENT 50000>\n50000 state[1]\n<END 0 (OK)>"));
        assert!(events.is_empty());
        assert!(managers.locomotives.is_empty());
        assert!(managers.accessories.is_empty());
        assert!(managers.feedback.is_empty());
    }

    #[test]
    fn power_status() {
        let managers = EntityManagers::new();
        assert_eq!(managers.power(), None);
        let events = managers.apply(&msg("<REPLY get(1, status)>\n1 status[GO]\n<END 0 (OK)>"));
        assert!(events.is_empty());
        assert_eq!(managers.power(), Some(true));

        let events = managers.apply(&msg("<EVENT 1>\n1 status[STOP]\n<END 0 (OK)>"));
        assert_eq!(events, vec![StationEvent::PowerChanged { on: false }]);
        assert_eq!(managers.power(), Some(false));
    }

    #[test]
    fn feedback_size_creates_modules() {
        let managers = EntityManagers::new();
        managers.apply(&msg("<REPLY get(26, size)>\n26 size[2]\n<END 0 (OK)>"));
        assert_eq!(managers.feedback.ids(), vec![100, 101]);
        assert_eq!(managers.feedback.get(101).unwrap().module_number, 1);
    }

    #[test]
    fn feedback_event_emits_sensor_changes() {
        let managers = EntityManagers::new();
        managers.apply(&msg("<REPLY get(100, state)>\n100 state[0xc0]\n<END 0 (OK)>"));
        let events = managers.apply(&msg("<EVENT 100>\n100 state[0x80]\n<END 0 (OK)>"));
        assert_eq!(events.len(), 1);
        match &events[0] {
            StationEvent::SensorChanged { sensor } => {
                assert_eq!(sensor.device_id, 100);
                assert_eq!(sensor.contact_id, 2);
                assert!(!sensor.active);
                assert!(sensor.previously_active);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn switch_report_on_secondary_address_folds() {
        let managers = EntityManagers::new();
        managers.apply(&msg(
            "<REPLY get(20001, addr, gates)>\n20001 addr[10] gates[4]\n<END 0 (OK)>",
        ));
        let events = managers.apply(&msg("<EVENT 11>\n11 switch[DCC11g]\n<END 0 (OK)>"));
        match &events[..] {
            [StationEvent::AccessoryChanged { accessory }] => {
                assert_eq!(accessory.id, "20001");
                assert_eq!(accessory.position, 3);
            }
            other => panic!("unexpected events {other:?}"),
        }
        assert_eq!(managers.accessories.len(), 1);
    }

    #[test]
    fn switch_report_next_to_top_address_does_not_overflow() {
        let managers = EntityManagers::new();
        managers.apply(&msg(
            "<REPLY get(20000, addr, gates)>\n20000 addr[4294967295] gates[4]\n<END 0 (OK)>",
        ));
        let events = managers.apply(&msg("<EVENT 11>\n11 switch[DCC5g]\n<END 0 (OK)>"));
        match &events[..] {
            [StationEvent::AccessoryChanged { accessory }] => {
                assert!(accessory.id.is_empty());
                assert_eq!(accessory.address, 5);
            }
            other => panic!("unexpected events {other:?}"),
        }
        assert_eq!(managers.accessories.find_by_output(0, AccessoryValue::Red), None);
    }

    #[test]
    fn switch_report_for_unknown_address() {
        let managers = EntityManagers::new();
        let events = managers.apply(&msg("<EVENT 11>\n11 switch[DCC7r]\n<END 0 (OK)>"));
        match &events[..] {
            [StationEvent::AccessoryChanged { accessory }] => {
                assert!(accessory.id.is_empty());
                assert_eq!(accessory.address, 7);
                assert_eq!(accessory.value, AccessoryValue::Red);
            }
            other => panic!("unexpected events {other:?}"),
        }
        assert!(managers.accessories.is_empty());
    }

    #[test]
    fn failed_reply_still_merges() {
        let managers = EntityManagers::new();
        managers.apply(&msg(
            "<REPLY get(1000, name, bogus)>\n1000 name[\"A\"]\n<END 11 (NERROR_UNKNOWNID)>",
        ));
        assert_eq!(managers.locomotives.get(1000).unwrap().name, "A");
    }
}
