//! Core entity types used throughout raillib.
//!
//! These types are the normalized, vendor-agnostic model of what a command
//! station exposes: locomotives, accessories (turnouts and signals) and
//! feedback modules with their sensor ports. The same record types are used
//! for the live device-side tables and for the persisted inventory.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Number of ports a feedback module reports in one status word.
pub const FEEDBACK_WORD_PORTS: usize = 16;

/// Default number of configured ports on a feedback module.
pub const DEFAULT_PORT_COUNT: u8 = 16;

/// Offset added to a function number to derive the default function type
/// when the station does not describe the function.
pub const DEFAULT_FUNCTION_TYPE_BASE: u16 = 50;

/// Travel direction of a locomotive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    /// Forwards (cab 1 leading).
    #[default]
    Forwards,
    /// Backwards.
    Backwards,
}

impl Direction {
    /// The opposite direction.
    pub fn toggle(self) -> Self {
        match self {
            Direction::Forwards => Direction::Backwards,
            Direction::Backwards => Direction::Forwards,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forwards => write!(f, "forwards"),
            Direction::Backwards => write!(f, "backwards"),
        }
    }
}

/// Digital format spoken to a locomotive or accessory decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DecoderType {
    /// NMRA DCC (any speed-step variant).
    Dcc,
    /// Märklin Motorola (MM1/MM2).
    Mm,
    /// Märklin mfx.
    Mfx,
    /// Selectrix.
    Sx,
    /// Protocol string the station reported but we do not recognise.
    #[default]
    Unknown,
}

impl fmt::Display for DecoderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecoderType::Dcc => "DCC",
            DecoderType::Mm => "MM",
            DecoderType::Mfx => "MFX",
            DecoderType::Sx => "SX",
            DecoderType::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// Error returned when a string cannot be parsed into a [`DecoderType`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDecoderTypeError(String);

impl fmt::Display for ParseDecoderTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown decoder type: {}", self.0)
    }
}

impl std::error::Error for ParseDecoderTypeError {}

impl FromStr for DecoderType {
    type Err = ParseDecoderTypeError;

    /// Parse a protocol string as reported by a command station.
    ///
    /// Speed-step suffixes are ignored: `DCC28`, `DCC128` and `DCC` all map
    /// to [`DecoderType::Dcc`]; `MM14`, `MM28` map to [`DecoderType::Mm`].
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        if upper.starts_with("DCC") {
            Ok(DecoderType::Dcc)
        } else if upper.starts_with("MFX") {
            Ok(DecoderType::Mfx)
        } else if upper.starts_with("MM") {
            Ok(DecoderType::Mm)
        } else if upper.starts_with("SX") {
            Ok(DecoderType::Sx)
        } else {
            Err(ParseDecoderTypeError(s.to_string()))
        }
    }
}

/// One locomotive function (headlight, horn, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRecord {
    /// Function number (F0 = 0).
    pub number: u8,
    /// Whether the function is switched on.
    pub value: bool,
    /// Station-specific function type / icon code.
    pub function_type: u16,
    /// Whether the function is momentary (active only while pressed).
    pub momentary: bool,
}

impl FunctionRecord {
    /// A switched-off, latching function with the default type code.
    pub fn new(number: u8) -> Self {
        FunctionRecord {
            number,
            value: false,
            function_type: DEFAULT_FUNCTION_TYPE_BASE + number as u16,
            momentary: false,
        }
    }
}

/// A locomotive, either as seen by the command station or as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Locomotive {
    /// Identifier. Device object id for live entities, canonical record id
    /// for persisted ones.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Decoder protocol.
    pub decoder_type: DecoderType,
    /// Decoder address.
    pub address: u32,
    /// Current travel direction.
    pub direction: Direction,
    /// Current velocity in domain units (0..=1016).
    pub velocity: u16,
    /// Whether the locomotive is active on the track.
    pub active: bool,
    /// Icon / symbol reference.
    pub icon: Option<String>,
    /// User-assigned group. Never set by a command station.
    pub group: Option<String>,
    /// Functions keyed by function number.
    pub functions: BTreeMap<u8, FunctionRecord>,
}

impl Locomotive {
    /// A bare locomotive with only its id set.
    pub fn new(id: impl Into<String>) -> Self {
        Locomotive {
            id: id.into(),
            ..Locomotive::default()
        }
    }

    /// Look up a function by number.
    pub fn function(&self, number: u8) -> Option<&FunctionRecord> {
        self.functions.get(&number)
    }

    /// Mutable access to a function, creating a default record when absent.
    pub fn function_mut(&mut self, number: u8) -> &mut FunctionRecord {
        self.functions
            .entry(number)
            .or_insert_with(|| FunctionRecord::new(number))
    }
}

/// The two-valued state of one accessory output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AccessoryValue {
    /// Red / diverging / stop.
    #[default]
    Red,
    /// Green / straight / clear.
    Green,
}

impl AccessoryValue {
    /// The value of an output given a combined accessory position.
    ///
    /// Even positions are red, odd positions are green, for both the
    /// primary (0/1) and the secondary (2/3) output.
    pub fn from_position(position: u8) -> Self {
        if position % 2 == 0 {
            AccessoryValue::Red
        } else {
            AccessoryValue::Green
        }
    }

    /// Offset of this value within one output (0 for red, 1 for green).
    pub fn offset(self) -> u8 {
        match self {
            AccessoryValue::Red => 0,
            AccessoryValue::Green => 1,
        }
    }
}

impl fmt::Display for AccessoryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessoryValue::Red => write!(f, "red"),
            AccessoryValue::Green => write!(f, "green"),
        }
    }
}

/// A turnout or signal.
///
/// Signals with more than two aspects occupy two consecutive decoder
/// addresses; positions 0/1 drive the primary address and positions 2/3 the
/// secondary one (`address + 1`). Both outputs live in this one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accessory {
    /// Identifier. Device object id for live entities, canonical record id
    /// for persisted ones.
    pub id: String,
    /// Primary decoder address.
    pub address: u32,
    /// Decoder protocol.
    pub decoder_type: DecoderType,
    /// Display name.
    pub name: String,
    /// Icon / symbol reference.
    pub icon: Option<String>,
    /// User-assigned group. Never set by a command station.
    pub group: Option<String>,
    /// Output pulse length in milliseconds.
    pub switch_time: Option<u32>,
    /// Combined position (0..states).
    pub position: u8,
    /// Value of the most recently driven output.
    pub value: AccessoryValue,
    /// Number of states: 2 for turnouts, up to 4 for multi-aspect signals.
    pub states: u8,
    /// Secondary address for multi-state signals, as reported by the station.
    pub secondary_address: Option<u32>,
}

impl Default for Accessory {
    fn default() -> Self {
        Accessory {
            id: String::new(),
            address: 0,
            decoder_type: DecoderType::default(),
            name: String::new(),
            icon: None,
            group: None,
            switch_time: None,
            position: 0,
            value: AccessoryValue::Red,
            states: 2,
            secondary_address: None,
        }
    }
}

impl Accessory {
    /// A bare two-state accessory with only its id set.
    pub fn new(id: impl Into<String>) -> Self {
        Accessory {
            id: id.into(),
            ..Accessory::default()
        }
    }

    /// Whether this accessory needs a second address (more than 2 states).
    pub fn is_multi_state(&self) -> bool {
        self.states > 2
    }

    /// Set the combined position and derive the output value from it.
    pub fn set_position(&mut self, position: u8) {
        self.position = position;
        self.value = AccessoryValue::from_position(position);
    }

    /// The decoder address that drives the given combined position.
    pub fn output_address(&self, position: u8) -> u32 {
        if position >= 2 {
            self.address.saturating_add(1)
        } else {
            self.address
        }
    }
}

/// A feedback (occupancy) module with its port state vectors.
///
/// The module always keeps all [`FEEDBACK_WORD_PORTS`] bits of the last
/// status word; only the first `port_count` ports are exposed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackModule {
    /// Device object id.
    pub id: u32,
    /// Module number on the feedback bus (0-based).
    pub module_number: u32,
    /// Number of configured ports.
    pub port_count: u8,
    current: [bool; FEEDBACK_WORD_PORTS],
    previous: [bool; FEEDBACK_WORD_PORTS],
}

impl FeedbackModule {
    /// A module with all ports inactive and the default port count.
    pub fn new(id: u32, module_number: u32) -> Self {
        FeedbackModule {
            id,
            module_number,
            port_count: DEFAULT_PORT_COUNT,
            current: [false; FEEDBACK_WORD_PORTS],
            previous: [false; FEEDBACK_WORD_PORTS],
        }
    }

    /// Replace the current port vector with a freshly decoded one.
    ///
    /// The old current vector moves into the previous slot first, so after
    /// this call `changed_ports()` reports exactly the ports that differ
    /// from the value immediately before this update.
    pub fn update(&mut self, ports: [bool; FEEDBACK_WORD_PORTS]) {
        self.previous = self.current;
        self.current = ports;
    }

    fn exposed(&self) -> usize {
        (self.port_count as usize).min(FEEDBACK_WORD_PORTS)
    }

    /// Current state of the configured ports (index 0 = port 1).
    pub fn ports(&self) -> &[bool] {
        &self.current[..self.exposed()]
    }

    /// State of the configured ports before the latest update.
    pub fn previous_ports(&self) -> &[bool] {
        &self.previous[..self.exposed()]
    }

    /// Whether the given 1-based port is active.
    pub fn is_active(&self, port: u16) -> bool {
        port >= 1 && (port as usize) <= self.exposed() && self.current[port as usize - 1]
    }

    /// 1-based numbers of configured ports whose state differs between the
    /// previous and current vectors (`current XOR previous`).
    pub fn changed_ports(&self) -> Vec<u16> {
        (0..self.exposed())
            .filter(|&i| self.current[i] ^ self.previous[i])
            .map(|i| i as u16 + 1)
            .collect()
    }

    /// Build the sensor view of one 1-based port.
    pub fn sensor(&self, port: u16) -> Sensor {
        let idx = port.saturating_sub(1) as usize;
        let in_range = port >= 1 && idx < self.exposed();
        Sensor {
            id: format!("{}-{}", self.id, port),
            device_id: self.id,
            contact_id: port,
            name: String::new(),
            active: in_range && self.current[idx],
            previously_active: in_range && self.previous[idx],
        }
    }
}

/// One sensor contact: a single port of a feedback module.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sensor {
    /// Identifier. `"<module>-<port>"` for live sensors, canonical record id
    /// for persisted ones.
    pub id: String,
    /// Device object id of the feedback module.
    pub device_id: u32,
    /// 1-based port number on the module.
    pub contact_id: u16,
    /// Display name.
    pub name: String,
    /// Whether the contact is occupied.
    pub active: bool,
    /// Whether the contact was occupied before the latest update.
    pub previously_active: bool,
}

/// Static information reported by a command station.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StationInfo {
    /// Manufacturer name (e.g. "ESU").
    pub manufacturer: String,
    /// Model name (e.g. "ECoS").
    pub model: String,
    /// Protocol version string.
    pub protocol_version: Option<String>,
    /// Firmware / application version string.
    pub application_version: Option<String>,
    /// Hardware revision string.
    pub hardware_version: Option<String>,
}
