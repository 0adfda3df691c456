//! ECoS command builders.
//!
//! Every builder returns the command text without the trailing newline;
//! [`encode_command`] is the single place that renders the generic
//! `name(id, arg, ...)` shape. The returned text is also what the station
//! echoes in its `<REPLY ...>` header, which is how replies are matched to
//! requests.
//!
//! All functions are pure. Nothing here performs I/O.

use raillib_core::{AccessoryValue, DecoderType, Direction};

// ---------------------------------------------------------------
// Well-known object ids
// ---------------------------------------------------------------

/// The station itself: power, status and version information.
pub const BASE_OBJECT: u32 = 1;
/// Locomotive manager.
pub const LOCOMOTIVE_MANAGER: u32 = 10;
/// Accessory (turnout / signal) manager.
pub const ACCESSORY_MANAGER: u32 = 11;
/// Feedback (S88 / ECoSDetector) manager.
pub const FEEDBACK_MANAGER: u32 = 26;

/// Object ids assigned to locomotives.
pub const LOCOMOTIVE_IDS: std::ops::RangeInclusive<u32> = 1000..=9999;
/// Object ids assigned to accessories.
pub const ACCESSORY_IDS: std::ops::RangeInclusive<u32> = 20000..=29999;
/// Object ids assigned to feedback modules (`100 + module number`).
pub const FEEDBACK_IDS: std::ops::RangeInclusive<u32> = 100..=199;

/// Offset between a feedback module number and its object id.
pub const FEEDBACK_ID_OFFSET: u32 = 100;

/// Fields requested for each locomotive in a list query.
pub const LOCOMOTIVE_LIST_FIELDS: &[&str] = &["name", "addr", "protocol"];
/// Fields requested when reading one locomotive.
pub const LOCOMOTIVE_DETAIL_FIELDS: &[&str] =
    &["name", "addr", "protocol", "speed", "dir", "symbol"];
/// Fields requested for each accessory in a list query.
pub const ACCESSORY_LIST_FIELDS: &[&str] = &["name1", "addr", "protocol"];
/// Fields requested when reading one accessory.
pub const ACCESSORY_DETAIL_FIELDS: &[&str] = &[
    "name1", "addr", "protocol", "state", "gates", "addrext", "symbol", "duration",
];
/// Fields requested when reading one feedback module.
pub const FEEDBACK_DETAIL_FIELDS: &[&str] = &["ports", "state"];

// ---------------------------------------------------------------
// Generic builders
// ---------------------------------------------------------------

/// Render `name(id, arg, ...)`.
pub fn encode_command(name: &str, id: u32, args: &[&str]) -> String {
    let mut cmd = format!("{name}({id}");
    for arg in args {
        cmd.push_str(", ");
        cmd.push_str(arg);
    }
    cmd.push(')');
    cmd
}

/// `queryObjects(manager, field, ...)`: list every object of a class.
pub fn cmd_query_objects(manager: u32, fields: &[&str]) -> String {
    encode_command("queryObjects", manager, fields)
}

/// `get(id, field, ...)`: read fields of one object.
pub fn cmd_get(id: u32, fields: &[&str]) -> String {
    encode_command("get", id, fields)
}

/// `set(id, arg, ...)`: change fields of one object.
pub fn cmd_set(id: u32, args: &[&str]) -> String {
    encode_command("set", id, args)
}

/// `request(id, arg, ...)`: subscribe to events or acquire control.
pub fn cmd_request(id: u32, args: &[&str]) -> String {
    encode_command("request", id, args)
}

/// `release(id, arg, ...)`: undo a `request`.
pub fn cmd_release(id: u32, args: &[&str]) -> String {
    encode_command("release", id, args)
}

/// `create(manager, arg, ...)`: create a new object in a manager.
pub fn cmd_create(manager: u32, args: &[&str]) -> String {
    encode_command("create", manager, args)
}

/// `delete(id)`: remove an object.
pub fn cmd_delete(id: u32) -> String {
    encode_command("delete", id, &[])
}

// ---------------------------------------------------------------
// Station
// ---------------------------------------------------------------

/// Query track power (`get(1, status)`).
pub fn cmd_read_power() -> String {
    cmd_get(BASE_OBJECT, &["status"])
}

/// Switch track power (`set(1, go)` / `set(1, stop)`).
pub fn cmd_set_power(on: bool) -> String {
    cmd_set(BASE_OBJECT, &[if on { "go" } else { "stop" }])
}

/// Query model and version strings (`get(1, info)`).
pub fn cmd_read_info() -> String {
    cmd_get(BASE_OBJECT, &["info"])
}

/// Subscribe to events of an object (`request(id, view)`).
pub fn cmd_view(id: u32) -> String {
    cmd_request(id, &["view"])
}

/// Unsubscribe from events of an object (`release(id, view)`).
pub fn cmd_release_view(id: u32) -> String {
    cmd_release(id, &["view"])
}

// ---------------------------------------------------------------
// Locomotives
// ---------------------------------------------------------------

/// List all locomotives.
pub fn cmd_list_locomotives() -> String {
    cmd_query_objects(LOCOMOTIVE_MANAGER, LOCOMOTIVE_LIST_FIELDS)
}

/// Read the details of one locomotive.
pub fn cmd_read_locomotive(id: u32) -> String {
    cmd_get(id, LOCOMOTIVE_DETAIL_FIELDS)
}

/// Read the values of functions `0..count` (`get(id, func[0], ...)`).
pub fn cmd_read_functions(id: u32, count: u8) -> String {
    let fields: Vec<String> = (0..count).map(|n| format!("func[{n}]")).collect();
    let refs: Vec<&str> = fields.iter().map(String::as_str).collect();
    cmd_get(id, &refs)
}

/// Read the descriptors of functions `0..count` (`get(id, funcdesc[0], ...)`).
pub fn cmd_read_function_descriptors(id: u32, count: u8) -> String {
    let fields: Vec<String> = (0..count).map(|n| format!("funcdesc[{n}]")).collect();
    let refs: Vec<&str> = fields.iter().map(String::as_str).collect();
    cmd_get(id, &refs)
}

/// Acquire control of a locomotive, taking it from other throttles.
pub fn cmd_take_control(id: u32) -> String {
    cmd_request(id, &["control", "force"])
}

/// Give up control of a locomotive.
pub fn cmd_release_control(id: u32) -> String {
    cmd_release(id, &["control"])
}

/// Set the speed of a locomotive in device steps (0..=127).
pub fn cmd_set_speed(id: u32, device_speed: u8) -> String {
    cmd_set(id, &[&format!("speed[{}]", device_speed.min(127))])
}

/// Set the travel direction. The ECoS encodes forwards as `0`.
pub fn cmd_set_direction(id: u32, direction: Direction) -> String {
    let dir = match direction {
        Direction::Forwards => 0,
        Direction::Backwards => 1,
    };
    cmd_set(id, &[&format!("dir[{dir}]")])
}

/// Switch one locomotive function.
pub fn cmd_set_function(id: u32, number: u8, on: bool) -> String {
    cmd_set(id, &[&format!("func[{number}, {}]", u8::from(on))])
}

// ---------------------------------------------------------------
// Accessories and feedback
// ---------------------------------------------------------------

/// List all accessories.
pub fn cmd_list_accessories() -> String {
    cmd_query_objects(ACCESSORY_MANAGER, ACCESSORY_LIST_FIELDS)
}

/// Read the details of one accessory.
pub fn cmd_read_accessory(id: u32) -> String {
    cmd_get(id, ACCESSORY_DETAIL_FIELDS)
}

/// Wire prefix of an accessory decoder protocol inside `switch[...]`.
fn accessory_protocol(decoder_type: DecoderType) -> &'static str {
    match decoder_type {
        DecoderType::Mm => "MM",
        _ => "DCC",
    }
}

/// Drive one accessory output by address (`set(11, switch[DCC10r])`).
pub fn cmd_switch_accessory(
    address: u32,
    decoder_type: DecoderType,
    value: AccessoryValue,
) -> String {
    let side = match value {
        AccessoryValue::Red => 'r',
        AccessoryValue::Green => 'g',
    };
    cmd_set(
        ACCESSORY_MANAGER,
        &[&format!(
            "switch[{}{address}{side}]",
            accessory_protocol(decoder_type)
        )],
    )
}

/// Query the number of feedback modules (`get(26, size)`).
pub fn cmd_read_feedback_count() -> String {
    cmd_get(FEEDBACK_MANAGER, &["size"])
}

/// Read the port count and state word of one feedback module.
pub fn cmd_read_feedback_module(id: u32) -> String {
    cmd_get(id, FEEDBACK_DETAIL_FIELDS)
}

/// Object id of the feedback module with the given bus number.
pub fn feedback_module_id(module_number: u32) -> u32 {
    FEEDBACK_ID_OFFSET + module_number
}
