//! ECoS text protocol framing and message parsing.
//!
//! Every exchange with the ECoS is plain ASCII. A request is a single line
//! such as `get(1, status)`. The station answers with a block framed by a
//! header and an end marker:
//!
//! ```text
//! <REPLY get(1, status)>
//! 1 status[GO]
//! <END 0 (OK)>
//! ```
//!
//! Unsolicited updates use the same shape with an `<EVENT id>` header.
//! Content lines start with an object id followed by `key[value]` pairs; a
//! key without brackets carries no value. One block may describe many
//! objects, and one object may span several lines (one `func[...]` per
//! line, for instance).
//!
//! Bytes arrive in arbitrary fragments. [`FrameBuffer`] accumulates them and
//! yields an immutable [`EcosMessage`] only once a whole block is present,
//! so no field of a message can be read before its end marker arrived.

use std::collections::BTreeMap;

use raillib_core::error::{Error, Result};

/// Header marker of a reply block.
pub const REPLY_MARKER: &str = "<REPLY ";

/// Header marker of an event block.
pub const EVENT_MARKER: &str = "<EVENT ";

/// End marker of every block.
pub const END_MARKER: &str = "<END ";

/// Upper bound for buffered, not yet framed input.
///
/// A full locomotive list with details can be tens of kilobytes; anything
/// beyond this without a complete frame is line noise.
pub const MAX_BUF: usize = 1024 * 1024;

/// Whether `text` holds a complete block: a reply or event header followed
/// later by an end marker with its code and closing bracket.
pub fn is_complete(text: &str) -> bool {
    let bytes = text.as_bytes();
    match find_header(bytes, 0) {
        Some(start) => find_end(bytes, start).is_some(),
        None => false,
    }
}

/// Position of the first reply or event header at or after `from`.
fn find_header(hay: &[u8], from: usize) -> Option<usize> {
    let reply = find(hay, REPLY_MARKER.as_bytes(), from);
    let event = find(hay, EVENT_MARKER.as_bytes(), from);
    match (reply, event) {
        (Some(r), Some(e)) => Some(r.min(e)),
        (r, e) => r.or(e),
    }
}

/// Locate the end marker after a header starting at `header`.
///
/// Returns `(end_start, end_close)` where `end_close` is the index one past
/// the closing `>` of the end line. Only `<END code (label)>` counts; a
/// malformed end line is skipped like content.
fn find_end(hay: &[u8], header: usize) -> Option<(usize, usize)> {
    let mut from = header + 1;
    loop {
        let end_start = find(hay, END_MARKER.as_bytes(), from)?;
        let after = end_start + END_MARKER.len();
        let close = hay[after..].iter().position(|&b| b == b'>')? + after;
        if is_end_body(&hay[after..close]) {
            return Some((end_start, close + 1));
        }
        from = end_start + 1;
    }
}

/// `0 (OK)`: decimal code, whitespace, parenthesised label.
fn is_end_body(body: &[u8]) -> bool {
    let digits = body.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return false;
    }
    let rest = &body[digits..];
    let spaces = rest.iter().take_while(|&&b| b == b' ').count();
    if spaces == 0 {
        return false;
    }
    let label = rest[spaces..].trim_ascii_end();
    label.len() >= 2 && label[0] == b'(' && label[label.len() - 1] == b')'
}

fn find(hay: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= hay.len() || needle.len() > hay.len() - from {
        return None;
    }
    hay[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

// ---------------------------------------------------------------------------
// Frame buffer
// ---------------------------------------------------------------------------

/// Accumulates raw bytes from the transport and cuts them into blocks.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    /// An empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly received bytes.
    ///
    /// If the buffer grows beyond [`MAX_BUF`] without yielding a frame, it is
    /// cleared.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > MAX_BUF {
            tracing::warn!(len = self.buf.len(), "frame buffer overflow, resetting");
            self.buf.clear();
        }
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drop all buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Cut the next complete block out of the buffer.
    ///
    /// Returns `None` while no complete block is buffered. A complete block
    /// that fails to parse is consumed and returned as `Some(Err(_))` so the
    /// caller can log it and carry on with the next one.
    pub fn next_frame(&mut self) -> Option<Result<EcosMessage>> {
        let mut start = match find_header(&self.buf, 0) {
            Some(start) => start,
            None => {
                self.discard_garbage();
                return None;
            }
        };

        let (end_start, mut consumed) = find_end(&self.buf, start)?;

        // A second header before the end marker means the first block was
        // truncated; resynchronise on the later one.
        while let Some(next) = find_header(&self.buf[..end_start], start + 1) {
            tracing::debug!(skipped = next - start, "truncated block discarded");
            start = next;
        }

        while consumed < self.buf.len() && matches!(self.buf[consumed], b'\r' | b'\n') {
            consumed += 1;
        }

        let text = String::from_utf8_lossy(&self.buf[start..consumed]).into_owned();
        self.buf.drain(..consumed);
        Some(EcosMessage::parse(&text))
    }

    /// Drop bytes that cannot start a block, keeping a possible partial
    /// header marker at the tail.
    fn discard_garbage(&mut self) {
        let keep_from = self
            .buf
            .iter()
            .rposition(|&b| b == b'<')
            .filter(|&p| self.buf.len() - p < REPLY_MARKER.len())
            .unwrap_or(self.buf.len());
        if keep_from > 0 {
            self.buf.drain(..keep_from);
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Whether a block answers a request or reports an unsolicited change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `<REPLY ...>`: answer to a request.
    Reply,
    /// `<EVENT ...>`: unsolicited update.
    Event,
}

/// One content row: an object id and its ordered `key[value]` fields.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectRow {
    /// Object id the row describes.
    pub id: u32,
    fields: Vec<(String, Option<String>)>,
}

impl ObjectRow {
    /// An empty row for the given object.
    pub fn new(id: u32) -> Self {
        ObjectRow {
            id,
            fields: Vec::new(),
        }
    }

    /// Append a field. Repeated keys are kept in order.
    pub fn push(&mut self, key: impl Into<String>, value: Option<String>) {
        self.fields.push((key.into(), value));
    }

    /// All fields in wire order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    /// Value of the first occurrence of `key`. Bare keys yield `None`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
    }

    /// Values of every occurrence of `key`, skipping bare ones.
    pub fn values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(k, _)| k == key)
            .filter_map(|(_, v)| v.as_deref())
    }

    /// Whether `key` appears at all, with or without a value.
    pub fn has(&self, key: &str) -> bool {
        self.fields.iter().any(|(k, _)| k == key)
    }

    /// Whether the row has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The fields as a map. For repeated keys the last occurrence wins.
    pub fn to_map(&self) -> BTreeMap<String, Option<String>> {
        self.fields.iter().cloned().collect()
    }

    fn extend(&mut self, other: ObjectRow) {
        self.fields.extend(other.fields);
    }
}

/// A complete, parsed reply or event block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcosMessage {
    kind: MessageKind,
    header: String,
    command: String,
    object_id: u32,
    error_code: u32,
    status: String,
    rows: Vec<ObjectRow>,
}

impl EcosMessage {
    /// Parse one complete block.
    ///
    /// Fails with [`Error::Protocol`] if the header or end line is
    /// malformed. A block without content lines parses to no rows.
    pub fn parse(text: &str) -> Result<Self> {
        let start = find_header(text.as_bytes(), 0)
            .ok_or_else(|| Error::Protocol("missing REPLY/EVENT header".into()))?;
        let (end_start, end_close) = find_end(text.as_bytes(), start)
            .ok_or_else(|| Error::Protocol("missing END marker".into()))?;

        let block = &text[start..end_start];
        let (header_line, content) = match block.find('\n') {
            Some(nl) => (&block[..nl], &block[nl + 1..]),
            None => (block, ""),
        };

        let (kind, header) = if let Some(h) = header_line.strip_prefix(REPLY_MARKER) {
            (MessageKind::Reply, h)
        } else if let Some(h) = header_line.strip_prefix(EVENT_MARKER) {
            (MessageKind::Event, h)
        } else {
            return Err(Error::Protocol(format!("bad header: {header_line:?}")));
        };
        let header = header.trim().trim_end_matches('>').trim().to_string();

        let (command, object_id) = match kind {
            MessageKind::Reply => parse_reply_header(&header)?,
            MessageKind::Event => ("event".to_string(), parse_event_header(&header)?),
        };

        let (error_code, status) =
            parse_end_line(&text[end_start + END_MARKER.len()..end_close - 1])?;

        let rows = parse_content(content);

        Ok(EcosMessage {
            kind,
            header,
            command,
            object_id,
            error_code,
            status,
            rows,
        })
    }

    /// Reply or event.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Whether this is an unsolicited event.
    pub fn is_event(&self) -> bool {
        self.kind == MessageKind::Event
    }

    /// The echoed request for replies (`get(1,status)`), the id for events.
    pub fn header(&self) -> &str {
        &self.header
    }

    /// Command name of a reply (`get`, `set`, ...); `event` for events.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Target object of the block.
    pub fn object_id(&self) -> u32 {
        self.object_id
    }

    /// Numeric code from the end line. Zero means success.
    pub fn error_code(&self) -> u32 {
        self.error_code
    }

    /// Label from the end line, e.g. `OK` or `NERROR_NOCONTROL`.
    pub fn status(&self) -> &str {
        &self.status
    }

    /// Whether the station reported success.
    pub fn is_valid(&self) -> bool {
        self.error_code == 0
    }

    /// Content rows in first-appearance order, one per object id.
    pub fn rows(&self) -> &[ObjectRow] {
        &self.rows
    }

    /// The row describing the given object, if any.
    pub fn row(&self, id: u32) -> Option<&ObjectRow> {
        self.rows.iter().find(|r| r.id == id)
    }

    /// Whether this reply answers `command` (whitespace-insensitive).
    pub fn answers(&self, command: &str) -> bool {
        self.kind == MessageKind::Reply
            && normalize_command(&self.header) == normalize_command(command)
    }
}

/// Strip whitespace so an echoed command compares equal to the sent one.
pub fn normalize_command(command: &str) -> String {
    command.chars().filter(|c| !c.is_whitespace()).collect()
}

/// `get(1,status,status2)` -> (`get`, 1)
fn parse_reply_header(header: &str) -> Result<(String, u32)> {
    let open = header
        .find('(')
        .ok_or_else(|| Error::Protocol(format!("reply header without '(': {header:?}")))?;
    let command = header[..open].trim().to_string();
    let args = &header[open + 1..];
    let id_end = args
        .find([',', ')'])
        .ok_or_else(|| Error::Protocol(format!("unterminated reply header: {header:?}")))?;
    let object_id = args[..id_end]
        .trim()
        .parse::<u32>()
        .map_err(|_| Error::Protocol(format!("bad object id in reply header: {header:?}")))?;
    Ok((command, object_id))
}

/// `1001` -> 1001
fn parse_event_header(header: &str) -> Result<u32> {
    let token = header.split([' ', '>']).next().unwrap_or_default();
    token
        .trim()
        .parse::<u32>()
        .map_err(|_| Error::Protocol(format!("bad object id in event header: {header:?}")))
}

/// `0 (OK)` -> (0, "OK")
fn parse_end_line(end: &str) -> Result<(u32, String)> {
    let end = end.trim();
    let (code, rest) = end.split_once(' ').unwrap_or((end, ""));
    let code = code
        .parse::<u32>()
        .map_err(|_| Error::Protocol(format!("bad END code: {end:?}")))?;
    let status = rest
        .trim()
        .trim_start_matches('(')
        .trim_end_matches(')')
        .to_string();
    Ok((code, status))
}

/// Tokenise all content lines and merge rows that share an object id.
fn parse_content(content: &str) -> Vec<ObjectRow> {
    let mut rows: Vec<ObjectRow> = Vec::new();
    for line in content.lines() {
        for row in tokenize_line(line) {
            match rows.iter_mut().find(|r| r.id == row.id) {
                Some(existing) => existing.extend(row),
                None => rows.push(row),
            }
        }
    }
    rows
}

/// Split one content line into rows.
///
/// A bare all-digit token starts a new row, so a flattened line holding
/// several objects yields several rows. Fields seen before any object id
/// are dropped.
pub fn tokenize_line(line: &str) -> Vec<ObjectRow> {
    let mut rows = Vec::new();
    let mut current: Option<ObjectRow> = None;
    let mut chars = line.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let mut key_end = line.len();
        while let Some(&(i, c)) = chars.peek() {
            if c.is_whitespace() || c == '[' {
                key_end = i;
                break;
            }
            chars.next();
        }
        let key = &line[start..key_end];

        let value = if matches!(chars.peek(), Some(&(_, '['))) {
            chars.next();
            let value_start = key_end + 1;
            let mut value_end = line.len();
            let mut in_quote = false;
            for (i, c) in chars.by_ref() {
                match c {
                    '"' => in_quote = !in_quote,
                    ']' if !in_quote => {
                        value_end = i;
                        break;
                    }
                    _ => {}
                }
            }
            Some(line[value_start..value_end].to_string())
        } else {
            None
        };

        if value.is_none() && !key.is_empty() && key.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(id) = key.parse::<u32>() {
                if let Some(row) = current.take() {
                    rows.push(row);
                }
                current = Some(ObjectRow::new(id));
                continue;
            }
        }

        match current.as_mut() {
            Some(row) => row.push(key, value),
            None => tracing::trace!(key, "content field before object id ignored"),
        }
    }

    if let Some(row) = current {
        rows.push(row);
    }
    rows
}

/// Remove surrounding quotes and undo ECoS quote doubling.
///
/// Unquoted input is returned unchanged.
pub fn unquote(value: &str) -> String {
    let v = value.trim();
    if v.len() >= 2 && v.starts_with('"') && v.ends_with('"') {
        v[1..v.len() - 1].replace("\"\"", "\"")
    } else {
        v.to_string()
    }
}

/// Quote a string for an outbound command, doubling embedded quotes.
pub fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}
