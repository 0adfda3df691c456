//! Feedback status word decoding.
//!
//! A feedback module reports its 16 contacts as one hexadecimal word, e.g.
//! `state[0xc0]`. The word is read as a 16-bit value after left-padding to
//! four digits. Ports are numbered per byte, most significant bit first:
//! ports 1..=8 are bits 7..=0 of the low byte and ports 9..=16 are bits
//! 7..=0 of the high byte. So `0xc0` means ports 1 and 2 are occupied.
//!
//! The changed-port delta is computed by [`FeedbackModule::changed_ports`]
//! once the decoded vector is applied with [`FeedbackModule::update`].
//!
//! [`FeedbackModule::changed_ports`]: raillib_core::types::FeedbackModule::changed_ports
//! [`FeedbackModule::update`]: raillib_core::types::FeedbackModule::update

use raillib_core::error::{Error, Result};
use raillib_core::FEEDBACK_WORD_PORTS;

/// Decode a status word into per-port states (index 0 = port 1).
///
/// Accepts an optional `0x` prefix and one to four hex digits.
pub fn decode_status_word(word: &str) -> Result<[bool; FEEDBACK_WORD_PORTS]> {
    let trimmed = word.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() || digits.len() > 4 {
        return Err(Error::Protocol(format!("bad feedback word: {word:?}")));
    }
    let padded = format!("{digits:0>4}");
    let value = u16::from_str_radix(&padded, 16)
        .map_err(|_| Error::Protocol(format!("bad feedback word: {word:?}")))?;

    let mut ports = [false; FEEDBACK_WORD_PORTS];
    for (i, port) in ports.iter_mut().enumerate() {
        *port = (value >> port_bit(i)) & 1 == 1;
    }
    Ok(ports)
}

/// Bit position of the port at 0-based index `i`.
fn port_bit(i: usize) -> usize {
    (i / 8) * 8 + (7 - i % 8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use raillib_core::types::FeedbackModule;

    fn active(ports: &[bool]) -> Vec<usize> {
        ports
            .iter()
            .enumerate()
            .filter(|(_, on)| **on)
            .map(|(i, _)| i + 1)
            .collect()
    }

    #[test]
    fn c0_is_ports_one_and_two() {
        let ports = decode_status_word("0xc0").unwrap();
        assert_eq!(active(&ports), vec![1, 2]);
    }

    #[test]
    fn prefix_is_optional_and_width_varies() {
        assert_eq!(
            decode_status_word("c0").unwrap(),
            decode_status_word("0x00C0").unwrap()
        );
        assert_eq!(active(&decode_status_word("0x0").unwrap()), Vec::<usize>::new());
        assert_eq!(active(&decode_status_word("0x0100").unwrap()), vec![16]);
        assert_eq!(active(&decode_status_word("0x8000").unwrap()), vec![9]);
        assert_eq!(active(&decode_status_word("0x01").unwrap()), vec![8]);
    }

    #[test]
    fn malformed_words_fail() {
        assert!(decode_status_word("").is_err());
        assert!(decode_status_word("0x").is_err());
        assert!(decode_status_word("0x12345").is_err());
        assert!(decode_status_word("zz").is_err());
    }

    #[test]
    fn same_word_twice_has_no_changes() {
        let mut module = FeedbackModule::new(100, 0);
        module.update(decode_status_word("0xc0").unwrap());
        module.update(decode_status_word("0xc0").unwrap());
        assert!(module.changed_ports().is_empty());
        assert_eq!(module.ports().len(), 16);
    }

    #[test]
    fn c0_then_80_changes_port_two() {
        let mut module = FeedbackModule::new(100, 0);
        module.update(decode_status_word("0xc0").unwrap());
        module.update(decode_status_word("0x80").unwrap());
        assert_eq!(module.changed_ports(), vec![2]);
    }

    #[test]
    fn only_configured_ports_exposed() {
        let mut module = FeedbackModule::new(100, 0);
        module.port_count = 8;
        module.update(decode_status_word("0xffff").unwrap());
        assert_eq!(module.ports().len(), 8);
        assert_eq!(module.changed_ports(), (1..=8).collect::<Vec<u16>>());
    }
}
