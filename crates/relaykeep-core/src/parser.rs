//! Stateless parsing of in-band relay lines: `[sender -> receiver] payload`.

use regex::Regex;
use std::sync::LazyLock;

pub const COMMAND_PREFIX: char = '/';

static RELAY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[([^\[\]]+?)\s*->\s*([^\[\]]+?)\]\s*(.+)$").expect("relay pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayInstruction {
    pub sender: String,
    pub receiver: String,
    pub payload: String,
}

pub fn parse_relay(text: &str) -> Option<RelayInstruction> {
    let caps = RELAY_LINE.captures(text)?;
    let sender = caps[1].trim();
    let receiver = caps[2].trim();
    let payload = caps[3].trim();
    if sender.is_empty() || receiver.is_empty() || payload.is_empty() {
        return None;
    }
    Some(RelayInstruction {
        sender: sender.to_string(),
        receiver: receiver.to_string(),
        payload: payload.to_string(),
    })
}

pub fn is_command(text: &str) -> bool {
    text.starts_with(COMMAND_PREFIX)
}

/// Lowercased first whitespace-delimited token.
pub fn command_verb(text: &str) -> String {
    text.split_whitespace()
        .next()
        .unwrap_or_default()
        .to_lowercase()
}

/// Flattens line breaks, trims, and caps the length in characters.
pub fn sanitize_payload(text: &str, max_chars: usize) -> String {
    let flat = text.replace("\r\n", " ").replace(['\r', '\n'], " ");
    flat.trim().chars().take(max_chars).collect()
}
