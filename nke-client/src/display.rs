use std::fmt::Write as _;

use clap::ValueEnum;
use serde::Serialize;

use crate::decoder::SocketEvent;

/// How socket events are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// One log line per event
    #[default]
    Text,
    /// One JSON object per event on stdout
    Json,
}

/// One-line summary, e.g. `DataIn socket=42 index=1 size=10 slots=[0]`.
pub fn format_event(event: &SocketEvent) -> String {
    let mut output = format!("{} socket={}", event.kind, event.socket_id);
    if let Some(payload) = &event.payload {
        let slots: Vec<String> = payload.slot_indices().map(|i| i.to_string()).collect();
        let _ = write!(
            output,
            " index={} size={} slots=[{}]",
            payload.data_index,
            payload.data_size,
            slots.join(",")
        );
    }
    output
}

/// Summary plus a preview of at most `preview_bytes` payload bytes.
pub fn format_event_with_payload(event: &SocketEvent, payload: &[u8], preview_bytes: usize) -> String {
    let mut output = format_event(event);
    let shown = preview_bytes.min(payload.len());
    if shown > 0 {
        output.push('\n');
        output.push_str(&format_payload(&payload[..shown]));
    }
    output
}

/// Hex dump with an ASCII column, 16 bytes per line.
pub fn format_hex_dump(payload: &[u8]) -> String {
    let mut output = String::new();

    for (i, chunk) in payload.chunks(16).enumerate() {
        let _ = write!(output, "{:04x}: ", i * 16);

        for (j, byte) in chunk.iter().enumerate() {
            let _ = write!(output, "{:02x} ", byte);
            if j == 7 {
                output.push(' ');
            }
        }
        for j in chunk.len()..16 {
            output.push_str("   ");
            if j == 7 {
                output.push(' ');
            }
        }

        output.push_str("  ");
        for byte in chunk {
            if byte.is_ascii_graphic() || *byte == b' ' {
                output.push(*byte as char);
            } else {
                output.push('.');
            }
        }
        output.push('\n');
    }

    output
}

/// Text when the bytes are mostly printable, hex dump otherwise.
pub fn format_payload(payload: &[u8]) -> String {
    let printable = payload
        .iter()
        .filter(|&&b| b.is_ascii_graphic() || b.is_ascii_whitespace())
        .count();

    // More than 80% printable reads as text
    if !payload.is_empty() && printable * 5 > payload.len() * 4 {
        let text = String::from_utf8_lossy(payload);
        return text
            .lines()
            .take(10)
            .map(|line| format!("  {}", line))
            .collect::<Vec<_>>()
            .join("\n");
    }

    format_hex_dump(payload)
}

#[derive(Serialize)]
struct JsonEvent {
    timestamp: u64,
    kind: &'static str,
    socket_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    data_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data_size: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    slots: Vec<u32>,
    #[serde(skip_serializing_if = "String::is_empty")]
    payload_hex: String,
}

pub fn format_json(event: &SocketEvent, payload: &[u8], preview_bytes: usize) -> String {
    let payload_hex = payload[..preview_bytes.min(payload.len())]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>();

    let json_event = JsonEvent {
        timestamp: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default(),
        kind: event.kind.name(),
        socket_id: event.socket_id,
        data_index: event.payload.map(|p| p.data_index),
        data_size: event.payload.map(|p| p.data_size),
        slots: event
            .payload
            .map(|p| p.slot_indices().collect())
            .unwrap_or_default(),
        payload_hex,
    };

    serde_json::to_string(&json_event).unwrap_or_else(|_| "{}".to_string())
}
