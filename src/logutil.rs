//! Logging helpers for raw modem traffic.
//!
//! The modem speaks binary, so log lines carry hex dumps. Both helpers cap the
//! amount they render to keep a single log line readable.

/// Compact lowercase hex of at most `max` bytes, e.g. `026228c391`.
pub fn hex_snippet(data: &[u8], max: usize) -> String {
    let mut out = String::with_capacity(max.min(data.len()) * 2 + 3);
    for b in data.iter().take(max) {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    if data.len() > max {
        out.push('…');
    }
    out
}

/// Uppercase hex separated by spaces, e.g. `02 62 28 C3 91`.
pub fn hex_spaced(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
