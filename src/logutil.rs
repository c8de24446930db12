//! Logging helpers for raw frames and link addresses so log lines stay short
//! and single-line.

const MAX_PREVIEW: usize = 32;

/// Space separated upper-case hex, truncated with an ellipsis past
/// `MAX_PREVIEW` bytes.
pub fn hex_preview(bytes: &[u8]) -> String {
    let shown = &bytes[..bytes.len().min(MAX_PREVIEW)];
    let mut out = shown
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ");
    if bytes.len() > MAX_PREVIEW {
        out.push_str(&format!(" … (+{} bytes)", bytes.len() - MAX_PREVIEW));
    }
    out
}

/// `AA:BB:CC:DD:EE:FF`
pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parse hex typed by a human: whitespace, `:` and a `0x` prefix are ignored.
pub fn parse_hex(input: &str) -> Result<Vec<u8>, hex::FromHexError> {
    let trimmed = input.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let cleaned: String = body
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    hex::decode(cleaned)
}
