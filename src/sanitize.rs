//! Sanitization for attacker-controlled strings before they reach the logs.
//!
//! Origins, peer addresses and anything echoed back from a client can carry
//! CR/LF or terminal escape sequences. Written to a log verbatim they forge
//! entries or repaint the operator's terminal, so every such value goes
//! through [`for_log`] first.

/// Longest sanitized value kept in a log line, in characters.
const MAX_LOG_VALUE_LEN: usize = 200;

/// Strip every control character (including `\r`, `\n`, `\t` and ESC) and
/// cap the length.
pub fn for_log(value: &str) -> String {
    let mut out: String = value
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_LOG_VALUE_LEN)
        .collect();
    if value.chars().filter(|c| !c.is_control()).nth(MAX_LOG_VALUE_LEN).is_some() {
        out.push_str("...");
    }
    out
}
