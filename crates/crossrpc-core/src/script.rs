//! Scripts the client injects into browser surfaces.
//!
//! The client has exactly one way into a browser: executing a code string. Two
//! scripts are ever sent:
//!
//! - **bootstrap**: hands the surface its browser identity through the
//!   `window['__rpc:id']` promise slot.
//! - **dispatch**: passes one encoded envelope to the surface's
//!   `window["__rpc:process"]` entry point. When the surface has no runtime
//!   loaded and the envelope is a call, the script answers with a not-found
//!   response instead.
//!
//! Payloads are embedded as single-quoted JS string literals. The parsers at
//! the bottom invert the rendering for hosts that run the browser runtime
//! natively rather than in a JS engine.

use crate::config::ProtocolConfig;

/// Host function a browser surface uses to reach its client.
pub const BROWSER_OUTBOUND_FN: &str = "mp.trigger";

/// Escape text for a single-quoted JS string literal.
pub fn escape_single_quoted(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 8);
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c => out.push(c),
        }
    }
    out
}

/// Render the identity bootstrap for a freshly observed browser surface.
pub fn bootstrap(browser_id: &str) -> String {
    let id = escape_single_quoted(browser_id);
    let slot = ProtocolConfig::IDENTIFIER;
    format!(
        "if(typeof window['{slot}'] === 'undefined'){{ window['{slot}'] = Promise.resolve('{id}'); }}else{{ window['{slot}:resolve']('{id}'); }}"
    )
}

/// Render a dispatch of `payload` into the surface's runtime.
///
/// `not_found_reply` is the encoded response to send back when the runtime is
/// missing; `None` means the envelope is silently lost in that case.
pub fn dispatch(payload: &str, not_found_reply: Option<&str>) -> String {
    let event = ProtocolConfig::PROCESS_EVENT;
    let raw = escape_single_quoted(payload);
    let fallback = match not_found_reply {
        Some(reply) => format!(
            "{BROWSER_OUTBOUND_FN}(\"{event}\", '{}');",
            escape_single_quoted(reply)
        ),
        None => String::new(),
    };
    format!("var process = window[\"{event}\"]; if(process){{ process('{raw}'); }}else{{ {fallback} }}")
}

/// A dispatch script taken apart again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchScript {
    pub payload: String,
    pub not_found_reply: Option<String>,
}

/// Read the body of a single-quoted literal whose opening quote has already
/// been consumed. Returns the unescaped body and the text after the closing
/// quote.
fn read_single_quoted(s: &str) -> Option<(String, &str)> {
    let mut out = String::new();
    let mut chars = s.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '\'' => return Some((out, &s[i + 1..])),
            '\\' => {
                let (_, escaped) = chars.next()?;
                match escaped {
                    'n' => out.push('\n'),
                    'r' => out.push('\r'),
                    'u' => {
                        let mut hex = String::with_capacity(4);
                        for _ in 0..4 {
                            hex.push(chars.next()?.1);
                        }
                        let code = u32::from_str_radix(&hex, 16).ok()?;
                        out.push(char::from_u32(code)?);
                    }
                    other => out.push(other),
                }
            }
            c => out.push(c),
        }
    }
    None
}

/// Extract the browser identity from a [`bootstrap`] script.
pub fn parse_bootstrap(code: &str) -> Option<String> {
    const MARKER: &str = "Promise.resolve('";
    let start = code.find(MARKER)? + MARKER.len();
    read_single_quoted(&code[start..]).map(|(id, _)| id)
}

/// Take apart a [`dispatch`] script.
pub fn parse_dispatch(code: &str) -> Option<DispatchScript> {
    const PAYLOAD_MARKER: &str = "process('";
    let start = code.find(PAYLOAD_MARKER)? + PAYLOAD_MARKER.len();
    let (payload, rest) = read_single_quoted(&code[start..])?;

    let reply_marker = format!(
        "{BROWSER_OUTBOUND_FN}(\"{}\", '",
        ProtocolConfig::PROCESS_EVENT
    );
    let not_found_reply = match rest.find(&reply_marker) {
        Some(pos) => Some(read_single_quoted(&rest[pos + reply_marker.len()..])?.0),
        None => None,
    };

    Some(DispatchScript {
        payload,
        not_found_reply,
    })
}
