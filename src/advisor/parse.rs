// Tolerant decoding of advisory output. The model is asked for bare
// JSON but routinely wraps it in prose or Markdown fences, so decoding
// runs in stages: fence strip, balanced-object extraction, strict
// decode, then a light repair pass and one more strict decode.

use serde::Deserialize;

use crate::error::BotError;
use crate::models::{Confidence, SignalAction, Urgency};
use crate::Result;

/// Strictly-typed open/hold verdict as the model emits it.
#[derive(Debug, Clone, Deserialize)]
pub struct RawSignal {
    pub signal: SignalAction,
    pub reason: String,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub confidence: Confidence,
}

/// Strictly-typed close verdict. Only `should_close` is mandatory.
#[derive(Debug, Clone, Deserialize)]
pub struct RawClose {
    pub should_close: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default = "default_urgency")]
    pub urgency: Urgency,
    #[serde(default)]
    pub expected_outcome: String,
}

fn default_urgency() -> Urgency {
    Urgency::Medium
}

pub fn decode_signal(text: &str) -> Result<RawSignal> {
    decode(text)
}

pub fn decode_close(text: &str) -> Result<RawClose> {
    decode(text)
}

fn decode<T: for<'de> Deserialize<'de>>(text: &str) -> Result<T> {
    let stripped = strip_fences(text);
    let object = extract_object(stripped).ok_or_else(|| {
        BotError::MalformedResponse("advisory output carried no JSON object".into())
    })?;

    if let Ok(value) = serde_json::from_str(object) {
        return Ok(value);
    }

    let repaired = repair(object);
    serde_json::from_str(&repaired).map_err(|e| {
        BotError::MalformedResponse(format!("advisory JSON undecodable after repair: {e}"))
    })
}

/// Drops a surrounding ``` fence (with optional language tag) if present.
fn strip_fences(text: &str) -> &str {
    let Some(start) = text.find("```") else {
        return text;
    };
    let after = &text[start + 3..];
    // Skip the language tag up to the first newline.
    let body = match after.find('\n') {
        Some(nl) if after[..nl].len() <= 10 => &after[nl + 1..],
        _ => after,
    };
    match body.find("```") {
        Some(end) => &body[..end],
        None => body,
    }
}

/// First balanced `{...}` span, respecting string literals.
fn extract_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Light-touch repairs for the model's common JSON mistakes: single
/// quotes, unquoted keys, trailing commas. Anything beyond that fails
/// decoding and falls through to the caller's fallback policy.
fn repair(text: &str) -> String {
    let normalized: String = text
        .chars()
        .map(|c| if c == '\'' { '"' } else { c })
        .collect();
    drop_trailing_commas(&quote_bare_keys(&normalized))
}

fn quote_bare_keys(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 8);
    let mut in_string = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '"' && (i == 0 || chars[i - 1] != '\\') {
            in_string = !in_string;
            out.push(c);
            i += 1;
            continue;
        }
        if !in_string && (c == '{' || c == ',') {
            out.push(c);
            i += 1;
            while i < chars.len() && chars[i].is_whitespace() {
                out.push(chars[i]);
                i += 1;
            }
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            if i > start {
                let mut j = i;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                if j < chars.len() && chars[j] == ':' {
                    out.push('"');
                    out.extend(chars[start..i].iter());
                    out.push('"');
                } else {
                    out.extend(chars[start..i].iter());
                }
            }
            continue;
        }
        out.push(c);
        i += 1;
    }
    out
}

fn drop_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;

    for (i, &c) in chars.iter().enumerate() {
        if c == '"' && (i == 0 || chars[i - 1] != '\\') {
            in_string = !in_string;
        }
        if c == ',' && !in_string {
            let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}
