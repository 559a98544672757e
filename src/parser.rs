//! Decoding of raw kernel output into structured values.
//!
//! The kernel renders values with its own literal repr: strings in single
//! quotes, backslashes doubled, `True`/`False`/`None` keywords, tuples in
//! parentheses. [`normalize`] rewrites that repr into JSON text; [`parse`]
//! layers trimming, one level of string-literal unwrapping and the
//! text/JSON choice on top.

use std::iter::Peekable;
use std::str::Chars;

use serde_json::Value;
use thiserror::Error;

/// Decoded output of a submission.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResult {
    /// No payload (status-only submission, or whitespace output).
    Empty,
    Text(String),
    Json(Value),
}

impl ParsedResult {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Json(Value::String(text)) => Some(text),
            _ => None,
        }
    }

    pub const fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn into_json(self) -> Value {
        match self {
            Self::Empty => Value::Null,
            Self::Text(text) => Value::String(text),
            Self::Json(value) => value,
        }
    }
}

/// Output that could not be decoded. Carries the payload exactly as received.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("not decodable as JSON: {raw:?}")]
pub struct ParseError {
    pub raw: String,
}

/// Decode a raw payload.
///
/// Empty or whitespace-only payloads decode to [`ParsedResult::Empty`].
/// With `expect_json == false` the trimmed text is returned, minus one pair
/// of enclosing quotes if the whole payload is a single string literal.
pub fn parse(raw: &str, expect_json: bool) -> Result<ParsedResult, ParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(ParsedResult::Empty);
    }

    if !expect_json {
        return Ok(ParsedResult::Text(unquote(trimmed)));
    }

    decode(trimmed)
        .map(ParsedResult::Json)
        .ok_or_else(|| ParseError {
            raw: raw.to_owned(),
        })
}

/// Rewrite the kernel's literal repr into JSON text.
///
/// String literals (either quote style) are decoded and re-encoded as JSON
/// strings, so embedded quotes and backslashes survive. Outside strings,
/// `True`/`False`/`None` become `true`/`false`/`null` and parentheses become
/// brackets; everything else is copied. Returns `None` on an unterminated
/// string literal or a malformed escape. Valid JSON passes through unchanged
/// in meaning.
pub fn normalize(text: &str) -> Option<String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                let decoded = read_string(&mut chars, c)?;
                out.push_str(&serde_json::to_string(&decoded).ok()?);
            }
            '(' => out.push('['),
            ')' => out.push(']'),
            c if c.is_alphabetic() || c == '_' => {
                let mut word = String::from(c);
                while let Some(&next) = chars.peek() {
                    if !(next.is_alphanumeric() || next == '_') {
                        break;
                    }
                    word.push(next);
                    chars.next();
                }
                out.push_str(match word.as_str() {
                    "True" => "true",
                    "False" => "false",
                    "None" => "null",
                    other => other,
                });
            }
            c => out.push(c),
        }
    }

    Some(out)
}

/// Read a string literal body up to the closing `quote`, resolving escapes.
fn read_string(chars: &mut Peekable<Chars<'_>>, quote: char) -> Option<String> {
    let mut s = String::new();
    loop {
        match chars.next()? {
            c if c == quote => return Some(s),
            '\\' => match chars.next()? {
                '\\' => s.push('\\'),
                '\'' => s.push('\''),
                '"' => s.push('"'),
                '/' => s.push('/'),
                'n' => s.push('\n'),
                't' => s.push('\t'),
                'r' => s.push('\r'),
                'x' => s.push(hex_char(chars, 2)?),
                'u' => s.push(hex_char(chars, 4)?),
                'U' => s.push(hex_char(chars, 8)?),
                // Unknown escapes are kept verbatim, as the kernel's repr does
                other => {
                    s.push('\\');
                    s.push(other);
                }
            },
            c => s.push(c),
        }
    }
}

fn hex_char(chars: &mut Peekable<Chars<'_>>, digits: usize) -> Option<char> {
    let hex: String = chars.by_ref().take(digits).collect();
    if hex.len() != digits {
        return None;
    }
    u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32)
}

/// JSON first, then the kernel repr.
fn decode_literal(text: &str) -> Option<Value> {
    serde_json::from_str(text).ok().or_else(|| {
        let json = normalize(text)?;
        serde_json::from_str(&json).ok()
    })
}

/// Decode, then look one level inside a decoded string for a structured value.
fn decode(text: &str) -> Option<Value> {
    match decode_literal(text)? {
        Value::String(inner) => Some(decode_literal(inner.trim()).unwrap_or(Value::String(inner))),
        value => Some(value),
    }
}

fn unquote(text: &str) -> String {
    let quoted = text.starts_with(['\'', '"']);
    match decode_literal(text) {
        Some(Value::String(inner)) if quoted => inner.trim().to_owned(),
        _ => text.to_owned(),
    }
}
