//! Decoding of probe output into typed payloads.
//!
//! Probe commands evaluate to a string, so kernels usually report them as a
//! quoted literal (`'[{"varName": ...}]'`). One layer of quotes is stripped and
//! the escapes that quoting introduced are undone before JSON parsing.

use std::borrow::Cow;

use serde::de::DeserializeOwned;

use crate::error::{InspectorError, Result};
use crate::model::{MatrixModel, VariableRecord};

/// Strip one layer of `'` or `"` quoting and undo `\\`, `\'`, `\"` escapes.
/// Unquoted text is returned untouched.
pub fn unwrap_payload(text: &str) -> Cow<'_, str> {
    let text = text.trim();
    let quote = match text.chars().next() {
        Some(q @ ('\'' | '"')) => q,
        _ => return Cow::Borrowed(text),
    };
    if text.len() < 2 || !text.ends_with(quote) {
        return Cow::Borrowed(text);
    }

    let inner = &text[1..text.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(e @ ('\\' | '\'' | '"')) => out.push(e),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    Cow::Owned(out)
}

fn decode<T: DeserializeOwned>(text: &str) -> Result<T> {
    let unwrapped = unwrap_payload(text);
    serde_json::from_str(&unwrapped).map_err(|e| {
        InspectorError::DecodeError(format!("{} in payload {:.80}", e, &*unwrapped))
    })
}

pub fn decode_variables(text: &str) -> Result<Vec<VariableRecord>> {
    decode(text)
}

pub fn decode_matrix(text: &str) -> Result<MatrixModel> {
    decode(text)
}
