//! Targeted key scanner for small JSON objects
//!
//! The server settings body only ever carries four scalar keys, so instead of
//! a general JSON parse the body is scanned for each `"key"` token and the
//! scalar that follows its colon is read. Keys may appear in any order and
//! unknown keys are skipped. Nested objects and string values are not
//! interpreted.

use crate::error::ProtocolError;

/// Locate the raw scalar text following `"key":`
fn find_value<'a>(json: &'a str, key: &str) -> Option<&'a str> {
    let token = format!("\"{}\"", key);
    let mut search_from = 0;
    while let Some(found) = json[search_from..].find(&token) {
        let after_key = search_from + found + token.len();
        let rest = json[after_key..].trim_start();
        // a match without a colon is a string value, not a key
        if let Some(value) = rest.strip_prefix(':') {
            let value = value.trim_start();
            let end = value
                .find(|c: char| c == ',' || c == '}' || c.is_whitespace())
                .unwrap_or(value.len());
            return Some(&value[..end]);
        }
        search_from = after_key;
    }
    None
}

/// Integer value of `key`, `Ok(None)` when absent
pub fn scan_i64(json: &str, key: &str) -> Result<Option<i64>, ProtocolError> {
    match find_value(json, key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<i64>()
            .map(Some)
            .map_err(|_| ProtocolError::Malformed(format!("{} is not an integer: {:?}", key, raw))),
    }
}

/// Boolean value of `key`, `Ok(None)` when absent
pub fn scan_bool(json: &str, key: &str) -> Result<Option<bool>, ProtocolError> {
    match find_value(json, key) {
        None => Ok(None),
        Some("true") => Ok(Some(true)),
        Some("false") => Ok(Some(false)),
        Some(raw) => Err(ProtocolError::Malformed(format!(
            "{} is not a boolean: {:?}",
            key, raw
        ))),
    }
}
