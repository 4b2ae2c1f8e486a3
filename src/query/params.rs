//! Named → positional parameter binding.

use std::collections::HashMap;
use std::fmt::Write as _;

use serde_json::Value as JsonValue;

use crate::error::AppError;
use crate::query::Parameters;

fn is_name_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_name_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Rewrites `:name` placeholders into `$n` and collects their values in order.
///
/// A name used several times binds to the same position. `::` casts and
/// anything inside single-quoted literals are left untouched. Parameters
/// that the statement never references are not bound.
///
/// # Errors
///
/// [`AppError::MissingParameter`] if a placeholder has no value.
pub fn bind_named(
    sql: &str,
    parameters: &Parameters,
) -> Result<(String, Vec<JsonValue>), AppError> {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut values = Vec::new();
    let mut positions: HashMap<&str, usize> = HashMap::new();
    let mut in_literal = false;
    let mut copied = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b':' if !in_literal => {
                if bytes.get(i + 1) == Some(&b':') {
                    i += 2;
                    continue;
                }
                if !bytes.get(i + 1).is_some_and(|b| is_name_start(*b)) {
                    i += 1;
                    continue;
                }

                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && is_name_char(bytes[end]) {
                    end += 1;
                }
                let name = &sql[start..end];

                let position = match positions.get(name) {
                    Some(position) => *position,
                    None => {
                        let value = parameters
                            .get(name)
                            .ok_or_else(|| AppError::MissingParameter(name.to_string()))?;
                        values.push(value.clone());
                        positions.insert(name, values.len());
                        values.len()
                    }
                };

                out.push_str(&sql[copied..i]);
                let _ = write!(out, "${}", position);
                copied = end;
                i = end;
            }
            _ => i += 1,
        }
    }
    out.push_str(&sql[copied..]);

    Ok((out, values))
}
