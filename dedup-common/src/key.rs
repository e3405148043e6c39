use std::fmt;

use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::Record;

/// The configured key field was not present in a record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{field:?} not found")]
pub struct MissingFieldError {
    pub field: String,
}

/// Canonical identity of a record, as persisted in the membership store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DedupKey {
    fn from(s: &str) -> Self {
        DedupKey(s.to_owned())
    }
}

/// Derives a `DedupKey` from a single top-level field of a `Record`.
#[derive(Debug, Clone)]
pub struct KeyDeriver {
    field: String,
    hash: bool,
}

impl KeyDeriver {
    pub fn new(field: &str, hash: bool) -> Self {
        Self {
            field: field.to_owned(),
            hash,
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn derive(&self, record: &Record) -> Result<DedupKey, MissingFieldError> {
        let value = record.get(&self.field).ok_or_else(|| MissingFieldError {
            field: self.field.clone(),
        })?;

        let text = stringify(value);

        if self.hash {
            Ok(DedupKey(hash_key(&text)))
        } else {
            Ok(DedupKey(text))
        }
    }
}

/// Render a JSON value as the text the key is built from.
///
/// Strings contribute their raw content. Everything else is rendered as compact JSON, with
/// object keys sorted so that input field order never changes the key and numbers written in
/// their canonical decimal form (`100`, `1e2` and `100.0` are the same key). Changing any of this
/// invalidates every key already stored.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => {
            let mut out = String::new();
            write_canonical(other, &mut out);
            out
        }
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Number(n) => out.push_str(&canonical_number(&n.to_string())),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        other => out.push_str(&other.to_string()),
    }
}

// Beyond this many padding zeros a number is written as `<digits>e<exponent>` instead.
const MAX_PADDING_ZEROS: usize = 64;

/// Exact decimal normal form of a JSON number literal.
///
/// The value is reduced to significant digits and a power of ten with no leading or trailing
/// zeros, so equal values always render the same text. No floating point is involved, which
/// keeps integers of any size distinct.
fn canonical_number(text: &str) -> String {
    let (negative, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let (mantissa, exponent) = match unsigned.find(['e', 'E']) {
        Some(at) => (&unsigned[..at], &unsigned[at + 1..]),
        None => (unsigned, "0"),
    };
    let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));

    let Ok(exponent) = exponent.parse::<i64>() else {
        return text.to_owned();
    };
    let Some(mut scale) = i64::try_from(frac_part.len())
        .ok()
        .and_then(|frac_len| exponent.checked_sub(frac_len))
    else {
        return text.to_owned();
    };

    let digits = format!("{int_part}{frac_part}");
    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        return "0".to_owned();
    }
    let significant = digits.trim_end_matches('0');
    scale = match i64::try_from(digits.len() - significant.len())
        .ok()
        .and_then(|zeros| scale.checked_add(zeros))
    {
        Some(scale) => scale,
        None => return text.to_owned(),
    };

    let mut out = String::new();
    if negative {
        out.push('-');
    }

    let padding = usize::try_from(scale.unsigned_abs()).unwrap_or(usize::MAX);
    if scale >= 0 && padding <= MAX_PADDING_ZEROS {
        out.push_str(significant);
        out.extend(std::iter::repeat('0').take(padding));
    } else if scale < 0 && padding < significant.len() {
        let (whole, fraction) = significant.split_at(significant.len() - padding);
        out.push_str(whole);
        out.push('.');
        out.push_str(fraction);
    } else if scale < 0 && padding - significant.len() <= MAX_PADDING_ZEROS {
        out.push_str("0.");
        out.extend(std::iter::repeat('0').take(padding - significant.len()));
        out.push_str(significant);
    } else {
        out.push_str(significant);
        out.push('e');
        out.push_str(&scale.to_string());
    }
    out
}

/// Lowercase hex SHA-256 of the key text.
pub fn hash_key(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}
