//! # Canonical Signing Form
//!
//! Every signature in the system — resource offers, DHT update envelopes,
//! journal entries — is computed over the same byte form: the value
//! serialized as JSON with keys in sorted order, UTF-8, with the top-level
//! `signature` field removed.
//!
//! `serde_json::Value` objects are backed by a BTree map, so routing a
//! value through `Value` yields sorted keys at every nesting level for
//! free. Signing and verification both call [`canonical_json`], so the two
//! sides can never disagree about the byte form.

use serde::Serialize;
use serde_json::Value;

use crate::error::CommonError;

/// Field stripped from the signing form.
pub const SIGNATURE_FIELD: &str = "signature";

/// Serializes `value` to its canonical signing form.
///
/// The top-level `signature` key (if any) is excluded; all object keys
/// come out sorted. Fails only if the value does not serialize to JSON.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, CommonError> {
    let mut v = serde_json::to_value(value)?;
    if let Value::Object(map) = &mut v {
        map.remove(SIGNATURE_FIELD);
    }
    Ok(serde_json::to_string(&v)?)
}
