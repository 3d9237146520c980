//! Datum normalization and CBOR datum parsing.
//!
//! [normalize] turns decoded values (which may carry integers of any size)
//! into JSON-safe values: integers within the IEEE-754 safe range become
//! native numbers, larger ones become exact decimal strings.
//!
//! [CborDatumParser] maps CBOR Plutus data to the detailed JSON schema
//! (`constructor/fields`, `int`, `bytes`, `list`, `map`). It only reshapes the
//! decoder output of `ciborium`; no ledger rules are applied.

use ciborium::value::Value as Cbor;
use serde_json::{json, Map, Number, Value};
use std::io::Cursor;
use thiserror::Error;

/// Largest integer representable exactly as an IEEE-754 double (2^53 - 1).
pub const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

/// CBOR bignum tags (RFC 8949 §3.4.3).
const TAG_POS_BIGNUM: u64 = 2;
const TAG_NEG_BIGNUM: u64 = 3;
/// Plutus constructor tags: 121..=127 for alternatives 0..=6, 1280..=1400 for 7..=127,
/// 102 for the general `[alternative, fields]` form.
const TAG_CONSTR_GENERAL: u64 = 102;

/// JSON-safe integer: native when it fits the safe range, decimal text otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JsonInteger {
    Safe(i64),
    Big(String),
}

impl JsonInteger {
    /// Classify a decimal integer literal (`-?[0-9]+`). None for anything else.
    pub fn from_decimal(s: &str) -> Option<Self> {
        let digits = s.strip_prefix('-').unwrap_or(s);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        match s.parse::<i64>() {
            Ok(n) if (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&n) => Some(JsonInteger::Safe(n)),
            _ => Some(JsonInteger::Big(canonical_decimal(s))),
        }
    }
}

impl From<JsonInteger> for Value {
    fn from(i: JsonInteger) -> Self {
        match i {
            JsonInteger::Safe(n) => Value::from(n),
            JsonInteger::Big(s) => Value::String(s),
        }
    }
}

fn canonical_decimal(s: &str) -> String {
    let (neg, digits) = match s.strip_prefix('-') {
        Some(d) => (true, d),
        None => (false, s),
    };
    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        "0".to_string()
    } else if neg {
        format!("-{}", digits)
    } else {
        digits.to_string()
    }
}

/// Recursively convert `value` into a JSON-safe value. Idempotent.
pub fn normalize(value: &Value) -> Value {
    match value {
        Value::Number(n) => match JsonInteger::from_decimal(&n.to_string()) {
            Some(i) => i.into(),
            None => Value::Number(n.clone()),
        },
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), normalize(v)))
                .collect::<Map<String, Value>>(),
        ),
        other => other.clone(),
    }
}

#[derive(Debug, Error)]
pub enum DatumError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("CBOR decode error: {0}")]
    Cbor(String),
    #[error("unsupported plutus data: {0}")]
    Unsupported(String),
}

/// Resolves a CBOR-hex datum into a JSON value. Implemented by the serialization layer.
pub trait DatumParser: Send + Sync {
    fn parse_datum_cbor(&self, hex: &str) -> Result<Value, DatumError>;
}

/// [DatumParser] backed by `ciborium`, producing the detailed Plutus JSON schema.
/// Integers are exact (arbitrary precision); run [normalize] before display.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborDatumParser;

impl DatumParser for CborDatumParser {
    fn parse_datum_cbor(&self, cbor_hex: &str) -> Result<Value, DatumError> {
        let bytes = hex::decode(cbor_hex.trim())?;
        let value: Cbor = ciborium::de::from_reader(Cursor::new(bytes))
            .map_err(|e| DatumError::Cbor(e.to_string()))?;
        plutus_to_json(&value)
    }
}

fn plutus_to_json(v: &Cbor) -> Result<Value, DatumError> {
    match v {
        Cbor::Integer(i) => int_json(&i128::from(*i).to_string()),
        Cbor::Bytes(b) => Ok(json!({ "bytes": hex::encode(b) })),
        Cbor::Array(items) => Ok(json!({ "list": plutus_list(items)? })),
        Cbor::Map(entries) => {
            let mut out = Vec::with_capacity(entries.len());
            for (k, v) in entries {
                out.push(json!({ "k": plutus_to_json(k)?, "v": plutus_to_json(v)? }));
            }
            Ok(json!({ "map": out }))
        }
        Cbor::Tag(tag, inner) => tagged_to_json(*tag, inner),
        other => Err(DatumError::Unsupported(format!("{:?}", other))),
    }
}

fn tagged_to_json(tag: u64, inner: &Cbor) -> Result<Value, DatumError> {
    match (tag, inner) {
        (TAG_POS_BIGNUM, Cbor::Bytes(b)) => int_json(&bytes_to_decimal(b)),
        (TAG_NEG_BIGNUM, Cbor::Bytes(b)) => int_json(&format!("-{}", bytes_to_decimal(&increment(b)))),
        (121..=127, Cbor::Array(fields)) => constr_json(tag - 121, fields),
        (1280..=1400, Cbor::Array(fields)) => constr_json(tag - 1280 + 7, fields),
        (TAG_CONSTR_GENERAL, Cbor::Array(pair)) => match pair.as_slice() {
            [Cbor::Integer(alt), Cbor::Array(fields)] => {
                let alt = u64::try_from(i128::from(*alt))
                    .map_err(|_| DatumError::Unsupported("negative constructor".into()))?;
                constr_json(alt, fields)
            }
            _ => Err(DatumError::Unsupported("malformed general constructor".into())),
        },
        _ => Err(DatumError::Unsupported(format!("tag {}", tag))),
    }
}

fn constr_json(alternative: u64, fields: &[Cbor]) -> Result<Value, DatumError> {
    Ok(json!({ "constructor": alternative, "fields": plutus_list(fields)? }))
}

fn plutus_list(items: &[Cbor]) -> Result<Vec<Value>, DatumError> {
    items.iter().map(plutus_to_json).collect()
}

fn int_json(decimal: &str) -> Result<Value, DatumError> {
    let n: Number = decimal
        .parse()
        .map_err(|e: serde_json::Error| DatumError::Cbor(e.to_string()))?;
    Ok(json!({ "int": n }))
}

/// Big-endian unsigned magnitude to decimal text.
fn bytes_to_decimal(bytes: &[u8]) -> String {
    let mut digits: Vec<u8> = bytes.iter().copied().skip_while(|b| *b == 0).collect();
    if digits.is_empty() {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while !digits.is_empty() {
        let mut rem: u32 = 0;
        let mut next = Vec::with_capacity(digits.len());
        for &b in &digits {
            let acc = (rem << 8) | u32::from(b);
            let q = acc / 10;
            rem = acc % 10;
            if !(next.is_empty() && q == 0) {
                next.push(q as u8);
            }
        }
        out.push(char::from(b'0' + rem as u8));
        digits = next;
    }
    out.iter().rev().collect()
}

fn increment(bytes: &[u8]) -> Vec<u8> {
    let mut v = bytes.to_vec();
    for b in v.iter_mut().rev() {
        if *b == 0xff {
            *b = 0;
        } else {
            *b += 1;
            return v;
        }
    }
    v.insert(0, 1);
    v
}
