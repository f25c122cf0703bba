//! Reply projection: turning an untyped [`RespValue`] into a caller type.
//!
//! Conversions are lenient where RESP2 and RESP3 disagree on shape: numbers
//! sent as blob strings parse, flat key/value arrays build maps, and
//! booleans accept `:0`/`:1`. A mismatch is a [`RespError::Conversion`] and
//! never affects the connection.

use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};

use bytes::Bytes;

use crate::command::format_double;
use crate::error::{RespError, Result};
use crate::resp::types::{BigNumber, RespValue};

pub trait FromResp: Sized {
    fn from_resp(value: RespValue) -> Result<Self>;
}

fn mismatch<T>(expected: &str, got: &RespValue) -> Result<T> {
    Err(RespError::Conversion(format!(
        "expected {expected}, got {}",
        got.type_name()
    )))
}

fn parse_text<T: std::str::FromStr>(expected: &str, value: &RespValue) -> Result<T> {
    match value.as_str().map(str::trim).map(str::parse::<T>) {
        Some(Ok(v)) => Ok(v),
        _ => mismatch(expected, value),
    }
}

impl FromResp for RespValue {
    fn from_resp(value: RespValue) -> Result<Self> {
        Ok(value)
    }
}

impl FromResp for () {
    fn from_resp(_: RespValue) -> Result<Self> {
        Ok(())
    }
}

impl FromResp for String {
    fn from_resp(value: RespValue) -> Result<Self> {
        match value {
            RespValue::Text(s) => Ok(s),
            RespValue::Bytes(b) => String::from_utf8(b.to_vec())
                .map_err(|e| RespError::Conversion(format!("invalid UTF-8: {e}"))),
            RespValue::Integer(n) => Ok(n.to_string()),
            RespValue::Double(d) => Ok(format_double(d)),
            RespValue::BigNumber(n) => Ok(n.into_string()),
            other => mismatch("string", &other),
        }
    }
}

impl FromResp for Bytes {
    fn from_resp(value: RespValue) -> Result<Self> {
        match value {
            RespValue::Bytes(b) => Ok(b),
            RespValue::Text(s) => Ok(Bytes::from(s)),
            other => mismatch("bytes", &other),
        }
    }
}

impl FromResp for i64 {
    fn from_resp(value: RespValue) -> Result<Self> {
        match &value {
            RespValue::Integer(n) => Ok(*n),
            RespValue::Boolean(b) => Ok(*b as i64),
            RespValue::BigNumber(n) => n
                .to_i64()
                .ok_or_else(|| RespError::Conversion(format!("{n} does not fit in i64"))),
            RespValue::Text(_) | RespValue::Bytes(_) => parse_text("integer", &value),
            other => mismatch("integer", other),
        }
    }
}

impl FromResp for u64 {
    fn from_resp(value: RespValue) -> Result<Self> {
        match &value {
            RespValue::Integer(n) => u64::try_from(*n)
                .map_err(|_| RespError::Conversion(format!("{n} is negative"))),
            RespValue::BigNumber(n) => n
                .as_str()
                .parse()
                .map_err(|_| RespError::Conversion(format!("{n} does not fit in u64"))),
            RespValue::Text(_) | RespValue::Bytes(_) => parse_text("unsigned integer", &value),
            other => mismatch("unsigned integer", other),
        }
    }
}

impl FromResp for f64 {
    fn from_resp(value: RespValue) -> Result<Self> {
        match &value {
            RespValue::Double(d) => Ok(*d),
            RespValue::Integer(n) => Ok(*n as f64),
            RespValue::Text(_) | RespValue::Bytes(_) => match value.as_str().map(str::trim) {
                Some("inf" | "+inf") => Ok(f64::INFINITY),
                Some("-inf") => Ok(f64::NEG_INFINITY),
                _ => parse_text("double", &value),
            },
            other => mismatch("double", other),
        }
    }
}

impl FromResp for bool {
    fn from_resp(value: RespValue) -> Result<Self> {
        match &value {
            RespValue::Boolean(b) => Ok(*b),
            RespValue::Integer(n) => Ok(*n != 0),
            RespValue::Text(_) | RespValue::Bytes(_) => match value.as_str() {
                Some("1") => Ok(true),
                Some("0") => Ok(false),
                _ => mismatch("boolean", &value),
            },
            other => mismatch("boolean", other),
        }
    }
}

impl FromResp for BigNumber {
    fn from_resp(value: RespValue) -> Result<Self> {
        match value {
            RespValue::BigNumber(n) => Ok(n),
            RespValue::Integer(n) => Ok(BigNumber::from(n)),
            other => match other.as_str() {
                Some(s) => s.parse(),
                None => mismatch("big number", &other),
            },
        }
    }
}

impl<T: FromResp> FromResp for Option<T> {
    fn from_resp(value: RespValue) -> Result<Self> {
        match value {
            RespValue::Null => Ok(None),
            other => T::from_resp(other).map(Some),
        }
    }
}

/// Arrays convert element-wise, maps flatten to alternating keys and
/// values, and null is an empty list.
impl<T: FromResp> FromResp for Vec<T> {
    fn from_resp(value: RespValue) -> Result<Self> {
        match value {
            RespValue::Array(items) => items.into_iter().map(T::from_resp).collect(),
            RespValue::Map(pairs) => {
                let mut out = Vec::with_capacity(pairs.len() * 2);
                for (k, v) in pairs {
                    out.push(T::from_resp(k)?);
                    out.push(T::from_resp(v)?);
                }
                Ok(out)
            }
            RespValue::Null => Ok(Vec::new()),
            other => mismatch("array", &other),
        }
    }
}

impl<K, V, S> FromResp for HashMap<K, V, S>
where
    K: FromResp + Eq + Hash,
    V: FromResp,
    S: BuildHasher + Default,
{
    fn from_resp(value: RespValue) -> Result<Self> {
        match value {
            RespValue::Map(pairs) => pairs
                .into_iter()
                .map(|(k, v)| Ok((K::from_resp(k)?, V::from_resp(v)?)))
                .collect(),
            RespValue::Array(items) => {
                if items.len() % 2 != 0 {
                    return Err(RespError::Conversion(format!(
                        "odd number of elements ({}) for a map",
                        items.len()
                    )));
                }
                let mut map = HashMap::with_capacity_and_hasher(items.len() / 2, S::default());
                let mut iter = items.into_iter();
                while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                    map.insert(K::from_resp(k)?, V::from_resp(v)?);
                }
                Ok(map)
            }
            RespValue::Null => Ok(HashMap::default()),
            other => mismatch("map", &other),
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
