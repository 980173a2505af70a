//! Request fingerprinting.
//!
//! A [`GenerationRequest`] is reduced to a canonical, type-tagged byte
//! sequence and hashed with SHA-256. Parameters are kept in a `BTreeMap`,
//! so the order in which a caller supplied them never reaches the hash.

// Author: kelexine (https://github.com/kelexine)

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Domain separator prepended to every canonical encoding.
const CANONICAL_PREFIX: &[u8] = b"gencache/fingerprint/v1\n";

/// Length of a rendered fingerprint (SHA-256, lowercase hex).
pub const FINGERPRINT_HEX_LEN: usize = 64;

/// A single request parameter with an explicit type tag.
///
/// The tag takes part in the fingerprint, so `Int(1)`, `Str("1")` and
/// `Float(1.0)` never collide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ParamValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl ParamValue {
    /// Converts a JSON scalar into a tagged parameter.
    ///
    /// Nulls, arrays, objects and integers outside the `i64` range have no
    /// canonical form and are rejected.
    pub fn from_json(key: &str, value: &serde_json::Value) -> Result<Self> {
        use serde_json::Value;

        match value {
            Value::String(s) => Ok(ParamValue::Str(s.clone())),
            Value::Bool(b) => Ok(ParamValue::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(ParamValue::Int(i))
                } else if n.is_u64() {
                    Err(encoding(key, format!("integer {} does not fit in i64", n)))
                } else {
                    n.as_f64()
                        .map(ParamValue::Float)
                        .ok_or_else(|| encoding(key, format!("unrepresentable number {}", n)))
                }
            }
            Value::Null => Err(encoding(key, "null has no canonical form")),
            Value::Array(_) | Value::Object(_) => {
                Err(encoding(key, "only scalar parameters can be fingerprinted"))
            }
        }
    }

    fn type_tag(&self) -> u8 {
        match self {
            ParamValue::Str(_) => b's',
            ParamValue::Int(_) => b'i',
            ParamValue::Float(_) => b'f',
            ParamValue::Bool(_) => b'b',
        }
    }

    fn write_canonical(&self, key: &str, out: &mut Vec<u8>) -> Result<()> {
        let tag = self.type_tag();
        match self {
            ParamValue::Str(s) => write_field(out, tag, s.as_bytes()),
            ParamValue::Int(i) => write_field(out, tag, i.to_string().as_bytes()),
            ParamValue::Float(f) => {
                if !f.is_finite() {
                    return Err(encoding(key, format!("non-finite float {}", f)));
                }
                // -0.0 == 0.0, so both must hash the same
                let normalized = if *f == 0.0 { 0.0f64 } else { *f };
                write_field(out, tag, format!("{:016x}", normalized.to_bits()).as_bytes());
            }
            ParamValue::Bool(b) => {
                let text: &[u8] = if *b { b"true" } else { b"false" };
                write_field(out, tag, text)
            }
        }
        Ok(())
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Str(s) => write!(f, "{:?}", s),
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Float(v) => write!(f, "{:?}", v),
            ParamValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Str(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Str(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        ParamValue::Int(i64::from(value))
    }
}

impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        ParamValue::Int(i64::from(value))
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

/// An immutable description of one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    model_identifier: String,
    operation_name: String,
    parameters: BTreeMap<String, ParamValue>,
}

impl GenerationRequest {
    /// Starts building a request for `operation_name` against `model_identifier`.
    pub fn builder(
        model_identifier: impl Into<String>,
        operation_name: impl Into<String>,
    ) -> GenerationRequestBuilder {
        GenerationRequestBuilder {
            model_identifier: model_identifier.into(),
            operation_name: operation_name.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn model_identifier(&self) -> &str {
        &self.model_identifier
    }

    pub fn operation_name(&self) -> &str {
        &self.operation_name
    }

    pub fn parameters(&self) -> &BTreeMap<String, ParamValue> {
        &self.parameters
    }

    pub fn param(&self, key: &str) -> Option<&ParamValue> {
        self.parameters.get(key)
    }

    /// Shorthand for [`FingerprintBuilder::build`].
    pub fn fingerprint(&self) -> Result<Fingerprint> {
        FingerprintBuilder::build(self)
    }
}

/// Builder for [`GenerationRequest`]. Setting a key twice keeps the last value.
#[derive(Debug, Clone)]
pub struct GenerationRequestBuilder {
    model_identifier: String,
    operation_name: String,
    parameters: BTreeMap<String, ParamValue>,
}

impl GenerationRequestBuilder {
    pub fn param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn params<K, V, I>(mut self, params: I) -> Self
    where
        K: Into<String>,
        V: Into<ParamValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        for (key, value) in params {
            self.parameters.insert(key.into(), value.into());
        }
        self
    }

    /// Adds every entry of a JSON object as a parameter.
    pub fn json_params(
        mut self,
        params: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self> {
        for (key, value) in params {
            let value = ParamValue::from_json(key, value)?;
            self.parameters.insert(key.clone(), value);
        }
        Ok(self)
    }

    pub fn build(self) -> GenerationRequest {
        GenerationRequest {
            model_identifier: self.model_identifier,
            operation_name: self.operation_name,
            parameters: self.parameters,
        }
    }
}

/// SHA-256 of a request's canonical encoding, rendered as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }

    /// Wraps a key read back from the store without re-validating it.
    pub(crate) fn from_stored(hex: String) -> Self {
        Fingerprint(hex)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        let valid = s.len() == FINGERPRINT_HEX_LEN
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(encoding(
                "fingerprint",
                format!("expected {} lowercase hex characters", FINGERPRINT_HEX_LEN),
            ));
        }
        Ok(Fingerprint(s.to_string()))
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = CacheError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.0
    }
}

/// Derives fingerprints from requests.
pub struct FingerprintBuilder;

impl FingerprintBuilder {
    /// Computes the fingerprint of `request`.
    ///
    /// Fails only when a parameter has no canonical form (non-finite floats).
    pub fn build(request: &GenerationRequest) -> Result<Fingerprint> {
        let canonical = Self::canonical_bytes(request)?;
        let digest = Sha256::digest(&canonical);
        Ok(Fingerprint(hex::encode(digest)))
    }

    /// The exact byte sequence that gets hashed.
    ///
    /// Every field is written as `tag | u64 big-endian length | bytes`, so no
    /// choice of strings can make two different requests encode alike.
    pub fn canonical_bytes(request: &GenerationRequest) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(CANONICAL_PREFIX);
        write_field(&mut out, b'm', request.model_identifier.as_bytes());
        write_field(&mut out, b'o', request.operation_name.as_bytes());
        write_field(
            &mut out,
            b'n',
            request.parameters.len().to_string().as_bytes(),
        );
        for (key, value) in &request.parameters {
            write_field(&mut out, b'k', key.as_bytes());
            value.write_canonical(key, &mut out)?;
        }
        Ok(out)
    }
}

fn write_field(out: &mut Vec<u8>, tag: u8, bytes: &[u8]) {
    out.push(tag);
    out.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn encoding(key: &str, reason: impl Into<String>) -> CacheError {
    CacheError::Encoding {
        key: key.to_string(),
        reason: reason.into(),
    }
}
