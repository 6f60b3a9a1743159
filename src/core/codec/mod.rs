// src/core/codec/mod.rs

//! The pluggable value codec capability.
//!
//! The connection core only moves already-encoded byte payloads. Higher
//! layers pick a [`Codec`] per named entity (a key, a map, a topic) through a
//! [`CodecRegistry`] and use it to turn values into command arguments and
//! reply payloads back into values.

use crate::core::{ClientError, Result};
use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Converts values to bytes and back.
///
/// Values travel as `serde_json::Value` so codecs stay object safe; the
/// typed helpers [`encode`] and [`decode`] bridge to any serde type.
pub trait Codec: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;
    fn encode_value(&self, value: &Value) -> Result<Bytes>;
    fn decode_value(&self, bytes: &[u8]) -> Result<Value>;
}

/// Encodes any serializable value with `codec`.
pub fn encode<T: Serialize + ?Sized>(codec: &dyn Codec, value: &T) -> Result<Bytes> {
    codec.encode_value(&serde_json::to_value(value)?)
}

/// Decodes a payload with `codec` into any deserializable type.
pub fn decode<T: DeserializeOwned>(codec: &dyn Codec, bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_value(codec.decode_value(bytes)?)?)
}

/// Stores values as JSON documents.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode_value(&self, value: &Value) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Stores strings as raw UTF-8 without quoting.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringCodec;

impl Codec for StringCodec {
    fn name(&self) -> &'static str {
        "string"
    }

    fn encode_value(&self, value: &Value) -> Result<Bytes> {
        match value {
            Value::String(s) => Ok(Bytes::copy_from_slice(s.as_bytes())),
            other => Err(ClientError::Codec(format!(
                "string codec cannot encode {other}"
            ))),
        }
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<Value> {
        Ok(Value::String(String::from_utf8(bytes.to_vec())?))
    }
}

/// Stores integers as decimal text, the form counters use on the server.
#[derive(Debug, Default, Clone, Copy)]
pub struct LongCodec;

impl Codec for LongCodec {
    fn name(&self) -> &'static str {
        "long"
    }

    fn encode_value(&self, value: &Value) -> Result<Bytes> {
        let n = value
            .as_i64()
            .ok_or_else(|| ClientError::Codec(format!("long codec cannot encode {value}")))?;
        let mut buf = itoa::Buffer::new();
        Ok(Bytes::copy_from_slice(buf.format(n).as_bytes()))
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<Value> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ClientError::Codec(format!("invalid UTF-8 payload: {e}")))?;
        let n: i64 = text
            .trim()
            .parse()
            .map_err(|_| ClientError::Codec(format!("'{text}' is not an integer")))?;
        Ok(Value::from(n))
    }
}

/// Passes raw bytes through untouched. On the typed side a payload is a
/// `Vec<u8>` (an array of numbers once lifted into a `Value`).
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    fn name(&self) -> &'static str {
        "bytes"
    }

    fn encode_value(&self, value: &Value) -> Result<Bytes> {
        match value {
            Value::String(s) => Ok(Bytes::copy_from_slice(s.as_bytes())),
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_u64()
                        .and_then(|b| u8::try_from(b).ok())
                        .ok_or_else(|| ClientError::Codec(format!("{item} is not a byte")))
                })
                .collect::<Result<Vec<u8>>>()
                .map(Bytes::from),
            other => Err(ClientError::Codec(format!("bytes codec cannot encode {other}"))),
        }
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<Value> {
        Ok(Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()))
    }
}

/// Maps entity names to codecs, falling back to a default codec.
#[derive(Debug)]
pub struct CodecRegistry {
    default: Arc<dyn Codec>,
    by_name: DashMap<String, Arc<dyn Codec>>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new(Arc::new(JsonCodec))
    }
}

impl CodecRegistry {
    pub fn new(default: Arc<dyn Codec>) -> Self {
        Self {
            default,
            by_name: DashMap::new(),
        }
    }

    /// Assigns a codec to an entity, replacing any previous assignment.
    pub fn register(&self, entity: impl Into<String>, codec: Arc<dyn Codec>) {
        self.by_name.insert(entity.into(), codec);
    }

    /// Returns the codec of an entity, or the default one.
    pub fn codec_for(&self, entity: &str) -> Arc<dyn Codec> {
        self.by_name
            .get(entity)
            .map(|c| c.value().clone())
            .unwrap_or_else(|| self.default.clone())
    }

    pub fn default_codec(&self) -> Arc<dyn Codec> {
        self.default.clone()
    }
}
