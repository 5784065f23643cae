//! JSON-RPC envelopes exchanged between clients and servers.

use crate::config::RpcDefaults;
use crate::error::{Result, RpcError};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Call arguments: either positional or named, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Params {
    Positional(Vec<Value>),
    Named(Map<String, Value>),
}

impl Default for Params {
    /// No arguments, sent as an empty named mapping.
    fn default() -> Self {
        Params::Named(Map::new())
    }
}

impl Params {
    /// No arguments.
    pub fn none() -> Self {
        Self::default()
    }

    /// Positional arguments from anything serializable into JSON values.
    pub fn positional<I>(values: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        Params::Positional(values.into_iter().map(Into::into).collect())
    }

    /// Named arguments from `(name, value)` pairs.
    pub fn named<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Params::Named(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        match self {
            Params::Positional(values) => values.len(),
            Params::Named(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up an argument by position or by name, whichever form was sent.
    pub fn get(&self, index: usize, name: &str) -> Option<&Value> {
        match self {
            Params::Positional(values) => values.get(index),
            Params::Named(map) => map.get(name),
        }
    }

    /// Read a required argument and deserialize it into `T`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T> {
        let value = self.get(index, name).ok_or_else(|| RpcError::InvalidParams {
            message: format!("Missing required parameter: {} (position {})", name, index),
        })?;
        serde_json::from_value(value.clone()).map_err(|e| RpcError::InvalidParams {
            message: format!("Invalid parameter {}: {}", name, e),
        })
    }

    /// Read an optional argument; absent and `null` both give `None`.
    pub fn opt_arg<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<Option<T>> {
        match self.get(index, name) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.arg(index, name).map(Some),
        }
    }
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self {
        Params::Positional(values)
    }
}

impl From<Map<String, Value>> for Params {
    fn from(map: Map<String, Value>) -> Self {
        Params::Named(map)
    }
}

impl TryFrom<Value> for Params {
    type Error = RpcError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Array(values) => Ok(Params::Positional(values)),
            Value::Object(map) => Ok(Params::Named(map)),
            Value::Null => Ok(Params::none()),
            other => Err(RpcError::InvalidParams {
                message: format!("params must be an array or an object, got {}", other),
            }),
        }
    }
}

/// Generate a fresh correlation id.
///
/// Ids are time-ordered UUIDs, so ids generated later sort later.
pub fn new_request_id() -> String {
    Uuid::now_v7().to_string()
}

/// Whether an id parses as a plain integer (optional sign, surrounding
/// whitespace allowed).
pub fn is_integer_id(id: &str) -> bool {
    let trimmed = id.trim();
    let digits = trimmed
        .strip_prefix('-')
        .or_else(|| trimmed.strip_prefix('+'))
        .unwrap_or(trimmed);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Params,
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
}

impl Request {
    /// Build a request with a freshly generated id.
    pub fn new(method: impl Into<String>, params: Params) -> Self {
        Self::with_id(method, params, new_request_id())
    }

    /// Build a request with a caller-chosen id.
    pub fn with_id(method: impl Into<String>, params: Params, id: impl Into<String>) -> Self {
        Self {
            jsonrpc: RpcDefaults::PROTOCOL_VERSION.to_string(),
            method: method.into(),
            params,
            id: id.into(),
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| RpcError::InvalidRequest {
            message: e.to_string(),
        })
    }
}

/// Response envelope. Exactly one of `result` and `error` is meaningful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

impl Response {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            jsonrpc: RpcDefaults::PROTOCOL_VERSION.to_string(),
            result: Some(result),
            error: None,
            id: Some(id.into()),
        }
    }

    pub fn failure(id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            jsonrpc: RpcDefaults::PROTOCOL_VERSION.to_string(),
            result: None,
            error: Some(error.into()),
            id,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Turn the envelope into the call outcome seen by a client.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(error) => Err(RpcError::RemoteMethod(error)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Accept string or numeric ids; numbers are kept in their JSON spelling.
fn id_as_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(id) => Ok(id),
        Value::Number(id) => Ok(id.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "id must be a string or a number, got {}",
            other
        ))),
    }
}
