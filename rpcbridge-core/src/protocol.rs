//! Wire shapes: one JSON object per frame.
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorObject, RpcError};

pub type RequestId = i64;

fn default_version() -> String {
    "2.0".to_string()
}

/// A method call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default)]
    pub streamed: bool,
}

impl Request {
    pub fn new(id: RequestId, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            id,
            jsonrpc: default_version(),
            method: method.into(),
            params,
            streamed: false,
        }
    }

    /// Parameter shape used in error messages, e.g. `int, string`.
    pub fn shape(&self) -> String {
        shape_of(&self.params)
    }
}

pub fn shape_of(params: &[Value]) -> String {
    params
        .iter()
        .map(|v| match v {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(n) if n.is_f64() => "float",
            Value::Number(_) => "int",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Everything a client may send.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Call(Request),
    Cancel(RequestId),
}

impl Inbound {
    pub fn id(&self) -> RequestId {
        match self {
            Inbound::Call(req) => req.id,
            Inbound::Cancel(id) => *id,
        }
    }

    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(frame).map_err(|e| DecodeError {
            id: None,
            reason: e.to_string(),
        })?;
        let id = value.get("id").and_then(Value::as_i64);
        if let Some(cancel) = value.get("cancel") {
            return match cancel.as_i64() {
                Some(id) => Ok(Inbound::Cancel(id)),
                None => Err(DecodeError {
                    id,
                    reason: "cancel must carry an integer request id".to_string(),
                }),
            };
        }
        serde_json::from_value::<Request>(value)
            .map(Inbound::Call)
            .map_err(|e| DecodeError {
                id,
                reason: e.to_string(),
            })
    }

    pub fn encode(&self) -> Bytes {
        let value = match self {
            Inbound::Call(req) => serde_json::to_vec(req),
            Inbound::Cancel(id) => serde_json::to_vec(&serde_json::json!({ "cancel": id })),
        };
        // Serializing these shapes cannot fail: all keys are strings.
        Bytes::from(value.unwrap_or_default())
    }
}

/// A frame that could not be turned into an [`Inbound`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct DecodeError {
    /// Request id, when one could be recovered from the payload.
    pub id: Option<RequestId>,
    pub reason: String,
}

impl DecodeError {
    pub fn into_response(self) -> Response {
        Response::error(self.id, &RpcError::Decode(self.reason))
    }
}

/// Everything the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Item {
        id: RequestId,
        result: Value,
    },
    Completed {
        id: RequestId,
        #[serde(with = "always_true")]
        completed: (),
    },
    Error {
        id: Option<RequestId>,
        error: ErrorObject,
    },
}

impl Response {
    pub fn item(id: RequestId, result: Value) -> Self {
        Response::Item { id, result }
    }

    pub fn completed(id: RequestId) -> Self {
        Response::Completed { id, completed: () }
    }

    pub fn error(id: Option<RequestId>, err: &RpcError) -> Self {
        Response::Error {
            id,
            error: err.to_object(),
        }
    }

    pub fn id(&self) -> Option<RequestId> {
        match self {
            Response::Item { id, .. } | Response::Completed { id, .. } => Some(*id),
            Response::Error { id, .. } => *id,
        }
    }

    /// Completed and Error end a request's lifecycle.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Response::Item { .. })
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(frame)
    }
}

// `"completed": true` on the wire, nothing in memory.
mod always_true {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(_: &(), serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bool(true)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<(), D::Error>
    where
        D: Deserializer<'de>,
    {
        match bool::deserialize(deserializer)? {
            true => Ok(()),
            false => Err(de::Error::custom("completed must be true")),
        }
    }
}
