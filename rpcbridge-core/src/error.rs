use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type AnyError = anyhow::Error;
pub type AnyResult<T> = anyhow::Result<T>;

/// Stable integer codes carried in the `error.code` field of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    DecodeError = -32700,
    InvalidRequest = -32600,
    MethodDoesNotExist = -32601,
    AuthParameterError = -32602,
    Internal = -32603,
    InvocationError = -32000,
    NotAuthenticated = -32001,
    AuthenticationFailed = -32002,
    StreamError = -32003,
    Timeout = -32004,
    AmbiguousCall = -32005,
}

impl ErrorCode {
    #[inline]
    pub const fn code(self) -> i32 {
        self as i32
    }
}

/// Every failure a client can observe on the wire.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("malformed frame: {0}")]
    Decode(String),
    #[error("request id {0} is already in flight")]
    DuplicateRequestId(i64),
    #[error("method {method}({shape}) does not exist")]
    MethodDoesNotExist { method: String, shape: String },
    #[error("ambiguous call to {method}({shape}): {count} overloads match equally")]
    AmbiguousCall {
        method: String,
        shape: String,
        count: usize,
    },
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("invalid login parameters: {0}")]
    AuthParameter(String),
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("{0}")]
    Invocation(String),
    #[error("{0}")]
    Stream(String),
    #[error("request timed out after {0}ms")]
    Timeout(u128),
    #[error("internal error: {0}")]
    Internal(String),
}

impl RpcError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RpcError::Decode(_) => ErrorCode::DecodeError,
            RpcError::DuplicateRequestId(_) => ErrorCode::InvalidRequest,
            RpcError::MethodDoesNotExist { .. } => ErrorCode::MethodDoesNotExist,
            RpcError::AmbiguousCall { .. } => ErrorCode::AmbiguousCall,
            RpcError::NotAuthenticated => ErrorCode::NotAuthenticated,
            RpcError::AuthParameter(_) => ErrorCode::AuthParameterError,
            RpcError::AuthenticationFailed => ErrorCode::AuthenticationFailed,
            RpcError::Invocation(_) => ErrorCode::InvocationError,
            RpcError::Stream(_) => ErrorCode::StreamError,
            RpcError::Timeout(_) => ErrorCode::Timeout,
            RpcError::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn to_object(&self) -> ErrorObject {
        ErrorObject {
            code: self.code().code(),
            message: self.to_string(),
        }
    }
}

/// The `{code, message}` pair sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
}

/// Map an arbitrary failure into its wire representation.
///
/// An [`RpcError`] anywhere in the chain keeps its own code. Everything else is
/// reported as an invocation error carrying only the top-level message, so no
/// debug chain or backtrace ever leaves the process.
pub fn map_error(err: &AnyError) -> ErrorObject {
    if let Some(rpc) = err.chain().find_map(|e| e.downcast_ref::<RpcError>()) {
        return rpc.to_object();
    }
    ErrorObject {
        code: ErrorCode::InvocationError.code(),
        message: err.to_string(),
    }
}

/// Same as [`map_error`] but reports non-rpc failures as stream errors.
pub fn map_stream_error(err: &AnyError) -> ErrorObject {
    if let Some(rpc) = err.chain().find_map(|e| e.downcast_ref::<RpcError>()) {
        return rpc.to_object();
    }
    RpcError::Stream(err.to_string()).to_object()
}
