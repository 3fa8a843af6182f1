mod error;
pub use error::{map_error, map_stream_error, AnyError, AnyResult, ErrorCode, ErrorObject, RpcError};

pub mod config;
pub mod listener;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod socket;
pub mod util;
