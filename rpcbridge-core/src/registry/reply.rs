use std::{fmt, future::Future};

use futures::{
    future::LocalBoxFuture,
    stream::{LocalBoxStream, Stream},
    FutureExt, StreamExt,
};
use serde::Serialize;
use serde_json::Value;

use super::param::Json;
use crate::{AnyError, AnyResult};

/// Shape of what a method hands back, as advertised in listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnKind {
    Value,
    Deferred,
    Stream,
    /// Decided per call.
    Dynamic,
}

/// The value a handler returns, tagged with how it is delivered.
///
/// Deferred and stream replies are driven on the thread that invoked the
/// handler, so they may use that thread's runtime (timers, local I/O) and need
/// not be `Send`.
pub enum Reply {
    /// Ready now: one item, then completion.
    Value(Value),
    /// Settles later: one item then completion, or one error.
    Deferred(LocalBoxFuture<'static, AnyResult<Value>>),
    /// Zero or more items, then completion or one error.
    Stream(LocalBoxStream<'static, AnyResult<Value>>),
}

impl Reply {
    pub fn value(value: impl Into<Value>) -> Self {
        Reply::Value(value.into())
    }

    pub fn json<T: Serialize>(value: &T) -> AnyResult<Self> {
        Ok(Reply::Value(serde_json::to_value(value)?))
    }

    pub fn deferred<F, T, E>(future: F) -> Self
    where
        F: Future<Output = Result<T, E>> + 'static,
        T: Serialize,
        E: Into<AnyError>,
    {
        Reply::Deferred(
            future
                .map(|r| r.map_err(Into::<AnyError>::into).and_then(to_value))
                .boxed_local(),
        )
    }

    pub fn stream<S, T, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<T, E>> + 'static,
        T: Serialize,
        E: Into<AnyError>,
    {
        Reply::Stream(
            stream
                .map(|r| r.map_err(Into::<AnyError>::into).and_then(to_value))
                .boxed_local(),
        )
    }

    pub fn kind(&self) -> ReturnKind {
        match self {
            Reply::Value(_) => ReturnKind::Value,
            Reply::Deferred(_) => ReturnKind::Deferred,
            Reply::Stream(_) => ReturnKind::Stream,
        }
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Reply::Deferred(_) => f.write_str("Deferred(..)"),
            Reply::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

fn to_value<T: Serialize>(value: T) -> AnyResult<Value> {
    serde_json::to_value(value).map_err(Into::into)
}

/// Conversion from a handler's return type into a [`Reply`].
pub trait IntoReply {
    const KIND: ReturnKind;

    fn into_reply(self) -> AnyResult<Reply>;
}

impl IntoReply for Reply {
    const KIND: ReturnKind = ReturnKind::Dynamic;

    fn into_reply(self) -> AnyResult<Reply> {
        Ok(self)
    }
}

impl<R, E> IntoReply for Result<R, E>
where
    R: IntoReply,
    E: Into<AnyError>,
{
    const KIND: ReturnKind = R::KIND;

    fn into_reply(self) -> AnyResult<Reply> {
        self.map_err(Into::<AnyError>::into)?.into_reply()
    }
}

macro_rules! value_reply {
    ($($ty: ty),*) => {
        $(
            impl IntoReply for $ty {
                const KIND: ReturnKind = ReturnKind::Value;

                fn into_reply(self) -> AnyResult<Reply> {
                    to_value(self).map(Reply::Value)
                }
            }
        )*
    };
}

value_reply!(
    (),
    bool,
    i8,
    i16,
    i32,
    i64,
    isize,
    u8,
    u16,
    u32,
    u64,
    usize,
    f32,
    f64,
    String,
    &'static str,
    Value
);

impl<T: Serialize> IntoReply for Vec<T> {
    const KIND: ReturnKind = ReturnKind::Value;

    fn into_reply(self) -> AnyResult<Reply> {
        to_value(self).map(Reply::Value)
    }
}

impl<T: Serialize> IntoReply for Option<T> {
    const KIND: ReturnKind = ReturnKind::Value;

    fn into_reply(self) -> AnyResult<Reply> {
        to_value(self).map(Reply::Value)
    }
}

impl<T: Serialize> IntoReply for Json<T> {
    const KIND: ReturnKind = ReturnKind::Value;

    fn into_reply(self) -> AnyResult<Reply> {
        to_value(self.0).map(Reply::Value)
    }
}

/// A result that settles later.
pub struct Deferred<F>(pub F);

impl<F, T, E> IntoReply for Deferred<F>
where
    F: Future<Output = Result<T, E>> + 'static,
    T: Serialize,
    E: Into<AnyError>,
{
    const KIND: ReturnKind = ReturnKind::Deferred;

    fn into_reply(self) -> AnyResult<Reply> {
        Ok(Reply::deferred(self.0))
    }
}

/// A push-style sequence of results.
pub struct Streamed<S>(pub S);

impl<S, T, E> IntoReply for Streamed<S>
where
    S: Stream<Item = Result<T, E>> + 'static,
    T: Serialize,
    E: Into<AnyError>,
{
    const KIND: ReturnKind = ReturnKind::Stream;

    fn into_reply(self) -> AnyResult<Reply> {
        Ok(Reply::stream(self.0))
    }
}
