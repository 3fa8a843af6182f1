//! Turns every [`Reply`] into the same message sequence:
//! zero or more items, then exactly one `completed` or `error`.
//!
//! Plain values are answered on the spot. Deferred and stream replies are
//! spawned on the current monoio runtime, which is the worker the request was
//! dispatched on, and can be stopped through their [`RequestSink`].
use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::{
    future::{self, LocalBoxFuture},
    stream::{self, LocalBoxStream},
    FutureExt, StreamExt,
};
use rpcbridge_core::{map_error, map_stream_error, registry::Reply, AnyResult, RpcError};
use serde_json::Value;
use tracing::trace;

use super::sink::RequestSink;

#[derive(Debug, Clone, Copy, Default)]
pub struct ResultNormalizer {
    request_timeout: Option<Duration>,
}

impl ResultNormalizer {
    /// `request_timeout` bounds deferred replies; streams run until they end.
    pub fn new(request_timeout: Option<Duration>) -> Self {
        Self { request_timeout }
    }

    pub fn normalize(&self, reply: Reply, sink: Arc<RequestSink>) {
        match reply {
            Reply::Value(value) => {
                if sink.item(value) {
                    sink.complete();
                }
            }
            Reply::Deferred(future) => {
                monoio::spawn(drive_deferred(future, sink, self.request_timeout));
            }
            Reply::Stream(stream) => {
                monoio::spawn(drive_stream(stream, sink));
            }
        }
    }
}

async fn drive_deferred(
    future: LocalBoxFuture<'static, AnyResult<Value>>,
    sink: Arc<RequestSink>,
    request_timeout: Option<Duration>,
) {
    let (future, handle) = future::abortable(AssertUnwindSafe(future).catch_unwind());
    sink.set_abort(handle);

    let settled = match request_timeout {
        Some(limit) => match monoio::time::timeout(limit, future).await {
            Ok(settled) => settled,
            Err(_) => {
                sink.fail(RpcError::Timeout(limit.as_millis()).to_object());
                return;
            }
        },
        None => future.await,
    };
    match settled {
        Ok(Ok(Ok(value))) => {
            if sink.item(value) {
                sink.complete();
            }
        }
        Ok(Ok(Err(e))) => sink.fail(map_error(&e)),
        Ok(Err(_)) => {
            sink.fail(RpcError::Invocation("deferred result panicked".to_string()).to_object())
        }
        Err(_aborted) => trace!("deferred request {} stopped", sink.id()),
    }
}

async fn drive_stream(stream: LocalBoxStream<'static, AnyResult<Value>>, sink: Arc<RequestSink>) {
    let (stream, handle) = stream::abortable(AssertUnwindSafe(stream).catch_unwind());
    sink.set_abort(handle);
    futures::pin_mut!(stream);

    while let Some(next) = stream.next().await {
        match next {
            Ok(Ok(value)) => {
                if !sink.item(value) {
                    return;
                }
            }
            Ok(Err(e)) => {
                sink.fail(map_stream_error(&e));
                return;
            }
            Err(_) => {
                sink.fail(RpcError::Stream("stream panicked".to_string()).to_object());
                return;
            }
        }
    }
    // No-op when the stream ended because it was cancelled.
    sink.complete();
}
