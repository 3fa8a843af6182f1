use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
};

use futures::future::AbortHandle;
use rpcbridge_core::{
    protocol::{RequestId, Response},
    socket::{Socket, SocketError},
    ErrorObject,
};
use serde_json::Value;
use tracing::{debug, trace, warn};

/// Requests of one connection that have not emitted their terminal message.
pub(crate) type InFlight = Mutex<HashMap<RequestId, Arc<RequestSink>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Open,
    /// The terminal message was written.
    Finished,
    /// Cancelled by the client or torn down with the connection.
    Cancelled,
}

struct Inner {
    state: SinkState,
    abort: Option<AbortHandle>,
}

/// Where the responses of one request go.
///
/// Writes happen under the sink's lock and only while it is open, so once
/// [`RequestSink::cancel`] returns nothing more is written for the request,
/// and at most one terminal message is ever written.
pub struct RequestSink {
    id: RequestId,
    socket: Arc<dyn Socket<Response>>,
    inner: Mutex<Inner>,
    in_flight: Weak<InFlight>,
}

impl RequestSink {
    pub(crate) fn new(
        id: RequestId,
        socket: Arc<dyn Socket<Response>>,
        in_flight: Weak<InFlight>,
    ) -> Self {
        Self {
            id,
            socket,
            inner: Mutex::new(Inner {
                state: SinkState::Open,
                abort: None,
            }),
            in_flight,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn state(&self) -> SinkState {
        self.lock().state
    }

    /// Emit one item; false once the request is over.
    pub fn item(&self, value: Value) -> bool {
        let open = {
            let mut inner = self.lock();
            if inner.state != SinkState::Open {
                return false;
            }
            self.send(&mut inner, Response::item(self.id, value))
        };
        if !open {
            self.release();
        }
        open
    }

    pub fn complete(&self) {
        self.finish(Response::completed(self.id));
    }

    pub fn fail(&self, error: ErrorObject) {
        self.finish(Response::Error {
            id: Some(self.id),
            error,
        });
    }

    /// Stop the request without a terminal message. Returns false when it was
    /// already over, which makes repeated cancels harmless.
    pub fn cancel(&self) -> bool {
        let abort = {
            let mut inner = self.lock();
            if inner.state != SinkState::Open {
                return false;
            }
            inner.state = SinkState::Cancelled;
            inner.abort.take()
        };
        if let Some(abort) = abort {
            abort.abort();
        }
        trace!("request {} cancelled", self.id);
        self.release();
        true
    }

    /// Attach the handle that stops the work behind this request.
    pub(crate) fn set_abort(&self, handle: AbortHandle) {
        let mut inner = self.lock();
        match inner.state {
            SinkState::Open => inner.abort = Some(handle),
            _ => handle.abort(),
        }
    }

    fn finish(&self, response: Response) {
        {
            let mut inner = self.lock();
            if inner.state != SinkState::Open {
                return;
            }
            if self.send(&mut inner, response) {
                inner.state = SinkState::Finished;
                inner.abort = None;
            }
        }
        self.release();
    }

    // A socket that is gone cancels the request; false in that case.
    fn send(&self, inner: &mut Inner, response: Response) -> bool {
        match self.socket.write(response) {
            Ok(()) => true,
            Err(e @ SocketError::Encode(_)) => {
                warn!("response for request {} not written: {e}", self.id);
                true
            }
            Err(e) => {
                debug!("request {} dropped: {e}", self.id);
                inner.state = SinkState::Cancelled;
                if let Some(abort) = inner.abort.take() {
                    abort.abort();
                }
                false
            }
        }
    }

    // Drop this sink's entry; a newer request reusing the id is left alone.
    fn release(&self) {
        let Some(in_flight) = self.in_flight.upgrade() else {
            return;
        };
        let mut in_flight = in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if in_flight
            .get(&self.id)
            .is_some_and(|sink| std::ptr::eq(Arc::as_ptr(sink), self))
        {
            in_flight.remove(&self.id);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
