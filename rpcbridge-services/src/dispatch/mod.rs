//! Innermost pipeline stage: resolves calls against the [`Registry`] and
//! streams the outcome back through a [`RequestSink`].
//!
//! Each connection keeps a table of the requests that have not emitted their
//! terminal message yet. An id already in the table is refused, `cancel`
//! removes and silences the entry, and end of stream cancels everything that
//! is left.
use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{Arc, MutexGuard},
};

use rpcbridge_core::{
    config::{Mount, RpcConfig},
    map_error,
    protocol::{Inbound, Request, RequestId, Response},
    registry::Registry,
    socket::{Listener, Socket, SocketSlot},
    AnyResult, RpcError,
};
use service_async::{
    layer::{layer_fn, FactoryLayer},
    MakeService, Param,
};
use tracing::{debug, trace, warn};

pub use self::{
    normalize::ResultNormalizer,
    sink::{RequestSink, SinkState},
};
use self::sink::InFlight;

mod normalize;
mod sink;

pub struct Dispatcher {
    registry: Arc<Registry>,
    mount: Option<String>,
    rpc: RpcConfig,
    normalizer: ResultNormalizer,
    socket: SocketSlot<Response>,
    in_flight: Arc<InFlight>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, mount: Option<String>, rpc: RpcConfig) -> Self {
        Self {
            registry,
            mount,
            rpc,
            normalizer: ResultNormalizer::new(rpc.request_timeout()),
            socket: SocketSlot::default(),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn layer<C>(registry: Arc<Registry>) -> impl FactoryLayer<C, (), Factory = DispatcherFactory>
    where
        C: Param<RpcConfig> + Param<Mount>,
    {
        layer_fn(move |c: &C, ()| {
            let Mount(mount) = c.param();
            DispatcherFactory {
                registry: registry.clone(),
                mount,
                rpc: c.param(),
            }
        })
    }

    /// Ids of the requests still waiting for their terminal message.
    pub fn in_flight(&self) -> Vec<RequestId> {
        self.lock().keys().copied().collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, Arc<RequestSink>>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn call(&self, req: Request) {
        let Some(socket) = self.socket.get() else {
            debug!("call {} after end of stream dropped", req.id);
            return;
        };
        let sink = {
            let mut in_flight = self.lock();
            if in_flight.contains_key(&req.id) {
                None
            } else {
                let sink = Arc::new(RequestSink::new(
                    req.id,
                    socket.clone(),
                    Arc::downgrade(&self.in_flight),
                ));
                in_flight.insert(req.id, sink.clone());
                Some(sink)
            }
        };
        let Some(sink) = sink else {
            warn!("request id {} reused while in flight", req.id);
            // Not addressed to the id: it still belongs to the live request.
            let response = Response::error(None, &RpcError::DuplicateRequestId(req.id));
            if let Err(e) = socket.write(response) {
                warn!("duplicate id {} not reported: {e}", req.id);
            }
            return;
        };

        debug!(
            "call {} {}({}) streamed={}",
            req.id,
            req.method,
            req.shape(),
            req.streamed
        );
        match self.registry.call(
            &req.method,
            self.mount.as_deref(),
            &req.params,
            self.rpc.tie_break,
        ) {
            Ok(Ok(reply)) => self.normalizer.normalize(reply, sink),
            Ok(Err(e)) => sink.fail(map_error(&e)),
            Err(e) => {
                debug!("call {} not resolved: {e}", req.id);
                sink.fail(e.to_object());
            }
        }
    }

    fn cancel(&self, id: RequestId) {
        // The guard must be gone before the sink releases itself.
        let sink = self.lock().remove(&id);
        match sink {
            Some(sink) => {
                sink.cancel();
            }
            None => trace!("cancel for {id} which is not in flight"),
        }
    }
}

impl Listener<Inbound, Response> for Dispatcher {
    fn on_register(&self, socket: Arc<dyn Socket<Response>>) {
        self.socket.set(socket);
    }

    fn on_data(&self, inbound: Inbound) -> AnyResult<()> {
        match inbound {
            Inbound::Call(req) => self.call(req),
            Inbound::Cancel(id) => self.cancel(id),
        }
        Ok(())
    }

    fn on_end(&self) -> AnyResult<()> {
        let sinks: Vec<_> = self.lock().drain().map(|(_, sink)| sink).collect();
        if !sinks.is_empty() {
            debug!("connection closed with {} requests in flight", sinks.len());
        }
        for sink in sinks {
            sink.cancel();
        }
        self.socket.take();
        Ok(())
    }
}

pub struct DispatcherFactory {
    registry: Arc<Registry>,
    mount: Option<String>,
    rpc: RpcConfig,
}

impl MakeService for DispatcherFactory {
    type Service = Arc<Dispatcher>;
    type Error = Infallible;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(Arc::new(Dispatcher::new(
            self.registry.clone(),
            self.mount.clone(),
            self.rpc,
        )))
    }
}
