//! Offloads downstream processing onto the worker pool.
//!
//! Every inbound item becomes one pool task running the full downstream
//! dispatch, so user logic never runs on the transport's thread. Tasks are
//! unordered: two frames of one connection may be handled concurrently and
//! answered out of order.
//!
//! `write` goes straight to the socket below. End of stream is offloaded too;
//! once it has run, the stage lets go of that socket and later writes fail
//! with [`SocketError::Closed`].
use std::{marker::PhantomData, sync::Arc};

use rpcbridge_core::{
    pool::Spawn,
    socket::{Listener, ListenerSet, Socket, SocketError, SocketSlot, Stage},
    AnyResult,
};
use service_async::{
    layer::{layer_fn, FactoryLayer},
    MakeService,
};
use tracing::error;

pub struct NonBlockingStage<I, W> {
    spawner: Arc<dyn Spawn>,
    socket: Arc<SocketSlot<W>>,
    listeners: Arc<ListenerSet<I, W>>,
}

impl<I, W> NonBlockingStage<I, W> {
    pub fn new(spawner: Arc<dyn Spawn>) -> Self {
        Self {
            spawner,
            socket: Arc::new(SocketSlot::default()),
            listeners: Arc::new(ListenerSet::new()),
        }
    }

    pub fn layer<C, F>(
        spawner: Arc<dyn Spawn>,
    ) -> impl FactoryLayer<C, F, Factory = NonBlockingFactory<F, I, W>> {
        layer_fn(move |_c: &C, inner: F| NonBlockingFactory {
            spawner: spawner.clone(),
            inner,
            _marker: PhantomData,
        })
    }
}

impl<I, W> Listener<I, W> for NonBlockingStage<I, W>
where
    I: Clone + Send + 'static,
    W: Send + 'static,
{
    fn on_register(&self, socket: Arc<dyn Socket<W>>) {
        self.socket.set(socket);
    }

    fn on_data(&self, item: I) -> AnyResult<()> {
        let listeners = self.listeners.clone();
        if let Err(e) = self
            .spawner
            .spawn(Box::pin(async move { listeners.on_data(item) }))
        {
            error!("inbound item dropped: {e}");
        }
        Ok(())
    }

    fn on_end(&self) -> AnyResult<()> {
        let listeners = self.listeners.clone();
        let socket = self.socket.clone();
        let task = Box::pin(async move {
            listeners.on_end();
            socket.take();
        });
        if let Err(e) = self.spawner.spawn(task) {
            // Listeners still have to learn about the end to release their state.
            error!("end of stream not offloaded ({e}), ending inline");
            self.listeners.on_end();
            self.socket.take();
        }
        Ok(())
    }
}

impl<I, W> Socket<W> for NonBlockingStage<I, W>
where
    I: Send + 'static,
    W: Send + 'static,
{
    #[inline]
    fn write(&self, item: W) -> Result<(), SocketError> {
        self.socket.write(item)
    }
}

impl<I, W> Stage<I, W> for NonBlockingStage<I, W>
where
    I: Send + 'static,
    W: Send + 'static,
{
    fn listeners(&self) -> &ListenerSet<I, W> {
        &self.listeners
    }
}

pub struct NonBlockingFactory<F, I, W> {
    spawner: Arc<dyn Spawn>,
    inner: F,
    _marker: PhantomData<fn(I, W)>,
}

impl<F, I, W> MakeService for NonBlockingFactory<F, I, W>
where
    F: MakeService,
    F::Service: Listener<I, W> + 'static,
    I: Clone + Send + 'static,
    W: Send + 'static,
{
    type Service = Arc<NonBlockingStage<I, W>>;
    type Error = F::Error;

    // Stages hold per-connection state, so nothing is carried over from `old`.
    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        let inner = self.inner.make_via_ref(None)?;
        let stage = Arc::new(NonBlockingStage::new(self.spawner.clone()));
        stage.clone().register(Arc::new(inner));
        Ok(stage)
    }
}
