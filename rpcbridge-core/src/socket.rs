//! Socket and listener contracts shared by every pipeline stage.
//!
//! A pipeline is a linear stack of stages. Each stage is a [`Listener`] of the
//! stage below it and, at the same time, a [`Socket`] that the stages above it
//! can register on and write into:
//!
//! ```text
//!   transport  --on_data-->  stage A  --on_data-->  stage B  --> ...
//!   transport  <--write----  stage A  <--write----  stage B  <-- ...
//! ```
//!
//! [`ListenerSet`] implements the downstream half of that contract: ordered
//! registration, isolated delivery and one-shot end-of-stream. How `write` is
//! forwarded is left to each stage.
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tracing::{error, warn};

use crate::AnyResult;

#[derive(Error, Debug)]
pub enum SocketError {
    #[error("socket closed")]
    Closed,
    #[error("encode error: {0}")]
    Encode(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// The upstream-facing side of a stage.
pub trait Socket<W>: Send + Sync {
    fn write(&self, item: W) -> Result<(), SocketError>;
}

/// A consumer registered on a [`Socket`].
pub trait Listener<I, W>: Send + Sync {
    /// Called once, right after registration, with the socket to write into.
    fn on_register(&self, socket: Arc<dyn Socket<W>>);

    fn on_data(&self, item: I) -> AnyResult<()>;

    fn on_end(&self) -> AnyResult<()> {
        Ok(())
    }
}

impl<I, W, T> Listener<I, W> for Arc<T>
where
    T: Listener<I, W> + ?Sized,
{
    #[inline]
    fn on_register(&self, socket: Arc<dyn Socket<W>>) {
        (**self).on_register(socket)
    }

    #[inline]
    fn on_data(&self, item: I) -> AnyResult<()> {
        (**self).on_data(item)
    }

    #[inline]
    fn on_end(&self) -> AnyResult<()> {
        (**self).on_end()
    }
}

impl<W, T> Socket<W> for Arc<T>
where
    T: Socket<W> + ?Sized,
{
    #[inline]
    fn write(&self, item: W) -> Result<(), SocketError> {
        (**self).write(item)
    }
}

/// A socket other listeners can stack on.
pub trait Stage<I, W>: Socket<W> + Sized + 'static {
    fn listeners(&self) -> &ListenerSet<I, W>;

    /// Register `listener` on this stage, see [`ListenerSet::register`].
    fn register(self: Arc<Self>, listener: Arc<dyn Listener<I, W>>) -> bool
    where
        W: 'static,
    {
        let this: Arc<dyn Socket<W>> = self.clone();
        self.listeners().register(listener, this)
    }
}

/// The socket a stage writes into, handed over in `on_register` and released
/// at end of stream.
pub struct SocketSlot<W> {
    socket: Mutex<Option<Arc<dyn Socket<W>>>>,
}

impl<W> Default for SocketSlot<W> {
    fn default() -> Self {
        Self {
            socket: Mutex::new(None),
        }
    }
}

impl<W> SocketSlot<W> {
    pub fn set(&self, socket: Arc<dyn Socket<W>>) {
        *self.lock() = Some(socket);
    }

    pub fn get(&self) -> Option<Arc<dyn Socket<W>>> {
        self.lock().clone()
    }

    pub fn take(&self) -> Option<Arc<dyn Socket<W>>> {
        self.lock().take()
    }

    /// Write through the held socket; [`SocketError::Closed`] once released.
    pub fn write(&self, item: W) -> Result<(), SocketError> {
        // The lock is not held while writing.
        match self.get() {
            Some(socket) => socket.write(item),
            None => Err(SocketError::Closed),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn Socket<W>>>> {
        self.socket.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Ordered, append-only listener list with failure isolation.
///
/// A failing or panicking listener is logged and skipped, the remaining ones
/// still receive the event and nothing propagates to the caller. After
/// [`ListenerSet::on_end`] the list is dropped for good.
pub struct ListenerSet<I, W> {
    // None once the end of stream has been dispatched.
    listeners: Mutex<Option<Vec<Arc<dyn Listener<I, W>>>>>,
}

impl<I, W> Default for ListenerSet<I, W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I, W> ListenerSet<I, W> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Some(Vec::new())),
        }
    }

    /// Append `listener` and hand it `this`, the socket it is registered on.
    ///
    /// Returns false when the stream already ended; the listener is dropped
    /// without being notified.
    pub fn register(&self, listener: Arc<dyn Listener<I, W>>, this: Arc<dyn Socket<W>>) -> bool {
        {
            let mut guard = self.lock();
            match guard.as_mut() {
                Some(listeners) => listeners.push(listener.clone()),
                None => {
                    warn!("listener registered after end of stream, ignored");
                    return false;
                }
            }
        }
        if catch_unwind(AssertUnwindSafe(|| listener.on_register(this))).is_err() {
            error!("listener panicked during registration");
        }
        true
    }

    pub fn len(&self) -> usize {
        self.lock().as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_ended(&self) -> bool {
        self.lock().is_none()
    }

    // The list is snapshotted so listeners may write or register while being
    // notified without deadlocking.
    fn snapshot(&self) -> Vec<Arc<dyn Listener<I, W>>> {
        self.lock().as_ref().cloned().unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Vec<Arc<dyn Listener<I, W>>>>> {
        // A poisoned list is still structurally valid.
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<I: Clone, W> ListenerSet<I, W> {
    /// Deliver `item` to every listener in registration order.
    pub fn on_data(&self, item: I) {
        let listeners = self.snapshot();
        let Some((last, rest)) = listeners.split_last() else {
            return;
        };
        for listener in rest {
            dispatch("on_data", || listener.on_data(item.clone()));
        }
        dispatch("on_data", || last.on_data(item));
    }

    /// Deliver end-of-stream once; later calls are no-ops.
    pub fn on_end(&self) {
        let listeners = match self.lock().take() {
            Some(listeners) => listeners,
            None => return,
        };
        for listener in listeners.iter() {
            dispatch("on_end", || listener.on_end());
        }
    }
}

fn dispatch<F>(event: &'static str, f: F)
where
    F: FnOnce() -> AnyResult<()>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("listener failed in {event}: {e:#}"),
        Err(_) => error!("listener panicked in {event}"),
    }
}
