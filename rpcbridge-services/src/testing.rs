//! In-memory sockets and listeners for stage tests.
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use bytes::Bytes;
use rpcbridge_core::{
    protocol::Response,
    socket::{Listener, Socket, SocketError, SocketSlot},
    AnyResult,
};

pub struct RecordingSocket<W> {
    written: Mutex<Vec<W>>,
}

impl<W> Default for RecordingSocket<W> {
    fn default() -> Self {
        Self {
            written: Mutex::new(Vec::new()),
        }
    }
}

impl<W: Clone> RecordingSocket<W> {
    pub fn items(&self) -> Vec<W> {
        self.written.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.written.lock().unwrap().clear();
    }
}

impl RecordingSocket<Bytes> {
    pub fn responses(&self) -> Vec<Response> {
        self.items()
            .iter()
            .map(|frame| Response::decode(frame).unwrap())
            .collect()
    }
}

impl<W: Send> Socket<W> for RecordingSocket<W> {
    fn write(&self, item: W) -> Result<(), SocketError> {
        self.written.lock().unwrap().push(item);
        Ok(())
    }
}

/// Listener that records what it sees and keeps the socket it was given.
pub struct Collect<I, W> {
    seen: Mutex<Vec<I>>,
    ended: AtomicUsize,
    pub socket: SocketSlot<W>,
}

impl<I, W> Default for Collect<I, W> {
    fn default() -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            ended: AtomicUsize::new(0),
            socket: SocketSlot::default(),
        }
    }
}

impl<I: Clone, W> Collect<I, W> {
    pub fn items(&self) -> Vec<I> {
        self.seen.lock().unwrap().clone()
    }

    pub fn ended(&self) -> usize {
        self.ended.load(Ordering::SeqCst)
    }
}

impl<I: Send, W> Listener<I, W> for Collect<I, W> {
    fn on_register(&self, socket: Arc<dyn Socket<W>>) {
        self.socket.set(socket);
    }

    fn on_data(&self, item: I) -> AnyResult<()> {
        self.seen.lock().unwrap().push(item);
        Ok(())
    }

    fn on_end(&self) -> AnyResult<()> {
        self.ended.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
