//! Newline delimited frames over an accepted byte stream.
//!
//! The connection task reads frames and feeds them to the pipeline. Replies
//! are written by worker threads, so [`FrameSocket`] only queues them and a
//! writer task on the connection's own runtime drains the queue in order.
use std::{fmt::Debug, io, rc::Rc, sync::Arc};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures_channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use monoio::io::{
    stream::Stream, AsyncReadRent, AsyncWriteRent, AsyncWriteRentExt, Split, Splitable,
};
use rpcbridge_core::{
    listener::AcceptedAddr,
    socket::{Listener, ListenerSet, Socket, SocketError, Stage},
};
use service_async::{MakeService, Service};
use tracing::{debug, error, info, warn};

// Frames longer than this close the connection: 16 MB
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
// Read buffer size: 8 KB
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Bottom of a connection's stack.
pub struct FrameSocket {
    tx: UnboundedSender<Bytes>,
    listeners: ListenerSet<Bytes, Bytes>,
}

impl FrameSocket {
    pub fn new(tx: UnboundedSender<Bytes>) -> Self {
        Self {
            tx,
            listeners: ListenerSet::new(),
        }
    }

    pub fn deliver(&self, frame: Bytes) {
        self.listeners.on_data(frame);
    }

    /// Signal end of stream upstream and stop accepting writes. Frames queued
    /// before this are still flushed.
    pub fn close(&self) {
        self.listeners.on_end();
        self.tx.close_channel();
    }
}

impl Socket<Bytes> for FrameSocket {
    fn write(&self, frame: Bytes) -> Result<(), SocketError> {
        self.tx
            .unbounded_send(frame)
            .map_err(|_| SocketError::Closed)
    }
}

impl Stage<Bytes, Bytes> for FrameSocket {
    fn listeners(&self) -> &ListenerSet<Bytes, Bytes> {
        &self.listeners
    }
}

/// Bytes read from a connection that have not formed a frame yet.
///
/// Only bytes appended since the last scan are searched for a newline, so a
/// long frame arriving in many reads costs time linear in its length.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: BytesMut,
    scanned: usize,
}

impl FrameBuffer {
    pub fn extend(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Length of the unterminated tail.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Next complete line. A trailing `\r` is dropped and blank lines are
    /// skipped.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            let Some(offset) = self.pending[self.scanned..].iter().position(|&b| b == b'\n') else {
                self.scanned = self.pending.len();
                return None;
            };
            let pos = self.scanned + offset;
            self.scanned = 0;
            let mut line = self.pending.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(pos - 1);
            }
            if !line.iter().all(u8::is_ascii_whitespace) {
                return Some(line.freeze());
            }
        }
    }

    /// Whatever is left once the peer stopped sending, unless it is blank.
    pub fn finish(&mut self) -> Option<Bytes> {
        self.scanned = 0;
        let rest = self.pending.split();
        (!rest.iter().all(u8::is_ascii_whitespace)).then(|| rest.freeze())
    }
}

/// Runs one accepted connection against a fresh pipeline from `factory`.
pub struct ConnectionService<F> {
    factory: F,
}

impl<F> ConnectionService<F> {
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

impl<F, S> Service<(S, AcceptedAddr)> for ConnectionService<F>
where
    F: MakeService,
    F::Service: Listener<Bytes, Bytes> + 'static,
    F::Error: Debug,
    S: Split + AsyncReadRent + AsyncWriteRent + 'static,
{
    type Response = ();
    type Error = io::Error;

    async fn call(&self, (stream, addr): (S, AcceptedAddr)) -> Result<Self::Response, Self::Error> {
        let pipeline = self
            .factory
            .make()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("build pipeline: {e:?}")))?;
        debug!("connection {addr} opened");

        let (tx, rx) = mpsc::unbounded();
        let frames = Arc::new(FrameSocket::new(tx));
        frames.clone().register(Arc::new(pipeline));

        let (reader, writer) = stream.into_split();
        let writer = monoio::spawn(write_frames(writer, rx));
        let read = read_frames(reader, &frames).await;
        frames.close();
        let written = writer.await;

        debug!("connection {addr} closed");
        read.and(written)
    }
}

async fn read_frames<R: AsyncReadRent>(mut reader: R, frames: &FrameSocket) -> io::Result<()> {
    let mut pending = FrameBuffer::default();
    let mut buffer = Vec::with_capacity(READ_BUFFER_SIZE);
    loop {
        let (res, buf) = reader.read(buffer).await;
        buffer = buf;
        if res? == 0 {
            // the peer may omit the final newline
            if let Some(frame) = pending.finish() {
                frames.deliver(frame);
            }
            return Ok(());
        }
        pending.extend(&buffer);
        buffer.clear();

        while let Some(frame) = pending.next_frame() {
            frames.deliver(frame);
        }
        if pending.len() > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame exceeds {MAX_FRAME_SIZE} bytes"),
            ));
        }
    }
}

async fn write_frames<W: AsyncWriteRent>(
    mut writer: W,
    mut rx: UnboundedReceiver<Bytes>,
) -> io::Result<()> {
    while let Some(frame) = rx.next().await {
        let mut out = Vec::with_capacity(frame.len() + 1);
        out.extend_from_slice(&frame);
        out.push(b'\n');
        // Coalesce whatever else is already queued.
        while let Ok(Some(frame)) = rx.try_next() {
            out.extend_from_slice(&frame);
            out.push(b'\n');
        }
        let (res, _) = writer.write_all(out).await;
        if let Err(e) = res {
            rx.close();
            return Err(e);
        }
    }
    writer.shutdown().await
}

/// Accept connections until the listener is exhausted, one task each.
pub async fn serve<L, Svc, A>(mut listener: L, handler: Rc<Svc>)
where
    L: Stream<Item = io::Result<A>> + 'static,
    Svc: Service<A> + 'static,
    Svc::Error: Debug,
    A: 'static,
{
    while let Some(accept) = listener.next().await {
        match accept {
            Ok(accept) => {
                let svc = handler.clone();
                monoio::spawn(async move {
                    match svc.call(accept).await {
                        Ok(_) => debug!("connection complete"),
                        Err(e) => error!("connection error: {e:?}"),
                    }
                });
            }
            Err(e) => warn!("accept connection failed: {e:?}"),
        }
    }
    info!("listener closed");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use monoio::{
        io::AsyncReadRent,
        net::{TcpListener, TcpStream},
        LegacyDriver, RuntimeBuilder,
    };
    use rpcbridge_core::{
        config::{PipelineConfig, RpcConfig},
        listener::AcceptedStream,
        pool::BlockingSpawner,
        protocol::Response,
        registry::{MethodTable, Registry, RpcService},
    };
    use serde_json::json;

    use super::*;
    use crate::{auth::StaticAuthProvider, pipeline::pipeline_factory, testing::Collect};

    fn drain(pending: &mut FrameBuffer) -> Vec<Bytes> {
        std::iter::from_fn(|| pending.next_frame()).collect()
    }

    #[test]
    fn test_frame_buffer_splits_lines() {
        let mut pending = FrameBuffer::default();
        pending.extend(b"{\"a\":1}\r\n\n  \n{\"b\":2}\n{\"c\"");
        assert_eq!(
            drain(&mut pending),
            vec![
                Bytes::from_static(b"{\"a\":1}"),
                Bytes::from_static(b"{\"b\":2}")
            ]
        );
        assert_eq!(&pending.pending[..], b"{\"c\"");
        pending.extend(b":3}");
        assert!(drain(&mut pending).is_empty());
        assert_eq!(pending.finish(), Some(Bytes::from_static(b"{\"c\":3}")));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_frame_buffer_scans_only_new_bytes() {
        let mut pending = FrameBuffer::default();
        let chunk = vec![b'x'; READ_BUFFER_SIZE];
        for round in 1..=64 {
            pending.extend(&chunk);
            assert_eq!(pending.next_frame(), None);
            assert_eq!(pending.scanned, round * READ_BUFFER_SIZE);
        }
        pending.extend(b"\n{}\n");
        let frame = pending.next_frame().unwrap();
        assert_eq!(frame.len(), 64 * READ_BUFFER_SIZE);
        assert_eq!(pending.next_frame(), Some(Bytes::from_static(b"{}")));
        assert_eq!(pending.scanned, 0);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_frame_socket_closes_once() {
        let (tx, mut rx) = mpsc::unbounded();
        let frames = Arc::new(FrameSocket::new(tx));
        let collect = Arc::new(Collect::<Bytes, Bytes>::default());
        frames.clone().register(collect.clone());

        frames.deliver(Bytes::from_static(b"x"));
        collect.socket.write(Bytes::from_static(b"y")).unwrap();
        frames.close();
        frames.close();

        assert_eq!(collect.items(), vec![Bytes::from_static(b"x")]);
        assert_eq!(collect.ended(), 1);
        assert!(matches!(
            frames.write(Bytes::from_static(b"z")),
            Err(SocketError::Closed)
        ));
        assert_eq!(rx.try_next().unwrap(), Some(Bytes::from_static(b"y")));
        assert_eq!(rx.try_next().unwrap(), None);
    }

    struct Calc;

    impl RpcService for Calc {
        fn register(self: Arc<Self>, methods: &mut MethodTable) {
            methods.method("add", |a: i64, b: i64| a + b);
        }
    }

    async fn read_lines(stream: &mut TcpStream, want: usize) -> Vec<Response> {
        let mut pending = FrameBuffer::default();
        let mut lines = Vec::new();
        let mut buffer = Vec::with_capacity(1024);
        while lines.len() < want {
            let (res, buf) = stream.read(buffer).await;
            assert!(res.unwrap() > 0, "server closed early");
            pending.extend(&buf);
            buffer = buf;
            buffer.clear();
            lines.extend(drain(&mut pending));
        }
        lines
            .iter()
            .map(|line| Response::decode(line).unwrap())
            .collect()
    }

    #[test]
    fn test_tcp_round_trip() {
        RuntimeBuilder::<LegacyDriver>::new()
            .enable_timer()
            .build()
            .unwrap()
            .block_on(async {
                let config = PipelineConfig {
                    name: "test".to_string(),
                    mount: Some("calc".to_string()),
                    rpc: RpcConfig::default(),
                };
                let factory = pipeline_factory(
                    config,
                    Arc::new(BlockingSpawner),
                    Arc::new(Registry::builder().mount(Calc).build()),
                    Arc::new(StaticAuthProvider::default().with_user("alice", "secret")),
                );
                let svc = Rc::new(ConnectionService::new(factory));

                let listener = TcpListener::bind("127.0.0.1:0").unwrap();
                let addr = listener.local_addr().unwrap();
                monoio::spawn(async move {
                    let mut listener = listener;
                    if let Some(Ok((stream, peer))) = listener.next().await {
                        let accepted = (AcceptedStream::Tcp(stream), AcceptedAddr::from(peer));
                        svc.call(accepted).await.unwrap();
                    }
                });

                let mut client = TcpStream::connect(addr).await.unwrap();
                let request = concat!(
                    r#"{"id":1,"jsonrpc":"2.0","method":"login","params":[{"username":"alice","password":"secret"}]}"#,
                    "\n",
                    r#"{"id":2,"jsonrpc":"2.0","method":"add","params":[20,22]}"#,
                    "\n"
                );
                let (res, _) = client.write_all(request.as_bytes().to_vec()).await;
                res.unwrap();

                let responses = read_lines(&mut client, 4).await;
                assert_eq!(
                    responses,
                    vec![
                        Response::item(1, json!(true)),
                        Response::completed(1),
                        Response::item(2, json!(42)),
                        Response::completed(2),
                    ]
                );

                // Closing our side ends the connection task cleanly.
                client.shutdown().await.unwrap();
                monoio::time::sleep(Duration::from_millis(20)).await;
            });
    }
}
