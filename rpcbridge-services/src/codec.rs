//! Typed codec stage: raw frames below, [`Inbound`] / [`Response`] above.
use std::sync::Arc;

use bytes::Bytes;
use rpcbridge_core::{
    protocol::{Inbound, Response},
    socket::{Listener, ListenerSet, Socket, SocketError, SocketSlot, Stage},
    AnyResult,
};
use service_async::{
    layer::{layer_fn, FactoryLayer},
    MakeService,
};
use tracing::{debug, warn};

#[derive(Default)]
pub struct CodecStage {
    socket: SocketSlot<Bytes>,
    listeners: ListenerSet<Inbound, Response>,
}

impl CodecStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layer<C, F>() -> impl FactoryLayer<C, F, Factory = CodecFactory<F>> {
        layer_fn(|_c: &C, inner: F| CodecFactory { inner })
    }
}

impl Listener<Bytes, Bytes> for CodecStage {
    fn on_register(&self, socket: Arc<dyn Socket<Bytes>>) {
        self.socket.set(socket);
    }

    fn on_data(&self, frame: Bytes) -> AnyResult<()> {
        match Inbound::decode(&frame) {
            Ok(inbound) => self.listeners.on_data(inbound),
            Err(e) => {
                debug!("undecodable frame: {e}");
                if let Err(e) = self.write(e.into_response()) {
                    warn!("failed to report decode error: {e}");
                }
            }
        }
        Ok(())
    }

    fn on_end(&self) -> AnyResult<()> {
        self.listeners.on_end();
        self.socket.take();
        Ok(())
    }
}

impl Socket<Response> for CodecStage {
    fn write(&self, response: Response) -> Result<(), SocketError> {
        let frame = response
            .encode()
            .map_err(|e| SocketError::Encode(e.to_string()))?;
        self.socket.write(frame)
    }
}

impl Stage<Inbound, Response> for CodecStage {
    fn listeners(&self) -> &ListenerSet<Inbound, Response> {
        &self.listeners
    }
}

pub struct CodecFactory<F> {
    inner: F,
}

impl<F> MakeService for CodecFactory<F>
where
    F: MakeService,
    F::Service: Listener<Inbound, Response> + 'static,
{
    type Service = Arc<CodecStage>;
    type Error = F::Error;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        let inner = self.inner.make_via_ref(None)?;
        let stage = Arc::new(CodecStage::new());
        stage.clone().register(Arc::new(inner));
        Ok(stage)
    }
}

#[cfg(test)]
mod tests {
    use rpcbridge_core::{protocol::Request, ErrorCode};
    use serde_json::json;

    use super::*;
    use crate::testing::{Collect, RecordingSocket};

    fn setup() -> (
        Arc<CodecStage>,
        Arc<RecordingSocket<Bytes>>,
        Arc<Collect<Inbound, Response>>,
    ) {
        let stage = Arc::new(CodecStage::new());
        let below = Arc::new(RecordingSocket::default());
        let socket: Arc<dyn Socket<Bytes>> = below.clone();
        stage.on_register(socket);
        let collect = Arc::new(Collect::default());
        stage.clone().register(collect.clone());
        (stage, below, collect)
    }

    #[test]
    fn test_decodes_frames_for_listeners() {
        let (stage, below, collect) = setup();
        stage
            .on_data(Bytes::from_static(br#"{"id":1,"jsonrpc":"2.0","method":"add","params":[1,2]}"#))
            .unwrap();
        stage.on_data(Bytes::from_static(br#"{"cancel":1}"#)).unwrap();
        assert_eq!(
            collect.items(),
            vec![
                Inbound::Call(Request::new(1, "add", vec![json!(1), json!(2)])),
                Inbound::Cancel(1)
            ]
        );
        assert!(below.items().is_empty());
    }

    #[test]
    fn test_decode_failure_is_reported_not_dropped() {
        let (stage, below, collect) = setup();
        stage.on_data(Bytes::from_static(b"{oops")).unwrap();
        stage
            .on_data(Bytes::from_static(br#"{"id":7,"method":3}"#))
            .unwrap();
        assert!(collect.items().is_empty());

        let responses = below.responses();
        assert_eq!(responses.len(), 2);
        for (resp, id) in responses.iter().zip([None, Some(7)]) {
            match resp {
                Response::Error { id: got, error } => {
                    assert_eq!(*got, id);
                    assert_eq!(error.code, ErrorCode::DecodeError.code());
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_listeners_write_typed_responses() {
        let (_stage, below, collect) = setup();
        collect.socket.write(Response::item(3, json!("ok"))).unwrap();
        assert_eq!(&below.items()[0][..], br#"{"id":3,"result":"ok"}"#);
    }

    #[test]
    fn test_end_propagates_and_closes() {
        let (stage, _below, collect) = setup();
        stage.on_end().unwrap();
        stage.on_end().unwrap();
        assert_eq!(collect.ended(), 1);
        assert!(matches!(
            stage.write(Response::completed(1)),
            Err(SocketError::Closed)
        ));
    }
}
