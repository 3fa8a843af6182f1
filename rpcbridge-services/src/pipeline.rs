//! The per-connection stage stack.
//!
//! ```text
//!   frames -> NonBlockingStage -> CodecStage -> AuthStage -> Dispatcher
//! ```
//!
//! Built once per server with [`pipeline_factory`]; every accepted connection
//! gets a fresh stack from `make`.
use std::{convert::Infallible, sync::Arc};

use bytes::Bytes;
use rpcbridge_core::{config::PipelineConfig, pool::Spawn, registry::Registry};
use service_async::{stack::FactoryStack, MakeService};

use crate::{
    auth::{AuthProvider, AuthStage},
    codec::CodecStage,
    dispatch::Dispatcher,
    nonblocking::NonBlockingStage,
};

/// Top of a connection's stack; the transport registers it on its frame socket.
pub type Pipeline = Arc<NonBlockingStage<Bytes, Bytes>>;

pub fn pipeline_factory(
    config: PipelineConfig,
    spawner: Arc<dyn Spawn>,
    registry: Arc<Registry>,
    provider: Arc<dyn AuthProvider>,
) -> impl MakeService<Service = Pipeline, Error = Infallible> {
    FactoryStack::new(config)
        .push(Dispatcher::layer(registry))
        .push(AuthStage::layer(provider))
        .push(CodecStage::layer())
        .push(NonBlockingStage::layer(spawner))
        .into_inner()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rpcbridge_core::{
        config::{RpcConfig, RuntimeConfig, RuntimeType},
        pool::{BlockingSpawner, WorkerPool},
        protocol::Response,
        registry::{Deferred, MethodTable, RpcService},
        socket::{Listener, Socket},
        AnyError, ErrorCode,
    };
    use serde_json::json;

    use super::*;
    use crate::{auth::StaticAuthProvider, testing::RecordingSocket};

    struct Calc;

    impl RpcService for Calc {
        fn register(self: Arc<Self>, methods: &mut MethodTable) {
            methods
                .method("add", |a: i64, b: i64| a + b)
                .method("later", |a: i64| {
                    Deferred(async move {
                        monoio::time::sleep(Duration::from_millis(5)).await;
                        Ok::<_, AnyError>(a)
                    })
                });
        }
    }

    fn factory(spawner: Arc<dyn Spawn>) -> impl MakeService<Service = Pipeline, Error = Infallible> {
        let config = PipelineConfig {
            name: "test".to_string(),
            mount: Some("calc".to_string()),
            rpc: RpcConfig::default(),
        };
        let provider = StaticAuthProvider::default().with_user("alice", "secret");
        pipeline_factory(
            config,
            spawner,
            Arc::new(Registry::builder().mount(Calc).build()),
            Arc::new(provider),
        )
    }

    fn connect(pipeline: &Pipeline) -> Arc<RecordingSocket<Bytes>> {
        let below = Arc::new(RecordingSocket::default());
        let socket: Arc<dyn Socket<Bytes>> = below.clone();
        pipeline.on_register(socket);
        below
    }

    fn send(pipeline: &Pipeline, frame: &'static str) {
        pipeline.on_data(Bytes::from_static(frame.as_bytes())).unwrap();
    }

    const LOGIN: &str =
        r#"{"id":1,"jsonrpc":"2.0","method":"login","params":[{"username":"alice","password":"secret"}]}"#;

    #[test]
    fn test_calls_are_gated_until_login() {
        let pipeline = factory(Arc::new(BlockingSpawner)).make().unwrap();
        let below = connect(&pipeline);

        send(&pipeline, r#"{"id":2,"jsonrpc":"2.0","method":"add","params":[1,2]}"#);
        send(&pipeline, LOGIN);
        send(&pipeline, r#"{"id":3,"jsonrpc":"2.0","method":"add","params":[1,2]}"#);
        send(&pipeline, "not json");

        let responses = below.responses();
        assert_eq!(responses.len(), 6);
        match &responses[0] {
            Response::Error { id, error } => {
                assert_eq!(*id, Some(2));
                assert_eq!(error.code, ErrorCode::NotAuthenticated.code());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(responses[1], Response::item(1, json!(true)));
        assert_eq!(responses[2], Response::completed(1));
        assert_eq!(responses[3], Response::item(3, json!(3)));
        assert_eq!(responses[4], Response::completed(3));
        match &responses[5] {
            Response::Error { id: None, error } => {
                assert_eq!(error.code, ErrorCode::DecodeError.code())
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_each_connection_gets_its_own_state() {
        let factory = factory(Arc::new(BlockingSpawner));
        let first = factory.make().unwrap();
        let second = factory.make().unwrap();
        let first_below = connect(&first);
        let second_below = connect(&second);

        send(&first, LOGIN);
        send(&second, r#"{"id":2,"jsonrpc":"2.0","method":"add","params":[1,2]}"#);
        assert_eq!(first_below.responses().len(), 2);
        let second = second_below.responses();
        assert_eq!(second.len(), 1);
        assert!(matches!(&second[0], Response::Error { .. }));
    }

    #[test]
    fn test_worker_pool_answers_deferred_calls() {
        let pool = WorkerPool::start(&RuntimeConfig {
            worker_threads: 2,
            runtime_type: RuntimeType::Legacy,
            ..Default::default()
        })
        .unwrap();
        let pipeline = factory(pool.clone()).make().unwrap();
        let below = connect(&pipeline);

        send(&pipeline, LOGIN);
        // Login must be processed before the call is even looked at.
        wait_for(|| below.items().len() == 2);
        send(&pipeline, r#"{"id":7,"jsonrpc":"2.0","method":"later","params":[42]}"#);
        wait_for(|| below.items().len() == 4);

        let responses = below.responses();
        assert_eq!(responses[2], Response::item(7, json!(42)));
        assert_eq!(responses[3], Response::completed(7));

        pipeline.on_end().unwrap();
        wait_for(|| pipeline.write(Bytes::new()).is_err());
        pool.shutdown();
    }

    fn wait_for(done: impl Fn() -> bool) {
        for _ in 0..500 {
            if done() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached in time");
    }
}
