use service_async::Param;

use super::{PipelineConfig, RpcConfig};

/// The service bare method names resolve against.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Mount(pub Option<String>);

impl Param<RpcConfig> for PipelineConfig {
    fn param(&self) -> RpcConfig {
        self.rpc
    }
}

impl Param<Mount> for PipelineConfig {
    fn param(&self) -> Mount {
        Mount(self.mount.clone())
    }
}
