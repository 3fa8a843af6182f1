use std::{
    collections::HashMap,
    net::SocketAddr,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::bail;
use serde::{Deserialize, Serialize};

mod extractor;
pub use extractor::Mount;

// MAX configuration file size: 16 MB
const MAX_CONFIG_FILE_SIZE: usize = 16 * 1024 * 1024;
// Read buffer size: 8 KB
const READ_BUFFER_SIZE: usize = 8 * 1024;
// Default iouring/epoll entries: 32k
const DEFAULT_ENTRIES: u32 = 32768;

pub const DEFAULT_QUEUE_SIZE: usize = 1024;
pub const DEFAULT_MAX_TASK_TIME_MS: u64 = 30_000;
pub const MIN_SQPOLL_IDLE_TIME: u32 = 1000; // 1s idle time.
pub const FALLBACK_PARALLELISM: NonZeroUsize = unsafe { NonZeroUsize::new_unchecked(1) };

macro_rules! define_const {
    ($name: ident, $val: expr, $type: ty) => {
        const fn $name() -> $type {
            $val
        }
    };
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_workers")]
    pub worker_threads: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_max_task_time_ms")]
    pub max_task_time_ms: u64,
    #[serde(default = "default_entries")]
    pub entries: u32,
    pub sqpoll_idle: Option<u32>,
    #[serde(default)]
    pub runtime_type: RuntimeType,
    #[serde(default = "default_cpu_affinity")]
    pub cpu_affinity: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_threads: default_workers(),
            queue_size: default_queue_size(),
            max_task_time_ms: default_max_task_time_ms(),
            entries: default_entries(),
            sqpoll_idle: None,
            runtime_type: Default::default(),
            cpu_affinity: default_cpu_affinity(),
        }
    }
}

impl RuntimeConfig {
    pub fn max_task_time(&self) -> Duration {
        Duration::from_millis(self.max_task_time_ms)
    }
}

// One core is left to the transport threads.
fn default_workers() -> usize {
    let cores: usize = std::thread::available_parallelism()
        .unwrap_or(FALLBACK_PARALLELISM)
        .into();
    cores.saturating_sub(1).max(1)
}

define_const!(default_entries, DEFAULT_ENTRIES, u32);
define_const!(default_cpu_affinity, false, bool);
define_const!(default_queue_size, DEFAULT_QUEUE_SIZE, usize);
define_const!(default_max_task_time_ms, DEFAULT_MAX_TASK_TIME_MS, u64);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    #[cfg(target_os = "linux")]
    IoUring,
    Legacy,
}

impl Default for RuntimeType {
    #[cfg(target_os = "linux")]
    fn default() -> Self {
        Self::IoUring
    }
    #[cfg(not(target_os = "linux"))]
    fn default() -> Self {
        Self::Legacy
    }
}

/// How to pick between overloads that reach the same match score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// The overload registered first wins.
    #[default]
    DeclarationOrder,
    /// Equal top scores fail the call with an ambiguity error.
    Reject,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RpcConfig {
    #[serde(default)]
    pub tie_break: TieBreak,
    // Deadline for deferred results; streams are never timed out.
    pub request_timeout_ms: Option<u64>,
}

impl RpcConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AuthConfig {
    /// username -> hex encoded sha256 of the password
    #[serde(default)]
    pub users: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ListenerConfig {
    Socket(SocketAddr),
    Unix(PathBuf),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub listener: ListenerConfig,
    /// Service that bare method names resolve against.
    pub mount: Option<String>,
}

/// Everything a per-connection pipeline needs to know about its server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub name: String,
    pub mount: Option<String>,
    pub rpc: RpcConfig,
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Self::from_slice(&Self::read_file(path).await?)
    }

    pub fn from_slice(content: &[u8]) -> anyhow::Result<Self> {
        // read first non-space u8
        let is_json = match content
            .iter()
            .find(|&&b| b != b' ' && b != b'\r' && b != b'\n' && b != b'\t')
        {
            Some(first) => *first == b'{',
            None => false,
        };
        match is_json {
            true => serde_json::from_slice::<Self>(content).map_err(Into::into),
            false => toml::from_str::<Self>(&String::from_utf8_lossy(content)).map_err(Into::into),
        }
    }

    pub fn pipeline_config(&self, name: &str) -> Option<PipelineConfig> {
        self.servers.get(name).map(|server| PipelineConfig {
            name: name.to_string(),
            mount: server.mount.clone(),
            rpc: self.rpc,
        })
    }

    async fn read_file(path: impl AsRef<Path>) -> anyhow::Result<Vec<u8>> {
        let file = match monoio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) => bail!("Config: error open file: {:?}", e),
        };

        let mut data = Vec::new();
        let mut buffer = Vec::with_capacity(READ_BUFFER_SIZE);

        loop {
            let (res, buf) = file.read_at(buffer, data.len() as u64).await;
            let n = res?;
            buffer = buf;
            if n == 0 {
                break;
            }

            if data.len() + n > MAX_CONFIG_FILE_SIZE {
                bail!("Config: max file size: {}", MAX_CONFIG_FILE_SIZE);
            }
            data.extend_from_slice(&buffer[..n]);
            buffer.clear();
        }

        Ok(data)
    }
}
