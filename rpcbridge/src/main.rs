use std::{rc::Rc, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::Parser;
use rpcbridge_core::{
    config::Config,
    listener::ListenerBuilder,
    pool::{Spawn, WorkerPool},
    registry::Registry,
};
use rpcbridge_services::{
    auth::{AuthProvider, StaticAuthProvider},
    pipeline::pipeline_factory,
    transport::{serve, ConnectionService},
};
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

use crate::services::{Calc, Clock, Echo};

mod services;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the config file
    #[clap(short, long, value_parser)]
    config: String,

    /// Print the service directory and exit
    #[clap(long)]
    list: bool,
}

#[monoio::main(timer_enabled = true)]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let registry = Arc::new(Registry::builder().mount(Calc).mount(Clock).mount(Echo).build());
    if args.list {
        println!("{}", serde_json::to_string_pretty(&registry.listing())?);
        return Ok(());
    }

    let config = Config::load(&args.config).await?;
    if config.servers.is_empty() {
        bail!("no servers configured in {}", args.config);
    }
    if config.auth.users.is_empty() {
        tracing::warn!("no users configured, every login will be rejected");
    }

    let pool = WorkerPool::start(&config.runtime).context("start worker pool")?;
    let spawner: Arc<dyn Spawn> = pool.clone();
    let provider: Arc<dyn AuthProvider> = Arc::new(StaticAuthProvider::new(&config.auth));

    let mut servers = Vec::with_capacity(config.servers.len());
    for (name, server) in config.servers.iter() {
        let Some(pipeline_config) = config.pipeline_config(name) else {
            continue;
        };
        if let Some(mount) = &server.mount {
            if !registry.contains(mount) {
                bail!("server {name} mounts unknown service {mount}");
            }
        }
        let listener = ListenerBuilder::try_from(&server.listener)
            .and_then(|builder| builder.build())
            .with_context(|| format!("bind listener for server {name}"))?;
        let factory = pipeline_factory(
            pipeline_config,
            spawner.clone(),
            registry.clone(),
            provider.clone(),
        );
        info!("server {name} listening on {:?}", server.listener);
        servers.push(monoio::spawn(serve(
            listener,
            Rc::new(ConnectionService::new(factory)),
        )));
    }

    futures::future::join_all(servers).await;
    pool.shutdown();
    Ok(())
}
