#![allow(dead_code)]

mod client;
mod config;
mod deadline;
mod grpc;
mod node_cache;
mod rebalancer;
mod scid;
mod stats;
mod types;

use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use crate::config::Config;
use crate::deadline::Deadline;
use crate::node_cache::{save_shared, NodeCache, SharedNodeCache};
use crate::rebalancer::Rebalancer;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Config::parse();
    if cli.version {
        println!("lnbalancer v{}", env!("CARGO_PKG_VERSION"));
        return ExitCode::FAILURE;
    }

    let mut config = match cli.config.clone() {
        Some(path) => match Config::load_file(&path) {
            Ok(file) => Config::merge(file, cli),
            Err(e) => {
                error!("{:#}", e);
                return ExitCode::FAILURE;
            }
        },
        None => cli,
    };
    if let Err(e) = config.preflight() {
        error!("{:#}", e);
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => code,
    }
}

async fn run(config: Config) -> Result<(), ExitCode> {
    let client = grpc::LndGrpcClient::connect(&config).await.map_err(|e| {
        error!("{:#}", e);
        ExitCode::FAILURE
    })?;

    let node_cache: SharedNodeCache = Arc::new(Mutex::new(
        NodeCache::load(&config.node_cache_filename, config.node_cache_lifetime).map_err(
            |e| {
                error!("{:#}", e);
                ExitCode::FAILURE
            },
        )?,
    ));

    // The interrupt handler persists the node cache and exits non-zero; a
    // snapshot is taken under the lock so the worker is never torn mid-write.
    {
        let cache = Arc::clone(&node_cache);
        let path = config.node_cache_filename.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, saving node cache");
                save_shared(&cache, &path);
                std::process::exit(1);
            }
        });
    }

    // Periodic flush so a crash never loses more than a few minutes of
    // gathered node info.
    {
        let cache = Arc::clone(&node_cache);
        let path = config.node_cache_filename.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(600));
            tick.tick().await;
            loop {
                tick.tick().await;
                save_shared(&cache, &path);
            }
        });
    }

    let cache_path = config.node_cache_filename.clone();
    let timeout_info = config.timeout_info;
    let mut engine = Rebalancer::new(client, config, Arc::clone(&node_cache));

    let info_deadline = Deadline::after(Duration::from_secs(timeout_info));
    if let Err(e) = engine.startup(&info_deadline).await {
        error!("{:#}", e);
        return Err(ExitCode::FAILURE);
    }

    let result = engine.run_session().await;
    save_shared(&node_cache, &cache_path);

    match result {
        Ok(()) => Ok(()),
        // A session timeout only fails the run when nothing was rebalanced.
        Err(_) if engine.successes() > 0 => Ok(()),
        Err(_) => Err(ExitCode::FAILURE),
    }
}
