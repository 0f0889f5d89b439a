//! `capfs-manager`: the metadata manager daemon. Loads the on-disk
//! config and `.iodtab`, opens the recipe store rooted at `data_dir`,
//! and serves the manager RPC surface.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Error};
use log::info;

use capfs::config::{CapfsConfig, IodTab, CAPFSDIR_SENTINEL};
use capfs::manager::server::ManagerServer;
use capfs::manager::OpEngine;
use capfs::tools;

fn usage() -> ! {
    eprintln!("usage: capfs-manager --config <path> [--manager-id <id>]");
    std::process::exit(2);
}

struct Args {
    config: PathBuf,
    manager_id: u32,
}

fn parse_args() -> Args {
    let mut config = None;
    let mut manager_id = 0u32;
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => config = it.next(),
            "--manager-id" => {
                manager_id = it
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(|| usage());
            }
            "-h" | "--help" => usage(),
            other => {
                eprintln!("unrecognized argument '{}'", other);
                usage();
            }
        }
    }
    Args {
        config: config.map(PathBuf::from).unwrap_or_else(|| usage()),
        manager_id,
    }
}

fn main() -> Result<(), Error> {
    let args = parse_args();
    let config = CapfsConfig::load(&args.config)
        .with_context(|| format!("loading {:?}", args.config))?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level)).init();

    tools::ensure_sentinel(config.data_dir.join(CAPFSDIR_SENTINEL))?;
    let iodtab = IodTab::load(&config.data_dir)
        .with_context(|| format!("loading .iodtab from {:?}", config.data_dir))?;

    info!(
        "capfs-manager starting: data_dir={:?} servers={} port={}",
        config.data_dir,
        iodtab.servers.len(),
        config.port
    );

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let data_dir = config.data_dir.clone();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.thread_count.max(1))
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    runtime.block_on(async move {
        let engine = Arc::new(OpEngine::new(data_dir, args.manager_id, config, iodtab));
        let server = Arc::new(ManagerServer::new(engine));
        server.serve(addr).await
    })
}
