//! `capfs-iod`: a data-server (CAS) daemon. Opens or initializes the
//! chunk store rooted at `data_dir` and serves the CAS RPC surface.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Error};
use log::info;

use capfs::cas::server::DataServer;
use capfs::cas::ChunkStore;
use capfs::config::CapfsConfig;

fn usage() -> ! {
    eprintln!("usage: capfs-iod --config <path> --name <server-name> [--init]");
    std::process::exit(2);
}

struct Args {
    config: PathBuf,
    name: String,
    init: bool,
}

fn parse_args() -> Args {
    let mut config = None;
    let mut name = None;
    let mut init = false;
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => config = it.next(),
            "--name" => name = it.next(),
            "--init" => init = true,
            "-h" | "--help" => usage(),
            other => {
                eprintln!("unrecognized argument '{}'", other);
                usage();
            }
        }
    }
    Args {
        config: config.map(PathBuf::from).unwrap_or_else(|| usage()),
        name: name.unwrap_or_else(|| usage()),
        init,
    }
}

fn main() -> Result<(), Error> {
    let args = parse_args();
    let config = CapfsConfig::load(&args.config)
        .with_context(|| format!("loading {:?}", args.config))?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level)).init();

    let store = if args.init {
        ChunkStore::create(&args.name, config.data_dir.clone())
    } else {
        ChunkStore::open(&args.name, config.data_dir.clone())
    }
    .with_context(|| format!("opening data directory {:?}", config.data_dir))?;

    info!(
        "capfs-iod '{}' starting: data_dir={:?} port={}",
        store.name(),
        store.base(),
        config.port
    );

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.thread_count.max(1))
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    runtime.block_on(async move {
        let server = Arc::new(DataServer::new(Arc::new(store)));
        server.serve(addr).await
    })
}
