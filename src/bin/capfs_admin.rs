//! `capfs-admin`: status/config CLI collaborator (component K). Talks
//! the same JSON-over-HTTP RPC the core speaks, one subcommand per
//! operation, in place of the teacher's `proxmox_backup_manager`
//! subcommand dispatch (minus its privileged API-router machinery,
//! which only makes sense wired into a running `proxmox-backup-api`
//! process).

use std::net::SocketAddr;

use anyhow::{bail, Context, Error};

use capfs::client::ManagerClient;
use capfs::config::IodTab;
use capfs::rpc_http::RpcClient;
use capfs::wire::{PingRequest, PingResponse, CasStatFsResponse, Version};

fn usage() -> ! {
    eprintln!(
        "usage: capfs-admin <command> [args...]\n\
         commands:\n\
         \x20 ping-iod <addr>                ping a data server\n\
         \x20 statfs-iod <addr>              show a data server's capacity\n\
         \x20 lookup <manager-addr> <name>   look up a file's size\n\
         \x20 iodtab <data-dir>              print the parsed .iodtab"
    );
    std::process::exit(2);
}

fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let mut args = std::env::args().skip(1);
    let command = args.next().unwrap_or_else(|| usage());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match command.as_str() {
        "ping-iod" => {
            let addr: SocketAddr = args.next().unwrap_or_else(|| usage()).parse().context("invalid address")?;
            runtime.block_on(ping_iod(addr))?;
        }
        "statfs-iod" => {
            let addr: SocketAddr = args.next().unwrap_or_else(|| usage()).parse().context("invalid address")?;
            runtime.block_on(statfs_iod(addr))?;
        }
        "lookup" => {
            let addr: SocketAddr = args.next().unwrap_or_else(|| usage()).parse().context("invalid address")?;
            let name = args.next().unwrap_or_else(|| usage());
            runtime.block_on(lookup(addr, &name))?;
        }
        "iodtab" => {
            let dir = args.next().unwrap_or_else(|| usage());
            show_iodtab(&dir)?;
        }
        other => {
            eprintln!("unknown command '{}'", other);
            usage();
        }
    }
    Ok(())
}

async fn ping_iod(addr: SocketAddr) -> Result<(), Error> {
    let rpc = RpcClient::new();
    let resp: PingResponse = rpc
        .post_json(addr, "/capfs/cas/v1/ping", &PingRequest { version: Version::CURRENT })
        .await
        .with_context(|| format!("ping {} failed", addr))?;
    println!("{}: protocol {}.{}", addr, resp.version.major, resp.version.minor);
    Ok(())
}

async fn statfs_iod(addr: SocketAddr) -> Result<(), Error> {
    let rpc = RpcClient::new();
    let resp: CasStatFsResponse = rpc
        .post_json(addr, "/capfs/cas/v1/statfs", &PingRequest { version: Version::CURRENT })
        .await
        .with_context(|| format!("statfs {} failed", addr))?;
    println!(
        "{}: {} chunks, {} / {} bytes free",
        addr, resp.chunk_count, resp.free_bytes, resp.total_bytes
    );
    Ok(())
}

async fn lookup(addr: SocketAddr, name: &str) -> Result<(), Error> {
    let client = ManagerClient::new(addr);
    let resp = client.lookup(name).await.with_context(|| format!("lookup {} on {}", name, addr))?;
    println!("{}: file={:?} size={}", name, resp.file, resp.size);
    Ok(())
}

fn show_iodtab(dir: &str) -> Result<(), Error> {
    let path = std::path::Path::new(dir);
    if !path.exists() {
        bail!("{:?} does not exist", path);
    }
    let tab = IodTab::load(path)?;
    for entry in &tab.servers {
        println!("{}\t{}", entry.index, entry.addr);
    }
    Ok(())
}
