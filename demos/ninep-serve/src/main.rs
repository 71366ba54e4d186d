//! A demo 9P2000 server: a small synthetic namespace, served over TCP
//! or a Unix domain socket, wired up the way the teacher's own
//! `unpfs` binary drives its filesystem over `srv_async` — a
//! `proto!address!port` connection string, `clap` for the rest of the
//! CLI, `env_logger` for logging, and graceful shutdown on SIGTERM/
//! SIGINT for the Unix listener.

mod transport;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use log::{error, info};
use ninep::config::Config;
use ninep::pool::SessionPool;
use ninep::srv::Filesystem;
use ninep::union::Union;
use ninep::utils::parse_proto;
use ninep::Result;
use ninep_sysfs::{SyntheticFile, SysFsBuilder};
use tokio::net::{TcpListener, UnixListener};

use crate::transport::StreamTransport;

struct UptimeFile {
    started: Instant,
}

impl SyntheticFile for UptimeFile {
    fn read(&self, offset: u64, count: u32) -> Result<Vec<u8>> {
        let line = format!("{:.1}s\n", self.started.elapsed().as_secs_f64());
        let bytes = line.into_bytes();
        let start = (offset as usize).min(bytes.len());
        let end = start.saturating_add(count as usize).min(bytes.len());
        Ok(bytes[start..end].to_vec())
    }

    fn write(&self, _offset: u64, _data: &[u8]) -> Result<u32> {
        Err(ninep::error::Error::backend("uptime is read-only"))
    }
}

fn build_namespace() -> Union {
    let mut builder = SysFsBuilder::new();
    builder.ram_file(
        SysFsBuilder::ROOT,
        "motd",
        0o444,
        b"welcome to ninep-serve\n".to_vec(),
    );
    builder.file(
        SysFsBuilder::ROOT,
        "uptime",
        0o444,
        Arc::new(UptimeFile { started: Instant::now() }),
    );
    let _scratch = builder.dir(SysFsBuilder::ROOT, "scratch");
    let sysfs = builder.build();

    Union::builder().mount("/", Arc::new(sysfs)).build()
}

/// A socket file the Unix listener binds, removed on drop so a crashed
/// or restarted server doesn't leave a stale socket behind.
struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<DeleteOnDrop> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            error!("failed to remove socket file {:?}: {}", self.path, e);
        }
    }
}

async fn serve_tcp<Fs: 'static + Filesystem>(pool: Arc<SessionPool<Fs>>, addr: &str, port: &str) -> Result<()> {
    let listener = TcpListener::bind(format!("{addr}:{port}"))
        .await
        .map_err(ninep::error::Error::Io)?;
    info!("listening on tcp {addr}:{port}");

    loop {
        let (stream, peer) = listener.accept().await.map_err(ninep::error::Error::Io)?;
        info!("accepted: {peer}");
        let pool = pool.clone();
        tokio::spawn(async move {
            let (read_half, write_half) = stream.into_split();
            let transport = Arc::new(StreamTransport::new(read_half, write_half));
            if let Err(e) = pool.accept(transport).await {
                error!("session ended: {}", e.ename());
            }
        });
    }
}

async fn serve_unix<Fs: 'static + Filesystem>(pool: Arc<SessionPool<Fs>>, path: &str) -> Result<()> {
    let socket = DeleteOnDrop::bind(path).map_err(ninep::error::Error::Io)?;
    info!("listening on unix {path}");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(ninep::error::Error::Io)?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .map_err(ninep::error::Error::Io)?;
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                _ = sigint.recv() => info!("received SIGINT, shutting down"),
            }
            running.store(false, Ordering::SeqCst);
        });
    }

    while running.load(Ordering::SeqCst) {
        tokio::select! {
            result = socket.listener.accept() => {
                let (stream, peer) = result.map_err(ninep::error::Error::Io)?;
                info!("accepted: {peer:?}");
                let pool = pool.clone();
                tokio::spawn(async move {
                    let (read_half, write_half) = tokio::io::split(stream);
                    let transport = Arc::new(StreamTransport::new(read_half, write_half));
                    if let Err(e) = pool.accept(transport).await {
                        error!("session ended: {}", e.ename());
                    }
                });
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }
    info!("server shutdown complete");
    Ok(())
}

#[derive(Debug, Parser)]
#[command(about = "Serve a small synthetic 9P2000 namespace")]
struct Cli {
    /// proto!address!port, e.g. tcp!0.0.0.0!5640 or unix!/tmp/ninep.sock!0
    address: String,

    #[arg(long, default_value_t = Config::default().pool_size)]
    pool_size: usize,

    #[arg(long, default_value_t = Config::default().msize)]
    msize: u32,
}

async fn run(cli: Cli) -> Result<()> {
    let (proto, addr, port) = parse_proto(&cli.address)
        .ok_or_else(|| ninep::error::Error::backend("address must be proto!addr!port"))?;

    let mut config = Config::default();
    config.pool_size = cli.pool_size;
    config.msize = cli.msize;

    let union = build_namespace();
    let pool = SessionPool::new(Arc::new(union), config, None);

    match proto {
        "tcp" => serve_tcp(pool, addr, port).await,
        "unix" => serve_unix(pool, addr).await,
        other => Err(ninep::error::Error::backend(format!("unsupported protocol {other}"))),
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    if let Err(e) = run(Cli::parse()).await {
        error!("{}", e.ename());
        std::process::exit(1);
    }
}
