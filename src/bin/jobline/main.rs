mod args;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use jobline::clock::SystemClock;
use jobline::server::Server;
use jobline::service::JobService;
use jobline::store::{MemoryStore, Snapshot};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::{select, signal, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Level};

use crate::args::Args;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    let store = match load_store(&args) {
        Ok(store) => Arc::new(store),
        Err(error) => {
            error!("unable to load state: {error:#}");
            return ExitCode::from(2);
        },
    };

    let service = Arc::new(JobService::new(
        store.clone(),
        Arc::new(SystemClock),
        args.service_config(),
    ));
    let server = Arc::new(Server::new(service.clone(), args.max_log_size));

    // Cancellation and termination channel.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    let (shutdown_hold, mut shutdown_wait) = mpsc::channel::<()>(1);

    if args.reap_interval > 0 {
        tokio::spawn(reap_expired(
            service,
            Duration::from_secs(args.reap_interval),
            cancel.clone(),
            shutdown_hold.clone(),
        ));
    }

    let result = begin(&args, server, cancel.clone(), shutdown_hold).await;
    // Stop the reaper and any open connections even if the listener failed.
    cancel.cancel();

    let mut exit_code = if let Err(error) = result {
        error!(%error, "encountered runtime error");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    };

    // Every connection and the reaper hold a sender; recv() returns once they
    // have all finished.
    shutdown_wait.recv().await;

    if let Some(path) = &args.state_file {
        if let Err(error) = store.snapshot().save(path) {
            error!(%error, path = %path.display(), "unable to save state");
            exit_code = ExitCode::FAILURE;
        }
    }

    exit_code
}

fn load_store(args: &Args) -> Result<MemoryStore> {
    let Some(path) = &args.state_file else {
        return Ok(MemoryStore::new());
    };

    let snapshot = Snapshot::load(path)
        .with_context(|| format!("reading {}", path.display()))?;

    let Some(snapshot) = snapshot else {
        return Ok(MemoryStore::new());
    };

    let jobs = snapshot.jobs.len();
    let store = MemoryStore::from_snapshot(snapshot)
        .with_context(|| format!("restoring {}", path.display()))?;
    info!(path = %path.display(), jobs, "restored state");
    Ok(store)
}

async fn reap_expired(
    service: Arc<JobService>,
    every: Duration,
    cancel: CancellationToken,
    _shutdown_hold: mpsc::Sender<()>,
) {
    let mut interval = time::interval(every);

    loop {
        select! {
            _ = interval.tick() => {},
            _ = cancel.cancelled() => return,
        }

        match service.requeue_expired() {
            Ok(ids) if ids.is_empty() => {},
            Ok(ids) => info!(count = ids.len(), "requeued expired jobs"),
            Err(error) => warn!(%error, "failed to requeue expired jobs"),
        }
    }
}

async fn begin(
    args: &Args,
    server: Arc<Server>,
    cancel: CancellationToken,
    shutdown_hold: mpsc::Sender<()>,
) -> Result<()> {
    let listener = TcpListener::bind((args.listen, args.port))
        .await
        .context("binding listener")?;
    info!(addr = %listener.local_addr()?, "listening");

    // Accept incoming connections until an exit signal is sent, and handle each
    // connection as its own task.
    loop {
        let conn = match select! {
            accept = listener.accept() => accept,
            _ = cancel.cancelled() => break,
        } {
            Ok((conn, _)) => conn,
            Err(error) => {
                warn!(%error, "failed to accept connection");
                continue;
            },
        };

        tokio::spawn(begin_handle(
            server.clone(),
            cancel.clone(),
            shutdown_hold.clone(),
            conn,
        ));
    }

    Ok(())
}

#[instrument(name = "handle", err, fields(peer = %conn.peer_addr()?), skip_all)]
async fn begin_handle(
    server: Arc<Server>,
    cancel: CancellationToken,
    _shutdown_hold: mpsc::Sender<()>,
    mut conn: TcpStream,
) -> Result<()> {
    debug!("accepted connection");

    conn.set_nodelay(true).context("setting NODELAY")?;

    let (r, w) = conn.split();
    let ret = server.handle_conn(cancel, r, w).await;

    conn.shutdown().await.context("during shutdown")?;

    debug!("closed connection");

    ret
}
