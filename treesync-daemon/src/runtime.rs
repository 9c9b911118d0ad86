//! Long-running client and server processes.
//!
//! Client: detector → [`SyncQueue`] → poll-tick drainer running each ready
//! path on the blocking pool, at most `concurrency` at a time.
//! Server: TCP listener → one task per connection → [`Reconciler`].
//!
//! Both shut down on ctrl-c through a broadcast channel.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

use treesync_core::SyncConfig;
use treesync_detector::ChangeDetector;
use treesync_sync::{
    ManifestStore, Reconciler, RetryPolicy, SyncOutcome, SyncQueue, SyncWorker, TransferClient,
};

use crate::error::{io_err, DaemonError};
use crate::paths::{with_default_port, SERVER_WAIT_INTERVAL};
use crate::protocol::{handle_request, malformed, Request, Response, TcpTransport};

type SharedQueue = Arc<Mutex<SyncQueue>>;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub root: PathBuf,
    /// `host:port` of the server.
    pub server: String,
    pub config: SyncConfig,
}

/// Start the client and block the current thread until it exits.
pub fn start_client_blocking(options: ClientOptions) -> Result<(), DaemonError> {
    init_tracing();
    runtime()?.block_on(async move {
        let shutdown = shutdown_on_ctrl_c();
        run_client(options, shutdown).await
    })
}

/// Start the server on `interface` and block the current thread until it exits.
pub fn start_server_blocking(root: &Path, interface: &str) -> Result<(), DaemonError> {
    init_tracing();
    let root = root.to_path_buf();
    let interface = interface.to_string();
    runtime()?.block_on(async move {
        let shutdown = shutdown_on_ctrl_c();
        let server = Server::bind(&root, &interface).await?;
        server.serve(shutdown.subscribe()).await
    })
}

/// Run the client until `shutdown` fires or change detection fails.
pub async fn run_client(options: ClientOptions, shutdown: broadcast::Sender<()>) -> Result<(), DaemonError> {
    options.config.validate()?;
    let server = with_default_port(&options.server);
    let transport = Arc::new(TcpTransport::new(server.clone()));

    if !wait_for_server(&transport, shutdown.subscribe()).await {
        return Ok(());
    }

    let client = TransferClient::new(transport.clone(), RetryPolicy::from_config(&options.config.retry));
    let seed = {
        let client = client.clone();
        tokio::task::spawn_blocking(move || client.list_tree())
            .await
            .map_err(|err| DaemonError::Protocol(format!("list_tree join error: {err}")))??
    };
    tracing::info!(server = %server, entries = seed.len(), "connected to server");

    let store = Arc::new(ManifestStore::in_memory());
    store.seed(seed.clone());
    let worker = Arc::new(SyncWorker::new(&options.root, &options.config, store, client));
    let queue: SharedQueue = Arc::new(Mutex::new(SyncQueue::new(options.config.rate_limit())));

    let detector_handle = {
        let shutdown = shutdown.clone();
        let queue = queue.clone();
        let root = options.root.clone();
        let config = options.config.clone();
        tokio::spawn(async move {
            let result = detector_task(root, config, seed, queue, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let drainer_handle = {
        let shutdown = shutdown.clone();
        let config = options.config.clone();
        tokio::spawn(async move {
            let result = drainer_task(queue, worker, config, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let (detector_result, drainer_result) = tokio::join!(detector_handle, drainer_handle);
    handle_join("detector", detector_result)?;
    handle_join("drainer", drainer_result)?;
    Ok(())
}

/// Ping until the server answers. `false` if shut down while waiting.
async fn wait_for_server(transport: &Arc<TcpTransport>, mut shutdown_rx: broadcast::Receiver<()>) -> bool {
    let mut announced = false;
    loop {
        let pinger = transport.clone();
        let reachable = tokio::task::spawn_blocking(move || pinger.ping())
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false);
        if reachable {
            return true;
        }
        if !announced {
            tracing::info!(server = %transport.server(), "waiting for server to start...");
            announced = true;
        }
        tokio::select! {
            _ = shutdown_rx.recv() => return false,
            _ = tokio::time::sleep(SERVER_WAIT_INTERVAL) => {}
        }
    }
}

async fn detector_task(
    root: PathBuf,
    config: SyncConfig,
    seed: Vec<treesync_core::Manifest>,
    queue: SharedQueue,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut stream = ChangeDetector::start(&root, &config, &seed)?;
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            next = stream.next() => {
                match next {
                    Some(Ok(event)) => {
                        let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
                        queue.enqueue(&event, Instant::now());
                    }
                    Some(Err(err)) => {
                        tracing::error!(root = %root.display(), error = %err, "change detection failed, stopping client");
                        return Err(err.into());
                    }
                    None => {
                        return Err(DaemonError::Protocol("change detector stopped unexpectedly".to_string()));
                    }
                }
            }
        }
    }
    Ok(())
}

async fn drainer_task(
    queue: SharedQueue,
    worker: Arc<SyncWorker>,
    config: SyncConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let permits = Arc::new(Semaphore::new(config.concurrency));
    let mut running = JoinSet::new();
    let mut tick = tokio::time::interval(config.poll_interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(err) = joined {
                    tracing::error!(error = %err, "sync task join failure");
                }
            }
            _ = tick.tick() => {
                let ready = queue
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .drain_ready(Instant::now());
                for entry in ready {
                    let permits = permits.clone();
                    let worker = worker.clone();
                    let queue = queue.clone();
                    running.spawn(async move {
                        let Ok(_permit) = permits.acquire_owned().await else {
                            return;
                        };
                        let path = entry.path.clone();
                        let kind = entry.latest_kind.clone();
                        let outcome = tokio::task::spawn_blocking(move || worker.sync_path(&entry))
                            .await
                            .unwrap_or_else(|err| {
                                tracing::error!(path = %path, error = %err, "sync task panicked; requeueing");
                                SyncOutcome::Requeue {
                                    path,
                                    kind,
                                    reason: format!("sync task join error: {err}"),
                                }
                            });
                        queue
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .finish(outcome.path(), outcome.completion(), Instant::now());
                    });
                }
            }
        }
    }

    // Let in-flight transfers land before exiting.
    while let Some(joined) = running.join_next().await {
        if let Err(err) = joined {
            tracing::error!(error = %err, "sync task join failure");
        }
    }
    Ok(())
}

/// A bound server, ready to [`serve`](Server::serve).
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    reconciler: Arc<Reconciler>,
}

impl Server {
    /// Open (creating if needed) the storage tree at `root` and bind `interface`.
    pub async fn bind(root: &Path, interface: &str) -> Result<Self, DaemonError> {
        let owned = root.to_path_buf();
        let reconciler = tokio::task::spawn_blocking(move || Reconciler::open(&owned))
            .await
            .map_err(|err| DaemonError::Protocol(format!("storage open join error: {err}")))??;
        let interface = with_default_port(interface);
        let listener = TcpListener::bind(&interface)
            .await
            .map_err(|source| DaemonError::Bind {
                interface: interface.clone(),
                source,
            })?;
        tracing::info!(
            interface = %interface,
            root = %reconciler.root().display(),
            files = reconciler.store().len(),
            "server listening"
        );
        Ok(Self {
            listener,
            reconciler: Arc::new(reconciler),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DaemonError> {
        self.listener.local_addr().map_err(|e| io_err("tcp listener", e))
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<(), DaemonError> {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            tracing::warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    let reconciler = self.reconciler.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, reconciler).await {
                            tracing::warn!(peer = %peer, error = %err, "connection error");
                        }
                    });
                }
            }
        }
        tracing::info!("server stopped");
        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, reconciler: Arc<Reconciler>) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await.map_err(|e| io_err("tcp read", e))? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                let reconciler = reconciler.clone();
                tokio::task::spawn_blocking(move || handle_request(&reconciler, request))
                    .await
                    .map_err(|err| DaemonError::Protocol(format!("request join error: {err}")))?
            }
            Err(err) => {
                tracing::warn!(error = %err, "malformed request");
                malformed(&err)
            }
        };
        write_response(&mut writer, &response).await?;
    }
    Ok(())
}

async fn write_response(writer: &mut OwnedWriteHalf, response: &Response) -> Result<(), DaemonError> {
    let mut payload = serde_json::to_vec(response)?;
    payload.push(b'\n');
    writer.write_all(&payload).await.map_err(|e| io_err("tcp write", e))?;
    writer.flush().await.map_err(|e| io_err("tcp flush", e))?;
    Ok(())
}

fn runtime() -> Result<tokio::runtime::Runtime, DaemonError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))
}

/// Broadcast sender that fires once on ctrl-c.
fn shutdown_on_ctrl_c() -> broadcast::Sender<()> {
    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    let shutdown = shutdown_tx.clone();
    tokio::spawn(async move {
        let mut shutdown_rx = shutdown.subscribe();
        tokio::select! {
            _ = shutdown_rx.recv() => {}
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => tracing::info!("terminated by the user"),
                    Err(err) => tracing::error!(error = %err, "ctrl-c handler failed"),
                }
                let _ = shutdown.send(());
            }
        }
    });
    shutdown_tx
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!("{task} task join failure: {err}"))),
    }
}

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use treesync_sync::Transport;

    #[tokio::test]
    async fn server_answers_over_tcp() {
        let tmp = tempfile::TempDir::new().expect("tmp");
        let server = Server::bind(tmp.path(), "127.0.0.1:0").await.expect("bind");
        let addr = server.local_addr().expect("addr");
        let (shutdown, _) = broadcast::channel(4);
        let handle = tokio::spawn(server.serve(shutdown.subscribe()));

        let transport = TcpTransport::new(addr.to_string());
        let tree = tokio::task::spawn_blocking(move || {
            transport.ping().expect("ping");
            transport.list_tree().expect("list")
        })
        .await
        .expect("join");
        assert!(tree.is_empty());

        shutdown.send(()).expect("send");
        handle.await.expect("join").expect("serve");
    }

    #[tokio::test]
    async fn malformed_line_gets_rejected_response() {
        let tmp = tempfile::TempDir::new().expect("tmp");
        let server = Server::bind(tmp.path(), "127.0.0.1:0").await.expect("bind");
        let addr = server.local_addr().expect("addr");
        let (shutdown, _) = broadcast::channel(4);
        tokio::spawn(server.serve(shutdown.subscribe()));

        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream.write_all(b"{\"cmd\":\"explode\"}\n").await.expect("write");
        let mut lines = BufReader::new(stream).lines();
        let line = lines.next_line().await.expect("read").expect("line");
        let response: Response = serde_json::from_str(&line).expect("decode");
        assert!(!response.ok);
        assert_eq!(response.failure, Some(crate::protocol::Failure::Rejected));
        let _ = shutdown.send(());
    }
}
