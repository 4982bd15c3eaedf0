use std::{future::Future, net::SocketAddr, sync::Arc};

use tokio::{
    net::{TcpListener, TcpStream},
    select,
    time::timeout,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    broadcast::Broadcaster,
    codec::FrameCodec,
    config::ServerConfig,
    error::ServerError,
    registry::Registry,
    session::{self, Session},
};

/// Accepts connections and runs one session worker per client.
pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    broadcaster: Arc<Broadcaster>,
    shutdown: CancellationToken,
    workers: TaskTracker,
}

/// Stops a running [`Server`]. Clone it freely; calling
/// [`ShutdownHandle::shutdown`] more than once is harmless.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.listen,
                source,
            })?;
        Ok(Self::new(listener, config))
    }

    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        let registry = Arc::new(Registry::new());
        Self {
            listener,
            broadcaster: Arc::new(Broadcaster::new(registry, config.write_timeout)),
            config,
            shutdown: CancellationToken::new(),
            workers: TaskTracker::new(),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            token: self.shutdown.clone(),
        }
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(self.broadcaster.registry())
    }

    /// Runs until a [`ShutdownHandle`] fires.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Runs until `shutdown` resolves or a [`ShutdownHandle`] fires, then
    /// closes every session and waits (bounded by the configured grace
    /// period) for their workers to finish.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            config,
            broadcaster,
            shutdown: token,
            workers,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                _ = token.cancelled() => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &config, &broadcaster, &token, &workers).await;
                }
            }
        }

        let open = broadcaster.registry().len().await;
        info!(sessions = open, "relay shutting down");

        // Accepting has stopped; every session token is a child of this one.
        token.cancel();
        drop(listener);

        workers.close();
        if timeout(config.shutdown_grace, workers.wait()).await.is_err() {
            warn!(
                remaining = workers.len(),
                grace = ?config.shutdown_grace,
                "session workers still running after shutdown grace period"
            );
        }

        info!("relay stopped");
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<(), ServerError> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Binds `config.listen` and relays until Ctrl-C. Returns early only when the
/// address cannot be bound.
pub async fn serve(config: ServerConfig) -> Result<(), ServerError> {
    let server = Server::bind(config).await?;
    info!("relay listening on {}", server.local_addr()?);
    server.run_until_ctrl_c().await
}

/// [`serve`] on every interface with default settings.
pub async fn listen(port: u16) -> Result<(), ServerError> {
    serve(ServerConfig::with_port(port)).await
}

async fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    config: &ServerConfig,
    broadcaster: &Arc<Broadcaster>,
    shutdown: &CancellationToken,
    workers: &TaskTracker,
) {
    match result {
        Ok((stream, peer)) => {
            spawn_session(stream, peer, config, broadcaster, shutdown, workers).await
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

async fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    config: &ServerConfig,
    broadcaster: &Arc<Broadcaster>,
    shutdown: &CancellationToken,
    workers: &TaskTracker,
) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%peer, error = ?err, "failed to set TCP_NODELAY");
    }

    let (reader, writer) = stream.into_split();
    let registry = broadcaster.registry();
    let session = Arc::new(Session::new(
        registry.next_id(),
        Some(peer),
        writer,
        FrameCodec::new(config.max_outbound_frame_len),
        shutdown.child_token(),
    ));

    if let Err(err) = registry.add(Arc::clone(&session)).await {
        error!(%peer, error = %err, "refusing connection");
        return;
    }
    debug!(%peer, session = %session.id(), "connection accepted");

    workers.spawn(session::run(
        session,
        reader,
        Arc::clone(broadcaster),
        config.max_frame_len,
    ));
}
