//! Socket streaming server.
//!
//! Binds a port, accepts consumers and pushes framed records to them.

use super::config::{ConsumerMode, SocketConfig};
use super::connection::{Connection, EndReason, StreamSummary};
use super::session::StreamSession;
use super::stats::{ServerStats, StatsSnapshot};
use linefeed_core::{Error, RecordSource, Result, SourceFactory};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Pause after a failed accept so a persistent failure (e.g. out of file
/// descriptors) does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Closes a [`StreamServer`] from anywhere.
///
/// Closing unblocks a pending `accept_one` with `Error::Cancelled` and
/// cancels every running session.
#[derive(Debug, Clone)]
pub struct ListenHandle {
    token: CancellationToken,
    local_addr: SocketAddr,
}

impl ListenHandle {
    pub fn close(&self) {
        if !self.token.is_cancelled() {
            info!(address = %self.local_addr, "Closing listener");
        }
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Resolves once the handle has been closed.
    pub async fn closed(&self) {
        self.token.cancelled().await
    }
}

/// What `serve` did before it returned.
#[derive(Debug, Clone)]
pub struct ServeReport {
    pub stats: StatsSnapshot,
    /// Summary of the most recently finished session.
    pub last_session: Option<StreamSummary>,
}

/// A server pushing records to TCP consumers.
///
/// # Example
///
/// ```ignore
/// use linefeed_connectors::socket::{SocketConfig, StreamServer};
/// use linefeed_core::source::GeneratorSource;
///
/// let server = StreamServer::listen(SocketConfig::server(9009)).await?;
/// let mut conn = server.accept_one().await?;
/// let mut source = GeneratorSource::new("message", Some(10));
/// let summary = server.stream_all(&mut conn, &mut source).await;
/// ```
#[derive(Debug)]
pub struct StreamServer {
    config: SocketConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    stats: Arc<ServerStats>,
    next_id: AtomicU64,
}

impl StreamServer {
    /// Bind the configured address and start listening.
    ///
    /// # Errors
    /// - `Error::Config` if the configuration is invalid
    /// - `Error::Bind` if the address cannot be resolved or is unavailable
    pub async fn listen(config: SocketConfig) -> Result<Self> {
        config.validate()?;

        let addr = config.address();
        let listener = TcpListener::bind(&addr).await.map_err(|source| Error::Bind {
            addr: addr.clone(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| Error::Bind {
            addr: addr.clone(),
            source,
        })?;

        info!(
            address = %local_addr,
            mode = ?config.mode,
            framing = %config.framing,
            "Stream server listening"
        );

        Ok(Self {
            config,
            listener,
            local_addr,
            shutdown: CancellationToken::new(),
            stats: Arc::new(ServerStats::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    pub fn listen_handle(&self) -> ListenHandle {
        ListenHandle {
            token: self.shutdown.clone(),
            local_addr: self.local_addr,
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Wait for the next consumer.
    ///
    /// # Errors
    /// - `Error::Cancelled` once the listen handle is closed
    /// - `Error::Accept` for a failed accept; the server stays usable
    pub async fn accept_one(&self) -> Result<Connection> {
        let accepted = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(Error::Cancelled),
            accepted = self.listener.accept() => accepted,
        };

        let (stream, peer) = accepted.map_err(Error::Accept)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.stats.on_accepted();
        info!(peer = %peer, connection = id, "Consumer connected");
        Ok(Connection::new(id, stream, peer))
    }

    /// Stream every record of `source` to `connection`.
    pub async fn stream_all(
        &self,
        connection: &mut Connection,
        source: &mut dyn RecordSource,
    ) -> StreamSummary {
        let session = StreamSession::new(connection, &self.config, self.shutdown.child_token());
        let summary = session.run(source).await;
        self.stats.on_session(&summary);
        summary
    }

    /// Run the accept loop, opening a fresh cursor from `factory` per consumer.
    ///
    /// In single mode this returns after the first session, whatever its
    /// outcome. In multi mode it runs until the listen handle is closed and
    /// then waits for running sessions to wind down.
    pub async fn serve(self, factory: Arc<dyn SourceFactory>) -> Result<ServeReport> {
        match self.config.mode {
            ConsumerMode::Single => self.serve_single(factory).await,
            ConsumerMode::Multi => Arc::new(self).serve_multi(factory).await,
        }
    }

    async fn accept_retrying(&self) -> Result<Connection> {
        loop {
            match self.accept_one().await {
                Err(e) if e.is_recoverable() => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
                other => return other,
            }
        }
    }

    async fn open_and_stream(
        &self,
        connection: &mut Connection,
        factory: &dyn SourceFactory,
    ) -> StreamSummary {
        match factory.open().await {
            Ok(mut source) => self.stream_all(connection, source.as_mut()).await,
            Err(e) => {
                error!(peer = %connection.peer(), error = %e, "Failed to open record source");
                connection.close();
                let summary = StreamSummary::empty(EndReason::SourceFailed {
                    error: e.to_string(),
                });
                self.stats.on_session(&summary);
                summary
            }
        }
    }

    async fn serve_single(self, factory: Arc<dyn SourceFactory>) -> Result<ServeReport> {
        info!("Waiting for a consumer");
        let mut connection = self.accept_retrying().await?;
        let summary = self.open_and_stream(&mut connection, factory.as_ref()).await;

        Ok(ServeReport {
            stats: self.stats(),
            last_session: Some(summary),
        })
    }

    async fn serve_multi(self: Arc<Self>, factory: Arc<dyn SourceFactory>) -> Result<ServeReport> {
        let permits = Arc::new(Semaphore::new(self.config.max_connections));
        let mut sessions = JoinSet::new();
        let mut last_session = None;

        info!(max_connections = self.config.max_connections, "Accepting consumers");

        loop {
            tokio::select! {
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    match finished {
                        Ok(summary) => last_session = Some(summary),
                        Err(e) => error!(error = %e, "Session task failed"),
                    }
                }
                accepted = self.accept_retrying() => {
                    let mut connection = match accepted {
                        Ok(connection) => connection,
                        Err(Error::Cancelled) => break,
                        Err(e) => return Err(e),
                    };

                    let Ok(permit) = permits.clone().try_acquire_owned() else {
                        warn!(
                            peer = %connection.peer(),
                            max_connections = self.config.max_connections,
                            "At capacity, rejecting consumer"
                        );
                        self.stats.on_rejected();
                        connection.close();
                        continue;
                    };

                    let server = self.clone();
                    let factory = factory.clone();
                    sessions.spawn(async move {
                        let _permit = permit;
                        server.open_and_stream(&mut connection, factory.as_ref()).await
                    });
                }
            }
        }

        // Sessions observe the same token and stop promptly.
        while let Some(finished) = sessions.join_next().await {
            match finished {
                Ok(summary) => last_session = Some(summary),
                Err(e) => error!(error = %e, "Session task failed"),
            }
        }

        let stats = self.stats();
        info!(
            sessions = stats.sessions_completed,
            rejected = stats.connections_rejected,
            records_sent = stats.records_sent,
            "Stream server stopped"
        );
        Ok(ServeReport {
            stats,
            last_session,
        })
    }
}
