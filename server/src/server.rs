//! Server assembly: binds the configured listeners, then starts the accept
//! loops and the tick loop around one shared [`ServerContext`].

use crate::config::ServerConfig;
use crate::connection::{handle_connection, ConnectionSettings, Pipeline, SHUTTING_DOWN};
use crate::context::ServerContext;
use crate::database::Database;
use crate::error::{BindError, ConfigError, ServerError};
use crate::handlers::default_dispatcher;
use crate::listener::Listener;
use crate::tick::{TickLoop, TickSettings};
use crate::world::Simulation;
use log::{debug, info, warn};
use shared::{ServerIdentity, TransportKind};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Server;

impl Server {
    /// Binds every enabled listener, then starts serving.
    ///
    /// Nothing is accepted until all listeners are bound, so a bind failure
    /// is reported before any client can connect.
    pub async fn start(
        config: &ServerConfig,
        identity: ServerIdentity,
        database: Arc<dyn Database>,
        simulation: Box<dyn Simulation>,
    ) -> Result<RunningServer, ServerError> {
        config.validate()?;
        let dispatcher =
            default_dispatcher().map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let mut listeners = Vec::new();
        if config.enable_stream {
            listeners.push(Listener::bind(TransportKind::Stream, &config.stream_addr()).await?);
        }
        if config.enable_websocket {
            listeners
                .push(Listener::bind(TransportKind::WebSocket, &config.websocket_addr()).await?);
        }

        let mut addrs = Vec::with_capacity(listeners.len());
        for listener in &listeners {
            let addr = listener.local_addr().map_err(|source| BindError {
                kind: listener.kind(),
                addr: config.host.clone(),
                source,
            })?;
            addrs.push((listener.kind(), addr));
        }

        info!(
            "Server identity {} ({} clients max)",
            identity.fingerprint(),
            config.max_clients
        );
        match database.registered_players() {
            Ok(count) => info!("{} registered players", count),
            Err(e) => warn!("Cannot count registered players: {}", e),
        }

        let (context, inputs) = ServerContext::new(config.max_clients, database);
        let pipeline = Arc::new(Pipeline {
            context: Arc::clone(&context),
            identity: Arc::new(identity),
            dispatcher: Arc::new(dispatcher),
            settings: ConnectionSettings {
                handshake_timeout: config.handshake_timeout(),
                frame_timeout: config.frame_timeout(),
            },
        });

        let tick_loop = TickLoop::new(
            Arc::clone(&context),
            inputs,
            simulation,
            TickSettings {
                period: config.tick_period(),
                idle_timeout: config.idle_timeout(),
                maintenance_interval_ticks: config.maintenance_interval_ticks,
                overrun_report_threshold: config.overrun_report_threshold,
            },
        );
        let tick = tokio::spawn(tick_loop.run(context.shutdown_signal()));

        // Long enough for a connection still in its handshake to finish it
        // and write its farewell.
        let drain_timeout = config.handshake_timeout() + config.frame_timeout() * 2;

        let acceptors = listeners
            .into_iter()
            .map(|listener| {
                tokio::spawn(accept_loop(
                    listener,
                    Arc::clone(&pipeline),
                    context.shutdown_signal(),
                    drain_timeout,
                ))
            })
            .collect();

        Ok(RunningServer {
            context,
            addrs,
            tick: Some(tick),
            acceptors,
        })
    }
}

/// Accepts until shutdown, then waits up to `drain_timeout` for the
/// connections it spawned before aborting the rest.
async fn accept_loop(
    listener: Listener,
    pipeline: Arc<Pipeline>,
    mut shutdown: watch::Receiver<bool>,
    drain_timeout: Duration,
) {
    let kind = listener.kind();
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("Accepted {} connection from {}", kind, addr);
                    connections.spawn(handle_connection(Arc::clone(&pipeline), kind, stream, addr));
                }
                Err(e) => {
                    warn!("Failed to accept {} connection: {}", kind, e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = finished {
                    warn!("{} connection task failed: {}", kind, e);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    drop(listener);
    info!("{} listener stopped", kind);

    let drained = tokio::time::timeout(drain_timeout, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "Aborting {} {} connections still open after {:?}",
            connections.len(),
            kind,
            drain_timeout
        );
        connections.shutdown().await;
    }
}

/// A started server. Dropping it leaves the tasks running; call
/// [`RunningServer::shutdown`] for an orderly stop.
pub struct RunningServer {
    context: Arc<ServerContext>,
    addrs: Vec<(TransportKind, SocketAddr)>,
    tick: Option<JoinHandle<()>>,
    acceptors: Vec<JoinHandle<()>>,
}

impl RunningServer {
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Bound address of the listener for `kind`, if that transport is enabled.
    pub fn local_addr(&self, kind: TransportKind) -> Option<SocketAddr> {
        self.addrs
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, addr)| *addr)
    }

    /// Resolves if the tick loop stops on its own, which only happens when
    /// it panicked. Pending forever after [`RunningServer::shutdown`].
    pub async fn fault(&mut self) -> JoinError {
        let outcome = match self.tick.as_mut() {
            Some(tick) => tick.await,
            None => return std::future::pending().await,
        };
        self.tick = None;
        match outcome {
            Err(e) => e,
            Ok(()) => std::future::pending().await,
        }
    }

    /// Orderly shutdown: refuses new sessions, persists every active
    /// character and tells connected clients, then waits for their
    /// connections to close before stopping the tick loop. Returns how many
    /// characters were saved.
    ///
    /// The registry is empty once this returns.
    pub async fn shutdown(mut self) -> usize {
        info!("Shutting down");
        self.context.request_shutdown();

        let saved = self.context.save_all();
        info!("Saved {} characters", saved);
        self.context
            .registry
            .for_each(|session| session.handle.close(SHUTTING_DOWN));

        for acceptor in self.acceptors.drain(..) {
            if let Err(e) = acceptor.await {
                warn!("Listener task failed: {}", e);
            }
        }
        // Only connections aborted by the drain are left; they were saved
        // above.
        for session in self.context.registry.sessions() {
            self.context
                .registry
                .release(session.slot, session.connection_id);
        }
        if let Some(tick) = self.tick.take() {
            if let Err(e) = tick.await {
                warn!("Tick loop failed: {}", e);
            }
        }
        info!("Server stopped");
        saved
    }
}
