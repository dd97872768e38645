//! MQTT Broker Core
//!
//! Wires the collaborators together once at startup and runs the TCP
//! accept loop. Every accepted socket gets its own `Connection` task; the
//! broker keeps them in a `JoinSet` so shutdown can wait for them with a
//! bound and abort whatever is left.

mod connection;

pub use connection::{Connection, ConnectionError};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::auth::{AllowAll, Authenticator, StaticAuthenticator};
use crate::config::{Config, DeployMode};
use crate::events::{ClusterTransport, EventBus, TcpTransport, TransportError};
use crate::session::{CloseReason, SessionError, SessionManager};
use crate::stats::{self, Stats};
use crate::storage::{open_store, MemoryStore, SessionStore, StorageError};

/// How often shutdown re-signals sessions that connected while draining
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Broker startup errors
#[derive(Debug)]
pub enum BrokerError {
    Io(std::io::Error),
    Storage(StorageError),
    Session(SessionError),
    Transport(TransportError),
    Config(String),
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::Io(e) => write!(f, "IO error: {}", e),
            BrokerError::Storage(e) => write!(f, "Storage error: {}", e),
            BrokerError::Session(e) => write!(f, "Session error: {}", e),
            BrokerError::Transport(e) => write!(f, "Cluster transport error: {}", e),
            BrokerError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for BrokerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BrokerError::Io(e) => Some(e),
            BrokerError::Storage(e) => Some(e),
            BrokerError::Session(e) => Some(e),
            BrokerError::Transport(e) => Some(e),
            BrokerError::Config(_) => None,
        }
    }
}

impl From<std::io::Error> for BrokerError {
    fn from(e: std::io::Error) -> Self {
        BrokerError::Io(e)
    }
}

impl From<StorageError> for BrokerError {
    fn from(e: StorageError) -> Self {
        BrokerError::Storage(e)
    }
}

impl From<SessionError> for BrokerError {
    fn from(e: SessionError) -> Self {
        BrokerError::Session(e)
    }
}

impl From<TransportError> for BrokerError {
    fn from(e: TransportError) -> Self {
        BrokerError::Transport(e)
    }
}

/// External services the broker is built on
pub struct Collaborators {
    pub store: Arc<dyn SessionStore>,
    pub auth: Arc<dyn Authenticator>,
    /// Required in cluster mode, ignored otherwise
    pub transport: Option<Arc<dyn ClusterTransport>>,
}

impl Collaborators {
    /// In-memory store, no authentication, no cluster
    pub fn local() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            auth: Arc::new(AllowAll),
            transport: None,
        }
    }

    /// Open the collaborators selected by configuration
    ///
    /// Any failure here is fatal for startup.
    pub async fn from_config(config: &Config) -> Result<Self, BrokerError> {
        let store = open_store(&config.storage)?;

        let auth: Arc<dyn Authenticator> = if config.auth.enabled || config.acl.enabled {
            Arc::new(StaticAuthenticator::new(&config.auth, &config.acl))
        } else {
            Arc::new(AllowAll)
        };

        let transport: Option<Arc<dyn ClusterTransport>> = match config.cluster.mode {
            DeployMode::Local => None,
            DeployMode::Cluster => {
                let transport = TcpTransport::connect(&config.cluster.transport_addr).await?;
                info!("Connected to relay hub at {}", transport.peer_addr());
                Some(Arc::new(transport))
            }
        };

        Ok(Self {
            store,
            auth,
            transport,
        })
    }
}

/// The MQTT Broker
pub struct Broker {
    config: Arc<Config>,
    manager: Arc<SessionManager>,
    bus: Arc<EventBus>,
    stats: Arc<Stats>,
    store: Arc<dyn SessionStore>,
    transport: Option<Arc<dyn ClusterTransport>>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: watch::Sender<bool>,
    cluster_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Broker {
    pub fn new(config: Config, collaborators: Collaborators) -> Result<Self, BrokerError> {
        let transport = match config.cluster.mode {
            DeployMode::Local => None,
            DeployMode::Cluster => Some(collaborators.transport.ok_or_else(|| {
                BrokerError::Config("cluster mode requires a cluster transport".to_string())
            })?),
        };

        let broker_id = broker_id(&config);
        let config = Arc::new(config);
        let stats = Arc::new(Stats::new());
        let bus = Arc::new(EventBus::new(broker_id.as_str(), stats.clone()));
        let manager = Arc::new(SessionManager::new(
            config.clone(),
            collaborators.store.clone(),
            collaborators.auth,
            bus.clone(),
            stats.clone(),
        ));
        manager.install_handlers();

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            manager,
            bus,
            stats,
            store: collaborators.store,
            transport,
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            shutdown,
            cluster_tasks: Mutex::new(Vec::new()),
        })
    }

    /// Build a broker together with the collaborators its configuration names
    pub async fn from_config(config: Config) -> Result<Self, BrokerError> {
        let collaborators = Collaborators::from_config(&config).await?;
        Self::new(config, collaborators)
    }

    /// Restore stored state, join the cluster and bind the listener
    ///
    /// Called by `run` when needed. Calling it first lets the caller learn
    /// the bound address before the accept loop starts.
    pub async fn bind(&self) -> Result<SocketAddr, BrokerError> {
        let bound = *self.local_addr.lock();
        if let Some(addr) = bound {
            return Ok(addr);
        }

        self.manager.restore().await?;

        if let Some(transport) = &self.transport {
            let tasks = self
                .bus
                .start_cluster(transport.clone(), &self.config.cluster)
                .await?;
            self.cluster_tasks.lock().extend(tasks);
        }

        let listener = TcpListener::bind(self.config.server.bind).await?;
        let addr = listener.local_addr()?;
        info!(
            "Broker '{}' listening on {} ({:?} mode)",
            self.manager.broker_id(),
            addr,
            self.config.cluster.mode
        );
        *self.listener.lock() = Some(listener);
        *self.local_addr.lock() = Some(addr);
        Ok(addr)
    }

    /// Accept connections until `shutdown` is called, then drain
    pub async fn run(&self) -> Result<(), BrokerError> {
        self.bind().await?;
        let listener = self.listener.lock().take().ok_or_else(|| {
            BrokerError::Config("broker is already running".to_string())
        })?;

        let mut shutdown = self.shutdown.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.wait_for(|stop| *stop) => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("New TCP connection from {}", addr);
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                        }
                        self.stats.incr(stats::CONNECTIONS_ACCEPTED);
                        let connection = Connection::new(
                            stream,
                            addr,
                            self.manager.clone(),
                            self.shutdown.subscribe(),
                        );
                        connections.spawn(async move {
                            if let Err(e) = connection.run().await {
                                debug!("Connection error from {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept TCP connection: {}", e),
                },

                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("Connection task panicked: {}", e);
                        }
                    }
                }
            }
        }

        drop(listener);
        self.drain(connections).await;
        Ok(())
    }

    async fn drain(&self, mut connections: JoinSet<()>) {
        info!("Shutting down, {} connections open", connections.len());
        let deadline = tokio::time::Instant::now() + self.config.server.shutdown_timeout;

        while !connections.is_empty() {
            self.manager.kick_all(CloseReason::Shutdown);
            match tokio::time::timeout_at(
                deadline.min(tokio::time::Instant::now() + DRAIN_POLL_INTERVAL),
                connections.join_next(),
            )
            .await
            {
                Ok(_) => {}
                Err(_) if tokio::time::Instant::now() >= deadline => {
                    warn!(
                        "Shutdown timeout reached, aborting {} connections",
                        connections.len()
                    );
                    connections.abort_all();
                    while connections.join_next().await.is_some() {}
                }
                Err(_) => {}
            }
        }

        self.bus.stop();
        for task in self.cluster_tasks.lock().drain(..) {
            task.abort();
        }

        if let Err(e) = self.store.flush().await {
            error!("Failed to flush session store: {}", e);
        }
        if let Err(e) = self.store.close().await {
            error!("Failed to close session store: {}", e);
        }
        info!("Broker '{}' stopped", self.manager.broker_id());
    }

    /// Stop accepting and close every session
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Bound listener address, once `bind` has run
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn broker_id(&self) -> &str {
        self.manager.broker_id()
    }
}

/// Configured broker id, or `hostname:port`
fn broker_id(config: &Config) -> String {
    if let Some(id) = config.cluster.broker_id.as_deref().filter(|id| !id.is_empty()) {
        return id.to_string();
    }
    let host = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}:{}", host, config.server.bind.port())
}
