//! In-process event bus with optional cluster mirroring

use std::future::Future;
use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{ClusterTransport, Event, EventType, HandlerError, TransportError};
use crate::config::ClusterConfig;
use crate::stats::{self, Stats};

/// Receives events of the types it was subscribed to
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Arc<Event>) -> Result<(), HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, event: Arc<Event>) -> Result<(), HandlerError> {
        (self.0)(event).await
    }
}

/// Event fan-out hub of one broker
///
/// `publish` never waits for handlers: each handler runs in its own task,
/// so a slow or failing handler affects nobody else. Events produced by this
/// broker are also queued for the cluster mirror once `start_cluster` has
/// run; the mirror queue is bounded and drops on overflow.
///
/// Events arriving from the cluster are handled one at a time by the
/// consumer of their partition, so events of one peer keep their order.
pub struct EventBus {
    broker_id: Arc<str>,
    handlers: RwLock<AHashMap<EventType, Vec<Arc<dyn EventHandler>>>>,
    mirror: RwLock<Option<mpsc::Sender<Arc<Event>>>>,
    stop: watch::Sender<bool>,
    stats: Arc<Stats>,
}

impl EventBus {
    pub fn new(broker_id: impl Into<Arc<str>>, stats: Arc<Stats>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            broker_id: broker_id.into(),
            handlers: RwLock::new(AHashMap::new()),
            mirror: RwLock::new(None),
            stop,
            stats,
        }
    }

    pub fn broker_id(&self) -> &str {
        &self.broker_id
    }

    /// Register a handler for one event type
    pub fn subscribe(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .entry(event_type)
            .or_default()
            .push(handler);
    }

    /// Register an async closure for one event type
    pub fn subscribe_fn<F, Fut>(&self, event_type: EventType, f: F)
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.subscribe(event_type, Arc::new(FnHandler(f)));
    }

    pub fn handler_count(&self, event_type: EventType) -> usize {
        self.handlers
            .read()
            .get(&event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn is_clustered(&self) -> bool {
        self.mirror.read().is_some()
    }

    /// Dispatch locally, then queue for the cluster if the event is ours
    pub fn publish(&self, event: Event) {
        let event = Arc::new(event);
        self.dispatch(&event);

        if event.broker_id.as_str() != &*self.broker_id {
            return;
        }
        let mirror = self.mirror.read().clone();
        if let Some(mirror) = mirror {
            if let Err(e) = mirror.try_send(event) {
                self.stats.incr(stats::EVENTS_MIRROR_FAILED);
                match e {
                    mpsc::error::TrySendError::Full(event) => {
                        warn!(
                            "{}: mirror queue full, dropping {} event",
                            event.client_id, event.event_type
                        );
                    }
                    mpsc::error::TrySendError::Closed(event) => {
                        warn!(
                            "{}: mirror stopped, dropping {} event",
                            event.client_id, event.event_type
                        );
                    }
                }
            }
        }
    }

    fn dispatch(&self, event: &Arc<Event>) {
        let handlers = match self.handlers.read().get(&event.event_type) {
            Some(handlers) => handlers.clone(),
            None => return,
        };
        trace!(
            "{}: dispatching {} to {} handlers",
            event.client_id,
            event.event_type,
            handlers.len()
        );

        for handler in handlers {
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(e) = handler.handle(event.clone()).await {
                    warn!("{}: {} handler: {}", event.client_id, event.event_type, e);
                }
            });
        }
    }

    /// Run every handler of an ingested event to completion, in turn
    async fn dispatch_in_order(&self, event: Arc<Event>) {
        let handlers = match self.handlers.read().get(&event.event_type) {
            Some(handlers) => handlers.clone(),
            None => return,
        };
        for handler in handlers {
            if let Err(e) = handler.handle(event.clone()).await {
                warn!("{}: {} handler: {}", event.client_id, event.event_type, e);
            }
        }
    }

    /// Connect the bus to the cluster
    ///
    /// Subscribes to both channels (failure is returned and is fatal for the
    /// caller), then starts one consumer per partition and the mirror worker.
    pub async fn start_cluster(
        self: &Arc<Self>,
        transport: Arc<dyn ClusterTransport>,
        config: &ClusterConfig,
    ) -> Result<Vec<JoinHandle<()>>, TransportError> {
        let mut receivers = transport.subscribe(&config.mqtt_channel).await?;
        receivers.extend(transport.subscribe(&config.broker_channel).await?);

        let mut tasks = Vec::with_capacity(receivers.len() + 1);
        for (partition, rx) in receivers.into_iter().enumerate() {
            let bus = self.clone();
            let stop = self.stop.subscribe();
            tasks.push(tokio::spawn(bus.consume(partition, rx, stop)));
        }

        let (tx, rx) = mpsc::channel(config.mirror_queue_size.max(1));
        let stop = self.stop.subscribe();
        tasks.push(tokio::spawn(run_mirror(
            rx,
            transport,
            config.mqtt_channel.clone(),
            config.broker_channel.clone(),
            config.mqtt_event_mask,
            self.stats.clone(),
            stop,
        )));
        *self.mirror.write() = Some(tx);

        info!(
            "Event bus of '{}' joined cluster ({} consumers)",
            self.broker_id,
            tasks.len() - 1
        );
        Ok(tasks)
    }

    async fn consume(
        self: Arc<Self>,
        partition: usize,
        mut rx: mpsc::Receiver<bytes::Bytes>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            let data = tokio::select! {
                data = rx.recv() => match data {
                    Some(data) => data,
                    None => break,
                },
                _ = stop.changed() => break,
            };

            let event = match Event::decode(&data) {
                Ok(event) => event,
                Err(e) => {
                    warn!("cluster partition {}: dropping undecodable event: {}", partition, e);
                    continue;
                }
            };
            if event.broker_id.as_str() == &*self.broker_id {
                trace!("{}: skipping echo of {}", event.client_id, event.event_type);
                continue;
            }
            self.dispatch_in_order(Arc::new(event)).await;
        }
        debug!("cluster partition {} consumer stopped", partition);
    }

    /// Stop the cluster workers
    pub fn stop(&self) {
        self.mirror.write().take();
        self.stop.send_replace(true);
    }
}

async fn run_mirror(
    mut rx: mpsc::Receiver<Arc<Event>>,
    transport: Arc<dyn ClusterTransport>,
    mqtt_channel: String,
    broker_channel: String,
    mqtt_event_mask: u32,
    stats: Arc<Stats>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = stop.changed() => break,
        };

        let channel = if event.event_type.in_mask(mqtt_event_mask) {
            &mqtt_channel
        } else {
            &broker_channel
        };
        let result = match event.encode() {
            Ok(data) => transport.publish(channel, data).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => stats.incr(stats::EVENTS_MIRRORED),
            Err(e) => {
                stats.incr(stats::EVENTS_MIRROR_FAILED);
                warn!(
                    "{}: failed to mirror {} event: {}",
                    event.client_id, event.event_type, e
                );
            }
        }
    }
    debug!("cluster mirror stopped");
}
