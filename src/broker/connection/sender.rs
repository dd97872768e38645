//! Send worker
//!
//! Owns the write half of the socket, the encoder and the session's
//! in-flight table. It writes control packets handed over by the reader,
//! drains the session queue when woken, and retransmits unacknowledged
//! QoS 1 deliveries on each tick. Messages handed over through the outbound
//! channel wait in a backlog that is drained ahead of the queue.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use super::{Connection, ConnectionError};
use crate::codec::Encoder;
use crate::message::{DeliveryState, Direction, Message};
use crate::protocol::{Packet, ProtocolError, QoS};
use crate::session::{InflightTable, Outbound, Session, SessionChannels};
use crate::stats::{self, Stats};
use crate::storage::{SessionStore, StoredMessage};
use crate::topic::strip_mount_point;

/// Buffered bytes that force a write in the middle of a batch
const FLUSH_THRESHOLD: usize = 64 * 1024;

/// Queue reads per wake-up before giving the other branches a turn
const DRAIN_BATCH: usize = 256;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Hand the write half to a new send worker
    pub(crate) fn spawn_sender(
        &mut self,
        session: &Arc<Session>,
        channels: SessionChannels,
    ) -> Result<JoinHandle<()>, ConnectionError> {
        let writer = self.writer.take().ok_or_else(|| {
            ConnectionError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "writer already taken",
            ))
        })?;
        let config = self.manager.config();
        let store = (!session.clean_session()).then(|| self.manager.store().clone());

        let worker = SendWorker {
            session: session.clone(),
            writer,
            encoder: Encoder::new(session.info().protocol_version),
            write_buf: BytesMut::with_capacity(4096),
            outbound: channels.outbound,
            stop: channels.stop,
            inflight: InflightTable::new(),
            backlog: VecDeque::new(),
            store,
            mount_point: config.mqtt.mount_point.clone(),
            retry_interval: config.session.retry_interval,
            tick_interval: config.session.tick_interval,
            stats: self.manager.stats().clone(),
        };
        Ok(tokio::spawn(worker.run()))
    }
}

pub(crate) struct SendWorker<W> {
    session: Arc<Session>,
    writer: W,
    encoder: Encoder,
    write_buf: BytesMut,
    outbound: mpsc::Receiver<Outbound>,
    stop: watch::Receiver<bool>,
    inflight: InflightTable,
    backlog: VecDeque<Message>,
    /// Set for persistent sessions, whose in-flight messages are stored
    store: Option<Arc<dyn SessionStore>>,
    mount_point: String,
    retry_interval: Duration,
    tick_interval: Duration,
    stats: Arc<Stats>,
}

impl<W> SendWorker<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub(crate) async fn run(mut self) {
        if let Err(e) = self.run_inner().await {
            debug!("{}: send worker stopped: {}", self.session.client_id(), e);
        }
        let _ = self.writer.shutdown().await;
    }

    async fn run_inner(&mut self) -> Result<(), ConnectionError> {
        // CONNACK was queued before the worker started and goes out first
        self.collect_pending()?;
        self.resend_stored().await?;
        self.flush().await?;
        self.drain_queue().await?;
        self.flush().await?;

        let mut tick = tokio::time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = self.stop.changed() => {
                    self.collect_pending()?;
                    self.flush().await?;
                    return Ok(());
                }

                item = self.outbound.recv() => match item {
                    Some(item) => self.handle(item).await?,
                    None => return Ok(()),
                },

                _ = self.session.wake().notified() => self.drain_queue().await?,

                _ = tick.tick() => self.retry_due()?,
            }
            self.flush().await?;
        }
    }

    /// Encode every item already waiting in the outbound channel
    fn collect_pending(&mut self) -> Result<(), ConnectionError> {
        while let Ok(item) = self.outbound.try_recv() {
            match item {
                Outbound::Packet(packet) => self.encode(&packet)?,
                Outbound::Acked(packet_id) => {
                    self.inflight.remove(packet_id);
                }
                Outbound::Deliver(message) => self.backlog.push_back(message),
            }
        }
        Ok(())
    }

    async fn handle(&mut self, item: Outbound) -> Result<(), ConnectionError> {
        match item {
            Outbound::Packet(packet) => self.encode(&packet),
            Outbound::Acked(packet_id) => self.acknowledge(packet_id).await,
            Outbound::Deliver(message) => {
                self.backlog.push_back(message);
                self.drain_queue().await
            }
        }
    }

    async fn acknowledge(&mut self, packet_id: u16) -> Result<(), ConnectionError> {
        let was_full = self.inflight.is_full();
        if self.inflight.remove(packet_id).is_none() {
            debug!(
                "{}: PUBACK for unknown packet {}",
                self.session.client_id(),
                packet_id
            );
            return Ok(());
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.delete_message(self.session.client_id(), packet_id).await {
                warn!("{}: failed to delete acknowledged message: {}", self.session.client_id(), e);
            }
        }
        if was_full {
            self.drain_queue().await?;
        }
        Ok(())
    }

    /// Re-send in-flight messages stored by a previous connection
    async fn resend_stored(&mut self) -> Result<(), ConnectionError> {
        let Some(store) = self.store.clone() else {
            return Ok(());
        };
        let mut stored = match store.find_messages(self.session.client_id()).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!("{}: failed to load in-flight messages: {}", self.session.client_id(), e);
                return Ok(());
            }
        };
        stored.sort_by_key(|m| m.arrived_at);

        for message in stored {
            let mut message = message.into_message();
            if message.packet_id.is_none() {
                continue;
            }
            message.dup = true;
            self.inflight.insert(message.clone());
            self.write_message(&message)?;
        }
        if !self.inflight.is_empty() {
            debug!(
                "{}: re-sent {} in-flight messages",
                self.session.client_id(),
                self.inflight.len()
            );
        }
        Ok(())
    }

    async fn drain_queue(&mut self) -> Result<(), ConnectionError> {
        let mut sent = 0;
        while sent < DRAIN_BATCH && !self.inflight.is_full() {
            let next = match self.backlog.pop_front() {
                Some(message) => Ok(Some(message)),
                None => self.session.queue().read().await,
            };
            let message = match next {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!("{}: queue read failed: {}", self.session.client_id(), e);
                    return Ok(());
                }
            };
            self.deliver(message).await?;
            sent += 1;
            if self.write_buf.len() >= FLUSH_THRESHOLD {
                self.flush().await?;
            }
        }
        if sent == DRAIN_BATCH {
            // More may be waiting
            self.session.wake().notify_one();
        }
        Ok(())
    }

    async fn deliver(&mut self, mut message: Message) -> Result<(), ConnectionError> {
        message.direction = Direction::Out;
        if message.qos == QoS::AtLeastOnce {
            let Some(packet_id) = self.inflight.next_packet_id() else {
                return Ok(());
            };
            message.packet_id = Some(packet_id);
            message.dup = false;
            message.state = DeliveryState::AwaitAck;
            self.inflight.insert(message.clone());

            if let Some(store) = &self.store {
                let stored = StoredMessage::from(&message);
                if let Err(e) = store.insert_message(self.session.client_id(), &stored).await {
                    warn!("{}: failed to store in-flight message: {}", self.session.client_id(), e);
                }
            }
        }

        self.write_message(&message)?;
        self.stats.incr(stats::MESSAGES_SENT);
        Ok(())
    }

    fn retry_due(&mut self) -> Result<(), ConnectionError> {
        for message in self.inflight.due(Instant::now().into_std(), self.retry_interval) {
            trace!(
                "{}: retrying packet {:?} on '{}'",
                self.session.client_id(),
                message.packet_id,
                message.topic
            );
            self.write_message(&message)?;
        }
        Ok(())
    }

    fn write_message(&mut self, message: &Message) -> Result<(), ConnectionError> {
        let stripped = strip_mount_point(&self.mount_point, &message.topic);
        let topic: Arc<str> = if stripped.len() == message.topic.len() {
            message.topic.clone()
        } else {
            Arc::from(stripped)
        };
        self.encode(&Packet::Publish(message.to_publish(topic)))
    }

    fn encode(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        self.encoder
            .encode(packet, &mut self.write_buf)
            .map_err(|e| ConnectionError::Protocol(ProtocolError::from(e)))
    }

    async fn flush(&mut self) -> Result<(), ConnectionError> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        self.writer.write_all(&self.write_buf).await?;
        self.writer.flush().await?;
        self.write_buf.clear();
        Ok(())
    }
}
