//! MQTT Connection Handler
//!
//! One `Connection` per accepted socket. The reader side waits for CONNECT,
//! then decodes and dispatches packets until the client leaves, the keep
//! alive expires or the session is kicked. Everything written back to the
//! client goes through the session's outbound channel to a send worker that
//! owns the write half, so a stalled client never blocks packet parsing
//! beyond the channel's capacity.

mod connect;
mod disconnect;
mod publish;
mod sender;
mod subscribe;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::codec::{Decoder, Encoder};
use crate::protocol::{ConnectReturnCode, DecodeError, Packet, ProtocolError, ProtocolVersion};
use crate::session::{Session, SessionError, SessionManager};

const READ_BUFFER_SIZE: usize = 4096;

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Protocol(ProtocolError),
    Decode(DecodeError),
    /// CONNECT refused with the given return code
    Refused(ConnectReturnCode),
    Timeout,
    /// Closed by takeover or broker shutdown
    Shutdown,
    Session(SessionError),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::Decode(e) => write!(f, "Decode error: {}", e),
            ConnectionError::Refused(code) => write!(f, "Connection refused: {}", code),
            ConnectionError::Timeout => write!(f, "Connection timeout"),
            ConnectionError::Shutdown => write!(f, "Shutdown"),
            ConnectionError::Session(e) => write!(f, "Session error: {}", e),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

impl From<SessionError> for ConnectionError {
    fn from(e: SessionError) -> Self {
        ConnectionError::Session(e)
    }
}

/// What the read loop does after a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    /// The client sent DISCONNECT
    Disconnect,
}

/// Connection handler, generic over the stream type
pub struct Connection<S> {
    pub(crate) reader: ReadHalf<S>,
    /// Moved into the send worker once the session is accepted
    pub(crate) writer: Option<WriteHalf<S>>,
    pub(crate) addr: SocketAddr,
    pub(crate) decoder: Decoder,
    pub(crate) encoder: Encoder,
    pub(crate) read_buf: BytesMut,
    pub(crate) manager: Arc<SessionManager>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(
        stream: S,
        addr: SocketAddr,
        manager: Arc<SessionManager>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let max_packet_size = manager.config().mqtt.max_packet_size;
        Self {
            reader,
            writer: Some(writer),
            addr,
            decoder: Decoder::new().with_max_packet_size(max_packet_size),
            encoder: Encoder::new(ProtocolVersion::V311),
            read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            manager,
            shutdown,
        }
    }

    /// Run the connection to completion
    ///
    /// Returns `Ok` when the client disconnected with a DISCONNECT packet.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        let connect_timeout = self.manager.config().server.connect_timeout;
        let mut shutdown = self.shutdown.clone();

        let connect = tokio::select! {
            result = timeout(connect_timeout, self.read_connect()) => match result {
                Ok(connect) => connect?,
                Err(_) => {
                    debug!("Connect timeout from {}", self.addr);
                    return Err(ConnectionError::Timeout);
                }
            },
            _ = shutdown.wait_for(|stop| *stop) => return Err(ConnectionError::Shutdown),
        };

        let connected = self.handle_connect(connect).await?;
        let session = connected.session;
        let sender = match self.spawn_sender(&session, connected.channels) {
            Ok(sender) => sender,
            Err(e) => {
                self.manager.disconnect(&session, false).await;
                return Err(e);
            }
        };

        let result = self.run_connected(&session).await;
        match &result {
            Ok(()) | Err(ConnectionError::Shutdown) => {}
            Err(ConnectionError::Io(e)) => debug!("{}: {}", session.client_id(), e),
            Err(e) => warn!("{}: closing connection: {}", session.client_id(), e),
        }

        self.close(&session, sender, result.is_ok()).await;
        result
    }

    /// Read and dispatch packets of an accepted session
    async fn run_connected(&mut self, session: &Arc<Session>) -> Result<(), ConnectionError> {
        let keep_alive = keep_alive_timeout(session.info().keep_alive);
        if let Some(limit) = keep_alive {
            debug!(
                "Keep alive for {}: {}s -> timeout {:?}",
                session.client_id(),
                session.info().keep_alive,
                limit
            );
        }
        let mut deadline = keep_alive.map(|limit| Instant::now() + limit);
        let mut kicked = session.kicked();

        loop {
            while let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
                self.read_buf.advance(consumed);
                if let Some(limit) = keep_alive {
                    deadline = Some(Instant::now() + limit);
                }
                if self.handle_packet(session, packet).await? == Flow::Disconnect {
                    return Ok(());
                }
            }

            if session.close_reason().is_some() {
                return Err(ConnectionError::Shutdown);
            }

            tokio::select! {
                biased;

                _ = kicked.changed() => return Err(ConnectionError::Shutdown),

                _ = keep_alive_expired(deadline) => {
                    info!("Keep alive timeout for {} - disconnecting", session.client_id());
                    return Err(ProtocolError::KeepAliveTimeout.into());
                }

                result = self.reader.read_buf(&mut self.read_buf) => {
                    if result? == 0 {
                        debug!("Connection closed from {}", self.addr);
                        return Err(ConnectionError::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "connection closed",
                        )));
                    }
                }
            }
        }
    }

    /// Handle an incoming packet
    async fn handle_packet(
        &mut self,
        session: &Arc<Session>,
        packet: Packet,
    ) -> Result<Flow, ConnectionError> {
        match packet {
            Packet::Connect(_) => Err(ProtocolError::ProtocolViolation("duplicate CONNECT").into()),
            Packet::Publish(publish) => self.handle_publish(session, publish).await,
            Packet::PubAck(puback) => self.handle_puback(session, puback).await,
            Packet::PubRec(pubrec) => self.handle_pubrec(session, pubrec),
            Packet::PubRel(pubrel) => self.handle_pubrel(session, pubrel).await,
            Packet::PubComp(pubcomp) => self.handle_pubcomp(session, pubcomp),
            Packet::Subscribe(subscribe) => self.handle_subscribe(session, subscribe).await,
            Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(session, unsubscribe).await,
            Packet::PingReq => {
                session.send(Packet::PingResp).await?;
                Ok(Flow::Continue)
            }
            Packet::Disconnect => self.handle_disconnect(session),
            Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
                debug!(
                    "Unexpected packet type from {}: {}",
                    session.client_id(),
                    packet.packet_type()
                );
                Err(ProtocolError::ProtocolViolation("server-to-client packet from client").into())
            }
        }
    }
}

/// Keep alive grace period: 1.5 times the negotiated interval, `None` when disabled
pub(crate) fn keep_alive_timeout(keep_alive: u16) -> Option<Duration> {
    (keep_alive > 0).then(|| Duration::from_millis(keep_alive as u64 * 1500))
}

async fn keep_alive_expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Generate a random ID
pub(crate) fn rand_id() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u128(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos(),
    );
    hasher.finish()
}

#[cfg(test)]
mod tests;
