//! Cluster transports
//!
//! A transport is an external publish/subscribe bus with named channels.
//! Subscribing to a channel yields one receiver per partition; order is
//! preserved per producer within a partition and nowhere else.
//!
//! - `MemoryTransport` - in-process bus shared by handles, for embedding
//!   several brokers in one process and for tests
//! - `TcpTransport` - client of the relay hub (`relay::RelayHub`), frames
//!   are a 4-byte big-endian length followed by a bincode `Frame`

use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bincode::{Decode, Encode};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Largest frame accepted from the wire
pub(crate) const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Capacity of each subscriber's receive channel
const SUBSCRIBER_CAPACITY: usize = 1024;

/// Transport failure
#[derive(Debug)]
pub enum TransportError {
    Io(std::io::Error),
    Encode(String),
    Decode(String),
    FrameTooLarge(usize),
    /// The transport connection is gone
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "transport I/O error: {}", e),
            Self::Encode(msg) => write!(f, "encode error: {}", msg),
            Self::Decode(msg) => write!(f, "decode error: {}", msg),
            Self::FrameTooLarge(n) => write!(f, "frame of {} bytes exceeds limit", n),
            Self::Closed => write!(f, "transport closed"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// External publish/subscribe bus
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Subscribe to a channel, one receiver per partition
    async fn subscribe(&self, channel: &str) -> Result<Vec<mpsc::Receiver<Bytes>>, TransportError>;
}

// ============================================================================
// In-memory transport
// ============================================================================

#[derive(Default)]
struct MemoryHub {
    /// channel -> partition -> subscriber senders
    channels: Mutex<HashMap<String, Vec<Vec<mpsc::Sender<Bytes>>>>>,
}

/// Handle onto an in-process bus
///
/// Handles created with `attach` share the bus. Each handle publishes to
/// the partition picked by its producer name.
#[derive(Clone)]
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    partitions: usize,
    partition: usize,
}

impl MemoryTransport {
    pub fn new(partitions: usize) -> Self {
        Self {
            hub: Arc::new(MemoryHub::default()),
            partitions: partitions.max(1),
            partition: 0,
        }
    }

    /// Another handle on the same bus for `producer`
    pub fn attach(&self, producer: &str) -> Self {
        let mut hasher = ahash::RandomState::with_seeds(1, 2, 3, 4).build_hasher();
        producer.hash(&mut hasher);
        Self {
            hub: self.hub.clone(),
            partitions: self.partitions,
            partition: (hasher.finish() % self.partitions as u64) as usize,
        }
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }
}

#[async_trait]
impl ClusterTransport for MemoryTransport {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), TransportError> {
        let mut channels = self.hub.channels.lock();
        let Some(partitions) = channels.get_mut(channel) else {
            return Ok(());
        };
        let subscribers = &mut partitions[self.partition];
        subscribers.retain(|tx| match tx.try_send(payload.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("memory transport: subscriber of '{}' is full, dropping", channel);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Vec<mpsc::Receiver<Bytes>>, TransportError> {
        let mut channels = self.hub.channels.lock();
        let partitions = channels
            .entry(channel.to_string())
            .or_insert_with(|| vec![Vec::new(); self.partitions]);

        Ok(partitions
            .iter_mut()
            .map(|subscribers| {
                let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
                subscribers.push(tx);
                rx
            })
            .collect())
    }
}

// ============================================================================
// Relay framing
// ============================================================================

/// Unit exchanged with the relay hub
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum Frame {
    /// Start receiving a channel
    Subscribe { channel: String },
    /// Message on a channel, in both directions
    Publish { channel: String, payload: Vec<u8> },
}

/// Write one length-prefixed frame
pub(crate) async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let body = bincode::encode_to_vec(frame, bincode::config::standard())
        .map_err(|e| TransportError::Encode(e.to_string()))?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(body.len()));
    }
    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    writer.write_all(&buf).await?;
    Ok(())
}

/// Read one length-prefixed frame; `None` on a clean end of stream
pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let (frame, _) = bincode::decode_from_slice(&body, bincode::config::standard())
        .map_err(|e| TransportError::Decode(e.to_string()))?;
    Ok(Some(frame))
}

// ============================================================================
// TCP transport
// ============================================================================

type Subscribers = Arc<Mutex<HashMap<String, Vec<mpsc::Sender<Bytes>>>>>;

/// Client connection to a relay hub
pub struct TcpTransport {
    peer: SocketAddr,
    outbound: mpsc::Sender<Frame>,
    subscribers: Subscribers,
}

impl TcpTransport {
    /// Connect to the hub; failure here is fatal for cluster mode
    pub async fn connect(addr: &str) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (mut read_half, mut write_half) = stream.into_split();

        let (outbound, mut outbound_rx) = mpsc::channel::<Frame>(SUBSCRIBER_CAPACITY);
        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = write_frame(&mut write_half, &frame).await {
                    warn!("relay {}: write failed: {}", peer, e);
                    break;
                }
            }
            debug!("relay {}: writer stopped", peer);
        });

        let inbound = subscribers.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(Frame::Publish { channel, payload })) => {
                        let payload = Bytes::from(payload);
                        let targets = inbound.lock().get(&channel).cloned().unwrap_or_default();
                        for tx in targets {
                            // Awaiting keeps per-producer order; the hub already
                            // drops for slow consumers
                            let _ = tx.send(payload.clone()).await;
                        }
                    }
                    Ok(Some(Frame::Subscribe { .. })) => {
                        trace!("relay {}: ignoring subscribe frame from hub", peer);
                    }
                    Ok(None) => {
                        debug!("relay {}: connection closed", peer);
                        break;
                    }
                    Err(e) => {
                        warn!("relay {}: read failed: {}", peer, e);
                        break;
                    }
                }
            }
            // Dropping the senders ends every consumer
            inbound.lock().clear();
        });

        Ok(Self {
            peer,
            outbound,
            subscribers,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl ClusterTransport for TcpTransport {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), TransportError> {
        self.outbound
            .send(Frame::Publish {
                channel: channel.to_string(),
                payload: payload.to_vec(),
            })
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn subscribe(&self, channel: &str) -> Result<Vec<mpsc::Receiver<Bytes>>, TransportError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.subscribers
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        self.outbound
            .send(Frame::Subscribe {
                channel: channel.to_string(),
            })
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok(vec![rx])
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_memory_transport_fanout() {
        let bus = MemoryTransport::new(4);
        let a = bus.attach("node-a");
        let b = bus.attach("node-b");

        let mut receivers = b.subscribe("events").await.unwrap();
        assert_eq!(receivers.len(), 4);

        a.publish("events", Bytes::from_static(b"one")).await.unwrap();
        a.publish("events", Bytes::from_static(b"two")).await.unwrap();
        // Other channels are not delivered
        a.publish("other", Bytes::from_static(b"x")).await.unwrap();

        let rx = &mut receivers[a.partition];
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"two"));
        for (i, rx) in receivers.iter_mut().enumerate() {
            if i != a.partition {
                assert!(rx.try_recv().is_err());
            }
        }
    }

    #[tokio::test]
    async fn test_memory_transport_drops_closed_subscribers() {
        let bus = MemoryTransport::new(1);
        let receivers = bus.subscribe("events").await.unwrap();
        drop(receivers);
        bus.publish("events", Bytes::from_static(b"x")).await.unwrap();
        assert!(bus.hub.channels.lock()["events"][0].is_empty());
    }

    #[tokio::test]
    async fn test_frame_io() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let frame = Frame::Publish {
            channel: "relaymq.mqtt".to_string(),
            payload: vec![1, 2, 3],
        };
        write_frame(&mut client, &frame).await.unwrap();
        write_frame(
            &mut client,
            &Frame::Subscribe {
                channel: "c".to_string(),
            },
        )
        .await
        .unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server).await.unwrap(), Some(frame));
        assert!(matches!(
            read_frame(&mut server).await.unwrap(),
            Some(Frame::Subscribe { .. })
        ));
        assert_eq!(read_frame(&mut server).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized_length() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes())
            .await
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), read_frame(&mut server))
            .await
            .unwrap();
        assert!(matches!(result, Err(TransportError::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn test_tcp_connect_failure() {
        // Bind and drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(TcpTransport::connect(&addr.to_string()).await.is_err());
    }
}
