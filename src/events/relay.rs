//! Relay hub
//!
//! A minimal TCP publish/subscribe server for `TcpTransport` clients, so a
//! cluster can be formed without third-party infrastructure. Every published
//! frame is forwarded to every connection subscribed to its channel,
//! including the publisher. A subscriber that cannot keep up loses frames.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::transport::{read_frame, write_frame, Frame};

const CONNECTION_QUEUE: usize = 4096;

type ChannelMap = HashMap<String, Vec<(u64, mpsc::Sender<Frame>)>>;

pub struct RelayHub {
    listener: TcpListener,
    channels: Arc<Mutex<ChannelMap>>,
    next_id: AtomicU64,
}

impl RelayHub {
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            channels: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` completes
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Relay hub listening on {}", addr);
        }
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                        debug!("relay: connection {} from {}", id, addr);
                        tokio::spawn(serve(id, stream, addr, self.channels.clone()));
                    }
                    Err(e) => error!("relay: failed to accept connection: {}", e),
                },
                _ = &mut shutdown => break,
            }
        }
        info!("Relay hub stopped");
    }
}

async fn serve(id: u64, stream: TcpStream, addr: SocketAddr, channels: Arc<Mutex<ChannelMap>>) {
    let _ = stream.set_nodelay(true);
    let (mut read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Frame>(CONNECTION_QUEUE);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_frame(&mut write_half, &frame).await {
                debug!("relay: write to {} failed: {}", addr, e);
                break;
            }
        }
    });

    loop {
        match read_frame(&mut read_half).await {
            Ok(Some(Frame::Subscribe { channel })) => {
                debug!("relay: {} subscribed to '{}'", addr, channel);
                channels
                    .lock()
                    .entry(channel)
                    .or_default()
                    .push((id, tx.clone()));
            }
            Ok(Some(frame @ Frame::Publish { .. })) => forward(&channels, frame),
            Ok(None) => break,
            Err(e) => {
                warn!("relay: dropping connection from {}: {}", addr, e);
                break;
            }
        }
    }

    for subscribers in channels.lock().values_mut() {
        subscribers.retain(|(sub_id, _)| *sub_id != id);
    }
    drop(tx);
    let _ = writer.await;
    debug!("relay: connection {} from {} closed", id, addr);
}

fn forward(channels: &Mutex<ChannelMap>, frame: Frame) {
    let Frame::Publish { ref channel, .. } = frame else {
        return;
    };
    let mut channels = channels.lock();
    let Some(subscribers) = channels.get_mut(channel) else {
        return;
    };
    subscribers.retain(|(id, tx)| match tx.try_send(frame.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("relay: connection {} is slow, dropping frame", id);
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
}
