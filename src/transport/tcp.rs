//! Framed TCP link to a single peer (a device gateway or a relay)
//!
//! Outbound messages are queued to a link task that owns the socket. Every
//! inbound frame is delivered to the local subscriptions whose pattern matches
//! its topic. Reconnection is left to the caller: once the link drops, the
//! channel reports itself closed and refuses publishes.

use super::topic::Subscriptions;
use super::traits::{DeliveryCallback, SubscriptionId, TransportChannel};
use crate::error::{FleetError, Result};
use async_trait::async_trait;
use fleet_shared::codec::{self, FrameDecoder};
use fleet_shared::Message;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

const OUTBOUND_QUEUE: usize = 256;

pub struct TcpChannel {
    peer: SocketAddr,
    outbound_tx: mpsc::Sender<Message>,
    subscriptions: Arc<Subscriptions>,
    closed_tx: Arc<watch::Sender<bool>>,
}

impl TcpChannel {
    /// Connect to `address` within `connect_timeout`
    pub async fn connect(address: &str, connect_timeout: Duration) -> Result<Self> {
        let stream = match timeout(connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(FleetError::channel(address, e)),
            Err(_) => return Err(FleetError::channel(address, "connect timed out")),
        };
        Self::from_stream(stream)
    }

    /// Wrap an established stream and start the link task
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        let peer = stream
            .peer_addr()
            .map_err(|e| FleetError::channel("tcp", e))?;
        let (outbound_tx, outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        let (closed_tx, _) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);
        let subscriptions = Arc::new(Subscriptions::new());

        let subs = subscriptions.clone();
        let closed = closed_tx.clone();
        tokio::spawn(async move {
            match run_link(stream, outbound_rx, &subs).await {
                Ok(()) => info!("[TRANSPORT] Link to {} closed", peer),
                Err(reason) => warn!("[TRANSPORT] Link to {} dropped: {}", peer, reason),
            }
            closed.send_replace(true);
        });

        Ok(Self {
            peer,
            outbound_tx,
            subscriptions,
            closed_tx,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }
}

/// Pump frames in both directions until either side closes
async fn run_link(
    stream: TcpStream,
    mut outbound_rx: mpsc::Receiver<Message>,
    subscriptions: &Subscriptions,
) -> std::result::Result<(), String> {
    let (mut reader, mut writer) = stream.into_split();
    let mut decoder = FrameDecoder::new();
    let mut read_buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                let Some(message) = outbound else {
                    // every sender dropped: the channel handle is gone
                    return Ok(());
                };
                let frame = codec::encode(&message).map_err(|e| e.to_string())?;
                writer.write_all(&frame).await.map_err(|e| e.to_string())?;
            }

            read = reader.read(&mut read_buf) => {
                match read {
                    Ok(0) => return Err("peer closed connection".into()),
                    Ok(n) => {
                        decoder.extend(&read_buf[..n]);
                        loop {
                            match decoder.decode_next() {
                                Ok(Some(message)) => {
                                    let topic = message.topic.clone();
                                    if subscriptions.dispatch(message).await == 0 {
                                        debug!("[TRANSPORT] No subscriber for {}", topic);
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => return Err(format!("decode error: {}", e)),
                            }
                        }
                    }
                    Err(e) => return Err(format!("read error: {}", e)),
                }
            }
        }
    }
}

#[async_trait]
impl TransportChannel for TcpChannel {
    async fn publish(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(FleetError::channel(&message.topic, "link closed"));
        }

        let topic = message.topic.clone();
        self.outbound_tx
            .send(message)
            .await
            .map_err(|_| FleetError::channel(topic, "link closed"))
    }

    async fn subscribe(&self, pattern: &str, callback: DeliveryCallback) -> Result<SubscriptionId> {
        Ok(self.subscriptions.add(pattern, callback).await)
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.remove(id).await;
    }

    async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}
