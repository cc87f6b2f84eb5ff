//! Single-socket UDP transport (4.2): one non-blocking receive loop, and a
//! send path funneled through a bounded channel so only one task ever owns
//! the socket's write half at a time.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::error::{Error, Result, SendErrorKind};

const MAX_DATAGRAM_SIZE: usize = 65535;
const SEND_QUEUE_DEPTH: usize = 1024;

/// A received datagram, handed to the engine's dispatch loop.
#[derive(Debug)]
pub struct Inbound {
    pub data: Vec<u8>,
    pub peer: SocketAddr,
}

/// A queued outbound datagram, with a reply channel so the caller can learn
/// whether the send reached the OS socket layer cleanly (4.2: the routing
/// engine needs to know `HostUnreachable` from `Other` to pick the right
/// synthesized failure response).
struct Outbound {
    data: Vec<u8>,
    peer: SocketAddr,
    reply: oneshot::Sender<std::result::Result<(), SendErrorKind>>,
}

/// Cloneable handle used by every component that needs to send a datagram
/// (the routing engine, the registrar's 200 OK, the auth challenge path).
#[derive(Clone)]
pub struct UdpSender {
    tx: mpsc::Sender<Outbound>,
}

impl UdpSender {
    /// Queues a datagram and waits for the writer task's classified result
    /// of the actual `send_to` call (not just queue admission).
    pub async fn send(&self, data: Vec<u8>, peer: SocketAddr) -> std::result::Result<(), SendErrorKind> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Outbound { data, peer, reply }).await.is_err() {
            return Err(SendErrorKind::Other);
        }
        rx.await.unwrap_or(Err(SendErrorKind::Other))
    }
}

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    sender: UdpSender,
    send_rx: mpsc::Receiver<Outbound>,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(Error::BindError)?;
        let (tx, send_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        Ok(UdpTransport {
            socket: Arc::new(socket),
            sender: UdpSender { tx },
            send_rx,
        })
    }

    pub fn sender(&self) -> UdpSender {
        self.sender.clone()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Spawns the writer task that drains the send queue onto the socket,
    /// classifying failures per [`SendErrorKind`] so callers can tell a dead
    /// peer (host unreachable) from a transient local error.
    pub fn spawn_writer(mut self) -> (Arc<UdpSocket>, tokio::task::JoinHandle<()>) {
        let socket = self.socket.clone();
        let write_socket = self.socket.clone();
        let handle = tokio::spawn(async move {
            while let Some(Outbound { data, peer, reply }) = self.send_rx.recv().await {
                let outcome = match write_socket.send_to(&data, peer).await {
                    Ok(_) => {
                        debug!(%peer, bytes = data.len(), "TX");
                        Ok(())
                    }
                    Err(e) => {
                        let kind = SendErrorKind::classify(&e);
                        match kind {
                            SendErrorKind::HostUnreachable => {
                                warn!(%peer, error = %e, "NETWORK host unreachable");
                            }
                            SendErrorKind::Other => {
                                error!(%peer, error = %e, "NETWORK send failed");
                            }
                        }
                        Err(kind)
                    }
                };
                let _ = reply.send(outcome);
            }
        });
        (socket, handle)
    }

    /// Like [`spawn_writer`], but one configured peer is treated as
    /// unreachable once `trigger` is set, instead of actually touching the
    /// socket for that peer — lets a test put a peer offline mid-call
    /// without depending on the host's routing table producing a real OS
    /// error on demand.
    pub fn spawn_writer_with_switchable_blackhole(
        mut self,
        blackholed_peer: SocketAddr,
        kind: SendErrorKind,
        trigger: Arc<std::sync::atomic::AtomicBool>,
    ) -> (Arc<UdpSocket>, tokio::task::JoinHandle<()>) {
        let socket = self.socket.clone();
        let write_socket = self.socket.clone();
        let handle = tokio::spawn(async move {
            while let Some(Outbound { data, peer, reply }) = self.send_rx.recv().await {
                if peer == blackholed_peer && trigger.load(std::sync::atomic::Ordering::SeqCst) {
                    warn!(%peer, "NETWORK simulated unreachable peer");
                    let _ = reply.send(Err(kind));
                    continue;
                }
                let outcome = match write_socket.send_to(&data, peer).await {
                    Ok(_) => {
                        debug!(%peer, bytes = data.len(), "TX");
                        Ok(())
                    }
                    Err(e) => {
                        let kind = SendErrorKind::classify(&e);
                        match kind {
                            SendErrorKind::HostUnreachable => {
                                warn!(%peer, error = %e, "NETWORK host unreachable");
                            }
                            SendErrorKind::Other => {
                                error!(%peer, error = %e, "NETWORK send failed");
                            }
                        }
                        Err(kind)
                    }
                };
                let _ = reply.send(outcome);
            }
        });
        (socket, handle)
    }

    /// Runs the receive loop, awaiting `on_datagram` to completion before the
    /// next `recv_from` (5: "two datagrams from the same peer are processed
    /// in arrival order"). Spawning a task per datagram would let the
    /// executor interleave handlers and violate that guarantee; the
    /// single-socket cooperative loop is the simpler and correct shape.
    /// Never returns under normal operation; a fatal socket error ends the
    /// loop and is returned to the caller so the binary can decide whether
    /// to restart the transport or exit.
    pub async fn run_receive_loop<F, Fut>(socket: Arc<UdpSocket>, mut on_datagram: F) -> Result<()>
    where
        F: FnMut(Inbound) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, peer) = socket.recv_from(&mut buf).await?;
            debug!(%peer, bytes = len, "RX");
            on_datagram(Inbound {
                data: buf[..len].to_vec(),
                peer,
            })
            .await;
        }
    }
}
