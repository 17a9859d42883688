//! Connection manager
//!
//! Owns every established peer link. The peer map sits behind one async
//! mutex that is never held across socket I/O; each link has its own write
//! lock so frames from different tasks never interleave.

use crate::events::{ClientEvent, EventSender};
use peerlink_core::{encode_frame, proto, write_frame, Envelope, Error, HandshakeStatus, PeerRole, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};

/// Write side of a peer link
pub type PeerWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One established link, keyed by username in the manager
struct PeerConnection {
    id: u64,
    role: PeerRole,
    addr: SocketAddr,
    connected_at: Instant,
    writer: Arc<Mutex<PeerWriter>>,
    shutdown: watch::Sender<bool>,
}

/// Snapshot of a connection for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub username: String,
    pub role: PeerRole,
    pub addr: SocketAddr,
    pub connected_for: Duration,
}

/// Handle given to the read-loop of a freshly registered link
#[derive(Debug)]
pub struct Registration {
    /// Identifies this link even if the username reconnects later
    pub id: u64,
    /// Flips to `true` when the link is torn down
    pub shutdown: watch::Receiver<bool>,
}

pub struct ConnectionManager {
    peers: Mutex<HashMap<String, PeerConnection>>,
    next_id: AtomicU64,
    events: EventSender,
}

impl ConnectionManager {
    pub fn new(events: EventSender) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events,
        }
    }

    /// Track a new link under `username`.
    ///
    /// Fails with `AlreadyConnected` if the name is taken; the caller still
    /// owns the socket and must close it.
    pub async fn register(
        &self,
        username: &str,
        role: PeerRole,
        addr: SocketAddr,
        writer: PeerWriter,
    ) -> Result<Registration> {
        let mut peers = self.peers.lock().await;
        if peers.contains_key(username) {
            return Err(Error::AlreadyConnected(username.to_string()));
        }
        let (registration, _) = self.insert(&mut peers, username, role, addr, writer);
        drop(peers);

        self.announce(username, role, addr);
        Ok(registration)
    }

    /// Claim `username` for an inbound link, then answer its handshake.
    ///
    /// The name is taken before `connection_response` is written, so of two
    /// requests racing for one username only one hears "accepted". The loser
    /// gets a rejection on its own socket and `AlreadyConnected` is returned.
    pub async fn admit(
        &self,
        username: &str,
        addr: SocketAddr,
        mut writer: PeerWriter,
    ) -> Result<Registration> {
        let mut peers = self.peers.lock().await;
        if peers.contains_key(username) {
            drop(peers);
            let refusal =
                proto::connection_response(HandshakeStatus::Rejected, "Username already connected");
            if let Err(e) = write_frame(&mut writer, &refusal).await {
                tracing::debug!("Could not refuse {} at {}: {}", username, addr, e);
            }
            return Err(Error::AlreadyConnected(username.to_string()));
        }
        let (registration, writer) =
            self.insert(&mut peers, username, PeerRole::Inbound, addr, writer);
        // Nothing may reach the peer before the handshake answer
        let mut guard = writer.lock_owned().await;
        drop(peers);

        let accepted = proto::connection_response(HandshakeStatus::Accepted, "Connection accepted");
        if let Err(e) = write_frame(&mut *guard, &accepted).await {
            drop(guard);
            let mut peers = self.peers.lock().await;
            if peers.get(username).is_some_and(|conn| conn.id == registration.id) {
                peers.remove(username);
            }
            return Err(e);
        }
        drop(guard);

        self.announce(username, PeerRole::Inbound, addr);
        Ok(registration)
    }

    fn insert(
        &self,
        peers: &mut HashMap<String, PeerConnection>,
        username: &str,
        role: PeerRole,
        addr: SocketAddr,
        writer: PeerWriter,
    ) -> (Registration, Arc<Mutex<PeerWriter>>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let writer = Arc::new(Mutex::new(writer));
        peers.insert(
            username.to_string(),
            PeerConnection {
                id,
                role,
                addr,
                connected_at: Instant::now(),
                writer: writer.clone(),
                shutdown,
            },
        );
        (
            Registration {
                id,
                shutdown: shutdown_rx,
            },
            writer,
        )
    }

    fn announce(&self, username: &str, role: PeerRole, addr: SocketAddr) {
        tracing::info!("Connected to {} ({}, {})", username, role, addr);
        let _ = self.events.send(ClientEvent::PeerConnected {
            username: username.to_string(),
            role,
            addr,
        });
    }

    /// Send one envelope to `username` as a single framed write.
    ///
    /// A transport failure removes the peer and reports `PeerDisconnected`;
    /// nothing is retried.
    pub async fn send(&self, username: &str, envelope: &Envelope) -> Result<()> {
        let (id, writer) = {
            let peers = self.peers.lock().await;
            let conn = peers
                .get(username)
                .ok_or_else(|| Error::NotConnected(username.to_string()))?;
            (conn.id, conn.writer.clone())
        };

        let frame = encode_frame(envelope)?;
        let result = {
            let mut writer = writer.lock().await;
            match writer.write_all(&frame).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };

        if let Err(e) = result {
            tracing::error!("Failed to send {} to {}: {}", envelope.kind(), username, e);
            self.remove_link(username, id).await;
            return Err(Error::PeerDisconnected(username.to_string()));
        }

        tracing::trace!("Sent {} to {} ({} bytes)", envelope.kind(), username, frame.len());
        Ok(())
    }

    /// Explicitly drop the link to `username`
    pub async fn disconnect(&self, username: &str) -> bool {
        let conn = self.peers.lock().await.remove(username);
        match conn {
            Some(conn) => {
                self.close(username, conn).await;
                true
            }
            None => false,
        }
    }

    /// Drop `username` only if it is still the link identified by `id`.
    ///
    /// A read-loop exiting late must not tear down a newer connection that
    /// reused the same name.
    pub async fn remove_link(&self, username: &str, id: u64) -> bool {
        let conn = {
            let mut peers = self.peers.lock().await;
            match peers.get(username) {
                Some(conn) if conn.id == id => peers.remove(username),
                _ => None,
            }
        };
        match conn {
            Some(conn) => {
                self.close(username, conn).await;
                true
            }
            None => false,
        }
    }

    pub async fn is_connected(&self, username: &str) -> bool {
        self.peers.lock().await.contains_key(username)
    }

    /// Whether `username` is still served by the link `id`
    pub async fn is_current(&self, username: &str, id: u64) -> bool {
        self.peers
            .lock()
            .await
            .get(username)
            .is_some_and(|conn| conn.id == id)
    }

    /// Snapshot of all links, sorted by username
    pub async fn peers(&self) -> Vec<PeerSummary> {
        let peers = self.peers.lock().await;
        let mut list: Vec<PeerSummary> = peers
            .iter()
            .map(|(username, conn)| PeerSummary {
                username: username.clone(),
                role: conn.role,
                addr: conn.addr,
                connected_for: conn.connected_at.elapsed(),
            })
            .collect();
        list.sort_by(|a, b| a.username.cmp(&b.username));
        list
    }

    /// Tear down every link
    pub async fn close_all(&self) {
        let drained: Vec<(String, PeerConnection)> = self.peers.lock().await.drain().collect();
        for (username, conn) in drained {
            self.close(&username, conn).await;
        }
    }

    async fn close(&self, username: &str, conn: PeerConnection) {
        let _ = conn.shutdown.send(true);
        // A send stuck on a stalled peer holds the lock; dropping our handle
        // is enough in that case.
        if let Ok(mut writer) = conn.writer.try_lock() {
            let _ = writer.shutdown().await;
        }

        tracing::info!("Disconnected from {}", username);
        let _ = self.events.send(ClientEvent::PeerDisconnected {
            username: username.to_string(),
        });
    }
}
