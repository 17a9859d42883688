//! TCP transport and connection handshake
//!
//! A link is only handed to the connection manager after the handshake:
//! the initiator sends `connection_request`, the acceptor answers with
//! `connection_response` once the local user has decided.

use crate::config::ConnectionConfig;
use crate::connection::{ConnectionManager, Registration};
use crate::events::{ClientEvent, ConnectionDecision, EventSender};
use peerlink_core::proto;
use peerlink_core::{write_frame, Envelope, Error, FrameReader, HandshakeStatus, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

/// An accepted inbound socket, already registered with the manager
pub struct InboundLink {
    pub username: String,
    pub reader: FrameReader<OwnedReadHalf>,
    pub registration: Registration,
}

/// An outbound socket that completed the handshake, ready for promotion
pub struct EstablishedLink {
    pub username: String,
    pub addr: SocketAddr,
    pub reader: FrameReader<OwnedReadHalf>,
    pub writer: OwnedWriteHalf,
}

/// Bind the listening socket
pub async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    let listener = TcpListener::bind((host, port))
        .await
        .map_err(|e| Error::ConnectionFailed(format!("cannot listen on {}:{}: {}", host, port, e)))?;
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Listening for peers on {}", addr);
    }
    Ok(listener)
}

pub struct Transport {
    local_username: String,
    config: ConnectionConfig,
    manager: Arc<ConnectionManager>,
    events: EventSender,
}

impl Transport {
    pub fn new(
        local_username: &str,
        config: ConnectionConfig,
        manager: Arc<ConnectionManager>,
        events: EventSender,
    ) -> Self {
        Self {
            local_username: local_username.to_string(),
            config,
            manager,
            events,
        }
    }

    /// Run the acceptor side of the handshake on a fresh socket.
    ///
    /// Returns `Ok(None)` when the request was answered with a rejection.
    pub async fn accept_handshake(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<Option<InboundLink>> {
        let (read_half, mut writer) = stream.into_split();
        let mut reader = FrameReader::new(read_half);

        let frame = match tokio::time::timeout(self.config.handshake_timeout(), reader.next_frame()).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                return Err(Error::ConnectionFailed(format!(
                    "{} closed before sending a connection request",
                    addr
                )))
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::HandshakeTimeout(addr.to_string())),
        };
        let (username, _) = Envelope::expect_connection_request(&frame)?;
        tracing::info!("Connection request from '{}' at {}", username, addr);

        if let Some(reason) = self.refusal_reason(&username).await {
            tracing::warn!("Refusing '{}' from {}: {}", username, addr, reason);
            self.respond(&mut writer, HandshakeStatus::Rejected, reason).await?;
            return Ok(None);
        }

        let (decision, reply) = ConnectionDecision::new(username.clone(), addr);
        let accepted = if self
            .events
            .send(ClientEvent::ConnectionRequested(decision))
            .is_err()
        {
            false
        } else {
            match tokio::time::timeout(self.config.decision_timeout(), reply).await {
                Ok(Ok(accepted)) => accepted,
                Ok(Err(_)) => false,
                Err(_) => {
                    tracing::info!("No decision on '{}' in time, rejecting", username);
                    false
                }
            }
        };

        if !accepted {
            self.respond(&mut writer, HandshakeStatus::Rejected, "Connection rejected")
                .await?;
            return Ok(None);
        }
        // The name may have been taken while the user was deciding
        let registration = match self.manager.admit(&username, addr, Box::new(writer)).await {
            Ok(registration) => registration,
            Err(Error::AlreadyConnected(_)) => {
                tracing::warn!("'{}' connected elsewhere while the request from {} waited", username, addr);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        Ok(Some(InboundLink {
            username,
            reader,
            registration,
        }))
    }

    /// Open a link to `username` at `addr` and run the initiator side of the
    /// handshake. Waits for the remote user's decision as well as the network.
    pub async fn connect(&self, username: &str, addr: &str) -> Result<EstablishedLink> {
        if username == self.local_username {
            return Err(Error::ConnectionFailed("cannot connect to yourself".to_string()));
        }
        if self.manager.is_connected(username).await {
            return Err(Error::AlreadyConnected(username.to_string()));
        }

        let stream = match tokio::time::timeout(self.config.handshake_timeout(), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::ConnectionFailed(format!(
                    "{} at {}: {}",
                    username, addr, e
                )))
            }
            Err(_) => return Err(Error::HandshakeTimeout(format!("{} at {}", username, addr))),
        };
        let peer_addr = stream.peer_addr()?;
        let (read_half, mut writer) = stream.into_split();
        let mut reader = FrameReader::new(read_half);

        write_frame(&mut writer, &proto::connection_request(&self.local_username)).await?;
        tracing::debug!("Sent connection request to {} at {}", username, peer_addr);

        let wait = self.config.handshake_timeout() + self.config.decision_timeout();
        let frame = match tokio::time::timeout(wait, reader.next_frame()).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                return Err(Error::ConnectionFailed(format!(
                    "{} closed the connection during the handshake",
                    username
                )))
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::HandshakeTimeout(username.to_string())),
        };

        match Envelope::from_bytes(&frame)? {
            Envelope::ConnectionResponse {
                status: HandshakeStatus::Accepted,
                ..
            } => {
                tracing::info!("{} accepted our connection", username);
                Ok(EstablishedLink {
                    username: username.to_string(),
                    addr: peer_addr,
                    reader,
                    writer,
                })
            }
            Envelope::ConnectionResponse {
                status: HandshakeStatus::Rejected,
                message,
            } => Err(Error::ConnectionRejected {
                peer: username.to_string(),
                message,
            }),
            other => Err(Error::Protocol(format!(
                "expected connection_response from {}, got {}",
                username,
                other.kind()
            ))),
        }
    }

    async fn refusal_reason(&self, username: &str) -> Option<&'static str> {
        if username.is_empty() {
            Some("Username required")
        } else if username == self.local_username {
            Some("Username matches the local peer")
        } else if self.manager.is_connected(username).await {
            Some("Username already connected")
        } else {
            None
        }
    }

    async fn respond(&self, writer: &mut OwnedWriteHalf, status: HandshakeStatus, message: &str) -> Result<()> {
        write_frame(writer, &proto::connection_response(status, message)).await
    }
}
