//! A running peer: listener, connections, dispatcher, and transfer engine
//! wired together behind one handle.

use crate::config::Config;
use crate::connection::{ConnectionManager, PeerSummary};
use crate::directory::DirectoryClient;
use crate::dispatcher::Dispatcher;
use crate::events::{self, EventReceiver};
use crate::transfer::{PendingFileOffer, SendOutcome, TransferEngine, TransferStatus};
use crate::transport::{self, EstablishedLink, InboundLink, Transport};
use peerlink_core::{proto, Error, FileMetadata, PeerRole, Result, TransferState};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

pub struct Node {
    username: String,
    advertised_host: String,
    local_addr: SocketAddr,
    manager: Arc<ConnectionManager>,
    engine: Arc<TransferEngine>,
    dispatcher: Arc<Dispatcher>,
    transport: Transport,
    directory: DirectoryClient,
    shutdown: watch::Sender<bool>,
}

impl Node {
    /// Bind the listener and start accepting peers.
    ///
    /// Everything the user must see or decide arrives on the returned
    /// receiver.
    pub async fn start(config: Config) -> Result<(Arc<Self>, EventReceiver)> {
        let username = config.username.trim().to_string();
        if username.is_empty() {
            return Err(Error::InvalidData("username is not configured".to_string()));
        }

        let (events, rx) = events::channel();
        let manager = Arc::new(ConnectionManager::new(events.clone()));
        let engine = Arc::new(TransferEngine::new(
            &username,
            config.download_dir(),
            config.transfer.clone(),
            manager.clone(),
            events.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            manager.clone(),
            engine.clone(),
            events.clone(),
            config.connection.clone(),
        ));
        let transport = Transport::new(
            &username,
            config.connection.clone(),
            manager.clone(),
            events,
        );
        let directory = DirectoryClient::new(
            &config.directory.url,
            Duration::from_secs(config.directory.timeout_secs),
        )?;

        let listener = transport::bind(&config.listen.host, config.listen.port).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let node = Arc::new(Self {
            username,
            advertised_host: config.advertised_host().to_string(),
            local_addr,
            manager,
            engine,
            dispatcher,
            transport,
            directory,
            shutdown,
        });
        tokio::spawn(node.clone().accept_loop(listener, shutdown_rx));

        Ok((node, rx))
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn directory(&self) -> &DirectoryClient {
        &self.directory
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tracing::debug!("Incoming connection from {}", addr);
                        let node = self.clone();
                        tokio::spawn(async move {
                            match node.transport.accept_handshake(stream, addr).await {
                                Ok(Some(link)) => {
                                    let InboundLink {
                                        username,
                                        reader,
                                        registration,
                                    } = link;
                                    tokio::spawn(
                                        node.dispatcher
                                            .clone()
                                            .run_read_loop(username, registration, reader),
                                    );
                                }
                                Ok(None) => {}
                                Err(e) => tracing::warn!("Handshake with {} failed: {}", addr, e),
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        tracing::debug!("Listener on {} stopped", self.local_addr);
    }

    /// Hand an outbound handshaken socket to the manager and start its read loop
    async fn promote(&self, link: EstablishedLink) -> Result<()> {
        let EstablishedLink {
            username,
            addr,
            reader,
            writer,
        } = link;
        let registration = self
            .manager
            .register(&username, PeerRole::Outbound, addr, Box::new(writer))
            .await?;
        tokio::spawn(
            self.dispatcher
                .clone()
                .run_read_loop(username, registration, reader),
        );
        Ok(())
    }

    // ---- connections ----

    /// Connect to `username` listening at `addr` (`host:port`)
    pub async fn connect(&self, username: &str, addr: &str) -> Result<()> {
        let link = self.transport.connect(username, addr).await?;
        self.promote(link).await
    }

    /// Look `username` up in the directory, then connect
    pub async fn connect_via_directory(&self, username: &str) -> Result<()> {
        let record = self.directory.peer_info(username).await?;
        self.connect(username, &record.socket_addr()).await
    }

    pub async fn disconnect(&self, username: &str) -> bool {
        self.manager.disconnect(username).await
    }

    pub async fn peers(&self) -> Vec<PeerSummary> {
        self.manager.peers().await
    }

    pub async fn is_connected(&self, username: &str) -> bool {
        self.manager.is_connected(username).await
    }

    // ---- messages and files ----

    pub async fn send_text(&self, username: &str, content: &str) -> Result<()> {
        self.manager
            .send(username, &proto::text(&self.username, content))
            .await
    }

    /// Offer a file and stream it if accepted; resolves when the transfer ends
    pub async fn send_file(&self, username: &str, path: &Path) -> Result<SendOutcome> {
        self.engine.send_file(username, path).await
    }

    pub async fn accept_file(&self) -> Result<FileMetadata> {
        self.engine.accept_offer().await
    }

    pub async fn reject_file(&self) -> Result<()> {
        self.engine.reject_offer().await
    }

    pub async fn abort_transfer(&self) -> bool {
        self.engine.abort().await
    }

    pub async fn transfer_status(&self) -> TransferStatus {
        self.engine.status().await
    }

    pub async fn pending_offer(&self) -> Option<PendingFileOffer> {
        self.engine.pending_offer().await
    }

    // ---- directory ----

    /// Register the bound listener with the directory
    pub async fn register_with_directory(&self) -> Result<()> {
        self.directory
            .register(&self.username, &self.advertised_host, self.local_addr.port())
            .await
    }

    pub async fn unregister_from_directory(&self) -> Result<()> {
        self.directory.unregister(&self.username).await
    }

    /// Stop listening, abort any transfer, and close every link
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let busy = self.engine.status().await.state != TransferState::Idle
            || self.engine.pending_offer().await.is_some();
        if busy {
            self.engine.abort().await;
        }
        self.manager.close_all().await;
        tracing::info!("Node '{}' shut down", self.username);
    }
}
