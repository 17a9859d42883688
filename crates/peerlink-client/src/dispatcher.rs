//! Message dispatcher
//!
//! Each established link gets one read loop. Frames are decoded and routed
//! by type: chat goes straight to the event channel, file messages to the
//! transfer engine.

use crate::config::ConnectionConfig;
use crate::connection::{ConnectionManager, Registration};
use crate::events::{ClientEvent, EventSender};
use crate::transfer::TransferEngine;
use peerlink_core::{Envelope, FrameReader};
use std::sync::Arc;
use tokio::io::AsyncRead;

pub struct Dispatcher {
    manager: Arc<ConnectionManager>,
    engine: Arc<TransferEngine>,
    events: EventSender,
    config: ConnectionConfig,
}

impl Dispatcher {
    pub fn new(
        manager: Arc<ConnectionManager>,
        engine: Arc<TransferEngine>,
        events: EventSender,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            manager,
            engine,
            events,
            config,
        }
    }

    /// Route one decoded envelope from `from`
    pub async fn dispatch(&self, from: &str, envelope: Envelope) {
        tracing::trace!("Received {} from {}", envelope.kind(), from);
        match envelope {
            Envelope::Text {
                content,
                sender,
                timestamp,
            } => {
                if sender != from {
                    tracing::debug!("Text on {}'s link claims sender '{}'", from, sender);
                }
                let _ = self.events.send(ClientEvent::TextReceived {
                    from: from.to_string(),
                    content,
                    timestamp,
                });
            }
            Envelope::FileInfo(offer) => self.engine.handle_offer(from, offer).await,
            Envelope::FileAccept { filename } => self.engine.handle_accept(from, &filename).await,
            Envelope::FileReject { filename } => self.engine.handle_reject(from, &filename).await,
            Envelope::FileChunk {
                chunk_id,
                data,
                total_chunks,
                ..
            } => {
                self.engine
                    .handle_chunk(from, chunk_id, data, total_chunks)
                    .await
            }
            Envelope::FileComplete { filename, hash, .. } => {
                self.engine.handle_complete(from, &filename, &hash).await
            }
            Envelope::ConnectionRequest { username, .. } => {
                tracing::warn!(
                    "Ignoring connection_request ('{}') on established link to {}",
                    username,
                    from
                );
            }
            Envelope::ConnectionResponse { .. } => {
                tracing::debug!("Ignoring stray connection_response from {}", from);
            }
        }
    }

    /// Read frames from `username` until the link ends, then clean up.
    ///
    /// Wakes every read tick even without traffic so a dropped link or a
    /// stalled transfer is noticed.
    pub async fn run_read_loop<R>(
        self: Arc<Self>,
        username: String,
        registration: Registration,
        mut reader: FrameReader<R>,
    ) where
        R: AsyncRead + Unpin,
    {
        let Registration { id, mut shutdown } = registration;
        let max_malformed = self.config.max_malformed_frames.max(1);
        let mut malformed = 0u32;
        // Frames must not push the liveness check back
        let mut tick = tokio::time::interval(self.config.read_tick());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tick.tick() => {
                    if !self.manager.is_current(&username, id).await {
                        break;
                    }
                    self.engine.check_stall().await;
                }
                frame = reader.next_frame() => match frame {
                    Ok(Some(buf)) => match Envelope::from_bytes(&buf) {
                        Ok(envelope) => {
                            malformed = 0;
                            self.dispatch(&username, envelope).await;
                        }
                        Err(e) => {
                            if frame_kind(&buf).as_deref() == Some("file_chunk") {
                                self.engine.reject_chunk(&username, &e.to_string()).await;
                            }
                            malformed += 1;
                            tracing::warn!("Malformed frame from {} ({}/{}): {}", username, malformed, max_malformed, e);
                            if malformed >= max_malformed {
                                tracing::error!("Too many malformed frames from {}, dropping link", username);
                                break;
                            }
                        }
                    },
                    Ok(None) => {
                        tracing::info!("{} closed the connection", username);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Read from {} failed: {}", username, e);
                        break;
                    }
                },
            }
        }

        self.manager.remove_link(&username, id).await;
        // A newer link under the same name owns whatever the slot holds
        if !self.manager.is_connected(&username).await {
            self.engine.peer_disconnected(&username).await;
        }
        tracing::debug!("Read loop for {} finished", username);
    }
}

/// The `type` tag of a frame that failed to decode as an envelope
fn frame_kind(buf: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(buf).ok()?;
    value.get("type")?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferConfig;
    use crate::events::{self, EventReceiver};
    use peerlink_core::proto::FileOffer;
    use peerlink_core::{proto, write_frame, PeerRole, TransferState};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    struct Link {
        dispatcher: Arc<Dispatcher>,
        engine: Arc<TransferEngine>,
        manager: Arc<ConnectionManager>,
        events: EventReceiver,
        /// What the remote peer writes into our read loop
        remote_tx: DuplexStream,
        task: tokio::task::JoinHandle<()>,
        _write_remote: DuplexStream,
        _dir: TempDir,
    }

    async fn spawn_link(config: ConnectionConfig) -> Link {
        spawn_link_with(config, TransferConfig::default()).await
    }

    async fn spawn_link_with(config: ConnectionConfig, transfer: TransferConfig) -> Link {
        let dir = TempDir::new().unwrap();
        let (tx, rx) = events::channel();
        let manager = Arc::new(ConnectionManager::new(tx.clone()));
        let engine = Arc::new(TransferEngine::new(
            "alice",
            dir.path().to_path_buf(),
            transfer,
            manager.clone(),
            tx.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(manager.clone(), engine.clone(), tx, config));

        let (write_local, write_remote) = tokio::io::duplex(64 * 1024);
        let (read_local, remote_tx) = tokio::io::duplex(64 * 1024);
        let registration = manager
            .register("bob", PeerRole::Inbound, "127.0.0.1:5001".parse().unwrap(), Box::new(write_local))
            .await
            .unwrap();
        let task = tokio::spawn(dispatcher.clone().run_read_loop(
            "bob".to_string(),
            registration,
            FrameReader::new(read_local),
        ));

        Link {
            dispatcher,
            engine,
            manager,
            events: rx,
            remote_tx,
            task,
            _write_remote: write_remote,
            _dir: dir,
        }
    }

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            read_tick_ms: 50,
            ..ConnectionConfig::default()
        }
    }

    async fn next_text(events: &mut EventReceiver) -> (String, String) {
        while let Some(event) = events.recv().await {
            if let ClientEvent::TextReceived { from, content, .. } = event {
                return (from, content);
            }
        }
        panic!("event channel closed");
    }

    async fn write_raw(stream: &mut DuplexStream, payload: &[u8]) {
        stream.write_all(&(payload.len() as u32).to_be_bytes()).await.unwrap();
        stream.write_all(payload).await.unwrap();
    }

    #[tokio::test]
    async fn test_text_is_delivered_in_order() {
        let mut link = spawn_link(fast_config()).await;

        write_frame(&mut link.remote_tx, &proto::text("bob", "one")).await.unwrap();
        write_frame(&mut link.remote_tx, &proto::text("bob", "two")).await.unwrap();

        assert_eq!(next_text(&mut link.events).await, ("bob".to_string(), "one".to_string()));
        assert_eq!(next_text(&mut link.events).await, ("bob".to_string(), "two".to_string()));
    }

    #[tokio::test]
    async fn test_single_malformed_frame_is_skipped() {
        let mut link = spawn_link(fast_config()).await;

        write_raw(&mut link.remote_tx, b"{not json").await;
        write_raw(&mut link.remote_tx, br#"{"type":"bogus"}"#).await;
        write_frame(&mut link.remote_tx, &proto::text("bob", "still here")).await.unwrap();

        assert_eq!(next_text(&mut link.events).await.1, "still here");
        assert!(link.manager.is_connected("bob").await);
    }

    #[test]
    fn test_frame_kind_of_undecodable_chunk() {
        let bad = br#"{"type":"file_chunk","chunk_id":0,"data":"***","total_chunks":1}"#;
        assert!(Envelope::from_bytes(bad).is_err());
        assert_eq!(frame_kind(bad).as_deref(), Some("file_chunk"));
        assert_eq!(frame_kind(b"garbage"), None);
    }

    #[tokio::test]
    async fn test_repeated_malformed_frames_drop_the_link() {
        let link = spawn_link(fast_config()).await;
        let mut remote = link.remote_tx;

        for _ in 0..3 {
            write_raw(&mut remote, b"garbage").await;
        }

        tokio::time::timeout(Duration::from_secs(5), link.task).await.unwrap().unwrap();
        assert!(!link.manager.is_connected("bob").await);
    }

    #[tokio::test]
    async fn test_eof_removes_peer() {
        let link = spawn_link(fast_config()).await;
        drop(link.remote_tx);

        tokio::time::timeout(Duration::from_secs(5), link.task).await.unwrap().unwrap();
        assert!(!link.manager.is_connected("bob").await);
    }

    #[tokio::test]
    async fn test_disconnect_stops_read_loop() {
        let link = spawn_link(fast_config()).await;
        assert!(link.manager.disconnect("bob").await);

        tokio::time::timeout(Duration::from_secs(5), link.task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handshake_messages_after_promotion_are_ignored() {
        let mut link = spawn_link(fast_config()).await;

        link.dispatcher
            .dispatch("bob", proto::connection_request("mallory"))
            .await;
        write_frame(&mut link.remote_tx, &proto::text("bob", "after")).await.unwrap();

        assert_eq!(next_text(&mut link.events).await.1, "after");
        assert!(link.manager.is_connected("bob").await);
        assert!(!link.manager.is_connected("mallory").await);
    }

    #[tokio::test]
    async fn test_chatty_peer_cannot_hold_off_stall_check() {
        let config = ConnectionConfig {
            read_tick_ms: 200,
            ..ConnectionConfig::default()
        };
        let transfer = TransferConfig {
            stall_timeout_secs: 1,
            ..TransferConfig::default()
        };
        let mut link = spawn_link_with(config, transfer).await;

        let offer = FileOffer {
            filename: "report.pdf".to_string(),
            size: 20000,
            hash: blake3::hash(b"never sent").to_hex().to_string(),
            extension: ".pdf".to_string(),
            total_chunks: 3,
            sender: "bob".to_string(),
        };
        link.engine.handle_offer("bob", offer).await;
        link.engine.accept_offer().await.unwrap();
        assert_eq!(link.engine.status().await.state, TransferState::ReceivingChunks);

        // Text every 100ms, but never a chunk
        for _ in 0..30 {
            write_frame(&mut link.remote_tx, &proto::text("bob", "still typing"))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert_eq!(link.engine.status().await.state, TransferState::Idle);
        let mut stalled = false;
        while let Ok(event) = link.events.try_recv() {
            if let ClientEvent::TransferFailed { reason, .. } = event {
                stalled = reason == crate::events::TransferFailure::Stalled;
            }
        }
        assert!(stalled);
        assert!(link.manager.is_connected("bob").await);
    }
}
