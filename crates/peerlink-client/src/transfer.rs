//! File transfer engine
//!
//! One transfer slot per process: at most one session (sending or
//! receiving) plus at most one unanswered inbound offer. The state machine:
//!
//! ```text
//! sender:   Idle -> WaitingConfirmation -> SendingChunks -> Idle
//! receiver: Idle -> ReceivingChunks -> Idle
//! ```
//!
//! Whoever takes a session out of the slot reports how it ended, so every
//! transfer produces exactly one terminal event.

use crate::config::TransferConfig;
use crate::connection::ConnectionManager;
use crate::events::{ClientEvent, EventSender, TransferFailure};
use peerlink_core::proto::{self, FileOffer};
use peerlink_core::{chunk, Envelope, Error, FileMetadata, Result, TransferState};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::{oneshot, Mutex};

/// How an outgoing transfer ended when it did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Every chunk and the completion message went out
    Delivered { filename: String, chunks: u64 },
    /// The receiver declined the offer
    Rejected,
    /// The receiver did not answer within the confirmation deadline
    TimedOut,
}

/// An inbound offer waiting for the user's decision
#[derive(Debug, Clone)]
pub struct PendingFileOffer {
    pub metadata: FileMetadata,
    pub sender: String,
    pub received_at: Instant,
}

/// Snapshot of the transfer slot
#[derive(Debug, Clone, PartialEq)]
pub struct TransferStatus {
    pub state: TransferState,
    pub peer: Option<String>,
    pub filename: Option<String>,
    /// Source file for senders, staging file for receivers
    pub local_path: Option<PathBuf>,
    pub chunks_transferred: u64,
    pub total_chunks: u64,
    pub elapsed: Option<Duration>,
}

enum Direction {
    Sending {
        source: PathBuf,
        decision: Option<oneshot::Sender<bool>>,
    },
    Receiving {
        staging: PathBuf,
        /// Written outside the slot lock
        file: Arc<Mutex<tokio::fs::File>>,
    },
}

struct TransferSession {
    id: u64,
    peer: String,
    metadata: FileMetadata,
    state: TransferState,
    chunks_transferred: u64,
    started_at: Instant,
    last_activity: Instant,
    direction: Direction,
}

impl TransferSession {
    fn new(
        id: u64,
        peer: &str,
        metadata: FileMetadata,
        state: TransferState,
        direction: Direction,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            peer: peer.to_string(),
            metadata,
            state,
            chunks_transferred: 0,
            started_at: now,
            last_activity: now,
            direction,
        }
    }

    fn is(&self, peer: &str, state: TransferState) -> bool {
        self.peer == peer && self.state == state
    }
}

#[derive(Default)]
struct TransferSlot {
    session: Option<TransferSession>,
    pending: Option<PendingFileOffer>,
}

impl TransferSlot {
    /// Peer currently holding the slot, if any
    fn busy_with(&self) -> Option<&str> {
        self.session
            .as_ref()
            .map(|s| s.peer.as_str())
            .or_else(|| self.pending.as_ref().map(|p| p.sender.as_str()))
    }

    /// Take the session only if it is still the one identified by `id`
    fn take_session(&mut self, id: u64) -> Option<TransferSession> {
        if self.session.as_ref().is_some_and(|s| s.id == id) {
            self.session.take()
        } else {
            None
        }
    }
}

pub struct TransferEngine {
    local_username: String,
    download_dir: PathBuf,
    config: TransferConfig,
    manager: Arc<ConnectionManager>,
    events: EventSender,
    slot: Mutex<TransferSlot>,
    next_id: AtomicU64,
}

impl TransferEngine {
    pub fn new(
        local_username: &str,
        download_dir: PathBuf,
        config: TransferConfig,
        manager: Arc<ConnectionManager>,
        events: EventSender,
    ) -> Self {
        Self {
            local_username: local_username.to_string(),
            download_dir,
            config,
            manager,
            events,
            slot: Mutex::new(TransferSlot::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    fn chunk_size(&self) -> usize {
        self.config.effective_chunk_size()
    }

    // ---- sender path ----

    /// Offer `path` to `peer` and stream it once accepted.
    ///
    /// Rejection and an unanswered offer are normal outcomes. Errors mean the
    /// transfer broke: the peer disconnected, the file changed underneath us,
    /// a write stalled, or the user aborted.
    pub async fn send_file(&self, peer: &str, path: &Path) -> Result<SendOutcome> {
        if !self.manager.is_connected(peer).await {
            return Err(Error::NotConnected(peer.to_string()));
        }
        if let Some(busy) = self.slot.lock().await.busy_with() {
            return Err(Error::TransferBusy(busy.to_string()));
        }

        let chunk_size = self.chunk_size();
        let source = path.to_path_buf();
        let metadata = tokio::task::spawn_blocking(move || chunk::file_metadata(&source, chunk_size))
            .await
            .map_err(|e| Error::InvalidData(format!("hashing task failed: {}", e)))??;

        let (decision_tx, decision_rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut slot = self.slot.lock().await;
            if let Some(busy) = slot.busy_with() {
                return Err(Error::TransferBusy(busy.to_string()));
            }
            slot.session = Some(TransferSession::new(
                id,
                peer,
                metadata.clone(),
                TransferState::WaitingConfirmation,
                Direction::Sending {
                    source: path.to_path_buf(),
                    decision: Some(decision_tx),
                },
            ));
        }

        let filename = metadata.filename.clone();
        let offer = Envelope::FileInfo(FileOffer::new(metadata.clone(), &self.local_username));
        if let Err(e) = self.manager.send(peer, &offer).await {
            self.slot.lock().await.take_session(id);
            return Err(e);
        }
        tracing::info!(
            "Offered {} ({} bytes, {} chunks) to {}",
            filename,
            metadata.size,
            metadata.total_chunks,
            peer
        );

        match tokio::time::timeout(self.config.confirm_timeout(), decision_rx).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                let session = self.slot.lock().await.take_session(id);
                if session.is_some() {
                    tracing::info!("{} declined {}", peer, filename);
                    self.emit_failure(peer, &filename, TransferFailure::Rejected);
                }
                return Ok(SendOutcome::Rejected);
            }
            Ok(Err(_)) => {
                // Torn down by a disconnect or abort, which already reported it
                return Err(Error::TransferAborted {
                    peer: peer.to_string(),
                    filename,
                });
            }
            Err(_) => {
                let session = self.slot.lock().await.take_session(id);
                if session.is_none() {
                    return Err(Error::TransferAborted {
                        peer: peer.to_string(),
                        filename,
                    });
                }
                tracing::warn!("{} did not answer the offer for {} in time", peer, filename);
                self.emit_failure(peer, &filename, TransferFailure::TimedOut);
                return Ok(SendOutcome::TimedOut);
            }
        }

        match self.stream_chunks(id, peer, path, &metadata).await {
            Ok(chunks) => {
                self.slot.lock().await.take_session(id);
                tracing::info!("File sent: {} to {} ({} chunks)", filename, peer, chunks);
                let _ = self.events.send(ClientEvent::FileSent {
                    peer: peer.to_string(),
                    filename: filename.clone(),
                });
                Ok(SendOutcome::Delivered { filename, chunks })
            }
            Err(e) => {
                let session = self.slot.lock().await.take_session(id);
                if session.is_some() {
                    tracing::error!("Sending {} to {} failed: {}", filename, peer, e);
                    self.emit_failure(peer, &filename, failure_reason(&e));
                }
                Err(e)
            }
        }
    }

    async fn stream_chunks(
        &self,
        id: u64,
        peer: &str,
        path: &Path,
        metadata: &FileMetadata,
    ) -> Result<u64> {
        let filename = &metadata.filename;
        let total = metadata.total_chunks;
        let mut file = tokio::fs::File::open(path).await?;
        let mut buf = vec![0u8; self.chunk_size()];
        let mut chunk_id = 0u64;
        let mut sent_bytes = 0u64;

        loop {
            let n = chunk::read_chunk(&mut file, &mut buf).await?;
            if n == 0 {
                break;
            }
            if chunk_id >= total {
                return Err(Error::SizeMismatch {
                    filename: filename.clone(),
                    expected: metadata.size,
                    actual: sent_bytes + n as u64,
                });
            }

            self.ensure_active(id, peer, filename).await?;
            let envelope = proto::file_chunk(chunk_id, buf[..n].to_vec(), total, filename);
            match tokio::time::timeout(self.config.stall_timeout(), self.manager.send(peer, &envelope)).await {
                Ok(result) => result?,
                Err(_) => {
                    // A half-written frame leaves the stream unusable
                    self.manager.disconnect(peer).await;
                    return Err(Error::TransferStalled {
                        peer: peer.to_string(),
                        filename: filename.clone(),
                    });
                }
            }

            chunk_id += 1;
            sent_bytes += n as u64;
            tracing::debug!("Sent chunk {}/{} of {} to {}", chunk_id, total, filename, peer);
            self.record_progress(id, chunk_id).await;

            let pacing = self.config.pacing();
            if !pacing.is_zero() {
                tokio::time::sleep(pacing).await;
            }
        }

        if chunk_id != total {
            return Err(Error::SizeMismatch {
                filename: filename.clone(),
                expected: metadata.size,
                actual: sent_bytes,
            });
        }

        self.ensure_active(id, peer, filename).await?;
        self.manager
            .send(
                peer,
                &Envelope::FileComplete {
                    filename: filename.clone(),
                    hash: metadata.hash.clone(),
                    total_chunks: total,
                },
            )
            .await?;
        Ok(chunk_id)
    }

    async fn ensure_active(&self, id: u64, peer: &str, filename: &str) -> Result<()> {
        let slot = self.slot.lock().await;
        match &slot.session {
            Some(session) if session.id == id => Ok(()),
            _ => Err(Error::TransferAborted {
                peer: peer.to_string(),
                filename: filename.to_string(),
            }),
        }
    }

    async fn record_progress(&self, id: u64, chunks_done: u64) {
        let mut slot = self.slot.lock().await;
        if let Some(session) = slot.session.as_mut().filter(|s| s.id == id) {
            session.chunks_transferred = chunks_done;
            session.last_activity = Instant::now();
            self.emit_progress(session);
        }
    }

    /// `file_accept` from the receiver
    pub async fn handle_accept(&self, from: &str, filename: &str) {
        let mut slot = self.slot.lock().await;
        match slot.session.as_mut() {
            Some(session)
                if session.is(from, TransferState::WaitingConfirmation)
                    && session.metadata.filename == filename =>
            {
                session.state = TransferState::SendingChunks;
                session.last_activity = Instant::now();
                if let Direction::Sending { decision, .. } = &mut session.direction {
                    if let Some(tx) = decision.take() {
                        let _ = tx.send(true);
                    }
                }
                tracing::info!("{} accepted {}, streaming chunks", from, filename);
            }
            _ => tracing::warn!("Ignoring file_accept for {} from {}: no offer waiting", filename, from),
        }
    }

    /// `file_reject` from the receiver, either declining the offer or
    /// calling off a transfer already streaming
    pub async fn handle_reject(&self, from: &str, filename: &str) {
        let mut slot = self.slot.lock().await;
        let Some(session) = slot.session.as_mut() else {
            tracing::warn!("Ignoring file_reject for {} from {}: no active transfer", filename, from);
            return;
        };
        if session.peer != from || session.metadata.filename != filename {
            tracing::warn!("Ignoring file_reject for {} from {}: not the active transfer", filename, from);
            return;
        }

        match session.state {
            TransferState::WaitingConfirmation => {
                if let Direction::Sending { decision, .. } = &mut session.direction {
                    if let Some(tx) = decision.take() {
                        let _ = tx.send(false);
                    }
                }
            }
            TransferState::SendingChunks => {
                if let Some(session) = slot.session.take() {
                    drop(slot);
                    tracing::warn!("{} cancelled the transfer of {}", from, filename);
                    self.finish_failed(session, TransferFailure::CancelledByPeer, false)
                        .await;
                }
            }
            _ => tracing::warn!("Ignoring file_reject for {} from {}: we are receiving", filename, from),
        }
    }

    // ---- receiver path ----

    /// `file_info` from a peer.
    ///
    /// Only one offer may be pending and none while a session runs; a second
    /// offer is declined with `file_reject` on the spot.
    pub async fn handle_offer(&self, from: &str, offer: FileOffer) {
        let mut metadata = offer.metadata();
        metadata.filename = chunk::sanitize_filename(&offer.filename);

        let mut slot = self.slot.lock().await;
        if let Some(busy) = slot.busy_with() {
            let busy = busy.to_string();
            drop(slot);
            tracing::warn!(
                "Declining {} from {}: transfer slot busy with {}",
                metadata.filename,
                from,
                busy
            );
            self.send_reject(from, &metadata.filename).await;
            let _ = self.events.send(ClientEvent::FileOfferDeclined {
                from: from.to_string(),
                filename: metadata.filename,
            });
            return;
        }

        slot.pending = Some(PendingFileOffer {
            metadata: metadata.clone(),
            sender: from.to_string(),
            received_at: Instant::now(),
        });
        drop(slot);

        tracing::info!("File offer from {}: {} ({} bytes)", from, metadata.filename, metadata.size);
        let _ = self.events.send(ClientEvent::FileOffered {
            from: from.to_string(),
            metadata,
        });
    }

    /// Accept the pending offer and start receiving chunks
    pub async fn accept_offer(&self) -> Result<FileMetadata> {
        let mut slot = self.slot.lock().await;
        let offer = slot.pending.take().ok_or(Error::NoPendingOffer)?;

        let (staging, file) = match self.open_staging(&offer.metadata.filename).await {
            Ok(opened) => opened,
            Err(e) => {
                drop(slot);
                tracing::error!("Cannot stage {}: {}", offer.metadata.filename, e);
                self.send_reject(&offer.sender, &offer.metadata.filename).await;
                return Err(e);
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        slot.session = Some(TransferSession::new(
            id,
            &offer.sender,
            offer.metadata.clone(),
            TransferState::ReceivingChunks,
            Direction::Receiving {
                staging,
                file: Arc::new(Mutex::new(file)),
            },
        ));
        drop(slot);

        let accept = Envelope::FileAccept {
            filename: offer.metadata.filename.clone(),
        };
        if let Err(e) = self.manager.send(&offer.sender, &accept).await {
            let session = self.slot.lock().await.take_session(id);
            if let Some(session) = session {
                self.finish_failed(session, TransferFailure::PeerDisconnected, false)
                    .await;
            }
            return Err(e);
        }

        tracing::info!("Accepted {} from {}", offer.metadata.filename, offer.sender);
        Ok(offer.metadata)
    }

    /// Decline the pending offer. Without one this only logs a warning.
    pub async fn reject_offer(&self) -> Result<()> {
        let pending = self.slot.lock().await.pending.take();
        match pending {
            Some(offer) => {
                tracing::info!("Rejected {} from {}", offer.metadata.filename, offer.sender);
                self.manager
                    .send(
                        &offer.sender,
                        &Envelope::FileReject {
                            filename: offer.metadata.filename,
                        },
                    )
                    .await
            }
            None => {
                tracing::warn!("No pending file offer to reject");
                Ok(())
            }
        }
    }

    /// `file_chunk` from the sender; must be the next chunk in order
    pub async fn handle_chunk(&self, from: &str, chunk_id: u64, data: Vec<u8>, total_chunks: u64) {
        let (id, file) = {
            let mut slot = self.slot.lock().await;
            let Some(session) = slot
                .session
                .as_mut()
                .filter(|s| s.is(from, TransferState::ReceivingChunks))
            else {
                tracing::warn!("Unexpected file chunk {} from {}", chunk_id, from);
                return;
            };

            let expected = session.chunks_transferred;
            let violation = if chunk_id != expected {
                Some(
                    Error::ChunkOutOfOrder {
                        peer: from.to_string(),
                        filename: session.metadata.filename.clone(),
                        expected,
                        actual: chunk_id,
                    }
                    .to_string(),
                )
            } else if expected >= session.metadata.total_chunks {
                Some(format!(
                    "{} sent chunk {} but announced only {} chunks",
                    from, chunk_id, session.metadata.total_chunks
                ))
            } else if total_chunks != session.metadata.total_chunks {
                Some(format!(
                    "chunk {} claims {} total chunks, offer said {}",
                    chunk_id, total_chunks, session.metadata.total_chunks
                ))
            } else {
                None
            };

            if let Some(message) = violation {
                if let Some(session) = slot.session.take() {
                    drop(slot);
                    self.finish_failed(session, TransferFailure::Protocol(message), true)
                        .await;
                }
                return;
            }
            let Direction::Receiving { file, .. } = &session.direction else {
                return;
            };
            (session.id, file.clone())
        };

        let written = file.lock().await.write_all(&data).await;

        let mut slot = self.slot.lock().await;
        // Aborted, stalled out, or disconnected while the write ran
        let Some(session) = slot.session.as_mut().filter(|s| s.id == id) else {
            return;
        };
        if let Err(e) = written {
            if let Some(session) = slot.take_session(id) {
                drop(slot);
                self.finish_failed(session, TransferFailure::Io(e.to_string()), true)
                    .await;
            }
            return;
        }

        session.chunks_transferred += 1;
        session.last_activity = Instant::now();
        tracing::debug!(
            "Received chunk {}/{} of {} from {}",
            session.chunks_transferred,
            session.metadata.total_chunks,
            session.metadata.filename,
            from
        );
        self.emit_progress(session);
    }

    /// A `file_chunk` from `from` whose payload could not be decoded
    pub async fn reject_chunk(&self, from: &str, reason: &str) {
        let session = {
            let mut slot = self.slot.lock().await;
            if slot
                .session
                .as_ref()
                .is_some_and(|s| s.is(from, TransferState::ReceivingChunks))
            {
                slot.session.take()
            } else {
                None
            }
        };
        if let Some(session) = session {
            let reason = format!("undecodable chunk: {}", reason);
            self.finish_failed(session, TransferFailure::Protocol(reason), true)
                .await;
        }
    }

    /// `file_complete` from the sender: verify, place, and hash the file
    pub async fn handle_complete(&self, from: &str, filename: &str, hash: &str) {
        let session = {
            let mut slot = self.slot.lock().await;
            if slot
                .session
                .as_ref()
                .is_some_and(|s| s.is(from, TransferState::ReceivingChunks))
            {
                slot.session.take()
            } else {
                None
            }
        };
        let Some(session) = session else {
            tracing::warn!("file_complete for {} from {} but no active transfer", filename, from);
            return;
        };

        if session.chunks_transferred != session.metadata.total_chunks {
            let reason = Error::IncompleteTransfer {
                filename: session.metadata.filename.clone(),
                received: session.chunks_transferred,
                total: session.metadata.total_chunks,
            };
            self.finish_failed(session, TransferFailure::Protocol(reason.to_string()), true)
                .await;
            return;
        }
        if hash != session.metadata.hash {
            tracing::warn!(
                "file_complete from {} carries hash {}, offer said {}",
                from,
                hash,
                session.metadata.hash
            );
        }

        let TransferSession {
            peer,
            metadata,
            direction,
            started_at,
            ..
        } = session;
        let Direction::Receiving { staging, file } = direction else {
            return;
        };

        let placed: Result<PathBuf> = async {
            {
                let mut file = file.lock().await;
                file.flush().await?;
                file.sync_all().await?;
            }
            drop(file);
            let (from, dir, name) = (staging.clone(), self.download_dir.clone(), metadata.filename.clone());
            match tokio::task::spawn_blocking(move || chunk::place_received(&from, &dir, &name)).await {
                Ok(result) => result,
                Err(e) => Err(Error::Io(std::io::Error::other(e))),
            }
        }
        .await;

        let destination = match placed {
            Ok(path) => path,
            Err(e) => {
                tracing::error!(
                    "Could not finalize {} (data kept at {}): {}",
                    metadata.filename,
                    staging.display(),
                    e
                );
                self.emit_failure(&peer, &metadata.filename, TransferFailure::Io(e.to_string()));
                return;
            }
        };

        let verification = {
            let path = destination.clone();
            tokio::task::spawn_blocking(move || {
                let size = std::fs::metadata(&path)?.len();
                Ok::<_, Error>((size, chunk::hash_file(&path)?))
            })
            .await
        };
        let (size, actual_hash) = match verification {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => (0, format!("unreadable: {}", e)),
            Err(e) => (0, format!("unreadable: {}", e)),
        };

        let verified = size == metadata.size && actual_hash == metadata.hash;
        if verified {
            tracing::info!(
                "File received: {} ({} bytes) in {:.1}s",
                destination.display(),
                size,
                started_at.elapsed().as_secs_f64()
            );
        } else if size != metadata.size {
            tracing::warn!(
                "{}",
                Error::SizeMismatch {
                    filename: metadata.filename.clone(),
                    expected: metadata.size,
                    actual: size,
                }
            );
        } else {
            tracing::warn!(
                "Validation failed for {}: {}",
                destination.display(),
                Error::HashMismatch {
                    expected: metadata.hash.clone(),
                    actual: actual_hash.clone(),
                }
            );
        }

        let _ = self.events.send(ClientEvent::FileReceived {
            from: peer,
            path: destination,
            size,
            verified,
            expected_hash: metadata.hash,
            actual_hash,
        });
    }

    // ---- teardown ----

    /// Drop everything tied to `peer` after its connection went away
    pub async fn peer_disconnected(&self, peer: &str) {
        let (session, pending) = {
            let mut slot = self.slot.lock().await;
            let session = if slot.session.as_ref().is_some_and(|s| s.peer == peer) {
                slot.session.take()
            } else {
                None
            };
            let pending = if slot.pending.as_ref().is_some_and(|p| p.sender == peer) {
                slot.pending.take()
            } else {
                None
            };
            (session, pending)
        };

        if let Some(offer) = pending {
            tracing::info!("Dropping offer of {} from disconnected {}", offer.metadata.filename, peer);
            self.emit_failure(peer, &offer.metadata.filename, TransferFailure::PeerDisconnected);
        }
        if let Some(session) = session {
            self.finish_failed(session, TransferFailure::PeerDisconnected, false)
                .await;
        }
    }

    /// Abort whatever the slot holds. Returns false (with a warning) when
    /// there was nothing to abort.
    pub async fn abort(&self) -> bool {
        let (session, pending) = {
            let mut slot = self.slot.lock().await;
            (slot.session.take(), slot.pending.take())
        };

        let mut aborted = false;
        if let Some(offer) = pending {
            self.send_reject(&offer.sender, &offer.metadata.filename).await;
            aborted = true;
        }
        if let Some(session) = session {
            self.finish_failed(session, TransferFailure::Aborted, true).await;
            aborted = true;
        }
        if !aborted {
            tracing::warn!("No transfer to abort");
        }
        aborted
    }

    /// Expire a receiving session without progress and an offer nobody
    /// answered. Called from the read-loop liveness tick.
    pub async fn check_stall(&self) {
        let stall = self.config.stall_timeout();
        let offer_ttl = self.config.confirm_timeout();

        let (stalled, expired) = {
            let mut slot = self.slot.lock().await;
            let is_stalled = slot.session.as_ref().is_some_and(|s| {
                s.state == TransferState::ReceivingChunks && s.last_activity.elapsed() > stall
            });
            let is_expired = slot
                .pending
                .as_ref()
                .is_some_and(|p| p.received_at.elapsed() > offer_ttl);
            (
                if is_stalled { slot.session.take() } else { None },
                if is_expired { slot.pending.take() } else { None },
            )
        };

        if let Some(offer) = expired {
            tracing::info!("Offer of {} from {} expired", offer.metadata.filename, offer.sender);
            self.emit_failure(&offer.sender, &offer.metadata.filename, TransferFailure::TimedOut);
        }
        if let Some(session) = stalled {
            tracing::warn!(
                "Transfer of {} from {} stalled at chunk {}/{}",
                session.metadata.filename,
                session.peer,
                session.chunks_transferred,
                session.metadata.total_chunks
            );
            self.finish_failed(session, TransferFailure::Stalled, true).await;
        }
    }

    pub async fn status(&self) -> TransferStatus {
        let slot = self.slot.lock().await;
        match &slot.session {
            Some(session) => TransferStatus {
                state: session.state,
                peer: Some(session.peer.clone()),
                filename: Some(session.metadata.filename.clone()),
                local_path: Some(match &session.direction {
                    Direction::Sending { source, .. } => source.clone(),
                    Direction::Receiving { staging, .. } => staging.clone(),
                }),
                chunks_transferred: session.chunks_transferred,
                total_chunks: session.metadata.total_chunks,
                elapsed: Some(session.started_at.elapsed()),
            },
            None => TransferStatus {
                state: TransferState::Idle,
                peer: None,
                filename: None,
                local_path: None,
                chunks_transferred: 0,
                total_chunks: 0,
                elapsed: None,
            },
        }
    }

    pub async fn pending_offer(&self) -> Option<PendingFileOffer> {
        self.slot.lock().await.pending.clone()
    }

    // ---- helpers ----

    async fn open_staging(&self, filename: &str) -> Result<(PathBuf, tokio::fs::File)> {
        tokio::fs::create_dir_all(&self.download_dir).await?;
        let staging = self
            .download_dir
            .join(format!(".{}.{}.part", filename, staging_suffix()));
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staging)
            .await?;
        Ok((staging, file))
    }

    /// Close out a session that did not produce a file
    async fn finish_failed(&self, session: TransferSession, reason: TransferFailure, notify_peer: bool) {
        let TransferSession {
            peer,
            metadata,
            direction,
            ..
        } = session;

        if let Direction::Receiving { staging, file } = direction {
            drop(file);
            match tokio::fs::remove_file(&staging).await {
                Ok(()) => tracing::debug!("Removed partial file {}", staging.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to remove partial file {}: {}", staging.display(), e),
            }
            if notify_peer {
                self.send_reject(&peer, &metadata.filename).await;
            }
        }

        tracing::warn!("Transfer of {} with {} ended: {:?}", metadata.filename, peer, reason);
        self.emit_failure(&peer, &metadata.filename, reason);
    }

    async fn send_reject(&self, peer: &str, filename: &str) {
        let reject = Envelope::FileReject {
            filename: filename.to_string(),
        };
        if let Err(e) = self.manager.send(peer, &reject).await {
            tracing::debug!("Could not send file_reject to {}: {}", peer, e);
        }
    }

    fn emit_progress(&self, session: &TransferSession) {
        let every = self.config.progress_every.max(1);
        let done = session.chunks_transferred;
        if done % every == 0 || done == session.metadata.total_chunks {
            let _ = self.events.send(ClientEvent::TransferProgress {
                peer: session.peer.clone(),
                filename: session.metadata.filename.clone(),
                chunks_done: done,
                total_chunks: session.metadata.total_chunks,
            });
        }
    }

    fn emit_failure(&self, peer: &str, filename: &str, reason: TransferFailure) {
        let _ = self.events.send(ClientEvent::TransferFailed {
            peer: peer.to_string(),
            filename: filename.to_string(),
            reason,
        });
    }
}

fn failure_reason(e: &Error) -> TransferFailure {
    match e {
        Error::TransferStalled { .. } => TransferFailure::Stalled,
        Error::PeerDisconnected(_) | Error::NotConnected(_) => TransferFailure::PeerDisconnected,
        Error::TransferAborted { .. } => TransferFailure::Aborted,
        Error::Io(io) => TransferFailure::Io(io.to_string()),
        other => TransferFailure::Protocol(other.to_string()),
    }
}

/// Random suffix keeping concurrent staging files apart
fn staging_suffix() -> String {
    let mut buf = [0u8; 8];
    // If getrandom fails, use current time as fallback
    if getrandom::getrandom(&mut buf).is_err() {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        buf = ts.to_le_bytes();
    }
    hex::encode(buf)
}
