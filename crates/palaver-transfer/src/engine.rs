//! The transfer engine actor.
//!
//! One task owns the session table and routes commands, inbound
//! negotiation events and per-session outcomes. Each active transfer runs
//! in its own task that owns the peer connection end to end; the engine
//! talks to it over an unbounded control channel and hears back on a
//! shared session-event channel.
//!
//! Routing: the offer creates the receiving session and is keyed by
//! transfer id; answers, candidates and rejections carry no id on the
//! wire and are routed by peer, preferring the direction that expects
//! them and falling back to the newest live session for determinism.
//!
//! An incoming offer is answered immediately so negotiation never waits
//! on the user; only data consumption is gated on accept or reject.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use palaver_shared::constants::{
    BACKPRESSURE_FACTOR, BACKPRESSURE_POLL, CHUNK_SIZE, MAX_FILE_SIZE,
};
use palaver_shared::model::FileInfo;
use palaver_shared::protocol::{ClientEvent, ServerEvent, SignalKind, SignalMessage};
use palaver_shared::types::{TransferDirection, TransferId, UserId};
use palaver_signal::SignalHandle;

use crate::frames::{ControlMessage, Frame};
use crate::peer::{ChannelError, DataChannel, PeerConnection, PeerConnector};
use crate::session::{TransferProgress, TransferState, TransferSummary};

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub chunk_size: usize,
    /// Flow control threshold, as a multiple of `chunk_size`.
    pub backpressure_factor: usize,
    pub backpressure_poll: Duration,
    pub max_file_size: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            backpressure_factor: BACKPRESSURE_FACTOR,
            backpressure_poll: BACKPRESSURE_POLL,
            max_file_size: MAX_FILE_SIZE,
        }
    }
}

impl TransferConfig {
    fn backpressure_threshold(&self) -> usize {
        self.chunk_size * self.backpressure_factor
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("file exceeds the {limit} byte transfer limit")]
    TooLarge { limit: u64 },

    #[error("transfer engine is not running")]
    EngineClosed,
}

#[derive(Debug, Clone)]
pub enum TransferNotification {
    /// A peer offered a file; accept or reject by transfer id.
    Incoming {
        transfer_id: TransferId,
        from: UserId,
        file_info: FileInfo,
    },
    Progress(TransferProgress),
    /// `data` is populated for downloads, `None` for uploads.
    Completed {
        transfer_id: TransferId,
        peer: UserId,
        file_info: FileInfo,
        data: Option<Bytes>,
    },
    Rejected {
        transfer_id: TransferId,
        peer: UserId,
        reason: Option<String>,
    },
    Failed {
        transfer_id: TransferId,
        peer: UserId,
        reason: String,
    },
}

enum Command {
    SendFile {
        transfer_id: TransferId,
        peer: UserId,
        file_info: FileInfo,
        data: Bytes,
    },
    Accept { transfer_id: TransferId },
    Reject { transfer_id: TransferId },
    Cancel { transfer_id: TransferId },
    Sessions { reply: oneshot::Sender<Vec<TransferSummary>> },
    Shutdown,
}

#[derive(Clone)]
pub struct TransferHandle {
    cmd_tx: mpsc::Sender<Command>,
    config: TransferConfig,
}

impl TransferHandle {
    /// Offer `data` to `peer`. The returned id identifies the transfer in
    /// every subsequent notification.
    pub async fn send_file(
        &self,
        peer: UserId,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        data: Bytes,
    ) -> Result<TransferId, TransferError> {
        let size = data.len() as u64;
        if size > self.config.max_file_size {
            return Err(TransferError::TooLarge {
                limit: self.config.max_file_size,
            });
        }
        let transfer_id = TransferId::new();
        let file_info = FileInfo {
            name: name.into(),
            size,
            mime_type: mime_type.into(),
        };
        self.cmd_tx
            .send(Command::SendFile {
                transfer_id,
                peer,
                file_info,
                data,
            })
            .await
            .map_err(|_| TransferError::EngineClosed)?;
        Ok(transfer_id)
    }

    pub async fn accept(&self, transfer_id: TransferId) {
        self.send(Command::Accept { transfer_id }).await;
    }

    pub async fn reject(&self, transfer_id: TransferId) {
        self.send(Command::Reject { transfer_id }).await;
    }

    pub async fn cancel(&self, transfer_id: TransferId) {
        self.send(Command::Cancel { transfer_id }).await;
    }

    pub async fn sessions(&self) -> Result<Vec<TransferSummary>, TransferError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Sessions { reply }).await;
        rx.await.map_err(|_| TransferError::EngineClosed)
    }

    pub async fn shutdown(&self) {
        self.send(Command::Shutdown).await;
    }

    async fn send(&self, cmd: Command) {
        if self.cmd_tx.send(cmd).await.is_err() {
            warn!("transfer engine is gone, dropping command");
        }
    }
}

/// Spawn the transfer engine. Returns the command handle and the
/// notification stream.
pub fn spawn_transfer(
    connector: Arc<dyn PeerConnector>,
    signal: SignalHandle,
    config: TransferConfig,
) -> (TransferHandle, mpsc::Receiver<TransferNotification>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (notify_tx, notify_rx) = mpsc::channel(256);
    let (session_tx, session_rx) = mpsc::channel(256);

    let engine = Engine {
        connector,
        signal: signal.clone(),
        config: config.clone(),
        local_user: None,
        sessions: HashMap::new(),
        next_seq: 0,
        notify_tx,
        session_tx,
    };
    tokio::spawn(engine.run(cmd_rx, session_rx, signal));

    (TransferHandle { cmd_tx, config }, notify_rx)
}

/// Control input to a running session task.
enum SessionSignal {
    Answer(String),
    Ice(String),
    RemoteReject(Option<String>),
    /// Local user accepted the incoming offer; start consuming data.
    Accept,
    Cancel,
}

/// Outcome stream from session tasks back to the engine.
enum SessionEvent {
    Negotiated { transfer_id: TransferId },
    Progress(TransferProgress),
    Completed { transfer_id: TransferId, data: Option<Bytes> },
    Rejected { transfer_id: TransferId, reason: Option<String> },
    Failed { transfer_id: TransferId, reason: String },
}

/// How a session flow ended short of completion.
enum SessionEnd {
    Rejected(Option<String>),
    Failed(String),
}

impl From<ChannelError> for SessionEnd {
    fn from(e: ChannelError) -> Self {
        SessionEnd::Failed(e.to_string())
    }
}

struct SessionEntry {
    peer: UserId,
    direction: TransferDirection,
    state: TransferState,
    file_info: FileInfo,
    ctrl: mpsc::UnboundedSender<SessionSignal>,
    /// Creation order; directionless signals go to the newest session.
    seq: u64,
}

struct Engine {
    connector: Arc<dyn PeerConnector>,
    signal: SignalHandle,
    config: TransferConfig,
    local_user: Option<UserId>,
    sessions: HashMap<TransferId, SessionEntry>,
    next_seq: u64,
    notify_tx: mpsc::Sender<TransferNotification>,
    session_tx: mpsc::Sender<SessionEvent>,
}

impl Engine {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut session_rx: mpsc::Receiver<SessionEvent>,
        signal: SignalHandle,
    ) {
        let mut events_rx = signal.events();
        let mut events_open = true;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle_command(cmd).await {
                            break;
                        }
                    }
                    None => break,
                },
                event = events_rx.recv(), if events_open => match event {
                    Ok(event) => self.handle_server_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "transfer engine lagged behind signaling events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        events_open = false;
                    }
                },
                session = session_rx.recv() => {
                    if let Some(session) = session {
                        self.handle_session_event(session).await;
                    }
                },
            }
        }

        // Stop every in-flight session before exiting.
        for entry in self.sessions.values() {
            let _ = entry.ctrl.send(SessionSignal::Cancel);
        }
        debug!("transfer engine terminated");
    }

    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::SendFile {
                transfer_id,
                peer,
                file_info,
                data,
            } => {
                self.start_upload(transfer_id, peer, file_info, data).await;
                true
            }
            Command::Accept { transfer_id } => {
                self.accept(transfer_id).await;
                true
            }
            Command::Reject { transfer_id } => {
                self.reject(transfer_id).await;
                true
            }
            Command::Cancel { transfer_id } => {
                self.cancel(transfer_id).await;
                true
            }
            Command::Sessions { reply } => {
                let summaries = self
                    .sessions
                    .iter()
                    .map(|(id, e)| TransferSummary {
                        transfer_id: *id,
                        peer: e.peer.clone(),
                        direction: e.direction,
                        state: e.state,
                        file_info: e.file_info.clone(),
                    })
                    .collect();
                let _ = reply.send(summaries);
                true
            }
            Command::Shutdown => false,
        }
    }

    async fn start_upload(
        &mut self,
        transfer_id: TransferId,
        peer: UserId,
        file_info: FileInfo,
        data: Bytes,
    ) {
        let Some(local) = self.local_user.clone() else {
            self.notify(TransferNotification::Failed {
                transfer_id,
                peer,
                reason: "signaling session not established".into(),
            })
            .await;
            return;
        };

        info!(transfer = %transfer_id, peer = %peer, size = file_info.size, "starting upload");
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.sessions.insert(
            transfer_id,
            SessionEntry {
                peer: peer.clone(),
                direction: TransferDirection::Upload,
                state: TransferState::Pending,
                file_info: file_info.clone(),
                ctrl: ctrl_tx,
                seq,
            },
        );

        tokio::spawn(run_sender(
            transfer_id,
            peer,
            local,
            file_info,
            data,
            self.connector.clone(),
            self.signal.clone(),
            self.config.clone(),
            ctrl_rx,
            self.session_tx.clone(),
        ));
    }

    async fn accept(&mut self, transfer_id: TransferId) {
        let Some(entry) = self.sessions.get(&transfer_id) else {
            warn!(transfer = %transfer_id, "accept for unknown transfer");
            return;
        };
        if entry.direction != TransferDirection::Download || entry.state != TransferState::Pending {
            warn!(transfer = %transfer_id, state = ?entry.state, "accept not applicable");
            return;
        }

        info!(transfer = %transfer_id, peer = %entry.peer, "accepting incoming transfer");
        let _ = entry.ctrl.send(SessionSignal::Accept);
    }

    async fn reject(&mut self, transfer_id: TransferId) {
        let Some(entry) = self.sessions.get_mut(&transfer_id) else {
            warn!(transfer = %transfer_id, "reject for unknown transfer");
            return;
        };
        if entry.state.is_terminal() {
            return;
        }

        entry.state = TransferState::Rejected;
        let _ = entry.ctrl.send(SessionSignal::Cancel);
        let peer = entry.peer.clone();

        if let Some(local) = self.local_user.clone() {
            self.signal
                .emit(
                    SignalMessage {
                        from: local,
                        target: peer.clone(),
                        kind: SignalKind::Reject { reason: None },
                    }
                    .into_client_event(),
                )
                .await;
        }
        self.notify(TransferNotification::Rejected {
            transfer_id,
            peer,
            reason: None,
        })
        .await;
    }

    async fn cancel(&mut self, transfer_id: TransferId) {
        let Some(entry) = self.sessions.get(&transfer_id) else {
            warn!(transfer = %transfer_id, "cancel for unknown transfer");
            return;
        };
        if entry.state.is_terminal() {
            return;
        }

        // The session task tears the connection down and reports the
        // failure back; the wire reject ends the remote side even when
        // no channel exists yet.
        let _ = entry.ctrl.send(SessionSignal::Cancel);
        let peer = entry.peer.clone();
        if let Some(local) = self.local_user.clone() {
            self.signal
                .emit(
                    SignalMessage {
                        from: local,
                        target: peer,
                        kind: SignalKind::Reject {
                            reason: Some("transfer cancelled".into()),
                        },
                    }
                    .into_client_event(),
                )
                .await;
        }
    }

    async fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Connected { user_id, .. } => {
                self.local_user = Some(user_id);
            }
            ServerEvent::FileRequest {
                from_user_id,
                transfer_id,
                ..
            } => {
                // Announcement only; the offer creates the session.
                debug!(transfer = %transfer_id, from = %from_user_id, "file request announced");
            }
            ServerEvent::WebrtcOffer(signal) => self.handle_offer(signal).await,
            ServerEvent::WebrtcAnswer(signal) => {
                let SignalKind::Answer { sdp } = signal.kind else {
                    return;
                };
                self.route(&signal.from, Some(TransferDirection::Upload), SessionSignal::Answer(sdp));
            }
            ServerEvent::WebrtcIceCandidate(signal) => {
                let SignalKind::IceCandidate { candidate } = signal.kind else {
                    return;
                };
                self.route(&signal.from, None, SessionSignal::Ice(candidate));
            }
            ServerEvent::WebrtcRejected(signal) => {
                let SignalKind::Reject { reason } = signal.kind else {
                    return;
                };
                self.route(
                    &signal.from,
                    Some(TransferDirection::Upload),
                    SessionSignal::RemoteReject(reason),
                );
            }
            _ => {}
        }
    }

    async fn handle_offer(&mut self, signal: SignalMessage) {
        let SignalKind::Offer {
            transfer_id,
            sdp,
            file_info,
        } = signal.kind
        else {
            return;
        };
        if self.sessions.contains_key(&transfer_id) {
            debug!(transfer = %transfer_id, "duplicate offer, ignoring");
            return;
        }
        let Some(local) = self.local_user.clone() else {
            debug!(transfer = %transfer_id, "offer before signaling session, dropping");
            return;
        };

        info!(transfer = %transfer_id, from = %signal.from, name = %file_info.name, "incoming transfer offer");
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.sessions.insert(
            transfer_id,
            SessionEntry {
                peer: signal.from.clone(),
                direction: TransferDirection::Download,
                state: TransferState::Pending,
                file_info: file_info.clone(),
                ctrl: ctrl_tx,
                seq,
            },
        );

        // Answer right away; the session task holds the channel shut
        // until the user accepts.
        tokio::spawn(run_receiver(
            transfer_id,
            signal.from.clone(),
            local,
            file_info.clone(),
            sdp,
            self.connector.clone(),
            self.signal.clone(),
            ctrl_rx,
            self.session_tx.clone(),
        ));

        self.notify(TransferNotification::Incoming {
            transfer_id,
            from: signal.from,
            file_info,
        })
        .await;
    }

    /// Route a directionless negotiation message to a live session with
    /// this peer: the direction that expects it wins, otherwise the
    /// newest session. Sorting by creation sequence keeps the fallback
    /// deterministic when both directions are live.
    fn route(&mut self, peer: &UserId, prefer: Option<TransferDirection>, signal: SessionSignal) {
        let Some(id) = self.route_key(peer, prefer) else {
            debug!(peer = %peer, "negotiation message with no matching session");
            return;
        };
        if let Some(entry) = self.sessions.get(&id) {
            let _ = entry.ctrl.send(signal);
        }
    }

    fn route_key(&self, peer: &UserId, prefer: Option<TransferDirection>) -> Option<TransferId> {
        let mut live: Vec<(&TransferId, &SessionEntry)> = self
            .sessions
            .iter()
            .filter(|(_, e)| &e.peer == peer && !e.state.is_terminal())
            .collect();
        live.sort_by_key(|(_, e)| std::cmp::Reverse(e.seq));
        if let Some(direction) = prefer {
            if let Some((id, _)) = live.iter().find(|(_, e)| e.direction == direction) {
                return Some(**id);
            }
        }
        live.first().map(|(id, _)| **id)
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Negotiated { transfer_id } => {
                if let Some(entry) = self.sessions.get_mut(&transfer_id) {
                    if !entry.state.is_terminal() {
                        entry.state = TransferState::Connecting;
                    }
                }
            }
            SessionEvent::Progress(progress) => {
                if let Some(entry) = self.sessions.get_mut(&progress.transfer_id) {
                    if entry.state.is_terminal() {
                        return;
                    }
                    entry.state = TransferState::Transferring;
                }
                self.notify(TransferNotification::Progress(progress)).await;
            }
            SessionEvent::Completed { transfer_id, data } => {
                let Some(entry) = self.sessions.get_mut(&transfer_id) else {
                    return;
                };
                entry.state = TransferState::Completed;
                let (peer, file_info) = (entry.peer.clone(), entry.file_info.clone());
                info!(transfer = %transfer_id, peer = %peer, "transfer completed");
                self.notify(TransferNotification::Completed {
                    transfer_id,
                    peer,
                    file_info,
                    data,
                })
                .await;
            }
            SessionEvent::Rejected { transfer_id, reason } => {
                let Some(entry) = self.sessions.get_mut(&transfer_id) else {
                    return;
                };
                if entry.state.is_terminal() {
                    return;
                }
                entry.state = TransferState::Rejected;
                let peer = entry.peer.clone();
                self.notify(TransferNotification::Rejected {
                    transfer_id,
                    peer,
                    reason,
                })
                .await;
            }
            SessionEvent::Failed { transfer_id, reason } => {
                let Some(entry) = self.sessions.get_mut(&transfer_id) else {
                    return;
                };
                if entry.state.is_terminal() {
                    return;
                }
                entry.state = TransferState::Failed;
                let peer = entry.peer.clone();
                warn!(transfer = %transfer_id, peer = %peer, reason = %reason, "transfer failed");
                self.notify(TransferNotification::Failed {
                    transfer_id,
                    peer,
                    reason,
                })
                .await;
            }
        }
    }

    async fn notify(&self, notification: TransferNotification) {
        let _ = self.notify_tx.send(notification).await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_sender(
    transfer_id: TransferId,
    peer: UserId,
    local: UserId,
    file_info: FileInfo,
    data: Bytes,
    connector: Arc<dyn PeerConnector>,
    signal: SignalHandle,
    config: TransferConfig,
    mut ctrl: mpsc::UnboundedReceiver<SessionSignal>,
    events: mpsc::Sender<SessionEvent>,
) {
    let outcome = match connector.new_connection().await {
        Ok(conn) => {
            let outcome = sender_flow(
                transfer_id, &peer, &local, &file_info, &data, conn.as_ref(), &signal, &config,
                &mut ctrl, &events,
            )
            .await;
            // Closed on every exit, so the remote side never waits on a
            // dead pipe.
            conn.close().await;
            outcome
        }
        Err(e) => Err(e.into()),
    };
    let event = match outcome {
        Ok(()) => SessionEvent::Completed {
            transfer_id,
            data: None,
        },
        Err(SessionEnd::Rejected(reason)) => SessionEvent::Rejected { transfer_id, reason },
        Err(SessionEnd::Failed(reason)) => SessionEvent::Failed { transfer_id, reason },
    };
    let _ = events.send(event).await;
}

#[allow(clippy::too_many_arguments)]
async fn sender_flow(
    transfer_id: TransferId,
    peer: &UserId,
    local: &UserId,
    file_info: &FileInfo,
    data: &Bytes,
    conn: &dyn PeerConnection,
    signal: &SignalHandle,
    config: &TransferConfig,
    ctrl: &mut mpsc::UnboundedReceiver<SessionSignal>,
    events: &mpsc::Sender<SessionEvent>,
) -> Result<(), SessionEnd> {
    // Announce before offering so the peer can present the request even
    // if its WebRTC stack is slow to spin up.
    signal
        .emit(ClientEvent::FileRequest {
            target_user_id: peer.clone(),
            transfer_id,
            file_info: file_info.clone(),
        })
        .await;

    let offer = conn.create_offer().await?;
    signal
        .emit(
            SignalMessage {
                from: local.clone(),
                target: peer.clone(),
                kind: SignalKind::Offer {
                    transfer_id,
                    sdp: offer,
                    file_info: file_info.clone(),
                },
            }
            .into_client_event(),
        )
        .await;

    let mut candidates = conn.take_candidates();
    loop {
        tokio::select! {
            signal_in = ctrl.recv() => match signal_in {
                Some(SessionSignal::Answer(sdp)) => {
                    conn.apply_answer(&sdp).await?;
                    break;
                }
                Some(SessionSignal::Ice(candidate)) => {
                    conn.add_remote_candidate(&candidate).await?;
                }
                Some(SessionSignal::RemoteReject(reason)) => {
                    return Err(SessionEnd::Rejected(reason));
                }
                Some(SessionSignal::Cancel) | None => {
                    return Err(SessionEnd::Failed("transfer cancelled".into()));
                }
                Some(SessionSignal::Accept) => {}
            },
            candidate = next_candidate(&mut candidates) => match candidate {
                Some(candidate) => {
                    signal
                        .emit(
                            SignalMessage {
                                from: local.clone(),
                                target: peer.clone(),
                                kind: SignalKind::IceCandidate { candidate },
                            }
                            .into_client_event(),
                        )
                        .await;
                }
                None => candidates = None,
            },
        }
    }
    let _ = events.send(SessionEvent::Negotiated { transfer_id }).await;

    // The channel opens once the receiver accepts; keep servicing
    // negotiation and cancellation while it is pending.
    let mut open = conn.open_channel();
    let channel = loop {
        tokio::select! {
            opened = &mut open => break opened?,
            signal_in = ctrl.recv() => match signal_in {
                Some(SessionSignal::Ice(candidate)) => {
                    conn.add_remote_candidate(&candidate).await?;
                }
                Some(SessionSignal::RemoteReject(reason)) => {
                    return Err(SessionEnd::Rejected(reason));
                }
                Some(SessionSignal::Cancel) | None => {
                    return Err(SessionEnd::Failed("transfer cancelled".into()));
                }
                Some(_) => {}
            },
            candidate = next_candidate(&mut candidates) => match candidate {
                Some(candidate) => {
                    signal
                        .emit(
                            SignalMessage {
                                from: local.clone(),
                                target: peer.clone(),
                                kind: SignalKind::IceCandidate { candidate },
                            }
                            .into_client_event(),
                        )
                        .await;
                }
                None => candidates = None,
            },
        }
    };
    let metadata = ControlMessage::metadata(file_info, config.chunk_size)
        .to_frame()
        .map_err(|e| SessionEnd::Failed(e.to_string()))?;
    channel.send(metadata).await?;

    pump_chunks(
        channel.as_ref(),
        data,
        config,
        ctrl,
        transfer_id,
        peer,
        TransferDirection::Upload,
        events,
    )
    .await?;

    channel
        .send(
            ControlMessage::Complete
                .to_frame()
                .map_err(|e| SessionEnd::Failed(e.to_string()))?,
        )
        .await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_receiver(
    transfer_id: TransferId,
    peer: UserId,
    local: UserId,
    file_info: FileInfo,
    offer: String,
    connector: Arc<dyn PeerConnector>,
    signal: SignalHandle,
    mut ctrl: mpsc::UnboundedReceiver<SessionSignal>,
    events: mpsc::Sender<SessionEvent>,
) {
    let outcome = match connector.new_connection().await {
        Ok(conn) => {
            let outcome = receiver_flow(
                transfer_id,
                &peer,
                &local,
                &file_info,
                &offer,
                conn.as_ref(),
                &signal,
                &mut ctrl,
                &events,
            )
            .await;
            conn.close().await;
            outcome
        }
        Err(e) => Err(e.into()),
    };
    let event = match outcome {
        Ok(data) => SessionEvent::Completed {
            transfer_id,
            data: Some(data),
        },
        Err(SessionEnd::Rejected(reason)) => SessionEvent::Rejected { transfer_id, reason },
        Err(SessionEnd::Failed(reason)) => SessionEvent::Failed { transfer_id, reason },
    };
    let _ = events.send(event).await;
}

#[allow(clippy::too_many_arguments)]
async fn receiver_flow(
    transfer_id: TransferId,
    peer: &UserId,
    local: &UserId,
    file_info: &FileInfo,
    offer: &str,
    conn: &dyn PeerConnection,
    signal: &SignalHandle,
    ctrl: &mut mpsc::UnboundedReceiver<SessionSignal>,
    events: &mpsc::Sender<SessionEvent>,
) -> Result<Bytes, SessionEnd> {
    // Answer immediately; the user decision only gates whether data
    // starts flowing.
    let answer = conn.accept_offer(offer).await?;
    signal
        .emit(
            SignalMessage {
                from: local.clone(),
                target: peer.clone(),
                kind: SignalKind::Answer { sdp: answer },
            }
            .into_client_event(),
        )
        .await;

    // Await the accept, keeping negotiation serviced.
    let mut candidates = conn.take_candidates();
    loop {
        tokio::select! {
            signal_in = ctrl.recv() => match signal_in {
                Some(SessionSignal::Accept) => break,
                Some(SessionSignal::Ice(candidate)) => {
                    conn.add_remote_candidate(&candidate).await?;
                }
                Some(SessionSignal::RemoteReject(reason)) => {
                    return Err(SessionEnd::Failed(
                        reason.unwrap_or_else(|| "cancelled by peer".into()),
                    ));
                }
                Some(SessionSignal::Cancel) | None => {
                    return Err(SessionEnd::Failed("transfer cancelled".into()));
                }
                Some(SessionSignal::Answer(_)) => {}
            },
            candidate = next_candidate(&mut candidates) => match candidate {
                Some(candidate) => {
                    signal
                        .emit(
                            SignalMessage {
                                from: local.clone(),
                                target: peer.clone(),
                                kind: SignalKind::IceCandidate { candidate },
                            }
                            .into_client_event(),
                        )
                        .await;
                }
                None => candidates = None,
            },
        }
    }

    let _ = events.send(SessionEvent::Negotiated { transfer_id }).await;
    let mut open = conn.open_channel();
    let channel = loop {
        tokio::select! {
            opened = &mut open => break opened?,
            signal_in = ctrl.recv() => match signal_in {
                Some(SessionSignal::Ice(candidate)) => {
                    conn.add_remote_candidate(&candidate).await?;
                }
                Some(SessionSignal::RemoteReject(reason)) => {
                    return Err(SessionEnd::Failed(
                        reason.unwrap_or_else(|| "cancelled by peer".into()),
                    ));
                }
                Some(SessionSignal::Cancel) | None => {
                    return Err(SessionEnd::Failed("transfer cancelled".into()));
                }
                Some(_) => {}
            },
            candidate = next_candidate(&mut candidates) => match candidate {
                Some(candidate) => {
                    signal
                        .emit(
                            SignalMessage {
                                from: local.clone(),
                                target: peer.clone(),
                                kind: SignalKind::IceCandidate { candidate },
                            }
                            .into_client_event(),
                        )
                        .await;
                }
                None => candidates = None,
            },
        }
    };

    let mut expected_size = file_info.size;
    let mut received = BytesMut::with_capacity(file_info.size as usize);
    loop {
        tokio::select! {
            frame = channel.recv() => match frame? {
                Frame::Text(text) => {
                    match ControlMessage::parse(&text)
                        .map_err(|e| SessionEnd::Failed(e.to_string()))?
                    {
                        ControlMessage::Metadata { size, .. } => expected_size = size,
                        ControlMessage::Complete => break,
                    }
                }
                Frame::Binary(chunk) => {
                    received.extend_from_slice(&chunk);
                    let _ = events
                        .send(SessionEvent::Progress(TransferProgress {
                            transfer_id,
                            peer: peer.clone(),
                            direction: TransferDirection::Download,
                            bytes_transferred: received.len() as u64,
                            total_bytes: expected_size,
                        }))
                        .await;
                }
            },
            signal_in = ctrl.recv() => match signal_in {
                Some(SessionSignal::Ice(candidate)) => {
                    conn.add_remote_candidate(&candidate).await?;
                }
                Some(SessionSignal::RemoteReject(reason)) => {
                    return Err(SessionEnd::Failed(
                        reason.unwrap_or_else(|| "cancelled by peer".into()),
                    ));
                }
                Some(SessionSignal::Cancel) | None => {
                    return Err(SessionEnd::Failed("transfer cancelled".into()));
                }
                Some(_) => {}
            },
            candidate = next_candidate(&mut candidates) => match candidate {
                Some(candidate) => {
                    signal
                        .emit(
                            SignalMessage {
                                from: local.clone(),
                                target: peer.clone(),
                                kind: SignalKind::IceCandidate { candidate },
                            }
                            .into_client_event(),
                        )
                        .await;
                }
                None => candidates = None,
            },
        }
    }

    if received.len() as u64 != expected_size {
        return Err(SessionEnd::Failed(format!(
            "incomplete transfer: got {} of {} bytes",
            received.len(),
            expected_size
        )));
    }
    Ok(received.freeze())
}

async fn next_candidate(rx: &mut Option<mpsc::UnboundedReceiver<String>>) -> Option<String> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Stream `data` as chunk-sized binary frames, deferring while the
/// channel's buffered amount sits above the flow-control threshold.
#[allow(clippy::too_many_arguments)]
async fn pump_chunks(
    channel: &dyn DataChannel,
    data: &Bytes,
    config: &TransferConfig,
    ctrl: &mut mpsc::UnboundedReceiver<SessionSignal>,
    transfer_id: TransferId,
    peer: &UserId,
    direction: TransferDirection,
    events: &mpsc::Sender<SessionEvent>,
) -> Result<(), SessionEnd> {
    let threshold = config.backpressure_threshold();
    let total = data.len() as u64;
    let mut offset = 0usize;

    while offset < data.len() {
        while channel.buffered_amount() > threshold {
            drain_ctrl(ctrl)?;
            tokio::time::sleep(config.backpressure_poll).await;
        }
        drain_ctrl(ctrl)?;

        let end = (offset + config.chunk_size).min(data.len());
        channel.send(Frame::Binary(data.slice(offset..end))).await?;
        offset = end;

        let _ = events
            .send(SessionEvent::Progress(TransferProgress {
                transfer_id,
                peer: peer.clone(),
                direction,
                bytes_transferred: offset as u64,
                total_bytes: total,
            }))
            .await;
    }
    Ok(())
}

fn drain_ctrl(ctrl: &mut mpsc::UnboundedReceiver<SessionSignal>) -> Result<(), SessionEnd> {
    loop {
        match ctrl.try_recv() {
            Ok(SessionSignal::Cancel) => {
                return Err(SessionEnd::Failed("transfer cancelled".into()));
            }
            Ok(SessionSignal::RemoteReject(reason)) => {
                return Err(SessionEnd::Rejected(reason));
            }
            // Late candidates are harmless once the channel is up.
            Ok(_) => continue,
            Err(mpsc::error::TryRecvError::Empty) => return Ok(()),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                return Err(SessionEnd::Failed("transfer cancelled".into()));
            }
        }
    }
}
