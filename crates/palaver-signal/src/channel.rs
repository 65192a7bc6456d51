//! Signaling channel actor.
//!
//! One tokio task owns the transport. Callers hold a [`SignalHandle`]:
//! commands go in through an mpsc channel, inbound events fan out on a
//! broadcast channel, and connection transitions are observable through a
//! watch channel so dependents can rejoin rooms after a reconnect.
//!
//! Connection errors never surface to callers as `Err`: they flip the
//! observable state and the actor retries under bounded exponential
//! backoff. There is no message-level retry here; loss is handled by the
//! layers above.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use palaver_shared::constants::{MIN_CREDENTIAL_LEN, RECONNECT_BASE, RECONNECT_CAP};
use palaver_shared::protocol::{ClientEvent, ServerEvent};

use crate::backoff::Backoff;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
}

#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub min_credential_len: usize,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            min_credential_len: MIN_CREDENTIAL_LEN,
            reconnect_base: RECONNECT_BASE,
            reconnect_cap: RECONNECT_CAP,
        }
    }
}

#[derive(Debug)]
enum Command {
    Connect { credential: Option<String> },
    Disconnect,
    Emit(ClientEvent),
    Shutdown,
}

/// Handle to the channel actor. Cloneable; all clones address the same
/// connection.
#[derive(Clone)]
pub struct SignalHandle {
    cmd_tx: mpsc::Sender<Command>,
    events: broadcast::Sender<ServerEvent>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl SignalHandle {
    /// Connect, optionally with an explicit bearer credential. Idempotent:
    /// a no-op while already connected. Malformed (too short) credentials
    /// are treated as absent so the transport falls back to ambient
    /// authentication.
    pub async fn connect(&self, credential: Option<&str>) {
        self.send(Command::Connect {
            credential: credential.map(String::from),
        })
        .await;
    }

    /// Release the connection and stop reconnecting.
    pub async fn disconnect(&self) {
        self.send(Command::Disconnect).await;
    }

    /// Fire-and-forget emit. Failures are logged and surface only as
    /// connection-state changes.
    pub async fn emit(&self, event: ClientEvent) {
        self.send(Command::Emit(event)).await;
    }

    /// Subscribe to inbound server events.
    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Observe connected/disconnected transitions.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.state_rx.borrow() == ConnectionState::Connected
    }

    /// Stop the actor. Further commands are dropped.
    pub async fn shutdown(&self) {
        self.send(Command::Shutdown).await;
    }

    async fn send(&self, cmd: Command) {
        if self.cmd_tx.send(cmd).await.is_err() {
            warn!("signal channel actor is gone, dropping command");
        }
    }
}

/// Spawn the channel actor over `transport`.
pub fn spawn_channel(transport: Arc<dyn Transport>, config: SignalConfig) -> SignalHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let (events_tx, _) = broadcast::channel(256);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

    let actor = Actor {
        transport,
        config: config.clone(),
        events: events_tx.clone(),
        state_tx,
        backoff: Backoff::new(config.reconnect_base, config.reconnect_cap),
        desired: false,
        live: false,
        credential: None,
    };
    tokio::spawn(actor.run(cmd_rx));

    SignalHandle {
        cmd_tx,
        events: events_tx,
        state_rx,
    }
}

struct Actor {
    transport: Arc<dyn Transport>,
    config: SignalConfig,
    events: broadcast::Sender<ServerEvent>,
    state_tx: watch::Sender<ConnectionState>,
    backoff: Backoff,
    /// Whether the caller wants the connection up.
    desired: bool,
    /// Whether the transport link is currently up.
    live: bool,
    credential: Option<String>,
}

impl Actor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        loop {
            if self.live {
                tokio::select! {
                    cmd = cmd_rx.recv() => {
                        if !self.handle_command(cmd).await {
                            break;
                        }
                    }
                    inbound = self.transport.recv() => match inbound {
                        Ok(bytes) => self.dispatch(&bytes),
                        Err(e) => {
                            warn!(error = %e, "signaling connection lost");
                            self.mark_down();
                            self.backoff.reset();
                        }
                    }
                }
            } else if self.desired {
                let delay = self.backoff.next_delay();
                tokio::select! {
                    cmd = cmd_rx.recv() => {
                        if !self.handle_command(cmd).await {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {
                        match self.transport.connect(self.credential.clone()).await {
                            Ok(()) => {
                                info!("signaling connected");
                                self.live = true;
                                self.backoff.reset();
                                self.state_tx.send_replace(ConnectionState::Connected);
                            }
                            Err(e) => {
                                warn!(error = %e, "signaling connect failed, will retry");
                            }
                        }
                    }
                }
            } else {
                let cmd = cmd_rx.recv().await;
                if !self.handle_command(cmd).await {
                    break;
                }
            }
        }

        debug!("signal channel actor terminated");
    }

    /// Returns false when the actor should stop.
    async fn handle_command(&mut self, cmd: Option<Command>) -> bool {
        match cmd {
            Some(Command::Connect { credential }) => {
                if self.live {
                    debug!("already connected, ignoring connect");
                    return true;
                }
                self.credential =
                    sanitize_credential(credential, self.config.min_credential_len);
                self.desired = true;
                self.backoff.reset();
                true
            }
            Some(Command::Disconnect) => {
                self.desired = false;
                if self.live {
                    let _ = self.transport.close().await;
                }
                self.mark_down();
                true
            }
            Some(Command::Emit(event)) => {
                if !self.live {
                    warn!(?event, "not connected, dropping outbound event");
                    return true;
                }
                let bytes = match event.to_json() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(error = %e, "failed to serialize outbound event");
                        return true;
                    }
                };
                if let Err(e) = self.transport.send(&bytes).await {
                    warn!(error = %e, "send failed, treating connection as lost");
                    self.mark_down();
                    self.backoff.reset();
                }
                true
            }
            Some(Command::Shutdown) | None => {
                if self.live {
                    let _ = self.transport.close().await;
                }
                self.mark_down();
                false
            }
        }
    }

    fn dispatch(&self, bytes: &[u8]) {
        match ServerEvent::from_json(bytes) {
            Ok(event) => {
                // No receivers is fine; subscriptions come and go.
                let _ = self.events.send(event);
            }
            Err(e) => {
                warn!(error = %e, len = bytes.len(), "ignoring malformed inbound frame");
            }
        }
    }

    fn mark_down(&mut self) {
        self.live = false;
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }
}

/// Treat malformed or too-short credentials as absent rather than sending
/// them.
fn sanitize_credential(credential: Option<String>, min_len: usize) -> Option<String> {
    match credential {
        Some(c) if c.len() >= min_len => Some(c),
        Some(_) => {
            warn!("credential too short, falling back to ambient authentication");
            None
        }
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use palaver_shared::types::{ConversationId, UserId};
    use tokio::time::{advance, Duration};

    fn connected_event() -> ServerEvent {
        ServerEvent::Connected {
            user_id: UserId::from("alice"),
            server_time: chrono::Utc::now(),
        }
    }

    async fn settle() {
        // Let the actor process queued work under paused time.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn short_credential_is_discarded() {
        assert_eq!(sanitize_credential(Some("abc".into()), 16), None);
        let long = "a-sufficiently-long-token".to_string();
        assert_eq!(
            sanitize_credential(Some(long.clone()), 16),
            Some(long)
        );
        assert_eq!(sanitize_credential(None, 16), None);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent() {
        let transport = MockTransport::new();
        let handle = spawn_channel(Arc::new(transport.clone()), SignalConfig::default());

        handle.connect(None).await;
        settle().await;
        handle.connect(None).await;
        handle.connect(None).await;
        settle().await;

        assert_eq!(transport.connect_count(), 1);
        assert!(handle.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn short_credential_falls_back_to_ambient_auth() {
        let transport = MockTransport::new();
        let handle = spawn_channel(Arc::new(transport.clone()), SignalConfig::default());

        handle.connect(Some("abc")).await;
        settle().await;

        assert_eq!(transport.connect_count(), 1);
        assert_eq!(transport.last_credential(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn emit_while_disconnected_is_dropped() {
        let transport = MockTransport::new();
        let handle = spawn_channel(Arc::new(transport.clone()), SignalConfig::default());

        handle
            .emit(ClientEvent::JoinConversation {
                conversation_id: ConversationId::from("c1"),
            })
            .await;
        settle().await;

        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_events_are_broadcast() {
        let transport = MockTransport::new();
        let handle = spawn_channel(Arc::new(transport.clone()), SignalConfig::default());
        let mut events = handle.events();

        handle.connect(None).await;
        settle().await;
        transport.queue_event(connected_event());
        settle().await;

        let event = events.try_recv().unwrap();
        assert!(matches!(event, ServerEvent::Connected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_are_ignored() {
        let transport = MockTransport::new();
        let handle = spawn_channel(Arc::new(transport.clone()), SignalConfig::default());
        let mut events = handle.events();

        handle.connect(None).await;
        settle().await;
        transport.queue_raw(b"not json".to_vec());
        transport.queue_event(connected_event());
        settle().await;

        // Only the valid event comes through.
        assert!(matches!(
            events.try_recv().unwrap(),
            ServerEvent::Connected { .. }
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_with_backoff_after_drop() {
        let transport = MockTransport::new();
        let handle = spawn_channel(Arc::new(transport.clone()), SignalConfig::default());

        handle.connect(None).await;
        settle().await;
        assert!(handle.is_connected());

        transport.drop_connection();
        settle().await;
        assert!(!handle.is_connected());

        // First retry is immediate, then backoff applies.
        advance(Duration::from_millis(1)).await;
        settle().await;
        assert!(handle.is_connected());
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_connect_succeeds() {
        let transport = MockTransport::new();
        let handle = spawn_channel(Arc::new(transport.clone()), SignalConfig::default());

        transport.fail_next_connect("unreachable");
        handle.connect(None).await;
        settle().await;
        assert!(!handle.is_connected());

        // Second attempt fires after the base delay.
        advance(Duration::from_millis(500)).await;
        settle().await;
        assert!(handle.is_connected());
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_stops_reconnection() {
        let transport = MockTransport::new();
        let handle = spawn_channel(Arc::new(transport.clone()), SignalConfig::default());

        handle.connect(None).await;
        settle().await;
        handle.disconnect().await;
        settle().await;

        transport.drop_connection();
        advance(Duration::from_secs(60)).await;
        settle().await;

        assert!(!handle.is_connected());
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn emit_serializes_onto_transport() {
        let transport = MockTransport::new();
        let handle = spawn_channel(Arc::new(transport.clone()), SignalConfig::default());

        handle.connect(None).await;
        settle().await;
        let event = ClientEvent::Typing {
            conversation_id: ConversationId::from("c1"),
            is_typing: true,
        };
        handle.emit(event.clone()).await;
        settle().await;

        assert_eq!(transport.sent_events(), vec![event]);
    }
}
