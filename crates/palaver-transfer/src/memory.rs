//! In-memory peer stack.
//!
//! Two connections rendezvous through a shared [`MemoryHub`] keyed by the
//! offer token, exactly like two clients meeting through a signaling
//! server, and end up holding the two ends of a paired channel. Used by
//! the test suites and by embedders running both peers in one process.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::frames::Frame;
use crate::peer::{ChannelError, DataChannel, PeerConnection, PeerConnector};

const ANSWER_PREFIX: &str = "mem-answer::";

#[derive(Default)]
struct Queue {
    frames: Mutex<VecDeque<Frame>>,
    /// Bytes pushed but not yet popped by the other end.
    buffered: AtomicUsize,
    closed: AtomicBool,
    notify: Notify,
}

/// Open rendezvous shared by both ends of a pair. A data channel is not
/// usable until both peers have opened it, matching the open event of a
/// real channel.
#[derive(Default)]
struct Gate {
    attached: AtomicUsize,
    notify: Notify,
}

/// One end of a paired channel.
pub struct MemoryChannel {
    tx: Arc<Queue>,
    rx: Arc<Queue>,
    gate: Arc<Gate>,
    /// Buffered level observed after each send, for flow-control tests.
    levels: Mutex<Vec<usize>>,
}

/// Create both ends of a channel.
pub fn channel_pair() -> (Arc<MemoryChannel>, Arc<MemoryChannel>) {
    let ab = Arc::new(Queue::default());
    let ba = Arc::new(Queue::default());
    let gate = Arc::new(Gate::default());
    let a = Arc::new(MemoryChannel {
        tx: ab.clone(),
        rx: ba.clone(),
        gate: gate.clone(),
        levels: Mutex::new(Vec::new()),
    });
    let b = Arc::new(MemoryChannel {
        tx: ba,
        rx: ab,
        gate,
        levels: Mutex::new(Vec::new()),
    });
    (a, b)
}

impl MemoryChannel {
    pub fn sent_buffered_levels(&self) -> Vec<usize> {
        self.levels.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn buffered_amount(&self) -> usize {
        self.tx.buffered.load(Ordering::SeqCst)
    }

    async fn send(&self, frame: Frame) -> Result<(), ChannelError> {
        if self.tx.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let len = frame.byte_len();
        self.tx.frames.lock().unwrap().push_back(frame);
        let level = self.tx.buffered.fetch_add(len, Ordering::SeqCst) + len;
        self.levels.lock().unwrap().push(level);
        self.tx.notify.notify_one();
        Ok(())
    }

    async fn recv(&self) -> Result<Frame, ChannelError> {
        loop {
            {
                let mut frames = self.rx.frames.lock().unwrap();
                if let Some(frame) = frames.pop_front() {
                    self.rx.buffered.fetch_sub(frame.byte_len(), Ordering::SeqCst);
                    return Ok(frame);
                }
            }
            // Drain fully before reporting the hangup.
            if self.rx.closed.load(Ordering::SeqCst) {
                return Err(ChannelError::Closed);
            }
            self.rx.notify.notified().await;
        }
    }

    async fn close(&self) {
        self.tx.closed.store(true, Ordering::SeqCst);
        self.rx.closed.store(true, Ordering::SeqCst);
        self.tx.notify.notify_one();
        self.rx.notify.notify_one();
    }
}

/// Shared rendezvous point for in-memory negotiation.
#[derive(Clone, Default)]
pub struct MemoryHub {
    slots: Arc<Mutex<HashMap<String, Arc<MemoryChannel>>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Default)]
struct ConnState {
    channel: Option<Arc<MemoryChannel>>,
    /// Set on the offerer so close can withdraw an unanswered offer.
    offer_token: Option<String>,
}

pub struct MemoryConnection {
    hub: MemoryHub,
    state: Mutex<ConnState>,
    candidate_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    candidate_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    remote_candidates: AtomicUsize,
}

impl MemoryConnection {
    fn new(hub: MemoryHub) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            hub,
            state: Mutex::new(ConnState::default()),
            candidate_tx: Mutex::new(Some(tx)),
            candidate_rx: Mutex::new(Some(rx)),
            remote_candidates: AtomicUsize::new(0),
        }
    }

    /// Emit one synthetic local candidate, then end the stream.
    fn gather(&self) {
        if let Some(tx) = self.candidate_tx.lock().unwrap().take() {
            let _ = tx.send("mem-candidate-0".to_string());
        }
    }

    pub fn remote_candidate_count(&self) -> usize {
        self.remote_candidates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for MemoryConnection {
    async fn create_offer(&self) -> Result<String, ChannelError> {
        let token = format!("mem-offer-{}", Uuid::new_v4());
        self.state.lock().unwrap().offer_token = Some(token.clone());
        self.gather();
        Ok(token)
    }

    async fn accept_offer(&self, offer: &str) -> Result<String, ChannelError> {
        let (offerer_end, our_end) = channel_pair();
        self.hub
            .slots
            .lock()
            .unwrap()
            .insert(offer.to_string(), offerer_end);
        self.state.lock().unwrap().channel = Some(our_end);
        self.gather();
        Ok(format!("{ANSWER_PREFIX}{offer}"))
    }

    async fn apply_answer(&self, answer: &str) -> Result<(), ChannelError> {
        let token = answer
            .strip_prefix(ANSWER_PREFIX)
            .ok_or_else(|| ChannelError::Negotiation("malformed answer".into()))?;
        let end = self
            .hub
            .slots
            .lock()
            .unwrap()
            .remove(token)
            .ok_or_else(|| ChannelError::Negotiation("unknown offer token".into()))?;
        self.state.lock().unwrap().channel = Some(end);
        Ok(())
    }

    async fn add_remote_candidate(&self, _candidate: &str) -> Result<(), ChannelError> {
        self.remote_candidates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn take_candidates(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.candidate_rx.lock().unwrap().take()
    }

    async fn open_channel(&self) -> Result<Arc<dyn DataChannel>, ChannelError> {
        let channel = self
            .state
            .lock()
            .unwrap()
            .channel
            .clone()
            .ok_or_else(|| ChannelError::Negotiation("channel not negotiated".into()))?;
        channel.gate.attached.fetch_add(1, Ordering::SeqCst);
        channel.gate.notify.notify_waiters();
        loop {
            let notified = channel.gate.notify.notified();
            if channel.gate.attached.load(Ordering::SeqCst) >= 2 {
                return Ok(channel.clone() as Arc<dyn DataChannel>);
            }
            notified.await;
        }
    }

    async fn close(&self) {
        let (channel, token) = {
            let state = self.state.lock().unwrap();
            (state.channel.clone(), state.offer_token.clone())
        };
        if let Some(channel) = channel {
            channel.close().await;
            return;
        }
        // Never answered; withdraw the offer so a late answer fails and
        // the parked end reads as hung up.
        if let Some(token) = token {
            let parked = self.hub.slots.lock().unwrap().remove(&token);
            if let Some(parked) = parked {
                parked.close().await;
            }
        }
    }
}

/// [`PeerConnector`] producing connections that meet through one hub.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    hub: MemoryHub,
}

impl MemoryConnector {
    pub fn new(hub: MemoryHub) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl PeerConnector for MemoryConnector {
    async fn new_connection(&self) -> Result<Box<dyn PeerConnection>, ChannelError> {
        Ok(Box::new(MemoryConnection::new(self.hub.clone())))
    }
}
