//! Mock transport for tests and embedders without a live server.
//!
//! Captures outbound events for verification and lets tests queue inbound
//! events, force failures and simulate connection drops.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use palaver_shared::protocol::{ClientEvent, ServerEvent};

use crate::transport::{Transport, TransportError};

#[derive(Default)]
struct MockState {
    connected: bool,
    connect_count: u32,
    credentials: Vec<Option<String>>,
    sent: Vec<Vec<u8>>,
    inbound: VecDeque<Result<Vec<u8>, TransportError>>,
    fail_next_connect: Option<String>,
    fail_next_send: Option<String>,
}

/// Mock transport; clones share state.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    notify: Arc<Notify>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an inbound event for the next `recv()`.
    pub fn queue_event(&self, event: ServerEvent) {
        let bytes = event.to_json().expect("server event serializes");
        self.state.lock().unwrap().inbound.push_back(Ok(bytes));
        self.notify.notify_one();
    }

    /// Queue raw inbound bytes (for malformed-frame tests).
    pub fn queue_raw(&self, data: Vec<u8>) {
        self.state.lock().unwrap().inbound.push_back(Ok(data));
        self.notify.notify_one();
    }

    /// Simulate the server dropping the connection: the next `recv()`
    /// returns `ConnectionClosed`.
    pub fn drop_connection(&self) {
        let mut state = self.state.lock().unwrap();
        state.connected = false;
        state.inbound.push_back(Err(TransportError::ConnectionClosed));
        self.notify.notify_one();
    }

    pub fn fail_next_connect(&self, error: &str) {
        self.state.lock().unwrap().fail_next_connect = Some(error.to_string());
    }

    pub fn fail_next_send(&self, error: &str) {
        self.state.lock().unwrap().fail_next_send = Some(error.to_string());
    }

    /// All captured outbound frames, parsed back into typed events.
    pub fn sent_events(&self) -> Vec<ClientEvent> {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter_map(|bytes| ClientEvent::from_json(bytes).ok())
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.state.lock().unwrap().sent.len()
    }

    pub fn connect_count(&self) -> u32 {
        self.state.lock().unwrap().connect_count
    }

    /// Credential supplied to the most recent `connect()`.
    pub fn last_credential(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .credentials
            .last()
            .cloned()
            .flatten()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, credential: Option<String>) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.connect_count += 1;
        state.credentials.push(credential);
        if let Some(error) = state.fail_next_connect.take() {
            return Err(TransportError::ConnectionFailed(error));
        }
        state.connected = true;
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if let Some(error) = state.fail_next_send.take() {
            return Err(TransportError::SendFailed(error));
        }
        state.sent.push(data.to_vec());
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(item) = state.inbound.pop_front() {
                    return item;
                }
                if !state.connected {
                    return Err(TransportError::NotConnected);
                }
            }
            self.notify.notified().await;
        }
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.state.lock().unwrap().connected = false;
        self.notify.notify_one();
        Ok(())
    }
}
