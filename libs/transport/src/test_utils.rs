//! In-memory connector for exercising the transport without a network.
//!
//! `FakeConnector` is cheaply cloneable; all clones share state, so a test
//! can hand one clone to the transport and keep another for scripting
//! connect failures, injecting inbound frames, and inspecting sends.

use crate::connector::{Connection, Connector};
use crate::message::Frame;
use crate::TransportError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct FakeConnectorInner {
    connect_count: AtomicUsize,
    fail_until: AtomicUsize,
    /// Every frame sent over any connection this connector produced
    sent: Mutex<Vec<Frame>>,
    current: Mutex<Option<Arc<FakeConnectionShared>>>,
}

#[derive(Debug)]
struct FakeConnectionShared {
    /// Taken by `drop_connection` so the read side sees end-of-stream
    incoming_tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    closed: AtomicBool,
}

/// Scriptable stand-in for the WebSocket connector.
#[derive(Debug, Default, Clone)]
pub struct FakeConnector {
    inner: Arc<FakeConnectorInner>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        let so_far = self.inner.connect_count.load(Ordering::SeqCst);
        self.inner.fail_until.store(so_far + n, Ordering::SeqCst);
    }

    /// Total connect attempts seen, successful or not.
    pub fn connect_count(&self) -> usize {
        self.inner.connect_count.load(Ordering::SeqCst)
    }

    /// All frames sent across every connection, in send order.
    pub fn sent_frames(&self) -> Vec<Frame> {
        self.inner.sent.lock().unwrap().clone()
    }

    /// Deliver a frame to the latest connection's read loop.
    pub fn push_incoming(&self, frame: Frame) {
        let current = self.inner.current.lock().unwrap();
        if let Some(shared) = current.as_ref() {
            if let Some(tx) = shared.incoming_tx.lock().unwrap().as_ref() {
                let _ = tx.send(frame);
            }
        }
    }

    /// Sever the latest connection as a peer would: its read loop sees
    /// end-of-stream and subsequent sends fail.
    pub fn drop_connection(&self) {
        let current = self.inner.current.lock().unwrap();
        if let Some(shared) = current.as_ref() {
            shared.incoming_tx.lock().unwrap().take();
        }
    }

    /// Whether `close` was called on the latest connection.
    pub fn connection_closed(&self) -> bool {
        self.inner
            .current
            .lock()
            .unwrap()
            .as_ref()
            .map(|shared| shared.closed.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Conn = FakeConnection;

    async fn connect(&self, _url: &str) -> Result<FakeConnection, TransportError> {
        let n = self.inner.connect_count.fetch_add(1, Ordering::SeqCst);
        if n < self.inner.fail_until.load(Ordering::SeqCst) {
            return Err(TransportError::connection_failed("simulated refusal"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(FakeConnectionShared {
            incoming_tx: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
        });
        *self.inner.current.lock().unwrap() = Some(Arc::clone(&shared));

        Ok(FakeConnection {
            connector: Arc::clone(&self.inner),
            shared,
            incoming_rx: tokio::sync::Mutex::new(rx),
        })
    }
}

pub struct FakeConnection {
    connector: Arc<FakeConnectorInner>,
    shared: Arc<FakeConnectionShared>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
}

impl std::fmt::Debug for FakeConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeConnection")
            .field("closed", &self.shared.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::SeqCst)
            || self.shared.incoming_tx.lock().unwrap().is_none()
        {
            return Err(TransportError::send_failed("connection is down"));
        }
        self.connector.sent.lock().unwrap().push(frame.clone());
        Ok(())
    }

    async fn recv(&self) -> Option<Result<Frame, TransportError>> {
        self.incoming_rx.lock().await.recv().await.map(Ok)
    }

    async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}
