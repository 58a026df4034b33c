//! In-memory CAN adapter for tests and the operator console.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::LinkError;
use crate::protocol::{CanFrame, NatFrame};
use crate::transport::CanAdapter;

/// Records every sent frame and injects received frames with
/// auto-assigned (or explicit) sequence numbers.
pub struct MockAdapter {
    sent: Mutex<Vec<CanFrame>>,
    sequence: AtomicU64,
    receiving: AtomicBool,
    inject_tx: mpsc::Sender<CanFrame>,
}

impl MockAdapter {
    /// Returns the adapter and the receive channel for the runner.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<CanFrame>) {
        let (inject_tx, inject_rx) = mpsc::channel(256);
        let adapter = Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(1),
            receiving: AtomicBool::new(false),
            inject_tx,
        });
        (adapter, inject_rx)
    }

    /// Inject a received frame with the next sequence number.
    pub fn inject(&self, id: u32, data: [u8; 8]) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.inject_with_sequence(id, data, sequence);
    }

    /// Inject a received frame with an explicit sequence number, for
    /// reorder tests.
    pub fn inject_with_sequence(&self, id: u32, data: [u8; 8], sequence: u64) {
        let _ = self.inject_tx.try_send(CanFrame::new(id, data, sequence));
    }

    /// Inject an encoded NAT frame.
    pub fn inject_nat(&self, frame: &NatFrame) {
        let can = frame.encode();
        self.inject(can.id, can.data);
    }

    /// Everything sent through the adapter so far.
    pub fn sent(&self) -> Vec<CanFrame> {
        self.sent.lock().unwrap().clone()
    }

    /// Sent frames decoded as NAT frames.
    pub fn sent_nat(&self) -> Vec<NatFrame> {
        self.sent()
            .iter()
            .filter_map(|f| NatFrame::decode(f).ok())
            .collect()
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CanAdapter for MockAdapter {
    async fn send_frame(&self, id: u32, data: [u8; 8]) -> Result<(), LinkError> {
        self.sent.lock().unwrap().push(CanFrame::new(id, data, 0));
        Ok(())
    }

    async fn start_receive(&self) -> Result<(), LinkError> {
        self.receiving.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn stop_receive(&self) -> Result<(), LinkError> {
        self.receiving.store(false, Ordering::Relaxed);
        Ok(())
    }
}
