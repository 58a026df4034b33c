//! Async shell around a [`LinkNode`]: the single-consumer processing
//! task, inbound sequence reordering and outbound fragment pacing.
//!
//! Each device group runs one task that drains the inbound queue one
//! frame at a time, finishing a frame (including its replies) before
//! taking the next. The task suspends only between frames, on adapter
//! sends, on the inter-fragment delay and on the timer tick.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::warn;

use crate::device::{LinkNode, Outbound, Outbox};
use crate::fragment::fragment_frames;
use crate::protocol::{CanFrame, NatFrame};
use crate::transport::CanAdapter;

/// Tunables for the processing task.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Pause between fragment chunks. Real devices pace at ≈100 ms;
    /// tests shrink this.
    pub fragment_delay: Duration,
    /// Timer granularity for offers, keep-alive and the offline
    /// countdown.
    pub tick_interval: Duration,
    /// Bound on the out-of-sequence reorder buffer.
    pub reorder_capacity: usize,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            fragment_delay: Duration::from_millis(100),
            tick_interval: Duration::from_millis(25),
            reorder_capacity: 100,
        }
    }
}

/// Releases adapter frames in strictly ascending sequence order.
///
/// Out-of-sequence frames wait in a bounded buffer; on overflow the
/// oldest buffered frame is dropped and the expected counter advances
/// past the gap.
pub struct ReorderBuffer {
    next: Option<u64>,
    pending: BTreeMap<u64, CanFrame>,
    capacity: usize,
}

impl ReorderBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            next: None,
            pending: BTreeMap::new(),
            capacity,
        }
    }

    /// Accept one frame, returning every frame now releasable in order.
    pub fn push(&mut self, frame: CanFrame) -> Vec<CanFrame> {
        let mut next = *self.next.get_or_insert(frame.sequence);
        if frame.sequence < next {
            warn!(sequence = frame.sequence, "stale frame sequence, dropped");
            return Vec::new();
        }
        self.pending.insert(frame.sequence, frame);

        let mut released = Vec::new();
        loop {
            if let Some(frame) = self.pending.remove(&next) {
                released.push(frame);
                next += 1;
            } else if self.pending.len() > self.capacity {
                // A frame was lost at the adapter; give up on the gap.
                let Some((&sequence, _)) = self.pending.iter().next() else {
                    break;
                };
                self.pending.remove(&sequence);
                warn!(sequence, "reorder buffer overflow, frame dropped");
                next = sequence + 1;
            } else {
                break;
            }
        }
        self.next = Some(next);
        released
    }
}

/// Handle to a running device task.
pub struct NodeRunner {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl NodeRunner {
    /// Spawn the processing task for `node`.
    pub fn spawn<N>(
        mut node: N,
        adapter: Arc<dyn CanAdapter>,
        mut inbound: mpsc::Receiver<CanFrame>,
        options: RunnerOptions,
    ) -> Self
    where
        N: LinkNode + 'static,
    {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            if let Err(e) = adapter.start_receive().await {
                warn!(error = %e, "adapter start_receive failed");
            }
            let mut reorder = ReorderBuffer::new(options.reorder_capacity);
            let mut ticker = tokio::time::interval(options.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        let mut out = Outbox::new();
                        node.tick(Instant::now(), &mut out);
                        flush(adapter.as_ref(), out, &options).await;
                    }
                    received = inbound.recv() => match received {
                        None => break,
                        Some(frame) => {
                            for frame in reorder.push(frame) {
                                let mut out = Outbox::new();
                                node.handle_can(Instant::now(), &frame, &mut out);
                                flush(adapter.as_ref(), out, &options).await;
                            }
                        }
                    }
                }
            }

            // Clean stop: farewell frame, then release the adapter.
            let mut out = Outbox::new();
            node.shutdown(&mut out);
            flush(adapter.as_ref(), out, &options).await;
            if let Err(e) = adapter.stop_receive().await {
                warn!(error = %e, "adapter stop_receive failed");
            }
        });
        Self { shutdown, task }
    }

    /// Signal the task and wait for it to drain and exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

async fn flush(adapter: &dyn CanAdapter, out: Outbox, options: &RunnerOptions) {
    for item in out.into_items() {
        match item {
            Outbound::Frame(frame) => send_nat(adapter, &frame).await,
            Outbound::Fragmented {
                nat_id,
                device_id,
                command,
                data,
            } => {
                let frames = fragment_frames(nat_id, device_id, command, &data, false);
                for (i, frame) in frames.iter().enumerate() {
                    if i > 0 && !options.fragment_delay.is_zero() {
                        tokio::time::sleep(options.fragment_delay).await;
                    }
                    send_nat(adapter, frame).await;
                }
            }
        }
    }
}

async fn send_nat(adapter: &dyn CanAdapter, frame: &NatFrame) {
    let can = frame.encode();
    if let Err(e) = adapter.send_frame(can.id, can.data).await {
        warn!(error = %e, "CAN send failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(sequence: u64) -> CanFrame {
        CanFrame::new(0x1000_0005, [0u8; 8], sequence)
    }

    fn sequences(frames: &[CanFrame]) -> Vec<u64> {
        frames.iter().map(|f| f.sequence).collect()
    }

    #[test]
    fn in_order_frames_pass_through() {
        let mut buffer = ReorderBuffer::new(4);
        assert_eq!(sequences(&buffer.push(frame(1))), vec![1]);
        assert_eq!(sequences(&buffer.push(frame(2))), vec![2]);
    }

    #[test]
    fn out_of_order_frames_wait_for_the_gap() {
        let mut buffer = ReorderBuffer::new(4);
        assert_eq!(sequences(&buffer.push(frame(1))), vec![1]);
        assert!(buffer.push(frame(3)).is_empty());
        assert!(buffer.push(frame(4)).is_empty());
        assert_eq!(sequences(&buffer.push(frame(2))), vec![2, 3, 4]);
    }

    #[test]
    fn overflow_drops_the_oldest_and_skips_the_gap() {
        let mut buffer = ReorderBuffer::new(2);
        assert_eq!(sequences(&buffer.push(frame(1))), vec![1]);
        // Sequence 2 never arrives.
        assert!(buffer.push(frame(3)).is_empty());
        assert!(buffer.push(frame(4)).is_empty());
        // The third buffered frame exceeds the bound: 3 is sacrificed
        // and the counter advances past it.
        assert_eq!(sequences(&buffer.push(frame(5))), vec![4, 5]);
    }

    #[test]
    fn stale_sequences_are_dropped() {
        let mut buffer = ReorderBuffer::new(4);
        assert_eq!(sequences(&buffer.push(frame(5))), vec![5]);
        assert!(buffer.push(frame(4)).is_empty());
        assert_eq!(sequences(&buffer.push(frame(6))), vec![6]);
    }
}
