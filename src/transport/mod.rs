//! CAN adapter boundary.
//!
//! The engine depends on one interface: send a 29-bit extended frame,
//! and receive frames tagged with an adapter-assigned monotonic
//! sequence number. Concrete adapters (USB-CAN serial bridge, raw-CAN
//! socket) live outside the engine; the mock below serves the test
//! suite and the operator console.

use async_trait::async_trait;

use crate::error::LinkError;

pub mod mock;

pub use mock::MockAdapter;

/// The only boundary the protocol core depends on.
///
/// Received frames are delivered out-of-band through an
/// `mpsc::Receiver<CanFrame>` handed to the runner; the adapter assigns
/// each one a monotonically increasing sequence number.
#[async_trait]
pub trait CanAdapter: Send + Sync {
    /// Transmit one frame (29-bit extended id, DLC 8). Must be safe to
    /// call concurrently.
    async fn send_frame(&self, id: u32, data: [u8; 8]) -> Result<(), LinkError>;

    /// Start delivering received frames.
    async fn start_receive(&self) -> Result<(), LinkError>;

    /// Stop delivering received frames.
    async fn stop_receive(&self) -> Result<(), LinkError>;
}
