//! Loxone Link NAT protocol engine.
//!
//! Emulates Loxone-Link devices on a CAN bus so a Miniserver will
//! discover, assign, authenticate, configure and control them as if
//! they were real hardware. Two device families are supported: Link
//! *extensions* (directly on the bus) and *Tree devices* (behind a Tree
//! extension that bridges them).
//!
//! The engine covers the frame codec, the per-device lifecycle state
//! machine, fragmented transfers with CRC32 integrity, the command
//! dispatch, the crypto handshakes and the Tree routing layer. The CAN
//! transport itself stays behind the [`transport::CanAdapter`] trait.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use loxlink::config::{device_type, CryptoConfig};
//! use loxlink::crypto::CryptoContext;
//! use loxlink::device::DeviceIdentity;
//! use loxlink::devices::{RgbwDimmer, RgbwSink};
//! use loxlink::runner::{NodeRunner, RunnerOptions};
//! use loxlink::transport::MockAdapter;
//! use loxlink::tree::{Branch, TreeExtension};
//!
//! struct Log;
//! impl RgbwSink for Log {
//!     fn set_channels(&mut self, r: u8, g: u8, b: u8, w: u8) {
//!         println!("rgbw {r} {g} {b} {w}");
//!     }
//! }
//!
//! # async fn run() {
//! let crypto = Arc::new(CryptoContext::new(&CryptoConfig {
//!     aes_key: "00112233445566778899aabbccddeeff".into(),
//!     aes_iv: "ffeeddccbbaa99887766554433221100".into(),
//!     legacy_key: [0x11111111, 0x22222222, 0x33333333, 0x44444444],
//!     legacy_iv: [0x55555555, 0x66666666, 0x77777777, 0x88888888],
//!     master_device_id: "0123456789ab0123456789ab".into(),
//! }).unwrap());
//!
//! let mut tree = TreeExtension::new(
//!     DeviceIdentity::extension(0x1234_5678, device_type::TREE_BASE_EXTENSION, 2, 10_031_108, &crypto),
//!     Arc::clone(&crypto),
//! );
//! tree.add_device(
//!     DeviceIdentity::tree(0xB000_0001, device_type::RGBW_DIMMER_TREE, 1, 10_031_108),
//!     Box::new(RgbwDimmer::new(Box::new(Log))),
//!     Branch::Left,
//! );
//!
//! let (adapter, inbound) = MockAdapter::new();
//! let runner = NodeRunner::spawn(tree, adapter, inbound, RunnerOptions::default());
//! # runner.stop().await;
//! # }
//! ```

pub mod config;
pub mod crc;
pub mod crypto;
pub mod device;
pub mod devices;
pub mod error;
pub mod firmware;
pub mod fragment;
mod handlers;
pub mod lifecycle;
pub mod protocol;
pub mod runner;
pub mod transport;
pub mod tree;

pub use config::{CryptoConfig, DeviceConfig, ResetReason};
pub use device::{DeviceCore, DeviceIdentity, Extension, LinkNode, Outbound, Outbox};
pub use error::LinkError;
pub use lifecycle::LinkState;
pub use protocol::{CanFrame, Command, NatFrame};
pub use runner::{NodeRunner, RunnerOptions};
pub use tree::{Branch, TreeExtension};
