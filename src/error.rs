//! Error types shared across the NAT engine.

use thiserror::Error;

/// Errors produced by the NAT protocol engine.
///
/// Everything inside the per-device processing loop is recovered
/// internally; these surface only through the public construction and
/// adapter APIs.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The CAN identifier does not carry the NAT prefix.
    #[error("not a NAT frame (CAN id {0:#010x})")]
    NotANatFrame(u32),

    /// AES-CBC input whose length is not a multiple of the block size.
    #[error("cipher data length {0} is not a multiple of 16")]
    CipherLength(usize),

    /// A configuration blob failed hex decoding or has the wrong size.
    #[error("invalid crypto configuration: {0}")]
    CryptoConfig(String),

    /// The Miniserver configuration record is too short to parse.
    #[error("configuration record too short: {0} bytes")]
    ConfigTooShort(usize),

    /// The CAN adapter rejected a send.
    #[error("CAN adapter error: {0}")]
    Adapter(String),
}
