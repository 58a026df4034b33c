//! Shared constants and configuration records for the NAT engine.

use serde::Deserialize;

use crate::crc::stm32_crc32_padded;
use crate::error::LinkError;

/// Reset reasons reported in `StartInfo`/`VersionInfo` and `Alive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResetReason {
    Undefined = 0x00,
    MiniserverStart = 0x01,
    Pairing = 0x02,
    AliveRequested = 0x03,
    Reconnect = 0x04,
    AlivePackage = 0x05,
    ReconnectBroadcast = 0x06,
    PowerOnReset = 0x20,
    StandbyReset = 0x21,
    WatchdogReset = 0x22,
    SoftwareReset = 0x23,
    PinReset = 0x24,
    WindowWatchdogReset = 0x25,
    LowPowerReset = 0x26,
}

/// Known device type codes.
pub mod device_type {
    pub const TREE_BASE_EXTENSION: u16 = 0x0013;
    pub const DI_EXTENSION: u16 = 0x0014;
    pub const MOTION_TREE: u16 = 0x8002;
    pub const TOUCH_TREE: u16 = 0x8003;
    pub const RGBW_DIMMER_TREE: u16 = 0x800C;
    pub const LED_SPOT_RGBW_TREE: u16 = 0x8016;
    pub const LED_SPOT_WW_TREE: u16 = 0x8017;
}

/// Offline timeout the device assumes before the Miniserver sends a
/// configuration.
pub const DEFAULT_OFFLINE_TIMEOUT_SECS: u32 = 900;

/// Boot-time crypto configuration, loaded by the (out-of-scope) JSON
/// config layer and frozen into a [`crate::crypto::CryptoContext`].
#[derive(Debug, Clone, Deserialize)]
pub struct CryptoConfig {
    /// Encrypted AES key blob as hex text.
    pub aes_key: String,
    /// Encrypted AES IV blob as hex text.
    pub aes_iv: String,
    /// Legacy AES key words for the device-ID exchange.
    pub legacy_key: [u32; 4],
    /// Legacy AES IV words for the device-ID exchange.
    pub legacy_iv: [u32; 4],
    /// STM32 device-ID for extensions, 12 bytes hex encoded.
    pub master_device_id: String,
}

/// Parsed Miniserver configuration record.
///
/// Wire layout: `ConfigSize(u8) ConfigVersion(u8) LedSyncOffset(u8)
/// reserved(u8) OfflineTimeoutSeconds(u32 LE)` followed by an
/// extension-specific trailer. The advertised configuration CRC covers
/// the first 12 bytes of the record regardless of the trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub size: u8,
    pub version: u8,
    pub led_sync_offset: u8,
    pub offline_timeout_secs: u32,
    /// Extension-specific trailer bytes after the 8-byte header.
    pub extra: Vec<u8>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            size: 9,
            version: 0,
            led_sync_offset: 0,
            offline_timeout_secs: DEFAULT_OFFLINE_TIMEOUT_SECS,
            extra: vec![0; 4],
        }
    }
}

impl DeviceConfig {
    /// Parse a received configuration record.
    pub fn parse(data: &[u8]) -> Result<Self, LinkError> {
        if data.len() < 8 {
            return Err(LinkError::ConfigTooShort(data.len()));
        }
        Ok(Self {
            size: data[0],
            version: data[1],
            led_sync_offset: data[2],
            offline_timeout_secs: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            extra: data[8..].to_vec(),
        })
    }

    /// Canonical byte layout of this record.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.extra.len());
        out.push(self.size);
        out.push(self.version);
        out.push(self.led_sync_offset);
        out.push(0);
        out.extend_from_slice(&self.offline_timeout_secs.to_le_bytes());
        out.extend_from_slice(&self.extra);
        out
    }

    /// The configuration CRC advertised in `Alive` and the info frames:
    /// STM32 CRC over the first 12 record bytes, zero-padded.
    pub fn record_crc(record: &[u8]) -> u32 {
        stm32_crc32_padded(&record[..record.len().min(12)])
    }

    /// CRC of this record's canonical layout.
    pub fn crc(&self) -> u32 {
        Self::record_crc(&self.canonical_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_record_matches_reference_crc() {
        let config = DeviceConfig::default();
        assert_eq!(config.canonical_bytes().len(), 12);
        assert_eq!(config.crc(), 0xF7C0_95CC);
    }

    #[test]
    fn parse_keeps_trailer_out_of_header() {
        let record = [
            0x09, 0x01, 0x02, 0x00, 0x84, 0x03, 0x00, 0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0x00, 0x00,
        ];
        let config = DeviceConfig::parse(&record).unwrap();
        assert_eq!(config.size, 9);
        assert_eq!(config.version, 1);
        assert_eq!(config.led_sync_offset, 2);
        assert_eq!(config.offline_timeout_secs, 900);
        assert_eq!(config.extra, vec![0xAA, 0xBB, 0xCC, 0xDD, 0x00, 0x00]);
        // The CRC covers exactly the first twelve bytes.
        assert_eq!(DeviceConfig::record_crc(&record), DeviceConfig::record_crc(&record[..12]));
    }

    #[test]
    fn parse_rejects_truncated_records() {
        assert!(DeviceConfig::parse(&[0x09, 0x00, 0x00]).is_err());
    }
}
