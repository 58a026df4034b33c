//! Firmware-update mini-protocol carried inside the `FirmwareUpdate`
//! fragmented command.
//!
//! The Miniserver streams the image as data chunks grouped into pages,
//! follows up with per-page CRCs, then asks for verification. The engine
//! validates but never flashes anything.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::crc::stm32_crc32;

pub const SUB_FIRMWARE_DATA: u8 = 0x01;
pub const SUB_FIRMWARE_CRC: u8 = 0x02;
pub const SUB_VERIFY_UPDATE: u8 = 0x03;
pub const SUB_VERIFY_AND_RESTART: u8 = 0x04;

const REPLY_OK: u8 = 0x80;
const REPLY_CRC_FAILED: u8 = 0x81;

/// Session states. Only one session exists per device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpdateState {
    #[default]
    Idle,
    Receiving,
    ReceivingCrc,
    Completed,
    Failed,
}

/// One parsed `FirmwareUpdate` payload.
#[derive(Debug, Clone)]
pub struct UpdateMessage<'a> {
    pub sub_command: u8,
    pub device_type: u16,
    pub new_version: u32,
    pub page: u16,
    pub index: u16,
    pub bytes: &'a [u8],
}

impl<'a> UpdateMessage<'a> {
    /// Parse the fixed 12-byte header plus `dataSize` trailing bytes.
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < 12 {
            return None;
        }
        let data_size = data[0] as usize;
        let bytes = &data[12..];
        Some(Self {
            sub_command: data[1],
            device_type: u16::from_le_bytes([data[2], data[3]]),
            new_version: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            page: u16::from_le_bytes([data[8], data[9]]),
            index: u16::from_le_bytes([data[10], data[11]]),
            bytes: &bytes[..data_size.min(bytes.len())],
        })
    }
}

struct Page {
    start: usize,
    len: usize,
    crc: Option<u32>,
}

/// Result of a verification pass.
pub struct VerifyResult {
    pub success: bool,
    /// Reply payload for `VerifyUpdate`; `VerifyAndRestart` drops it.
    pub reply: Vec<u8>,
    pub new_version: u32,
}

#[derive(Default)]
pub struct UpdateSession {
    state: UpdateState,
    new_version: u32,
    image: Vec<u8>,
    pages: BTreeMap<u16, Page>,
}

impl UpdateSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    /// `FirmwareData` (0x01): accumulate image bytes into the page.
    pub fn data(&mut self, message: &UpdateMessage<'_>) {
        if self.state == UpdateState::Idle
            || self.state == UpdateState::Completed
            || self.state == UpdateState::Failed
        {
            self.reset();
            self.state = UpdateState::Receiving;
            self.new_version = message.new_version;
            info!(
                version = message.new_version,
                "firmware update session started"
            );
        }
        let start = self.image.len();
        self.image.extend_from_slice(message.bytes);
        self.pages
            .entry(message.page)
            .and_modify(|p| p.len += message.bytes.len())
            .or_insert(Page {
                start,
                len: message.bytes.len(),
                crc: None,
            });
    }

    /// `FirmwareCrc` (0x02): store the expected CRC for a page.
    pub fn page_crc(&mut self, message: &UpdateMessage<'_>) {
        if self.state != UpdateState::Receiving && self.state != UpdateState::ReceivingCrc {
            warn!(page = message.page, "page CRC outside a receiving session");
            return;
        }
        self.state = UpdateState::ReceivingCrc;
        if message.bytes.len() < 4 {
            warn!(page = message.page, "page CRC payload too short");
            return;
        }
        let crc = u32::from_le_bytes([
            message.bytes[0],
            message.bytes[1],
            message.bytes[2],
            message.bytes[3],
        ]);
        if let Some(page) = self.pages.get_mut(&message.page) {
            page.crc = Some(crc);
        } else {
            warn!(page = message.page, "CRC for a page that has no data");
        }
    }

    /// `VerifyUpdate`/`VerifyAndRestart`: check every page, compute the
    /// image CRC and build the reply payload.
    pub fn verify(&mut self, message: &UpdateMessage<'_>) -> Option<VerifyResult> {
        if self.state != UpdateState::ReceivingCrc {
            warn!(state = ?self.state, "verify outside a ReceivingCrc session");
            return None;
        }

        let mut failed_page: Option<u16> = None;
        for (&number, page) in &self.pages {
            let bytes = &self.image[page.start..page.start + page.len];
            let matches = page.crc.is_some_and(|crc| crc == stm32_crc32(bytes));
            if !matches {
                failed_page = Some(number);
                break;
            }
        }

        let image_crc = stm32_crc32(&self.image);
        let success = failed_page.is_none();
        self.state = if success {
            UpdateState::Completed
        } else {
            UpdateState::Failed
        };
        if success {
            info!(
                version = self.new_version,
                crc = format_args!("{image_crc:#010x}"),
                "firmware image verified"
            );
        } else {
            warn!(page = failed_page.unwrap(), "firmware page failed CRC check");
        }

        let mut reply = Vec::with_capacity(16);
        reply.push(16);
        reply.push(if success { REPLY_OK } else { REPLY_CRC_FAILED });
        reply.extend_from_slice(&message.device_type.to_le_bytes());
        reply.extend_from_slice(&self.new_version.to_le_bytes());
        reply.extend_from_slice(&failed_page.unwrap_or(0).to_le_bytes());
        reply.extend_from_slice(&message.index.to_le_bytes());
        reply.extend_from_slice(&image_crc.to_le_bytes());

        Some(VerifyResult {
            success,
            reply,
            new_version: self.new_version,
        })
    }

    /// Drop all session state back to Idle.
    pub fn reset(&mut self) {
        self.state = UpdateState::Idle;
        self.new_version = 0;
        self.image.clear();
        self.pages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(sub: u8, page: u16, bytes: &[u8]) -> Vec<u8> {
        let mut data = vec![bytes.len() as u8, sub, 0x0C, 0x80, 0x01, 0x02, 0x03, 0x00];
        data.extend_from_slice(&page.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(bytes);
        data
    }

    #[test]
    fn successful_update_round_trip() {
        let mut session = UpdateSession::new();
        let page0: Vec<u8> = (0..16).collect();
        let page1: Vec<u8> = (16..32).collect();

        let m = message(SUB_FIRMWARE_DATA, 0, &page0);
        session.data(&UpdateMessage::parse(&m).unwrap());
        let m = message(SUB_FIRMWARE_DATA, 1, &page1);
        session.data(&UpdateMessage::parse(&m).unwrap());
        assert_eq!(session.state(), UpdateState::Receiving);

        let m = message(SUB_FIRMWARE_CRC, 0, &stm32_crc32(&page0).to_le_bytes());
        session.page_crc(&UpdateMessage::parse(&m).unwrap());
        let m = message(SUB_FIRMWARE_CRC, 1, &stm32_crc32(&page1).to_le_bytes());
        session.page_crc(&UpdateMessage::parse(&m).unwrap());
        assert_eq!(session.state(), UpdateState::ReceivingCrc);

        let m = message(SUB_VERIFY_UPDATE, 0, &[]);
        let result = session.verify(&UpdateMessage::parse(&m).unwrap()).unwrap();
        assert!(result.success);
        assert_eq!(session.state(), UpdateState::Completed);
        assert_eq!(result.reply[1], 0x80);

        let whole: Vec<u8> = (0..32).collect();
        assert_eq!(result.reply[12..16], stm32_crc32(&whole).to_le_bytes());
    }

    #[test]
    fn failed_page_reports_its_number() {
        let mut session = UpdateSession::new();
        let page0 = [0xAAu8; 8];

        let m = message(SUB_FIRMWARE_DATA, 3, &page0);
        session.data(&UpdateMessage::parse(&m).unwrap());
        let m = message(SUB_FIRMWARE_CRC, 3, &0xDEAD_BEEFu32.to_le_bytes());
        session.page_crc(&UpdateMessage::parse(&m).unwrap());

        let m = message(SUB_VERIFY_UPDATE, 0, &[]);
        let result = session.verify(&UpdateMessage::parse(&m).unwrap()).unwrap();
        assert!(!result.success);
        assert_eq!(session.state(), UpdateState::Failed);
        assert_eq!(result.reply[1], 0x81);
        assert_eq!(result.reply[8..10], 3u16.to_le_bytes());
    }
}
