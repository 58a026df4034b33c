//! NAT frame model and the CAN-29bit codec.
//!
//! A NAT frame is the logical unit of the Loxone Link protocol: an 8-bit
//! extension slot (`nat_id`), an 8-bit sub-address (`device_id`, 0 for
//! the extension itself), an 8-bit command and exactly seven payload
//! bytes. It packs into a 29-bit extended CAN identifier plus 8 data
//! bytes, with the sub-address riding in the first data byte.

use crate::error::LinkError;

/// CAN-ID prefix for NAT traffic: top five bits `10000`.
pub const CAN_ID_BASE: u32 = 0x1000_0000;
/// Mask selecting the five prefix bits.
pub const CAN_ID_PREFIX_MASK: u32 = 0xF800_0000;
/// Direction bits 22-21, both set for server→device traffic.
pub const CAN_ID_SERVER_BITS: u32 = 0x0060_0000;
/// Bit 20, set when the frame belongs to a fragmented transfer.
pub const CAN_ID_FRAGMENT_BIT: u32 = 0x0010_0000;

/// Historical NAT carried by devices before the Miniserver assigns one.
pub const UNASSIGNED_NAT: u8 = 0x84;
/// NatId addressing every extension on the bus.
pub const BROADCAST_NAT: u8 = 0xFF;
/// DeviceId addressing an extension and all its Tree children.
pub const BROADCAST_DEVICE: u8 = 0xFF;

/// Raw CAN frame as delivered by the adapter.
///
/// `sequence` is assigned by the adapter, monotonically increasing per
/// adapter instance; the reorder buffer releases frames in that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u32,
    pub data: [u8; 8],
    pub sequence: u64,
}

impl CanFrame {
    pub fn new(id: u32, data: [u8; 8], sequence: u64) -> Self {
        Self { id, data, sequence }
    }
}

/// NAT protocol commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    VersionRequest = 0x01,
    StartInfo = 0x02,
    VersionInfo = 0x03,
    ConfigEqual = 0x04,
    Ping = 0x05,
    Pong = 0x06,
    Alive = 0x08,
    SetOffline = 0x09,
    ExtensionsOffline = 0x0A,
    TimeSync = 0x0C,
    Identify = 0x10,
    SendConfig = 0x11,
    WebServiceRequest = 0x12,
    CanDiagnosticsReply = 0x16,
    CanDiagnosticsRequest = 0x17,
    CanErrorReply = 0x18,
    CanErrorRequest = 0x19,
    DigitalValue = 0x80,
    RgbwValue = 0x84,
    CryptDeviceIdRequest = 0x99,
    CryptDeviceIdReply = 0x9A,
    CryptChallengeRequest = 0x9C,
    CryptChallengeReply = 0x9D,
    FirmwareUpdate = 0xEF,
    FragmentStart = 0xF0,
    FragmentData = 0xF1,
    IdentifyUnknown = 0xF4,
    SearchDevicesRequest = 0xFB,
    SearchDevicesResponse = 0xFC,
    NatOfferConfirm = 0xFD,
    NatOfferRequest = 0xFE,
}

impl Command {
    pub fn from_u8(value: u8) -> Option<Command> {
        use Command::*;
        Some(match value {
            0x01 => VersionRequest,
            0x02 => StartInfo,
            0x03 => VersionInfo,
            0x04 => ConfigEqual,
            0x05 => Ping,
            0x06 => Pong,
            0x08 => Alive,
            0x09 => SetOffline,
            0x0A => ExtensionsOffline,
            0x0C => TimeSync,
            0x10 => Identify,
            0x11 => SendConfig,
            0x12 => WebServiceRequest,
            0x16 => CanDiagnosticsReply,
            0x17 => CanDiagnosticsRequest,
            0x18 => CanErrorReply,
            0x19 => CanErrorRequest,
            0x80 => DigitalValue,
            0x84 => RgbwValue,
            0x99 => CryptDeviceIdRequest,
            0x9A => CryptDeviceIdReply,
            0x9C => CryptChallengeRequest,
            0x9D => CryptChallengeReply,
            0xEF => FirmwareUpdate,
            0xF0 => FragmentStart,
            0xF1 => FragmentData,
            0xF4 => IdentifyUnknown,
            0xFB => SearchDevicesRequest,
            0xFC => SearchDevicesResponse,
            0xFD => NatOfferConfirm,
            0xFE => NatOfferRequest,
            _ => return None,
        })
    }
}

/// Decoded NAT frame.
///
/// The payload is always seven bytes on the wire; logically shorter
/// payloads leave the tail zeroed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatFrame {
    pub nat_id: u8,
    pub device_id: u8,
    pub command: u8,
    pub data: [u8; 7],
    /// `true` for server→device traffic.
    pub from_server: bool,
    /// `true` when the frame is part of a fragmented transfer.
    pub fragmented: bool,
}

impl NatFrame {
    /// Device→server frame with the given payload.
    pub fn reply(nat_id: u8, device_id: u8, command: Command, data: [u8; 7]) -> Self {
        Self {
            nat_id,
            device_id,
            command: command as u8,
            data,
            from_server: false,
            fragmented: false,
        }
    }

    /// Server→device frame, used by tests and the sniffer side.
    pub fn request(nat_id: u8, device_id: u8, command: Command, data: [u8; 7]) -> Self {
        Self {
            from_server: true,
            ..Self::reply(nat_id, device_id, command, data)
        }
    }

    pub fn command(&self) -> Option<Command> {
        Command::from_u8(self.command)
    }

    /// First payload byte.
    pub fn b0(&self) -> u8 {
        self.data[0]
    }

    /// Little-endian u16 at payload bytes 1..3.
    pub fn val16(&self) -> u16 {
        u16::from_le_bytes([self.data[1], self.data[2]])
    }

    /// Little-endian u32 at payload bytes 3..7.
    pub fn val32(&self) -> u32 {
        u32::from_le_bytes([self.data[3], self.data[4], self.data[5], self.data[6]])
    }

    /// Payload assembled from the three convenience views.
    pub fn pack(b0: u8, val16: u16, val32: u32) -> [u8; 7] {
        let v16 = val16.to_le_bytes();
        let v32 = val32.to_le_bytes();
        [b0, v16[0], v16[1], v32[0], v32[1], v32[2], v32[3]]
    }

    /// Encode into a CAN frame (sequence number 0; the adapter assigns
    /// real sequence numbers on receive only).
    pub fn encode(&self) -> CanFrame {
        let mut id = CAN_ID_BASE;
        if self.from_server {
            id |= CAN_ID_SERVER_BITS;
        }
        if self.fragmented {
            id |= CAN_ID_FRAGMENT_BIT;
        }
        id |= (self.nat_id as u32) << 12;
        id |= self.command as u32;

        let mut data = [0u8; 8];
        data[0] = self.device_id;
        data[1..8].copy_from_slice(&self.data);
        CanFrame::new(id, data, 0)
    }

    /// Decode a CAN frame, rejecting anything without the NAT prefix.
    pub fn decode(frame: &CanFrame) -> Result<NatFrame, LinkError> {
        if frame.id & CAN_ID_PREFIX_MASK != CAN_ID_BASE {
            return Err(LinkError::NotANatFrame(frame.id));
        }
        let mut data = [0u8; 7];
        data.copy_from_slice(&frame.data[1..8]);
        Ok(NatFrame {
            nat_id: (frame.id >> 12) as u8,
            device_id: frame.data[0],
            command: frame.id as u8,
            data,
            from_server: frame.id & CAN_ID_SERVER_BITS == CAN_ID_SERVER_BITS,
            fragmented: frame.id & CAN_ID_FRAGMENT_BIT != 0,
        })
    }
}
