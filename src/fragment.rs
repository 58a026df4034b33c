//! Fragmented-message assembly and emission.
//!
//! Payloads longer than seven bytes travel as a `FragmentStart` header
//! (original command, size, CRC32) followed by `FragmentData` frames of
//! seven bytes each, the last one zero-padded. The assembler keeps at
//! most one in-flight session per device; a new `FragmentStart` restarts
//! it unconditionally.

use tracing::{error, warn};

use crate::crc::stm32_crc32;
use crate::protocol::{Command, NatFrame};

/// A logical payload reassembled from a fragmented transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentedFrame {
    pub nat_id: u8,
    pub device_id: u8,
    pub command: u8,
    pub data: Vec<u8>,
}

impl FragmentedFrame {
    pub fn command(&self) -> Option<Command> {
        Command::from_u8(self.command)
    }
}

/// Outcome of feeding one frame to the assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedOutcome {
    /// More frames are needed (or the frame was ignored).
    Pending,
    /// The payload completed and passed its CRC check.
    Complete(FragmentedFrame),
    /// The payload completed but failed its CRC check; the session was
    /// discarded without a reply.
    CrcMismatch,
}

struct Session {
    command: u8,
    size: usize,
    expected_crc: u32,
    buf: Vec<u8>,
}

/// Reassembles one fragmented payload at a time.
#[derive(Default)]
pub struct FragmentAssembler {
    session: Option<Session>,
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame carrying the fragmented flag.
    pub fn feed(&mut self, frame: &NatFrame) -> FeedOutcome {
        match frame.command() {
            Some(Command::FragmentStart) => {
                self.session = Some(Session {
                    command: frame.b0(),
                    size: frame.val16() as usize,
                    expected_crc: frame.val32(),
                    buf: Vec::new(),
                });
                self.try_finish(frame)
            }
            Some(Command::FragmentData) => {
                let Some(session) = self.session.as_mut() else {
                    warn!("fragment data without a session, ignored");
                    return FeedOutcome::Pending;
                };
                let missing = session.size - session.buf.len();
                session.buf.extend_from_slice(&frame.data[..missing.min(7)]);
                self.try_finish(frame)
            }
            _ => {
                warn!(command = frame.command, "unexpected command in fragmented frame");
                FeedOutcome::Pending
            }
        }
    }

    fn try_finish(&mut self, frame: &NatFrame) -> FeedOutcome {
        let done = self
            .session
            .as_ref()
            .is_some_and(|s| s.buf.len() >= s.size);
        if !done {
            return FeedOutcome::Pending;
        }
        let Some(session) = self.session.take() else {
            return FeedOutcome::Pending;
        };
        let crc = stm32_crc32(&session.buf);
        if crc != session.expected_crc {
            error!(
                expected = format_args!("{:#010x}", session.expected_crc),
                actual = format_args!("{crc:#010x}"),
                "fragmented payload failed CRC check, discarded"
            );
            return FeedOutcome::CrcMismatch;
        }
        FeedOutcome::Complete(FragmentedFrame {
            nat_id: frame.nat_id,
            device_id: frame.device_id,
            command: session.command,
            data: session.buf,
        })
    }
}

/// Split an outbound payload into `FragmentStart` + `FragmentData`
/// frames. The caller paces the actual sends (≈100 ms between chunks on
/// real hardware).
pub fn fragment_frames(
    nat_id: u8,
    device_id: u8,
    command: u8,
    data: &[u8],
    from_server: bool,
) -> Vec<NatFrame> {
    let crc = stm32_crc32(data);
    let size = data.len() as u16;

    let mut header = [0u8; 7];
    header[0] = command;
    header[1..3].copy_from_slice(&size.to_le_bytes());
    header[3..7].copy_from_slice(&crc.to_le_bytes());

    let mut frames = vec![NatFrame {
        nat_id,
        device_id,
        command: Command::FragmentStart as u8,
        data: header,
        from_server,
        fragmented: true,
    }];

    for chunk in data.chunks(7) {
        let mut payload = [0u8; 7];
        payload[..chunk.len()].copy_from_slice(chunk);
        frames.push(NatFrame {
            nat_id,
            device_id,
            command: Command::FragmentData as u8,
            data: payload,
            from_server,
            fragmented: true,
        });
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble(frames: &[NatFrame]) -> FeedOutcome {
        let mut assembler = FragmentAssembler::new();
        let mut last = FeedOutcome::Pending;
        for frame in frames {
            last = assembler.feed(frame);
        }
        last
    }

    #[test]
    fn emit_and_reassemble_round_trip() {
        let payload: Vec<u8> = (0..38).collect();
        let frames = fragment_frames(0x07, 0x00, Command::SendConfig as u8, &payload, true);
        // One start frame plus ceil(38 / 7) data frames.
        assert_eq!(frames.len(), 1 + 6);
        match reassemble(&frames) {
            FeedOutcome::Complete(msg) => {
                assert_eq!(msg.command, Command::SendConfig as u8);
                assert_eq!(msg.data, payload);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn empty_payload_completes_on_start() {
        let frames = fragment_frames(0x07, 0x00, 0x11, &[], true);
        assert_eq!(frames.len(), 1);
        match reassemble(&frames) {
            FeedOutcome::Complete(msg) => assert!(msg.data.is_empty()),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn crc_mismatch_discards_session() {
        let payload = [0xAB; 20];
        let mut frames = fragment_frames(0x07, 0x00, 0x11, &payload, true);
        frames[1].data[0] ^= 0xFF;

        let mut assembler = FragmentAssembler::new();
        let mut outcomes: Vec<FeedOutcome> = frames.iter().map(|f| assembler.feed(f)).collect();
        assert_eq!(outcomes.pop().unwrap(), FeedOutcome::CrcMismatch);

        // A fresh start frame opens a new, working session.
        let clean = fragment_frames(0x07, 0x00, 0x11, &payload, true);
        let mut last = FeedOutcome::Pending;
        for frame in &clean {
            last = assembler.feed(frame);
        }
        assert!(matches!(last, FeedOutcome::Complete(_)));
    }

    #[test]
    fn padding_bytes_are_dropped() {
        // 8-byte payload: the second data frame carries one real byte
        // and six padding bytes.
        let payload: Vec<u8> = (10..18).collect();
        let mut frames = fragment_frames(0x07, 0x00, 0x11, &payload, true);
        frames[2].data[1] = 0xEE;
        match reassemble(&frames) {
            FeedOutcome::Complete(msg) => assert_eq!(msg.data, payload),
            other => panic!("expected completion, got {other:?}"),
        }
    }
}
