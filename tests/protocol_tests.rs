//! Wire-level tests: CAN-ID layout, codec round-trips, payload views
//! and the fragment framing.

use loxlink::crc::stm32_crc32;
use loxlink::fragment::{fragment_frames, FeedOutcome, FragmentAssembler};
use loxlink::protocol::{CanFrame, Command, NatFrame};

#[test]
fn can_id_layout_device_to_server() {
    let frame = NatFrame::reply(0x12, 0x00, Command::Pong, [0u8; 7]);
    let can = frame.encode();
    assert_eq!(can.id, 0x1000_0000 | (0x12 << 12) | 0x06);
    assert_eq!(can.data[0], 0x00);
    assert_eq!(&can.data[1..], &[0u8; 7]);
}

#[test]
fn can_id_layout_server_to_device() {
    let frame = NatFrame::request(0x07, 0xFF, Command::Ping, [0u8; 7]);
    let can = frame.encode();
    assert_eq!(can.id, 0x1000_0000 | 0x0060_0000 | (0x07 << 12) | 0x05);
    assert_eq!(can.data[0], 0xFF);
}

#[test]
fn fragment_bit_rides_in_the_can_id() {
    let frames = fragment_frames(0x07, 0x00, Command::SendConfig as u8, &[1, 2, 3], true);
    for frame in &frames {
        assert!(frame.fragmented);
        assert_ne!(frame.encode().id & 0x0010_0000, 0);
    }
}

#[test]
fn decode_rejects_foreign_identifiers() {
    for id in [0x0000_0123, 0x0ABC_1234, 0x1800_0005, 0xFFFF_FFFF] {
        assert!(NatFrame::decode(&CanFrame::new(id, [0u8; 8], 0)).is_err());
    }
}

#[test]
fn codec_round_trips() {
    let frames = [
        NatFrame::reply(0x84, 0x00, Command::NatOfferRequest, [0, 0x14, 0, 1, 2, 3, 4]),
        NatFrame::request(0xFF, 0xFF, Command::Ping, [0u8; 7]),
        NatFrame {
            nat_id: 0x07,
            device_id: 0x11,
            command: Command::FragmentData as u8,
            data: [9, 8, 7, 6, 5, 4, 3],
            from_server: true,
            fragmented: true,
        },
    ];
    for frame in frames {
        assert_eq!(NatFrame::decode(&frame.encode()).unwrap(), frame);
    }
}

#[test]
fn encode_round_trips_from_the_wire() {
    // A syntactically valid server frame as the adapter would see it.
    let can = CanFrame::new(
        0x1000_0000 | 0x0060_0000 | 0x0010_0000 | (0x3A << 12) | 0xF1,
        [0x11, 1, 2, 3, 4, 5, 6, 7],
        42,
    );
    let decoded = NatFrame::decode(&can).unwrap();
    assert_eq!(decoded.nat_id, 0x3A);
    assert_eq!(decoded.device_id, 0x11);
    assert!(decoded.from_server);
    assert!(decoded.fragmented);
    let encoded = decoded.encode();
    assert_eq!(encoded.id, can.id);
    assert_eq!(encoded.data, can.data);
}

#[test]
fn payload_views() {
    let data = NatFrame::pack(0x05, 0xBEEF, 0x1234_5678);
    let frame = NatFrame::reply(0, 0, Command::Alive, data);
    assert_eq!(frame.b0(), 0x05);
    assert_eq!(frame.val16(), 0xBEEF);
    assert_eq!(frame.val32(), 0x1234_5678);
    assert_eq!(frame.data, [0x05, 0xEF, 0xBE, 0x78, 0x56, 0x34, 0x12]);
}

#[test]
fn fragment_start_header_layout() {
    let payload: Vec<u8> = (0..20).collect();
    let frames = fragment_frames(0x07, 0x00, 0x11, &payload, true);
    let start = &frames[0];
    assert_eq!(start.command, Command::FragmentStart as u8);
    assert_eq!(start.b0(), 0x11);
    assert_eq!(start.val16(), 20);
    assert_eq!(start.val32(), stm32_crc32(&payload));
    assert_eq!(frames.len(), 1 + 3);
}

#[test]
fn emitter_to_assembler_invariant() {
    // Sizes around the chunk boundary, including empty.
    for size in [0usize, 1, 6, 7, 8, 13, 14, 64, 200] {
        let payload: Vec<u8> = (0..size).map(|i| i as u8).collect();
        let frames = fragment_frames(0x07, 0x00, 0x9C, &payload, true);
        let mut assembler = FragmentAssembler::new();
        let mut last = FeedOutcome::Pending;
        for frame in &frames {
            last = assembler.feed(frame);
        }
        match last {
            FeedOutcome::Complete(message) => {
                assert_eq!(message.command, 0x9C);
                assert_eq!(message.data, payload, "size {size}");
            }
            other => panic!("size {size}: expected completion, got {other:?}"),
        }
    }
}
