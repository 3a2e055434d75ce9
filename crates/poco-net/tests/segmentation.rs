use bytes::Bytes;
use poco_net::{to_packets, Packet, SegmentBuffer, PACKET_HEADER_LEN};
use proptest::prelude::*;

const MTU: usize = 16;

proptest! {
    /// Any payload up to ten MTUs splits into packets that reassemble to
    /// exactly the original bytes, and only the final packet flushes.
    #[test]
    fn split_then_reassemble_is_identity(
        payload in prop::collection::vec(any::<u8>(), 0..=(10 * MTU)),
    ) {
        let packets = to_packets(&payload, MTU).expect("segmentation");
        prop_assert!(!packets.is_empty());

        for (i, packet) in packets.iter().enumerate() {
            prop_assert!(packet.len() <= MTU);
            if i + 1 < packets.len() {
                // Every non-final packet is full and flagged as continuing.
                prop_assert!(packet.more_segment());
                prop_assert!(!packet.is_terminal());
                prop_assert_eq!(packet.len(), MTU);
            } else {
                prop_assert!(packet.is_terminal());
            }
        }

        let mut assembly = SegmentBuffer::new();
        let mut flushed = None;
        for packet in &packets {
            if let Some(body) = assembly.push(packet) {
                prop_assert!(flushed.is_none(), "only the final packet flushes");
                flushed = Some(body);
            }
        }
        prop_assert_eq!(flushed.expect("terminal packet flushes"), Bytes::from(payload));
        prop_assert_eq!(assembly.pending(), 0);
    }

    /// Packets survive byte serialization on their way through a wire.
    #[test]
    fn packets_survive_the_wire(
        payload in prop::collection::vec(any::<u8>(), 0..=(4 * MTU)),
    ) {
        let packets = to_packets(&payload, MTU).expect("segmentation");

        let mut assembly = SegmentBuffer::new();
        let mut flushed = None;
        for packet in &packets {
            let decoded = Packet::from_bytes(packet.to_bytes()).expect("decode");
            if let Some(body) = assembly.push(&decoded) {
                flushed = Some(body);
            }
        }
        prop_assert_eq!(flushed.expect("flush"), Bytes::from(payload));
    }
}

#[test]
fn boundary_packet_counts() {
    // One header byte per packet: a body of max-1 fits in one packet,
    // one more byte forces a second.
    let one = to_packets(&vec![7u8; MTU - PACKET_HEADER_LEN], MTU).unwrap();
    assert_eq!(one.len(), 1);

    let two = to_packets(&vec![7u8; MTU - PACKET_HEADER_LEN + 1], MTU).unwrap();
    assert_eq!(two.len(), 2);
}

#[test]
fn split_counts_match_the_usable_capacity() {
    // 15 usable bytes per packet at this limit, so 40 bytes go 15+15+10.
    let packets = to_packets(&vec![7u8; 40], MTU).unwrap();
    assert_eq!(packets.len(), 3);

    assert!(packets[0].more_segment() && !packets[0].no_segment());
    assert!(packets[1].more_segment() && !packets[1].no_segment());
    assert!(packets[2].is_terminal() && !packets[2].no_segment());
    assert_eq!(packets[2].len(), 10 + PACKET_HEADER_LEN);
}
