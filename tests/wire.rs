//! End-to-end peer-wire scenarios: a handshake, a session wired into a
//! [`PeerManager`], and a sub-block-fragmented piece reception carried all
//! the way through to piece verification.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::BytesMut;
use pretty_assertions::assert_eq;
use tokio_util::codec::{Decoder, Encoder};

use transmission_core::metainfo::InfoHash;
use transmission_core::peer::handshake::Handshake;
use transmission_core::peer::message::{PeerMessage, PeerMessageCodec};
use transmission_core::peer::request_queue::OutstandingRequest;
use transmission_core::{BlockInfo, Completion, Direction, ManagerAction, PeerEvent, PeerManager, PeerSession};

fn addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 6881)
}

fn all_wanted(_: u32) -> bool {
    true
}

#[test]
fn handshake_then_two_fragment_piece_drives_a_torrent_to_verification() {
    let info_hash = InfoHash([0x11u8; 20]);
    let our_id = [0xAAu8; 20];
    let their_id = [0xBBu8; 20];

    // both sides advertise fast-extension + ltep.
    let ours = Handshake::new(info_hash, our_id).with_fast_extension().with_ltep();
    let theirs_wire = Handshake::new(info_hash, their_id).with_fast_extension().with_ltep().to_bytes();
    let theirs = Handshake::from_bytes(&theirs_wire).unwrap();
    assert_eq!(theirs.info_hash, ours.info_hash);
    assert!(theirs.supports_fast_extension());

    let bi = BlockInfo::new(32768, 32768); // one piece, two 16KiB blocks
    let completion = Completion::new(all_wanted, &bi);
    let mut manager = PeerManager::new(completion, None);

    let mut session = PeerSession::new(addr(), Direction::Inbound, their_id, bi, 512, true, true, |_| false);
    // both blocks of the lone piece were requested whole; the first block
    // will arrive split across two sub-block fragments (spec.md §8 scenario 5).
    session.outstanding.add(OutstandingRequest { piece: 0, begin: 0, length: 16384 });
    session.outstanding.add(OutstandingRequest { piece: 0, begin: 16384, length: 16384 });
    manager.register_peer(their_id, session);

    let mut codec = PeerMessageCodec;
    let frag1 = PeerMessage::Piece { index: 0, begin: 0, block: vec![0xAB; 8192] };
    let frag2 = PeerMessage::Piece { index: 0, begin: 8192, block: vec![0xAB; 8192] };
    let frag3 = PeerMessage::Piece { index: 0, begin: 16384, block: vec![0xCD; 16384] };

    for frag in [frag1, frag2, frag3] {
        let mut buf = BytesMut::new();
        codec.encode(frag, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        let events = manager
            .sessions
            .get_mut(&their_id)
            .unwrap()
            .handle_message(decoded, Duration::ZERO);
        for event in &events {
            let action = manager.handle_event(&their_id, event);
            if let ManagerAction::VerifyPiece { piece } = action {
                assert_eq!(piece, 0);
                let verify_action = manager.report_piece_verification(&their_id, piece, true);
                assert_eq!(verify_action, ManagerAction::TorrentComplete);
            }
        }
    }

    assert_eq!(manager.completion.has_total(), bi.total_size());
}

#[test]
fn a_checksum_failure_strikes_the_peer_and_reschedules_the_piece() {
    let bi = BlockInfo::new(65536, 32768); // two pieces
    let completion = Completion::new(all_wanted, &bi);
    let mut manager = PeerManager::new(completion, None);
    let peer_id = [7u8; 20];
    let session = PeerSession::new(addr(), Direction::Outbound, peer_id, bi, 512, true, true, |_| false);
    manager.register_peer(peer_id, session);

    manager.completion.add_piece(0);
    assert!(manager.completion.has_piece(0));

    let action = manager.report_piece_verification(&peer_id, 0, false);
    assert_eq!(action, ManagerAction::None);
    assert!(!manager.completion.has_piece(0));
}

#[test]
fn choke_from_the_peer_drains_our_outstanding_requests_for_that_session() {
    let block_info = BlockInfo::new(4 * 32768, 32768);
    let mut session = PeerSession::new(addr(), Direction::Outbound, [5u8; 20], block_info, 512, true, true, |_| false);
    session.outstanding.add(OutstandingRequest { piece: 0, begin: 0, length: 16384 });
    session.outstanding.add(OutstandingRequest { piece: 0, begin: 16384, length: 16384 });
    assert_eq!(session.outstanding.outstanding_count(), 2);

    let mut codec = PeerMessageCodec;
    let mut buf = BytesMut::new();
    codec.encode(PeerMessage::Choke, &mut buf).unwrap();
    let decoded = codec.decode(&mut buf).unwrap().unwrap();
    let events = session.handle_message(decoded, Duration::ZERO);

    assert_eq!(events, vec![PeerEvent::GotChoke]);
    assert_eq!(session.outstanding.outstanding_count(), 0);
}
