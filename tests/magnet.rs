//! A magnet link wired all the way through metadata bootstrap: parse the
//! URI, size the transfer, feed it fabricated pieces, and confirm the
//! assembled bytes verify against the magnet's own info-hash.

use pretty_assertions::assert_eq;
use sha1::{Digest, Sha1};
use std::time::Duration;

use transmission_core::magnet::MagnetLink;
use transmission_core::metadata_xfer::MetadataTransfer;

#[test]
fn a_magnet_bootstrapped_transfer_verifies_against_the_magnets_own_info_hash() {
    let fake_info_dict = b"d4:name8:test.iso6:lengthi70000ee".to_vec();
    let mut hasher = Sha1::new();
    hasher.update(&fake_info_dict);
    let digest: [u8; 20] = hasher.finalize().into();

    let uri = format!("magnet:?xt=urn:btih:{}&dn=test.iso", hex::encode(digest));
    let link = MagnetLink::parse(&uri).unwrap();
    assert_eq!(link.info_hash.0, digest);

    let mut xfer = MetadataTransfer::sizing(link.info_hash);
    xfer.set_size(fake_info_dict.len()).unwrap();

    let mut now = Duration::ZERO;
    let mut assembled = None;
    loop {
        let Some(req) = xfer.next_request(now) else {
            now += Duration::from_secs(4);
            continue;
        };
        let piece = req.piece_index as usize;
        let start = piece * transmission_core::conf::METADATA_PIECE_SIZE;
        let end = (start + transmission_core::conf::METADATA_PIECE_SIZE).min(fake_info_dict.len());
        if let Some(bytes) = xfer.receive_piece(req.piece_index, &fake_info_dict[start..end]).unwrap() {
            assembled = Some(bytes);
            break;
        }
    }

    assert_eq!(assembled, Some(fake_info_dict));
    assert!(xfer.is_unneeded());
}

#[test]
fn tracker_list_survives_into_http_announce_urls_for_the_tracker_request() {
    let uri = "magnet:?xt=urn:btih:ad42ce8109f54c99613ce38f9b4d87e70f24a165&tr=http%3A%2F%2Ftracker.example%2Fannounce";
    let link = MagnetLink::parse(uri).unwrap();
    let urls = link.http_announce_urls();
    assert_eq!(urls.len(), 1);
    assert_eq!(urls[0].as_str(), "http://tracker.example/announce");
}
