//! Magnet URI parsing (BEP-9 bootstrap): a single correct `xt`/`dn`/`tr`/`ws`
//! parser supporting both hex and base32 info-hashes and repeated `tr`
//! params, grounded on `libtransmission/magnet.cc`'s `base32Lookup` table
//! for the base32 half.

use thiserror::Error;
use url::Url;

use crate::conf::MAGNET_URL_CAP;
use crate::metainfo::InfoHash;

const BTIH_PREFIX: &str = "urn:btih:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub trackers: Vec<Url>,
    pub webseeds: Vec<Url>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MagnetLinkError {
    #[error("not a magnet: URI")]
    NotMagnet,
    #[error("magnet URI has no query string")]
    NoQuery,
    #[error("missing xt parameter")]
    MissingXt,
    #[error("xt parameter is not a urn:btih reference")]
    NotBtih,
    #[error("malformed info-hash in xt: {0}")]
    MalformedInfoHash(String),
    #[error("malformed tracker/webseed URL: {0}")]
    MalformedUrl(String),
}

/// RFC 4648 base32 alphabet, case-insensitive; any other character is a
/// hard parse failure rather than a best-effort salvage.
fn base32_decode_20(input: &str) -> Result<[u8; 20], MagnetLinkError> {
    if input.len() != 32 {
        return Err(MagnetLinkError::MalformedInfoHash(format!(
            "base32 btih must be 32 chars, got {}",
            input.len()
        )));
    }

    let mut out = [0u8; 20];
    let mut buffer: u64 = 0;
    let mut bits_in_buffer: u32 = 0;
    let mut out_idx = 0usize;

    for ch in input.chars() {
        let value = match ch.to_ascii_uppercase() {
            c @ 'A'..='Z' => c as u8 - b'A',
            c @ '2'..='7' => c as u8 - b'2' + 26,
            other => {
                return Err(MagnetLinkError::MalformedInfoHash(format!(
                    "invalid base32 character '{other}'"
                )));
            }
        };
        buffer = (buffer << 5) | value as u64;
        bits_in_buffer += 5;
        if bits_in_buffer >= 8 {
            bits_in_buffer -= 8;
            if out_idx < out.len() {
                out[out_idx] = ((buffer >> bits_in_buffer) & 0xff) as u8;
                out_idx += 1;
            }
        }
    }

    if out_idx != 20 {
        return Err(MagnetLinkError::MalformedInfoHash(
            "base32 btih did not decode to 20 bytes".into(),
        ));
    }

    Ok(out)
}

fn parse_xt(xt: &str) -> Result<InfoHash, MagnetLinkError> {
    let hash_part = xt.strip_prefix(BTIH_PREFIX).ok_or(MagnetLinkError::NotBtih)?;

    let bytes = if hash_part.len() == 40 {
        let raw = hex::decode(hash_part)
            .map_err(|e| MagnetLinkError::MalformedInfoHash(e.to_string()))?;
        raw.try_into()
            .map_err(|_| MagnetLinkError::MalformedInfoHash("hex btih wrong length".into()))?
    } else if hash_part.len() == 32 {
        base32_decode_20(hash_part)?
    } else {
        return Err(MagnetLinkError::MalformedInfoHash(format!(
            "btih must be 40 hex or 32 base32 chars, got {} chars",
            hash_part.len()
        )));
    };

    Ok(InfoHash(bytes))
}

impl MagnetLink {
    /// Parses a `magnet:?...` URI. Repeated `tr`/`ws` parameters are kept
    /// in order, each capped at [`MAGNET_URL_CAP`] entries.
    pub fn parse(uri: &str) -> Result<Self, MagnetLinkError> {
        let url = Url::parse(uri).map_err(|_| MagnetLinkError::NotMagnet)?;
        if url.scheme() != "magnet" {
            return Err(MagnetLinkError::NotMagnet);
        }

        let query = url.query().ok_or(MagnetLinkError::NoQuery)?;

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();
        let mut webseeds = Vec::new();

        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "xt" if info_hash.is_none() => {
                    info_hash = Some(parse_xt(&value)?);
                }
                "dn" if display_name.is_none() => {
                    display_name = Some(value.into_owned());
                }
                "tr" if trackers.len() < MAGNET_URL_CAP => {
                    let tracker_url = Url::parse(&value)
                        .map_err(|e| MagnetLinkError::MalformedUrl(e.to_string()))?;
                    trackers.push(tracker_url);
                }
                "ws" if webseeds.len() < MAGNET_URL_CAP => {
                    let ws_url = Url::parse(&value)
                        .map_err(|e| MagnetLinkError::MalformedUrl(e.to_string()))?;
                    webseeds.push(ws_url);
                }
                _ => {}
            }
        }

        Ok(MagnetLink {
            info_hash: info_hash.ok_or(MagnetLinkError::MissingXt)?,
            display_name,
            trackers,
            webseeds,
        })
    }

    /// The tracker list with any `udp://` entries rewritten to `http://`
    /// on the same host/path, for trackers that only advertise a UDP
    /// announce URL but also happen to answer HTTP announces on the same
    /// host.
    pub fn http_announce_urls(&self) -> Vec<Url> {
        self.trackers
            .iter()
            .filter_map(|u| {
                if u.scheme() == "udp" {
                    let mut rewritten = u.clone();
                    rewritten.set_scheme("http").ok()?;
                    if rewritten.path() == "/" || rewritten.path().is_empty() {
                        rewritten.set_path("/announce");
                    }
                    Some(rewritten)
                } else if u.scheme() == "http" || u.scheme() == "https" {
                    Some(u.clone())
                } else {
                    None
                }
            })
            .collect()
    }
}
