//! The binary codec for the metadata container embedded in card images.
//!
//! A card image is a PNG whose `tEXt` (stored verbatim) or `zTXt`
//! (zlib-deflate) chunk carries a `chara\0base64(json)` payload. The codec is
//! pure: it reads and writes byte buffers and performs no I/O of its own.
//!
//! Decoding treats a missing signature or a missing carrier chunk as a
//! legitimate empty result. Structural damage (a declared chunk length
//! running past the end of the buffer) fails closed instead of reading out
//! of bounds.

use std::io::Read;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::read::ZlibDecoder;
use thiserror::Error;

use crate::card::CharacterCard;
use crate::error::TranslationError;

/// The fixed 8-byte PNG signature.
const SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// The keyword identifying the carrier chunk's payload.
const KEYWORD: &[u8] = b"chara";

const TYPE_TEXT: &[u8; 4] = b"tEXt";
const TYPE_ZTXT: &[u8; 4] = b"zTXt";
const TYPE_END: &[u8; 4] = b"IEND";

/// The fixed terminal chunk: zero length, `IEND`, and its well-known CRC.
const END_CHUNK: [u8; 12] = [
    0x00, 0x00, 0x00, 0x00, b'I', b'E', b'N', b'D', 0xAE, 0x42, 0x60, 0x82,
];

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("chunk length runs past the end of the image")]
    Truncated,
    #[error("output image is missing the PNG signature")]
    MissingSignature,
    #[error("carrier chunk payload is not valid: {0}")]
    InvalidCarrier(String),
    #[error("carrier document is not valid JSON")]
    Json(#[from] serde_json::Error),
}

impl From<CodecError> for TranslationError {
    fn from(value: CodecError) -> Self {
        TranslationError::file(value.to_string())
    }
}

struct Chunk<'a> {
    kind: &'a [u8],
    payload: &'a [u8],
    /// The whole chunk including length, type, payload and checksum.
    raw: &'a [u8],
}

/// Walks the chunk sequence, failing closed on malformed lengths.
fn chunks(data: &[u8]) -> impl Iterator<Item = Result<Chunk<'_>, CodecError>> {
    let mut offset = SIGNATURE.len();
    std::iter::from_fn(move || {
        if offset >= data.len() {
            return None;
        }
        if data.len() - offset < 8 {
            offset = data.len();
            return Some(Err(CodecError::Truncated));
        }
        let length = u32::from_be_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]) as usize;
        let Some(end) = offset
            .checked_add(12)
            .and_then(|n| n.checked_add(length))
            .filter(|&n| n <= data.len())
        else {
            offset = data.len();
            return Some(Err(CodecError::Truncated));
        };
        let chunk = Chunk {
            kind: &data[offset + 4..offset + 8],
            payload: &data[offset + 8..offset + 8 + length],
            raw: &data[offset..end],
        };
        offset = end;
        Some(Ok(chunk))
    })
}

/// Extracts the payload of the carrier chunk, inflating `zTXt` payloads.
fn carrier_payload(chunk: &Chunk<'_>) -> Result<Option<Vec<u8>>, CodecError> {
    let text = if chunk.kind == TYPE_ZTXT {
        let mut inflated = Vec::new();
        ZlibDecoder::new(chunk.payload)
            .read_to_end(&mut inflated)
            .map_err(|err| CodecError::InvalidCarrier(err.to_string()))?;
        inflated
    } else {
        chunk.payload.to_vec()
    };
    let Some(separator) = text.iter().position(|&byte| byte == 0) else {
        return Ok(None);
    };
    if &text[..separator] != KEYWORD {
        return Ok(None);
    }
    Ok(Some(text[separator + 1..].to_vec()))
}

/// Reads the embedded card document out of a PNG image.
///
/// Returns `Ok(None)` when the buffer is not a PNG or no chunk carries the
/// keyword. Callers must treat that as an empty result, not a failure.
pub fn decode(data: &[u8]) -> Result<Option<CharacterCard>, CodecError> {
    if !data.starts_with(&SIGNATURE) {
        return Ok(None);
    }
    for chunk in chunks(data) {
        let chunk = chunk?;
        if chunk.kind != TYPE_TEXT && chunk.kind != TYPE_ZTXT {
            continue;
        }
        if let Some(value) = carrier_payload(&chunk)? {
            let json = BASE64
                .decode(value)
                .map_err(|err| CodecError::InvalidCarrier(err.to_string()))?;
            return Ok(Some(serde_json::from_slice(&json)?));
        }
    }
    Ok(None)
}

/// Rebuilds the image with `card` as its only embedded document.
///
/// Every chunk of the source is copied except text-carrying chunks and the
/// terminal end marker; a fresh carrier chunk is written immediately before
/// a fresh end marker, which is always last.
pub fn encode(source: &[u8], card: &CharacterCard) -> Result<Vec<u8>, CodecError> {
    if !source.starts_with(&SIGNATURE) {
        return Err(CodecError::MissingSignature);
    }
    let mut output = Vec::with_capacity(source.len());
    output.extend_from_slice(&SIGNATURE);
    for chunk in chunks(source) {
        let chunk = chunk?;
        if chunk.kind == TYPE_TEXT || chunk.kind == TYPE_ZTXT || chunk.kind == TYPE_END {
            continue;
        }
        output.extend_from_slice(chunk.raw);
    }

    let mut payload = Vec::from(KEYWORD);
    payload.push(0);
    payload.extend_from_slice(BASE64.encode(serde_json::to_vec(card)?).as_bytes());

    output.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    output.extend_from_slice(TYPE_TEXT);
    output.extend_from_slice(&payload);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(TYPE_TEXT);
    hasher.update(&payload);
    output.extend_from_slice(&hasher.finalize().to_be_bytes());

    output.extend_from_slice(&END_CHUNK);
    Ok(output)
}
