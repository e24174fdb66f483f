//! v1 binary-chunked wire frame: `[version: u8][chunk...]`, each chunk
//! `[descriptor: u8][size: u32 big-endian][content: size bytes]`.
//!
//! This module only concerns itself with the byte-level chunk structure —
//! splitting a frame into raw envelope/data/debug byte slices, and the
//! inverse for serialization. Schema-aware interpretation (JSON decode,
//! validation, `ParsedMessage` assembly) lives in `codec::mod`.

use crate::constants::{
    chunk_descriptor, CHUNK_METADATA_SIZE, MIN_ENVELOPE_SIZE, SUPPORTED_VERSIONS,
    VERSION_FIELD_SIZE,
};
use crate::error::{PcpError, Result};

/// A single parsed chunk: its descriptor byte and raw content.
#[derive(Debug, Clone)]
pub struct RawChunk {
    pub descriptor: u8,
    pub content: Vec<u8>,
}

impl RawChunk {
    pub fn chunk_type(&self) -> u8 {
        self.descriptor & chunk_descriptor::TYPE_MASK
    }
}

/// The raw (not-yet-schema-validated) result of splitting a v1 frame into
/// its constituent chunks.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub envelope: Vec<u8>,
    pub data: Option<RawChunk>,
    pub debug: Vec<Vec<u8>>,
}

/// Splits a v1 wire frame into its envelope/data/debug chunk contents.
///
/// Mirrors the reference parser's exact error conditions: a too-small
/// buffer, an unsupported version, a first chunk that isn't the envelope, a
/// declared chunk size exceeding the remaining buffer, a duplicate data
/// chunk, and an unrecognized descriptor all fail with `MessageSerialization`
/// (version mismatch fails with `UnsupportedVersion` specifically). Trailing
/// bytes too short to hold another chunk's metadata are tolerated and
/// dropped; callers should log a warning when `trailing_ignored` is `true`.
pub fn parse_frame(bytes: &[u8]) -> Result<RawFrame> {
    if bytes.len() < MIN_ENVELOPE_SIZE {
        return Err(PcpError::MessageSerialization(format!(
            "frame of {} bytes is shorter than the minimum envelope size of {MIN_ENVELOPE_SIZE}",
            bytes.len()
        )));
    }

    let version = bytes[0];
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(PcpError::UnsupportedVersion(version));
    }

    let mut offset = VERSION_FIELD_SIZE;
    let mut envelope: Option<Vec<u8>> = None;
    let mut data: Option<RawChunk> = None;
    let mut debug = Vec::new();
    let mut first = true;

    loop {
        let remaining = bytes.len() - offset;
        if remaining == 0 {
            break;
        }
        if remaining < CHUNK_METADATA_SIZE {
            // Trailing bytes too short to be a chunk header: tolerated.
            break;
        }

        let descriptor = bytes[offset];
        let size = u32::from_be_bytes(
            bytes[offset + 1..offset + 5]
                .try_into()
                .expect("slice of len 4"),
        ) as usize;
        let content_start = offset + CHUNK_METADATA_SIZE;
        let content_end = content_start
            .checked_add(size)
            .ok_or_else(|| PcpError::MessageSerialization("chunk size overflow".into()))?;
        if content_end > bytes.len() {
            return Err(PcpError::MessageSerialization(format!(
                "chunk declares size {size} exceeding the {} remaining bytes",
                bytes.len() - content_start
            )));
        }
        let content = bytes[content_start..content_end].to_vec();

        match descriptor & chunk_descriptor::TYPE_MASK {
            chunk_descriptor::ENVELOPE => {
                if !first {
                    return Err(PcpError::MessageSerialization(
                        "envelope chunk must be the first chunk in the frame".into(),
                    ));
                }
                envelope = Some(content);
            }
            chunk_descriptor::DATA => {
                if data.is_some() {
                    return Err(PcpError::MessageSerialization(
                        "more than one data chunk in frame".into(),
                    ));
                }
                data = Some(RawChunk { descriptor, content });
            }
            chunk_descriptor::DEBUG => {
                debug.push(content);
            }
            other => {
                return Err(PcpError::MessageSerialization(format!(
                    "unknown chunk descriptor {other:#x}"
                )));
            }
        }

        if first && envelope.is_none() {
            return Err(PcpError::MessageSerialization(
                "first chunk must be the envelope chunk".into(),
            ));
        }
        first = false;
        offset = content_end;
    }

    let envelope = envelope.ok_or_else(|| {
        PcpError::MessageSerialization("frame did not contain an envelope chunk".into())
    })?;

    Ok(RawFrame { envelope, data, debug })
}

/// Encodes one chunk: descriptor byte, big-endian u32 size, content.
fn write_chunk(out: &mut Vec<u8>, descriptor: u8, content: &[u8]) {
    out.push(descriptor);
    out.extend_from_slice(&(content.len() as u32).to_be_bytes());
    out.extend_from_slice(content);
}

/// Serializes an envelope (plus optional data and debug chunks) into a
/// complete v1 wire frame, version byte first.
pub fn serialize_frame(envelope: &[u8], data: Option<(u8, &[u8])>, debug: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(MIN_ENVELOPE_SIZE + envelope.len());
    out.push(SUPPORTED_VERSIONS[0]);
    write_chunk(&mut out, chunk_descriptor::ENVELOPE, envelope);
    if let Some((descriptor, content)) = data {
        write_chunk(&mut out, descriptor, content);
    }
    for item in debug {
        write_chunk(&mut out, chunk_descriptor::DEBUG, item);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_buffer_shorter_than_minimum() {
        let err = parse_frame(&[1, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, PcpError::MessageSerialization(_)));
    }

    #[test]
    fn rejects_unsupported_version() {
        let bytes = serialize_frame(b"{}", None, &[]);
        let mut bytes = bytes;
        bytes[0] = 2;
        let err = parse_frame(&bytes).unwrap_err();
        assert!(matches!(err, PcpError::UnsupportedVersion(2)));
    }

    #[test]
    fn round_trips_envelope_only() {
        let bytes = serialize_frame(br#"{"id":"a"}"#, None, &[]);
        let frame = parse_frame(&bytes).unwrap();
        assert_eq!(frame.envelope, br#"{"id":"a"}"#);
        assert!(frame.data.is_none());
        assert!(frame.debug.is_empty());
    }

    #[test]
    fn round_trips_envelope_data_and_debug() {
        let debug = vec![b"hop1".to_vec(), b"hop2".to_vec()];
        let bytes = serialize_frame(
            br#"{"id":"a"}"#,
            Some((chunk_descriptor::DATA, b"payload")),
            &debug,
        );
        let frame = parse_frame(&bytes).unwrap();
        assert_eq!(frame.envelope, br#"{"id":"a"}"#);
        assert_eq!(frame.data.unwrap().content, b"payload");
        assert_eq!(frame.debug, debug);
    }

    #[test]
    fn rejects_second_data_chunk() {
        let mut bytes = serialize_frame(br#"{"id":"a"}"#, Some((chunk_descriptor::DATA, b"x")), &[]);
        // Append a second data chunk by hand.
        write_chunk(&mut bytes, chunk_descriptor::DATA, b"y");
        let err = parse_frame(&bytes).unwrap_err();
        assert!(matches!(err, PcpError::MessageSerialization(_)));
    }

    #[test]
    fn rejects_declared_size_exceeding_remaining_bytes() {
        let mut bytes = serialize_frame(br#"{"id":"a"}"#, None, &[]);
        let len = bytes.len();
        // Corrupt the envelope chunk's size field to claim more bytes than exist.
        bytes[2..6].copy_from_slice(&((len as u32) + 100).to_be_bytes());
        let err = parse_frame(&bytes).unwrap_err();
        assert!(matches!(err, PcpError::MessageSerialization(_)));
    }

    #[test]
    fn rejects_unknown_descriptor() {
        let mut bytes = serialize_frame(br#"{"id":"a"}"#, None, &[]);
        write_chunk(&mut bytes, 0x09, b"?");
        let err = parse_frame(&bytes).unwrap_err();
        assert!(matches!(err, PcpError::MessageSerialization(_)));
    }

    #[test]
    fn tolerates_short_trailing_bytes() {
        let mut bytes = serialize_frame(br#"{"id":"a"}"#, None, &[]);
        bytes.extend_from_slice(&[0xFF, 0xFF]); // shorter than CHUNK_METADATA_SIZE
        let frame = parse_frame(&bytes).unwrap();
        assert_eq!(frame.envelope, br#"{"id":"a"}"#);
    }

    #[test]
    fn rejects_first_chunk_not_envelope() {
        let mut bytes = vec![SUPPORTED_VERSIONS[0]];
        write_chunk(&mut bytes, chunk_descriptor::DATA, b"x");
        let err = parse_frame(&bytes).unwrap_err();
        assert!(matches!(err, PcpError::MessageSerialization(_)));
    }
}
