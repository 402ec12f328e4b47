//! The frame header, and the flags block (tracing id / warnings /
//! custom payload) that immediately follows it on response frames.

use bytes::{Buf, BytesMut};

use crate::constant::{HeaderFlags, Opcode, ProtocolVersion};
use crate::error::{Error, Result};
use crate::protocol::primitive::{read_bytes_map, read_int, read_string_list, read_uuid};

const DIRECTION_RESPONSE: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: ProtocolVersion,
    pub is_response: bool,
    pub flags: HeaderFlags,
    pub stream_id: i16,
    pub opcode: Opcode,
    pub body_length: u32,
}

impl FrameHeader {
    /// Try to decode a header from the front of `data`. Never consumes
    /// partial input - callers pass the still-unconsumed slice back in on
    /// the next attempt.
    pub fn decode(data: &[u8]) -> Result<(Self, &[u8])> {
        let version_byte = *data.first().ok_or(Error::NeedMoreData {
            needed: 1,
            available: 0,
        })?;
        let raw_version = version_byte & !DIRECTION_RESPONSE;
        let version = ProtocolVersion(raw_version);
        let header_len = version.header_len();
        if data.len() < header_len {
            return Err(Error::NeedMoreData {
                needed: header_len,
                available: data.len(),
            });
        }

        let flags = HeaderFlags::from_bits_truncate(data[1]);
        let (stream_id, opcode_idx) = if version.stream_id_len() == 1 {
            (data[2] as i8 as i16, 3)
        } else {
            (i16::from_be_bytes([data[2], data[3]]), 4)
        };
        let opcode = Opcode::from_u8(data[opcode_idx])
            .ok_or_else(|| Error::protocol(format!("unknown opcode {:#04x}", data[opcode_idx])))?;
        let (body_length, _) = read_int(&data[opcode_idx + 1..header_len])?;
        if body_length < 0 {
            return Err(Error::protocol("negative frame body length"));
        }

        Ok((
            FrameHeader {
                version,
                is_response: version_byte & DIRECTION_RESPONSE != 0,
                flags,
                stream_id,
                opcode,
                body_length: body_length as u32,
            },
            &data[header_len..],
        ))
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let version_byte = self.version.0 | if self.is_response { DIRECTION_RESPONSE } else { 0 };
        out.push(version_byte);
        out.push(self.flags.bits());
        if self.version.stream_id_len() == 1 {
            out.push(self.stream_id as u8);
        } else {
            out.extend_from_slice(&self.stream_id.to_be_bytes());
        }
        out.push(self.opcode as u8);
        out.extend_from_slice(&(self.body_length as i32).to_be_bytes());
    }
}

/// Tracing id / warnings / custom payload, read in this fixed order when
/// the corresponding header flag is set (response frames only).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlagsBlock {
    pub tracing_id: Option<[u8; 16]>,
    pub warnings: Vec<String>,
    pub custom_payload: Vec<(String, Vec<u8>)>,
}

pub fn read_flags_block(flags: HeaderFlags, data: &[u8]) -> Result<(FlagsBlock, &[u8])> {
    let mut block = FlagsBlock::default();
    let mut rest = data;
    if flags.contains(HeaderFlags::TRACING) {
        let (id, next) = read_uuid(rest)?;
        block.tracing_id = Some(id);
        rest = next;
    }
    if flags.contains(HeaderFlags::WARNING) {
        let (warnings, next) = read_string_list(rest)?;
        block.warnings = warnings;
        rest = next;
    }
    if flags.contains(HeaderFlags::CUSTOM_PAYLOAD) {
        let (payload, next) = read_bytes_map(rest)?;
        block.custom_payload = payload;
        rest = next;
    }
    Ok((block, rest))
}

/// A buffered, whole-frame `tokio_util::codec::Decoder`: used for the small
/// non-Rows frames (`Opts`/`Startup`/`Error`/`Ready`/... per the codec's
/// buffered regime) and for the handshake, where a frame is always small
/// enough that buffering the whole body is the simplest correct thing to
/// do. The streaming row parser (`protocol::parser`) does not use this -
/// it manages frame headers itself so it can switch to row-by-row
/// decoding before the body is fully buffered.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    header: Option<FrameHeader>,
}

impl tokio_util::codec::Decoder for FrameDecoder {
    type Item = (FrameHeader, BytesMut);
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let header = match self.header {
            Some(h) => h,
            None => match FrameHeader::decode(src) {
                Ok((h, _)) => {
                    src.advance(h.version.header_len());
                    self.header = Some(h);
                    h
                }
                Err(Error::NeedMoreData { .. }) => return Ok(None),
                Err(e) => return Err(e),
            },
        };

        if src.len() < header.body_length as usize {
            return Ok(None);
        }

        let body = src.split_to(header.body_length as usize);
        self.header = None;
        Ok(Some((header, body)))
    }
}
