//! The streaming response parser: turns a connection's raw inbound byte
//! stream into a sequence of logical items, ordered per stream id.
//!
//! Small/non-Rows frames are buffered whole and decoded once. `RESULT`
//! `Rows` frames are, by default, also buffered whole - the common case,
//! since result sets this driver fetches are page-sized and modest. A
//! caller may opt a stream id into row-by-row mode before sending the
//! request that will produce it (`expect_row_by_row`); once opted in, the
//! parser decodes the Rows metadata once and then emits one
//! `ResponseItem::Row` per row as bytes arrive, never holding more than the
//! metadata plus the one row currently in progress.
//!
//! `tokio_util::codec::Decoder::decode` is called in a loop by `Framed`
//! until it returns `Ok(None)` - exactly the pull-producer shape row-by-row
//! emission needs. Every logical item a frame produces (including the
//! trailing `FrameEnded` marker every frame ends with) is queued on the
//! in-progress frame's state and drained one per `decode` call, so a
//! single call never does more than one unit of either I/O-bound work
//! (consuming bytes) or item production.

use std::collections::{HashMap, VecDeque};

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use crate::constant::{Opcode, ResultKind};
use crate::error::{Error, Result};
use crate::protocol::frame::{read_flags_block, FlagsBlock, FrameHeader};
use crate::protocol::primitive::{read_bytes, read_int, read_string};
use crate::protocol::response::{
    read_authenticate, read_auth_token, read_event, read_prepared, read_schema_change,
    read_server_error, read_supported, PreparedResult, Row, SchemaChange, ServerEvent, ServerError,
};
use crate::protocol::row::{read_rows_metadata, ColumnSpec, RowsMetadata};
use crate::value::CqlValue;

/// One parsed response, tagged with the stream id it belongs to.
#[derive(Debug)]
pub enum ResponseItem {
    Ready { stream_id: i16 },
    Authenticate { stream_id: i16, authenticator: String },
    AuthChallenge { stream_id: i16, token: Option<Vec<u8>> },
    AuthSuccess { stream_id: i16, token: Option<Vec<u8>> },
    Supported { stream_id: i16, options: Vec<(String, Vec<String>)> },
    Error { stream_id: i16, error: ServerError },
    Void { stream_id: i16, tracing_id: Option<[u8; 16]>, warnings: Vec<String> },
    SetKeyspace { stream_id: i16, keyspace: String },
    Prepared { stream_id: i16, result: PreparedResult },
    SchemaChange { stream_id: i16, change: SchemaChange },
    /// A fully buffered result set (row-by-row mode was not requested for
    /// this stream id).
    Rows {
        stream_id: i16,
        metadata: RowsMetadata,
        rows: Vec<Row>,
        tracing_id: Option<[u8; 16]>,
        warnings: Vec<String>,
    },
    /// Begins a row-by-row result set. Always followed by `total_rows`
    /// `Row` items, then `RowsEnd` (immediately, if `total_rows == 0`).
    RowsStart { stream_id: i16, metadata: RowsMetadata, total_rows: usize },
    Row { stream_id: i16, values: Vec<CqlValue> },
    RowsEnd { stream_id: i16 },
    Event { stream_id: i16, event: ServerEvent },
    /// Emitted once, last, for every frame regardless of opcode: the
    /// stream id's in-flight slot may be released once this has been seen,
    /// and not before.
    FrameEnded { stream_id: i16 },
}

impl ResponseItem {
    pub fn stream_id(&self) -> i16 {
        match self {
            Self::Ready { stream_id }
            | Self::Authenticate { stream_id, .. }
            | Self::AuthChallenge { stream_id, .. }
            | Self::AuthSuccess { stream_id, .. }
            | Self::Supported { stream_id, .. }
            | Self::Error { stream_id, .. }
            | Self::Void { stream_id, .. }
            | Self::SetKeyspace { stream_id, .. }
            | Self::Prepared { stream_id, .. }
            | Self::SchemaChange { stream_id, .. }
            | Self::Rows { stream_id, .. }
            | Self::RowsStart { stream_id, .. }
            | Self::Row { stream_id, .. }
            | Self::RowsEnd { stream_id }
            | Self::Event { stream_id, .. }
            | Self::FrameEnded { stream_id } => *stream_id,
        }
    }
}

enum Mode {
    /// Waiting on the flags block (and, for `RESULT`, the `[int] kind`)
    /// before the frame's real mode can be chosen.
    Preamble,
    /// Waiting for `remaining` more body bytes before decoding the whole
    /// buffered body in one pass. `body` already holds anything consumed
    /// while still in `Preamble` (e.g. a `RESULT`'s `[int] kind`).
    Buffered { body: Vec<u8>, remaining: usize },
    /// Row-by-row: metadata known, `row_index` of `total_rows` emitted.
    ReadingRows {
        columns: Vec<ColumnSpec>,
        total_rows: usize,
        row_index: usize,
        current_column: usize,
        current_row_values: Vec<CqlValue>,
    },
}

struct FrameState {
    header: FrameHeader,
    flags: FlagsBlock,
    mode: Mode,
    pending: VecDeque<ResponseItem>,
}

impl FrameState {
    fn finish(&mut self, item: ResponseItem) {
        let stream_id = self.header.stream_id;
        self.pending.push_back(item);
        self.pending.push_back(ResponseItem::FrameEnded { stream_id });
    }
}

/// Parses one connection's inbound byte stream. Row-by-row mode is
/// requested per stream id via [`StreamingParser::expect_row_by_row`]
/// before the request that will produce it is sent; the flag is consumed
/// the first time a matching `RESULT` `Rows` frame is seen.
#[derive(Default)]
pub struct StreamingParser {
    in_progress: Option<FrameState>,
    row_by_row_wanted: HashMap<i16, bool>,
}

impl StreamingParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_row_by_row(&mut self, stream_id: i16) {
        self.row_by_row_wanted.insert(stream_id, true);
    }

    fn wants_row_by_row(&mut self, stream_id: i16) -> bool {
        self.row_by_row_wanted.remove(&stream_id).unwrap_or(false)
    }
}

impl StreamingParser {
    /// Pop and return the in-progress frame's next queued item, if any,
    /// clearing `in_progress` once `FrameEnded` has been drained.
    fn pop_pending(&mut self) -> Option<ResponseItem> {
        let state = self.in_progress.as_mut()?;
        let item = state.pending.pop_front()?;
        if state.pending.is_empty() && matches!(item, ResponseItem::FrameEnded { .. }) {
            self.in_progress = None;
        }
        Some(item)
    }
}

impl Decoder for StreamingParser {
    type Item = ResponseItem;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ResponseItem>> {
        if let Some(item) = self.pop_pending() {
            return Ok(Some(item));
        }

        if self.in_progress.is_none() {
            let (header, consumed) = match FrameHeader::decode(src) {
                Ok((header, rest)) => (header, src.len() - rest.len()),
                Err(Error::NeedMoreData { .. }) => return Ok(None),
                Err(e) => return Err(e),
            };
            src.advance(consumed);
            self.in_progress = Some(FrameState {
                header,
                flags: FlagsBlock::default(),
                mode: Mode::Preamble,
                pending: VecDeque::new(),
            });
        }

        let stream_id = self
            .in_progress
            .as_ref()
            .unwrap_or_else(|| unreachable!("populated immediately above"))
            .header
            .stream_id;

        if matches!(
            self.in_progress.as_ref().unwrap_or_else(|| unreachable!("populated above")).mode,
            Mode::Preamble
        ) {
            let header = self.in_progress.as_ref().unwrap_or_else(|| unreachable!()).header;
            let Some((flags, consumed)) = try_read(src, |d| read_flags_block(header.flags, d))? else {
                return Ok(None);
            };
            src.advance(consumed);
            let preamble_bytes = preamble_consumed(&flags);

            if header.opcode != Opcode::Result {
                let remaining = (header.body_length as usize).saturating_sub(preamble_bytes);
                let state = self.in_progress.as_mut().unwrap_or_else(|| unreachable!());
                state.flags = flags;
                state.mode = Mode::Buffered { body: Vec::new(), remaining };
            } else {
                let Some((kind_raw, kind_len)) = try_read(src, read_int)? else {
                    return Ok(None);
                };
                let kind = ResultKind::from_u32(kind_raw as u32)
                    .ok_or_else(|| Error::protocol(format!("unknown RESULT kind {kind_raw}")))?;

                // `wants_row_by_row` needs `&mut self`, so it must be called
                // before `state` (borrowed from `self.in_progress`) is taken.
                let want_row_by_row = kind == ResultKind::Rows && self.wants_row_by_row(stream_id);

                if want_row_by_row {
                    let Some((metadata, meta_len)) = try_read(&src[kind_len..], read_rows_metadata)? else {
                        return Ok(None);
                    };
                    let Some((total_rows, count_len)) =
                        try_read(&src[kind_len + meta_len..], read_int)?
                    else {
                        return Ok(None);
                    };
                    src.advance(kind_len + meta_len + count_len);
                    let total_rows = total_rows.max(0) as usize;
                    let state = self.in_progress.as_mut().unwrap_or_else(|| unreachable!());
                    state.flags = flags;
                    state.pending.push_back(ResponseItem::RowsStart {
                        stream_id,
                        metadata: metadata.clone(),
                        total_rows,
                    });
                    if total_rows == 0 {
                        state.finish(ResponseItem::RowsEnd { stream_id });
                    }
                    state.mode = Mode::ReadingRows {
                        columns: metadata.columns,
                        total_rows,
                        row_index: 0,
                        current_column: 0,
                        current_row_values: Vec::new(),
                    };
                } else {
                    src.advance(kind_len);
                    let remaining =
                        (header.body_length as usize).saturating_sub(preamble_bytes + kind_len);
                    let state = self.in_progress.as_mut().unwrap_or_else(|| unreachable!());
                    state.flags = flags;
                    state.mode = Mode::Buffered {
                        body: kind_raw.to_be_bytes().to_vec(),
                        remaining,
                    };
                }
            }
        }

        if let Some(item) = self.pop_pending() {
            return Ok(Some(item));
        }

        let state = self
            .in_progress
            .as_mut()
            .unwrap_or_else(|| unreachable!("frame state is only cleared once fully drained"));

        match &mut state.mode {
            Mode::Preamble => Ok(None),
            Mode::Buffered { body, remaining } => {
                let take = (*remaining).min(src.len());
                if take > 0 {
                    body.extend_from_slice(&src[..take]);
                    src.advance(take);
                    *remaining -= take;
                }
                if *remaining > 0 {
                    return Ok(None);
                }
                let header = state.header;
                let flags = std::mem::take(&mut state.flags);
                let body = std::mem::take(body);
                let item = decode_buffered(header, flags, &body)?;
                let state = self.in_progress.as_mut().unwrap_or_else(|| unreachable!());
                state.finish(item);
                Ok(self.pop_pending())
            }
            Mode::ReadingRows {
                columns,
                total_rows,
                row_index,
                current_column,
                current_row_values,
            } => {
                if *row_index >= *total_rows {
                    return Ok(None);
                }
                while *current_column < columns.len() {
                    let Some((cell, consumed)) = try_read(src, read_bytes)? else {
                        return Ok(None);
                    };
                    let value = match cell {
                        Some(bytes) => {
                            CqlValue::decode(&columns[*current_column].ty, bytes).map_err(|e| Error::Decode {
                                row: *row_index,
                                column: *current_column,
                                message: e.to_string(),
                            })?
                        }
                        None => CqlValue::Null,
                    };
                    src.advance(consumed);
                    current_row_values.push(value);
                    *current_column += 1;
                }
                let values = std::mem::take(current_row_values);
                *current_column = 0;
                *row_index += 1;
                let finished = *row_index >= *total_rows;
                if finished {
                    self.row_by_row_wanted.remove(&stream_id);
                }
                let state = self.in_progress.as_mut().unwrap_or_else(|| unreachable!());
                if finished {
                    state.finish(ResponseItem::RowsEnd { stream_id });
                }
                Ok(Some(ResponseItem::Row { stream_id, values }))
            }
        }
    }
}

/// Try a fallible `(T, &[u8])` reader against `data`, translating
/// `NeedMoreData` into `Ok(None)` and returning the number of bytes
/// consumed rather than the trailing slice, so the caller can `advance`
/// the shared buffer itself once it commits to the read.
fn try_read<'d, T>(
    data: &'d [u8],
    reader: impl FnOnce(&'d [u8]) -> Result<(T, &'d [u8])>,
) -> Result<Option<(T, usize)>> {
    match reader(data) {
        Ok((value, rest)) => Ok(Some((value, data.len() - rest.len()))),
        Err(Error::NeedMoreData { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use crate::constant::{HeaderFlags, ProtocolVersion, RowsFlags};
    use crate::protocol::primitive::{write_int, write_short, write_string};

    use super::*;

    fn frame_header_bytes(stream_id: i16, opcode: Opcode, body_len: usize) -> Vec<u8> {
        let header = FrameHeader {
            version: ProtocolVersion::V4,
            is_response: true,
            flags: HeaderFlags::empty(),
            stream_id,
            opcode,
            body_length: body_len as u32,
        };
        let mut out = Vec::new();
        header.encode(&mut out);
        out
    }

    fn two_int_column_rows_body(rows: &[[i32; 2]]) -> Vec<u8> {
        let mut body = Vec::new();
        write_int(&mut body, ResultKind::Rows as i32);
        write_int(&mut body, RowsFlags::GLOBAL_TABLES_SPEC.bits() as i32);
        write_int(&mut body, 2); // column count
        write_string(&mut body, "ks");
        write_string(&mut body, "tbl");
        write_string(&mut body, "a");
        write_short(&mut body, 0x0009); // INT
        write_string(&mut body, "b");
        write_short(&mut body, 0x0009); // INT
        write_int(&mut body, rows.len() as i32);
        for row in rows {
            for col in row {
                write_int(&mut body, 4);
                write_int(&mut body, *col);
            }
        }
        body
    }

    fn void_frame(stream_id: i16) -> Vec<u8> {
        let mut body = Vec::new();
        write_int(&mut body, ResultKind::Void as i32);
        let mut frame = frame_header_bytes(stream_id, Opcode::Result, body.len());
        frame.extend_from_slice(&body);
        frame
    }

    /// Feeds `full` to a fresh decoder one byte at a time and collects every
    /// emitted item, proving arbitrary chunk splits don't change the result
    /// (spec's "same item sequence as a single-chunk feed" invariant).
    fn decode_byte_by_byte(full: &[u8]) -> Vec<ResponseItem> {
        let mut parser = StreamingParser::new();
        let mut buf = BytesMut::new();
        let mut items = Vec::new();
        for &byte in full {
            buf.extend_from_slice(&[byte]);
            while let Some(item) = parser.decode(&mut buf).unwrap() {
                items.push(item);
            }
        }
        while let Some(item) = parser.decode(&mut buf).unwrap() {
            items.push(item);
        }
        items
    }

    #[test]
    fn void_result_emits_exactly_one_item_then_frame_ended() {
        let frame = void_frame(5);
        let items = decode_byte_by_byte(&frame);
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], ResponseItem::Void { stream_id: 5, .. }));
        assert!(matches!(items[1], ResponseItem::FrameEnded { stream_id: 5 }));
    }

    #[test]
    fn buffered_rows_of_zero_emits_empty_rows_then_frame_ended() {
        let body = two_int_column_rows_body(&[]);
        let mut frame = frame_header_bytes(9, Opcode::Result, body.len());
        frame.extend_from_slice(&body);

        let items = decode_byte_by_byte(&frame);
        assert_eq!(items.len(), 2);
        match &items[0] {
            ResponseItem::Rows { stream_id, rows, .. } => {
                assert_eq!(*stream_id, 9);
                assert!(rows.is_empty());
            }
            other => panic!("expected Rows, got {other:?}"),
        }
        assert!(matches!(items[1], ResponseItem::FrameEnded { stream_id: 9 }));
    }

    #[test]
    fn buffered_rows_decode_bit_exact_across_arbitrary_chunk_splits() {
        let body = two_int_column_rows_body(&[[1, 2], [3, 4]]);
        let mut frame = frame_header_bytes(1, Opcode::Result, body.len());
        frame.extend_from_slice(&body);

        let items = decode_byte_by_byte(&frame);
        assert_eq!(items.len(), 2);
        match &items[0] {
            ResponseItem::Rows { rows, .. } => {
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[0], vec![CqlValue::Int(1), CqlValue::Int(2)]);
                assert_eq!(rows[1], vec![CqlValue::Int(3), CqlValue::Int(4)]);
            }
            other => panic!("expected Rows, got {other:?}"),
        }
    }

    #[test]
    fn row_by_row_mode_emits_rows_start_then_n_rows_then_rows_end() {
        let body = two_int_column_rows_body(&[[10, 20], [30, 40]]);
        let mut frame = frame_header_bytes(3, Opcode::Result, body.len());
        frame.extend_from_slice(&body);

        let mut parser = StreamingParser::new();
        parser.expect_row_by_row(3);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame);

        let mut items = Vec::new();
        while let Some(item) = parser.decode(&mut buf).unwrap() {
            items.push(item);
        }

        assert_eq!(items.len(), 5); // RowsStart, Row, Row, RowsEnd, FrameEnded
        assert!(matches!(items[0], ResponseItem::RowsStart { total_rows: 2, stream_id: 3, .. }));
        assert!(matches!(items[1], ResponseItem::Row { stream_id: 3, .. }));
        assert!(matches!(items[2], ResponseItem::Row { stream_id: 3, .. }));
        assert!(matches!(items[3], ResponseItem::RowsEnd { stream_id: 3 }));
        assert!(matches!(items[4], ResponseItem::FrameEnded { stream_id: 3 }));

        if let ResponseItem::Row { values, .. } = &items[1] {
            assert_eq!(values, &vec![CqlValue::Int(10), CqlValue::Int(20)]);
        }
    }

    #[test]
    fn row_by_row_mode_resumes_across_a_split_in_the_middle_of_a_cell() {
        let body = two_int_column_rows_body(&[[100, 200]]);
        let mut frame = frame_header_bytes(4, Opcode::Result, body.len());
        frame.extend_from_slice(&body);

        let mut parser = StreamingParser::new();
        parser.expect_row_by_row(4);
        let mut buf = BytesMut::new();

        // Split right in the middle of the second cell's 4-byte length+value.
        let split_at = frame.len() - 3;
        buf.extend_from_slice(&frame[..split_at]);
        let mut items = Vec::new();
        while let Some(item) = parser.decode(&mut buf).unwrap() {
            items.push(item);
        }
        // Only RowsStart could have been emitted so far; the row is still
        // waiting on the rest of its second cell.
        assert!(items.iter().all(|i| matches!(i, ResponseItem::RowsStart { .. })));

        buf.extend_from_slice(&frame[split_at..]);
        while let Some(item) = parser.decode(&mut buf).unwrap() {
            items.push(item);
        }

        let rows: Vec<_> = items
            .iter()
            .filter_map(|i| match i {
                ResponseItem::Row { values, .. } => Some(values.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(rows, vec![vec![CqlValue::Int(100), CqlValue::Int(200)]]);
        assert!(items.iter().any(|i| matches!(i, ResponseItem::RowsEnd { .. })));
        assert!(items.iter().any(|i| matches!(i, ResponseItem::FrameEnded { .. })));
    }

    #[test]
    fn two_consecutive_frames_on_different_stream_ids_decode_independently() {
        let mut combined = void_frame(1);
        combined.extend_from_slice(&void_frame(2));

        let items = decode_byte_by_byte(&combined);
        assert_eq!(items.len(), 4);
        assert!(matches!(items[0], ResponseItem::Void { stream_id: 1, .. }));
        assert!(matches!(items[1], ResponseItem::FrameEnded { stream_id: 1 }));
        assert!(matches!(items[2], ResponseItem::Void { stream_id: 2, .. }));
        assert!(matches!(items[3], ResponseItem::FrameEnded { stream_id: 2 }));
    }
}

fn preamble_consumed(flags: &FlagsBlock) -> usize {
    let mut n = 0;
    if flags.tracing_id.is_some() {
        n += 16;
    }
    if !flags.warnings.is_empty() {
        n += 2 + flags.warnings.iter().map(|w| 2 + w.len()).sum::<usize>();
    }
    if !flags.custom_payload.is_empty() {
        n += 2 + flags
            .custom_payload
            .iter()
            .map(|(k, v)| 2 + k.len() + 4 + v.len())
            .sum::<usize>();
    }
    n
}

fn decode_buffered(header: FrameHeader, flags: FlagsBlock, body: &[u8]) -> Result<ResponseItem> {
    let stream_id = header.stream_id;
    Ok(match header.opcode {
        Opcode::Ready => ResponseItem::Ready { stream_id },
        Opcode::Authenticate => ResponseItem::Authenticate {
            stream_id,
            authenticator: read_authenticate(body)?,
        },
        Opcode::AuthChallenge => ResponseItem::AuthChallenge { stream_id, token: read_auth_token(body)? },
        Opcode::AuthSuccess => ResponseItem::AuthSuccess { stream_id, token: read_auth_token(body)? },
        Opcode::Supported => ResponseItem::Supported { stream_id, options: read_supported(body)? },
        Opcode::Error => ResponseItem::Error { stream_id, error: read_server_error(body)? },
        Opcode::Event => ResponseItem::Event { stream_id, event: read_event(body)? },
        Opcode::Result => {
            let (kind_raw, rest) = read_int(body)?;
            let kind = ResultKind::from_u32(kind_raw as u32)
                .ok_or_else(|| Error::protocol(format!("unknown RESULT kind {kind_raw}")))?;
            match kind {
                ResultKind::Void => ResponseItem::Void {
                    stream_id,
                    tracing_id: flags.tracing_id,
                    warnings: flags.warnings,
                },
                ResultKind::SetKeyspace => {
                    let (keyspace, _) = read_string(rest)?;
                    ResponseItem::SetKeyspace { stream_id, keyspace: keyspace.to_owned() }
                }
                ResultKind::Prepared => ResponseItem::Prepared {
                    stream_id,
                    result: read_prepared(rest, header.version)?,
                },
                ResultKind::SchemaChange => {
                    ResponseItem::SchemaChange { stream_id, change: read_schema_change(rest)? }
                }
                ResultKind::Rows => {
                    let (metadata, rest) = read_rows_metadata(rest)?;
                    let (row_count, mut rest) = read_int(rest)?;
                    let mut rows = Vec::with_capacity(row_count.max(0) as usize);
                    for row_idx in 0..row_count.max(0) as usize {
                        let mut values = Vec::with_capacity(metadata.columns.len());
                        for (col_idx, col) in metadata.columns.iter().enumerate() {
                            let (cell, next) = read_bytes(rest)?;
                            values.push(match cell {
                                Some(bytes) => {
                                    CqlValue::decode(&col.ty, bytes).map_err(|e| Error::Decode {
                                        row: row_idx,
                                        column: col_idx,
                                        message: e.to_string(),
                                    })?
                                }
                                None => CqlValue::Null,
                            });
                            rest = next;
                        }
                        rows.push(values);
                    }
                    ResponseItem::Rows {
                        stream_id,
                        metadata,
                        rows,
                        tracing_id: flags.tracing_id,
                        warnings: flags.warnings,
                    }
                }
            }
        }
        other => return Err(Error::protocol(format!("unexpected opcode {other:?} in a response frame"))),
    })
}
