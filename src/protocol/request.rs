//! Request body encoders: STARTUP, AUTH_RESPONSE, OPTIONS, QUERY, PREPARE,
//! EXECUTE, BATCH, REGISTER.

use crate::constant::Consistency;
use crate::protocol::primitive::*;
use crate::value::CqlValue;

pub fn encode_startup(out: &mut Vec<u8>, options: &[(String, String)]) {
    write_string_map(out, options);
}

pub fn encode_auth_response(out: &mut Vec<u8>, token: &[u8]) {
    write_bytes(out, Some(token));
}

pub fn encode_options(_out: &mut Vec<u8>) {
    // OPTIONS carries an empty body.
}

pub fn encode_register(out: &mut Vec<u8>, event_types: &[String]) {
    write_string_list(out, event_types);
}

/// Body-prefix bytes for the `custom_payload` header flag: a `[bytes map]`
/// written ahead of the opcode's own body, never a body of its own.
pub fn write_custom_payload(out: &mut Vec<u8>, payload: &[(String, Vec<u8>)]) {
    write_bytes_map(out, payload);
}

/// Query flags byte (and, for protocol v5, an extra high byte), controlling
/// which optional fields follow the consistency level in QUERY/EXECUTE.
bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct QueryFlags: u8 {
        const VALUES                = 0x01;
        const SKIP_METADATA          = 0x02;
        const PAGE_SIZE              = 0x04;
        const PAGING_STATE           = 0x08;
        const SERIAL_CONSISTENCY     = 0x10;
        const TIMESTAMP              = 0x20;
        const NAMES_FOR_VALUES       = 0x40;
    }
}

/// The wire parameters shared by QUERY and EXECUTE, carrying everything
/// a `RequestOptions` resolves to once translated to protocol terms.
#[derive(Debug, Clone, Default)]
pub struct QueryParameters {
    pub consistency: Consistency,
    pub values: Vec<(Option<String>, Option<Vec<u8>>)>,
    pub skip_metadata: bool,
    pub page_size: Option<i32>,
    pub paging_state: Option<Vec<u8>>,
    pub serial_consistency: Option<Consistency>,
    pub timestamp: Option<i64>,
}

fn query_flags(params: &QueryParameters) -> QueryFlags {
    let mut flags = QueryFlags::empty();
    if !params.values.is_empty() {
        flags |= QueryFlags::VALUES;
        if params.values.iter().any(|(name, _)| name.is_some()) {
            flags |= QueryFlags::NAMES_FOR_VALUES;
        }
    }
    if params.skip_metadata {
        flags |= QueryFlags::SKIP_METADATA;
    }
    if params.page_size.is_some() {
        flags |= QueryFlags::PAGE_SIZE;
    }
    if params.paging_state.is_some() {
        flags |= QueryFlags::PAGING_STATE;
    }
    if params.serial_consistency.is_some() {
        flags |= QueryFlags::SERIAL_CONSISTENCY;
    }
    if params.timestamp.is_some() {
        flags |= QueryFlags::TIMESTAMP;
    }
    flags
}

fn encode_query_parameters(out: &mut Vec<u8>, params: &QueryParameters) {
    write_short(out, params.consistency.as_u16());
    let flags = query_flags(params);
    write_byte(out, flags.bits());

    if flags.contains(QueryFlags::VALUES) {
        write_short(out, params.values.len() as u16);
        for (name, value) in &params.values {
            if let Some(name) = name {
                write_string(out, name);
            }
            write_bytes(out, value.as_deref());
        }
    }
    if let Some(page_size) = params.page_size {
        write_int(out, page_size);
    }
    if let Some(paging_state) = &params.paging_state {
        write_bytes(out, Some(paging_state));
    }
    if let Some(serial) = params.serial_consistency {
        write_short(out, serial.as_u16());
    }
    if let Some(ts) = params.timestamp {
        write_long(out, ts);
    }
}

pub fn encode_query(out: &mut Vec<u8>, query: &str, params: &QueryParameters) {
    write_long_string(out, query);
    encode_query_parameters(out, params);
}

pub fn encode_execute(out: &mut Vec<u8>, query_id: &[u8], params: &QueryParameters) {
    write_short_bytes(out, query_id);
    encode_query_parameters(out, params);
}

pub fn encode_prepare(out: &mut Vec<u8>, query: &str) {
    write_long_string(out, query);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchType {
    Logged = 0,
    Unlogged = 1,
    Counter = 2,
}

pub enum BatchStatement {
    Query(String),
    Prepared(Vec<u8>),
}

pub struct BatchEntry {
    pub statement: BatchStatement,
    pub values: Vec<(Option<String>, Option<Vec<u8>>)>,
}

pub fn encode_batch(
    out: &mut Vec<u8>,
    batch_type: BatchType,
    entries: &[BatchEntry],
    consistency: Consistency,
    serial_consistency: Option<Consistency>,
    timestamp: Option<i64>,
) {
    write_byte(out, batch_type as u8);
    write_short(out, entries.len() as u16);
    for entry in entries {
        match &entry.statement {
            BatchStatement::Query(query) => {
                write_byte(out, 0);
                write_long_string(out, query);
            }
            BatchStatement::Prepared(id) => {
                write_byte(out, 1);
                write_short_bytes(out, id);
            }
        }
        write_short(out, entry.values.len() as u16);
        for (name, value) in &entry.values {
            if let Some(name) = name {
                write_string(out, name);
            }
            write_bytes(out, value.as_deref());
        }
    }

    let mut flags = QueryFlags::empty();
    if serial_consistency.is_some() {
        flags |= QueryFlags::SERIAL_CONSISTENCY;
    }
    if timestamp.is_some() {
        flags |= QueryFlags::TIMESTAMP;
    }
    write_short(out, consistency.as_u16());
    write_byte(out, flags.bits());
    if let Some(serial) = serial_consistency {
        write_short(out, serial.as_u16());
    }
    if let Some(ts) = timestamp {
        write_long(out, ts);
    }
}

/// Serialize a typed value into its on-wire cell bytes, for callers that
/// build `QueryParameters::values` from `CqlValue`s rather than raw bytes.
pub fn encode_value(value: &CqlValue) -> Option<Vec<u8>> {
    crate::value::encode(value)
}
