//! Non-Rows response bodies: the ERROR body and its per-code detail fields,
//! plus READY/AUTHENTICATE/SUPPORTED/RESULT (non-Rows kinds)/EVENT/
//! AUTH_CHALLENGE/AUTH_SUCCESS.

use thiserror::Error;

use crate::constant::{Consistency, ErrorCode, ProtocolVersion, WriteType};
use crate::error::Result;
use crate::protocol::primitive::*;
use crate::protocol::row::{read_prepared_variables_metadata, read_rows_metadata, RowsMetadata};
use crate::value::CqlValue;

/// Per-code extra fields the server appends after `code` and `message`.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorDetail {
    None,
    Unavailable {
        consistency: Consistency,
        required: i32,
        alive: i32,
    },
    WriteTimeout {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        write_type: WriteType,
    },
    ReadTimeout {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        data_present: bool,
    },
    ReadFailure {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        num_failures: i32,
        data_present: bool,
    },
    WriteFailure {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        num_failures: i32,
        write_type: WriteType,
    },
    FunctionFailure {
        keyspace: String,
        function: String,
        arg_types: Vec<String>,
    },
    AlreadyExists {
        keyspace: String,
        table: String,
    },
    Unprepared {
        query_id: Vec<u8>,
    },
}

/// A server-reported ERROR frame, surfaced to callers via `Error::Server`.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{code:?}: {message}")]
pub struct ServerError {
    pub code: ErrorCode,
    pub message: String,
    pub detail: ErrorDetail,
}

impl ServerError {
    /// Whether a `RetryPolicy` should even be consulted for this error, or
    /// whether it must be rethrown unconditionally (malformed requests,
    /// auth failures, schema conflicts - retrying never helps).
    pub fn is_retryable_category(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::Unavailable
                | ErrorCode::Overloaded
                | ErrorCode::IsBootstrapping
                | ErrorCode::WriteTimeout
                | ErrorCode::ReadTimeout
                | ErrorCode::ReadFailure
                | ErrorCode::WriteFailure
        )
    }
}

/// Parse the body of an ERROR frame (everything after the frame header).
pub fn read_server_error(data: &[u8]) -> Result<ServerError> {
    let (code_raw, rest) = read_int(data)?;
    let code = ErrorCode::from_u16(code_raw as u16)
        .ok_or_else(|| crate::error::Error::protocol(format!("unknown error code {code_raw:#06x}")))?;
    let (message, rest) = read_string(rest)?;
    let message = message.to_owned();

    let detail = match code {
        ErrorCode::Unavailable => {
            let (cl, rest) = read_int_2(rest)?;
            let (required, rest) = read_int(rest)?;
            let (alive, _rest) = read_int(rest)?;
            ErrorDetail::Unavailable {
                consistency: Consistency::from_u16(cl).unwrap_or(Consistency::One),
                required,
                alive,
            }
        }
        ErrorCode::WriteTimeout => {
            let (cl, rest) = read_int_2(rest)?;
            let (received, rest) = read_int(rest)?;
            let (block_for, rest) = read_int(rest)?;
            let (write_type_str, _rest) = read_string(rest)?;
            ErrorDetail::WriteTimeout {
                consistency: Consistency::from_u16(cl).unwrap_or(Consistency::One),
                received,
                block_for,
                write_type: WriteType::parse(write_type_str),
            }
        }
        ErrorCode::ReadTimeout => {
            let (cl, rest) = read_int_2(rest)?;
            let (received, rest) = read_int(rest)?;
            let (block_for, rest) = read_int(rest)?;
            let (data_present, _rest) = read_byte(rest)?;
            ErrorDetail::ReadTimeout {
                consistency: Consistency::from_u16(cl).unwrap_or(Consistency::One),
                received,
                block_for,
                data_present: data_present != 0,
            }
        }
        ErrorCode::ReadFailure => {
            let (cl, rest) = read_int_2(rest)?;
            let (received, rest) = read_int(rest)?;
            let (block_for, rest) = read_int(rest)?;
            let (num_failures, rest) = read_int(rest)?;
            let (data_present, _rest) = read_byte(rest)?;
            ErrorDetail::ReadFailure {
                consistency: Consistency::from_u16(cl).unwrap_or(Consistency::One),
                received,
                block_for,
                num_failures,
                data_present: data_present != 0,
            }
        }
        ErrorCode::WriteFailure => {
            let (cl, rest) = read_int_2(rest)?;
            let (received, rest) = read_int(rest)?;
            let (block_for, rest) = read_int(rest)?;
            let (num_failures, rest) = read_int(rest)?;
            let (write_type_str, _rest) = read_string(rest)?;
            ErrorDetail::WriteFailure {
                consistency: Consistency::from_u16(cl).unwrap_or(Consistency::One),
                received,
                block_for,
                num_failures,
                write_type: WriteType::parse(write_type_str),
            }
        }
        ErrorCode::FunctionFailure => {
            let (keyspace, rest) = read_string(rest)?;
            let (function, rest) = read_string(rest)?;
            let (arg_types, _rest) = read_string_list(rest)?;
            ErrorDetail::FunctionFailure {
                keyspace: keyspace.to_owned(),
                function: function.to_owned(),
                arg_types,
            }
        }
        ErrorCode::AlreadyExists => {
            let (keyspace, rest) = read_string(rest)?;
            let (table, _rest) = read_string(rest)?;
            ErrorDetail::AlreadyExists {
                keyspace: keyspace.to_owned(),
                table: table.to_owned(),
            }
        }
        ErrorCode::Unprepared => {
            let (id, _rest) = read_short_bytes(rest)?;
            ErrorDetail::Unprepared { query_id: id.to_vec() }
        }
        _ => ErrorDetail::None,
    };

    Ok(ServerError { code, message, detail })
}

/// `SUPPORTED` body: `[string multimap]`.
pub fn read_supported(data: &[u8]) -> Result<Vec<(String, Vec<String>)>> {
    let (map, _rest) = read_string_multimap(data)?;
    Ok(map)
}

/// `AUTHENTICATE` body: `[string]` authenticator class name.
pub fn read_authenticate(data: &[u8]) -> Result<String> {
    let (name, _rest) = read_string(data)?;
    Ok(name.to_owned())
}

/// `AUTH_CHALLENGE`/`AUTH_SUCCESS` body: `[bytes]` opaque SASL token.
pub fn read_auth_token(data: &[u8]) -> Result<Option<Vec<u8>>> {
    let (bytes, _rest) = read_bytes(data)?;
    Ok(bytes.map(|b| b.to_vec()))
}

/// `RESULT` kind `Prepared`: query id, result metadata id (v5+), the bind
/// variables' metadata and the eventual result-set metadata.
#[derive(Debug, Clone)]
pub struct PreparedResult {
    pub query_id: Vec<u8>,
    pub result_metadata_id: Option<Vec<u8>>,
    pub variables: RowsMetadata,
    pub result_metadata: RowsMetadata,
}

pub fn read_prepared(data: &[u8], version: ProtocolVersion) -> Result<PreparedResult> {
    let (query_id, rest) = read_short_bytes(data)?;
    let (result_metadata_id, rest) = if version >= ProtocolVersion::V5 {
        let (id, rest) = read_short_bytes(rest)?;
        (Some(id.to_vec()), rest)
    } else {
        (None, rest)
    };
    let (variables, rest) = read_prepared_variables_metadata(rest, version)?;
    let (result_metadata, _rest) = read_rows_metadata(rest)?;
    Ok(PreparedResult {
        query_id: query_id.to_vec(),
        result_metadata_id,
        variables,
        result_metadata,
    })
}

/// `RESULT` kind `SchemaChange`, and the `EVENT` `SCHEMA_CHANGE` body (same
/// wire shape).
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaChange {
    pub change_type: String,
    pub target: String,
    pub keyspace: String,
    pub name: Option<String>,
    pub arg_types: Vec<String>,
}

pub fn read_schema_change(data: &[u8]) -> Result<SchemaChange> {
    let (change_type, rest) = read_string(data)?;
    let (target, rest) = read_string(rest)?;
    let (keyspace, rest) = read_string(rest)?;
    let (name, arg_types, _rest) = match target {
        "TABLE" | "TYPE" => {
            let (n, rest) = read_string(rest)?;
            (Some(n.to_owned()), Vec::new(), rest)
        }
        "FUNCTION" | "AGGREGATE" => {
            let (n, rest) = read_string(rest)?;
            let (args, rest) = read_string_list(rest)?;
            (Some(n.to_owned()), args, rest)
        }
        _ => (None, Vec::new(), rest),
    };
    Ok(SchemaChange {
        change_type: change_type.to_owned(),
        target: target.to_owned(),
        keyspace: keyspace.to_owned(),
        name,
        arg_types,
    })
}

/// `EVENT` body: `[string]` event type followed by a type-specific payload.
/// Topology/status-change events are exposed as raw `(address, port)` pairs;
/// turning them into a full topology update is the topology component's job.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SchemaChange(SchemaChange),
    TopologyChange { change_type: String, address: std::net::IpAddr, port: u16 },
    StatusChange { change_type: String, address: std::net::IpAddr, port: u16 },
}

pub fn read_event(data: &[u8]) -> Result<ServerEvent> {
    let (kind, rest) = read_string(data)?;
    Ok(match kind {
        "SCHEMA_CHANGE" => ServerEvent::SchemaChange(read_schema_change(rest)?),
        "TOPOLOGY_CHANGE" => {
            let (change_type, rest) = read_string(rest)?;
            let ((address, port), _rest) = read_inet(rest)?;
            ServerEvent::TopologyChange {
                change_type: change_type.to_owned(),
                address,
                port,
            }
        }
        "STATUS_CHANGE" => {
            let (change_type, rest) = read_string(rest)?;
            let ((address, port), _rest) = read_inet(rest)?;
            ServerEvent::StatusChange {
                change_type: change_type.to_owned(),
                address,
                port,
            }
        }
        other => return Err(crate::error::Error::protocol(format!("unknown event type {other}"))),
    })
}

/// A fully decoded, non-streamed row: used for `RESULT` `Rows` bodies
/// decoded in buffered mode (the default unless row-by-row mode was
/// requested for that stream id).
pub type Row = Vec<CqlValue>;

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    #[test]
    fn read_unavailable_error_decodes_detail() {
        let mut body = Vec::new();
        write_int(&mut body, 0x1000);
        write_string(&mut body, "not enough replicas");
        write_short(&mut body, 0x0001); // ONE
        write_int(&mut body, 3);
        write_int(&mut body, 1);

        let err = read_server_error(&body).unwrap();
        assert_eq!(err.code, ErrorCode::Unavailable);
        assert_eq!(err.message, "not enough replicas");
        assert_eq!(
            err.detail,
            ErrorDetail::Unavailable { consistency: Consistency::One, required: 3, alive: 1 }
        );
    }

    #[test]
    fn read_read_timeout_error_decodes_detail() {
        let mut body = Vec::new();
        write_int(&mut body, 0x1200);
        write_string(&mut body, "timed out");
        write_short(&mut body, 0x0004); // QUORUM
        write_int(&mut body, 1);
        write_int(&mut body, 2);
        write_byte(&mut body, 0);

        let err = read_server_error(&body).unwrap();
        assert_eq!(
            err.detail,
            ErrorDetail::ReadTimeout {
                consistency: Consistency::Quorum,
                received: 1,
                block_for: 2,
                data_present: false,
            }
        );
    }

    #[test]
    fn read_unprepared_error_carries_query_id() {
        let mut body = Vec::new();
        write_int(&mut body, 0x2500);
        write_string(&mut body, "unknown prepared statement");
        write_short_bytes(&mut body, &[1, 2, 3, 4]);

        let err = read_server_error(&body).unwrap();
        assert_eq!(err.code, ErrorCode::Unprepared);
        assert_eq!(err.detail, ErrorDetail::Unprepared { query_id: vec![1, 2, 3, 4] });
    }

    #[test]
    fn read_syntax_error_has_no_detail() {
        let mut body = Vec::new();
        write_int(&mut body, 0x2000);
        write_string(&mut body, "line 1:0 no viable alternative");
        let err = read_server_error(&body).unwrap();
        assert_eq!(err.code, ErrorCode::SyntaxError);
        assert_eq!(err.detail, ErrorDetail::None);
        assert!(!err.is_retryable_category());
    }

    #[test]
    fn read_prepared_without_v5_metadata_id() {
        let mut body = Vec::new();
        write_short_bytes(&mut body, &[9, 9]);
        write_int(&mut body, 0); // variables flags
        write_int(&mut body, 0); // variables col count
        write_int(&mut body, 0); // result flags
        write_int(&mut body, 0); // result col count

        // Protocol v3 predates both the v5 result-metadata id and the v4
        // pk_count/pk_indices block, so neither appears in this body.
        let prepared = read_prepared(&body, ProtocolVersion::V3).unwrap();
        assert_eq!(prepared.query_id, vec![9, 9]);
        assert_eq!(prepared.result_metadata_id, None);
        assert!(prepared.variables.pk_indices.is_empty());
    }

    #[test]
    fn read_prepared_v4_consumes_pk_indices_from_variables_only() {
        use crate::constant::RowsFlags;

        let mut body = Vec::new();
        write_short_bytes(&mut body, &[1, 2, 3]);
        // variables metadata: flags (global_tables_spec), col_count, pk_count=2, pk_indices
        write_int(&mut body, RowsFlags::GLOBAL_TABLES_SPEC.bits() as i32);
        write_int(&mut body, 2);
        write_int(&mut body, 2);
        write_short(&mut body, 0);
        write_short(&mut body, 1);
        write_string(&mut body, "ks");
        write_string(&mut body, "tbl");
        write_string(&mut body, "a");
        write_short(&mut body, 0x0009); // INT
        write_string(&mut body, "b");
        write_short(&mut body, 0x0009); // INT
        // result metadata: no pk_count/pk_indices block here
        write_int(&mut body, 0);
        write_int(&mut body, 0);

        let prepared = read_prepared(&body, ProtocolVersion::V4).unwrap();
        assert_eq!(prepared.query_id, vec![1, 2, 3]);
        assert_eq!(prepared.variables.pk_indices, vec![0, 1]);
        assert_eq!(prepared.variables.columns.len(), 2);
        assert!(prepared.result_metadata.pk_indices.is_empty());
        assert!(prepared.result_metadata.columns.is_empty());
    }

    #[test]
    fn read_schema_change_table_event_carries_name() {
        let mut body = Vec::new();
        write_string(&mut body, "CREATED");
        write_string(&mut body, "TABLE");
        write_string(&mut body, "ks");
        write_string(&mut body, "tbl");

        let change = read_schema_change(&body).unwrap();
        assert_eq!(change.change_type, "CREATED");
        assert_eq!(change.target, "TABLE");
        assert_eq!(change.keyspace, "ks");
        assert_eq!(change.name.as_deref(), Some("tbl"));
        assert!(change.arg_types.is_empty());
    }

    #[test]
    fn read_event_status_change_decodes_inet() {
        let mut body = Vec::new();
        write_string(&mut body, "STATUS_CHANGE");
        write_string(&mut body, "UP");
        write_inet(&mut body, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), 9042);

        let event = read_event(&body).unwrap();
        assert_eq!(
            event,
            ServerEvent::StatusChange {
                change_type: "UP".to_owned(),
                address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
                port: 9042,
            }
        );
    }
}
