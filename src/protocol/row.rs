//! Row metadata and the recursive `[option]` type tag used to describe
//! result-set columns.

use crate::constant::{ProtocolVersion, RowsFlags};
use crate::error::{Error, Result};
use crate::protocol::primitive::*;

/// A CQL type, recursive for collections, user-defined types and tuples.
#[derive(Debug, Clone, PartialEq)]
pub enum CqlType {
    Ascii,
    BigInt,
    Blob,
    Boolean,
    Counter,
    Decimal,
    Double,
    Float,
    Int,
    Timestamp,
    Uuid,
    Varchar,
    Varint,
    TimeUuid,
    Inet,
    Date,
    Time,
    SmallInt,
    TinyInt,
    Duration,
    List(Box<CqlType>),
    Set(Box<CqlType>),
    Map(Box<CqlType>, Box<CqlType>),
    Udt {
        keyspace: String,
        name: String,
        fields: Vec<(String, CqlType)>,
    },
    Tuple(Vec<CqlType>),
    Custom(String),
}

/// Option type codes (CQL binary protocol v4).
mod option_code {
    pub const CUSTOM: u16 = 0x0000;
    pub const ASCII: u16 = 0x0001;
    pub const BIGINT: u16 = 0x0002;
    pub const BLOB: u16 = 0x0003;
    pub const BOOLEAN: u16 = 0x0004;
    pub const COUNTER: u16 = 0x0005;
    pub const DECIMAL: u16 = 0x0006;
    pub const DOUBLE: u16 = 0x0007;
    pub const FLOAT: u16 = 0x0008;
    pub const INT: u16 = 0x0009;
    pub const TIMESTAMP: u16 = 0x000B;
    pub const UUID: u16 = 0x000C;
    pub const VARCHAR: u16 = 0x000D;
    pub const VARINT: u16 = 0x000E;
    pub const TIMEUUID: u16 = 0x000F;
    pub const INET: u16 = 0x0010;
    pub const DATE: u16 = 0x0011;
    pub const TIME: u16 = 0x0012;
    pub const SMALLINT: u16 = 0x0013;
    pub const TINYINT: u16 = 0x0014;
    pub const DURATION: u16 = 0x0015;
    pub const LIST: u16 = 0x0020;
    pub const MAP: u16 = 0x0021;
    pub const SET: u16 = 0x0022;
    pub const UDT: u16 = 0x0030;
    pub const TUPLE: u16 = 0x0031;
}

/// `[option]` = `[short]` type code + optional payload, recursive.
pub fn read_option(data: &[u8]) -> Result<(CqlType, &[u8])> {
    let (code, rest) = read_int_2(data)?;
    Ok(match code {
        option_code::CUSTOM => {
            let (name, rest) = read_string(rest)?;
            (CqlType::Custom(name.to_owned()), rest)
        }
        option_code::ASCII => (CqlType::Ascii, rest),
        option_code::BIGINT => (CqlType::BigInt, rest),
        option_code::BLOB => (CqlType::Blob, rest),
        option_code::BOOLEAN => (CqlType::Boolean, rest),
        option_code::COUNTER => (CqlType::Counter, rest),
        option_code::DECIMAL => (CqlType::Decimal, rest),
        option_code::DOUBLE => (CqlType::Double, rest),
        option_code::FLOAT => (CqlType::Float, rest),
        option_code::INT => (CqlType::Int, rest),
        option_code::TIMESTAMP => (CqlType::Timestamp, rest),
        option_code::UUID => (CqlType::Uuid, rest),
        option_code::VARCHAR => (CqlType::Varchar, rest),
        option_code::VARINT => (CqlType::Varint, rest),
        option_code::TIMEUUID => (CqlType::TimeUuid, rest),
        option_code::INET => (CqlType::Inet, rest),
        option_code::DATE => (CqlType::Date, rest),
        option_code::TIME => (CqlType::Time, rest),
        option_code::SMALLINT => (CqlType::SmallInt, rest),
        option_code::TINYINT => (CqlType::TinyInt, rest),
        option_code::DURATION => (CqlType::Duration, rest),
        option_code::LIST => {
            let (elem, rest) = read_option(rest)?;
            (CqlType::List(Box::new(elem)), rest)
        }
        option_code::SET => {
            let (elem, rest) = read_option(rest)?;
            (CqlType::Set(Box::new(elem)), rest)
        }
        option_code::MAP => {
            let (key, rest) = read_option(rest)?;
            let (val, rest) = read_option(rest)?;
            (CqlType::Map(Box::new(key), Box::new(val)), rest)
        }
        option_code::UDT => {
            let (keyspace, rest) = read_string(rest)?;
            let (name, rest) = read_string(rest)?;
            let (n, mut rest) = read_int_2(rest)?;
            let mut fields = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let (field_name, next) = read_string(rest)?;
                let (field_ty, next) = read_option(next)?;
                fields.push((field_name.to_owned(), field_ty));
                rest = next;
            }
            (
                CqlType::Udt {
                    keyspace: keyspace.to_owned(),
                    name: name.to_owned(),
                    fields,
                },
                rest,
            )
        }
        option_code::TUPLE => {
            let (n, mut rest) = read_int_2(rest)?;
            let mut elems = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let (ty, next) = read_option(rest)?;
                elems.push(ty);
                rest = next;
            }
            (CqlType::Tuple(elems), rest)
        }
        other => return Err(Error::protocol(format!("unknown [option] type code {other:#06x}"))),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub keyspace: Option<String>,
    pub table: Option<String>,
    pub name: String,
    pub ty: CqlType,
}

#[derive(Debug, Clone, Default)]
pub struct RowsMetadata {
    pub flags: RowsFlags,
    pub columns: Vec<ColumnSpec>,
    pub page_state: Option<Vec<u8>>,
    pub new_result_metadata_id: Option<Vec<u8>>,
    /// Partition-key column indices, present only on a `PREPARED` result's
    /// bind-variables metadata block (protocol v4+); empty everywhere else.
    pub pk_indices: Vec<u16>,
    /// Continuous-paging page index, consumed only when `CONTINUOUS_PAGING`
    /// is set.
    pub page_index: Option<i32>,
    /// Whether this was the last page of a continuous-paging result.
    pub last_page: bool,
}

/// Read Result-Rows metadata: `[int] flags`, `[int] col_count`, then
/// optional pieces in flag order (paging state, new metadata id, table
/// spec, per-column specs).
pub fn read_rows_metadata(data: &[u8]) -> Result<(RowsMetadata, &[u8])> {
    read_rows_metadata_inner(data, false)
}

/// Read the bind-variables metadata block of a `PREPARED` result body: the
/// same shape as [`read_rows_metadata`], but protocol v4+ additionally
/// carries a `pk_count` `[int]` and `pk_count` `[short]` partition-key
/// indices immediately after `col_count`. Only the variables block carries
/// this; the trailing result-set metadata block never does.
pub fn read_prepared_variables_metadata(data: &[u8], version: ProtocolVersion) -> Result<(RowsMetadata, &[u8])> {
    read_rows_metadata_inner(data, version >= ProtocolVersion::V4)
}

fn read_rows_metadata_inner(data: &[u8], has_pk_indices: bool) -> Result<(RowsMetadata, &[u8])> {
    let (flags_raw, rest) = read_int(data)?;
    let flags = RowsFlags::from_bits_truncate(flags_raw as u32);
    let (col_count, mut rest) = read_int(rest)?;
    let col_count = col_count as usize;

    let mut pk_indices = Vec::new();
    if has_pk_indices {
        let (pk_count, next) = read_int(rest)?;
        rest = next;
        pk_indices = Vec::with_capacity(pk_count.max(0) as usize);
        for _ in 0..pk_count.max(0) {
            let (index, next) = read_short(rest)?;
            pk_indices.push(index);
            rest = next;
        }
    }

    let mut page_state = None;
    let mut new_result_metadata_id = None;
    let mut page_index = None;

    if flags.contains(RowsFlags::HAS_MORE_PAGES) {
        let (bytes, next) = read_bytes(rest)?;
        page_state = bytes.map(|b| b.to_vec());
        rest = next;
    }
    if flags.contains(RowsFlags::METADATA_CHANGED) {
        let (bytes, next) = read_short_bytes(rest)?;
        new_result_metadata_id = Some(bytes.to_vec());
        rest = next;
    }
    if flags.contains(RowsFlags::CONTINUOUS_PAGING) {
        let (index, next) = read_int(rest)?;
        page_index = Some(index);
        rest = next;
    }
    let last_page = flags.contains(RowsFlags::CONTINUOUS_PAGING) && flags.contains(RowsFlags::LAST_CONTINUOUS_PAGE);

    if flags.contains(RowsFlags::NO_METADATA) {
        return Ok((
            RowsMetadata {
                flags,
                columns: Vec::new(),
                page_state,
                new_result_metadata_id,
                pk_indices,
                page_index,
                last_page,
            },
            rest,
        ));
    }

    let global_spec = if flags.contains(RowsFlags::GLOBAL_TABLES_SPEC) {
        let (ks, next) = read_string(rest)?;
        let (table, next) = read_string(next)?;
        rest = next;
        Some((ks.to_owned(), table.to_owned()))
    } else {
        None
    };

    let mut columns = Vec::with_capacity(col_count);
    for _ in 0..col_count {
        let (keyspace, table) = match &global_spec {
            Some((ks, table)) => (Some(ks.clone()), Some(table.clone())),
            None => {
                let (ks, next) = read_string(rest)?;
                let (table, next) = read_string(next)?;
                rest = next;
                (Some(ks.to_owned()), Some(table.to_owned()))
            }
        };
        let (name, next) = read_string(rest)?;
        let (ty, next) = read_option(next)?;
        rest = next;
        columns.push(ColumnSpec {
            keyspace,
            table,
            name: name.to_owned(),
            ty,
        });
    }

    Ok((
        RowsMetadata {
            flags,
            columns,
            page_state,
            new_result_metadata_id,
            pk_indices,
            page_index,
            last_page,
        },
        rest,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn option_code_bytes(code: u16) -> Vec<u8> {
        let mut out = Vec::new();
        write_short(&mut out, code);
        out
    }

    #[test]
    fn read_option_decodes_a_primitive() {
        let (ty, rest) = read_option(&option_code_bytes(0x0009)).unwrap();
        assert_eq!(ty, CqlType::Int);
        assert!(rest.is_empty());
    }

    #[test]
    fn read_option_decodes_nested_list_of_text() {
        let mut data = option_code_bytes(0x0020); // LIST
        write_short(&mut data, 0x000D); // VARCHAR
        let (ty, rest) = read_option(&data).unwrap();
        assert_eq!(ty, CqlType::List(Box::new(CqlType::Varchar)));
        assert!(rest.is_empty());
    }

    #[test]
    fn read_option_decodes_map_of_text_to_int() {
        let mut data = option_code_bytes(0x0021); // MAP
        write_short(&mut data, 0x000D); // VARCHAR key
        write_short(&mut data, 0x0009); // INT value
        let (ty, rest) = read_option(&data).unwrap();
        assert_eq!(ty, CqlType::Map(Box::new(CqlType::Varchar), Box::new(CqlType::Int)));
        assert!(rest.is_empty());
    }

    #[test]
    fn read_option_decodes_udt_with_fields() {
        let mut data = option_code_bytes(0x0030); // UDT
        write_string(&mut data, "ks");
        write_string(&mut data, "address");
        write_short(&mut data, 2);
        write_string(&mut data, "street");
        write_short(&mut data, 0x000D); // VARCHAR
        write_string(&mut data, "zip");
        write_short(&mut data, 0x0009); // INT

        let (ty, rest) = read_option(&data).unwrap();
        assert_eq!(
            ty,
            CqlType::Udt {
                keyspace: "ks".to_owned(),
                name: "address".to_owned(),
                fields: vec![("street".to_owned(), CqlType::Varchar), ("zip".to_owned(), CqlType::Int)],
            }
        );
        assert!(rest.is_empty());
    }

    #[test]
    fn read_option_decodes_tuple() {
        let mut data = option_code_bytes(0x0031); // TUPLE
        write_short(&mut data, 2);
        write_short(&mut data, 0x0009); // INT
        write_short(&mut data, 0x000D); // VARCHAR
        let (ty, rest) = read_option(&data).unwrap();
        assert_eq!(ty, CqlType::Tuple(vec![CqlType::Int, CqlType::Varchar]));
        assert!(rest.is_empty());
    }

    #[test]
    fn read_option_rejects_unknown_code() {
        let err = read_option(&option_code_bytes(0x9999)).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn rows_metadata_with_global_tables_spec_shares_keyspace_and_table() {
        let mut data = Vec::new();
        write_int(&mut data, RowsFlags::GLOBAL_TABLES_SPEC.bits() as i32);
        write_int(&mut data, 2);
        write_string(&mut data, "ks");
        write_string(&mut data, "tbl");
        write_string(&mut data, "id");
        write_short(&mut data, 0x000C); // UUID
        write_string(&mut data, "name");
        write_short(&mut data, 0x000D); // VARCHAR

        let (metadata, rest) = read_rows_metadata(&data).unwrap();
        assert_eq!(metadata.columns.len(), 2);
        assert_eq!(metadata.columns[0].keyspace.as_deref(), Some("ks"));
        assert_eq!(metadata.columns[0].table.as_deref(), Some("tbl"));
        assert_eq!(metadata.columns[0].name, "id");
        assert_eq!(metadata.columns[0].ty, CqlType::Uuid);
        assert_eq!(metadata.columns[1].name, "name");
        assert!(rest.is_empty());
    }

    #[test]
    fn rows_metadata_with_has_more_pages_reads_page_state() {
        let mut data = Vec::new();
        write_int(
            &mut data,
            (RowsFlags::HAS_MORE_PAGES | RowsFlags::NO_METADATA).bits() as i32,
        );
        write_int(&mut data, 0);
        write_bytes(&mut data, Some(b"page-token"));

        let (metadata, rest) = read_rows_metadata(&data).unwrap();
        assert_eq!(metadata.page_state, Some(b"page-token".to_vec()));
        assert!(metadata.columns.is_empty());
        assert!(rest.is_empty());
    }

    #[test]
    fn rows_metadata_with_continuous_paging_reads_page_index_and_last_page() {
        let mut data = Vec::new();
        write_int(
            &mut data,
            (RowsFlags::CONTINUOUS_PAGING | RowsFlags::LAST_CONTINUOUS_PAGE | RowsFlags::NO_METADATA).bits() as i32,
        );
        write_int(&mut data, 0);
        write_int(&mut data, 7); // page index

        let (metadata, rest) = read_rows_metadata(&data).unwrap();
        assert_eq!(metadata.page_index, Some(7));
        assert!(metadata.last_page);
        assert!(rest.is_empty());
    }

    #[test]
    fn read_prepared_variables_metadata_reads_pk_indices_on_v4() {
        let mut data = Vec::new();
        write_int(&mut data, (RowsFlags::GLOBAL_TABLES_SPEC | RowsFlags::NO_METADATA).bits() as i32);
        write_int(&mut data, 0); // col count
        write_int(&mut data, 2); // pk_count
        write_short(&mut data, 3);
        write_short(&mut data, 5);

        let (metadata, rest) = read_prepared_variables_metadata(&data, ProtocolVersion::V4).unwrap();
        assert_eq!(metadata.pk_indices, vec![3, 5]);
        assert!(rest.is_empty());
    }

    #[test]
    fn read_prepared_variables_metadata_skips_pk_indices_before_v4() {
        let mut data = Vec::new();
        write_int(&mut data, RowsFlags::NO_METADATA.bits() as i32);
        write_int(&mut data, 0); // col count

        let (metadata, rest) = read_prepared_variables_metadata(&data, ProtocolVersion::V3).unwrap();
        assert!(metadata.pk_indices.is_empty());
        assert!(rest.is_empty());
    }
}
