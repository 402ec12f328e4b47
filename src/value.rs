//! CQL typed values and their decode from a cell's raw bytes. A tagged
//! `CqlValue` enum decoded from `(type, bytes)`, owning its data - a cell
//! may have been assembled from a chain of chunk-spanning accumulator
//! buffers, so there is no single borrow lifetime to hand back to every
//! value uniformly.

use std::net::IpAddr;

use crate::error::{Error, Result};
use crate::protocol::primitive::{read_int_2, read_string_fix, write_int, write_short};
use crate::protocol::row::CqlType;

/// A 16-byte CQL `uuid`/`timeuuid`: a thin newtype around the raw bytes
/// rather than pulling the full `uuid` crate's parsing surface into the hot
/// decode path. Conversions to/from `uuid::Uuid` are provided for callers
/// that want it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CqlUuid(pub [u8; 16]);

impl From<uuid::Uuid> for CqlUuid {
    fn from(u: uuid::Uuid) -> Self {
        Self(*u.as_bytes())
    }
}

impl From<CqlUuid> for uuid::Uuid {
    fn from(u: CqlUuid) -> Self {
        uuid::Uuid::from_bytes(u.0)
    }
}

/// Milliseconds since the Unix epoch, as CQL `timestamp` is encoded on the
/// wire. `chrono` is used only at the conversion boundary; `timestamp` is a
/// core primitive of this data model, not an opt-in extra, so the
/// dependency is unconditional rather than feature-gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CqlTimestamp(pub i64);

impl From<CqlTimestamp> for chrono::DateTime<chrono::Utc> {
    fn from(ts: CqlTimestamp) -> Self {
        chrono::DateTime::from_timestamp_millis(ts.0).unwrap_or(chrono::DateTime::UNIX_EPOCH)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CqlDuration {
    pub months: i32,
    pub days: i32,
    pub nanoseconds: i64,
}

/// A single decoded CQL value. `Null` is distinct from e.g. `Blob(vec![])`
/// the same way the wire format distinguishes a `[bytes]` length of -1 from
/// a length of 0.
#[derive(Debug, Clone, PartialEq)]
pub enum CqlValue {
    Null,
    Ascii(String),
    BigInt(i64),
    Blob(Vec<u8>),
    Boolean(bool),
    Counter(i64),
    /// Unscaled value (big-endian two's complement) + scale, left raw:
    /// arbitrary-precision decimal arithmetic is out of this crate's core.
    Decimal { unscaled: Vec<u8>, scale: i32 },
    Double(f64),
    Float(f32),
    Int(i32),
    Timestamp(CqlTimestamp),
    Uuid(CqlUuid),
    Varchar(String),
    /// Big-endian two's complement, left raw for the same reason as `Decimal`.
    Varint(Vec<u8>),
    TimeUuid(CqlUuid),
    Inet(IpAddr),
    /// Days since the epoch, centered on 2^31 per the CQL wire format.
    Date(u32),
    /// Nanoseconds since midnight.
    Time(i64),
    SmallInt(i16),
    TinyInt(i8),
    Duration(CqlDuration),
    List(Vec<CqlValue>),
    Set(Vec<CqlValue>),
    Map(Vec<(CqlValue, CqlValue)>),
    /// Field order matches the UDT definition; a field absent from a
    /// shorter-than-declared payload decodes as `CqlValue::Null` rather
    /// than being dropped, so callers can always zip against the schema.
    Udt(Vec<(String, CqlValue)>),
    Tuple(Vec<CqlValue>),
    Custom(Vec<u8>),
}

impl CqlValue {
    /// Decode a value whose on-wire cell bytes (sans the `[bytes]` length
    /// prefix - the caller already stripped that) are fully available.
    ///
    /// `data` must be exactly the cell's body; nested types recurse by
    /// slicing sub-cells out of it using their own length prefixes.
    pub fn decode(ty: &CqlType, data: &[u8]) -> Result<Self> {
        Ok(match ty {
            CqlType::Ascii => CqlValue::Ascii(ascii_from_bytes(data)?),
            CqlType::BigInt => CqlValue::BigInt(i64::from_be_bytes(fixed(data, "bigint")?)),
            CqlType::Blob => CqlValue::Blob(data.to_vec()),
            CqlType::Boolean => CqlValue::Boolean(data.first().copied().unwrap_or(0) != 0),
            CqlType::Counter => CqlValue::Counter(i64::from_be_bytes(fixed(data, "counter")?)),
            CqlType::Decimal => {
                if data.len() < 4 {
                    return Err(Error::protocol("decimal shorter than scale prefix"));
                }
                let scale = i32::from_be_bytes(fixed(&data[..4], "decimal scale")?);
                CqlValue::Decimal {
                    unscaled: data[4..].to_vec(),
                    scale,
                }
            }
            CqlType::Double => CqlValue::Double(f64::from_be_bytes(fixed(data, "double")?)),
            CqlType::Float => CqlValue::Float(f32::from_be_bytes(fixed(data, "float")?)),
            CqlType::Int => CqlValue::Int(i32::from_be_bytes(fixed(data, "int")?)),
            CqlType::Timestamp => {
                CqlValue::Timestamp(CqlTimestamp(i64::from_be_bytes(fixed(data, "timestamp")?)))
            }
            CqlType::Uuid => CqlValue::Uuid(CqlUuid(fixed(data, "uuid")?)),
            CqlType::Varchar => CqlValue::Varchar(utf8_from_bytes(data)?),
            CqlType::Varint => CqlValue::Varint(data.to_vec()),
            CqlType::TimeUuid => CqlValue::TimeUuid(CqlUuid(fixed(data, "timeuuid")?)),
            CqlType::Inet => CqlValue::Inet(decode_inet(data)?),
            CqlType::Date => CqlValue::Date(u32::from_be_bytes(fixed(data, "date")?)),
            CqlType::Time => CqlValue::Time(i64::from_be_bytes(fixed(data, "time")?)),
            CqlType::SmallInt => CqlValue::SmallInt(i16::from_be_bytes(fixed(data, "smallint")?)),
            CqlType::TinyInt => CqlValue::TinyInt(data.first().copied().unwrap_or(0) as i8),
            CqlType::Duration => decode_duration(data)?,
            CqlType::List(elem) => CqlValue::List(decode_collection(elem, data)?),
            CqlType::Set(elem) => CqlValue::Set(decode_collection(elem, data)?),
            CqlType::Map(key, val) => CqlValue::Map(decode_map(key, val, data)?),
            CqlType::Udt { fields, .. } => decode_udt(fields, data)?,
            CqlType::Tuple(elems) => decode_tuple(elems, data)?,
            CqlType::Custom(_) => CqlValue::Custom(data.to_vec()),
        })
    }
}

fn fixed<const N: usize>(data: &[u8], what: &str) -> Result<[u8; N]> {
    data.get(..N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| Error::protocol(format!("{what} value is {} bytes, need {N}", data.len())))
}

fn ascii_from_bytes(data: &[u8]) -> Result<String> {
    if !data.is_ascii() {
        return Err(Error::protocol("ascii value contains non-ascii bytes"));
    }
    Ok(String::from_utf8_lossy(data).into_owned())
}

fn utf8_from_bytes(data: &[u8]) -> Result<String> {
    Ok(simdutf8::basic::from_utf8(data)
        .map_err(|_| Error::protocol("varchar value is not valid utf-8"))?
        .to_owned())
}

fn decode_inet(data: &[u8]) -> Result<IpAddr> {
    match data.len() {
        4 => Ok(IpAddr::from(<[u8; 4]>::try_from(data).expect("checked len"))),
        16 => Ok(IpAddr::from(<[u8; 16]>::try_from(data).expect("checked len"))),
        other => Err(Error::protocol(format!("inet address is {other} bytes, need 4 or 16"))),
    }
}

fn decode_duration(data: &[u8]) -> Result<CqlValue> {
    let (months, rest) = read_vint(data)?;
    let (days, rest) = read_vint(rest)?;
    let (nanos, _rest) = read_vint(rest)?;
    Ok(CqlValue::Duration(CqlDuration {
        months: zigzag_decode_32(months),
        days: zigzag_decode_32(days),
        nanoseconds: zigzag_decode_64(nanos),
    }))
}

fn zigzag_decode_32(v: u64) -> i32 {
    ((v >> 1) as i32) ^ -((v & 1) as i32)
}

fn zigzag_decode_64(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

/// CQL's variable-length integer encoding used by `duration` (distinct from
/// the `[int]`-length-prefixed framing `[bytes]` uses, which belongs to
/// cell framing, not value bodies).
fn read_vint(data: &[u8]) -> Result<(u64, &[u8])> {
    let first = *data
        .first()
        .ok_or_else(|| Error::protocol("vint: empty input"))?;
    let extra_bytes = first.leading_ones() as usize;
    if extra_bytes == 0 {
        return Ok((first as u64, &data[1..]));
    }
    if data.len() < 1 + extra_bytes {
        return Err(Error::protocol("vint: truncated"));
    }
    let mut value = (first & (0xFF >> extra_bytes)) as u64;
    for &b in &data[1..1 + extra_bytes] {
        value = (value << 8) | b as u64;
    }
    Ok((value, &data[1 + extra_bytes..]))
}

fn decode_collection(elem: &CqlType, data: &[u8]) -> Result<Vec<CqlValue>> {
    let (count, mut rest) = read_int_2(data)?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (cell, next) = read_sub_bytes(rest)?;
        out.push(match cell {
            Some(bytes) => CqlValue::decode(elem, bytes)?,
            None => CqlValue::Null,
        });
        rest = next;
    }
    Ok(out)
}

fn decode_map(key: &CqlType, val: &CqlType, data: &[u8]) -> Result<Vec<(CqlValue, CqlValue)>> {
    let (count, mut rest) = read_int_2(data)?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (k_bytes, next) = read_sub_bytes(rest)?;
        let (v_bytes, next) = read_sub_bytes(next)?;
        let k = match k_bytes {
            Some(b) => CqlValue::decode(key, b)?,
            None => CqlValue::Null,
        };
        let v = match v_bytes {
            Some(b) => CqlValue::decode(val, b)?,
            None => CqlValue::Null,
        };
        out.push((k, v));
        rest = next;
    }
    Ok(out)
}

fn decode_udt(fields: &[(String, CqlType)], data: &[u8]) -> Result<CqlValue> {
    let mut rest = data;
    let mut out = Vec::with_capacity(fields.len());
    for (name, ty) in fields {
        let value = match read_sub_bytes(rest) {
            Ok((Some(bytes), next)) => {
                rest = next;
                CqlValue::decode(ty, bytes)?
            }
            Ok((None, next)) => {
                rest = next;
                CqlValue::Null
            }
            // A UDT value shorter than its declared field list is valid
            // CQL (fields added to the type after the value was written).
            Err(_) => CqlValue::Null,
        };
        out.push((name.clone(), value));
    }
    Ok(CqlValue::Udt(out))
}

fn decode_tuple(elems: &[CqlType], data: &[u8]) -> Result<CqlValue> {
    let mut rest = data;
    let mut out = Vec::with_capacity(elems.len());
    for ty in elems {
        let value = match read_sub_bytes(rest) {
            Ok((Some(bytes), next)) => {
                rest = next;
                CqlValue::decode(ty, bytes)?
            }
            Ok((None, next)) => {
                rest = next;
                CqlValue::Null
            }
            Err(_) => CqlValue::Null,
        };
        out.push(value);
    }
    Ok(CqlValue::Tuple(out))
}

/// Encode a value into its raw cell body (what `[bytes]` wraps); `None`
/// means the caller should write a null (`[bytes]` length -1) instead.
pub fn encode(value: &CqlValue) -> Option<Vec<u8>> {
    Some(match value {
        CqlValue::Null => return None,
        CqlValue::Ascii(s) | CqlValue::Varchar(s) => s.as_bytes().to_vec(),
        CqlValue::BigInt(v) | CqlValue::Counter(v) | CqlValue::Time(v) => v.to_be_bytes().to_vec(),
        CqlValue::Blob(b) | CqlValue::Varint(b) | CqlValue::Custom(b) => b.clone(),
        CqlValue::Boolean(b) => vec![u8::from(*b)],
        CqlValue::Decimal { unscaled, scale } => {
            let mut out = scale.to_be_bytes().to_vec();
            out.extend_from_slice(unscaled);
            out
        }
        CqlValue::Double(v) => v.to_be_bytes().to_vec(),
        CqlValue::Float(v) => v.to_be_bytes().to_vec(),
        CqlValue::Int(v) => v.to_be_bytes().to_vec(),
        CqlValue::Timestamp(ts) => ts.0.to_be_bytes().to_vec(),
        CqlValue::Uuid(u) | CqlValue::TimeUuid(u) => u.0.to_vec(),
        CqlValue::Inet(addr) => match addr {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        },
        CqlValue::Date(d) => d.to_be_bytes().to_vec(),
        CqlValue::SmallInt(v) => v.to_be_bytes().to_vec(),
        CqlValue::TinyInt(v) => vec![*v as u8],
        CqlValue::Duration(d) => {
            let mut out = Vec::new();
            write_vint(&mut out, zigzag_encode_32(d.months));
            write_vint(&mut out, zigzag_encode_32(d.days));
            write_vint(&mut out, zigzag_encode_64(d.nanoseconds));
            out
        }
        CqlValue::List(items) | CqlValue::Set(items) => encode_collection(items),
        CqlValue::Map(entries) => {
            let mut out = Vec::new();
            write_short(&mut out, entries.len() as u16);
            for (k, v) in entries {
                write_sub_bytes(&mut out, encode(k));
                write_sub_bytes(&mut out, encode(v));
            }
            out
        }
        CqlValue::Udt(fields) => {
            let mut out = Vec::new();
            for (_, v) in fields {
                write_sub_bytes(&mut out, encode(v));
            }
            out
        }
        CqlValue::Tuple(items) => {
            let mut out = Vec::new();
            for v in items {
                write_sub_bytes(&mut out, encode(v));
            }
            out
        }
    })
}

fn encode_collection(items: &[CqlValue]) -> Vec<u8> {
    let mut out = Vec::new();
    write_short(&mut out, items.len() as u16);
    for item in items {
        write_sub_bytes(&mut out, encode(item));
    }
    out
}

fn write_sub_bytes(out: &mut Vec<u8>, value: Option<Vec<u8>>) {
    match value {
        Some(bytes) => {
            write_int(out, bytes.len() as i32);
            out.extend_from_slice(&bytes);
        }
        None => write_int(out, -1),
    }
}

fn zigzag_encode_32(v: i32) -> u64 {
    (((v << 1) ^ (v >> 31)) as u32) as u64
}

fn zigzag_encode_64(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

/// Write CQL's variable-length integer encoding: the exact inverse of
/// `read_vint`. The first byte's leading run of `extra_bytes` one-bits
/// (`extra_bytes` = 0..=8) is followed by the value's high bits; the
/// remaining `extra_bytes` bytes are the value's low bytes, big-endian.
fn write_vint(out: &mut Vec<u8>, value: u64) {
    let required_bits = u64::BITS - value.leading_zeros();
    let extra_bytes = (0..8u32).find(|&e| required_bits <= 8 + 7 * e).unwrap_or(8);

    if extra_bytes == 8 {
        out.push(0xFF);
        out.extend_from_slice(&value.to_be_bytes());
        return;
    }

    let prefix = if extra_bytes == 0 { 0 } else { 0xFFu8 << (8 - extra_bytes) };
    let high_bits = ((value >> (8 * extra_bytes)) as u8) & (0xFFu8 >> extra_bytes);
    out.push(prefix | high_bits);
    let full = value.to_be_bytes();
    out.extend_from_slice(&full[8 - extra_bytes as usize..]);
}

/// A nested `[bytes]`: `[int] length` (negative = null) + payload, used
/// inside already-decoded collection/UDT/tuple cell bodies.
fn read_sub_bytes(data: &[u8]) -> Result<(Option<&[u8]>, &[u8])> {
    if data.len() < 4 {
        return Err(Error::NeedMoreData {
            needed: 4,
            available: data.len(),
        });
    }
    let len = i32::from_be_bytes(data[..4].try_into().expect("checked len"));
    let rest = &data[4..];
    if len < 0 {
        return Ok((None, rest));
    }
    let len = len as usize;
    let (bytes, rest) = read_string_fix(rest, len)?;
    Ok((Some(bytes), rest))
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use crate::protocol::row::CqlType;

    use super::*;

    fn round_trip(ty: CqlType, value: CqlValue) {
        let bytes = encode(&value).expect("non-null value encodes to Some");
        let decoded = CqlValue::decode(&ty, &bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn primitives_round_trip() {
        round_trip(CqlType::Int, CqlValue::Int(-42));
        round_trip(CqlType::BigInt, CqlValue::BigInt(i64::MIN));
        round_trip(CqlType::Boolean, CqlValue::Boolean(true));
        round_trip(CqlType::Double, CqlValue::Double(std::f64::consts::PI));
        round_trip(CqlType::Varchar, CqlValue::Varchar("hello, cql".to_owned()));
        round_trip(CqlType::Blob, CqlValue::Blob(vec![0xDE, 0xAD, 0xBE, 0xEF]));
        round_trip(CqlType::SmallInt, CqlValue::SmallInt(-7));
        round_trip(CqlType::TinyInt, CqlValue::TinyInt(-1));
        round_trip(CqlType::Uuid, CqlValue::Uuid(CqlUuid([7; 16])));
        round_trip(
            CqlType::Inet,
            CqlValue::Inet(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))),
        );
    }

    #[test]
    fn list_of_ints_round_trips() {
        round_trip(
            CqlType::List(Box::new(CqlType::Int)),
            CqlValue::List(vec![CqlValue::Int(1), CqlValue::Int(2), CqlValue::Int(3)]),
        );
    }

    #[test]
    fn list_with_a_null_element_round_trips() {
        round_trip(
            CqlType::List(Box::new(CqlType::Varchar)),
            CqlValue::List(vec![CqlValue::Varchar("a".to_owned()), CqlValue::Null]),
        );
    }

    #[test]
    fn map_of_text_to_int_round_trips() {
        round_trip(
            CqlType::Map(Box::new(CqlType::Varchar), Box::new(CqlType::Int)),
            CqlValue::Map(vec![
                (CqlValue::Varchar("a".to_owned()), CqlValue::Int(1)),
                (CqlValue::Varchar("b".to_owned()), CqlValue::Int(2)),
            ]),
        );
    }

    #[test]
    fn tuple_round_trips() {
        round_trip(
            CqlType::Tuple(vec![CqlType::Int, CqlType::Varchar]),
            CqlValue::Tuple(vec![CqlValue::Int(5), CqlValue::Varchar("five".to_owned())]),
        );
    }

    #[test]
    fn udt_round_trips() {
        let ty = CqlType::Udt {
            keyspace: "ks".to_owned(),
            name: "address".to_owned(),
            fields: vec![("street".to_owned(), CqlType::Varchar), ("zip".to_owned(), CqlType::Int)],
        };
        round_trip(
            ty,
            CqlValue::Udt(vec![
                ("street".to_owned(), CqlValue::Varchar("main st".to_owned())),
                ("zip".to_owned(), CqlValue::Int(12345)),
            ]),
        );
    }

    #[test]
    fn udt_shorter_than_declared_fields_fills_missing_with_null() {
        let fields = vec![("a".to_owned(), CqlType::Int), ("b".to_owned(), CqlType::Int)];
        // Only one field's worth of bytes on the wire.
        let mut data = Vec::new();
        write_int(&mut data, 4);
        data.extend_from_slice(&1i32.to_be_bytes());
        let decoded = decode_udt(&fields, &data).unwrap();
        assert_eq!(
            decoded,
            CqlValue::Udt(vec![("a".to_owned(), CqlValue::Int(1)), ("b".to_owned(), CqlValue::Null)])
        );
    }

    #[test]
    fn duration_round_trips_through_zigzag_vint() {
        round_trip(
            CqlType::Duration,
            CqlValue::Duration(CqlDuration {
                months: -2,
                days: 10,
                nanoseconds: -123_456_789,
            }),
        );
    }

    #[test]
    fn null_cell_decodes_without_consulting_the_type() {
        // The parser never calls `CqlValue::decode` for a null cell (it
        // short-circuits to `CqlValue::Null` itself); this just documents
        // that `encode(&Null)` round-trips through the `[bytes]` null marker.
        assert_eq!(encode(&CqlValue::Null), None);
    }
}
