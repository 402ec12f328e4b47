//! Typed readers/writers for CQL primitives. All multi-byte integers are
//! big-endian, since CQL uses network byte order.
//!
//! Every reader returns `Error::NeedMoreData` rather than a generic
//! protocol error when `data` is too short to satisfy it; this is the
//! sentinel the streaming parser (`protocol::parser`) checks for to decide
//! whether to buffer and resume instead of failing the frame.

use std::net::IpAddr;

use zerocopy::byteorder::big_endian::{I32 as I32BE, I64 as I64BE, U16 as U16BE};
use zerocopy::FromBytes;

use crate::error::{Error, Result};

fn need(data: &[u8], n: usize) -> Result<()> {
    if data.len() < n {
        Err(Error::NeedMoreData {
            needed: n,
            available: data.len(),
        })
    } else {
        Ok(())
    }
}

pub fn read_byte(data: &[u8]) -> Result<(u8, &[u8])> {
    need(data, 1)?;
    Ok((data[0], &data[1..]))
}

pub fn read_short(data: &[u8]) -> Result<(u16, &[u8])> {
    read_int_2(data)
}

/// Reads a big-endian `[short]`, by zero-copy casting onto `data` rather
/// than an explicit `from_be_bytes` array build.
pub fn read_int_2(data: &[u8]) -> Result<(u16, &[u8])> {
    need(data, 2)?;
    let (value, rest) = U16BE::read_from_prefix(data).map_err(|_| Error::protocol("short read failed"))?;
    Ok((value.get(), rest))
}

pub fn read_int(data: &[u8]) -> Result<(i32, &[u8])> {
    need(data, 4)?;
    let (value, rest) = I32BE::read_from_prefix(data).map_err(|_| Error::protocol("int read failed"))?;
    Ok((value.get(), rest))
}

pub fn read_long(data: &[u8]) -> Result<(i64, &[u8])> {
    need(data, 8)?;
    let (value, rest) = I64BE::read_from_prefix(data).map_err(|_| Error::protocol("long read failed"))?;
    Ok((value.get(), rest))
}

/// `[string]` = `[short]` length + UTF-8 bytes.
pub fn read_string(data: &[u8]) -> Result<(&str, &[u8])> {
    let (len, rest) = read_int_2(data)?;
    let (bytes, rest) = read_string_fix(rest, len as usize)?;
    Ok((
        simdutf8::basic::from_utf8(bytes).map_err(|_| Error::protocol("invalid utf-8 in [string]"))?,
        rest,
    ))
}

/// `[long string]` = `[int]` length + UTF-8 bytes.
pub fn read_long_string(data: &[u8]) -> Result<(&str, &[u8])> {
    let (len, rest) = read_int(data)?;
    if len < 0 {
        return Err(Error::protocol("negative [long string] length"));
    }
    let (bytes, rest) = read_string_fix(rest, len as usize)?;
    Ok((
        simdutf8::basic::from_utf8(bytes)
            .map_err(|_| Error::protocol("invalid utf-8 in [long string]"))?,
        rest,
    ))
}

/// `[bytes]` = `[int]` length + bytes; length < 0 means null.
pub fn read_bytes(data: &[u8]) -> Result<(Option<&[u8]>, &[u8])> {
    let (len, rest) = read_int(data)?;
    if len < 0 {
        return Ok((None, rest));
    }
    let (bytes, rest) = read_string_fix(rest, len as usize)?;
    Ok((Some(bytes), rest))
}

/// `[short bytes]` = `[short]` length + bytes.
pub fn read_short_bytes(data: &[u8]) -> Result<(&[u8], &[u8])> {
    let (len, rest) = read_int_2(data)?;
    read_string_fix(rest, len as usize)
}

pub fn read_string_fix(data: &[u8], len: usize) -> Result<(&[u8], &[u8])> {
    need(data, len)?;
    Ok((&data[..len], &data[len..]))
}

/// `[string list]` = `[short]` n + n x `[string]`.
pub fn read_string_list(data: &[u8]) -> Result<(Vec<String>, &[u8])> {
    let (n, mut rest) = read_int_2(data)?;
    let mut out = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let (s, next) = read_string(rest)?;
        out.push(s.to_owned());
        rest = next;
    }
    Ok((out, rest))
}

/// `[string map]` = `[short]` n + n x (`[string]` key, `[string]` value).
pub fn read_string_map(data: &[u8]) -> Result<(Vec<(String, String)>, &[u8])> {
    let (n, mut rest) = read_int_2(data)?;
    let mut out = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let (k, next) = read_string(rest)?;
        let (v, next) = read_string(next)?;
        out.push((k.to_owned(), v.to_owned()));
        rest = next;
    }
    Ok((out, rest))
}

/// `[string multimap]` = `[short]` n + n x (`[string]` key, `[string list]` value).
pub fn read_string_multimap(data: &[u8]) -> Result<(Vec<(String, Vec<String>)>, &[u8])> {
    let (n, mut rest) = read_int_2(data)?;
    let mut out = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let (k, next) = read_string(rest)?;
        let (v, next) = read_string_list(next)?;
        out.push((k.to_owned(), v));
        rest = next;
    }
    Ok((out, rest))
}

/// `[bytes map]` = `[short]` n + n x (`[string]` key, `[bytes]` value).
pub fn read_bytes_map(data: &[u8]) -> Result<(Vec<(String, Vec<u8>)>, &[u8])> {
    let (n, mut rest) = read_int_2(data)?;
    let mut out = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let (k, next) = read_string(rest)?;
        let (v, next) = read_bytes(next)?;
        out.push((k.to_owned(), v.unwrap_or(&[]).to_vec()));
        rest = next;
    }
    Ok((out, rest))
}

/// `[inet]` = `[byte]` addr-len (4 or 16) + bytes + `[int]` port.
pub fn read_inet(data: &[u8]) -> Result<((IpAddr, u16), &[u8])> {
    let (len, rest) = read_byte(data)?;
    let (addr_bytes, rest) = read_string_fix(rest, len as usize)?;
    let addr = match addr_bytes.len() {
        4 => IpAddr::from(<[u8; 4]>::try_from(addr_bytes).expect("checked len")),
        16 => IpAddr::from(<[u8; 16]>::try_from(addr_bytes).expect("checked len")),
        other => return Err(Error::protocol(format!("[inet] address length {other}, need 4 or 16"))),
    };
    let (port, rest) = read_int(rest)?;
    Ok(((addr, port as u16), rest))
}

pub fn read_uuid(data: &[u8]) -> Result<([u8; 16], &[u8])> {
    let (bytes, rest) = read_string_fix(data, 16)?;
    Ok((bytes.try_into().expect("checked len"), rest))
}

// ---- writers ----

pub fn write_byte(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

pub fn write_short(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn write_int(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn write_long(out: &mut Vec<u8>, v: i64) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn write_string(out: &mut Vec<u8>, s: &str) {
    write_short(out, s.len() as u16);
    out.extend_from_slice(s.as_bytes());
}

pub fn write_long_string(out: &mut Vec<u8>, s: &str) {
    write_int(out, s.len() as i32);
    out.extend_from_slice(s.as_bytes());
}

pub fn write_bytes(out: &mut Vec<u8>, bytes: Option<&[u8]>) {
    match bytes {
        Some(b) => {
            write_int(out, b.len() as i32);
            out.extend_from_slice(b);
        }
        None => write_int(out, -1),
    }
}

pub fn write_short_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_short(out, bytes.len() as u16);
    out.extend_from_slice(bytes);
}

pub fn write_string_list(out: &mut Vec<u8>, items: &[impl AsRef<str>]) {
    write_short(out, items.len() as u16);
    for s in items {
        write_string(out, s.as_ref());
    }
}

pub fn write_string_map(out: &mut Vec<u8>, items: &[(impl AsRef<str>, impl AsRef<str>)]) {
    write_short(out, items.len() as u16);
    for (k, v) in items {
        write_string(out, k.as_ref());
        write_string(out, v.as_ref());
    }
}

/// `[bytes map]` = `[short]` n + n x (`[string]` key, `[bytes]` value); the
/// request-side custom payload the `custom_payload` header flag announces.
pub fn write_bytes_map(out: &mut Vec<u8>, items: &[(impl AsRef<str>, impl AsRef<[u8]>)]) {
    write_short(out, items.len() as u16);
    for (k, v) in items {
        write_string(out, k.as_ref());
        write_bytes(out, Some(v.as_ref()));
    }
}

pub fn write_inet(out: &mut Vec<u8>, addr: IpAddr, port: u16) {
    match addr {
        IpAddr::V4(v4) => {
            write_byte(out, 4);
            out.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            write_byte(out, 16);
            out.extend_from_slice(&v6.octets());
        }
    }
    write_int(out, port as i32);
}

pub fn write_uuid(out: &mut Vec<u8>, bytes: [u8; 16]) {
    out.extend_from_slice(&bytes);
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use super::*;

    #[test]
    fn short_round_trips() {
        let mut out = Vec::new();
        write_short(&mut out, 0xBEEF);
        let (v, rest) = read_short(&out).unwrap();
        assert_eq!(v, 0xBEEF);
        assert!(rest.is_empty());
    }

    #[test]
    fn int_and_long_round_trip_negative_values() {
        let mut out = Vec::new();
        write_int(&mut out, -12345);
        write_long(&mut out, -9_000_000_000_000);
        let (i, rest) = read_int(&out).unwrap();
        assert_eq!(i, -12345);
        let (l, rest) = read_long(rest).unwrap();
        assert_eq!(l, -9_000_000_000_000);
        assert!(rest.is_empty());
    }

    #[test]
    fn string_round_trips() {
        let mut out = Vec::new();
        write_string(&mut out, "datacenter1");
        let (s, rest) = read_string(&out).unwrap();
        assert_eq!(s, "datacenter1");
        assert!(rest.is_empty());
    }

    #[test]
    fn long_string_round_trips() {
        let mut out = Vec::new();
        write_long_string(&mut out, "SELECT * FROM ks.tbl");
        let (s, rest) = read_long_string(&out).unwrap();
        assert_eq!(s, "SELECT * FROM ks.tbl");
        assert!(rest.is_empty());
    }

    #[test]
    fn bytes_null_is_negative_length() {
        let mut out = Vec::new();
        write_bytes(&mut out, None);
        let (v, rest) = read_bytes(&out).unwrap();
        assert_eq!(v, None);
        assert!(rest.is_empty());
    }

    #[test]
    fn bytes_round_trips_payload() {
        let mut out = Vec::new();
        write_bytes(&mut out, Some(&[1, 2, 3]));
        let (v, rest) = read_bytes(&out).unwrap();
        assert_eq!(v, Some(&[1u8, 2, 3][..]));
        assert!(rest.is_empty());
    }

    #[test]
    fn short_bytes_round_trips() {
        let mut out = Vec::new();
        write_short_bytes(&mut out, b"resultid");
        let (v, rest) = read_short_bytes(&out).unwrap();
        assert_eq!(v, b"resultid");
        assert!(rest.is_empty());
    }

    #[test]
    fn string_list_round_trips() {
        let mut out = Vec::new();
        write_string_list(&mut out, &["a", "bb", "ccc"]);
        let (v, rest) = read_string_list(&out).unwrap();
        assert_eq!(v, vec!["a".to_owned(), "bb".to_owned(), "ccc".to_owned()]);
        assert!(rest.is_empty());
    }

    #[test]
    fn string_map_round_trips() {
        let mut out = Vec::new();
        write_string_map(&mut out, &[("CQL_VERSION", "3.0.0")]);
        let (v, rest) = read_string_map(&out).unwrap();
        assert_eq!(v, vec![("CQL_VERSION".to_owned(), "3.0.0".to_owned())]);
        assert!(rest.is_empty());
    }

    #[test]
    fn bytes_map_round_trips() {
        let mut out = Vec::new();
        write_bytes_map(&mut out, &[("k", b"v".as_slice())]);
        let (v, rest) = read_bytes_map(&out).unwrap();
        assert_eq!(v, vec![("k".to_owned(), b"v".to_vec())]);
        assert!(rest.is_empty());
    }

    #[test]
    fn inet_round_trips_v4_and_v6() {
        let mut out = Vec::new();
        write_inet(&mut out, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 9042);
        let ((addr, port), rest) = read_inet(&out).unwrap();
        assert_eq!(addr, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(port, 9042);
        assert!(rest.is_empty());

        let mut out = Vec::new();
        write_inet(&mut out, IpAddr::V6(Ipv6Addr::LOCALHOST), 9042);
        let ((addr, _), rest) = read_inet(&out).unwrap();
        assert_eq!(addr, IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert!(rest.is_empty());
    }

    #[test]
    fn uuid_round_trips() {
        let bytes: [u8; 16] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16];
        let mut out = Vec::new();
        write_uuid(&mut out, bytes);
        let (v, rest) = read_uuid(&out).unwrap();
        assert_eq!(v, bytes);
        assert!(rest.is_empty());
    }

    #[test]
    fn short_read_reports_need_more_data() {
        let err = read_int(&[0, 1]).unwrap_err();
        assert!(matches!(err, Error::NeedMoreData { needed: 4, available: 2 }));
    }
}
