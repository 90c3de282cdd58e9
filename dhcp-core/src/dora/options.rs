//! Option marshaller: stored text values become wire bytes at emission
//! time, keyed on the option number.
//!
//! Scalar widths are checked (overflow is `InvalidOptionValue`), IP-list
//! options reject the wrong family for v4 and map v4 entries to
//! `::ffff:a.b.c.d` for v6, and the netmask accepts either dotted-quad or
//! the 4-byte hex text the configure activity writes.
use std::net::{IpAddr, Ipv4Addr};

use crate::{server::SocketFamily, Error};

/// options encoded as a u8
const U8_OPTIONS: &[i64] = &[19, 20, 23, 27, 29, 30, 31, 36, 39, 46];
/// options encoded as a big-endian u16
const U16_OPTIONS: &[i64] = &[13, 22, 25, 26, 57];
/// options encoded as a big-endian u32
const U32_OPTIONS: &[i64] = &[2, 24, 35, 38, 51, 58, 59];
/// IP-or-IP-list options
const IP_LIST_OPTIONS: &[i64] = &[3, 4, 5, 6, 41, 42, 44, 45, 48, 49];
/// single-IP options
const IP_OPTIONS: &[i64] = &[28, 32, 50, 54, 118];
/// plain text options
const TEXT_OPTIONS: &[i64] = &[12, 14, 15, 17, 18, 40, 56, 60, 64, 66, 67];
/// Domain Search List, RFC 1035 label encoding
const DOMAIN_SEARCH: i64 = 119;
/// Subnet Mask
const SUBNET_MASK: i64 = 1;

fn invalid(number: i64, value: &str) -> Error {
    Error::InvalidOptionValue {
        number,
        value: value.to_owned(),
    }
}

/// Encode one `(number, text)` pair for the given reply family
pub fn marshal(number: i64, value: &str, family: SocketFamily) -> Result<Vec<u8>, Error> {
    let value_trimmed = value.trim();
    if number == SUBNET_MASK {
        return netmask(value_trimmed).ok_or_else(|| invalid(number, value));
    }
    if U8_OPTIONS.contains(&number) {
        let n: u8 = value_trimmed.parse().map_err(|_| invalid(number, value))?;
        return Ok(vec![n]);
    }
    if U16_OPTIONS.contains(&number) {
        let n: u16 = value_trimmed.parse().map_err(|_| invalid(number, value))?;
        return Ok(n.to_be_bytes().to_vec());
    }
    if U32_OPTIONS.contains(&number) {
        let n: u32 = value_trimmed.parse().map_err(|_| invalid(number, value))?;
        return Ok(n.to_be_bytes().to_vec());
    }
    if IP_OPTIONS.contains(&number) || IP_LIST_OPTIONS.contains(&number) {
        return ip_list(number, value, family);
    }
    if TEXT_OPTIONS.contains(&number) {
        return Ok(value_trimmed.as_bytes().to_vec());
    }
    if number == DOMAIN_SEARCH {
        return domain_search(number, value_trimmed);
    }
    // unrecognized numbers: hex text when it reads as hex, raw text
    // otherwise
    if let Some(bytes) = hex_bytes(value_trimmed) {
        return Ok(bytes);
    }
    Ok(value_trimmed.as_bytes().to_vec())
}

/// comma-separated addresses, whitespace trimmed. v4 replies take 4-byte
/// groups and reject v6 entries; v6 replies take 16-byte groups with v4
/// entries mapped.
fn ip_list(number: i64, value: &str, family: SocketFamily) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    let mut any = false;
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        any = true;
        let ip: IpAddr = part.parse().map_err(|_| invalid(number, value))?;
        match (family, ip) {
            (SocketFamily::V4, IpAddr::V4(ip)) => out.extend_from_slice(&ip.octets()),
            (SocketFamily::V4, IpAddr::V6(_)) => return Err(invalid(number, value)),
            (SocketFamily::V6, IpAddr::V6(ip)) => out.extend_from_slice(&ip.octets()),
            (SocketFamily::V6, IpAddr::V4(ip)) => {
                out.extend_from_slice(&ip.to_ipv6_mapped().octets())
            }
        }
    }
    if !any {
        return Err(invalid(number, value));
    }
    Ok(out)
}

/// dotted-quad or 8 hex chars
fn netmask(value: &str) -> Option<Vec<u8>> {
    if let Ok(mask) = value.parse::<Ipv4Addr>() {
        return Some(mask.octets().to_vec());
    }
    match hex_bytes(value) {
        Some(bytes) if bytes.len() == 4 => Some(bytes),
        _ => None,
    }
}

/// RFC 1035 label encoding of a comma-separated name list
fn domain_search(number: i64, value: &str) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    for name in value.split(',') {
        let name = name.trim().trim_end_matches('.');
        if name.is_empty() {
            continue;
        }
        for label in name.split('.') {
            if label.is_empty() || label.len() > 63 {
                return Err(invalid(number, value));
            }
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
    }
    if out.is_empty() {
        return Err(invalid(number, value));
    }
    Ok(out)
}

/// decode even-length hex text, with or without an 0x prefix
fn hex_bytes(value: &str) -> Option<Vec<u8>> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    if digits.is_empty() || digits.len() % 2 != 0 {
        return None;
    }
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16).ok())
        .collect()
}
