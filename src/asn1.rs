//! Minimal DER encoding primitives.
//!
//! Every structure in a certificate is built from `wrap_tlv`, so length
//! arithmetic lives in exactly one place (`encode_length`). The reader half
//! only understands definite-length, single-byte-tag TLVs, which is all DER
//! produced by this crate ever contains.

use chrono::{DateTime, Datelike, Utc};

pub mod tag {
    pub const BOOLEAN: u8 = 0x01;
    pub const INTEGER: u8 = 0x02;
    pub const BIT_STRING: u8 = 0x03;
    pub const OCTET_STRING: u8 = 0x04;
    pub const NULL: u8 = 0x05;
    pub const OID: u8 = 0x06;
    pub const UTF8_STRING: u8 = 0x0c;
    pub const UTC_TIME: u8 = 0x17;
    pub const GENERALIZED_TIME: u8 = 0x18;
    pub const SEQUENCE: u8 = 0x30;
    pub const SET: u8 = 0x31;
    /// Context-specific, constructed. OR in the tag number.
    pub const CONTEXT_CONSTRUCTED: u8 = 0xa0;
}

/// DER length octets: short form below 128, otherwise `0x80 | n` followed by
/// the minimum number of big-endian length bytes.
pub fn encode_length(len: usize) -> Vec<u8> {
    if len < 0x80 {
        return vec![len as u8];
    }

    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    let significant = &bytes[skip..];

    let mut out = Vec::with_capacity(1 + significant.len());
    out.push(0x80 | significant.len() as u8);
    out.extend_from_slice(significant);
    out
}

pub fn wrap_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let length = encode_length(content.len());
    let mut out = Vec::with_capacity(1 + length.len() + content.len());
    out.push(tag);
    out.extend_from_slice(&length);
    out.extend_from_slice(content);
    out
}

pub fn sequence(parts: &[&[u8]]) -> Vec<u8> {
    wrap_tlv(tag::SEQUENCE, &parts.concat())
}

pub fn set(parts: &[&[u8]]) -> Vec<u8> {
    wrap_tlv(tag::SET, &parts.concat())
}

/// BIT STRING whose content is a whole number of bytes.
pub fn bit_string(content: &[u8]) -> Vec<u8> {
    bit_string_with_unused(0, content)
}

pub fn bit_string_with_unused(unused_bits: u8, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(1 + content.len());
    body.push(unused_bits);
    body.extend_from_slice(content);
    wrap_tlv(tag::BIT_STRING, &body)
}

pub fn octet_string(content: &[u8]) -> Vec<u8> {
    wrap_tlv(tag::OCTET_STRING, content)
}

pub fn utf8_string(value: &str) -> Vec<u8> {
    wrap_tlv(tag::UTF8_STRING, value.as_bytes())
}

pub fn boolean(value: bool) -> Vec<u8> {
    wrap_tlv(tag::BOOLEAN, &[if value { 0xff } else { 0x00 }])
}

pub fn null() -> Vec<u8> {
    wrap_tlv(tag::NULL, &[])
}

/// INTEGER from big-endian magnitude bytes, treated as non-negative.
pub fn unsigned_integer(magnitude: &[u8]) -> Vec<u8> {
    let skip = magnitude
        .iter()
        .take_while(|b| **b == 0)
        .count()
        .min(magnitude.len().saturating_sub(1));
    let trimmed = &magnitude[skip..];

    let mut body = Vec::with_capacity(trimmed.len() + 1);
    if trimmed.is_empty() {
        body.push(0);
    } else {
        if trimmed[0] & 0x80 != 0 {
            body.push(0);
        }
        body.extend_from_slice(trimmed);
    }
    wrap_tlv(tag::INTEGER, &body)
}

pub fn object_identifier(arcs: &[u64]) -> Vec<u8> {
    let mut body = Vec::new();
    if let [first, second, rest @ ..] = arcs {
        push_base128(&mut body, first * 40 + second);
        for arc in rest {
            push_base128(&mut body, *arc);
        }
    }
    wrap_tlv(tag::OID, &body)
}

fn push_base128(out: &mut Vec<u8>, mut value: u64) {
    let mut groups = vec![(value & 0x7f) as u8];
    value >>= 7;
    while value > 0 {
        groups.push(0x80 | (value & 0x7f) as u8);
        value >>= 7;
    }
    out.extend(groups.iter().rev());
}

/// `[n]` EXPLICIT wrapper.
pub fn context_explicit(number: u8, content: &[u8]) -> Vec<u8> {
    wrap_tlv(tag::CONTEXT_CONSTRUCTED | number, content)
}

/// UTCTime, `yyMMddHHmmssZ`.
pub fn utc_time(at: &DateTime<Utc>) -> Vec<u8> {
    wrap_tlv(tag::UTC_TIME, at.format("%y%m%d%H%M%SZ").to_string().as_bytes())
}

/// GeneralizedTime, `yyyyMMddHHmmssZ`.
pub fn generalized_time(at: &DateTime<Utc>) -> Vec<u8> {
    wrap_tlv(
        tag::GENERALIZED_TIME,
        at.format("%Y%m%d%H%M%SZ").to_string().as_bytes(),
    )
}

/// Certificate validity time: UTCTime through 2049, GeneralizedTime after.
pub fn x509_time(at: &DateTime<Utc>) -> Vec<u8> {
    if at.year() < 2050 {
        utc_time(at)
    } else {
        generalized_time(at)
    }
}

/// Parses DER length octets, returning `(length, octets consumed)`.
pub fn decode_length(input: &[u8]) -> Option<(usize, usize)> {
    let first = *input.first()?;
    if first < 0x80 {
        return Some((first as usize, 1));
    }

    let count = (first & 0x7f) as usize;
    if count == 0 || count > std::mem::size_of::<usize>() {
        return None;
    }
    let bytes = input.get(1..1 + count)?;
    let value = bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
    Some((value, 1 + count))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub tag: u8,
    pub content: &'a [u8],
    /// Header and content together.
    pub raw: &'a [u8],
}

pub fn read_tlv(input: &[u8]) -> Option<(Tlv<'_>, &[u8])> {
    let tag = *input.first()?;
    let (len, consumed) = decode_length(input.get(1..)?)?;
    let start = 1 + consumed;
    let end = start.checked_add(len)?;
    let content = input.get(start..end)?;

    Some((
        Tlv {
            tag,
            content,
            raw: &input[..end],
        },
        &input[end..],
    ))
}

/// Splits a run of concatenated TLVs; `None` if any of them is truncated.
pub fn read_all(mut input: &[u8]) -> Option<Vec<Tlv<'_>>> {
    let mut items = Vec::new();
    while !input.is_empty() {
        let (tlv, rest) = read_tlv(input)?;
        items.push(tlv);
        input = rest;
    }
    Some(items)
}
