//! Wire codec: 16-bit big-endian type header followed by a type-specific
//! payload, per spec section 4.1. Decoding uses `nom` for the
//! string/fixed-width parsing (matching the teacher's frame parser
//! convention), encoding writes directly into a `bytes::BytesMut`.

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    bytes::complete::{tag, take_till},
    IResult,
};

use crate::types::{DemoHash, Nonce, Signature};

/// Maximum size of a single outbound payload (MTU-bounded).
pub const MAX_RESPONSE_LEN: usize = 1400;

pub mod ptype {
    pub const ADD: u16 = 0;
    pub const ADD_RESPONSE: u16 = 1;
    pub const QUERY: u16 = 2;
    pub const QUERY_RESPONSE: u16 = 3;
    pub const GET_METADATA: u16 = 4;
    pub const GET_METADATA_RESPONSE: u16 = 5;
    pub const SIGN_START: u16 = 6;
    pub const SIGN_START_RESPONSE: u16 = 7;
    pub const SIGN_END: u16 = 8;
    pub const SIGN_END_RESPONSE: u16 = 9;
    pub const NAT_HOLE_PUNCH: u16 = 10;
    pub const NAT_HOLE_PUNCH_ALL: u16 = 11;
    pub const VERIFY_QUERY: u16 = 13;
    pub const VERIFY_QUERY_RESPONSE: u16 = 14;
    pub const VERIFY_NAT_HOLE_PUNCH: u16 = 16;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerQueryResponse {
    pub version: String,
    pub state: u8,
    pub num_players: u8,
    pub max_players: u8,
    pub mode: u8,
    pub mission: u8,
    pub name: String,
}

/// A fully decoded packet. One variant per wire type in spec section 4.1,
/// covering both inbound and outbound directions — the codec itself is
/// direction-agnostic, the protocol engine decides what's valid to receive
/// on which socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Add,
    AddResponse { success: bool },
    Query,
    /// One already-chunked payload's worth of `"host:port"` strings.
    QueryResponse { entries: Vec<String> },
    GetMetadata,
    /// One already-chunked payload's worth of JSON object strings.
    GetMetadataResponse { entries: Vec<String> },
    SignStart,
    SignStartResponse { nonce: Nonce, signature: Signature },
    SignEnd { hash: DemoHash, start_message: Vec<u8> },
    SignEndResponse { signature: Signature },
    NatHolePunch { target: String },
    NatHolePunchAll,
    VerifyQuery,
    VerifyQueryResponse(ServerQueryResponse),
    VerifyNatHolePunch,
    /// A syntactically valid header whose type this codec does not
    /// recognise. The caller logs and drops it (spec section 7).
    Unknown(u16),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("packet shorter than the 16-bit type header")]
    Truncated,
    #[error("string field missing its NUL terminator")]
    MissingNul,
    #[error("payload too short for type {0}")]
    ShortPayload(u16),
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
}

fn cstr(input: &[u8]) -> IResult<&[u8], String> {
    // take_till never fails (it stops at end-of-input if no NUL appears),
    // so the following `tag(&[0])` is what actually enforces termination.
    let (rest, bytes) = take_till(|b| b == 0u8)(input)?;
    let (rest, _) = tag(&[0u8][..])(rest)?;
    let s = String::from_utf8(bytes.to_vec())
        .map_err(|_| nom::Err::Failure(nom::error::Error::new(input, nom::error::ErrorKind::Verify)))?;
    Ok((rest, s))
}

fn read_cstr(input: &[u8]) -> Result<(String, &[u8]), CodecError> {
    match cstr(input) {
        Ok((rest, s)) => Ok((s, rest)),
        Err(nom::Err::Error(_)) | Err(nom::Err::Failure(_)) => {
            // Distinguish "no NUL at all" from "NUL present but not UTF-8":
            // take_till always succeeds, so failure here means the trailing
            // tag(&[0]) didn't match, i.e. no NUL terminator was present.
            if input.iter().any(|&b| b == 0) {
                Err(CodecError::InvalidUtf8)
            } else {
                Err(CodecError::MissingNul)
            }
        }
        Err(nom::Err::Incomplete(_)) => Err(CodecError::MissingNul),
    }
}

fn write_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn read_all_cstrs(mut input: &[u8]) -> Result<Vec<String>, CodecError> {
    let mut out = Vec::new();
    while !input.is_empty() {
        let (s, rest) = read_cstr(input)?;
        out.push(s);
        input = rest;
    }
    Ok(out)
}

/// Decode a single inbound/outbound datagram.
pub fn decode(input: &[u8]) -> Result<Packet, CodecError> {
    if input.len() < 2 {
        return Err(CodecError::Truncated);
    }
    let type_code = u16::from_be_bytes([input[0], input[1]]);
    let rest = &input[2..];
    use ptype::*;
    match type_code {
        ADD => Ok(Packet::Add),
        ADD_RESPONSE => {
            if rest.len() < 2 {
                return Err(CodecError::ShortPayload(ADD_RESPONSE));
            }
            let flag = u16::from_be_bytes([rest[0], rest[1]]);
            Ok(Packet::AddResponse { success: flag != 0 })
        }
        QUERY => Ok(Packet::Query),
        QUERY_RESPONSE => Ok(Packet::QueryResponse {
            entries: read_all_cstrs(rest)?,
        }),
        GET_METADATA => Ok(Packet::GetMetadata),
        GET_METADATA_RESPONSE => Ok(Packet::GetMetadataResponse {
            entries: read_all_cstrs(rest)?,
        }),
        SIGN_START => Ok(Packet::SignStart),
        SIGN_START_RESPONSE => {
            if rest.len() < 16 {
                return Err(CodecError::ShortPayload(SIGN_START_RESPONSE));
            }
            let mut nonce = [0u8; 16];
            nonce.copy_from_slice(&rest[..16]);
            Ok(Packet::SignStartResponse {
                nonce: Nonce(nonce),
                signature: Signature(rest[16..].to_vec()),
            })
        }
        SIGN_END => {
            if rest.len() < 20 {
                return Err(CodecError::ShortPayload(SIGN_END));
            }
            let mut hash: DemoHash = [0u8; 20];
            hash.copy_from_slice(&rest[..20]);
            Ok(Packet::SignEnd {
                hash,
                start_message: rest[20..].to_vec(),
            })
        }
        SIGN_END_RESPONSE => Ok(Packet::SignEndResponse {
            signature: Signature(rest.to_vec()),
        }),
        NAT_HOLE_PUNCH => {
            let (target, _) = read_cstr(rest)?;
            Ok(Packet::NatHolePunch { target })
        }
        NAT_HOLE_PUNCH_ALL => Ok(Packet::NatHolePunchAll),
        VERIFY_QUERY => Ok(Packet::VerifyQuery),
        VERIFY_QUERY_RESPONSE => {
            let (version, rest) = read_cstr(rest)?;
            if rest.len() < 5 {
                return Err(CodecError::ShortPayload(VERIFY_QUERY_RESPONSE));
            }
            let fields = &rest[..5];
            let (name, _) = read_cstr(&rest[5..])?;
            Ok(Packet::VerifyQueryResponse(ServerQueryResponse {
                version,
                state: fields[0],
                num_players: fields[1],
                max_players: fields[2],
                mode: fields[3],
                mission: fields[4],
                name,
            }))
        }
        VERIFY_NAT_HOLE_PUNCH => Ok(Packet::VerifyNatHolePunch),
        other => Ok(Packet::Unknown(other)),
    }
}

fn header(buf: &mut BytesMut, type_code: u16) {
    buf.put_u16(type_code);
}

/// Encode a packet into a fresh buffer.
pub fn encode(packet: &Packet) -> Bytes {
    let mut buf = BytesMut::new();
    use ptype::*;
    match packet {
        Packet::Add => header(&mut buf, ADD),
        Packet::AddResponse { success } => {
            header(&mut buf, ADD_RESPONSE);
            buf.put_u16(if *success { 1 } else { 0 });
        }
        Packet::Query => header(&mut buf, QUERY),
        Packet::QueryResponse { entries } => {
            header(&mut buf, QUERY_RESPONSE);
            for e in entries {
                write_cstr(&mut buf, e);
            }
        }
        Packet::GetMetadata => header(&mut buf, GET_METADATA),
        Packet::GetMetadataResponse { entries } => {
            header(&mut buf, GET_METADATA_RESPONSE);
            for e in entries {
                write_cstr(&mut buf, e);
            }
        }
        Packet::SignStart => header(&mut buf, SIGN_START),
        Packet::SignStartResponse { nonce, signature } => {
            header(&mut buf, SIGN_START_RESPONSE);
            buf.put_slice(&nonce.0);
            buf.put_slice(signature.as_bytes());
        }
        Packet::SignEnd { hash, start_message } => {
            header(&mut buf, SIGN_END);
            buf.put_slice(hash);
            buf.put_slice(start_message);
        }
        Packet::SignEndResponse { signature } => {
            header(&mut buf, SIGN_END_RESPONSE);
            buf.put_slice(signature.as_bytes());
        }
        Packet::NatHolePunch { target } => {
            header(&mut buf, NAT_HOLE_PUNCH);
            write_cstr(&mut buf, target);
        }
        Packet::NatHolePunchAll => header(&mut buf, NAT_HOLE_PUNCH_ALL),
        Packet::VerifyQuery => header(&mut buf, VERIFY_QUERY),
        Packet::VerifyQueryResponse(r) => {
            header(&mut buf, VERIFY_QUERY_RESPONSE);
            write_cstr(&mut buf, &r.version);
            buf.put_slice(&[r.state, r.num_players, r.max_players, r.mode, r.mission]);
            write_cstr(&mut buf, &r.name);
        }
        Packet::VerifyNatHolePunch => header(&mut buf, VERIFY_NAT_HOLE_PUNCH),
        Packet::Unknown(t) => header(&mut buf, *t),
    }
    buf.freeze()
}

/// Greedily pack `entries` into the smallest sequence of NUL-terminated-string
/// payloads each at most `max_len` bytes (including the 2-byte type header
/// accounted for by the caller via `overhead`), never splitting a string
/// across a payload boundary. Behaviour for a single entry longer than
/// `max_len` is undefined per spec section 4.1 (`overhead` for ADD/GET
/// responses is consistently 2, kept as a parameter so callers can reuse
/// this for any framed type).
pub fn chunk_entries(entries: &[String], max_len: usize, overhead: usize) -> Vec<Vec<String>> {
    let budget = max_len.saturating_sub(overhead);
    let mut chunks = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_len = 0usize;

    for entry in entries {
        let entry_len = entry.len() + 1; // + NUL
        if !current.is_empty() && current_len + entry_len > budget {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current.push(entry.clone());
        current_len += entry_len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
