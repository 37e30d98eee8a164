//! Stream I/O for the two message shapes
//!
//! Enveloped messages carry control traffic: a CRC-checked, optionally
//! encrypted payload streamed in chunks resynchronized by the magic constant.
//! Block messages carry file data: a 32-byte header per chunk with
//! stop-and-wait pacing between chunks.
//!
//! Every socket failure (including EOF and timeouts) is reported as
//! `TransferError::Connection`; framing problems as `TransferError::Frame`.
//! Neither is retried here.

use std::io::{Read, Write};

use crate::crypto::SessionCipher;
use crate::error::{Result, TransferError};
use crate::protocol::{
    BLOCK_HEADER_LEN, CHUNK_SIZE, CONTINUE_TOKEN, ENVELOPE_PREFIX_LEN, MAGIC, MAGIC_BYTES,
    MAX_BLOCK_CHUNK,
};
use crate::protocol_core::{
    build_envelope_prefix, parse_envelope_prefix, validate_frame_size, BlockHeader,
    EnvelopePrefix,
};

fn read_exact<S: Read>(stream: &mut S, buf: &mut [u8]) -> Result<()> {
    stream.read_exact(buf).map_err(TransferError::from_socket)
}

fn write_all<S: Write>(stream: &mut S, buf: &[u8]) -> Result<()> {
    stream.write_all(buf).map_err(TransferError::from_socket)
}

/// Read the 4 bytes that start every message on a connection.
pub fn read_lead<S: Read>(stream: &mut S) -> Result<[u8; 4]> {
    let mut lead = [0u8; 4];
    read_exact(stream, &mut lead)?;
    Ok(lead)
}

/// Write one enveloped message, encrypting it when a cipher is given.
pub fn send_message<S: Write>(
    stream: &mut S,
    payload: &[u8],
    cipher: Option<&SessionCipher>,
) -> Result<()> {
    let sealed;
    let body = match cipher {
        Some(c) => {
            sealed = c.seal(payload);
            sealed.as_slice()
        }
        None => payload,
    };
    validate_frame_size(body.len())?;

    let prefix = build_envelope_prefix(&EnvelopePrefix {
        payload_len: body.len() as u32,
        crc32: crc32fast::hash(body),
        encrypted: cipher.is_some(),
    });
    write_all(stream, &prefix)?;
    for (i, chunk) in body.chunks(CHUNK_SIZE).enumerate() {
        if i > 0 {
            write_all(stream, &MAGIC_BYTES)?;
        }
        write_all(stream, chunk)?;
    }
    stream.flush().map_err(TransferError::from_socket)
}

/// Read one enveloped message and return its plaintext payload.
pub fn receive_message<S: Read>(stream: &mut S, cipher: Option<&SessionCipher>) -> Result<Vec<u8>> {
    let lead = read_lead(stream)?;
    receive_message_after_magic(stream, lead, cipher)
}

/// Continue reading an envelope whose first four bytes were already consumed.
pub fn receive_message_after_magic<S: Read>(
    stream: &mut S,
    lead: [u8; 4],
    cipher: Option<&SessionCipher>,
) -> Result<Vec<u8>> {
    let mut raw = [0u8; ENVELOPE_PREFIX_LEN];
    raw[0..4].copy_from_slice(&lead);
    read_exact(stream, &mut raw[4..])?;
    let prefix = parse_envelope_prefix(&raw)?;

    let total = prefix.payload_len as usize;
    let mut body = vec![0u8; total];
    let mut offset = 0;
    while offset < total {
        if offset > 0 {
            let marker = read_lead(stream)?;
            if u32::from_le_bytes(marker) != MAGIC {
                return Err(TransferError::Frame(format!(
                    "lost chunk sync at offset {offset}"
                )));
            }
        }
        let end = (offset + CHUNK_SIZE).min(total);
        read_exact(stream, &mut body[offset..end])?;
        offset = end;
    }

    let crc = crc32fast::hash(&body);
    if crc != prefix.crc32 {
        return Err(TransferError::Frame(format!(
            "crc mismatch: got 0x{crc:08X}, expected 0x{:08X}",
            prefix.crc32
        )));
    }

    if !prefix.encrypted {
        return Ok(body);
    }
    match cipher {
        Some(c) => c.open(&body),
        None => Err(TransferError::Decryption(
            "encrypted message before key exchange".into(),
        )),
    }
}

/// Write a block header followed by `payload`, split into chunks of at most
/// `chunk_size` bytes. After each chunk with data remaining, blocks until the
/// peer sends the continuation token.
pub fn send_block<S: Read + Write>(
    stream: &mut S,
    header: &BlockHeader,
    payload: &[u8],
    chunk_size: usize,
) -> Result<()> {
    let chunk_size = chunk_size.clamp(1, MAX_BLOCK_CHUNK);
    validate_frame_size(payload.len())?;
    let total = payload.len() as i32;
    if payload.is_empty() {
        write_all(stream, &header.with_chunk(0, 0, 0, 0).to_bytes())?;
        return stream.flush().map_err(TransferError::from_socket);
    }

    let count = payload.len().div_ceil(chunk_size) as i32;
    let mut sent = 0usize;
    for chunk in payload.chunks(chunk_size) {
        let remaining = (payload.len() - sent - chunk.len()) as i32;
        let h = header.with_chunk(count, total, remaining, chunk.len() as i32);
        write_all(stream, &h.to_bytes())?;
        write_all(stream, chunk)?;
        stream.flush().map_err(TransferError::from_socket)?;
        sent += chunk.len();
        if remaining > 0 {
            let mut token = [0u8; 2];
            read_exact(stream, &mut token)?;
            if token != CONTINUE_TOKEN {
                return Err(TransferError::Frame(format!(
                    "unexpected continuation token {token:?}"
                )));
            }
        }
    }
    Ok(())
}

/// Header-only block message (requests, releases and denials).
pub fn send_header<S: Read + Write>(stream: &mut S, header: &BlockHeader) -> Result<()> {
    send_block(stream, header, &[], 1)
}

/// Read one complete block message.
pub fn receive_block<S: Read + Write>(stream: &mut S) -> Result<(BlockHeader, Vec<u8>)> {
    let lead = read_lead(stream)?;
    receive_block_after_opcode(stream, lead)
}

/// Continue reading a block message whose opcode was already consumed.
pub fn receive_block_after_opcode<S: Read + Write>(
    stream: &mut S,
    lead: [u8; 4],
) -> Result<(BlockHeader, Vec<u8>)> {
    let first = read_header_rest(stream, lead)?;
    first.validate_chunk(0)?;

    let mut payload = Vec::with_capacity(first.total_len as usize);
    let mut current = first;
    loop {
        let start = payload.len();
        payload.resize(start + current.valid_len as usize, 0);
        read_exact(stream, &mut payload[start..])?;
        if current.remaining_len == 0 {
            break;
        }
        write_all(stream, &CONTINUE_TOKEN)?;
        stream.flush().map_err(TransferError::from_socket)?;

        let mut raw = [0u8; BLOCK_HEADER_LEN];
        read_exact(stream, &mut raw)?;
        let next = BlockHeader::from_bytes(&raw);
        if next.opcode != first.opcode
            || next.arg1 != first.arg1
            || next.arg2 != first.arg2
            || next.total_len != first.total_len
        {
            return Err(TransferError::Frame(format!(
                "continuation header {next:?} does not match {first:?}"
            )));
        }
        next.validate_chunk(payload.len())?;
        current = next;
    }
    Ok((first, payload))
}

fn read_header_rest<S: Read>(stream: &mut S, lead: [u8; 4]) -> Result<BlockHeader> {
    let mut raw = [0u8; BLOCK_HEADER_LEN];
    raw[0..4].copy_from_slice(&lead);
    read_exact(stream, &mut raw[4..])?;
    Ok(BlockHeader::from_bytes(&raw))
}
