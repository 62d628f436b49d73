use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::codec::CHUNK_WORDS;
use crate::model::{FileId, TrackId};

/// One-byte command codes of the framed packet protocol this crate consumes.
///
/// Only the commands the streaming core reacts to are listed; the session
/// layer above handles the rest.
pub mod cmd {
    /// Keepalive from the server, answered with `PONG`
    pub const PING: u8 = 0x04;
    /// Chunk request (client to server)
    pub const STREAM_CHUNK: u8 = 0x08;
    /// Chunk response stream, correlated by channel id
    pub const STREAM_CHUNK_RES: u8 = 0x09;
    /// Audio key request (client to server)
    pub const REQUEST_KEY: u8 = 0x0c;
    /// Audio key response, correlated by sequence number
    pub const AES_KEY: u8 = 0x0d;
    /// Audio key rejection
    pub const AES_KEY_ERROR: u8 = 0x0e;
    /// Country notification sent after login
    pub const COUNTRY_CODE: u8 = 0x1b;
    /// Keepalive reply (client to server)
    pub const PONG: u8 = 0x49;
    /// Server acknowledgement of a `PONG`
    pub const PONG_ACK: u8 = 0x4a;
}

/// Header record id carrying the total file size in words
pub const TOTAL_SIZE_HEADER: u8 = 0x03;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("transport failure: {0}")]
    Failed(String),
}

/// Bidirectional framed packet stream, typed by a one-byte command code.
///
/// Implemented by the session layer on top of its shannon-encrypted TCP
/// connection; tests substitute an in-memory fake.
#[async_trait]
pub trait PacketTransport: Send + Sync {
    async fn send_packet(&self, cmd: u8, payload: &[u8]) -> Result<(), TransportError>;
    async fn recv_packet(&self) -> Result<(u8, Vec<u8>), TransportError>;
}

/// Build a `STREAM_CHUNK` request for one whole chunk.
///
/// The requested range is `[start_word, end_word)` measured in 4-byte words.
pub fn build_chunk_request(channel_id: u16, file_id: &FileId, chunk_index: u32) -> Vec<u8> {
    let start_word = chunk_index * CHUNK_WORDS as u32;
    let end_word = start_word + CHUNK_WORDS as u32;

    let mut packet = Vec::with_capacity(38);
    packet.extend_from_slice(&channel_id.to_be_bytes());
    packet.extend_from_slice(&0u32.to_be_bytes());
    packet.extend_from_slice(&0u32.to_be_bytes());
    packet.extend_from_slice(file_id.as_bytes());
    packet.extend_from_slice(&start_word.to_be_bytes());
    packet.extend_from_slice(&end_word.to_be_bytes());
    packet
}

/// Build a `REQUEST_KEY` packet for the given track and file pair.
pub fn build_key_request(seq: u32, track_id: &TrackId, file_id: &FileId) -> Vec<u8> {
    let mut packet = Vec::with_capacity(42);
    packet.extend_from_slice(file_id.as_bytes());
    packet.extend_from_slice(track_id.as_bytes());
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(&0u16.to_be_bytes());
    packet
}

/// One header record from the first packet of a chunk response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRecord<'a> {
    pub id: u8,
    pub body: &'a [u8],
}

/// Parse the header records at the start of a chunk response.
///
/// Each record is `length(16) || id(8) || body(length - 1)`. A zero length is
/// skipped; a record running past the buffer ends parsing.
pub fn parse_header_records(mut buf: &[u8]) -> Vec<HeaderRecord<'_>> {
    let mut records = Vec::new();
    while buf.len() >= 2 {
        let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        buf = &buf[2..];
        if len == 0 {
            continue;
        }
        if len > buf.len() {
            warn!(record_len = len, remaining = buf.len(), "truncated header record");
            break;
        }
        records.push(HeaderRecord {
            id: buf[0],
            body: &buf[1..len],
        });
        buf = &buf[len..];
    }
    records
}

/// Total file size in bytes carried by a `TOTAL_SIZE_HEADER` record body.
///
/// The wire value counts 4-byte words.
pub fn total_size_from_header(body: &[u8]) -> Option<u64> {
    if body.len() < 4 {
        return None;
    }
    let words = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    Some(u64::from(words) * 4)
}
