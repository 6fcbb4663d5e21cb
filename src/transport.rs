// src/transport.rs
//! Inbound framing, in two disciplines. The authentication exchange is
//! strictly line-delimited: `AuthLineCodec` buffers until `\n` however the
//! client fragments its first write. After login clients historically send
//! one message per TCP write and do not always terminate it with a newline,
//! so `LineChunkCodec` treats a buffered payload without `\n` as one
//! complete frame while still splitting on `\n` when a client does
//! terminate its lines.

use std::io;

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a single inbound frame, matching the original 1024-byte
/// socket reads.
pub const MAX_FRAME_BYTES: usize = 1024;

/// Strict newline framing for the authentication exchange. A fragmented
/// first write is buffered to the next `\n`; a line that outgrows the frame
/// cap without one is a protocol error.
pub struct AuthLineCodec;

impl Decoder for AuthLineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, io::Error> {
        match src.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let frame = src.split_to(pos + 1);
                Ok(Some(String::from_utf8_lossy(&frame).trim().to_string()))
            }
            None if src.len() > MAX_FRAME_BYTES => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "authentication line too long",
            )),
            None => Ok(None),
        }
    }
}

pub struct LineChunkCodec;

impl Decoder for LineChunkCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, io::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let frame = match src.iter().position(|&b| b == b'\n') {
            Some(pos) => src.split_to(pos + 1),
            None => {
                let len = src.len().min(MAX_FRAME_BYTES);
                src.split_to(len)
            }
        };
        Ok(Some(String::from_utf8_lossy(&frame).trim().to_string()))
    }
}

impl Encoder<String> for LineChunkCodec {
    type Error = io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), io::Error> {
        dst.reserve(item.len() + 1);
        dst.put(item.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
