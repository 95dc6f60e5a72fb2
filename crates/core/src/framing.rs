//! Frame encoding and decoding.
//!
//! Two wire framings are supported:
//!
//! ```text
//! Newline (compatibility default)
//! +----------------------+----+
//! | UTF-8 payload        | \n |
//! +----------------------+----+
//!
//! LengthPrefixed
//! +------------------+------------------------+
//! | len (u32, BE)    | payload (len bytes)    |
//! +------------------+------------------------+
//! ```
//!
//! Newline framing cannot carry payloads that contain `\n`; the encoder
//! refuses them instead of emitting a frame the consumer would split in two.
//! Length-prefixed framing carries arbitrary bytes.
//!
//! Both directions enforce a maximum frame size so that neither a producer
//! nor a misbehaving peer can make the other side buffer without bound.

use crate::error::{DecodeError, EncodingError, Error};
use crate::record::{Frame, Record};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio_util::codec::{Decoder, Encoder};

/// Default maximum payload size: 1 MiB.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

const LENGTH_PREFIX_LEN: usize = 4;

/// How records are delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    /// One record per `\n`-terminated line.
    #[default]
    Newline,
    /// A 4-byte big-endian length followed by the payload.
    LengthPrefixed,
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::Newline => write!(f, "newline"),
            Framing::LengthPrefixed => write!(f, "length-prefixed"),
        }
    }
}

impl FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "newline" | "line" | "lines" => Ok(Framing::Newline),
            "length-prefixed" | "length" | "len" => Ok(Framing::LengthPrefixed),
            other => Err(format!("unknown framing '{}'", other)),
        }
    }
}

/// Turns records into frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    framing: Framing,
    max_frame_len: usize,
}

impl FrameEncoder {
    pub fn new(framing: Framing, max_frame_len: usize) -> Self {
        Self {
            framing,
            max_frame_len,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Encode one record.
    ///
    /// # Errors
    /// - `EncodingError::FrameTooLarge` if the payload exceeds the maximum
    /// - `EncodingError::EmbeddedDelimiter` for newline framing when the
    ///   payload contains `\n` or ends with `\r`
    /// - `EncodingError::InvalidUtf8` for newline framing of non-text bytes
    /// - `EncodingError::Serialize` if a JSON value cannot be serialized
    pub fn encode(&self, record: &Record) -> Result<Frame, EncodingError> {
        let mut buf = BytesMut::new();
        self.encode_into(record, &mut buf)?;
        Ok(Frame::new(buf.freeze()))
    }

    fn encode_into(&self, record: &Record, dst: &mut BytesMut) -> Result<(), EncodingError> {
        let payload = record.payload()?;
        let too_large = EncodingError::FrameTooLarge {
            len: payload.len(),
            max: self.max_frame_len,
        };
        if payload.len() > self.max_frame_len {
            return Err(too_large);
        }

        match self.framing {
            Framing::Newline => {
                if let Some(offset) = payload.iter().position(|b| *b == b'\n') {
                    return Err(EncodingError::EmbeddedDelimiter { offset });
                }
                // A trailing CR would be eaten by CRLF-tolerant readers.
                if payload.last() == Some(&b'\r') {
                    return Err(EncodingError::EmbeddedDelimiter {
                        offset: payload.len() - 1,
                    });
                }
                if let Err(e) = std::str::from_utf8(&payload) {
                    return Err(EncodingError::InvalidUtf8 {
                        valid_up_to: e.valid_up_to(),
                    });
                }
                dst.reserve(payload.len() + 1);
                dst.extend_from_slice(&payload);
                dst.put_u8(b'\n');
            }
            Framing::LengthPrefixed => {
                let len = u32::try_from(payload.len()).map_err(|_| too_large)?;
                dst.reserve(LENGTH_PREFIX_LEN + payload.len());
                dst.put_u32(len);
                dst.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}

/// Tokio codec for records, used with `FramedRead` / `FramedWrite`.
///
/// After reporting `DecodeError::FrameTooLarge` the codec discards the rest
/// of the rejected frame and resumes at the next frame boundary.
#[derive(Debug, Clone)]
pub struct RecordCodec {
    encoder: FrameEncoder,
    // Where to resume scanning for '\n' in a partially received line.
    next_index: usize,
    // Skipping an oversized line up to and including its '\n'.
    is_discarding: bool,
    // Payload bytes of an oversized length-prefixed frame still to skip.
    skip: usize,
}

impl RecordCodec {
    pub fn new(framing: Framing, max_frame_len: usize) -> Self {
        Self {
            encoder: FrameEncoder::new(framing, max_frame_len),
            next_index: 0,
            is_discarding: false,
            skip: 0,
        }
    }

    pub fn framing(&self) -> Framing {
        self.encoder.framing
    }

    pub fn max_frame_len(&self) -> usize {
        self.encoder.max_frame_len
    }

    /// Whether the codec is skipping the tail of a rejected frame.
    pub fn is_discarding(&self) -> bool {
        self.is_discarding || self.skip > 0
    }

    fn too_large(&self, len: usize) -> DecodeError {
        DecodeError::FrameTooLarge {
            len,
            max: self.max_frame_len(),
        }
    }

    fn decode_line(&mut self, src: &mut BytesMut) -> Result<Option<Record>, DecodeError> {
        loop {
            let start = self.next_index.min(src.len());
            let newline = src[start..].iter().position(|b| *b == b'\n').map(|pos| start + pos);

            match (self.is_discarding, newline) {
                (true, Some(end)) => {
                    src.advance(end + 1);
                    self.is_discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    src.clear();
                    self.next_index = 0;
                    return Ok(None);
                }
                (false, Some(end)) => {
                    self.next_index = 0;
                    let mut line = src.split_to(end + 1);
                    line.truncate(end);
                    if line.last() == Some(&b'\r') {
                        line.truncate(line.len() - 1);
                    }
                    if line.len() > self.max_frame_len() {
                        return Err(self.too_large(line.len()));
                    }
                    return Ok(Some(Record::from_payload(line.freeze())));
                }
                (false, None) if src.len() > self.max_frame_len() => {
                    let len = src.len();
                    src.clear();
                    self.next_index = 0;
                    self.is_discarding = true;
                    return Err(self.too_large(len));
                }
                (false, None) => {
                    self.next_index = src.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_length_prefixed(&mut self, src: &mut BytesMut) -> Result<Option<Record>, DecodeError> {
        if self.skip > 0 {
            let n = self.skip.min(src.len());
            src.advance(n);
            self.skip -= n;
            if self.skip > 0 {
                return Ok(None);
            }
        }
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX_LEN]);
        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_frame_len() {
            src.advance(LENGTH_PREFIX_LEN);
            let n = len.min(src.len());
            src.advance(n);
            self.skip = len - n;
            return Err(self.too_large(len));
        }

        let total = LENGTH_PREFIX_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Record::from_payload(payload)))
    }
}

impl Default for RecordCodec {
    fn default() -> Self {
        Self::new(Framing::Newline, DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for RecordCodec {
    type Item = Record;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Record>, DecodeError> {
        match self.framing() {
            Framing::Newline => self.decode_line(src),
            Framing::LengthPrefixed => self.decode_length_prefixed(src),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Record>, DecodeError> {
        match self.decode(src)? {
            Some(record) => Ok(Some(record)),
            None if src.is_empty() => Ok(None),
            None => {
                let remaining = src.len();
                src.clear();
                self.next_index = 0;
                Err(DecodeError::Truncated { remaining })
            }
        }
    }
}

impl Encoder<Record> for RecordCodec {
    type Error = Error;

    fn encode(&mut self, record: Record, dst: &mut BytesMut) -> Result<(), Error> {
        self.encoder.encode_into(&record, dst)?;
        Ok(())
    }
}

/// Accumulating decoder for bytes arriving in arbitrary chunks.
///
/// Complete frames are returned as records; the trailing incomplete bytes
/// stay buffered until a later call completes them. An error hit after some
/// records of a batch were already complete is held back: the records are
/// returned and the error is reported by the next `decode` or `finish`.
#[derive(Debug)]
pub struct FrameDecoder {
    codec: RecordCodec,
    buffer: BytesMut,
    pending: Option<DecodeError>,
}

impl FrameDecoder {
    pub fn new(framing: Framing, max_frame_len: usize) -> Self {
        Self {
            codec: RecordCodec::new(framing, max_frame_len),
            buffer: BytesMut::new(),
            pending: None,
        }
    }

    /// Feed received bytes and take every record they complete.
    ///
    /// When an earlier error is still pending it is returned and `bytes`
    /// stay buffered for the following call.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<Vec<Record>, DecodeError> {
        self.buffer.extend_from_slice(bytes);
        if let Some(error) = self.pending.take() {
            return Err(error);
        }

        let mut records = Vec::new();
        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => return Ok(records),
                Err(error) if records.is_empty() => return Err(error),
                Err(error) => {
                    self.pending = Some(error);
                    return Ok(records);
                }
            }
        }
    }

    /// Bytes of an incomplete frame waiting for more input.
    pub fn remainder(&self) -> &[u8] {
        &self.buffer
    }

    /// Signal end of input; fails if an error is pending or a frame was
    /// left incomplete.
    pub fn finish(mut self) -> Result<(), DecodeError> {
        if let Some(error) = self.pending.take() {
            return Err(error);
        }
        // decode() already drained every complete frame
        self.codec.decode_eof(&mut self.buffer).map(|_| ())
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(Framing::Newline, DEFAULT_MAX_FRAME_LEN)
    }
}
