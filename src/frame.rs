//! Length-prefixed, optionally zlib-compressed JSON frame codec.
//!
//! A frame on the wire is:
//!
//! * `none`: `u32be length | length bytes UTF-8 JSON`
//! * `zlib`: `u32be length | u32be uncompressed_length | zlib(payload)`
//!
//! The codec never parses JSON; that is the caller's job.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression as ZlibLevel;

use crate::error::{Error, ErrorKind};

/// Negotiated per-connection compression.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Compression {
    None,
    Zlib,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Zlib => "zlib",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Compression::None),
            "zlib" => Some(Compression::Zlib),
            _ => None,
        }
    }
}

/// The broker's own compression preference order. The first entry also
/// appearing in a client's `compressions` list wins (see `Broker::create`).
pub const COMPRESSION_PREFERENCE: &[Compression] = &[Compression::Zlib, Compression::None];

const LEN_HEADER: usize = 4;

/// Append a frame carrying `s` to `buffer`, encoded with `compression`.
pub fn push_string(buffer: &mut Vec<u8>, compression: Compression, s: &str) -> Result<(), Error> {
    match compression {
        Compression::None => {
            let body = s.as_bytes();
            let len: u32 = body
                .len()
                .try_into()
                .map_err(|_| Error::data("frame too large"))?;
            buffer.reserve(LEN_HEADER + body.len());
            buffer.extend_from_slice(&len.to_be_bytes());
            buffer.extend_from_slice(body);
        }
        Compression::Zlib => {
            let mut encoder = ZlibEncoder::new(Vec::new(), ZlibLevel::default());
            encoder
                .write_all(s.as_bytes())
                .map_err(|e| Error::new(ErrorKind::Data, e.to_string()))?;
            let compressed = encoder
                .finish()
                .map_err(|e| Error::new(ErrorKind::Data, e.to_string()))?;
            let uncompressed_len: u32 = s
                .len()
                .try_into()
                .map_err(|_| Error::data("frame too large"))?;
            let total_len: u32 = (4 + compressed.len())
                .try_into()
                .map_err(|_| Error::data("frame too large"))?;
            buffer.reserve(LEN_HEADER + 4 + compressed.len());
            buffer.extend_from_slice(&total_len.to_be_bytes());
            buffer.extend_from_slice(&uncompressed_len.to_be_bytes());
            buffer.extend_from_slice(&compressed);
        }
    }
    Ok(())
}

/// If `buffer` holds a complete frame, remove it and return the decoded
/// UTF-8 JSON string.
pub fn try_pop_frame(
    buffer: &mut Vec<u8>,
    compression: Compression,
) -> Result<Option<String>, Error> {
    if buffer.len() < LEN_HEADER {
        return Ok(None);
    }
    let len = u32::from_be_bytes(buffer[0..LEN_HEADER].try_into().unwrap()) as usize;
    if buffer.len() < LEN_HEADER + len {
        return Ok(None);
    }
    let body = buffer[LEN_HEADER..LEN_HEADER + len].to_vec();
    let consumed = LEN_HEADER + len;
    let s = match compression {
        Compression::None => String::from_utf8(body).map_err(|e| Error::new(ErrorKind::Data, e.to_string()))?,
        Compression::Zlib => {
            if body.len() < 4 {
                return Err(Error::new(ErrorKind::Data, "corrupt frame"));
            }
            let uncompressed_len = u32::from_be_bytes(body[0..4].try_into().unwrap()) as usize;
            let mut decoder = ZlibDecoder::new(&body[4..]);
            let mut out = Vec::with_capacity(uncompressed_len);
            decoder
                .read_to_end(&mut out)
                .map_err(|_| Error::new(ErrorKind::Data, "corrupt frame"))?;
            if out.len() != uncompressed_len {
                return Err(Error::new(ErrorKind::Data, "corrupt frame"));
            }
            String::from_utf8(out).map_err(|e| Error::new(ErrorKind::Data, e.to_string()))?
        }
    };
    buffer.drain(0..consumed);
    Ok(Some(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_round_trips() {
        let mut buf = Vec::new();
        push_string(&mut buf, Compression::None, "hello world").unwrap();
        let out = try_pop_frame(&mut buf, Compression::None).unwrap();
        assert_eq!(out.as_deref(), Some("hello world"));
        assert!(buf.is_empty());
    }

    #[test]
    fn zlib_round_trips() {
        let mut buf = Vec::new();
        let payload = "x".repeat(4096);
        push_string(&mut buf, Compression::Zlib, &payload).unwrap();
        let out = try_pop_frame(&mut buf, Compression::Zlib).unwrap();
        assert_eq!(out.as_deref(), Some(payload.as_str()));
    }

    #[test]
    fn incomplete_frame_returns_none() {
        let mut buf = Vec::new();
        push_string(&mut buf, Compression::None, "abc").unwrap();
        buf.truncate(buf.len() - 1);
        assert!(try_pop_frame(&mut buf, Compression::None).unwrap().is_none());
    }

    #[test]
    fn multiple_frames_pop_in_order() {
        let mut buf = Vec::new();
        push_string(&mut buf, Compression::None, "one").unwrap();
        push_string(&mut buf, Compression::None, "two").unwrap();
        assert_eq!(
            try_pop_frame(&mut buf, Compression::None).unwrap().as_deref(),
            Some("one")
        );
        assert_eq!(
            try_pop_frame(&mut buf, Compression::None).unwrap().as_deref(),
            Some("two")
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn zlib_length_mismatch_is_corrupt() {
        let mut buf = Vec::new();
        push_string(&mut buf, Compression::Zlib, "hello").unwrap();
        // Corrupt the inner uncompressed-length header.
        buf[4] = 0xff;
        assert!(try_pop_frame(&mut buf, Compression::Zlib).is_err());
    }
}
