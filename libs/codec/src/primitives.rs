//! # Wire Primitives
//!
//! Little-endian building blocks shared by every body layout:
//!
//! - **Tag**: `u16`, the only read where a clean end-of-stream is legal
//! - **Fixed buffer**: NUL-terminated text inside a fixed capacity
//! - **Length-prefixed**: `u32` or `u64` length followed by that many bytes
//! - **Element arrays**: counts come from a record header, never from the wire
//!
//! All readers take `?Sized` streams so handlers can pass `&mut dyn Read`.

use crate::error::{CodecError, CodecResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Read a frame tag; `Ok(None)` when the stream ends cleanly before it
pub fn read_tag<R: Read + ?Sized>(stream: &mut R) -> CodecResult<Option<u16>> {
    let mut tag = [0u8; 2];
    let mut filled = 0;
    while filled < tag.len() {
        match stream.read(&mut tag[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(CodecError::Truncated {
                    context: "message tag".to_string(),
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CodecError::from_io("reading message tag", e)),
        }
    }
    Ok(Some(u16::from_le_bytes(tag)))
}

pub fn write_tag<W: Write + ?Sized>(stream: &mut W, tag: u16) -> CodecResult<()> {
    stream
        .write_u16::<LittleEndian>(tag)
        .map_err(CodecError::io("writing message tag"))
}

pub fn read_u32<R: Read + ?Sized>(stream: &mut R, context: &str) -> CodecResult<u32> {
    stream
        .read_u32::<LittleEndian>()
        .map_err(CodecError::io(context))
}

pub fn read_u64<R: Read + ?Sized>(stream: &mut R, context: &str) -> CodecResult<u64> {
    stream
        .read_u64::<LittleEndian>()
        .map_err(CodecError::io(context))
}

pub fn write_u64<W: Write + ?Sized>(stream: &mut W, value: u64) -> CodecResult<()> {
    stream
        .write_u64::<LittleEndian>(value)
        .map_err(CodecError::io("writing u64"))
}

/// Read `capacity` bytes and return the text before the first NUL
pub fn read_fixed_string<R: Read + ?Sized>(
    stream: &mut R,
    capacity: usize,
    context: &str,
) -> CodecResult<String> {
    let mut buffer = vec![0u8; capacity];
    stream
        .read_exact(&mut buffer)
        .map_err(CodecError::io(context))?;

    let end = buffer
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| CodecError::missing_terminator(capacity, context))?;

    buffer.truncate(end);
    String::from_utf8(buffer)
        .map_err(|e| CodecError::protocol(format!("{context} is not valid UTF-8: {e}")))
}

/// Write `value` NUL-padded to exactly `capacity` bytes
pub fn write_fixed_string<W: Write + ?Sized>(
    stream: &mut W,
    value: &str,
    capacity: usize,
) -> CodecResult<()> {
    let bytes = value.as_bytes();
    if bytes.len() >= capacity {
        return Err(CodecError::protocol(format!(
            "fixed string of {} bytes does not fit a {capacity}-byte buffer",
            bytes.len()
        )));
    }
    if bytes.contains(&0) {
        return Err(CodecError::protocol("fixed string contains an embedded NUL"));
    }

    let mut buffer = vec![0u8; capacity];
    buffer[..bytes.len()].copy_from_slice(bytes);
    stream
        .write_all(&buffer)
        .map_err(CodecError::io("writing fixed string"))
}

fn read_exact_vec<R: Read + ?Sized>(
    stream: &mut R,
    length: u64,
    limit: usize,
    context: &str,
) -> CodecResult<Vec<u8>> {
    if length > limit as u64 {
        return Err(CodecError::body_too_large(length, limit, context));
    }
    let mut buffer = vec![0u8; length as usize];
    stream
        .read_exact(&mut buffer)
        .map_err(CodecError::io(context))?;
    Ok(buffer)
}

/// `u32` length followed by that many bytes
pub fn read_bytes_u32<R: Read + ?Sized>(
    stream: &mut R,
    limit: usize,
    context: &str,
) -> CodecResult<Vec<u8>> {
    let length = read_u32(stream, context)?;
    read_exact_vec(stream, length as u64, limit, context)
}

/// `u64` length followed by that many bytes
pub fn read_bytes_u64<R: Read + ?Sized>(
    stream: &mut R,
    limit: usize,
    context: &str,
) -> CodecResult<Vec<u8>> {
    let length = read_u64(stream, context)?;
    read_exact_vec(stream, length, limit, context)
}

fn into_string(bytes: Vec<u8>, context: &str) -> CodecResult<String> {
    String::from_utf8(bytes)
        .map_err(|e| CodecError::protocol(format!("{context} is not valid UTF-8: {e}")))
}

pub fn read_string_u32<R: Read + ?Sized>(
    stream: &mut R,
    limit: usize,
    context: &str,
) -> CodecResult<String> {
    into_string(read_bytes_u32(stream, limit, context)?, context)
}

pub fn read_string_u64<R: Read + ?Sized>(
    stream: &mut R,
    limit: usize,
    context: &str,
) -> CodecResult<String> {
    into_string(read_bytes_u64(stream, limit, context)?, context)
}

pub fn write_bytes_u32<W: Write + ?Sized>(stream: &mut W, bytes: &[u8]) -> CodecResult<()> {
    let length = u32::try_from(bytes.len())
        .map_err(|_| CodecError::protocol(format!("{} bytes exceed a u32 length", bytes.len())))?;
    stream
        .write_u32::<LittleEndian>(length)
        .and_then(|_| stream.write_all(bytes))
        .map_err(CodecError::io("writing u32-prefixed bytes"))
}

pub fn write_bytes_u64<W: Write + ?Sized>(stream: &mut W, bytes: &[u8]) -> CodecResult<()> {
    stream
        .write_u64::<LittleEndian>(bytes.len() as u64)
        .and_then(|_| stream.write_all(bytes))
        .map_err(CodecError::io("writing u64-prefixed bytes"))
}

fn check_elements(count: usize, width: usize, limit: usize, context: &str) -> CodecResult<()> {
    let size = count.saturating_mul(width);
    if size > limit {
        return Err(CodecError::body_too_large(size as u64, limit, context));
    }
    Ok(())
}

pub fn read_f32_array<R: Read + ?Sized>(
    stream: &mut R,
    count: usize,
    limit: usize,
    context: &str,
) -> CodecResult<Vec<f32>> {
    check_elements(count, 4, limit, context)?;
    let mut values = vec![0f32; count];
    stream
        .read_f32_into::<LittleEndian>(&mut values)
        .map_err(CodecError::io(context))?;
    Ok(values)
}

pub fn write_f32_array<W: Write + ?Sized>(stream: &mut W, values: &[f32]) -> CodecResult<()> {
    for value in values {
        stream
            .write_f32::<LittleEndian>(*value)
            .map_err(CodecError::io("writing f32 array"))?;
    }
    Ok(())
}

pub fn read_u32_array<R: Read + ?Sized>(
    stream: &mut R,
    count: usize,
    limit: usize,
    context: &str,
) -> CodecResult<Vec<u32>> {
    check_elements(count, 4, limit, context)?;
    let mut values = vec![0u32; count];
    stream
        .read_u32_into::<LittleEndian>(&mut values)
        .map_err(CodecError::io(context))?;
    Ok(values)
}

pub fn write_u32_array<W: Write + ?Sized>(stream: &mut W, values: &[u32]) -> CodecResult<()> {
    for value in values {
        stream
            .write_u32::<LittleEndian>(*value)
            .map_err(CodecError::io("writing u32 array"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_tag_clean_eof_and_partial() {
        let mut empty = Cursor::new(Vec::<u8>::new());
        assert!(read_tag(&mut empty).unwrap().is_none());

        let mut partial = Cursor::new(vec![0x04]);
        assert!(matches!(
            read_tag(&mut partial),
            Err(CodecError::Truncated { .. })
        ));

        let mut close = Cursor::new(vec![0x04, 0x00]);
        assert_eq!(read_tag(&mut close).unwrap(), Some(4));
    }

    #[test]
    fn test_fixed_string_requires_terminator() {
        let mut stream = Cursor::new(vec![b'a'; 16]);
        let err = read_fixed_string(&mut stream, 16, "filename").unwrap_err();
        assert!(matches!(err, CodecError::MissingTerminator { capacity: 16, .. }));
    }

    #[test]
    fn test_fixed_string_round_trip() {
        let mut out = Vec::new();
        write_fixed_string(&mut out, "demo.toml", 32).unwrap();
        assert_eq!(out.len(), 32);
        let text = read_fixed_string(&mut Cursor::new(out), 32, "filename").unwrap();
        assert_eq!(text, "demo.toml");
    }

    #[test]
    fn test_fixed_string_rejects_overflow() {
        let mut out = Vec::new();
        assert!(write_fixed_string(&mut out, "abcd", 4).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn test_length_prefixed_truncation() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&10u32.to_le_bytes());
        bytes.extend_from_slice(b"short");
        let err = read_bytes_u32(&mut Cursor::new(bytes), 1024, "CONFIG body").unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn test_length_prefixed_limit() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(1u64 << 40).to_le_bytes());
        let err = read_bytes_u64(&mut Cursor::new(bytes), 1024, "ERROR body").unwrap_err();
        assert!(matches!(err, CodecError::BodyTooLarge { limit: 1024, .. }));
    }

    #[test]
    fn test_array_limit_applies_before_allocation() {
        let err = read_f32_array(&mut Cursor::new(Vec::new()), usize::MAX / 2, 64, "samples")
            .unwrap_err();
        assert!(matches!(err, CodecError::BodyTooLarge { .. }));
    }
}
