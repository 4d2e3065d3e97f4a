//! Little-endian framing primitives for the cache file format.
//!
//! The format is deliberately simple: fixed-width integers in little-endian
//! byte order and length-prefixed byte strings. Consumers that persist parsed
//! objects into a cache (see [`CacheFormat`](crate::CacheFormat)) use the same
//! primitives for their content blobs.

use std::io::{self, Read, Write};

/// Upper bound for a single length-prefixed field; guards against reading
/// garbage lengths from a corrupt cache.
pub const MAX_FIELD_LEN: u32 = 16 * 1024 * 1024;

/// Write a `u8`.
pub fn write_u8(w: &mut impl Write, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

/// Read a `u8`.
pub fn read_u8(r: &mut impl Read) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

/// Write a `u32` in little-endian order.
pub fn write_u32(w: &mut impl Write, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

/// Read a little-endian `u32`.
pub fn read_u32(r: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Write a `u64` in little-endian order.
pub fn write_u64(w: &mut impl Write, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

/// Read a little-endian `u64`.
pub fn read_u64(r: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Write a length-prefixed byte string.
pub fn write_bytes(w: &mut impl Write, data: &[u8]) -> io::Result<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "field too long"))?;
    write_u32(w, len)?;
    w.write_all(data)
}

/// Read a length-prefixed byte string.
pub fn read_bytes(r: &mut impl Read) -> io::Result<Vec<u8>> {
    let len = read_u32(r)?;
    if len > MAX_FIELD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "field length out of bounds",
        ));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Write a length-prefixed UTF-8 string.
pub fn write_str(w: &mut impl Write, s: &str) -> io::Result<()> {
    write_bytes(w, s.as_bytes())
}

/// Read a length-prefixed UTF-8 string.
pub fn read_str(r: &mut impl Read) -> io::Result<String> {
    let raw = read_bytes(r)?;
    String::from_utf8(raw).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid utf-8"))
}

/// Write a length-prefixed list of UTF-8 strings.
pub fn write_str_list(w: &mut impl Write, items: &[String]) -> io::Result<()> {
    let len = u32::try_from(items.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "list too long"))?;
    write_u32(w, len)?;
    for item in items {
        write_str(w, item)?;
    }
    Ok(())
}

/// Read a length-prefixed list of UTF-8 strings.
pub fn read_str_list(r: &mut impl Read) -> io::Result<Vec<String>> {
    let len = read_u32(r)?;
    if len > MAX_FIELD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "list length out of bounds",
        ));
    }
    let mut items = Vec::with_capacity(len as usize);
    for _ in 0..len {
        items.push(read_str(r)?);
    }
    Ok(items)
}
