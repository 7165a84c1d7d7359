//! EBML (Extensible Binary Meta Language) writing primitives.
//!
//! Every element is `ID | size | payload`. IDs keep their leading-1 marker
//! and are written as-is; sizes are variable-length integers:
//!
//! - 1 byte:  `1xxx xxxx`                (7 data bits)
//! - 2 bytes: `01xx xxxx xxxx xxxx`       (14 data bits)
//! - ...
//! - 8 bytes: `0000 0001 ...`             (56 data bits)
//!
//! The all-ones value of a width is reserved for "unknown size".
//!
//! Master elements are assembled in an in-memory [`EbmlBuf`] so their size
//! is known before they hit the file. Only the Segment is written with an
//! unknown size and patched on finalize.

use byteorder::{BigEndian, WriteBytesExt};
use std::io::Write;

use crate::error::{MuxError, MuxResult};

/// Largest size encodable in 8 bytes (the all-ones value is reserved).
pub const MAX_SIZE: u64 = (1u64 << 56) - 2;

/// 8-byte "unknown size" marker.
pub const UNKNOWN_SIZE: [u8; 8] = [0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];

/// Number of bytes `id` occupies.
pub fn id_width(id: u32) -> usize {
    match id {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    }
}

/// Smallest vint width able to hold `size`.
pub fn size_width(size: u64) -> usize {
    (1..=8)
        .find(|w| size < (1u64 << (7 * w)) - 1)
        .unwrap_or(8)
}

pub fn write_id<W: Write>(w: &mut W, id: u32) -> MuxResult<()> {
    let bytes = id.to_be_bytes();
    w.write_all(&bytes[4 - id_width(id)..])?;
    Ok(())
}

pub fn write_size<W: Write>(w: &mut W, size: u64) -> MuxResult<()> {
    write_size_width(w, size, size_width(size))
}

/// Write `size` with a fixed width, e.g. for fields patched later.
pub fn write_size_width<W: Write>(w: &mut W, size: u64, width: usize) -> MuxResult<()> {
    if size > MAX_SIZE || width == 0 || width > 8 || size >= (1u64 << (7 * width)) - 1 {
        return Err(MuxError::InvalidConfig(format!(
            "element size {size} does not fit in {width} bytes"
        )));
    }
    let marked = size | (1u64 << (7 * width));
    let bytes = marked.to_be_bytes();
    w.write_all(&bytes[8 - width..])?;
    Ok(())
}

/// Minimal big-endian bytes of an unsigned value (at least one byte).
fn uint_bytes(value: u64) -> ([u8; 8], usize) {
    let bytes = value.to_be_bytes();
    let skip = (value.leading_zeros() / 8).min(7) as usize;
    (bytes, skip)
}

/// Growable buffer for building elements.
#[derive(Default, Debug, Clone)]
pub struct EbmlBuf {
    data: Vec<u8>,
}

impl EbmlBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    fn header(&mut self, id: u32, size: u64) -> MuxResult<()> {
        write_id(&mut self.data, id)?;
        write_size(&mut self.data, size)
    }

    pub fn uint(&mut self, id: u32, value: u64) -> MuxResult<&mut Self> {
        let (bytes, skip) = uint_bytes(value);
        self.header(id, (8 - skip) as u64)?;
        self.data.extend_from_slice(&bytes[skip..]);
        Ok(self)
    }

    pub fn float(&mut self, id: u32, value: f64) -> MuxResult<&mut Self> {
        self.header(id, 8)?;
        self.data.write_f64::<BigEndian>(value)?;
        Ok(self)
    }

    pub fn string(&mut self, id: u32, value: &str) -> MuxResult<&mut Self> {
        self.binary(id, value.as_bytes())
    }

    pub fn binary(&mut self, id: u32, value: &[u8]) -> MuxResult<&mut Self> {
        self.header(id, value.len() as u64)?;
        self.data.extend_from_slice(value);
        Ok(self)
    }

    /// Nested master element built by `body`.
    pub fn master(
        &mut self,
        id: u32,
        body: impl FnOnce(&mut EbmlBuf) -> MuxResult<()>,
    ) -> MuxResult<&mut Self> {
        let mut inner = EbmlBuf::new();
        body(&mut inner)?;
        self.binary(id, inner.as_bytes())
    }

    /// Raw bytes, already encoded.
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.extend_from_slice(bytes);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_widths() {
        assert_eq!(id_width(0xA3), 1);
        assert_eq!(id_width(0x4286), 2);
        assert_eq!(id_width(0x2AD7B1), 3);
        assert_eq!(id_width(0x1A45DFA3), 4);
    }

    #[test]
    fn size_encoding() {
        let mut out = Vec::new();
        write_size(&mut out, 5).unwrap();
        assert_eq!(out, [0x85]);

        out.clear();
        // 127 is the reserved 1-byte all-ones value, so it needs 2 bytes
        write_size(&mut out, 127).unwrap();
        assert_eq!(out, [0x40, 0x7F]);

        out.clear();
        write_size_width(&mut out, 5, 8).unwrap();
        assert_eq!(out, [0x01, 0, 0, 0, 0, 0, 0, 5]);
    }

    #[test]
    fn oversize_is_rejected() {
        let mut out = Vec::new();
        assert!(write_size_width(&mut out, 200, 1).is_err());
        assert!(write_size(&mut out, MAX_SIZE + 1).is_err());
    }

    #[test]
    fn uint_uses_minimal_bytes() {
        let mut buf = EbmlBuf::new();
        buf.uint(0xD7, 1).unwrap();
        assert_eq!(buf.as_bytes(), [0xD7, 0x81, 0x01]);

        let mut buf = EbmlBuf::new();
        buf.uint(0xD7, 0).unwrap();
        assert_eq!(buf.as_bytes(), [0xD7, 0x81, 0x00]);

        let mut buf = EbmlBuf::new();
        buf.uint(0x2AD7B1, 1_000_000).unwrap();
        assert_eq!(buf.as_bytes(), [0x2A, 0xD7, 0xB1, 0x83, 0x0F, 0x42, 0x40]);
    }

    #[test]
    fn master_wraps_children() {
        let mut buf = EbmlBuf::new();
        buf.master(0xE1, |m| {
            m.uint(0x9F, 2)?;
            Ok(())
        })
        .unwrap();
        assert_eq!(buf.as_bytes(), [0xE1, 0x83, 0x9F, 0x81, 0x02]);
    }

    #[test]
    fn float_is_eight_bytes() {
        let mut buf = EbmlBuf::new();
        buf.float(0xB5, 48000.0).unwrap();
        assert_eq!(buf.len(), 1 + 1 + 8);
        assert_eq!(&buf.as_bytes()[2..], &48000.0f64.to_be_bytes());
    }
}
