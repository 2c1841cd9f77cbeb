//! Little-endian layouts of the guest descriptors.
//!
//! Every guest structure is read sequentially through [`Reader`]; the
//! matching [`Writer`] exists so device emulators and tests can publish
//! well-formed descriptors without a second copy of the layout.

use thiserror::Error;

use crate::geom::{Point, Point16, PointFix, Rect};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("guest descriptor truncated: want {want} bytes, got {got}")]
pub struct WireError {
    pub want: usize,
    pub got: usize,
}

pub type WireResult<T> = Result<T, WireError>;

// Fixed sizes of the sequential layouts below. A union-bearing structure
// always occupies its largest variant so that trailing fields keep fixed
// offsets, exactly like the device ABI it models.
pub const RECT_SIZE: u64 = 16;
pub const POINT_SIZE: u64 = 8;
pub const CHUNK_HEADER_SIZE: u64 = 12;
pub const IMAGE_DESC_SIZE: u64 = 18;
pub const BITMAP_HEADER_SIZE: u64 = 30;
pub const SURFACE_IMAGE_SIZE: u64 = 4;
pub const QUIC_HEADER_SIZE: u64 = 4;
pub const PALETTE_HEADER_SIZE: u64 = 10;
pub const BRUSH_SIZE: u64 = 20;
pub const MASK_SIZE: u64 = 17;
pub const CLIP_SIZE: u64 = 12;
pub const DRAWABLE_PAYLOAD_SIZE: u64 = 68;
pub const DRAWABLE_SIZE: u64 = 123 + DRAWABLE_PAYLOAD_SIZE;
pub const COMPAT_DRAWABLE_SIZE: u64 = 66 + DRAWABLE_PAYLOAD_SIZE;
pub const SURFACE_CMD_SIZE: u64 = 41;
pub const UPDATE_CMD_SIZE: u64 = 32;
pub const MESSAGE_HEADER_SIZE: u64 = 8;
pub const CURSOR_CMD_SIZE: u64 = 22;
pub const CURSOR_SHAPE_FIXED_SIZE: u64 = 34;
pub const CLIP_RECTS_HEADER_SIZE: u64 = 4;
pub const STRING_HEADER_SIZE: u64 = 8;
pub const PATH_SEG_HEADER_SIZE: u64 = 8;
pub const GLYPH_HEADER_SIZE: u64 = 20;

/// Sequential little-endian reader over one validated guest span.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> WireResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(WireError {
                want: self.pos + n,
                got: self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> WireResult<()> {
        self.take(n).map(|_| ())
    }

    pub fn bytes(&mut self, n: usize) -> WireResult<&'a [u8]> {
        self.take(n)
    }

    pub fn u8(&mut self) -> WireResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> WireResult<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn u32(&mut self) -> WireResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> WireResult<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn i16(&mut self) -> WireResult<i16> {
        Ok(self.u16()? as i16)
    }

    pub fn i32(&mut self) -> WireResult<i32> {
        Ok(self.u32()? as i32)
    }

    pub fn point(&mut self) -> WireResult<Point> {
        Ok(Point {
            x: self.i32()?,
            y: self.i32()?,
        })
    }

    pub fn point16(&mut self) -> WireResult<Point16> {
        Ok(Point16 {
            x: self.i16()?,
            y: self.i16()?,
        })
    }

    pub fn point_fix(&mut self) -> WireResult<PointFix> {
        Ok(PointFix {
            x: self.i32()?,
            y: self.i32()?,
        })
    }

    pub fn rect(&mut self) -> WireResult<Rect> {
        Ok(Rect {
            left: self.i32()?,
            top: self.i32()?,
            right: self.i32()?,
            bottom: self.i32()?,
        })
    }
}

/// Chunk list header embedded in (or pointed to by) chunked descriptors.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkHeader {
    pub data_size: u32,
    pub next: u64,
}

impl ChunkHeader {
    pub fn read(r: &mut Reader<'_>) -> WireResult<Self> {
        Ok(Self {
            data_size: r.u32()?,
            next: r.u64()?,
        })
    }
}

/// Sequential little-endian writer mirroring [`Reader`].
///
/// Used by device emulators and by the test suites to publish guest
/// descriptors with the exact layout the parser expects.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn i16(&mut self, v: i16) -> &mut Self {
        self.u16(v as u16)
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.u32(v as u32)
    }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    pub fn zeroes(&mut self, n: usize) -> &mut Self {
        self.buf.extend(std::iter::repeat(0u8).take(n));
        self
    }

    pub fn point(&mut self, p: Point) -> &mut Self {
        self.i32(p.x).i32(p.y)
    }

    pub fn point16(&mut self, p: Point16) -> &mut Self {
        self.i16(p.x).i16(p.y)
    }

    pub fn rect(&mut self, r: &Rect) -> &mut Self {
        self.i32(r.left).i32(r.top).i32(r.right).i32(r.bottom)
    }

    pub fn chunk_header(&mut self, data_size: u32, next: u64) -> &mut Self {
        self.u32(data_size).u64(next)
    }

    /// Pads the current structure out to `size` bytes from `start`.
    pub fn pad_to(&mut self, start: usize, size: u64) -> &mut Self {
        let want = start + size as usize;
        debug_assert!(self.buf.len() <= want, "layout overflow: {} > {want}", self.buf.len());
        while self.buf.len() < want {
            self.buf.push(0);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_round_trips_writer() {
        let mut w = Writer::new();
        w.u8(7)
            .u16(0x1234)
            .u32(0xdead_beef)
            .u64(0x0102_0304_0506_0708)
            .rect(&Rect::new(-1, 2, 3, 4))
            .point(Point::new(9, -9));
        let buf = w.into_vec();

        let mut r = Reader::new(&buf);
        assert_eq!(r.u8().unwrap(), 7);
        assert_eq!(r.u16().unwrap(), 0x1234);
        assert_eq!(r.u32().unwrap(), 0xdead_beef);
        assert_eq!(r.u64().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(r.rect().unwrap(), Rect::new(-1, 2, 3, 4));
        assert_eq!(r.point().unwrap(), Point::new(9, -9));
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn reader_reports_truncation() {
        let mut r = Reader::new(&[1, 2]);
        assert_eq!(r.u32(), Err(WireError { want: 4, got: 2 }));
    }
}
