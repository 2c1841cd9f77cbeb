//! Parsing of guest command descriptors into owned host values.
//!
//! Every pointer follow goes through the memslot table, every size is
//! bounded, and any failure drops the partially built tree and returns an
//! error; the guest resource is only released once the successfully
//! parsed command is dropped.

use std::sync::Arc;

use bitflags::bitflags;
use thiserror::Error;
use tracing::warn;

use crate::chunk::{read_chunk_list, read_chunk_list_at, ChunkError, ChunkedData, MAX_DATA_CHUNK};
use crate::geom::Rect;
use crate::memslot::{MemSlotError, MemSlotTable};
use crate::model::{
    Bitmap, BitmapFlags, BitmapFormat, Brush, Clip, CopyOp, CursorCmd, CursorOp, CursorShape,
    DrawOp, Drawable, Effect, Glyph, GlyphString, GuestMessage, Image, ImageFlags, ImageKind,
    LineAttr, Mask, Palette, Path, PathFlags, PathSegment, SurfaceCmd, SurfaceCreate, SurfaceDep,
    SurfaceFormat, SurfaceOp, Transform, UpdateCmd, STRING_RASTER_A1, STRING_RASTER_A4,
    STRING_RASTER_A8,
};
use crate::release::{ReleaseHandle, ReleaseInfo, ResourceReleaser};
use crate::wire::{
    ChunkHeader, Reader, WireError, BITMAP_HEADER_SIZE, CHUNK_HEADER_SIZE, CLIP_RECTS_HEADER_SIZE,
    COMPAT_DRAWABLE_SIZE, CURSOR_CMD_SIZE, CURSOR_SHAPE_FIXED_SIZE, DRAWABLE_SIZE,
    GLYPH_HEADER_SIZE, IMAGE_DESC_SIZE, MESSAGE_HEADER_SIZE, PALETTE_HEADER_SIZE,
    PATH_SEG_HEADER_SIZE, QUIC_HEADER_SIZE, RECT_SIZE, STRING_HEADER_SIZE, SURFACE_CMD_SIZE,
    SURFACE_IMAGE_SIZE, UPDATE_CMD_SIZE,
};

/// Wire discriminants of the guest command dialects.
pub mod kind {
    pub const DRAW_NOP: u8 = 0;
    pub const DRAW_FILL: u8 = 1;
    pub const DRAW_OPAQUE: u8 = 2;
    pub const DRAW_COPY: u8 = 3;
    pub const DRAW_COPY_BITS: u8 = 4;
    pub const DRAW_BLEND: u8 = 5;
    pub const DRAW_BLACKNESS: u8 = 6;
    pub const DRAW_WHITENESS: u8 = 7;
    pub const DRAW_INVERS: u8 = 8;
    pub const DRAW_ROP3: u8 = 9;
    pub const DRAW_STROKE: u8 = 10;
    pub const DRAW_TEXT: u8 = 11;
    pub const DRAW_TRANSPARENT: u8 = 12;
    pub const DRAW_ALPHA_BLEND: u8 = 13;
    pub const DRAW_COMPOSITE: u8 = 14;

    pub const IMAGE_BITMAP: u8 = 0;
    pub const IMAGE_QUIC: u8 = 1;
    pub const IMAGE_SURFACE: u8 = 2;

    pub const IMAGE_FLAG_CACHE_ME: u8 = 1 << 0;
    pub const IMAGE_FLAG_HIGH_BITS_SET: u8 = 1 << 1;

    pub const BITMAP_FLAG_TOP_DOWN: u8 = 1 << 0;
    pub const BITMAP_FLAG_UNSTABLE: u8 = 1 << 1;
    pub const BITMAP_FLAG_DIRECT: u8 = 1 << 2;

    pub const CLIP_NONE: u32 = 0;
    pub const CLIP_RECTS: u32 = 1;

    pub const BRUSH_NONE: u32 = 0;
    pub const BRUSH_SOLID: u32 = 1;
    pub const BRUSH_PATTERN: u32 = 2;

    pub const SURFACE_CREATE: u8 = 0;
    pub const SURFACE_DESTROY: u8 = 1;

    pub const CURSOR_SET: u8 = 0;
    pub const CURSOR_MOVE: u8 = 1;
    pub const CURSOR_TRAIL: u8 = 2;
    pub const CURSOR_HIDE: u8 = 3;

    pub const LINE_FLAG_STYLED: u8 = 1 << 3;
}

bitflags! {
    /// Per-command flags published alongside the descriptor address.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CmdFlags: u32 {
        /// Compatibility drawable dialect.
        const COMPAT = 1 << 0;
        /// 16-bit colours need expansion to 32-bit.
        const COMPAT_16BPP = 1 << 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error(transparent)]
    MemSlot(#[from] MemSlotError),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("unknown draw kind {raw}")]
    UnknownDrawKind { raw: u8 },

    #[error("unknown image kind {raw}")]
    UnknownImageKind { raw: u8 },

    #[error("unknown effect {raw}")]
    UnknownEffect { raw: u8 },

    #[error("unknown clip kind {raw}")]
    UnknownClipKind { raw: u32 },

    #[error("unknown cursor kind {raw}")]
    UnknownCursorKind { raw: u8 },

    #[error("unknown bitmap format {raw}")]
    InvalidBitmapFormat { raw: u8 },

    #[error("guest error: zero area bitmap ({width}x{height})")]
    ZeroAreaBitmap { width: u32, height: u32 },

    #[error("image stride too small for width: {stride} < {min}")]
    StrideTooSmall { stride: u32, min: u64 },

    #[error("guest error: missing palette on paletted bitmap")]
    MissingPalette,

    #[error("bitmap of {bytes} bytes exceeds the per-command cap")]
    BitmapTooLarge { bytes: u64 },

    #[error("chunked payload size {got} does not match declared {expected}")]
    SizeMismatch { expected: u64, got: u64 },

    #[error("clip rectangle is not canonically oriented")]
    BadClipRect,

    #[error("drawable bounding box is not canonically oriented")]
    BadBoundingBox,

    #[error("image required but the guest published a null pointer")]
    MissingImage,

    #[error("stroke path pointer is null")]
    MissingPath,

    #[error("copy source area escapes the source bitmap")]
    SourceAreaOutOfBounds,

    #[error("path segment escapes its payload")]
    PathSegmentOverflow,

    #[error("glyph string structure disagrees with its declared length")]
    GlyphCountMismatch { declared: u16, walked: usize },

    #[error("glyph escapes its payload")]
    GlyphOverflow,

    #[error("glyph string has no raster depth flag")]
    MissingGlyphDepth,

    #[error("stroke style pointer is null")]
    MissingStrokeStyle,

    #[error("surface dimensions are not representable: {width}x{height} stride {stride}")]
    InvalidSurface { width: u32, height: u32, stride: i32 },

    #[error("unknown surface format {raw}")]
    InvalidSurfaceFormat { raw: u32 },

    #[error("unknown surface command {raw}")]
    UnknownSurfaceCmd { raw: u8 },

    #[error("guest message is not NUL-terminated")]
    UnterminatedMessage,
}

pub type ParseResult<T> = Result<T, ParseError>;

fn color_16_to_32(color: u32) -> u32 {
    let mut ret = ((color & 0x001f) << 3) | ((color & 0x001c) >> 2);
    ret |= ((color & 0x03e0) << 6) | ((color & 0x0380) << 1);
    ret |= ((color & 0x7c00) << 9) | ((color & 0x7000) << 4);
    ret
}

struct Parser<'a> {
    slots: &'a MemSlotTable,
    flags: CmdFlags,
}

impl<'a> Parser<'a> {
    fn compat_16bpp(&self) -> bool {
        self.flags.contains(CmdFlags::COMPAT_16BPP)
    }

    fn palette(&self, addr: u64) -> ParseResult<Arc<Palette>> {
        let hdr = self.slots.validate(addr, PALETTE_HEADER_SIZE)?;
        let mut r = Reader::new(hdr);
        let unique = r.u64()?;
        let num_ents = r.u16()?;
        let ents_addr = addr
            .checked_add(PALETTE_HEADER_SIZE)
            .ok_or(MemSlotError::AddressOverflow { addr })?;
        let raw = self.slots.validate(ents_addr, u64::from(num_ents) * 4)?;
        let mut r = Reader::new(raw);
        let mut ents = Vec::with_capacity(usize::from(num_ents));
        for _ in 0..num_ents {
            let ent = r.u32()?;
            ents.push(if self.compat_16bpp() {
                color_16_to_32(ent)
            } else {
                ent
            });
        }
        Ok(Arc::new(Palette { unique, ents }))
    }

    /// Parses the image at `addr`; `is_mask` relaxes the palette
    /// requirement the way mask bitmaps do.
    fn image(&self, addr: u64, is_mask: bool) -> ParseResult<Option<Arc<Image>>> {
        if addr == 0 {
            return Ok(None);
        }
        let desc = self.slots.validate(addr, IMAGE_DESC_SIZE)?;
        let mut r = Reader::new(desc);
        let id = r.u64()?;
        let image_kind = r.u8()?;
        let raw_flags = r.u8()?;
        let width = r.u32()?;
        let height = r.u32()?;

        let mut flags = ImageFlags::empty();
        if raw_flags & kind::IMAGE_FLAG_CACHE_ME != 0 {
            flags |= ImageFlags::CACHE_ME;
        }
        if raw_flags & kind::IMAGE_FLAG_HIGH_BITS_SET != 0 {
            flags |= ImageFlags::HIGH_BITS_SET;
        }

        let parsed_kind = match image_kind {
            kind::IMAGE_BITMAP => ImageKind::Bitmap(self.bitmap(addr, is_mask)?),
            kind::IMAGE_SURFACE => {
                let span = self
                    .slots
                    .validate(addr, IMAGE_DESC_SIZE + SURFACE_IMAGE_SIZE)?;
                let mut r = Reader::new(span);
                r.skip(IMAGE_DESC_SIZE as usize)?;
                ImageKind::Surface {
                    surface_id: r.u32()?,
                }
            }
            kind::IMAGE_QUIC => ImageKind::Quic {
                data: self.quic_data(addr)?,
            },
            raw => {
                warn!(raw, "unknown image kind");
                return Err(ParseError::UnknownImageKind { raw });
            }
        };

        Ok(Some(Arc::new(Image {
            id,
            flags,
            width,
            height,
            kind: parsed_kind,
        })))
    }

    fn bitmap(&self, image_addr: u64, is_mask: bool) -> ParseResult<Bitmap> {
        let span = self
            .slots
            .validate(image_addr, IMAGE_DESC_SIZE + BITMAP_HEADER_SIZE)?;
        let mut r = Reader::new(span);
        r.skip(IMAGE_DESC_SIZE as usize)?;
        let raw_format = r.u8()?;
        let raw_flags = r.u8()?;
        let width = r.u32()?;
        let height = r.u32()?;
        let stride = r.u32()?;
        let palette_addr = r.u64()?;
        let data_addr = r.u64()?;

        let format = BitmapFormat::from_raw(raw_format).ok_or_else(|| {
            warn!(raw = raw_format, "wrong format specified for image");
            ParseError::InvalidBitmapFormat { raw: raw_format }
        })?;
        if !format.is_rgb() && palette_addr == 0 && !is_mask {
            warn!(format = ?format, "guest error: missing palette on bitmap");
            return Err(ParseError::MissingPalette);
        }
        if width == 0 || height == 0 {
            warn!("guest error: zero area bitmap");
            return Err(ParseError::ZeroAreaBitmap { width, height });
        }

        let mut flags = BitmapFlags::empty();
        if raw_flags & kind::BITMAP_FLAG_TOP_DOWN != 0 {
            flags |= BitmapFlags::TOP_DOWN;
        }
        if raw_flags & kind::BITMAP_FLAG_UNSTABLE != 0 {
            flags |= BitmapFlags::UNSTABLE;
        }

        let min_stride = (u64::from(width) * u64::from(format.bits_per_pixel()) + 7) / 8;
        if u64::from(stride) < min_stride {
            warn!(stride, min = min_stride, "image stride too small for width");
            return Err(ParseError::StrideTooSmall {
                stride,
                min: min_stride,
            });
        }

        let palette = if palette_addr != 0 {
            Some(self.palette(palette_addr)?)
        } else {
            None
        };

        let bitmap_size = u64::from(height) * u64::from(stride);
        if bitmap_size > MAX_DATA_CHUNK {
            return Err(ParseError::BitmapTooLarge { bytes: bitmap_size });
        }

        let data = if raw_flags & kind::BITMAP_FLAG_DIRECT != 0 {
            flags |= BitmapFlags::DIRECT;
            let span = self.slots.validate(data_addr, bitmap_size)?;
            ChunkedData::from_flat(span)
        } else {
            let data = read_chunk_list_at(self.slots, data_addr)?;
            if data.total() != bitmap_size {
                return Err(ParseError::SizeMismatch {
                    expected: bitmap_size,
                    got: data.total(),
                });
            }
            data
        };

        Ok(Bitmap {
            format,
            flags,
            width,
            height,
            stride,
            palette,
            data,
        })
    }

    fn quic_data(&self, image_addr: u64) -> ParseResult<ChunkedData> {
        let fixed = IMAGE_DESC_SIZE + QUIC_HEADER_SIZE + CHUNK_HEADER_SIZE;
        let span = self.slots.validate(image_addr, fixed)?;
        let mut r = Reader::new(span);
        r.skip(IMAGE_DESC_SIZE as usize)?;
        let data_size = r.u32()?;
        let hdr = ChunkHeader::read(&mut r)?;
        let data_addr = image_addr
            .checked_add(fixed)
            .ok_or(MemSlotError::AddressOverflow { addr: image_addr })?;
        let data = read_chunk_list(self.slots, hdr, data_addr)?;
        if data.total() != u64::from(data_size) {
            return Err(ParseError::SizeMismatch {
                expected: u64::from(data_size),
                got: data.total(),
            });
        }
        Ok(data)
    }

    /// Fixed-size brush field; always consumes [`crate::wire::BRUSH_SIZE`].
    fn brush(&self, r: &mut Reader<'_>) -> ParseResult<Brush> {
        let brush_kind = r.u32()?;
        match brush_kind {
            kind::BRUSH_SOLID => {
                let color = r.u32()?;
                r.skip(12)?;
                Ok(Brush::Solid(if self.compat_16bpp() {
                    color_16_to_32(color)
                } else {
                    color
                }))
            }
            kind::BRUSH_PATTERN => {
                let image_addr = r.u64()?;
                let pos = r.point()?;
                Ok(Brush::Pattern {
                    image: self.image(image_addr, false)?,
                    pos,
                })
            }
            _ => {
                r.skip(16)?;
                Ok(Brush::None)
            }
        }
    }

    /// Fixed-size mask field; a null image means no mask at all.
    fn mask(&self, r: &mut Reader<'_>) -> ParseResult<Option<Mask>> {
        let flags = r.u8()?;
        let pos = r.point()?;
        let image_addr = r.u64()?;
        Ok(match self.image(image_addr, true)? {
            Some(image) => Some(Mask { flags, pos, image }),
            None => None,
        })
    }

    fn clip(&self, clip_kind: u32, data_addr: u64) -> ParseResult<Clip> {
        match clip_kind {
            kind::CLIP_NONE => Ok(Clip::None),
            kind::CLIP_RECTS => Ok(Clip::Rects(self.clip_rects(data_addr)?)),
            raw => Err(ParseError::UnknownClipKind { raw }),
        }
    }

    fn clip_rects(&self, addr: u64) -> ParseResult<Vec<Rect>> {
        let fixed = CLIP_RECTS_HEADER_SIZE + CHUNK_HEADER_SIZE;
        let span = self.slots.validate(addr, fixed)?;
        let mut r = Reader::new(span);
        let num_rects = r.u32()?;
        let hdr = ChunkHeader::read(&mut r)?;
        let data_addr = addr
            .checked_add(fixed)
            .ok_or(MemSlotError::AddressOverflow { addr })?;
        let data = read_chunk_list(self.slots, hdr, data_addr)?;
        let expected = u64::from(num_rects) * RECT_SIZE;
        if data.total() != expected {
            return Err(ParseError::SizeMismatch {
                expected,
                got: data.total(),
            });
        }
        let flat = data.linearize();
        let mut r = Reader::new(&flat);
        let mut rects = Vec::with_capacity(num_rects as usize);
        for _ in 0..num_rects {
            let rect = r.rect()?;
            if !rect.is_valid() {
                warn!(?rect, "guest error: clip rect not canonically oriented");
                return Err(ParseError::BadClipRect);
            }
            rects.push(rect);
        }
        Ok(rects)
    }

    fn path(&self, addr: u64) -> ParseResult<Path> {
        let data = read_chunk_list_at(self.slots, addr)?;
        let flat = data.linearize();

        // First pass: structural walk to count segments before anything is
        // built. The data is owned, so a second pass cannot diverge; the
        // walk still rejects any segment escaping the payload.
        let mut pos = 0usize;
        let mut segments = 0usize;
        while pos + PATH_SEG_HEADER_SIZE as usize <= flat.len() {
            let mut r = Reader::new(&flat[pos..]);
            let _flags = r.u32()?;
            let count = r.u32()? as usize;
            let seg_bytes = count
                .checked_mul(8)
                .ok_or(ParseError::PathSegmentOverflow)?;
            let end = pos + PATH_SEG_HEADER_SIZE as usize + seg_bytes;
            if end > flat.len() {
                return Err(ParseError::PathSegmentOverflow);
            }
            segments += 1;
            pos = end;
        }

        let mut path = Path {
            segments: Vec::with_capacity(segments),
        };
        let mut pos = 0usize;
        for _ in 0..segments {
            let mut r = Reader::new(&flat[pos..]);
            let flags = r.u32()?;
            let count = r.u32()? as usize;
            let mut points = Vec::with_capacity(count);
            for _ in 0..count {
                points.push(r.point_fix()?);
            }
            path.segments.push(PathSegment {
                flags: PathFlags::from_bits_truncate(flags as u8),
                points,
            });
            pos += PATH_SEG_HEADER_SIZE as usize + count * 8;
        }
        Ok(path)
    }

    fn glyph_string(&self, addr: u64) -> ParseResult<GlyphString> {
        let fixed = STRING_HEADER_SIZE + CHUNK_HEADER_SIZE;
        let span = self.slots.validate(addr, fixed)?;
        let mut r = Reader::new(span);
        let data_size = r.u32()?;
        let length = r.u16()?;
        let flags = r.u16()?;
        let hdr = ChunkHeader::read(&mut r)?;
        let data_addr = addr
            .checked_add(fixed)
            .ok_or(MemSlotError::AddressOverflow { addr })?;
        let data = read_chunk_list(self.slots, hdr, data_addr)?;
        if data.total() != u64::from(data_size) {
            return Err(ParseError::SizeMismatch {
                expected: u64::from(data_size),
                got: data.total(),
            });
        }

        let bpp: u32 = if flags & STRING_RASTER_A1 != 0 {
            1
        } else if flags & STRING_RASTER_A4 != 0 {
            4
        } else if flags & STRING_RASTER_A8 != 0 {
            8
        } else {
            return Err(ParseError::MissingGlyphDepth);
        };

        let flat = data.linearize();
        // Structural walk; the declared glyph count must match exactly.
        let mut pos = 0usize;
        let mut walked = 0usize;
        while pos < flat.len() {
            if pos + GLYPH_HEADER_SIZE as usize > flat.len() {
                return Err(ParseError::GlyphOverflow);
            }
            let mut r = Reader::new(&flat[pos + 16..]);
            let width = u64::from(r.u16()?);
            let height = u64::from(r.u16()?);
            let glyph_size = (height * ((width * u64::from(bpp) + 7) / 8)) as usize;
            let end = pos + GLYPH_HEADER_SIZE as usize + glyph_size;
            if end > flat.len() {
                return Err(ParseError::GlyphOverflow);
            }
            walked += 1;
            pos = end;
        }
        if walked != usize::from(length) {
            return Err(ParseError::GlyphCountMismatch {
                declared: length,
                walked,
            });
        }

        let mut glyphs = Vec::with_capacity(walked);
        let mut pos = 0usize;
        for _ in 0..walked {
            let mut r = Reader::new(&flat[pos..]);
            let render_pos = r.point()?;
            let glyph_origin = r.point()?;
            let width = r.u16()?;
            let height = r.u16()?;
            let glyph_size =
                (u64::from(height) * ((u64::from(width) * u64::from(bpp) + 7) / 8)) as usize;
            let start = pos + GLYPH_HEADER_SIZE as usize;
            glyphs.push(Glyph {
                render_pos,
                glyph_origin,
                width,
                height,
                data: flat.slice(start..start + glyph_size),
            });
            pos = start + glyph_size;
        }
        Ok(GlyphString { flags, glyphs })
    }

    fn copy_like(&self, r: &mut Reader<'_>) -> ParseResult<CopyOp> {
        let src_addr = r.u64()?;
        let src_area = r.rect()?;
        let rop = r.u16()?;
        let scale_mode = r.u8()?;
        let mask = self.mask(r)?;

        let src = self
            .image(src_addr, false)?
            .ok_or(ParseError::MissingImage)?;
        // The source area must be canonically oriented and must not extend
        // outside the source bitmap.
        if src_area.left < 0
            || src_area.left > src_area.right
            || src_area.top < 0
            || src_area.top > src_area.bottom
        {
            return Err(ParseError::SourceAreaOutOfBounds);
        }
        if let ImageKind::Bitmap(bitmap) = &src.kind {
            if src_area.right > bitmap.width as i32 || src_area.bottom > bitmap.height as i32 {
                warn!(?src_area, "guest error: copy source area escapes bitmap");
                return Err(ParseError::SourceAreaOutOfBounds);
            }
        }
        Ok(CopyOp {
            src,
            src_area,
            rop,
            scale_mode,
            mask,
        })
    }

    fn stroke(&self, r: &mut Reader<'_>) -> ParseResult<DrawOp> {
        let path_addr = r.u64()?;
        let attr_flags = r.u8()?;
        let style_nseg = r.u8()?;
        let style_addr = r.u64()?;
        let brush = self.brush(r)?;
        let fore_mode = r.u16()?;
        let back_mode = r.u16()?;

        if path_addr == 0 {
            return Err(ParseError::MissingPath);
        }
        let path = self.path(path_addr)?;
        let style = if attr_flags & kind::LINE_FLAG_STYLED != 0 {
            if style_addr == 0 {
                return Err(ParseError::MissingStrokeStyle);
            }
            let raw = self.slots.validate(style_addr, u64::from(style_nseg) * 4)?;
            let mut r = Reader::new(raw);
            let mut style = Vec::with_capacity(usize::from(style_nseg));
            for _ in 0..style_nseg {
                style.push(r.i32()?);
            }
            style
        } else {
            Vec::new()
        };

        Ok(DrawOp::Stroke {
            path,
            attr: LineAttr {
                flags: attr_flags,
                style,
            },
            brush,
            fore_mode,
            back_mode,
        })
    }

    fn text(&self, r: &mut Reader<'_>) -> ParseResult<DrawOp> {
        let str_addr = r.u64()?;
        let back_area = r.rect()?;
        let fore_brush = self.brush(r)?;
        let back_brush = self.brush(r)?;
        let fore_mode = r.u16()?;
        let back_mode = r.u16()?;
        let text = if str_addr != 0 {
            Some(self.glyph_string(str_addr)?)
        } else {
            None
        };
        Ok(DrawOp::Text {
            text,
            back_area,
            fore_brush,
            back_brush,
            fore_mode,
            back_mode,
        })
    }

    fn transform(&self, addr: u64) -> ParseResult<Option<Transform>> {
        if addr == 0 {
            return Ok(None);
        }
        let raw = self.slots.validate(addr, 24)?;
        let mut r = Reader::new(raw);
        let mut t = [0i32; 6];
        for v in &mut t {
            *v = r.i32()?;
        }
        Ok(Some(Transform(t)))
    }

    fn composite(&self, r: &mut Reader<'_>) -> ParseResult<DrawOp> {
        let flags = r.u32()?;
        let src_addr = r.u64()?;
        let src_transform_addr = r.u64()?;
        let mask_addr = r.u64()?;
        let mask_transform_addr = r.u64()?;
        let src_origin = r.point16()?;
        let mask_origin = r.point16()?;

        let src = self.image(src_addr, false)?;
        let src_transform = self.transform(src_transform_addr)?;
        let (mask, mask_transform) = if mask_addr != 0 {
            (
                self.image(mask_addr, false)?,
                self.transform(mask_transform_addr)?,
            )
        } else {
            (None, None)
        };
        Ok(DrawOp::Composite {
            flags,
            src,
            src_transform,
            mask,
            mask_transform,
            src_origin,
            mask_origin,
        })
    }

    fn draw_op(&self, draw_kind: u8, r: &mut Reader<'_>, compat: bool) -> ParseResult<DrawOp> {
        Ok(match draw_kind {
            kind::DRAW_NOP => DrawOp::Nop,
            kind::DRAW_FILL => {
                let brush = self.brush(r)?;
                let rop = r.u16()?;
                let mask = self.mask(r)?;
                DrawOp::Fill { brush, rop, mask }
            }
            kind::DRAW_OPAQUE => {
                let src_addr = r.u64()?;
                let src_area = r.rect()?;
                let brush = self.brush(r)?;
                let rop = r.u16()?;
                let scale_mode = r.u8()?;
                let mask = self.mask(r)?;
                DrawOp::Opaque {
                    src: self.image(src_addr, false)?,
                    src_area,
                    brush,
                    rop,
                    scale_mode,
                    mask,
                }
            }
            kind::DRAW_COPY => DrawOp::Copy(self.copy_like(r)?),
            kind::DRAW_BLEND => DrawOp::Blend(self.copy_like(r)?),
            kind::DRAW_COPY_BITS => DrawOp::CopyBits {
                src_pos: r.point()?,
            },
            kind::DRAW_TRANSPARENT => {
                let src_addr = r.u64()?;
                let src_area = r.rect()?;
                let src_color = r.u32()?;
                let true_color = r.u32()?;
                DrawOp::Transparent {
                    src: self.image(src_addr, false)?,
                    src_area,
                    src_color,
                    true_color,
                }
            }
            kind::DRAW_ALPHA_BLEND => {
                let alpha_flags = if compat { 0 } else { r.u8()? };
                let alpha = r.u8()?;
                let src_addr = r.u64()?;
                let src_area = r.rect()?;
                DrawOp::AlphaBlend {
                    alpha_flags,
                    alpha,
                    src: self.image(src_addr, false)?,
                    src_area,
                }
            }
            kind::DRAW_ROP3 => {
                let src_addr = r.u64()?;
                let src_area = r.rect()?;
                let brush = self.brush(r)?;
                let rop3 = r.u8()?;
                let scale_mode = r.u8()?;
                let mask = self.mask(r)?;
                DrawOp::Rop3 {
                    src: self.image(src_addr, false)?,
                    src_area,
                    brush,
                    rop3,
                    scale_mode,
                    mask,
                }
            }
            kind::DRAW_STROKE => self.stroke(r)?,
            kind::DRAW_TEXT => self.text(r)?,
            kind::DRAW_BLACKNESS => DrawOp::Blackness { mask: self.mask(r)? },
            kind::DRAW_WHITENESS => DrawOp::Whiteness { mask: self.mask(r)? },
            kind::DRAW_INVERS => DrawOp::Invers { mask: self.mask(r)? },
            kind::DRAW_COMPOSITE => self.composite(r)?,
            raw => {
                warn!(raw, "unknown drawable kind");
                return Err(ParseError::UnknownDrawKind { raw });
            }
        })
    }
}

/// Parses one drawable descriptor, native or compat dialect.
pub fn parse_drawable(
    slots: &MemSlotTable,
    releaser: &Arc<dyn ResourceReleaser>,
    group_id: u32,
    addr: u64,
    flags: CmdFlags,
) -> ParseResult<Drawable> {
    let p = Parser { slots, flags };
    if flags.contains(CmdFlags::COMPAT) {
        parse_compat_drawable(&p, releaser, group_id, addr)
    } else {
        parse_native_drawable(&p, releaser, group_id, addr)
    }
}

fn parse_native_drawable(
    p: &Parser<'_>,
    releaser: &Arc<dyn ResourceReleaser>,
    group_id: u32,
    addr: u64,
) -> ParseResult<Drawable> {
    let span = p.slots.validate(addr, DRAWABLE_SIZE)?;
    let mut r = Reader::new(span);
    let release_id = r.u64()?;
    let surface_id = r.u32()?;
    let draw_kind = r.u8()?;
    let raw_effect = r.u8()?;
    let self_bitmap = r.u8()? != 0;
    let self_bitmap_area = r.rect()?;
    let bbox = r.rect()?;
    let clip_kind = r.u32()?;
    let clip_addr = r.u64()?;
    let mm_time = r.u32()?;
    let mut deps = [0i32; 3];
    for d in &mut deps {
        *d = r.i32()?;
    }
    let mut dep_rects = [Rect::default(); 3];
    for rect in &mut dep_rects {
        *rect = r.rect()?;
    }

    if !bbox.is_valid() {
        warn!(?bbox, "guest error: drawable bbox not canonically oriented");
        return Err(ParseError::BadBoundingBox);
    }
    let effect =
        Effect::from_raw(raw_effect).ok_or(ParseError::UnknownEffect { raw: raw_effect })?;
    let clip = p.clip(clip_kind, clip_addr)?;
    let op = p.draw_op(draw_kind, &mut r, false)?;

    let mut surface_deps = [None; 3];
    for i in 0..3 {
        if deps[i] >= 0 {
            surface_deps[i] = Some(SurfaceDep {
                surface_id: deps[i] as u32,
                rect: dep_rects[i],
            });
        }
    }

    Ok(Drawable {
        surface_id,
        effect,
        bbox,
        clip,
        mm_time,
        // Some drivers set self_bitmap on plain copies; it carries no
        // meaning there and only costs rendering work.
        self_bitmap: self_bitmap && !matches!(op, DrawOp::Copy(_)),
        self_bitmap_area,
        surface_deps,
        op,
        release: ReleaseHandle::new(
            releaser.clone(),
            ReleaseInfo {
                id: release_id,
                group_id,
            },
        ),
    })
}

fn parse_compat_drawable(
    p: &Parser<'_>,
    releaser: &Arc<dyn ResourceReleaser>,
    group_id: u32,
    addr: u64,
) -> ParseResult<Drawable> {
    let span = p.slots.validate(addr, COMPAT_DRAWABLE_SIZE)?;
    let mut r = Reader::new(span);
    let release_id = r.u64()?;
    let bbox = r.rect()?;
    let clip_kind = r.u32()?;
    let clip_addr = r.u64()?;
    let mm_time = r.u32()?;
    let draw_kind = r.u8()?;
    let raw_effect = r.u8()?;
    let self_bitmap_addr = r.u64()?;
    let self_bitmap_area = r.rect()?;

    if !bbox.is_valid() {
        warn!(?bbox, "guest error: drawable bbox not canonically oriented");
        return Err(ParseError::BadBoundingBox);
    }
    let effect =
        Effect::from_raw(raw_effect).ok_or(ParseError::UnknownEffect { raw: raw_effect })?;
    let clip = p.clip(clip_kind, clip_addr)?;
    let op = p.draw_op(draw_kind, &mut r, true)?;

    // The compat dialect implies surface 0 everywhere and synthesises the
    // first surface dependency from a copy-bits source position.
    let mut surface_deps = [None; 3];
    if let DrawOp::CopyBits { src_pos } = &op {
        surface_deps[0] = Some(SurfaceDep {
            surface_id: 0,
            rect: Rect {
                left: src_pos.x,
                top: src_pos.y,
                right: src_pos.x + (bbox.right - bbox.left),
                bottom: src_pos.y + (bbox.bottom - bbox.top),
            },
        });
    }

    Ok(Drawable {
        surface_id: 0,
        effect,
        bbox,
        clip,
        mm_time,
        self_bitmap: self_bitmap_addr != 0 && !matches!(op, DrawOp::Copy(_)),
        self_bitmap_area,
        surface_deps,
        op,
        release: ReleaseHandle::new(
            releaser.clone(),
            ReleaseInfo {
                id: release_id,
                group_id,
            },
        ),
    })
}

/// Validates the dimensions of a surface-create request.
pub fn validate_surface(width: u32, height: u32, stride: i32, format_raw: u32) -> bool {
    let Some(format) = SurfaceFormat::from_raw(format_raw) else {
        return false;
    };
    // i32::MIN has no absolute value; reject it before the cast below.
    if stride == i32::MIN {
        return false;
    }
    let min = (u64::from(width) * u64::from(format.bits_per_pixel()) + 7) / 8;
    if min > stride.unsigned_abs() as u64 {
        return false;
    }
    let size = u64::from(height) * u64::from(stride.unsigned_abs());
    size <= MAX_DATA_CHUNK
}

/// Parses one surface command descriptor.
pub fn parse_surface_cmd(
    slots: &MemSlotTable,
    releaser: &Arc<dyn ResourceReleaser>,
    group_id: u32,
    addr: u64,
) -> ParseResult<SurfaceCmd> {
    let span = slots.validate(addr, SURFACE_CMD_SIZE)?;
    let mut r = Reader::new(span);
    let release_id = r.u64()?;
    let surface_id = r.u32()?;
    let cmd_kind = r.u8()?;
    let flags = r.u32()?;

    let op = match cmd_kind {
        kind::SURFACE_CREATE => {
            let format_raw = r.u32()?;
            let width = r.u32()?;
            let height = r.u32()?;
            let stride = r.i32()?;
            let data_addr = r.u64()?;

            if !validate_surface(width, height, stride, format_raw) {
                warn!(width, height, stride, format_raw, "invalid surface create");
                return Err(ParseError::InvalidSurface {
                    width,
                    height,
                    stride,
                });
            }
            let format = SurfaceFormat::from_raw(format_raw)
                .ok_or(ParseError::InvalidSurfaceFormat { raw: format_raw })?;
            let size = u64::from(height) * u64::from(stride.unsigned_abs());
            let data = slots.validate(data_addr, size)?;
            SurfaceOp::Create(SurfaceCreate {
                format,
                width,
                height,
                stride,
                data: bytes::Bytes::copy_from_slice(data),
            })
        }
        kind::SURFACE_DESTROY => SurfaceOp::Destroy,
        raw => return Err(ParseError::UnknownSurfaceCmd { raw }),
    };

    Ok(SurfaceCmd {
        surface_id,
        flags,
        op,
        release: ReleaseHandle::new(
            releaser.clone(),
            ReleaseInfo {
                id: release_id,
                group_id,
            },
        ),
    })
}

/// Parses one update (render-fence) command descriptor.
pub fn parse_update_cmd(
    slots: &MemSlotTable,
    releaser: &Arc<dyn ResourceReleaser>,
    group_id: u32,
    addr: u64,
) -> ParseResult<UpdateCmd> {
    let span = slots.validate(addr, UPDATE_CMD_SIZE)?;
    let mut r = Reader::new(span);
    let release_id = r.u64()?;
    let area = r.rect()?;
    let update_id = r.u32()?;
    let surface_id = r.u32()?;
    Ok(UpdateCmd {
        area,
        update_id,
        surface_id,
        release: ReleaseHandle::new(
            releaser.clone(),
            ReleaseInfo {
                id: release_id,
                group_id,
            },
        ),
    })
}

/// Parses one cursor command descriptor.
pub fn parse_cursor_cmd(
    slots: &MemSlotTable,
    releaser: &Arc<dyn ResourceReleaser>,
    group_id: u32,
    addr: u64,
) -> ParseResult<CursorCmd> {
    let span = slots.validate(addr, CURSOR_CMD_SIZE)?;
    let mut r = Reader::new(span);
    let release_id = r.u64()?;
    let cursor_kind = r.u8()?;

    let op = match cursor_kind {
        kind::CURSOR_SET => {
            let position = r.point16()?;
            let visible = r.u8()? != 0;
            let shape_addr = r.u64()?;
            let shape = parse_cursor_shape(slots, shape_addr)?;
            CursorOp::Set {
                position,
                visible,
                shape,
            }
        }
        kind::CURSOR_MOVE => CursorOp::Move {
            position: r.point16()?,
        },
        kind::CURSOR_TRAIL => CursorOp::Trail {
            length: r.u16()?,
            frequency: r.u16()?,
        },
        kind::CURSOR_HIDE => CursorOp::Hide,
        raw => return Err(ParseError::UnknownCursorKind { raw }),
    };

    Ok(CursorCmd {
        op,
        release: ReleaseHandle::new(
            releaser.clone(),
            ReleaseInfo {
                id: release_id,
                group_id,
            },
        ),
    })
}

fn parse_cursor_shape(slots: &MemSlotTable, addr: u64) -> ParseResult<CursorShape> {
    let span = slots.validate(addr, CURSOR_SHAPE_FIXED_SIZE)?;
    let mut r = Reader::new(span);
    let unique = r.u64()?;
    let shape_kind = r.u16()?;
    let width = r.u16()?;
    let height = r.u16()?;
    let hot_spot_x = r.u16()?;
    let hot_spot_y = r.u16()?;
    let declared_size = r.u32()?;
    let hdr = ChunkHeader::read(&mut r)?;
    let data_addr = addr
        .checked_add(CURSOR_SHAPE_FIXED_SIZE)
        .ok_or(MemSlotError::AddressOverflow { addr })?;
    let data = read_chunk_list(slots, hdr, data_addr)?;

    // The declared size is advisory; trust the walked total when smaller.
    let size = u64::from(declared_size).min(data.total());
    let flat = data.linearize();
    Ok(CursorShape {
        unique,
        kind: shape_kind,
        width,
        height,
        hot_spot_x,
        hot_spot_y,
        data: flat.slice(..size as usize),
    })
}

/// Maximum bytes scanned for a guest debug string.
pub const GUEST_MESSAGE_MAX_LEN: u64 = 100_000;

/// Parses a guest debug-log message: a NUL-terminated string bounded by
/// the remaining size of its memslot.
pub fn parse_message(
    slots: &MemSlotTable,
    releaser: &Arc<dyn ResourceReleaser>,
    group_id: u32,
    addr: u64,
) -> ParseResult<GuestMessage> {
    let span = slots.validate(addr, MESSAGE_HEADER_SIZE)?;
    let mut r = Reader::new(span);
    let release_id = r.u64()?;

    let data_addr = addr
        .checked_add(MESSAGE_HEADER_SIZE)
        .ok_or(MemSlotError::AddressOverflow { addr })?;
    let avail = slots
        .max_size_from(data_addr)?
        .min(GUEST_MESSAGE_MAX_LEN);
    let raw = slots.validate(data_addr, avail)?;
    let len = raw
        .iter()
        .position(|&b| b == 0)
        .ok_or(ParseError::UnterminatedMessage)?;
    Ok(GuestMessage {
        data: raw[..len].to_vec(),
        release: ReleaseHandle::new(
            releaser.clone(),
            ReleaseInfo {
                id: release_id,
                group_id,
            },
        ),
    })
}
