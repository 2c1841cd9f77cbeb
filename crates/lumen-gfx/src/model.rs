//! Fully-owned host representations of parsed guest commands.

use std::sync::Arc;

use bitflags::bitflags;

use crate::chunk::ChunkedData;
use crate::geom::{Point, Point16, PointFix, Rect};
use crate::release::ReleaseHandle;

/// Chunked bitmap payload; boundaries preserved, bytes owned.
pub type BitmapData = ChunkedData;

/// Visual effect a drawable applies when layered over earlier output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Effect {
    Blend = 0,
    Opaque = 1,
    RevertOnDup = 2,
    BlacknessOnDup = 3,
    WhitenessOnDup = 4,
    NopOnDup = 5,
    Nop = 6,
    OpaqueBrush = 7,
}

impl Effect {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Blend,
            1 => Self::Opaque,
            2 => Self::RevertOnDup,
            3 => Self::BlacknessOnDup,
            4 => Self::WhitenessOnDup,
            5 => Self::NopOnDup,
            6 => Self::Nop,
            7 => Self::OpaqueBrush,
            _ => return None,
        })
    }
}

/// Pixel layout of a guest bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BitmapFormat {
    Mono1Le = 1,
    Mono1Be = 2,
    Pal4Le = 3,
    Pal4Be = 4,
    Pal8 = 5,
    Rgb16 = 6,
    Rgb24 = 7,
    Rgb32 = 8,
    Rgba = 9,
    Alpha8 = 10,
}

impl BitmapFormat {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => Self::Mono1Le,
            2 => Self::Mono1Be,
            3 => Self::Pal4Le,
            4 => Self::Pal4Be,
            5 => Self::Pal8,
            6 => Self::Rgb16,
            7 => Self::Rgb24,
            8 => Self::Rgb32,
            9 => Self::Rgba,
            10 => Self::Alpha8,
            _ => return None,
        })
    }

    pub fn bits_per_pixel(self) -> u32 {
        match self {
            Self::Mono1Le | Self::Mono1Be => 1,
            Self::Pal4Le | Self::Pal4Be => 4,
            Self::Pal8 | Self::Alpha8 => 8,
            Self::Rgb16 => 16,
            Self::Rgb24 => 24,
            Self::Rgb32 | Self::Rgba => 32,
        }
    }

    pub fn is_rgb(self) -> bool {
        matches!(self, Self::Rgb16 | Self::Rgb24 | Self::Rgb32 | Self::Rgba)
    }

    pub fn is_paletted(self) -> bool {
        matches!(
            self,
            Self::Mono1Le | Self::Mono1Be | Self::Pal4Le | Self::Pal4Be | Self::Pal8
        )
    }

    /// Whether the pixel values of this format can be classified by how
    /// smoothly they change (drives lossy-vs-lossless choices).
    pub fn has_graduality(self) -> bool {
        self.is_rgb()
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BitmapFlags: u8 {
        const TOP_DOWN = 1 << 0;
        const UNSTABLE = 1 << 1;
        /// Payload is a flat span instead of a chunk list.
        const DIRECT = 1 << 2;
        const PAL_CACHE_ME = 1 << 3;
        const PAL_FROM_CACHE = 1 << 4;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ImageFlags: u8 {
        const CACHE_ME = 1 << 0;
        const HIGH_BITS_SET = 1 << 1;
    }
}

#[derive(Debug, Clone)]
pub struct Palette {
    pub unique: u64,
    pub ents: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct Bitmap {
    pub format: BitmapFormat,
    pub flags: BitmapFlags,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub palette: Option<Arc<Palette>>,
    pub data: BitmapData,
}

impl Bitmap {
    /// Bytes actually needed per row for this width and format.
    pub fn min_stride(&self) -> u64 {
        (u64::from(self.width) * u64::from(self.format.bits_per_pixel()) + 7) / 8
    }

    /// Whether rows carry bytes beyond the visible width.
    pub fn has_extra_stride(&self) -> bool {
        u64::from(self.stride) > self.min_stride()
    }

    pub fn is_unstable(&self) -> bool {
        self.flags.contains(BitmapFlags::UNSTABLE)
    }

    pub fn top_down(&self) -> bool {
        self.flags.contains(BitmapFlags::TOP_DOWN)
    }

    /// Samples the bitmap and classifies how smoothly its pixel values
    /// change. Non-RGB formats have no graduality.
    pub fn graduality_level(&self) -> Graduality {
        if !self.format.has_graduality() {
            return Graduality::NotAvail;
        }
        let data = self.data.linearize();
        let bytes_pp = (self.format.bits_per_pixel() / 8).max(1) as usize;
        let stride = self.stride as usize;
        if data.len() < stride || self.width < 2 {
            return Graduality::NotAvail;
        }

        let row_step = (self.height as usize / 16).max(1);
        let col_step = (self.width as usize / 16).max(1);
        let mut smooth: u64 = 0;
        let mut jumps: u64 = 0;
        let mut row = 0usize;
        while row < self.height as usize {
            let row_base = row * stride;
            if row_base + stride > data.len() {
                break;
            }
            let mut col = 0usize;
            while col + 1 < self.width as usize {
                let a = sample_luma(&data[row_base + col * bytes_pp..], self.format);
                let b = sample_luma(&data[row_base + (col + 1) * bytes_pp..], self.format);
                let delta = a.abs_diff(b);
                if delta == 0 {
                    // Flat runs say nothing about graduality.
                } else if delta < 16 {
                    smooth += 1;
                } else {
                    jumps += 1;
                }
                col += col_step;
            }
            row += row_step;
        }

        let samples = smooth + jumps;
        if samples == 0 {
            return Graduality::Low;
        }
        let ratio = smooth as f64 / samples as f64;
        if ratio > 0.8 {
            Graduality::High
        } else if ratio > 0.5 {
            Graduality::Medium
        } else {
            Graduality::Low
        }
    }
}

fn sample_luma(px: &[u8], format: BitmapFormat) -> u32 {
    match format {
        BitmapFormat::Rgb16 => {
            if px.len() < 2 {
                return 0;
            }
            let v = u16::from_le_bytes([px[0], px[1]]) as u32;
            let r = (v >> 10) & 0x1f;
            let g = (v >> 5) & 0x1f;
            let b = v & 0x1f;
            (r + g + b) << 3
        }
        BitmapFormat::Rgb24 | BitmapFormat::Rgb32 | BitmapFormat::Rgba => {
            if px.len() < 3 {
                return 0;
            }
            u32::from(px[0]) + u32::from(px[1]) + u32::from(px[2])
        }
        _ => 0,
    }
}

/// Coarse classification of how smoothly a bitmap's pixel values change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Graduality {
    NotAvail,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone)]
pub enum ImageKind {
    Bitmap(Bitmap),
    Surface { surface_id: u32 },
    Quic { data: ChunkedData },
}

#[derive(Debug, Clone)]
pub struct Image {
    pub id: u64,
    pub flags: ImageFlags,
    pub width: u32,
    pub height: u32,
    pub kind: ImageKind,
}

impl Image {
    pub fn as_bitmap(&self) -> Option<&Bitmap> {
        match &self.kind {
            ImageKind::Bitmap(b) => Some(b),
            _ => None,
        }
    }
}

/// 2x3 fixed-point transform attached to composite sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transform(pub [i32; 6]);

#[derive(Debug, Clone)]
pub struct Mask {
    pub flags: u8,
    pub pos: Point,
    pub image: Arc<Image>,
}

#[derive(Debug, Clone)]
pub enum Brush {
    None,
    Solid(u32),
    Pattern { image: Option<Arc<Image>>, pos: Point },
}

#[derive(Debug, Clone)]
pub enum Clip {
    None,
    Rects(Vec<Rect>),
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PathFlags: u8 {
        const BEZIER = 1 << 0;
        const CLOSE = 1 << 1;
    }
}

#[derive(Debug, Clone)]
pub struct PathSegment {
    pub flags: PathFlags,
    pub points: Vec<PointFix>,
}

#[derive(Debug, Clone, Default)]
pub struct Path {
    pub segments: Vec<PathSegment>,
}

#[derive(Debug, Clone)]
pub struct LineAttr {
    pub flags: u8,
    pub style: Vec<i32>,
}

/// Raster glyph depth encoded in the string flags.
pub const STRING_RASTER_A1: u16 = 1 << 0;
pub const STRING_RASTER_A4: u16 = 1 << 1;
pub const STRING_RASTER_A8: u16 = 1 << 2;

#[derive(Debug, Clone)]
pub struct Glyph {
    pub render_pos: Point,
    pub glyph_origin: Point,
    pub width: u16,
    pub height: u16,
    pub data: bytes::Bytes,
}

#[derive(Debug, Clone)]
pub struct GlyphString {
    pub flags: u16,
    pub glyphs: Vec<Glyph>,
}

#[derive(Debug, Clone)]
pub struct CopyOp {
    pub src: Arc<Image>,
    pub src_area: Rect,
    pub rop: u16,
    pub scale_mode: u8,
    pub mask: Option<Mask>,
}

#[derive(Debug, Clone)]
pub enum DrawOp {
    Fill {
        brush: Brush,
        rop: u16,
        mask: Option<Mask>,
    },
    Opaque {
        src: Option<Arc<Image>>,
        src_area: Rect,
        brush: Brush,
        rop: u16,
        scale_mode: u8,
        mask: Option<Mask>,
    },
    Copy(CopyOp),
    Blend(CopyOp),
    Transparent {
        src: Option<Arc<Image>>,
        src_area: Rect,
        src_color: u32,
        true_color: u32,
    },
    AlphaBlend {
        alpha_flags: u8,
        alpha: u8,
        src: Option<Arc<Image>>,
        src_area: Rect,
    },
    CopyBits {
        src_pos: Point,
    },
    Rop3 {
        src: Option<Arc<Image>>,
        src_area: Rect,
        brush: Brush,
        rop3: u8,
        scale_mode: u8,
        mask: Option<Mask>,
    },
    Stroke {
        path: Path,
        attr: LineAttr,
        brush: Brush,
        fore_mode: u16,
        back_mode: u16,
    },
    Text {
        text: Option<GlyphString>,
        back_area: Rect,
        fore_brush: Brush,
        back_brush: Brush,
        fore_mode: u16,
        back_mode: u16,
    },
    Blackness {
        mask: Option<Mask>,
    },
    Invers {
        mask: Option<Mask>,
    },
    Whiteness {
        mask: Option<Mask>,
    },
    Composite {
        flags: u32,
        src: Option<Arc<Image>>,
        src_transform: Option<Transform>,
        mask: Option<Arc<Image>>,
        mask_transform: Option<Transform>,
        src_origin: Point16,
        mask_origin: Point16,
    },
    Nop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceDep {
    pub surface_id: u32,
    pub rect: Rect,
}

/// One parsed drawing operation.
#[derive(Debug)]
pub struct Drawable {
    pub surface_id: u32,
    pub effect: Effect,
    pub bbox: Rect,
    pub clip: Clip,
    pub mm_time: u32,
    pub self_bitmap: bool,
    pub self_bitmap_area: Rect,
    pub surface_deps: [Option<SurfaceDep>; 3],
    pub op: DrawOp,
    pub release: ReleaseHandle,
}

impl Drawable {
    /// Source image of a copy, when this drawable is one.
    pub fn copy_source(&self) -> Option<&Image> {
        match &self.op {
            DrawOp::Copy(c) => Some(&c.src),
            _ => None,
        }
    }

    pub fn copy_src_area(&self) -> Option<&Rect> {
        match &self.op {
            DrawOp::Copy(c) => Some(&c.src_area),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SurfaceFormat {
    Alpha1 = 1,
    Alpha8 = 8,
    Rgb555 = 16,
    Rgb565 = 17,
    Xrgb32 = 32,
    Argb32 = 33,
}

impl SurfaceFormat {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Self::Alpha1,
            8 => Self::Alpha8,
            16 => Self::Rgb555,
            17 => Self::Rgb565,
            32 => Self::Xrgb32,
            33 => Self::Argb32,
            _ => return None,
        })
    }

    pub fn bits_per_pixel(self) -> u32 {
        match self {
            Self::Alpha1 => 1,
            Self::Alpha8 => 8,
            Self::Rgb555 | Self::Rgb565 => 16,
            Self::Xrgb32 | Self::Argb32 => 32,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SurfaceCreate {
    pub format: SurfaceFormat,
    pub width: u32,
    pub height: u32,
    pub stride: i32,
    pub data: bytes::Bytes,
}

#[derive(Debug)]
pub enum SurfaceOp {
    Create(SurfaceCreate),
    Destroy,
}

#[derive(Debug)]
pub struct SurfaceCmd {
    pub surface_id: u32,
    pub flags: u32,
    pub op: SurfaceOp,
    pub release: ReleaseHandle,
}

#[derive(Debug)]
pub struct UpdateCmd {
    pub area: Rect,
    pub update_id: u32,
    pub surface_id: u32,
    pub release: ReleaseHandle,
}

#[derive(Debug, Clone)]
pub struct CursorShape {
    pub unique: u64,
    pub kind: u16,
    pub width: u16,
    pub height: u16,
    pub hot_spot_x: u16,
    pub hot_spot_y: u16,
    pub data: bytes::Bytes,
}

#[derive(Debug)]
pub enum CursorOp {
    Set {
        position: Point16,
        visible: bool,
        shape: CursorShape,
    },
    Move {
        position: Point16,
    },
    Trail {
        length: u16,
        frequency: u16,
    },
    Hide,
}

#[derive(Debug)]
pub struct CursorCmd {
    pub op: CursorOp,
    pub release: ReleaseHandle,
}

/// Guest debug string; logging-only payload.
#[derive(Debug)]
pub struct GuestMessage {
    pub data: Vec<u8>,
    pub release: ReleaseHandle,
}
