//! Outbound pipe items and their wire encoding.
//!
//! Every client owns one strict-FIFO pipe; items reference shared
//! payloads (`Arc`) so one drawable can sit in several pipes at once.
//! Wire framing is `{ type: u16, size: u32, body }`, little-endian.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use lumen_gfx::model::Drawable;
use lumen_gfx::{Point, Rect};

use crate::device::MonitorsConfig;

/// Slab index of a drawable in the display state.
pub type DrawableId = usize;

/// Wire ids of server-to-client messages.
pub mod msg {
    pub const SURFACE_CREATE: u16 = 1;
    pub const SURFACE_DESTROY: u16 = 2;
    pub const DRAW: u16 = 3;
    pub const UPGRADE: u16 = 4;
    pub const IMAGE: u16 = 5;
    pub const STREAM_CREATE: u16 = 6;
    pub const STREAM_DATA: u16 = 7;
    pub const STREAM_CLIP: u16 = 8;
    pub const STREAM_DESTROY: u16 = 9;
    pub const STREAM_ACTIVATE_REPORT: u16 = 10;
    pub const PIXMAP_SYNC: u16 = 11;
    pub const PIXMAP_RESET: u16 = 12;
    pub const PALETTE_INVAL_ALL: u16 = 13;
    pub const PALETTE_INVAL: u16 = 14;
    pub const MONITORS_CONFIG: u16 = 15;
    pub const MARK: u16 = 16;
    pub const GL_SCANOUT: u16 = 17;
    pub const GL_DRAW: u16 = 18;
    pub const RESOURCE_RELEASE: u16 = 19;
}

/// A lossless surface snapshot queued for one client.
#[derive(Debug, Clone)]
pub struct ImageItem {
    pub surface_id: u32,
    pub pos: Point,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: u8,
    pub top_down: bool,
    pub high_bits_set: bool,
    pub can_lossy: bool,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub enum PipeItem {
    Draw {
        drawable: DrawableId,
        cmd: Arc<Drawable>,
    },
    /// Lossless re-send of a streamed drawable, clipped to its region.
    Upgrade {
        drawable: DrawableId,
        cmd: Arc<Drawable>,
        rects: Vec<Rect>,
    },
    Image(Arc<ImageItem>),
    StreamCreate {
        stream_id: u32,
        width: u32,
        height: u32,
        dest: Rect,
        top_down: bool,
    },
    StreamData {
        stream_id: u32,
        drawable: DrawableId,
        mm_time: u32,
        payload: Bytes,
    },
    StreamClip {
        stream_id: u32,
        rects: Vec<Rect>,
    },
    StreamDestroy {
        stream_id: u32,
    },
    StreamActivateReport {
        stream_id: u32,
        report_id: u32,
    },
    /// Tells the client its pixmap cache view is behind this generation.
    PixmapSync,
    /// Resets the pixmap cache after a migration thaw.
    PixmapReset,
    PaletteInvalAll,
    PaletteInval {
        id: u64,
    },
    SurfaceCreate {
        surface_id: u32,
        width: u32,
        height: u32,
        format: u32,
        primary: bool,
    },
    SurfaceDestroy {
        surface_id: u32,
    },
    MonitorsConfig(Arc<MonitorsConfig>),
    /// Display-mark: everything sent from here on is current content.
    Mark,
    GlScanout,
    GlDraw {
        surface_id: u32,
        area: Rect,
    },
}

impl PipeItem {
    /// The drawable this item pins, if any.
    pub fn drawable(&self) -> Option<DrawableId> {
        match self {
            PipeItem::Draw { drawable, .. }
            | PipeItem::Upgrade { drawable, .. }
            | PipeItem::StreamData { drawable, .. } => Some(*drawable),
            _ => None,
        }
    }

    /// The drawable this item will deliver losslessly, if any. Stream
    /// frames pin their drawable but deliver it lossily.
    pub fn lossless_drawable(&self) -> Option<DrawableId> {
        match self {
            PipeItem::Draw { drawable, .. } | PipeItem::Upgrade { drawable, .. } => {
                Some(*drawable)
            }
            _ => None,
        }
    }
}

fn put_rect(buf: &mut BytesMut, r: &Rect) {
    buf.put_i32_le(r.left);
    buf.put_i32_le(r.top);
    buf.put_i32_le(r.right);
    buf.put_i32_le(r.bottom);
}

/// Frames one message: header plus body.
pub fn frame_message(kind: u16, body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(6 + body.len());
    out.put_u16_le(kind);
    out.put_u32_le(body.len() as u32);
    out.put_slice(body);
    out.freeze()
}

/// Encodes the resource-release list that precedes a flushed batch.
pub fn encode_resource_release(ids: &[(u8, u64)]) -> Bytes {
    let mut body = BytesMut::with_capacity(4 + ids.len() * 9);
    body.put_u32_le(ids.len() as u32);
    for (kind, id) in ids {
        body.put_u8(*kind);
        body.put_u64_le(*id);
    }
    frame_message(msg::RESOURCE_RELEASE, &body)
}

/// Encodes the fixed part of the items that do not need client state.
///
/// Draw items are not encoded here: their bodies depend on per-client
/// compression and cache decisions and are produced by the channel
/// client at drain time.
pub fn encode_simple(item: &PipeItem) -> Option<Bytes> {
    let mut body = BytesMut::new();
    let kind = match item {
        PipeItem::StreamCreate {
            stream_id,
            width,
            height,
            dest,
            top_down,
        } => {
            body.put_u32_le(*stream_id);
            body.put_u32_le(*width);
            body.put_u32_le(*height);
            put_rect(&mut body, dest);
            body.put_u8(u8::from(*top_down));
            msg::STREAM_CREATE
        }
        PipeItem::StreamData {
            stream_id,
            drawable: _,
            mm_time,
            payload,
        } => {
            body.put_u32_le(*stream_id);
            body.put_u32_le(*mm_time);
            body.put_u32_le(payload.len() as u32);
            body.put_slice(payload);
            msg::STREAM_DATA
        }
        PipeItem::StreamClip { stream_id, rects } => {
            body.put_u32_le(*stream_id);
            body.put_u32_le(rects.len() as u32);
            for r in rects {
                put_rect(&mut body, r);
            }
            msg::STREAM_CLIP
        }
        PipeItem::StreamDestroy { stream_id } => {
            body.put_u32_le(*stream_id);
            msg::STREAM_DESTROY
        }
        PipeItem::StreamActivateReport {
            stream_id,
            report_id,
        } => {
            body.put_u32_le(*stream_id);
            body.put_u32_le(*report_id);
            msg::STREAM_ACTIVATE_REPORT
        }
        PipeItem::PixmapSync => msg::PIXMAP_SYNC,
        PipeItem::PixmapReset => msg::PIXMAP_RESET,
        PipeItem::PaletteInvalAll => msg::PALETTE_INVAL_ALL,
        PipeItem::PaletteInval { id } => {
            body.put_u64_le(*id);
            msg::PALETTE_INVAL
        }
        PipeItem::SurfaceCreate {
            surface_id,
            width,
            height,
            format,
            primary,
        } => {
            body.put_u32_le(*surface_id);
            body.put_u32_le(*width);
            body.put_u32_le(*height);
            body.put_u32_le(*format);
            body.put_u8(u8::from(*primary));
            msg::SURFACE_CREATE
        }
        PipeItem::SurfaceDestroy { surface_id } => {
            body.put_u32_le(*surface_id);
            msg::SURFACE_DESTROY
        }
        PipeItem::Image(image) => {
            body.put_u32_le(image.surface_id);
            body.put_i32_le(image.pos.x);
            body.put_i32_le(image.pos.y);
            body.put_u32_le(image.width);
            body.put_u32_le(image.height);
            body.put_u32_le(image.stride);
            body.put_u8(image.format);
            body.put_u8(u8::from(image.top_down));
            body.put_u8(u8::from(image.high_bits_set));
            body.put_u8(u8::from(image.can_lossy));
            body.put_slice(&image.data);
            msg::IMAGE
        }
        PipeItem::MonitorsConfig(config) => {
            body.put_u32_le(config.monitors.len() as u32);
            for m in &config.monitors {
                body.put_u32_le(m.surface_id);
                put_rect(&mut body, &m.area);
            }
            msg::MONITORS_CONFIG
        }
        PipeItem::Mark => msg::MARK,
        PipeItem::GlScanout => msg::GL_SCANOUT,
        PipeItem::GlDraw { surface_id, area } => {
            body.put_u32_le(*surface_id);
            put_rect(&mut body, area);
            msg::GL_DRAW
        }
        PipeItem::Draw { .. } | PipeItem::Upgrade { .. } => return None,
    };
    Some(frame_message(kind, &body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_carries_type_and_length() {
        let framed = frame_message(msg::MARK, &[]);
        assert_eq!(&framed[..], &[16, 0, 0, 0, 0, 0]);

        let framed = frame_message(msg::STREAM_DESTROY, &7u32.to_le_bytes());
        assert_eq!(framed.len(), 10);
        assert_eq!(u16::from_le_bytes([framed[0], framed[1]]), msg::STREAM_DESTROY);
        assert_eq!(
            u32::from_le_bytes([framed[2], framed[3], framed[4], framed[5]]),
            4
        );
    }

    #[test]
    fn draw_items_are_not_context_free() {
        let item = PipeItem::PixmapSync;
        assert!(encode_simple(&item).is_some());
    }
}
