//! Per-client marshalling of draw items.
//!
//! Draw bodies depend on client state: the shared pixmap cache, the
//! palette cache and the compression decision all run at send time, so a
//! drawable queued for several clients can go out differently to each.

use bytes::{BufMut, Bytes, BytesMut};
use lumen_gfx::model::{Bitmap, Clip, DrawOp, Image, ImageFlags, ImageKind};
use lumen_gfx::Rect;
use tracing::trace;

use crate::compress::compression_for_bitmap;
use crate::display::{ClientId, DisplayState};
use crate::pipe::{frame_message, msg, DrawableId};
use crate::stream::CopyGraduality;

/// Image wire flags.
pub const IMAGE_WIRE_FROM_CACHE: u8 = 1 << 0;
pub const IMAGE_WIRE_CACHE_ME: u8 = 1 << 1;
pub const IMAGE_WIRE_HIGH_BITS_SET: u8 = 1 << 2;
pub const IMAGE_WIRE_PAL_FROM_CACHE: u8 = 1 << 3;
pub const IMAGE_WIRE_PAL_CACHE_ME: u8 = 1 << 4;
pub const IMAGE_WIRE_LOSSY: u8 = 1 << 5;

fn put_rect(buf: &mut BytesMut, r: &Rect) {
    buf.put_i32_le(r.left);
    buf.put_i32_le(r.top);
    buf.put_i32_le(r.right);
    buf.put_i32_le(r.bottom);
}

impl DisplayState {
    /// Encodes one bitmap image body, consulting the caches.
    fn encode_image(
        &mut self,
        client: ClientId,
        image: &Image,
        bitmap: &Bitmap,
        graduality: CopyGraduality,
        can_lossy: bool,
        body: &mut BytesMut,
    ) {
        let mut wire_flags = 0u8;
        if image.flags.contains(ImageFlags::HIGH_BITS_SET) {
            wire_flags |= IMAGE_WIRE_HIGH_BITS_SET;
        }

        // Cache lookup first: a hit replaces the payload entirely.
        if image.flags.contains(ImageFlags::CACHE_ME) {
            if let Some(lossy) = self.pixmap_cache_hit(client, image.id) {
                wire_flags |= IMAGE_WIRE_FROM_CACHE;
                if lossy {
                    wire_flags |= IMAGE_WIRE_LOSSY;
                }
                body.put_u64_le(image.id);
                body.put_u8(wire_flags);
                trace!(image = image.id, "image sent from cache");
                return;
            }
            let size = u64::from(bitmap.height) * u64::from(bitmap.stride);
            if size > 0 && self.pixmap_cache_add(client, image.id, size, can_lossy) {
                wire_flags |= IMAGE_WIRE_CACHE_ME;
            }
        }

        let preferred = self
            .client(client)
            .map(|dcc| dcc.image_compression)
            .unwrap_or(crate::config::ImageCompression::Off);
        let compression = compression_for_bitmap(bitmap, preferred, graduality);

        if let Some(palette) = &bitmap.palette {
            let (from_cache, cache_me) = self.palette_cache_flags(client, palette.unique);
            if from_cache {
                wire_flags |= IMAGE_WIRE_PAL_FROM_CACHE;
            }
            if cache_me {
                wire_flags |= IMAGE_WIRE_PAL_CACHE_ME;
            }
        }

        body.put_u64_le(image.id);
        body.put_u8(wire_flags);
        body.put_u8(compression as u8);
        body.put_u8(bitmap.format as u8);
        body.put_u32_le(bitmap.width);
        body.put_u32_le(bitmap.height);
        body.put_u32_le(bitmap.stride);
        body.put_u8(u8::from(bitmap.top_down()));
        // The codec backends transform the payload; the core ships the
        // validated chunks and the chosen algorithm.
        let data = bitmap.data.linearize();
        body.put_u32_le(data.len() as u32);
        body.put_slice(&data);
    }

    fn encode_draw_body(&mut self, client: ClientId, drawable_id: DrawableId) -> BytesMut {
        let (cmd, graduality) = {
            let d = self.drawable(drawable_id);
            (d.cmd.clone(), d.graduality)
        };
        let mut body = BytesMut::new();
        body.put_u32_le(cmd.surface_id);
        put_rect(&mut body, &cmd.bbox);
        match &cmd.clip {
            Clip::None => body.put_u32_le(0),
            Clip::Rects(rects) => {
                body.put_u32_le(rects.len() as u32);
                for r in rects {
                    put_rect(&mut body, r);
                }
            }
        }
        body.put_u32_le(cmd.mm_time);

        match &cmd.op {
            DrawOp::Copy(copy) => {
                body.put_u8(1);
                put_rect(&mut body, &copy.src_area);
                match &copy.src.kind {
                    ImageKind::Bitmap(bitmap) => {
                        let can_lossy = self.enable_jpeg;
                        self.encode_image(client, &copy.src, bitmap, graduality, can_lossy, &mut body);
                    }
                    ImageKind::Surface { surface_id } => {
                        body.put_u8(0xfe);
                        body.put_u32_le(*surface_id);
                    }
                    ImageKind::Quic { data } => {
                        body.put_u8(0xfd);
                        let flat = data.linearize();
                        body.put_u32_le(flat.len() as u32);
                        body.put_slice(&flat);
                    }
                }
            }
            op => {
                // Non-copy operations carry no per-client cache state;
                // ship the opcode for the renderer on the other side.
                body.put_u8(draw_op_wire_kind(op));
            }
        }
        body
    }

    /// Marshals one draw item for one client, bumping its serial.
    pub fn marshal_draw(&mut self, client: ClientId, drawable_id: DrawableId) -> Bytes {
        if let Some(dcc) = self.client_mut(client) {
            dcc.message_serial += 1;
        }
        let body = self.encode_draw_body(client, drawable_id);
        frame_message(msg::DRAW, &body)
    }

    /// Marshals an upgrade item: the draw body plus the lossless region.
    pub fn marshal_upgrade(
        &mut self,
        client: ClientId,
        drawable_id: DrawableId,
        rects: &[Rect],
    ) -> Bytes {
        if let Some(dcc) = self.client_mut(client) {
            dcc.message_serial += 1;
        }
        let mut body = self.encode_draw_body(client, drawable_id);
        body.put_u32_le(rects.len() as u32);
        for r in rects {
            put_rect(&mut body, r);
        }
        frame_message(msg::UPGRADE, &body)
    }
}

fn draw_op_wire_kind(op: &DrawOp) -> u8 {
    match op {
        DrawOp::Nop => 0,
        DrawOp::Copy(_) => 1,
        DrawOp::Fill { .. } => 2,
        DrawOp::Opaque { .. } => 3,
        DrawOp::Blend(_) => 4,
        DrawOp::Transparent { .. } => 5,
        DrawOp::AlphaBlend { .. } => 6,
        DrawOp::CopyBits { .. } => 7,
        DrawOp::Rop3 { .. } => 8,
        DrawOp::Stroke { .. } => 9,
        DrawOp::Text { .. } => 10,
        DrawOp::Blackness { .. } => 11,
        DrawOp::Invers { .. } => 12,
        DrawOp::Whiteness { .. } => 13,
        DrawOp::Composite { .. } => 14,
    }
}

impl DisplayState {
    /// Records a lossy send into the per-surface lossy region so
    /// migration can reproduce it on the other side.
    pub fn note_lossy_area(&mut self, client: ClientId, surface_id: u32, area: &Rect) {
        if let Some(dcc) = self.client_mut(client) {
            if let Some(region) = dcc.surface_client_lossy_region.get_mut(surface_id as usize) {
                region.add_rect(area);
            }
        }
    }
}
