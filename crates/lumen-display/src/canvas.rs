//! The surface compositor contract.
//!
//! Rendering pixels is not this crate's job; a canvas collaborator
//! materialises surface contents when the display channel needs a
//! lossless snapshot (stream demotion, initial surface images).

use lumen_gfx::model::BitmapFormat;
use lumen_gfx::Rect;

/// Pixels read back from a surface.
#[derive(Debug, Clone)]
pub struct SurfaceSnapshot {
    pub format: BitmapFormat,
    pub stride: usize,
    pub top_down: bool,
    pub data: Vec<u8>,
}

pub trait CanvasHost: Send + Sync {
    /// Reads the pixels of `area` out of a surface.
    fn read_bits(&self, surface_id: u32, area: &Rect) -> Option<SurfaceSnapshot>;

    /// Flushes every pending drawable touching `area` into the surface.
    fn draw(&self, surface_id: u32, area: &Rect);

    /// Like [`CanvasHost::draw`], but stops before the drawable with the
    /// given processing generation (it is about to be sent as-is).
    fn draw_until(&self, surface_id: u32, area: &Rect, limit_generation: u64);

    /// Called after the client acknowledged an OpenGL draw.
    fn gl_draw_done(&self);
}
