//! Guest-side emulation helpers.
//!
//! A [`GuestArena`] plays the role of the graphics device's shared-memory
//! window: descriptors are allocated into one flat slot and addressed by
//! their offset. The builders publish descriptors with the exact layouts
//! the parser expects, which is what the integration suites and any
//! in-process device emulator need.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::geom::{Point, Point16, Rect};
use crate::memslot::{AddressLayout, MemSlot, MemSlotTable};
use crate::parse::kind;
use crate::release::{ReleaseInfo, ResourceReleaser};
use crate::wire::{Writer, CURSOR_CMD_SIZE, DRAWABLE_SIZE, SURFACE_CMD_SIZE};

/// A single-slot guest memory window with a bump allocator.
#[derive(Debug)]
pub struct GuestArena {
    buf: Vec<u8>,
    cursor: usize,
}

impl GuestArena {
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![0; size],
            // Offset 0 is the null guest pointer; keep it unused.
            cursor: 8,
        }
    }

    /// Copies `bytes` into the arena and returns their guest address.
    pub fn alloc(&mut self, bytes: &[u8]) -> u64 {
        let addr = self.cursor;
        let end = addr + bytes.len();
        assert!(end <= self.buf.len(), "guest arena exhausted");
        self.buf[addr..end].copy_from_slice(bytes);
        // Keep descriptors 8-byte aligned like a real driver would.
        self.cursor = (end + 7) & !7;
        addr as u64
    }

    /// Reserves `len` zeroed bytes and returns their guest address.
    pub fn reserve(&mut self, len: usize) -> u64 {
        let addr = self.cursor;
        assert!(addr + len <= self.buf.len(), "guest arena exhausted");
        self.cursor = (addr + len + 7) & !7;
        addr as u64
    }

    pub fn write_at(&mut self, addr: u64, bytes: &[u8]) {
        let start = addr as usize;
        self.buf[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Snapshot of the arena as a registered memslot table.
    pub fn table(&self) -> MemSlotTable {
        let mut table = MemSlotTable::new(1, 1, AddressLayout::new(1, 1));
        table.add_slot(0, 0, MemSlot::new(0, 0, Bytes::from(self.buf.clone())));
        table
    }
}

/// Allocates a chunk list and returns the address of its head record.
///
/// Records are laid out back to front so each can point at its successor.
pub fn alloc_chunks(arena: &mut GuestArena, chunks: &[&[u8]]) -> u64 {
    let mut next = 0u64;
    for chunk in chunks.iter().rev() {
        let mut w = Writer::new();
        w.chunk_header(chunk.len() as u32, next).bytes(chunk);
        next = arena.alloc(&w.into_vec());
    }
    next
}

/// Allocates a palette descriptor.
pub fn alloc_palette(arena: &mut GuestArena, unique: u64, ents: &[u32]) -> u64 {
    let mut w = Writer::new();
    w.u64(unique).u16(ents.len() as u16);
    for e in ents {
        w.u32(*e);
    }
    arena.alloc(&w.into_vec())
}

/// Everything a bitmap image descriptor needs.
pub struct BitmapSpec<'a> {
    pub id: u64,
    pub image_flags: u8,
    pub format: u8,
    pub bitmap_flags: u8,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub palette: u64,
    pub rows: &'a [u8],
}

/// Allocates a bitmap image whose pixel data travels as one chunk.
pub fn alloc_bitmap_image(arena: &mut GuestArena, spec: &BitmapSpec<'_>) -> u64 {
    let data_addr = alloc_chunks(arena, &[spec.rows]);
    let mut w = Writer::new();
    w.u64(spec.id)
        .u8(kind::IMAGE_BITMAP)
        .u8(spec.image_flags)
        .u32(spec.width)
        .u32(spec.height)
        .u8(spec.format)
        .u8(spec.bitmap_flags)
        .u32(spec.width)
        .u32(spec.height)
        .u32(spec.stride)
        .u64(spec.palette)
        .u64(data_addr);
    arena.alloc(&w.into_vec())
}

/// A native copy drawable over the given source image.
pub struct CopySpec {
    pub release_id: u64,
    pub surface_id: u32,
    pub bbox: Rect,
    pub src_image: u64,
    pub src_area: Rect,
    pub mm_time: u32,
    pub effect: u8,
    pub rop: u16,
}

pub fn alloc_copy_drawable(arena: &mut GuestArena, spec: &CopySpec) -> u64 {
    let mut w = Writer::new();
    w.u64(spec.release_id)
        .u32(spec.surface_id)
        .u8(kind::DRAW_COPY)
        .u8(spec.effect)
        .u8(0)
        .rect(&Rect::default())
        .rect(&spec.bbox)
        .u32(kind::CLIP_NONE)
        .u64(0)
        .u32(spec.mm_time)
        .i32(-1)
        .i32(-1)
        .i32(-1)
        .rect(&Rect::default())
        .rect(&Rect::default())
        .rect(&Rect::default())
        // copy payload
        .u64(spec.src_image)
        .rect(&spec.src_area)
        .u16(spec.rop)
        .u8(0)
        // mask: flags, pos, image
        .u8(0)
        .point(Point::default())
        .u64(0)
        .pad_to(0, DRAWABLE_SIZE);
    arena.alloc(&w.into_vec())
}

/// A surface-create command descriptor.
pub fn alloc_surface_create(
    arena: &mut GuestArena,
    release_id: u64,
    surface_id: u32,
    format: u32,
    width: u32,
    height: u32,
    stride: i32,
    data_addr: u64,
) -> u64 {
    let mut w = Writer::new();
    w.u64(release_id)
        .u32(surface_id)
        .u8(kind::SURFACE_CREATE)
        .u32(0)
        .u32(format)
        .u32(width)
        .u32(height)
        .i32(stride)
        .u64(data_addr)
        .pad_to(0, SURFACE_CMD_SIZE);
    arena.alloc(&w.into_vec())
}

/// A cursor-set command whose shape data starts at `shape_chunk_addr`.
pub fn alloc_cursor_set(
    arena: &mut GuestArena,
    release_id: u64,
    position: Point16,
    shape_addr: u64,
) -> u64 {
    let mut w = Writer::new();
    w.u64(release_id)
        .u8(kind::CURSOR_SET)
        .point16(position)
        .u8(1)
        .u64(shape_addr)
        .pad_to(0, CURSOR_CMD_SIZE);
    arena.alloc(&w.into_vec())
}

/// Allocates a cursor shape. `first_chunk` describes the head record of
/// its chunk list inline; pass `(data_size, next)` plus the inline bytes.
pub fn alloc_cursor_shape(
    arena: &mut GuestArena,
    unique: u64,
    width: u16,
    height: u16,
    declared_size: u32,
    first_chunk_size: u32,
    first_chunk_next: u64,
    inline: &[u8],
) -> u64 {
    let mut w = Writer::new();
    w.u64(unique)
        .u16(0)
        .u16(width)
        .u16(height)
        .u16(0)
        .u16(0)
        .u32(declared_size)
        .chunk_header(first_chunk_size, first_chunk_next)
        .bytes(inline);
    arena.alloc(&w.into_vec())
}

/// Release sink that counts calls; device emulators assert on it.
#[derive(Default, Debug)]
pub struct CountingReleaser {
    count: AtomicUsize,
}

impl CountingReleaser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn released(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl ResourceReleaser for CountingReleaser {
    fn release_resource(&self, _info: ReleaseInfo) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Release sink that ignores everything.
#[derive(Default, Debug)]
pub struct NoopReleaser;

impl ResourceReleaser for NoopReleaser {
    fn release_resource(&self, _info: ReleaseInfo) {}
}
