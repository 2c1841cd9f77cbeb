#![forbid(unsafe_code)]

//! Guest-side data model for the lumen display server.
//!
//! This crate owns the untrusted half of the display pipeline:
//!
//! - [`memslot`] translates guest physical addresses against registered
//!   memory windows, producing byte spans or non-fatal faults.
//! - [`chunk`] walks guest-published chunk lists under hard DoS bounds.
//! - [`wire`] holds the little-endian layouts of every guest descriptor.
//! - [`parse`] materialises fully-owned command trees ([`Drawable`],
//!   [`Image`], cursor/surface/update commands) out of guest memory.
//!
//! Nothing produced by this crate retains a reference into guest memory:
//! bulk pixel data is copied into [`bytes::Bytes`] chunks, bounded by
//! [`MAX_DATA_CHUNK`] per command.

pub mod chunk;
pub mod emu;
pub mod geom;
pub mod memslot;
pub mod model;
pub mod parse;
pub mod region;
pub mod release;
pub mod wire;

pub use chunk::{ChunkedData, MAX_CHUNKS, MAX_DATA_CHUNK};
pub use geom::{Point, Point16, PointFix, Rect};
pub use memslot::{AddressLayout, MemSlot, MemSlotError, MemSlotTable};
pub use model::{
    Bitmap, BitmapData, BitmapFlags, BitmapFormat, Brush, Clip, CopyOp, CursorCmd, CursorOp,
    CursorShape, DrawOp, Drawable, Effect, Glyph, GlyphString, Graduality, GuestMessage, Image,
    ImageFlags, ImageKind, LineAttr, Mask, Palette, Path, PathSegment, SurfaceCmd, SurfaceCreate,
    SurfaceDep, SurfaceFormat, SurfaceOp, UpdateCmd,
};
pub use parse::{
    parse_cursor_cmd, parse_drawable, parse_message, parse_surface_cmd, parse_update_cmd,
    validate_surface, CmdFlags, ParseError, ParseResult,
};
pub use region::Region;
pub use release::{ReleaseHandle, ReleaseInfo, ResourceReleaser};
