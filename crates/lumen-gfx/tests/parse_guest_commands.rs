//! Parsing tests against an emulated guest memory window, covering the
//! hostile-input scenarios the parser exists to survive.

use std::sync::Arc;

use lumen_gfx::emu::{
    alloc_bitmap_image, alloc_chunks, alloc_copy_drawable, alloc_cursor_set, alloc_cursor_shape,
    alloc_palette, alloc_surface_create, BitmapSpec, CopySpec, CountingReleaser, GuestArena,
};
use lumen_gfx::parse::{kind, parse_cursor_cmd, parse_drawable, parse_surface_cmd, ParseError};
use lumen_gfx::wire::Writer;
use lumen_gfx::{
    CmdFlags, CursorOp, DrawOp, ImageKind, ParseResult, Rect, ResourceReleaser, MAX_CHUNKS,
};

use pretty_assertions::assert_eq;

fn releaser() -> (Arc<CountingReleaser>, Arc<dyn ResourceReleaser>) {
    let counting = CountingReleaser::new();
    let dynamic: Arc<dyn ResourceReleaser> = counting.clone();
    (counting, dynamic)
}

fn rgb32_image(arena: &mut GuestArena, width: u32, height: u32) -> u64 {
    let rows = vec![0u8; (width * height * 4) as usize];
    alloc_bitmap_image(
        arena,
        &BitmapSpec {
            id: 7,
            image_flags: 0,
            format: 8, // 32-bit RGB
            bitmap_flags: kind::BITMAP_FLAG_TOP_DOWN,
            width,
            height,
            stride: width * 4,
            palette: 0,
            rows: &rows,
        },
    )
}

#[test]
fn well_formed_copy_parses_and_releases_once() {
    let mut arena = GuestArena::new(1 << 20);
    let image = rgb32_image(&mut arena, 64, 48);
    let addr = alloc_copy_drawable(
        &mut arena,
        &CopySpec {
            release_id: 0x1122,
            surface_id: 0,
            bbox: Rect::new(10, 10, 74, 58),
            src_image: image,
            src_area: Rect::new(0, 0, 64, 48),
            mm_time: 1000,
            effect: 1,
            rop: 0,
        },
    );

    let (count, dynamic) = releaser();
    let table = arena.table();
    let drawable = parse_drawable(&table, &dynamic, 0, addr, CmdFlags::empty()).unwrap();

    assert!(drawable.bbox.is_valid());
    match &drawable.op {
        DrawOp::Copy(copy) => {
            assert_eq!(copy.src_area, Rect::new(0, 0, 64, 48));
            match &copy.src.kind {
                ImageKind::Bitmap(b) => {
                    assert_eq!((b.width, b.height), (64, 48));
                    assert_eq!(b.data.total(), 64 * 48 * 4);
                }
                other => panic!("unexpected image kind: {other:?}"),
            }
        }
        other => panic!("unexpected op: {other:?}"),
    }

    // Exactly one device release, and only on drop.
    assert_eq!(count.released(), 0);
    drop(drawable);
    assert_eq!(count.released(), 1);
}

#[test]
fn copy_source_area_must_stay_inside_bitmap() {
    let mut arena = GuestArena::new(1 << 20);
    let image = rgb32_image(&mut arena, 64, 48);
    let addr = alloc_copy_drawable(
        &mut arena,
        &CopySpec {
            release_id: 1,
            surface_id: 0,
            bbox: Rect::new(0, 0, 64, 48),
            src_image: image,
            src_area: Rect::new(0, 0, 65, 48),
            mm_time: 0,
            effect: 1,
            rop: 0,
        },
    );

    let (count, dynamic) = releaser();
    let table = arena.table();
    let err = parse_drawable(&table, &dynamic, 0, addr, CmdFlags::empty()).unwrap_err();
    assert_eq!(err, ParseError::SourceAreaOutOfBounds);
    // A failed parse must not hand the resource back to the device.
    assert_eq!(count.released(), 0);
}

#[test]
fn swapped_source_area_is_rejected() {
    let mut arena = GuestArena::new(1 << 20);
    let image = rgb32_image(&mut arena, 64, 48);
    let addr = alloc_copy_drawable(
        &mut arena,
        &CopySpec {
            release_id: 1,
            surface_id: 0,
            bbox: Rect::new(0, 0, 64, 48),
            src_image: image,
            src_area: Rect::new(40, 0, 10, 48),
            mm_time: 0,
            effect: 1,
            rop: 0,
        },
    );

    let (_, dynamic) = releaser();
    let table = arena.table();
    assert!(parse_drawable(&table, &dynamic, 0, addr, CmdFlags::empty()).is_err());
}

#[test]
fn surface_create_no_issues() {
    let mut arena = GuestArena::new(1 << 20);
    let pixels = arena.reserve(128 * 512);
    let addr = alloc_surface_create(&mut arena, 5, 123, 32, 128, 128, 512, pixels);

    let (_, dynamic) = releaser();
    let table = arena.table();
    let cmd = parse_surface_cmd(&table, &dynamic, 0, addr).unwrap();
    assert_eq!(cmd.surface_id, 123);
}

#[test]
fn surface_stride_too_small_is_rejected() {
    let mut arena = GuestArena::new(1 << 20);
    let pixels = arena.reserve(128 * 512);
    let addr = alloc_surface_create(&mut arena, 5, 123, 32, 128, 128, 256, pixels);

    let (_, dynamic) = releaser();
    let table = arena.table();
    assert!(parse_surface_cmd(&table, &dynamic, 0, addr).is_err());
}

#[test]
fn surface_too_big_is_rejected_without_leaks() {
    // Chosen so 32-bit multiplication would wrap to a tiny value; the
    // 64-bit size checks must reject it.
    let mut arena = GuestArena::new(1 << 20);
    let addr = alloc_surface_create(
        &mut arena,
        5,
        123,
        32,
        0x0800_0004,
        0x4000_0020,
        0x2000_0010,
        8,
    );

    let (count, dynamic) = releaser();
    let table = arena.table();
    assert!(parse_surface_cmd(&table, &dynamic, 0, addr).is_err());
    assert_eq!(count.released(), 0);
}

#[test]
fn base_cursor_command_parses() {
    let mut arena = GuestArena::new(1 << 20);
    let pixels = vec![0xaa; 128 * 128 * 4];
    let shape = alloc_cursor_shape(
        &mut arena,
        1,
        128,
        128,
        (128 * 128 * 4) as u32,
        pixels.len() as u32,
        0,
        &pixels,
    );
    let addr = alloc_cursor_set(&mut arena, 9, Default::default(), shape);

    let (_, dynamic) = releaser();
    let table = arena.table();
    let cmd = parse_cursor_cmd(&table, &dynamic, 0, addr).unwrap();
    match cmd.op {
        CursorOp::Set { shape, .. } => {
            assert_eq!(shape.width, 128);
            assert_eq!(shape.data.len(), 128 * 128 * 4);
        }
        other => panic!("unexpected cursor op: {other:?}"),
    }
}

#[test]
fn circular_empty_cursor_chunks_do_not_hang() {
    let mut arena = GuestArena::new(1 << 20);
    // Shape whose first chunk points at a record that points back at
    // itself: the walk must stop on the record-count bound.
    let looper = alloc_chunks(&mut arena, &[&[]]);
    // Rewrite the looper's `next` field to itself.
    arena.write_at(looper + 4, &looper.to_le_bytes());
    let shape = alloc_cursor_shape(&mut arena, 1, 128, 128, 128 * 128 * 4, 0, looper, &[]);
    let addr = alloc_cursor_set(&mut arena, 9, Default::default(), shape);

    let (count, dynamic) = releaser();
    let table = arena.table();
    // Either outcome is acceptable per the error policy: a failed parse,
    // or a parsed cursor with no data. This implementation rejects.
    let parsed: ParseResult<_> = parse_cursor_cmd(&table, &dynamic, 0, addr);
    match parsed {
        Ok(cmd) => match cmd.op {
            CursorOp::Set { shape, .. } => assert_eq!(shape.data.len(), 0),
            other => panic!("unexpected cursor op: {other:?}"),
        },
        Err(err) => assert!(matches!(
            err,
            ParseError::Chunk(lumen_gfx::chunk::ChunkError::TooManyChunks { .. })
        )),
    }
    assert_eq!(count.released(), 0);
}

#[test]
fn max_chunks_boundary() {
    // Exactly MAX_CHUNKS empty records parse; one more is rejected even
    // though the aggregate data size is zero. Records are written
    // directly: record i at base + i*16 pointing at record i+1.
    let record = 16usize;
    let build = |records: u64| -> (GuestArena, u64) {
        let mut arena = GuestArena::new((records as usize + 2) * record + 64);
        let base = arena.reserve(records as usize * record);
        for i in 0..records {
            let next = if i + 1 < records {
                base + (i + 1) * record as u64
            } else {
                0
            };
            let mut w = Writer::new();
            w.chunk_header(0, next);
            arena.write_at(base + i * record as u64, &w.into_vec());
        }
        (arena, base)
    };

    let (arena, base) = build(MAX_CHUNKS);
    let table = arena.table();
    assert!(lumen_gfx::chunk::read_chunk_list_at(&table, base).is_ok());

    let (arena, base) = build(MAX_CHUNKS + 1);
    let table = arena.table();
    assert!(matches!(
        lumen_gfx::chunk::read_chunk_list_at(&table, base),
        Err(lumen_gfx::chunk::ChunkError::TooManyChunks { .. })
    ));
}

#[test]
fn paletted_bitmap_requires_palette_and_expands_16bpp() {
    let mut arena = GuestArena::new(1 << 20);

    // Missing palette on a paletted format: rejected.
    let rows = vec![0u8; 8 * 8];
    let orphan = alloc_bitmap_image(
        &mut arena,
        &BitmapSpec {
            id: 1,
            image_flags: 0,
            format: 5, // 8-bit paletted
            bitmap_flags: 0,
            width: 8,
            height: 8,
            stride: 8,
            palette: 0,
            rows: &rows,
        },
    );
    let addr = alloc_copy_drawable(
        &mut arena,
        &CopySpec {
            release_id: 1,
            surface_id: 0,
            bbox: Rect::new(0, 0, 8, 8),
            src_image: orphan,
            src_area: Rect::new(0, 0, 8, 8),
            mm_time: 0,
            effect: 1,
            rop: 0,
        },
    );
    let (_, dynamic) = releaser();
    let table = arena.table();
    assert!(parse_drawable(&table, &dynamic, 0, addr, CmdFlags::empty()).is_err());

    // With a palette and the 16bpp compat flag, entries expand to 32-bit.
    let palette = alloc_palette(&mut arena, 77, &[0x001f, 0x03e0, 0x7c00]);
    let image = alloc_bitmap_image(
        &mut arena,
        &BitmapSpec {
            id: 2,
            image_flags: 0,
            format: 5,
            bitmap_flags: 0,
            width: 8,
            height: 8,
            stride: 8,
            palette,
            rows: &rows,
        },
    );
    let addr = alloc_copy_drawable(
        &mut arena,
        &CopySpec {
            release_id: 2,
            surface_id: 0,
            bbox: Rect::new(0, 0, 8, 8),
            src_image: image,
            src_area: Rect::new(0, 0, 8, 8),
            mm_time: 0,
            effect: 1,
            rop: 0,
        },
    );
    let table = arena.table();
    let drawable = parse_drawable(&table, &dynamic, 0, addr, CmdFlags::COMPAT_16BPP).unwrap();
    let DrawOp::Copy(copy) = &drawable.op else {
        panic!("not a copy");
    };
    let ImageKind::Bitmap(bitmap) = &copy.src.kind else {
        panic!("not a bitmap");
    };
    let palette = bitmap.palette.as_ref().unwrap();
    assert_eq!(palette.ents, vec![0x0000_00ff, 0x0000_ff00, 0x00ff_0000]);
}

#[test]
fn zero_area_bitmap_is_rejected() {
    let mut arena = GuestArena::new(1 << 20);
    let image = alloc_bitmap_image(
        &mut arena,
        &BitmapSpec {
            id: 1,
            image_flags: 0,
            format: 8,
            bitmap_flags: 0,
            width: 0,
            height: 16,
            stride: 4,
            palette: 0,
            rows: &[],
        },
    );
    let addr = alloc_copy_drawable(
        &mut arena,
        &CopySpec {
            release_id: 1,
            surface_id: 0,
            bbox: Rect::new(0, 0, 1, 1),
            src_image: image,
            src_area: Rect::new(0, 0, 0, 0),
            mm_time: 0,
            effect: 1,
            rop: 0,
        },
    );
    let (_, dynamic) = releaser();
    let table = arena.table();
    assert!(matches!(
        parse_drawable(&table, &dynamic, 0, addr, CmdFlags::empty()),
        Err(ParseError::ZeroAreaBitmap { .. })
    ));
}
