//! Shared fixtures: a mock device, main channel, canvas and a stub
//! encoder, plus a rig that drives the worker against an emulated guest
//! memory window.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use lumen_display::canvas::{CanvasHost, SurfaceSnapshot};
use lumen_display::device::{
    CommandKind, CommandQueue, DeviceInitInfo, GfxCommand, GfxDevice, MonitorsConfig,
    CLIENT_CAPS_BYTES,
};
use lumen_display::encoder::{
    EncodeAction, EncoderStats, FrameRef, RateContext, StreamReport, VideoEncoder,
    VideoEncoderFactory,
};
use lumen_display::{
    ClientCaps, DisplayConfig, DisplayState, DisplayWorker, MainChannel, StreamVideoMode,
    VideoCodecKind,
};
use lumen_gfx::emu::{alloc_bitmap_image, alloc_copy_drawable, BitmapSpec, CopySpec, GuestArena};
use lumen_gfx::memslot::MemSlot;
use lumen_gfx::model::BitmapFormat;
use lumen_gfx::parse::{kind, CmdFlags};
use lumen_gfx::{Rect, ReleaseInfo, ResourceReleaser};

pub const MSEC: u64 = 1_000_000;
pub const BASE_TIME: u64 = 1_000_000_000;

#[derive(Default)]
pub struct MockDevice {
    pub released: AtomicUsize,
    pub notifications: AtomicUsize,
}

impl ResourceReleaser for MockDevice {
    fn release_resource(&self, _info: ReleaseInfo) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

impl GfxDevice for MockDevice {
    fn get_command(&self) -> Option<GfxCommand> {
        None
    }

    fn request_command_notification(&self) {
        self.notifications.fetch_add(1, Ordering::SeqCst);
    }

    fn get_cursor_command(&self) -> Option<GfxCommand> {
        None
    }

    fn request_cursor_notification(&self) {}

    fn flush_resources(&self) {}

    fn set_client_capabilities(&self, _present: bool, _caps: [u8; CLIENT_CAPS_BYTES]) {}

    fn client_monitors_config(&self, _config: &MonitorsConfig) -> bool {
        true
    }

    fn attached_worker(&self) {}

    fn set_compression_level(&self, _level: i32) {}

    fn get_init_info(&self) -> DeviceInitInfo {
        DeviceInitInfo {
            num_memslots: 1,
            num_memslots_groups: 1,
            memslot_id_bits: 1,
            memslot_gen_bits: 1,
            n_surfaces: 8,
        }
    }
}

pub struct NullMain {
    pub low_bandwidth: bool,
    pub bitrate: Option<u64>,
    pub latency: Mutex<u32>,
}

impl Default for NullMain {
    fn default() -> Self {
        Self {
            low_bandwidth: false,
            bitrate: None,
            latency: Mutex::new(0),
        }
    }
}

impl MainChannel for NullMain {
    fn roundtrip_ms(&self) -> Option<u32> {
        Some(12)
    }

    fn bitrate_per_sec(&self) -> Option<u64> {
        self.bitrate
    }

    fn is_low_bandwidth(&self) -> bool {
        self.low_bandwidth
    }

    fn set_playback_latency(&self, _client: u64, latency_ms: u32) {
        *self.latency.lock().unwrap() = latency_ms;
    }
}

#[derive(Default)]
pub struct MockCanvas {
    pub reads: AtomicUsize,
    pub gl_done: AtomicUsize,
}

impl CanvasHost for MockCanvas {
    fn read_bits(&self, _surface_id: u32, area: &Rect) -> Option<SurfaceSnapshot> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let stride = area.width() as usize * 4;
        Some(SurfaceSnapshot {
            format: BitmapFormat::Rgb32,
            stride,
            top_down: true,
            data: vec![0x40; stride * area.height() as usize],
        })
    }

    fn draw(&self, _surface_id: u32, _area: &Rect) {}

    fn draw_until(&self, _surface_id: u32, _area: &Rect, _limit_generation: u64) {}

    fn gl_draw_done(&self) {
        self.gl_done.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct StubEncoderState {
    pub frames: usize,
    pub drops: usize,
    pub reports: usize,
}

pub struct StubEncoder {
    pub state: Arc<Mutex<StubEncoderState>>,
    pub bit_rate: u64,
}

impl VideoEncoder for StubEncoder {
    fn codec(&self) -> VideoCodecKind {
        VideoCodecKind::Mjpeg
    }

    fn encode_frame(&mut self, _ctx: &dyn RateContext, _frame: &FrameRef<'_>) -> EncodeAction {
        self.state.lock().unwrap().frames += 1;
        EncodeAction::Frame(Bytes::from_static(b"encoded-frame"))
    }

    fn notify_server_frame_drop(&mut self) {
        self.state.lock().unwrap().drops += 1;
    }

    fn client_stream_report(
        &mut self,
        _ctx: &dyn RateContext,
        report: &StreamReport,
    ) -> Option<u32> {
        self.state.lock().unwrap().reports += 1;
        (report.last_frame_delay > 0).then_some(report.last_frame_delay as u32)
    }

    fn bit_rate(&self) -> u64 {
        self.bit_rate
    }

    fn stats(&self) -> EncoderStats {
        EncoderStats {
            starting_bit_rate: self.bit_rate,
            cur_bit_rate: self.bit_rate,
            avg_quality: 0.8,
        }
    }
}

pub struct StubEncoderFactory {
    pub state: Arc<Mutex<StubEncoderState>>,
}

impl StubEncoderFactory {
    pub fn new() -> (Arc<Self>, Arc<Mutex<StubEncoderState>>) {
        let state = Arc::new(Mutex::new(StubEncoderState::default()));
        (
            Arc::new(Self {
                state: state.clone(),
            }),
            state,
        )
    }
}

impl VideoEncoderFactory for StubEncoderFactory {
    fn codec(&self) -> VideoCodecKind {
        VideoCodecKind::Mjpeg
    }

    fn create(&self, starting_bit_rate: u64) -> Option<Box<dyn VideoEncoder>> {
        Some(Box::new(StubEncoder {
            state: self.state.clone(),
            bit_rate: starting_bit_rate,
        }))
    }
}

/// Worker plus emulated guest memory, ready to process commands.
pub struct TestRig {
    pub worker: DisplayWorker,
    pub device: Arc<MockDevice>,
    pub queue: Arc<CommandQueue>,
    pub arena: GuestArena,
    pub encoder_state: Arc<Mutex<StubEncoderState>>,
    pub main: Arc<NullMain>,
    pub canvas: Arc<MockCanvas>,
    next_release_id: u64,
}

impl TestRig {
    pub fn new(config: DisplayConfig) -> Self {
        let device = Arc::new(MockDevice::default());
        let main = Arc::new(NullMain::default());
        let canvas = Arc::new(MockCanvas::default());
        let (factory, encoder_state) = StubEncoderFactory::new();
        let state = DisplayState::new(
            config,
            main.clone(),
            Some(canvas.clone()),
            vec![factory as Arc<dyn VideoEncoderFactory>],
            8,
        );
        let queue = CommandQueue::new();
        let worker = DisplayWorker::new(state, device.clone(), queue.clone());
        Self {
            worker,
            device,
            queue,
            arena: GuestArena::new(8 << 20),
            encoder_state,
            main,
            canvas,
            next_release_id: 1,
        }
    }

    pub fn filter_rig() -> Self {
        let mut config = DisplayConfig::default();
        config.stream_video = StreamVideoMode::Filter;
        Self::new(config)
    }

    pub fn attach_default_client(&mut self) -> usize {
        let caps = ClientCaps {
            stream_report: true,
            ..ClientCaps::default()
        };
        self.worker.state.attach_client(77, caps).unwrap()
    }

    /// Re-seeds the worker's memslot table from the arena contents.
    pub fn sync_guest_memory(&mut self) {
        let bytes = self.arena_bytes();
        self.worker.slots_mut().del_slot(0, 0);
        self.worker
            .slots_mut()
            .add_slot(0, 0, MemSlot::new(0, 0, bytes));
    }

    fn arena_bytes(&self) -> bytes::Bytes {
        // The arena exposes its contents through a snapshot table.
        let table = self.arena.table();
        let len = table.max_size_from(0).unwrap();
        bytes::Bytes::copy_from_slice(table.validate(0, len).unwrap())
    }

    /// Publishes a copy with blend effect: valid, but never streamable.
    pub fn feed_plain_copy(&mut self, bbox: Rect, now_ns: u64) {
        self.feed_copy_with(bbox, now_ns, 0);
    }

    /// Publishes a gradient copy drawable and processes it.
    pub fn feed_copy(&mut self, bbox: Rect, now_ns: u64) {
        self.feed_copy_with(bbox, now_ns, 1);
    }

    fn feed_copy_with(&mut self, bbox: Rect, now_ns: u64, effect: u8) {
        let width = bbox.width() as u32;
        let height = bbox.height() as u32;
        // A horizontal gradient samples as HIGH graduality.
        let mut rows = Vec::with_capacity((width * height * 4) as usize);
        for _y in 0..height {
            for x in 0..width {
                let v = (x & 0xff) as u8;
                rows.extend_from_slice(&[v, v, v, 0]);
            }
        }
        let image = alloc_bitmap_image(
            &mut self.arena,
            &BitmapSpec {
                id: self.next_release_id,
                image_flags: 0,
                format: 8,
                bitmap_flags: kind::BITMAP_FLAG_TOP_DOWN,
                width,
                height,
                stride: width * 4,
                palette: 0,
                rows: &rows,
            },
        );
        let release_id = self.next_release_id;
        self.next_release_id += 1;
        let addr = alloc_copy_drawable(
            &mut self.arena,
            &CopySpec {
                release_id,
                surface_id: 0,
                bbox,
                src_image: image,
                src_area: Rect::new(0, 0, width as i32, height as i32),
                mm_time: (now_ns / MSEC) as u32,
                effect,
                rop: 1 << 3, // plain put
            },
        );
        self.sync_guest_memory();
        self.queue.push(GfxCommand {
            kind: CommandKind::Draw,
            addr,
            group_id: 0,
            flags: CmdFlags::empty(),
        });
        self.worker.process_pending(now_ns);
    }
}

/// Counts pipe items of one client matching a predicate.
pub fn count_pipe_items<F: Fn(&lumen_display::PipeItem) -> bool>(
    state: &DisplayState,
    client: usize,
    pred: F,
) -> usize {
    state
        .client(client)
        .map(|dcc| dcc.pipe.iter().filter(|i| pred(i)).count())
        .unwrap_or(0)
}
