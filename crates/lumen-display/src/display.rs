//! Display channel state owned by one worker.
//!
//! Everything here is single-threaded: the worker parses commands,
//! updates the stream detector and fans items out to the per-client
//! pipes. Drawables live in a slab with explicit reference counts;
//! streams and pipe items pin them by id.

use std::sync::Arc;

use lumen_gfx::model::{Clip, DrawOp, Drawable, ImageKind, SurfaceFormat};
use lumen_gfx::region::Region;
use lumen_gfx::Rect;
use tracing::{debug, warn};

use crate::canvas::CanvasHost;
use crate::client::DisplayChannelClient;
use crate::config::DisplayConfig;
use crate::encoder::VideoEncoderFactory;
use crate::pipe::{DrawableId, PipeItem};
use crate::stream::{CopyGraduality, ItemTrace, VideoStream, NUM_STREAMS, NUM_TRACE_ITEMS};

pub type ClientId = usize;

/// Rop descriptor of a plain put; only these copies can stream.
pub const ROP_PUT: u16 = 1 << 3;

/// The main channel of the remote party, consulted for link estimates
/// and playback latency updates.
pub trait MainChannel: Send + Sync {
    fn roundtrip_ms(&self) -> Option<u32>;
    fn bitrate_per_sec(&self) -> Option<u64>;
    fn is_low_bandwidth(&self) -> bool;
    fn set_playback_latency(&self, client: u64, latency_ms: u32);
}

#[derive(Debug, Clone, Copy)]
pub struct Surface {
    pub width: u32,
    pub height: u32,
    pub format: SurfaceFormat,
    pub stride: i32,
    pub primary: bool,
}

/// A parsed drawable plus the display-side bookkeeping the detector and
/// the pipes need.
#[derive(Debug)]
pub struct DisplayDrawable {
    pub cmd: Arc<Drawable>,
    /// Drawn region: bbox restricted by the clip.
    pub region: Region,
    pub creation_time: u64,
    pub first_frame_time: u64,
    pub frames_count: u32,
    pub gradual_frames_count: u32,
    pub last_gradual_frame: u32,
    pub streamable: bool,
    pub stream: Option<usize>,
    pub graduality: CopyGraduality,
    pub generation: u64,
    pub refs: u32,
}

pub struct DisplayState {
    pub config: DisplayConfig,
    pub(crate) main: Arc<dyn MainChannel>,
    pub(crate) canvas: Option<Arc<dyn CanvasHost>>,
    pub(crate) encoders: Vec<Arc<dyn VideoEncoderFactory>>,

    drawables: Vec<Option<DisplayDrawable>>,
    free_drawables: Vec<usize>,

    pub streams: Vec<VideoStream>,
    pub(crate) free_stream: Option<usize>,
    /// Active stream slots in creation order.
    pub active_streams: Vec<usize>,
    pub stream_count: usize,
    pub(crate) streams_size_total: i64,

    pub(crate) trace: [ItemTrace; NUM_TRACE_ITEMS],
    pub(crate) next_trace: usize,

    pub(crate) clients: Vec<Option<DisplayChannelClient>>,
    pub(crate) surfaces: Vec<Option<Surface>>,
    pub(crate) monitors_config: Option<Arc<crate::device::MonitorsConfig>>,

    pub(crate) process_generation: u64,
    pub enable_jpeg: bool,
    pub enable_zlib_glz_wrap: bool,
}

impl DisplayState {
    pub fn new(
        config: DisplayConfig,
        main: Arc<dyn MainChannel>,
        canvas: Option<Arc<dyn CanvasHost>>,
        encoders: Vec<Arc<dyn VideoEncoderFactory>>,
        n_surfaces: usize,
    ) -> Self {
        let mut streams: Vec<VideoStream> = (0..NUM_STREAMS).map(|_| VideoStream::default()).collect();
        // Thread the free list through the fixed pool.
        for i in 0..NUM_STREAMS {
            streams[i].next_free = if i + 1 < NUM_STREAMS { Some(i + 1) } else { None };
        }
        let enable_jpeg = config.jpeg_state == crate::config::WanCompression::Always;
        let enable_zlib_glz_wrap = config.zlib_glz_state == crate::config::WanCompression::Always;
        Self {
            config,
            main,
            canvas,
            encoders,
            drawables: Vec::new(),
            free_drawables: Vec::new(),
            streams,
            free_stream: Some(0),
            active_streams: Vec::new(),
            stream_count: 0,
            streams_size_total: 0,
            trace: Default::default(),
            next_trace: 0,
            clients: (0..lumen_cache::MAX_CACHE_CLIENTS).map(|_| None).collect(),
            surfaces: (0..n_surfaces).map(|_| None).collect(),
            monitors_config: None,
            process_generation: 0,
            enable_jpeg,
            enable_zlib_glz_wrap,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.clients.iter().any(Option::is_some)
    }

    pub(crate) fn client_ids(&self) -> Vec<ClientId> {
        self.clients
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|_| i))
            .collect()
    }

    pub fn client(&self, id: ClientId) -> Option<&DisplayChannelClient> {
        self.clients.get(id).and_then(Option::as_ref)
    }

    pub fn client_mut(&mut self, id: ClientId) -> Option<&mut DisplayChannelClient> {
        self.clients.get_mut(id).and_then(Option::as_mut)
    }

    // ---- drawable slab ----

    fn whole_region(cmd: &Drawable) -> Region {
        let mut region = Region::from_rect(cmd.bbox);
        if let Clip::Rects(rects) = &cmd.clip {
            let mut clip = Region::new();
            for r in rects {
                clip.add_rect(r);
            }
            region.intersect_region(&clip);
        }
        region
    }

    fn is_streamable(&self, cmd: &Drawable) -> bool {
        use crate::config::StreamVideoMode;
        if self.config.stream_video == StreamVideoMode::Off {
            return false;
        }
        if cmd.surface_id != 0 || cmd.effect != lumen_gfx::model::Effect::Opaque {
            return false;
        }
        let DrawOp::Copy(copy) = &cmd.op else {
            return false;
        };
        if copy.rop != ROP_PUT || copy.mask.is_some() {
            return false;
        }
        let ImageKind::Bitmap(bitmap) = &copy.src.kind else {
            return false;
        };
        if bitmap.has_extra_stride() || bitmap.is_unstable() {
            return false;
        }
        if self.config.stream_video == StreamVideoMode::Filter {
            let area = copy.src_area.area();
            if area < crate::stream::STREAM_MIN_AREA {
                return false;
            }
        }
        true
    }

    /// Registers a freshly parsed drawable and returns its slab id, with
    /// one reference owned by the caller.
    pub fn add_drawable(&mut self, cmd: Arc<Drawable>, now_ns: u64) -> DrawableId {
        self.process_generation += 1;
        let streamable = self.is_streamable(&cmd);
        let drawable = DisplayDrawable {
            region: Self::whole_region(&cmd),
            creation_time: now_ns,
            first_frame_time: now_ns,
            frames_count: 0,
            gradual_frames_count: 0,
            last_gradual_frame: 0,
            streamable,
            stream: None,
            graduality: CopyGraduality::Invalid,
            generation: self.process_generation,
            refs: 1,
            cmd,
        };
        match self.free_drawables.pop() {
            Some(idx) => {
                self.drawables[idx] = Some(drawable);
                idx
            }
            None => {
                self.drawables.push(Some(drawable));
                self.drawables.len() - 1
            }
        }
    }

    pub fn drawable(&self, id: DrawableId) -> &DisplayDrawable {
        self.drawables[id].as_ref().expect("live drawable")
    }

    pub fn drawable_mut(&mut self, id: DrawableId) -> &mut DisplayDrawable {
        self.drawables[id].as_mut().expect("live drawable")
    }

    pub fn drawable_ref(&mut self, id: DrawableId) {
        self.drawable_mut(id).refs += 1;
    }

    pub fn drawable_unref(&mut self, id: DrawableId) {
        let drawable = self.drawable_mut(id);
        drawable.refs -= 1;
        if drawable.refs > 0 {
            return;
        }
        if let Some(stream_idx) = drawable.stream {
            warn!(stream_idx, "drawable released while attached; detaching");
            self.streams[stream_idx].current = None;
        }
        self.drawables[id] = None;
        self.free_drawables.push(id);
    }

    pub fn live_drawables(&self) -> usize {
        self.drawables.iter().filter(|d| d.is_some()).count()
    }

    // ---- pipes ----

    /// Appends `item` to one client's pipe, pinning any drawable it
    /// references.
    pub fn pipe_push(&mut self, client: ClientId, item: PipeItem) {
        if let Some(drawable) = item.drawable() {
            self.drawable_ref(drawable);
        }
        if let Some(dcc) = self.client_mut(client) {
            dcc.pipe.push_back(item);
        } else if let Some(drawable) = item.drawable() {
            self.drawable_unref(drawable);
        }
    }

    /// Removes the oldest pipe item. The item still pins its drawable;
    /// release it with [`DisplayState::pipe_release_item`] after
    /// marshalling.
    pub fn pipe_pop(&mut self, client: ClientId) -> Option<PipeItem> {
        self.client_mut(client)?.pipe.pop_front()
    }

    /// Drops the drawable reference a popped item was holding.
    pub fn pipe_release_item(&mut self, item: &PipeItem) {
        if let Some(drawable) = item.drawable() {
            self.drawable_unref(drawable);
        }
    }

    /// Whether any pipe item of `client` still references `drawable`.
    pub fn drawable_in_pipe(&self, client: ClientId, drawable: DrawableId) -> bool {
        self.client(client)
            .map(|dcc| dcc.pipe.iter().any(|i| i.drawable() == Some(drawable)))
            .unwrap_or(false)
    }

    /// Whether `drawable` is already on its way losslessly.
    pub fn drawable_in_pipe_lossless(&self, client: ClientId, drawable: DrawableId) -> bool {
        self.client(client)
            .map(|dcc| {
                dcc.pipe
                    .iter()
                    .any(|i| i.lossless_drawable() == Some(drawable))
            })
            .unwrap_or(false)
    }

    /// Drains and drops every pending item of `client`.
    pub fn pipe_clear(&mut self, client: ClientId) {
        while let Some(item) = self.pipe_pop(client) {
            self.pipe_release_item(&item);
        }
    }

    // ---- surfaces ----

    pub fn surface(&self, surface_id: u32) -> Option<&Surface> {
        self.surfaces.get(surface_id as usize).and_then(Option::as_ref)
    }

    pub fn surface_created(&mut self, surface_id: u32, surface: Surface) {
        let Some(slot) = self.surfaces.get_mut(surface_id as usize) else {
            warn!(surface_id, "surface id out of range");
            return;
        };
        *slot = Some(surface);
        debug!(surface_id, "surface created");
        for id in self.client_ids() {
            self.send_surface_create(id, surface_id);
        }
    }

    pub fn surface_destroyed(&mut self, surface_id: u32) {
        if let Some(slot) = self.surfaces.get_mut(surface_id as usize) {
            *slot = None;
        }
        for id in self.client_ids() {
            let client_had_surface = self
                .client_mut(id)
                .map(|dcc| {
                    if dcc.surface_client_created.get(surface_id as usize) != Some(&true) {
                        return false;
                    }
                    dcc.surface_client_created[surface_id as usize] = false;
                    if let Some(region) =
                        dcc.surface_client_lossy_region.get_mut(surface_id as usize)
                    {
                        region.clear();
                    }
                    true
                })
                .unwrap_or(false);
            if client_had_surface {
                self.pipe_push(id, PipeItem::SurfaceDestroy { surface_id });
            }
        }
    }

    /// Installs the current monitor layout and announces it.
    pub fn set_monitors_config(&mut self, config: crate::device::MonitorsConfig) {
        let config = Arc::new(config);
        self.monitors_config = Some(config.clone());
        for id in self.client_ids() {
            self.pipe_push(id, PipeItem::MonitorsConfig(config.clone()));
        }
    }

    /// Queues the current monitor layout for one client.
    pub fn push_monitors_config(&mut self, client: ClientId) {
        let Some(config) = self.monitors_config.clone() else {
            warn!("monitors config not set");
            return;
        };
        self.pipe_push(client, PipeItem::MonitorsConfig(config));
    }

    /// Queues an OpenGL draw for every scanout-capable client and marks
    /// the acknowledgement as outstanding.
    pub fn gl_draw(&mut self, surface_id: u32, area: Rect) {
        for id in self.client_ids() {
            let capable = self
                .client_mut(id)
                .map(|dcc| {
                    if dcc.caps.gl_scanout {
                        dcc.gl_draw_ongoing = true;
                        true
                    } else {
                        false
                    }
                })
                .unwrap_or(false);
            if capable {
                self.pipe_push(id, PipeItem::GlDraw { surface_id, area });
            }
        }
    }

    /// Queues a surface-create for one client unless it already has it.
    pub fn send_surface_create(&mut self, client: ClientId, surface_id: u32) {
        let Some(surface) = self.surface(surface_id).copied() else {
            return;
        };
        let Some(dcc) = self.client_mut(client) else {
            return;
        };
        if dcc.surface_client_created.get(surface_id as usize) == Some(&true) {
            return;
        }
        dcc.surface_client_created[surface_id as usize] = true;
        self.pipe_push(
            client,
            PipeItem::SurfaceCreate {
                surface_id,
                width: surface.width,
                height: surface.height,
                format: surface.format as u32,
                primary: surface.primary,
            },
        );
    }
}
