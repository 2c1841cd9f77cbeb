//! Per-viewer channel state and client message handling.

use std::collections::VecDeque;
use std::sync::Arc;

use lumen_cache::{
    dictionary_get, pixmap_cache_get, AddOutcome, EncoderDictionary, Eviction, PaletteCache,
    PixmapCache, SyncVector, CLIENT_PALETTE_CACHE_SIZE,
};
use lumen_gfx::region::Region;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{ImageCompression, VideoCodecKind, WanCompression, VIDEO_CODEC_KIND_COUNT};
use crate::display::{ClientId, DisplayState};
use crate::encoder::VideoEncoder;
use crate::msgc::{ClientMessage, DisplayInit};
use crate::pipe::PipeItem;
use crate::stream::{StreamAgent, NUM_STREAMS};

/// Regular and widened acknowledgement windows.
pub const CLIENT_ACK_WINDOW: u32 = 20;
pub const WIDE_CLIENT_ACK_WINDOW: u32 = 40;

/// Resource kinds carried in a release list.
pub const RES_TYPE_PIXMAP: u8 = 1;
pub const RES_TYPE_PALETTE: u8 = 2;

pub const DISPLAY_FREE_LIST_DEFAULT_SIZE: usize = 128;

/// Pending resource releases for one client, flushed with the next
/// outgoing batch. Grows by doubling and never shrinks.
#[derive(Debug)]
pub struct FreeList {
    pub sync: SyncVector,
    pub res: Vec<(u8, u64)>,
    capacity: usize,
}

impl Default for FreeList {
    fn default() -> Self {
        Self {
            sync: SyncVector::default(),
            res: Vec::with_capacity(DISPLAY_FREE_LIST_DEFAULT_SIZE),
            capacity: DISPLAY_FREE_LIST_DEFAULT_SIZE,
        }
    }
}

impl FreeList {
    pub fn push(&mut self, kind: u8, id: u64, sync: &SyncVector) {
        lumen_cache::merge_sync(&mut self.sync, sync);
        if self.res.len() == self.capacity {
            self.capacity *= 2;
            self.res.reserve_exact(self.capacity - self.res.len());
        }
        self.res.push((kind, id));
    }

    pub fn is_empty(&self) -> bool {
        self.res.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drains the list, keeping the grown capacity.
    pub fn take(&mut self) -> FreeList {
        FreeList {
            sync: std::mem::take(&mut self.sync),
            res: std::mem::replace(&mut self.res, Vec::with_capacity(self.capacity)),
            capacity: self.capacity,
        }
    }
}

/// Capabilities the client declared at link time.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientCaps {
    pub stream_report: bool,
    pub multi_codec: bool,
    pub codecs: [bool; VIDEO_CODEC_KIND_COUNT],
    pub lz4: bool,
    pub gl_scanout: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("client message arrived out of protocol order")]
    ProtocolViolation,

    #[error("client init failed: {0}")]
    InitFailed(&'static str),

    #[error("unexpected gl draw-done")]
    UnexpectedGlDrawDone,

    #[error("migration payload rejected: {0}")]
    BadMigrationData(&'static str),
}

/// One remote viewer of the display channel.
pub struct DisplayChannelClient {
    pub id: ClientId,
    /// Logical remote party; clients of one party share caches.
    pub client_token: u64,
    pub caps: ClientCaps,

    pub pipe: VecDeque<PipeItem>,

    pub image_compression: ImageCompression,
    pub jpeg_state: WanCompression,
    pub zlib_glz_state: WanCompression,

    pub pixmap_cache: Option<Arc<PixmapCache>>,
    pub pixmap_cache_generation: u32,
    pub pending_pixmaps_sync: bool,
    pub palette_cache: PaletteCache,
    pub glz_dict: Option<Arc<EncoderDictionary>>,
    pub free_list: FreeList,

    pub stream_agents: Vec<StreamAgent>,
    pub max_stream_latency: u32,
    pub max_stream_bit_rate: u64,

    pub surface_client_created: Vec<bool>,
    pub surface_client_lossy_region: Vec<Region>,

    pub client_preferred_codec_index: Option<[i32; VIDEO_CODEC_KIND_COUNT]>,
    /// Server codec order re-sorted by the client's preference.
    pub preferred_codecs: Option<Vec<VideoCodecKind>>,

    pub message_serial: u64,
    pub ack_window: u32,
    pub expect_init: bool,
    pub gl_draw_ongoing: bool,
    pub is_low_bandwidth: bool,
    /// Channel roundtrip measured by the ack plumbing, when available.
    pub roundtrip_ms: Option<u32>,
}

impl DisplayChannelClient {
    fn new(
        id: ClientId,
        client_token: u64,
        caps: ClientCaps,
        image_compression: ImageCompression,
        jpeg_state: WanCompression,
        zlib_glz_state: WanCompression,
        n_surfaces: usize,
        is_low_bandwidth: bool,
    ) -> Self {
        Self {
            id,
            client_token,
            caps,
            pipe: VecDeque::new(),
            image_compression,
            jpeg_state,
            zlib_glz_state,
            pixmap_cache: None,
            pixmap_cache_generation: 0,
            pending_pixmaps_sync: false,
            palette_cache: PaletteCache::new(CLIENT_PALETTE_CACHE_SIZE),
            glz_dict: None,
            free_list: FreeList::default(),
            stream_agents: (0..NUM_STREAMS).map(|_| StreamAgent::default()).collect(),
            max_stream_latency: 0,
            max_stream_bit_rate: 0,
            surface_client_created: vec![false; n_surfaces],
            surface_client_lossy_region: (0..n_surfaces).map(|_| Region::new()).collect(),
            client_preferred_codec_index: None,
            preferred_codecs: None,
            message_serial: 0,
            ack_window: CLIENT_ACK_WINDOW,
            expect_init: false,
            gl_draw_ongoing: false,
            is_low_bandwidth,
            roundtrip_ms: None,
        }
    }
}

/// Turns a raw preference message into per-kind preference indexes;
/// unknown codec values are skipped.
pub fn parse_preferred_codecs(raw: &[u8]) -> [i32; VIDEO_CODEC_KIND_COUNT] {
    let mut indexes = [i32::MAX; VIDEO_CODEC_KIND_COUNT];
    let mut rank = 0;
    for (pos, &value) in raw.iter().enumerate() {
        let Some(kind) = VideoCodecKind::from_raw(value) else {
            debug!(value, pos, "ignoring unknown video codec preference");
            continue;
        };
        if indexes[kind.index()] != i32::MAX {
            continue;
        }
        rank += 1;
        indexes[kind.index()] = rank;
    }
    indexes
}

impl DisplayState {
    /// Connects a new viewer; fails when all per-party slots are taken.
    pub fn attach_client(&mut self, client_token: u64, caps: ClientCaps) -> Option<ClientId> {
        let id = self.clients.iter().position(Option::is_none)?;
        let n_surfaces = self.surfaces.len();
        let dcc = DisplayChannelClient::new(
            id,
            client_token,
            caps,
            self.config.image_compression,
            self.config.jpeg_state,
            self.config.zlib_glz_state,
            n_surfaces,
            self.main.is_low_bandwidth(),
        );
        self.clients[id] = Some(dcc);
        debug!(client = id, client_token, "display client attached");
        Some(id)
    }

    /// Tears one client down in disconnect order: pipe, caches, agents,
    /// outstanding GL draw.
    pub fn disconnect_client(&mut self, client: ClientId) {
        debug!(client, "display client disconnect");
        self.pipe_clear(client);
        let gl_draw_ongoing = {
            let Some(dcc) = self.client_mut(client) else {
                return;
            };
            dcc.pixmap_cache = None;
            dcc.glz_dict = None;
            dcc.palette_cache.reset(CLIENT_PALETTE_CACHE_SIZE);
            for agent in &mut dcc.stream_agents {
                agent.vis_region.clear();
                agent.clip.clear();
                agent.encoder = None;
            }
            dcc.gl_draw_ongoing
        };
        if gl_draw_ongoing {
            if let Some(canvas) = self.canvas.clone() {
                canvas.gl_draw_done();
            }
        }
        self.clients[client] = None;
    }

    /// Handles the client's INIT: bind the shared pixmap cache and the
    /// encoder dictionary, then start the initial content.
    pub fn handle_init(&mut self, client: ClientId, init: &DisplayInit) -> Result<(), ClientError> {
        let token = {
            let Some(dcc) = self.client_mut(client) else {
                return Err(ClientError::InitFailed("client gone"));
            };
            if !dcc.expect_init {
                warn!(client, "unexpected init message");
                return Err(ClientError::ProtocolViolation);
            }
            dcc.expect_init = false;
            if dcc.pixmap_cache.is_some() {
                return Err(ClientError::InitFailed("pixmap cache already attached"));
            }
            dcc.client_token
        };

        let cache = pixmap_cache_get(token, init.pixmap_cache_id, init.pixmap_cache_size);
        let dict = dictionary_get(token, init.glz_dict_id, init.glz_dict_window)
            .map_err(|_| ClientError::InitFailed("encoder dictionary mismatch"))?;

        let dcc = self.client_mut(client).expect("checked above");
        dcc.pixmap_cache_generation = cache.generation();
        dcc.pixmap_cache = Some(cache);
        dcc.glz_dict = Some(dict);
        debug!(client, "display init complete");
        Ok(())
    }

    /// After a successful init: zeroed ack window, initial surface
    /// content and every pre-existing stream.
    pub fn start_client_output(&mut self, client: ClientId) {
        if let Some(dcc) = self.client_mut(client) {
            dcc.ack_window = 0;
        }
        if self.surface(0).is_some() {
            self.pipe_push(client, PipeItem::PaletteInvalAll);
            self.send_surface_create(client, 0);
            let area = self
                .surface(0)
                .map(|s| lumen_gfx::Rect::new(0, 0, s.width as i32, s.height as i32));
            if let Some(area) = area {
                // The primary mixes photo and artificial content; never
                // lossy.
                self.add_surface_area_image(client, 0, &area, false);
            }
            if self.monitors_config.is_some() {
                self.push_monitors_config(client);
            }
            self.pipe_push(client, PipeItem::Mark);
            for stream_idx in self.active_streams.clone() {
                self.dcc_create_stream(client, stream_idx);
            }
        }
        let wants_scanout = self
            .client(client)
            .map(|dcc| dcc.caps.gl_scanout)
            .unwrap_or(false);
        if wants_scanout {
            self.pipe_push(client, PipeItem::GlScanout);
        }
    }

    /// Dispatches one parsed client message.
    pub fn handle_client_message(
        &mut self,
        client: ClientId,
        message: ClientMessage,
    ) -> Result<(), ClientError> {
        match message {
            ClientMessage::Init(init) => {
                self.handle_init(client, &init)?;
                self.start_client_output(client);
                Ok(())
            }
            ClientMessage::StreamReport(report) => {
                self.handle_stream_report(client, report);
                Ok(())
            }
            ClientMessage::PreferredCompression(raw) => {
                self.handle_preferred_compression(client, raw);
                Ok(())
            }
            ClientMessage::PreferredVideoCodecs(raw) => {
                self.handle_preferred_video_codecs(client, &raw);
                Ok(())
            }
            ClientMessage::GlDrawDone => self.handle_gl_draw_done(client),
        }
    }

    pub fn handle_preferred_compression(&mut self, client: ClientId, raw: u8) {
        let Some(dcc) = self.client_mut(client) else {
            return;
        };
        match ImageCompression::from_raw(raw) {
            Some(compression) => {
                dcc.image_compression = compression;
                debug!(client, ?compression, "preferred compression set");
            }
            None => warn!(client, raw, "unsupported preferred compression"),
        }
    }

    /// New client codec preference: re-sort the server list, then stop
    /// active streams so they restart with the new choice.
    pub fn handle_preferred_video_codecs(&mut self, client: ClientId, raw: &[u8]) {
        if raw.is_empty() {
            return;
        }
        let indexes = parse_preferred_codecs(raw);
        if let Some(dcc) = self.client_mut(client) {
            dcc.client_preferred_codec_index = Some(indexes);
        }
        self.update_preferred_video_codecs(client);
        self.detach_and_stop_streams();
    }

    /// Stable re-sort of the server codec order by client preference.
    pub(crate) fn update_preferred_video_codecs(&mut self, client: ClientId) {
        let server_order: Vec<VideoCodecKind> = self.encoders.iter().map(|f| f.codec()).collect();
        let Some(dcc) = self.client_mut(client) else {
            return;
        };
        let Some(indexes) = dcc.client_preferred_codec_index else {
            return;
        };
        let mut sorted = server_order;
        sorted.sort_by_key(|kind| indexes[kind.index()]);
        debug!(client, ?sorted, "preferred video codecs");
        dcc.preferred_codecs = Some(sorted);
    }

    /// Picks and instantiates an encoder for one new stream.
    pub(crate) fn create_video_encoder(
        &mut self,
        client: ClientId,
        starting_bit_rate: u64,
    ) -> Option<Box<dyn VideoEncoder>> {
        let (caps, preferred) = {
            let dcc = self.client(client)?;
            (dcc.caps, dcc.preferred_codecs.clone())
        };
        let order: Vec<VideoCodecKind> = match preferred {
            Some(list) => list,
            None => self.encoders.iter().map(|f| f.codec()).collect(),
        };

        for kind in order {
            if !caps.multi_codec && kind != VideoCodecKind::Mjpeg {
                // Old clients only decode mjpeg.
                continue;
            }
            if caps.multi_codec && !caps.codecs[kind.index()] {
                continue;
            }
            if let Some(factory) = self.encoders.iter().find(|f| f.codec() == kind) {
                if let Some(encoder) = factory.create(starting_bit_rate) {
                    return Some(encoder);
                }
            }
        }

        // Builtin fallback: mjpeg, when the client can take it.
        if !caps.multi_codec || caps.codecs[VideoCodecKind::Mjpeg.index()] {
            if let Some(factory) = self
                .encoders
                .iter()
                .find(|f| f.codec() == VideoCodecKind::Mjpeg)
            {
                return factory.create(starting_bit_rate);
            }
        }
        None
    }

    pub fn handle_gl_draw_done(&mut self, client: ClientId) -> Result<(), ClientError> {
        let Some(dcc) = self.client_mut(client) else {
            return Err(ClientError::UnexpectedGlDrawDone);
        };
        if !dcc.gl_draw_ongoing {
            warn!(client, "unexpected gl draw-done");
            return Err(ClientError::UnexpectedGlDrawDone);
        }
        dcc.gl_draw_ongoing = false;
        if let Some(canvas) = self.canvas.clone() {
            canvas.gl_draw_done();
        }
        Ok(())
    }

    /// Adds an image to the shared pixmap cache on behalf of `client`.
    ///
    /// Returns whether the entry was added (so the sender should ask the
    /// client to cache it). A stale view schedules one sync item; the
    /// eviction list lands in the client's pending release list.
    pub fn pixmap_cache_add(
        &mut self,
        client: ClientId,
        id: u64,
        size: u64,
        lossy: bool,
    ) -> bool {
        let (cache, generation, serial, client_index) = {
            let Some(dcc) = self.client(client) else {
                return false;
            };
            let Some(cache) = dcc.pixmap_cache.clone() else {
                return false;
            };
            (cache, dcc.pixmap_cache_generation, dcc.message_serial, dcc.id)
        };

        let mut evictions: Vec<Eviction> = Vec::new();
        match cache.add(client_index, generation, serial, id, size, lossy, &mut evictions) {
            AddOutcome::Added => {
                if let Some(dcc) = self.client_mut(client) {
                    for ev in &evictions {
                        dcc.free_list.push(RES_TYPE_PIXMAP, ev.id, &ev.sync);
                    }
                }
                true
            }
            AddOutcome::StaleGeneration => {
                let schedule = self
                    .client_mut(client)
                    .map(|dcc| {
                        if dcc.pending_pixmaps_sync {
                            false
                        } else {
                            dcc.pending_pixmaps_sync = true;
                            true
                        }
                    })
                    .unwrap_or(false);
                if schedule {
                    self.pipe_push(client, PipeItem::PixmapSync);
                }
                false
            }
            AddOutcome::Blocked => false,
        }
    }

    /// Looks an image up in the shared pixmap cache for `client`.
    pub fn pixmap_cache_hit(&mut self, client: ClientId, id: u64) -> Option<bool> {
        let dcc = self.client(client)?;
        let cache = dcc.pixmap_cache.clone()?;
        cache.hit(dcc.id, dcc.message_serial, id)
    }

    /// Called when a pixmap-sync item actually goes out: the client view
    /// is current again.
    pub fn on_pixmap_sync_sent(&mut self, client: ClientId) {
        let generation = self
            .client(client)
            .and_then(|dcc| dcc.pixmap_cache.as_ref().map(|c| c.generation()));
        if let (Some(generation), Some(dcc)) = (generation, self.client_mut(client)) {
            dcc.pixmap_cache_generation = generation;
            dcc.pending_pixmaps_sync = false;
        }
    }

    /// Called when a pixmap-reset item goes out: thaw and re-arm the
    /// shared cache, returning the new generation for the wire message.
    pub fn on_pixmap_reset_sent(&mut self, client: ClientId) -> Option<u32> {
        let cache = self.client(client)?.pixmap_cache.clone()?;
        let generation = cache.reset(cache.capacity());
        if let Some(dcc) = self.client_mut(client) {
            dcc.pixmap_cache_generation = generation;
            dcc.pending_pixmaps_sync = false;
        }
        Some(generation)
    }

    /// Removes queued draws destined for `surface_id` from a client's
    /// pipe. Returns true when nothing left in the pipe depends on the
    /// surface; otherwise the caller must drain the pipe (bounded by the
    /// usual client timeouts) before destroying the surface.
    pub fn clear_surface_drawables_from_pipe(
        &mut self,
        client: ClientId,
        surface_id: u32,
    ) -> bool {
        let mut kept: std::collections::VecDeque<PipeItem> = std::collections::VecDeque::new();
        let mut dependency_found = false;
        while let Some(item) = self.pipe_pop(client) {
            let cmd = match &item {
                PipeItem::Draw { cmd, .. } | PipeItem::Upgrade { cmd, .. } => Some(cmd.clone()),
                _ => None,
            };
            let drop_item = match &cmd {
                Some(cmd) if cmd.surface_id == surface_id => true,
                Some(cmd) => {
                    if cmd
                        .surface_deps
                        .iter()
                        .flatten()
                        .any(|dep| dep.surface_id == surface_id)
                    {
                        dependency_found = true;
                    }
                    false
                }
                None => false,
            };
            if drop_item {
                self.pipe_release_item(&item);
            } else {
                kept.push_back(item);
            }
        }
        if let Some(dcc) = self.client_mut(client) {
            dcc.pipe = kept;
        } else {
            for item in &kept {
                self.pipe_release_item(item);
            }
        }
        !dependency_found
    }

    /// Flags a palette for the wire: from-cache when known, cache-me
    /// when freshly inserted; evicted ids become invalidations.
    pub fn palette_cache_flags(&mut self, client: ClientId, unique: u64) -> (bool, bool) {
        if unique == 0 {
            return (false, false);
        }
        let mut evicted = Vec::new();
        let result = {
            let Some(dcc) = self.client_mut(client) else {
                return (false, false);
            };
            if dcc.palette_cache.find(unique) {
                (true, false)
            } else {
                let added = dcc.palette_cache.add(unique, 1, &mut evicted);
                (false, added)
            }
        };
        for id in evicted {
            self.pipe_push(client, PipeItem::PaletteInval { id });
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preferred_codec_parsing_skips_unknown_and_duplicates() {
        // h264 first, then vp8; unknown 77 ignored; duplicate vp8 kept at
        // its first rank.
        let indexes = parse_preferred_codecs(&[3, 77, 2, 2]);
        assert_eq!(indexes[VideoCodecKind::H264.index()], 1);
        assert_eq!(indexes[VideoCodecKind::Vp8.index()], 2);
        assert_eq!(indexes[VideoCodecKind::Mjpeg.index()], i32::MAX);
    }

    #[test]
    fn free_list_grows_by_doubling_and_keeps_capacity() {
        let mut fl = FreeList::default();
        assert_eq!(fl.capacity(), DISPLAY_FREE_LIST_DEFAULT_SIZE);
        let sync = SyncVector::default();
        for id in 0..(DISPLAY_FREE_LIST_DEFAULT_SIZE as u64 + 1) {
            fl.push(RES_TYPE_PIXMAP, id, &sync);
        }
        assert_eq!(fl.capacity(), DISPLAY_FREE_LIST_DEFAULT_SIZE * 2);
        let drained = fl.take();
        assert_eq!(drained.res.len(), DISPLAY_FREE_LIST_DEFAULT_SIZE + 1);
        // The grown capacity is retained after a drain.
        assert_eq!(fl.capacity(), DISPLAY_FREE_LIST_DEFAULT_SIZE * 2);
        assert!(fl.is_empty());
    }

    #[test]
    fn free_list_merges_sync_element_wise() {
        let mut fl = FreeList::default();
        fl.push(RES_TYPE_PIXMAP, 1, &[5, 0, 7, 0]);
        fl.push(RES_TYPE_PIXMAP, 2, &[3, 9, 2, 0]);
        assert_eq!(fl.sync, [5, 9, 7, 0]);
    }
}
