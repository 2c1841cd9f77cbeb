//! Video stream detection, promotion and demotion.
//!
//! The detector watches freshly parsed copy drawables, traces repeated
//! frames in a small ring, promotes a sequence into one of the fixed
//! stream slots once it sustains itself, and demotes streams that stall.
//! Slot indexes double as wire stream ids.

use lumen_gfx::model::{DrawOp, Graduality, ImageKind};
use lumen_gfx::region::Region;
use lumen_gfx::Rect;
use rand::Rng;
use tracing::debug;

use crate::client::FreeList;
use crate::display::{ClientId, DisplayState};
use crate::encoder::{EncodeAction, FrameRef, RateContext, VideoEncoder};
use crate::pipe::{DrawableId, ImageItem, PipeItem};

pub const NSEC_PER_SEC: u64 = 1_000_000_000;

pub const NUM_STREAMS: usize = 50;
pub const NUM_TRACE_ITEMS: usize = 16;
pub const ITEMS_TRACE_MASK: usize = NUM_TRACE_ITEMS - 1;

pub const STREAM_DETECTION_MAX_DELTA: u64 = NSEC_PER_SEC / 5;
pub const STREAM_CONTINUOUS_MAX_DELTA: u64 = NSEC_PER_SEC;
pub const STREAM_TIMEOUT: u64 = NSEC_PER_SEC;
pub const STREAM_INPUT_FPS_WINDOW: u64 = 5 * NSEC_PER_SEC;
pub const STREAM_FRAMES_START_CONDITION: u32 = 20;
pub const STREAM_GRADUAL_FRAMES_START_CONDITION: f64 = 0.2;
pub const STREAM_FRAMES_RESET_CONDITION: u32 = 100;
pub const STREAM_MIN_AREA: i64 = 96 * 96;
/// A container candidate may cover at most this multiple of the area of
/// the frame it would absorb.
pub const STREAM_CONTAINER_AREA_FACTOR: i64 = 2;
pub const STREAM_CHANNEL_CAPACITY: f64 = 0.8;
pub const STREAM_DEFAULT_LOW_START_BIT_RATE: u64 = 2_621_440; // 2.5 Mbps
pub const STREAM_DEFAULT_HIGH_START_BIT_RATE: u64 = 10 * 1024 * 1024;
pub const MAX_FPS: u32 = 30;

/// Graduality of a copy drawable's source, computed lazily.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyGraduality {
    /// Not computed (or not relevant in the current streaming mode).
    #[default]
    Invalid,
    NotAvail,
    Low,
    Medium,
    High,
}

/// One slot of the trace ring: enough of a recent streamable drawable to
/// recognise its successor.
#[derive(Debug, Clone, Copy, Default)]
pub struct ItemTrace {
    pub time: u64,
    pub first_frame_time: u64,
    pub frames_count: u32,
    pub gradual_frames_count: u32,
    pub last_gradual_frame: u32,
    pub width: i32,
    pub height: i32,
    pub dest_area: Rect,
}

/// One stream slot of the fixed pool.
#[derive(Debug, Default)]
pub struct VideoStream {
    pub refs: u32,
    pub active: bool,
    pub current: Option<DrawableId>,
    pub last_time: u64,
    pub width: i32,
    pub height: i32,
    pub dest_area: Rect,
    pub top_down: bool,
    pub num_input_frames: u32,
    pub input_fps_window_start: u64,
    pub input_fps: u32,
    pub next_free: Option<usize>,
}

/// Per-client encoder state of one stream slot.
#[derive(Default)]
pub struct StreamAgent {
    /// Surface area currently covered by this stream's frames.
    pub vis_region: Region,
    /// Active clipping sent to the client; may lag behind `vis_region`.
    pub clip: Region,
    pub encoder: Option<Box<dyn VideoEncoder>>,
    pub report_id: u32,
    pub client_required_latency: u32,
}

/// Snapshot the encoder rate control reads during one call.
pub struct SnapshotRateContext {
    pub roundtrip_ms: u32,
    pub source_fps: u32,
}

impl RateContext for SnapshotRateContext {
    fn roundtrip_ms(&self) -> u32 {
        self.roundtrip_ms
    }

    fn source_fps(&self) -> u32 {
        self.source_fps
    }
}

impl DisplayState {
    /// The channel's own roundtrip when measured, else the main
    /// channel's (e.g. right after migration).
    fn rate_context(&self, client: ClientId, stream_idx: usize) -> SnapshotRateContext {
        let channel_rtt = self.client(client).and_then(|dcc| dcc.roundtrip_ms);
        SnapshotRateContext {
            roundtrip_ms: channel_rtt
                .or_else(|| self.main.roundtrip_ms())
                .unwrap_or(0),
            source_fps: self.streams[stream_idx].input_fps,
        }
    }

    fn stream_try_new(&mut self) -> Option<usize> {
        let idx = self.free_stream?;
        self.free_stream = self.streams[idx].next_free.take();
        Some(idx)
    }

    fn stream_release(&mut self, idx: usize) {
        let stream = &mut self.streams[idx];
        debug_assert!(!stream.active);
        stream.current = None;
        stream.next_free = self.free_stream;
        self.free_stream = Some(idx);
        self.stream_count -= 1;
    }

    /// Lazily classifies the source bitmap of a copy.
    fn update_copy_graduality(&mut self, id: DrawableId) {
        use crate::config::StreamVideoMode;
        if self.config.stream_video != StreamVideoMode::Filter {
            self.drawable_mut(id).graduality = CopyGraduality::Invalid;
            return;
        }
        if self.drawable(id).graduality != CopyGraduality::Invalid {
            return;
        }
        let cmd = self.drawable(id).cmd.clone();
        let DrawOp::Copy(copy) = &cmd.op else {
            return;
        };
        let ImageKind::Bitmap(bitmap) = &copy.src.kind else {
            return;
        };
        let level = if !bitmap.format.has_graduality()
            || bitmap.has_extra_stride()
            || bitmap.is_unstable()
        {
            CopyGraduality::NotAvail
        } else {
            match bitmap.graduality_level() {
                Graduality::NotAvail => CopyGraduality::NotAvail,
                Graduality::Low => CopyGraduality::Low,
                Graduality::Medium => CopyGraduality::Medium,
                Graduality::High => CopyGraduality::High,
            }
        };
        self.drawable_mut(id).graduality = level;
    }

    /// Whether `candidate` plausibly continues the frame described by the
    /// `other_*` parameters.
    fn is_next_stream_frame(
        &self,
        candidate: DrawableId,
        other_width: i32,
        other_height: i32,
        other_dest: &Rect,
        other_time: u64,
        stream: Option<usize>,
        container_candidate_allowed: bool,
    ) -> bool {
        let drawable = self.drawable(candidate);
        if !drawable.streamable {
            return false;
        }
        let max_delta = if stream.is_some() {
            STREAM_CONTINUOUS_MAX_DELTA
        } else {
            STREAM_DETECTION_MAX_DELTA
        };
        if drawable.creation_time.saturating_sub(other_time) > max_delta {
            return false;
        }

        let cmd = &drawable.cmd;
        let DrawOp::Copy(copy) = &cmd.op else {
            return false;
        };
        if !container_candidate_allowed {
            if cmd.bbox != *other_dest {
                return false;
            }
            let src = &copy.src_area;
            if src.width() != other_width || src.height() != other_height {
                return false;
            }
        } else {
            if !cmd.bbox.contains_rect(other_dest) {
                return false;
            }
            // Do not absorb drawables much bigger than the frame they
            // would replace.
            if cmd.bbox.area() > STREAM_CONTAINER_AREA_FACTOR * other_dest.area() {
                debug!(bbox = ?cmd.bbox, prev = ?other_dest, "container candidate too big");
                return false;
            }
        }

        if let Some(stream_idx) = stream {
            let ImageKind::Bitmap(bitmap) = &copy.src.kind else {
                return false;
            };
            if self.streams[stream_idx].top_down != bitmap.top_down() {
                return false;
            }
        }
        true
    }

    /// Attaches `drawable` as the stream's current frame and updates the
    /// input-FPS window and per-client regions.
    pub(crate) fn attach_stream(&mut self, drawable_id: DrawableId, stream_idx: usize) {
        debug_assert!(self.drawable(drawable_id).stream.is_none());
        debug_assert!(self.streams[stream_idx].current.is_none());

        self.drawable_ref(drawable_id);
        let creation_time = self.drawable(drawable_id).creation_time;
        let region = self.drawable(drawable_id).region.clone();
        let bbox = self.drawable(drawable_id).cmd.bbox;

        {
            let stream = &mut self.streams[stream_idx];
            stream.current = Some(drawable_id);
            stream.last_time = creation_time;
            let duration = creation_time.saturating_sub(stream.input_fps_window_start);
            if duration >= STREAM_INPUT_FPS_WINDOW {
                // Round to nearest, e.g. 24 for 23.976.
                stream.input_fps =
                    ((u64::from(stream.num_input_frames) * NSEC_PER_SEC + duration / 2) / duration)
                        as u32;
                debug!(stream = stream_idx, fps = stream.input_fps, "input fps");
                stream.num_input_frames = 0;
                stream.input_fps_window_start = creation_time;
            } else {
                stream.num_input_frames += 1;
            }
        }
        self.drawable_mut(drawable_id).stream = Some(stream_idx);

        for client in self.client_ids() {
            let mut clip_changed = false;
            if let Some(dcc) = self.client_mut(client) {
                let agent = &mut dcc.stream_agents[stream_idx];
                agent.vis_region.union_region(&region);

                let mut clip_in_draw_dest = Region::from_rect(bbox);
                clip_in_draw_dest.intersect_region(&agent.clip);
                if !clip_in_draw_dest.equals(&region) {
                    agent.clip.remove_rect(&bbox);
                    agent.clip.union_region(&region);
                    clip_changed = true;
                }
            }
            if clip_changed {
                let rects = self
                    .client(client)
                    .map(|dcc| dcc.stream_agents[stream_idx].clip.rects().to_vec())
                    .unwrap_or_default();
                self.pipe_push(
                    client,
                    PipeItem::StreamClip {
                        stream_id: stream_idx as u32,
                        rects,
                    },
                );
            }
        }
    }

    /// Unlinks the stream's current frame.
    pub(crate) fn detach_stream_drawable(&mut self, stream_idx: usize) {
        if let Some(drawable_id) = self.streams[stream_idx].current.take() {
            self.drawable_mut(drawable_id).stream = None;
            self.drawable_unref(drawable_id);
        }
    }

    /// Before replacing the current frame: every client that still has
    /// the old frame queued is about to implicitly drop it.
    fn before_reattach_stream(&mut self, stream_idx: usize, new_frame: DrawableId) {
        let Some(current) = self.streams[stream_idx].current else {
            return;
        };
        if !self.is_connected() {
            return;
        }
        if self.drawable(new_frame).generation == self.drawable(current).generation {
            debug!("ignoring drop, same processing generation as previous frame");
            return;
        }
        for client in self.client_ids() {
            if !self.drawable_in_pipe(client, current) {
                continue;
            }
            if let Some(dcc) = self.client_mut(client) {
                if let Some(encoder) = dcc.stream_agents[stream_idx].encoder.as_mut() {
                    encoder.notify_server_frame_drop();
                }
            }
        }
    }

    /// Allocates a stream slot for a drawable that crossed the promotion
    /// threshold and announces it to every client.
    fn create_stream(&mut self, drawable_id: DrawableId) {
        debug_assert!(self.drawable(drawable_id).stream.is_none());
        let Some(stream_idx) = self.stream_try_new() else {
            return;
        };

        let info = {
            let drawable = self.drawable(drawable_id);
            match &drawable.cmd.op {
                DrawOp::Copy(copy) => match &copy.src.kind {
                    ImageKind::Bitmap(bitmap) => Some((
                        copy.src_area,
                        drawable.cmd.bbox,
                        bitmap.top_down(),
                        drawable.creation_time,
                        drawable.first_frame_time,
                        drawable.frames_count,
                    )),
                    _ => None,
                },
                _ => None,
            }
        };
        let Some((src_rect, bbox, top_down, creation_time, first_frame_time, frames_count)) = info
        else {
            self.streams[stream_idx].next_free = self.free_stream;
            self.free_stream = Some(stream_idx);
            return;
        };

        {
            let stream = &mut self.streams[stream_idx];
            stream.active = true;
            stream.refs = 1;
            stream.last_time = creation_time;
            stream.width = src_rect.width();
            stream.height = src_rect.height();
            stream.dest_area = bbox;
            stream.top_down = top_down;
            // Seed the encoder with an fps estimate from the frames that
            // led to the promotion.
            let duration = creation_time.saturating_sub(first_frame_time);
            stream.input_fps = if duration
                > NSEC_PER_SEC * u64::from(frames_count) / u64::from(MAX_FPS)
            {
                ((NSEC_PER_SEC * u64::from(frames_count) + duration / 2) / duration) as u32
            } else {
                MAX_FPS
            };
            stream.num_input_frames = 0;
            stream.input_fps_window_start = creation_time;
        }
        self.active_streams.push(stream_idx);
        self.stream_count += 1;
        self.streams_size_total +=
            i64::from(self.streams[stream_idx].width) * i64::from(self.streams[stream_idx].height);

        // The promoted drawable becomes the stream's first current frame.
        self.drawable_ref(drawable_id);
        self.streams[stream_idx].current = Some(drawable_id);
        self.drawable_mut(drawable_id).stream = Some(stream_idx);

        debug!(
            stream = stream_idx,
            width = self.streams[stream_idx].width,
            height = self.streams[stream_idx].height,
            fps = self.streams[stream_idx].input_fps,
            "stream created"
        );
        for client in self.client_ids() {
            self.dcc_create_stream(client, stream_idx);
        }
    }

    /// Per-client half of stream creation: pick an encoder, announce the
    /// stream, arm reports.
    pub(crate) fn dcc_create_stream(&mut self, client: ClientId, stream_idx: usize) {
        let initial_bit_rate = self.initial_bit_rate(client, stream_idx);
        let (width, height, dest, top_down) = {
            let s = &self.streams[stream_idx];
            (s.width, s.height, s.dest_area, s.top_down)
        };
        let current_region = self.streams[stream_idx]
            .current
            .map(|d| self.drawable(d).region.clone());

        let encoder = self.create_video_encoder(client, initial_bit_rate);
        let wants_report = {
            let Some(dcc) = self.client_mut(client) else {
                return;
            };
            let agent = &mut dcc.stream_agents[stream_idx];
            debug_assert!(agent.vis_region.is_empty());
            if let Some(region) = &current_region {
                agent.vis_region = region.clone();
                agent.clip = region.clone();
            }
            agent.encoder = encoder;
            agent.client_required_latency = 0;
            dcc.caps.stream_report
        };

        self.pipe_push(
            client,
            PipeItem::StreamCreate {
                stream_id: stream_idx as u32,
                width: width as u32,
                height: height as u32,
                dest,
                top_down,
            },
        );

        if wants_report {
            let report_id: u32 = rand::thread_rng().gen();
            if let Some(dcc) = self.client_mut(client) {
                dcc.stream_agents[stream_idx].report_id = report_id;
            }
            self.pipe_push(
                client,
                PipeItem::StreamActivateReport {
                    stream_id: stream_idx as u32,
                    report_id,
                },
            );
        }
    }

    /// Initial bit rate: explicit override, else the best link estimate,
    /// else a bandwidth-class default; then divided among active streams
    /// with headroom held back for other messages.
    fn initial_bit_rate(&self, client: ClientId, stream_idx: usize) -> u64 {
        let mut bit_rate = self.config.stream_bit_rate_override.unwrap_or(0);
        if bit_rate == 0 {
            let net_test = self.main.bitrate_per_sec().unwrap_or(0);
            let max_seen = self
                .client(client)
                .map(|dcc| dcc.max_stream_bit_rate)
                .unwrap_or(0);
            bit_rate = max_seen.max(net_test);
            if bit_rate == 0 {
                let low_bandwidth = self
                    .client(client)
                    .map(|dcc| dcc.is_low_bandwidth)
                    .unwrap_or_else(|| self.main.is_low_bandwidth());
                bit_rate = if low_bandwidth {
                    STREAM_DEFAULT_LOW_START_BIT_RATE
                } else {
                    STREAM_DEFAULT_HIGH_START_BIT_RATE
                };
            }
        }
        debug!(bit_rate, "base stream bit rate");

        let stream = &self.streams[stream_idx];
        let stream_area = i64::from(stream.width) * i64::from(stream.height);
        let total = self.streams_size_total.max(stream_area).max(1) as f64;
        (STREAM_CHANNEL_CAPACITY * bit_rate as f64 * stream_area as f64 / total) as u64
    }

    /// Records a drawable that did not become a stream frame into the
    /// trace ring.
    pub fn stream_trace_add_drawable(&mut self, drawable_id: DrawableId) {
        let drawable = self.drawable(drawable_id);
        if drawable.stream.is_some() || !drawable.streamable {
            return;
        }
        let DrawOp::Copy(copy) = &drawable.cmd.op else {
            return;
        };
        let trace = ItemTrace {
            time: drawable.creation_time,
            first_frame_time: drawable.first_frame_time,
            frames_count: drawable.frames_count,
            gradual_frames_count: drawable.gradual_frames_count,
            last_gradual_frame: drawable.last_gradual_frame,
            width: copy.src_area.width(),
            height: copy.src_area.height(),
            dest_area: drawable.cmd.bbox,
        };
        let slot = self.next_trace & ITEMS_TRACE_MASK;
        self.next_trace = self.next_trace.wrapping_add(1);
        self.trace[slot] = trace;
    }

    fn is_stream_start(&self, drawable_id: DrawableId) -> bool {
        let d = self.drawable(drawable_id);
        d.frames_count >= STREAM_FRAMES_START_CONDITION
            && f64::from(d.gradual_frames_count)
                >= STREAM_GRADUAL_FRAMES_START_CONDITION * f64::from(d.frames_count)
    }

    /// Inherits the frame counters from a predecessor and promotes the
    /// drawable into a stream when the start condition holds.
    fn stream_add_frame(
        &mut self,
        drawable_id: DrawableId,
        first_frame_time: u64,
        frames_count: u32,
        gradual_frames_count: u32,
        last_gradual_frame: u32,
    ) -> bool {
        self.update_copy_graduality(drawable_id);
        {
            let d = self.drawable_mut(drawable_id);
            d.first_frame_time = first_frame_time;
            d.frames_count = frames_count + 1;
            d.gradual_frames_count = gradual_frames_count;

            if d.graduality != CopyGraduality::Low {
                if d.frames_count.saturating_sub(last_gradual_frame)
                    > STREAM_FRAMES_RESET_CONDITION
                {
                    d.frames_count = 1;
                    d.gradual_frames_count = 1;
                } else {
                    d.gradual_frames_count += 1;
                }
                d.last_gradual_frame = d.frames_count;
            } else {
                d.last_gradual_frame = last_gradual_frame;
            }
        }
        if self.is_stream_start(drawable_id) {
            self.create_stream(drawable_id);
            return true;
        }
        false
    }

    /// Main detector entry for a drawable that is not yet associated with
    /// any stream: try to continue an active stream, else look for a
    /// predecessor in the trace ring.
    pub fn stream_trace_update(&mut self, drawable_id: DrawableId) {
        {
            let d = self.drawable(drawable_id);
            if d.stream.is_some() || !d.streamable || d.frames_count != 0 {
                return;
            }
        }

        for stream_idx in self.active_streams.clone() {
            let (width, height, dest_area, last_time) = {
                let s = &self.streams[stream_idx];
                (s.width, s.height, s.dest_area, s.last_time)
            };
            if self.is_next_stream_frame(
                drawable_id,
                width,
                height,
                &dest_area,
                last_time,
                Some(stream_idx),
                true,
            ) {
                if self.streams[stream_idx].current.is_some() {
                    if let Some(current) = self.streams[stream_idx].current {
                        // Prevent the replaced frame from re-entering the
                        // trace ring.
                        self.drawable_mut(current).streamable = false;
                    }
                    self.before_reattach_stream(stream_idx, drawable_id);
                    self.detach_stream_drawable(stream_idx);
                }
                self.attach_stream(drawable_id, stream_idx);
                return;
            }
        }

        for slot in 0..NUM_TRACE_ITEMS {
            let trace = self.trace[slot];
            if trace.time == 0 {
                continue;
            }
            if self.is_next_stream_frame(
                drawable_id,
                trace.width,
                trace.height,
                &trace.dest_area,
                trace.time,
                None,
                false,
            ) && self.stream_add_frame(
                drawable_id,
                trace.first_frame_time,
                trace.frames_count,
                trace.gradual_frames_count,
                trace.last_gradual_frame,
            ) {
                return;
            }
        }
    }

    /// Pairwise maintenance between a new drawable and the drawable it
    /// replaces in the same screen area.
    pub fn stream_maintenance(&mut self, candidate: DrawableId, prev: DrawableId) {
        if self.drawable(candidate).stream.is_some() {
            return;
        }

        if let Some(stream_idx) = self.drawable(prev).stream {
            let (width, height, dest_area, last_time) = {
                let s = &self.streams[stream_idx];
                (s.width, s.height, s.dest_area, s.last_time)
            };
            if self.is_next_stream_frame(
                candidate,
                width,
                height,
                &dest_area,
                last_time,
                Some(stream_idx),
                true,
            ) {
                self.before_reattach_stream(stream_idx, candidate);
                self.detach_stream_drawable(stream_idx);
                self.drawable_mut(prev).streamable = false;
                self.attach_stream(candidate, stream_idx);
            }
        } else if self.drawable(candidate).streamable {
            let Some((prev_w, prev_h, prev_bbox, prev_time)) = ({
                let p = self.drawable(prev);
                match &p.cmd.op {
                    DrawOp::Copy(copy) => Some((
                        copy.src_area.width(),
                        copy.src_area.height(),
                        p.cmd.bbox,
                        p.creation_time,
                    )),
                    _ => None,
                }
            }) else {
                return;
            };
            if self.is_next_stream_frame(
                candidate, prev_w, prev_h, &prev_bbox, prev_time, None, false,
            ) {
                let (first, frames, gradual, last_gradual) = {
                    let p = self.drawable(prev);
                    (
                        p.first_frame_time,
                        p.frames_count,
                        p.gradual_frames_count,
                        p.last_gradual_frame,
                    )
                };
                self.stream_add_frame(candidate, first, frames, gradual, last_gradual);
            }
        }
    }

    /// Encodes the stream's new current frame for every client, or sends
    /// it as an ordinary draw item when an agent has no encoder.
    pub fn send_stream_frame(&mut self, drawable_id: DrawableId) {
        let Some(stream_idx) = self.drawable(drawable_id).stream else {
            return;
        };
        let cmd = self.drawable(drawable_id).cmd.clone();
        let mm_time = cmd.mm_time;
        let DrawOp::Copy(copy) = &cmd.op else {
            return;
        };
        let ImageKind::Bitmap(bitmap) = &copy.src.kind else {
            return;
        };

        for client in self.client_ids() {
            let ctx = self.rate_context(client, stream_idx);
            let action = {
                let Some(dcc) = self.client_mut(client) else {
                    continue;
                };
                match dcc.stream_agents[stream_idx].encoder.as_mut() {
                    Some(encoder) => Some(encoder.encode_frame(
                        &ctx,
                        &FrameRef {
                            bitmap,
                            src_area: copy.src_area,
                            mm_time,
                        },
                    )),
                    None => None,
                }
            };
            match action {
                Some(EncodeAction::Frame(payload)) => self.pipe_push(
                    client,
                    PipeItem::StreamData {
                        stream_id: stream_idx as u32,
                        drawable: drawable_id,
                        mm_time,
                        payload,
                    },
                ),
                Some(EncodeAction::Drop) => {}
                // Pass-through: no encoder, deliver losslessly.
                None => self.pipe_push(
                    client,
                    PipeItem::Draw {
                        drawable: drawable_id,
                        cmd: cmd.clone(),
                    },
                ),
            }
        }
    }

    /// Gracefully detaches one client from a stream: freeze its clip,
    /// then make sure the last frame the client keeps is lossless.
    fn dcc_detach_stream_gracefully(
        &mut self,
        client: ClientId,
        stream_idx: usize,
        update_area_limit: Option<DrawableId>,
    ) {
        let vis_region = {
            let Some(dcc) = self.client_mut(client) else {
                return;
            };
            let agent = &mut dcc.stream_agents[stream_idx];
            agent.clip.clear();
            agent.vis_region.clone()
        };
        // Stop the client from playing older frames immediately.
        self.pipe_push(
            client,
            PipeItem::StreamClip {
                stream_id: stream_idx as u32,
                rects: Vec::new(),
            },
        );
        if vis_region.is_empty() {
            debug!(stream = stream_idx, "vis region empty");
            return;
        }

        let current = self.streams[stream_idx].current;
        let covered = current
            .map(|d| self.drawable(d).region.contains(&vis_region))
            .unwrap_or(false);
        if let (Some(current), true) = (current, covered) {
            if self.drawable_in_pipe_lossless(client, current) {
                // The drawable is on its way as an ordinary (lossless)
                // draw already.
                debug!(stream = stream_idx, "upgrade by linked drawable");
            } else {
                debug!(stream = stream_idx, "upgrade by drawable");
                let cmd = self.drawable(current).cmd.clone();
                let rects = self.drawable(current).region.rects().to_vec();
                self.pipe_push(
                    client,
                    PipeItem::Upgrade {
                        drawable: current,
                        cmd,
                        rects,
                    },
                );
            }
        } else {
            let upgrade_area = vis_region.extents();
            debug!(stream = stream_idx, area = ?upgrade_area, has_current = current.is_some(),
                   "upgrade by screenshot");
            if let Some(canvas) = self.canvas.clone() {
                match update_area_limit.map(|d| self.drawable(d).generation) {
                    Some(limit) => canvas.draw_until(0, &upgrade_area, limit),
                    None => canvas.draw(0, &upgrade_area),
                }
            }
            self.add_surface_area_image(client, 0, &upgrade_area, false);
        }

        if let Some(dcc) = self.client_mut(client) {
            dcc.stream_agents[stream_idx].vis_region.clear();
        }
    }

    /// Reads back `area` of a surface and queues it as a lossless image.
    pub(crate) fn add_surface_area_image(
        &mut self,
        client: ClientId,
        surface_id: u32,
        area: &Rect,
        can_lossy: bool,
    ) {
        let Some(canvas) = self.canvas.clone() else {
            return;
        };
        let Some(snapshot) = canvas.read_bits(surface_id, area) else {
            return;
        };
        let is_primary = self
            .surface(surface_id)
            .map(|s| s.primary)
            .unwrap_or(surface_id == 0);

        let mut format = snapshot.format;
        let mut high_bits_set = false;
        if !is_primary && format == lumen_gfx::model::BitmapFormat::Rgb32 {
            // Non-primary 32-bit surfaces may feed alpha blending later;
            // preserve any non-zero high bytes.
            let (has_alpha, all_set) = rgb32_alpha_state(&snapshot.data);
            if has_alpha {
                if all_set {
                    high_bits_set = true;
                } else {
                    format = lumen_gfx::model::BitmapFormat::Rgba;
                }
            }
        }

        let item = ImageItem {
            surface_id,
            pos: lumen_gfx::Point::new(area.left, area.top),
            width: area.width() as u32,
            height: area.height() as u32,
            stride: snapshot.stride as u32,
            format: format as u8,
            top_down: snapshot.top_down,
            high_bits_set,
            can_lossy,
            data: snapshot.data.into(),
        };
        self.pipe_push(client, PipeItem::Image(std::sync::Arc::new(item)));
    }

    fn detach_stream_gracefully(&mut self, stream_idx: usize, update_area_limit: Option<DrawableId>) {
        for client in self.client_ids() {
            self.dcc_detach_stream_gracefully(client, stream_idx, update_area_limit);
        }
        if self.streams[stream_idx].current.is_some() {
            self.detach_stream_drawable(stream_idx);
        }
    }

    /// Stops a stream: destroy items to every client, encoder teardown,
    /// slot back to the free pool.
    pub fn stream_stop(&mut self, stream_idx: usize) {
        debug_assert!(self.streams[stream_idx].current.is_none());
        debug!(stream = stream_idx, "stream stop");

        for client in self.client_ids() {
            let destroyed_encoder_bit_rate = {
                let Some(dcc) = self.client_mut(client) else {
                    continue;
                };
                let agent = &mut dcc.stream_agents[stream_idx];
                agent.vis_region.clear();
                agent.clip.clear();
                agent.encoder.take().map(|e| e.bit_rate())
            };
            if let Some(bit_rate) = destroyed_encoder_bit_rate {
                if let Some(dcc) = self.client_mut(client) {
                    if bit_rate > dcc.max_stream_bit_rate {
                        debug!(old = dcc.max_stream_bit_rate, new = bit_rate, "max bit rate");
                        dcc.max_stream_bit_rate = bit_rate;
                    }
                }
            }
            self.update_streams_max_latency(client, stream_idx);
            self.pipe_push(
                client,
                PipeItem::StreamDestroy {
                    stream_id: stream_idx as u32,
                },
            );
        }

        let stream = &mut self.streams[stream_idx];
        self.streams_size_total -= i64::from(stream.width) * i64::from(stream.height);
        stream.active = false;
        self.active_streams.retain(|&s| s != stream_idx);
        self.stream_release(stream_idx);
    }

    /// Demotes streams that have not seen a frame within the timeout.
    pub fn stream_timeout(&mut self, now_ns: u64) {
        for stream_idx in self.active_streams.clone() {
            if !self.streams[stream_idx].active {
                continue;
            }
            if now_ns >= self.streams[stream_idx].last_time + STREAM_TIMEOUT {
                self.detach_stream_gracefully(stream_idx, None);
                self.stream_stop(stream_idx);
            }
        }
    }

    /// Detaches every stream whose visible region intersects `region`
    /// so painter's-algorithm ordering survives the new drawable.
    pub fn detach_streams_behind(&mut self, region: &Region, new_drawable: Option<DrawableId>) {
        let connected = self.is_connected();
        for stream_idx in self.active_streams.clone() {
            let mut detach = false;
            for client in self.client_ids() {
                let intersects = self
                    .client(client)
                    .map(|dcc| dcc.stream_agents[stream_idx].vis_region.intersects(region))
                    .unwrap_or(false);
                if intersects {
                    self.dcc_detach_stream_gracefully(client, stream_idx, new_drawable);
                    detach = true;
                    debug!(stream = stream_idx, "stream detached behind drawable");
                }
            }
            if detach && self.streams[stream_idx].current.is_some() {
                self.detach_stream_drawable(stream_idx);
            } else if !connected {
                let overlaps_current = self.streams[stream_idx]
                    .current
                    .map(|d| self.drawable(d).region.intersects(region))
                    .unwrap_or(false);
                if overlaps_current {
                    self.detach_stream_drawable(stream_idx);
                }
            }
        }
    }

    /// Detaches and stops everything; used at disconnect and when the
    /// client's codec preferences change.
    pub fn detach_and_stop_streams(&mut self) {
        debug!("detach and stop all streams");
        for stream_idx in self.active_streams.clone() {
            self.detach_stream_gracefully(stream_idx, None);
            self.stream_stop(stream_idx);
        }
    }

    /// Recomputes one client's maximum required stream latency after the
    /// agent of `removed_stream` stops mattering.
    pub(crate) fn update_streams_max_latency(&mut self, client: ClientId, removed_stream: usize) {
        let Some(dcc) = self.client_mut(client) else {
            return;
        };
        let removed_latency = dcc.stream_agents[removed_stream].client_required_latency;
        dcc.stream_agents[removed_stream].client_required_latency = 0;
        if dcc.max_stream_latency != removed_latency {
            return;
        }
        let mut new_max = 0;
        for (idx, agent) in dcc.stream_agents.iter().enumerate() {
            if idx == removed_stream || agent.encoder.is_none() {
                continue;
            }
            new_max = new_max.max(agent.client_required_latency);
        }
        dcc.max_stream_latency = new_max;
        let token = dcc.client_token;
        let latency = dcc.max_stream_latency;
        self.main.set_playback_latency(token, latency);
    }

    /// Applies a client's stream report to the agent's encoder.
    pub fn handle_stream_report(&mut self, client: ClientId, report: crate::encoder::StreamReport) {
        use tracing::warn;
        if report.stream_id as usize >= NUM_STREAMS {
            warn!(stream = report.stream_id, "stream report for invalid stream id");
            return;
        }
        let stream_idx = report.stream_id as usize;
        let ctx = self.rate_context(client, stream_idx);

        let outcome = {
            let Some(dcc) = self.client_mut(client) else {
                return;
            };
            let agent = &mut dcc.stream_agents[stream_idx];
            if agent.encoder.is_none() {
                debug!(stream = stream_idx, "report for a stream with no encoder");
                return;
            }
            if report.is_decoder_rejection() {
                warn!(stream = stream_idx, "client cannot decode this codec");
                agent.encoder = None;
                return;
            }
            if report.unique_id != agent.report_id {
                // A stale report for a replaced stream; ignore silently.
                return;
            }
            agent
                .encoder
                .as_mut()
                .expect("encoder checked above")
                .client_stream_report(&ctx, &report)
        };

        if let Some(delay_ms) = outcome {
            self.update_client_playback_delay(client, stream_idx, delay_ms);
        }
    }

    /// Applies an encoder-requested playback delay and forwards the new
    /// per-client maximum to the main channel.
    pub(crate) fn update_client_playback_delay(
        &mut self,
        client: ClientId,
        stream_idx: usize,
        delay_ms: u32,
    ) {
        let Some(dcc) = self.client_mut(client) else {
            return;
        };
        dcc.stream_agents[stream_idx].client_required_latency = delay_ms;
        let mut max = 0;
        for agent in &dcc.stream_agents {
            if agent.encoder.is_some() {
                max = max.max(agent.client_required_latency);
            }
        }
        dcc.max_stream_latency = max.max(delay_ms);
        let token = dcc.client_token;
        let latency = dcc.max_stream_latency;
        debug!(latency, "resetting client playback latency");
        self.main.set_playback_latency(token, latency);
    }

    /// Drains the client's pending resource-release list for the batch
    /// being flushed.
    pub(crate) fn take_free_list(&mut self, client: ClientId) -> Option<FreeList> {
        self.client_mut(client).map(|dcc| dcc.free_list.take())
    }
}

/// Scans 32-bit pixel data for non-zero high bytes.
/// Returns `(has_any, all_set)`.
fn rgb32_alpha_state(data: &[u8]) -> (bool, bool) {
    let mut any = false;
    let mut all = true;
    for px in data.chunks_exact(4) {
        if px[3] != 0 {
            any = true;
            if px[3] != 0xff {
                all = false;
            }
        } else {
            all = false;
        }
    }
    (any, any && all)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpha_state_classification() {
        assert_eq!(rgb32_alpha_state(&[0, 0, 0, 0, 0, 0, 0, 0]), (false, false));
        assert_eq!(
            rgb32_alpha_state(&[0, 0, 0, 0xff, 0, 0, 0, 0xff]),
            (true, true)
        );
        assert_eq!(
            rgb32_alpha_state(&[0, 0, 0, 0xff, 0, 0, 0, 0]),
            (true, false)
        );
    }

    #[test]
    fn trace_mask_is_power_of_two_ring() {
        assert_eq!(NUM_TRACE_ITEMS & ITEMS_TRACE_MASK, 0);
        assert_eq!(ITEMS_TRACE_MASK + 1, NUM_TRACE_ITEMS);
    }
}
