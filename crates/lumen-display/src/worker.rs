//! The display worker: pulls device commands, parses them, feeds the
//! stream detector, and drains per-client pipes through their
//! transports.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use lumen_gfx::memslot::{AddressLayout, MemSlotTable};
use lumen_gfx::model::SurfaceOp;
use lumen_gfx::parse::{
    parse_cursor_cmd, parse_drawable, parse_message, parse_surface_cmd, parse_update_cmd,
};
use lumen_gfx::ResourceReleaser;
use lumen_transport::{TransportError, TransportStream};
use thiserror::Error;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::client::ClientError;
use crate::device::{CommandKind, CommandQueue, GfxCommand, GfxDevice};
use crate::display::{ClientId, DisplayState, Surface};
use crate::msgc::{parse_client_message, ClientMessageError, CLIENT_HEADER_SIZE};
use crate::pipe::{encode_resource_release, encode_simple, frame_message, msg, PipeItem};

/// Bounded waits of the client protocol.
pub const COMMON_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DISPLAY_CLIENT_SHORT_TIMEOUT: Duration = Duration::from_secs(15);

/// Upper bound on a single client message body.
pub const MAX_CLIENT_MESSAGE_SIZE: u32 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Message(#[from] ClientMessageError),

    #[error("client init did not complete in time")]
    InitTimeout,

    #[error("client message of {size} bytes exceeds the cap")]
    OversizedMessage { size: u32 },
}

pub struct DisplayWorker {
    pub state: DisplayState,
    device: Arc<dyn GfxDevice>,
    releaser: Arc<dyn ResourceReleaser>,
    slots: MemSlotTable,
    queue: Arc<CommandQueue>,
    transports: Vec<Option<TransportStream>>,
}

impl DisplayWorker {
    pub fn new<D: GfxDevice + 'static>(
        state: DisplayState,
        device: Arc<D>,
        queue: Arc<CommandQueue>,
    ) -> Self {
        let info = device.get_init_info();
        let slots = MemSlotTable::new(
            info.num_memslots_groups as usize,
            info.num_memslots as usize,
            AddressLayout::new(info.memslot_gen_bits, info.memslot_id_bits),
        );
        device.attached_worker();
        let transports = (0..lumen_cache::MAX_CACHE_CLIENTS).map(|_| None).collect();
        Self {
            state,
            device: device.clone(),
            releaser: device,
            slots,
            queue,
            transports,
        }
    }

    pub fn slots(&self) -> &MemSlotTable {
        &self.slots
    }

    /// Device-side slot registration passes through the worker so the
    /// table stays owned by the parsing thread.
    pub fn slots_mut(&mut self) -> &mut MemSlotTable {
        &mut self.slots
    }

    pub fn device(&self) -> &Arc<dyn GfxDevice> {
        &self.device
    }

    /// Hands one connected client's transport to the worker.
    pub fn attach_transport(&mut self, client: ClientId, transport: TransportStream) {
        self.transports[client] = Some(transport);
    }

    pub fn detach_transport(&mut self, client: ClientId) -> Option<TransportStream> {
        self.transports[client].take()
    }

    /// Drains every queued device command.
    pub fn process_pending(&mut self, now_ns: u64) -> usize {
        let mut processed = 0;
        while let Some(cmd) = self.queue.pop() {
            self.process_command(cmd, now_ns);
            processed += 1;
        }
        if processed > 0 {
            self.device.flush_resources();
        }
        self.device.request_command_notification();
        processed
    }

    /// Parses one command and routes the result. Parse faults drop the
    /// command; the guest resource stays with the device.
    pub fn process_command(&mut self, cmd: GfxCommand, now_ns: u64) {
        match cmd.kind {
            CommandKind::Draw => {
                match parse_drawable(&self.slots, &self.releaser, cmd.group_id, cmd.addr, cmd.flags)
                {
                    Ok(drawable) => self.route_drawable(Arc::new(drawable), now_ns),
                    Err(err) => warn!(%err, addr = cmd.addr, "dropping malformed draw command"),
                }
            }
            CommandKind::Surface => {
                match parse_surface_cmd(&self.slots, &self.releaser, cmd.group_id, cmd.addr) {
                    Ok(surface_cmd) => match &surface_cmd.op {
                        SurfaceOp::Create(create) => {
                            self.state.surface_created(
                                surface_cmd.surface_id,
                                Surface {
                                    width: create.width,
                                    height: create.height,
                                    format: create.format,
                                    stride: create.stride,
                                    primary: surface_cmd.surface_id == 0,
                                },
                            );
                        }
                        SurfaceOp::Destroy => {
                            self.state.surface_destroyed(surface_cmd.surface_id);
                        }
                    },
                    Err(err) => warn!(%err, addr = cmd.addr, "dropping malformed surface command"),
                }
            }
            CommandKind::Update => {
                match parse_update_cmd(&self.slots, &self.releaser, cmd.group_id, cmd.addr) {
                    Ok(update) => {
                        if let Some(canvas) = self.state.canvas.clone() {
                            canvas.draw(update.surface_id, &update.area);
                        }
                    }
                    Err(err) => warn!(%err, addr = cmd.addr, "dropping malformed update command"),
                }
            }
            CommandKind::Message => {
                match parse_message(&self.slots, &self.releaser, cmd.group_id, cmd.addr) {
                    Ok(message) => {
                        debug!(text = %String::from_utf8_lossy(&message.data), "guest message")
                    }
                    Err(err) => warn!(%err, addr = cmd.addr, "dropping malformed guest message"),
                }
            }
            CommandKind::Cursor => {
                // Cursor rendering belongs to the cursor channel; parsing
                // still validates and releases the resource.
                if let Err(err) =
                    parse_cursor_cmd(&self.slots, &self.releaser, cmd.group_id, cmd.addr)
                {
                    warn!(%err, addr = cmd.addr, "dropping malformed cursor command");
                }
            }
        }
    }

    fn route_drawable(&mut self, cmd: Arc<lumen_gfx::model::Drawable>, now_ns: u64) {
        let state = &mut self.state;
        let id = state.add_drawable(cmd, now_ns);

        // Detection first: a drawable that continues a stream becomes its
        // next frame and must not tear that stream down.
        state.stream_trace_update(id);

        if state.drawable(id).stream.is_some() {
            state.send_stream_frame(id);
        } else {
            // Anything else drawn over a live stream forces a graceful
            // detach so painter's-algorithm order survives.
            let region = state.drawable(id).region.clone();
            state.detach_streams_behind(&region, Some(id));

            let cmd = state.drawable(id).cmd.clone();
            for client in state.client_ids() {
                for dep in cmd.surface_deps.iter().flatten() {
                    state.send_surface_create(client, dep.surface_id);
                }
                state.send_surface_create(client, cmd.surface_id);
                state.pipe_push(
                    client,
                    PipeItem::Draw {
                        drawable: id,
                        cmd: cmd.clone(),
                    },
                );
            }
            state.stream_trace_add_drawable(id);
        }
        state.drawable_unref(id);
    }

    /// Encodes everything currently queued for `client`.
    pub fn drain_client(&mut self, client: ClientId) -> Vec<Bytes> {
        let mut out = Vec::new();

        while let Some(item) = self.state.pipe_pop(client) {
            let frame = match &item {
                PipeItem::Draw { drawable, .. } => Some(self.state.marshal_draw(client, *drawable)),
                PipeItem::Upgrade {
                    drawable, rects, ..
                } => Some(self.state.marshal_upgrade(client, *drawable, rects)),
                PipeItem::PixmapSync => {
                    self.bump_serial(client);
                    self.state.on_pixmap_sync_sent(client);
                    encode_simple(&item)
                }
                PipeItem::PixmapReset => {
                    self.bump_serial(client);
                    let generation = self.state.on_pixmap_reset_sent(client).unwrap_or(0);
                    Some(frame_message(msg::PIXMAP_RESET, &generation.to_le_bytes()))
                }
                other => {
                    self.bump_serial(client);
                    encode_simple(other)
                }
            };
            self.state.pipe_release_item(&item);
            if let Some(frame) = frame {
                out.push(frame);
            }
        }

        // Marshalling may have evicted cache entries on behalf of the
        // messages above. The release list leads the batch so receivers
        // see every eviction before the add that caused it.
        if let Some(free_list) = self.state.take_free_list(client) {
            if !free_list.res.is_empty() {
                out.insert(0, encode_resource_release(&free_list.res));
            }
        }
        out
    }

    fn bump_serial(&mut self, client: ClientId) {
        if let Some(dcc) = self.state.client_mut(client) {
            dcc.message_serial += 1;
        }
    }

    /// Drains `client` through its transport under cork, flushing once.
    pub async fn flush_client(&mut self, client: ClientId) -> Result<(), WorkerError> {
        let frames = self.drain_client(client);
        if frames.is_empty() {
            return Ok(());
        }
        let Some(transport) = self.transports[client].as_mut() else {
            return Ok(());
        };
        transport.set_auto_flush(false).await?;
        let slices: Vec<&[u8]> = frames.iter().map(|f| f.as_ref()).collect();
        transport.writev(&slices).await?;
        transport.flush().await?;
        Ok(())
    }

    async fn read_client_message(
        transport: &mut TransportStream,
    ) -> Result<(u16, Vec<u8>), WorkerError> {
        let mut header = [0u8; CLIENT_HEADER_SIZE];
        transport.read_exact(&mut header).await?;
        let kind = u16::from_le_bytes([header[0], header[1]]);
        let size = u32::from_le_bytes([header[2], header[3], header[4], header[5]]);
        if size > MAX_CLIENT_MESSAGE_SIZE {
            return Err(WorkerError::OversizedMessage { size });
        }
        let mut body = vec![0u8; size as usize];
        transport.read_exact(&mut body).await?;
        Ok((kind, body))
    }

    /// The init handshake: an async state machine bounded by one timer.
    /// The client must deliver its INIT (cache ids and dictionary
    /// window) before the deadline or the connection is dropped.
    pub async fn run_client_init(&mut self, client: ClientId) -> Result<(), WorkerError> {
        if let Some(dcc) = self.state.client_mut(client) {
            dcc.expect_init = true;
        }
        let deadline = Instant::now() + COMMON_CLIENT_TIMEOUT;

        loop {
            let initialized = self
                .state
                .client(client)
                .map(|dcc| dcc.pixmap_cache.is_some() && dcc.glz_dict.is_some())
                .unwrap_or(false);
            if initialized {
                return Ok(());
            }

            let Some(transport) = self.transports[client].as_mut() else {
                return Err(WorkerError::InitTimeout);
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(client, "init timeout");
                self.drop_client(client);
                return Err(WorkerError::InitTimeout);
            }

            let message = match timeout(remaining, Self::read_client_message(transport)).await {
                Ok(Ok((kind, body))) => parse_client_message(kind, &body),
                Ok(Err(err)) => {
                    self.drop_client(client);
                    return Err(err);
                }
                Err(_) => {
                    warn!(client, "init timeout");
                    self.drop_client(client);
                    return Err(WorkerError::InitTimeout);
                }
            };
            let message = match message {
                Ok(m) => m,
                Err(err) => {
                    // Unknown message during init: base-handler policy is
                    // to disconnect.
                    self.drop_client(client);
                    return Err(err.into());
                }
            };
            if let Err(err) = self.state.handle_client_message(client, message) {
                self.drop_client(client);
                return Err(err.into());
            }
        }
    }

    /// Reads and dispatches one post-init client message. A protocol
    /// violation or an unknown type disconnects the client.
    pub async fn read_and_dispatch(&mut self, client: ClientId) -> Result<(), WorkerError> {
        let Some(transport) = self.transports[client].as_mut() else {
            return Ok(());
        };
        let result = Self::read_client_message(transport).await;
        let message = match result.and_then(|(kind, body)| Ok(parse_client_message(kind, &body)?)) {
            Ok(message) => message,
            Err(err) => {
                self.drop_client(client);
                return Err(err);
            }
        };
        if let Err(err) = self.state.handle_client_message(client, message) {
            self.drop_client(client);
            return Err(err.into());
        }
        Ok(())
    }

    /// Full disconnect of one client: transport gone, state torn down.
    pub fn drop_client(&mut self, client: ClientId) {
        self.transports[client] = None;
        self.state.disconnect_client(client);
    }

    /// One scheduler turn: device commands, stream timeout sweep, pipe
    /// drains. `now_ns` is the worker's monotonic clock.
    pub async fn tick(&mut self, now_ns: u64) {
        self.process_pending(now_ns);
        self.state.stream_timeout(now_ns);
        for client in self.state.client_ids() {
            if let Err(err) = self.flush_client(client).await {
                warn!(client, %err, "client drain failed, disconnecting");
                self.drop_client(client);
            }
        }
    }

    /// Runs the worker until `shutdown` fires: wakes on queued commands
    /// and sweeps stream timeouts once per second.
    pub async fn run(&mut self, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        let start = Instant::now();
        let mut sweep = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = self.queue.wait() => {}
                _ = sweep.tick() => {}
                _ = &mut shutdown => {
                    debug!("display worker shutting down");
                    return;
                }
            }
            let now_ns = start.elapsed().as_nanos() as u64;
            self.tick(now_ns).await;
        }
    }
}
