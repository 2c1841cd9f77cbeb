//! The device-side contract: the virtual graphics device that publishes
//! command descriptors and takes resources back.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use lumen_gfx::parse::CmdFlags;
use lumen_gfx::{Rect, ReleaseInfo, ResourceReleaser};
use tokio::sync::Notify;

/// Width of the capability bitmask forwarded to the device.
pub const CLIENT_CAPS_BYTES: usize = 58;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Draw,
    Surface,
    Cursor,
    Update,
    Message,
}

/// One published command descriptor: where it lives and how to read it.
#[derive(Debug, Clone, Copy)]
pub struct GfxCommand {
    pub kind: CommandKind,
    pub addr: u64,
    pub group_id: u32,
    pub flags: CmdFlags,
}

/// Memory geometry the device announces when a worker attaches.
#[derive(Debug, Clone, Copy)]
pub struct DeviceInitInfo {
    pub num_memslots: u32,
    pub num_memslots_groups: u32,
    pub memslot_id_bits: u32,
    pub memslot_gen_bits: u32,
    pub n_surfaces: u32,
}

/// One monitor of a client-proposed layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    pub surface_id: u32,
    pub area: Rect,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorsConfig {
    pub monitors: Vec<MonitorConfig>,
}

/// The pull interface the worker drives. `release_resource` doubles as
/// the parser's release sink.
pub trait GfxDevice: ResourceReleaser {
    fn get_command(&self) -> Option<GfxCommand>;
    fn request_command_notification(&self);
    fn get_cursor_command(&self) -> Option<GfxCommand>;
    fn request_cursor_notification(&self);
    fn flush_resources(&self);
    fn set_client_capabilities(&self, present: bool, caps: [u8; CLIENT_CAPS_BYTES]);
    fn client_monitors_config(&self, config: &MonitorsConfig) -> bool;
    fn attached_worker(&self);
    fn set_compression_level(&self, level: i32);
    fn get_init_info(&self) -> DeviceInitInfo;
}

/// FIFO command queue between the device producer and the worker.
///
/// Producers push from any thread; the single worker drains. The notify
/// handle wakes the worker without it polling.
#[derive(Default)]
pub struct CommandQueue {
    queue: Mutex<VecDeque<GfxCommand>>,
    notify: Notify,
}

impl CommandQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, cmd: GfxCommand) {
        self.queue.lock().unwrap().push_back(cmd);
        self.notify.notify_one();
    }

    pub fn pop(&self) -> Option<GfxCommand> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    /// Waits until a push happens; spurious wakeups are fine, callers
    /// re-check the queue.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}
