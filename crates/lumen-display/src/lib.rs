#![forbid(unsafe_code)]

//! The display-channel core of the lumen remote-desktop server.
//!
//! One worker owns a [`display::DisplayState`]: it pulls command
//! descriptors from the virtual graphics device, parses them through
//! `lumen-gfx`, feeds copy drawables to the stream detector in
//! [`stream`], and fans the results out to per-client pipes that drain
//! through `lumen-transport`.
//!
//! The collaborators this crate does not implement are trait seams:
//! the device ([`device::GfxDevice`]), the surface compositor
//! ([`canvas::CanvasHost`]), the main channel ([`display::MainChannel`])
//! and the video codec backends ([`encoder::VideoEncoderFactory`]).

pub mod canvas;
pub mod client;
pub mod compress;
pub mod config;
pub mod device;
pub mod display;
pub mod encoder;
pub mod migrate;
pub mod msgc;
pub mod pipe;
pub mod send;
pub mod stream;
pub mod worker;

pub use canvas::{CanvasHost, SurfaceSnapshot};
pub use client::{ClientCaps, ClientError, DisplayChannelClient, FreeList};
pub use compress::{compression_for_bitmap, MIN_DIMENSION_TO_QUIC, MIN_SIZE_TO_COMPRESS};
pub use config::{
    DisplayConfig, ImageCompression, StreamVideoMode, VideoCodecKind, WanCompression,
};
pub use device::{CommandKind, CommandQueue, DeviceInitInfo, GfxCommand, GfxDevice};
pub use display::{ClientId, DisplayState, MainChannel, Surface};
pub use encoder::{
    EncodeAction, EncoderStats, FrameRef, RateContext, StreamReport, VideoEncoder,
    VideoEncoderFactory,
};
pub use migrate::{MigrationData, SurfacesAtClient};
pub use msgc::{parse_client_message, ClientMessage, DisplayInit};
pub use pipe::{DrawableId, PipeItem};
pub use stream::{CopyGraduality, StreamAgent, NUM_STREAMS};
pub use worker::{DisplayWorker, WorkerError, COMMON_CLIENT_TIMEOUT};
