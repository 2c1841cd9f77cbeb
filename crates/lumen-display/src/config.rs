//! Display channel configuration.

use tracing::warn;

/// Client-visible image compression algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ImageCompression {
    Off = 1,
    AutoGlz = 2,
    AutoLz = 3,
    Quic = 4,
    Glz = 5,
    Lz = 6,
    Lz4 = 7,
}

impl ImageCompression {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => Self::Off,
            2 => Self::AutoGlz,
            3 => Self::AutoLz,
            4 => Self::Quic,
            5 => Self::Glz,
            6 => Self::Lz,
            7 => Self::Lz4,
            _ => return None,
        })
    }
}

/// Lossy/wrapped compression policy for WAN links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WanCompression {
    Auto,
    Always,
    Never,
}

/// How aggressively drawable sequences are promoted to video streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamVideoMode {
    Off,
    /// Every eligible sequence streams.
    All,
    /// Only sequences whose content samples as video-like.
    Filter,
}

/// Video codecs the server knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VideoCodecKind {
    Mjpeg = 1,
    Vp8 = 2,
    H264 = 3,
    Vp9 = 4,
    H265 = 5,
}

/// Number of distinct codec kinds, for preference-index arrays.
pub const VIDEO_CODEC_KIND_COUNT: usize = 5;

impl VideoCodecKind {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => Self::Mjpeg,
            2 => Self::Vp8,
            3 => Self::H264,
            4 => Self::Vp9,
            5 => Self::H265,
            _ => return None,
        })
    }

    pub fn index(self) -> usize {
        self as usize - 1
    }
}

/// Environment override for the initial stream bit rate, in Mbps.
pub const STREAM_BIT_RATE_ENV: &str = "LUMEN_STREAM_BIT_RATE";

#[derive(Debug, Clone)]
pub struct DisplayConfig {
    pub image_compression: ImageCompression,
    pub jpeg_state: WanCompression,
    pub zlib_glz_state: WanCompression,
    pub stream_video: StreamVideoMode,
    /// Initial stream bit rate override, bits per second.
    pub stream_bit_rate_override: Option<u64>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            image_compression: ImageCompression::AutoGlz,
            jpeg_state: WanCompression::Auto,
            zlib_glz_state: WanCompression::Auto,
            stream_video: StreamVideoMode::Filter,
            stream_bit_rate_override: None,
        }
    }
}

impl DisplayConfig {
    /// Defaults plus whatever the environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(STREAM_BIT_RATE_ENV) {
            match raw.parse::<f64>() {
                Ok(mbps) if mbps > 0.0 => {
                    config.stream_bit_rate_override = Some((mbps * 1024.0 * 1024.0) as u64);
                }
                _ => warn!(%raw, "ignoring unparsable {STREAM_BIT_RATE_ENV}"),
            }
        }
        config
    }
}
