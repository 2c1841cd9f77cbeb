//! Client-to-server display messages.

use lumen_gfx::wire::Reader;
use thiserror::Error;
use tracing::debug;

use crate::encoder::StreamReport;

/// Wire ids of client-to-server messages.
pub mod msgc {
    pub const INIT: u16 = 101;
    pub const STREAM_REPORT: u16 = 102;
    pub const PREFERRED_COMPRESSION: u16 = 103;
    pub const PREFERRED_VIDEO_CODEC_TYPE: u16 = 104;
    pub const GL_DRAW_DONE: u16 = 105;
}

/// Fixed size of the client message header: `{ type: u16, size: u32 }`.
pub const CLIENT_HEADER_SIZE: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientMessageError {
    #[error("client message {kind} truncated")]
    Truncated { kind: u16 },

    #[error("unknown client message type {kind}")]
    UnknownType { kind: u16 },

    #[error("client message {kind} carries no payload items")]
    Empty { kind: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayInit {
    pub pixmap_cache_id: u8,
    pub pixmap_cache_size: i64,
    pub glz_dict_id: u8,
    pub glz_dict_window: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Init(DisplayInit),
    StreamReport(StreamReport),
    PreferredCompression(u8),
    /// Codec kinds in client preference order, raw wire values.
    PreferredVideoCodecs(Vec<u8>),
    GlDrawDone,
}

/// Parses one client message body.
pub fn parse_client_message(kind: u16, body: &[u8]) -> Result<ClientMessage, ClientMessageError> {
    let mut r = Reader::new(body);
    let truncated = |_| ClientMessageError::Truncated { kind };
    match kind {
        msgc::INIT => Ok(ClientMessage::Init(DisplayInit {
            pixmap_cache_id: r.u8().map_err(truncated)?,
            pixmap_cache_size: r.u64().map_err(truncated)? as i64,
            glz_dict_id: r.u8().map_err(truncated)?,
            glz_dict_window: r.i32().map_err(truncated)?,
        })),
        msgc::STREAM_REPORT => Ok(ClientMessage::StreamReport(StreamReport {
            stream_id: r.u32().map_err(truncated)?,
            unique_id: r.u32().map_err(truncated)?,
            start_frame_mm_time: r.u32().map_err(truncated)?,
            end_frame_mm_time: r.u32().map_err(truncated)?,
            num_frames: r.u32().map_err(truncated)?,
            num_drops: r.u32().map_err(truncated)?,
            last_frame_delay: r.i32().map_err(truncated)?,
            audio_delay: r.u32().map_err(truncated)?,
        })),
        msgc::PREFERRED_COMPRESSION => {
            Ok(ClientMessage::PreferredCompression(r.u8().map_err(truncated)?))
        }
        msgc::PREFERRED_VIDEO_CODEC_TYPE => {
            let num = r.u8().map_err(truncated)?;
            if num == 0 {
                return Err(ClientMessageError::Empty { kind });
            }
            let mut codecs = Vec::with_capacity(usize::from(num));
            for _ in 0..num {
                codecs.push(r.u8().map_err(truncated)?);
            }
            debug!(?codecs, "client codec preference received");
            Ok(ClientMessage::PreferredVideoCodecs(codecs))
        }
        msgc::GL_DRAW_DONE => Ok(ClientMessage::GlDrawDone),
        other => Err(ClientMessageError::UnknownType { kind: other }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_gfx::wire::Writer;

    #[test]
    fn init_round_trip() {
        let mut w = Writer::new();
        w.u8(3).u64(64 * 1024 * 1024).u8(1).i32(512);
        let msg = parse_client_message(msgc::INIT, &w.into_vec()).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Init(DisplayInit {
                pixmap_cache_id: 3,
                pixmap_cache_size: 64 * 1024 * 1024,
                glz_dict_id: 1,
                glz_dict_window: 512,
            })
        );
    }

    #[test]
    fn stream_report_round_trip() {
        let mut w = Writer::new();
        for v in [9u32, 77, 1000, 2000, 30, 2] {
            w.u32(v);
        }
        w.i32(-5).u32(40);
        let msg = parse_client_message(msgc::STREAM_REPORT, &w.into_vec()).unwrap();
        let ClientMessage::StreamReport(report) = msg else {
            panic!("wrong variant");
        };
        assert_eq!(report.stream_id, 9);
        assert_eq!(report.unique_id, 77);
        assert_eq!(report.num_frames, 30);
        assert_eq!(report.last_frame_delay, -5);
    }

    #[test]
    fn unknown_and_truncated_messages_error() {
        assert!(matches!(
            parse_client_message(9999, &[]),
            Err(ClientMessageError::UnknownType { kind: 9999 })
        ));
        assert!(matches!(
            parse_client_message(msgc::INIT, &[1, 2]),
            Err(ClientMessageError::Truncated { .. })
        ));
        assert!(matches!(
            parse_client_message(msgc::PREFERRED_VIDEO_CODEC_TYPE, &[0]),
            Err(ClientMessageError::Empty { .. })
        ));
    }
}
