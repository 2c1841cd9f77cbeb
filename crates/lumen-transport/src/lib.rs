#![forbid(unsafe_code)]

//! Byte-oriented client transport for the lumen display server.
//!
//! A [`TransportStream`] starts as a plain TCP connection and can be
//! layered while it lives:
//!
//! - TLS through a rustls server handshake,
//! - WebSocket framing, auto-detected by sniffing the first bytes of the
//!   incoming stream,
//! - a SASL SSF privacy layer negotiated by the wire FSM in [`sasl`].
//!
//! Reads are async and never block the worker; writes support vectored
//! submission where the active layer allows it and fall back to
//! sequential writes where it does not (TLS records, SASL frames,
//! WebSocket messages). Cork mode coalesces writes until `flush`.

mod prefixed;
pub mod sasl;
mod stream;

pub use prefixed::PrefixedStream;
pub use sasl::{SaslCodec, SaslOutcome, SaslStep, SaslVerifier, SASL_DATA_MAX_LEN, SASL_MAX_MECHNAME_LEN};
pub use stream::{TransportError, TransportResult, TransportStream};
