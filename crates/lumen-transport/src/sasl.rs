//! SASL negotiation wire machine and SSF layering.
//!
//! The transport implements the framing (mechanism-list length, list,
//! then length-prefixed steps while the mechanism continues) and the SSF
//! policy; the mechanism evaluation itself is injected through
//! [`SaslVerifier`] so the embedder decides which authentication backend
//! to use. After a successful negotiation with a non-zero SSF the
//! returned [`SaslCodec`] encrypts every byte that crosses the socket.

/// Longest mechanism name accepted from the client.
pub const SASL_MAX_MECHNAME_LEN: u32 = 100;

/// Largest single negotiation payload accepted in either direction.
pub const SASL_DATA_MAX_LEN: u32 = 1024 * 1024;

/// Minimum security strength factor when running over bare TCP.
pub const SASL_MIN_SSF_WITHOUT_TLS: u32 = 56;

/// Outcome of one mechanism step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslStep {
    /// More round trips needed; send these bytes to the client.
    Continue(Vec<u8>),
    /// Authentication succeeded; send these final bytes.
    Done(Vec<u8>),
    /// Authentication failed.
    Failed,
}

/// Mechanism backend driven by the transport's negotiation FSM.
pub trait SaslVerifier: Send {
    /// Comma-separated list of mechanisms offered to the client.
    fn mechanisms(&self) -> &str;

    /// First step, carrying the client-selected mechanism.
    fn start(&mut self, mechanism: &str, data: Option<&[u8]>) -> SaslStep;

    /// Subsequent steps.
    fn step(&mut self, data: Option<&[u8]>) -> SaslStep;

    /// Security strength factor negotiated by the mechanism; 0 means no
    /// privacy layer.
    fn negotiated_ssf(&self) -> u32;

    /// Hands out the privacy-layer codec once, after success.
    fn take_codec(&mut self) -> Option<Box<dyn SaslCodec>>;
}

/// Privacy layer installed after a successful negotiation with SSF.
pub trait SaslCodec: Send {
    fn encode(&mut self, plain: &[u8]) -> Vec<u8>;
    fn decode(&mut self, wire: &[u8]) -> std::io::Result<Vec<u8>>;
}

/// Result of a finished negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaslOutcome {
    pub ssf: u32,
    /// Whether an SSF codec now wraps the transport.
    pub privacy_layer: bool,
}
