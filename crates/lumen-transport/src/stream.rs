//! The layered transport stream.

use std::io::{self, IoSlice};

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::prefixed::PrefixedStream;
use crate::sasl::{
    SaslCodec, SaslOutcome, SaslStep, SaslVerifier, SASL_DATA_MAX_LEN, SASL_MAX_MECHNAME_LEN,
    SASL_MIN_SSF_WITHOUT_TLS,
};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),

    #[error("tls handshake failed: {0}")]
    TlsHandshake(#[source] io::Error),

    #[error("websocket failure: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("peer closed the connection during negotiation")]
    UnexpectedClose,

    #[error("operation not valid for the current transport layer")]
    LayerMismatch,

    #[error("sasl mechanism name length {len} out of range")]
    SaslBadMechname { len: u32 },

    #[error("sasl payload of {len} bytes exceeds the cap")]
    SaslTooMuchData { len: u32 },

    #[error("client chose unavailable sasl mechanism {mech:?}")]
    SaslUnknownMechanism { mech: String },

    #[error("sasl authentication failed")]
    SaslFailed,

    #[error("negotiated ssf {ssf} is too weak")]
    SaslWeakSsf { ssf: u32 },
}

pub type TransportResult<T> = Result<T, TransportError>;

/// TCP or TLS-over-TCP; the byte layer under everything else.
#[derive(Debug)]
enum RawStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl RawStream {
    fn is_tls(&self) -> bool {
        matches!(self, RawStream::Tls(_))
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            RawStream::Plain(s) => s,
            RawStream::Tls(s) => s.get_ref().0,
        }
    }
}

impl AsyncRead for RawStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        match self.get_mut() {
            RawStream::Plain(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            RawStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RawStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        match self.get_mut() {
            RawStream::Plain(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            RawStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        match self.get_mut() {
            RawStream::Plain(s) => std::pin::Pin::new(s).poll_flush(cx),
            RawStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        match self.get_mut() {
            RawStream::Plain(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            RawStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }

    fn poll_write_vectored(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> std::task::Poll<io::Result<usize>> {
        match self.get_mut() {
            RawStream::Plain(s) => std::pin::Pin::new(s).poll_write_vectored(cx, bufs),
            RawStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            RawStream::Plain(s) => s.is_write_vectored(),
            RawStream::Tls(s) => s.is_write_vectored(),
        }
    }
}

enum Layer {
    Raw(PrefixedStream<RawStream>),
    WebSocket(Box<WebSocketStream<PrefixedStream<RawStream>>>),
    /// Transient state while a layer upgrade is in flight.
    Detached,
}

struct SaslSsf {
    codec: Box<dyn SaslCodec>,
    inbuf: BytesMut,
}

/// A client connection with its active transport layers.
pub struct TransportStream {
    layer: Layer,
    sasl: Option<SaslSsf>,
    corked: bool,
    cork_buf: Vec<u8>,
    ws_rx: BytesMut,
}

impl TransportStream {
    pub fn new(tcp: TcpStream) -> Self {
        Self {
            layer: Layer::Raw(PrefixedStream::new(Bytes::new(), RawStream::Plain(tcp))),
            sasl: None,
            corked: false,
            cork_buf: Vec::new(),
            ws_rx: BytesMut::new(),
        }
    }

    pub fn is_tls(&self) -> bool {
        match &self.layer {
            Layer::Raw(s) => s.get_ref().is_tls(),
            Layer::WebSocket(ws) => ws.get_ref().get_ref().is_tls(),
            Layer::Detached => false,
        }
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self.layer, Layer::WebSocket(_))
    }

    pub fn has_privacy_layer(&self) -> bool {
        self.sasl.is_some()
    }

    /// Vectored writes are only worthwhile on the plain byte layer; TLS
    /// records, SASL frames and WebSocket messages all serialize.
    pub fn supports_writev(&self) -> bool {
        matches!(&self.layer, Layer::Raw(_)) && self.sasl.is_none()
    }

    pub fn set_no_delay(&self, no_delay: bool) -> TransportResult<()> {
        let tcp = match &self.layer {
            Layer::Raw(s) => s.get_ref().tcp(),
            Layer::WebSocket(ws) => ws.get_ref().get_ref().tcp(),
            Layer::Detached => return Err(TransportError::LayerMismatch),
        };
        tcp.set_nodelay(no_delay)?;
        Ok(())
    }

    /// Runs the rustls server handshake over the plain socket. Must be
    /// the first layering step; a handshake failure leaves the stream
    /// unusable, matching the disconnect-on-error policy.
    pub async fn enable_tls(&mut self, acceptor: &TlsAcceptor) -> TransportResult<()> {
        match std::mem::replace(&mut self.layer, Layer::Detached) {
            Layer::Raw(prefixed) => {
                let (prefix, raw) = prefixed.into_inner();
                match raw {
                    RawStream::Plain(tcp) if prefix.is_empty() => {
                        let tls = acceptor
                            .accept(tcp)
                            .await
                            .map_err(TransportError::TlsHandshake)?;
                        self.layer = Layer::Raw(PrefixedStream::new(
                            Bytes::new(),
                            RawStream::Tls(Box::new(tls)),
                        ));
                        Ok(())
                    }
                    raw => {
                        self.layer = Layer::Raw(PrefixedStream::new(prefix, raw));
                        Err(TransportError::LayerMismatch)
                    }
                }
            }
            other => {
                self.layer = other;
                Err(TransportError::LayerMismatch)
            }
        }
    }

    /// Sniffs the first bytes of the stream; a WebSocket client opens
    /// with an HTTP upgrade request. On detection the handshake is
    /// performed and all further I/O is framed; otherwise the sniffed
    /// bytes are replayed to the next reader.
    pub async fn detect_websocket(&mut self) -> TransportResult<bool> {
        {
            let Layer::Raw(s) = &mut self.layer else {
                return Err(TransportError::LayerMismatch);
            };
            let mut sniff = [0u8; 4];
            let mut got = 0;
            while got < sniff.len() {
                let n = s.read(&mut sniff[got..]).await?;
                if n == 0 {
                    break;
                }
                got += n;
            }
            let is_ws = &sniff[..got] == b"GET ";

            let Layer::Raw(prefixed) = std::mem::replace(&mut self.layer, Layer::Detached) else {
                unreachable!("layer checked above");
            };
            let (rest, raw) = prefixed.into_inner();
            let mut replay = BytesMut::with_capacity(got + rest.len());
            replay.extend_from_slice(&sniff[..got]);
            replay.extend_from_slice(&rest);
            let prefixed = PrefixedStream::new(replay.freeze(), raw);

            if !is_ws {
                self.layer = Layer::Raw(prefixed);
                return Ok(false);
            }
            debug!("websocket preamble detected");
            let ws = tokio_tungstenite::accept_async(prefixed).await?;
            self.layer = Layer::WebSocket(Box::new(ws));
        }
        Ok(true)
    }

    async fn layer_read(&mut self, buf: &mut [u8]) -> TransportResult<usize> {
        match &mut self.layer {
            Layer::Raw(s) => Ok(s.read(buf).await?),
            Layer::WebSocket(ws) => {
                while self.ws_rx.is_empty() {
                    match ws.next().await {
                        None => return Ok(0),
                        Some(msg) => match msg? {
                            Message::Binary(data) => self.ws_rx.extend_from_slice(&data),
                            Message::Text(text) => self.ws_rx.extend_from_slice(text.as_bytes()),
                            Message::Close(_) => return Ok(0),
                            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                        },
                    }
                }
                let n = buf.len().min(self.ws_rx.len());
                buf[..n].copy_from_slice(&self.ws_rx.split_to(n));
                Ok(n)
            }
            Layer::Detached => Err(TransportError::LayerMismatch),
        }
    }

    async fn sasl_read(&mut self, buf: &mut [u8]) -> TransportResult<usize> {
        loop {
            if let Some(sasl) = &mut self.sasl {
                if !sasl.inbuf.is_empty() {
                    let n = buf.len().min(sasl.inbuf.len());
                    buf[..n].copy_from_slice(&sasl.inbuf.split_to(n));
                    return Ok(n);
                }
            }
            let mut wire = [0u8; 4096];
            let n = self.layer_read(&mut wire).await?;
            if n == 0 {
                return Ok(0);
            }
            let sasl = self.sasl.as_mut().expect("sasl layer active");
            let decoded = sasl.codec.decode(&wire[..n])?;
            sasl.inbuf.extend_from_slice(&decoded);
        }
    }

    /// Reads up to `buf.len()` bytes; 0 means the peer closed.
    pub async fn read(&mut self, buf: &mut [u8]) -> TransportResult<usize> {
        if self.sasl.is_some() {
            self.sasl_read(buf).await
        } else {
            self.layer_read(buf).await
        }
    }

    /// The one-shot async read: completes when `buf` is full, errors if
    /// the peer closes first. Callers bound it with a timeout where the
    /// protocol requires one.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> TransportResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(TransportError::UnexpectedClose);
            }
            filled += n;
        }
        Ok(())
    }

    async fn write_now(&mut self, buf: &[u8]) -> TransportResult<()> {
        let encoded;
        let out: &[u8] = match &mut self.sasl {
            Some(sasl) => {
                encoded = sasl.codec.encode(buf);
                &encoded
            }
            None => buf,
        };
        match &mut self.layer {
            Layer::Raw(s) => {
                s.write_all(out).await?;
                Ok(())
            }
            Layer::WebSocket(ws) => {
                ws.send(Message::Binary(out.to_vec())).await?;
                Ok(())
            }
            Layer::Detached => Err(TransportError::LayerMismatch),
        }
    }

    /// Writes the whole buffer, buffering instead while corked.
    pub async fn write_all(&mut self, buf: &[u8]) -> TransportResult<()> {
        if self.corked {
            self.cork_buf.extend_from_slice(buf);
            return Ok(());
        }
        self.write_now(buf).await
    }

    /// Vectored write; degrades to sequential writes on layers that
    /// cannot preserve the scatter list.
    pub async fn writev(&mut self, slices: &[&[u8]]) -> TransportResult<()> {
        if self.corked {
            for s in slices {
                self.cork_buf.extend_from_slice(s);
            }
            return Ok(());
        }
        if !self.supports_writev() || slices.len() == 1 {
            for s in slices {
                self.write_now(s).await?;
            }
            return Ok(());
        }

        let Layer::Raw(raw) = &mut self.layer else {
            return Err(TransportError::LayerMismatch);
        };
        let total: usize = slices.iter().map(|s| s.len()).sum();
        let mut written = 0usize;
        while written < total {
            // Rebuild the scatter list past what has been consumed.
            let mut skip = written;
            let mut iov: Vec<IoSlice<'_>> = Vec::with_capacity(slices.len());
            for s in slices {
                if skip >= s.len() {
                    skip -= s.len();
                    continue;
                }
                iov.push(IoSlice::new(&s[skip..]));
                skip = 0;
            }
            let n = raw.write_vectored(&iov).await?;
            if n == 0 {
                return Err(TransportError::UnexpectedClose);
            }
            written += n;
        }
        Ok(())
    }

    /// Disabling auto-flush corks the stream: writes coalesce until
    /// [`TransportStream::flush`]. Re-enabling pushes anything pending.
    pub async fn set_auto_flush(&mut self, auto_flush: bool) -> TransportResult<()> {
        if self.corked == !auto_flush {
            return Ok(());
        }
        self.corked = !auto_flush;
        if auto_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Pushes buffered bytes out; under cork this is the only way
    /// anything reaches the wire.
    pub async fn flush(&mut self) -> TransportResult<()> {
        let pending = std::mem::take(&mut self.cork_buf);
        if !pending.is_empty() {
            self.write_now(&pending).await?;
        }
        match &mut self.layer {
            Layer::Raw(s) => s.flush().await?,
            Layer::WebSocket(ws) => ws.flush().await?,
            Layer::Detached => return Err(TransportError::LayerMismatch),
        }
        Ok(())
    }

    async fn read_u32_le(&mut self) -> TransportResult<u32> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b).await?;
        Ok(u32::from_le_bytes(b))
    }

    async fn write_u32_le(&mut self, v: u32) -> TransportResult<()> {
        self.write_all(&v.to_le_bytes()).await
    }

    /// Runs the server side of the SASL negotiation.
    ///
    /// Wire shape: mechanism-list length and list, then the client's
    /// mechanism name, then length-framed steps while the mechanism
    /// continues. Over bare TCP an SSF of at least 56 is required and the
    /// returned codec becomes a privacy layer for all further traffic.
    pub async fn start_sasl(
        &mut self,
        verifier: &mut dyn SaslVerifier,
    ) -> TransportResult<SaslOutcome> {
        let mechlist = verifier.mechanisms().to_owned();
        self.write_u32_le(mechlist.len() as u32).await?;
        self.write_all(mechlist.as_bytes()).await?;
        self.flush().await?;

        let len = self.read_u32_le().await?;
        if len < 1 || len > SASL_MAX_MECHNAME_LEN {
            warn!(len, "bad sasl mechanism name length");
            return Err(TransportError::SaslBadMechname { len });
        }
        let mut name = vec![0u8; len as usize];
        self.read_exact(&mut name).await?;
        let mech = String::from_utf8(name)
            .map_err(|_| TransportError::SaslUnknownMechanism { mech: String::new() })?;
        if mech.contains(',') || !mechlist.split(',').any(|m| m == mech) {
            warn!(mechanism = %mech, "client chose unavailable sasl mechanism");
            return Err(TransportError::SaslUnknownMechanism { mech });
        }
        debug!(mechanism = %mech, "sasl mechanism validated");

        let mut first = true;
        loop {
            let datalen = self.read_u32_le().await?;
            if datalen > SASL_DATA_MAX_LEN {
                warn!(datalen, "too much sasl data");
                return Err(TransportError::SaslTooMuchData { len: datalen });
            }
            let mut data = vec![0u8; datalen as usize];
            self.read_exact(&mut data).await?;
            // The wire includes a trailing NUL; the distinction between
            // absent and empty data is significant to mechanisms.
            let step_data = if datalen > 0 {
                Some(&data[..data.len() - 1])
            } else {
                None
            };

            let step = if first {
                verifier.start(&mech, step_data)
            } else {
                verifier.step(step_data)
            };
            first = false;

            let (out, done) = match step {
                SaslStep::Continue(out) => (out, false),
                SaslStep::Done(out) => (out, true),
                SaslStep::Failed => {
                    warn!("sasl step failed");
                    return Err(TransportError::SaslFailed);
                }
            };
            if out.len() as u32 > SASL_DATA_MAX_LEN {
                return Err(TransportError::SaslTooMuchData {
                    len: out.len() as u32,
                });
            }
            if out.is_empty() {
                self.write_u32_le(0).await?;
            } else {
                self.write_u32_le(out.len() as u32 + 1).await?;
                self.write_all(&out).await?;
                self.write_all(&[0]).await?;
            }
            self.write_all(&[u8::from(done)]).await?;
            self.flush().await?;

            if !done {
                continue;
            }

            let ssf = verifier.negotiated_ssf();
            let need_ssf = !self.is_tls();
            if need_ssf && ssf < SASL_MIN_SSF_WITHOUT_TLS {
                warn!(ssf, "authentication rejected for weak ssf");
                self.write_u32_le(1).await?;
                let msg = b"Authentication failed";
                self.write_u32_le(msg.len() as u32 + 1).await?;
                self.write_all(msg).await?;
                self.write_all(&[0]).await?;
                self.flush().await?;
                return Err(TransportError::SaslWeakSsf { ssf });
            }

            // Accept; SSF-encoded traffic starts after this word.
            self.write_u32_le(0).await?;
            self.flush().await?;

            let privacy = need_ssf && ssf > 0;
            if privacy {
                let codec = verifier.take_codec().ok_or(TransportError::SaslFailed)?;
                self.sasl = Some(SaslSsf {
                    codec,
                    inbuf: BytesMut::new(),
                });
            }
            debug!(ssf, privacy, "sasl negotiation complete");
            return Ok(SaslOutcome {
                ssf,
                privacy_layer: privacy,
            });
        }
    }
}
