//! Transport stack (C3): the boxed I/O object stream negotiation runs over,
//! plus the TLS and stream-compression upgrades applied to it.
//!
//! Both upgrades follow the same shape: consume the current `Io`, wrap it,
//! hand back a new boxed `Io`. The caller (C4) is then expected to perform a
//! stream reset on top of the rewrapped object, per the design note that a
//! stream reset is one operation regardless of which layer changed.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::error::{Error, NegotiationError};

/// Blanket marker for anything the stream framer can read and write,
/// letting [`BoxedIo`] erase whether the concrete transport is a raw TCP
/// socket, a TLS stream, or one wrapped in [`DeflateStream`].
pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncReadAndWrite for T {}

/// A type-erased transport: a plain `TcpStream` to start, a TLS stream after
/// STARTTLS, or either wrapped in a [`DeflateStream`] after XEP-0138
/// compression.
pub type BoxedIo = Box<dyn AsyncReadAndWrite>;

/// Per-connection transport state tracked across upgrades, mirroring the
/// data model's `usingTLS` / `usingStreamCompression` invariants: at most one
/// of TLS and TLS-level compression is meaningful at a time, and stream
/// compression, once engaged, is never re-offered.
#[derive(Debug, Clone, Default)]
pub struct StreamState {
    /// STARTTLS has completed successfully.
    pub using_tls: bool,
    /// The TLS certificate chain was verified against trust roots (always
    /// true when `using_tls` is true; kept distinct so an eventual
    /// "connect but don't verify" mode would not silently claim security).
    pub secure_verified: bool,
    /// XEP-0138 `<compress/>` negotiation has completed successfully.
    pub using_stream_compression: bool,
    /// `id` attribute of the most recent `<stream:stream>` open.
    pub connection_id: Option<String>,
    /// Service name as confirmed by the peer's stream open, if it sent one.
    pub negotiated_service_name: Option<String>,
    /// A fatal error or explicit close has occurred; no further writes
    /// should be attempted.
    pub closed: bool,
}

/// Upgrade `io` to TLS, verifying the certificate chain against the platform
/// trust store (native certs, falling back to the Mozilla bundle).
pub async fn upgrade_tls(io: BoxedIo, domain: &str) -> Result<BoxedIo, Error> {
    let mut roots = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            for cert in certs {
                let _ = roots.add(cert);
            }
        }
        Err(_) => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let server_name = ServerName::try_from(domain.to_string())
        .map_err(|e| NegotiationError::TlsHandshakeFailed(e.to_string()))?;

    let tls_stream = connector
        .connect(server_name, io)
        .await
        .map_err(tls_connect_error)?;

    Ok(Box::new(tls_stream))
}

/// Turn a `tokio_rustls` connect failure into the right negotiation error:
/// a certificate that failed verification means the peer isn't who it
/// claims to be, which is `SecurityRequired`, not a generic handshake fault.
fn tls_connect_error(e: io::Error) -> NegotiationError {
    if let Some(rustls_err) = e
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<tokio_rustls::rustls::Error>())
    {
        if matches!(rustls_err, tokio_rustls::rustls::Error::InvalidCertificate(_)) {
            return NegotiationError::SecurityRequired;
        }
    }
    NegotiationError::TlsHandshakeFailed(e.to_string())
}

/// Extract a TLS channel-binding value (`tls-exporter`, RFC 9266) from a
/// just-established TLS connection, for mechanisms that need it.
///
/// No mechanism in scope currently consumes this (SCRAM-*-PLUS is out of
/// scope), so this is wired up but unused; kept so a future `-PLUS`
/// mechanism can be added without touching the transport layer.
pub fn channel_binding_placeholder() -> Option<Vec<u8>> {
    None
}

/// Wrap `io` in a symmetric DEFLATE compressor/decompressor per XEP-0138:
/// `Z_SYNC_FLUSH` after every write, compression level 9, raw (no zlib
/// header) deflate stream.
pub fn upgrade_compression(io: BoxedIo) -> BoxedIo {
    Box::new(DeflateStream::new(io))
}

pin_project! {
    /// Transparent DEFLATE wrapper used for XEP-0138 stream compression.
    /// Reads run inbound bytes through [`Decompress`]; writes run outbound
    /// bytes through [`Compress`] with a sync flush after each write so
    /// partial stanzas still reach the peer promptly.
    struct DeflateStream<Io> {
        #[pin]
        inner: Io,
        compress: Compress,
        decompress: Decompress,
        read_in: Vec<u8>,
        read_in_len: usize,
        write_out: Vec<u8>,
    }
}

const DEFLATE_CHUNK: usize = 8192;

impl<Io> DeflateStream<Io> {
    fn new(inner: Io) -> Self {
        Self {
            inner,
            compress: Compress::new(Compression::new(9), false),
            decompress: Decompress::new(false),
            read_in: vec![0u8; DEFLATE_CHUNK],
            read_in_len: 0,
            write_out: Vec::with_capacity(DEFLATE_CHUNK),
        }
    }
}

impl<Io: AsyncRead> AsyncRead for DeflateStream<Io> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();
        loop {
            if *this.read_in_len > 0 {
                let before_out = this.decompress.total_out();
                let status = this
                    .decompress
                    .decompress(
                        &this.read_in[..*this.read_in_len],
                        buf.initialize_unfilled(),
                        FlushDecompress::None,
                    )
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                let produced = (this.decompress.total_out() - before_out) as usize;
                let consumed = this.decompress.total_in() as usize;
                buf.advance(produced);
                this.read_in.copy_within(consumed.min(*this.read_in_len).., 0);
                *this.read_in_len -= consumed.min(*this.read_in_len);
                if produced > 0 || status == Status::StreamEnd {
                    return Poll::Ready(Ok(()));
                }
                if *this.read_in_len > 0 {
                    continue;
                }
            }

            let mut raw = ReadBuf::new(this.read_in);
            match this.inner.as_mut().poll_read(cx, &mut raw) {
                Poll::Ready(Ok(())) => {
                    *this.read_in_len = raw.filled().len();
                    if *this.read_in_len == 0 {
                        return Poll::Ready(Ok(()));
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<Io: AsyncWrite> AsyncWrite for DeflateStream<Io> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.project();
        this.write_out.clear();
        this.write_out.resize(buf.len() + DEFLATE_CHUNK, 0);
        let before_out = this.compress.total_out();
        this.compress
            .compress(buf, this.write_out, FlushCompress::Sync)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let produced = (this.compress.total_out() - before_out) as usize;
        this.write_out.truncate(produced);
        let mut written = 0;
        while written < this.write_out.len() {
            match this
                .inner
                .as_mut()
                .poll_write(cx, &this.write_out[written..])
            {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::from(io::ErrorKind::WriteZero)))
                }
                Poll::Ready(Ok(n)) => written += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stream_state_is_all_clear() {
        let state = StreamState::default();
        assert!(!state.using_tls);
        assert!(!state.using_stream_compression);
        assert!(!state.closed);
    }

    #[test]
    fn certificate_failure_maps_to_security_required() {
        let rustls_err = tokio_rustls::rustls::Error::InvalidCertificate(
            tokio_rustls::rustls::CertificateError::Expired,
        );
        let io_err = io::Error::new(io::ErrorKind::InvalidData, rustls_err);
        assert!(matches!(
            tls_connect_error(io_err),
            NegotiationError::SecurityRequired
        ));
    }

    #[test]
    fn other_handshake_errors_stay_generic() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "peer hung up");
        assert!(matches!(
            tls_connect_error(io_err),
            NegotiationError::TlsHandshakeFailed(_)
        ));
    }
}
