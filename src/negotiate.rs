//! Feature negotiator (C4): walks a `<stream:features/>` element and drives
//! STARTTLS and XEP-0138 compression to completion before authentication
//! begins.
//!
//! At most one transport upgrade happens per `<features/>` seen (TLS takes
//! priority over compression when a server offers both in the same
//! element); after an upgrade the stream is reset and the next
//! `<features/>` is read before negotiation continues. Unrecognized child
//! elements of `<features/>` (any a future extension might add) are logged
//! and otherwise ignored rather than treated as an error.

use log::debug;
use minidom::Element;

use crate::config::SecurityMode;
use crate::error::{Error, NegotiationError};
use crate::stanza::{CompressRequest, StartTls, STARTTLS_NS};
use crate::transport::{upgrade_compression, upgrade_tls, BoxedIo, StreamState};
use crate::xmlstream::{ReadError, XmlStream};

const COMPRESS_NS: &str = "http://jabber.org/protocol/compress";
const COMPRESS_FEATURE_NS: &str = "http://jabber.org/features/compress";

fn e_to_proto(e: ReadError) -> crate::error::ProtocolError {
    match e {
        ReadError::Parse(p) => p,
        ReadError::StreamTerminated => crate::error::ProtocolError::StreamTerminated,
        ReadError::Io(io) => crate::error::ProtocolError::Parser(crate::error::io::ParserCause(io.to_string())),
    }
}

async fn read_element(stream: &mut XmlStream<BoxedIo>) -> Result<Element, Error> {
    stream.next_element().await.map_err(|e| Error::from(e_to_proto(e)))
}

async fn send_element(stream: &mut XmlStream<BoxedIo>, el: Element) -> Result<(), Error> {
    stream.send_element(&el).await.map_err(|e| Error::from(e_to_proto(e)))
}

/// Run feature negotiation to completion: loop over `<features/>`,
/// performing at most one upgrade per element and resetting the stream
/// after each, until a `<features/>` remains with nothing left to upgrade.
/// Returns the (possibly reset) stream, the updated transport state, and
/// the final `<features/>` element for the SASL driver to read
/// `<mechanisms/>` from.
pub async fn negotiate(
    mut stream: XmlStream<BoxedIo>,
    mut state: StreamState,
    domain: &str,
    security_mode: SecurityMode,
    compression_enabled: bool,
) -> Result<(XmlStream<BoxedIo>, StreamState, Element), Error> {
    let mut compression_enabled = compression_enabled;
    let mut features = read_element(&mut stream).await?;

    loop {
        if !state.using_tls {
            if let Some(starttls) = features.get_child("starttls", STARTTLS_NS) {
                let required = starttls.get_child("required", STARTTLS_NS).is_some();
                if matches!(security_mode, SecurityMode::Disabled) {
                    if required {
                        return Err(NegotiationError::SecurityForbidden.into());
                    }
                } else {
                    send_element(&mut stream, Element::from(StartTls)).await?;
                    let reply = read_element(&mut stream).await?;
                    if !reply.is("proceed", STARTTLS_NS) {
                        return Err(
                            NegotiationError::TlsHandshakeFailed("server sent <failure/>".into()).into(),
                        );
                    }
                    let io = stream.into_inner();
                    let upgraded = upgrade_tls(io, domain).await?;
                    stream = XmlStream::open(upgraded, domain)
                        .await
                        .map_err(|e| Error::from(e_to_proto(e)))?;
                    state.using_tls = true;
                    state.secure_verified = true;
                    state.connection_id = stream.connection_id().map(str::to_string);
                    features = read_element(&mut stream).await?;
                    continue;
                }
            } else if matches!(security_mode, SecurityMode::Required) {
                return Err(NegotiationError::SecurityRequired.into());
            }
        }

        if compression_enabled && !state.using_stream_compression {
            if let Some(methods) = features.get_child("compression", COMPRESS_FEATURE_NS) {
                let has_zlib = methods
                    .children()
                    .any(|m| m.name() == "method" && m.text() == "zlib");
                if has_zlib {
                    send_element(&mut stream, Element::from(CompressRequest::zlib())).await?;
                    let reply = read_element(&mut stream).await?;
                    if !reply.is("compressed", COMPRESS_NS) {
                        // Recoverable: drop zlib from what we'll offer ourselves
                        // and carry on negotiating the rest of this same
                        // <features/> (SASL doesn't care whether compression
                        // ever happened).
                        debug!("server rejected <compress/>, continuing without it");
                        compression_enabled = false;
                        continue;
                    }
                    let io = stream.into_inner();
                    let upgraded = upgrade_compression(io);
                    stream = XmlStream::open(upgraded, domain)
                        .await
                        .map_err(|e| Error::from(e_to_proto(e)))?;
                    state.using_stream_compression = true;
                    state.connection_id = stream.connection_id().map(str::to_string);
                    features = read_element(&mut stream).await?;
                    continue;
                }
            }
        }

        for child in features.children() {
            if !matches!(
                child.name(),
                "starttls" | "mechanisms" | "compression" | "bind" | "session"
            ) {
                debug!("ignoring unrecognized stream feature <{}>", child.name());
            }
        }

        return Ok((stream, state, features));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityMode;

    #[test]
    fn compress_feature_namespaces_are_distinct() {
        assert_ne!(COMPRESS_NS, COMPRESS_FEATURE_NS);
    }

    #[tokio::test]
    async fn compression_failure_is_recovered_not_fatal() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let _ = server.read(&mut buf).await.unwrap(); // client's stream open
            server
                .write_all(br#"<stream:stream xmlns:stream="http://etherx.jabber.org/streams" xmlns="jabber:client" id="neg1" version="1.0">"#)
                .await
                .unwrap();
            server
                .write_all(
                    format!(
                        r#"<stream:features><compression xmlns="{}"><method>zlib</method></compression><mechanisms xmlns="{}"><mechanism>ANONYMOUS</mechanism></mechanisms></stream:features>"#,
                        COMPRESS_FEATURE_NS, crate::stanza::SASL_NS,
                    )
                    .as_bytes(),
                )
                .await
                .unwrap();
            let n = server.read(&mut buf).await.unwrap(); // client's <compress/> request
            assert!(String::from_utf8_lossy(&buf[..n]).contains("compress"));
            server
                .write_all(format!(r#"<failure xmlns="{}"/>"#, COMPRESS_NS).as_bytes())
                .await
                .unwrap();
        });

        let io: BoxedIo = Box::new(client);
        let stream = XmlStream::open(io, "example.com").await.unwrap();
        let state = StreamState::default();

        let (_stream, state, features) =
            negotiate(stream, state, "example.com", SecurityMode::Disabled, true)
                .await
                .unwrap();

        assert!(!state.using_stream_compression);
        assert!(features.get_child("mechanisms", crate::stanza::SASL_NS).is_some());
    }
}
