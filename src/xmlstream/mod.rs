//! Stream framer (C2): writes the stream open/close envelope and runs an
//! incremental XML pull over a byte stream, emitting one top-level child
//! element at a time.
//!
//! A stream reset (after TLS, after compression, after SASL success) is one
//! operation regardless of whether the underlying byte stream changed: call
//! [`XmlStream::into_inner`] to recover the `Io` (possibly re-wrapping it in
//! TLS or deflate) and [`XmlStream::open`] again, or call
//! [`XmlStream::reset`] directly when the byte stream itself is unchanged.

use std::io;
use std::pin::Pin;

use futures::StreamExt;
use minidom::Element;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{self, ProtocolError};

/// `jabber:client` default namespace used on client streams.
pub const CLIENT_NS: &str = "jabber:client";
/// `http://etherx.jabber.org/streams` namespace of the `<stream:stream>` envelope.
pub const STREAM_NS: &str = "http://etherx.jabber.org/streams";

/// Error produced while advancing the incremental reader or writing to the
/// stream.
#[derive(Debug)]
pub enum ReadError {
    /// Underlying I/O failure; generally fatal.
    Io(io::Error),
    /// The XML itself, or the stream-level framing, was malformed.
    Parse(ProtocolError),
    /// End-of-document or the outer `</stream:stream>` end-tag was reached.
    StreamTerminated,
}

impl From<io::Error> for ReadError {
    fn from(e: io::Error) -> Self {
        ReadError::Io(e)
    }
}

impl From<ProtocolError> for ReadError {
    fn from(e: ProtocolError) -> Self {
        ReadError::Parse(e)
    }
}

/// Parse a stream `version` attribute into the `100*major + minor` integer
/// form used to detect legacy (pre-XMPP, pre-1.0) servers.
///
/// A missing attribute parses as `90` (i.e. below `100`, so it is treated as
/// legacy). Any non-numeric component is a [`ProtocolError::BadVersion`].
pub fn parse_stream_version(version: Option<&str>) -> Result<u32, ProtocolError> {
    let version = match version {
        None => return Ok(90),
        Some(v) => v,
    };
    let mut parts = version.splitn(2, '.');
    let major = parts.next().unwrap_or("");
    let minor = parts.next().unwrap_or("0");
    let bad = || ProtocolError::BadVersion(version.to_string());
    let major: u32 = major.parse().map_err(|_| bad())?;
    let minor: u32 = minor.parse().map_err(|_| bad())?;
    if major > 99 || minor > 99 {
        return Err(bad());
    }
    Ok(major * 100 + minor)
}

fn attr_value<'a>(attrs: &'a rxml::AttrMap, local_name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(name, _)| name.1.as_ref() == local_name)
        .map(|(_, value)| value.as_ref())
}

/// Depth-tracked element accumulation shared by [`XmlStream::next_element`]
/// and the steady-state background reader in `connection.rs`, which reads
/// directly off a split read half instead of a whole [`XmlStream`].
pub(crate) async fn pull_element<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut rxml::AsyncReader<R>,
    stack: &mut Vec<Element>,
) -> Result<Element, ReadError> {
    loop {
        match reader.next().await {
            None => return Err(ReadError::StreamTerminated),
            Some(Err(e)) => return Err(ReadError::Io(e)),
            Some(Ok(rxml::Event::XmlDeclaration(_, _))) => continue,
            Some(Ok(rxml::Event::StartElement(_, (ns, name), attrs))) => {
                let mut builder = Element::builder(name.as_ref(), ns.as_ref());
                for (qname, value) in attrs.iter() {
                    builder = builder.attr(qname.1.as_ref(), value.as_ref());
                }
                stack.push(builder.build());
            }
            Some(Ok(rxml::Event::Text(_, cdata))) => {
                if let Some(top) = stack.last_mut() {
                    top.append_text_node(cdata.as_ref());
                }
                // Whitespace between top-level stanzas: no element open, skip.
            }
            Some(Ok(rxml::Event::EndElement(_))) => {
                let finished = match stack.pop() {
                    Some(el) => el,
                    None => return Err(ReadError::StreamTerminated),
                };
                if stack.is_empty() {
                    return Ok(finished);
                }
                stack.last_mut().unwrap().append_child(finished);
            }
        }
    }
}

/// An incremental XML stream framer over an async byte stream.
pub struct XmlStream<Io> {
    reader: rxml::AsyncReader<BufReader<Io>>,
    stack: Vec<Element>,
    connection_id: Option<String>,
    negotiated_service_name: String,
    /// Set in [`Self::open`] when the peer's stream open was pre-1.0 or
    /// carried no version attribute; the next call to [`Self::next_element`]
    /// returns a synthetic empty `<features/>` instead of reading from the
    /// wire, so upper layers can uniformly assume features exist.
    pending_legacy_features: bool,
}

impl<Io: AsyncRead + AsyncWrite + Unpin> XmlStream<Io> {
    /// Open a stream: send the `<stream:stream>` header and read the peer's
    /// reply header, latching `connectionId` from its `id` attribute.
    pub async fn open(io: Io, service_name: &str) -> Result<Self, ReadError> {
        let mut this = Self {
            reader: rxml::AsyncReader::wrap(BufReader::new(io), rxml::Parser::default()),
            stack: Vec::new(),
            connection_id: None,
            negotiated_service_name: service_name.to_string(),
            pending_legacy_features: false,
        };
        this.send_stream_header(service_name).await?;
        this.recv_stream_header().await?;
        Ok(this)
    }

    async fn send_stream_header(&mut self, service_name: &str) -> Result<(), ReadError> {
        let xml = format!(
            "<?xml version='1.0'?><stream:stream to=\"{}\" xmlns=\"jabber:client\" xmlns:stream=\"http://etherx.jabber.org/streams\" version=\"1.0\">",
            escape(service_name),
        );
        self.write_raw(xml.as_bytes()).await
    }

    async fn recv_stream_header(&mut self) -> Result<(), ReadError> {
        loop {
            match self.reader.next().await {
                Some(Ok(rxml::Event::XmlDeclaration(_, _))) => continue,
                Some(Ok(rxml::Event::StartElement(_, (_ns, _name), attrs))) => {
                    self.connection_id = attr_value(&attrs, "id").map(str::to_string);
                    if let Some(from) = attr_value(&attrs, "from") {
                        self.negotiated_service_name = from.to_string();
                    }
                    let version = parse_stream_version(attr_value(&attrs, "version"))?;
                    self.pending_legacy_features = version < 100;
                    return Ok(());
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ReadError::Io(e)),
                None => return Err(ReadError::StreamTerminated),
            }
        }
    }

    /// Advance the parser and return the next top-level child element
    /// (depth-2: a stanza or a protocol-level nonza such as `<features/>`).
    /// White-space text between stanzas is skipped.
    pub async fn next_element(&mut self) -> Result<Element, ReadError> {
        if self.pending_legacy_features {
            self.pending_legacy_features = false;
            return Ok(Element::builder("features", STREAM_NS).build());
        }
        pull_element(&mut self.reader, &mut self.stack).await
    }

    /// Write a stanza or nonza as the next top-level element.
    pub async fn send_element(&mut self, el: &Element) -> Result<(), ReadError> {
        let mut buf = Vec::new();
        el.write_to(&mut buf)
            .map_err(|e| ReadError::Parse(ProtocolError::Parser(error::io::ParserCause(e.to_string()))))?;
        self.write_raw(&buf).await
    }

    /// Write raw bytes directly (stream open/close literals, the keepalive
    /// whitespace byte).
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ReadError> {
        self.write_raw(bytes).await
    }

    /// Write the literal `</stream:stream>` closing tag.
    pub async fn send_stream_footer(&mut self) -> Result<(), ReadError> {
        self.write_raw(b"</stream:stream>").await
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), ReadError> {
        let writer: &mut BufReader<Io> = Pin::new(&mut self.reader).inner_pinned().get_mut();
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Reset the parser and writer state over the *same* byte stream (the
    /// SASL-level reset case).
    pub async fn reset(self, service_name: &str) -> Result<Self, ReadError> {
        let io = self.into_inner();
        Self::open(io, service_name).await
    }

    /// Discard all XML state and return the inner I/O object, e.g. to wrap
    /// it in TLS or deflate before opening a fresh stream on top (the
    /// transport-level reset case).
    pub fn into_inner(self) -> Io {
        self.reader.into_inner().into_inner()
    }

    /// Split into an independent read half (wrapped in a fresh parser of the
    /// same kind `next_element` uses) and write half, for the steady-state
    /// handoff to a dedicated background reader task plus a shared writer.
    /// Always called between top-level elements (negotiation and SASL never
    /// leave a partially-read element behind), so starting the new parser at
    /// depth zero is safe.
    pub fn into_split(
        self,
    ) -> (
        rxml::AsyncReader<BufReader<tokio::io::ReadHalf<Io>>>,
        tokio::io::WriteHalf<Io>,
    ) {
        let io = self.into_inner();
        let (read_half, write_half) = tokio::io::split(io);
        (
            rxml::AsyncReader::wrap(BufReader::new(read_half), rxml::Parser::default()),
            write_half,
        )
    }

    /// The `id` attribute of the first `<stream:stream>` open received.
    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    /// The service name negotiated via the stream open (the `from`
    /// attribute if the peer sent one, else the name we requested).
    pub fn negotiated_service_name(&self) -> &str {
        &self.negotiated_service_name
    }
}

fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            o => out.push(o),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_round_trip() {
        assert_eq!(parse_stream_version(Some("1.0")).unwrap(), 100);
        assert_eq!(parse_stream_version(Some("0.9")).unwrap(), 9);
        assert_eq!(parse_stream_version(Some("2.5")).unwrap(), 205);
        assert_eq!(parse_stream_version(None).unwrap(), 90);
    }

    #[test]
    fn version_rejects_non_numeric() {
        assert!(parse_stream_version(Some("abc")).is_err());
        assert!(parse_stream_version(Some("1.x")).is_err());
    }

    #[tokio::test]
    async fn open_reads_peer_stream_header_and_connection_id() {
        let (client, mut server) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut buf = vec![0u8; 4096];
            let n = server.read(&mut buf).await.unwrap();
            assert!(String::from_utf8_lossy(&buf[..n]).contains("stream:stream"));
            server
                .write_all(br#"<?xml version='1.0'?><stream:stream xmlns:stream="http://etherx.jabber.org/streams" xmlns="jabber:client" id="abc123" version="1.0">"#)
                .await
                .unwrap();
            server
        });
        let stream = XmlStream::open(client, "example.com").await.unwrap();
        assert_eq!(stream.connection_id(), Some("abc123"));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn legacy_stream_synthesizes_features() {
        let (client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut buf = vec![0u8; 4096];
            let _ = server.read(&mut buf).await.unwrap();
            server
                .write_all(br#"<stream:stream xmlns:stream="http://etherx.jabber.org/streams" xmlns="jabber:client" id="legacy">"#)
                .await
                .unwrap();
        });
        let mut stream = XmlStream::open(client, "example.com").await.unwrap();
        let features = stream.next_element().await.unwrap();
        assert_eq!(features.name(), "features");
        assert_eq!(features.ns(), STREAM_NS);
    }
}
