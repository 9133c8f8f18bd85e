//! Outer facade tying connect-data resolution (C1), the stream framer (C2),
//! the transport stack (C3), feature negotiation (C4), the keepalive writer
//! (C5) and SASL (C6) into a single connect-to-steady-state call.
//!
//! Once connected, reading and writing are fully decoupled: a background
//! task owns the read half and feeds a single-slot mailbox, while
//! application writes and the keepalive tap share the write half behind a
//! lock held only for the duration of one write.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use minidom::Element;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::config::ConnectionConfig;
use crate::connect::{self, ConnectCandidate};
use crate::error::{AuthError, Error, ProtocolError};
use crate::keepalive::{self, ActivityTracker, KeepaliveHandle};
use crate::negotiate;
use crate::sasl;
use crate::stanza::{self, BindRequest, BindResult, SessionRequest, BIND_NS, SESSION_NS};
use crate::transport::{BoxedIo, StreamState};
use crate::xmlstream::{pull_element, ReadError, XmlStream};

/// Fixed wait for the post-auth `<stream:features/>` carrying `<bind/>`;
/// distinct from `config.reply_timeout`, which governs the bind and session
/// IQs themselves.
const BIND_FEATURES_TIMEOUT: Duration = Duration::from_secs(30);

/// Something the background reader task produced: a stanza, or the reason
/// the connection ended.
#[derive(Debug)]
pub enum ReadEvent {
    /// A top-level stanza or nonza arrived.
    Stanza(Element),
    /// The connection ended; no further events will follow.
    Closed(Error),
}

fn e_to_proto(e: ReadError) -> ProtocolError {
    match e {
        ReadError::Parse(p) => p,
        ReadError::StreamTerminated => ProtocolError::StreamTerminated,
        ReadError::Io(io) => ProtocolError::Parser(crate::error::io::ParserCause(io.to_string())),
    }
}

async fn read_element(stream: &mut XmlStream<BoxedIo>) -> Result<Element, Error> {
    stream.next_element().await.map_err(|e| Error::from(e_to_proto(e)))
}

async fn read_element_timeout(stream: &mut XmlStream<BoxedIo>, timeout: Duration) -> Result<Element, Error> {
    tokio::time::timeout(timeout, read_element(stream))
        .await
        .map_err(|_| Error::from(AuthError::AuthTimeout))?
}

async fn send_element(stream: &mut XmlStream<BoxedIo>, el: Element) -> Result<(), Error> {
    stream.send_element(&el).await.map_err(|e| Error::from(e_to_proto(e)))
}

async fn write_element(writer: &mut WriteHalf<BoxedIo>, el: &Element) -> Result<(), Error> {
    let mut buf = Vec::new();
    el.write_to(&mut buf)
        .map_err(|e| Error::from(ProtocolError::Parser(crate::error::io::ParserCause(e.to_string()))))?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// A live, authenticated, resource-bound XMPP stream.
pub struct Connection {
    writer: Arc<Mutex<WriteHalf<BoxedIo>>>,
    inbound: mpsc::Receiver<ReadEvent>,
    state: StreamState,
    bound_jid: jid::Jid,
    activity: ActivityTracker,
    keepalive: KeepaliveHandle,
    reader_task: JoinHandle<()>,
}

impl Connection {
    /// Resolve, connect, negotiate, authenticate and bind a resource,
    /// leaving the connection ready to exchange stanzas.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, Error> {
        let domain = config.service_name().to_string();

        let tcp = dial_any_candidate(&config).await?;
        let io: BoxedIo = Box::new(tcp);

        let stream = XmlStream::open(io, &domain).await.map_err(|e| Error::from(e_to_proto(e)))?;
        let mut state = StreamState {
            connection_id: stream.connection_id().map(str::to_string),
            negotiated_service_name: Some(stream.negotiated_service_name().to_string()),
            ..StreamState::default()
        };

        let (mut stream, negotiated_state, features) = negotiate::negotiate(
            stream,
            state.clone(),
            &domain,
            config.security_mode,
            config.compression,
        )
        .await?;
        state = negotiated_state;

        sasl::authenticate(&mut stream, &features, &config, &domain).await?;

        let mut stream = stream.reset(&domain).await.map_err(|e| Error::from(e_to_proto(e)))?;
        state.connection_id = stream.connection_id().map(str::to_string);

        let post_auth_features = read_element_timeout(&mut stream, BIND_FEATURES_TIMEOUT).await?;
        if post_auth_features.get_child("bind", BIND_NS).is_none() {
            return Err(AuthError::BindNotOffered.into());
        }

        send_element(
            &mut stream,
            Element::from(BindRequest {
                id: "engine-bind-1".into(),
                resource: config.resource.clone(),
            }),
        )
        .await?;
        let bind_reply = read_element_timeout(&mut stream, config.reply_timeout).await?;
        match stanza::iq_outcome(&bind_reply, "engine-bind-1") {
            Some(Ok(())) => {}
            Some(Err(_)) | None => {
                return Err(AuthError::BindFailed("server returned <iq type='error'/>".into()).into())
            }
        }
        let bound_jid = BindResult::try_from(&bind_reply)
            .map_err(|_| AuthError::BindFailed("malformed bind result".into()))?
            .jid;

        if post_auth_features.get_child("session", SESSION_NS).is_some() {
            send_element(
                &mut stream,
                Element::from(SessionRequest { id: "engine-session-1".into() }),
            )
            .await?;
            let session_reply = read_element_timeout(&mut stream, config.reply_timeout).await?;
            match stanza::iq_outcome(&session_reply, "engine-session-1") {
                Some(Ok(())) => {}
                Some(Err(_)) | None => return Err(AuthError::SessionFailed.into()),
            }
        }

        let (mut reader, writer) = stream.into_split();
        let writer = Arc::new(Mutex::new(writer));
        let activity = ActivityTracker::new();

        let (tx, rx) = mpsc::channel(1);
        let reader_task = tokio::spawn(async move {
            let mut stack = Vec::new();
            loop {
                match pull_element(&mut reader, &mut stack).await {
                    Ok(el) => {
                        if tx.send(ReadEvent::Stanza(el)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let err = Error::from(e_to_proto(e));
                        debug!("background reader stopping: {}", err);
                        let _ = tx.send(ReadEvent::Closed(err)).await;
                        return;
                    }
                }
            }
        });

        let keepalive = keepalive::spawn(writer.clone(), config.keepalive_interval, activity.clone());

        Ok(Connection {
            writer,
            inbound: rx,
            state,
            bound_jid,
            activity,
            keepalive,
            reader_task,
        })
    }

    /// Wait for the next stanza, or for the connection to end.
    pub async fn next_event(&mut self) -> Option<ReadEvent> {
        self.inbound.recv().await
    }

    /// Write a stanza. Serialized against the keepalive tap by the writer
    /// lock: a keepalive byte can never land inside a partially-written
    /// stanza.
    pub async fn write_stanza(&self, el: &Element) -> Result<(), Error> {
        let mut writer = self.writer.lock().await;
        write_element(&mut writer, el).await?;
        self.activity.record();
        Ok(())
    }

    /// The full JID bound to this connection.
    pub fn bound_jid(&self) -> &jid::Jid {
        &self.bound_jid
    }

    /// `id` attribute of the most recent `<stream:stream>` open.
    pub fn connection_id(&self) -> Option<&str> {
        self.state.connection_id.as_deref()
    }

    /// Whether the transport is running over TLS.
    pub fn is_secure(&self) -> bool {
        self.state.using_tls
    }

    /// Whether XEP-0138 stream compression is active.
    pub fn is_compressed(&self) -> bool {
        self.state.using_stream_compression
    }

    /// Send `</stream:stream>`, stop the keepalive task, and wait for the
    /// background reader to notice the peer's own stream close (or time out
    /// the wait is the caller's responsibility via `next_event`).
    pub async fn graceful_close(self) -> Result<(), Error> {
        {
            let mut writer = self.writer.lock().await;
            writer.write_all(b"</stream:stream>").await?;
            writer.flush().await?;
        }
        self.keepalive.stop().await;
        self.reader_task.abort();
        Ok(())
    }

    /// Tear down without sending the closing tag, e.g. after a fatal
    /// transport error.
    pub async fn force_close(self) {
        self.keepalive.stop().await;
        self.reader_task.abort();
    }
}

async fn dial_any_candidate(config: &ConnectionConfig) -> Result<tokio::net::TcpStream, Error> {
    let candidates: Vec<ConnectCandidate> = if let Some((host, port)) = &config.explicit_host {
        vec![ConnectCandidate { host: host.clone(), port: *port, index: 0 }]
    } else {
        connect::resolve(&config.service_name).await?
    };

    let mut last_err = None;
    for candidate in &candidates {
        match connect::dial(candidate).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                warn!("candidate {}:{} failed: {}", candidate.host, candidate.port, e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or(Error::RemoteServerNotFound))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_event_debug_shows_variant() {
        let event = ReadEvent::Closed(Error::NotConnected);
        assert!(format!("{:?}", event).contains("Closed"));
    }
}
