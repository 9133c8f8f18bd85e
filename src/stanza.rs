//! Hand-rolled nonza and stanza types for the handful of elements the
//! transport, negotiation and SASL layers need to build or inspect.
//!
//! These are deliberately narrow: one struct per wire shape actually used by
//! this crate, not a general-purpose stanza library. Each converts to and
//! from [`minidom::Element`] by hand, in the style of the older
//! pre-generated `xmpp-parsers` modules rather than a derive macro.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use minidom::Element;

use crate::error::ProtocolError;

pub const STARTTLS_NS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
pub const SASL_NS: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const BIND_NS: &str = "urn:ietf:params:xml:ns:xmpp-bind";
pub const SESSION_NS: &str = "urn:ietf:params:xml:ns:xmpp-session";
pub const COMPRESS_NS: &str = "http://jabber.org/protocol/compress";

/// `<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>`
pub struct StartTls;

impl From<StartTls> for Element {
    fn from(_: StartTls) -> Self {
        Element::builder("starttls", STARTTLS_NS).build()
    }
}

/// `<compress xmlns='http://jabber.org/protocol/compress'><method>zlib</method></compress>`
pub struct CompressRequest {
    method: String,
}

impl CompressRequest {
    pub fn zlib() -> Self {
        Self { method: "zlib".into() }
    }
}

impl From<CompressRequest> for Element {
    fn from(req: CompressRequest) -> Self {
        Element::builder("compress", COMPRESS_NS)
            .append(Element::builder("method", COMPRESS_NS).append(req.method).build())
            .build()
    }
}

/// `<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='...'>base64</auth>`
///
/// Per RFC 6120 §6.4.2, a present-but-empty initial response is encoded as
/// a literal `=`, distinct from omitting the response text entirely.
pub struct SaslAuth {
    /// The mechanism name, e.g. `"PLAIN"` or `"DIGEST-MD5"`.
    pub mechanism: String,
    /// Client-first data, if the mechanism has any. `Some(vec![])` is sent
    /// as a literal `=`; `None` omits the response text.
    pub initial_response: Option<Vec<u8>>,
}

impl From<SaslAuth> for Element {
    fn from(auth: SaslAuth) -> Self {
        let mut builder = Element::builder("auth", SASL_NS).attr("mechanism", auth.mechanism);
        if let Some(bytes) = auth.initial_response {
            let text = if bytes.is_empty() {
                "=".to_string()
            } else {
                BASE64.encode(bytes)
            };
            builder = builder.append(text);
        }
        builder.build()
    }
}

/// `<response xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>base64</response>`
pub struct SaslResponse(pub Vec<u8>);

impl From<SaslResponse> for Element {
    fn from(resp: SaslResponse) -> Self {
        let text = if resp.0.is_empty() { String::new() } else { BASE64.encode(resp.0) };
        Element::builder("response", SASL_NS).append(text).build()
    }
}

/// `<challenge xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>base64</challenge>`
pub struct SaslChallenge(pub Vec<u8>);

impl TryFrom<&Element> for SaslChallenge {
    type Error = ProtocolError;

    fn try_from(el: &Element) -> Result<Self, Self::Error> {
        if !el.is("challenge", SASL_NS) {
            return Err(ProtocolError::InvalidToken);
        }
        decode_body(el).map(SaslChallenge)
    }
}

/// `<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>base64?</success>`
pub struct SaslSuccess(pub Option<Vec<u8>>);

impl TryFrom<&Element> for SaslSuccess {
    type Error = ProtocolError;

    fn try_from(el: &Element) -> Result<Self, Self::Error> {
        if !el.is("success", SASL_NS) {
            return Err(ProtocolError::InvalidToken);
        }
        let text = el.text();
        if text.trim().is_empty() {
            Ok(SaslSuccess(None))
        } else {
            Ok(SaslSuccess(Some(decode_body(el)?)))
        }
    }
}

/// `<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><condition/></failure>`
pub struct SaslFailure(pub Option<String>);

impl TryFrom<&Element> for SaslFailure {
    type Error = ProtocolError;

    fn try_from(el: &Element) -> Result<Self, Self::Error> {
        if !el.is("failure", SASL_NS) {
            return Err(ProtocolError::InvalidToken);
        }
        let condition = el.children().next().map(|c| c.name().to_string());
        Ok(SaslFailure(condition))
    }
}

fn decode_body(el: &Element) -> Result<Vec<u8>, ProtocolError> {
    BASE64
        .decode(el.text().trim())
        .map_err(|_| ProtocolError::InvalidToken)
}

/// `<iq type='set'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><resource>...</resource></bind></iq>`
pub struct BindRequest {
    /// The `id` attribute to match the reply against.
    pub id: String,
    /// Requested resource; `None` lets the server choose one.
    pub resource: Option<String>,
}

impl From<BindRequest> for Element {
    fn from(req: BindRequest) -> Self {
        let mut bind = Element::builder("bind", BIND_NS);
        if let Some(resource) = req.resource {
            bind = bind.append(Element::builder("resource", BIND_NS).append(resource).build());
        }
        Element::builder("iq", "jabber:client")
            .attr("type", "set")
            .attr("id", req.id)
            .append(bind.build())
            .build()
    }
}

/// The bound full JID returned inside a successful bind result IQ.
pub struct BindResult {
    /// The full JID the server assigned (or confirmed) for this stream.
    pub jid: jid::Jid,
}

impl TryFrom<&Element> for BindResult {
    type Error = ProtocolError;

    fn try_from(el: &Element) -> Result<Self, Self::Error> {
        let bind = el.get_child("bind", BIND_NS).ok_or(ProtocolError::InvalidToken)?;
        let jid_el = bind.get_child("jid", BIND_NS).ok_or(ProtocolError::InvalidToken)?;
        let jid = jid_el
            .text()
            .parse::<jid::Jid>()
            .map_err(|_| ProtocolError::InvalidToken)?;
        Ok(BindResult { jid })
    }
}

/// `<iq type='set'><session xmlns='urn:ietf:params:xml:ns:xmpp-session'/></iq>`
pub struct SessionRequest {
    /// The `id` attribute to match the reply against.
    pub id: String,
}

impl From<SessionRequest> for Element {
    fn from(req: SessionRequest) -> Self {
        Element::builder("iq", "jabber:client")
            .attr("type", "set")
            .attr("id", req.id)
            .append(Element::builder("session", SESSION_NS).build())
            .build()
    }
}

/// Check whether an `<iq type='result'/>` or `<iq type='error'/>` response
/// matches the id of an outstanding request and report which it was.
pub fn iq_outcome(el: &Element, expected_id: &str) -> Option<Result<(), ProtocolError>> {
    if el.name() != "iq" || el.attr("id") != Some(expected_id) {
        return None;
    }
    match el.attr("type") {
        Some("result") => Some(Ok(())),
        Some("error") => Some(Err(ProtocolError::InvalidToken)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_with_empty_initial_response_encodes_equals_sign() {
        let el: Element = SaslAuth {
            mechanism: "EXTERNAL".into(),
            initial_response: Some(Vec::new()),
        }
        .into();
        assert_eq!(el.text(), "=");
        assert_eq!(el.attr("mechanism"), Some("EXTERNAL"));
    }

    #[test]
    fn auth_with_no_initial_response_has_no_text() {
        let el: Element = SaslAuth {
            mechanism: "DIGEST-MD5".into(),
            initial_response: None,
        }
        .into();
        assert_eq!(el.text(), "");
    }

    #[test]
    fn challenge_round_trips_base64() {
        let el = Element::builder("challenge", SASL_NS).append("cmVhbG09ImV4YW1wbGUuY29tIg==").build();
        let challenge = SaslChallenge::try_from(&el).unwrap();
        assert_eq!(challenge.0, b"realm=\"example.com\"");
    }

    #[test]
    fn failure_without_condition_is_none() {
        let el = Element::builder("failure", SASL_NS).build();
        let failure = SaslFailure::try_from(&el).unwrap();
        assert!(failure.0.is_none());
    }
}
