//! Individual SASL mechanism drivers.
//!
//! Each driver only needs to answer two questions: does it have something to
//! say before the server challenges it, and given a challenge, what's the
//! response. [`super::authenticate`] owns the read/write loop and timeouts;
//! drivers never touch the wire directly.

use std::collections::HashMap;

use digest::Mac;
use hmac::Hmac;
use md5::{Digest, Md5};
use rand::RngCore;

use crate::error::AuthError;

/// One SASL mechanism's state machine.
pub trait MechanismDriver: Send {
    /// The mechanism name as advertised in `<mechanisms/>` and sent back in
    /// `<auth mechanism='...'>`.
    fn name(&self) -> &'static str;

    /// The client-first data to send with `<auth/>`, if the mechanism has
    /// one. `Some(vec![])` sends a present-but-empty response (encoded as
    /// `=`); `None` omits the response text entirely.
    fn initial_response(&mut self) -> Option<Vec<u8>>;

    /// Compute a response to a `<challenge/>`.
    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, AuthError>;
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// RFC 4616 PLAIN: `authzid \0 authcid \0 password`, sent entirely as the
/// initial response; no challenge is expected.
pub struct Plain {
    username: String,
    password: String,
}

impl Plain {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }
}

impl MechanismDriver for Plain {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn initial_response(&mut self) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(self.username.len() + self.password.len() + 2);
        out.push(0);
        out.extend_from_slice(self.username.as_bytes());
        out.push(0);
        out.extend_from_slice(self.password.as_bytes());
        Some(out)
    }

    fn respond(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, AuthError> {
        Err(AuthError::AuthFailed(Some("PLAIN does not expect a challenge".into())))
    }
}

/// RFC 4422 appendix A EXTERNAL: the identity is established by the
/// transport (here, the client TLS certificate), so the initial response is
/// an optional authzid and nothing more is ever exchanged.
pub struct External {
    authzid: Option<String>,
}

impl External {
    pub fn new(authzid: Option<String>) -> Self {
        Self { authzid }
    }
}

impl MechanismDriver for External {
    fn name(&self) -> &'static str {
        "EXTERNAL"
    }

    fn initial_response(&mut self) -> Option<Vec<u8>> {
        Some(self.authzid.clone().unwrap_or_default().into_bytes())
    }

    fn respond(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, AuthError> {
        Ok(Vec::new())
    }
}

/// RFC 4505 ANONYMOUS: the initial response may carry an informational
/// trace string; an empty one is sent since this engine has nothing useful
/// to offer there.
pub struct Anonymous;

impl MechanismDriver for Anonymous {
    fn name(&self) -> &'static str {
        "ANONYMOUS"
    }

    fn initial_response(&mut self) -> Option<Vec<u8>> {
        Some(Vec::new())
    }

    fn respond(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, AuthError> {
        Ok(Vec::new())
    }
}

type HmacMd5 = Hmac<Md5>;

/// RFC 2195-style CRAM-MD5: the server's challenge is an HMAC-MD5 key
/// token; the response is `username` followed by the hex HMAC of the
/// challenge keyed by the password.
pub struct CramMd5 {
    username: String,
    password: String,
}

impl CramMd5 {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }
}

impl MechanismDriver for CramMd5 {
    fn name(&self) -> &'static str {
        "CRAM-MD5"
    }

    fn initial_response(&mut self) -> Option<Vec<u8>> {
        None
    }

    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, AuthError> {
        let mut mac = HmacMd5::new_from_slice(self.password.as_bytes())
            .expect("HMAC-MD5 accepts a key of any length");
        mac.update(challenge);
        let digest = hex_encode(&mac.finalize().into_bytes());
        Ok(format!("{} {}", self.username, digest).into_bytes())
    }
}

/// RFC 2831 DIGEST-MD5: a two-round exchange. The first challenge carries
/// `realm`/`nonce`/`qop`; the client answers with a computed `response=`
/// directive plus a fresh `cnonce`. The second challenge only confirms
/// `rspauth=`, which this driver does not re-verify (the TLS channel this
/// mechanism is offered in already authenticates the server), so it just
/// answers with an empty response.
pub struct DigestMd5 {
    username: String,
    password: String,
    realm_override: Option<String>,
    domain: String,
    cnonce: String,
    step: u8,
}

impl DigestMd5 {
    pub fn new(username: String, password: String, realm_override: Option<String>, domain: String) -> Self {
        Self {
            username,
            password,
            realm_override,
            domain,
            cnonce: generate_cnonce(),
            step: 0,
        }
    }
}

impl MechanismDriver for DigestMd5 {
    fn name(&self) -> &'static str {
        "DIGEST-MD5"
    }

    fn initial_response(&mut self) -> Option<Vec<u8>> {
        None
    }

    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, AuthError> {
        self.step += 1;
        if self.step > 1 {
            return Ok(Vec::new());
        }

        let text = std::str::from_utf8(challenge)
            .map_err(|_| AuthError::AuthFailed(Some("challenge was not valid UTF-8".into())))?;
        let directives = parse_directives(text);
        let nonce = directives
            .get("nonce")
            .cloned()
            .ok_or_else(|| AuthError::AuthFailed(Some("challenge had no nonce".into())))?;
        let realm = self
            .realm_override
            .clone()
            .or_else(|| directives.get("realm").cloned())
            .unwrap_or_else(|| self.domain.clone());
        let qop = directives.get("qop").cloned().unwrap_or_else(|| "auth".into());
        let digest_uri = format!("xmpp/{}", self.domain);
        let nc = "00000001";
        let response = digest_response_value(&self.username, &realm, &self.password, &nonce, &self.cnonce, nc, &qop, &digest_uri);

        let out = format!(
            "username=\"{}\",realm=\"{}\",nonce=\"{}\",cnonce=\"{}\",nc={},qop={},digest-uri=\"{}\",response={},charset=utf-8",
            self.username, realm, nonce, self.cnonce, nc, qop, digest_uri, response,
        );
        Ok(out.into_bytes())
    }
}

fn generate_cnonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

fn parse_directives(s: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for part in s.split(',') {
        if let Some((key, value)) = part.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().trim_matches('"').to_string());
        }
    }
    map
}

fn digest_response_value(
    username: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    cnonce: &str,
    nc: &str,
    qop: &str,
    digest_uri: &str,
) -> String {
    let mut inner = Md5::new();
    inner.update(username.as_bytes());
    inner.update(b":");
    inner.update(realm.as_bytes());
    inner.update(b":");
    inner.update(password.as_bytes());
    let inner_digest = inner.finalize();

    let mut a1 = Md5::new();
    a1.update(inner_digest);
    a1.update(b":");
    a1.update(nonce.as_bytes());
    a1.update(b":");
    a1.update(cnonce.as_bytes());
    let ha1 = hex_encode(&a1.finalize());

    let mut a2 = Md5::new();
    a2.update(b"AUTHENTICATE:");
    a2.update(digest_uri.as_bytes());
    let ha2 = hex_encode(&a2.finalize());

    let mut resp = Md5::new();
    resp.update(ha1.as_bytes());
    resp.update(b":");
    resp.update(nonce.as_bytes());
    resp.update(b":");
    resp.update(nc.as_bytes());
    resp.update(b":");
    resp.update(cnonce.as_bytes());
    resp.update(b":");
    resp.update(qop.as_bytes());
    resp.update(b":");
    resp.update(ha2.as_bytes());
    hex_encode(&resp.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_initial_response_has_two_nul_separators() {
        let mut plain = Plain::new("juliet".into(), "r0m30".into());
        let resp = plain.initial_response().unwrap();
        assert_eq!(resp.iter().filter(|&&b| b == 0).count(), 2);
        assert!(resp.ends_with(b"r0m30"));
    }

    #[test]
    fn cram_md5_response_is_username_space_hex_digest() {
        let mut cram = CramMd5::new("tim".into(), "tanstaaftanstaaf".into());
        let resp = cram.respond(b"<1896.697170952@postoffice.reston.mci.net>").unwrap();
        let text = String::from_utf8(resp).unwrap();
        assert_eq!(
            text,
            "tim b913a602c7eda7a495b4e6e7334d3890"
        );
    }

    #[test]
    fn digest_md5_first_response_carries_computed_fields() {
        let mut digest = DigestMd5::new("chris".into(), "secret".into(), None, "elwood.innosoft.com".into());
        let challenge = b"realm=\"elwood.innosoft.com\",nonce=\"OA6MG9tEQGm2hh\",qop=\"auth\",algorithm=md5-sess,charset=utf-8";
        let resp = digest.respond(challenge).unwrap();
        let text = String::from_utf8(resp).unwrap();
        assert!(text.contains("username=\"chris\""));
        assert!(text.contains("digest-uri=\"xmpp/elwood.innosoft.com\""));
        assert!(text.contains("response="));
    }
}
