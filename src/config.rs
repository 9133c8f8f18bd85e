//! Connection configuration: security mode, credentials, timeouts and
//! SASL mechanism preference, built up through a chained builder before
//! [`crate::Connection::connect`] is called.

use std::time::Duration;

/// How strongly the engine insists on transport encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    /// Fail the connection if TLS cannot be established and verified.
    Required,
    /// Use TLS if the server offers it, but proceed without it otherwise.
    Enabled,
    /// Never attempt TLS, even if the server requires it.
    Disabled,
}

/// Credentials supplied to the SASL layer on demand.
///
/// Mirrors the injected callback handler of the original design: rather than
/// the engine reaching out to a callback, mechanisms pull what they need
/// from this value directly.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Authentication identity (the `username` in most mechanisms).
    pub username: String,
    /// Password, where the mechanism needs one.
    pub password: String,
    /// Realm to assume for DIGEST-MD5 if the server didn't advertise one.
    pub realm: Option<String>,
}

impl Credentials {
    /// Construct plain username/password credentials with no realm.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            realm: None,
        }
    }

    /// Set the DIGEST-MD5 realm.
    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }
}

/// Immutable-after-open connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub(crate) service_name: String,
    pub(crate) explicit_host: Option<(String, u16)>,
    pub(crate) security_mode: SecurityMode,
    pub(crate) compression: bool,
    pub(crate) reply_timeout: Duration,
    pub(crate) keepalive_interval: Duration,
    pub(crate) credentials: Option<Credentials>,
    pub(crate) resource: Option<String>,
    pub(crate) mechanism_preference: Vec<String>,
}

impl ConnectionConfig {
    /// Start a builder for the given logical XMPP domain (e.g. `example.com`).
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            explicit_host: None,
            security_mode: SecurityMode::Required,
            compression: true,
            reply_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(60),
            credentials: None,
            resource: None,
            // EXTERNAL is deliberately not in the default list: it only
            // makes sense once a client certificate is configured, and
            // `upgrade_tls` doesn't currently present one. Callers that wire
            // up client-cert auth can still select it explicitly with
            // `mechanism_preference`.
            mechanism_preference: vec![
                "GSSAPI".into(),
                "DIGEST-MD5".into(),
                "CRAM-MD5".into(),
                "PLAIN".into(),
                "ANONYMOUS".into(),
            ],
        }
    }

    /// Bypass SRV/A-record resolution and connect to this host/port directly.
    pub fn explicit_host(mut self, host: impl Into<String>, port: u16) -> Self {
        self.explicit_host = Some((host.into(), port));
        self
    }

    /// Set the TLS requirement level. Default: [`SecurityMode::Required`].
    pub fn security_mode(mut self, mode: SecurityMode) -> Self {
        self.security_mode = mode;
        self
    }

    /// Enable or disable XEP-0138 stream compression. Default: enabled.
    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    /// Per-IQ reply timeout. Default: 30s.
    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Idle-writer keepalive interval; zero disables the keepalive task.
    /// Default: 60s.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// SASL credentials. Anonymous connections may omit this.
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Requested resource for binding; empty lets the server choose one.
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Override the default SASL mechanism preference order (position 0 is
    /// most preferred).
    pub fn mechanism_preference(mut self, names: Vec<String>) -> Self {
        self.mechanism_preference = names;
        self
    }

    /// The logical XMPP domain this connection authenticates against.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}
