use std::error::Error as StdError;
use std::fmt;
use std::io::Error as IoError;

/// Top-level error type for the stream engine.
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(IoError),
    /// Error parsing a Jabber-Id
    JidParse(jid::Error),
    /// Error parsing or assembling XML
    Xml(minidom::Error),
    /// Stream-, negotiation- or authentication-level protocol error
    Protocol(ProtocolError),
    /// Feature-negotiation failure
    Negotiation(NegotiationError),
    /// Authentication failure
    Auth(AuthError),
    /// The transport is not connected (write attempted after close, or
    /// connect attempted twice)
    NotConnected,
    /// No more service-discovery candidates remained
    RemoteServerNotFound,
    /// DNS resolution error
    Dns(DnsError),
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(fmt, "I/O error: {}", e),
            Error::JidParse(e) => write!(fmt, "jid parse error: {}", e),
            Error::Xml(e) => write!(fmt, "XML error: {}", e),
            Error::Protocol(e) => write!(fmt, "protocol error: {}", e),
            Error::Negotiation(e) => write!(fmt, "negotiation error: {}", e),
            Error::Auth(e) => write!(fmt, "authentication error: {}", e),
            Error::NotConnected => write!(fmt, "not connected"),
            Error::RemoteServerNotFound => write!(fmt, "no remaining connection candidates"),
            Error::Dns(e) => write!(fmt, "DNS error: {}", e),
        }
    }
}

impl StdError for Error {}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

impl From<jid::Error> for Error {
    fn from(e: jid::Error) -> Self {
        Error::JidParse(e)
    }
}

impl From<minidom::Error> for Error {
    fn from(e: minidom::Error) -> Self {
        Error::Xml(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<NegotiationError> for Error {
    fn from(e: NegotiationError) -> Self {
        Error::Negotiation(e)
    }
}

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Self {
        Error::Auth(e)
    }
}

impl From<DnsError> for Error {
    fn from(e: DnsError) -> Self {
        Error::Dns(e)
    }
}

/// Stream-level protocol error (malformed XML, bad version string, stray
/// elements at the stream root).
#[derive(Debug)]
pub enum ProtocolError {
    /// The underlying XML parser reported an error
    Parser(io::ParserCause),
    /// `nextTopLevelElement` reached end-of-document or the outer end-tag
    StreamTerminated,
    /// The `<stream:stream>` opening carried no `xmlns` attribute
    NoStreamNamespace,
    /// A non-numeric or out-of-range `version` attribute was present
    BadVersion(String),
    /// An XML token appeared where only the stream root or a top-level
    /// stanza was expected
    InvalidToken,
}

/// Submodule purely to namespace the parser-cause type away from the
/// `std::io` it is named after, without pulling in a dependency on rxml's
/// error type at the crate-error boundary.
pub mod io {
    use std::fmt;

    /// Opaque cause string carried from the underlying XML parser.
    #[derive(Debug)]
    pub struct ParserCause(pub String);

    impl fmt::Display for ParserCause {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str(&self.0)
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::Parser(e) => write!(fmt, "XML parser error: {}", e),
            ProtocolError::StreamTerminated => write!(fmt, "stream terminated"),
            ProtocolError::NoStreamNamespace => {
                write!(fmt, "no xmlns attribute in <stream:stream>")
            }
            ProtocolError::BadVersion(v) => write!(fmt, "unparseable stream version: {:?}", v),
            ProtocolError::InvalidToken => write!(fmt, "unexpected XML token"),
        }
    }
}

impl StdError for ProtocolError {}

/// Feature-negotiation error (STARTTLS / stream compression).
#[derive(Debug)]
pub enum NegotiationError {
    /// TLS needed but unavailable, or the certificate did not verify and
    /// security mode is `required`
    SecurityRequired,
    /// The server demands TLS (`<starttls><required/></starttls>`) but the
    /// local security mode is `disabled`
    SecurityForbidden,
    /// `<failure/>` in the TLS namespace, or the handshake itself failed
    TlsHandshakeFailed(String),
    /// Deflate setup failed; recoverable within the same `<features/>`
    CompressionFailed(String),
}

impl fmt::Display for NegotiationError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NegotiationError::SecurityRequired => write!(fmt, "TLS required but unavailable"),
            NegotiationError::SecurityForbidden => {
                write!(fmt, "server demands TLS but it is disabled locally")
            }
            NegotiationError::TlsHandshakeFailed(e) => write!(fmt, "TLS handshake failed: {}", e),
            NegotiationError::CompressionFailed(e) => write!(fmt, "compression failed: {}", e),
        }
    }
}

impl StdError for NegotiationError {}

/// Authentication error.
#[derive(Debug)]
pub enum AuthError {
    /// `<failure/>` in the SASL namespace, with the optional defined
    /// condition element name
    AuthFailed(Option<String>),
    /// 30s elapsed without `<success/>`/`<failure/>`, or the bind/session IQ
    /// timed out
    AuthTimeout,
    /// No mechanism in the preference list is offered by the server
    NoSharedAuthMechanism,
    /// Post-auth features never advertised `<bind/>`
    BindNotOffered,
    /// Post-auth features advertised `<session/>` but the session IQ failed
    SessionFailed,
    /// The server rejected resource binding
    BindFailed(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuthError::AuthFailed(Some(c)) => write!(fmt, "authentication failed: {}", c),
            AuthError::AuthFailed(None) => write!(fmt, "authentication failed"),
            AuthError::AuthTimeout => write!(fmt, "authentication timed out"),
            AuthError::NoSharedAuthMechanism => {
                write!(fmt, "no SASL mechanism shared with the server")
            }
            AuthError::BindNotOffered => write!(fmt, "server never offered resource binding"),
            AuthError::SessionFailed => write!(fmt, "session establishment failed"),
            AuthError::BindFailed(e) => write!(fmt, "resource binding failed: {}", e),
        }
    }
}

impl StdError for AuthError {}

/// DNS / service-discovery error.
#[derive(Debug)]
pub enum DnsError {
    /// The resolver itself failed (network error, NXDOMAIN, etc.)
    ResolutionFailed(String),
    /// The host name could not be converted to ASCII (IDNA)
    Idna,
}

impl fmt::Display for DnsError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DnsError::ResolutionFailed(e) => write!(fmt, "DNS resolution failed: {}", e),
            DnsError::Idna => write!(fmt, "IDNA conversion error"),
        }
    }
}

impl StdError for DnsError {}

impl From<idna::Errors> for DnsError {
    fn from(_: idna::Errors) -> Self {
        DnsError::Idna
    }
}

impl From<hickory_resolver::error::ResolveError> for DnsError {
    fn from(e: hickory_resolver::error::ResolveError) -> Self {
        DnsError::ResolutionFailed(e.to_string())
    }
}
