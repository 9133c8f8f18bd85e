//! Client-side [XMPP](https://xmpp.org/) stream engine: connect-data
//! resolution, the incremental XML stream framer, the TLS/compression
//! transport stack, feature negotiation, the idle-writer keepalive and
//! SASL authentication, using asynchronous I/O with [tokio](https://tokio.rs/).
//!
//! # Getting started
//!
//! Build a [`ConnectionConfig`], hand it to [`Connection::connect`], then
//! call [`Connection::next_event`] in a loop to receive stanzas and
//! [`Connection::write_stanza`] to send them.
//!
//! # Scope
//!
//! This crate ends at resource binding and stanza exchange: there is no
//! roster, presence, or XEP-specific stanza support beyond the connection
//! lifecycle itself, and no multi-mechanism channel-binding support (no
//! in-scope mechanism needs it).

#![deny(unsafe_code, missing_docs, bare_trait_objects)]

pub mod config;
pub mod connect;
mod connection;
/// Detailed error types.
pub mod error;
mod keepalive;
mod negotiate;
mod sasl;
mod stanza;
mod transport;
pub mod xmlstream;

pub use crate::error::Error;
pub use config::{ConnectionConfig, Credentials, SecurityMode};
pub use connection::{Connection, ReadEvent};
pub use transport::StreamState;

#[cfg(test)]
mod tests {
    #[test]
    fn reexports() {
        #[allow(unused_imports)]
        use crate::config::ConnectionConfig;
        #[allow(unused_imports)]
        use crate::Connection;
    }
}
