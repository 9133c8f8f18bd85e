//! SASL driver (C6): picks a mechanism shared between the local preference
//! list and the server's `<mechanisms/>`, drives the challenge/response
//! loop, and reports success or failure.

pub mod mechanism;

use std::time::Duration;

use minidom::Element;

use crate::config::ConnectionConfig;
use crate::error::{AuthError, Error, ProtocolError};
use crate::stanza::{SaslAuth, SaslChallenge, SaslFailure, SaslResponse, SaslSuccess, SASL_NS};
use crate::transport::BoxedIo;
use crate::xmlstream::{ReadError, XmlStream};
use mechanism::MechanismDriver;

const MECHANISM_TIMEOUT: Duration = Duration::from_secs(30);
const ANONYMOUS_TIMEOUT: Duration = Duration::from_secs(5);

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

async fn send_element(stream: &mut XmlStream<BoxedIo>, el: Element) -> Result<(), Error> {
    stream.send_element(&el).await.map_err(|e| Error::from(e_to_proto(e)))
}

fn collect_mechanisms(features: &Element) -> Vec<String> {
    features
        .get_child("mechanisms", SASL_NS)
        .map(|m| m.children().filter(|c| c.name() == "mechanism").map(|c| c.text()).collect())
        .unwrap_or_default()
}

fn select_driver(
    offered: &[String],
    config: &ConnectionConfig,
    domain: &str,
) -> Result<Box<dyn MechanismDriver>, Error> {
    for name in &config.mechanism_preference {
        if !offered.iter().any(|o| o == name) {
            continue;
        }
        let driver: Box<dyn MechanismDriver> = match name.as_str() {
            "EXTERNAL" => Box::new(mechanism::External::new(None)),
            "ANONYMOUS" => Box::new(mechanism::Anonymous),
            "PLAIN" => {
                let Some(creds) = config.credentials.as_ref() else {
                    continue;
                };
                Box::new(mechanism::Plain::new(creds.username.clone(), creds.password.clone()))
            }
            "CRAM-MD5" => {
                let Some(creds) = config.credentials.as_ref() else {
                    continue;
                };
                Box::new(mechanism::CramMd5::new(creds.username.clone(), creds.password.clone()))
            }
            "DIGEST-MD5" => {
                let Some(creds) = config.credentials.as_ref() else {
                    continue;
                };
                Box::new(mechanism::DigestMd5::new(
                    creds.username.clone(),
                    creds.password.clone(),
                    creds.realm.clone(),
                    domain.to_string(),
                ))
            }
            // GSSAPI is left in the preference list for forward compatibility but
            // has no driver: no pure-Rust Kerberos implementation is in this
            // crate's dependency stack, so a server offering only GSSAPI falls
            // through to the next preferred mechanism (or NoSharedAuthMechanism).
            _ => continue,
        };
        return Ok(driver);
    }
    Err(AuthError::NoSharedAuthMechanism.into())
}

/// Run SASL authentication to completion against an already-negotiated
/// `<features/>` element. On success, the caller is responsible for
/// resetting the stream and proceeding to resource binding; this function
/// leaves the stream open but does not reset it itself.
pub async fn authenticate(
    stream: &mut XmlStream<BoxedIo>,
    features: &Element,
    config: &ConnectionConfig,
    domain: &str,
) -> Result<(), Error> {
    let offered = collect_mechanisms(features);
    let mut driver = select_driver(&offered, config, domain)?;
    let timeout = if driver.name() == "ANONYMOUS" { ANONYMOUS_TIMEOUT } else { MECHANISM_TIMEOUT };

    let initial_response = driver.initial_response();
    send_element(
        stream,
        Element::from(SaslAuth {
            mechanism: driver.name().to_string(),
            initial_response,
        }),
    )
    .await?;

    loop {
        let next = tokio::time::timeout(timeout, read_element(stream))
            .await
            .map_err(|_| Error::from(AuthError::AuthTimeout))??;

        if let Ok(challenge) = SaslChallenge::try_from(&next) {
            let response = driver.respond(&challenge.0)?;
            send_element(stream, Element::from(SaslResponse(response))).await?;
            continue;
        }
        if SaslSuccess::try_from(&next).is_ok() {
            return Ok(());
        }
        if let Ok(failure) = SaslFailure::try_from(&next) {
            return Err(AuthError::AuthFailed(failure.0).into());
        }
        return Err(ProtocolError::InvalidToken.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features_with_mechanisms(names: &[&str]) -> Element {
        let mut mechanisms = Element::builder("mechanisms", SASL_NS);
        for name in names {
            mechanisms = mechanisms.append(Element::builder("mechanism", SASL_NS).append(*name).build());
        }
        Element::builder("features", crate::xmlstream::STREAM_NS)
            .append(mechanisms.build())
            .build()
    }

    #[test]
    fn prefers_digest_md5_over_plain_when_both_offered() {
        let config = ConnectionConfig::new("example.com")
            .credentials(crate::config::Credentials::new("juliet", "r0m30"));
        let features = features_with_mechanisms(&["PLAIN", "DIGEST-MD5"]);
        let offered = collect_mechanisms(&features);
        let driver = select_driver(&offered, &config, "example.com").unwrap();
        assert_eq!(driver.name(), "DIGEST-MD5");
    }

    #[test]
    fn falls_through_unregistered_gssapi_to_plain() {
        let config = ConnectionConfig::new("example.com")
            .credentials(crate::config::Credentials::new("juliet", "r0m30"));
        let features = features_with_mechanisms(&["GSSAPI", "PLAIN"]);
        let offered = collect_mechanisms(&features);
        let driver = select_driver(&offered, &config, "example.com").unwrap();
        assert_eq!(driver.name(), "PLAIN");
    }

    #[test]
    fn falls_through_plain_without_credentials_to_anonymous() {
        let config = ConnectionConfig::new("example.com");
        let features = features_with_mechanisms(&["PLAIN", "ANONYMOUS"]);
        let offered = collect_mechanisms(&features);
        let driver = select_driver(&offered, &config, "example.com").unwrap();
        assert_eq!(driver.name(), "ANONYMOUS");
    }

    #[test]
    fn no_shared_mechanism_is_an_error() {
        let config = ConnectionConfig::new("example.com");
        let features = features_with_mechanisms(&["GSSAPI"]);
        let offered = collect_mechanisms(&features);
        assert!(select_driver(&offered, &config, "example.com").is_err());
    }
}
