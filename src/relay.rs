//! Livraison vers le relais amont.

use std::time::Duration;

use async_trait::async_trait;
use lettre::address::{AddressError, Envelope};
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use thiserror::Error;

const DEFAULT_PORT: u16 = 25;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("invalid relay host {0:?}")]
    InvalidRelayHost(String),

    #[error("invalid address {address:?}: {source}")]
    Address { address: String, source: AddressError },

    #[error("invalid envelope: {0}")]
    Envelope(#[from] lettre::error::Error),

    #[error("relay refused the message: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),

    #[error("relay did not answer in time")]
    Timeout,
}

impl DeliveryError {
    /// Vrai quand un nouvel essai avec la même enveloppe échouera aussi.
    pub fn is_permanent(&self) -> bool {
        matches!(self, DeliveryError::Address { .. } | DeliveryError::Envelope(_))
    }
}

/// Transmet un message accepté au relais amont.
#[async_trait]
pub trait Relay: Send + Sync {
    async fn submit(&self, sender: &str, recipients: &[String], body: &[u8]) -> Result<(), DeliveryError>;
}

/// Découpe `hôte[:port]`, forme IPv6 entre crochets comprise.
pub fn parse_relay_host(relay_host: &str) -> Result<(String, u16), DeliveryError> {
    let invalid = || DeliveryError::InvalidRelayHost(relay_host.to_string());
    let relay_host = relay_host.trim();

    if let Some(rest) = relay_host.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
        let port = match after.strip_prefix(':') {
            Some(port) => port.parse().map_err(|_| invalid())?,
            None if after.is_empty() => DEFAULT_PORT,
            None => return Err(invalid()),
        };
        if host.is_empty() {
            return Err(invalid());
        }
        return Ok((host.to_string(), port));
    }

    let (host, port) = match relay_host.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().map_err(|_| invalid())?),
        None => (relay_host, DEFAULT_PORT),
    };
    if host.is_empty() || host.contains(':') {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

fn parse_address(address: &str) -> Result<Address, DeliveryError> {
    address.parse().map_err(|source| DeliveryError::Address {
        address: address.to_string(),
        source,
    })
}

/// [`Relay`] qui parle SMTP à un hôte fixe.
pub struct SmtpRelay {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    timeout: Duration,
}

impl SmtpRelay {
    pub fn new(relay_host: &str, timeout: Duration) -> Result<Self, DeliveryError> {
        let (host, port) = parse_relay_host(relay_host)?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
            .port(port)
            .timeout(Some(timeout))
            .build();
        Ok(Self { transport, timeout })
    }
}

#[async_trait]
impl Relay for SmtpRelay {
    async fn submit(&self, sender: &str, recipients: &[String], body: &[u8]) -> Result<(), DeliveryError> {
        let from = parse_address(sender)?;
        let to = recipients
            .iter()
            .map(|r| parse_address(r))
            .collect::<Result<Vec<_>, _>>()?;
        let envelope = Envelope::new(Some(from), to)?;

        tokio::time::timeout(self.timeout, self.transport.send_raw(&envelope, body))
            .await
            .map_err(|_| DeliveryError::Timeout)??;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct Submission {
        pub(crate) sender: String,
        pub(crate) recipients: Vec<String>,
        pub(crate) body: Vec<u8>,
    }

    /// Relais qui vérifie les adresses comme lettre, puis enregistre l'envoi ;
    /// tout échoue quand `fail` est positionné.
    #[derive(Default)]
    pub(crate) struct FakeRelay {
        pub(crate) fail: bool,
        pub(crate) submissions: Mutex<Vec<Submission>>,
    }

    impl FakeRelay {
        pub(crate) fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub(crate) fn submissions(&self) -> Vec<Submission> {
            self.submissions.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Relay for FakeRelay {
        async fn submit(&self, sender: &str, recipients: &[String], body: &[u8]) -> Result<(), DeliveryError> {
            parse_address(sender)?;
            for recipient in recipients {
                parse_address(recipient)?;
            }
            self.submissions.lock().unwrap().push(Submission {
                sender: sender.to_string(),
                recipients: recipients.to_vec(),
                body: body.to_vec(),
            });
            if self.fail {
                return Err(DeliveryError::Timeout);
            }
            Ok(())
        }
    }

    #[test]
    fn parses_relay_hosts() {
        assert_eq!(parse_relay_host("relay.test.tld").unwrap(), ("relay.test.tld".to_string(), 25));
        assert_eq!(parse_relay_host("relay.test.tld:2525").unwrap(), ("relay.test.tld".to_string(), 2525));
        assert_eq!(parse_relay_host("[::1]:587").unwrap(), ("::1".to_string(), 587));
        assert_eq!(parse_relay_host("[2001:db8::1]").unwrap(), ("2001:db8::1".to_string(), 25));
    }

    #[test]
    fn rejects_bad_relay_hosts() {
        for bad in ["", ":25", "relay:port", "::1", "[::1", "[::1]x", "[]:25", "relay:99999"] {
            assert!(parse_relay_host(bad).is_err(), "{:?} should be rejected", bad);
        }
    }

    #[tokio::test]
    async fn unparseable_sender_fails_before_connecting() {
        let relay = SmtpRelay::new("127.0.0.1:9", Duration::from_secs(1)).unwrap();
        let result = relay.submit("not an address", &["you@test.tld".to_string()], b"Hello\r\n").await;
        let err = result.unwrap_err();
        assert!(matches!(err, DeliveryError::Address { .. }));
        assert!(err.is_permanent());
    }

    #[test]
    fn transport_trouble_is_temporary() {
        assert!(!DeliveryError::Timeout.is_permanent());
        assert!(!DeliveryError::InvalidRelayHost("x".to_string()).is_permanent());
    }
}
