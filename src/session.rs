use std::fmt;
use std::net::SocketAddr;

/// Protocole négocié jusqu'ici, du plus faible au plus fort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Protocol {
    Smtp,
    Esmtp,
    Esmtps,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Smtp => "SMTP",
            Protocol::Esmtp => "ESMTP",
            Protocol::Esmtps => "ESMTPS",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// État SMTP d'une connexion.
///
/// L'enveloppe ne grandit que par [`SmtpSession::set_sender`] et
/// [`SmtpSession::add_recipient`] : jamais de destinataire sans expéditeur.
#[derive(Debug)]
pub struct SmtpSession {
    pub client_addr: SocketAddr,
    pub hostname: String,
    pub helo: Option<String>,
    pub command: Option<String>,
    protocol: Protocol,
    mail_from: Option<String>,
    rcpt_to: Vec<String>,
}

impl SmtpSession {
    pub fn new(client_addr: SocketAddr, hostname: impl Into<String>) -> Self {
        Self {
            client_addr,
            hostname: hostname.into(),
            helo: None,
            command: None,
            protocol: Protocol::Smtp,
            mail_from: None,
            rcpt_to: Vec::new(),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Monte le protocole ; un protocole plus faible ne remplace jamais un plus fort.
    pub fn negotiate(&mut self, protocol: Protocol) {
        self.protocol = self.protocol.max(protocol);
    }

    pub fn sender(&self) -> Option<&str> {
        self.mail_from.as_deref()
    }

    pub fn recipients(&self) -> &[String] {
        &self.rcpt_to
    }

    pub fn set_sender(&mut self, sender: impl Into<String>) {
        self.mail_from = Some(sender.into());
    }

    /// Renvoie `false`, sans toucher la liste, quand il n'y a pas d'expéditeur.
    pub fn add_recipient(&mut self, recipient: impl Into<String>) -> bool {
        if self.mail_from.is_none() {
            return false;
        }
        self.rcpt_to.push(recipient.into());
        true
    }

    /// Oublie la transaction en cours.
    pub fn reset(&mut self) {
        self.mail_from = None;
        self.rcpt_to.clear();
    }

    /// Oublie la transaction et le nom HELO, comme l'exige STARTTLS.
    pub fn reset_all(&mut self) {
        self.helo = None;
        self.reset();
    }
}
