use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Erreurs du transport de connexion.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("timed out waiting for the client")]
    Timeout,

    #[error("connection closed by peer")]
    Closed,

    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("message exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("TLS is already active")]
    AlreadyTls,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectionError {
    /// Le flux reste-t-il utilisable après cette erreur ?
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ConnectionError::BodyTooLarge(_) | ConnectionError::AlreadyTls)
    }
}

/// Diagnostic levé pendant le traitement d'une connexion.
///
/// Porte un message, un contexte clé/valeur affiché dans l'ordre des clés, et
/// les drapeaux dont la boucle de connexion se sert pour la suite : `escalate`
/// envoie la connexion au tarpit, `fatal` la ferme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticError {
    message: String,
    context: BTreeMap<String, String>,
    escalate: bool,
    fatal: bool,
}

impl DiagnosticError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: BTreeMap::new(),
            escalate: false,
            fatal: false,
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Marque le client comme abusif.
    pub fn escalated(mut self) -> Self {
        self.escalate = true;
        self
    }

    /// Marque la connexion comme inutilisable.
    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    pub fn escalate(&self) -> bool {
        self.escalate
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }
}

impl fmt::Display for DiagnosticError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if !self.context.is_empty() {
            f.write_str(";")?;
        }
        for (key, value) in &self.context {
            write!(f, " {}=\"{}\"", key, value.replace('\n', " "))?;
        }
        Ok(())
    }
}

impl std::error::Error for DiagnosticError {}
