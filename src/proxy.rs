use crate::connection::Connection;
use crate::error::{ConnectionError, DiagnosticError};
use crate::server::Gateway;
use crate::session::{Protocol, SmtpSession};
use crate::utils::safe_log_string;

use chrono::Local;
use tracing::{debug, info};

/// Ce que fait la boucle de connexion après une commande réussie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Continue,
    Quit,
}

type CommandResult = Result<Next, DiagnosticError>;

/// Extrait le chemin entre chevrons de `FROM:<...>` ou `TO:<...>`.
///
/// Le mot-clé est comparé sans tenir compte de la casse et l'adresse est
/// renvoyée telle quelle, sans autre validation.
pub fn extract_path<'a>(args: &'a str, keyword: &str) -> Option<&'a str> {
    let args = args.trim_start();
    let head = args.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = args[keyword.len()..].trim_start().strip_prefix('<')?;
    let end = rest.find('>')?;
    let path = &rest[..end];
    if path.is_empty() {
        return None;
    }
    Some(path)
}

/// Automate SMTP d'un client.
pub struct Proxy<'a, C> {
    gateway: &'a Gateway,
    conn: C,
    session: SmtpSession,
}

impl<'a, C: Connection> Proxy<'a, C> {
    pub fn new(gateway: &'a Gateway, conn: C) -> Self {
        let session = SmtpSession::new(conn.remote_addr(), gateway.config.hostname.clone());
        Self {
            gateway,
            conn,
            session,
        }
    }

    pub fn session(&self) -> &SmtpSession {
        &self.session
    }

    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.conn
    }

    /// Diagnostic portant le contexte courant de la session.
    fn diagnostic(&self, message: &str) -> DiagnosticError {
        let mut err = DiagnosticError::new(message)
            .with("client", self.session.client_addr.to_string())
            .with("protocol", self.session.protocol().as_str());
        if let Some(command) = &self.session.command {
            err = err.with("command", command.as_str());
        }
        if let Some(sender) = self.session.sender() {
            err = err.with("sender", sender);
        }
        if !self.session.recipients().is_empty() {
            err = err.with("recipients", self.session.recipients().join(", "));
        }
        err
    }

    fn io_error(&self, message: &str, e: ConnectionError) -> DiagnosticError {
        self.diagnostic(message).with("error", e.to_string()).fatal()
    }

    async fn reply(&mut self, code: u16, lines: &[&str]) -> Result<(), DiagnosticError> {
        match self.conn.reply(code, lines).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.io_error("Error writing reply", e)),
        }
    }

    /// Envoie la première ligne d'accueil et attend la fin du délai de grâce.
    /// Un client qui parle avant la seconde ligne est escaladé.
    pub async fn greet(&mut self) -> Result<(), DiagnosticError> {
        let banner = format!("220-{} here, please hold.", self.session.hostname);
        if let Err(e) = self.conn.write_line(&banner).await {
            return Err(self.io_error("Error writing server greeting", e));
        }

        match self.conn.wait_for_input(self.gateway.config.timeouts.greeting).await {
            Ok(None) => {}
            Ok(Some(input)) => {
                self.session.command = Some(input);
                return Err(self.diagnostic("Client spoke before its turn").escalated());
            }
            Err(e) => return Err(self.io_error("Error during greeting", e)),
        }

        if let Err(e) = self.conn.reply(220, &["Thank you for holding, how can I help you?"]).await {
            return Err(self.io_error("Error writing server greeting continuation", e));
        }
        Ok(())
    }

    /// Lit et traite une commande.
    pub async fn handle_command(&mut self) -> CommandResult {
        let (verb, args) = match self.conn.read_command(self.gateway.config.timeouts.command).await {
            Ok(command) => command,
            Err(e) => {
                self.session.command = None;
                return Err(self.io_error("Error reading client command", e));
            }
        };

        let command = if args.is_empty() {
            safe_log_string(&verb)
        } else {
            safe_log_string(&format!("{} {}", verb, args))
        };
        debug!(%command, ">>");
        self.session.command = Some(command);

        match verb.to_ascii_uppercase().as_str() {
            "HELO" => self.handle_helo(&args).await,
            "EHLO" => self.handle_ehlo(&args).await,
            "STARTTLS" => self.handle_starttls().await,
            "MAIL" => self.handle_mail(&args).await,
            "RCPT" => self.handle_rcpt(&args).await,
            "DATA" => self.handle_data().await,
            "RSET" => {
                self.session.reset();
                self.reply(250, &["Ok"]).await?;
                Ok(Next::Continue)
            }
            "NOOP" => {
                self.reply(250, &["Ok"]).await?;
                Ok(Next::Continue)
            }
            "VRFY" => {
                self.reply(502, &["Not implemented"]).await?;
                Ok(Next::Continue)
            }
            "QUIT" => {
                self.reply(221, &["Have a nice day"]).await?;
                Ok(Next::Quit)
            }
            _ => {
                self.reply(500, &["Command not recognized"]).await?;
                Err(self.diagnostic("Unknown command").escalated())
            }
        }
    }

    fn remember_helo(&mut self, args: &str) {
        let name = args.trim();
        if !name.is_empty() {
            self.session.helo = Some(safe_log_string(name));
        }
    }

    async fn handle_helo(&mut self, args: &str) -> CommandResult {
        self.remember_helo(args);
        let hostname = self.session.hostname.clone();
        self.reply(250, &[&hostname]).await?;
        self.session.negotiate(Protocol::Smtp);
        Ok(Next::Continue)
    }

    async fn handle_ehlo(&mut self, args: &str) -> CommandResult {
        self.remember_helo(args);
        let hostname = self.session.hostname.clone();
        let mut lines = vec![hostname.as_str(), "8BITMIME"];
        if self.gateway.tls_acceptor.is_some() && !self.conn.is_tls() {
            lines.push("STARTTLS");
        }
        self.reply(250, &lines).await?;
        self.session.negotiate(Protocol::Esmtp);
        Ok(Next::Continue)
    }

    async fn handle_starttls(&mut self) -> CommandResult {
        let gateway = self.gateway;
        let acceptor = match &gateway.tls_acceptor {
            Some(acceptor) => acceptor,
            None => {
                self.reply(502, &["Not implemented"]).await?;
                return Err(self.diagnostic("Unexpected STARTTLS command"));
            }
        };
        if self.conn.is_tls() {
            self.reply(503, &["TLS already active"]).await?;
            return Err(self.diagnostic("Duplicate STARTTLS command"));
        }

        self.reply(220, &["Ready to start TLS"]).await?;
        if let Err(e) = self.conn.start_tls(acceptor).await {
            return Err(self.io_error("TLS handshake failed", e));
        }
        // RFC 3207 : oublier tout ce que le client a dit avant TLS.
        self.session.reset_all();
        self.session.negotiate(Protocol::Esmtps);
        debug!("TLS session established");
        Ok(Next::Continue)
    }

    async fn handle_mail(&mut self, args: &str) -> CommandResult {
        if self.session.sender().is_some() {
            self.reply(503, &["Duplicate MAIL command"]).await?;
            return Err(self.diagnostic("Duplicate MAIL command"));
        }
        let sender = match extract_path(args, "FROM:") {
            Some(sender) => sender,
            None => {
                self.reply(501, &["Missing sender"]).await?;
                return Err(self.diagnostic("Syntax error in MAIL command").escalated());
            }
        };
        self.session.set_sender(sender);
        self.reply(250, &["Ok"]).await?;
        Ok(Next::Continue)
    }

    async fn handle_rcpt(&mut self, args: &str) -> CommandResult {
        if self.session.sender().is_none() {
            self.reply(501, &["No sender specified"]).await?;
            return Err(self.diagnostic("RCPT without MAIL"));
        }
        let recipient = match extract_path(args, "TO:") {
            Some(recipient) => recipient,
            None => {
                self.reply(501, &["Missing recipient"]).await?;
                return Err(self.diagnostic("Syntax error in RCPT command"));
            }
        };
        if !self.gateway.config.valid_recipients.is_match(recipient) {
            let err = self.diagnostic("Relay access denied").with("recipient", recipient);
            self.reply(550, &["Relay access denied"]).await?;
            return Err(err);
        }
        self.session.add_recipient(recipient);
        self.reply(250, &["Ok"]).await?;
        Ok(Next::Continue)
    }

    fn received_header(&self) -> String {
        format!(
            "Received: from {} ({})\r\n\tby {} with {};\r\n\t{}\r\n",
            self.session.helo.as_deref().unwrap_or("unknown"),
            self.session.client_addr.ip(),
            self.session.hostname,
            self.session.protocol(),
            Local::now().to_rfc2822()
        )
    }

    async fn handle_data(&mut self) -> CommandResult {
        let gateway = self.gateway;
        let config = &gateway.config;

        let sender = match self.session.sender() {
            Some(sender) => sender.to_string(),
            None => {
                self.reply(503, &["No sender specified"]).await?;
                return Err(self.diagnostic("DATA without MAIL"));
            }
        };
        if self.session.recipients().is_empty() {
            self.reply(503, &["No recipients specified"]).await?;
            return Err(self.diagnostic("DATA without RCPT"));
        }

        self.reply(354, &["End data with <CR><LF>.<CR><LF>"]).await?;
        let body = match self.conn.read_dot_body(config.timeouts.data, config.max_message_size).await {
            Ok(body) => body,
            Err(e) => {
                let text = match e {
                    ConnectionError::BodyTooLarge(_) => "Message too large",
                    _ => "Error reading message data",
                };
                let mut err = self.diagnostic("Error reading mail data").with("error", e.to_string());
                let replied = self.conn.reply(501, &[text]).await;
                if !e.is_recoverable() || replied.is_err() {
                    err = err.fatal();
                }
                return Err(err);
            }
        };

        if let Some(evidence) = gateway.blacklist.check(self.session.client_addr.ip()).await {
            let err = self.diagnostic("DNSBL check positive").with("dnsbl", evidence);
            self.session.reset();
            self.reply(554, &["Transaction failed, client host is blacklisted"]).await?;
            return Err(err);
        }

        let recipients = match &config.override_recipient {
            Some(recipient) => vec![recipient.clone()],
            None => self.session.recipients().to_vec(),
        };
        let body = if config.received_header {
            let mut message = self.received_header().into_bytes();
            message.extend_from_slice(&body);
            message
        } else {
            body
        };

        if let Err(e) = gateway.relay.submit(&sender, &recipients, &body).await {
            let err = self.diagnostic("Error delivering mail").with("error", e.to_string());
            if e.is_permanent() {
                // Le relais refusera toujours cette enveloppe.
                self.session.reset();
                self.reply(553, &["Mailbox name not allowed"]).await?;
            } else {
                self.reply(450, &["Error delivering the mail, try again later"]).await?;
            }
            return Err(err);
        }

        info!("{}", self.diagnostic("Mail sent").with("size", body.len().to_string()));
        self.session.reset();
        self.reply(250, &["Ok"]).await?;
        Ok(Next::Continue)
    }
}
