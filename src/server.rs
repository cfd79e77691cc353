use crate::config::{Config, Listen};
use crate::connection::{Connection, NetConnection};
use crate::dnsbl::{Blacklist, SystemResolver};
use crate::proxy::{Next, Proxy};
use crate::relay::{Relay, SmtpRelay};
use crate::tls;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, info_span, warn, Instrument};

/// État partagé, en lecture seule, de la passerelle.
pub struct Gateway {
    pub config: Config,
    pub tls_acceptor: Option<TlsAcceptor>,
    pub blacklist: Blacklist,
    pub relay: Arc<dyn Relay>,
}

impl Gateway {
    pub fn new(config: Config) -> Result<Self> {
        let tls_acceptor = match &config.tls {
            Some(files) => {
                let acceptor = tls::load_acceptor(files)?;
                info!(cert = ?files.cert, "STARTTLS enabled");
                Some(acceptor)
            }
            None => None,
        };

        let resolver = SystemResolver::from_system_conf().context("Failed to load the system resolver configuration")?;
        let blacklist = Blacklist::new(config.dnsbl_zones.clone(), Arc::new(resolver));

        let relay = SmtpRelay::new(&config.relay_host, config.timeouts.delivery)
            .with_context(|| format!("Invalid RELAY_HOST {:?}", config.relay_host))?;

        Ok(Self {
            config,
            tls_acceptor,
            blacklist,
            relay: Arc::new(relay),
        })
    }

    /// Écoute sur l'adresse configurée ou reprend le socket hérité.
    pub async fn listen(&self) -> Result<TcpListener> {
        let listener = match &self.config.listen {
            Listen::Address(address) => TcpListener::bind(address)
                .await
                .with_context(|| format!("Failed to bind to {}", address))?,
            Listen::Inherited(fd) => inherited_listener(*fd)?,
        };
        info!(address = ?listener.local_addr().ok(), "Listening");
        Ok(listener)
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, client_addr)) => {
                    let this = self.clone();
                    let span = info_span!("connection", client = %client_addr);
                    tokio::spawn(
                        async move {
                            let conn = NetConnection::new(stream, client_addr, this.config.timeouts.write);
                            this.handle_client(conn).await;
                        }
                        .instrument(span),
                    );
                }
                Err(e) => warn!("Accept error: {}", e),
            }
        }
    }

    /// Gère un client de l'accueil à la fermeture.
    pub async fn handle_client<C: Connection>(&self, conn: C) {
        debug!("New connection");
        let mut proxy = Proxy::new(self, conn);

        let mut failure = proxy.greet().await.err();
        if failure.is_none() {
            loop {
                match proxy.handle_command().await {
                    Ok(Next::Continue) => {}
                    Ok(Next::Quit) => break,
                    Err(err) if err.escalate() || err.is_fatal() => {
                        failure = Some(err);
                        break;
                    }
                    Err(err) => info!("{}", err),
                }
            }
        }

        let protocol = proxy.session().protocol();
        let conn = proxy.connection_mut();
        if let Some(err) = failure {
            if err.escalate() {
                warn!("{}", err);
                tarpit(conn, self.config.timeouts.tarpit).await;
            } else {
                info!("{}", err);
            }
        }
        conn.close().await;
        debug!(%protocol, "Connection closed");
    }
}

async fn tarpit<C: Connection>(conn: &mut C, idle: Duration) {
    let (bytes, elapsed) = conn.tarpit_drain(idle).await;
    info!(bytes, elapsed_ms = elapsed.as_millis() as u64, "Tarpit released client");
}

#[cfg(unix)]
fn inherited_listener(fd: i32) -> Result<TcpListener> {
    use std::os::unix::io::FromRawFd;

    // SAFETY : le gestionnaire de services nous confie ce descripteur et rien
    // d'autre dans le processus ne le possède.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
        return Err(std::io::Error::last_os_error()).with_context(|| format!("Inherited socket {} is unusable", fd));
    }
    let listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    listener.set_nonblocking(true)?;
    TcpListener::from_std(listener).context("Inherited socket is not a TCP listener")
}

#[cfg(not(unix))]
fn inherited_listener(_fd: i32) -> Result<TcpListener> {
    anyhow::bail!("Socket activation is only supported on Unix")
}
