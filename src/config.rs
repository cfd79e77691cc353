use crate::dnsbl::BlacklistEntry;
use crate::Opt;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;

/// Premier descripteur transmis par l'activation de socket systemd.
pub const SD_LISTEN_FDS_START: i32 = 3;

/// 150 Mio, la plus grande taille de message acceptée par Gmail.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 150 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Délai de grâce avant que le client ait le droit de parler.
    pub greeting: Duration,
    pub command: Duration,
    pub data: Duration,
    /// Inactivité au bout de laquelle un client englué est libéré.
    pub tarpit: Duration,
    pub write: Duration,
    pub delivery: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            greeting: Duration::from_secs(5),
            command: Duration::from_secs(30),
            data: Duration::from_secs(5 * 60),
            tarpit: Duration::from_secs(5 * 60),
            write: Duration::from_secs(30),
            delivery: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listen {
    Address(String),
    /// Socket hérité via l'activation systemd.
    Inherited(i32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Configuration de démarrage, immuable une fois construite.
#[derive(Debug, Clone)]
pub struct Config {
    pub hostname: String,
    pub relay_host: String,
    pub valid_recipients: Regex,
    pub dnsbl_zones: Vec<BlacklistEntry>,
    pub override_recipient: Option<String>,
    pub tls: Option<TlsFiles>,
    pub listen: Listen,
    pub max_message_size: usize,
    pub received_header: bool,
    pub timeouts: Timeouts,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl Config {
    pub fn from_opt(opt: &Opt) -> Result<Self> {
        let relay_host = opt.relay_host.trim().to_string();
        if relay_host.is_empty() {
            bail!("No RELAY_HOST given");
        }

        let pattern = opt.valid_recipients.as_deref().unwrap_or("");
        let valid_recipients =
            Regex::new(pattern).with_context(|| format!("Invalid regular expression VALID_RECIPIENTS: {:?}", pattern))?;

        let tls = match (&opt.tls_cert, &opt.tls_key) {
            (Some(cert), Some(key)) => Some(TlsFiles {
                cert: cert.clone(),
                key: key.clone(),
            }),
            (None, None) => None,
            (Some(_), None) => bail!("SERVER_CERT given without SERVER_KEY"),
            (None, Some(_)) => bail!("SERVER_KEY given without SERVER_CERT"),
        };

        let hostname = match non_empty(&opt.hostname) {
            Some(hostname) => hostname,
            None => gethostname::gethostname().to_string_lossy().into_owned(),
        };

        let listen = listen_mode(
            std::env::var("LISTEN_PID").ok().as_deref(),
            std::env::var("LISTEN_FDS").ok().as_deref(),
            std::process::id(),
            &opt.address,
        )?;

        let timeouts = Timeouts {
            delivery: Duration::from_secs(opt.delivery_timeout),
            ..Timeouts::default()
        };

        Ok(Self {
            hostname,
            relay_host,
            valid_recipients,
            dnsbl_zones: BlacklistEntry::parse_list(opt.dnsbl_domains.as_deref().unwrap_or("")),
            override_recipient: non_empty(&opt.override_recipient),
            tls,
            listen,
            max_message_size: opt.max_message_size.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE),
            received_header: opt.received_header,
            timeouts,
        })
    }
}

/// Décide d'où vient le socket d'écoute, selon les conventions
/// `sd_listen_fds` de systemd.
pub fn listen_mode(listen_pid: Option<&str>, listen_fds: Option<&str>, pid: u32, address: &str) -> Result<Listen> {
    let listen_pid = match listen_pid.map(str::trim).filter(|v| !v.is_empty()) {
        Some(listen_pid) => listen_pid,
        None => return Ok(Listen::Address(address.to_string())),
    };

    let wanted: u32 = listen_pid
        .parse()
        .map_err(|e| anyhow!("LISTEN_PID is not an integer: {}", e))?;
    if wanted != pid {
        bail!("LISTEN_PID is for process {}, we are {}", wanted, pid);
    }

    let count: u32 = listen_fds
        .unwrap_or("")
        .trim()
        .parse()
        .map_err(|e| anyhow!("LISTEN_FDS is not an integer: {}", e))?;
    if count != 1 {
        bail!("Got {} listening sockets, expected one", count);
    }

    Ok(Listen::Inherited(SD_LISTEN_FDS_START))
}
