//! Vérification des listes noires DNS (RFC 5782).
//!
//! L'adresse du client est inversée octet par octet (IPv4) ou quartet par
//! quartet (IPv6) puis préfixée à chaque zone configurée. Une zone liste le
//! client quand ce nom se résout en au moins une adresse.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;
use trust_dns_resolver::error::ResolveError;
use trust_dns_resolver::TokioAsyncResolver;

#[derive(Debug, Error)]
pub enum DnsblError {
    #[error("lookup failed: {0}")]
    Lookup(#[from] ResolveError),
}

/// Résout un nom d'hôte en adresses.
#[async_trait]
pub trait HostLookup: Send + Sync {
    async fn lookup_host(&self, name: &str) -> Result<Vec<IpAddr>, DnsblError>;
}

/// [`HostLookup`] basé sur la configuration DNS du système.
pub struct SystemResolver {
    inner: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn from_system_conf() -> Result<Self, DnsblError> {
        Ok(Self {
            inner: TokioAsyncResolver::tokio_from_system_conf()?,
        })
    }
}

#[async_trait]
impl HostLookup for SystemResolver {
    async fn lookup_host(&self, name: &str) -> Result<Vec<IpAddr>, DnsblError> {
        let response = self.inner.lookup_ip(name).await?;
        Ok(response.iter().collect())
    }
}

/// Zone DNSBL configurée, sous forme absolue (point final).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlacklistEntry(String);

impl BlacklistEntry {
    /// Renvoie `None` pour une zone vide.
    pub fn new(zone: &str) -> Option<Self> {
        let zone = zone.trim().trim_end_matches('.');
        if zone.is_empty() {
            return None;
        }
        Some(Self(format!("{}.", zone)))
    }

    /// Lit une liste de zones séparées par des blancs, en ignorant les vides.
    pub fn parse_list(zones: &str) -> Vec<Self> {
        zones.split_whitespace().filter_map(Self::new).collect()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlacklistEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Préfixe d'adresse inversée servant à construire les noms interrogés.
pub fn reverse_prefix(address: IpAddr) -> String {
    let address = match address {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(address),
        v4 => v4,
    };
    match address {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            format!("{}.{}.{}.{}", octets[3], octets[2], octets[1], octets[0])
        }
        IpAddr::V6(v6) => {
            let mut nibbles = Vec::with_capacity(32);
            for byte in v6.octets().iter().rev() {
                nibbles.push(format!("{:x}", byte & 0x0f));
                nibbles.push(format!("{:x}", byte >> 4));
            }
            nibbles.join(".")
        }
    }
}

/// Nom complet interrogé pour `address` dans `zone`.
pub fn query_name(address: IpAddr, zone: &BlacklistEntry) -> String {
    format!("{}.{}", reverse_prefix(address), zone)
}

/// Zones DNSBL ordonnées et le résolveur qui les interroge.
#[derive(Clone)]
pub struct Blacklist {
    zones: Vec<BlacklistEntry>,
    lookup: Arc<dyn HostLookup>,
}

impl Blacklist {
    pub fn new(zones: Vec<BlacklistEntry>, lookup: Arc<dyn HostLookup>) -> Self {
        Self { zones, lookup }
    }

    pub fn zones(&self) -> &[BlacklistEntry] {
        &self.zones
    }

    /// Teste `address` contre chaque zone dans l'ordre et renvoie la preuve
    /// de la première zone qui la liste.
    pub async fn check(&self, address: IpAddr) -> Option<String> {
        for zone in &self.zones {
            let name = query_name(address, zone);
            match self.lookup.lookup_host(&name).await {
                Ok(hosts) if !hosts.is_empty() => {
                    let hosts: Vec<String> = hosts.iter().map(IpAddr::to_string).collect();
                    return Some(format!("{} returned {}", zone, hosts.join(", ")));
                }
                Ok(_) => debug!(%name, "DNSBL query returned no address"),
                Err(e) => debug!(%name, error = %e, "DNSBL query failed, treating as not listed"),
            }
        }
        None
    }
}
