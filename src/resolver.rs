use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{BackupError, Result};

const STARTTLS_PORT: u16 = 143;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn wants_starttls(&self) -> bool {
        self.port == STARTTLS_PORT
    }
}

impl FromStr for ServerAddress {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || BackupError::Config(format!("{s:?} is not a host:port server address"));
        let (host, port) = s.trim().rsplit_once(':').ok_or_else(bad)?;
        if host.is_empty() {
            return Err(bad());
        }
        let port = port.parse().map_err(|_| bad())?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Static email domain to IMAP server mapping, built once from configuration.
#[derive(Clone, Debug, Default)]
pub struct DomainTable {
    entries: BTreeMap<String, String>,
}

impl DomainTable {
    pub fn new(entries: &BTreeMap<String, String>) -> Self {
        let entries = entries
            .iter()
            .map(|(domain, server)| (domain.to_ascii_lowercase(), server.clone()))
            .collect();
        Self { entries }
    }

    pub fn resolve(&self, domain: &str) -> Result<ServerAddress> {
        match self.entries.get(&domain.to_ascii_lowercase()) {
            Some(server) => server.parse(),
            None => Err(BackupError::UnsupportedDomain(domain.to_string())),
        }
    }

    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}
