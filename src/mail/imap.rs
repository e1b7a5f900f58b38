use native_tls::{TlsConnector, TlsStream};
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::config::CaptureMode;
use crate::error::{BackupError, Result};
use crate::mail::{Connector, MailboxInfo, RawMessage, SequenceRange, SessionClient};
use crate::resolver::ServerAddress;

type ImapSession = imap::Session<TlsStream<TcpStream>>;

fn is_localhost(host: &str) -> bool {
    host == "127.0.0.1" || host == "localhost"
}

fn tls_connector_for(server: &ServerAddress) -> std::result::Result<TlsConnector, native_tls::Error> {
    let mut b = TlsConnector::builder();

    // local bridges present self-signed certificates
    if is_localhost(&server.host) {
        b.danger_accept_invalid_certs(true);
        b.danger_accept_invalid_hostnames(true);
    }

    b.build()
}

/// Opens TLS IMAP sessions with `imap` + `native-tls`.
pub struct ImapConnector {
    /// Socket read/write timeout, applied to every server round trip.
    pub io_timeout: Option<Duration>,
}

impl ImapConnector {
    fn open(&self, server: &ServerAddress) -> std::result::Result<imap::Client<TlsStream<TcpStream>>, String> {
        let tls = tls_connector_for(server).map_err(|e| e.to_string())?;

        let addr = (server.host.as_str(), server.port)
            .to_socket_addrs()
            .map_err(|e| e.to_string())?
            .next()
            .ok_or_else(|| format!("{} did not resolve", server.host))?;

        let tcp = match self.io_timeout {
            Some(t) => TcpStream::connect_timeout(&addr, t),
            None => TcpStream::connect(addr),
        }
        .map_err(|e| e.to_string())?;
        tcp.set_read_timeout(self.io_timeout).map_err(|e| e.to_string())?;
        tcp.set_write_timeout(self.io_timeout).map_err(|e| e.to_string())?;

        // STARTTLS / TLS
        let client = if server.wants_starttls() {
            let mut plain = imap::Client::new(tcp);
            plain.read_greeting().map_err(|e| e.to_string())?;
            plain.secure(&server.host, &tls).map_err(|e| e.to_string())?
        } else {
            let stream = tls.connect(&server.host, tcp).map_err(|e| e.to_string())?;
            let mut client = imap::Client::new(stream);
            client.read_greeting().map_err(|e| e.to_string())?;
            client
        };

        Ok(client)
    }
}

impl Connector for ImapConnector {
    type Session = ImapSessionClient;

    fn connect(&self, server: &ServerAddress, login: &str, password: &str) -> Result<Self::Session> {
        let client = self.open(server).map_err(|reason| BackupError::Connection {
            server: server.to_string(),
            reason,
        })?;

        let session = client.login(login, password).map_err(|(e, _)| match e {
            imap::error::Error::No(msg) | imap::error::Error::Bad(msg) => {
                BackupError::Authentication(msg)
            }
            other => BackupError::Connection {
                server: server.to_string(),
                reason: other.to_string(),
            },
        })?;

        Ok(ImapSessionClient {
            session,
            io_timeout: self.io_timeout.unwrap_or_default(),
        })
    }
}

pub struct ImapSessionClient {
    session: ImapSession,
    io_timeout: Duration,
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn fetch_error(e: imap::error::Error, after: Duration) -> BackupError {
    match e {
        imap::error::Error::Io(ref io) if is_timeout(io) => BackupError::Timeout {
            what: "server fetch",
            after,
        },
        other => BackupError::Fetch(other.to_string()),
    }
}

fn fetch_query(capture: CaptureMode) -> &'static str {
    match capture {
        CaptureMode::Full => "(BODY.PEEK[] INTERNALDATE)",
        CaptureMode::Headers => "(BODY.PEEK[HEADER] INTERNALDATE)",
    }
}

impl SessionClient for ImapSessionClient {
    fn list_mailboxes(&mut self) -> Result<Vec<MailboxInfo>> {
        let names = self
            .session
            .list(Some(""), Some("*"))
            .map_err(|e| BackupError::Fetch(format!("LIST: {e}")))?;

        Ok(names
            .iter()
            .map(|n| MailboxInfo {
                name: n.name().to_string(),
                selectable: !n.attributes().contains(&imap::types::NameAttribute::NoSelect),
            })
            .collect())
    }

    fn select(&mut self, mailbox: &str) -> Result<u32> {
        let mbox = self
            .session
            .select(mailbox)
            .map_err(|e| BackupError::Fetch(format!("SELECT {mailbox}: {e}")))?;
        Ok(mbox.exists)
    }

    fn fetch(&mut self, range: SequenceRange, capture: CaptureMode) -> Result<Vec<RawMessage>> {
        let fetches = self
            .session
            .fetch(range.to_sequence_set(), fetch_query(capture))
            .map_err(|e| fetch_error(e, self.io_timeout))?;

        let mut out = Vec::with_capacity(fetches.len());
        for f in fetches.iter() {
            let bytes = match capture {
                CaptureMode::Full => f.body(),
                CaptureMode::Headers => f.header(),
            };
            let bytes = bytes.ok_or_else(|| {
                BackupError::Fetch(format!("no content returned for message {}", f.message))
            })?;

            out.push(RawMessage {
                seq: f.message,
                body: bytes.to_vec(),
                internal_date: f.internal_date(),
            });
        }
        Ok(out)
    }

    fn logout(&mut self) -> Result<()> {
        self.session
            .logout()
            .map_err(|e| BackupError::Fetch(format!("LOGOUT: {e}")))
    }
}
