use std::future::Future;
use std::io::BufWriter;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use crate::address::EmailAddress;
use crate::archive::MboxWriter;
use crate::config::{ArchiveOrder, BackupConfig, Config, ParseErrorPolicy};
use crate::error::{BackupError, Result};
use crate::mail::decompose::decompose;
use crate::mail::producer::{self, FetchOptions, Reorder};
use crate::mail::{Connector, MailboxInfo, RawMessage, SequenceRange, SessionClient};
use crate::resolver::{DomainTable, ServerAddress};

/// What a `get` run was asked to do.
#[derive(Clone, Debug)]
pub struct GetRequest {
    pub email: String,
    pub mailbox: String,
    pub location: PathBuf,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Completed(Summary),
    /// The account has no such mailbox; nothing was written.
    MailboxNotFound(String),
}

#[derive(Debug, PartialEq, Eq)]
pub struct Summary {
    pub path: PathBuf,
    pub total: u32,
    pub written: usize,
    pub skipped: usize,
}

pub struct App<C> {
    connector: Arc<C>,
    domains: DomainTable,
    settings: BackupConfig,
}

/// Runs `f` against the session on a blocking thread and hands the session back.
async fn on_session<S, T, F>(mut session: S, f: F) -> Result<(S, Result<T>)>
where
    S: SessionClient + 'static,
    T: Send + 'static,
    F: FnOnce(&mut S) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let res = f(&mut session);
        (session, res)
    })
    .await
    .map_err(|e| BackupError::Fetch(format!("session task failed: {e}")))
}

async fn logout<S: SessionClient + 'static>(session: S) {
    match on_session(session, |s| s.logout()).await {
        Ok((_, Ok(()))) => tracing::debug!("logged out"),
        Ok((_, Err(e))) | Err(e) => tracing::warn!("logout: {e}"),
    }
}

impl<C: Connector + 'static> App<C> {
    pub fn new(connector: C, config: &Config) -> Self {
        Self {
            connector: Arc::new(connector),
            domains: DomainTable::new(&config.domains),
            settings: config.backup.clone(),
        }
    }

    async fn connect(&self, server: ServerAddress, login: String, password: String) -> Result<C::Session> {
        let mut attempt = 0;

        loop {
            let connector = self.connector.clone();
            let (srv, user, pass) = (server.clone(), login.clone(), password.clone());
            let res = tokio::task::spawn_blocking(move || connector.connect(&srv, &user, &pass))
                .await
                .map_err(|e| BackupError::Connection {
                    server: server.to_string(),
                    reason: e.to_string(),
                })?;

            match res {
                Err(e @ BackupError::Connection { .. }) if attempt < self.settings.connect_retries => {
                    attempt += 1;
                    let wait = self.settings.retry_backoff() * attempt;
                    tracing::warn!("{e}; retry {attempt}/{} in {wait:?}", self.settings.connect_retries);
                    tokio::time::sleep(wait).await;
                }
                Ok(session) => {
                    println!("  * Client connected to {server}");
                    return Ok(session);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Parses and resolves the address before asking for a password.
    async fn open(&self, email: &str, password: impl FnOnce() -> Result<String>) -> Result<(EmailAddress, C::Session)> {
        let address = EmailAddress::parse(email)?;
        let server = match self.domains.resolve(address.domain()) {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(supported = ?self.domains.domains().collect::<Vec<_>>(), "domain lookup failed");
                return Err(e);
            }
        };
        let password = password()?;
        let session = self.connect(server, address.to_string(), password).await?;
        Ok((address, session))
    }

    pub async fn mailboxes(&self, email: &str, password: impl FnOnce() -> Result<String>) -> Result<Vec<MailboxInfo>> {
        let (_, session) = self.open(email, password).await?;
        let (session, res) = on_session(session, |s| s.list_mailboxes()).await?;
        logout(session).await;
        res
    }

    /// Backs up one mailbox into a fresh mbox file.
    ///
    /// `interrupt` resolving stops the run after the record being written,
    /// keeping the archive readable but flagged as incomplete.
    pub async fn backup(
        &self,
        req: &GetRequest,
        password: impl FnOnce() -> Result<String>,
        interrupt: impl Future<Output = ()>,
    ) -> Result<Outcome> {
        let (address, session) = self.open(&req.email, password).await?;

        let (session, catalog) = on_session(session, |s| s.list_mailboxes()).await?;
        let catalog = match catalog {
            Ok(c) => c,
            Err(e) => {
                logout(session).await;
                return Err(e);
            }
        };
        if !catalog.iter().any(|m| m.name == req.mailbox) {
            tracing::info!(mailbox = %req.mailbox, "mailbox not in catalog");
            logout(session).await;
            return Ok(Outcome::MailboxNotFound(req.mailbox.clone()));
        }

        let mailbox = req.mailbox.clone();
        let (session, count) = on_session(session, move |s| s.select(&mailbox)).await?;
        let total = match count {
            Ok(n) => n,
            Err(e) => {
                logout(session).await;
                return Err(e);
            }
        };
        tracing::info!(mailbox = %req.mailbox, messages = total, "selected");

        let path = req.location.join(address.archive_file_name(&req.mailbox));
        let archive = match MboxWriter::create(&path) {
            Ok(a) => a,
            Err(e) => {
                logout(session).await;
                return Err(e);
            }
        };

        let range = SequenceRange::whole_mailbox(total);
        let stream = producer::spawn(
            session,
            range,
            FetchOptions {
                capture: self.settings.capture,
                channel_capacity: self.settings.channel_capacity,
                batch_size: self.settings.fetch_batch,
            },
        );

        self.drain(stream, archive, range, interrupt).await
    }

    async fn drain(
        &self,
        mut stream: producer::MessageStream<C::Session>,
        mut archive: MboxWriter<BufWriter<File>>,
        range: SequenceRange,
        interrupt: impl Future<Output = ()>,
    ) -> Result<Outcome> {
        let total = range.len();
        let mut reorder = (self.settings.order == ArchiveOrder::Sequence)
            .then(|| Reorder::new(range, self.settings.fetch_batch as usize));
        let mut drained = 0u32;
        let mut skipped = 0usize;
        tokio::pin!(interrupt);

        let failure = 'drain: loop {
            let item = tokio::select! {
                item = stream.next(self.settings.drain_timeout()) => item,
                _ = &mut interrupt => Some(Err(BackupError::Cancelled)),
            };

            let ready = match item {
                None => match reorder.as_mut() {
                    Some(r) if r.held() > 0 => {
                        tracing::warn!(held = r.held(), "sequence gaps at end of stream");
                        r.drain()
                    }
                    _ => break None,
                },
                Some(Err(e)) => break Some(e),
                Some(Ok(raw)) => match reorder.as_mut() {
                    Some(r) => r.push(raw),
                    None => vec![raw],
                },
            };

            for raw in ready {
                drained += 1;
                match self.archive_one(&mut archive, &raw, drained, total) {
                    Ok(true) => {}
                    Ok(false) => skipped += 1,
                    Err(e) => break 'drain Some(e),
                }
            }
        };

        let written = archive.records();
        let path = archive.path().to_path_buf();
        let closed = archive.finish();

        match stream.close(self.settings.close_grace()).await {
            Ok(Some(session)) => logout(session).await,
            Ok(None) => {}
            Err(e) => tracing::warn!("{e}"),
        }

        let failure = match (failure, closed) {
            (None, Ok(_)) => None,
            (None, Err(e)) => Some(e),
            (Some(e), Ok(_)) => Some(e),
            (Some(e), Err(flush)) => {
                tracing::warn!("{flush}");
                Some(e)
            }
        };
        // the archive exists from here on, so any failure leaves it partial
        if let Some(e) = failure {
            flag_incomplete(&path, written, total);
            return Err(e);
        }

        if skipped > 0 {
            println!("  ! skipped {skipped} unparsable message(s)");
        }
        Ok(Outcome::Completed(Summary {
            path,
            total,
            written,
            skipped,
        }))
    }

    /// Writes one record; `Ok(false)` means the message was skipped.
    fn archive_one(
        &self,
        archive: &mut MboxWriter<BufWriter<File>>,
        raw: &RawMessage,
        i: u32,
        total: u32,
    ) -> Result<bool> {
        println!("  * Writing email {i} of {total}");

        let parsed = match decompose(raw, self.settings.capture) {
            Ok(p) => p,
            Err(e) if self.settings.on_parse_error == ParseErrorPolicy::Skip => {
                tracing::warn!("skipping: {e}");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let mut record = archive.begin_record(&parsed.sender, parsed.timestamp)?;
        for h in &parsed.headers {
            record.write_header(h)?;
        }
        record.write(b"\n")?;
        for part in &parsed.parts {
            record.write(part)?;
        }
        record.finish()?;
        tracing::debug!(seq = parsed.seq, parts = parsed.parts.len(), "archived");
        Ok(true)
    }
}

fn flag_incomplete(path: &std::path::Path, written: usize, total: u32) {
    let mut flagged = path.as_os_str().to_owned();
    flagged.push(".incomplete");
    let flagged = PathBuf::from(flagged);

    match std::fs::rename(path, &flagged) {
        Ok(()) => eprintln!(
            "  ! archive incomplete: {written} of {total} messages kept in {}",
            flagged.display()
        ),
        Err(e) => {
            tracing::warn!("could not rename {}: {e}", path.display());
            eprintln!(
                "  ! archive incomplete: {written} of {total} messages kept in {}",
                path.display()
            );
        }
    }
}
