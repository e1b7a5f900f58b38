use std::str::FromStr;

use crate::error::{BackupError, Result};

/// A parsed account address, split once at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmailAddress {
    local_part: String,
    domain: String,
}

impl EmailAddress {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let parsed = email_address::EmailAddress::from_str(raw).map_err(|e| {
            BackupError::AddressParse {
                address: raw.to_string(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            local_part: parsed.local_part().to_string(),
            domain: parsed.domain().to_string(),
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// `alice.smith@gmail.com` + `inbox` gives `alice_smith_AT_gmail_com_inbox.mbox`.
    pub fn archive_file_name(&self, mailbox: &str) -> String {
        format!(
            "{}_AT_{}_{}.mbox",
            self.local_part.replace('.', "_"),
            self.domain.replace('.', "_"),
            sanitize_mailbox(mailbox)
        )
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local_part, self.domain)
    }
}

// Hierarchical names like `[Gmail]/Sent Mail` must not escape the output directory.
fn sanitize_mailbox(mailbox: &str) -> String {
    mailbox
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect()
}
