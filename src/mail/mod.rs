pub mod decompose;
pub mod imap;
pub mod producer;

use chrono::{DateTime, FixedOffset, Utc};

use crate::config::CaptureMode;
use crate::error::Result;
use crate::resolver::ServerAddress;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailboxInfo {
    pub name: String,
    pub selectable: bool,
}

/// Inclusive range of message sequence numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SequenceRange {
    pub start: u32,
    pub end: u32,
}

impl SequenceRange {
    /// `[1, count]`, empty when the mailbox holds no messages.
    pub fn whole_mailbox(count: u32) -> Self {
        Self { start: 1, end: count }
    }

    pub fn is_empty(&self) -> bool {
        self.start == 0 || self.end < self.start
    }

    pub fn len(&self) -> u32 {
        if self.is_empty() { 0 } else { self.end - self.start + 1 }
    }

    /// Contiguous sub-ranges of at most `size` messages, in ascending order.
    pub fn batches(self, size: u32) -> impl Iterator<Item = SequenceRange> {
        let size = size.max(1);
        let mut next = if self.is_empty() { None } else { Some(self.start) };
        std::iter::from_fn(move || {
            let start = next?;
            let end = start.saturating_add(size - 1).min(self.end);
            next = if end >= self.end { None } else { Some(end + 1) };
            Some(SequenceRange { start, end })
        })
    }

    /// IMAP sequence-set syntax.
    pub fn to_sequence_set(&self) -> String {
        if self.start == self.end {
            self.start.to_string()
        } else {
            format!("{}:{}", self.start, self.end)
        }
    }
}

#[derive(Clone, Debug)]
pub struct RawMessage {
    pub seq: u32,
    pub body: Vec<u8>,
    pub internal_date: Option<DateTime<FixedOffset>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderField {
    pub key: String,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct ParsedMessage {
    pub seq: u32,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub headers: Vec<HeaderField>,
    pub parts: Vec<Vec<u8>>,
}

/// An authenticated session against one mail server.
pub trait SessionClient: Send {
    fn list_mailboxes(&mut self) -> Result<Vec<MailboxInfo>>;

    /// Selects `mailbox` and returns its message count.
    fn select(&mut self, mailbox: &str) -> Result<u32>;

    fn fetch(&mut self, range: SequenceRange, capture: CaptureMode) -> Result<Vec<RawMessage>>;

    fn logout(&mut self) -> Result<()>;
}

pub trait Connector: Send + Sync {
    type Session: SessionClient + 'static;

    fn connect(&self, server: &ServerAddress, login: &str, password: &str) -> Result<Self::Session>;
}
