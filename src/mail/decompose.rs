//! Splits one fetched message into header fields and raw MIME leaf bodies.

use chrono::{DateTime, TimeZone, Utc};
use mailparse::{body::Body, MailHeaderMap, ParsedMail};

use crate::config::CaptureMode;
use crate::error::{BackupError, Result};
use crate::mail::{HeaderField, ParsedMessage, RawMessage};

/// Separator identity used when a message has no usable `From` header.
pub const UNKNOWN_SENDER: &str = "MAILER-DAEMON";

pub fn decompose(raw: &RawMessage, capture: CaptureMode) -> Result<ParsedMessage> {
    let parse_err = |reason: String| BackupError::Parse {
        seq: raw.seq,
        reason,
    };

    if raw.body.iter().all(u8::is_ascii_whitespace) {
        return Err(parse_err("empty message".to_string()));
    }

    let parsed = mailparse::parse_mail(&raw.body).map_err(|e| parse_err(e.to_string()))?;

    let headers = parsed
        .headers
        .iter()
        .map(|h| HeaderField {
            key: h.get_key(),
            value: h.get_value_raw().to_vec(),
        })
        .collect();

    let sender = sender_of(&parsed);
    let timestamp = timestamp_of(&parsed, raw);

    let mut parts = Vec::new();
    if capture == CaptureMode::Full {
        collect_leaves(&parsed, &mut parts);
    }

    Ok(ParsedMessage {
        seq: raw.seq,
        sender,
        timestamp,
        headers,
        parts,
    })
}

fn sender_of(m: &ParsedMail) -> String {
    let Some(from) = m.headers.get_first_header("From") else {
        return UNKNOWN_SENDER.to_string();
    };

    if let Ok(list) = mailparse::addrparse_header(from) {
        let first = list.iter().find_map(|a| match a {
            mailparse::MailAddr::Single(s) => Some(s),
            mailparse::MailAddr::Group(g) => g.addrs.first(),
        });
        if let Some(s) = first.filter(|s| !s.addr.is_empty()) {
            return s.addr.clone();
        }
    }

    // the separator line is space-delimited
    let fallback: String = from.get_value().split_whitespace().collect();
    if fallback.is_empty() {
        UNKNOWN_SENDER.to_string()
    } else {
        fallback
    }
}

/// `Date` header, then the server's INTERNALDATE, then the Unix epoch.
fn timestamp_of(m: &ParsedMail, raw: &RawMessage) -> DateTime<Utc> {
    let from_header = m
        .headers
        .get_first_value("Date")
        .and_then(|d| mailparse::dateparse(&d).ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

    if let Some(ts) = from_header {
        return ts;
    }

    tracing::debug!(seq = raw.seq, "no usable Date header, falling back");
    raw.internal_date
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_default()
}

/// Leaf bodies in document order, each ending in a line break.
///
/// A multipart delimiter owns the CRLF in front of it, so the parser hands
/// back leaves without their last line break. It is put back here so the
/// archived body reads as the parts laid end to end.
fn collect_leaves(m: &ParsedMail, out: &mut Vec<Vec<u8>>) {
    if m.subparts.is_empty() {
        let mut body = raw_body(m);
        if !body.is_empty() && !body.ends_with(b"\n") {
            body.extend_from_slice(b"\r\n");
        }
        out.push(body);
        return;
    }
    for sp in &m.subparts {
        collect_leaves(sp, out);
    }
}

// Bytes as sent, still transfer-encoded.
fn raw_body(m: &ParsedMail) -> Vec<u8> {
    match m.get_body_encoded() {
        Body::Base64(b) | Body::QuotedPrintable(b) => b.get_raw().to_vec(),
        Body::SevenBit(b) | Body::EightBit(b) => b.get_raw().to_vec(),
        Body::Binary(b) => b.get_raw().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    fn raw(seq: u32, body: &str) -> RawMessage {
        RawMessage {
            seq,
            body: body.as_bytes().to_vec(),
            internal_date: None,
        }
    }

    const SIMPLE: &str = "Received: from a\r\n\
From: Alice Smith <alice.smith@gmail.com>\r\n\
Received: from b\r\n\
Subject: hello\r\n\
Date: Tue, 1 Jul 2003 10:52:37 +0200\r\n\
\r\n\
line one\r\n\
line two\r\n";

    #[test]
    fn headers_keep_order_case_and_duplicates() {
        let p = decompose(&raw(1, SIMPLE), CaptureMode::Full).unwrap();
        let keys: Vec<_> = p.headers.iter().map(|h| h.key.as_str()).collect();
        assert_eq!(keys, ["Received", "From", "Received", "Subject", "Date"]);
        assert_eq!(p.headers[0].value, b"from a");
        assert_eq!(p.headers[2].value, b"from b");
    }

    #[test]
    fn sender_and_date_feed_the_separator() {
        let p = decompose(&raw(1, SIMPLE), CaptureMode::Full).unwrap();
        assert_eq!(p.sender, "alice.smith@gmail.com");
        assert_eq!(p.timestamp.to_rfc3339(), "2003-07-01T08:52:37+00:00");
    }

    #[test]
    fn single_part_body_is_one_part() {
        let p = decompose(&raw(1, SIMPLE), CaptureMode::Full).unwrap();
        assert_eq!(p.parts.len(), 1);
        assert_eq!(p.parts[0], b"line one\r\nline two\r\n");
    }

    #[test]
    fn headers_capture_has_no_parts() {
        let p = decompose(&raw(1, SIMPLE), CaptureMode::Headers).unwrap();
        assert!(p.parts.is_empty());
        assert_eq!(p.headers.len(), 5);
    }

    #[test]
    fn multipart_leaves_are_raw_and_ordered() {
        let msg = "From: bob@nyu.edu\r\n\
Content-Type: multipart/mixed; boundary=\"outer\"\r\n\
\r\n\
--outer\r\n\
Content-Type: text/plain\r\n\
\r\n\
plain text\r\n\
--outer\r\n\
Content-Type: multipart/alternative; boundary=\"inner\"\r\n\
\r\n\
--inner\r\n\
Content-Type: text/html\r\n\
\r\n\
<p>html</p>\r\n\
--inner--\r\n\
--outer\r\n\
Content-Type: application/octet-stream\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
aGVsbG8=\r\n\
--outer--\r\n";
        let p = decompose(&raw(2, msg), CaptureMode::Full).unwrap();
        assert_eq!(p.parts.len(), 3);
        assert_eq!(p.parts[0], b"plain text\r\n");
        assert_eq!(p.parts[1], b"<p>html</p>\r\n");
        assert_eq!(p.parts[2], b"aGVsbG8=\r\n");
    }

    #[test]
    fn unterminated_single_part_gets_a_line_break() {
        let p = decompose(&raw(7, "Subject: x\r\n\r\nno newline"), CaptureMode::Full).unwrap();
        assert_eq!(p.parts, [b"no newline\r\n".to_vec()]);
    }

    #[test]
    fn missing_date_uses_internal_date() {
        let mut m = raw(3, "From: carol@gmail.com\r\nSubject: x\r\n\r\nbody\r\n");
        let internal = FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2024, 2, 29, 12, 0, 0)
            .unwrap();
        m.internal_date = Some(internal);
        let p = decompose(&m, CaptureMode::Full).unwrap();
        assert_eq!(p.timestamp, internal.with_timezone(&Utc));
    }

    #[test]
    fn missing_date_and_internal_date_is_epoch() {
        let p = decompose(
            &raw(4, "From: carol@gmail.com\r\nDate: not a date\r\n\r\nbody\r\n"),
            CaptureMode::Full,
        )
        .unwrap();
        assert_eq!(p.timestamp, DateTime::<Utc>::default());
        assert_eq!(p.timestamp.timestamp(), 0);
    }

    #[test]
    fn missing_from_uses_placeholder_sender() {
        let p = decompose(&raw(5, "Subject: x\r\n\r\nbody\r\n"), CaptureMode::Full).unwrap();
        assert_eq!(p.sender, UNKNOWN_SENDER);
    }

    #[test]
    fn empty_message_is_a_parse_error() {
        let err = decompose(&raw(6, "\r\n"), CaptureMode::Full).unwrap_err();
        assert!(matches!(err, BackupError::Parse { seq: 6, .. }));
    }
}
