//! mbox archive writer and sequential reader.
//!
//! Every record starts with a `From <sender> <asctime>` separator line and ends
//! with a blank line. Content lines are stored with LF endings, and any line
//! matching `^>*From ` gets one extra `>` so it cannot be mistaken for a
//! separator (mboxrd quoting). The reader reverses the quoting.

use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{self, BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{BackupError, Result};
use crate::mail::HeaderField;
use crate::mail::decompose::UNKNOWN_SENDER;

const SEPARATOR: &[u8] = b"From ";

fn is_separator(line: &[u8]) -> bool {
    line.starts_with(SEPARATOR)
}

fn needs_quoting(line: &[u8]) -> bool {
    let unquoted = line.iter().position(|&b| b != b'>').unwrap_or(line.len());
    is_separator(&line[unquoted..])
}

fn asctime(ts: &DateTime<Utc>) -> String {
    ts.format("%a %b %e %H:%M:%S %Y").to_string()
}

fn separator_sender(sender: &str) -> String {
    let s: String = sender.split_whitespace().collect();
    if s.is_empty() { UNKNOWN_SENDER.to_string() } else { s }
}

pub struct MboxWriter<W: Write> {
    out: W,
    path: PathBuf,
    records: usize,
}

impl MboxWriter<BufWriter<File>> {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|e| BackupError::archive(path, e))?;
        Ok(Self::new(BufWriter::new(file), path))
    }
}

impl<W: Write> MboxWriter<W> {
    pub fn new(out: W, path: impl Into<PathBuf>) -> Self {
        Self {
            out,
            path: path.into(),
            records: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records fully written so far.
    pub fn records(&self) -> usize {
        self.records
    }

    pub fn begin_record(&mut self, sender: &str, timestamp: DateTime<Utc>) -> Result<RecordWriter<'_, W>> {
        let line = format!("From {} {}\n", separator_sender(sender), asctime(&timestamp));
        self.out
            .write_all(line.as_bytes())
            .map_err(|e| BackupError::archive(&self.path, e))?;

        Ok(RecordWriter {
            archive: self,
            pending: Vec::new(),
            done: false,
            failed: false,
        })
    }

    pub fn finish(mut self) -> Result<W> {
        self.out
            .flush()
            .map_err(|e| BackupError::archive(&self.path, e))?;
        Ok(self.out)
    }
}

/// Content sink for one record. Dropping it without `finish` still closes the record.
///
/// After a failed write the record is abandoned: nothing more is written for
/// it and it is not counted.
pub struct RecordWriter<'a, W: Write> {
    archive: &'a mut MboxWriter<W>,
    pending: Vec<u8>,
    done: bool,
    failed: bool,
}

fn emit<W: Write>(archive: &mut MboxWriter<W>, line: &[u8]) -> Result<()> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let out = &mut archive.out;
    let res = (|| {
        if needs_quoting(line) {
            out.write_all(b">")?;
        }
        out.write_all(line)?;
        out.write_all(b"\n")
    })();
    res.map_err(|e| BackupError::archive(&archive.path, e))
}

impl<W: Write> RecordWriter<'_, W> {
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.failed {
            return Err(BackupError::archive(
                &self.archive.path,
                io::Error::other("record abandoned after a failed write"),
            ));
        }
        self.pending.extend_from_slice(bytes);

        let mut start = 0;
        let mut res = Ok(());
        while let Some(n) = self.pending[start..].iter().position(|&b| b == b'\n') {
            let end = start + n;
            res = emit(self.archive, &self.pending[start..end]);
            start = end + 1;
            if res.is_err() {
                self.failed = true;
                break;
            }
        }
        // lines handed to the writer are never emitted twice, even on failure
        self.pending.drain(..start);
        res
    }

    /// Writes `key: value` as one (possibly folded) header line.
    pub fn write_header(&mut self, field: &HeaderField) -> Result<()> {
        self.write(field.key.as_bytes())?;
        self.write(b": ")?;
        self.write(&field.value)?;
        self.write(b"\n")
    }

    pub fn finish(mut self) -> Result<()> {
        self.close()
    }

    fn close(&mut self) -> Result<()> {
        if self.done || self.failed {
            self.done = true;
            return Ok(());
        }
        self.done = true;

        let res = (|| {
            if !self.pending.is_empty() {
                let line = std::mem::take(&mut self.pending);
                emit(self.archive, &line)?;
            }
            self.archive
                .out
                .write_all(b"\n")
                .map_err(|e| BackupError::archive(&self.archive.path, e))
        })();
        match res {
            Ok(()) => {
                self.archive.records += 1;
                Ok(())
            }
            Err(e) => {
                self.failed = true;
                Err(e)
            }
        }
    }
}

impl<W: Write> Drop for RecordWriter<'_, W> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("closing mbox record: {e}");
        }
    }
}

/// One record read back from an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRecord {
    pub sender: String,
    pub date: String,
    pub headers: Vec<HeaderField>,
    pub body: Vec<u8>,
}

pub struct MboxReader<R: BufRead> {
    input: R,
    separator: Option<Vec<u8>>,
}

impl MboxReader<io::BufReader<File>> {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self::new(io::BufReader::new(File::open(path)?)))
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

impl<R: BufRead> MboxReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            separator: None,
        }
    }

    fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut buf = Vec::new();
        if self.input.read_until(b'\n', &mut buf)? == 0 {
            return Ok(None);
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        Ok(Some(buf))
    }

    fn next_record(&mut self) -> io::Result<Option<ArchiveRecord>> {
        let separator = match self.separator.take() {
            Some(s) => s,
            None => loop {
                match self.read_line()? {
                    None => return Ok(None),
                    Some(l) if is_separator(&l) => break l,
                    Some(l) if l.is_empty() => continue,
                    Some(_) => return Err(invalid("content before first mbox separator")),
                }
            },
        };

        let mut lines = Vec::new();
        while let Some(line) = self.read_line()? {
            if is_separator(&line) {
                self.separator = Some(line);
                break;
            }
            lines.push(unquote(line));
        }
        if lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }

        let (sender, date) = parse_separator(&separator)?;
        let (headers, body) = split_record(lines)?;
        Ok(Some(ArchiveRecord {
            sender,
            date,
            headers,
            body,
        }))
    }
}

impl<R: BufRead> Iterator for MboxReader<R> {
    type Item = io::Result<ArchiveRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

fn unquote(mut line: Vec<u8>) -> Vec<u8> {
    if line.first() == Some(&b'>') && needs_quoting(&line) {
        line.remove(0);
    }
    line
}

fn parse_separator(line: &[u8]) -> io::Result<(String, String)> {
    let text = String::from_utf8_lossy(&line[SEPARATOR.len()..]);
    let (sender, date) = text
        .split_once(' ')
        .ok_or_else(|| invalid("mbox separator without a date"))?;
    Ok((sender.to_string(), date.trim().to_string()))
}

fn split_record(lines: Vec<Vec<u8>>) -> io::Result<(Vec<HeaderField>, Vec<u8>)> {
    let mut headers: Vec<HeaderField> = Vec::new();
    let mut iter = lines.into_iter();

    for line in iter.by_ref() {
        if line.is_empty() {
            break;
        }
        if matches!(line.first(), Some(b' ' | b'\t')) {
            let last = headers
                .last_mut()
                .ok_or_else(|| invalid("continuation line before any header"))?;
            last.value.push(b'\n');
            last.value.extend_from_slice(&line);
            continue;
        }
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| invalid("header line without a colon"))?;
        let value = &line[colon + 1..];
        let value = value.strip_prefix(b" ").unwrap_or(value);
        headers.push(HeaderField {
            key: String::from_utf8_lossy(&line[..colon]).into_owned(),
            value: value.to_vec(),
        });
    }

    let mut body = Vec::new();
    for line in iter {
        body.extend_from_slice(&line);
        body.push(b'\n');
    }
    Ok((headers, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2003, 7, 1, 8, 52, 37).unwrap()
    }

    fn header(key: &str, value: &str) -> HeaderField {
        HeaderField {
            key: key.to_string(),
            value: value.as_bytes().to_vec(),
        }
    }

    fn write_one(headers: &[HeaderField], parts: &[&[u8]]) -> Vec<u8> {
        let mut mbox = MboxWriter::new(Vec::new(), "test.mbox");
        {
            let mut rec = mbox.begin_record("alice@gmail.com", ts()).unwrap();
            for h in headers {
                rec.write_header(h).unwrap();
            }
            rec.write(b"\n").unwrap();
            for p in parts {
                rec.write(p).unwrap();
            }
            rec.finish().unwrap();
        }
        assert_eq!(mbox.records(), 1);
        mbox.finish().unwrap()
    }

    #[test]
    fn record_layout() {
        let out = write_one(&[header("Subject", "hi")], &[b"body\r\n"]);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "From alice@gmail.com Tue Jul  1 08:52:37 2003\nSubject: hi\n\nbody\n\n"
        );
    }

    #[test]
    fn separator_lines_in_body_are_quoted() {
        let out = write_one(&[], &[b"From here\n>From there\nFromage\n"]);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("\n>From here\n>>From there\nFromage\n"), "{text}");
    }

    #[test]
    fn lines_split_across_writes_are_joined() {
        let mut mbox = MboxWriter::new(Vec::new(), "test.mbox");
        let mut rec = mbox.begin_record("a@b.c", ts()).unwrap();
        rec.write(b"\nFr").unwrap();
        rec.write(b"om split\r").unwrap();
        rec.write(b"\nno newline").unwrap();
        drop(rec);
        let text = String::from_utf8(mbox.finish().unwrap()).unwrap();
        assert!(text.ends_with("\n\n>From split\nno newline\n\n"), "{text:?}");
    }

    #[test]
    fn sender_whitespace_is_removed() {
        let mut mbox = MboxWriter::new(Vec::new(), "test.mbox");
        mbox.begin_record("  ", ts()).unwrap().finish().unwrap();
        mbox.begin_record("Alice <a@b.c>", ts()).unwrap().finish().unwrap();
        let text = String::from_utf8(mbox.finish().unwrap()).unwrap();
        assert!(text.starts_with("From MAILER-DAEMON Tue"));
        assert!(text.contains("\nFrom Alice<a@b.c> Tue"));
    }

    #[test]
    fn reader_round_trips_headers_and_body() {
        let headers = vec![
            header("Received", "from a"),
            header("From", "Alice <alice@gmail.com>"),
            header("Received", "from b"),
            header("X-Folded", "first\n\tsecond"),
        ];
        let parts: [&[u8]; 2] = [b"From the start\n", b">From quoted\nend\n"];

        let mut mbox = MboxWriter::new(Vec::new(), "test.mbox");
        for _ in 0..2 {
            let mut rec = mbox.begin_record("alice@gmail.com", ts()).unwrap();
            for h in &headers {
                rec.write_header(h).unwrap();
            }
            rec.write(b"\n").unwrap();
            for p in parts {
                rec.write(p).unwrap();
            }
        }
        let bytes = mbox.finish().unwrap();

        let records: Vec<_> = MboxReader::new(bytes.as_slice())
            .collect::<io::Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        for r in &records {
            assert_eq!(r.sender, "alice@gmail.com");
            assert_eq!(r.date, "Tue Jul  1 08:52:37 2003");
            assert_eq!(r.headers, headers);
            assert_eq!(r.body, parts.concat());
        }
    }

    #[test]
    fn reader_handles_headers_only_and_empty_archives() {
        let out = write_one(&[header("Subject", "x")], &[]);
        let records: Vec<_> = MboxReader::new(out.as_slice())
            .collect::<io::Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].body.is_empty());

        assert_eq!(MboxReader::new(&b""[..]).count(), 0);
    }

    #[test]
    fn reader_rejects_garbage_prefix() {
        let mut r = MboxReader::new(&b"not an mbox\n"[..]);
        assert!(r.next().unwrap().is_err());
    }

    /// Accepts `budget` bytes, then fails every write.
    struct ShortWriter {
        buf: Vec<u8>,
        budget: usize,
    }

    impl Write for ShortWriter {
        fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            let n = bytes.len().min(self.budget);
            self.buf.extend_from_slice(&bytes[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn failed_write_abandons_the_record() {
        let separator = "From alice@gmail.com Tue Jul  1 08:52:37 2003\n";
        let out = ShortWriter {
            buf: Vec::new(),
            budget: separator.len() + "line one\n".len() + 5,
        };
        let mut mbox = MboxWriter::new(out, "test.mbox");
        {
            let mut rec = mbox.begin_record("alice@gmail.com", ts()).unwrap();
            let err = rec.write(b"line one\nline two\nline three\n").unwrap_err();
            assert!(matches!(err, BackupError::ArchiveWrite { .. }));
            assert!(rec.write(b"more\n").is_err());
        }
        assert_eq!(mbox.records(), 0);

        let text = String::from_utf8(mbox.finish().unwrap().buf).unwrap();
        assert_eq!(text, format!("{separator}line one\nline "));
    }

    #[test]
    fn multipart_message_round_trips() {
        use crate::config::CaptureMode;
        use crate::mail::{decompose::decompose, RawMessage};

        let raw = RawMessage {
            seq: 1,
            body: b"From: bob@nyu.edu\r\n\
Content-Type: multipart/mixed; boundary=\"b\"\r\n\
\r\n\
--b\r\n\
Content-Type: text/plain\r\n\
\r\n\
plain text\r\n\
--b\r\n\
Content-Type: text/html\r\n\
\r\n\
<p>html</p>\r\n\
--b--\r\n"
                .to_vec(),
            internal_date: None,
        };
        let parsed = decompose(&raw, CaptureMode::Full).unwrap();

        let mut mbox = MboxWriter::new(Vec::new(), "test.mbox");
        {
            let mut rec = mbox.begin_record(&parsed.sender, parsed.timestamp).unwrap();
            for h in &parsed.headers {
                rec.write_header(h).unwrap();
            }
            rec.write(b"\n").unwrap();
            for p in &parsed.parts {
                rec.write(p).unwrap();
            }
        }
        let bytes = mbox.finish().unwrap();

        let record = MboxReader::new(bytes.as_slice()).next().unwrap().unwrap();
        let expected: Vec<u8> = parsed.parts.concat().into_iter().filter(|&b| b != b'\r').collect();
        assert_eq!(record.body, expected);
        assert_eq!(record.body, b"plain text\n<p>html</p>\n");
    }

    #[test]
    fn create_reports_path_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("x.mbox");
        match MboxWriter::create(&path) {
            Err(BackupError::ArchiveWrite { path: p, .. }) => assert_eq!(p, path),
            Err(other) => panic!("unexpected {other:?}"),
            Ok(_) => panic!("created a file in a missing directory"),
        }
    }
}
