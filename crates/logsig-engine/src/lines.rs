//! The log file a signature file covers, read one record at a time.

use chrono::DateTime;
use logsig_core::io::LineReader;
use logsig_core::Result;
use std::io::BufRead;

/// Log lines plus the optional record time parsing.
pub struct LogLines<'a> {
    reader: LineReader<Box<dyn BufRead + 'a>>,
    parse_times: bool,
}

impl<'a> LogLines<'a> {
    /// Lines from `reader`; record times are not parsed.
    pub fn new(reader: impl BufRead + 'a) -> Self {
        Self {
            reader: LineReader::new(Box::new(reader)),
            parse_times: false,
        }
    }

    /// Also parse a leading RFC 3339 timestamp from every line.
    #[must_use]
    pub const fn with_record_times(mut self, on: bool) -> Self {
        self.parse_times = on;
        self
    }

    /// Whether record times are parsed.
    #[must_use]
    pub const fn parses_times(&self) -> bool {
        self.parse_times
    }

    /// Lines consumed so far.
    #[must_use]
    pub const fn line_no(&self) -> u64 {
        self.reader.line_no()
    }

    /// Next line without newline, `None` at end of the log.
    pub fn read_line(&mut self) -> Result<Option<&[u8]>> {
        self.reader.read_line()
    }

    /// Drop up to `n` lines.
    pub fn skip(&mut self, n: u64) -> Result<u64> {
        self.reader.skip_lines(n)
    }
}

/// Unix time of the RFC 3339 timestamp that starts a syslog line.
#[must_use]
pub fn record_time(line: &[u8]) -> Option<i64> {
    let token = line.split(|b| *b == b' ').next()?;
    let text = std::str::from_utf8(token).ok()?;
    DateTime::parse_from_rfc3339(text).ok().map(|t| t.timestamp())
}
