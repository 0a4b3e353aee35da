//! Tag-length-value codec.
//!
//! Two header shapes exist. The 8-bit form packs flags and a 5-bit tag into
//! the first byte and a one byte length into the second. The 16-bit form
//! (flag `0x80`) carries a 13-bit tag and a big-endian 16-bit length.
//!
//! [`TlvReader`] pulls one complete element at a time from any
//! [`Read`](std::io::Read) and tells a clean end of stream (no bytes at all)
//! apart from truncation (a partial header or value), which is always an
//! error.

use crate::error::{Error, Result};
use crate::hash::DataHash;
use std::fmt;
use std::io::{self, Read, Write};

/// Longest value a TLV can carry.
pub const MAX_VALUE_LEN: usize = 0xffff;
/// Longest header (16-bit form).
pub const MAX_HEADER_LEN: usize = 4;
/// Largest tag expressible in the 16-bit form.
pub const MAX_TAG: u16 = 0x1fff;

const FLAG_TLV16: u8 = 0x80;
const FLAG_NON_CRITICAL: u8 = 0x40;
const FLAG_FORWARD: u8 = 0x20;

/// One encoded element: header plus value, kept as the raw bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Tlv {
    tag: u16,
    header_len: usize,
    raw: Vec<u8>,
}

#[derive(Clone, Copy)]
struct Header {
    tag: u16,
    header_len: usize,
    value_len: usize,
}

const fn header_len_for(first: u8) -> usize {
    if first & FLAG_TLV16 == 0 {
        2
    } else {
        4
    }
}

fn decode_header(h: &[u8]) -> Header {
    if h[0] & FLAG_TLV16 == 0 {
        Header {
            tag: u16::from(h[0] & 0x1f),
            header_len: 2,
            value_len: usize::from(h[1]),
        }
    } else {
        Header {
            tag: (u16::from(h[0] & 0x1f) << 8) | u16::from(h[1]),
            header_len: 4,
            value_len: (usize::from(h[2]) << 8) | usize::from(h[3]),
        }
    }
}

impl Tlv {
    /// Encode a critical element.
    pub fn new(tag: u16, value: &[u8]) -> Result<Self> {
        Self::with_flags(tag, false, false, value)
    }

    /// Encode with explicit non-critical / forward flags.
    // Tag and length are range-checked before any narrowing cast.
    #[allow(clippy::cast_possible_truncation)]
    pub fn with_flags(tag: u16, non_critical: bool, forward: bool, value: &[u8]) -> Result<Self> {
        if tag > MAX_TAG {
            return Err(Error::argument(format!("TLV tag 0x{tag:x} out of range")));
        }
        if value.len() > MAX_VALUE_LEN {
            return Err(Error::IndexOverflow {
                what: format!("value of TLV 0x{tag:x}"),
                limit: MAX_VALUE_LEN,
            });
        }
        let mut flags = 0u8;
        if non_critical {
            flags |= FLAG_NON_CRITICAL;
        }
        if forward {
            flags |= FLAG_FORWARD;
        }
        let mut raw;
        if tag <= 0x1f && value.len() <= 0xff {
            raw = Vec::with_capacity(2 + value.len());
            raw.push(flags | tag as u8);
            raw.push(value.len() as u8);
        } else {
            raw = Vec::with_capacity(4 + value.len());
            raw.push(FLAG_TLV16 | flags | (tag >> 8) as u8);
            raw.push((tag & 0xff) as u8);
            raw.extend_from_slice(&(value.len() as u16).to_be_bytes());
        }
        let header_len = raw.len();
        raw.extend_from_slice(value);
        Ok(Self {
            tag,
            header_len,
            raw,
        })
    }

    /// Encode an element whose value is the concatenation of `children`.
    pub fn nested(tag: u16, children: &[Self]) -> Result<Self> {
        let mut value = Vec::with_capacity(children.iter().map(|c| c.raw.len()).sum());
        for c in children {
            value.extend_from_slice(&c.raw);
        }
        Self::new(tag, &value)
    }

    /// Encode an unsigned integer (big-endian, leading zeros stripped).
    pub fn uint(tag: u16, v: u64) -> Result<Self> {
        let bytes = v.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        Self::new(tag, &bytes[skip..])
    }

    /// Encode a hash imprint.
    pub fn imprint(tag: u16, h: &DataHash) -> Result<Self> {
        Self::new(tag, h.imprint())
    }

    /// Encode a UTF-8 string.
    pub fn utf8(tag: u16, s: &str) -> Result<Self> {
        Self::new(tag, s.as_bytes())
    }

    /// Decode exactly one element occupying all of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let (tlv, used) = Self::parse_prefix(bytes)?;
        if used != bytes.len() {
            return Err(Error::format(format!(
                "{} trailing bytes after TLV 0x{:x}",
                bytes.len() - used,
                tlv.tag
            )));
        }
        Ok(tlv)
    }

    /// Decode the element at the start of `bytes`, returning it and its size.
    pub fn parse_prefix(bytes: &[u8]) -> Result<(Self, usize)> {
        let first = *bytes
            .first()
            .ok_or_else(|| Error::format("empty TLV"))?;
        let hlen = header_len_for(first);
        if bytes.len() < hlen {
            return Err(Error::format("truncated TLV header"));
        }
        let h = decode_header(&bytes[..hlen]);
        let total = h.header_len + h.value_len;
        if bytes.len() < total {
            return Err(Error::format(format!(
                "truncated TLV 0x{:x}: {} value bytes declared, {} available",
                h.tag,
                h.value_len,
                bytes.len() - hlen
            )));
        }
        Ok((
            Self {
                tag: h.tag,
                header_len: h.header_len,
                raw: bytes[..total].to_vec(),
            },
            total,
        ))
    }

    /// Tag.
    #[must_use]
    pub const fn tag(&self) -> u16 {
        self.tag
    }

    /// Whether unknown instances may be ignored.
    #[must_use]
    pub fn is_non_critical(&self) -> bool {
        self.raw[0] & FLAG_NON_CRITICAL != 0
    }

    /// Whether unknown instances should be forwarded.
    #[must_use]
    pub fn is_forward(&self) -> bool {
        self.raw[0] & FLAG_FORWARD != 0
    }

    /// Header length (2 or 4).
    #[must_use]
    pub const fn header_len(&self) -> usize {
        self.header_len
    }

    /// Value bytes.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.raw[self.header_len..]
    }

    /// Header and value, exactly as read or encoded.
    #[must_use]
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Take the raw bytes.
    #[must_use]
    pub fn into_raw(self) -> Vec<u8> {
        self.raw
    }

    /// Parse the value as a sequence of nested elements.
    pub fn children(&self) -> Result<Vec<Self>> {
        let mut out = Vec::new();
        let mut rest = self.value();
        while !rest.is_empty() {
            let (child, used) = Self::parse_prefix(rest)
                .map_err(|e| Error::format(format!("in TLV 0x{:x}: {e}", self.tag)))?;
            out.push(child);
            rest = &rest[used..];
        }
        Ok(out)
    }

    /// Value as an unsigned integer.
    pub fn as_uint(&self) -> Result<u64> {
        let v = self.value();
        if v.len() > 8 {
            return Err(Error::format(format!(
                "integer in TLV 0x{:x} is {} bytes long",
                self.tag,
                v.len()
            )));
        }
        Ok(v.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    /// Value as a hash imprint.
    pub fn as_imprint(&self) -> Result<DataHash> {
        DataHash::from_imprint(self.value())
            .map_err(|e| Error::format(format!("in TLV 0x{:x}: {e}", self.tag)))
    }

    /// Value as UTF-8 text.
    pub fn as_utf8(&self) -> Result<&str> {
        std::str::from_utf8(self.value())
            .map_err(|e| Error::format(format!("TLV 0x{:x} is not UTF-8: {e}", self.tag)))
    }
}

impl fmt::Debug for Tlv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tlv(0x{:x}, {} bytes)", self.tag, self.value().len())
    }
}

/* ------------------------------ streaming ------------------------------ */

/// Fill `buf` as far as the source allows; returns bytes read.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Pulls whole elements from a byte source.
pub struct TlvReader<R> {
    inner: R,
    offset: u64,
}

impl<R: Read> TlvReader<R> {
    /// Wrap a byte source positioned at the first element.
    pub const fn new(inner: R) -> Self {
        Self { inner, offset: 0 }
    }

    /// Byte offset of the next element.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Borrow the underlying source.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Give back the underlying source.
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read exactly `n` bytes (used for the file magic).
    pub fn read_exact_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        let got = read_full(&mut self.inner, &mut buf)
            .map_err(|e| Error::io("read input stream", e))?;
        if got < n {
            return Err(Error::format(format!(
                "input too short: expected {n} bytes, got {got}"
            )));
        }
        self.offset += n as u64;
        Ok(buf)
    }

    /// Next element, `Ok(None)` on clean end of stream.
    pub fn read_tlv(&mut self) -> Result<Option<Tlv>> {
        let mut raw = Vec::new();
        let Some(tag) = self.read_tlv_into(&mut raw)? else {
            return Ok(None);
        };
        Ok(Some(Tlv {
            tag,
            header_len: header_len_for(raw[0]),
            raw,
        }))
    }

    /// Read the next element's raw bytes into `buf` and return its tag.
    ///
    /// `buf` is cleared first and only grows, so one buffer can serve a
    /// whole stream. `Ok(None)` on clean end of stream.
    pub fn read_tlv_into(&mut self, buf: &mut Vec<u8>) -> Result<Option<u16>> {
        buf.clear();
        let at = self.offset;
        let mut hdr = [0u8; MAX_HEADER_LEN];
        let got = read_full(&mut self.inner, &mut hdr[..1])
            .map_err(|e| Error::io("read TLV stream", e))?;
        if got == 0 {
            return Ok(None);
        }
        let hlen = header_len_for(hdr[0]);
        let got = read_full(&mut self.inner, &mut hdr[1..hlen])
            .map_err(|e| Error::io("read TLV stream", e))?;
        if got < hlen - 1 {
            return Err(Error::format(format!(
                "truncated TLV header at offset {at}"
            )));
        }
        let h = decode_header(&hdr[..hlen]);
        buf.extend_from_slice(&hdr[..hlen]);
        buf.resize(hlen + h.value_len, 0);
        let got = read_full(&mut self.inner, &mut buf[hlen..])
            .map_err(|e| Error::io("read TLV stream", e))?;
        if got < h.value_len {
            buf.truncate(hlen + got);
            return Err(Error::format(format!(
                "truncated TLV 0x{:x} at offset {at}: {} value bytes declared, {got} available",
                h.tag, h.value_len
            )));
        }
        self.offset += buf.len() as u64;
        Ok(Some(h.tag))
    }
}

impl<R: Read> Iterator for TlvReader<R> {
    type Item = Result<Tlv>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_tlv().transpose()
    }
}

/// Writes elements to a byte sink.
pub struct TlvWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> TlvWriter<W> {
    /// Wrap a sink.
    pub const fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    /// Append raw bytes (magic, pre-encoded elements).
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner
            .write_all(bytes)
            .map_err(|e| Error::io("write output stream", e))?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    /// Append one element.
    pub fn write_tlv(&mut self, tlv: &Tlv) -> Result<()> {
        self.write_raw(tlv.raw())
    }

    /// Total bytes written so far.
    #[must_use]
    pub const fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Flush the sink.
    pub fn flush(&mut self) -> Result<()> {
        self.inner
            .flush()
            .map_err(|e| Error::io("flush output stream", e))
    }

    /// Give back the sink.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::hash::HashAlgorithm;
    use std::io::Cursor;

    #[test]
    fn short_form_for_small_tags() {
        let t = Tlv::new(0x01, &[0xaa, 0xbb]).unwrap();
        assert_eq!(t.raw(), &[0x01, 0x02, 0xaa, 0xbb]);
        assert_eq!(t.header_len(), 2);
    }

    #[test]
    fn long_form_for_large_tags_and_values() {
        let t = Tlv::new(0x901, &[1, 2, 3]).unwrap();
        assert_eq!(&t.raw()[..4], &[0x89, 0x01, 0x00, 0x03]);
        let big = Tlv::new(0x02, &[0u8; 300]).unwrap();
        assert_eq!(&big.raw()[..4], &[0x80, 0x02, 0x01, 0x2c]);
        assert_eq!(Tlv::parse(big.raw()).unwrap().value().len(), 300);
    }

    #[test]
    fn flags_survive_encoding() {
        let t = Tlv::with_flags(0x10, true, true, b"x").unwrap();
        let back = Tlv::parse(t.raw()).unwrap();
        assert!(back.is_non_critical());
        assert!(back.is_forward());
        assert_eq!(back.tag(), 0x10);
    }

    #[test]
    fn uint_encoding_is_minimal() {
        assert!(Tlv::uint(1, 0).unwrap().value().is_empty());
        assert_eq!(Tlv::uint(1, 0x0102).unwrap().value(), &[1, 2]);
        assert_eq!(Tlv::uint(1, u64::MAX).unwrap().as_uint().unwrap(), u64::MAX);
    }

    #[test]
    fn oversized_value_is_rejected() {
        let e = Tlv::new(0x902, &vec![0u8; MAX_VALUE_LEN + 1]).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::IndexOverflow);
    }

    #[test]
    fn nested_children_parse_back() {
        let h = HashAlgorithm::Sha256.hash(b"x");
        let parent = Tlv::nested(
            0x901,
            &[Tlv::uint(1, 1).unwrap(), Tlv::imprint(3, &h).unwrap()],
        )
        .unwrap();
        let kids = parent.children().unwrap();
        assert_eq!(kids.len(), 2);
        assert_eq!(kids[1].as_imprint().unwrap(), h);
    }

    #[test]
    fn reader_distinguishes_eof_from_truncation() {
        let mut bytes = Tlv::new(0x902, &[5u8; 33]).unwrap().into_raw();
        let mut r = TlvReader::new(Cursor::new(bytes.clone()));
        assert!(r.read_tlv().unwrap().is_some());
        assert!(r.read_tlv().unwrap().is_none());

        bytes.truncate(10);
        let mut r = TlvReader::new(Cursor::new(bytes));
        let e = r.read_tlv().unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidInputFormat);
    }

    #[test]
    fn header_claiming_100_bytes_with_40_present_is_truncation() {
        let mut bytes = vec![0x89, 0x02, 0x00, 100];
        bytes.extend_from_slice(&[0u8; 40]);
        let e = TlvReader::new(Cursor::new(bytes)).read_tlv().unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidInputFormat);
        assert!(e.to_string().contains("truncated"));
    }

    #[test]
    fn partial_header_is_truncation() {
        let e = TlvReader::new(Cursor::new(vec![0x89, 0x02]))
            .read_tlv()
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidInputFormat);
    }

    #[test]
    fn one_buffer_serves_a_whole_stream() {
        let mut bytes = Tlv::new(0x902, &[5u8; 300]).unwrap().into_raw();
        bytes.extend_from_slice(Tlv::new(0x04, &[1, 2]).unwrap().raw());
        let mut r = TlvReader::new(Cursor::new(bytes));
        let mut buf = Vec::new();

        assert_eq!(r.read_tlv_into(&mut buf).unwrap(), Some(0x902));
        assert_eq!(buf.len(), 304);
        let grown = buf.capacity();
        assert_eq!(r.read_tlv_into(&mut buf).unwrap(), Some(0x04));
        assert_eq!(buf, [0x04, 0x02, 1, 2]);
        assert_eq!(buf.capacity(), grown);
        assert_eq!(Tlv::parse(&buf).unwrap().value(), &[1, 2]);
        assert_eq!(r.read_tlv_into(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
        assert_eq!(r.offset(), 308);
    }

    #[test]
    fn writer_counts_bytes() {
        let mut w = TlvWriter::new(Vec::new());
        w.write_raw(b"LOGSIG12").unwrap();
        w.write_tlv(&Tlv::new(0x911, &[1]).unwrap()).unwrap();
        assert_eq!(w.bytes_written(), 13);
        let out = w.into_inner();
        let mut r = TlvReader::new(Cursor::new(out));
        assert_eq!(r.read_exact_bytes(8).unwrap(), b"LOGSIG12");
        assert_eq!(r.next().unwrap().unwrap().tag(), 0x911);
        assert!(r.next().is_none());
    }
}
