//! Byte sources and sinks.
//!
//! - [`LineReader`]: log lines with a hard length cap.
//! - [`Input`]: a file or stdin, remembering whether it can be re-read.
//! - [`AtomicOutput`]: write to a temporary file next to the destination and
//!   rename it into place on [`AtomicOutput::commit`]; dropping it without a
//!   commit removes the temporary file.
//! - [`lock_shared`]: advisory read lock that fails fast instead of blocking.

use crate::error::{Error, IoContext, Result};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Default cap on one log line, newline included.
pub const DEFAULT_LINE_LIMIT: usize = 1 << 20;

/// Path shown in messages.
#[inline]
#[must_use]
pub fn display(p: &Path) -> String {
    p.display().to_string()
}

/// `-` means stdin/stdout.
#[must_use]
pub fn is_std_stream(p: &Path) -> bool {
    p.as_os_str() == "-"
}

/// Ensure the parent directory for a file exists (no-op if none).
fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)
                .io_context(|| format!("creating parent directory of {}", display(path)))?;
        }
    }
    Ok(())
}

/* ------------------------------ log lines ------------------------------ */

/// Reads newline-terminated records into one reusable buffer.
///
/// The buffer grows as needed up to `limit`; a longer line is an
/// [`Error::IndexOverflow`], never silently cut.
pub struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
    limit: usize,
    line_no: u64,
}

impl<R: BufRead> LineReader<R> {
    /// Reader with [`DEFAULT_LINE_LIMIT`].
    pub fn new(inner: R) -> Self {
        Self::with_limit(inner, DEFAULT_LINE_LIMIT)
    }

    /// Reader with a custom cap.
    pub fn with_limit(inner: R, limit: usize) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(1024),
            limit,
            line_no: 0,
        }
    }

    /// Number of lines returned so far.
    #[must_use]
    pub const fn line_no(&self) -> u64 {
        self.line_no
    }

    /// Next line without its trailing `\n`; `Ok(None)` at end of input.
    pub fn read_line(&mut self) -> Result<Option<&[u8]>> {
        self.buf.clear();
        let n = (&mut self.inner)
            .take(self.limit as u64 + 1)
            .read_until(b'\n', &mut self.buf)
            .io_context(|| format!("read log line {}", self.line_no + 1))?;
        if n == 0 {
            return Ok(None);
        }
        if self.buf.len() > self.limit {
            return Err(Error::IndexOverflow {
                what: format!("log line {}", self.line_no + 1),
                limit: self.limit,
            });
        }
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
        }
        self.line_no += 1;
        Ok(Some(self.buf.as_slice()))
    }

    /// Read and drop `n` lines; returns how many were actually available.
    pub fn skip_lines(&mut self, n: u64) -> Result<u64> {
        let mut skipped = 0;
        while skipped < n && self.read_line()?.is_some() {
            skipped += 1;
        }
        Ok(skipped)
    }
}

/* -------------------------------- input -------------------------------- */

/// Buffered byte source opened from a path (`-` for stdin).
pub struct Input {
    reader: Box<dyn BufRead>,
    is_stream: bool,
    name: String,
}

impl Input {
    /// Open `path`, or stdin for `-`.
    pub fn open(path: &Path) -> Result<Self> {
        if is_std_stream(path) {
            return Ok(Self {
                reader: Box::new(BufReader::new(io::stdin())),
                is_stream: true,
                name: "<stdin>".into(),
            });
        }
        let f = File::open(path).io_context(|| format!("open {}", display(path)))?;
        let is_stream = !f
            .metadata()
            .io_context(|| format!("stat {}", display(path)))?
            .is_file();
        Ok(Self {
            reader: Box::new(BufReader::new(f)),
            is_stream,
            name: display(path),
        })
    }

    /// Wrap any reader (tests, in-memory data).
    pub fn from_reader(reader: impl BufRead + 'static, name: impl Into<String>) -> Self {
        Self {
            reader: Box::new(reader),
            is_stream: true,
            name: name.into(),
        }
    }

    /// `true` for pipes and stdin, which cannot be read twice.
    #[must_use]
    pub const fn is_stream(&self) -> bool {
        self.is_stream
    }

    /// Name for messages.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the reader.
    #[must_use]
    pub fn into_reader(self) -> Box<dyn BufRead> {
        self.reader
    }
}

impl Read for Input {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

/* -------------------------------- output -------------------------------- */

enum Target {
    File {
        tmp: NamedTempFile,
        dest: PathBuf,
        overwrite: bool,
    },
    Stdout(Vec<u8>),
}

/// Output that only appears at its destination once committed.
pub struct AtomicOutput {
    target: Target,
}

impl AtomicOutput {
    /// Prepare an output for `dest` (`-` buffers for stdout).
    ///
    /// With `overwrite == false` an existing destination is refused up front
    /// and again at commit time.
    pub fn create(dest: &Path, overwrite: bool) -> Result<Self> {
        if is_std_stream(dest) {
            return Ok(Self {
                target: Target::Stdout(Vec::new()),
            });
        }
        if !overwrite && dest.exists() {
            return Err(Error::io(
                format!("refusing to overwrite {}", display(dest)),
                io::Error::from(io::ErrorKind::AlreadyExists),
            ));
        }
        ensure_parent_dir(dest)?;
        let dir = match dest.parent() {
            Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let tmp = NamedTempFile::new_in(&dir)
            .io_context(|| format!("create temporary file in {}", display(&dir)))?;
        Ok(Self {
            target: Target::File {
                tmp,
                dest: dest.to_path_buf(),
                overwrite,
            },
        })
    }

    /// Destination path, `None` for stdout.
    #[must_use]
    pub fn destination(&self) -> Option<&Path> {
        match &self.target {
            Target::File { dest, .. } => Some(dest),
            Target::Stdout(_) => None,
        }
    }

    /// Move the finished output into place.
    pub fn commit(self) -> Result<()> {
        match self.target {
            Target::File {
                mut tmp,
                dest,
                overwrite,
            } => {
                tmp.flush()
                    .io_context(|| format!("flush output for {}", display(&dest)))?;
                let persisted = if overwrite {
                    tmp.persist(&dest)
                } else {
                    tmp.persist_noclobber(&dest)
                };
                persisted
                    .map_err(|e| Error::io(format!("rename into {}", display(&dest)), e.error))?;
                Ok(())
            }
            Target::Stdout(buf) => {
                let mut out = io::stdout().lock();
                out.write_all(&buf).io_context(|| "write stdout".into())?;
                out.flush().io_context(|| "flush stdout".into())
            }
        }
    }

    /// Drop the output; the temporary file is removed.
    pub fn discard(self) {
        drop(self);
    }
}

impl Write for AtomicOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.target {
            Target::File { tmp, .. } => tmp.write(buf),
            Target::Stdout(v) => v.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.target {
            Target::File { tmp, .. } => tmp.flush(),
            Target::Stdout(_) => Ok(()),
        }
    }
}

/* -------------------------------- locks -------------------------------- */

/// Open `path` and take a shared advisory lock without waiting.
///
/// A lock held by someone else (an asynchronous signer still appending)
/// yields [`Error::VerificationSkipped`]; the lock is released when the
/// returned file is dropped.
pub fn lock_shared(path: &Path) -> Result<File> {
    let f = File::open(path).io_context(|| format!("open {}", display(path)))?;
    match fs2::FileExt::try_lock_shared(&f) {
        Ok(()) => Ok(f),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            Err(Error::VerificationSkipped(format!(
                "{} is locked by another process: {e}",
                display(path)
            )))
        }
        Err(e) => Err(Error::io(format!("lock {}", display(path)), e)),
    }
}
