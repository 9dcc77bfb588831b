//! Session log reading: tail on demand and incremental follow.
//!
//! Both `\n` and `\r` end a line, so an encoder's carriage-return progress
//! updates show up as separate lines. `\r\n` counts once.

use std::collections::VecDeque;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

const READ_CHUNK_BYTES: usize = 8192;
/// A fragment longer than this is emitted as a line without waiting for its
/// terminator.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Returns the last `count` lines of the file. A missing file reads as empty.
pub fn tail_lines(path: &Path, count: usize) -> io::Result<Vec<String>> {
    let (mut lines, mut follower) = tail_and_follow(path, count)?;
    if let Some(partial) = follower.flush_partial() {
        if count > 0 {
            if lines.len() == count {
                lines.remove(0);
            }
            lines.push(partial);
        }
    }
    Ok(lines)
}

/// Returns the last `count` complete lines and a follower positioned right
/// after them, so nothing is skipped or repeated between the two.
///
/// Only the end of the file is read: the start of the tail is found by
/// scanning backwards for line terminators.
pub fn tail_and_follow(path: &Path, count: usize) -> io::Result<(Vec<String>, LogFollower)> {
    let mut follower = LogFollower {
        path: path.to_path_buf(),
        offset: 0,
        splitter: LineSplitter::default(),
    };
    let mut file = match fs_err::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), follower)),
        Err(err) => return Err(err),
    };

    let len = file.metadata()?.len();
    let start = tail_start(&mut file, len, count)?;
    file.seek(SeekFrom::Start(start))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    follower.offset = start + bytes.len() as u64;

    let mut lines = VecDeque::new();
    for line in follower.splitter.push(&bytes) {
        if count == 0 {
            continue;
        }
        if lines.len() == count {
            lines.pop_front();
        }
        lines.push_back(line);
    }
    Ok((lines.into(), follower))
}

/// Offset of the first byte of the last `count` complete lines (plus any
/// trailing fragment) in a file of `len` bytes.
fn tail_start(file: &mut fs_err::File, len: u64, count: usize) -> io::Result<u64> {
    let mut ends = 0usize;
    let mut next: Option<u8> = None;
    let mut pos = len;
    let mut chunk = [0u8; READ_CHUNK_BYTES];

    while pos > 0 {
        let size = (pos as usize).min(READ_CHUNK_BYTES);
        pos -= size as u64;
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(&mut chunk[..size])?;

        for index in (0..size).rev() {
            let byte = chunk[index];
            let is_end = byte == b'\n' || (byte == b'\r' && next != Some(b'\n'));
            next = Some(byte);
            if is_end {
                ends += 1;
                if ends > count {
                    return Ok(pos + index as u64 + 1);
                }
            }
        }
    }
    Ok(0)
}

/// Splits a byte stream into lines across reads.
#[derive(Debug, Default)]
struct LineSplitter {
    pending: Vec<u8>,
    /// The previous byte was `\r`; a `\n` right after it is part of the
    /// same terminator.
    after_cr: bool,
}

impl LineSplitter {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if std::mem::take(&mut self.after_cr) && byte == b'\n' {
                continue;
            }
            match byte {
                b'\n' => lines.push(self.take()),
                b'\r' => {
                    lines.push(self.take());
                    self.after_cr = true;
                }
                _ => {
                    self.pending.push(byte);
                    if self.pending.len() >= MAX_LINE_BYTES {
                        lines.push(self.take());
                    }
                }
            }
        }
        lines
    }

    fn take(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        line
    }

    fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        Some(self.take())
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.after_cr = false;
    }
}

/// Reads a growing log file from a starting offset.
///
/// Lines are only returned once complete; a trailing fragment waits for its
/// terminator unless `flush_partial` is called.
pub struct LogFollower {
    path: PathBuf,
    offset: u64,
    splitter: LineSplitter,
}

impl LogFollower {
    /// Starts at the current end of the file.
    pub fn from_end(path: &Path) -> io::Result<Self> {
        let offset = match fs_err::metadata(path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err),
        };
        Ok(Self {
            path: path.to_path_buf(),
            offset,
            splitter: LineSplitter::default(),
        })
    }

    /// Raw bytes appended since the last read.
    pub fn read_bytes(&mut self) -> io::Result<Vec<u8>> {
        let mut file = match fs_err::File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let len = file.metadata()?.len();
        if len < self.offset {
            // Truncated underneath us; start over.
            self.offset = 0;
            self.splitter.reset();
        }
        file.seek(SeekFrom::Start(self.offset))?;

        let mut out = Vec::new();
        file.read_to_end(&mut out)?;
        self.offset += out.len() as u64;
        Ok(out)
    }

    /// Complete lines appended since the last read.
    pub fn read_lines(&mut self) -> io::Result<Vec<String>> {
        let bytes = self.read_bytes()?;
        Ok(self.splitter.push(&bytes))
    }

    /// Returns a trailing fragment with no terminator, if any.
    pub fn flush_partial(&mut self) -> Option<String> {
        self.splitter.flush()
    }
}
