//! Blocks and the iterators that carve them out of files.
//!
//! A "block" within a file is just a delimited string of bytes. For most
//! log files blocks are single lines and an unambiguous terminal -- almost
//! always `\n` -- is enough to delimit them. Multi-line records, stack
//! traces and the like, additionally need a prefix regex that marks where
//! a record begins. `Blocks` supports both and reports exact byte offsets
//! so that consumption can be resumed at any block boundary.

use error::{Error, Result};
use regex::bytes::Regex;
use std::cmp;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// A delimited substring of a source file, with exact byte offsets.
///
/// Invariants: `begin < end`, `end - begin == raw.len()` and `raw` is the
/// byte-for-byte content of `path` between the two offsets. A complete
/// block's `raw` always ends with its source's terminal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// File the block was cut from.
    pub path: PathBuf,
    /// Byte offset of the first byte of the block.
    pub begin: u64,
    /// Byte offset one past the last byte of the block.
    pub end: u64,
    /// The block's bytes, terminal included.
    pub raw: Vec<u8>,
}

impl Block {
    /// The block's size in bytes.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// True when the block holds no bytes. Iterators never emit one.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

/// How blocks are delimited within a stream.
#[derive(Clone, Debug)]
pub enum Delimit {
    /// Every block ends at the first occurrence of `terminal`.
    Line {
        /// String that ends a block, included in the emitted bytes.
        terminal: Vec<u8>,
    },
    /// A block begins at a `prefix` match and runs to the next `prefix`
    /// match that is immediately preceded by `terminal`.
    Multi {
        /// Regex that marks the beginning of a block.
        prefix: Regex,
        /// String that ends a block.
        terminal: Vec<u8>,
    },
}

/// Pull-based block iterator over a seekable byte stream.
///
/// The iterator is single-pass: a short read marks end of stream and
/// iteration will not retry it. To pick up appended bytes the caller
/// reseeks the stream and builds a new `Blocks`.
#[derive(Debug)]
pub struct Blocks<R> {
    fo: R,
    path: PathBuf,
    delimit: Delimit,
    strict: bool,
    read_size: usize,
    max_buffer_size: usize,
    buf: Vec<u8>,
    pos: u64,
    eof: bool,
    discard: bool,
    failed: bool,
}

impl<R> Blocks<R>
where
    R: Read + Seek,
{
    /// Make a block iterator starting at the stream's current position.
    pub fn new(
        mut fo: R,
        path: &Path,
        delimit: Delimit,
        strict: bool,
        read_size: usize,
        max_buffer_size: usize,
    ) -> Result<Blocks<R>> {
        let pos = fo.seek(SeekFrom::Current(0))?;
        Ok(Blocks {
            fo: fo,
            path: path.to_path_buf(),
            delimit: delimit,
            strict: strict,
            read_size: read_size,
            max_buffer_size: max_buffer_size,
            buf: Vec::new(),
            pos: pos,
            eof: false,
            discard: false,
            failed: false,
        })
    }

    /// Byte offset the next emitted block will begin at.
    pub fn tell(&self) -> u64 {
        self.pos
    }

    /// Pull bytes from the stream until the buffer grows or the stream
    /// gives out. A read shorter than requested marks end of stream.
    fn fill(&mut self) -> Result<()> {
        let want = cmp::min(self.read_size, self.max_buffer_size - self.buf.len());
        let len = self.buf.len();
        self.buf.resize(len + want, 0);
        let mut filled = 0;
        while filled < want {
            match self.fo.read(&mut self.buf[len + filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == ::std::io::ErrorKind::Interrupted => {
                    continue
                }
                Err(e) => {
                    self.buf.truncate(len);
                    return Err(Error::Io(e));
                }
            }
        }
        self.buf.truncate(len + filled);
        if filled < want {
            self.eof = true;
        }
        Ok(())
    }

    /// Cut the next block out of the buffer, or report that more bytes
    /// are needed. Emitted raws are drained off the front of the buffer
    /// and `pos` advances past them.
    fn parse(&mut self) -> Result<Option<(Vec<u8>, u64, u64)>> {
        match self.delimit.clone() {
            Delimit::Line { ref terminal } => self.parse_line(terminal),
            Delimit::Multi {
                ref prefix,
                ref terminal,
            } => self.parse_multi(prefix, terminal),
        }
    }

    fn parse_line(&mut self, terminal: &[u8]) -> Result<Option<(Vec<u8>, u64, u64)>> {
        let cut = match find(&self.buf, terminal) {
            Some(idx) => idx + terminal.len(),
            None => return Ok(None),
        };
        Ok(Some(self.emit(cut)))
    }

    fn parse_multi(
        &mut self,
        prefix: &Regex,
        terminal: &[u8],
    ) -> Result<Option<(Vec<u8>, u64, u64)>> {
        // Align the head of the buffer on a prefix match. Bytes before the
        // first match are a partial block.
        let head = loop {
            let mat = match prefix.find(&self.buf) {
                Some(mat) => (mat.start(), mat.end()),
                None => {
                    trace!("{:?}[{}:] has no preamble", self.path, self.pos);
                    return Ok(None);
                }
            };
            if mat.0 == 0 {
                break mat;
            }
            if self.strict {
                return Err(Error::PartialBlock {
                    path: self.path.clone(),
                    begin: self.pos,
                    end: self.pos + mat.0 as u64,
                });
            }
            warn!(
                "{:?}[{}:{}] is a partial block, discarding",
                self.path,
                self.pos,
                self.pos + mat.0 as u64
            );
            self.buf.drain(..mat.0);
            self.pos += mat.0 as u64;
        };

        // Scan for the start of the next block. Prefix matches that are
        // not immediately preceded by the terminal are terminal-like
        // sequences embedded in the record and do not end it.
        let tlen = terminal.len();
        let mut from = head.1;
        let mut cut = None;
        while from <= self.buf.len() {
            let mat = match prefix.find_at(&self.buf, from) {
                Some(mat) => mat,
                None => break,
            };
            if mat.start() >= tlen && &self.buf[mat.start() - tlen..mat.start()] == terminal {
                cut = Some(mat.start());
                break;
            }
            from = if mat.end() > from { mat.end() } else { from + 1 };
        }

        match cut {
            Some(cut) => Ok(Some(self.emit(cut))),
            None => {
                if !self.eof {
                    return Ok(None);
                }
                // At end of stream the remainder stands alone only if it
                // is a finished record.
                if self.buf.len() < tlen || !self.buf.ends_with(terminal) {
                    return Ok(None);
                }
                let cut = self.buf.len();
                Ok(Some(self.emit(cut)))
            }
        }
    }

    fn emit(&mut self, cut: usize) -> (Vec<u8>, u64, u64) {
        let raw: Vec<u8> = self.buf.drain(..cut).collect();
        let begin = self.pos;
        let end = begin + raw.len() as u64;
        self.pos = end;
        (raw, begin, end)
    }
}

impl<R> Iterator for Blocks<R>
where
    R: Read + Seek,
{
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Result<Block>> {
        if self.failed {
            return None;
        }
        loop {
            if !self.buf.is_empty() {
                match self.parse() {
                    Err(e) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                    Ok(Some((raw, begin, end))) => {
                        if self.discard {
                            info!(
                                "{:?}[{}:{}] is a partial block, discarding",
                                self.path, begin, end
                            );
                            self.discard = false;
                            continue;
                        }
                        return Some(Ok(Block {
                            path: self.path.clone(),
                            begin: begin,
                            end: end,
                            raw: raw,
                        }));
                    }
                    Ok(None) => {}
                }
                if self.buf.len() >= self.max_buffer_size {
                    if self.strict {
                        self.failed = true;
                        return Some(Err(Error::BufferOverflow {
                            path: self.path.clone(),
                            begin: self.pos,
                            end: self.pos + self.buf.len() as u64,
                            limit: self.max_buffer_size,
                        }));
                    }
                    warn!(
                        "{:?}[{}:{}] partial block exceeds buffer size {}, \
                         discarding",
                        self.path,
                        self.pos,
                        self.pos + self.buf.len() as u64,
                        self.max_buffer_size
                    );
                    self.pos += self.buf.len() as u64;
                    self.buf.clear();
                    self.discard = true;
                    continue;
                }
            }
            if self.eof {
                if !self.buf.is_empty() {
                    if self.strict {
                        self.failed = true;
                        return Some(Err(Error::PartialBlock {
                            path: self.path.clone(),
                            begin: self.pos,
                            end: self.pos + self.buf.len() as u64,
                        }));
                    }
                    debug!(
                        "{:?}[{}:{}] partial block at end of stream, {} \
                         byte(s) held back",
                        self.path,
                        self.pos,
                        self.pos + self.buf.len() as u64,
                        self.buf.len()
                    );
                }
                return None;
            }
            if let Err(e) = self.fill() {
                self.failed = true;
                return Some(Err(e));
            }
        }
    }
}

/// First occurrence of `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
