// SPDX-License-Identifier: MIT

//! Rebuffering reader over a chunked transport.
//!
//! [`RebufferingReader`] pulls a new chunk from its [`ChunkSource`] only when
//! the [`PushbackStack`] it owns has run dry, and lets callers push bytes back
//! to the front of the stream with the `buffer*` methods. Every read is an
//! `async fn` whose only suspension point is the pull; sources that never
//! suspend implement [`BlockingSource`] and get `*_blocking` wrappers that
//! drive the very same futures to completion.

use crate::error::{MultipartError, Result};
use crate::stack::{LineRead, PushbackStack};
use encoding_rs::{Encoding, UTF_16BE, UTF_16LE, UTF_8};
use futures::io::{AsyncRead, AsyncReadExt};
use log::{debug, trace};
use std::future::Future;
use std::io::{self, Read};
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Default number of bytes requested from the transport per pull
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// The transport feeding raw bytes to the reader.
///
/// `pull` fills at most `buf.len()` bytes and returns how many were written.
/// Returning zero signals end of input.
pub trait ChunkSource {
    fn pull(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>>;
}

/// Marker for sources whose `pull` future is ready on first poll.
pub trait BlockingSource: ChunkSource {}

/// Blocking source over any [`std::io::Read`]
#[derive(Debug)]
pub struct ReadSource<R> {
    inner: R,
}

impl<R: Read> ReadSource<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> ChunkSource for ReadSource<R> {
    fn pull(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> {
        let result = loop {
            match self.inner.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };
        std::future::ready(result)
    }
}

impl<R: Read> BlockingSource for ReadSource<R> {}

/// Suspendable source over any [`futures::io::AsyncRead`]
#[derive(Debug)]
pub struct AsyncReadSource<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> AsyncReadSource<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> ChunkSource for AsyncReadSource<R> {
    async fn pull(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.inner.read(buf).await {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }
}

/// Cooperative cancellation flag, checked right before each transport pull
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Byte-order mark written by `encoding`, if it has one
pub fn preamble(encoding: &'static Encoding) -> &'static [u8] {
    if encoding == UTF_8 {
        &[0xEF, 0xBB, 0xBF]
    } else if encoding == UTF_16LE {
        &[0xFF, 0xFE]
    } else if encoding == UTF_16BE {
        &[0xFE, 0xFF]
    } else {
        &[]
    }
}

#[derive(Debug)]
enum BomState {
    /// Start of stream not settled yet; holds a strict prefix of the preamble
    Pending(Vec<u8>),
    Settled,
}

#[derive(Debug)]
pub struct RebufferingReader<S> {
    source: S,
    stack: PushbackStack,
    chunk_size: usize,
    encoding: &'static Encoding,
    cancellation: Option<Cancellation>,
    bom: BomState,
    bytes_pulled: u64,
    exhausted: bool,
}

impl<S: ChunkSource> RebufferingReader<S> {
    /// Creates a reader with UTF-8 and the default chunk size
    pub fn new(source: S) -> Self {
        Self {
            source,
            stack: PushbackStack::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            encoding: UTF_8,
            cancellation: None,
            bom: BomState::Pending(Vec::new()),
            bytes_pulled: 0,
            exhausted: false,
        }
    }

    /// Creates a reader with an explicit encoding and chunk size
    pub fn with_options(
        source: S,
        encoding: &'static Encoding,
        chunk_size: usize,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(MultipartError::invalid_configuration(
                "chunk size must be greater than zero",
            ));
        }
        let mut reader = Self::new(source);
        reader.encoding = encoding;
        reader.chunk_size = chunk_size;
        Ok(reader)
    }

    /// Attaches a cancellation token checked before every pull
    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    /// Total bytes received from the transport so far, BOM included
    pub fn bytes_pulled(&self) -> u64 {
        self.bytes_pulled
    }

    /// True once the transport reported end of input
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Adds `data` to the front of the stream
    pub fn buffer(&mut self, data: Vec<u8>) {
        self.stack.push(data);
    }

    /// Adds `range` of `data` to the front of the stream
    pub fn buffer_range(&mut self, data: Vec<u8>, range: Range<usize>) {
        self.stack.push_range(data, range);
    }

    pub fn buffer_slice(&mut self, data: &[u8]) {
        if !data.is_empty() {
            self.stack.push(data.to_vec());
        }
    }

    /// Adds `text`, encoded with the reader's encoding, to the front of the stream
    pub fn buffer_str(&mut self, text: &str) {
        let (bytes, _, _) = self.encoding.encode(text);
        self.stack.push(bytes.into_owned());
    }

    /// Splits the reader into its source and the bytes it still holds, in read order.
    ///
    /// A new reader built over the same source can be primed with those bytes
    /// through [`buffer`](Self::buffer), e.g. after a cancelled call.
    pub fn into_parts(mut self) -> (S, Vec<u8>) {
        let mut pending = vec![0u8; self.stack.len()];
        let copied = self.stack.read(&mut pending);
        pending.truncate(copied);
        (self.source, pending)
    }

    /// Reads a single byte, `None` at end of input
    pub async fn read_byte(&mut self) -> Result<Option<u8>> {
        loop {
            if let Some(byte) = self.stack.read_byte() {
                return Ok(Some(byte));
            }
            if !self.fill().await? {
                return Ok(None);
            }
        }
    }

    /// Reads until `buf` is full or the transport ends; returns the amount read
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut amount = 0;
        while amount < buf.len() {
            if !self.stack.has_data() && !self.fill().await? {
                break;
            }
            amount += self.stack.read(&mut buf[amount..]);
        }
        Ok(amount)
    }

    /// Decodes up to `count` characters into `out`; returns how many were produced
    pub async fn read_chars(&mut self, out: &mut String, count: usize) -> Result<usize> {
        let mut decoder = self.encoding.new_decoder_without_bom_handling();
        let mut produced = 0;
        while produced < count {
            if !self.stack.has_data() && !self.fill().await? {
                // Flush a sequence cut off by the end of input
                out.reserve(16);
                let before = out.len();
                let (_, _, _) = decoder.decode_to_string(&[], out, true);
                produced += out[before..].chars().count();
                break;
            }
            produced += self
                .stack
                .read_chars(&mut decoder, out, count - produced);
        }
        Ok(produced)
    }

    /// Reads the next line without its terminator.
    ///
    /// Returns `None` only when end of input is reached before any byte of a
    /// new line; a final line without terminator is still returned.
    pub async fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        loop {
            if !self.stack.has_data() && !self.fill().await? {
                return Ok(if line.is_empty() { None } else { Some(line) });
            }
            if self.stack.read_line_into(&mut line) {
                return Ok(Some(line));
            }
        }
    }

    /// [`read_line`](Self::read_line) holding at most about `max` bytes.
    ///
    /// A returned line longer than `max` was cut short: it is too long, and
    /// the rest of it is still unread. Pulls stop as soon as the limit is
    /// passed.
    pub async fn read_line_limited(&mut self, max: usize) -> Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        loop {
            if !self.stack.has_data() && !self.fill().await? {
                return Ok(if line.is_empty() { None } else { Some(line) });
            }
            match self.stack.read_line_into_limited(&mut line, max) {
                LineRead::Pending => {}
                LineRead::Complete | LineRead::Overflow => return Ok(Some(line)),
            }
        }
    }

    /// Discards the rest of the current line without buffering it.
    ///
    /// Returns `false` if input ended before a terminator.
    pub async fn skip_line(&mut self) -> Result<bool> {
        let mut scratch = Vec::with_capacity(self.chunk_size);
        loop {
            if !self.stack.has_data() && !self.fill().await? {
                return Ok(false);
            }
            scratch.clear();
            if self.stack.read_line_into_limited(&mut scratch, self.chunk_size) == LineRead::Complete {
                return Ok(true);
            }
        }
    }

    /// [`read_line`](Self::read_line) decoded with the reader's encoding
    pub async fn read_line_string(&mut self) -> Result<Option<String>> {
        let line = self.read_line().await?;
        Ok(line.map(|bytes| {
            let (text, _) = self.encoding.decode_without_bom_handling(&bytes);
            text.into_owned()
        }))
    }

    /// Pulls one chunk onto the stack.
    ///
    /// Returns `false` only when the transport is finished and nothing new was
    /// pushed. This is the single suspension point of the reader.
    async fn fill(&mut self) -> Result<bool> {
        if self.exhausted {
            return Ok(false);
        }
        if self
            .cancellation
            .as_ref()
            .is_some_and(Cancellation::is_cancelled)
        {
            debug!(
                "Cancellation requested after {} bytes pulled",
                self.bytes_pulled
            );
            return Err(MultipartError::Cancelled);
        }

        let mut chunk = vec![0u8; self.chunk_size];
        let amount = self.source.pull(&mut chunk).await?;

        if amount == 0 {
            self.exhausted = true;
            trace!("Transport exhausted after {} bytes", self.bytes_pulled);
            // A dangling preamble prefix turned out to be plain data
            if let BomState::Pending(stash) = std::mem::replace(&mut self.bom, BomState::Settled) {
                if !stash.is_empty() {
                    self.stack.push(stash);
                    return Ok(true);
                }
            }
            return Ok(false);
        }

        self.bytes_pulled += amount as u64;
        chunk.truncate(amount);
        trace!("Pulled {amount} bytes ({} total)", self.bytes_pulled);

        if let Some((data, skip)) = self.settle_preamble(chunk) {
            let end = data.len();
            self.stack.push_range(data, skip..end);
        }
        Ok(true)
    }

    /// Strips the encoding's byte-order mark from the first bytes of the stream.
    ///
    /// Returns the bytes to push with the number of leading bytes to skip, or
    /// `None` while the bytes seen so far are still a strict prefix of the mark.
    fn settle_preamble(&mut self, chunk: Vec<u8>) -> Option<(Vec<u8>, usize)> {
        let mark = preamble(self.encoding);
        let BomState::Pending(stash) = &mut self.bom else {
            return Some((chunk, 0));
        };

        let data = if stash.is_empty() {
            chunk
        } else {
            let mut joined = std::mem::take(stash);
            joined.extend_from_slice(&chunk);
            joined
        };

        if !mark.is_empty() && data.len() < mark.len() && mark.starts_with(&data) {
            *stash = data;
            return None;
        }

        self.bom = BomState::Settled;
        if !mark.is_empty() && data.starts_with(mark) {
            debug!("Stripped {}-byte {} byte-order mark", mark.len(), self.encoding.name());
            Some((data, mark.len()))
        } else {
            Some((data, 0))
        }
    }
}

impl<S: BlockingSource> RebufferingReader<S> {
    pub fn read_byte_blocking(&mut self) -> Result<Option<u8>> {
        futures::executor::block_on(self.read_byte())
    }

    pub fn read_blocking(&mut self, buf: &mut [u8]) -> Result<usize> {
        futures::executor::block_on(self.read(buf))
    }

    pub fn read_chars_blocking(&mut self, out: &mut String, count: usize) -> Result<usize> {
        futures::executor::block_on(self.read_chars(out, count))
    }

    pub fn read_line_blocking(&mut self) -> Result<Option<Vec<u8>>> {
        futures::executor::block_on(self.read_line())
    }

    pub fn read_line_limited_blocking(&mut self, max: usize) -> Result<Option<Vec<u8>>> {
        futures::executor::block_on(self.read_line_limited(max))
    }

    pub fn skip_line_blocking(&mut self) -> Result<bool> {
        futures::executor::block_on(self.skip_line())
    }

    pub fn read_line_string_blocking(&mut self) -> Result<Option<String>> {
        futures::executor::block_on(self.read_line_string())
    }
}

impl<R: Read> RebufferingReader<ReadSource<R>> {
    /// Convenience constructor over a blocking reader
    pub fn from_read(inner: R) -> Self {
        Self::new(ReadSource::new(inner))
    }
}
