// SPDX-License-Identifier: MIT

//! LIFO stack of byte segments with byte, character and line reads.
//!
//! The most recently pushed segment is always drained first, which is what
//! lets the parser hand over-read bytes back to the front of the stream.

use encoding_rs::Decoder;
use std::ops::Range;

const LINE_FEED: u8 = b'\n';
const CARRIAGE_RETURN: u8 = b'\r';

/// Status of a bounded line read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineRead {
    /// The terminator was consumed
    Complete,
    /// The stack ran dry first; more data may continue the line
    Pending,
    /// The line outgrew the limit before its terminator
    Overflow,
}

#[derive(Debug)]
struct Segment {
    data: Vec<u8>,
    pos: usize,
    end: usize,
}

impl Segment {
    fn remaining(&self) -> &[u8] {
        &self.data[self.pos..self.end]
    }

    fn is_exhausted(&self) -> bool {
        self.pos >= self.end
    }
}

#[derive(Debug)]
pub struct PushbackStack {
    segments: Vec<Segment>,
    terminator: u8,
    ignorable: Option<u8>,
}

impl Default for PushbackStack {
    fn default() -> Self {
        Self::new()
    }
}

impl PushbackStack {
    /// Creates an empty stack splitting lines on LF with CR folded into the terminator
    pub fn new() -> Self {
        Self::with_line_bytes(LINE_FEED, Some(CARRIAGE_RETURN))
    }

    /// Creates an empty stack with a custom line terminator and optional ignorable byte.
    ///
    /// The ignorable byte is dropped only when it directly precedes the terminator.
    pub fn with_line_bytes(terminator: u8, ignorable: Option<u8>) -> Self {
        Self {
            segments: Vec::new(),
            terminator,
            ignorable,
        }
    }

    /// Pushes `data` on top of the stack
    pub fn push(&mut self, data: Vec<u8>) {
        let end = data.len();
        self.push_range(data, 0..end);
    }

    /// Pushes the `range` of `data` on top of the stack.
    ///
    /// # Panics
    /// Panics if `range` is out of bounds for `data`.
    pub fn push_range(&mut self, data: Vec<u8>, range: Range<usize>) {
        assert!(
            range.start <= range.end && range.end <= data.len(),
            "segment range {range:?} out of bounds for {} bytes",
            data.len()
        );
        if range.is_empty() {
            return;
        }
        self.segments.push(Segment {
            data,
            pos: range.start,
            end: range.end,
        });
    }

    /// Returns true if any segment still holds unread bytes
    pub fn has_data(&self) -> bool {
        self.segments.iter().any(|s| !s.is_exhausted())
    }

    /// Number of unread bytes across all segments
    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.end - s.pos).sum()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_data()
    }

    fn top(&mut self) -> Option<&mut Segment> {
        while self.segments.last().is_some_and(Segment::is_exhausted) {
            self.segments.pop();
        }
        self.segments.last_mut()
    }

    /// Reads a single byte, or `None` once every segment is drained
    pub fn read_byte(&mut self) -> Option<u8> {
        let top = self.top()?;
        let byte = top.data[top.pos];
        top.pos += 1;
        Some(byte)
    }

    /// Fills `buf` from as many segments as needed. Returns the number of bytes
    /// copied, which is short only when the stack ran dry.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut amount = 0;
        while amount < buf.len() {
            let Some(top) = self.top() else {
                break;
            };
            let available = top.remaining();
            let n = available.len().min(buf.len() - amount);
            buf[amount..amount + n].copy_from_slice(&available[..n]);
            top.pos += n;
            amount += n;
        }
        amount
    }

    /// Decodes up to `count` characters into `out`.
    ///
    /// Bytes are fed to `decoder` one at a time so nothing past the last
    /// complete character is consumed; a sequence cut off by the end of the
    /// stack stays inside the decoder until more data is pushed. Malformed
    /// input can make the final step yield one extra replacement character.
    pub fn read_chars(&mut self, decoder: &mut Decoder, out: &mut String, count: usize) -> usize {
        let mut produced = 0;
        while produced < count {
            let Some(byte) = self.read_byte() else {
                break;
            };
            out.reserve(decoder.max_utf8_buffer_length(1).unwrap_or(16));
            let before = out.len();
            let (_, _, _) = decoder.decode_to_string(&[byte], out, false);
            produced += out[before..].chars().count();
        }
        produced
    }

    /// Appends the bytes of the current line to `line`.
    ///
    /// Returns `true` when the terminator was consumed and `false` when the
    /// stack emptied first, in which case the caller may push more data and
    /// call again with the same buffer to continue the line. An ignorable byte
    /// right before the terminator is removed even when the two arrived in
    /// different segments; anywhere else it is kept as data.
    pub fn read_line_into(&mut self, line: &mut Vec<u8>) -> bool {
        self.read_line_into_limited(line, usize::MAX) == LineRead::Complete
    }

    /// [`read_line_into`](Self::read_line_into) that stops once `line` holds
    /// more than `max` bytes.
    ///
    /// On [`LineRead::Overflow`] the rest of the line is left on the stack. A
    /// line that comes back longer than `max` is always too long, whatever the
    /// status.
    pub fn read_line_into_limited(&mut self, line: &mut Vec<u8>, max: usize) -> LineRead {
        let terminator = self.terminator;
        let ignorable = self.ignorable;
        // One byte for a trailing ignorable, one to prove the overflow
        let cap = max.saturating_add(2);

        while let Some(top) = self.top() {
            let room = cap.saturating_sub(line.len());
            if room == 0 {
                return LineRead::Overflow;
            }
            let available = top.remaining();
            let window = &available[..available.len().min(room)];
            match window.iter().position(|&b| b == terminator) {
                Some(index) => {
                    line.extend_from_slice(&window[..index]);
                    top.pos += index + 1;
                    if ignorable.is_some() && line.last().copied() == ignorable {
                        line.pop();
                    }
                    return LineRead::Complete;
                }
                None => {
                    let taken = window.len();
                    line.extend_from_slice(window);
                    top.pos += taken;
                }
            }
        }

        if line.len() >= cap {
            LineRead::Overflow
        } else {
            LineRead::Pending
        }
    }

    /// Reads one line into a fresh buffer, returning it with the hit-end flag
    /// (`true` when no terminator was found before the stack emptied).
    pub fn read_line(&mut self) -> (Vec<u8>, bool) {
        let mut line = Vec::new();
        let terminated = self.read_line_into(&mut line);
        (line, !terminated)
    }
}
