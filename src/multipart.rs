//! RFC 7578 multipart/form-data classifier
//!
//! [`PartClassifier`] drives a [`RebufferingReader`] through the body one
//! part at a time and reports what it finds to a [`PartHandler`]:
//!
//! - text fields are collected line by line and delivered whole,
//! - file bodies are streamed as fragments and never held in memory,
//! - anything after the closing delimiter is ignored.
//!
//! The body is processed in a single pass. Delimiters are only recognised at
//! the start of a line and only when followed by `--`, line whitespace or the
//! end of input, so binary payloads that happen to contain the boundary text
//! are passed through untouched.
//!
//! # Example
//! ```rust,no_run
//! use formsplit::error::Result;
//! use formsplit::multipart::{ParserOptions, PartClassifier, PartHandler};
//! use formsplit::part::{FieldPart, FileInfo};
//! use formsplit::reader::ReadSource;
//!
//! struct Printer;
//!
//! impl PartHandler for Printer {
//!     fn on_field(&mut self, field: FieldPart) -> Result<()> {
//!         println!("{} = {}", field.name(), field.text());
//!         Ok(())
//!     }
//!
//!     fn on_file_fragment(&mut self, info: &FileInfo, bytes: &[u8], part_number: usize) -> Result<()> {
//!         println!("{} #{part_number}: {} bytes", info.file_name, bytes.len());
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let body = std::fs::File::open("request.body")?;
//!     let mut classifier =
//!         PartClassifier::new(ReadSource::new(body), Printer, ParserOptions::default())?;
//!     classifier.run_blocking()
//! }
//! ```

use crate::error::{MultipartError, Result};
use crate::part::{ExtraHeaders, FieldPart, FileInfo};
use crate::reader::{
    BlockingSource, Cancellation, ChunkSource, DEFAULT_CHUNK_SIZE, RebufferingReader,
};
use crate::scanner;
use encoding_rs::{Encoding, UTF_8};
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::fmt;

/// Default limits for multipart parsing
pub const DEFAULT_MAX_PARTS: usize = 1000;
pub const DEFAULT_MAX_FIELD_SIZE: u64 = 1024 * 1024; // 1MB per text field
pub const DEFAULT_MAX_HEADERS_SIZE: usize = 8 * 1024; // 8KB for part headers
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";
pub const DEFAULT_DISPOSITION: &str = "form-data";
pub const DEFAULT_BINARY_MIME_TYPE: &str = "application/octet-stream";
const MIN_BOUNDARY_LENGTH: usize = 1;
const MAX_BOUNDARY_LENGTH: usize = 70; // RFC 2046 limit
/// Leading and trailing dashes plus CRLF around a boundary on its line
const DELIMITER_FRAMING: usize = 4 + 2;
/// Longest delimiter or preamble line held in memory, trailing padding included
const MAX_DELIMITER_LINE: usize = MAX_BOUNDARY_LENGTH + DELIMITER_FRAMING + 64;
const BOUNDARY_SPECIALS: &str = "'()+_,-./:=? ";
const INVALID_FILENAME_CHARS: &[char] = &['"', '<', '>', '|', ':', '*', '?'];

/// A validated multipart boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Boundary {
    value: String,
    marker: Vec<u8>,
}

impl Boundary {
    pub fn new(value: &str) -> Result<Self> {
        Self::validate(value)?;
        let mut marker = Vec::with_capacity(value.len() + 2);
        marker.extend_from_slice(b"--");
        marker.extend_from_slice(value.as_bytes());
        Ok(Self {
            value: value.to_string(),
            marker,
        })
    }

    fn validate(boundary: &str) -> Result<()> {
        if boundary.len() < MIN_BOUNDARY_LENGTH {
            return Err(MultipartError::malformed_boundary("Boundary is empty"));
        }

        if boundary.len() > MAX_BOUNDARY_LENGTH {
            return Err(MultipartError::malformed_boundary(format!(
                "Boundary longer than {MAX_BOUNDARY_LENGTH} characters"
            )));
        }

        if boundary.contains(['\r', '\n']) {
            return Err(MultipartError::malformed_boundary(
                "Boundary contains line breaks",
            ));
        }

        // RFC 2046 bchars
        if !boundary
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || BOUNDARY_SPECIALS.contains(c))
        {
            return Err(MultipartError::malformed_boundary(
                "Boundary contains invalid characters",
            ));
        }

        if boundary.ends_with(' ') {
            return Err(MultipartError::malformed_boundary(
                "Boundary ends with a space",
            ));
        }

        Ok(())
    }

    /// Extracts the boundary parameter from a `multipart/form-data` Content-Type value
    pub fn from_content_type(content_type: &str) -> Result<Self> {
        let mut params = split_parameters(content_type).into_iter();
        let media_type = params.next().unwrap_or_default();
        if !media_type.eq_ignore_ascii_case("multipart/form-data") {
            return Err(MultipartError::malformed_boundary(format!(
                "Not multipart/form-data: {media_type}"
            )));
        }

        for param in params {
            if let Some((key, value)) = param.split_once('=') {
                if key.trim().eq_ignore_ascii_case("boundary") {
                    return Self::new(&unquote(value.trim()));
                }
            }
        }

        Err(MultipartError::malformed_boundary(
            "No boundary found in Content-Type",
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// The boundary with its two leading dashes, as it appears on delimiter lines
    pub fn marker(&self) -> &[u8] {
        &self.marker
    }
}

impl fmt::Display for Boundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// Options for a single parse
#[derive(Debug, Clone)]
pub struct ParserOptions {
    /// Known boundary; detected from the first body line when absent
    pub boundary: Option<Boundary>,
    /// Encoding of headers and text fields
    pub encoding: &'static Encoding,
    /// Bytes requested from the transport per pull
    pub chunk_size: usize,
    /// Glob patterns of media types that make a part a file even without a filename
    pub binary_mime_types: Vec<String>,
    /// Skip parts with malformed headers instead of failing
    pub ignore_invalid_parts: bool,
    pub max_parts: usize,
    pub max_field_size: u64,
    pub max_headers_size: usize,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            boundary: None,
            encoding: UTF_8,
            chunk_size: DEFAULT_CHUNK_SIZE,
            binary_mime_types: vec![DEFAULT_BINARY_MIME_TYPE.to_string()],
            ignore_invalid_parts: false,
            max_parts: DEFAULT_MAX_PARTS,
            max_field_size: DEFAULT_MAX_FIELD_SIZE,
            max_headers_size: DEFAULT_MAX_HEADERS_SIZE,
        }
    }
}

impl ParserOptions {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(MultipartError::invalid_configuration(
                "chunk size must be greater than zero",
            ));
        }
        if let Some(boundary) = &self.boundary {
            check_chunk_size(self.chunk_size, boundary)?;
        }
        if !self.encoding.is_ascii_compatible() {
            return Err(MultipartError::invalid_configuration(format!(
                "encoding {} is not ASCII-compatible",
                self.encoding.name()
            )));
        }
        if self.max_parts == 0 {
            return Err(MultipartError::invalid_configuration(
                "max_parts must be at least 1",
            ));
        }
        self.binary_patterns()?;
        Ok(())
    }

    fn binary_patterns(&self) -> Result<Vec<glob::Pattern>> {
        self.binary_mime_types
            .iter()
            .map(|p| glob::Pattern::new(&p.trim().to_ascii_lowercase()).map_err(Into::into))
            .collect()
    }
}

/// Resolves an encoding label such as `utf-8` or `latin1`
pub fn encoding_for_label(label: &str) -> Result<&'static Encoding> {
    Encoding::for_label(label.trim().as_bytes()).ok_or_else(|| {
        MultipartError::invalid_configuration(format!("Unknown encoding: {label}"))
    })
}

fn check_chunk_size(chunk_size: usize, boundary: &Boundary) -> Result<()> {
    if chunk_size <= boundary.len() + DELIMITER_FRAMING {
        return Err(MultipartError::invalid_configuration(format!(
            "chunk size {chunk_size} must exceed boundary length {} plus {DELIMITER_FRAMING}",
            boundary.len()
        )));
    }
    Ok(())
}

/// Represents the Content-Disposition header of a part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDisposition {
    /// The disposition type (usually "form-data")
    pub disposition_type: String,
    /// The name of the form field
    pub name: String,
    /// Sanitized filename, present when the part declared one
    pub filename: Option<String>,
    /// Remaining parameters, keys lowercased
    pub parameters: HashMap<String, String>,
}

impl ContentDisposition {
    /// Parses a Content-Disposition value for the part at index `part`
    pub fn parse(value: &str, part: usize) -> Result<Self> {
        let mut params = split_parameters(value).into_iter();
        let disposition_type = match params.next() {
            Some(kind) if !kind.is_empty() => kind.to_ascii_lowercase(),
            _ => DEFAULT_DISPOSITION.to_string(),
        };

        let mut name = String::new();
        let mut filename = None;
        let mut parameters = HashMap::new();

        for param in params {
            let Some((key, val)) = param.split_once('=') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let val = unquote(val.trim());

            match key.as_str() {
                "name" => name = val,
                "filename" => filename = Some(sanitize_filename(&val)),
                _ => {
                    parameters.insert(key, val);
                }
            }
        }

        if name.is_empty() {
            return Err(MultipartError::malformed_headers(
                part,
                "Missing 'name' in Content-Disposition",
            ));
        }

        Ok(Self {
            disposition_type,
            name,
            filename,
            parameters,
        })
    }
}

/// Parsed headers of one part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartHeaders {
    pub disposition: ContentDisposition,
    pub content_type: String,
    pub extra_headers: ExtraHeaders,
}

impl PartHeaders {
    /// Parses unfolded header lines of the part at index `part`
    pub fn parse<L: AsRef<str>>(lines: &[L], part: usize) -> Result<Self> {
        let mut disposition = None;
        let mut content_type = None;
        let mut extra_headers = ExtraHeaders::new();

        for line in lines {
            let line = line.as_ref();
            let Some((name, value)) = line.split_once(':') else {
                return Err(MultipartError::malformed_headers(
                    part,
                    format!("Invalid header format: {line}"),
                ));
            };
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim();

            match name.as_str() {
                "content-disposition" => {
                    disposition = Some(ContentDisposition::parse(value, part)?);
                }
                "content-type" if !value.is_empty() => {
                    content_type = Some(value.to_string());
                }
                _ => extra_headers.insert(&name, value),
            }
        }

        let disposition = disposition.ok_or_else(|| {
            MultipartError::malformed_headers(part, "Missing Content-Disposition header")
        })?;

        for (key, value) in &disposition.parameters {
            if !extra_headers.contains(key) {
                extra_headers.insert(key, value.clone());
            }
        }

        Ok(Self {
            disposition,
            content_type: content_type.unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            extra_headers,
        })
    }

    /// Content type without parameters, lowercased
    pub fn media_type(&self) -> String {
        self.content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    }

    fn into_file_info(self) -> FileInfo {
        FileInfo {
            name: self.disposition.name,
            file_name: self.disposition.filename.unwrap_or_default(),
            content_type: self.content_type,
            content_disposition: self.disposition.disposition_type,
            extra_headers: self.extra_headers,
        }
    }
}

/// Reduces a client-supplied filename to its last path segment with unsafe
/// characters removed. May return an empty string.
pub fn sanitize_filename(raw: &str) -> String {
    let last = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let cleaned: String = last
        .chars()
        .filter(|c| !c.is_control() && !INVALID_FILENAME_CHARS.contains(c))
        .collect();
    let cleaned = cleaned.trim();
    if cleaned == "." || cleaned == ".." {
        return String::new();
    }
    cleaned.to_string()
}

/// Splits a header value on `;` outside of double quotes
fn split_parameters(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;

    for (i, c) in value.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => {
                parts.push(value[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(value[start..].trim());
    parts
}

fn unquote(value: &str) -> String {
    match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => inner.replace("\\\"", "\""),
        None => value.to_string(),
    }
}

/// Receives the parts of a body as they are decoded.
pub trait PartHandler {
    /// Called once per text field with its complete value
    fn on_field(&mut self, field: FieldPart) -> Result<()>;

    /// Called for every fragment of a file body. The first fragment of each
    /// file has `part_number == 0`; every file gets at least one, possibly
    /// empty, fragment.
    fn on_file_fragment(&mut self, info: &FileInfo, bytes: &[u8], part_number: usize)
    -> Result<()>;

    /// Called once after the closing delimiter
    fn on_stream_closed(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<H: PartHandler + ?Sized> PartHandler for &mut H {
    fn on_field(&mut self, field: FieldPart) -> Result<()> {
        (**self).on_field(field)
    }

    fn on_file_fragment(
        &mut self,
        info: &FileInfo,
        bytes: &[u8],
        part_number: usize,
    ) -> Result<()> {
        (**self).on_file_fragment(info, bytes, part_number)
    }

    fn on_stream_closed(&mut self) -> Result<()> {
        (**self).on_stream_closed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierState {
    SeekFirstBoundary,
    PartHeaders,
    FieldBody,
    FileBody,
    /// After a file body: rest of the delimiter line, next part or closing
    BoundaryTail,
    Done,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delimiter {
    Next,
    Close,
}

/// What the bytes right after a marker candidate say about it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tail {
    Delimiter,
    Content,
    Undecided,
}

fn is_line_space(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\r' | b'\n')
}

fn classify_tail(bytes: &[u8], eof: bool) -> Tail {
    match bytes {
        [b'-', b'-', ..] => Tail::Delimiter,
        [first, ..] if is_line_space(*first) => Tail::Delimiter,
        [b'-'] if !eof => Tail::Undecided,
        [_, ..] => Tail::Content,
        [] if eof => Tail::Delimiter,
        [] => Tail::Undecided,
    }
}

/// The bytes after the marker if `line` is a delimiter line
fn delimiter_tail<'a>(line: &'a [u8], marker: &[u8]) -> Option<&'a [u8]> {
    let tail = line.strip_prefix(marker)?;
    match classify_tail(tail, true) {
        Tail::Delimiter => Some(tail),
        _ => None,
    }
}

fn tail_outcome(tail: &[u8]) -> Result<Delimiter> {
    if tail.starts_with(b"--") {
        Ok(Delimiter::Close)
    } else if tail.iter().all(|&b| is_line_space(b)) {
        Ok(Delimiter::Next)
    } else {
        Err(MultipartError::malformed_boundary(format!(
            "Unexpected text after boundary: {}",
            String::from_utf8_lossy(tail)
        )))
    }
}

/// Reads a boundary from the first line of a body whose boundary is not known
fn detect_boundary(line: &[u8]) -> Result<(Boundary, Delimiter)> {
    let text = std::str::from_utf8(line)
        .map_err(|_| MultipartError::malformed_boundary("First line is not a boundary"))?
        .trim_end_matches([' ', '\t', '\r']);
    let Some(value) = text.strip_prefix("--") else {
        return Err(MultipartError::malformed_boundary(
            "First line does not start with \"--\"",
        ));
    };
    match value.strip_suffix("--") {
        Some(inner) if !inner.is_empty() => Ok((Boundary::new(inner)?, Delimiter::Close)),
        _ => Ok((Boundary::new(value)?, Delimiter::Next)),
    }
}

/// Streams the body bytes in front of the next delimiter to `emit`.
///
/// Reads up to one chunk at a time and looks for `\n` + marker. The CR of a
/// CRLF delimiter is not body content. Bytes that could still belong to a
/// delimiter are held back until more input decides them. On return the
/// reader is positioned right after the marker.
async fn scan_to_delimiter<S, F>(
    reader: &mut RebufferingReader<S>,
    marker: &[u8],
    mut emit: F,
) -> Result<()>
where
    S: ChunkSource,
    F: FnMut(&[u8]) -> Result<()>,
{
    let mut needle = Vec::with_capacity(marker.len() + 1);
    needle.push(b'\n');
    needle.extend_from_slice(marker);
    let hold = needle.len() + 2;
    let chunk_size = reader.chunk_size();

    let mut window: Vec<u8> = Vec::with_capacity(chunk_size + hold);
    let mut searched = 0;
    let mut emitted = false;
    let mut at_start = true;

    loop {
        let filled = window.len();
        window.resize(filled + chunk_size, 0);
        let read = reader.read(&mut window[filled..]).await?;
        window.truncate(filled + read);
        let eof = read < chunk_size;

        // A body may start with the delimiter itself: empty content
        if at_start {
            at_start = false;
            let empty_body = window
                .strip_prefix(marker)
                .is_some_and(|tail| classify_tail(tail, eof) == Tail::Delimiter);
            if empty_body {
                emit(&window[..0])?;
                let end = window.len();
                reader.buffer_range(window, marker.len()..end);
                return Ok(());
            }
        }

        let mut from = searched;
        let mut undecided = None;
        while from < window.len() {
            let Some(found) = scanner::find(&window[from..], &needle) else {
                break;
            };
            let at = from + found;
            let after = at + needle.len();
            match classify_tail(&window[after..], eof) {
                Tail::Delimiter => {
                    let end = if at > 0 && window[at - 1] == b'\r' {
                        at - 1
                    } else {
                        at
                    };
                    if end > 0 || !emitted {
                        emit(&window[..end])?;
                    }
                    let len = window.len();
                    reader.buffer_range(window, after..len);
                    return Ok(());
                }
                Tail::Content => from = at + 1,
                Tail::Undecided => {
                    undecided = Some(at);
                    break;
                }
            }
        }

        if eof {
            return Err(MultipartError::truncated(reader.bytes_pulled()));
        }

        let mut cut = window.len().saturating_sub(hold);
        if let Some(at) = undecided {
            cut = cut.min(at.saturating_sub(1));
        }
        if cut > 0 {
            emit(&window[..cut])?;
            emitted = true;
            window.drain(..cut);
        }
        searched = from.saturating_sub(cut);
    }
}

/// Streaming multipart state machine.
///
/// States advance `SeekFirstBoundary -> PartHeaders -> FieldBody | FileBody ->
/// BoundaryTail -> PartHeaders ... -> Done`. `BoundaryTail` inspects the rest
/// of a delimiter line found inside a body, which decides between another
/// part and the end. Any error moves it to `Invalid`, after
/// which it cannot be resumed.
pub struct PartClassifier<S, H> {
    reader: RebufferingReader<S>,
    handler: H,
    options: ParserOptions,
    patterns: Vec<glob::Pattern>,
    boundary: Option<Boundary>,
    state: ClassifierState,
    parts_seen: usize,
}

impl<S: ChunkSource, H: PartHandler> PartClassifier<S, H> {
    pub fn new(source: S, handler: H, options: ParserOptions) -> Result<Self> {
        options.validate()?;
        let patterns = options.binary_patterns()?;
        let reader =
            RebufferingReader::with_options(source, options.encoding, options.chunk_size)?;

        Ok(Self {
            reader,
            handler,
            boundary: options.boundary.clone(),
            options,
            patterns,
            state: ClassifierState::SeekFirstBoundary,
            parts_seen: 0,
        })
    }

    /// Attaches a token checked before every transport pull
    pub fn with_cancellation(self, cancellation: Cancellation) -> Self {
        Self {
            reader: self.reader.with_cancellation(cancellation),
            ..self
        }
    }

    pub fn state(&self) -> ClassifierState {
        self.state
    }

    /// The boundary in use, once configured or detected
    pub fn boundary(&self) -> Option<&Boundary> {
        self.boundary.as_ref()
    }

    /// Number of parts started so far, skipped ones included
    pub fn parts_seen(&self) -> usize {
        self.parts_seen
    }

    pub fn bytes_pulled(&self) -> u64 {
        self.reader.bytes_pulled()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn into_handler(self) -> H {
        self.handler
    }

    /// Decodes the whole body, returning once the closing delimiter was seen
    pub async fn run(&mut self) -> Result<()> {
        match self.state {
            ClassifierState::Done => return Ok(()),
            ClassifierState::Invalid => {
                return Err(MultipartError::invalid_configuration(
                    "Classifier cannot be reused after a failed parse",
                ));
            }
            _ => {}
        }

        let result = self.drive().await;
        if let Err(e) = &result {
            debug!(
                "Multipart parse failed in state {:?} after {} bytes: {e}",
                self.state,
                self.reader.bytes_pulled()
            );
            self.state = ClassifierState::Invalid;
        }
        result
    }

    async fn drive(&mut self) -> Result<()> {
        loop {
            match self.state {
                ClassifierState::SeekFirstBoundary => self.seek_first_boundary().await?,
                ClassifierState::PartHeaders => self.read_part().await?,
                ClassifierState::BoundaryTail => self.read_boundary_tail().await?,
                ClassifierState::Done => {
                    debug!(
                        "Multipart body complete: {} parts in {} bytes",
                        self.parts_seen,
                        self.reader.bytes_pulled()
                    );
                    return self.handler.on_stream_closed();
                }
                ClassifierState::FieldBody
                | ClassifierState::FileBody
                | ClassifierState::Invalid => {
                    return Err(MultipartError::invalid_configuration(
                        "Classifier cannot resume inside a part body",
                    ));
                }
            }
        }
    }

    fn marker(&self) -> Result<Vec<u8>> {
        self.boundary
            .as_ref()
            .map(|b| b.marker().to_vec())
            .ok_or_else(|| MultipartError::invalid_configuration("Boundary not established"))
    }

    fn after_delimiter(&mut self, delimiter: Delimiter) {
        self.state = match delimiter {
            Delimiter::Next => ClassifierState::PartHeaders,
            Delimiter::Close => ClassifierState::Done,
        };
    }

    fn boundary_not_found(&self) -> MultipartError {
        if self.reader.bytes_pulled() == 0 {
            return MultipartError::invalid_configuration("Empty input");
        }
        match &self.boundary {
            Some(boundary) => {
                MultipartError::malformed_boundary(format!("Boundary {boundary} not found in body"))
            }
            None => MultipartError::malformed_boundary("No boundary line found"),
        }
    }

    async fn seek_first_boundary(&mut self) -> Result<()> {
        loop {
            let Some(line) = self.reader.read_line_limited(MAX_DELIMITER_LINE).await? else {
                return Err(self.boundary_not_found());
            };

            if line.len() > MAX_DELIMITER_LINE {
                if self.boundary.is_none() {
                    return Err(MultipartError::malformed_boundary(
                        "First line is too long to be a boundary",
                    ));
                }
                trace!("Skipping overlong preamble line");
                if !self.reader.skip_line().await? {
                    return Err(self.boundary_not_found());
                }
                continue;
            }

            let known = self
                .boundary
                .as_ref()
                .map(|b| delimiter_tail(&line, b.marker()));

            let outcome = match known {
                Some(Some(tail)) => tail_outcome(tail)?,
                Some(None) => {
                    trace!("Skipping preamble line of {} bytes", line.len());
                    continue;
                }
                None => {
                    if line.iter().all(|&b| is_line_space(b)) {
                        continue;
                    }
                    let (boundary, outcome) = detect_boundary(&line)?;
                    check_chunk_size(self.reader.chunk_size(), &boundary)?;
                    debug!("Detected multipart boundary: {boundary}");
                    self.boundary = Some(boundary);
                    outcome
                }
            };

            self.after_delimiter(outcome);
            return Ok(());
        }
    }

    async fn read_part(&mut self) -> Result<()> {
        let index = self.parts_seen;
        if index >= self.options.max_parts {
            return Err(MultipartError::TooManyParts(self.options.max_parts));
        }
        self.parts_seen += 1;
        let marker = self.marker()?;

        let headers = match self.read_headers(index, &marker).await {
            Ok(headers) => headers,
            Err(e) if e.is_recoverable() && self.options.ignore_invalid_parts => {
                warn!("Skipping invalid part {index}: {e}");
                scan_to_delimiter(&mut self.reader, &marker, |_| Ok(())).await?;
                self.state = ClassifierState::BoundaryTail;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if self.is_file(&headers) {
            self.state = ClassifierState::FileBody;
            self.read_file_body(headers, &marker).await
        } else {
            self.state = ClassifierState::FieldBody;
            self.read_field_body(headers, &marker).await
        }
    }

    /// Reads and parses the header block up to the blank line
    async fn read_headers(&mut self, part: usize, marker: &[u8]) -> Result<PartHeaders> {
        let mut lines: Vec<String> = Vec::new();
        let mut size = 0;

        loop {
            let remaining = self.options.max_headers_size.saturating_sub(size);
            let Some(line) = self.reader.read_line_limited(remaining).await? else {
                return Err(MultipartError::truncated(self.reader.bytes_pulled()));
            };
            if line.is_empty() {
                break;
            }

            size += line.len() + 2;
            if size > self.options.max_headers_size {
                return Err(MultipartError::malformed_headers(
                    part,
                    format!(
                        "Part headers exceed {} bytes",
                        self.options.max_headers_size
                    ),
                ));
            }

            if delimiter_tail(&line, marker).is_some() {
                // Hand the delimiter back so a skip resumes from it
                let mut pending = line;
                pending.push(b'\n');
                self.reader.buffer(pending);
                return Err(MultipartError::malformed_headers(
                    part,
                    "Headers not terminated by a blank line",
                ));
            }

            let (text, _) = self.reader.encoding().decode_without_bom_handling(&line);
            if text.starts_with([' ', '\t']) {
                let Some(previous) = lines.last_mut() else {
                    return Err(MultipartError::malformed_headers(
                        part,
                        "Continuation line without a header",
                    ));
                };
                previous.push(' ');
                previous.push_str(text.trim());
            } else {
                lines.push(text.into_owned());
            }
        }

        PartHeaders::parse(&lines, part)
    }

    fn is_file(&self, headers: &PartHeaders) -> bool {
        if headers.disposition.filename.is_some() {
            return true;
        }
        let media_type = headers.media_type();
        self.patterns.iter().any(|p| p.matches(&media_type))
    }

    async fn read_field_body(&mut self, headers: PartHeaders, marker: &[u8]) -> Result<()> {
        let max_size = self.options.max_field_size;
        let mut lines: Vec<Vec<u8>> = Vec::new();
        let mut size: u64 = 0;

        loop {
            let separator = u64::from(!lines.is_empty());
            // Enough room to recognise the delimiter even when the budget is spent
            let budget = max_size
                .saturating_sub(size + separator)
                .max(MAX_DELIMITER_LINE as u64);
            let limit = usize::try_from(budget).unwrap_or(usize::MAX);
            let Some(line) = self.reader.read_line_limited(limit).await? else {
                return Err(MultipartError::truncated(self.reader.bytes_pulled()));
            };

            if let Some(tail) = delimiter_tail(&line, marker) {
                let outcome = tail_outcome(tail)?;
                if line.len() > limit && outcome == Delimiter::Next {
                    self.reader.skip_line().await?;
                }
                let field =
                    FieldPart::new(headers.disposition.name, lines, self.options.encoding);
                trace!("Field {:?}: {size} bytes", field.name());
                self.handler.on_field(field)?;
                self.after_delimiter(outcome);
                return Ok(());
            }

            size += line.len() as u64 + separator;
            if size > max_size {
                return Err(MultipartError::PayloadTooLarge(max_size));
            }
            lines.push(line);
        }
    }

    async fn read_file_body(&mut self, headers: PartHeaders, marker: &[u8]) -> Result<()> {
        let info = headers.into_file_info();
        debug!(
            "File part {:?} ({:?}, {})",
            info.name, info.file_name, info.content_type
        );

        let mut fragments = 0;
        let mut bytes = 0;
        let handler = &mut self.handler;
        scan_to_delimiter(&mut self.reader, marker, |fragment| {
            let part_number = fragments;
            fragments += 1;
            bytes += fragment.len();
            handler.on_file_fragment(&info, fragment, part_number)
        })
        .await?;

        trace!(
            "File part {:?}: {bytes} bytes in {fragments} fragments",
            info.name
        );
        self.state = ClassifierState::BoundaryTail;
        Ok(())
    }

    /// Inspects the rest of a delimiter line found by the body scanner
    async fn read_boundary_tail(&mut self) -> Result<()> {
        let Some(tail) = self.reader.read_line_limited(MAX_DELIMITER_LINE).await? else {
            return Err(MultipartError::truncated(self.reader.bytes_pulled()));
        };
        if tail.len() > MAX_DELIMITER_LINE && !tail.starts_with(b"--") {
            return Err(MultipartError::malformed_boundary("Delimiter line too long"));
        }
        let outcome = tail_outcome(&tail)?;
        self.after_delimiter(outcome);
        Ok(())
    }
}

impl<S: BlockingSource, H: PartHandler> PartClassifier<S, H> {
    /// Runs the parse to completion on the current thread
    pub fn run_blocking(&mut self) -> Result<()> {
        futures::executor::block_on(self.run())
    }
}
