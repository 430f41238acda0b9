//! Decoded parts of a multipart body.

use encoding_rs::Encoding;
use std::cell::OnceCell;
use std::collections::HashMap;
use std::io::Cursor;

/// Part headers other than Content-Disposition and Content-Type.
///
/// Names are stored lowercased and looked up case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtraHeaders {
    entries: HashMap<String, String>,
}

impl ExtraHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a header, replacing any previous value under the same name
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.entries.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A text form field.
///
/// The raw body lines are kept as received; [`text`](Self::text) decodes them
/// once on first use.
#[derive(Debug, Clone)]
pub struct FieldPart {
    name: String,
    lines: Vec<Vec<u8>>,
    encoding: &'static Encoding,
    text: OnceCell<String>,
}

impl FieldPart {
    pub fn new(name: impl Into<String>, lines: Vec<Vec<u8>>, encoding: &'static Encoding) -> Self {
        Self {
            name: name.into(),
            lines,
            encoding,
            text: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lines(&self) -> &[Vec<u8>] {
        &self.lines
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    /// Raw value with lines joined by `\n`
    pub fn to_bytes(&self) -> Vec<u8> {
        self.lines.join(&b'\n')
    }

    /// Decoded value with lines joined by `\n`
    pub fn text(&self) -> &str {
        self.text.get_or_init(|| {
            let bytes = self.to_bytes();
            let (text, _) = self.encoding.decode_without_bom_handling(&bytes);
            text.into_owned()
        })
    }
}

impl PartialEq for FieldPart {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.lines == other.lines && self.encoding == other.encoding
    }
}

/// Metadata of a file part, handed to the handler with every fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Form field name
    pub name: String,
    /// Sanitized client file name, empty when none was declared
    pub file_name: String,
    pub content_type: String,
    pub content_disposition: String,
    pub extra_headers: ExtraHeaders,
}

/// A fully collected file part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    info: FileInfo,
    data: Vec<u8>,
}

impl FilePart {
    pub fn new(info: FileInfo, data: Vec<u8>) -> Self {
        Self { info, data }
    }

    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn file_name(&self) -> &str {
        &self.info.file_name
    }

    pub fn content_type(&self) -> &str {
        &self.info.content_type
    }

    pub fn content_disposition(&self) -> &str {
        &self.info.content_disposition
    }

    pub fn extra_headers(&self) -> &ExtraHeaders {
        &self.info.extra_headers
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Positioned reader over the file content
    pub fn reader(&self) -> Cursor<&[u8]> {
        Cursor::new(&self.data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Appends a streamed fragment
    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encoding_rs::{UTF_8, WINDOWS_1252};
    use std::io::Read;

    #[test]
    fn test_extra_headers_case_insensitive() {
        let mut headers = ExtraHeaders::new();
        headers.insert("X-Trace-Id", "abc");
        assert_eq!(headers.get("x-trace-id"), Some("abc"));
        assert_eq!(headers.get("X-TRACE-ID"), Some("abc"));
        assert!(headers.contains("x-Trace-id"));
        assert_eq!(headers.iter().next(), Some(("x-trace-id", "abc")));

        headers.insert("x-trace-id", "def");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("X-Trace-Id"), Some("def"));
    }

    #[test]
    fn test_field_joins_lines() {
        let field = FieldPart::new("notes", vec![b"first".to_vec(), b"second".to_vec()], UTF_8);
        assert_eq!(field.text(), "first\nsecond");
        assert_eq!(field.to_bytes(), b"first\nsecond");
        assert_eq!(field.lines().len(), 2);
    }

    #[test]
    fn test_field_empty_value() {
        let field = FieldPart::new("empty", Vec::new(), UTF_8);
        assert_eq!(field.text(), "");
        assert!(field.to_bytes().is_empty());
    }

    #[test]
    fn test_field_decodes_with_its_encoding() {
        let field = FieldPart::new("city", vec![vec![b'M', 0xFC, b'n']], WINDOWS_1252);
        assert_eq!(field.text(), "Mün");
        // Cached value is returned on later calls
        assert!(std::ptr::eq(field.text(), field.text()));
    }

    #[test]
    fn test_file_part_reader() {
        let info = FileInfo {
            name: "upload".to_string(),
            file_name: "a.bin".to_string(),
            content_type: "application/octet-stream".to_string(),
            content_disposition: "form-data".to_string(),
            extra_headers: ExtraHeaders::new(),
        };
        let mut part = FilePart::new(info, b"abc".to_vec());
        part.extend(b"def");

        let mut content = String::new();
        part.reader().read_to_string(&mut content).unwrap();
        assert_eq!(content, "abcdef");
        assert_eq!(part.len(), 6);
        assert!(!part.is_empty());
        assert_eq!(part.file_name(), "a.bin");
        assert_eq!(part.into_data(), b"abcdef");
    }
}
