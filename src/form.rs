//! In-memory aggregation of a whole multipart body.
//!
//! [`FormData`] is the simplest [`PartHandler`]: it keeps every field and
//! concatenates every file's fragments. Use it when bodies are small enough
//! to hold in memory; stream to [`crate::upload::DiskSink`] otherwise.

use crate::error::{MultipartError, Result};
use crate::multipart::{ParserOptions, PartClassifier, PartHandler};
use crate::part::{FieldPart, FileInfo, FilePart};
use crate::reader::{AsyncReadSource, Cancellation, ChunkSource, ReadSource};
use futures::io::AsyncRead;
use log::debug;
use std::io::Read;

#[derive(Debug, Clone, Default)]
pub struct FormData {
    files: Vec<FilePart>,
    parameters: Vec<FieldPart>,
}

impl FormData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a body from a blocking reader
    pub fn parse<R: Read>(read: R, options: ParserOptions) -> Result<Self> {
        let mut classifier = PartClassifier::new(ReadSource::new(read), Self::new(), options)?;
        classifier.run_blocking()?;
        Ok(classifier.into_handler().logged())
    }

    /// Parses a body from an async reader
    pub async fn parse_async<R: AsyncRead + Unpin>(read: R, options: ParserOptions) -> Result<Self> {
        Self::parse_source(AsyncReadSource::new(read), options, None).await
    }

    /// Parses a body from any chunk source, optionally cancellable
    pub async fn parse_source<S: ChunkSource>(
        source: S,
        options: ParserOptions,
        cancellation: Option<Cancellation>,
    ) -> Result<Self> {
        let mut classifier = PartClassifier::new(source, Self::new(), options)?;
        if let Some(token) = cancellation {
            classifier = classifier.with_cancellation(token);
        }
        classifier.run().await?;
        Ok(classifier.into_handler().logged())
    }

    fn logged(self) -> Self {
        debug!(
            "Collected {} fields and {} files",
            self.parameters.len(),
            self.files.len()
        );
        self
    }

    pub fn files(&self) -> &[FilePart] {
        &self.files
    }

    pub fn parameters(&self) -> &[FieldPart] {
        &self.parameters
    }

    /// First file part submitted under `name`
    pub fn file(&self, name: &str) -> Option<&FilePart> {
        self.files.iter().find(|f| f.name() == name)
    }

    /// Text of the first field named `name`
    pub fn parameter_value(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| p.name() == name)
            .map(FieldPart::text)
    }

    /// Texts of every field named `name`, in body order
    pub fn parameter_values(&self, name: &str) -> Vec<&str> {
        self.parameters
            .iter()
            .filter(|p| p.name() == name)
            .map(FieldPart::text)
            .collect()
    }

    pub fn has_parameter(&self, name: &str) -> bool {
        self.parameters.iter().any(|p| p.name() == name)
    }

    pub fn into_parts(self) -> (Vec<FieldPart>, Vec<FilePart>) {
        (self.parameters, self.files)
    }
}

impl PartHandler for FormData {
    fn on_field(&mut self, field: FieldPart) -> Result<()> {
        self.parameters.push(field);
        Ok(())
    }

    fn on_file_fragment(&mut self, info: &FileInfo, bytes: &[u8], part_number: usize) -> Result<()> {
        if part_number == 0 {
            self.files.push(FilePart::new(info.clone(), Vec::new()));
        }
        match self.files.last_mut() {
            Some(file) => {
                file.extend(bytes);
                Ok(())
            }
            None => Err(MultipartError::invalid_configuration(
                "File fragment received before the start of a file",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = b"--XYZ\r\n\
        Content-Disposition: form-data; name=\"tag\"\r\n\r\nred\r\n\
        --XYZ\r\n\
        Content-Disposition: form-data; name=\"tag\"\r\n\r\nblue\r\n\
        --XYZ\r\n\
        Content-Disposition: form-data; name=\"doc\"; filename=\"notes.txt\"\r\n\r\nhi there\r\n\
        --XYZ--\r\n";

    #[test]
    fn test_accessors() {
        let form = FormData::parse(BODY, ParserOptions::default()).unwrap();

        assert_eq!(form.parameters().len(), 2);
        assert_eq!(form.parameter_value("tag"), Some("red"));
        assert_eq!(form.parameter_values("tag"), vec!["red", "blue"]);
        assert!(form.has_parameter("tag"));
        assert!(!form.has_parameter("doc"));
        assert_eq!(form.parameter_value("missing"), None);

        let file = form.file("doc").unwrap();
        assert_eq!(file.file_name(), "notes.txt");
        assert_eq!(file.content_type(), "text/plain");
        assert_eq!(file.data(), b"hi there");
        assert!(form.file("tag").is_none());
    }

    #[test]
    fn test_fragment_without_start_is_rejected() {
        let mut form = FormData::new();
        let info = FileInfo {
            name: "f".to_string(),
            file_name: String::new(),
            content_type: "text/plain".to_string(),
            content_disposition: "form-data".to_string(),
            extra_headers: Default::default(),
        };
        assert!(form.on_file_fragment(&info, b"x", 3).is_err());
    }

    #[test]
    fn test_async_parse() {
        let form = futures::executor::block_on(FormData::parse_async(
            futures::io::Cursor::new(BODY.to_vec()),
            ParserOptions::default(),
        ))
        .unwrap();
        assert_eq!(form.parameter_values("tag"), vec!["red", "blue"]);
        assert_eq!(form.files().len(), 1);
    }

    #[test]
    fn test_cancelled_parse() {
        let token = Cancellation::new();
        token.cancel();
        let result = futures::executor::block_on(FormData::parse_source(
            ReadSource::new(BODY),
            ParserOptions::default(),
            Some(token),
        ));
        assert!(matches!(result, Err(MultipartError::Cancelled)));
    }
}
