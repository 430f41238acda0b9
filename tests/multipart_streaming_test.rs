use formsplit::error::{MultipartError, Result};
use formsplit::form::FormData;
use formsplit::multipart::{Boundary, ParserOptions, PartClassifier, PartHandler};
use formsplit::part::{FieldPart, FileInfo};
use formsplit::reader::{BlockingSource, ChunkSource, ReadSource};
use proptest::prelude::*;
use std::future::Future;
use std::io;

/// Hands out at most `step` bytes per pull regardless of the requested size
struct Trickle {
    data: Vec<u8>,
    pos: usize,
    step: usize,
}

impl Trickle {
    fn new(data: &[u8], step: usize) -> Self {
        Self {
            data: data.to_vec(),
            pos: 0,
            step,
        }
    }
}

impl ChunkSource for Trickle {
    fn pull(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> {
        let n = buf.len().min(self.step).min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        std::future::ready(Ok(n))
    }
}

impl BlockingSource for Trickle {}

/// Flattened view of everything a parse delivered
#[derive(Debug, Default, PartialEq, Eq)]
struct Transcript {
    fields: Vec<(String, String)>,
    files: Vec<(String, String, Vec<u8>)>,
    closed: bool,
}

impl PartHandler for Transcript {
    fn on_field(&mut self, field: FieldPart) -> Result<()> {
        self.fields
            .push((field.name().to_string(), field.text().to_string()));
        Ok(())
    }

    fn on_file_fragment(&mut self, info: &FileInfo, bytes: &[u8], part_number: usize) -> Result<()> {
        if part_number == 0 {
            self.files
                .push((info.name.clone(), info.file_name.clone(), Vec::new()));
        }
        match self.files.last_mut() {
            Some((_, _, data)) => data.extend_from_slice(bytes),
            None => panic!("fragment {part_number} arrived before the first one"),
        }
        Ok(())
    }

    fn on_stream_closed(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

fn decode(body: &[u8], chunk_size: usize, step: usize) -> Result<Transcript> {
    let options = ParserOptions {
        boundary: Some(Boundary::new("XYZ").unwrap()),
        chunk_size,
        ..ParserOptions::default()
    };
    let mut classifier = PartClassifier::new(Trickle::new(body, step), Transcript::default(), options)?;
    classifier.run_blocking()?;
    Ok(classifier.into_handler())
}

fn build_body(title: &str, file: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(b"--XYZ\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\n");
    body.extend_from_slice(title.as_bytes());
    body.extend_from_slice(
        b"\r\n--XYZ\r\nContent-Disposition: form-data; name=\"doc\"; filename=\"data.bin\"\r\n\r\n",
    );
    body.extend_from_slice(file);
    body.extend_from_slice(b"\r\n--XYZ--\r\n");
    body
}

proptest! {
    #[test]
    fn test_chunking_does_not_change_result(
        title in "[a-z ]{0,40}",
        file in prop::collection::vec(prop::sample::select(b"ab-\r\nXYZ \x00\xFF".to_vec()), 0..400),
        chunk_size in 10usize..200,
        step in 1usize..64,
    ) {
        // Near-misses like "--XY" or "X--XYZ" stay, a real delimiter line does not
        prop_assume!(!file.starts_with(b"--XYZ"));
        prop_assume!(!file.windows(6).any(|w| w == b"\n--XYZ"));

        let body = build_body(&title, &file);
        let reference = decode(&body, 4096, usize::MAX).unwrap();
        let chunked = decode(&body, chunk_size, step).unwrap();

        prop_assert_eq!(&chunked, &reference);
        prop_assert_eq!(&chunked.fields, &vec![("title".to_string(), title.clone())]);
        prop_assert_eq!(chunked.files.len(), 1);
        prop_assert_eq!(&chunked.files[0].2, &file);
        prop_assert!(chunked.closed);
    }
}

#[test]
fn test_boundary_split_across_pulls() {
    let body = build_body("Report", b"Hello");
    // Every split point lands somewhere inside a delimiter at least once
    for step in 1..=body.len() {
        let transcript = decode(&body, 12, step).unwrap();
        assert_eq!(transcript.fields, vec![("title".to_string(), "Report".to_string())]);
        assert_eq!(transcript.files[0].2, b"Hello", "step {step}");
    }
}

#[test]
fn test_byte_order_mark_is_stripped() {
    let mut body = vec![0xEF, 0xBB, 0xBF];
    body.extend_from_slice(&build_body("Report", b"Hello"));

    for step in [1, 2, 3, 4, 4096] {
        let options = ParserOptions::default();
        let mut classifier =
            PartClassifier::new(Trickle::new(&body, step), Transcript::default(), options).unwrap();
        classifier.run_blocking().unwrap();

        assert_eq!(classifier.boundary().unwrap().as_str(), "XYZ");
        let transcript = classifier.into_handler();
        assert_eq!(transcript.files[0].2, b"Hello");
    }
}

#[test]
fn test_large_file_streams_in_fragments() {
    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let body = build_body("big", &payload);

    #[derive(Default)]
    struct Counter {
        fragments: usize,
        largest: usize,
        total: usize,
    }

    impl PartHandler for Counter {
        fn on_field(&mut self, _field: FieldPart) -> Result<()> {
            Ok(())
        }

        fn on_file_fragment(&mut self, _info: &FileInfo, bytes: &[u8], _n: usize) -> Result<()> {
            self.fragments += 1;
            self.largest = self.largest.max(bytes.len());
            self.total += bytes.len();
            Ok(())
        }
    }

    let options = ParserOptions {
        chunk_size: 1024,
        ..ParserOptions::default()
    };
    let mut classifier =
        PartClassifier::new(ReadSource::new(&body[..]), Counter::default(), options).unwrap();
    classifier.run_blocking().unwrap();
    let counter = classifier.into_handler();

    assert_eq!(counter.total, payload.len());
    assert!(counter.fragments > 100);
    assert!(counter.largest <= 1024 + 16);
}

#[test]
fn test_handler_error_stops_parse() {
    struct Refuse;

    impl PartHandler for Refuse {
        fn on_field(&mut self, _field: FieldPart) -> Result<()> {
            Ok(())
        }

        fn on_file_fragment(&mut self, _info: &FileInfo, _bytes: &[u8], _n: usize) -> Result<()> {
            Err(MultipartError::Io(io::Error::other("disk full")))
        }
    }

    let body = build_body("t", b"content");
    let mut classifier =
        PartClassifier::new(ReadSource::new(&body[..]), Refuse, ParserOptions::default()).unwrap();
    assert!(matches!(classifier.run_blocking(), Err(MultipartError::Io(_))));
    // A failed classifier refuses to resume
    assert!(classifier.run_blocking().is_err());
}

#[test]
fn test_async_reader_matches_blocking() {
    let body = build_body("same", b"bytes\r\n--XY not a delimiter");
    let blocking = FormData::parse(&body[..], ParserOptions::default()).unwrap();
    let async_form = futures::executor::block_on(FormData::parse_async(
        futures::io::Cursor::new(body.clone()),
        ParserOptions::default(),
    ))
    .unwrap();

    assert_eq!(blocking.parameters(), async_form.parameters());
    assert_eq!(blocking.files(), async_form.files());
    assert_eq!(async_form.files()[0].data(), b"bytes\r\n--XY not a delimiter");
}
