use formsplit::error::MultipartError;
use formsplit::form::FormData;
use formsplit::multipart::{
    Boundary, ContentDisposition, ParserOptions, PartHeaders, sanitize_filename,
};

fn options_with(boundary: &str) -> ParserOptions {
    ParserOptions {
        boundary: Some(Boundary::new(boundary).unwrap()),
        ..ParserOptions::default()
    }
}

#[test]
fn test_multipart_structure_validation() {
    let cd = ContentDisposition::parse("form-data; name=\"field1\"", 0).unwrap();
    assert_eq!(cd.disposition_type, "form-data");
    assert_eq!(cd.name, "field1");
    assert_eq!(cd.filename, None);

    let cd_file =
        ContentDisposition::parse("form-data; name=\"file\"; filename=\"test.txt\"", 1).unwrap();
    assert_eq!(cd_file.name, "file");
    assert_eq!(cd_file.filename, Some("test.txt".to_string()));

    let err = ContentDisposition::parse("form-data; filename=\"x\"", 4).unwrap_err();
    assert_eq!(err.part_index(), Some(4));
    assert!(err.is_recoverable());
}

#[test]
fn test_boundary_extraction_from_content_type() {
    let boundary =
        Boundary::from_content_type("multipart/form-data; boundary=----WebKitFormBoundary7MA4YWxkTrZu0gW")
            .unwrap();
    assert_eq!(boundary.as_str(), "----WebKitFormBoundary7MA4YWxkTrZu0gW");
    assert_eq!(boundary.marker(), b"------WebKitFormBoundary7MA4YWxkTrZu0gW");

    let quoted =
        Boundary::from_content_type(r#"multipart/form-data; charset=utf-8; boundary="----WebKitFormBoundary7MA4YWxkTrZu0gW""#)
            .unwrap();
    assert_eq!(quoted, boundary);

    assert!(Boundary::from_content_type("application/json").is_err());
    assert!(Boundary::from_content_type("multipart/form-data").is_err());
}

#[test]
fn test_part_headers_with_unknown_headers() {
    let headers = PartHeaders::parse(
        &[
            "Content-Disposition: form-data; name=\"avatar\"; filename=\"me.png\"",
            "Content-Type: image/png; q=1",
            "X-Checksum: 1234",
        ],
        0,
    )
    .unwrap();

    assert_eq!(headers.disposition.name, "avatar");
    assert_eq!(headers.media_type(), "image/png");
    assert_eq!(headers.extra_headers.get("x-checksum"), Some("1234"));
}

#[test]
fn test_filename_security() {
    assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
    assert_eq!(sanitize_filename("C:\\Users\\me\\report.pdf"), "report.pdf");
    assert_eq!(sanitize_filename("a<b>c|d:e*f?g\"h.txt"), "abcdefgh.txt");
    assert_eq!(sanitize_filename(".."), "");
    assert_eq!(sanitize_filename(""), "");

    let body = b"--XYZ\r\n\
        Content-Disposition: form-data; name=\"f\"; filename=\"../../etc/passwd\"\r\n\r\n\
        root:x:0:0\r\n\
        --XYZ--\r\n";
    let form = FormData::parse(&body[..], options_with("XYZ")).unwrap();
    assert_eq!(form.files()[0].file_name(), "passwd");
    assert_eq!(form.files()[0].data(), b"root:x:0:0");
}

#[test]
fn test_report_form() {
    let body = b"--XYZ\r\n\
        Content-Disposition: form-data; name=\"title\"\r\n\r\n\
        Report\r\n\
        --XYZ\r\n\
        Content-Disposition: form-data; name=\"doc\"; filename=\"report.txt\"\r\n\
        Content-Type: text/plain\r\n\r\n\
        Hello\r\n\
        --XYZ--\r\n";

    let form = FormData::parse(&body[..], options_with("XYZ")).unwrap();
    assert_eq!(form.parameter_value("title"), Some("Report"));

    let doc = form.file("doc").unwrap();
    assert_eq!(doc.file_name(), "report.txt");
    assert_eq!(doc.content_type(), "text/plain");
    assert_eq!(doc.content_disposition(), "form-data");
    assert_eq!(doc.data(), b"Hello");
}

#[test]
fn test_security_limits() {
    let mut body = Vec::new();
    for i in 0..5 {
        body.extend_from_slice(
            format!("--XYZ\r\nContent-Disposition: form-data; name=\"f{i}\"\r\n\r\nv\r\n").as_bytes(),
        );
    }
    body.extend_from_slice(b"--XYZ--\r\n");

    let options = ParserOptions {
        max_parts: 3,
        ..options_with("XYZ")
    };
    let result = FormData::parse(&body[..], options);
    assert!(matches!(result, Err(MultipartError::TooManyParts(3))));

    let options = ParserOptions {
        max_field_size: 4,
        ..options_with("XYZ")
    };
    let long = b"--XYZ\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\ntoo long\r\n--XYZ--\r\n";
    let result = FormData::parse(&long[..], options);
    assert!(matches!(result, Err(MultipartError::PayloadTooLarge(4))));
}

#[test]
fn test_permissive_and_strict_modes() {
    let body = b"--XYZ\r\n\
        Content-Type: text/plain\r\n\r\n\
        lost\r\n\
        --XYZ\r\n\
        Content-Disposition: form-data; name=\"kept\"\r\n\r\n\
        yes\r\n\
        --XYZ--\r\n";

    let strict = FormData::parse(&body[..], options_with("XYZ"));
    match strict {
        Err(MultipartError::MalformedPartHeaders { part, .. }) => assert_eq!(part, 0),
        other => panic!("expected malformed headers, got {other:?}"),
    }

    let permissive = ParserOptions {
        ignore_invalid_parts: true,
        ..options_with("XYZ")
    };
    let form = FormData::parse(&body[..], permissive).unwrap();
    assert_eq!(form.parameters().len(), 1);
    assert_eq!(form.parameter_value("kept"), Some("yes"));
    assert!(form.files().is_empty());
}

#[test]
fn test_empty_multipart() {
    let form = FormData::parse(&b"--XYZ--\r\n"[..], options_with("XYZ")).unwrap();
    assert!(form.parameters().is_empty());
    assert!(form.files().is_empty());

    let detected = FormData::parse(&b"--XYZ--\r\n"[..], ParserOptions::default()).unwrap();
    assert!(detected.files().is_empty());

    let empty = FormData::parse(&b""[..], ParserOptions::default());
    assert!(matches!(empty, Err(MultipartError::InvalidConfiguration(_))));
}

#[test]
fn test_missing_closing_delimiter() {
    let body = b"--XYZ\r\n\
        Content-Disposition: form-data; name=\"doc\"; filename=\"a.txt\"\r\n\r\n\
        never closed";
    let result = FormData::parse(&body[..], options_with("XYZ"));
    assert!(matches!(result, Err(MultipartError::TruncatedInput { .. })));
}

#[test]
fn test_boundary_absent_from_body() {
    let body = b"--OTHER\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nv\r\n--OTHER--\r\n";
    let result = FormData::parse(&body[..], options_with("XYZ"));
    assert!(matches!(result, Err(MultipartError::MalformedBoundary(_))));
}
