// SPDX-License-Identifier: MIT

use std::fmt;

#[derive(Debug)]
pub enum MultipartError {
    Io(std::io::Error),
    Glob(glob::PatternError),
    MalformedBoundary(String), // No boundary found, or the configured one never appears
    MalformedPartHeaders { part: usize, reason: String },
    TruncatedInput { offset: u64 }, // Bytes pulled from the transport when it ended
    InvalidConfiguration(String),
    InvalidSearchLimit { limit: usize, haystack_len: usize },
    PayloadTooLarge(u64), // Contains the maximum allowed size
    TooManyParts(usize),  // Contains the maximum allowed part count
    Cancelled,
}

impl fmt::Display for MultipartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MultipartError::Io(err) => write!(f, "IO error: {err}"),
            MultipartError::Glob(err) => write!(f, "Glob pattern error: {err}"),
            MultipartError::MalformedBoundary(msg) => write!(f, "Malformed boundary: {msg}"),
            MultipartError::MalformedPartHeaders { part, reason } => {
                write!(f, "Malformed headers in part {part}: {reason}")
            }
            MultipartError::TruncatedInput { offset } => {
                write!(f, "Input ended unexpectedly after {offset} bytes")
            }
            MultipartError::InvalidConfiguration(msg) => write!(f, "Invalid configuration: {msg}"),
            MultipartError::InvalidSearchLimit {
                limit,
                haystack_len,
            } => write!(
                f,
                "Search limit {limit} must be between 1 and the haystack length {haystack_len}"
            ),
            MultipartError::PayloadTooLarge(max_size) => {
                write!(
                    f,
                    "Field payload too large. Maximum allowed size: {max_size} bytes"
                )
            }
            MultipartError::TooManyParts(max_parts) => {
                write!(f, "Too many parts: maximum {max_parts} allowed")
            }
            MultipartError::Cancelled => write!(f, "Parse cancelled"),
        }
    }
}

impl From<std::io::Error> for MultipartError {
    fn from(err: std::io::Error) -> Self {
        MultipartError::Io(err)
    }
}

impl From<glob::PatternError> for MultipartError {
    fn from(err: glob::PatternError) -> Self {
        MultipartError::Glob(err)
    }
}

impl std::error::Error for MultipartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MultipartError::Io(err) => Some(err),
            MultipartError::Glob(err) => Some(err),
            _ => None,
        }
    }
}

impl MultipartError {
    /// Creates a MalformedBoundary error
    pub fn malformed_boundary<S: Into<String>>(msg: S) -> Self {
        MultipartError::MalformedBoundary(msg.into())
    }

    /// Creates a MalformedPartHeaders error for the given zero-based part index
    pub fn malformed_headers<S: Into<String>>(part: usize, reason: S) -> Self {
        MultipartError::MalformedPartHeaders {
            part,
            reason: reason.into(),
        }
    }

    /// Creates a TruncatedInput error at the given transport offset
    pub fn truncated(offset: u64) -> Self {
        MultipartError::TruncatedInput { offset }
    }

    /// Creates an InvalidConfiguration error
    pub fn invalid_configuration<S: Into<String>>(msg: S) -> Self {
        MultipartError::InvalidConfiguration(msg.into())
    }

    /// The index of the offending part, when the error is tied to one
    pub fn part_index(&self) -> Option<usize> {
        match self {
            MultipartError::MalformedPartHeaders { part, .. } => Some(*part),
            _ => None,
        }
    }

    /// Whether permissive mode may skip the part that raised this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MultipartError::MalformedPartHeaders { .. })
    }
}

pub type Result<T> = std::result::Result<T, MultipartError>;
