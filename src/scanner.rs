// SPDX-License-Identifier: MIT

//! Bounded byte-sequence search used to locate multipart delimiters.
//!
//! Delimiters are at most 70 bytes plus a few framing bytes, so a first-byte
//! filter followed by a straight comparison is all that is needed here.

use crate::error::{MultipartError, Result};

/// Finds the first occurrence of `needle` within the first `limit` bytes of `haystack`.
///
/// `limit` is the length of the haystack prefix to consider; the last start
/// position that can still match is `limit - needle.len()`. Empty inputs and a
/// needle longer than the haystack report `Ok(None)`. A `limit` of zero or one
/// larger than the haystack is a caller error.
pub fn search(haystack: &[u8], needle: &[u8], limit: usize) -> Result<Option<usize>> {
    if haystack.is_empty() || needle.is_empty() || needle.len() > haystack.len() {
        return Ok(None);
    }
    if limit == 0 || limit > haystack.len() {
        return Err(MultipartError::InvalidSearchLimit {
            limit,
            haystack_len: haystack.len(),
        });
    }
    if needle.len() > limit {
        return Ok(None);
    }

    let last_start = limit - needle.len();
    let first = needle[0];
    let rest = &needle[1..];

    let mut index = 0;
    while index <= last_start {
        if haystack[index] == first && haystack[index + 1..index + needle.len()] == *rest {
            return Ok(Some(index));
        }
        index += 1;
    }

    Ok(None)
}

/// Searches the whole haystack.
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    // A full-length limit can never be out of range.
    search(haystack, needle, haystack.len()).unwrap_or(None)
}
