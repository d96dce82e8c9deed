//! Incremental decoder for `multipart/form-data` request bodies.
//!
//! The decoder consumes body bytes one at a time and never requires a part, or even a
//! boundary, to arrive in a single read.  Bytes that look like the start of a boundary
//! are withheld until the match succeeds or fails; on failure every withheld byte is
//! re-emitted as part data before normal scanning resumes, so part payloads are
//! byte-exact regardless of how the input was fragmented.
//!
//! Non-file fields are collected in memory and surfaced as [`Part::Field`].  File parts
//! are streamed through an [`UploadSink`] in fixed size slices, with a final slice
//! flagged when the part's closing boundary has been confirmed.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::mem::take;

use crate::ascii::{CR, DASH, LF};
use crate::log::warning;

/// Errors produced while decoding a multipart body.
#[derive(Debug, PartialEq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MultipartError {
    /// The body did not open with `--boundary\r\n`
    #[error("multipart body did not start with the declared boundary")]
    BadOpeningBoundary,
    /// A boundary was matched in full but was not followed by `\r\n` or `--`
    #[error("matched boundary was not terminated with crlf or dashes")]
    BadBoundaryTerminator,
}

/// Receives file part payloads as they are decoded.
///
/// `offset` is the position of `data` within the part's payload, and `is_final` is true
/// on the last slice of the part.  A part may produce a final slice with an empty `data`
/// when its earlier slices already carried the whole payload.
pub trait UploadSink {
    /// Accept the next slice of a file part.
    fn upload(&mut self, filename: &str, offset: usize, data: &[u8], is_final: bool);
}

/// A completed part of a multipart body.
#[derive(Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Part {
    /// A plain form field
    Field {
        /// Field name from the Content-Disposition header
        name: String,
        /// Field value
        value: String,
    },
    /// A file part, already delivered through the [`UploadSink`]
    File {
        /// Field name from the Content-Disposition header
        name: String,
        /// Client supplied filename
        filename: String,
        /// Total payload size in bytes
        size: usize,
    },
}

#[derive(Debug, PartialEq)]
enum MultiState {
    ExpectBoundary,
    ParseHeaders,
    WaitForCr,
    ExpectLf1,
    ExpectDash1,
    ExpectDash2,
    BoundaryOrData,
    DashOrCr2,
    ExpectLf2,
    Finished,
    Error,
}

/// Streaming decoder for one multipart body.
pub struct MultipartDecoder {
    state: MultiState,
    boundary: String,
    boundary_pos: usize,
    line: Vec<u8>,
    item_name: String,
    item_filename: String,
    item_is_file: bool,
    item_value: Vec<u8>,
    item_size: usize,
    upload_buf: Vec<u8>,
    upload_cap: usize,
}

impl MultipartDecoder {
    /// Construct a decoder for the given boundary.  File part payloads are flushed to
    /// the sink whenever `upload_cap` bytes have accumulated.
    pub fn new(boundary: impl Into<String>, upload_cap: usize) -> Self {
        Self {
            state: MultiState::ExpectBoundary,
            boundary: boundary.into(),
            boundary_pos: 0,
            line: Vec::new(),
            item_name: String::new(),
            item_filename: String::new(),
            item_is_file: false,
            item_value: Vec::new(),
            item_size: 0,
            upload_buf: Vec::new(),
            upload_cap,
        }
    }

    /// True once the closing `--boundary--` has been seen.
    pub fn finished(&self) -> bool {
        self.state == MultiState::Finished
    }

    /// Consume one body byte.  `parsed_len` is the number of body bytes consumed before
    /// this one and `content_length` the declared body length; both drive detection of
    /// the closing boundary.  Returns a completed [`Part`] when this byte confirms one.
    pub fn feed_byte(
        &mut self,
        data: u8,
        parsed_len: usize,
        content_length: usize,
        sink: &mut dyn UploadSink,
    ) -> Result<Option<Part>, MultipartError> {
        let blen = self.boundary.len();

        match self.state {
            MultiState::ExpectBoundary => {
                let expected = if parsed_len < 2 {
                    DASH
                } else if parsed_len - 2 < blen {
                    self.boundary.as_bytes()[parsed_len - 2]
                } else if parsed_len - 2 == blen {
                    CR
                } else {
                    LF
                };
                if data != expected {
                    self.state = MultiState::Error;
                    return Err(MultipartError::BadOpeningBoundary);
                }
                if parsed_len >= 3 && parsed_len - 3 == blen {
                    self.state = MultiState::ParseHeaders;
                    self.item_is_file = false;
                }
            }
            MultiState::ParseHeaders => {
                if data != CR && data != LF {
                    self.line.push(data);
                }
                if data == LF {
                    if self.line.is_empty() {
                        self.begin_value();
                    } else {
                        let line = String::from_utf8_lossy(&self.line).to_string();
                        self.line.clear();
                        self.parse_part_header(&line);
                    }
                }
            }
            MultiState::WaitForCr => {
                if data == CR {
                    self.state = MultiState::ExpectLf1;
                } else {
                    self.write_item(data, sink);
                }
            }
            MultiState::ExpectLf1 => {
                if data == LF {
                    self.state = MultiState::ExpectDash1;
                } else {
                    self.replay(&[CR], data, sink);
                }
            }
            MultiState::ExpectDash1 => {
                if data == DASH {
                    self.state = MultiState::ExpectDash2;
                } else {
                    self.replay(&[CR, LF], data, sink);
                }
            }
            MultiState::ExpectDash2 => {
                if data == DASH {
                    self.state = MultiState::BoundaryOrData;
                    self.boundary_pos = 0;
                } else {
                    self.replay(&[CR, LF, DASH], data, sink);
                }
            }
            MultiState::BoundaryOrData => {
                if self.boundary.as_bytes()[self.boundary_pos] != data {
                    let pos = self.boundary_pos;
                    self.replay_boundary(pos, data, sink);
                } else if self.boundary_pos == blen - 1 {
                    // full boundary matched, the part is complete
                    self.state = MultiState::DashOrCr2;
                    return Ok(self.take_part(sink));
                } else {
                    self.boundary_pos += 1;
                }
            }
            MultiState::DashOrCr2 => {
                if data == CR {
                    self.state = MultiState::ExpectLf2;
                } else if data == DASH {
                    // closing boundary, one dash and a crlf should remain
                    if content_length != parsed_len + 4 {
                        warning!(
                            "multipart body declared {} bytes beyond the closing boundary",
                            content_length.saturating_sub(parsed_len + 4)
                        );
                    }
                    self.state = MultiState::Finished;
                } else {
                    self.state = MultiState::Error;
                    return Err(MultipartError::BadBoundaryTerminator);
                }
            }
            MultiState::ExpectLf2 => {
                if data == LF {
                    self.state = MultiState::ParseHeaders;
                    self.item_is_file = false;
                } else {
                    self.state = MultiState::Error;
                    return Err(MultipartError::BadBoundaryTerminator);
                }
            }
            MultiState::Finished | MultiState::Error => {}
        }

        Ok(None)
    }

    /// Flush any buffered file payload to the sink without finishing the part.  Called
    /// by the request parser at the end of each batch of body bytes.
    pub(crate) fn flush_chunk(&mut self, sink: &mut dyn UploadSink) {
        if self.item_is_file && !self.upload_buf.is_empty() {
            let offset = self.item_size - self.upload_buf.len();
            sink.upload(&self.item_filename, offset, &self.upload_buf, false);
            self.upload_buf.clear();
        }
    }

    fn parse_part_header(&mut self, line: &str) {
        if line.strip_prefix("Content-Type:").is_some() {
            self.item_is_file = true;
        } else if let Some(val) = line.strip_prefix("Content-Disposition:") {
            // e.g. form-data; name="field"; filename="a.txt"
            for seg in val.split(';').skip(1) {
                if let Some((name, val)) = seg.split_once('=') {
                    let val = val.trim().trim_matches('"');
                    match name.trim() {
                        "name" => self.item_name = val.to_string(),
                        "filename" => {
                            self.item_filename = val.to_string();
                            self.item_is_file = true;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn begin_value(&mut self) {
        self.state = MultiState::WaitForCr;
        self.item_size = 0;
        self.item_value.clear();
        if self.item_is_file {
            self.upload_buf = Vec::with_capacity(self.upload_cap);
        }
    }

    fn write_item(&mut self, data: u8, sink: &mut dyn UploadSink) {
        self.item_size += 1;
        if self.item_is_file {
            self.upload_buf.push(data);
            if self.upload_buf.len() == self.upload_cap {
                self.flush_chunk(sink);
            }
        } else {
            self.item_value.push(data);
        }
    }

    // A provisional boundary match failed.  Re-emit the withheld prefix as part data,
    // then rescan the current byte so a CR restarts the match.
    fn replay(&mut self, withheld: &[u8], data: u8, sink: &mut dyn UploadSink) {
        for &b in withheld {
            self.write_item(b, sink);
        }
        if data == CR {
            self.state = MultiState::ExpectLf1;
        } else {
            self.state = MultiState::WaitForCr;
            self.write_item(data, sink);
        }
    }

    fn replay_boundary(&mut self, matched: usize, data: u8, sink: &mut dyn UploadSink) {
        for &b in [CR, LF, DASH, DASH].iter() {
            self.write_item(b, sink);
        }
        for i in 0..matched {
            let b = self.boundary.as_bytes()[i];
            self.write_item(b, sink);
        }
        self.replay(&[], data, sink);
    }

    // The part's closing boundary has been confirmed.  Emit the part, flushing the
    // remainder of a file payload with the final flag set.
    fn take_part(&mut self, sink: &mut dyn UploadSink) -> Option<Part> {
        if !self.item_is_file {
            return Some(Part::Field {
                name: take(&mut self.item_name),
                value: String::from_utf8_lossy(&self.item_value).to_string(),
            });
        }

        if self.item_size == 0 {
            return None;
        }

        let offset = self.item_size - self.upload_buf.len();
        sink.upload(&self.item_filename, offset, &self.upload_buf, true);
        self.upload_buf = Vec::new();

        Some(Part::File {
            name: take(&mut self.item_name),
            filename: take(&mut self.item_filename),
            size: self.item_size,
        })
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use std::string::{String, ToString};
    use std::vec::Vec;

    use super::*;

    #[derive(Default)]
    struct TestSink {
        chunks: Vec<(String, usize, Vec<u8>, bool)>,
    }

    impl UploadSink for TestSink {
        fn upload(&mut self, filename: &str, offset: usize, data: &[u8], is_final: bool) {
            self.chunks
                .push((filename.to_string(), offset, data.to_vec(), is_final));
        }
    }

    fn decode(body: &[u8], boundary: &str, cap: usize) -> (Vec<Part>, TestSink) {
        let mut decoder = MultipartDecoder::new(boundary, cap);
        let mut sink = TestSink::default();
        let mut parts = Vec::new();

        for (i, b) in body.iter().enumerate() {
            if let Some(part) = decoder
                .feed_byte(*b, i, body.len(), &mut sink)
                .unwrap()
            {
                parts.push(part);
            }
        }
        decoder.flush_chunk(&mut sink);

        (parts, sink)
    }

    fn file_payload(sink: &TestSink) -> Vec<u8> {
        let mut payload = Vec::new();
        for (_, offset, data, _) in sink.chunks.iter() {
            assert_eq!(*offset, payload.len());
            payload.extend_from_slice(data);
        }
        payload
    }

    #[test]
    fn test_field_and_file() {
        let body = b"--XX\r\n\
            Content-Disposition: form-data; name=\"greeting\"\r\n\r\n\
            hello world\r\n\
            --XX\r\n\
            Content-Disposition: form-data; name=\"doc\"; filename=\"a.txt\"\r\n\
            Content-Type: text/plain\r\n\r\n\
            file contents\r\n\
            --XX--\r\n";

        let (parts, sink) = decode(body, "XX", 1460);
        assert_eq!(parts.len(), 2);
        assert_eq!(
            parts[0],
            Part::Field {
                name: "greeting".to_string(),
                value: "hello world".to_string()
            }
        );
        assert_eq!(
            parts[1],
            Part::File {
                name: "doc".to_string(),
                filename: "a.txt".to_string(),
                size: 13
            }
        );
        assert_eq!(file_payload(&sink), b"file contents");
        assert!(sink.chunks.last().unwrap().3);
    }

    #[test]
    fn test_payload_containing_boundary_prefix() {
        // payload carries a false boundary start that must be replayed as data
        let payload = b"data\r\n--XY junk\r\r\nmore";
        let mut body = Vec::new();
        body.extend_from_slice(b"--XYZA\r\nContent-Disposition: form-data; name=\"f\"\r\n\r\n");
        body.extend_from_slice(payload);
        body.extend_from_slice(b"\r\n--XYZA--\r\n");

        let (parts, _) = decode(&body, "XYZA", 1460);
        assert_eq!(
            parts[0],
            Part::Field {
                name: "f".to_string(),
                value: String::from_utf8(payload.to_vec()).unwrap()
            }
        );
    }

    #[test]
    fn test_small_upload_buffer_flushes() {
        let mut body = Vec::new();
        body.extend_from_slice(
            b"--B\r\nContent-Disposition: form-data; name=\"d\"; filename=\"d.bin\"\r\n\r\n",
        );
        body.extend_from_slice(&[7u8; 10]);
        body.extend_from_slice(b"\r\n--B--\r\n");

        let (parts, sink) = decode(&body, "B", 4);
        assert_eq!(
            parts[0],
            Part::File {
                name: "d".to_string(),
                filename: "d.bin".to_string(),
                size: 10
            }
        );
        assert_eq!(file_payload(&sink), [7u8; 10]);
        assert!(sink.chunks.len() > 2);
    }

    #[test]
    fn test_bad_opening_boundary() {
        let mut decoder = MultipartDecoder::new("B", 16);
        let mut sink = TestSink::default();
        assert_eq!(
            decoder.feed_byte(b'x', 0, 10, &mut sink),
            Err(MultipartError::BadOpeningBoundary)
        );
    }
}
