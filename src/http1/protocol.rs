/*
 * Copyright (C) 2024 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! HTTP/1.1 wire helpers shared by the request reader and reply writers.

use std::convert::TryFrom;
use std::io::{self, Write};
use std::str;

// some reasonable limit
pub const HEADERS_SIZE_MAX: usize = 65536;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid request line")]
    InvalidRequestLine,

    #[error("request header too large")]
    HeaderTooLarge,

    #[error("invalid content length")]
    InvalidContentLength,

    #[error("unsupported transfer encoding")]
    UnsupportedTransferEncoding,

    #[error("invalid chunk size")]
    InvalidChunkSize,

    #[error("chunk too large")]
    ChunkTooLarge,

    #[error("invalid chunk suffix")]
    InvalidChunkSuffix,
}

/// Finds line terminators across reads. States: 0 nothing, 1 CR, 2 CRLF,
/// 3 CRLF CR, 4 CRLF CRLF.
#[derive(Debug, Clone, Copy)]
pub struct NewlineScanner {
    state: u8,
    end_state: u8,
}

impl NewlineScanner {
    /// Stops after a single CRLF.
    pub fn line() -> Self {
        Self {
            state: 0,
            end_state: 2,
        }
    }

    /// Stops after CRLF CRLF.
    pub fn block() -> Self {
        Self {
            state: 0,
            end_state: 4,
        }
    }

    /// Stops at a blank line, given that a CRLF was just consumed.
    pub fn block_after_line() -> Self {
        Self {
            state: 2,
            end_state: 4,
        }
    }

    /// Returns the offset just past the terminator, if `data` completes it.
    pub fn scan(&mut self, data: &[u8]) -> Option<usize> {
        for (i, &c) in data.iter().enumerate() {
            self.state = match (self.state, c) {
                (2, b'\r') => 3,
                (_, b'\r') => 1,
                (1, b'\n') | (3, b'\n') => self.state + 1,
                _ => 0,
            };

            if self.state == self.end_state {
                return Some(i + 1);
            }
        }

        None
    }
}

/// Returns the method and resource from the first line of a request. The
/// protocol version, if present, is ignored.
pub fn parse_request_line(line: &str) -> Result<(&str, &str), Error> {
    let mut tokens = line.split_ascii_whitespace();

    match (tokens.next(), tokens.next()) {
        (Some(verb), Some(resource)) => Ok((verb, resource)),
        _ => Err(Error::InvalidRequestLine),
    }
}

/// Joins obsolete continuation lines onto the line before them, replacing
/// the line break with a single space. Stops at the first blank line.
pub fn fold_lines(block: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();

    for line in block.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            break;
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(prev) = out.last_mut() {
                prev.push(' ');
                prev.push_str(line.trim());
            }

            continue;
        }

        out.push(line.to_string());
    }

    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default)]
pub struct HeaderList {
    headers: Vec<Header>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a block of header lines, folding continuations first. Lines
    /// without a colon are skipped.
    pub fn parse(block: &str) -> Self {
        let mut out = Self::new();

        for line in fold_lines(block) {
            if let Some(pos) = line.find(':') {
                let name = line[..pos].trim();

                if name.is_empty() {
                    continue;
                }

                out.push(name, line[(pos + 1)..].trim());
            }
        }

        out
    }

    pub fn push(&mut self, name: &str, value: &str) {
        self.headers.push(Header {
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    pub fn append(&mut self, other: HeaderList) {
        self.headers.extend(other.headers);
    }

    /// Returns the value of the first header with the given name, ignoring
    /// case.
    pub fn find(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn find_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Header> {
        self.headers.iter()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

pub fn parse_content_length(value: &str) -> Result<u64, Error> {
    let value = value.trim();

    if value.is_empty() || !value.bytes().all(|c| c.is_ascii_digit()) {
        return Err(Error::InvalidContentLength);
    }

    value.parse().map_err(|_| Error::InvalidContentLength)
}

/// Parses a chunk-size line, including its CRLF. Chunk extensions are
/// accepted and ignored.
pub fn parse_chunk_size_line(line: &[u8]) -> Result<usize, Error> {
    match httparse::parse_chunk_size(line) {
        Ok(httparse::Status::Complete((_, size))) => match u32::try_from(size) {
            Ok(size) => Ok(size as usize),
            Err(_) => Err(Error::ChunkTooLarge),
        },
        Ok(httparse::Status::Partial) | Err(_) => Err(Error::InvalidChunkSize),
    }
}

const STATUS_LINES: &[(u16, &str)] = &[
    (100, "100 Continue"),
    (101, "101 Switching Protocols"),
    (102, "102 Processing"),
    (200, "200 OK"),
    (201, "201 Created"),
    (202, "202 Accepted"),
    (203, "203 Non-Authoritative Information"),
    (204, "204 No Content"),
    (205, "205 Reset Content"),
    (206, "206 Partial Content"),
    (207, "207 Multi-Status"),
    (300, "300 Multiple Choices"),
    (301, "301 Moved Permanently"),
    (302, "302 Found"),
    (303, "303 See Other"),
    (304, "304 Not Modified"),
    (305, "305 Use Proxy"),
    (306, "306 Switch Proxy"),
    (307, "307 Temporary Redirect"),
    (400, "400 Bad Request"),
    (401, "401 Unauthorized"),
    (402, "402 Payment Required"),
    (403, "403 Forbidden"),
    (404, "404 Not Found"),
    (405, "405 Method Not Allowed"),
    (406, "406 Not Acceptable"),
    (407, "407 Proxy Authentication Required"),
    (408, "408 Request Timeout"),
    (409, "409 Conflict"),
    (410, "410 Gone"),
    (411, "411 Length Required"),
    (412, "412 Precondition Failed"),
    (413, "413 Request Entity Too Large"),
    (414, "414 Request-URI Too Long"),
    (415, "415 Unsupported Media Type"),
    (416, "416 Requested Range Not Satisfiable"),
    (417, "417 Expectation Failed"),
    (418, "418 I'm a teapot"),
    (421, "421 There are too many connections from your internet address"),
    (422, "422 Unprocessable Entity"),
    (423, "423 Locked"),
    (424, "424 Failed Dependency"),
    (425, "425 Unordered Collection"),
    (426, "426 Upgrade Required"),
    (449, "449 Retry With"),
    (450, "450 Blocked by Windows Parental Controls"),
    (500, "500 Internal Server Error"),
    (501, "501 Not Implemented"),
    (502, "502 Bad Gateway"),
    (503, "503 Service Unavailable"),
    (504, "504 Gateway Timeout"),
    (505, "505 HTTP Version Not Supported"),
    (506, "506 Variant Also Negotiates"),
    (507, "507 Insufficient Storage"),
    (509, "509 Bandwidth Limit Exceeded"),
    (510, "510 Not Extended"),
    (530, "530 User access denied"),
];

/// Returns the full status text for a code, e.g. "404 Not Found".
pub fn status_line(code: u16) -> Option<&'static str> {
    STATUS_LINES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, line)| *line)
}

/// Generates a minimal HTML page describing a status code.
pub fn status_page(code: u16) -> Option<String> {
    let line = status_line(code)?;
    let reason = match line.find(' ') {
        Some(pos) => &line[(pos + 1)..],
        None => line,
    };

    Some(format!(
        "<html><title>{}</title><body><h1>{}</h1></body></html>",
        line, reason
    ))
}

/// Formats a Content-Type value, adding a utf-8 charset to text types that
/// don't name one.
pub fn content_type_value(content_type: &str) -> String {
    let is_text = content_type.len() > 5
        && content_type.as_bytes()[..5].eq_ignore_ascii_case(b"text/");

    if is_text && !content_type.to_ascii_lowercase().contains("charset=") {
        format!("{}; charset=utf-8", content_type)
    } else {
        content_type.to_string()
    }
}

fn starts_with_ignore_case(s: &[u8], prefix: &[u8]) -> bool {
    s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn skip_leading_space_and_comments(mut s: &[u8]) -> &[u8] {
    loop {
        if s.starts_with(b"<!--") {
            s = match s.windows(3).position(|w| w == b"-->") {
                Some(pos) => &s[(pos + 3)..],
                None => &[],
            };

            continue;
        }

        match s.first() {
            Some(c) if c.is_ascii_whitespace() => s = &s[1..],
            _ => return s,
        }
    }
}

fn is_html_doctype(s: &[u8]) -> bool {
    if !starts_with_ignore_case(s, b"<!doctype") {
        return false;
    }

    let rest = &s[9..];
    let trimmed = skip_leading_space_and_comments(rest);

    // at least one space is required on both sides of "html"
    if trimmed.len() == rest.len() || !starts_with_ignore_case(trimmed, b"html") {
        return false;
    }

    matches!(trimmed.get(4), Some(c) if c.is_ascii_whitespace())
}

/// Guesses a media type for a reply body with no explicit type.
pub fn sniff_content_type(body: &[u8], is_text: bool) -> &'static str {
    if is_text {
        let s = skip_leading_space_and_comments(body);

        if (s.len() > 5 && starts_with_ignore_case(s, b"<html")) || is_html_doctype(s) {
            "text/html"
        } else if s.len() > 5 && starts_with_ignore_case(s, b"<?xml") {
            "text/xml"
        } else {
            "text/plain"
        }
    } else {
        let len = body.len();

        if len > 10 && body[0] == 0xff && body[1] == 0xd8 && &body[6..10] == b"JFIF" {
            "image/jpeg"
        } else if len > 6 && (body.starts_with(b"GIF87a") || body.starts_with(b"GIF89a")) {
            "image/gif"
        } else if len > 6 && body.starts_with(b"\x89PNG\r\n") {
            "image/png"
        } else if len > 3 && body.starts_with(b"ID3") {
            "audio/mpeg"
        } else if len > 14 && body.starts_with(b"OggS\x00\x02\x00\x00\x00\x00\x00\x00\x00\x00") {
            "application/ogg"
        } else if len > 4 && body.starts_with(b"MThd") {
            "audio/midi"
        } else if len > 8 && (body.starts_with(b"FWS") || body.starts_with(b"CWS")) {
            "application/x-shockwave-flash"
        } else {
            "application/octet-stream"
        }
    }
}

/// Writes a complete response: status line, extra header lines, and, if a
/// body is given, the standard entity headers and the body itself.
pub fn write_simple_response<W: Write>(
    writer: &mut W,
    status: &str,
    content_type: &str,
    body: Option<&[u8]>,
    extra_headers: &[&str],
) -> Result<(), io::Error> {
    write!(writer, "HTTP/1.1 {}\r\n", status)?;

    for h in extra_headers {
        writer.write_all(h.as_bytes())?;
        writer.write_all(b"\r\n")?;
    }

    match body {
        Some(body) => {
            write!(
                writer,
                "Content-Type: {}\r\n\
                 Content-Length: {}\r\n\
                 Cache-control: no-cache\r\n\
                 Connection: Keep-Alive\r\n\
                 \r\n",
                content_type,
                body.len()
            )?;

            writer.write_all(body)?;
        }
        None => writer.write_all(b"\r\n")?,
    }

    Ok(())
}
