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

//! The HTTP side of a connection thread.
//!
//! [`HttpConnection::process_request`] reads one request (head, then body
//! framed by `Content-Length` or chunked transfer-coding), hands it to the
//! consumer through the message queue and blocks until the consumer has
//! completed it. Bytes read past the end of a request are kept for the next
//! one.

use crate::http1::protocol::{self, HeaderList, NewlineScanner, HEADERS_SIZE_MAX};
use crate::listener::ConnectionFactory;
use crate::queue::{Message, MessageQueue, Payload};
use crate::request::HttpRequest;
use crate::server::{self, ConnectionHandler, ServerThread};
use log::debug;
use std::cmp;
use std::convert::TryFrom;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

const READ_SIZE: usize = 8192;

const BODY_TIMEOUT: Duration = Duration::from_secs(5);
const CHUNK_TIMEOUT: Duration = Duration::from_secs(30);

// hex size plus any chunk extensions
const CHUNK_LINE_MAX: usize = 1024;

const INTERNAL_ERROR_PAGE: &str =
    "<html><title>500 Internal Server Error</title><body><h1>Internal Server Error</h1></body></html>";

const SHUTTING_DOWN_STATUS: &str = "503 Service Unavailable (Shutting Down)";
const SHUTTING_DOWN_PAGE: &str = "<html><title>503 Service Unavailable</title><body><h1>Service Unavailable</h1>The server is shutting down and cannot process any more requests.</body></html>";

const BAD_TRANSFER_ENCODING: &str =
    "This server does not accept the specified transfer-encoding.";
const BAD_REQUEST_LINE: &str = "Invalid request line.";
const BAD_HEADER: &str = "Request header too large.";
const BAD_CONTENT_LENGTH: &str = "Invalid content length.";
const BODY_RECV_ERROR: &str = "Error receiving request message body";
const CHUNK_RECV_ERROR: &str = "Error receiving request message chunk";
const CHUNK_FORMAT_ERROR: &str = "Error in request message chunk";

// why a request could not be read
#[derive(Debug)]
enum Failure {
    // nothing useful to say to the peer
    Closed,
    ShuttingDown,
    BadRequest(&'static str),
}

fn bad_request_page(detail: &str) -> String {
    format!(
        "<html><title>Bad Request</title><h1>Bad Request</h1>{}",
        detail
    )
}

struct ParsedRequest {
    verb: String,
    resource: String,
    headers: HeaderList,
    body: Option<Vec<u8>>,
    overflow: bool,
}

// buffered reads over the bytes following the request head
struct BodyReader<'a> {
    conn: &'a ServerThread,
    buf: Vec<u8>,
    pos: usize,
    timeout: Duration,
}

impl<'a> BodyReader<'a> {
    fn new(conn: &'a ServerThread, initial: Vec<u8>, timeout: Duration) -> Self {
        Self {
            conn,
            buf: initial,
            pos: 0,
            timeout,
        }
    }

    fn available(&self) -> usize {
        self.buf.len() - self.pos
    }

    // ensure at least `need` unread bytes are buffered
    fn fill(&mut self, need: usize) -> Result<(), server::Error> {
        if self.available() >= need {
            return Ok(());
        }

        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }

        let start = self.buf.len();
        let want = need - start;

        self.buf.resize(start + cmp::max(want, READ_SIZE), 0);

        match self.conn.read(&mut self.buf[start..], want, Some(self.timeout)) {
            Ok(size) => {
                self.buf.truncate(start + size);

                Ok(())
            }
            Err(e) => {
                self.buf.truncate(start);

                Err(e)
            }
        }
    }

    fn take(&mut self, len: usize) -> Result<&[u8], server::Error> {
        self.fill(len)?;

        let start = self.pos;
        self.pos += len;

        Ok(&self.buf[start..self.pos])
    }

    // appends `len` bytes to `out`, buffering no more than READ_SIZE at a
    // time so a declared length is never allocated up front
    fn copy_to(&mut self, mut len: usize, out: &mut Vec<u8>) -> Result<(), server::Error> {
        while len > 0 {
            let size = cmp::min(len, READ_SIZE);

            out.extend_from_slice(self.take(size)?);
            len -= size;
        }

        Ok(())
    }

    fn skip(&mut self, len: usize) -> Result<(), server::Error> {
        let buffered = cmp::min(len, self.available());
        self.pos += buffered;

        if len > buffered {
            self.conn.read_discard(len - buffered, Some(self.timeout))?;
        }

        Ok(())
    }

    // reads through the terminator the scanner looks for, returning the
    // bytes including it. Fails with None if `max` bytes pass without one
    fn read_until(
        &mut self,
        mut scanner: NewlineScanner,
        max: usize,
    ) -> Result<Option<Vec<u8>>, server::Error> {
        let mut scanned = 0;

        loop {
            if let Some(end) = scanner.scan(&self.buf[(self.pos + scanned)..]) {
                let end = scanned + end;
                let out = self.buf[self.pos..(self.pos + end)].to_vec();
                self.pos += end;

                return Ok(Some(out));
            }

            scanned = self.available();

            if scanned >= max {
                return Ok(None);
            }

            self.fill(scanned + 1)?;
        }
    }

    fn into_leftover(mut self) -> Vec<u8> {
        self.buf.drain(..self.pos);

        self.buf
    }
}

pub struct HttpConnection {
    queue: Arc<MessageQueue>,

    // 0 means unlimited
    upload_limit: usize,

    // bytes received beyond the previous request
    pending: Vec<u8>,
}

impl HttpConnection {
    pub fn new(queue: Arc<MessageQueue>, upload_limit: usize) -> Self {
        Self {
            queue,
            upload_limit,
            pending: Vec::new(),
        }
    }

    fn exceeds_limit(&self, len: u64) -> bool {
        self.upload_limit > 0 && len > self.upload_limit as u64
    }

    // returns the head block, CRLFCRLF included, and whatever followed it
    fn read_head(&mut self, conn: &ServerThread) -> Result<(Vec<u8>, Vec<u8>), Failure> {
        let mut buf = mem::take(&mut self.pending);
        let mut scanner = NewlineScanner::block();
        let mut scanned = 0;

        loop {
            if let Some(end) = scanner.scan(&buf[scanned..]) {
                let rest = buf.split_off(scanned + end);

                return Ok((buf, rest));
            }

            scanned = buf.len();

            if scanned >= HEADERS_SIZE_MAX {
                return Err(Failure::BadRequest(BAD_HEADER));
            }

            buf.resize(scanned + READ_SIZE, 0);

            match conn.read(&mut buf[scanned..], 1, None) {
                Ok(size) => buf.truncate(scanned + size),
                Err(e) => {
                    buf.truncate(scanned);

                    debug!("conn {}: header read failed: {}", conn.id(), e);

                    return Err(match e {
                        server::Error::Cancelled if !buf.is_empty() => Failure::ShuttingDown,
                        _ => Failure::Closed,
                    });
                }
            }
        }
    }

    fn read_request(&mut self, conn: &ServerThread) -> Result<ParsedRequest, Failure> {
        let (head, rest) = self.read_head(conn)?;

        let head = String::from_utf8_lossy(&head);

        let (line, header_block) = match head.find("\r\n") {
            Some(pos) => (&head[..pos], &head[(pos + 2)..]),
            None => (&head[..], ""),
        };

        let (verb, resource) = protocol::parse_request_line(line)
            .map_err(|_| Failure::BadRequest(BAD_REQUEST_LINE))?;

        let mut req = ParsedRequest {
            verb: verb.to_string(),
            resource: resource.to_string(),
            headers: HeaderList::parse(header_block),
            body: None,
            overflow: false,
        };

        let leftover = if let Some(value) = req.headers.find("content-length") {
            let len = protocol::parse_content_length(value)
                .map_err(|_| Failure::BadRequest(BAD_CONTENT_LENGTH))?;

            self.read_sized_body(conn, &mut req, len, rest)?
        } else if let Some(value) = req.headers.find("transfer-encoding") {
            if !value.trim().eq_ignore_ascii_case("chunked") {
                return Err(Failure::BadRequest(BAD_TRANSFER_ENCODING));
            }

            self.read_chunked_body(conn, &mut req, rest)?
        } else {
            rest
        };

        self.pending = leftover;

        Ok(req)
    }

    fn read_sized_body(
        &self,
        conn: &ServerThread,
        req: &mut ParsedRequest,
        len: u64,
        mut rest: Vec<u8>,
    ) -> Result<Vec<u8>, Failure> {
        let len = match usize::try_from(len) {
            Ok(len) if !self.exceeds_limit(len as u64) => len,
            _ => {
                req.overflow = true;

                let buffered = cmp::min(len, rest.len() as u64) as usize;
                let leftover = rest.split_off(buffered);

                conn.read_discard((len - buffered as u64) as usize, Some(BODY_TIMEOUT))
                    .map_err(|e| {
                        debug!("conn {}: body discard failed: {}", conn.id(), e);

                        Failure::BadRequest(BODY_RECV_ERROR)
                    })?;

                return Ok(leftover);
            }
        };

        let mut body = rest;
        let leftover = if body.len() > len {
            body.split_off(len)
        } else {
            Vec::new()
        };

        // grow as bytes arrive rather than trusting the declared length
        let mut buf = [0; READ_SIZE];

        while body.len() < len {
            let want = cmp::min(len - body.len(), buf.len());

            let size = conn
                .read(&mut buf[..want], want, Some(BODY_TIMEOUT))
                .map_err(|e| {
                    debug!("conn {}: body read failed: {}", conn.id(), e);

                    Failure::BadRequest(BODY_RECV_ERROR)
                })?;

            body.extend_from_slice(&buf[..size]);
        }

        req.body = Some(body);

        Ok(leftover)
    }

    fn read_chunked_body(
        &self,
        conn: &ServerThread,
        req: &mut ParsedRequest,
        rest: Vec<u8>,
    ) -> Result<Vec<u8>, Failure> {
        let recv_error = |e: server::Error| {
            debug!("conn {}: chunk read failed: {}", conn.id(), e);

            Failure::BadRequest(CHUNK_RECV_ERROR)
        };

        let format_error = |e: protocol::Error| {
            debug!("conn {}: bad chunk: {}", conn.id(), e);

            Failure::BadRequest(CHUNK_FORMAT_ERROR)
        };

        let mut reader = BodyReader::new(conn, rest, CHUNK_TIMEOUT);
        let mut body = Vec::new();
        let mut total: u64 = 0;

        loop {
            let line = reader
                .read_until(NewlineScanner::line(), CHUNK_LINE_MAX)
                .map_err(recv_error)?
                .ok_or_else(|| format_error(protocol::Error::InvalidChunkSize))?;

            let size = protocol::parse_chunk_size_line(&line).map_err(format_error)?;

            if size == 0 {
                break;
            }

            total += size as u64;

            if !req.overflow && self.exceeds_limit(total) {
                req.overflow = true;
                body = Vec::new();
            }

            if req.overflow {
                reader.skip(size).map_err(recv_error)?;
            } else {
                reader.copy_to(size, &mut body).map_err(recv_error)?;
            }

            // verified in discard mode too
            if reader.take(2).map_err(recv_error)? != b"\r\n" {
                return Err(format_error(protocol::Error::InvalidChunkSuffix));
            }
        }

        let trailers = reader
            .read_until(NewlineScanner::block_after_line(), HEADERS_SIZE_MAX)
            .map_err(recv_error)?
            .ok_or(Failure::BadRequest(BAD_HEADER))?;

        req.headers
            .append(HeaderList::parse(&String::from_utf8_lossy(&trailers)));

        if !req.overflow {
            req.body = Some(body);
        }

        Ok(reader.into_leftover())
    }

    fn respond_failure(&self, conn: &ServerThread, failure: &Failure) {
        let mut out = Vec::new();

        let result = match failure {
            Failure::Closed => return,
            Failure::ShuttingDown => protocol::write_simple_response(
                &mut out,
                SHUTTING_DOWN_STATUS,
                "text/html",
                Some(SHUTTING_DOWN_PAGE.as_bytes()),
                &[],
            ),
            Failure::BadRequest(detail) => protocol::write_simple_response(
                &mut out,
                "400 Bad Request",
                "text/html",
                Some(bad_request_page(detail).as_bytes()),
                &[],
            ),
        };

        if result.is_ok() {
            send_quietly(conn, &out);
        }
    }

    fn respond_internal_error(&self, conn: &ServerThread) {
        if self.queue.is_quitting() || conn.is_cancelled() {
            self.respond_failure(conn, &Failure::ShuttingDown);

            return;
        }

        let mut out = Vec::new();

        if protocol::write_simple_response(
            &mut out,
            "500 Internal Server Error",
            "text/html",
            Some(INTERNAL_ERROR_PAGE.as_bytes()),
            &[],
        )
        .is_ok()
        {
            send_quietly(conn, &out);
        }
    }
}

fn send_quietly(conn: &ServerThread, data: &[u8]) {
    if let Err(e) = conn.send(data) {
        debug!("conn {}: error response not sent: {}", conn.id(), e);
    }
}

impl ConnectionHandler for HttpConnection {
    fn process_request(&mut self, conn: &Arc<ServerThread>) -> bool {
        conn.set_run_state("Waiting for request");

        let req = match self.read_request(conn) {
            Ok(req) => req,
            Err(failure) => {
                if let Failure::BadRequest(detail) = &failure {
                    debug!("conn {}: bad request: {}", conn.id(), detail);
                }

                self.respond_failure(conn, &failure);

                return false;
            }
        };

        debug!(
            "conn {}: {} {} body={:?} overflow={}",
            conn.id(),
            req.verb,
            req.resource,
            req.body.as_ref().map(|b| b.len()),
            req.overflow
        );

        conn.set_run_state("Processing request");

        let msg = Message::with_abort(
            Payload::Request(HttpRequest::new(
                Arc::clone(conn),
                &req.verb,
                &req.resource,
                req.headers,
                req.body,
                req.overflow,
            )),
            conn.shutdown_event().clone(),
        );

        if !self.queue.send(&msg, None) {
            // if the consumer already took the message, it owns the reply
            if self.queue.abandon(&msg) {
                self.respond_internal_error(conn);
            }

            return false;
        }

        conn.is_open()
    }
}

/// Creates an [`HttpConnection`] for every accepted socket.
pub struct HttpFactory {
    queue: Arc<MessageQueue>,
    upload_limit: usize,
}

impl HttpFactory {
    pub fn new(queue: Arc<MessageQueue>, upload_limit: usize) -> Self {
        Self {
            queue,
            upload_limit,
        }
    }
}

impl ConnectionFactory for HttpFactory {
    fn create_handler(&self, _conn: &Arc<ServerThread>) -> Box<dyn ConnectionHandler> {
        Box::new(HttpConnection::new(
            Arc::clone(&self.queue),
            self.upload_limit,
        ))
    }
}
