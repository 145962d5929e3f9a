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

//! Requests handed to the consumer, and the ways to answer them.
//!
//! A reply is written straight to the connection's socket from whichever
//! thread calls it. Completing the request (which every reply method does
//! when it finishes) releases the connection thread so it can read the next
//! request.

use crate::cookie::{self, CookieList};
use crate::core::event::Event;
use crate::http1::protocol::{self, HeaderList};
use crate::queue::{Message, MessageQueue, Payload, ReplyDone};
use crate::server::{self, ServerThread};
use arrayvec::ArrayVec;
use log::debug;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("request already completed")]
    AlreadyCompleted,

    #[error("send failed: {0}")]
    Send(#[from] server::Error),

    #[error("unknown status code {0}")]
    UnknownStatus(u16),

    #[error("a reply is already being sent")]
    ReplyInProgress,

    #[error("chunked reply already started")]
    ChunkedReplyActive,

    #[error("no chunked reply in progress")]
    NoChunkedReply,

    #[error("message is not a request")]
    NotARequest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    None,
    Text(String),
    Bytes(Vec<u8>),

    /// A generated page describing the status code.
    Status(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Code(u16),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct Reply {
    pub body: ReplyBody,
    pub content_type: Option<String>,
    pub status: Option<Status>,
    pub headers: Vec<String>,
}

impl Reply {
    pub fn new(body: ReplyBody) -> Self {
        Self {
            body,
            content_type: None,
            status: None,
            headers: Vec::new(),
        }
    }

    pub fn text(s: &str) -> Self {
        Self::new(ReplyBody::Text(s.to_string()))
    }

    pub fn status_page(code: u16) -> Self {
        Self::new(ReplyBody::Status(code))
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());

        self
    }

    pub fn status(mut self, status: Status) -> Self {
        self.status = Some(status);

        self
    }

    /// Adds a raw header line, e.g. `Location: /next`.
    pub fn header(mut self, line: &str) -> Self {
        self.headers.push(line.to_string());

        self
    }
}

/// One field of a submitted form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormField {
    pub name: String,
    pub value: Vec<u8>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

fn resolve_status(status: Option<&Status>, body: &ReplyBody) -> Result<String, Error> {
    let code = match status {
        Some(Status::Text(s)) => return Ok(s.clone()),
        Some(Status::Code(code)) => *code,
        None => match body {
            ReplyBody::Status(code) => *code,
            _ => 200,
        },
    };

    match protocol::status_line(code) {
        Some(line) => Ok(line.to_string()),
        None => Err(Error::UnknownStatus(code)),
    }
}

// returns the body bytes and the content type to send with them
fn resolve_body(
    body: &ReplyBody,
    content_type: Option<&str>,
) -> Result<(Vec<u8>, Option<String>), Error> {
    let (data, is_text) = match body {
        ReplyBody::None => return Ok((Vec::new(), content_type.map(protocol::content_type_value))),
        ReplyBody::Text(s) => (s.as_bytes().to_vec(), true),
        ReplyBody::Bytes(b) => (b.clone(), false),
        ReplyBody::Status(code) => match protocol::status_page(*code) {
            Some(page) => (page.into_bytes(), true),
            None => return Err(Error::UnknownStatus(*code)),
        },
    };

    let content_type = match content_type {
        Some(s) => s,
        None => protocol::sniff_content_type(&data, is_text),
    };

    Ok((data, Some(protocol::content_type_value(content_type))))
}

#[derive(Default)]
struct ReplyState {
    completed: bool,

    // a reply has claimed the connection. set and checked under the lock
    replying: bool,
    chunked: bool,
    cookies: CookieList,
}

pub struct HttpRequest {
    conn: Arc<ServerThread>,
    verb: String,
    resource: String,
    headers: HeaderList,
    body: Option<Vec<u8>>,
    overflow: bool,
    reply: Mutex<ReplyState>,
    done: Event,
}

impl HttpRequest {
    pub fn new(
        conn: Arc<ServerThread>,
        verb: &str,
        resource: &str,
        headers: HeaderList,
        body: Option<Vec<u8>>,
        overflow: bool,
    ) -> Self {
        Self {
            conn,
            verb: verb.to_string(),
            resource: resource.to_string(),
            headers,
            body,
            overflow,
            reply: Mutex::new(ReplyState::default()),
            done: Event::sticky(),
        }
    }

    pub fn verb(&self) -> &str {
        &self.verb
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn path(&self) -> &str {
        match self.resource.find('?') {
            Some(pos) => &self.resource[..pos],
            None => &self.resource,
        }
    }

    pub fn query(&self) -> Vec<(String, String)> {
        match self.resource.find('?') {
            Some(pos) => url::form_urlencoded::parse(self.resource[(pos + 1)..].as_bytes())
                .into_owned()
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        self.query()
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.find(name)
    }

    /// The request body, if one was sent and it fit within the upload limit.
    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    /// Whether the body was discarded for exceeding the upload limit.
    pub fn overflow(&self) -> bool {
        self.overflow
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.conn.peer_addr()
    }

    pub fn connection(&self) -> &Arc<ServerThread> {
        &self.conn
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        cookie::find_request_cookie(&self.headers, name)
    }

    pub fn cookies(&self) -> Vec<(String, String)> {
        cookie::parse_request_cookies(&self.headers)
    }

    /// Decodes the body as a form submission. Supports
    /// `application/x-www-form-urlencoded` and `multipart/form-data`.
    pub fn form_fields(&self) -> Vec<FormField> {
        let body = match &self.body {
            Some(body) => body,
            None => return Vec::new(),
        };

        let content_type = self.header("content-type").unwrap_or("");

        if starts_with_ignore_case(content_type, "multipart/form-data") {
            match cookie::parse_attr(content_type, "boundary") {
                Some(boundary) => parse_multipart(body, boundary),
                None => Vec::new(),
            }
        } else {
            url::form_urlencoded::parse(body)
                .map(|(name, value)| FormField {
                    name: name.into_owned(),
                    value: value.into_owned().into_bytes(),
                    filename: None,
                    content_type: None,
                })
                .collect()
        }
    }

    /// Adds a cookie to the reply. `value` may carry attributes such as
    /// `path` and `domain`.
    pub fn set_cookie(&self, name: &str, value: &str) {
        self.reply.lock().unwrap().cookies.set(name, value);
    }

    pub fn is_completed(&self) -> bool {
        self.reply.lock().unwrap().completed
    }

    pub fn completion_event(&self) -> &Event {
        &self.done
    }

    /// Marks the request as handled. If the client asked for the connection
    /// to be closed, the socket is closed first.
    pub fn complete(&self) {
        {
            let state = &mut *self.reply.lock().unwrap();

            if state.completed {
                return;
            }

            state.completed = true;
        }

        if self.wants_close() {
            self.conn.close_socket();
        }

        self.done.signal();
    }

    fn wants_close(&self) -> bool {
        self.headers
            .find_all("connection")
            .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")))
    }

    // header lines common to both reply forms, minus the terminating blank line
    fn write_head(
        &self,
        out: &mut Vec<u8>,
        status: &str,
        headers: &[String],
        content_type: Option<&str>,
        cookies: &CookieList,
    ) {
        out.extend_from_slice(b"HTTP/1.1 ");
        out.extend_from_slice(status.as_bytes());
        out.extend_from_slice(b"\r\n");

        for h in headers {
            out.extend_from_slice(h.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        if let Some(ct) = content_type {
            out.extend_from_slice(b"Content-Type: ");
            out.extend_from_slice(ct.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        for line in cookies.header_lines() {
            out.extend_from_slice(line.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }

    /// Sends a complete reply and completes the request.
    pub fn send_reply(&self, reply: &Reply) -> Result<(), Error> {
        let status = resolve_status(reply.status.as_ref(), &reply.body)?;
        let (body, content_type) = resolve_body(&reply.body, reply.content_type.as_deref())?;

        let mut out = Vec::new();

        {
            let state = &mut *self.reply.lock().unwrap();

            if state.completed {
                return Err(Error::AlreadyCompleted);
            }

            if state.chunked {
                return Err(Error::ChunkedReplyActive);
            }

            if state.replying {
                return Err(Error::ReplyInProgress);
            }

            state.replying = true;

            self.write_head(
                &mut out,
                &status,
                &reply.headers,
                content_type.as_deref(),
                &state.cookies,
            );
        }

        // writing to a Vec can't fail
        let _ = write!(out, "Content-Length: {}\r\n\r\n", body.len());
        out.extend_from_slice(&body);

        self.conn.set_run_state("Sending reply");

        let result = self.conn.send(&out);

        if let Err(e) = &result {
            debug!("conn {}: reply failed: {}", self.conn.id(), e);
        }

        self.complete();

        result.map_err(Error::Send)
    }

    pub fn send_simple_reply(
        &self,
        body: ReplyBody,
        content_type: Option<&str>,
        status: Option<Status>,
    ) -> Result<(), Error> {
        let mut reply = Reply::new(body);
        reply.content_type = content_type.map(|s| s.to_string());
        reply.status = status;

        self.send_reply(&reply)
    }

    /// Sends the reply head for a chunked reply. The request stays open
    /// until [`end_chunked_reply`](Self::end_chunked_reply).
    pub fn start_chunked_reply(
        &self,
        content_type: Option<&str>,
        status: Option<Status>,
        headers: &[String],
    ) -> Result<(), Error> {
        let status = resolve_status(status.as_ref(), &ReplyBody::None)?;
        let content_type = protocol::content_type_value(content_type.unwrap_or("text/html"));

        let mut out = Vec::new();

        {
            let state = &mut *self.reply.lock().unwrap();

            if state.completed {
                return Err(Error::AlreadyCompleted);
            }

            if state.chunked {
                return Err(Error::ChunkedReplyActive);
            }

            if state.replying {
                return Err(Error::ReplyInProgress);
            }

            state.replying = true;

            self.write_head(
                &mut out,
                &status,
                headers,
                Some(&content_type),
                &state.cookies,
            );

            state.chunked = true;
        }

        out.extend_from_slice(b"Transfer-Encoding: chunked\r\n\r\n");

        self.conn.set_run_state("Sending reply");

        Ok(self.conn.send(&out)?)
    }

    pub fn send_chunk(&self, data: &[u8]) -> Result<(), Error> {
        self.check_chunked()?;

        // a zero-length chunk would end the body
        if data.is_empty() {
            return Ok(());
        }

        let mut head = ArrayVec::<u8, 18>::new();

        // at most 16 hex digits plus CRLF
        let _ = write!(head, "{:x}\r\n", data.len());

        // one send per chunk so concurrent senders can't split it
        let mut out = Vec::with_capacity(head.len() + data.len() + 2);
        out.extend_from_slice(&head);
        out.extend_from_slice(data);
        out.extend_from_slice(b"\r\n");

        Ok(self.conn.send(&out)?)
    }

    /// Ends a chunked reply, with optional trailer lines, and completes the
    /// request.
    pub fn end_chunked_reply(&self, trailers: &[String]) -> Result<(), Error> {
        {
            let state = &mut *self.reply.lock().unwrap();

            if state.completed {
                return Err(Error::AlreadyCompleted);
            }

            if !state.chunked {
                return Err(Error::NoChunkedReply);
            }

            // later chunks and a second end are refused from here on
            state.chunked = false;
        }

        let mut out = Vec::from(&b"0\r\n"[..]);

        for t in trailers {
            out.extend_from_slice(t.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        out.extend_from_slice(b"\r\n");

        let result = self.conn.send(&out);

        self.complete();

        result.map_err(Error::Send)
    }

    fn check_chunked(&self) -> Result<(), Error> {
        let state = &*self.reply.lock().unwrap();

        if state.completed {
            return Err(Error::AlreadyCompleted);
        }

        if !state.chunked {
            return Err(Error::NoChunkedReply);
        }

        Ok(())
    }
}

/// Sends a reply from a background thread. When it finishes, a
/// [`ReplyDone`] message carrying the outcome is posted to `queue`.
pub fn send_reply_async(
    msg: &Arc<Message>,
    queue: &Arc<MessageQueue>,
    reply: Reply,
) -> Result<(), Error> {
    if msg.request().is_none() {
        return Err(Error::NotARequest);
    }

    let msg = Arc::clone(msg);
    let queue = Arc::clone(queue);

    thread::Builder::new()
        .name("reply".to_string())
        .spawn(move || {
            let error = match msg.request() {
                Some(req) => req.send_reply(&reply).err().map(|e| e.to_string()),
                None => Some(Error::NotARequest.to_string()),
            };

            queue.post(Message::new(Payload::ReplyDone(ReplyDone {
                request: msg,
                error,
            })));
        })
        .map_err(|e| Error::Send(server::Error::Io(e)))?;

    Ok(())
}

fn starts_with_ignore_case(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len() && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_multipart(body: &[u8], boundary: &str) -> Vec<FormField> {
    let delim = format!("--{}", boundary).into_bytes();

    let mut out = Vec::new();

    let mut rest = match find_bytes(body, &delim) {
        Some(pos) => &body[(pos + delim.len())..],
        None => return out,
    };

    loop {
        // closing delimiter
        if rest.starts_with(b"--") {
            break;
        }

        rest = match rest.strip_prefix(b"\r\n") {
            Some(r) => r,
            None => break,
        };

        let head_end = match find_bytes(rest, b"\r\n\r\n") {
            Some(pos) => pos,
            None => break,
        };

        let head = String::from_utf8_lossy(&rest[..(head_end + 2)]).into_owned();
        rest = &rest[(head_end + 4)..];

        let mut next_delim = Vec::from(&b"\r\n"[..]);
        next_delim.extend_from_slice(&delim);

        let data_end = match find_bytes(rest, &next_delim) {
            Some(pos) => pos,
            None => break,
        };

        let value = rest[..data_end].to_vec();
        rest = &rest[(data_end + next_delim.len())..];

        let headers = HeaderList::parse(&head);

        let disposition = match headers.find("content-disposition") {
            Some(d) => d,
            None => continue,
        };

        let name = match cookie::parse_attr(disposition, "name") {
            Some(name) => name.to_string(),
            None => continue,
        };

        out.push(FormField {
            name,
            value,
            filename: cookie::parse_attr(disposition, "filename").map(|s| s.to_string()),
            content_type: headers.find("content-type").map(|s| s.to_string()),
        });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testutil::connected_pair;
    use std::io::Read;

    fn make_request(
        conn: &Arc<ServerThread>,
        resource: &str,
        headers: &str,
        body: Option<&[u8]>,
    ) -> HttpRequest {
        HttpRequest::new(
            Arc::clone(conn),
            "POST",
            resource,
            HeaderList::parse(headers),
            body.map(|b| b.to_vec()),
            false,
        )
    }

    fn read_all(conn: &Arc<ServerThread>, client: &mut std::net::TcpStream) -> String {
        conn.close_socket();

        let mut s = String::new();
        client.read_to_string(&mut s).unwrap();

        s
    }

    #[test]
    fn test_resolve_status() {
        assert_eq!(
            resolve_status(None, &ReplyBody::Text("hi".into())).unwrap(),
            "200 OK"
        );
        assert_eq!(
            resolve_status(None, &ReplyBody::Status(404)).unwrap(),
            "404 Not Found"
        );
        assert_eq!(
            resolve_status(Some(&Status::Code(201)), &ReplyBody::Status(404)).unwrap(),
            "201 Created"
        );
        assert_eq!(
            resolve_status(Some(&Status::Text("299 Custom".into())), &ReplyBody::None).unwrap(),
            "299 Custom"
        );
        assert!(matches!(
            resolve_status(Some(&Status::Code(299)), &ReplyBody::None),
            Err(Error::UnknownStatus(299))
        ));
    }

    #[test]
    fn test_accessors() {
        let quit = Event::sticky();
        let shutdown = quit.child();
        let (_client, conn) = connected_pair(&quit, &shutdown);

        let req = make_request(
            &conn,
            "/search?q=a+b&n=%31&q=c",
            "Host: x\r\nCookie: sid=abc; theme=dark\r\n",
            None,
        );

        assert_eq!(req.verb(), "POST");
        assert_eq!(req.path(), "/search");
        assert_eq!(req.query_param("q"), Some("a b".to_string()));
        assert_eq!(req.query_param("n"), Some("1".to_string()));
        assert_eq!(req.query().len(), 3);
        assert_eq!(req.header("HOST"), Some("x"));
        assert_eq!(req.cookie("theme"), Some("dark".to_string()));
        assert_eq!(req.cookies().len(), 2);
        assert_eq!(req.body(), None);
        assert_eq!(req.overflow(), false);
        assert_eq!(req.client_addr(), conn.peer_addr());
    }

    #[test]
    fn test_form_urlencoded() {
        let quit = Event::sticky();
        let shutdown = quit.child();
        let (_client, conn) = connected_pair(&quit, &shutdown);

        let req = make_request(
            &conn,
            "/",
            "Content-Type: application/x-www-form-urlencoded\r\n",
            Some(b"a=1&b=hello+world"),
        );

        let fields = req.form_fields();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[1].name, "b");
        assert_eq!(fields[1].value, b"hello world");
    }

    #[test]
    fn test_form_multipart() {
        let quit = Event::sticky();
        let shutdown = quit.child();
        let (_client, conn) = connected_pair(&quit, &shutdown);

        let body = b"--XyZ\r\n\
            Content-Disposition: form-data; name=\"title\"\r\n\
            \r\n\
            hello\r\n\
            --XyZ\r\n\
            Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\
            Content-Type: text/plain\r\n\
            \r\n\
            line1\r\nline2\r\n\
            --XyZ--\r\n";

        let req = make_request(
            &conn,
            "/",
            "Content-Type: multipart/form-data; boundary=XyZ\r\n",
            Some(body),
        );

        let fields = req.form_fields();
        assert_eq!(fields.len(), 2);

        assert_eq!(fields[0].name, "title");
        assert_eq!(fields[0].value, b"hello");
        assert_eq!(fields[0].filename, None);

        assert_eq!(fields[1].name, "upload");
        assert_eq!(fields[1].value, b"line1\r\nline2");
        assert_eq!(fields[1].filename, Some("a.txt".to_string()));
        assert_eq!(fields[1].content_type, Some("text/plain".to_string()));
    }

    #[test]
    fn test_send_reply() {
        let quit = Event::sticky();
        let shutdown = quit.child();
        let (mut client, conn) = connected_pair(&quit, &shutdown);

        let req = make_request(&conn, "/", "Host: x\r\n", None);

        req.set_cookie("sid", "1; path=/");
        req.set_cookie("sid", "2; path=/");

        let reply = Reply::text("<html>hi</html>").header("X-Test: yes");
        req.send_reply(&reply).unwrap();

        assert_eq!(req.is_completed(), true);
        assert_eq!(req.completion_event().is_signaled(), true);
        assert!(matches!(
            req.send_reply(&reply),
            Err(Error::AlreadyCompleted)
        ));

        assert_eq!(
            read_all(&conn, &mut client),
            "HTTP/1.1 200 OK\r\n\
             X-Test: yes\r\n\
             Content-Type: text/html; charset=utf-8\r\n\
             Set-Cookie: sid=2; path=/\r\n\
             Content-Length: 15\r\n\
             \r\n\
             <html>hi</html>"
        );
    }

    #[test]
    fn test_concurrent_replies() {
        let quit = Event::sticky();
        let shutdown = quit.child();
        let (mut client, conn) = connected_pair(&quit, &shutdown);

        let req = Arc::new(make_request(&conn, "/", "", None));

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let req = Arc::clone(&req);

                std::thread::spawn(move || req.send_reply(&Reply::text(&format!("reply {}", i))))
            })
            .collect();

        let mut sent = 0;

        for t in threads {
            match t.join().unwrap() {
                Ok(()) => sent += 1,
                Err(Error::AlreadyCompleted) | Err(Error::ReplyInProgress) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(sent, 1);

        let out = read_all(&conn, &mut client);
        assert_eq!(out.matches("HTTP/1.1 200 OK\r\n").count(), 1);

        let body = &out[(out.find("\r\n\r\n").unwrap() + 4)..];
        assert_eq!(body.len(), 7);
        assert!(body.starts_with("reply "));
    }

    #[test]
    fn test_send_status_reply() {
        let quit = Event::sticky();
        let shutdown = quit.child();
        let (mut client, conn) = connected_pair(&quit, &shutdown);

        let req = make_request(&conn, "/", "", None);

        req.send_simple_reply(ReplyBody::Status(404), None, None)
            .unwrap();

        let page = "<html><title>404 Not Found</title><body><h1>Not Found</h1></body></html>";

        assert_eq!(
            read_all(&conn, &mut client),
            format!(
                "HTTP/1.1 404 Not Found\r\n\
                 Content-Type: text/html; charset=utf-8\r\n\
                 Content-Length: {}\r\n\
                 \r\n\
                 {}",
                page.len(),
                page
            )
        );
    }

    #[test]
    fn test_chunked_reply() {
        let quit = Event::sticky();
        let shutdown = quit.child();
        let (mut client, conn) = connected_pair(&quit, &shutdown);

        let req = make_request(&conn, "/", "", None);

        assert!(matches!(req.send_chunk(b"x"), Err(Error::NoChunkedReply)));

        req.start_chunked_reply(Some("text/plain"), None, &[])
            .unwrap();

        assert!(matches!(
            req.start_chunked_reply(None, None, &[]),
            Err(Error::ChunkedReplyActive)
        ));

        req.send_chunk(b"Wiki").unwrap();
        req.send_chunk(b"").unwrap();
        req.send_chunk(b"pedia in chunks").unwrap();
        req.end_chunked_reply(&["X-Done: 1".to_string()]).unwrap();

        assert_eq!(req.is_completed(), true);

        assert_eq!(
            read_all(&conn, &mut client),
            "HTTP/1.1 200 OK\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             Transfer-Encoding: chunked\r\n\
             \r\n\
             4\r\nWiki\r\n\
             f\r\npedia in chunks\r\n\
             0\r\n\
             X-Done: 1\r\n\
             \r\n"
        );
    }

    #[test]
    fn test_connection_close() {
        let quit = Event::sticky();
        let shutdown = quit.child();
        let (mut client, conn) = connected_pair(&quit, &shutdown);

        let req = make_request(&conn, "/", "Connection: close\r\n", None);

        req.send_simple_reply(ReplyBody::Bytes(vec![1, 2, 3]), None, None)
            .unwrap();

        assert_eq!(conn.is_open(), false);

        let mut out = Vec::new();
        client.read_to_end(&mut out).unwrap();
        assert!(out.ends_with(b"application/octet-stream\r\nContent-Length: 3\r\n\r\n\x01\x02\x03"));
    }

    #[test]
    fn test_send_reply_async() {
        let quit = Event::sticky();
        let shutdown = quit.child();
        let (mut client, conn) = connected_pair(&quit, &shutdown);

        let queue = Arc::new(MessageQueue::new(Some(quit.clone())));

        let msg = Message::new(Payload::Request(make_request(&conn, "/", "", None)));

        send_reply_async(&msg, &queue, Reply::text("done")).unwrap();

        match queue.wait(Some(std::time::Duration::from_secs(5))) {
            crate::queue::WaitResult::Message(out) => match out.payload() {
                Payload::ReplyDone(done) => {
                    assert!(Arc::ptr_eq(&done.request, &msg));
                    assert!(done.error.is_none());
                }
                _ => panic!("unexpected payload"),
            },
            r => panic!("unexpected result {:?}", r),
        }

        assert_eq!(msg.is_completed(), true);
        assert!(read_all(&conn, &mut client).ends_with("\r\n\r\ndone"));

        let ui = Message::new(Payload::Ui(crate::queue::EventType::UiClose));
        assert!(matches!(
            send_reply_async(&ui, &queue, Reply::text("x")),
            Err(Error::NotARequest)
        ));
    }
}
