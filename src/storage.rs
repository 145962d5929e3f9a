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

//! Remote file storage client.
//!
//! Files live on a storage server and are accessed through a local staging
//! copy: opening downloads the file, closing uploads it back (or deletes it
//! remotely). Each request carries a ticket proving knowledge of the API key
//! without sending it:
//!
//! ```text
//! ticket = sha256hex(sha256hex(filename ":" server_id) ":" api_key)
//! ```
//!
//! When no storage server is configured, files are plain local files.

use log::{debug, warn};
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::env;
use std::fmt::Write as _;
use std::fs;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

const IO_TIMEOUT: Duration = Duration::from_secs(30);

const RESPONSE_HEADERS_MAX: usize = 64;

// status code used for failures below the HTTP layer
const NETWORK_ERROR_CODE: &str = "-1";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code} {message}")]
pub struct StorageError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("staging file: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(rename = "serverid")]
    pub server_id: String,

    #[serde(rename = "apikey")]
    pub api_key: String,

    pub domain: Option<String>,

    #[serde(rename = "sessionid")]
    pub session_id: Option<String>,

    #[serde(rename = "rootpath")]
    pub root_path: String,

    pub port: u16,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            server_id: String::new(),
            api_key: String::new(),
            domain: None,
            session_id: None,
            root_path: "/".to_string(),
            port: 80,
        }
    }
}

fn sha256_hex(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());

    let mut out = String::with_capacity(digest.len() * 2);

    for b in digest.iter() {
        let _ = write!(out, "{:02x}", b);
    }

    out
}

/// Computes the ticket for a fully qualified server filename.
pub fn ticket(server_fname: &str, server_id: &str, api_key: &str) -> String {
    let hash1 = sha256_hex(&format!("{}:{}", server_fname, server_id));

    sha256_hex(&format!("{}:{}", hash1, api_key))
}

/// Qualifies a filename with the session prefix. Special files map to
/// `~SID/special/N`.
pub fn server_filename(name: &str, special: Option<u32>, session_id: &str) -> String {
    if let Some(id) = special {
        return format!("~{}/special/{}", session_id, id);
    }

    if name.starts_with('~') {
        name.to_string()
    } else {
        format!("~{}/{}", session_id, name)
    }
}

/// How a file is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenMode {
    pub read: bool,
    pub write: bool,

    /// A missing file is not an error.
    pub create: bool,

    /// Existing contents are discarded, so nothing is downloaded.
    pub truncate: bool,

    /// The file is deleted when closed.
    pub delete: bool,
}

impl OpenMode {
    pub fn read() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    pub fn write() -> Self {
        Self {
            write: true,
            create: true,
            truncate: true,
            ..Self::default()
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            ..Self::default()
        }
    }

    pub fn delete() -> Self {
        Self {
            delete: true,
            ..Self::default()
        }
    }
}

struct Response {
    status: u16,
    reason: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn split_status(s: &str) -> (String, String) {
    let s = s.trim();

    match s.find(char::is_whitespace) {
        Some(pos) => (s[..pos].to_string(), s[pos..].trim().to_string()),
        None => (s.to_string(), String::new()),
    }
}

// reads the status from the X-Storage-Status header, else from the first
// body line if the request succeeded at the HTTP level, else uses the HTTP
// status itself
fn response_status(resp: &Response, body_has_status: bool) -> (String, String) {
    if let Some(v) = resp.header("x-storage-status") {
        return split_status(v);
    }

    if resp.status == 200 {
        if !body_has_status {
            return ("OK".to_string(), String::new());
        }

        let body = String::from_utf8_lossy(&resp.body);

        return split_status(body.lines().next().unwrap_or(""));
    }

    (resp.status.to_string(), resp.reason.clone())
}

fn check_status(code: String, message: String) -> Result<(), StorageError> {
    if code == "OK" {
        Ok(())
    } else {
        Err(StorageError { code, message })
    }
}

fn network_error(e: io::Error) -> StorageError {
    StorageError {
        code: NETWORK_ERROR_CODE.to_string(),
        message: e.to_string(),
    }
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn decode_chunked(mut src: &[u8]) -> Result<Vec<u8>, io::Error> {
    let invalid = || io::Error::new(io::ErrorKind::InvalidData, "invalid chunked body");

    let mut out = Vec::new();

    loop {
        let (pos, size) = match httparse::parse_chunk_size(src) {
            Ok(httparse::Status::Complete(v)) => v,
            _ => return Err(invalid()),
        };

        if size == 0 {
            return Ok(out);
        }

        let size = size as usize;
        let end = pos + size;

        if src.len() < end + 2 || &src[end..(end + 2)] != b"\r\n" {
            return Err(invalid());
        }

        out.extend_from_slice(&src[pos..end]);
        src = &src[(end + 2)..];
    }
}

// one request per connection
fn http_request(
    host: &str,
    port: u16,
    method: &str,
    path: &str,
    content_type: Option<&str>,
    body: Option<&[u8]>,
) -> Result<Response, io::Error> {
    let addr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address for host"))?;

    let mut stream = TcpStream::connect_timeout(&addr, IO_TIMEOUT)?;
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;

    let mut req = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n",
        method, path, host
    );

    if let Some(body) = body {
        if let Some(ct) = content_type {
            let _ = write!(req, "Content-Type: {}\r\n", ct);
        }

        let _ = write!(req, "Content-Length: {}\r\n", body.len());
    }

    req.push_str("\r\n");

    stream.write_all(req.as_bytes())?;

    if let Some(body) = body {
        stream.write_all(body)?;
    }

    let mut data = Vec::new();
    stream.read_to_end(&mut data)?;

    let mut headers = [httparse::EMPTY_HEADER; RESPONSE_HEADERS_MAX];
    let mut resp = httparse::Response::new(&mut headers);

    let size = match resp.parse(&data) {
        Ok(httparse::Status::Complete(size)) => size,
        Ok(httparse::Status::Partial) => {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "incomplete response",
            ))
        }
        Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
    };

    let mut out = Response {
        status: resp.code.unwrap_or(0),
        reason: resp.reason.unwrap_or("").to_string(),
        headers: resp
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).into_owned(),
                )
            })
            .collect(),
        body: Vec::new(),
    };

    let rest = &data[size..];

    out.body = if let Some(len) = out.header("content-length") {
        let len: usize = len
            .trim()
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid content length"))?;

        if rest.len() < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated response body",
            ));
        }

        rest[..len].to_vec()
    } else if out
        .header("transfer-encoding")
        .map(|v| v.eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
    {
        decode_chunked(rest)?
    } else {
        rest.to_vec()
    };

    Ok(out)
}

struct Multipart {
    boundary: String,
    body: Vec<u8>,
}

impl Multipart {
    fn new() -> Self {
        let mut noise = [0; 16];
        rand::thread_rng().fill_bytes(&mut noise);

        let mut boundary = String::from("----netbridge");

        for b in noise.iter() {
            let _ = write!(boundary, "{:02x}", b);
        }

        Self {
            boundary,
            body: Vec::new(),
        }
    }

    fn add(&mut self, name: &str, value: &str) {
        self.body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                self.boundary, name, value
            )
            .as_bytes(),
        );
    }

    fn add_file(&mut self, name: &str, filename: &str, content_type: &str, data: &[u8]) {
        self.body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                self.boundary, name, filename, content_type
            )
            .as_bytes(),
        );

        self.body.extend_from_slice(data);
        self.body.extend_from_slice(b"\r\n");
    }

    fn finish(mut self) -> (String, Vec<u8>) {
        self.body
            .extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());

        (
            format!("multipart/form-data; boundary={}", self.boundary),
            self.body,
        )
    }
}

pub struct StorageClient {
    config: StorageConfig,
    staging_dir: PathBuf,
}

impl StorageClient {
    pub fn new(config: StorageConfig) -> Self {
        Self::with_staging_dir(config, env::temp_dir())
    }

    pub fn with_staging_dir(config: StorageConfig, staging_dir: PathBuf) -> Self {
        Self {
            config,
            staging_dir,
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Whether files live on the storage server rather than locally.
    pub fn is_net_mode(&self) -> bool {
        self.config.domain.is_some() && self.config.session_id.is_some()
    }

    fn domain(&self) -> &str {
        self.config.domain.as_deref().unwrap_or("")
    }

    fn session_id(&self) -> &str {
        self.config.session_id.as_deref().unwrap_or("")
    }

    pub fn ticket(&self, server_fname: &str) -> String {
        ticket(server_fname, &self.config.server_id, &self.config.api_key)
    }

    pub fn server_filename(&self, name: &str, special: Option<u32>) -> String {
        server_filename(name, special, self.session_id())
    }

    fn url(&self, endpoint: &str, query: &[(&str, &str)]) -> String {
        let mut url = format!("{}{}", self.config.root_path, endpoint);

        if !query.is_empty() {
            let mut ser = url::form_urlencoded::Serializer::new(String::new());

            for (k, v) in query {
                ser.append_pair(k, v);
            }

            url.push('?');
            url.push_str(&ser.finish());
        }

        url
    }

    fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<(&str, &[u8])>,
    ) -> Result<Response, StorageError> {
        debug!("storage {} {}", method, path);

        http_request(
            self.domain(),
            self.config.port,
            method,
            path,
            body.map(|(ct, _)| ct),
            body.map(|(_, b)| b),
        )
        .map_err(|e| {
            warn!("storage request failed: {}", e);

            network_error(e)
        })
    }

    fn staging_path(&self) -> PathBuf {
        let mut noise = [0; 8];
        rand::thread_rng().fill_bytes(&mut noise);

        self.staging_dir
            .join(format!("netbridge-{:016x}.tmp", u64::from_le_bytes(noise)))
    }

    /// Opens a file. In network mode the contents are fetched into a local
    /// staging file unless the mode truncates or accesses no contents.
    pub fn open(
        &self,
        name: &str,
        special: Option<u32>,
        mode: OpenMode,
        mime_type: Option<&str>,
    ) -> Result<NetFile<'_>, Error> {
        if !self.is_net_mode() {
            return Ok(NetFile {
                client: self,
                local_path: PathBuf::from(name),
                server_name: None,
                mode,
                mime_type: None,
                closed: false,
            });
        }

        let server_name = self.server_filename(name, special);
        let local_path = self.staging_path();

        if (mode.read || mode.write) && !mode.truncate {
            self.download(&server_name, &local_path, mode.create)?;
        } else {
            fs::File::create(&local_path)?;
        }

        Ok(NetFile {
            client: self,
            local_path,
            server_name: Some(server_name),
            mode,
            mime_type: mime_type.map(|s| s.to_string()),
            closed: false,
        })
    }

    fn download(&self, server_name: &str, local_path: &Path, create: bool) -> Result<(), Error> {
        let ticket = self.ticket(server_name);
        let url = self.url("getfile", &[("file", server_name), ("ticket", &ticket)]);

        let result = self.request("GET", &url, None).and_then(|resp| {
            let (code, message) = response_status(&resp, false);

            if code == "FileNotFound" && create {
                return Ok(Vec::new());
            }

            check_status(code, message)?;

            Ok(resp.body)
        });

        match result {
            Ok(contents) => {
                fs::write(local_path, contents)?;

                Ok(())
            }
            Err(e) => {
                // never leave a partial staging file
                let _ = fs::remove_file(local_path);

                Err(e.into())
            }
        }
    }

    fn check_file(&self, server_name: &str, mode: &str) -> bool {
        let ticket = self.ticket(server_name);
        let url = self.url(
            "testfile",
            &[("file", server_name), ("ticket", &ticket), ("mode", mode)],
        );

        match self.request("GET", &url, None) {
            Ok(resp) => resp.status == 200 && resp.body.first() == Some(&b'Y'),
            Err(_) => false,
        }
    }

    pub fn exists(&self, name: &str, special: Option<u32>) -> bool {
        if self.is_net_mode() {
            self.check_file(&self.server_filename(name, special), "R")
        } else {
            Path::new(name).exists()
        }
    }

    pub fn writable(&self, name: &str, special: Option<u32>) -> bool {
        if self.is_net_mode() {
            return self.check_file(&self.server_filename(name, special), "W");
        }

        let path = Path::new(name);

        match fs::metadata(path) {
            Ok(meta) => !meta.permissions().readonly(),
            Err(_) => match path.parent() {
                Some(p) if p.as_os_str().is_empty() => true,
                Some(p) => p.is_dir(),
                None => false,
            },
        }
    }
}

/// An open file. Must be closed with [`close`](Self::close) to push changes
/// back to the server; dropping it only removes the staging copy.
pub struct NetFile<'a> {
    client: &'a StorageClient,
    local_path: PathBuf,
    server_name: Option<String>,
    mode: OpenMode,
    mime_type: Option<String>,
    closed: bool,
}

impl NetFile<'_> {
    /// The local file to read and write.
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    pub fn is_net_file(&self) -> bool {
        self.server_name.is_some()
    }

    /// Finishes with the file. A delete takes precedence over a write. The
    /// staging file is removed whatever the outcome.
    pub fn close(mut self) -> Result<(), Error> {
        self.closed = true;

        let server_name = match &self.server_name {
            Some(s) => s.clone(),
            None => {
                if self.mode.delete {
                    fs::remove_file(&self.local_path)?;
                }

                return Ok(());
            }
        };

        let result = if self.mode.delete {
            self.remote_delete(&server_name)
        } else if self.mode.write {
            self.upload(&server_name)
        } else {
            Ok(())
        };

        if let Err(e) = fs::remove_file(&self.local_path) {
            debug!("staging file not removed: {}", e);
        }

        result
    }

    fn remote_delete(&self, server_name: &str) -> Result<(), Error> {
        let client = self.client;

        let ticket = client.ticket(server_name);
        let url = client.url("delfile", &[("file", server_name), ("ticket", &ticket)]);

        let resp = client.request("GET", &url, None)?;

        let (code, message) = response_status(&resp, true);

        check_status(code, message).map_err(Error::from)
    }

    fn upload(&self, server_name: &str) -> Result<(), Error> {
        let client = self.client;

        let contents = fs::read(&self.local_path)?;

        let mut form = Multipart::new();
        form.add("file", server_name);
        form.add("sid", client.session_id());
        form.add("ticket", &client.ticket(server_name));
        form.add_file(
            "contents",
            "noname",
            self.mime_type
                .as_deref()
                .unwrap_or("application/octet-stream"),
            &contents,
        );

        let (content_type, body) = form.finish();

        let url = client.url("putfile", &[]);

        let resp = client.request("POST", &url, Some((&content_type, &body)))?;

        let (code, message) = response_status(&resp, true);

        check_status(code, message).map_err(Error::from)
    }
}

impl Drop for NetFile<'_> {
    fn drop(&mut self) {
        if !self.closed && self.server_name.is_some() {
            let _ = fs::remove_file(&self.local_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};
    use std::thread;

    // serves canned responses in order, one per connection, recording each
    // request it receives
    struct FakeServer {
        port: u16,
        requests: Arc<Mutex<Vec<String>>>,
        thread: Option<thread::JoinHandle<()>>,
    }

    impl FakeServer {
        fn start(responses: Vec<&'static str>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let port = listener.local_addr().unwrap().port();

            let requests = Arc::new(Mutex::new(Vec::new()));

            let thread = {
                let requests = Arc::clone(&requests);

                thread::spawn(move || {
                    for resp in responses {
                        let (mut stream, _) = listener.accept().unwrap();

                        let req = read_request(&mut stream);
                        requests.lock().unwrap().push(req);

                        stream.write_all(resp.as_bytes()).unwrap();
                    }
                })
            };

            Self {
                port,
                requests,
                thread: Some(thread),
            }
        }

        fn finish(mut self) -> Vec<String> {
            self.thread.take().unwrap().join().unwrap();

            self.requests.lock().unwrap().clone()
        }
    }

    fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut tmp = [0; 4096];

        loop {
            if let Some(pos) = find_bytes(&buf, b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..pos]).to_ascii_lowercase();

                let len = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .map(|v| v.trim().parse::<usize>().unwrap())
                    .unwrap_or(0);

                if buf.len() >= pos + 4 + len {
                    return String::from_utf8_lossy(&buf).into_owned();
                }
            }

            let size = stream.read(&mut tmp).unwrap();
            assert!(size > 0);

            buf.extend_from_slice(&tmp[..size]);
        }
    }

    fn net_config(port: u16) -> StorageConfig {
        StorageConfig {
            server_id: "S1".to_string(),
            api_key: "K".to_string(),
            domain: Some("127.0.0.1".to_string()),
            session_id: Some("sid".to_string()),
            root_path: "/store/".to_string(),
            port,
        }
    }

    fn staging_dir(name: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("netbridge-test-{}-{}", name, std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        dir
    }

    fn dir_is_empty(dir: &Path) -> bool {
        fs::read_dir(dir).unwrap().next().is_none()
    }

    #[test]
    fn test_ticket() {
        let t = ticket("~sid/foo.txt", "S1", "K");

        assert_eq!(
            t,
            "6cb6c0cc091a8ee8648e6184e3b64edff2a1f961939967c7abc3eff8d5ac3e14"
        );
        assert_eq!(ticket("~sid/foo.txt", "S1", "K"), t);

        assert_eq!(
            ticket("~sid/foo.txt", "S2", "K"),
            "d3a55c7de295f329b08d47a0a2a837b091d8a49a3665b41bd54f45adcf7a9039"
        );
        assert_ne!(ticket("~sid/bar.txt", "S1", "K"), t);
        assert_ne!(ticket("~sid/foo.txt", "S1", "L"), t);
    }

    #[test]
    fn test_server_filename() {
        struct Test {
            name: &'static str,
            fname: &'static str,
            special: Option<u32>,
            expected: &'static str,
        }

        let tests = [
            Test {
                name: "plain",
                fname: "foo.txt",
                special: None,
                expected: "~sid/foo.txt",
            },
            Test {
                name: "already-qualified",
                fname: "~other/foo.txt",
                special: None,
                expected: "~other/foo.txt",
            },
            Test {
                name: "special",
                fname: "ignored",
                special: Some(2),
                expected: "~sid/special/2",
            },
        ];

        for test in tests.iter() {
            assert_eq!(
                server_filename(test.fname, test.special, "sid"),
                test.expected,
                "{}",
                test.name
            );
        }
    }

    #[test]
    fn test_response_status() {
        let resp = |status: u16, headers: &[(&str, &str)], body: &str| Response {
            status,
            reason: "Reason".to_string(),
            headers: headers
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            body: body.as_bytes().to_vec(),
        };

        assert_eq!(
            response_status(&resp(200, &[("X-Storage-Status", "OK done")], "Nope"), true),
            ("OK".to_string(), "done".to_string())
        );
        assert_eq!(
            response_status(&resp(200, &[], "QuotaExceeded too big\nmore"), true),
            ("QuotaExceeded".to_string(), "too big".to_string())
        );
        assert_eq!(
            response_status(&resp(200, &[], "file contents"), false),
            ("OK".to_string(), "".to_string())
        );
        assert_eq!(
            response_status(&resp(404, &[], "OK"), true),
            ("404".to_string(), "Reason".to_string())
        );
    }

    #[test]
    fn test_decode_chunked() {
        assert_eq!(
            decode_chunked(b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n").unwrap(),
            b"Wikipedia"
        );
        assert!(decode_chunked(b"4\r\nWikiXX").is_err());
    }

    #[test]
    fn test_local_mode() {
        let dir = staging_dir("local");
        let client = StorageClient::with_staging_dir(StorageConfig::default(), dir.clone());

        assert_eq!(client.is_net_mode(), false);

        let path = dir.join("save.dat");
        fs::write(&path, b"data").unwrap();

        let name = path.to_str().unwrap();
        assert_eq!(client.exists(name, None), true);
        assert_eq!(client.writable(name, None), true);

        let f = client.open(name, None, OpenMode::delete(), None).unwrap();
        assert_eq!(f.local_path(), path.as_path());
        assert_eq!(f.is_net_file(), false);
        f.close().unwrap();

        assert_eq!(client.exists(name, None), false);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_open_read() {
        let server = FakeServer::start(vec![
            "HTTP/1.1 200 OK\r\nX-Storage-Status: OK\r\nContent-Length: 5\r\n\r\nhello",
        ]);

        let dir = staging_dir("read");
        let client = StorageClient::with_staging_dir(net_config(server.port), dir.clone());

        let f = client
            .open("foo.txt", None, OpenMode::read(), None)
            .unwrap();

        assert_eq!(f.server_name(), Some("~sid/foo.txt"));
        assert_eq!(fs::read(f.local_path()).unwrap(), b"hello");

        f.close().unwrap();
        assert_eq!(dir_is_empty(&dir), true);

        let requests = server.finish();
        assert_eq!(
            requests[0].lines().next().unwrap(),
            format!(
                "GET /store/getfile?file=%7Esid%2Ffoo.txt&ticket={} HTTP/1.1",
                ticket("~sid/foo.txt", "S1", "K")
            )
        );

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_open_missing() {
        let not_found =
            "HTTP/1.1 200 OK\r\nX-Storage-Status: FileNotFound no such file\r\nContent-Length: 0\r\n\r\n";

        let server = FakeServer::start(vec![not_found, not_found]);

        let dir = staging_dir("missing");
        let client = StorageClient::with_staging_dir(net_config(server.port), dir.clone());

        match client.open("foo.txt", None, OpenMode::read(), None) {
            Err(Error::Storage(e)) => {
                assert_eq!(e.code, "FileNotFound");
                assert_eq!(e.message, "no such file");
            }
            _ => panic!("expected storage error"),
        }

        assert_eq!(dir_is_empty(&dir), true);

        // create-if-absent succeeds with an empty file
        let f = client
            .open("foo.txt", None, OpenMode::read_write(), None)
            .unwrap();
        assert_eq!(fs::read(f.local_path()).unwrap(), b"");
        drop(f);

        assert_eq!(dir_is_empty(&dir), true);

        server.finish();

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_write_uploads() {
        let server = FakeServer::start(vec![
            "HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nOK 123",
        ]);

        let dir = staging_dir("write");
        let client = StorageClient::with_staging_dir(net_config(server.port), dir.clone());

        // truncating, so nothing is downloaded
        let f = client
            .open("save.dat", Some(3), OpenMode::write(), Some("text/plain"))
            .unwrap();

        fs::write(f.local_path(), b"saved state").unwrap();
        f.close().unwrap();

        assert_eq!(dir_is_empty(&dir), true);

        let requests = server.finish();
        assert_eq!(requests.len(), 1);

        let req = &requests[0];
        assert!(req.starts_with("POST /store/putfile HTTP/1.1\r\n"));
        assert!(req.contains("Content-Type: multipart/form-data; boundary="));
        assert!(req.contains("name=\"file\"\r\n\r\n~sid/special/3\r\n"));
        assert!(req.contains("name=\"sid\"\r\n\r\nsid\r\n"));
        assert!(req.contains(&format!(
            "name=\"ticket\"\r\n\r\n{}\r\n",
            ticket("~sid/special/3", "S1", "K")
        )));
        assert!(req.contains(
            "name=\"contents\"; filename=\"noname\"\r\nContent-Type: text/plain\r\n\r\nsaved state\r\n"
        ));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_delete_wins_over_write() {
        let server = FakeServer::start(vec![
            "HTTP/1.1 200 OK\r\nX-Storage-Status: AccessDenied bad ticket\r\nContent-Length: 0\r\n\r\n",
        ]);

        let dir = staging_dir("delete");
        let client = StorageClient::with_staging_dir(net_config(server.port), dir.clone());

        let mode = OpenMode {
            write: true,
            truncate: true,
            delete: true,
            ..OpenMode::default()
        };

        let f = client.open("old.sav", None, mode, None).unwrap();

        match f.close() {
            Err(Error::Storage(e)) => assert_eq!(e.code, "AccessDenied"),
            _ => panic!("expected storage error"),
        }

        assert_eq!(dir_is_empty(&dir), true);

        let requests = server.finish();
        assert!(requests[0].starts_with("GET /store/delfile?file=%7Esid%2Fold.sav&ticket="));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_exists_writable() {
        let server = FakeServer::start(vec![
            "HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nY",
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n1\r\nN\r\n0\r\n\r\n",
            "HTTP/1.1 403 Forbidden\r\nContent-Length: 1\r\n\r\nY",
        ]);

        let client = StorageClient::new(net_config(server.port));

        assert_eq!(client.exists("a.sav", None), true);
        assert_eq!(client.writable("a.sav", None), false);
        assert_eq!(client.exists("a.sav", None), false);

        let requests = server.finish();
        assert!(requests[0].contains("&mode=R "));
        assert!(requests[1].contains("&mode=W "));
    }

    #[test]
    fn test_network_error() {
        // find a port nobody listens on
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };

        let dir = staging_dir("neterr");
        let client = StorageClient::with_staging_dir(net_config(port), dir.clone());

        match client.open("foo.txt", None, OpenMode::read(), None) {
            Err(Error::Storage(e)) => assert_eq!(e.code, "-1"),
            _ => panic!("expected storage error"),
        }

        assert_eq!(dir_is_empty(&dir), true);

        fs::remove_dir_all(&dir).unwrap();
    }
}
