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

//! Process wiring: quit event, message queue, HTTP listener, and a simple
//! consumer loop that answers requests.

use crate::core::event::Event;
use crate::http1::server::HttpFactory;
use crate::listener::{self, ListenerThread};
use crate::queue::{Message, MessageQueue, NetEvent, WaitResult};
use crate::request::{self, HttpRequest, Reply, ReplyBody};
use crate::storage::{self, OpenMode, StorageClient, StorageConfig};
use log::{debug, info, warn};
use serde::Serialize;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::iterator::Signals;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

// how often the consumer loop checks listener health while idle
const CHECK_INTERVAL: Duration = Duration::from_secs(1);

pub struct Config {
    pub listen_addr: SocketAddr,

    // 0 means unlimited
    pub upload_limit: usize,

    pub storage: StorageConfig,

    // directory served by /file when storage is local. unset disables it
    pub file_root: Option<PathBuf>,
}

#[derive(Serialize)]
struct RequestInfo<'a> {
    verb: &'a str,
    resource: &'a str,
    path: &'a str,
    query: Vec<(String, String)>,
    headers: Vec<(&'a str, &'a str)>,
    cookies: Vec<(String, String)>,
    client: String,
    body_length: Option<usize>,
}

impl<'a> RequestInfo<'a> {
    fn new(req: &'a HttpRequest) -> Self {
        Self {
            verb: req.verb(),
            resource: req.resource(),
            path: req.path(),
            query: req.query(),
            headers: req
                .headers()
                .iter()
                .map(|h| (h.name.as_str(), h.value.as_str()))
                .collect(),
            cookies: req.cookies(),
            client: req.client_addr().to_string(),
            body_length: req.body().map(|b| b.len()),
        }
    }
}

pub struct App {
    quit: Event,
    queue: Arc<MessageQueue>,
    listener: ListenerThread,
    storage: StorageClient,
    file_root: Option<PathBuf>,
}

impl App {
    pub fn new(config: &Config) -> Result<Self, listener::Error> {
        let quit = Event::sticky();
        let queue = Arc::new(MessageQueue::new(Some(quit.clone())));

        let listener = ListenerThread::start(
            config.listen_addr,
            HttpFactory::new(Arc::clone(&queue), config.upload_limit),
            &quit,
        )?;

        Ok(Self {
            quit,
            queue,
            listener,
            storage: StorageClient::new(config.storage.clone()),
            file_root: config.file_root.clone(),
        })
    }

    pub fn quit_event(&self) -> &Event {
        &self.quit
    }

    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    pub fn listener(&self) -> &ListenerThread {
        &self.listener
    }

    /// Signals quit on SIGINT/SIGTERM. A second signal exits immediately.
    pub fn handle_term_signals(&self) -> Result<(), io::Error> {
        let term_now = Arc::new(AtomicBool::new(false));

        for signal_type in TERM_SIGNALS {
            signal_hook::flag::register_conditional_shutdown(
                *signal_type,
                1, // exit code
                Arc::clone(&term_now),
            )?;

            signal_hook::flag::register(*signal_type, Arc::clone(&term_now))?;
        }

        let mut signals = Signals::new(TERM_SIGNALS)?;
        let quit = self.quit.clone();

        thread::Builder::new()
            .name("signals".to_string())
            .spawn(move || {
                if let Some(signal) = signals.forever().next() {
                    info!("received signal {}, stopping", signal);

                    quit.signal();
                }
            })?;

        Ok(())
    }

    /// Consumes events until quit, then shuts the listener down and waits
    /// for its connections to finish.
    pub fn run(&self) {
        info!(
            "serving on {} (control password {})",
            self.listener.local_addr(),
            self.listener.password()
        );

        loop {
            match self.queue.wait(Some(CHECK_INTERVAL)) {
                WaitResult::Message(msg) => self.handle(&msg),
                WaitResult::Quit => break,
                WaitResult::DebugBreak => debug!("debug break"),
                WaitResult::Timeout => {}
            }

            if let Some(e) = self.listener.error_message() {
                warn!("listener stopped: {}", e);

                self.quit.signal();
            }
        }

        info!("stopping");

        self.listener.shutdown();
        self.listener.join();

        self.queue.flush();
    }

    fn handle(&self, msg: &Arc<Message>) {
        match msg.materialize() {
            NetEvent::Request(req) => {
                // a reply completes the request, possibly from another thread
                if let Err(e) = self.handle_request(msg, req) {
                    debug!("reply to {} {} failed: {}", req.verb(), req.resource(), e);

                    msg.complete();
                }
            }
            NetEvent::Ui(t) => {
                debug!("event {:?}", t);

                msg.complete();
            }
            NetEvent::ReplyDone(done) => {
                if let Some(e) = &done.error {
                    warn!("async reply failed: {}", e);
                }

                // no-op unless the reply failed before reaching the socket
                done.request.complete();

                msg.complete();
            }
        }
    }

    fn check_password(&self, req: &HttpRequest) -> bool {
        req.query_param("password").as_deref() == Some(self.listener.password())
    }

    fn handle_request(&self, msg: &Arc<Message>, req: &HttpRequest) -> Result<(), request::Error> {
        if req.overflow() {
            return req.send_simple_reply(ReplyBody::Status(413), None, None);
        }

        match req.path() {
            "/status" => {
                if !self.check_password(req) {
                    return req.send_simple_reply(ReplyBody::Status(403), None, None);
                }

                let mut out = self.listener.list_threads().join("\n");
                out.push('\n');

                req.send_reply(&Reply::text(&out).content_type("text/plain"))
            }
            "/shutdown" => {
                if !self.check_password(req) {
                    return req.send_simple_reply(ReplyBody::Status(403), None, None);
                }

                let result = req.send_reply(&Reply::text("stopping\n").content_type("text/plain"));

                self.quit.signal();

                result
            }
            "/file" => self.handle_file(msg, req),
            _ => {
                let body = match serde_json::to_string_pretty(&RequestInfo::new(req)) {
                    Ok(s) => s,
                    Err(_) => return req.send_simple_reply(ReplyBody::Status(500), None, None),
                };

                req.send_reply(&Reply::text(&body).content_type("application/json"))
            }
        }
    }

    // fetches a stored file and answers from a background thread
    fn handle_file(&self, msg: &Arc<Message>, req: &HttpRequest) -> Result<(), request::Error> {
        if !self.check_password(req) {
            return req.send_simple_reply(ReplyBody::Status(403), None, None);
        }

        let name = match req.query_param("name") {
            Some(name) if is_plain_file_name(&name) => name,
            _ => return req.send_simple_reply(ReplyBody::Status(400), None, None),
        };

        // remote names get the session prefix from the storage client
        let path = if self.storage.is_net_mode() {
            name.clone()
        } else {
            match &self.file_root {
                Some(root) => root.join(&name).to_string_lossy().into_owned(),
                None => return req.send_simple_reply(ReplyBody::Status(403), None, None),
            }
        };

        let contents = self
            .storage
            .open(&path, None, OpenMode::read(), None)
            .and_then(|f| {
                let data = fs::read(f.local_path())?;

                f.close()?;

                Ok(data)
            });

        let reply = match contents {
            Ok(data) => Reply::new(ReplyBody::Bytes(data)),
            Err(storage::Error::Storage(e)) if e.code == "FileNotFound" => Reply::status_page(404),
            Err(storage::Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                Reply::status_page(404)
            }
            Err(e) => {
                warn!("file {} unavailable: {}", name, e);

                Reply::status_page(502)
            }
        };

        request::send_reply_async(msg, &self.queue, reply)
    }
}

// a relative path of plain components. names starting with '~' address
// other sessions and are refused
fn is_plain_file_name(name: &str) -> bool {
    if name.is_empty() || name.starts_with('~') || name.contains('\\') {
        return false;
    }

    Path::new(name)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
}
