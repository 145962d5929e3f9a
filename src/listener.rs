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

//! Accept loop and connection registry.

use crate::core::event::Event;
use crate::core::poller::Poller;
use crate::server::{self, set_socket_opts, ConnectionHandler, ServerThread};
use log::{debug, error, info};
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};
use time::OffsetDateTime;

const LISTENER_TOKEN: Token = Token(1);

const PASSWORD_NOISE_SIZE: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to bind {0}: {1}")]
    Bind(SocketAddr, io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Produces the handler for each accepted connection.
pub trait ConnectionFactory: Send + Sync + 'static {
    fn create_handler(&self, conn: &Arc<ServerThread>) -> Box<dyn ConnectionHandler>;
}

type Registry = Mutex<HashMap<usize, Arc<ServerThread>>>;

struct Shared {
    quit: Event,
    shutdown: Event,
    children: Arc<Registry>,
    error: Mutex<Option<String>>,
    finished: Event,
}

pub struct ListenerThread {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    password: String,
    started: OffsetDateTime,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ListenerThread {
    /// Binds `addr` and starts accepting. Port 0 picks a free port; see
    /// [`local_addr`](Self::local_addr). The listener stops when `quit` or
    /// its own shutdown event fires.
    pub fn start<F: ConnectionFactory>(
        addr: SocketAddr,
        factory: F,
        quit: &Event,
    ) -> Result<Self, Error> {
        let mut listener = TcpListener::bind(addr).map_err(|e| Error::Bind(addr, e))?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            quit: quit.clone(),
            shutdown: quit.child(),
            children: Arc::new(Mutex::new(HashMap::new())),
            error: Mutex::new(None),
            finished: Event::sticky(),
        });

        let mut poller = Poller::new()?;

        poller.register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        poller.watch(&shared.quit);
        poller.watch(&shared.shutdown);

        let thread = {
            let shared = Arc::clone(&shared);

            thread::Builder::new()
                .name("listener".to_string())
                .spawn(move || {
                    Self::run(&shared, listener, poller, factory);

                    shared.finished.signal();
                })?
        };

        info!("listening on {}", local_addr);

        Ok(Self {
            shared,
            local_addr,
            password: generate_password(),
            started: OffsetDateTime::now_utc(),
            thread: Mutex::new(Some(thread)),
        })
    }

    fn run<F: ConnectionFactory>(
        shared: &Arc<Shared>,
        listener: TcpListener,
        mut poller: Poller,
        factory: F,
    ) {
        let mut next_id = 1;
        let mut handles = Vec::new();

        'accept: while !shared.quit.is_signaled() && !shared.shutdown.is_signaled() {
            loop {
                match listener.accept() {
                    Ok((stream, peer_addr)) => {
                        let id = next_id;
                        next_id += 1;

                        debug!("accepted connection {} from {}", id, peer_addr);

                        if let Some(h) = Self::spawn_child(shared, id, stream, peer_addr, &factory)
                        {
                            handles.push(h);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        error!("accept failed: {}", e);

                        *shared.error.lock().unwrap() = Some(format!("accept failed: {}", e));
                        shared.shutdown.signal();

                        break 'accept;
                    }
                }
            }

            handles.retain(|h: &thread::JoinHandle<()>| !h.is_finished());

            if let Err(e) = poller.poll(None) {
                error!("listener poll failed: {}", e);

                *shared.error.lock().unwrap() = Some(format!("poll failed: {}", e));
                shared.shutdown.signal();

                break;
            }
        }

        drop(listener);

        debug!("listener stopping, waiting for {} connections", handles.len());

        for h in handles {
            // a handler panic has already been reported
            let _ = h.join();
        }
    }

    fn spawn_child<F: ConnectionFactory>(
        shared: &Arc<Shared>,
        id: usize,
        stream: TcpStream,
        peer_addr: SocketAddr,
        factory: &F,
    ) -> Option<thread::JoinHandle<()>> {
        set_socket_opts(&stream);

        let conn = match ServerThread::new(id, stream, peer_addr, &shared.quit, &shared.shutdown) {
            Ok(conn) => conn,
            Err(e) => {
                error!("conn {}: setup failed: {}", id, e);
                return None;
            }
        };

        let mut handler = factory.create_handler(&conn);

        shared
            .children
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&conn));

        let children = Arc::clone(&shared.children);

        let result = thread::Builder::new()
            .name(format!("conn-{}", id))
            .spawn(move || {
                server::run(&conn, &mut *handler);

                conn.set_run_state("Terminated");
                children.lock().unwrap().remove(&conn.id());

                debug!("conn {}: finished", conn.id());
            });

        match result {
            Ok(h) => Some(h),
            Err(e) => {
                error!("conn {}: failed to start thread: {}", id, e);

                if let Some(conn) = shared.children.lock().unwrap().remove(&id) {
                    conn.close_socket();
                }

                None
            }
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A random control password for local administration.
    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn started(&self) -> OffsetDateTime {
        self.started
    }

    /// Set if the accept loop stopped on its own because of an error.
    pub fn error_message(&self) -> Option<String> {
        self.shared.error.lock().unwrap().clone()
    }

    pub fn shutdown_event(&self) -> &Event {
        &self.shared.shutdown
    }

    /// Asks the listener and all of its connections to stop. Returns
    /// immediately; use [`join`](Self::join) to wait.
    pub fn shutdown(&self) {
        self.shared.shutdown.signal();
    }

    /// Waits for the accept loop to exit. Every connection thread has
    /// finished by the time this returns.
    pub fn join(&self) {
        let thread = self.thread.lock().unwrap().take();

        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }

    pub fn is_running(&self) -> bool {
        !self.shared.finished.is_signaled()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.children.lock().unwrap().len()
    }

    /// One line per live connection, ordered by id.
    pub fn list_threads(&self) -> Vec<String> {
        let mut children: Vec<Arc<ServerThread>> = self
            .shared
            .children
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();

        children.sort_by_key(|c| c.id());

        children
            .iter()
            .map(|c| {
                format!(
                    "Thread ID={} (peer={}): {}",
                    c.id(),
                    c.peer_addr(),
                    c.run_state()
                )
            })
            .collect()
    }
}

impl Drop for ListenerThread {
    fn drop(&mut self) {
        self.shutdown();
        self.join();
    }
}

fn generate_password() -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    const HEX: &[u8; 16] = b"0123456789abcdef";

    let mut hasher = Sha256::new();

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    hasher.update(now.as_nanos().to_le_bytes());
    hasher.update(process::id().to_le_bytes());
    hasher.update(COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());

    let mut noise = [0; PASSWORD_NOISE_SIZE];
    rand::thread_rng().fill_bytes(&mut noise);
    hasher.update(noise);

    hasher
        .finalize()
        .iter()
        .map(|b| HEX[(b & 0x0f) as usize] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http1::server::testutil::read_response;
    use crate::http1::server::HttpFactory;
    use crate::queue::{Message, MessageQueue, WaitResult};
    use crate::request::Reply;
    use std::io::{Read, Write};
    use std::net::TcpStream as StdTcpStream;
    use std::time::Duration;
    use test_log::test;

    fn start_http(quit: &Event, upload_limit: usize) -> (ListenerThread, Arc<MessageQueue>) {
        let queue = Arc::new(MessageQueue::new(Some(quit.clone())));

        let listener = ListenerThread::start(
            "127.0.0.1:0".parse().unwrap(),
            HttpFactory::new(Arc::clone(&queue), upload_limit),
            quit,
        )
        .unwrap();

        (listener, queue)
    }

    fn connect(listener: &ListenerThread) -> StdTcpStream {
        let client = StdTcpStream::connect(listener.local_addr()).unwrap();

        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        client
    }

    fn next_request(queue: &MessageQueue) -> Arc<Message> {
        match queue.wait(Some(Duration::from_secs(5))) {
            WaitResult::Message(msg) => msg,
            r => panic!("unexpected result {:?}", r),
        }
    }

    #[test]
    fn test_password() {
        let quit = Event::sticky();
        let (listener, _queue) = start_http(&quit, 0);

        let password = listener.password();
        assert_eq!(password.len(), 32);
        assert!(password
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        assert_ne!(generate_password(), generate_password());
    }

    #[test]
    fn test_keep_alive_and_status() {
        let quit = Event::sticky();
        let (listener, queue) = start_http(&quit, 0);

        let mut client = connect(&listener);

        for resource in ["/first", "/second"].iter() {
            write!(client, "GET {} HTTP/1.1\r\nHost: x\r\n\r\n", resource).unwrap();

            let msg = next_request(&queue);
            let req = msg.request().unwrap();
            assert_eq!(req.resource(), *resource);

            let status = listener.list_threads();
            assert_eq!(status.len(), 1);
            assert_eq!(
                status[0],
                format!(
                    "Thread ID=1 (peer={}): Processing request",
                    client.local_addr().unwrap()
                )
            );

            req.send_reply(&Reply::text("ok")).unwrap();

            let resp = read_response(&mut client);
            assert!(resp.ends_with("\r\n\r\nok"));
        }

        // same connection served both
        assert_eq!(listener.connection_count(), 1);
        assert!(listener.list_threads()[0].starts_with("Thread ID=1 "));
    }

    #[test]
    fn test_sequential_ids() {
        let quit = Event::sticky();
        let (listener, queue) = start_http(&quit, 0);

        let mut a = connect(&listener);
        a.write_all(b"GET /a HTTP/1.1\r\n\r\n").unwrap();
        let msg_a = next_request(&queue);

        let mut b = connect(&listener);
        b.write_all(b"GET /b HTTP/1.1\r\n\r\n").unwrap();
        let msg_b = next_request(&queue);

        assert_eq!(msg_a.request().unwrap().connection().id(), 1);
        assert_eq!(msg_b.request().unwrap().connection().id(), 2);
        assert_eq!(listener.list_threads().len(), 2);

        msg_a.complete();
        msg_b.complete();
    }

    #[test]
    fn test_connection_close_unregisters() {
        let quit = Event::sticky();
        let (listener, queue) = start_http(&quit, 0);

        let mut client = connect(&listener);
        client
            .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap();

        let msg = next_request(&queue);
        msg.request()
            .unwrap()
            .send_reply(&Reply::text("bye"))
            .unwrap();

        let mut out = String::new();
        client.read_to_string(&mut out).unwrap();
        assert!(out.ends_with("bye"));

        while listener.connection_count() > 0 {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_shutdown_waits_for_connections() {
        let quit = Event::sticky();
        let (listener, _queue) = start_http(&quit, 0);

        let mut idle = connect(&listener);

        while listener.connection_count() == 0 {
            thread::sleep(Duration::from_millis(5));
        }

        listener.shutdown();
        listener.join();

        assert_eq!(listener.is_running(), false);
        assert_eq!(listener.connection_count(), 0);
        assert_eq!(quit.is_signaled(), false);
        assert_eq!(listener.error_message(), None);

        let mut buf = [0; 16];
        assert_eq!(idle.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_quit_stops_listener() {
        let quit = Event::sticky();
        let (listener, queue) = start_http(&quit, 0);

        let mut client = connect(&listener);
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();

        while queue.is_empty() {
            thread::sleep(Duration::from_millis(5));
        }

        quit.signal();
        listener.join();

        assert_eq!(listener.is_running(), false);
        assert!(listener.shutdown_event().is_signaled());

        let mut out = String::new();
        client.read_to_string(&mut out).unwrap();
        assert!(out.starts_with("HTTP/1.1 503 Service Unavailable (Shutting Down)\r\n"));
    }

    #[test]
    fn test_bind_in_use() {
        let quit = Event::sticky();
        let (listener, queue) = start_http(&quit, 0);

        let result = ListenerThread::start(
            listener.local_addr(),
            HttpFactory::new(queue, 0),
            &quit,
        );

        assert!(matches!(result, Err(Error::Bind(_, _))));
    }
}
