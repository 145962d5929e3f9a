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

//! Connection threads.
//!
//! A [`ServerThread`] owns one accepted connection. Its socket is
//! non-blocking; [`read`](ServerThread::read) and [`send`](ServerThread::send)
//! block on a [`Poller`] that also wakes up when the process-wide quit event
//! or the listener's shutdown event fires, so any in-flight I/O is abandoned
//! promptly on shutdown.
//!
//! Reads and writes use separate handles of the same socket, each with its
//! own poller, so a reply can be written from the consumer's thread while
//! the connection thread is parked waiting for the next request. Closing
//! goes through a third handle and never waits on either side.

use crate::core::event::Event;
use crate::core::poller::Poller;
use log::{debug, error};
use mio::net::TcpStream;
use mio::{Interest, Token};
use std::cmp;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const STREAM_TOKEN: Token = Token(1);

const DISCARD_BUFFER_SIZE: usize = 8192;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("connection closed")]
    Closed,

    #[error("timed out")]
    TimedOut,

    #[error("cancelled")]
    Cancelled,
}

/// Services one request per call. Returning false ends the connection.
pub trait ConnectionHandler: Send {
    fn process_request(&mut self, conn: &Arc<ServerThread>) -> bool;
}

// one direction of the socket
struct Half {
    stream: TcpStream,
    poller: Poller,
}

impl Half {
    fn new(
        mut stream: TcpStream,
        interest: Interest,
        quit: &Event,
        shutdown: &Event,
    ) -> Result<Self, io::Error> {
        let mut poller = Poller::new()?;

        poller.register(&mut stream, STREAM_TOKEN, interest)?;

        poller.watch(quit);
        poller.watch(shutdown);

        Ok(Self { stream, poller })
    }
}

fn dup_stream(stream: &TcpStream) -> Result<socket2::Socket, io::Error> {
    socket2::SockRef::from(stream).try_clone()
}

pub struct ServerThread {
    id: usize,
    peer_addr: SocketAddr,
    reader: Mutex<Half>,
    writer: Mutex<Half>,
    control: socket2::Socket,
    open: AtomicBool,
    run_state: Mutex<String>,
    quit: Event,
    shutdown: Event,
}

pub fn set_socket_opts(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        error!("set nodelay failed: {:?}", e);
    }

    let socket = socket2::SockRef::from(stream);

    if let Err(e) = socket.set_keepalive(true) {
        error!("set keepalive failed: {:?}", e);
    }
}

impl ServerThread {
    pub fn new(
        id: usize,
        stream: TcpStream,
        peer_addr: SocketAddr,
        quit: &Event,
        shutdown: &Event,
    ) -> Result<Arc<Self>, io::Error> {
        let write_stream = TcpStream::from_std(dup_stream(&stream)?.into());
        let control = dup_stream(&stream)?;

        Ok(Arc::new(Self {
            id,
            peer_addr,
            reader: Mutex::new(Half::new(stream, Interest::READABLE, quit, shutdown)?),
            writer: Mutex::new(Half::new(
                write_stream,
                Interest::WRITABLE,
                quit,
                shutdown,
            )?),
            control,
            open: AtomicBool::new(true),
            run_state: Mutex::new(String::from("Initializing")),
            quit: quit.clone(),
            shutdown: shutdown.clone(),
        }))
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn quit_event(&self) -> &Event {
        &self.quit
    }

    pub fn shutdown_event(&self) -> &Event {
        &self.shutdown
    }

    pub fn is_cancelled(&self) -> bool {
        self.quit.is_signaled() || self.shutdown.is_signaled()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn set_run_state(&self, state: &str) {
        let s = &mut *self.run_state.lock().unwrap();

        s.clear();
        s.push_str(state);
    }

    pub fn run_state(&self) -> String {
        self.run_state.lock().unwrap().clone()
    }

    /// Reads at least `minlen` bytes into `buf`, then whatever more is
    /// available without blocking. Fails if the peer closes before `minlen`
    /// bytes arrive, on timeout, or if the connection is cancelled while
    /// waiting.
    pub fn read(
        &self,
        buf: &mut [u8],
        minlen: usize,
        timeout: Option<Duration>,
    ) -> Result<usize, Error> {
        let deadline = timeout.map(|t| Instant::now() + t);

        self.read_until(buf, minlen, deadline)
    }

    /// Reads and throws away exactly `len` bytes.
    pub fn read_discard(&self, len: usize, timeout: Option<Duration>) -> Result<(), Error> {
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut scratch = [0; DISCARD_BUFFER_SIZE];
        let mut left = len;

        while left > 0 {
            let want = cmp::min(left, scratch.len());

            let size = self.read_until(&mut scratch[..want], want, deadline)?;

            left -= size;
        }

        Ok(())
    }

    fn read_until(
        &self,
        buf: &mut [u8],
        minlen: usize,
        deadline: Option<Instant>,
    ) -> Result<usize, Error> {
        assert!(minlen <= buf.len());

        let half = &mut *self.reader.lock().unwrap();

        let mut total = 0;

        loop {
            if !self.is_open() {
                return Err(Error::Closed);
            }

            if total == buf.len() {
                return Ok(total);
            }

            match half.stream.read(&mut buf[total..]) {
                Ok(0) => {
                    if total > 0 && total >= minlen {
                        return Ok(total);
                    }

                    return Err(Error::Closed);
                }
                Ok(size) => total += size,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if total >= minlen && (total > 0 || minlen == 0) {
                        return Ok(total);
                    }

                    self.wait_io(half, deadline)?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Writes all of `data`. There is no timeout, but a quit or shutdown
    /// signal aborts the write if the socket isn't ready for more.
    /// Concurrent senders are serialized.
    pub fn send(&self, data: &[u8]) -> Result<(), Error> {
        let half = &mut *self.writer.lock().unwrap();

        let mut pos = 0;

        while pos < data.len() {
            if !self.is_open() {
                return Err(Error::Closed);
            }

            match half.stream.write(&data[pos..]) {
                Ok(0) => return Err(Error::Closed),
                Ok(size) => pos += size,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.wait_io(half, None)?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }

        Ok(())
    }

    /// Shuts the socket down in both directions. A thread blocked in
    /// [`read`](Self::read) or [`send`](Self::send) wakes up with
    /// [`Error::Closed`] or an I/O error.
    pub fn close_socket(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }

        // the peer may already be gone
        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            debug!("conn {}: shutdown failed: {:?}", self.id, e);
        }
    }

    fn wait_io(&self, half: &mut Half, deadline: Option<Instant>) -> Result<(), Error> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let timeout = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::TimedOut);
                }

                Some(deadline - now)
            }
            None => None,
        };

        half.poller.poll(timeout)?;

        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }

        Ok(())
    }
}

/// Connection thread body: processes requests until the handler gives up
/// or the connection is cancelled, then closes the socket.
pub fn run(conn: &Arc<ServerThread>, handler: &mut dyn ConnectionHandler) {
    while !conn.is_cancelled() && handler.process_request(conn) {}

    conn.set_run_state("Closing");
    conn.close_socket();
}
