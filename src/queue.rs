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

//! Cross-thread message queue.
//!
//! Connection threads hand work to the single consumer thread through a
//! [`MessageQueue`]. A producer either posts a message and moves on, or
//! sends it and blocks until the consumer marks it complete. The consumer
//! drains the queue with [`wait`](MessageQueue::wait), which also returns
//! when the process-wide quit event fires.

use crate::core::event::{Event, Observer, Wake};
use crate::request::HttpRequest;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

/// Event type codes seen by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    NetRequest = 1,
    Timeout = 2,
    DebugBreak = 3,
    UiClose = 4,
    Reply = 5,
    ReplyDone = 6,
}

impl EventType {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Outcome of an asynchronous reply.
pub struct ReplyDone {
    pub request: Arc<Message>,
    pub error: Option<String>,
}

pub enum Payload {
    Request(HttpRequest),
    Ui(EventType),
    ReplyDone(ReplyDone),
}

/// The consumer-visible form of a dequeued message.
pub enum NetEvent<'a> {
    Request(&'a HttpRequest),
    Ui(EventType),
    ReplyDone(&'a ReplyDone),
}

impl NetEvent<'_> {
    pub fn event_type(&self) -> EventType {
        match self {
            NetEvent::Request(_) => EventType::NetRequest,
            NetEvent::Ui(t) => *t,
            NetEvent::ReplyDone(_) => EventType::ReplyDone,
        }
    }
}

pub struct Message {
    payload: Payload,
    done: Event,
    abort: Mutex<Option<Event>>,
}

impl Message {
    pub fn new(payload: Payload) -> Arc<Self> {
        let done = match &payload {
            Payload::Request(req) => req.completion_event().clone(),
            _ => Event::sticky(),
        };

        Arc::new(Self {
            payload,
            done,
            abort: Mutex::new(None),
        })
    }

    /// Creates a message whose senders give up when `abort` fires.
    pub fn with_abort(payload: Payload, abort: Event) -> Arc<Self> {
        let msg = Self::new(payload);

        *msg.abort.lock().unwrap() = Some(abort);

        msg
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn request(&self) -> Option<&HttpRequest> {
        match &self.payload {
            Payload::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn materialize(&self) -> NetEvent<'_> {
        match &self.payload {
            Payload::Request(req) => NetEvent::Request(req),
            Payload::Ui(t) => NetEvent::Ui(*t),
            Payload::ReplyDone(r) => NetEvent::ReplyDone(r),
        }
    }

    /// Marks the message as processed, releasing a blocked sender. Calling
    /// this more than once has no further effect.
    pub fn complete(&self) {
        match &self.payload {
            Payload::Request(req) => req.complete(),
            _ => self.done.signal(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.done.is_signaled()
    }

    pub fn abort_event(&self) -> Option<Event> {
        self.abort.lock().unwrap().clone()
    }

    fn inherit_abort(&self, quit: &Event) {
        let abort = &mut *self.abort.lock().unwrap();

        if abort.is_none() {
            *abort = Some(quit.clone());
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.payload {
            Payload::Request(req) => format!("request {} {}", req.verb(), req.resource()),
            Payload::Ui(t) => format!("ui {:?}", t),
            Payload::ReplyDone(_) => "reply-done".to_string(),
        };

        f.debug_struct("Message")
            .field("kind", &kind)
            .field("completed", &self.is_completed())
            .finish()
    }
}

#[derive(Debug)]
pub enum WaitResult {
    Message(Arc<Message>),
    Quit,
    DebugBreak,
    Timeout,
}

struct Shared {
    items: Mutex<VecDeque<Arc<Message>>>,
    cond: Condvar,
}

impl Shared {
    fn wake(&self) {
        let _items = self.items.lock().unwrap();

        self.cond.notify_all();
    }
}

fn waker_for(shared: &Arc<Shared>) -> impl Fn() + Send + Sync + 'static {
    let shared: Weak<Shared> = Arc::downgrade(shared);

    move || {
        if let Some(shared) = shared.upgrade() {
            shared.wake();
        }
    }
}

pub struct MessageQueue {
    shared: Arc<Shared>,
    quit: Option<Event>,
    debug_break: Mutex<Option<Event>>,
    watches: Mutex<Vec<Observer>>,
}

impl MessageQueue {
    /// A queue with no quit event behaves as a plain FIFO.
    pub fn new(quit: Option<Event>) -> Self {
        let shared = Arc::new(Shared {
            items: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        });

        let mut watches = Vec::new();

        if let Some(quit) = &quit {
            watches.push(quit.observe(waker_for(&shared)));
        }

        Self {
            shared,
            quit,
            debug_break: Mutex::new(None),
            watches: Mutex::new(watches),
        }
    }

    pub fn set_debug_break(&self, event: Event) {
        self.watches
            .lock()
            .unwrap()
            .push(event.observe(waker_for(&self.shared)));

        *self.debug_break.lock().unwrap() = Some(event);
    }

    pub fn quit_event(&self) -> Option<&Event> {
        self.quit.as_ref()
    }

    pub fn is_quitting(&self) -> bool {
        match &self.quit {
            Some(quit) => quit.is_signaled(),
            None => false,
        }
    }

    /// Appends a message. A message without its own abort event inherits
    /// the queue's quit event.
    pub fn post(&self, msg: Arc<Message>) {
        if let Some(quit) = &self.quit {
            msg.inherit_abort(quit);
        }

        let items = &mut *self.shared.items.lock().unwrap();

        items.push_back(msg);

        self.shared.cond.notify_all();
    }

    /// Posts a message and waits for the consumer to complete it. Returns
    /// false if the wait timed out or the message's abort event fired. The
    /// message is left in the queue either way.
    pub fn send(&self, msg: &Arc<Message>, timeout: Option<Duration>) -> bool {
        self.post(Arc::clone(msg));

        match msg.abort_event() {
            Some(abort) => msg.done.wait_unless(&abort, timeout) == Wake::Signaled,
            None => msg.done.wait(timeout),
        }
    }

    /// Waits for the next message. A queued message takes priority over the
    /// quit event, which takes priority over a debug break.
    pub fn wait(&self, timeout: Option<Duration>) -> WaitResult {
        let deadline = timeout.map(|t| Instant::now() + t);

        let debug_break = self.debug_break.lock().unwrap().clone();

        let mut items = self.shared.items.lock().unwrap();

        loop {
            if let Some(msg) = items.pop_front() {
                return WaitResult::Message(msg);
            }

            if self.is_quitting() {
                return WaitResult::Quit;
            }

            if let Some(e) = &debug_break {
                if e.is_signaled() {
                    e.reset();

                    return WaitResult::DebugBreak;
                }
            }

            items = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitResult::Timeout;
                    }

                    self.shared
                        .cond
                        .wait_timeout(items, deadline - now)
                        .unwrap()
                        .0
                }
                None => self.shared.cond.wait(items).unwrap(),
            };
        }
    }

    pub fn get(&self) -> Option<Arc<Message>> {
        self.shared.items.lock().unwrap().pop_front()
    }

    /// Removes a specific message if it is still queued. Returns whether it
    /// was found.
    pub fn abandon(&self, msg: &Arc<Message>) -> bool {
        let items = &mut *self.shared.items.lock().unwrap();

        match items.iter().position(|m| Arc::ptr_eq(m, msg)) {
            Some(pos) => {
                items.remove(pos);

                true
            }
            None => false,
        }
    }

    pub fn flush(&self) {
        let drained: Vec<Arc<Message>> = self.shared.items.lock().unwrap().drain(..).collect();

        // dropped outside the lock
        drop(drained);
    }

    pub fn len(&self) -> usize {
        self.shared.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
