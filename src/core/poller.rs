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

use crate::core::event::{Event, Observer};
use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::io;
use std::sync::Arc;
use std::time::Duration;

const EVENTS_MAX: usize = 64;

// reserved for the waker
const WAKER_TOKEN: Token = Token(0);

/// A mio poll that can also be woken by [`Event`]s. A thread blocked in
/// [`poll`](Poller::poll) returns as soon as any watched event is signaled.
pub struct Poller {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    watches: Vec<Observer>,
}

impl Poller {
    pub fn new() -> Result<Self, io::Error> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_MAX),
            waker,
            watches: Vec::new(),
        })
    }

    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    pub fn register<S>(
        &self,
        source: &mut S,
        token: Token,
        interests: Interest,
    ) -> Result<(), io::Error>
    where
        S: Source + ?Sized,
    {
        if token == WAKER_TOKEN {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }

        self.poll.registry().register(source, token, interests)
    }

    pub fn watch(&mut self, event: &Event) {
        let waker = Arc::clone(&self.waker);

        self.watches.push(event.observe(move || {
            if let Err(e) = waker.wake() {
                log::error!("failed to wake poller: {:?}", e);
            }
        }));
    }

    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<(), io::Error> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Tokens that became ready during the last poll, not including wakeups.
    pub fn iter_ready(&self) -> impl Iterator<Item = Token> + '_ {
        self.events
            .iter()
            .map(|e| e.token())
            .filter(|t| *t != WAKER_TOKEN)
    }
}
