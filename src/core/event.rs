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

//! Waitable events used to signal between threads.
//!
//! An [`Event`] is either manual-reset or sticky. A sticky event, once
//! signaled, stays signaled forever, which makes it suitable for
//! cancellation: the process-wide quit event is sticky, and each listener's
//! shutdown event is a [`child`](Event::child) of it.

use slab::Slab;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

type Callback = Arc<dyn Fn() + Send + Sync>;

struct State {
    signaled: bool,
    observers: Slab<Callback>,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
    sticky: bool,

    // keeps a child registered with its parent for as long as it lives
    parent_link: Mutex<Option<Observer>>,
}

impl Inner {
    fn signal(&self) {
        let callbacks: Vec<Callback> = {
            let state = &mut *self.state.lock().unwrap();

            state.signaled = true;

            self.cond.notify_all();

            state.observers.iter().map(|(_, c)| Arc::clone(c)).collect()
        };

        for c in callbacks {
            c();
        }
    }

    // wake waiters without changing the signaled state
    fn wake(&self) {
        let _state = self.state.lock().unwrap();

        self.cond.notify_all();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Signaled,
    Cancelled,
    TimedOut,
}

#[derive(Clone)]
pub struct Event {
    inner: Arc<Inner>,
}

impl Event {
    pub fn new(sticky: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    signaled: false,
                    observers: Slab::new(),
                }),
                cond: Condvar::new(),
                sticky,
                parent_link: Mutex::new(None),
            }),
        }
    }

    pub fn sticky() -> Self {
        Self::new(true)
    }

    pub fn is_sticky(&self) -> bool {
        self.inner.sticky
    }

    pub fn signal(&self) {
        self.inner.signal();
    }

    // no effect on a sticky event
    pub fn reset(&self) {
        if self.inner.sticky {
            return;
        }

        self.inner.state.lock().unwrap().signaled = false;
    }

    pub fn is_signaled(&self) -> bool {
        self.inner.state.lock().unwrap().signaled
    }

    /// Waits until the event is signaled. Returns false on timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut state = self.inner.state.lock().unwrap();

        loop {
            if state.signaled {
                return true;
            }

            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }

                    self.inner.cond.wait_timeout(state, deadline - now).unwrap().0
                }
                None => self.inner.cond.wait(state).unwrap(),
            };
        }
    }

    /// Waits until the event is signaled, unless `cancel` fires first.
    pub fn wait_unless(&self, cancel: &Event, timeout: Option<Duration>) -> Wake {
        let weak = Arc::downgrade(&self.inner);
        let _observer = cancel.observe(move || {
            if let Some(inner) = weak.upgrade() {
                inner.wake();
            }
        });

        let deadline = timeout.map(|t| Instant::now() + t);

        let mut state = self.inner.state.lock().unwrap();

        loop {
            if state.signaled {
                return Wake::Signaled;
            }

            // the observer can't wake us while we hold the lock, so checking
            // the other event here is not racy
            if cancel.is_signaled() {
                return Wake::Cancelled;
            }

            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Wake::TimedOut;
                    }

                    self.inner.cond.wait_timeout(state, deadline - now).unwrap().0
                }
                None => self.inner.cond.wait(state).unwrap(),
            };
        }
    }

    /// Registers a callback to be invoked each time the event is signaled.
    /// If the event is already signaled, the callback is invoked right away.
    /// The registration lasts until the returned [`Observer`] is dropped.
    ///
    /// Callbacks are invoked without any event lock held, on the thread
    /// calling [`signal`](Event::signal).
    pub fn observe<F>(&self, f: F) -> Observer
    where
        F: Fn() + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(f);

        let (key, already) = {
            let state = &mut *self.inner.state.lock().unwrap();

            (state.observers.insert(Arc::clone(&callback)), state.signaled)
        };

        if already {
            callback();
        }

        Observer {
            event: Arc::downgrade(&self.inner),
            key,
        }
    }

    /// Creates a sticky event that is signaled whenever this one is.
    /// Signaling the child has no effect on this event.
    pub fn child(&self) -> Event {
        let child = Event::sticky();

        let weak = Arc::downgrade(&child.inner);
        let link = self.observe(move || {
            if let Some(inner) = weak.upgrade() {
                inner.signal();
            }
        });

        *child.inner.parent_link.lock().unwrap() = Some(link);

        child
    }

    pub fn same_as(&self, other: &Event) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new(false)
    }
}

pub struct Observer {
    event: Weak<Inner>,
    key: usize,
}

impl Drop for Observer {
    fn drop(&mut self) {
        if let Some(inner) = self.event.upgrade() {
            let state = &mut *inner.state.lock().unwrap();

            if state.observers.contains(self.key) {
                state.observers.remove(self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_manual_reset() {
        let e = Event::new(false);
        assert_eq!(e.is_signaled(), false);

        e.signal();
        assert_eq!(e.is_signaled(), true);
        assert_eq!(e.wait(Some(Duration::from_millis(0))), true);

        e.reset();
        assert_eq!(e.is_signaled(), false);
        assert_eq!(e.wait(Some(Duration::from_millis(10))), false);
    }

    #[test]
    fn test_sticky() {
        let e = Event::sticky();

        e.signal();
        e.reset();

        assert_eq!(e.is_signaled(), true);
    }

    #[test]
    fn test_wait_across_threads() {
        let e = Event::sticky();

        let thread = {
            let e = e.clone();

            thread::spawn(move || e.wait(None))
        };

        thread::sleep(Duration::from_millis(20));
        e.signal();

        assert_eq!(thread.join().unwrap(), true);
    }

    #[test]
    fn test_observe() {
        let e = Event::new(false);
        let count = Arc::new(AtomicUsize::new(0));

        let observer = {
            let count = Arc::clone(&count);

            e.observe(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        e.signal();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        drop(observer);

        e.signal();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // already signaled
        let _observer = {
            let count = Arc::clone(&count);

            e.observe(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_child() {
        let quit = Event::sticky();

        let a = quit.child();
        let b = quit.child();

        a.signal();
        assert_eq!(a.is_signaled(), true);
        assert_eq!(b.is_signaled(), false);
        assert_eq!(quit.is_signaled(), false);

        quit.signal();
        assert_eq!(b.is_signaled(), true);

        // created after the parent fired
        let c = quit.child();
        assert_eq!(c.is_signaled(), true);
    }

    #[test]
    fn test_wait_unless() {
        let done = Event::new(false);
        let cancel = Event::sticky();

        assert_eq!(
            done.wait_unless(&cancel, Some(Duration::from_millis(10))),
            Wake::TimedOut
        );

        let thread = {
            let done = done.clone();
            let cancel = cancel.clone();

            thread::spawn(move || done.wait_unless(&cancel, None))
        };

        thread::sleep(Duration::from_millis(20));
        cancel.signal();

        assert_eq!(thread.join().unwrap(), Wake::Cancelled);

        done.signal();
        assert_eq!(done.wait_unless(&cancel, None), Wake::Signaled);
    }
}
