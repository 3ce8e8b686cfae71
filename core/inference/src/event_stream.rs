//! One-producer, many-consumer event stream with a terminal result.
//!
//! The producer pushes events through an [`EventSender`]; any number of
//! [`EventStream`] handles iterate over them in push order, each with its
//! own cursor. The stream ends when the terminal event (pushed via
//! [`EventSender::finish`]) has been consumed, and the terminal value can
//! also be awaited directly through [`EventStream::result`] without
//! scanning.
//!
//! There is no backpressure at this boundary; the producer is paced by the
//! underlying byte stream it drains.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use tokio::sync::Notify;

struct State<E, R> {
    events: Vec<E>,
    result: Option<R>,
    finished: bool,
}

struct Inner<E, R> {
    state: Mutex<State<E, R>>,
    notify: Notify,
    /// Live `EventSender` handles; the stream closes when the last one
    /// drops without finishing.
    producers: AtomicUsize,
}

/// Producer half. Dropping it without calling [`finish`](Self::finish)
/// wakes consumers so they can observe the stream ended without a result.
pub struct EventSender<E, R> {
    inner: Arc<Inner<E, R>>,
}

/// Consumer half. Cheap to clone; each clone keeps its own cursor.
pub struct EventStream<E, R> {
    inner: Arc<Inner<E, R>>,
    cursor: usize,
}

/// Create a connected sender/stream pair.
pub fn channel<E, R>() -> (EventSender<E, R>, EventStream<E, R>) {
    let inner = Arc::new(Inner {
        state: Mutex::new(State {
            events: Vec::new(),
            result: None,
            finished: false,
        }),
        notify: Notify::new(),
        producers: AtomicUsize::new(1),
    });
    (
        EventSender {
            inner: inner.clone(),
        },
        EventStream { inner, cursor: 0 },
    )
}

impl<E, R> EventSender<E, R> {
    /// Push a non-terminal event. Never blocks, never reorders.
    ///
    /// Pushing after [`finish`](Self::finish) is a contract violation:
    /// it panics in debug builds and is dropped in release builds.
    pub fn push(&self, event: E) {
        let mut state = lock(&self.inner.state);
        if state.finished {
            debug_assert!(false, "event pushed after terminal event");
            return;
        }
        state.events.push(event);
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Push the terminal event and record the stream's result.
    pub fn finish(&self, terminal: E, result: R) {
        let mut state = lock(&self.inner.state);
        if state.finished {
            debug_assert!(false, "finish called twice");
            return;
        }
        state.events.push(terminal);
        state.result = Some(result);
        state.finished = true;
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Whether the terminal event has been pushed.
    pub fn is_finished(&self) -> bool {
        lock(&self.inner.state).finished
    }
}

impl<E, R> Clone for EventSender<E, R> {
    fn clone(&self) -> Self {
        self.inner.producers.fetch_add(1, Ordering::Relaxed);
        EventSender {
            inner: self.inner.clone(),
        }
    }
}

impl<E, R> Drop for EventSender<E, R> {
    fn drop(&mut self) {
        if self.inner.producers.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        // Last producer gone: close the stream so consumers do not wait
        // forever on a result that can no longer arrive.
        let mut state = lock(&self.inner.state);
        if !state.finished {
            state.finished = true;
        }
        drop(state);
        self.inner.notify.notify_waiters();
    }
}

impl<E: Clone, R: Clone> EventStream<E, R> {
    /// Next event in push order, or `None` once the terminal event has been
    /// consumed (or the producer went away).
    pub async fn next(&mut self) -> Option<E> {
        loop {
            // Register interest before checking state so a push landing in
            // between cannot be lost.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = lock(&self.inner.state);
                if self.cursor < state.events.len() {
                    let event = state.events[self.cursor].clone();
                    self.cursor += 1;
                    return Some(event);
                }
                if state.finished {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Wait for the terminal value without consuming events.
    ///
    /// Returns `None` if the producer was dropped before finishing.
    pub async fn result(&self) -> Option<R> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = lock(&self.inner.state);
                if state.finished {
                    return state.result.clone();
                }
            }
            notified.await;
        }
    }

    /// A new consumer positioned at the start of the stream.
    pub fn subscribe(&self) -> Self {
        EventStream {
            inner: self.inner.clone(),
            cursor: 0,
        }
    }
}

impl<E, R> Clone for EventStream<E, R> {
    fn clone(&self) -> Self {
        EventStream {
            inner: self.inner.clone(),
            cursor: self.cursor,
        }
    }
}

fn lock<'a, E, R>(mutex: &'a Mutex<State<E, R>>) -> std::sync::MutexGuard<'a, State<E, R>> {
    // Poisoning only happens if a producer panicked mid-push; the state is
    // still consistent for readers.
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
#[path = "event_stream.test.rs"]
mod tests;
