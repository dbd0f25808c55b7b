//! Correlate outgoing request tokens with response and timeout continuations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::trace;

use crate::common::Id;
use crate::scheduler::{Scheduler, TimerHandle};

type ResponseCallback<T> = Box<dyn FnOnce(T) + Send + 'static>;
type TimeoutCallback = Box<dyn FnOnce() + Send + 'static>;

struct Entry<T> {
    on_response: ResponseCallback<T>,
    timer: TimerHandle,
}

/// A map from an outgoing message id to the continuation waiting for its
/// response, with a scheduled timeout owning the failure path.
///
/// Exactly one of `on_response` / `on_timeout` fires per registered id. The
/// race between a late response and the timeout is decided by
/// [TimerHandle::cancel]: whoever wins cancellation wins delivery.
pub(crate) struct Mailbox<T> {
    entries: Mutex<HashMap<Id, Entry<T>>>,
}

impl<T: Send + 'static> Mailbox<T> {
    pub fn new() -> Self {
        Mailbox {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register a continuation for `message_id` and schedule its timeout.
    ///
    /// The mailbox lock is never held while either callback runs.
    pub fn register<R, O>(
        this: &Arc<Self>,
        scheduler: &Scheduler,
        message_id: Id,
        on_response: R,
        on_timeout: O,
        timeout: Duration,
    ) where
        R: FnOnce(T) + Send + 'static,
        O: FnOnce() + Send + 'static,
    {
        let mailbox = this.clone();

        // The timer callback takes this lock first, so a timer that comes due
        // immediately still blocks until the entry below is inserted.
        let mut entries = this.entries.lock().expect("mailbox lock poisoned");

        let timer = scheduler.schedule_after(timeout, move || {
            // The timer won the claim race, so no resolve can remove the
            // entry anymore.
            let removed = mailbox
                .entries
                .lock()
                .expect("mailbox lock poisoned")
                .remove(&message_id);

            if removed.is_some() {
                trace!(context = "mailbox", ?message_id, "Request timed out");
                on_timeout();
            }
        });

        entries.insert(
            message_id,
            Entry {
                on_response: Box::new(on_response),
                timer,
            },
        );
    }

    /// Deliver a response for `message_id`.
    ///
    /// A no-op for unknown ids (late or duplicate responses) and for entries
    /// whose timeout already claimed completion.
    pub fn resolve(&self, message_id: &Id, payload: T) {
        let timer = match self
            .entries
            .lock()
            .expect("mailbox lock poisoned")
            .get(message_id)
        {
            Some(entry) => entry.timer.clone(),
            None => {
                trace!(context = "mailbox", ?message_id, "Unexpected response id");
                return;
            }
        };

        if !timer.cancel() {
            // The timeout fired first and owns completion.
            trace!(context = "mailbox", ?message_id, "Response lost to timeout");
            return;
        }

        let entry = self
            .entries
            .lock()
            .expect("mailbox lock poisoned")
            .remove(message_id);

        if let Some(entry) = entry {
            (entry.on_response)(payload);
        }
    }

    /// Drop the continuation for `message_id` without firing either callback.
    ///
    /// A no-op for unknown ids and for entries whose timeout already claimed
    /// completion.
    pub fn cancel(&self, message_id: &Id) {
        let timer = match self
            .entries
            .lock()
            .expect("mailbox lock poisoned")
            .get(message_id)
        {
            Some(entry) => entry.timer.clone(),
            None => return,
        };

        if timer.cancel() {
            self.entries
                .lock()
                .expect("mailbox lock poisoned")
                .remove(message_id);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("mailbox lock poisoned").len()
    }
}
