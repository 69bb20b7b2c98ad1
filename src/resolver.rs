//! Off-thread name resolution with a handoff slot, per the design note on
//! resolver safety in §9: the worker never touches a connection record
//! directly. It resolves into a slot keyed by a stable `slab` index (not a
//! raw pointer into the connection record), owned by this table (not by any
//! connection), and wakes the event thread through the selector's
//! block-notification channel. A connection torn down before its job
//! completes simply leaves an orphaned slot, reclaimed the next time `take`
//! is called for that id (or never, if it never is — the slot is a handful
//! of bytes).

use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::thread;

use slab::Slab;

use crate::selector::SelectorHandle;

pub enum ResolveOutcome {
    Addresses(Vec<SocketAddr>),
    Failed,
}

struct Inner {
    slots: Mutex<Slab<Option<ResolveOutcome>>>,
}

/// Cheap to clone; every clone shares the same slot table.
#[derive(Clone)]
pub struct ResolverTable {
    inner: Arc<Inner>,
}

impl ResolverTable {
    pub fn new() -> ResolverTable {
        ResolverTable {
            inner: Arc::new(Inner {
                slots: Mutex::new(Slab::new()),
            }),
        }
    }

    /// Spawns a detached worker resolving `host:port`; on completion it
    /// writes the outcome into this table and calls
    /// `handle.notify_block(client_fd)`. Returns the job id the caller
    /// stores on the connection to retrieve the outcome later. The slot is
    /// reserved (as `None`) before the worker starts, so the id is stable
    /// even though the worker fills it in asynchronously.
    pub fn spawn(&self, host: String, port: u16, handle: SelectorHandle, client_fd: RawFd) -> u64 {
        let job_id = self.inner.slots.lock().expect("resolver table poisoned").insert(None) as u64;
        let inner = self.inner.clone();

        thread::spawn(move || {
            let outcome = match (host.as_str(), port).to_socket_addrs() {
                Ok(it) => ResolveOutcome::Addresses(it.collect()),
                Err(_) => ResolveOutcome::Failed,
            };
            let mut slots = inner.slots.lock().expect("resolver table poisoned");
            if let Some(slot) = slots.get_mut(job_id as usize) {
                *slot = Some(outcome);
            }
            drop(slots);
            handle.notify_block(client_fd);
        });

        job_id
    }

    /// Removes and returns the outcome for `job_id`, if the worker has
    /// already posted it. A job still in flight (slot holds `None`) is left
    /// in place rather than removed.
    pub fn take(&self, job_id: u64) -> Option<ResolveOutcome> {
        let mut slots = self.inner.slots.lock().expect("resolver table poisoned");
        let key = job_id as usize;
        match slots.get(key) {
            Some(Some(_)) => {
                let slot = slots.remove(key);
                slot
            }
            _ => None,
        }
    }
}

impl Default for ResolverTable {
    fn default() -> ResolverTable {
        ResolverTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::Selector;

    #[test]
    fn take_before_completion_returns_none() {
        let table = ResolverTable::new();
        let selector = Selector::new(4).unwrap();
        let job_id = table.spawn("127.0.0.1".to_string(), 80, selector.handle(), -1);
        // The worker may not have run yet; either outcome (None, or Some
        // once it lands) is valid, but take() must never panic on a
        // reserved-but-empty slot.
        let _ = table.take(job_id);
    }
}
