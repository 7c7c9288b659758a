//! Supervised thread-per-connection execution.
//!
//! Every connection gets its own named thread, but threads are never
//! detached: the supervisor keeps their handles, reaps finished ones on each
//! spawn, caps how many run at once, and joins the rest on shutdown.

use std::io;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{error, trace};

/// Counts running connection threads and wakes waiters when one exits.
#[derive(Default)]
struct Slots {
    active: Mutex<usize>,
    freed: Condvar,
}

impl Slots {
    fn acquire(&self, limit: usize) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        while *active >= limit {
            active = self
                .freed
                .wait(active)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *active += 1;
    }

    fn release(&self) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        *active = active.saturating_sub(1);
        self.freed.notify_one();
    }

    fn active(&self) -> usize {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases a slot when the connection thread exits, panicking or not.
struct SlotGuard(Arc<Slots>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Owns one thread per connection, at most `limit` at a time.
pub struct Supervisor {
    slots: Arc<Slots>,
    limit: usize,
    handles: Vec<JoinHandle<()>>,
    spawned: u64,
}

impl Supervisor {
    pub fn new(limit: usize) -> Self {
        Self {
            slots: Arc::new(Slots::default()),
            limit: limit.max(1),
            handles: Vec::new(),
            spawned: 0,
        }
    }

    /// Run `job` on a new thread, waiting for a free slot first.
    pub fn spawn<F>(&mut self, job: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.reap();
        self.slots.acquire(self.limit);

        let guard = SlotGuard(Arc::clone(&self.slots));
        let name = format!("conn-{}", self.spawned);
        self.spawned += 1;

        // On spawn failure the closure and its guard are dropped, freeing the slot.
        let handle = thread::Builder::new().name(name).spawn(move || {
            let _guard = guard;
            job();
        })?;
        self.handles.push(handle);
        Ok(())
    }

    /// Threads currently running.
    pub fn active(&self) -> usize {
        self.slots.active()
    }

    /// Handles not yet joined.
    pub fn tracked(&self) -> usize {
        self.handles.len()
    }

    /// Join threads that have already finished.
    pub fn reap(&mut self) {
        let mut index = 0;
        while index < self.handles.len() {
            if self.handles[index].is_finished() {
                let handle = self.handles.swap_remove(index);
                join(handle);
            } else {
                index += 1;
            }
        }
    }

    /// Join every connection thread.
    pub fn shutdown(&mut self) {
        for handle in self.handles.drain(..) {
            join(handle);
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn join(handle: JoinHandle<()>) {
    let name = handle.thread().name().unwrap_or("conn").to_string();
    if handle.join().is_err() {
        error!(thread = %name, "Connection thread panicked");
    } else {
        trace!(thread = %name, "Connection thread joined");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_limit_blocks_until_slot_frees() {
        let mut supervisor = Supervisor::new(1);
        let (release_tx, release_rx) = mpsc::channel::<()>();

        supervisor
            .spawn(move || {
                let _ = release_rx.recv();
            })
            .unwrap();
        assert_eq!(supervisor.active(), 1);

        let started = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&started);
        let waiter = thread::spawn(move || {
            supervisor
                .spawn(move || {
                    observed.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            supervisor
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(started.load(Ordering::SeqCst), 0);

        release_tx.send(()).unwrap();
        let mut supervisor = waiter.join().unwrap();
        supervisor.shutdown();
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.active(), 0);
        assert_eq!(supervisor.tracked(), 0);
    }

    #[test]
    fn test_reap_joins_finished_threads() {
        let mut supervisor = Supervisor::new(8);
        for _ in 0..4 {
            supervisor.spawn(|| {}).unwrap();
        }

        while supervisor.active() > 0 {
            thread::sleep(Duration::from_millis(1));
        }
        // Slot release happens just before the thread finishes.
        while supervisor.handles.iter().any(|h| !h.is_finished()) {
            thread::sleep(Duration::from_millis(1));
        }
        supervisor.reap();
        assert_eq!(supervisor.tracked(), 0);
    }

    #[test]
    fn test_panic_frees_slot() {
        let mut supervisor = Supervisor::new(1);
        supervisor.spawn(|| panic!("session bug")).unwrap();
        supervisor.shutdown();
        assert_eq!(supervisor.active(), 0);

        // The slot is usable again.
        supervisor.spawn(|| {}).unwrap();
        supervisor.shutdown();
    }
}
