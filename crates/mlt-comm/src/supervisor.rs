//! Channel-thread plumbing: a supervisor owning one worker thread and its
//! terminate flag, and a mailbox that pairs a queue sender with the worker's
//! poll waker so producers never leave a reactor sleeping on full queues.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use mio::{Token, Waker};

/// Token reserved for the poll waker on every channel reactor.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

// ─── Mailbox ────────────────────────────────────────────────────────────────

/// A channel sender that kicks the consumer's reactor awake after each push.
pub(crate) struct Mailbox<T> {
    tx: Sender<T>,
    waker: Arc<Waker>,
}

impl<T> Mailbox<T> {
    pub fn new(tx: Sender<T>, waker: Arc<Waker>) -> Self {
        Mailbox { tx, waker }
    }

    /// Push and wake. A send can only fail once the worker has exited, in
    /// which case the message is dropped.
    pub fn send(&self, msg: T) {
        if self.tx.send(msg).is_err() {
            tracing::trace!("mailbox consumer has exited, dropping message");
            return;
        }
        if let Err(err) = self.waker.wake() {
            tracing::warn!(%err, "failed to wake channel reactor");
        }
    }
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Mailbox {
            tx: self.tx.clone(),
            waker: self.waker.clone(),
        }
    }
}

// ─── Supervisor ─────────────────────────────────────────────────────────────

/// Spawns a named worker thread and holds its join handle plus the shared
/// terminate flag. Workers observe the flag once per loop iteration and exit
/// at the next one.
pub(crate) struct Supervisor {
    name: &'static str,
    terminated: Arc<AtomicBool>,
    waker: Arc<Waker>,
    handle: Option<JoinHandle<()>>,
}

impl Supervisor {
    pub fn spawn<F>(name: &'static str, waker: Arc<Waker>, body: F) -> io::Result<Self>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let terminated = Arc::new(AtomicBool::new(false));
        let flag = terminated.clone();
        let handle = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || body(flag))?;
        Ok(Supervisor {
            name,
            terminated,
            waker,
            handle: Some(handle),
        })
    }

    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::Relaxed);
        if let Err(err) = self.waker.wake() {
            tracing::warn!(worker = self.name, %err, "failed to wake for shutdown");
        }
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!(worker = self.name, "worker thread panicked");
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.terminate();
        self.join();
    }
}
