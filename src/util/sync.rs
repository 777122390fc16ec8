// src/util/sync.rs - Thread signalling primitives
//
// Core features:
// - Counting semaphore backed by a crossbeam channel of unit tokens
// - Manual-reset event with timed waits

use super::lock;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Outcome of a timed wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Signaled,
    TimedOut,
}

/// Counting semaphore. Every `post` releases exactly one `wait`.
#[derive(Debug, Clone)]
pub struct Semaphore {
    sender: Sender<()>,
    receiver: Receiver<()>,
}

impl Semaphore {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self { sender, receiver }
    }

    pub fn post(&self) {
        // Both ends live in self, the channel cannot be disconnected.
        let _ = self.sender.send(());
    }

    pub fn wait(&self) {
        let _ = self.receiver.recv();
    }

    pub fn wait_timeout(&self, timeout: Duration) -> WaitResult {
        match self.receiver.recv_timeout(timeout) {
            Ok(()) => WaitResult::Signaled,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => WaitResult::TimedOut,
        }
    }

    /// Drops every pending token.
    pub fn reset(&self) {
        while self.receiver.try_recv().is_ok() {}
    }

    pub fn pending(&self) -> usize {
        self.receiver.len()
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

/// Manual-reset event. Once set it stays signaled until `reset`.
#[derive(Debug)]
pub struct Event {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new(signaled: bool) -> Self {
        Self {
            signaled: Mutex::new(signaled),
            cond: Condvar::new(),
        }
    }

    pub fn set(&self) {
        let mut signaled = lock(&self.signaled);
        *signaled = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *lock(&self.signaled) = false;
    }

    pub fn is_set(&self) -> bool {
        *lock(&self.signaled)
    }

    pub fn wait(&self) {
        let mut signaled = lock(&self.signaled);
        while !*signaled {
            signaled = self.cond.wait(signaled).unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> WaitResult {
        let signaled = lock(&self.signaled);
        let (signaled, _) = self
            .cond
            .wait_timeout_while(signaled, timeout, |signaled| !*signaled)
            .unwrap_or_else(|e| e.into_inner());
        if *signaled {
            WaitResult::Signaled
        } else {
            WaitResult::TimedOut
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new(false)
    }
}
