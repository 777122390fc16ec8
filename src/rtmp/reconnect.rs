// src/rtmp/reconnect.rs - Reconnect scheduling
//
// Core features:
// - Exponential backoff (doubling, capped) with a retry limit
// - Stoppable timer thread; an explicit stop interrupts the wait immediately

use crate::util::sync::{Event, WaitResult};
use log::{debug, error};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Retry delays: `base`, then doubling up to `max_delay`, for at most `retry_max` attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max_delay: Duration,
    retry_max: u32,
    attempts: u32,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max_delay: Duration, retry_max: u32) -> Self {
        Self {
            base,
            max_delay,
            retry_max,
            attempts: 0,
            current: Duration::ZERO,
        }
    }

    /// The delay before the next attempt, or `None` once the retry limit is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.retry_max {
            return None;
        }
        self.current = if self.attempts == 0 {
            self.base.min(self.max_delay)
        } else {
            self.current.saturating_mul(2).min(self.max_delay)
        };
        self.attempts += 1;
        Some(self.current)
    }

    /// Number of attempts scheduled so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current = Duration::ZERO;
    }
}

/// One-shot timer thread that runs a callback unless stopped first.
pub struct ReconnectTimer {
    stop_event: Arc<Event>,
    handle: Option<JoinHandle<()>>,
}

impl ReconnectTimer {
    /// Spawns the timer. `on_expire` runs on the timer thread after `delay` unless
    /// [`stop`](ReconnectTimer::stop) is called first.
    pub fn start<F>(delay: Duration, on_expire: F) -> crate::error::Result<ReconnectTimer>
    where
        F: FnOnce() + Send + 'static,
    {
        let stop_event = Arc::new(Event::new(false));
        let event = stop_event.clone();
        let result = std::thread::Builder::new()
            .name("rtmp-reconnect".to_string())
            .spawn(move || {
                if event.wait_timeout(delay) == WaitResult::Signaled {
                    debug!("Reconnect wait interrupted");
                    return;
                }
                on_expire();
            });

        match result {
            Ok(handle) => Ok(ReconnectTimer {
                stop_event,
                handle: Some(handle),
            }),
            Err(e) => {
                error!("Reconnect thread exited with error: {e}");
                Err(crate::error::OutputError::ThreadExited.into())
            }
        }
    }

    /// Wakes the timer thread early without running the callback.
    pub fn signal_stop(&self) {
        self.stop_event.set();
    }

    /// Signals and joins the timer thread.
    ///
    /// Must not be called from the callback itself.
    pub fn stop(mut self) {
        self.signal_stop();
        self.join();
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("Reconnect thread panicked");
            }
        }
    }
}

impl Drop for ReconnectTimer {
    fn drop(&mut self) {
        self.signal_stop();
        self.join();
    }
}
