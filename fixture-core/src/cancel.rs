//! Cooperative cancellation for blocking waits.
//!
//! A [`CancelToken`] is shared between the party doing a blocking wait (the
//! readiness gate polling a fixture) and parties that may need to cut that
//! wait short (a run-level deadline, a teardown triggered from another
//! thread). Sleeping through [`CancelToken::wait_timeout`] instead of
//! `thread::sleep` makes the cancellation take effect immediately.
//!
//! Tokens form a tree: a [`CancelToken::child`] observes its parent's
//! cancellation, while cancelling the child leaves the parent untouched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Wake-up channel shared by every token of one tree.
#[derive(Debug, Default)]
struct Signal {
    lock: Mutex<()>,
    wake: Condvar,
}

#[derive(Debug, Clone)]
pub struct CancelToken {
    /// This token's flag first, then its ancestors'.
    flags: Vec<Arc<AtomicBool>>,
    signal: Arc<Signal>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flags: vec![Arc::new(AtomicBool::new(false))],
            signal: Arc::new(Signal::default()),
        }
    }

    /// A token cancelled together with `self`, but which can also be
    /// cancelled on its own.
    pub fn child(&self) -> Self {
        let mut flags = Vec::with_capacity(self.flags.len() + 1);
        flags.push(Arc::new(AtomicBool::new(false)));
        flags.extend(self.flags.iter().cloned());
        Self {
            flags,
            signal: Arc::clone(&self.signal),
        }
    }

    /// Cancel the token and wake every waiter.
    pub fn cancel(&self) {
        if !self.flags[0].swap(true, Ordering::SeqCst) {
            let _guard = self.lock();
            self.signal.wake.notify_all();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flags.iter().any(|flag| flag.load(Ordering::SeqCst))
    }

    /// Sleep for up to `timeout`. Returns `true` if the token was (or became)
    /// cancelled, `false` if the full timeout elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock();
        while !self.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = match self.signal.wake.wait_timeout(guard, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Cancel this token once `deadline` has passed, unless it is cancelled
    /// earlier. The watcher thread exits as soon as the token is cancelled.
    pub fn cancel_after(&self, deadline: Duration) {
        let token = self.clone();
        let spawned = thread::Builder::new()
            .name("fixture-deadline".into())
            .spawn(move || {
                if !token.wait_timeout(deadline) {
                    tracing::warn!(
                        deadline_secs = deadline.as_secs_f64(),
                        "Run deadline reached, cancelling pending fixture waits"
                    );
                    token.cancel();
                }
            });
        if let Err(e) = spawned {
            tracing::warn!("Failed to spawn deadline watcher: {}", e);
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        match self.signal.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_timeout_elapses_when_not_cancelled() {
        let token = CancelToken::new();
        let start = Instant::now();
        assert!(!token.wait_timeout(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_cancel_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = thread::spawn(move || {
            let start = Instant::now();
            let cancelled = waiter.wait_timeout(Duration::from_secs(10));
            (cancelled, start.elapsed())
        });
        thread::sleep(Duration::from_millis(50));
        token.cancel();
        let (cancelled, elapsed) = handle.join().unwrap();
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_cancel_after_fires() {
        let token = CancelToken::new();
        token.cancel_after(Duration::from_millis(30));
        assert!(token.wait_timeout(Duration::from_secs(5)));
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_child_follows_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        let waiter = child.clone();
        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(30));
        parent.cancel();
        assert!(handle.join().unwrap());
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_child_cancel_leaves_parent_alone() {
        let parent = CancelToken::new();
        let first = parent.child();
        let second = parent.child();
        first.cancel();
        assert!(first.is_cancelled());
        assert!(!parent.is_cancelled());
        assert!(!second.wait_timeout(Duration::from_millis(20)));
    }
}
