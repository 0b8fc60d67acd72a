use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use fixture_core::driver::Endpoint;
use tracing::{debug, warn};

use crate::broker::ConnectionHandle;

type Cleanup<H> = Box<dyn FnOnce(&H) -> anyhow::Result<()> + Send>;

/// What one test case sees: the shared handle plus the cleanups it queued.
///
/// Cleanups run last-in first-out when the case finishes, before its worker
/// slot is released; if nothing runs them explicitly they run on drop.
pub struct TestCaseContext<H> {
    name: String,
    handle: ConnectionHandle<H>,
    cleanups: Vec<(String, Cleanup<H>)>,
}

impl<H> TestCaseContext<H> {
    pub fn new(name: impl Into<String>, handle: ConnectionHandle<H>) -> Self {
        Self {
            name: name.into(),
            handle,
            cleanups: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &ConnectionHandle<H> {
        &self.handle
    }

    pub fn client(&self) -> &H {
        self.handle.client()
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.handle.endpoint()
    }

    /// Queue `cleanup` to run against the client when the case ends.
    pub fn defer<F>(&mut self, label: impl Into<String>, cleanup: F)
    where
        F: FnOnce(&H) -> anyhow::Result<()> + Send + 'static,
    {
        self.cleanups.push((label.into(), Box::new(cleanup)));
    }

    pub fn pending_cleanups(&self) -> usize {
        self.cleanups.len()
    }

    /// Run queued cleanups newest first. Every cleanup runs even if an
    /// earlier one fails or panics; the failures are returned.
    pub fn run_cleanups(&mut self) -> Vec<String> {
        let mut failures = Vec::new();
        while let Some((label, cleanup)) = self.cleanups.pop() {
            let client = self.handle.client();
            match panic::catch_unwind(AssertUnwindSafe(|| cleanup(client))) {
                Ok(Ok(())) => debug!("Cleanup '{}' of case '{}' done", label, self.name),
                Ok(Err(e)) => failures.push(format!("{}: {:#}", label, e)),
                Err(payload) => {
                    failures.push(format!("{}: panicked: {}", label, panic_message(&*payload)))
                }
            }
        }
        for failure in &failures {
            warn!("Cleanup of case '{}' failed: {}", self.name, failure);
        }
        failures
    }
}

impl<H> Drop for TestCaseContext<H> {
    fn drop(&mut self) {
        if !self.cleanups.is_empty() {
            self.run_cleanups();
        }
    }
}

impl<H> fmt::Debug for TestCaseContext<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCaseContext")
            .field("name", &self.name)
            .field("endpoint", self.handle.endpoint())
            .field("pending_cleanups", &self.cleanups.len())
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn context() -> TestCaseContext<Mutex<Vec<String>>> {
        let handle =
            ConnectionHandle::new(Mutex::new(Vec::new()), Endpoint::new("127.0.0.1", 1, 1));
        TestCaseContext::new("case", handle)
    }

    #[test]
    fn test_cleanups_run_lifo() {
        let mut ctx = context();
        for label in ["first", "second", "third"] {
            ctx.defer(label, move |log: &Mutex<Vec<String>>| {
                log.lock().unwrap().push(label.to_string());
                Ok(())
            });
        }
        assert_eq!(ctx.pending_cleanups(), 3);
        assert!(ctx.run_cleanups().is_empty());
        assert_eq!(*ctx.client().lock().unwrap(), vec!["third", "second", "first"]);
        assert_eq!(ctx.pending_cleanups(), 0);
    }

    #[test]
    fn test_failing_cleanup_does_not_stop_the_rest() {
        let mut ctx = context();
        ctx.defer("ok", |log: &Mutex<Vec<String>>| {
            log.lock().unwrap().push("ok".into());
            Ok(())
        });
        ctx.defer("boom", |_: &Mutex<Vec<String>>| panic!("cleanup exploded"));
        ctx.defer("err", |_: &Mutex<Vec<String>>| anyhow::bail!("row still referenced"));

        let failures = ctx.run_cleanups();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0], "err: row still referenced");
        assert!(failures[1].contains("cleanup exploded"));
        assert_eq!(*ctx.client().lock().unwrap(), vec!["ok"]);
    }

    #[test]
    fn test_drop_runs_pending_cleanups() {
        let seen = Arc::new(Mutex::new(false));
        {
            let mut ctx = context();
            let flag = Arc::clone(&seen);
            ctx.defer("flag", move |_: &Mutex<Vec<String>>| {
                *flag.lock().unwrap() = true;
                Ok(())
            });
        }
        assert!(*seen.lock().unwrap());
    }
}
