//! Correlation registry for tool-call results.
//!
//! Every command the dispatcher publishes carries a fresh request id. The
//! MQTT callback that later sees the result completes the matching waiter;
//! the dispatcher blocks on its own request only, with a bounded wait.

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, sync_channel};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

pub struct PendingTools {
    waiters: Mutex<HashMap<String, SyncSender<String>>>,
}

impl PendingTools {
    pub fn new() -> Self {
        Self { waiters: Mutex::new(HashMap::new()) }
    }

    /// Register a request id and obtain the receiver the dispatcher will
    /// block on.
    pub fn register(&self, request_id: &str) -> Receiver<String> {
        let (tx, rx) = sync_channel(1);
        self.waiters.lock().insert(request_id.to_string(), tx);
        rx
    }

    /// Deliver a result. Returns false when nobody is waiting (late or
    /// unknown id); the result is dropped in that case.
    pub fn complete(&self, request_id: &str, value: String) -> bool {
        match self.waiters.lock().remove(request_id) {
            Some(tx) => tx.try_send(value).is_ok(),
            None => {
                debug!("No waiter for request id {}", request_id);
                false
            }
        }
    }

    /// Forget a request after a timeout so a late result cannot pile up.
    pub fn cancel(&self, request_id: &str) {
        self.waiters.lock().remove(request_id);
    }

    /// Block for the result of one request.
    pub fn wait(&self, request_id: &str, rx: &Receiver<String>, timeout: Duration) -> Option<String> {
        match rx.recv_timeout(timeout) {
            Ok(value) => Some(value),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                self.cancel(request_id);
                None
            }
        }
    }
}

impl Default for PendingTools {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn result_reaches_the_waiter() {
        let pending = Arc::new(PendingTools::new());
        let rx = pending.register("req-1");

        let completer = {
            let pending = pending.clone();
            std::thread::spawn(move || {
                assert!(pending.complete("req-1", "ok".into()));
            })
        };

        assert_eq!(pending.wait("req-1", &rx, Duration::from_secs(5)), Some("ok".into()));
        completer.join().unwrap();
    }

    #[test]
    fn timeout_cancels_the_waiter() {
        let pending = PendingTools::new();
        let rx = pending.register("req-2");
        assert_eq!(pending.wait("req-2", &rx, Duration::from_millis(10)), None);
        // Late result finds nobody.
        assert!(!pending.complete("req-2", "late".into()));
    }

    #[test]
    fn unknown_id_is_dropped() {
        let pending = PendingTools::new();
        assert!(!pending.complete("never-registered", "x".into()));
    }
}
