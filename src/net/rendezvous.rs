//! Single-request rendezvous between the gateway and the state machine.
//!
//! The gateway submits decoded PCM and blocks for a synthesized reply; the
//! state machine picks the request up at its next iteration boundary and
//! completes it. Ownership crosses the slot in both directions: the PCM
//! moves in with the request, the reply WAV moves out with the completion.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Audio submitted by a network client.
#[derive(Debug)]
pub struct NetworkRequest {
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
    pub client: String,
}

#[derive(Default)]
struct SlotState {
    request: Option<NetworkRequest>,
    result: Option<Vec<u8>>,
    complete: bool,
    in_flight: bool,
}

/// Error returned to a gateway worker that tried to submit while another
/// request was unresolved.
#[derive(Debug, PartialEq, Eq)]
pub struct SlotBusy;

pub struct RendezvousSlot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

impl RendezvousSlot {
    pub fn new() -> Self {
        Self { state: Mutex::new(SlotState::default()), cond: Condvar::new() }
    }

    /// Place a request in the slot. At most one request may be in flight;
    /// a second submission is rejected immediately.
    pub fn submit(&self, request: NetworkRequest) -> Result<(), SlotBusy> {
        let mut state = self.state.lock().unwrap();
        if state.in_flight {
            return Err(SlotBusy);
        }
        state.request = Some(request);
        state.result = None;
        state.complete = false;
        state.in_flight = true;
        Ok(())
    }

    /// True when a request is waiting for the state machine.
    pub fn pending(&self) -> bool {
        self.state.lock().unwrap().request.is_some()
    }

    /// Take the pending request, transferring PCM ownership to the caller.
    pub fn take_request(&self) -> Option<NetworkRequest> {
        self.state.lock().unwrap().request.take()
    }

    /// Publish the reply and wake the waiting gateway worker.
    pub fn complete(&self, result: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        state.result = Some(result);
        state.complete = true;
        self.cond.notify_all();
    }

    /// Answer a request without ever taking it (busy replies). Clears the
    /// pending request so the state machine never sees it.
    pub fn reject_with(&self, result: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        state.request = None;
        state.result = Some(result);
        state.complete = true;
        self.cond.notify_all();
    }

    /// Block until the state machine completes the request, up to `timeout`.
    ///
    /// Returns `None` on timeout; either way the slot is freed for the next
    /// submission before returning.
    pub fn wait_result(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while !state.complete {
            let remaining = deadline.checked_duration_since(Instant::now()).unwrap_or_default();
            let (next, wait) = self.cond.wait_timeout(state, remaining).unwrap();
            state = next;
            if wait.timed_out() && !state.complete {
                // Orphan the request so a late completion does not leak into
                // the next session.
                state.request = None;
                state.result = None;
                state.in_flight = false;
                return None;
            }
        }
        let result = state.result.take();
        state.complete = false;
        state.in_flight = false;
        result
    }
}

impl Default for RendezvousSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn request(label: &str) -> NetworkRequest {
        NetworkRequest { pcm: vec![0u8; 64], sample_rate: 16_000, client: label.to_string() }
    }

    #[test]
    fn second_submission_is_rejected() {
        let slot = RendezvousSlot::new();
        slot.submit(request("a")).unwrap();
        assert_eq!(slot.submit(request("b")), Err(SlotBusy));
    }

    #[test]
    fn round_trip_across_threads() {
        let slot = Arc::new(RendezvousSlot::new());
        slot.submit(request("client")).unwrap();

        let worker = {
            let slot = slot.clone();
            std::thread::spawn(move || {
                let req = slot.take_request().expect("request should be pending");
                assert_eq!(req.client, "client");
                slot.complete(vec![1, 2, 3]);
            })
        };

        let reply = slot.wait_result(Duration::from_secs(5)).expect("reply");
        worker.join().unwrap();
        assert_eq!(reply, vec![1, 2, 3]);

        // Slot is free again.
        assert!(slot.submit(request("next")).is_ok());
    }

    #[test]
    fn timeout_frees_the_slot() {
        let slot = RendezvousSlot::new();
        slot.submit(request("slow")).unwrap();
        assert!(slot.wait_result(Duration::from_millis(20)).is_none());
        assert!(slot.submit(request("retry")).is_ok());
    }

    #[test]
    fn rejection_clears_the_pending_request() {
        let slot = RendezvousSlot::new();
        slot.submit(request("busy")).unwrap();
        slot.reject_with(vec![9]);
        assert!(!slot.pending());
        assert_eq!(slot.wait_result(Duration::from_millis(10)), Some(vec![9]));
    }
}
