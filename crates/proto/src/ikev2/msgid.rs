//! Message-ID windowing and retransmission detection
//!
//! Each IKE SA keeps four counters (RFC 7296 Section 2.3): the highest
//! response we accepted (`lastack`), the next request ID we will mint
//! (`nextuse`), the highest request we received (`lastrecv`) and the
//! highest request we answered (`lastreplied`). A counter is `None`
//! until the first event of its kind.

/// Per-SA Message-ID state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MsgidState {
    /// Highest message ID whose response we accepted
    pub lastack: Option<u32>,

    /// Next message ID we will mint for an outbound request
    pub nextuse: u32,

    /// Highest message ID received as a request
    pub lastrecv: Option<u32>,

    /// Highest message ID we replied to
    pub lastreplied: Option<u32>,
}

/// What to do with an incoming request's message ID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestDisposition {
    /// New request; dispatch it
    Fresh,
    /// Below the window; drop and log
    OldDuplicate,
    /// Duplicate of the current request but its reply is still being
    /// computed; drop silently
    ReplyPending,
    /// Duplicate of an answered request; re-emit the recorded response
    Retransmit,
}

/// What to do with an incoming response's message ID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseDisposition {
    /// Response to our outstanding request; dispatch it
    Fresh,
    /// Already acknowledged; drop
    OldResponse,
    /// Answers a request we never sent; drop
    Unsolicited,
}

impl MsgidState {
    /// Fresh counters for a new SA
    pub fn new() -> Self {
        MsgidState::default()
    }

    /// Classify an incoming request
    pub fn request_disposition(&self, m: u32) -> RequestDisposition {
        match self.lastrecv {
            Some(lastrecv) if m < lastrecv => RequestDisposition::OldDuplicate,
            Some(lastrecv) if m == lastrecv => {
                // No recorded reply yet means a CHILD SA is still
                // working on it.
                if self.lastreplied.map_or(true, |r| r < lastrecv) {
                    RequestDisposition::ReplyPending
                } else {
                    RequestDisposition::Retransmit
                }
            }
            _ => RequestDisposition::Fresh,
        }
    }

    /// Classify an incoming response
    pub fn response_disposition(&self, m: u32) -> ResponseDisposition {
        if let Some(lastack) = self.lastack {
            if m <= lastack {
                return ResponseDisposition::OldResponse;
            }
        }
        if m >= self.nextuse {
            return ResponseDisposition::Unsolicited;
        }
        ResponseDisposition::Fresh
    }

    /// A request with ID `m` was accepted and dispatched
    pub fn note_request_accepted(&mut self, m: u32) {
        if self.lastrecv.map_or(true, |lastrecv| m > lastrecv) {
            self.lastrecv = Some(m);
        }
        self.assert_invariants();
    }

    /// A response with ID `m` was accepted
    pub fn note_response_accepted(&mut self, m: u32) {
        if self.lastack.map_or(true, |lastack| m > lastack) {
            self.lastack = Some(m);
        }
        self.assert_invariants();
    }

    /// The response to the current request went out
    pub fn note_replied(&mut self) {
        self.lastreplied = self.lastrecv;
        self.assert_invariants();
    }

    /// We emitted a request; mint the next ID
    pub fn note_request_sent(&mut self) {
        self.nextuse += 1;
        self.assert_invariants();
    }

    /// Message ID we would use for the next outbound request
    pub fn next_outbound(&self) -> u32 {
        self.nextuse
    }

    /// Reset after a COOKIE restart, as if no exchange had happened
    pub fn restart(&mut self) {
        *self = MsgidState::new();
    }

    /// Open request slots given the window size
    pub fn window_open(&self, window_size: u32) -> bool {
        self.unacknowledged() < window_size as u64
    }

    /// Requests in flight without an accepted response
    pub fn unacknowledged(&self) -> u64 {
        let acked = match self.lastack {
            Some(lastack) => lastack as i64,
            None => -1,
        };
        (self.nextuse as i64 - acked - 1).max(0) as u64
    }

    fn assert_invariants(&self) {
        if let Some(lastack) = self.lastack {
            debug_assert!((lastack as u64) < self.nextuse as u64 + 1);
        }
        if let (Some(lastreplied), Some(lastrecv)) = (self.lastreplied, self.lastrecv) {
            debug_assert!(lastreplied <= lastrecv);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let state = MsgidState::new();
        assert_eq!(state.lastack, None);
        assert_eq!(state.lastrecv, None);
        assert_eq!(state.lastreplied, None);
        assert_eq!(state.nextuse, 0);
        assert_eq!(state.unacknowledged(), 0);
        assert!(state.window_open(1));
    }

    #[test]
    fn test_first_request_is_fresh() {
        let state = MsgidState::new();
        assert_eq!(state.request_disposition(0), RequestDisposition::Fresh);
    }

    #[test]
    fn test_request_dispositions() {
        let mut state = MsgidState::new();
        state.note_request_accepted(2);

        // Older than the current request
        assert_eq!(state.request_disposition(1), RequestDisposition::OldDuplicate);

        // Same ID before we replied: the answer is still being computed
        assert_eq!(state.request_disposition(2), RequestDisposition::ReplyPending);

        // Same ID after we replied: resend the recorded packet
        state.note_replied();
        assert_eq!(state.request_disposition(2), RequestDisposition::Retransmit);

        // Newer: process
        assert_eq!(state.request_disposition(3), RequestDisposition::Fresh);
    }

    #[test]
    fn test_response_dispositions() {
        let mut state = MsgidState::new();
        state.note_request_sent(); // nextuse = 1, msgid 0 outstanding

        assert_eq!(state.response_disposition(0), ResponseDisposition::Fresh);
        // We never sent msgid 1
        assert_eq!(state.response_disposition(1), ResponseDisposition::Unsolicited);

        state.note_response_accepted(0);
        assert_eq!(state.response_disposition(0), ResponseDisposition::OldResponse);
    }

    #[test]
    fn test_window_accounting() {
        let mut state = MsgidState::new();
        assert!(state.window_open(1));

        state.note_request_sent();
        assert_eq!(state.unacknowledged(), 1);
        assert!(!state.window_open(1));
        assert!(state.window_open(2));

        state.note_response_accepted(0);
        assert_eq!(state.unacknowledged(), 0);
        assert!(state.window_open(1));
    }

    #[test]
    fn test_counters_monotonic() {
        let mut state = MsgidState::new();
        state.note_request_accepted(5);
        state.note_request_accepted(3);
        assert_eq!(state.lastrecv, Some(5));

        state.nextuse = 10;
        state.note_response_accepted(7);
        state.note_response_accepted(2);
        assert_eq!(state.lastack, Some(7));
    }

    #[test]
    fn test_restart() {
        let mut state = MsgidState::new();
        state.note_request_sent();
        state.note_response_accepted(0);
        state.note_request_accepted(4);
        state.note_replied();

        state.restart();
        assert_eq!(state, MsgidState::new());
    }

    #[test]
    fn test_established_pair_after_init_auth() {
        // The counters both peers end up with after a clean
        // IKE_SA_INIT + IKE_AUTH pair, seen from the initiator.
        let mut initiator = MsgidState::new();
        initiator.note_request_sent(); // SA_INIT out, msgid 0
        initiator.note_response_accepted(0);
        initiator.note_request_sent(); // AUTH out, msgid 1
        initiator.note_response_accepted(1);

        assert_eq!(initiator.lastack, Some(1));
        assert_eq!(initiator.nextuse, 2);

        let mut responder = MsgidState::new();
        responder.note_request_accepted(0);
        responder.note_replied();
        responder.note_request_accepted(1);
        responder.note_replied();

        assert_eq!(responder.lastrecv, Some(1));
        assert_eq!(responder.lastreplied, Some(1));
    }
}
