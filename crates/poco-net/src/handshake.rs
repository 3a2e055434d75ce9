//! Pending peer handshake bookkeeping.
//!
//! Both ends of a peer channel run the same exchange: the initiator
//! sends `"peer setup"` and records the id of the reciprocal request it
//! expects back; a side receiving a setup whose id it already holds
//! treats that setup as the answer, confirms with `"peer connected"`,
//! and completes. A setup with no recorded id is itself recorded so a
//! listening channel can answer it. Ids are `"{target}-{initiator}"`
//! strings and the book lives for exactly one relay connection.
//!
//! The simultaneous-open race needs no coordinator: when both sides dial
//! at once, each side finds its recorded id matched by the other's setup
//! and confirms; redundant confirmations are absorbed by the channel's
//! monotone status.

use std::collections::HashSet;

use crate::Address;

fn request_id(target: &Address, initiator: &Address) -> String {
    format!("{target}-{initiator}")
}

/// What an inbound `"peer setup"` turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SetupDisposition {
    /// The answer to a request we recorded: confirm and complete.
    Matched,
    /// A new request, now recorded; a listening channel may answer it.
    Recorded,
}

/// Pending handshake ids of one relay connection.
#[derive(Debug, Default)]
pub(crate) struct HandshakeBook {
    pending: HashSet<String>,
}

impl HandshakeBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the reciprocal id; call before sending our setup to `remote`.
    pub fn begin(&mut self, local: &Address, remote: &Address) {
        self.pending.insert(request_id(local, remote));
    }

    /// Apply an inbound setup `from → to`, where `to` is our address.
    pub fn on_setup(&mut self, from: &Address, to: &Address) -> SetupDisposition {
        if self.pending.remove(&request_id(to, from)) {
            SetupDisposition::Matched
        } else {
            self.pending.insert(request_id(to, from));
            SetupDisposition::Recorded
        }
    }

    /// Drop the pair's entry once the channel completes, fails, or is
    /// destroyed.
    pub fn settle(&mut self, local: &Address, remote: &Address) {
        self.pending.remove(&request_id(local, remote));
    }

    /// Forget every in-flight handshake. Used when the relay link ends.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    // ── Direct unit coverage ─────────────────────────────────────────

    #[test]
    fn initiator_id_matches_the_answering_setup() {
        let mut book = HandshakeBook::new();
        let (local, remote) = (addr("alice"), addr("bob"));

        book.begin(&local, &remote);
        assert_eq!(book.on_setup(&remote, &local), SetupDisposition::Matched);
        assert!(book.is_empty());
    }

    #[test]
    fn unknown_setup_is_recorded_once() {
        let mut book = HandshakeBook::new();
        let (local, remote) = (addr("alice"), addr("bob"));

        assert_eq!(book.on_setup(&remote, &local), SetupDisposition::Recorded);
        assert_eq!(book.len(), 1);
        // The duplicate consumes the recorded id and matches.
        assert_eq!(book.on_setup(&remote, &local), SetupDisposition::Matched);
        assert!(book.is_empty());
    }

    #[test]
    fn settle_clears_a_stale_request() {
        let mut book = HandshakeBook::new();
        let (local, remote) = (addr("alice"), addr("bob"));

        book.begin(&local, &remote);
        book.settle(&local, &remote);
        assert!(book.is_empty());
        // With nothing pending the same setup is a fresh request.
        assert_eq!(book.on_setup(&remote, &local), SetupDisposition::Recorded);
    }

    #[test]
    fn pairs_do_not_collide_across_peers() {
        let mut book = HandshakeBook::new();
        let local = addr("alice");
        book.begin(&local, &addr("bob"));
        assert_eq!(book.on_setup(&addr("carol"), &local), SetupDisposition::Recorded);
        assert_eq!(book.len(), 2);
    }

    // ── Exchange simulation ──────────────────────────────────────────
    //
    // Two sides exchanging setup/confirm messages through reorderable
    // queues, driven by an arbitrary delivery schedule. Mirrors the glue
    // in relay.rs: Matched sends a confirm and completes; Recorded
    // auto-answers if the side has not begun.

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Message {
        Setup,
        Confirm,
    }

    struct Side {
        address: Address,
        book: HandshakeBook,
        begun: bool,
        completions: usize,
        outbox: Vec<Message>,
    }

    impl Side {
        fn new(name: &str) -> Self {
            Side {
                address: addr(name),
                book: HandshakeBook::new(),
                begun: false,
                completions: 0,
                outbox: Vec::new(),
            }
        }

        fn initiate(&mut self, remote: &Address) {
            self.begun = true;
            self.book.begin(&self.address, remote);
            self.outbox.push(Message::Setup);
        }

        fn complete(&mut self, remote: &Address) {
            // Monotone status: only the first completion counts.
            if self.completions == 0 {
                self.completions = 1;
            }
            self.book.settle(&self.address, remote);
        }

        fn deliver(&mut self, message: Message, remote: &Address) {
            let local = self.address.clone();
            match message {
                Message::Setup => match self.book.on_setup(remote, &local) {
                    SetupDisposition::Matched => {
                        self.outbox.push(Message::Confirm);
                        self.complete(remote);
                    }
                    SetupDisposition::Recorded => {
                        if !self.begun {
                            self.initiate(remote);
                        }
                    }
                },
                Message::Confirm => self.complete(remote),
            }
        }
    }

    fn run_exchange(both_initiate: bool, schedule: &[bool], duplicate_setup: bool) -> (Side, Side) {
        let mut alice = Side::new("alice");
        let mut bob = Side::new("bob");
        let bob_addr = bob.address.clone();
        let alice_addr = alice.address.clone();

        alice.initiate(&bob_addr);
        if duplicate_setup {
            alice.outbox.push(Message::Setup);
        }
        if both_initiate {
            bob.initiate(&alice_addr);
        }

        // In-flight messages, delivered in order per direction.
        let mut to_bob: Vec<Message> = Vec::new();
        let mut to_alice: Vec<Message> = Vec::new();
        let mut step = 0usize;
        loop {
            to_bob.extend(alice.outbox.drain(..));
            to_alice.extend(bob.outbox.drain(..));
            if to_bob.is_empty() && to_alice.is_empty() {
                break;
            }
            // Schedule bit picks which direction delivers next.
            let deliver_to_bob = match (to_bob.is_empty(), to_alice.is_empty()) {
                (false, true) => true,
                (true, false) => false,
                _ => *schedule.get(step).unwrap_or(&true),
            };
            step += 1;
            if deliver_to_bob {
                let msg = to_bob.remove(0);
                bob.deliver(msg, &alice_addr);
            } else {
                let msg = to_alice.remove(0);
                alice.deliver(msg, &bob_addr);
            }
        }
        (alice, bob)
    }

    proptest! {
        #[test]
        fn simultaneous_open_completes_each_side_exactly_once(
            schedule in prop::collection::vec(any::<bool>(), 0..32),
        ) {
            let (alice, bob) = run_exchange(true, &schedule, false);
            prop_assert_eq!(alice.completions, 1);
            prop_assert_eq!(bob.completions, 1);
            prop_assert!(alice.book.is_empty());
            prop_assert!(bob.book.is_empty());
        }

        #[test]
        fn single_initiator_with_listening_answerer_converges(
            schedule in prop::collection::vec(any::<bool>(), 0..32),
            duplicate in any::<bool>(),
        ) {
            let (alice, bob) = run_exchange(false, &schedule, duplicate);
            prop_assert_eq!(alice.completions, 1);
            prop_assert_eq!(bob.completions, 1);
            prop_assert!(alice.book.is_empty());
            prop_assert!(bob.book.is_empty());
        }
    }
}
