//! Sequencer-based total ordering: the leader assigns monotonic `seq_no`s,
//! followers buffer out-of-order arrivals and deliver contiguously.
//!
//! The only place allowed to call the delivery sink — storage append and
//! any future subscriber both hang off `OrderingState::accept`.

use std::collections::{BTreeMap, HashSet, VecDeque};

use crate::common::{SeqNo, Term, DEDUP_WINDOW};
use crate::error::ClusterError;
use crate::wire::DeliveredChat;

/// Outcome of feeding one `SEQ_CHAT` through the delivery path, for logging
/// and testing; the actual deliveries are reported via the `deliver`
/// callback passed to `OrderingState::accept`.
#[derive(Debug, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// Delivered immediately (and possibly drained some of the buffer with it).
    Delivered(usize),
    /// Out of order; parked in the buffer.
    Buffered,
    /// Dropped: duplicate, or at/under the high-water mark.
    Dropped(ClusterError),
}

pub struct OrderingState {
    last_seq: SeqNo,
    buffer: BTreeMap<SeqNo, DeliveredChat>,
    // Bounded ring of recently delivered (seq_no, term) pairs, purely for
    // distinguishing "duplicate" from "stale" in logs; `last_seq` alone
    // already guarantees the safety invariant.
    delivered_recent: VecDeque<(SeqNo, Term)>,
    delivered_recent_set: HashSet<(SeqNo, Term)>,
}

impl OrderingState {
    pub fn new(last_seq: SeqNo) -> Self {
        OrderingState {
            last_seq,
            buffer: BTreeMap::new(),
            delivered_recent: VecDeque::with_capacity(DEDUP_WINDOW),
            delivered_recent_set: HashSet::new(),
        }
    }

    pub fn last_seq(&self) -> SeqNo {
        self.last_seq
    }

    pub fn next_expected(&self) -> SeqNo {
        self.last_seq + 1
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    fn remember_delivered(&mut self, key: (SeqNo, Term)) {
        if self.delivered_recent_set.insert(key) {
            self.delivered_recent.push_back(key);
            if self.delivered_recent.len() > DEDUP_WINDOW {
                if let Some(old) = self.delivered_recent.pop_front() {
                    self.delivered_recent_set.remove(&old);
                }
            }
        }
    }

    /// Feeds one `SEQ_CHAT` through the delivery path. `deliver` is called,
    /// in order, for every message that becomes deliverable (the message
    /// itself, then any contiguous successors drained from the buffer).
    ///
    /// The moment `deliver` fails, draining stops immediately: `last_seq`
    /// is left at the last *successfully* delivered entry, the failed
    /// entry (and anything still behind it in the buffer) stays buffered
    /// for a later retry, and the error is propagated to the caller. This
    /// keeps a storage write failure from ever landing a higher seq_no
    /// durably while a lower one silently never does.
    pub fn accept(
        &mut self,
        chat: DeliveredChat,
        mut deliver: impl FnMut(&DeliveredChat) -> Result<(), ClusterError>,
    ) -> Result<AcceptOutcome, ClusterError> {
        let key = (chat.seq_no, chat.term);

        if chat.seq_no <= self.last_seq {
            let err = if self.delivered_recent_set.contains(&key) {
                ClusterError::Duplicate { seq_no: chat.seq_no, term: chat.term }
            } else {
                ClusterError::GapStale { seq_no: chat.seq_no, last_seq: self.last_seq }
            };
            return Ok(AcceptOutcome::Dropped(err));
        }

        if chat.seq_no > self.next_expected() {
            self.buffer.entry(chat.seq_no).or_insert(chat);
            return Ok(AcceptOutcome::Buffered);
        }

        // chat.seq_no == next_expected(): deliver, then drain the buffer.
        debug_assert_eq!(chat.seq_no, self.next_expected());
        deliver(&chat)?;
        self.remember_delivered(key);
        self.last_seq = chat.seq_no;
        let mut delivered_count = 1;

        while let Some(next) = self.buffer.get(&self.next_expected()).cloned() {
            deliver(&next)?;
            self.buffer.remove(&next.seq_no);
            self.remember_delivered((next.seq_no, next.term));
            self.last_seq = next.seq_no;
            delivered_count += 1;
        }

        Ok(AcceptOutcome::Delivered(delivered_count))
    }

    /// Leader-side: mints the next sequence number for a freshly accepted CHAT.
    pub fn next_seq_no(&self) -> SeqNo {
        self.last_seq + 1
    }
}

/// Decides whether a `SEQ_CHAT` carrying `msg_term` should be accepted
/// against `current_term`, and whether `current_term` needs to advance.
pub fn term_discipline(msg_term: Term, current_term: Term) -> TermDecision {
    if msg_term < current_term {
        TermDecision::Stale
    } else if msg_term > current_term {
        TermDecision::Advance(msg_term)
    } else {
        TermDecision::Accept
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum TermDecision {
    Stale,
    Accept,
    Advance(Term),
}

fn chat(seq_no: SeqNo, term: Term, payload: &str) -> DeliveredChat {
    DeliveredChat {
        seq_no,
        term,
        origin_sender_id: 1,
        msg_id: format!("m{seq_no}"),
        room_id: "general".into(),
        payload: payload.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // S1 — in-order delivery.
    #[test]
    fn in_order_delivery() {
        let mut state = OrderingState::new(0);
        let mut delivered = Vec::new();
        for (seq, text) in [(1, "a"), (2, "b"), (3, "c")] {
            state.accept(chat(seq, 1, text), |c| Ok(delivered.push(c.payload.clone()))).unwrap();
        }
        assert_eq!(delivered, vec!["a", "b", "c"]);
        assert_eq!(state.last_seq(), 3);
        assert_eq!(state.buffer_len(), 0);
    }

    // S2 — out-of-order buffering.
    #[test]
    fn out_of_order_buffering_drains_in_order() {
        let mut state = OrderingState::new(0);
        let mut delivered = Vec::new();
        let mut push = |c: &DeliveredChat| Ok(delivered.push(c.payload.clone()));

        assert_eq!(state.accept(chat(3, 1, "c"), &mut push).unwrap(), AcceptOutcome::Buffered);
        assert!(delivered.is_empty());
        assert_eq!(state.accept(chat(1, 1, "a"), &mut push).unwrap(), AcceptOutcome::Delivered(1));
        assert_eq!(delivered, vec!["a"]);
        // Delivering 2 should drain 2 and then 3 from the buffer.
        assert_eq!(state.accept(chat(2, 1, "b"), &mut push).unwrap(), AcceptOutcome::Delivered(2));
        assert_eq!(delivered, vec!["a", "b", "c"]);
        assert_eq!(state.last_seq(), 3);
        assert_eq!(state.buffer_len(), 0);
    }

    // S3 — duplicate drop.
    #[test]
    fn duplicate_delivery_is_dropped() {
        let mut state = OrderingState::new(0);
        let mut delivered = Vec::new();
        state.accept(chat(1, 1, "a"), |c| Ok(delivered.push(c.payload.clone()))).unwrap();
        let outcome = state.accept(chat(1, 1, "a"), |c| Ok(delivered.push(c.payload.clone()))).unwrap();
        assert!(matches!(outcome, AcceptOutcome::Dropped(ClusterError::Duplicate { .. })));
        assert_eq!(delivered, vec!["a"]);
    }

    #[test]
    fn stale_below_last_seq_is_dropped_as_gap_stale() {
        let mut state = OrderingState::new(5);
        let outcome = state.accept(chat(3, 1, "old"), |_| Ok(())).unwrap();
        assert!(matches!(outcome, AcceptOutcome::Dropped(ClusterError::GapStale { .. })));
    }

    #[test]
    fn buffer_only_ever_holds_seq_no_greater_than_next_expected() {
        let mut state = OrderingState::new(0);
        state.accept(chat(5, 1, "e"), |_| Ok(())).unwrap();
        state.accept(chat(2, 1, "b"), |_| Ok(())).unwrap();
        assert_eq!(state.buffer_len(), 2);
        assert!(state.buffer.keys().all(|&s| s > state.next_expected()));
    }

    // A delivery failure partway through a drain must not let a later,
    // higher seq_no "succeed" while an earlier one was lost.
    #[test]
    fn failed_delivery_stops_the_drain_and_does_not_advance_last_seq() {
        let mut state = OrderingState::new(0);
        // 2 and 3 arrive first and buffer; then 1 arrives and should trigger
        // a drain of 1, 2, 3 — but delivery of 2 is made to fail.
        state.accept(chat(3, 1, "c"), |_| Ok(())).unwrap();
        state.accept(chat(2, 1, "b"), |_| Ok(())).unwrap();

        let mut delivered = Vec::new();
        let outcome = state.accept(chat(1, 1, "a"), |c| {
            if c.seq_no == 2 {
                Err(ClusterError::StorageFatal { path: "x".into(), source: std::io::Error::other("disk full") })
            } else {
                delivered.push(c.seq_no);
                Ok(())
            }
        });

        assert!(outcome.is_err());
        // 1 was delivered before the failure; last_seq must stop there, not
        // at 3, even though 3 is sitting right behind the failed entry.
        assert_eq!(delivered, vec![1]);
        assert_eq!(state.last_seq(), 1);
        // 2 and 3 remain buffered for a future retry.
        assert_eq!(state.buffer_len(), 2);
    }

    #[test]
    fn term_discipline_transitions() {
        assert_eq!(term_discipline(3, 5), TermDecision::Stale);
        assert_eq!(term_discipline(5, 5), TermDecision::Accept);
        assert_eq!(term_discipline(6, 5), TermDecision::Advance(6));
    }
}
