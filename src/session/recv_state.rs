use std::collections::BTreeSet;

/// What to do with a payload datagram after its sequence number has been classified.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PayloadDisposition {
    /// dispatch the remaining words; `ack_now` asks for an immediate beacon so the sender
    ///  learns about newly detected gaps (or their absence) quickly
    Accept { ack_now: bool },
    /// already seen - drop the datagram
    Duplicate,
}

/// The inbound half of the reliability protocol: tracks the highest payload sequence seen
///  from the peer, the contiguous-receipt watermark acknowledged back to it, and the set of
///  sequences that were skipped but not yet received.
///
/// Invariants after any update:
/// * `min_pack_rcvd <= last_pack_id`
/// * `missing` contains exactly the sequences in `[1, last_pack_id]` never observed
#[derive(Debug)]
pub struct RecvState {
    last_pack_id: u32,
    min_pack_rcvd: u32,
    missing: BTreeSet<u32>,

    /// set when the peer's beacon fast-forwarded `last_pack_id` to its send count - the
    ///  datagram actually carrying that sequence is then still outstanding and must not be
    ///  dropped as a duplicate when it arrives
    accept_last: bool,
}

impl RecvState {
    pub fn new() -> RecvState {
        RecvState {
            last_pack_id: 0,
            min_pack_rcvd: 0,
            missing: BTreeSet::new(),
            accept_last: false,
        }
    }

    pub fn last_pack_id(&self) -> u32 {
        self.last_pack_id
    }

    pub fn min_pack_rcvd(&self) -> u32 {
        self.min_pack_rcvd
    }

    pub fn has_missing(&self) -> bool {
        !self.missing.is_empty()
    }

    /// The current NAK list, ascending.
    pub fn missing_ids(&self) -> Vec<u32> {
        self.missing.iter().copied().collect()
    }

    /// Classify an arriving payload sequence number.
    pub fn on_payload_sequence(&mut self, sequence: u32) -> PayloadDisposition {
        if sequence == self.last_pack_id && !self.accept_last {
            return PayloadDisposition::Duplicate;
        }

        if sequence <= self.last_pack_id {
            // an out-of-order arrival: either it fills a gap, or it is a plain re-send of
            //  something already dispatched
            if !self.missing.remove(&sequence) {
                return PayloadDisposition::Duplicate;
            }
            if sequence == self.last_pack_id {
                self.accept_last = false;
            }
            if self.missing.is_empty() {
                self.min_pack_rcvd = self.last_pack_id;
            }
            PayloadDisposition::Accept { ack_now: false }
        }
        else {
            // ahead of what we have seen: everything in between is now known missing
            for skipped in self.last_pack_id + 1..sequence {
                self.missing.insert(skipped);
            }
            self.last_pack_id = sequence;
            self.accept_last = false;
            if self.missing.is_empty() {
                self.min_pack_rcvd = sequence;
            }
            PayloadDisposition::Accept { ack_now: true }
        }
    }

    /// The peer's beacon reported how many payloads it has emitted in total. If that is
    ///  ahead of everything we have seen, all of the gap - including the newest sequence
    ///  itself - is recorded missing so the next beacon NAKs it. Returns whether an
    ///  immediate beacon should go out.
    pub fn on_peer_send_count(&mut self, send_count: u32) -> bool {
        if send_count <= self.last_pack_id {
            return false;
        }

        for skipped in self.last_pack_id + 1..=send_count {
            self.missing.insert(skipped);
        }
        self.last_pack_id = send_count;
        self.accept_last = true;
        true
    }

    #[cfg(test)]
    fn assert_invariants(&self, observed: &[u32]) {
        assert!(self.min_pack_rcvd <= self.last_pack_id);
        for sequence in 1..=self.last_pack_id {
            let expected_missing = !observed.contains(&sequence);
            assert_eq!(self.missing.contains(&sequence), expected_missing,
                       "sequence {} missing-tracking is wrong", sequence);
        }
    }
}


#[cfg(test)]
mod test {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_in_order_delivery() {
        let mut state = RecvState::new();

        for sequence in 1..=4u32 {
            assert_eq!(state.on_payload_sequence(sequence), PayloadDisposition::Accept { ack_now: true });
            assert_eq!(state.last_pack_id(), sequence);
            assert_eq!(state.min_pack_rcvd(), sequence);
            assert!(!state.has_missing());
        }
    }

    #[test]
    fn test_gap_is_tracked_and_filled() {
        let mut state = RecvState::new();

        // 1, 2, 4 arrive - 3 is skipped
        state.on_payload_sequence(1);
        state.on_payload_sequence(2);
        assert_eq!(state.on_payload_sequence(4), PayloadDisposition::Accept { ack_now: true });

        assert_eq!(state.last_pack_id(), 4);
        assert_eq!(state.min_pack_rcvd(), 2);
        assert_eq!(state.missing_ids(), vec![3]);
        state.assert_invariants(&[1, 2, 4]);

        // the retransmitted 3 fills the gap and advances the watermark
        assert_eq!(state.on_payload_sequence(3), PayloadDisposition::Accept { ack_now: false });
        assert_eq!(state.min_pack_rcvd(), 4);
        assert!(!state.has_missing());
        state.assert_invariants(&[1, 2, 3, 4]);
    }

    #[test]
    fn test_wide_gap() {
        let mut state = RecvState::new();

        state.on_payload_sequence(1);
        state.on_payload_sequence(7);

        assert_eq!(state.missing_ids(), vec![2, 3, 4, 5, 6]);
        assert_eq!(state.min_pack_rcvd(), 1);
        state.assert_invariants(&[1, 7]);
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    fn test_duplicates_are_dropped(#[case] duplicate: u32) {
        let mut state = RecvState::new();
        state.on_payload_sequence(1);
        state.on_payload_sequence(2);

        assert_eq!(state.on_payload_sequence(duplicate), PayloadDisposition::Duplicate);
        state.assert_invariants(&[1, 2]);
    }

    #[test]
    fn test_duplicate_of_gap_fill_is_dropped() {
        let mut state = RecvState::new();
        state.on_payload_sequence(1);
        state.on_payload_sequence(3);

        assert_eq!(state.on_payload_sequence(2), PayloadDisposition::Accept { ack_now: false });
        assert_eq!(state.on_payload_sequence(2), PayloadDisposition::Duplicate);
    }

    #[test]
    fn test_peer_send_count_fast_forward() {
        let mut state = RecvState::new();
        state.on_payload_sequence(1);

        // the peer claims to have sent 3 packets; 2 and 3 must be NAK'ed
        assert!(state.on_peer_send_count(3));
        assert_eq!(state.last_pack_id(), 3);
        assert_eq!(state.missing_ids(), vec![2, 3]);
        assert_eq!(state.min_pack_rcvd(), 1);

        // when the fast-forwarded newest sequence finally arrives it is not a duplicate
        assert_eq!(state.on_payload_sequence(3), PayloadDisposition::Accept { ack_now: false });
        assert_eq!(state.on_payload_sequence(2), PayloadDisposition::Accept { ack_now: false });
        assert_eq!(state.min_pack_rcvd(), 3);
        state.assert_invariants(&[1, 2, 3]);
    }

    #[test]
    fn test_stale_peer_send_count_is_ignored() {
        let mut state = RecvState::new();
        state.on_payload_sequence(5);

        assert!(!state.on_peer_send_count(3));
        assert_eq!(state.last_pack_id(), 5);
    }

    #[test]
    fn test_repeated_newest_without_fast_forward_is_duplicate() {
        let mut state = RecvState::new();
        state.on_payload_sequence(2);

        assert_eq!(state.on_payload_sequence(2), PayloadDisposition::Duplicate);
    }
}
