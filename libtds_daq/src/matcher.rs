use std::collections::VecDeque;
use std::sync::Arc;

use super::channel_map::ChannelMap;
use super::constants::MAX_PENDING_IDS;
use super::event::{EventBatch, EventHits, EventRecord, MatchOutcome, TriggerId};

/// EventMatcher aligns hardware gates with the external trigger numbering.
///
/// Between two consecutive trigger packages the hardware should have produced exactly as many
/// gates as the trigger numbers advanced. The matcher keeps a short window of trigger ids and the
/// batches of gates that arrived between them. When the gate count over the window agrees with the
/// numbering, every pending gate is emitted as Matched with consecutive record numbers. When it does
/// not, the matcher waits for one more trigger before giving up on the oldest batch and emitting it
/// as Dropped. At most three ids and two batches are ever pending.
///
/// The matcher is single threaded; callers serialise access.
#[derive(Debug)]
pub struct EventMatcher {
    channel_map: Arc<ChannelMap>,
    ids: VecDeque<TriggerId>,
    buf: VecDeque<Vec<EventHits>>,
    discarded: u64,
}

impl EventMatcher {
    /// Create a new EventMatcher.
    ///
    /// Requires a ChannelMap to address the hits of emitted records
    pub fn new(channel_map: Arc<ChannelMap>) -> Self {
        Self {
            channel_map,
            ids: VecDeque::with_capacity(MAX_PENDING_IDS),
            buf: VecDeque::with_capacity(MAX_PENDING_IDS - 1),
            discarded: 0,
        }
    }

    /// Feed the gates collected since the previous trigger together with the new trigger id.
    ///
    /// Returns every batch that was resolved by this call, oldest first. An empty Vec means the
    /// window is still undecided.
    pub fn load(&mut self, batch: Vec<EventHits>, id: TriggerId) -> Vec<EventBatch> {
        self.ids.push_back(id);
        self.buf.push_back(batch);

        if self.ids.len() == 1 {
            // Gates before the first trigger have no number to attach to
            self.discarded += self.pending_gates() as u64;
            self.buf.clear();
            return Vec::new();
        }

        let mut resolved = Vec::new();
        while self.ids.len() > 1 {
            if self.is_window_matched() {
                let Some(front) = self.ids.front().copied() else {
                    break;
                };
                // Numbering runs across the whole window, a late batch shifts its gates forward
                let mut next_number = front.record_number + 1;
                while let Some(batch) = self.buf.pop_front() {
                    self.ids.pop_front();
                    let n_gates = batch.len() as u64;
                    resolved.push(self.build_batch(
                        batch,
                        front.run,
                        next_number,
                        MatchOutcome::Matched,
                    ));
                    next_number += n_gates;
                }
            } else if self.ids.len() >= MAX_PENDING_IDS {
                if let (Some(batch), Some(front)) = (self.buf.pop_front(), self.ids.pop_front()) {
                    resolved.push(self.build_batch(
                        batch,
                        front.run,
                        front.record_number + 1,
                        MatchOutcome::Dropped,
                    ));
                }
            } else {
                break;
            }
        }
        resolved
    }

    /// Discard the pending window, keeping nothing.
    ///
    /// The discarded gates are counted by discarded() but are not reported as dropped.
    pub fn reset(&mut self) {
        self.discarded += self.pending_gates() as u64;
        self.buf.clear();
        self.ids.clear();
    }

    /// Give up on every unresolved batch, emitting each as Dropped, and empty the window.
    ///
    /// Used at the end of an exposition so that gates which already have a trigger id are persisted.
    pub fn drain_pending(&mut self) -> Vec<EventBatch> {
        let mut resolved = Vec::new();
        while let Some(batch) = self.buf.pop_front() {
            if let Some(front) = self.ids.pop_front() {
                resolved.push(self.build_batch(
                    batch,
                    front.run,
                    front.record_number + 1,
                    MatchOutcome::Dropped,
                ));
            }
        }
        self.ids.clear();
        resolved
    }

    pub fn pending_ids(&self) -> usize {
        self.ids.len()
    }

    pub fn pending_batches(&self) -> usize {
        self.buf.len()
    }

    /// Number of gates thrown away without a classification (before the first trigger, or by reset)
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    fn pending_gates(&self) -> usize {
        self.buf.iter().map(Vec::len).sum()
    }

    /// Do the gates in the window account for exactly the advance in trigger numbering?
    fn is_window_matched(&self) -> bool {
        match (self.ids.front(), self.ids.back()) {
            (Some(front), Some(back)) => {
                front.run == back.run
                    && back.record_number.checked_sub(front.record_number)
                        == Some(self.pending_gates() as u64)
            }
            _ => false,
        }
    }

    /// Each gate becomes one record, numbered consecutively from first_number
    fn build_batch(
        &self,
        batch: Vec<EventHits>,
        run: u64,
        first_number: u64,
        outcome: MatchOutcome,
    ) -> EventBatch {
        let records = batch
            .iter()
            .enumerate()
            .map(|(idx, hits)| {
                EventRecord::new(run, first_number + idx as u64, hits, &self.channel_map)
            })
            .collect();
        EventBatch { outcome, records }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Edge, Hit};

    fn matcher() -> EventMatcher {
        EventMatcher::new(Arc::new(ChannelMap::default_map()))
    }

    fn gates(n: usize) -> Vec<EventHits> {
        (0..n)
            .map(|i| vec![Hit::new(Edge::Leading, (i % 32) as u32, i as u32)])
            .collect()
    }

    fn numbers(batches: &[EventBatch], outcome: MatchOutcome) -> Vec<u64> {
        batches
            .iter()
            .filter(|b| b.outcome == outcome)
            .flat_map(|b| b.records.iter().map(|r| r.record_number))
            .collect()
    }

    #[test]
    fn test_single_gate_matches() {
        let mut m = matcher();
        assert!(m.load(Vec::new(), TriggerId::new(1, 10)).is_empty());
        let out = m.load(gates(1), TriggerId::new(1, 11));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].outcome, MatchOutcome::Matched);
        assert_eq!(numbers(&out, MatchOutcome::Matched), vec![11]);
        assert_eq!(m.pending_ids(), 1);
        assert_eq!(m.pending_batches(), 0);
    }

    #[test]
    fn test_oldest_batch_dropped_after_one_step_lookahead() {
        let mut m = matcher();
        m.load(Vec::new(), TriggerId::new(1, 10));
        // Two triggers worth of numbering but only one gate: undecided
        assert!(m.load(gates(1), TriggerId::new(1, 12)).is_empty());
        assert_eq!(m.pending_ids(), 2);

        let out = m.load(gates(0), TriggerId::new(1, 13));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].outcome, MatchOutcome::Dropped);
        assert_eq!(numbers(&out, MatchOutcome::Dropped), vec![11]);
        // Window [(1,12),(1,13)] with an empty batch is still a mismatch
        assert_eq!(m.pending_ids(), 2);
        assert_eq!(m.pending_batches(), 1);
    }

    #[test]
    fn test_late_batch_recovers_window() {
        let mut m = matcher();
        m.load(Vec::new(), TriggerId::new(1, 10));
        // Gate for trigger 11 arrives late, together with the gate for 12
        assert!(m.load(gates(0), TriggerId::new(1, 11)).is_empty());
        let out = m.load(gates(2), TriggerId::new(1, 12));
        assert_eq!(numbers(&out, MatchOutcome::Matched), vec![11, 12]);
        assert!(numbers(&out, MatchOutcome::Dropped).is_empty());
    }

    #[test]
    fn test_multi_gate_window_numbering_is_gap_free() {
        let mut m = matcher();
        m.load(gates(3), TriggerId::new(4, 100));
        assert_eq!(m.discarded(), 3);
        let mut emitted = Vec::new();
        let mut next = 100;
        for size in [1, 2, 1, 3, 1] {
            next += size as u64;
            emitted.extend(m.load(gates(size), TriggerId::new(4, next)));
        }
        let expected: Vec<u64> = (101..=next).collect();
        assert_eq!(numbers(&emitted, MatchOutcome::Matched), expected);
        assert!(emitted.iter().all(|b| b.records.iter().all(|r| r.run == 4)));
    }

    #[test]
    fn test_run_boundary_goes_through_drop_path() {
        let mut m = matcher();
        m.load(Vec::new(), TriggerId::new(1, 50));
        assert!(m.load(gates(1), TriggerId::new(2, 1)).is_empty());
        let out = m.load(gates(1), TriggerId::new(2, 2));
        // Oldest batch belongs to run 1 and can never match
        assert_eq!(out[0].outcome, MatchOutcome::Dropped);
        assert_eq!(out[0].records[0].run, 1);
        assert_eq!(out[0].records[0].record_number, 51);
        // The remaining window is within run 2 and matches
        assert_eq!(out[1].outcome, MatchOutcome::Matched);
        assert_eq!(out[1].records[0].run, 2);
        assert_eq!(out[1].records[0].record_number, 2);
    }

    #[test]
    fn test_reset_discards_window() {
        let mut m = matcher();
        m.load(Vec::new(), TriggerId::new(1, 10));
        m.load(gates(2), TriggerId::new(1, 11));
        assert_eq!(m.pending_batches(), 1);
        m.reset();
        assert_eq!(m.pending_ids(), 0);
        assert_eq!(m.pending_batches(), 0);
        assert_eq!(m.discarded(), 2);
        // The next id starts a fresh window
        assert!(m.load(gates(1), TriggerId::new(1, 20)).is_empty());
        assert_eq!(m.discarded(), 3);
    }

    #[test]
    fn test_drain_pending_emits_dropped() {
        let mut m = matcher();
        m.load(Vec::new(), TriggerId::new(1, 10));
        m.load(gates(2), TriggerId::new(1, 11));
        let out = m.drain_pending();
        assert_eq!(numbers(&out, MatchOutcome::Dropped), vec![11, 12]);
        assert_eq!(m.pending_ids(), 0);
        assert!(m.drain_pending().is_empty());
    }

    #[test]
    fn test_window_bounds_and_conservation() {
        // Deterministic pseudo-random sizes and numbering gaps
        let mut state: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next_rand = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        let mut m = matcher();
        let mut loaded: u64 = 0;
        let mut matched: u64 = 0;
        let mut dropped: u64 = 0;
        let mut number = 0;
        for _ in 0..2000 {
            let size = (next_rand() % 4) as usize;
            number += 1 + next_rand() % 3;
            loaded += size as u64;
            let out = m.load(gates(size), TriggerId::new(9, number));
            assert!(m.pending_ids() <= 2);
            assert_eq!(m.pending_batches() + 1, m.pending_ids());
            for batch in out {
                match batch.outcome {
                    MatchOutcome::Matched => matched += batch.records.len() as u64,
                    MatchOutcome::Dropped => dropped += batch.records.len() as u64,
                }
            }
        }
        for batch in m.drain_pending() {
            dropped += batch.records.len() as u64;
        }
        assert!(matched > 0);
        assert!(dropped > 0);
        assert_eq!(matched + dropped + m.discarded(), loaded);
    }
}
