use std::collections::BTreeMap;

use super::constants::WIRES_PER_CHAMBER;
use super::event::{EventBatch, EventRecord, MatchOutcome};

/// Hits seen on each wire of one chamber
pub type ChamberHitCount = [u64; WIRES_PER_CHAMBER];

/// Per chamber wire tallies, ordered by chamber
pub type ChamberCounts = BTreeMap<u32, ChamberHitCount>;

/// Counters for one classification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tally {
    pub triggers: u64,
    pub packages: u64,
    pub chamber_counts: ChamberCounts,
}

/// Accumulated counters of one run, split by matched and dropped data.
///
/// Nothing here can fail: the channel map guarantees every wire index is in range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statistics {
    matched: Tally,
    dropped: Tally,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    fn tally_mut(&mut self, outcome: MatchOutcome) -> &mut Tally {
        match outcome {
            MatchOutcome::Matched => &mut self.matched,
            MatchOutcome::Dropped => &mut self.dropped,
        }
    }

    pub fn tally(&self, outcome: MatchOutcome) -> &Tally {
        match outcome {
            MatchOutcome::Matched => &self.matched,
            MatchOutcome::Dropped => &self.dropped,
        }
    }

    pub fn increment_triggers(&mut self, n: u64, outcome: MatchOutcome) {
        self.tally_mut(outcome).triggers += n;
    }

    pub fn increment_packages(&mut self, n: u64, outcome: MatchOutcome) {
        self.tally_mut(outcome).packages += n;
    }

    pub fn increment_chamber_counts(&mut self, records: &[EventRecord], outcome: MatchOutcome) {
        let counts = &mut self.tally_mut(outcome).chamber_counts;
        for hit in records.iter().flat_map(|r| r.hits.iter()) {
            let chamber = counts.entry(hit.chamber).or_insert([0; WIRES_PER_CHAMBER]);
            if let Some(wire) = chamber.get_mut(hit.wire as usize) {
                *wire += 1;
            }
        }
    }

    /// Account for one batch coming out of the matcher: one package, one trigger per record
    pub fn record_batch(&mut self, batch: &EventBatch) {
        self.increment_triggers(batch.records.len() as u64, batch.outcome);
        self.increment_packages(1, batch.outcome);
        self.increment_chamber_counts(&batch.records, batch.outcome);
    }

    pub fn triggers(&self, outcome: MatchOutcome) -> u64 {
        self.tally(outcome).triggers
    }

    pub fn packages(&self, outcome: MatchOutcome) -> u64 {
        self.tally(outcome).packages
    }

    pub fn chamber_counts(&self, outcome: MatchOutcome) -> &ChamberCounts {
        &self.tally(outcome).chamber_counts
    }

    /// Fraction of triggers that were dropped, zero when nothing was seen
    pub fn drop_fraction(&self) -> f64 {
        let total = self.matched.triggers + self.dropped.triggers;
        if total == 0 {
            0.0
        } else {
            self.dropped.triggers as f64 / total as f64
        }
    }
}
