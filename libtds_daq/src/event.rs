use super::channel_map::ChannelMap;

/// Which edge of the discriminated pulse the TDC time-stamped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Edge {
    Leading,
    Trailing,
}

impl Edge {
    pub fn tag(&self) -> u8 {
        match self {
            Edge::Leading => 0,
            Edge::Trailing => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Edge::Leading),
            1 => Some(Edge::Trailing),
            _ => None,
        }
    }
}

/// A single timing measurement as read from the TDC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hit {
    pub edge: Edge,
    pub channel: u32,
    pub time: u32,
}

impl Hit {
    pub fn new(edge: Edge, channel: u32, time: u32) -> Self {
        Self {
            edge,
            channel,
            time,
        }
    }
}

/// All hits collected between two internal hardware gates, in detection order
pub type EventHits = Vec<Hit>;

/// Identifier of one external trigger package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TriggerId {
    pub run: u64,
    pub record_number: u64,
}

impl TriggerId {
    pub fn new(run: u64, record_number: u64) -> Self {
        Self { run, record_number }
    }
}

/// A hit addressed by its logical detector location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedHit {
    pub edge: Edge,
    pub wire: u8,
    pub chamber: u32,
    pub time: u32,
}

/// The unit of persistence: one hardware gate tagged with its external record number
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventRecord {
    pub run: u64,
    pub record_number: u64,
    pub hits: Vec<MappedHit>,
}

impl EventRecord {
    /// Build a record from raw hits.
    ///
    /// Hits on channels missing from the map carry no detector address and are skipped.
    pub fn new(run: u64, record_number: u64, hits: &[Hit], map: &ChannelMap) -> Self {
        let hits = hits
            .iter()
            .filter_map(|hit| {
                map.get(hit.channel).map(|cong| MappedHit {
                    edge: hit.edge,
                    wire: cong.wire,
                    chamber: cong.chamber,
                    time: hit.time,
                })
            })
            .collect();
        Self {
            run,
            record_number,
            hits,
        }
    }
}

/// Classification of a batch of records coming out of the matcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchOutcome {
    Matched,
    Dropped,
}

impl MatchOutcome {
    pub fn is_matched(&self) -> bool {
        matches!(self, MatchOutcome::Matched)
    }
}

/// Records produced from one batch of gates, with their classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBatch {
    pub outcome: MatchOutcome,
    pub records: Vec<EventRecord>,
}
