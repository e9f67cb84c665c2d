use std::collections::BTreeMap;

use super::error::DeviceError;
use super::event::{EventHits, Hit};

/// How the TDC collects hits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HitSourceMode {
    /// Hits are grouped by the internal hardware gate
    Trigger,
    /// Hits are streamed ungated; used to measure counting rates
    Continuous,
}

/// The capability the pipeline needs from the time-to-digital converter.
///
/// Concrete bindings to the VME/USB hardware live outside this crate. Every call may
/// fail with a DeviceError; the pipeline treats those as transient unless noted otherwise.
pub trait HitSource: Send {
    /// All gated groups collected since the previous call
    fn read_event_groups(&mut self) -> Result<Vec<EventHits>, DeviceError>;

    /// Ungated hits collected since the previous call (continuous mode)
    fn read_raw_hits(&mut self) -> Result<Vec<Hit>, DeviceError>;

    fn mode(&self) -> HitSourceMode;

    fn set_mode(&mut self, mode: HitSourceMode) -> Result<(), DeviceError>;

    /// Discard everything buffered on the device
    fn clear(&mut self) -> Result<(), DeviceError>;

    fn reset(&mut self) -> Result<(), DeviceError>;

    fn is_open(&self) -> bool;

    /// Device name recorded in the run metadata file
    fn name(&self) -> String;

    /// Settings snapshot recorded in the run metadata file
    fn settings_snapshot(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}
