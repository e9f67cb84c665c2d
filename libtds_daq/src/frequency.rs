use spdlog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::channel_map::ChannelMap;
use super::config::FrequencyConfig;
use super::constants::WIRES_PER_CHAMBER;
use super::error::ProbeError;
use super::hit_source::{HitSource, HitSourceMode};
use super::signal::StopSignal;

/// Counting rate in Hz per TDC channel
pub type ChannelRates = BTreeMap<u32, f64>;

/// Counting rate in Hz per wire, per chamber
pub type ChamberRates = BTreeMap<u32, [f64; WIRES_PER_CHAMBER]>;

/// Result of one frequency measurement
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyReport {
    pub run: u64,
    pub elapsed: Duration,
    pub channel_rates: ChannelRates,
    pub chamber_rates: ChamberRates,
}

/// Fold channel rates onto the detector layout. Every chamber of the map gets an entry.
pub fn to_chamber_rates(rates: &ChannelRates, map: &ChannelMap) -> ChamberRates {
    let mut chambers: ChamberRates = map
        .chambers()
        .into_iter()
        .map(|c| (c, [0.0; WIRES_PER_CHAMBER]))
        .collect();
    for (channel, rate) in rates.iter() {
        if let Some(cong) = map.get(*channel) {
            if let Some(wire) = chambers
                .entry(cong.chamber)
                .or_insert([0.0; WIRES_PER_CHAMBER])
                .get_mut(cong.wire as usize)
            {
                *wire += rate;
            }
        }
    }
    chambers
}

/// Measures live per channel hit rates by sampling the TDC in continuous mode.
///
/// The device is switched to continuous mode for the measurement and always switched back,
/// including when sampling fails.
#[derive(Debug, Clone)]
pub struct FrequencyProbe {
    duration: Duration,
    slice: Duration,
    logger: Arc<Logger>,
}

impl FrequencyProbe {
    pub fn new(config: &FrequencyConfig, logger: Arc<Logger>) -> Self {
        Self {
            duration: config.duration(),
            slice: config.slice(),
            logger,
        }
    }

    /// Sample for the configured duration, or until `cancel` is raised
    pub fn measure<S: HitSource + ?Sized>(
        &self,
        source: &mut S,
        cancel: &StopSignal,
    ) -> Result<ChannelRates, ProbeError> {
        let original_mode = source.mode();
        source.set_mode(HitSourceMode::Continuous)?;

        let sampled = self.sample(source, cancel);
        let restored = source.set_mode(original_mode);
        if let Err(e) = &restored {
            spdlog::error!(logger: self.logger, "Could not restore hit source mode after frequency probe: {e}");
        }

        let rates = sampled?;
        restored?;
        Ok(rates)
    }

    fn sample<S: HitSource + ?Sized>(
        &self,
        source: &mut S,
        cancel: &StopSignal,
    ) -> Result<ChannelRates, ProbeError> {
        let mut counts: BTreeMap<u32, u64> = BTreeMap::new();
        let mut elapsed = Duration::ZERO;
        while elapsed < self.duration {
            source.clear()?;
            let slice_start = Instant::now();
            let cancelled = cancel.wait_timeout(self.slice);
            let hits = source.read_raw_hits()?;
            elapsed += slice_start.elapsed();
            for hit in hits.iter() {
                *counts.entry(hit.channel).or_insert(0) += 1;
            }
            if cancelled {
                spdlog::info!(logger: self.logger, "Frequency probe cancelled after {elapsed:?}");
                break;
            }
        }

        if elapsed.is_zero() {
            return Err(ProbeError::Cancelled);
        }
        let seconds = elapsed.as_secs_f64();
        Ok(counts
            .into_iter()
            .map(|(channel, count)| (channel, count as f64 / seconds))
            .collect())
    }
}
