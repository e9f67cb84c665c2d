//! # libtds_daq
//!
//! libtds_daq is the acquisition pipeline of a drift-chamber tracking detector read out by a
//! time-to-digital converter (TDC). It pulls gated hit groups off the TDC, correlates every
//! hardware gate with the record number of an external trigger system, and writes the result
//! to rotating binary run files. Operators can ask for a live measurement of the per-wire
//! counting rates at any time during a run.
//!
//! The bindings to the TDC hardware live outside this crate; anything implementing
//! [`hit_source::HitSource`] can be acquired from.
//!
//! ## Acquisition
//!
//! An exposition (see [`exposition::ExpositionController`]) runs three loops:
//!
//! - read: moves gated hit groups from the TDC into a shared buffer
//! - write: on every trigger package, hands the buffered gates to the
//! [`matcher::EventMatcher`] and writes what it resolves
//! - monitor: on a frequency request from the control channel, pauses acquisition and samples
//! the TDC in continuous mode
//!
//! Without a `trigger` section in the configuration the pipeline runs in plain mode: gates are
//! numbered from 1 in arrival order, everything counts as matched, and no monitor loop runs.
//!
//! ## Configuration
//!
//! The YAML format of a configuration file is as follows:
//!
//! ```yml
//! output_path: /data/tds
//! channel_map_path: null
//! records_per_file: 10000
//! read_interval_us: 1000
//! frequency:
//!   duration_ms: 1000
//!   slice_us: 100
//! trigger:
//!   interface: 0.0.0.0
//!   info_group: 239.0.0.1
//!   info_port: 2001
//!   control_group: 239.0.0.2
//!   control_port: 2002
//!   poll_interval_ms: 250
//! ```
//!
//! Note that if the `channel_map_path` field is set to `null`, the bundled default map
//! will be used. Setting `trigger` to `null` selects plain mode.
//!
//! ### Channel Map Format
//!
//! The channel map is a CSV file with *no* whitespaces and a header line. The columns are as follows:
//!
//! ```csv
//! channel,chamber,wire
//! ```
//!
//! Every TDC channel may appear once. Wires are numbered 0 to 3 within a chamber. Hits on
//! channels missing from the map are not written.
//!
//! ## Output
//!
//! Each run gets its own directory in `output_path`:
//!
//! ```text
//! run_000042/
//! |---- run_000042.yml              run number, device, settings, start and stop time
//! |---- run_000042_0000.tds         matched records, rotated every records_per_file
//! |---- run_000042_0001.tds
//! |---- run_000042_dropped_0000.tds records whose gates could not be matched
//! |---- chamber_03.freq             one line of wire rates per frequency measurement
//! ```
//!
//! The binary layout of the `.tds` files is described in [`tds_file`].
pub mod channel_map;
pub mod config;
pub mod constants;
pub mod error;
pub mod event;
pub mod event_writer;
pub mod exposition;
pub mod frequency;
pub mod hit_source;
pub mod matcher;
pub mod run_log;
pub mod signal;
pub mod statistics;
pub mod status;
pub mod tds_file;
pub mod trigger;
