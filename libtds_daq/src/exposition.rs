use spdlog::Logger;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::channel_map::ChannelMap;
use super::config::{Config, TriggerConfig};
use super::error::{ExpositionError, TriggerError};
use super::event::{EventBatch, EventHits, EventRecord, MatchOutcome, TriggerId};
use super::event_writer::EventWriter;
use super::frequency::{to_chamber_rates, FrequencyProbe, FrequencyReport};
use super::hit_source::{HitSource, HitSourceMode};
use super::matcher::EventMatcher;
use super::run_log::{ChamberMonitorLog, RunMetadataFile};
use super::signal::StopSignal;
use super::statistics::Statistics;
use super::status::{Diagnostics, DiagnosticsSnapshot, ExpositionState};
use super::trigger::{ControlCommand, TriggerSource};

/// Callback receiving every frequency measurement
pub type FrequencyObserver = Arc<dyn Fn(&FrequencyReport) + Send + Sync>;

/// How hardware gates are numbered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionMode {
    /// No external trigger stream; gates are numbered in arrival order and all count as matched
    Plain,
    /// Gates are correlated against the external trigger stream
    Correlated(TriggerConfig),
}

impl AcquisitionMode {
    pub fn from_config(config: &Config) -> Self {
        match &config.trigger {
            Some(trigger) => AcquisitionMode::Correlated(trigger.clone()),
            None => AcquisitionMode::Plain,
        }
    }
}

/// Lock a mutex, recovering the data if another loop panicked while holding it
fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything guarded by the buffer lock
#[derive(Debug)]
struct Pipeline {
    hit_buffer: Vec<EventHits>,
    matcher: EventMatcher,
    statistics: Statistics,
}

/// State shared between the controller and its loops
struct Shared {
    source: Mutex<Box<dyn HitSource>>,
    pipeline: Mutex<Pipeline>,
    diagnostics: Diagnostics,
    channel_map: Arc<ChannelMap>,
    probe: FrequencyProbe,
    observer: Mutex<Option<FrequencyObserver>>,
    logger: Arc<Logger>,
}

/// Run specific context handed to the loops
#[derive(Clone)]
struct RunContext {
    run: u64,
    stop: Arc<StopSignal>,
    monitor_log: ChamberMonitorLog,
}

/// One started exposition
struct Session {
    context: RunContext,
    trigger: Option<Arc<TriggerSource>>,
    threads: Vec<JoinHandle<()>>,
    metadata: RunMetadataFile,
}

impl Shared {
    /// Pull gates off the device into the hit buffer until stopped
    fn read_loop(&self, stop: &StopSignal, interval: Duration) {
        spdlog::debug!(logger: self.logger, "Read loop started");
        while !stop.wait_timeout(interval) {
            let groups = lock(&self.source).read_event_groups();
            match groups {
                Ok(groups) => {
                    if !groups.is_empty() {
                        lock(&self.pipeline).hit_buffer.extend(groups);
                    }
                }
                Err(e) => {
                    self.diagnostics.device_error();
                    spdlog::warn!(logger: self.logger, "Failed to read hit groups: {e}");
                }
            }
        }
        spdlog::debug!(logger: self.logger, "Read loop finished");
    }

    /// Correlate buffered gates with every trigger package until stopped
    fn correlate_loop(
        &self,
        context: &RunContext,
        trigger: &TriggerSource,
        poll: Duration,
        mut writer: EventWriter,
    ) {
        spdlog::debug!(logger: self.logger, "Correlation loop started for run {}", context.run);
        while !context.stop.is_stopped() {
            match trigger.recv_info() {
                Ok(Some(id)) => {
                    self.handle_package(id, &mut writer);
                    self.diagnostics.package_received();
                }
                Ok(None) => (),
                Err(TriggerError::BadPacket(e)) => {
                    self.diagnostics.malformed_packet();
                    spdlog::debug!(logger: self.logger, "Discarded trigger package: {e}");
                }
                Err(e) => {
                    spdlog::warn!(logger: self.logger, "Trigger receive failed: {e}");
                    context.stop.wait_timeout(poll);
                }
            }
        }

        // Gates that already have an id are written out rather than lost
        let mut pipeline = lock(&self.pipeline);
        let leftover = pipeline.hit_buffer.len();
        if leftover > 0 {
            spdlog::warn!(logger: self.logger, "{leftover} gates arrived after the last trigger package and are discarded");
            pipeline.hit_buffer.clear();
        }
        let pending = pipeline.matcher.drain_pending();
        for batch in pending.iter() {
            self.route_batch(&mut pipeline.statistics, &mut writer, batch);
        }
        spdlog::debug!(logger: self.logger, "Correlation loop finished for run {}", context.run);
    }

    fn handle_package(&self, id: TriggerId, writer: &mut EventWriter) {
        let mut pipeline = lock(&self.pipeline);
        let gates = std::mem::take(&mut pipeline.hit_buffer);
        let resolved = pipeline.matcher.load(gates, id);
        for batch in resolved.iter() {
            self.route_batch(&mut pipeline.statistics, writer, batch);
        }
    }

    /// Number gates in arrival order, without an external trigger stream
    fn plain_loop(&self, context: &RunContext, interval: Duration, mut writer: EventWriter) {
        spdlog::debug!(logger: self.logger, "Plain write loop started for run {}", context.run);
        let mut next_number = 1;
        while !context.stop.wait_timeout(interval) {
            self.handle_plain(context.run, &mut next_number, &mut writer);
        }
        self.handle_plain(context.run, &mut next_number, &mut writer);
        spdlog::debug!(logger: self.logger, "Plain write loop finished for run {}", context.run);
    }

    fn handle_plain(&self, run: u64, next_number: &mut u64, writer: &mut EventWriter) {
        let mut pipeline = lock(&self.pipeline);
        if pipeline.hit_buffer.is_empty() {
            return;
        }
        let gates = std::mem::take(&mut pipeline.hit_buffer);
        let records = gates
            .iter()
            .map(|hits| {
                let record = EventRecord::new(run, *next_number, hits, &self.channel_map);
                *next_number += 1;
                record
            })
            .collect();
        let batch = EventBatch {
            outcome: MatchOutcome::Matched,
            records,
        };
        self.route_batch(&mut pipeline.statistics, writer, &batch);
    }

    /// Account for a batch and persist it. Write failures are counted and logged, never fatal.
    fn route_batch(&self, statistics: &mut Statistics, writer: &mut EventWriter, batch: &EventBatch) {
        statistics.record_batch(batch);
        if batch.outcome == MatchOutcome::Dropped {
            match batch.records.first() {
                Some(first) => spdlog::warn!(
                    logger: self.logger,
                    "Dropped {} records starting at record {} of run {}",
                    batch.records.len(),
                    first.record_number,
                    first.run
                ),
                None => spdlog::warn!(logger: self.logger, "Dropped a trigger package with no gates"),
            }
        }
        for record in batch.records.iter() {
            if let Err(e) = writer.write(record, batch.outcome) {
                self.diagnostics.write_error();
                spdlog::error!(
                    logger: self.logger,
                    "Failed to write record {} of run {}: {e}",
                    record.record_number,
                    record.run
                );
            }
        }
    }

    /// Serve operator commands from the control channel until stopped
    fn monitor_loop(&self, context: &RunContext, trigger: &TriggerSource, poll: Duration) {
        spdlog::debug!(logger: self.logger, "Monitor loop started for run {}", context.run);
        while !context.stop.is_stopped() {
            match trigger.recv_control() {
                Ok(Some(ControlCommand::MeasureFrequency)) => {
                    if let Err(e) = self.measure_frequency(context) {
                        spdlog::warn!(logger: self.logger, "Frequency measurement failed: {e}");
                    }
                }
                Ok(Some(ControlCommand::Other(code))) => {
                    spdlog::debug!(logger: self.logger, "Ignoring control command {code}");
                }
                Ok(None) => (),
                Err(TriggerError::BadPacket(e)) => {
                    self.diagnostics.malformed_packet();
                    spdlog::debug!(logger: self.logger, "Discarded control packet: {e}");
                }
                Err(e) => {
                    spdlog::warn!(logger: self.logger, "Control receive failed: {e}");
                    context.stop.wait_timeout(poll);
                }
            }
        }
        spdlog::debug!(logger: self.logger, "Monitor loop finished for run {}", context.run);
    }

    /// Pause reading and correlation, probe the device, and publish the rates.
    ///
    /// The in-flight correlation window is discarded; the gates in it are not counted as dropped.
    fn measure_frequency(&self, context: &RunContext) -> Result<FrequencyReport, ExpositionError> {
        let mut source = lock(&self.source);
        let mut pipeline = lock(&self.pipeline);
        pipeline.matcher.reset();
        pipeline.hit_buffer.clear();

        let probe_start = Instant::now();
        let channel_rates = self.probe.measure(&mut **source, &context.stop)?;
        let elapsed = probe_start.elapsed();
        if let Err(e) = source.clear() {
            spdlog::warn!(logger: self.logger, "Failed to clear hit source after frequency probe: {e}");
        }

        let chamber_rates = to_chamber_rates(&channel_rates, &self.channel_map);
        context.monitor_log.append(&chamber_rates)?;
        let report = FrequencyReport {
            run: context.run,
            elapsed,
            channel_rates,
            chamber_rates,
        };
        self.diagnostics.frequency_measured();
        spdlog::info!(logger: self.logger, "Measured counting rates of {} chambers", report.chamber_rates.len());

        let observer = lock(&self.observer).clone();
        if let Some(observer) = observer {
            observer(&report);
        }
        Ok(report)
    }
}

/// ExpositionController owns the acquisition of one run at a time.
///
/// `start` spawns a read loop, a write loop, and (when correlating against a trigger stream) a
/// monitor loop. The read loop moves gates from the hit source into a shared buffer. The write
/// loop drains that buffer on every trigger package, correlates it, and writes the result. The
/// monitor loop runs frequency measurements on operator request. `stop` wakes and joins all of
/// them; once it returns nothing more is written.
pub struct ExpositionController {
    config: Config,
    mode: AcquisitionMode,
    shared: Arc<Shared>,
    state: Mutex<ExpositionState>,
    session: Mutex<Option<Session>>,
}

impl ExpositionController {
    /// Create a controller for a validated config. The mode follows the config's trigger section.
    pub fn new(
        config: Config,
        channel_map: ChannelMap,
        source: Box<dyn HitSource>,
        logger: Arc<Logger>,
    ) -> Result<Self, ExpositionError> {
        config.validate()?;
        let channel_map = Arc::new(channel_map);
        let shared = Shared {
            source: Mutex::new(source),
            pipeline: Mutex::new(Pipeline {
                hit_buffer: Vec::new(),
                matcher: EventMatcher::new(channel_map.clone()),
                statistics: Statistics::new(),
            }),
            diagnostics: Diagnostics::new(),
            channel_map,
            probe: FrequencyProbe::new(&config.frequency, logger.clone()),
            observer: Mutex::new(None),
            logger,
        };
        Ok(Self {
            mode: AcquisitionMode::from_config(&config),
            config,
            shared: Arc::new(shared),
            state: Mutex::new(ExpositionState::Idle),
            session: Mutex::new(None),
        })
    }

    /// Create a controller, loading the channel map named by the config
    pub fn from_config(
        config: Config,
        source: Box<dyn HitSource>,
        logger: Arc<Logger>,
    ) -> Result<Self, ExpositionError> {
        let channel_map = ChannelMap::new(config.channel_map_path.as_deref())?;
        Self::new(config, channel_map, source, logger)
    }

    /// Start acquiring a run. Fails without spawning anything if the run cannot be set up.
    pub fn start(&self, run: u64) -> Result<(), ExpositionError> {
        let mut session = lock(&self.session);
        if session.is_some() {
            return Err(ExpositionError::AlreadyRunning);
        }
        let logger = &self.shared.logger;

        let (device, settings) = {
            let source = lock(&self.shared.source);
            if !source.is_open() {
                spdlog::error!(logger: logger, "Cannot start run {run}: hit source is not open");
                return Err(ExpositionError::HitSourceNotOpen);
            }
            (source.name(), source.settings_snapshot())
        };

        let run_dir = self.config.get_run_directory(run);
        if let Err(e) = std::fs::create_dir_all(&run_dir) {
            spdlog::error!(logger: logger, "Cannot create run directory {}: {e}", run_dir.to_string_lossy());
            return Err(ExpositionError::IOError(e));
        }

        let trigger = match &self.mode {
            AcquisitionMode::Plain => None,
            AcquisitionMode::Correlated(trigger_config) => {
                Some(Arc::new(TriggerSource::bind(trigger_config)?))
            }
        };

        {
            let mut source = lock(&self.shared.source);
            source.set_mode(HitSourceMode::Trigger)?;
            source.clear()?;
        }
        let metadata = RunMetadataFile::create(&run_dir, run, &device, &settings)?;

        {
            let mut pipeline = lock(&self.shared.pipeline);
            pipeline.hit_buffer.clear();
            pipeline.matcher = EventMatcher::new(self.shared.channel_map.clone());
            pipeline.statistics = Statistics::new();
        }

        let context = RunContext {
            run,
            stop: Arc::new(StopSignal::new()),
            monitor_log: ChamberMonitorLog::new(&run_dir),
        };
        let threads = match self.spawn_loops(&context, trigger.as_ref()) {
            Ok(threads) => threads,
            Err((e, spawned)) => {
                context.stop.stop();
                if let Some(trigger) = &trigger {
                    let _ = trigger.interrupt();
                }
                for handle in spawned {
                    let _ = handle.join();
                }
                spdlog::error!(logger: logger, "Failed to spawn exposition threads: {e}");
                return Err(ExpositionError::IOError(e));
            }
        };

        *session = Some(Session {
            context,
            trigger,
            threads,
            metadata,
        });
        *lock(&self.state) = ExpositionState::Running;
        spdlog::info!(logger: logger, "Started exposition of run {run} on {device}");
        Ok(())
    }

    fn spawn_loops(
        &self,
        context: &RunContext,
        trigger: Option<&Arc<TriggerSource>>,
    ) -> Result<Vec<JoinHandle<()>>, (std::io::Error, Vec<JoinHandle<()>>)> {
        let mut threads = Vec::new();
        let interval = self.config.read_interval();
        let writer = EventWriter::new(
            &self.config.output_path,
            self.config.records_per_file,
            self.shared.logger.clone(),
        );

        let shared = self.shared.clone();
        let stop = context.stop.clone();
        match std::thread::Builder::new()
            .name(String::from("tds-read"))
            .spawn(move || shared.read_loop(&stop, interval))
        {
            Ok(handle) => threads.push(handle),
            Err(e) => return Err((e, threads)),
        }

        let spawned = match (&self.mode, trigger) {
            (AcquisitionMode::Correlated(trigger_config), Some(trigger)) => {
                let poll = trigger_config.poll_interval();
                let (shared, ctx, trg) = (self.shared.clone(), context.clone(), trigger.clone());
                let write = std::thread::Builder::new()
                    .name(String::from("tds-correlate"))
                    .spawn(move || shared.correlate_loop(&ctx, &trg, poll, writer));
                match write {
                    Ok(handle) => threads.push(handle),
                    Err(e) => return Err((e, threads)),
                }
                let (shared, ctx, trg) = (self.shared.clone(), context.clone(), trigger.clone());
                std::thread::Builder::new()
                    .name(String::from("tds-monitor"))
                    .spawn(move || shared.monitor_loop(&ctx, &trg, poll))
            }
            _ => {
                let (shared, ctx) = (self.shared.clone(), context.clone());
                std::thread::Builder::new()
                    .name(String::from("tds-write"))
                    .spawn(move || shared.plain_loop(&ctx, interval, writer))
            }
        };
        match spawned {
            Ok(handle) => threads.push(handle),
            Err(e) => return Err((e, threads)),
        }
        Ok(threads)
    }

    /// Stop the exposition and wait for every loop to exit. Does nothing when already idle.
    pub fn stop(&self) -> Result<(), ExpositionError> {
        let mut session = lock(&self.session);
        let Some(current) = session.take() else {
            return Ok(());
        };
        *lock(&self.state) = ExpositionState::Stopping;
        let logger = &self.shared.logger;

        current.context.stop.stop();
        if let Some(trigger) = &current.trigger {
            if let Err(e) = trigger.interrupt() {
                spdlog::warn!(logger: logger, "Failed to wake trigger receivers: {e}");
            }
        }
        for handle in current.threads {
            if handle.join().is_err() {
                spdlog::error!(logger: logger, "An exposition loop panicked");
            }
        }
        // Last reference to the sockets; dropping closes them
        drop(current.trigger);

        let result = current.metadata.append_stop();
        *lock(&self.state) = ExpositionState::Idle;

        let statistics = self.statistics();
        spdlog::info!(
            logger: logger,
            "Stopped exposition of run {}: {} matched and {} dropped triggers",
            current.context.run,
            statistics.triggers(MatchOutcome::Matched),
            statistics.triggers(MatchOutcome::Dropped)
        );
        result.map_err(ExpositionError::from)
    }

    /// Run a frequency measurement now, as the monitor loop does on request
    pub fn measure_frequency(&self) -> Result<FrequencyReport, ExpositionError> {
        let context = match lock(&self.session).as_ref() {
            Some(session) => session.context.clone(),
            None => return Err(ExpositionError::NotRunning),
        };
        self.shared.measure_frequency(&context)
    }

    pub fn set_observer(&self, observer: FrequencyObserver) {
        *lock(&self.shared.observer) = Some(observer);
    }

    pub fn state(&self) -> ExpositionState {
        *lock(&self.state)
    }

    /// The run being acquired, if any
    pub fn run(&self) -> Option<u64> {
        lock(&self.session).as_ref().map(|s| s.context.run)
    }

    /// Local addresses of the (info, control) receivers of the current session
    pub fn trigger_addrs(&self) -> Option<(SocketAddr, SocketAddr)> {
        let session = lock(&self.session);
        let trigger = session.as_ref()?.trigger.as_ref()?;
        Some((trigger.info_addr().ok()?, trigger.control_addr().ok()?))
    }

    /// A consistent snapshot of the run statistics, taken under the buffer lock
    pub fn statistics(&self) -> Statistics {
        lock(&self.shared.pipeline).statistics.clone()
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.shared.diagnostics.snapshot()
    }

    /// Gates read from the device and not yet handed to the matcher
    pub fn buffered_gates(&self) -> usize {
        lock(&self.shared.pipeline).hit_buffer.len()
    }

    /// Gates discarded without classification (before the first trigger, or by a frequency probe)
    pub fn discarded_gates(&self) -> u64 {
        lock(&self.shared.pipeline).matcher.discarded()
    }

    /// Locked access to the device, e.g. to configure it between runs
    pub fn with_hit_source<R>(&self, f: impl FnOnce(&mut dyn HitSource) -> R) -> R {
        let mut source = lock(&self.shared.source);
        f(&mut **source)
    }

    pub fn mode(&self) -> &AcquisitionMode {
        &self.mode
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn run_directory(&self, run: u64) -> PathBuf {
        self.config.get_run_directory(run)
    }
}

impl Drop for ExpositionController {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            spdlog::error!(logger: self.shared.logger, "Failed to stop exposition cleanly: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FrequencyConfig;
    use crate::event::{Edge, Hit};
    use crate::hit_source::scripted::ScriptedSource;
    use crate::tds_file::{run_file_name, RunFileReader};
    use crate::trigger::{encode_control_packet, encode_info_packet};
    use std::net::{Ipv4Addr, UdpSocket};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn loopback_trigger() -> TriggerConfig {
        TriggerConfig {
            interface: Ipv4Addr::LOCALHOST,
            info_group: Ipv4Addr::LOCALHOST,
            info_port: 0,
            control_group: Ipv4Addr::LOCALHOST,
            control_port: 0,
            poll_interval_ms: 20,
        }
    }

    fn test_config(dir: &Path, trigger: Option<TriggerConfig>) -> Config {
        Config {
            output_path: dir.to_path_buf(),
            channel_map_path: None,
            records_per_file: 100,
            read_interval_us: 500,
            frequency: FrequencyConfig {
                duration_ms: 5,
                slice_us: 500,
            },
            trigger,
        }
    }

    fn controller(config: Config, source: &ScriptedSource) -> ExpositionController {
        ExpositionController::new(
            config,
            ChannelMap::default_map(),
            Box::new(source.clone()),
            spdlog::default_logger(),
        )
        .unwrap()
    }

    fn gate(channels: &[u32]) -> EventHits {
        channels
            .iter()
            .map(|c| Hit::new(Edge::Leading, *c, 100 + c))
            .collect()
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(10) {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    /// Test side of the trigger system
    struct Feed {
        socket: UdpSocket,
        info: SocketAddr,
        control: SocketAddr,
    }

    impl Feed {
        fn new(exposition: &ExpositionController) -> Self {
            let (info, control) = exposition.trigger_addrs().unwrap();
            Self {
                socket: UdpSocket::bind("127.0.0.1:0").unwrap(),
                info,
                control,
            }
        }

        fn package(&self, exposition: &ExpositionController, run: u32, record_number: u32) {
            let before = exposition.diagnostics().packages_received;
            self.socket
                .send_to(&encode_info_packet(run, record_number), self.info)
                .unwrap();
            assert!(wait_until(
                || exposition.diagnostics().packages_received == before + 1
            ));
        }

        fn gates(&self, exposition: &ExpositionController, source: &ScriptedSource, gates: Vec<EventHits>) {
            let expected = exposition.buffered_gates() + gates.len();
            source.push_groups(gates);
            assert!(wait_until(|| exposition.buffered_gates() == expected));
        }
    }

    fn read_stream(dir: &Path, run: u64, outcome: MatchOutcome) -> Vec<EventRecord> {
        let path = dir
            .join(crate::config::get_run_str(run))
            .join(run_file_name(run, outcome, 0));
        RunFileReader::new(&path).unwrap().read_all().unwrap()
    }

    #[test]
    fn test_matched_gate_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new();
        let exposition = controller(test_config(dir.path(), Some(loopback_trigger())), &source);
        exposition.start(1).unwrap();
        assert_eq!(exposition.state(), ExpositionState::Running);
        let feed = Feed::new(&exposition);

        feed.package(&exposition, 1, 10);
        feed.gates(&exposition, &source, vec![gate(&[5, 6])]);
        feed.package(&exposition, 1, 11);
        exposition.stop().unwrap();

        let stats = exposition.statistics();
        assert_eq!(stats.triggers(MatchOutcome::Matched), 1);
        assert_eq!(stats.triggers(MatchOutcome::Dropped), 0);
        assert_eq!(stats.chamber_counts(MatchOutcome::Matched)[&1], [0, 1, 1, 0]);

        let records = read_stream(dir.path(), 1, MatchOutcome::Matched);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].run, 1);
        assert_eq!(records[0].record_number, 11);
        assert_eq!(records[0].hits.len(), 2);
        assert_eq!(records[0].hits[0].chamber, 1);
        assert_eq!(records[0].hits[0].wire, 1);
    }

    #[test]
    fn test_mismatched_batch_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new();
        let exposition = controller(test_config(dir.path(), Some(loopback_trigger())), &source);
        exposition.start(2).unwrap();
        let feed = Feed::new(&exposition);

        feed.package(&exposition, 2, 10);
        feed.gates(&exposition, &source, vec![gate(&[0]), gate(&[1])]);
        feed.package(&exposition, 2, 11);
        assert_eq!(exposition.statistics(), Statistics::new());
        feed.gates(&exposition, &source, vec![gate(&[2])]);
        feed.package(&exposition, 2, 12);
        exposition.stop().unwrap();

        let stats = exposition.statistics();
        assert_eq!(stats.triggers(MatchOutcome::Dropped), 2);
        assert_eq!(stats.packages(MatchOutcome::Dropped), 1);
        assert_eq!(stats.triggers(MatchOutcome::Matched), 1);

        let dropped: Vec<u64> = read_stream(dir.path(), 2, MatchOutcome::Dropped)
            .iter()
            .map(|r| r.record_number)
            .collect();
        assert_eq!(dropped, vec![11, 12]);
        let matched = read_stream(dir.path(), 2, MatchOutcome::Matched);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].record_number, 12);
    }

    #[test]
    fn test_stop_flushes_pending_window() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new();
        let exposition = controller(test_config(dir.path(), Some(loopback_trigger())), &source);
        exposition.start(3).unwrap();
        let feed = Feed::new(&exposition);

        feed.package(&exposition, 3, 10);
        feed.gates(&exposition, &source, vec![gate(&[0]), gate(&[4])]);
        feed.package(&exposition, 3, 11);
        exposition.stop().unwrap();

        let dropped: Vec<u64> = read_stream(dir.path(), 3, MatchOutcome::Dropped)
            .iter()
            .map(|r| r.record_number)
            .collect();
        assert_eq!(dropped, vec![11, 12]);
        assert_eq!(exposition.statistics().triggers(MatchOutcome::Dropped), 2);

        let metadata = dir.path().join("run_000003").join("run_000003.yml");
        let value: serde_yaml::Value =
            serde_yaml::from_str(&std::fs::read_to_string(metadata).unwrap()).unwrap();
        assert_eq!(value["device"].as_str(), Some("scripted-tdc"));
        assert!(value["stop"].as_str().is_some());
    }

    #[test]
    fn test_malformed_package_is_counted() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new();
        let exposition = controller(test_config(dir.path(), Some(loopback_trigger())), &source);
        exposition.start(4).unwrap();
        let feed = Feed::new(&exposition);

        feed.socket.send_to(b"NOT A TRIGGER!", feed.info).unwrap();
        assert!(wait_until(|| exposition.diagnostics().malformed_packets == 1));
        feed.package(&exposition, 4, 1);
        exposition.stop().unwrap();
        assert_eq!(exposition.diagnostics().packages_received, 1);
        assert_eq!(exposition.statistics(), Statistics::new());
    }

    #[test]
    fn test_frequency_request_over_control_channel() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new();
        source.script.lock().unwrap().raw_hits =
            vec![Hit::new(Edge::Leading, 5, 1), Hit::new(Edge::Leading, 9, 2)];
        let exposition = controller(test_config(dir.path(), Some(loopback_trigger())), &source);
        let observed = Arc::new(AtomicUsize::new(0));
        let counter = observed.clone();
        exposition.set_observer(Arc::new(move |report: &FrequencyReport| {
            assert_eq!(report.run, 5);
            assert!(report.chamber_rates[&1][1] > 0.0);
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        exposition.start(5).unwrap();
        let feed = Feed::new(&exposition);

        feed.package(&exposition, 5, 10);
        feed.gates(&exposition, &source, vec![gate(&[0])]);
        feed.package(&exposition, 5, 12);
        feed.socket
            .send_to(&encode_control_packet(6), feed.control)
            .unwrap();
        assert!(wait_until(|| exposition.diagnostics().frequency_measurements == 1));
        assert!(wait_until(|| observed.load(Ordering::SeqCst) == 1));

        // The probe throws away the undecided window without dropping it
        assert!(exposition.discarded_gates() >= 1);

        // Correlation starts over from the next package
        feed.package(&exposition, 5, 20);
        feed.gates(&exposition, &source, vec![gate(&[5])]);
        feed.package(&exposition, 5, 21);
        exposition.stop().unwrap();
        assert_eq!(exposition.statistics().triggers(MatchOutcome::Dropped), 0);
        assert_eq!(exposition.statistics().triggers(MatchOutcome::Matched), 1);
        let matched = read_stream(dir.path(), 5, MatchOutcome::Matched);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].record_number, 21);

        let run_dir = dir.path().join("run_000005");
        let line = std::fs::read_to_string(run_dir.join("chamber_01.freq")).unwrap();
        assert_eq!(line.lines().count(), 1);
        assert!(run_dir.join("chamber_07.freq").exists());
        let script = source.script.lock().unwrap();
        assert!(script.mode_history.contains(&HitSourceMode::Continuous));
        assert_eq!(script.mode_history.last(), Some(&HitSourceMode::Trigger));
    }

    #[test]
    fn test_plain_mode_survives_device_errors() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new();
        let exposition = controller(test_config(dir.path(), None), &source);
        assert_eq!(exposition.mode(), &AcquisitionMode::Plain);
        exposition.start(6).unwrap();
        assert!(exposition.trigger_addrs().is_none());

        for _ in 0..3 {
            source.push_failure("bus error");
        }
        source.push_groups(vec![gate(&[0]), gate(&[1])]);
        source.push_groups(vec![gate(&[2])]);
        assert!(wait_until(
            || exposition.statistics().triggers(MatchOutcome::Matched) == 3
        ));
        exposition.stop().unwrap();

        assert_eq!(exposition.diagnostics().device_errors, 3);
        let numbers: Vec<u64> = read_stream(dir.path(), 6, MatchOutcome::Matched)
            .iter()
            .map(|r| r.record_number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn test_write_failure_is_counted_and_acquisition_continues() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new();
        let exposition = controller(test_config(dir.path(), None), &source);
        exposition.start(12).unwrap();

        source.push_groups(vec![gate(&[0])]);
        assert!(wait_until(
            || exposition.statistics().triggers(MatchOutcome::Matched) == 1
        ));
        let file = dir.path().join("run_000012").join("run_000012_0000.tds");
        let committed = std::fs::read(&file).unwrap();

        // A directory in place of the run file makes every append fail
        std::fs::remove_file(&file).unwrap();
        std::fs::create_dir(&file).unwrap();
        source.push_groups(vec![gate(&[1])]);
        assert!(wait_until(
            || exposition.statistics().triggers(MatchOutcome::Matched) == 2
        ));
        assert_eq!(exposition.diagnostics().write_errors, 1);
        assert_eq!(exposition.state(), ExpositionState::Running);

        std::fs::remove_dir(&file).unwrap();
        std::fs::write(&file, &committed).unwrap();
        source.push_groups(vec![gate(&[2])]);
        assert!(wait_until(
            || exposition.statistics().triggers(MatchOutcome::Matched) == 3
        ));
        exposition.stop().unwrap();

        assert_eq!(exposition.diagnostics().write_errors, 1);
        let numbers: Vec<u64> = read_stream(dir.path(), 12, MatchOutcome::Matched)
            .iter()
            .map(|r| r.record_number)
            .collect();
        assert_eq!(numbers, vec![1, 3]);
    }

    #[test]
    fn test_lifecycle_errors() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new();
        let exposition = controller(test_config(dir.path(), None), &source);
        assert!(matches!(
            exposition.measure_frequency(),
            Err(ExpositionError::NotRunning)
        ));
        exposition.stop().unwrap();

        exposition.start(7).unwrap();
        assert!(matches!(
            exposition.start(8),
            Err(ExpositionError::AlreadyRunning)
        ));
        assert_eq!(exposition.run(), Some(7));
        exposition.stop().unwrap();
        exposition.stop().unwrap();
        assert_eq!(exposition.state(), ExpositionState::Idle);
        assert_eq!(exposition.run(), None);

        let mut closed = ScriptedSource::new();
        closed.open = false;
        let exposition = controller(test_config(dir.path(), None), &closed);
        assert!(matches!(
            exposition.start(9),
            Err(ExpositionError::HitSourceNotOpen)
        ));
        assert_eq!(exposition.state(), ExpositionState::Idle);
        assert!(!dir.path().join("run_000009").exists());
    }

    #[test]
    fn test_start_configures_device_and_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new();
        let exposition = controller(test_config(dir.path(), None), &source);
        exposition.start(10).unwrap();
        source.push_groups(vec![gate(&[3])]);
        assert!(wait_until(
            || exposition.statistics().triggers(MatchOutcome::Matched) == 1
        ));
        exposition.stop().unwrap();

        exposition.start(11).unwrap();
        assert_eq!(exposition.statistics(), Statistics::new());
        exposition.stop().unwrap();

        let script = source.script.lock().unwrap();
        assert_eq!(script.clears, 2);
        assert_eq!(
            script.mode_history,
            vec![HitSourceMode::Trigger, HitSourceMode::Trigger]
        );
        let name = exposition.with_hit_source(|s| s.name());
        assert_eq!(name, "scripted-tdc");
    }
}
