use clap::{Arg, Command};
use indicatif::{MultiProgress, ProgressBar};
use indicatif_log_bridge::LogWrapper;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use libtds_daq::channel_map::ChannelMap;
use libtds_daq::config::Config;
use libtds_daq::error::RunFileError;
use libtds_daq::event::MatchOutcome;
use libtds_daq::statistics::Statistics;
use libtds_daq::tds_file::{parse_run_file_name, RunFileReader, RunFileStack};

fn make_template_config(path: &Path) -> std::io::Result<()> {
    let config = Config::default();
    let yaml_str = serde_yaml::to_string(&config).map_err(std::io::Error::other)?;
    let mut file = File::create(path)?;
    file.write_all(yaml_str.as_bytes())
}

/// Record number range and count of one stream
#[derive(Debug, Default)]
struct StreamSummary {
    first: Option<u64>,
    last: Option<u64>,
    records: u64,
    bytes: u64,
}

/// Every run file under the path, tagged with its stream
fn collect_run_files(path: &Path) -> Result<Vec<(MatchOutcome, PathBuf)>, RunFileError> {
    if path.is_file() {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let outcome = parse_run_file_name(&name)
            .map(|(outcome, _)| outcome)
            .unwrap_or(MatchOutcome::Matched);
        return Ok(vec![(outcome, path.to_path_buf())]);
    }
    if !path.is_dir() {
        return Err(RunFileError::BadFilePath(path.to_path_buf()));
    }
    let mut files = Vec::new();
    for outcome in [MatchOutcome::Matched, MatchOutcome::Dropped] {
        let (stack, _) = RunFileStack::get_file_stack(path, outcome)?;
        files.extend(stack.into_iter().map(|p| (outcome, p)));
    }
    if files.is_empty() {
        return Err(RunFileError::NoMatchingFiles);
    }
    Ok(files)
}

fn inspect(path: &Path, pb_manager: &MultiProgress) -> Result<(), RunFileError> {
    let files = collect_run_files(path)?;
    log::info!("Found {} run files.", files.len());

    let pb = pb_manager.add(ProgressBar::new(files.len() as u64));
    let mut stats = Statistics::new();
    let mut matched = StreamSummary::default();
    let mut dropped = StreamSummary::default();
    let mut runs = std::collections::BTreeSet::new();

    for (outcome, file_path) in files.iter() {
        let mut reader = RunFileReader::new(file_path)?;
        let summary = match outcome {
            MatchOutcome::Matched => &mut matched,
            MatchOutcome::Dropped => &mut dropped,
        };
        summary.bytes += reader.get_size_bytes();
        let records = match reader.read_all() {
            Ok(records) => records,
            Err(e) => {
                log::error!("Failed to read {}: {e}", file_path.to_string_lossy());
                pb.inc(1);
                continue;
            }
        };
        for record in records.iter() {
            runs.insert(record.run);
            summary.first = Some(summary.first.map_or(record.record_number, |f| f.min(record.record_number)));
            summary.last = Some(summary.last.map_or(record.record_number, |l| l.max(record.record_number)));
        }
        summary.records += records.len() as u64;
        stats.increment_triggers(records.len() as u64, *outcome);
        stats.increment_chamber_counts(&records, *outcome);
        pb.inc(1);
    }
    pb.finish();

    log::info!("Runs: {runs:?}");
    for (label, outcome, summary) in [
        ("Matched", MatchOutcome::Matched, &matched),
        ("Dropped", MatchOutcome::Dropped, &dropped),
    ] {
        match (summary.first, summary.last) {
            (Some(first), Some(last)) => log::info!(
                "{label}: {} records, record numbers {first} to {last}, {}",
                summary.records,
                human_bytes::human_bytes(summary.bytes as f64)
            ),
            _ => log::info!("{label}: no records"),
        }
        for (chamber, wires) in stats.chamber_counts(outcome).iter() {
            log::info!("{label} chamber {chamber:0>2}: {wires:?}");
        }
    }
    log::info!("Drop fraction: {:.4}", stats.drop_fraction());
    Ok(())
}

fn check_map(path: &Path) {
    match ChannelMap::new(Some(path)) {
        Ok(map) => log::info!(
            "Channel map defines {} channels on {} chambers.",
            map.len(),
            map.chambers().len()
        ),
        Err(e) => log::error!("{e}"),
    }
}

fn main() {
    // Create a cli
    let matches = Command::new("tds_daq_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .subcommand(Command::new("inspect").about("Summarize a TDS run file or run directory"))
        .subcommand(Command::new("check-map").about("Validate a channel map csv file"))
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .help("Path to the file")
                .required(true),
        )
        .get_matches();

    // Initialize feedback
    let logger = simplelog::TermLogger::new(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let pb_manager = MultiProgress::new();

    if let Err(e) = LogWrapper::new(pb_manager.clone(), logger).try_init() {
        eprintln!("Could not create logging/progress: {e}");
        return;
    }

    let Some(path) = matches.get_one::<String>("path").map(PathBuf::from) else {
        log::error!("A path is required");
        return;
    };

    match matches.subcommand() {
        Some(("new", _)) => {
            log::info!("Making a template config at {}...", path.to_string_lossy());
            match make_template_config(&path) {
                Ok(()) => log::info!("Done."),
                Err(e) => log::error!("Could not write template config: {e}"),
            }
        }
        Some(("inspect", _)) => {
            log::info!("Inspecting {}...", path.to_string_lossy());
            match inspect(&path, &pb_manager) {
                Ok(()) => log::info!("Done."),
                Err(e) => log::error!("Inspection failed with error: {e}"),
            }
        }
        Some(("check-map", _)) => {
            log::info!("Loading channel map from {}...", path.to_string_lossy());
            check_map(&path);
        }
        _ => {
            // Without a subcommand, validate a configuration file
            log::info!("Loading config from {}...", path.to_string_lossy());
            match Config::read_config_file(&path) {
                Ok(config) => {
                    log::info!("Config successfully loaded.");
                    log::info!("Output Path: {}", config.output_path.to_string_lossy());
                    log::info!("Records per file: {}", config.records_per_file);
                    log::info!("Correlated with trigger: {}", config.is_correlated());
                }
                Err(e) => log::error!("{e}"),
            }
        }
    }
}
