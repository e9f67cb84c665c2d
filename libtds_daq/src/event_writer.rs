use spdlog::Logger;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::config::get_run_str;
use super::constants::TDS_MAGIC;
use super::error::WriteError;
use super::event::{EventRecord, MatchOutcome};
use super::tds_file::{encode_record, parse_run_file_name, run_file_name, RunFileStack};

/// Position of one record stream within its current file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StreamCursor {
    run: u64,
    index: u32,
    records_in_file: u64,
}

/// Writes EventRecords into rotating TDS files, one directory per run.
///
/// Matched and dropped records are kept in separate streams of the same run directory, each
/// rotated independently after `records_per_file` records. A file is only open for the duration
/// of a single write: it is opened for append, receives one whole record, and is closed again.
/// If that write fails the file is cut back to its previous length, so the bytes already in it
/// stay valid.
#[derive(Debug)]
pub struct EventWriter {
    output_path: PathBuf,
    records_per_file: u64,
    matched: Option<StreamCursor>,
    dropped: Option<StreamCursor>,
    run_dir: Option<(u64, PathBuf)>,
    logger: Arc<Logger>,
}

impl EventWriter {
    /// Create the writer. Nothing touches the disk until the first record is written.
    pub fn new(output_path: &Path, records_per_file: u64, logger: Arc<Logger>) -> Self {
        Self {
            output_path: output_path.to_path_buf(),
            records_per_file: records_per_file.max(1),
            matched: None,
            dropped: None,
            run_dir: None,
            logger,
        }
    }

    /// Append one record to the stream selected by the outcome, rotating files as needed
    pub fn write(&mut self, record: &EventRecord, outcome: MatchOutcome) -> Result<(), WriteError> {
        let run_dir = self.get_run_directory(record.run)?;
        let current = match outcome {
            MatchOutcome::Matched => self.matched,
            MatchOutcome::Dropped => self.dropped,
        };

        let (cursor, is_new_file) = match current {
            Some(c) if c.run == record.run && c.records_in_file < self.records_per_file => (c, false),
            Some(c) if c.run == record.run => {
                self.log_rotation(&run_dir, &c, outcome);
                (
                    StreamCursor {
                        run: c.run,
                        index: c.index + 1,
                        records_in_file: 0,
                    },
                    true,
                )
            }
            _ => (
                StreamCursor {
                    run: record.run,
                    index: next_free_index(&run_dir, outcome)?,
                    records_in_file: 0,
                },
                true,
            ),
        };

        let path = run_dir.join(run_file_name(record.run, outcome, cursor.index));
        let bytes = encode_record(record);
        if is_new_file {
            write_new_file(&path, &bytes)?;
        } else {
            append_to_file(&path, &bytes)?;
        }

        let advanced = StreamCursor {
            records_in_file: cursor.records_in_file + 1,
            ..cursor
        };
        match outcome {
            MatchOutcome::Matched => self.matched = Some(advanced),
            MatchOutcome::Dropped => self.dropped = Some(advanced),
        }
        Ok(())
    }

    /// Path of the file the next record of a stream would go to, if a file is in use
    pub fn current_file(&self, outcome: MatchOutcome) -> Option<PathBuf> {
        let cursor = match outcome {
            MatchOutcome::Matched => self.matched,
            MatchOutcome::Dropped => self.dropped,
        }?;
        Some(
            self.output_path
                .join(get_run_str(cursor.run))
                .join(run_file_name(cursor.run, outcome, cursor.index)),
        )
    }

    /// Get the directory of a run, creating it the first time the run is seen
    fn get_run_directory(&mut self, run: u64) -> Result<PathBuf, WriteError> {
        if let Some((current, dir)) = &self.run_dir {
            if *current == run {
                return Ok(dir.clone());
            }
        }
        let dir = self.output_path.join(get_run_str(run));
        if !dir.exists() {
            std::fs::create_dir_all(&dir).map_err(|e| WriteError::BadRunDirectory(dir.clone(), e))?;
            spdlog::info!(logger: self.logger, "Created run directory {}", dir.to_string_lossy());
        }
        self.run_dir = Some((run, dir.clone()));
        Ok(dir)
    }

    fn log_rotation(&self, run_dir: &Path, cursor: &StreamCursor, outcome: MatchOutcome) {
        let path = run_dir.join(run_file_name(cursor.run, outcome, cursor.index));
        let size = path.metadata().map(|m| m.len()).unwrap_or(0);
        spdlog::info!(
            logger: self.logger,
            "Closed {} with {} records ({})",
            path.to_string_lossy(),
            cursor.records_in_file,
            human_bytes::human_bytes(size as f64)
        );
    }
}

/// The first rotation index not already used by a stream in this run directory
fn next_free_index(run_dir: &Path, outcome: MatchOutcome) -> Result<u32, WriteError> {
    let (existing, _) = RunFileStack::get_file_stack(run_dir, outcome)?;
    // The stack is sorted by index, so the last file holds the highest one
    let last_index = existing
        .back()
        .and_then(|path| path.file_name())
        .and_then(|name| parse_run_file_name(&name.to_string_lossy()))
        .map(|(_, index)| index);
    Ok(last_index.map_or(0, |index| index + 1))
}

/// Create a file holding the magic tag and a first record
fn write_new_file(path: &Path, record_bytes: &[u8]) -> Result<(), WriteError> {
    let mut bytes = Vec::with_capacity(TDS_MAGIC.len() + record_bytes.len());
    bytes.extend_from_slice(TDS_MAGIC);
    bytes.extend_from_slice(record_bytes);

    let result = File::create(path).and_then(|mut file| {
        file.write_all(&bytes)?;
        file.flush()
    });
    if let Err(e) = result {
        // A half written new file would be unreadable; leave nothing behind
        let _ = std::fs::remove_file(path);
        return Err(WriteError::IOError(e));
    }
    Ok(())
}

/// Append a record, restoring the previous length if anything goes wrong
fn append_to_file(path: &Path, record_bytes: &[u8]) -> Result<(), WriteError> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    let committed = file.metadata()?.len();
    let result = file.write_all(record_bytes).and_then(|_| file.flush());
    if let Err(e) = result {
        let _ = file.set_len(committed);
        return Err(WriteError::IOError(e));
    }
    Ok(())
}
