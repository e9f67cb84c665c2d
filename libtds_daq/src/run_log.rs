use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::config::get_run_str;
use super::error::RunLogError;
use super::frequency::ChamberRates;

/// The current UTC time as an RFC 3339 string
pub fn timestamp_now() -> Result<String, RunLogError> {
    Ok(OffsetDateTime::now_utc().format(&Rfc3339)?)
}

#[derive(Debug, Serialize)]
struct RunInfo<'a> {
    run: u64,
    start: String,
    device: &'a str,
    settings: &'a BTreeMap<String, String>,
}

/// Text file describing one run, `run_NNNNNN.yml` in the run directory.
///
/// Written once when the exposition starts; the stop time is appended when it ends.
/// The result is a YAML mapping.
#[derive(Debug, Clone)]
pub struct RunMetadataFile {
    path: PathBuf,
}

impl RunMetadataFile {
    pub fn create(
        run_dir: &Path,
        run: u64,
        device: &str,
        settings: &BTreeMap<String, String>,
    ) -> Result<Self, RunLogError> {
        let path = run_dir.join(format!("{}.yml", get_run_str(run)));
        let info = RunInfo {
            run,
            start: timestamp_now()?,
            device,
            settings,
        };
        let mut file = File::create(&path)?;
        file.write_all(serde_yaml::to_string(&info)?.as_bytes())?;
        Ok(Self { path })
    }

    pub fn append_stop(&self) -> Result<(), RunLogError> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        writeln!(file, "stop: '{}'", timestamp_now()?)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Per chamber counting-rate logs of one run, `chamber_CC.freq` in the run directory.
///
/// Each measurement appends one line per chamber: a timestamp and the rate of every wire.
#[derive(Debug, Clone)]
pub struct ChamberMonitorLog {
    run_dir: PathBuf,
}

impl ChamberMonitorLog {
    pub fn new(run_dir: &Path) -> Self {
        Self {
            run_dir: run_dir.to_path_buf(),
        }
    }

    pub fn chamber_path(&self, chamber: u32) -> PathBuf {
        self.run_dir.join(format!("chamber_{chamber:0>2}.freq"))
    }

    pub fn append(&self, rates: &ChamberRates) -> Result<(), RunLogError> {
        let timestamp = timestamp_now()?;
        for (chamber, wires) in rates.iter() {
            let mut line = timestamp.clone();
            for rate in wires.iter() {
                line.push_str(&format!(" {rate:.2}"));
            }
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.chamber_path(*chamber))?;
            writeln!(file, "{line}")?;
        }
        Ok(())
    }
}
