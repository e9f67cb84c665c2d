//! The TDS run file format.
//!
//! A run file starts with the four byte tag `TDSa` followed by records until end-of-file.
//! There is no record count; a file is self-delimiting. All integers are little-endian.
//!
//! ```text
//! record: run u64 | record_number u64 | hit_count u32 | hit * hit_count
//! hit:    edge u8 | wire u8 | chamber u32 | time u32
//! ```
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use super::config::get_run_str;
use super::constants::{HIT_SIZE, RECORD_HEADER_SIZE, TDS_EXTENSION, TDS_MAGIC};
use super::error::RunFileError;
use super::event::{Edge, EventRecord, MappedHit, MatchOutcome};

const DROPPED_TAG: &str = "dropped";
const MAX_PREALLOCATED_HITS: usize = 256;

/// Name of one rotation of one record stream of a run
pub fn run_file_name(run: u64, outcome: MatchOutcome, index: u32) -> String {
    match outcome {
        MatchOutcome::Matched => format!("{}_{index:0>4}.{TDS_EXTENSION}", get_run_str(run)),
        MatchOutcome::Dropped => format!(
            "{}_{DROPPED_TAG}_{index:0>4}.{TDS_EXTENSION}",
            get_run_str(run)
        ),
    }
}

/// Split a run file name into its stream and rotation index
pub fn parse_run_file_name(name: &str) -> Option<(MatchOutcome, u32)> {
    let stem = name.strip_suffix(&format!(".{TDS_EXTENSION}"))?;
    let (stem, index) = stem.rsplit_once('_')?;
    let index = index.parse().ok()?;
    if !stem.starts_with("run_") {
        return None;
    }
    if stem.ends_with(&format!("_{DROPPED_TAG}")) {
        Some((MatchOutcome::Dropped, index))
    } else {
        Some((MatchOutcome::Matched, index))
    }
}

/// Size of a serialized record in bytes
pub fn encoded_size(record: &EventRecord) -> usize {
    RECORD_HEADER_SIZE + HIT_SIZE * record.hits.len()
}

/// Serialize a record into a writer
pub fn write_record<W: Write>(writer: &mut W, record: &EventRecord) -> std::io::Result<()> {
    writer.write_u64::<LittleEndian>(record.run)?;
    writer.write_u64::<LittleEndian>(record.record_number)?;
    writer.write_u32::<LittleEndian>(record.hits.len() as u32)?;
    for hit in record.hits.iter() {
        writer.write_u8(hit.edge.tag())?;
        writer.write_u8(hit.wire)?;
        writer.write_u32::<LittleEndian>(hit.chamber)?;
        writer.write_u32::<LittleEndian>(hit.time)?;
    }
    Ok(())
}

/// Serialize a record into a fresh buffer
pub fn encode_record(record: &EventRecord) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(encoded_size(record));
    // Writing into a Vec cannot fail
    let _ = write_record(&mut buffer, record);
    buffer
}

/// Fill buf completely. Returns false if the reader was already at end-of-file.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool, RunFileError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(RunFileError::IOError(e)),
        }
    }
    if filled == 0 {
        Ok(false)
    } else if filled < buf.len() {
        Err(RunFileError::Truncated)
    } else {
        Ok(true)
    }
}

fn truncated_on_eof(e: std::io::Error) -> RunFileError {
    if e.kind() == ErrorKind::UnexpectedEof {
        RunFileError::Truncated
    } else {
        RunFileError::IOError(e)
    }
}

/// Deserialize the next record. Returns None on a clean end-of-file.
pub fn read_record<R: Read>(reader: &mut R) -> Result<Option<EventRecord>, RunFileError> {
    let mut header = [0u8; RECORD_HEADER_SIZE];
    if !read_exact_or_eof(reader, &mut header)? {
        return Ok(None);
    }
    let mut cursor = &header[..];
    let run = cursor.read_u64::<LittleEndian>()?;
    let record_number = cursor.read_u64::<LittleEndian>()?;
    let n_hits = cursor.read_u32::<LittleEndian>()?;

    // The count comes from disk; grow past this only as hits are actually read
    let mut hits = Vec::with_capacity((n_hits as usize).min(MAX_PREALLOCATED_HITS));
    for _ in 0..n_hits {
        let tag = reader.read_u8().map_err(truncated_on_eof)?;
        let edge = Edge::from_tag(tag).ok_or(RunFileError::BadEdge(tag))?;
        let wire = reader.read_u8().map_err(truncated_on_eof)?;
        let chamber = reader
            .read_u32::<LittleEndian>()
            .map_err(truncated_on_eof)?;
        let time = reader
            .read_u32::<LittleEndian>()
            .map_err(truncated_on_eof)?;
        hits.push(MappedHit {
            edge,
            wire,
            chamber,
            time,
        });
    }

    Ok(Some(EventRecord {
        run,
        record_number,
        hits,
    }))
}

/// Sequential reader over the records of one TDS run file
#[derive(Debug)]
pub struct RunFileReader {
    path: PathBuf,
    reader: BufReader<File>,
    size_bytes: u64,
    is_eof: bool,
}

impl RunFileReader {
    /// Open a run file and check its magic tag
    pub fn new(path: &Path) -> Result<Self, RunFileError> {
        if !path.exists() {
            return Err(RunFileError::BadFilePath(path.to_path_buf()));
        }
        let file = File::open(path)?;
        let size_bytes = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut magic = [0u8; 4];
        if !read_exact_or_eof(&mut reader, &mut magic)? {
            return Err(RunFileError::Truncated);
        }
        if &magic != TDS_MAGIC {
            return Err(RunFileError::BadMagic(magic));
        }
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            size_bytes,
            is_eof: size_bytes == TDS_MAGIC.len() as u64,
        })
    }

    /// Get the next record in the file. Returns None at end-of-file
    pub fn next_record(&mut self) -> Result<Option<EventRecord>, RunFileError> {
        if self.is_eof {
            return Ok(None);
        }
        let record = read_record(&mut self.reader)?;
        if record.is_none() {
            self.is_eof = true;
        }
        Ok(record)
    }

    /// Read every remaining record
    pub fn read_all(&mut self) -> Result<Vec<EventRecord>, RunFileError> {
        let mut records = Vec::new();
        while let Some(record) = self.next_record()? {
            records.push(record);
        }
        Ok(records)
    }

    pub fn get_size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn get_filename(&self) -> &Path {
        &self.path
    }

    pub fn is_eof(&self) -> bool {
        self.is_eof
    }
}

/// All of the rotation files of one record stream of a run, read in rotation order.
#[derive(Debug)]
pub struct RunFileStack {
    file_stack: VecDeque<PathBuf>,
    active_file: Option<RunFileReader>,
    total_stack_size_bytes: u64,
}

impl RunFileStack {
    /// Create a new RunFileStack for the given stream of a run directory
    pub fn new(run_dir: &Path, outcome: MatchOutcome) -> Result<Self, RunFileError> {
        let (mut stack, bytes) = Self::get_file_stack(run_dir, outcome)?;
        if let Some(file_path) = stack.pop_front() {
            Ok(Self {
                file_stack: stack,
                active_file: Some(RunFileReader::new(&file_path)?),
                total_stack_size_bytes: bytes,
            })
        } else {
            Err(RunFileError::NoMatchingFiles)
        }
    }

    /// Get the next record in the stack
    ///
    /// Returns a `Result<Option<EventRecord>>`. The Option is None if the stack has
    /// no more data.
    pub fn get_next_record(&mut self) -> Result<Option<EventRecord>, RunFileError> {
        loop {
            let Some(active) = self.active_file.as_mut() else {
                return Ok(None);
            };
            match active.next_record()? {
                Some(record) => return Ok(Some(record)),
                None => self.move_to_next_file()?,
            }
        }
    }

    pub fn get_total_size_bytes(&self) -> u64 {
        self.total_stack_size_bytes
    }

    /// Paths of the files not yet opened
    pub fn get_file_stack_ref(&self) -> &VecDeque<PathBuf> {
        &self.file_stack
    }

    /// List the files of one stream, sorted by rotation index
    pub fn get_file_stack(
        parent_path: &Path,
        outcome: MatchOutcome,
    ) -> Result<(VecDeque<PathBuf>, u64), RunFileError> {
        let mut file_list: Vec<(u32, PathBuf, u64)> = Vec::new();
        for item in parent_path.read_dir()? {
            let item = item?;
            let name = item.file_name();
            let Some((stream, index)) = parse_run_file_name(&name.to_string_lossy()) else {
                continue;
            };
            if stream == outcome {
                file_list.push((index, item.path(), item.metadata()?.len()));
            }
        }

        file_list.sort_by_key(|(index, _, _)| *index);
        let total_stack_size_bytes = file_list.iter().map(|(_, _, bytes)| bytes).sum();
        let stack = file_list.into_iter().map(|(_, path, _)| path).collect();

        Ok((stack, total_stack_size_bytes))
    }

    ///Move to the next file in the stack
    fn move_to_next_file(&mut self) -> Result<(), RunFileError> {
        loop {
            if let Some(next_file_path) = self.file_stack.pop_front() {
                let next_file = RunFileReader::new(&next_file_path)?;
                if !next_file.is_eof() {
                    self.active_file = Some(next_file);
                    return Ok(());
                }
            } else {
                self.active_file = None;
                return Ok(());
            }
        }
    }
}
