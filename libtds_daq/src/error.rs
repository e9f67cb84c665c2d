use std::path::PathBuf;
use thiserror::Error;

use super::constants::*;

#[derive(Debug, Error)]
pub enum ChannelMapError {
    #[error("ChannelMap failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("ChannelMap failed to parse an integer: {0}")]
    ParsingError(#[from] std::num::ParseIntError),
    #[error("ChannelMap was given a file with the incorrect format; most likely the number of columns is incorrect")]
    BadFileFormat,
    #[error("ChannelMap found wire {0} for channel {1}; wires must be below {max}", max=WIRES_PER_CHAMBER)]
    BadWire(u32, u32),
    #[error("ChannelMap found channel {0} more than once")]
    DuplicateChannel(u32),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config has an invalid value for {0}: must be non-zero")]
    ZeroValue(&'static str),
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Hit source reported a device error: {0}")]
    Device(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("Packet of {0} bytes is too short; expected at least {1}")]
    TooShort(usize, usize),
    #[error("Packet does not start with the expected keyword")]
    BadKeyword,
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("TriggerSource failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("TriggerSource received a malformed packet: {0}")]
    BadPacket(#[from] PacketError),
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("EventWriter failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("EventWriter failed to create run directory {0:?}: {1}")]
    BadRunDirectory(PathBuf, std::io::Error),
    #[error("EventWriter failed to list existing run files: {0}")]
    RunFileError(#[from] RunFileError),
}

#[derive(Debug, Error)]
pub enum RunFileError {
    #[error("RunFile failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Could not open RunFile because file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("RunFile has magic tag {0:?}; expected {exp:?}", exp=TDS_MAGIC)]
    BadMagic([u8; 4]),
    #[error("RunFile found invalid edge tag {0}")]
    BadEdge(u8),
    #[error("RunFile ended in the middle of a record")]
    Truncated,
    #[error("RunFileStack did not find any matching files in the run directory")]
    NoMatchingFiles,
}

#[derive(Debug, Error)]
pub enum RunLogError {
    #[error("RunLog failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("RunLog failed to convert to yaml: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("RunLog failed to format a timestamp: {0}")]
    TimeFormat(#[from] time::error::Format),
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("FrequencyProbe failed due to device error: {0}")]
    DeviceError(#[from] DeviceError),
    #[error("FrequencyProbe was cancelled before any time elapsed")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ExpositionError {
    #[error("Exposition is already running")]
    AlreadyRunning,
    #[error("Exposition is not running")]
    NotRunning,
    #[error("Exposition cannot start because the hit source is not open")]
    HitSourceNotOpen,
    #[error("Exposition failed due to device error: {0}")]
    DeviceError(#[from] DeviceError),
    #[error("Exposition failed due to TriggerSource error: {0}")]
    TriggerError(#[from] TriggerError),
    #[error("Exposition failed due to RunLog error: {0}")]
    RunLogError(#[from] RunLogError),
    #[error("Exposition failed due to FrequencyProbe error: {0}")]
    ProbeError(#[from] ProbeError),
    #[error("Exposition failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Exposition failed due to ChannelMap error: {0}")]
    MapError(#[from] ChannelMapError),
    #[error("Exposition failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}
