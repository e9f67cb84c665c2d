// The TDC numbers its inputs flat, but the detector is organised as chambers of
// four wires each. The map is loaded once before an exposition starts and is only
// read afterwards, so it is shared behind an Arc by every component that needs
// a logical address.
use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use fxhash::FxHashMap;

use super::constants::WIRES_PER_CHAMBER;
use super::error::ChannelMapError;

const ENTRIES_PER_LINE: usize = 3; //Number of elements in a single row in the CSV file

/// Load the default map for windows
#[cfg(target_family = "windows")]
fn load_default_map() -> String {
    String::from(include_str!("data\\default_channel_map.csv"))
}

/// Load the default map for macos and linux
#[cfg(target_family = "unix")]
fn load_default_map() -> String {
    String::from(include_str!("data/default_channel_map.csv"))
}

/// The logical detector address of one TDC channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelCongruence {
    pub chamber: u32,
    pub wire: u8,
}

/// ChannelMap contains the mapping of TDC channel numbers to (chamber, wire) addresses.
///
/// This can change from setup to setup, so ChannelMap reads in a CSV file where each row contains 3 elements:
/// the channel, the chamber, and the wire within the chamber. Wires are validated to lie within a chamber.
#[derive(Debug, Clone, Default)]
pub struct ChannelMap {
    map: FxHashMap<u32, ChannelCongruence>,
}

impl ChannelMap {
    /// Create a new ChannelMap
    /// If the path is None, we load the default that is bundled with the library
    pub fn new(path: Option<&Path>) -> Result<Self, ChannelMapError> {
        let mut contents = String::new();
        if let Some(p) = path {
            let mut file = File::open(p)?;
            file.read_to_string(&mut contents)?;
        } else {
            contents = load_default_map();
        }
        Self::parse(&contents)
    }

    /// The map bundled with the library
    pub fn default_map() -> Self {
        // The bundled file is validated by the tests below
        Self::parse(&load_default_map()).unwrap_or_default()
    }

    /// Parse the CSV contents of a map. The first line is a header and is skipped.
    pub fn parse(contents: &str) -> Result<Self, ChannelMapError> {
        let mut cm = ChannelMap::default();

        let mut lines = contents.lines();
        lines.next(); // Skip the header
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let entries: Vec<&str> = line.split_terminator(',').map(str::trim).collect();
            if entries.len() != ENTRIES_PER_LINE {
                return Err(ChannelMapError::BadFileFormat);
            }

            let channel: u32 = entries[0].parse()?;
            let chamber: u32 = entries[1].parse()?;
            let wire: u32 = entries[2].parse()?;
            if wire as usize >= WIRES_PER_CHAMBER {
                return Err(ChannelMapError::BadWire(wire, channel));
            }

            let cong = ChannelCongruence {
                chamber,
                wire: wire as u8,
            };
            if cm.map.insert(channel, cong).is_some() {
                return Err(ChannelMapError::DuplicateChannel(channel));
            }
        }

        Ok(cm)
    }

    /// Get the detector address for a TDC channel.
    ///
    /// If returns None the channel does not exist in the map
    pub fn get(&self, channel: u32) -> Option<&ChannelCongruence> {
        self.map.get(&channel)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// All chambers referenced by the map, in ascending order
    pub fn chambers(&self) -> BTreeSet<u32> {
        self.map.values().map(|c| c.chamber).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u32, &ChannelCongruence)> {
        self.map.iter()
    }
}
