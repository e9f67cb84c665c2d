// Detector geometry
pub const WIRES_PER_CHAMBER: usize = 4;

// TDS run file format
pub const TDS_MAGIC: &[u8; 4] = b"TDSa";
pub const TDS_EXTENSION: &str = "tds";
pub const RECORD_HEADER_SIZE: usize = 20; // run u64, record u64, hit count u32
pub const HIT_SIZE: usize = 10; // edge u8, wire u8, chamber u32, time u32

// Trigger stream packets
pub const INFO_KEYWORD: &[u8; 6] = b"TRACK ";
pub const INFO_PACKET_SIZE: usize = 14; // keyword + run u32 + record u32
pub const CONTROL_KEYWORD: &[u8; 5] = b"NVDDC";
pub const CONTROL_PACKET_SIZE: usize = 6; // keyword + command u8
pub const MEASURE_FREQUENCY_COMMAND: u8 = 6;
pub const MAX_PACKET_SIZE: usize = 1024;

// Matcher window bound: at most this many trigger ids are pending at once
pub const MAX_PENDING_IDS: usize = 3;
