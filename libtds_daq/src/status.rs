use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle of an exposition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExpositionState {
    #[default]
    Idle,
    Running,
    Stopping,
}

/// Error and traffic counters shared by all loops. Readable at any time without locking.
#[derive(Debug, Default)]
pub struct Diagnostics {
    device_errors: AtomicU64,
    write_errors: AtomicU64,
    malformed_packets: AtomicU64,
    packages_received: AtomicU64,
    frequency_measurements: AtomicU64,
}

/// A point-in-time copy of Diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub device_errors: u64,
    pub write_errors: u64,
    pub malformed_packets: u64,
    pub packages_received: u64,
    pub frequency_measurements: u64,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device_error(&self) {
        self.device_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_packet(&self) {
        self.malformed_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn package_received(&self) {
        self.packages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frequency_measured(&self) {
        self.frequency_measurements.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            device_errors: self.device_errors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            malformed_packets: self.malformed_packets.load(Ordering::Relaxed),
            packages_received: self.packages_received.load(Ordering::Relaxed),
            frequency_measurements: self.frequency_measurements.load(Ordering::Relaxed),
        }
    }
}
