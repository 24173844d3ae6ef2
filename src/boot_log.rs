use crate::error::Error;
use crate::platform::{Board, Platform, StatusPattern};
use crate::raw::{ByteReader, ByteWriter, Record};
use crate::store::RecordStore;
use alloc::vec;
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::{error, info, trace, warn};

/// Consecutive failures after which the fallback image is loaded.
pub const MAX_BOOT_ATTEMPTS: u8 = 3;

pub const DEFAULT_LOG_CAPACITY: usize = 10;

const HEADER_PAYLOAD_SIZE: usize = 12;
const ENTRY_SIZE: usize = 8;

/// Status codes kept in the boot log. Codes from `0x50` on are informational events.
#[derive(strum::FromRepr, strum::Display, Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum BootStatus {
    Success = 0x00,
    HseFailure = 0x01,
    SignatureFailure = 0x02,
    RuntimeFailure = 0x03,
    RecoveryActive = 0x04,
    FactoryReset = 0x05,
    RollbackDetected = 0x06,
    MemoryFailure = 0x07,
    BootFailure = 0x08,
    Warning = 0x09,
    KeyFailure = 0x0A,
    FallbackCreated = 0x50,
    FallbackUpdated = 0x51,
    UpdateReady = 0x60,
    UpdateSuccess = 0x61,
    UpdateFailure = 0x62,
    UpdateVerifyFailure = 0x63,
    UpdateCancelled = 0x64,
    SignatureValid = 0x70,
    MetadataInvalid = 0x71,
}

impl BootStatus {
    /// Statuses that end a failure streak.
    pub fn resets_failures(self) -> bool {
        matches!(self, BootStatus::Success | BootStatus::RecoveryActive)
    }
}

#[derive(Debug, Eq, PartialEq, Copy, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LogEntry {
    pub timestamp: u32,
    pub status: u8,
    /// Consecutive failures before this entry was written.
    pub attempts: u8,
    pub error_details: u16,
}

impl LogEntry {
    /// `None` for codes written by a newer firmware.
    pub fn boot_status(&self) -> Option<BootStatus> {
        BootStatus::from_repr(self.status)
    }
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RecoveryContext {
    pub consecutive_failures: u8,
    pub recovery_mode: bool,
    pub last_status: u8,
}

impl Default for RecoveryContext {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            recovery_mode: false,
            last_status: BootStatus::Success as u8,
        }
    }
}

/// What the caller should do after a status was logged.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Action {
    Continue,
    AttemptRecovery,
    LoadFallback,
}

/// Boot log record: header with the recovery context plus a ring of entries.
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct BootLog {
    entries: u32,
    last_entry_index: u32,
    context: RecoveryContext,
    ring: Vec<LogEntry>,
}

impl BootLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: 0,
            last_entry_index: 0,
            context: RecoveryContext::default(),
            ring: vec![LogEntry::default(); capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.len()
    }

    pub fn len(&self) -> usize {
        self.entries as usize
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn context(&self) -> &RecoveryContext {
        &self.context
    }

    /// Appends until the ring is full, then overwrites the oldest entry.
    fn push(&mut self, entry: LogEntry) {
        let capacity = self.ring.len() as u32;
        if capacity == 0 {
            return;
        }

        let index = if self.entries < capacity {
            self.entries += 1;
            self.entries - 1
        } else {
            let index = self.last_entry_index;
            self.last_entry_index = (self.last_entry_index + 1) % capacity;
            index
        };
        self.ring[index as usize] = entry;
    }

    /// Entries oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        let (newer, older) = if self.entries as usize >= self.ring.len() {
            self.ring.split_at(self.last_entry_index as usize)
        } else {
            (&self.ring[..self.entries as usize], &self.ring[..0])
        };
        older.iter().chain(newer.iter())
    }
}

impl Record for BootLog {
    const MAGIC: u32 = 0x424C_4F47; // "BLOG"
    const VERSION: u32 = 0x0001_0000;

    fn payload_len(&self) -> usize {
        HEADER_PAYLOAD_SIZE + self.ring.len() * ENTRY_SIZE
    }

    fn encode_payload(&self, out: &mut ByteWriter<'_>) {
        out.u32(self.entries);
        out.u32(self.last_entry_index);
        out.u8(self.context.consecutive_failures);
        out.u8(self.context.recovery_mode as u8);
        out.u8(self.context.last_status);
        out.reserved(1);

        for entry in &self.ring {
            out.u32(entry.timestamp);
            out.u8(entry.status);
            out.u8(entry.attempts);
            out.u16(entry.error_details);
        }
    }

    fn decode_payload(&mut self, input: &mut ByteReader<'_>) -> Result<(), Error> {
        let capacity = self.ring.len() as u32;
        self.entries = input.u32()?;
        self.last_entry_index = input.u32()?;
        if self.entries > capacity || (capacity > 0 && self.last_entry_index >= capacity) {
            return Err(Error::InvalidRecord);
        }

        self.context = RecoveryContext {
            consecutive_failures: input.u8()?,
            recovery_mode: input.u8()? != 0,
            last_status: input.u8()?,
        };
        input.skip(1)?;

        for entry in self.ring.iter_mut() {
            *entry = LogEntry {
                timestamp: input.u32()?,
                status: input.u8()?,
                attempts: input.u8()?,
                error_details: input.u16()?,
            };
        }
        Ok(())
    }
}

/// Boot log plus the in-memory mirror of its recovery context.
///
/// Persisting is best effort: a boot decision never waits on a log write. After the first
/// flash error the log is marked as faulted and lives on in memory only.
pub struct BootRecovery {
    address: u32,
    log: BootLog,
    faulted: bool,
}

impl BootRecovery {
    pub fn init<T: Platform>(store: &mut RecordStore<T>, address: u32, capacity: usize) -> Self {
        let mut faulted = false;
        let log = match store.read_or_init(address, BootLog::new(capacity)) {
            Ok(log) => log,
            Err(_e) => {
                #[cfg(feature = "defmt")]
                error!("boot log unavailable: {}", _e);
                faulted = true;
                BootLog::new(capacity)
            }
        };

        #[cfg(feature = "defmt")]
        info!(
            "boot log: {} entries, {} consecutive failures",
            log.entries, log.context.consecutive_failures
        );

        Self {
            address,
            log,
            faulted,
        }
    }

    /// Picks up the stored log before a mutation. Called once per operation, so every change
    /// an operation makes lands in the same write back.
    fn reload<T: Platform>(&mut self, store: &mut RecordStore<T>) {
        if self.faulted {
            return;
        }
        match store.load(self.address, &self.log) {
            Ok(Some(log)) => self.log = log,
            Ok(None) | Err(Error::InvalidRecord) => {}
            Err(_) => self.faulted = true,
        }
    }

    fn record<T: Platform>(
        &mut self,
        store: &mut RecordStore<T>,
        now: u32,
        status: BootStatus,
        details: u16,
        counted: bool,
    ) {
        #[cfg(feature = "defmt")]
        trace!("boot log: {} ({:#06x})", status, details);

        let context = &mut self.log.context;
        let entry = LogEntry {
            timestamp: now,
            status: status as u8,
            attempts: context.consecutive_failures,
            error_details: details,
        };

        if counted {
            context.last_status = status as u8;
            if status.resets_failures() {
                context.consecutive_failures = 0;
            } else {
                context.consecutive_failures = context.consecutive_failures.saturating_add(1);
            }
        }
        self.log.push(entry);

        if !self.faulted && store.write(self.address, &self.log).is_err() {
            #[cfg(feature = "defmt")]
            warn!("boot log write failed, keeping it in memory");
            self.faulted = true;
        }
    }

    /// Logs the outcome of a boot step and decides how to go on.
    pub fn log_status<T: Platform>(
        &mut self,
        store: &mut RecordStore<T>,
        now: u32,
        status: BootStatus,
        details: u16,
    ) -> Action {
        self.reload(store);
        self.record(store, now, status, details, true);

        if status == BootStatus::Success {
            return Action::Continue;
        }

        let failures = self.log.context.consecutive_failures;
        if failures >= MAX_BOOT_ATTEMPTS {
            self.log.context.recovery_mode = true;
            self.record(store, now, BootStatus::FactoryReset, 0, true);
            Action::LoadFallback
        } else if failures > 1 {
            Action::AttemptRecovery
        } else {
            Action::Continue
        }
    }

    /// Appends an informational entry without touching the failure streak.
    pub fn log_event<T: Platform>(
        &mut self,
        store: &mut RecordStore<T>,
        now: u32,
        status: BootStatus,
        details: u16,
    ) {
        self.reload(store);
        self.record(store, now, status, details, false);
    }

    /// Counts a failed boot and returns the new streak length.
    pub fn increment_failure_count<T: Platform>(
        &mut self,
        store: &mut RecordStore<T>,
        now: u32,
    ) -> u8 {
        self.reload(store);
        let details = self.log.context.consecutive_failures.saturating_add(1);
        self.record(store, now, BootStatus::BootFailure, details as u16, true);
        self.log.context.consecutive_failures
    }

    /// Marks the recovery attempt in the log. Signature and key failures go on with the
    /// fallback image, anything else resets the system.
    pub fn attempt_recovery<T: Platform, B: Board>(
        &mut self,
        store: &mut RecordStore<T>,
        board: &mut B,
    ) -> Action {
        self.reload(store);
        let last_status = BootStatus::from_repr(self.log.context.last_status);

        board.show(StatusPattern::Recovery);
        self.record(
            store,
            board.timestamp(),
            BootStatus::RecoveryActive,
            0,
            true,
        );

        match last_status {
            Some(BootStatus::SignatureFailure | BootStatus::KeyFailure) => Action::LoadFallback,
            _ => board.reset(),
        }
    }

    pub fn clear_recovery_mode<T: Platform>(&mut self, store: &mut RecordStore<T>) {
        self.reload(store);
        if !self.log.context.recovery_mode {
            return;
        }
        self.log.context.recovery_mode = false;
        if !self.faulted && store.write(self.address, &self.log).is_err() {
            self.faulted = true;
        }
    }

    pub fn context(&self) -> &RecoveryContext {
        &self.log.context
    }

    pub fn log(&self) -> &BootLog {
        &self.log
    }

    /// Entries oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.log.iter().copied().collect()
    }

    /// Whether a flash error stopped the log from being persisted.
    pub fn is_faulted(&self) -> bool {
        self.faulted
    }
}
