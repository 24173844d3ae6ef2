use crate::FirmwareVersion;
use crate::error::Error;
use crate::platform::Platform;
use crate::raw::{ByteReader, ByteWriter, Record};
use crate::store::RecordStore;
#[cfg(feature = "defmt")]
use defmt::{info, warn};

/// Persistent anti-rollback state. `minimum_version` only ever moves up.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VersionHistory {
    pub current_version: FirmwareVersion,
    pub minimum_version: FirmwareVersion,
    pub update_counter: u32,
    pub last_update_time: u32,
}

impl VersionHistory {
    pub fn new(running: FirmwareVersion, now: u32) -> Self {
        Self {
            current_version: running,
            minimum_version: running,
            update_counter: 0,
            last_update_time: now,
        }
    }
}

impl Record for VersionHistory {
    const MAGIC: u32 = 0x5645_5253; // "VERS"
    const VERSION: u32 = 0x0001_0000;

    fn payload_len(&self) -> usize {
        16
    }

    fn encode_payload(&self, out: &mut ByteWriter<'_>) {
        out.bytes(&self.current_version.bytes());
        out.bytes(&self.minimum_version.bytes());
        out.u32(self.update_counter);
        out.u32(self.last_update_time);
    }

    fn decode_payload(&mut self, input: &mut ByteReader<'_>) -> Result<(), Error> {
        self.current_version = FirmwareVersion::from_bytes(input.array()?);
        self.minimum_version = FirmwareVersion::from_bytes(input.array()?);
        self.update_counter = input.u32()?;
        self.last_update_time = input.u32()?;
        Ok(())
    }
}

pub struct AntiRollback {
    address: u32,
    history: VersionHistory,
}

impl AntiRollback {
    /// Loads the version history, creating it for the running firmware on first boot.
    pub fn init<T: Platform>(
        store: &mut RecordStore<T>,
        address: u32,
        running: FirmwareVersion,
        now: u32,
    ) -> Result<Self, Error> {
        let history = store.read_or_init(address, VersionHistory::new(running, now))?;

        #[cfg(feature = "defmt")]
        info!(
            "anti-rollback: current {} minimum {}",
            history.current_version, history.minimum_version
        );

        Ok(Self { address, history })
    }

    /// Whether `version` is allowed to run.
    pub fn check_version(&self, version: FirmwareVersion) -> bool {
        version.ordinal() >= self.history.minimum_version.ordinal()
    }

    /// Records `version` as installed and ratchets the minimum up if it is newer.
    pub fn update_version<T: Platform>(
        &mut self,
        store: &mut RecordStore<T>,
        version: FirmwareVersion,
        now: u32,
    ) -> Result<(), Error> {
        let mut history = store.read_or_init(self.address, self.history)?;

        if version.ordinal() < history.minimum_version.ordinal() {
            #[cfg(feature = "defmt")]
            warn!(
                "anti-rollback: {} rejected, minimum {}",
                version, history.minimum_version
            );
            return Err(Error::RollbackRejected);
        }

        history.current_version = version;
        history.update_counter = history.update_counter.wrapping_add(1);
        history.last_update_time = now;
        if version > history.minimum_version {
            history.minimum_version = version;
        }

        store.write(self.address, &history)?;
        self.history = history;
        Ok(())
    }

    pub fn history(&self) -> &VersionHistory {
        &self.history
    }

    pub fn current_version(&self) -> FirmwareVersion {
        self.history.current_version
    }

    pub fn minimum_version(&self) -> FirmwareVersion {
        self.history.minimum_version
    }

    pub fn update_counter(&self) -> u32 {
        self.history.update_counter
    }
}
