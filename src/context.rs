use crate::boot_log::{Action, BootLog, BootRecovery, BootStatus};
use crate::config::BootConfig;
use crate::error::{EngineError, Error};
use crate::fallback::FallbackManager;
use crate::platform::{Board, Platform, SecurityEngine, VerifyRequest};
use crate::raw::Record;
use crate::rollback::AntiRollback;
use crate::store::RecordStore;
use crate::update::UpdateManager;
#[cfg(feature = "defmt")]
use defmt::warn;

/// Everything the boot flow works on. Replaces the module level state of a C style
/// bootloader: one owner, handed out to the managers as a mutable borrow.
pub struct Context<T: Platform, E: SecurityEngine, B: Board> {
    pub store: RecordStore<T>,
    pub engine: E,
    pub board: B,
    pub recovery: BootRecovery,
    pub rollback: AntiRollback,
    pub config: BootConfig,
    pub(crate) last_engine_error: Option<EngineError>,
}

impl<T: Platform, E: SecurityEngine, B: Board> Context<T, E, B> {
    /// Validates the layout, then loads (or creates) the boot log and the version history.
    pub fn new(hal: T, engine: E, board: B, config: BootConfig) -> Result<Self, Error> {
        config.layout.validate::<T>(hal.capacity())?;

        if BootLog::new(config.log_capacity).encoded_len() > T::ERASE_SIZE {
            return Err(Error::InvalidLayout);
        }

        let mut store = RecordStore::new(hal);
        let recovery =
            BootRecovery::init(&mut store, config.layout.boot_log, config.log_capacity);
        let rollback = AntiRollback::init(
            &mut store,
            config.layout.version_history,
            config.firmware_version,
            board.timestamp(),
        )?;

        Ok(Self {
            store,
            engine,
            board,
            recovery,
            rollback,
            config,
            last_engine_error: None,
        })
    }

    pub fn fallback(&mut self) -> FallbackManager<'_, T, E, B> {
        FallbackManager::new(self)
    }

    pub fn update(&mut self) -> UpdateManager<'_, T, E, B> {
        UpdateManager::new(self)
    }

    pub fn now(&self) -> u32 {
        self.board.timestamp()
    }

    pub fn log_status(&mut self, status: BootStatus, details: u16) -> Action {
        let now = self.board.timestamp();
        self.recovery.log_status(&mut self.store, now, status, details)
    }

    pub fn log_event(&mut self, status: BootStatus, details: u16) {
        let now = self.board.timestamp();
        self.recovery.log_event(&mut self.store, now, status, details)
    }

    /// Signature check over the primary image.
    pub fn primary_request(&self) -> VerifyRequest {
        let layout = &self.config.layout;
        VerifyRequest {
            key_index: self.config.key_index,
            scheme: self.config.scheme,
            data_address: layout.address(layout.primary.offset),
            data_size: layout.primary.size,
            signature_address: layout.address(layout.primary_signature.offset),
            signature_size: layout.primary_signature.size,
        }
    }

    /// Runs a signature check and remembers a failure for [`Self::last_engine_error`].
    pub fn verify(&mut self, request: &VerifyRequest) -> Result<(), EngineError> {
        let result = self.engine.verify(request);
        if let Err(e) = result {
            #[cfg(feature = "defmt")]
            warn!("signature check @{:#010x} failed: {}", request.data_address, e);
            self.last_engine_error = Some(e);
        }
        result
    }

    pub fn last_engine_error(&self) -> Option<EngineError> {
        self.last_engine_error
    }
}
