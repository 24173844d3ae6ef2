#![doc = include_str!("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

pub mod boot_log;
pub mod config;
pub mod context;
pub mod error;
pub mod fallback;
pub mod integrity;
pub mod platform;
mod raw;
pub mod rollback;
pub mod store;
pub mod update;

extern crate alloc;

use crate::boot_log::{Action, BootStatus};
use crate::config::BootConfig;
use crate::context::Context;
use crate::error::{EngineError, Error};
use crate::fallback::FallbackManager;
use crate::integrity::IntegrityMonitor;
use crate::platform::{Board, Platform, SecurityEngine, StatusPattern};
use crate::update::{UpdateManager, UpdateStatus};
use core::cmp::Ordering;
use core::fmt;
#[cfg(feature = "defmt")]
use defmt::{error, info, warn};

pub use raw::{ByteReader, ByteWriter, Record};

/// `major.minor.patch.build`, ordered by [`FirmwareVersion::ordinal`].
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    pub build: u8,
}

impl FirmwareVersion {
    pub const fn new(major: u8, minor: u8, patch: u8, build: u8) -> Self {
        Self {
            major,
            minor,
            patch,
            build,
        }
    }

    /// Single integer used for every comparison.
    pub const fn ordinal(&self) -> u32 {
        (self.major as u32) << 24
            | (self.minor as u32) << 16
            | (self.patch as u32) << 8
            | self.build as u32
    }

    pub const fn from_ordinal(ordinal: u32) -> Self {
        let [major, minor, patch, build] = ordinal.to_be_bytes();
        Self::new(major, minor, patch, build)
    }

    pub const fn bytes(&self) -> [u8; 4] {
        [self.major, self.minor, self.patch, self.build]
    }

    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Self::new(bytes[0], bytes[1], bytes[2], bytes[3])
    }
}

impl Ord for FirmwareVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ordinal().cmp(&other.ordinal())
    }
}

impl PartialOrd for FirmwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FirmwareVersion({self})")
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.patch, self.build
        )
    }
}

/// The secure boot flow: anti-rollback check, engine readiness, signature verification of the
/// primary image and escalation to the fallback image.
///
/// Holds the [`Context`] for its whole lifetime, so the periodic integrity check and every
/// record write are serialized by the borrow checker.
pub struct SecureBoot<T: Platform, E: SecurityEngine, B: Board> {
    ctx: Context<T, E, B>,
    monitor: IntegrityMonitor,
    fallback_attempted: bool,
}

impl<T: Platform, E: SecurityEngine, B: Board> SecureBoot<T, E, B> {
    /// Loads all records. A corrupted fallback or update record is logged, it doesn't stop
    /// the boot.
    pub fn new(hal: T, engine: E, board: B, config: BootConfig) -> Result<Self, Error> {
        let mut ctx = Context::new(hal, engine, board, config)?;

        if ctx.fallback().init().is_err() {
            ctx.log_event(BootStatus::MetadataInvalid, 0);
        }

        if let Err(e) = ctx.update().init() {
            ctx.log_event(BootStatus::Warning, e.code());
        }

        Ok(Self {
            ctx,
            monitor: IntegrityMonitor::new(),
            fallback_attempted: false,
        })
    }

    /// Decides whether the primary image may run.
    ///
    /// On success the debug policy and memory protection are applied and the integrity monitor
    /// is started. A failed verification at the attempt threshold escalates to
    /// [`Self::attempt_fallback_boot`].
    pub fn boot(&mut self) -> Result<(), Error> {
        let rollback = &self.ctx.rollback;
        if !rollback.check_version(rollback.current_version())
            || !rollback.check_version(self.ctx.config.firmware_version)
        {
            #[cfg(feature = "defmt")]
            error!(
                "firmware {} is older than {}",
                self.ctx.config.firmware_version,
                rollback.minimum_version()
            );
            self.ctx.log_status(BootStatus::RollbackDetected, 0);
            return Err(Error::VersionError);
        }

        if !self.ctx.engine.is_ready() {
            #[cfg(feature = "defmt")]
            error!("security engine not ready");
            self.ctx.log_status(BootStatus::HseFailure, 0);
            return Err(Error::EngineNotReady);
        }

        let request = self.ctx.primary_request();
        match self.ctx.verify(&request) {
            Ok(()) => {
                self.configure();
                self.ctx.log_status(BootStatus::Success, 0);

                #[cfg(feature = "defmt")]
                info!("primary image verified");
                Ok(())
            }
            Err(e) => {
                let status = match e {
                    EngineError::KeyNotFound => BootStatus::KeyFailure,
                    _ => BootStatus::SignatureFailure,
                };
                match self.ctx.log_status(status, e as u16) {
                    Action::LoadFallback => Err(self.attempt_fallback_boot()),
                    _ => Err(Error::SignatureFailure(e)),
                }
            }
        }
    }

    fn configure(&mut self) {
        let config = self.ctx.config;
        self.ctx.board.apply_debug_policy(&config.debug);

        if let Err(_e) = self.ctx.engine.configure_memory_protection() {
            #[cfg(feature = "defmt")]
            warn!("memory protection not configured: {}", _e);
            self.ctx.log_event(BootStatus::Warning, Error::SignatureFailure(_e).code());
        }

        self.monitor.start(&config.integrity);
    }

    /// Restores the primary image from a valid, non rolled back and correctly signed fallback
    /// and resets. If restoring fails the fallback is booted in place.
    ///
    /// Returns only when every path failed, with the reason.
    pub fn attempt_fallback_boot(&mut self) -> Error {
        self.fallback_attempted = true;
        self.ctx.board.show(StatusPattern::FallbackLoad);

        let metadata = match self.ctx.fallback().verify_integrity() {
            Ok(metadata) => metadata,
            Err(_e) => {
                #[cfg(feature = "defmt")]
                error!("no usable fallback: {}", _e);
                return Error::FactoryResetRequired;
            }
        };

        if !self.ctx.rollback.check_version(metadata.firmware_version) {
            self.ctx.log_event(BootStatus::RollbackDetected, 1);
            return Error::RollbackRejected;
        }

        if let Err(e) = self.ctx.fallback().verify_signature() {
            self.ctx.log_event(BootStatus::SignatureFailure, e as u16);
            return Error::SignatureFailure(e);
        }

        match self.ctx.fallback().recover_main_firmware() {
            Ok(()) => self.ctx.board.reset(),
            Err(_e) => {
                #[cfg(feature = "defmt")]
                warn!("restoring the primary image failed: {}", _e);
            }
        }

        self.ctx.fallback().jump_to_fallback_firmware();
        Error::FactoryResetRequired
    }

    /// Full start up: boot, keep a fallback around, install a pending update.
    ///
    /// Resets the system if the boot fails. Returns once the application may run.
    pub fn start(&mut self) {
        if let Err(e) = self.boot() {
            self.fail(e);
        }

        self.create_initial_fallback();

        if self.ctx.update().is_pending() {
            self.ctx.board.show(StatusPattern::UpdateReady);
            match self.ctx.update().apply_pending_updates() {
                Ok(UpdateStatus::Failure) => self.ctx.board.show(StatusPattern::Error),
                Ok(_) => {}
                Err(e) => self.ctx.log_event(BootStatus::Warning, e.code()),
            }
        }

        self.ctx.board.show(StatusPattern::BootSuccess);
    }

    fn fail(&mut self, e: Error) -> ! {
        #[cfg(feature = "defmt")]
        error!("boot failed: {}", e);
        self.ctx.board.show(StatusPattern::Error);

        if !self.fallback_attempted && self.ctx.recovery.context().consecutive_failures > 1 {
            let action = self
                .ctx
                .recovery
                .attempt_recovery(&mut self.ctx.store, &mut self.ctx.board);
            if action == Action::LoadFallback {
                let reason = self.attempt_fallback_boot();
                #[cfg(feature = "defmt")]
                error!("fallback boot failed: {}", reason);
                self.ctx.log_event(BootStatus::BootFailure, reason.code());
            }
        }

        self.ctx.log_event(BootStatus::BootFailure, e.code());
        self.ctx.board.reset()
    }

    fn create_initial_fallback(&mut self) {
        if self.ctx.fallback().is_valid() {
            return;
        }

        self.ctx.board.show(StatusPattern::FallbackCreation);
        match self.store_fallback() {
            Ok(()) => self.ctx.log_event(BootStatus::FallbackCreated, 0),
            Err(e) => {
                #[cfg(feature = "defmt")]
                warn!("initial fallback not created: {}", e);
                self.ctx.log_event(BootStatus::Warning, e.code())
            }
        }
    }

    fn store_fallback(&mut self) -> Result<(), Error> {
        let version = self.ctx.config.firmware_version;
        let mut fallback = self.ctx.fallback();
        fallback.store_current_firmware(version)?;
        fallback.verify_integrity()?;
        fallback.verify_signature().map_err(Error::SignatureFailure)
    }

    /// Compares the critical region against its reference digest, if the monitor runs. A
    /// mismatch is logged as a memory failure and the resulting action is returned.
    pub fn periodic_integrity_check(&mut self) -> Option<Action> {
        if !self.monitor.is_running() {
            return None;
        }

        match self.monitor.check(&mut self.ctx) {
            Ok(()) => None,
            Err(e) => {
                self.ctx.board.show(StatusPattern::Error);
                Some(self.ctx.log_status(BootStatus::MemoryFailure, e.code()))
            }
        }
    }

    /// Whether the integrity check should run at `now`.
    pub fn integrity_check_due(&self, now: u32) -> bool {
        self.monitor.is_due(&self.ctx.config.integrity, now)
    }

    pub fn fallback(&mut self) -> FallbackManager<'_, T, E, B> {
        self.ctx.fallback()
    }

    pub fn update(&mut self) -> UpdateManager<'_, T, E, B> {
        self.ctx.update()
    }

    pub fn context(&self) -> &Context<T, E, B> {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut Context<T, E, B> {
        &mut self.ctx
    }

    pub fn last_engine_error(&self) -> Option<EngineError> {
        self.ctx.last_engine_error()
    }

    pub fn into_context(self) -> Context<T, E, B> {
        self.ctx
    }
}
