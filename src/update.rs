use crate::FirmwareVersion;
use crate::boot_log::BootStatus;
use crate::context::Context;
use crate::error::Error;
use crate::platform::{Board, Platform, SecurityEngine};
use crate::raw::{ByteReader, ByteWriter, Record};
#[cfg(feature = "defmt")]
use defmt::{error, info, warn};

/// `None -> Ready -> InProgress -> Success | Failure`, `Ready -> None` by cancelling.
#[derive(strum::FromRepr, strum::Display, Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum UpdateStatus {
    Success = 0x00,
    Failure = 0x01,
    InProgress = 0x03,
    Ready = 0x04,
    None = 0x05,
}

/// Why an apply was abandoned, stored in the error details of the log entry.
#[derive(strum::FromRepr, strum::Display, Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum UpdateFailure {
    Rollback = 0x01,
    WorkspaceCrc = 0x02,
    Erase = 0x03,
    Program = 0x04,
    SignatureInstall = 0x05,
    PrimaryCrc = 0x06,
    SignatureVerify = 0x07,
    /// Power was lost while the primary image was being replaced.
    Interrupted = 0x08,
}

impl UpdateFailure {
    fn log_status(self) -> BootStatus {
        match self {
            UpdateFailure::PrimaryCrc | UpdateFailure::SignatureVerify => {
                BootStatus::UpdateVerifyFailure
            }
            _ => BootStatus::UpdateFailure,
        }
    }
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UpdateMetadata {
    pub update_size: u32,
    pub update_crc: u32,
    pub target_version: FirmwareVersion,
    pub source_version: FirmwareVersion,
    pub flags: u32,
    pub status: UpdateStatus,
    /// Offset of the signature inside the workspace, directly behind the image.
    pub signature_offset: u32,
    pub signature_size: u32,
}

impl Default for UpdateMetadata {
    fn default() -> Self {
        Self {
            update_size: 0,
            update_crc: 0,
            target_version: FirmwareVersion::new(0, 0, 0, 0),
            source_version: FirmwareVersion::new(0, 0, 0, 0),
            flags: 0,
            status: UpdateStatus::None,
            signature_offset: 0,
            signature_size: 0,
        }
    }
}

impl Record for UpdateMetadata {
    const MAGIC: u32 = 0x5550_4454; // "UPDT"
    const VERSION: u32 = 0x0001_0000;

    fn payload_len(&self) -> usize {
        80
    }

    fn encode_payload(&self, out: &mut ByteWriter<'_>) {
        out.u32(self.update_size);
        out.u32(self.update_crc);
        for part in self.target_version.bytes() {
            out.u32(part as u32);
        }
        for part in self.source_version.bytes() {
            out.u32(part as u32);
        }
        out.u32(self.flags);
        out.u32(self.status as u32);
        out.u32(self.signature_offset);
        out.u32(self.signature_size);
        out.reserved(24);
    }

    fn decode_payload(&mut self, input: &mut ByteReader<'_>) -> Result<(), Error> {
        self.update_size = input.u32()?;
        self.update_crc = input.u32()?;
        self.target_version = read_version(input)?;
        self.source_version = read_version(input)?;
        self.flags = input.u32()?;
        self.status = UpdateStatus::from_repr(input.u32()?).ok_or(Error::InvalidRecord)?;
        self.signature_offset = input.u32()?;
        self.signature_size = input.u32()?;
        input.skip(24)
    }
}

/// Versions are stored one component per word.
fn read_version(input: &mut ByteReader<'_>) -> Result<FirmwareVersion, Error> {
    let mut parts = [0u8; 4];
    for part in parts.iter_mut() {
        *part = u8::try_from(input.u32()?).map_err(|_| Error::InvalidRecord)?;
    }
    Ok(FirmwareVersion::from_bytes(parts))
}

/// Stages updates into the workspace and installs them into the primary region.
pub struct UpdateManager<'a, T: Platform, E: SecurityEngine, B: Board> {
    ctx: &'a mut Context<T, E, B>,
}

impl<'a, T: Platform, E: SecurityEngine, B: Board> UpdateManager<'a, T, E, B> {
    pub(crate) fn new(ctx: &'a mut Context<T, E, B>) -> Self {
        Self { ctx }
    }

    /// Creates the metadata record if needed and turns an apply that was cut short by a
    /// reset into a logged failure.
    pub fn init(&mut self) -> Result<UpdateMetadata, Error> {
        let mut metadata = self.read()?;

        if metadata.status == UpdateStatus::InProgress {
            #[cfg(feature = "defmt")]
            error!("update to {} was interrupted", metadata.target_version);

            metadata.status = UpdateStatus::Failure;
            self.write(&metadata)?;
            let failure = UpdateFailure::Interrupted;
            self.ctx.log_event(failure.log_status(), failure as u16);
        }
        Ok(metadata)
    }

    fn read(&mut self) -> Result<UpdateMetadata, Error> {
        let address = self.ctx.config.layout.update_metadata;
        self.ctx
            .store
            .read_or_init(address, UpdateMetadata::default())
    }

    fn write(&mut self, metadata: &UpdateMetadata) -> Result<(), Error> {
        let address = self.ctx.config.layout.update_metadata;
        self.ctx.store.write(address, metadata)
    }

    /// The stored metadata if the record is intact.
    pub fn metadata(&mut self) -> Result<Option<UpdateMetadata>, Error> {
        let address = self.ctx.config.layout.update_metadata;
        match self.ctx.store.load(address, &UpdateMetadata::default()) {
            Err(Error::InvalidRecord) => Ok(None),
            other => other,
        }
    }

    fn pending(&mut self) -> Option<UpdateMetadata> {
        let layout = self.ctx.config.layout;
        match self.metadata() {
            Ok(Some(metadata))
                if metadata.status == UpdateStatus::Ready
                    && metadata.update_size > 0
                    && metadata.update_size <= layout.primary.size
                    && metadata.signature_size <= layout.primary_signature.size
                    && metadata.update_size as u64 + metadata.signature_size as u64
                        <= layout.update_workspace.size as u64 =>
            {
                Some(metadata)
            }
            _ => None,
        }
    }

    pub fn is_pending(&mut self) -> bool {
        self.pending().is_some()
    }

    /// Recomputes the CRC of the staged image.
    pub fn verify_integrity(&mut self) -> Result<UpdateMetadata, Error> {
        let workspace = self.ctx.config.layout.update_workspace;
        let metadata = self.metadata()?.ok_or(Error::InvalidRecord)?;
        if metadata.update_size == 0 || metadata.update_size > workspace.size {
            return Err(Error::InvalidRecord);
        }

        if self.ctx.store.crc32(workspace.offset, metadata.update_size)? != metadata.update_crc {
            return Err(Error::CrcMismatch);
        }
        Ok(metadata)
    }

    /// Writes `data` and its signature to the workspace and marks the update ready.
    pub fn stage_update(
        &mut self,
        data: &[u8],
        signature: Option<&[u8]>,
        target_version: FirmwareVersion,
    ) -> Result<(), Error> {
        let layout = self.ctx.config.layout;
        let signature = signature.unwrap_or(&[]);

        if self.read()?.status == UpdateStatus::InProgress {
            return Err(Error::UpdateInProgress);
        }

        if data.is_empty()
            || data.len() > layout.primary.size as usize
            || signature.len() > layout.primary_signature.size as usize
            || data.len() + signature.len() > layout.update_workspace.size as usize
        {
            return Err(Error::UpdateTooLarge);
        }

        let metadata = UpdateMetadata {
            update_size: data.len() as u32,
            update_crc: T::crc32(0, data),
            target_version,
            source_version: self.ctx.rollback.current_version(),
            flags: 0,
            status: UpdateStatus::Ready,
            signature_offset: if signature.is_empty() {
                0
            } else {
                data.len() as u32
            },
            signature_size: signature.len() as u32,
        };

        // the old metadata goes first, it must never describe a half written workspace
        self.write(&UpdateMetadata::default())?;

        let store = &mut self.ctx.store;
        store.erase(layout.update_workspace.offset, layout.update_workspace.size)?;
        store.program(layout.update_workspace.offset, &[data, signature])?;
        self.write(&metadata)?;

        #[cfg(feature = "defmt")]
        info!(
            "update to {} staged: {} bytes",
            target_version,
            data.len()
        );
        self.ctx.log_event(BootStatus::UpdateReady, 0);
        Ok(())
    }

    /// Withdraws a staged update. Only an update that is ready can be cancelled.
    pub fn cancel_pending(&mut self) -> Result<(), Error> {
        let Some(mut metadata) = self.pending() else {
            return Err(Error::NoPendingUpdate);
        };

        metadata.status = UpdateStatus::None;
        self.write(&metadata)?;
        self.ctx.log_event(BootStatus::UpdateCancelled, 0);
        Ok(())
    }

    /// Installs a pending update. On success the system is reset and this doesn't return.
    ///
    /// Returns `UpdateStatus::None` if there is nothing to do and `UpdateStatus::Failure` if
    /// the update was rejected. Only a failure to persist the in-progress state is an error.
    pub fn apply_pending_updates(&mut self) -> Result<UpdateStatus, Error> {
        let Some(mut metadata) = self.pending() else {
            return Ok(UpdateStatus::None);
        };

        metadata.status = UpdateStatus::InProgress;
        self.write(&metadata)?;

        if let Err(failure) = self.install(&metadata) {
            #[cfg(feature = "defmt")]
            error!("update to {} failed: {}", metadata.target_version, failure);

            metadata.status = UpdateStatus::Failure;
            if self.write(&metadata).is_err() {
                #[cfg(feature = "defmt")]
                warn!("failed to persist the update failure");
            }
            self.ctx.log_event(failure.log_status(), failure as u16);
            return Ok(UpdateStatus::Failure);
        }

        if let Err(_e) = self.store_backup_after_update(metadata.target_version) {
            #[cfg(feature = "defmt")]
            warn!("fallback not refreshed: {}", _e);
            self.ctx.log_event(BootStatus::Warning, _e.code());
        }

        let now = self.ctx.now();
        if let Err(_e) =
            self.ctx
                .rollback
                .update_version(&mut self.ctx.store, metadata.target_version, now)
        {
            #[cfg(feature = "defmt")]
            warn!("version history not updated: {}", _e);
            self.ctx.log_event(BootStatus::Warning, _e.code());
        }

        self.ctx.recovery.clear_recovery_mode(&mut self.ctx.store);

        metadata.status = UpdateStatus::Success;
        if self.write(&metadata).is_err() {
            #[cfg(feature = "defmt")]
            warn!("failed to persist the update success");
        }
        self.ctx.log_event(BootStatus::UpdateSuccess, 0);

        #[cfg(feature = "defmt")]
        info!("update to {} installed, resetting", metadata.target_version);
        self.ctx.board.reset()
    }

    /// Every check that can fail without touching the primary image runs first.
    fn install(&mut self, metadata: &UpdateMetadata) -> Result<(), UpdateFailure> {
        let layout = self.ctx.config.layout;

        if !self.ctx.rollback.check_version(metadata.target_version) {
            return Err(UpdateFailure::Rollback);
        }

        match self
            .ctx
            .store
            .crc32(layout.update_workspace.offset, metadata.update_size)
        {
            Ok(crc) if crc == metadata.update_crc => {}
            _ => return Err(UpdateFailure::WorkspaceCrc),
        }

        let store = &mut self.ctx.store;
        store
            .erase(layout.primary.offset, layout.primary.size)
            .map_err(|_| UpdateFailure::Erase)?;
        store
            .copy(
                layout.update_workspace.offset,
                layout.primary.offset,
                metadata.update_size,
            )
            .map_err(|_| UpdateFailure::Program)?;

        if metadata.signature_size > 0 {
            let signature_start = layout.update_workspace.offset + metadata.signature_offset;
            store
                .erase(layout.primary_signature.offset, layout.primary_signature.size)
                .map_err(|_| UpdateFailure::Erase)?;
            store
                .copy(
                    signature_start,
                    layout.primary_signature.offset,
                    metadata.signature_size,
                )
                .map_err(|_| UpdateFailure::Program)?;

            let signature = store
                .read(signature_start, metadata.signature_size as usize)
                .map_err(|_| UpdateFailure::SignatureInstall)?;
            self.ctx
                .engine
                .update_signature(&signature)
                .map_err(|_| UpdateFailure::SignatureInstall)?;
        }

        match self
            .ctx
            .store
            .crc32(layout.primary.offset, metadata.update_size)
        {
            Ok(crc) if crc == metadata.update_crc => {}
            _ => return Err(UpdateFailure::PrimaryCrc),
        }

        // without a staged signature the engine would check the new image against the old one
        if metadata.signature_size == 0 {
            return Ok(());
        }

        let request = self.ctx.primary_request();
        self.ctx
            .verify(&request)
            .map_err(|_| UpdateFailure::SignatureVerify)
    }

    /// Refreshes the fallback with the image that was just installed.
    pub fn store_backup_after_update(&mut self, version: FirmwareVersion) -> Result<(), Error> {
        let mut fallback = self.ctx.fallback();
        fallback.store_current_firmware(version)?;
        fallback.verify_integrity()?;
        fallback.verify_signature().map_err(Error::SignatureFailure)?;

        self.ctx.log_event(BootStatus::FallbackUpdated, 0);
        Ok(())
    }
}
