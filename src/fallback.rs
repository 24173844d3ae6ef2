use crate::FirmwareVersion;
use crate::boot_log::BootStatus;
use crate::context::Context;
use crate::error::{EngineError, Error};
use crate::platform::{Board, Platform, SecurityEngine, StatusPattern, VerifyRequest};
use crate::raw::{ByteReader, ByteWriter, Record};
use crate::store::RecordStore;
#[cfg(feature = "defmt")]
use defmt::{info, warn};

/// Describes the previous-known-good image kept in the fallback region.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FallbackMetadata {
    pub firmware_size: u32,
    pub firmware_crc: u32,
    pub creation_time: u32,
    /// How often the image was restored into the primary region.
    pub update_count: u32,
    pub firmware_version: FirmwareVersion,
}

impl FallbackMetadata {
    const EMPTY: FallbackMetadata = FallbackMetadata {
        firmware_size: 0,
        firmware_crc: 0,
        creation_time: 0,
        update_count: 0,
        firmware_version: FirmwareVersion::new(0, 0, 0, 0),
    };
}

impl Record for FallbackMetadata {
    const MAGIC: u32 = 0x4641_4C42; // "FALB"
    const VERSION: u32 = 0x0001_0000;

    fn payload_len(&self) -> usize {
        28
    }

    fn encode_payload(&self, out: &mut ByteWriter<'_>) {
        out.u32(self.firmware_size);
        out.u32(self.firmware_crc);
        out.u32(self.creation_time);
        out.u32(self.update_count);
        out.bytes(&self.firmware_version.bytes());
        out.reserved(8);
    }

    fn decode_payload(&mut self, input: &mut ByteReader<'_>) -> Result<(), Error> {
        self.firmware_size = input.u32()?;
        self.firmware_crc = input.u32()?;
        self.creation_time = input.u32()?;
        self.update_count = input.u32()?;
        self.firmware_version = FirmwareVersion::from_bytes(input.array()?);
        input.skip(8)
    }
}

/// Keeps a copy of a known good primary image (and its signature) and restores or boots it.
///
/// Validity is never cached: every check recomputes the image CRC.
pub struct FallbackManager<'a, T: Platform, E: SecurityEngine, B: Board> {
    ctx: &'a mut Context<T, E, B>,
}

impl<'a, T: Platform, E: SecurityEngine, B: Board> FallbackManager<'a, T, E, B> {
    pub(crate) fn new(ctx: &'a mut Context<T, E, B>) -> Self {
        Self { ctx }
    }

    /// Checks the metadata sector. A blank sector is fine, a broken record is reported.
    pub fn init(&mut self) -> Result<(), Error> {
        let address = self.ctx.config.layout.fallback_metadata;
        let raw = self
            .ctx
            .store
            .read(address, FallbackMetadata::EMPTY.encoded_len())?;

        if raw[0..4] != FallbackMetadata::MAGIC.to_le_bytes() {
            return Ok(());
        }

        if RecordStore::<T>::validate::<FallbackMetadata>(&raw) {
            Ok(())
        } else {
            #[cfg(feature = "defmt")]
            warn!("fallback metadata corrupted");
            Err(Error::InvalidRecord)
        }
    }

    /// The stored metadata if the record is intact. Says nothing about the image itself.
    pub fn metadata(&mut self) -> Result<Option<FallbackMetadata>, Error> {
        let address = self.ctx.config.layout.fallback_metadata;
        self.ctx.store.load(address, &FallbackMetadata::EMPTY)
    }

    /// Recomputes the image CRC against the metadata.
    pub fn verify_integrity(&mut self) -> Result<FallbackMetadata, Error> {
        let image = self.ctx.config.layout.fallback_image;
        let metadata = self.metadata()?.ok_or(Error::InvalidRecord)?;

        if metadata.firmware_size == 0 || metadata.firmware_size > image.size {
            return Err(Error::InvalidRecord);
        }

        let crc = self.ctx.store.crc32(image.offset, metadata.firmware_size)?;
        if crc != metadata.firmware_crc {
            return Err(Error::CrcMismatch);
        }
        Ok(metadata)
    }

    pub fn is_valid(&mut self) -> bool {
        self.verify_integrity().is_ok()
    }

    /// Copies the primary image and its signature into the fallback regions.
    pub fn store_current_firmware(
        &mut self,
        version: FirmwareVersion,
    ) -> Result<FallbackMetadata, Error> {
        let layout = self.ctx.config.layout;
        let store = &mut self.ctx.store;

        // an interrupted copy must not leave the old metadata describing new data
        store.erase(layout.fallback_metadata, T::ERASE_SIZE as u32)?;

        store.erase(layout.fallback_image.offset, layout.fallback_image.size)?;
        store.copy(
            layout.primary.offset,
            layout.fallback_image.offset,
            layout.primary.size,
        )?;

        store.erase(
            layout.fallback_signature.offset,
            layout.fallback_signature.size,
        )?;
        store.copy(
            layout.primary_signature.offset,
            layout.fallback_signature.offset,
            layout.primary_signature.size,
        )?;

        let metadata = FallbackMetadata {
            firmware_size: layout.primary.size,
            firmware_crc: store.crc32(layout.fallback_image.offset, layout.primary.size)?,
            creation_time: self.ctx.board.timestamp(),
            update_count: 0,
            firmware_version: version,
        };
        self.ctx.store.write(layout.fallback_metadata, &metadata)?;

        #[cfg(feature = "defmt")]
        info!(
            "fallback stored: {} bytes, crc {:#010x}",
            metadata.firmware_size, metadata.firmware_crc
        );
        Ok(metadata)
    }

    /// Reprograms the primary region from the fallback image.
    ///
    /// Fails closed: if the restored image doesn't match, the metadata stays as it was.
    pub fn recover_main_firmware(&mut self) -> Result<(), Error> {
        let mut metadata = self
            .verify_integrity()
            .map_err(|_| Error::FallbackInvalid)?;
        let layout = self.ctx.config.layout;

        self.ctx.board.show(StatusPattern::Recovery);

        let store = &mut self.ctx.store;
        store.erase(layout.primary.offset, layout.primary.size)?;
        store.copy(
            layout.fallback_image.offset,
            layout.primary.offset,
            metadata.firmware_size,
        )?;
        store.erase(layout.primary_signature.offset, layout.primary_signature.size)?;
        store.copy(
            layout.fallback_signature.offset,
            layout.primary_signature.offset,
            layout.primary_signature.size,
        )?;

        if store.crc32(layout.primary.offset, metadata.firmware_size)? != metadata.firmware_crc {
            #[cfg(feature = "defmt")]
            warn!("restored primary image doesn't match the fallback");
            return Err(Error::CrcMismatch);
        }

        metadata.update_count = metadata.update_count.wrapping_add(1);
        store.write(layout.fallback_metadata, &metadata)?;

        self.ctx.log_status(BootStatus::RecoveryActive, 0);
        Ok(())
    }

    /// Boots the fallback image in place. Returns only if there is no valid fallback.
    pub fn jump_to_fallback_firmware(&mut self) {
        if !self.is_valid() {
            #[cfg(feature = "defmt")]
            warn!("no valid fallback to jump to");
            return;
        }

        let image = self.ctx.config.layout.fallback_image;
        let Ok(vectors) = self.ctx.store.read(image.offset, 8) else {
            return;
        };
        let stack_pointer = u32::from_le_bytes([vectors[0], vectors[1], vectors[2], vectors[3]]);
        let reset_vector = u32::from_le_bytes([vectors[4], vectors[5], vectors[6], vectors[7]]);

        self.ctx.log_status(BootStatus::RecoveryActive, 1);

        let board = &mut self.ctx.board;
        board.relocate_vector_table(self.ctx.config.layout.address(image.offset));
        board.jump(reset_vector, stack_pointer)
    }

    /// Signature check over the fallback image with its own copy of the signature.
    pub fn verify_request(&self) -> VerifyRequest {
        let layout = &self.ctx.config.layout;
        VerifyRequest {
            key_index: self.ctx.config.key_index,
            scheme: self.ctx.config.scheme,
            data_address: layout.address(layout.fallback_image.offset),
            data_size: layout.primary.size,
            signature_address: layout.address(layout.fallback_signature.offset),
            signature_size: layout.primary_signature.size,
        }
    }

    pub fn verify_signature(&mut self) -> Result<(), EngineError> {
        let request = self.verify_request();
        self.ctx.verify(&request)
    }
}
