use crate::FirmwareVersion;
use crate::error::Error;
use crate::platform::SignatureScheme;
use embedded_storage::nor_flash::NorFlash;

/// A contiguous range of flash, in flash offsets.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Region {
    pub offset: u32,
    pub size: u32,
}

impl Region {
    pub const fn new(offset: u32, size: u32) -> Self {
        Self { offset, size }
    }

    pub const fn end(&self) -> u64 {
        self.offset as u64 + self.size as u64
    }

    pub const fn overlaps(&self, other: &Region) -> bool {
        (self.offset as u64) < other.end() && (other.offset as u64) < self.end()
    }
}

/// Where everything lives. Records take one erase sector each, regions are sector aligned.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Layout {
    /// CPU address of flash offset 0, used for vector table relocation and engine requests.
    pub xip_base: u32,
    pub primary: Region,
    pub primary_signature: Region,
    pub fallback_metadata: u32,
    pub fallback_image: Region,
    pub fallback_signature: Region,
    pub update_metadata: u32,
    pub update_workspace: Region,
    pub version_history: u32,
    pub boot_log: u32,
}

impl Layout {
    /// The S32K344 memory map with the firmware in code flash and the records in data flash. The
    /// flash driver is expected to accept CPU addresses as offsets.
    pub const S32K344: Layout = Layout {
        xip_base: 0,
        primary: Region::new(0x0040_0000, 0x000F_E000),
        primary_signature: Region::new(0x004F_E000, 0x2000),
        update_workspace: Region::new(0x0050_0000, 0x0010_0000),
        update_metadata: 0x0060_0000,
        fallback_metadata: 0x006E_0000,
        fallback_image: Region::new(0x006E_2000, 0x000F_E000),
        fallback_signature: Region::new(0x007E_0000, 0x2000),
        boot_log: 0x1008_0000,
        version_history: 0x1008_2000,
    };

    /// CPU address of a flash offset.
    pub const fn address(&self, offset: u32) -> u32 {
        self.xip_base.wrapping_add(offset)
    }

    fn regions<T: NorFlash>(&self) -> [Region; 9] {
        let sector = |offset| Region::new(offset, T::ERASE_SIZE as u32);
        [
            self.primary,
            self.primary_signature,
            self.fallback_image,
            self.fallback_signature,
            self.update_workspace,
            sector(self.fallback_metadata),
            sector(self.update_metadata),
            sector(self.version_history),
            sector(self.boot_log),
        ]
    }

    /// Rejects misaligned, out of bounds or overlapping regions, and a fallback that can't hold
    /// the primary image with its signature.
    pub fn validate<T: NorFlash>(&self, capacity: usize) -> Result<(), Error> {
        let regions = self.regions::<T>();

        for (i, region) in regions.iter().enumerate() {
            if !(region.offset as usize).is_multiple_of(T::ERASE_SIZE)
                || !(region.size as usize).is_multiple_of(T::ERASE_SIZE)
                || region.size == 0
                || region.end() > capacity as u64
            {
                return Err(Error::InvalidLayout);
            }

            if regions[i + 1..].iter().any(|other| region.overlaps(other)) {
                return Err(Error::InvalidLayout);
            }
        }

        if self.fallback_image.size < self.primary.size
            || self.fallback_signature.size < self.primary_signature.size
        {
            return Err(Error::InvalidLayout);
        }

        Ok(())
    }
}

#[derive(strum::FromRepr, strum::Display, Debug, Eq, PartialEq, Copy, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DebugLevel {
    #[default]
    Disabled = 0,
    /// No memory access.
    Limited = 1,
    Full = 2,
}

/// Applied once the primary image verified. Enforcement belongs to the board.
#[derive(Debug, Eq, PartialEq, Copy, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DebugConfig {
    pub level: DebugLevel,
    pub password_protected: bool,
    pub timeout_enabled: bool,
    /// 0 means no timeout
    pub timeout_secs: u32,
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IntegrityConfig {
    pub enabled: bool,
    pub region: Region,
    /// SHA-256 the region has to digest to.
    pub reference: [u8; 32],
    /// How often the caller should schedule the check.
    pub interval_ms: u32,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            region: Region::new(0x0040_0000, 0x1_0000),
            reference: [0; 32],
            interval_ms: 5000,
        }
    }
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BootConfig {
    pub layout: Layout,
    /// Version of the firmware built around this crate, seeds the anti-rollback history.
    pub firmware_version: FirmwareVersion,
    pub key_index: u32,
    pub scheme: SignatureScheme,
    /// Number of boot log entries kept.
    pub log_capacity: usize,
    pub debug: DebugConfig,
    pub integrity: IntegrityConfig,
}

impl BootConfig {
    pub fn new(layout: Layout, firmware_version: FirmwareVersion) -> Self {
        Self {
            layout,
            firmware_version,
            key_index: 1,
            scheme: SignatureScheme::EcdsaP256,
            log_capacity: crate::boot_log::DEFAULT_LOG_CAPACITY,
            debug: DebugConfig::default(),
            integrity: IntegrityConfig::default(),
        }
    }
}
