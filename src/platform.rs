use crate::config::DebugConfig;
use crate::error::EngineError;
use embedded_storage::nor_flash::NorFlash;

/// Everything the record store needs from the flash driver. See README.md for an example
/// implementation.
pub trait Platform: Crc + CacheControl + NorFlash {}

impl<T: Crc + CacheControl + NorFlash> Platform for T {}

pub type FnCrc32 = fn(init: u32, data: &[u8]) -> u32;

/// CRC-32 (IEEE 802.3) with zlib chaining semantics: `crc32(0, data)` starts a new checksum,
/// passing a previous result as `init` continues it.
///
/// The provided implementation is table driven and runs in software. Chips with a CRC unit
/// should override it.
pub trait Crc {
    fn crc32(init: u32, data: &[u8]) -> u32 {
        crc32_ieee(init, data)
    }
}

impl<T: Crc> Crc for &mut T {
    fn crc32(init: u32, data: &[u8]) -> u32 {
        T::crc32(init, data)
    }
}

const CRC32_IEEE: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// Software CRC-32 used by the default [`Crc`] implementation.
pub fn crc32_ieee(init: u32, data: &[u8]) -> u32 {
    // `digest_with_initial` expects the unreflected register value, a finished zlib checksum
    // is the inverted register.
    let mut digest = CRC32_IEEE.digest_with_initial((!init).reverse_bits());
    digest.update(data);
    digest.finalize()
}

/// Flash controllers with a prefetch or line buffer need it dropped after every erase or
/// program, otherwise reads through the memory map return stale data.
pub trait CacheControl {
    fn invalidate_cache(&mut self) {}
}

impl<T: CacheControl> CacheControl for &mut T {
    fn invalidate_cache(&mut self) {
        T::invalidate_cache(self)
    }
}

pub trait AlignedOps: Platform {
    fn align_read(size: usize) -> usize {
        align_ceil(size, Self::READ_SIZE)
    }

    fn align_read_floor(size: usize) -> usize {
        align_floor(size, Self::READ_SIZE)
    }

    fn align_write_ceil(size: usize) -> usize {
        align_ceil(size, Self::WRITE_SIZE)
    }

    fn align_write_floor(size: usize) -> usize {
        align_floor(size, Self::WRITE_SIZE)
    }

    fn align_erase(size: usize) -> usize {
        align_ceil(size, Self::ERASE_SIZE)
    }
}

#[inline(always)]
const fn align_ceil(size: usize, alignment: usize) -> usize {
    if alignment.is_power_of_two() {
        size.saturating_add(alignment - 1) & !(alignment - 1)
    } else {
        size.saturating_add(alignment - 1) / alignment * alignment
    }
}

#[inline(always)]
const fn align_floor(size: usize, alignment: usize) -> usize {
    if alignment.is_power_of_two() {
        size & !(alignment - 1)
    } else {
        size / alignment * alignment
    }
}

impl<T: Platform> AlignedOps for T {}

/// Signature schemes understood by the security engine.
#[derive(strum::FromRepr, strum::Display, Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum SignatureScheme {
    EcdsaP256 = 0x01,
    RsaPss2048 = 0x02,
    Ed25519 = 0x03,
}

/// A signature check over memory mapped flash. Addresses are CPU addresses, not flash offsets.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VerifyRequest {
    pub key_index: u32,
    pub scheme: SignatureScheme,
    pub data_address: u32,
    pub data_size: u32,
    pub signature_address: u32,
    pub signature_size: u32,
}

/// The hardware security engine (HSE). Only the request/response contract is modelled here,
/// the mailbox transport belongs to the implementation.
pub trait SecurityEngine {
    /// Whether the engine firmware is installed and reports ready.
    fn is_ready(&mut self) -> bool;

    fn verify(&mut self, request: &VerifyRequest) -> Result<(), EngineError>;

    /// Hands a freshly applied image signature to the engine's signature store.
    fn update_signature(&mut self, signature: &[u8]) -> Result<(), EngineError>;

    /// SHA-256 over memory mapped flash.
    fn digest(&mut self, address: u32, size: u32) -> Result<[u8; 32], EngineError>;

    fn configure_memory_protection(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}

impl<T: SecurityEngine> SecurityEngine for &mut T {
    fn is_ready(&mut self) -> bool {
        T::is_ready(self)
    }

    fn verify(&mut self, request: &VerifyRequest) -> Result<(), EngineError> {
        T::verify(self, request)
    }

    fn update_signature(&mut self, signature: &[u8]) -> Result<(), EngineError> {
        T::update_signature(self, signature)
    }

    fn digest(&mut self, address: u32, size: u32) -> Result<[u8; 32], EngineError> {
        T::digest(self, address, size)
    }

    fn configure_memory_protection(&mut self) -> Result<(), EngineError> {
        T::configure_memory_protection(self)
    }
}

/// Core level control: reset, vector table and debug port.
pub trait SystemControl {
    fn reset(&mut self) -> !;

    fn relocate_vector_table(&mut self, address: u32);

    /// Loads `stack_pointer` into MSP and branches to `entry` with interrupts disabled.
    fn jump(&mut self, entry: u32, stack_pointer: u32) -> !;

    fn apply_debug_policy(&mut self, _config: &DebugConfig) {}
}

impl<T: SystemControl> SystemControl for &mut T {
    fn reset(&mut self) -> ! {
        T::reset(self)
    }

    fn relocate_vector_table(&mut self, address: u32) {
        T::relocate_vector_table(self, address)
    }

    fn jump(&mut self, entry: u32, stack_pointer: u32) -> ! {
        T::jump(self, entry, stack_pointer)
    }

    fn apply_debug_policy(&mut self, config: &DebugConfig) {
        T::apply_debug_policy(self, config)
    }
}

/// LED patterns. Fire and forget, nothing in the boot flow depends on them being shown.
#[derive(strum::FromRepr, strum::Display, Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum StatusPattern {
    BootSuccess = 0x01,
    FallbackCreation = 0x02,
    UpdateReady = 0x03,
    Error = 0x04,
    Recovery = 0x05,
    FallbackLoad = 0x06,
}

pub trait StatusIndicator {
    fn show(&mut self, pattern: StatusPattern);
}

impl<T: StatusIndicator> StatusIndicator for &mut T {
    fn show(&mut self, pattern: StatusPattern) {
        T::show(self, pattern)
    }
}

/// Monotonically non-decreasing timestamp, resolution is up to the implementation.
pub trait TimeSource {
    fn timestamp(&self) -> u32;
}

impl<T: TimeSource> TimeSource for &mut T {
    fn timestamp(&self) -> u32 {
        T::timestamp(self)
    }
}

/// The board collaborators besides flash and the security engine.
pub trait Board: SystemControl + StatusIndicator + TimeSource {}

impl<T: SystemControl + StatusIndicator + TimeSource> Board for T {}
