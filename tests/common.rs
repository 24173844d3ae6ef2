#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use hse_boot::FirmwareVersion;
use hse_boot::config::{BootConfig, DebugConfig, Layout, Region};
use hse_boot::error::EngineError;
use hse_boot::platform::{
    CacheControl, SecurityEngine, StatusIndicator, StatusPattern, SystemControl, TimeSource,
    VerifyRequest,
};
use std::cell::Cell;
use std::ops::Range;
use std::panic::{AssertUnwindSafe, catch_unwind, panic_any};

pub const FLASH_SECTOR_SIZE: usize = 4096;
pub const WORD_SIZE: usize = 4;

/// CPU address the test flash is mapped to.
pub const XIP_BASE: u32 = 0x0040_0000;

pub const LAYOUT: Layout = Layout {
    xip_base: XIP_BASE,
    primary: Region::new(0x0000_0000, 0x2_0000),
    primary_signature: Region::new(0x0002_0000, 0x1000),
    fallback_metadata: 0x0002_1000,
    fallback_image: Region::new(0x0002_2000, 0x2_0000),
    fallback_signature: Region::new(0x0004_2000, 0x1000),
    update_metadata: 0x0004_3000,
    update_workspace: Region::new(0x0004_4000, 0x2_1000),
    version_history: 0x0006_5000,
    boot_log: 0x0006_6000,
};

pub const PAGES: usize = 0x67;

pub const V1: FirmwareVersion = FirmwareVersion::new(1, 0, 0, 1);
pub const V2: FirmwareVersion = FirmwareVersion::new(1, 1, 0, 0);

pub fn config() -> BootConfig {
    BootConfig::new(LAYOUT, V1)
}

#[derive(Default)]
pub struct Flash {
    pub buf: Vec<u8>,
    pub fail_after_operation: usize,
    /// Erases and writes touching this range fail.
    pub faulty: Option<Range<u32>>,
    pub operations: Vec<Operation>,
    pub cache_invalidations: usize,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    Read { offset: u32, len: usize },
    Write { offset: u32, len: usize },
    Erase { offset: u32, len: usize },
}

impl Flash {
    pub fn new(pages: usize) -> Self {
        Self {
            buf: vec![0xffu8; FLASH_SECTOR_SIZE * pages],
            fail_after_operation: usize::MAX,
            ..Default::default()
        }
    }

    pub fn new_with_fault(pages: usize, fail_after_operation: usize) -> Self {
        Self {
            buf: vec![0xffu8; FLASH_SECTOR_SIZE * pages],
            fail_after_operation,
            ..Default::default()
        }
    }

    /// A flash with a primary image and its signature installed.
    pub fn with_firmware(image: &[u8], signature: &[u8]) -> Self {
        let mut flash = Self::new(PAGES);
        flash.install(LAYOUT.primary.offset, image);
        flash.install(LAYOUT.primary_signature.offset, signature);
        flash
    }

    /// Places data without going through the driver.
    pub fn install(&mut self, offset: u32, data: &[u8]) {
        let offset = offset as usize;
        self.buf[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn slice(&self, offset: u32, len: usize) -> &[u8] {
        &self.buf[offset as usize..offset as usize + len]
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn disable_faults(&mut self) {
        self.fail_after_operation = usize::MAX;
        self.faulty = None;
    }

    pub fn erases(&mut self) -> usize {
        self.operations
            .iter()
            .filter(|op| match op {
                Operation::Erase { .. } => true,
                _ => false,
            })
            .count()
    }

    /// Erases or writes that touched `range`.
    pub fn modifications(&self, range: Range<u32>) -> usize {
        self.operations
            .iter()
            .filter(|op| match op {
                Operation::Write { offset, len } | Operation::Erase { offset, len } => {
                    *offset < range.end && range.start < *offset + *len as u32
                }
                Operation::Read { .. } => false,
            })
            .count()
    }

    pub fn dump_operations(&self) {
        println!("Operations:");
        for op in &self.operations {
            println!("  {:?}", op);
        }
    }

    fn is_faulty(&self, from: u32, to: u32) -> bool {
        self.operations.len() >= self.fail_after_operation
            || self
                .faulty
                .as_ref()
                .is_some_and(|range| from < range.end && range.start < to)
    }
}

#[derive(Debug)]
pub struct FlashError;

impl NorFlashError for FlashError {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::Other
    }
}

impl ErrorType for Flash {
    type Error = FlashError;
}

impl ReadNorFlash for Flash {
    const READ_SIZE: usize = WORD_SIZE;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::READ_SIZE as _));
        assert!(bytes.len().is_multiple_of(Self::READ_SIZE));

        if self.operations.len() >= self.fail_after_operation {
            println!("    flash: FAULT read 0x{offset:05X}");
            return Err(FlashError);
        }
        self.operations.push(Operation::Read {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        bytes.copy_from_slice(&self.buf[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl NorFlash for Flash {
    const WRITE_SIZE: usize = WORD_SIZE;

    const ERASE_SIZE: usize = FLASH_SECTOR_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        assert!(from.is_multiple_of(Self::ERASE_SIZE as _));
        assert!(to.is_multiple_of(Self::ERASE_SIZE as _));
        assert!(to as usize <= self.buf.len());

        println!(
            "    flash: erase: {from:05X} - {to:05X} #{:>2}",
            self.operations.len()
        );

        if self.is_faulty(from, to) {
            println!("    flash: FAULT");
            return Err(FlashError);
        }

        self.operations.push(Operation::Erase {
            offset: from,
            len: (to - from) as usize,
        });

        for addr in from..to {
            self.buf[addr as usize] = 0xff;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::WRITE_SIZE as _));
        assert!(bytes.len().is_multiple_of(Self::WRITE_SIZE as _));
        assert!(bytes.len() > 0);

        if self.is_faulty(offset, offset + bytes.len() as u32) {
            println!("    flash: FAULT write 0x{offset:05X}");
            return Err(FlashError);
        }

        self.operations.push(Operation::Write {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        for (i, &val) in bytes.iter().enumerate() {
            // NOR flash can only flip bits from 1 to 0
            self.buf[offset + i] &= val;
        }
        Ok(())
    }
}

impl hse_boot::platform::Crc for Flash {
    fn crc32(init: u32, data: &[u8]) -> u32 {
        unsafe { libz_sys::crc32(init as _, data.as_ptr(), data.len() as u32) as u32 }
    }
}

impl CacheControl for Flash {
    fn invalidate_cache(&mut self) {
        self.cache_invalidations += 1;
    }
}

pub fn crc32(data: &[u8]) -> u32 {
    unsafe { libz_sys::crc32(0, data.as_ptr(), data.len() as u32) as u32 }
}

/// Security engine double. Every request is recorded, requests for a data address listed in
/// `reject` fail.
pub struct Engine {
    pub ready: bool,
    pub reject: Vec<(u32, EngineError)>,
    pub requests: Vec<VerifyRequest>,
    pub installed_signatures: Vec<Vec<u8>>,
    pub reject_signature_install: bool,
    pub digest: [u8; 32],
    pub protection_configured: bool,
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            ready: true,
            reject: Vec::new(),
            requests: Vec::new(),
            installed_signatures: Vec::new(),
            reject_signature_install: false,
            digest: [0xA5; 32],
            protection_configured: false,
        }
    }
}

impl Engine {
    pub fn reject_primary(&mut self, error: EngineError) {
        self.reject
            .push((LAYOUT.address(LAYOUT.primary.offset), error));
    }

    pub fn reject_fallback(&mut self, error: EngineError) {
        self.reject
            .push((LAYOUT.address(LAYOUT.fallback_image.offset), error));
    }

    pub fn accept_all(&mut self) {
        self.reject.clear();
    }
}

impl SecurityEngine for Engine {
    fn is_ready(&mut self) -> bool {
        self.ready
    }

    fn verify(&mut self, request: &VerifyRequest) -> Result<(), EngineError> {
        self.requests.push(*request);
        match self
            .reject
            .iter()
            .find(|(address, _)| *address == request.data_address)
        {
            Some((_, error)) => Err(*error),
            None => Ok(()),
        }
    }

    fn update_signature(&mut self, signature: &[u8]) -> Result<(), EngineError> {
        if self.reject_signature_install {
            return Err(EngineError::General);
        }
        self.installed_signatures.push(signature.to_vec());
        Ok(())
    }

    fn digest(&mut self, _address: u32, _size: u32) -> Result<[u8; 32], EngineError> {
        Ok(self.digest)
    }

    fn configure_memory_protection(&mut self) -> Result<(), EngineError> {
        self.protection_configured = true;
        Ok(())
    }
}

/// How a call left the boot code for good.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Exit {
    Reset,
    Jump { entry: u32, stack_pointer: u32 },
}

#[derive(Default)]
pub struct Board {
    pub patterns: Vec<StatusPattern>,
    pub clock: Cell<u32>,
    pub vector_table: Option<u32>,
    pub debug: Option<DebugConfig>,
    pub resets: usize,
}

impl SystemControl for Board {
    fn reset(&mut self) -> ! {
        self.resets += 1;
        panic_any(Exit::Reset)
    }

    fn relocate_vector_table(&mut self, address: u32) {
        self.vector_table = Some(address);
    }

    fn jump(&mut self, entry: u32, stack_pointer: u32) -> ! {
        panic_any(Exit::Jump {
            entry,
            stack_pointer,
        })
    }

    fn apply_debug_policy(&mut self, config: &DebugConfig) {
        self.debug = Some(*config);
    }
}

impl StatusIndicator for Board {
    fn show(&mut self, pattern: StatusPattern) {
        self.patterns.push(pattern);
    }
}

impl TimeSource for Board {
    fn timestamp(&self) -> u32 {
        let now = self.clock.get();
        self.clock.set(now + 1);
        now
    }
}

/// Runs `f`, turning a reset or jump of the board into an `Err`.
pub fn run<R>(f: impl FnOnce() -> R) -> Result<R, Exit> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) => match payload.downcast::<Exit>() {
            Ok(exit) => Err(*exit),
            Err(payload) => std::panic::resume_unwind(payload),
        },
    }
}

/// Firmware image with a valid looking vector table at its start.
pub fn image(len: usize, seed: u8) -> Vec<u8> {
    let mut image: Vec<u8> = (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect();
    image[0..4].copy_from_slice(&0x2000_8000u32.to_le_bytes());
    image[4..8].copy_from_slice(&(XIP_BASE + 0x401).to_le_bytes());
    image
}

/// The whole primary region as it reads after installing `image`.
pub fn primary_region(image: &[u8]) -> Vec<u8> {
    let mut region = vec![0xffu8; LAYOUT.primary.size as usize];
    region[..image.len()].copy_from_slice(image);
    region
}
