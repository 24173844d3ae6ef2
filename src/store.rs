use crate::error::Error;
use crate::platform::{AlignedOps, Platform};
use crate::raw::{self, Record, write_aligned};
use alloc::vec;
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::{trace, warn};

/// Upper bound for a single flash transfer while copying or checksumming regions.
pub(crate) const CHUNK_SIZE: usize = 256;

/// Owns the flash driver. Every record access goes through here as read, validate, mutate and
/// write back, there is no cached copy that could go stale.
pub struct RecordStore<T: Platform> {
    pub(crate) hal: T,
}

impl<T: Platform> RecordStore<T> {
    pub fn new(hal: T) -> Self {
        Self { hal }
    }

    pub fn flash(&self) -> &T {
        &self.hal
    }

    pub fn flash_mut(&mut self) -> &mut T {
        &mut self.hal
    }

    pub fn into_inner(self) -> T {
        self.hal
    }

    /// Whether `raw` is a complete, intact encoding of `R`.
    pub fn validate<R: Record>(raw: &[u8]) -> bool {
        raw::check::<R>(raw, T::crc32).is_ok()
    }

    /// Reads the record at `address`. `Ok(None)` means the slot is blank or broken.
    pub fn load<R: Record>(&mut self, address: u32, template: &R) -> Result<Option<R>, Error> {
        let raw = self.read(address, template.encoded_len())?;
        match raw::check::<R>(&raw, T::crc32) {
            Ok(()) => raw::decode(&raw, template).map(Some),
            Err(_e) => {
                #[cfg(feature = "defmt")]
                trace!("load @{:#08x}: {}", address, _e);
                Ok(None)
            }
        }
    }

    /// Returns the stored record if valid, otherwise writes `default` and returns it.
    pub fn read_or_init<R: Record>(&mut self, address: u32, default: R) -> Result<R, Error> {
        match self.load(address, &default) {
            Ok(Some(record)) => Ok(record),
            // a record with an unknown status value is as broken as one with a bad CRC
            Ok(None) | Err(Error::InvalidRecord) => {
                #[cfg(feature = "defmt")]
                warn!("record @{:#08x} invalid, writing defaults", address);

                self.write(address, &default)?;
                Ok(default)
            }
            Err(e) => Err(e),
        }
    }

    /// Erases the record's sector and programs the freshly encoded record.
    pub fn write<R: Record>(&mut self, address: u32, record: &R) -> Result<(), Error> {
        let bytes = raw::encode(record, T::crc32);
        self.erase(address, bytes.len() as u32)?;
        let result = write_aligned(&mut self.hal, address, &bytes).map_err(|_| Error::FlashError);
        self.hal.invalidate_cache();
        result
    }

    /// Reads `len` bytes starting at any offset.
    pub fn read(&mut self, address: u32, len: usize) -> Result<Vec<u8>, Error> {
        let start = T::align_read_floor(address as usize);
        let lead = address as usize - start;
        let mut buf = vec![0u8; T::align_read(lead + len)];
        self.hal
            .read(start as u32, &mut buf)
            .map_err(|_| Error::FlashError)?;
        buf.truncate(lead + len);
        buf.drain(..lead);
        Ok(buf)
    }

    /// Erases every sector touched by `[address, address + size)`. `address` has to be sector
    /// aligned.
    pub fn erase(&mut self, address: u32, size: u32) -> Result<(), Error> {
        if !(address as usize).is_multiple_of(T::ERASE_SIZE) {
            return Err(Error::InvalidLayout);
        }
        if size == 0 {
            return Ok(());
        }

        let end = address + T::align_erase(size as usize) as u32;
        let result = self.hal.erase(address, end).map_err(|_| Error::FlashError);
        self.hal.invalidate_cache();
        result
    }

    /// Programs the concatenation of `parts` to erased flash at `address`.
    pub fn program(&mut self, address: u32, parts: &[&[u8]]) -> Result<(), Error> {
        let result = self.program_parts(address, parts);
        self.hal.invalidate_cache();
        result
    }

    fn program_parts(&mut self, address: u32, parts: &[&[u8]]) -> Result<(), Error> {
        let mut cursor = ProgramCursor::new::<T>(address);
        for part in parts {
            cursor.push(&mut self.hal, part)?;
        }
        cursor.finish(&mut self.hal)
    }

    /// Copies `len` bytes between regions. The destination must be erased.
    pub fn copy(&mut self, from: u32, to: u32, len: u32) -> Result<(), Error> {
        let result = self.copy_chunked(from, to, len);
        self.hal.invalidate_cache();
        result
    }

    fn copy_chunked(&mut self, from: u32, to: u32, len: u32) -> Result<(), Error> {
        let mut cursor = ProgramCursor::new::<T>(to);
        let mut offset = 0;
        while offset < len {
            let chunk = CHUNK_SIZE.min((len - offset) as usize);
            let data = self.read(from + offset, chunk)?;
            cursor.push(&mut self.hal, &data)?;
            offset += chunk as u32;
        }
        cursor.finish(&mut self.hal)
    }

    /// CRC-32 over `len` bytes of flash.
    pub fn crc32(&mut self, address: u32, len: u32) -> Result<u32, Error> {
        let mut crc = 0;
        let mut offset = 0;
        while offset < len {
            let chunk = CHUNK_SIZE.min((len - offset) as usize);
            let data = self.read(address + offset, chunk)?;
            crc = T::crc32(crc, &data);
            offset += chunk as u32;
        }
        Ok(crc)
    }
}

/// Streams arbitrarily sized pieces to flash in write-size aligned chunks.
struct ProgramCursor {
    address: u32,
    /// [`CHUNK_SIZE`] rounded up to the driver's write size
    chunk: usize,
    pending: Vec<u8>,
}

impl ProgramCursor {
    fn new<T: Platform>(address: u32) -> Self {
        let chunk = T::align_write_ceil(CHUNK_SIZE);
        Self {
            address,
            chunk,
            pending: Vec::with_capacity(chunk),
        }
    }

    fn push<T: Platform>(&mut self, hal: &mut T, mut data: &[u8]) -> Result<(), Error> {
        while !data.is_empty() {
            let take = (self.chunk - self.pending.len()).min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.pending.len() == self.chunk {
                self.flush(hal, self.chunk)?;
            }
        }
        Ok(())
    }

    fn flush<T: Platform>(&mut self, hal: &mut T, len: usize) -> Result<(), Error> {
        let len = T::align_write_floor(len);
        if len == 0 {
            return Ok(());
        }
        hal.write(self.address, &self.pending[..len])
            .map_err(|_| Error::FlashError)?;
        self.pending.drain(..len);
        self.address += len as u32;
        Ok(())
    }

    fn finish<T: Platform>(self, hal: &mut T) -> Result<(), Error> {
        if self.pending.is_empty() {
            return Ok(());
        }
        write_aligned(hal, self.address, &self.pending).map_err(|_| Error::FlashError)
    }
}
