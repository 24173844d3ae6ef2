use crate::error::Error;
use crate::platform::{AlignedOps, FnCrc32, Platform};
use alloc::vec;
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::trace;

/// magic + structure version
pub(crate) const RECORD_HEADER_SIZE: usize = 8;
/// CRC-32 over everything before it
pub(crate) const RECORD_TRAILER_SIZE: usize = 4;

/// A fixed layout structure persisted as `magic | version | payload | crc32`, all little
/// endian.
///
/// Records are decoded into a clone of a template value, which lets records with a configurable
/// size (like the boot log ring) derive their payload length from the template.
pub trait Record: Clone {
    const MAGIC: u32;
    /// Only the upper 16 bits (the major structure version) have to match on load.
    const VERSION: u32;

    fn payload_len(&self) -> usize;

    fn encode_payload(&self, out: &mut ByteWriter<'_>);

    fn decode_payload(&mut self, input: &mut ByteReader<'_>) -> Result<(), Error>;

    fn encoded_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload_len() + RECORD_TRAILER_SIZE
    }
}

pub struct ByteWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> ByteWriter<'a> {
    pub(crate) fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn u8(&mut self, value: u8) {
        self.bytes(&[value]);
    }

    pub fn u16(&mut self, value: u16) {
        self.bytes(&value.to_le_bytes());
    }

    pub fn u32(&mut self, value: u32) {
        self.bytes(&value.to_le_bytes());
    }

    pub fn bytes(&mut self, value: &[u8]) {
        self.buf[self.pos..self.pos + value.len()].copy_from_slice(value);
        self.pos += value.len();
    }

    /// Reserved space is written as zeros.
    pub fn reserved(&mut self, len: usize) {
        self.buf[self.pos..self.pos + len].fill(0);
        self.pos += len;
    }
}

pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.array::<1>()?[0])
    }

    pub fn u16(&mut self) -> Result<u16, Error> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let end = self.pos + N;
        let slice = self.buf.get(self.pos..end).ok_or(Error::InvalidRecord)?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), Error> {
        if self.pos + len > self.buf.len() {
            return Err(Error::InvalidRecord);
        }
        self.pos += len;
        Ok(())
    }
}

pub(crate) fn encode<R: Record>(record: &R, crc32: FnCrc32) -> Vec<u8> {
    let mut buf = vec![0u8; record.encoded_len()];
    let crc_offset = buf.len() - RECORD_TRAILER_SIZE;

    buf[0..4].copy_from_slice(&R::MAGIC.to_le_bytes());
    buf[4..8].copy_from_slice(&R::VERSION.to_le_bytes());
    record.encode_payload(&mut ByteWriter::new(
        &mut buf[RECORD_HEADER_SIZE..crc_offset],
    ));

    let crc = crc32(0, &buf[..crc_offset]);
    buf[crc_offset..].copy_from_slice(&crc.to_le_bytes());
    buf
}

/// Checks magic, major structure version and CRC trailer of a raw record.
pub(crate) fn check<R: Record>(raw: &[u8], crc32: FnCrc32) -> Result<(), Error> {
    if raw.len() < RECORD_HEADER_SIZE + RECORD_TRAILER_SIZE {
        return Err(Error::InvalidRecord);
    }

    let word = |offset: usize| {
        u32::from_le_bytes([
            raw[offset],
            raw[offset + 1],
            raw[offset + 2],
            raw[offset + 3],
        ])
    };

    if word(0) != R::MAGIC {
        return Err(Error::InvalidRecord);
    }

    if word(4) & 0xFFFF_0000 != R::VERSION & 0xFFFF_0000 {
        return Err(Error::InvalidRecord);
    }

    let crc_offset = raw.len() - RECORD_TRAILER_SIZE;
    if crc32(0, &raw[..crc_offset]) != word(crc_offset) {
        return Err(Error::CrcMismatch);
    }

    Ok(())
}

/// Decodes a raw record that already passed [`check`].
pub(crate) fn decode<R: Record>(raw: &[u8], template: &R) -> Result<R, Error> {
    let mut record = template.clone();
    let payload = &raw[RECORD_HEADER_SIZE..raw.len() - RECORD_TRAILER_SIZE];
    record.decode_payload(&mut ByteReader::new(payload))?;
    Ok(record)
}

#[inline(always)]
pub(crate) fn write_aligned<T: Platform>(
    hal: &mut T,
    offset: u32,
    bytes: &[u8],
) -> Result<(), T::Error> {
    #[cfg(feature = "defmt")]
    trace!("write_aligned @{:#08x}: [{}]", offset, bytes.len());

    if bytes.len().is_multiple_of(T::WRITE_SIZE) {
        hal.write(offset, bytes)
    } else {
        let pivot = T::align_write_floor(bytes.len());
        let header = &bytes[..pivot];
        let trailer = &bytes[pivot..];
        if !header.is_empty() {
            hal.write(offset, header)?;
        }

        // no need to write the trailer if remaining data is all ones - this the default state of the flash
        if bytes[pivot..].iter().any(|&e| e != 0xFF) {
            let mut buf = vec![0xFFu8; T::WRITE_SIZE];
            buf[..trailer.len()].copy_from_slice(trailer);
            hal.write(offset + (pivot as u32), &buf)?
        }

        Ok(())
    }
}
