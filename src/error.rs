use thiserror::Error;

/// Errors of the boot control plane. Marked as non-exhaustive to allow for future additions
/// without breaking the API.
///
/// Only `FlashError` originates from the hardware, everything else is a decision of this crate.
/// `CrcMismatch` and `InvalidRecord` never escape the record store during normal operation, a
/// broken record is replaced with its defaults instead.
#[derive(Error, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// A region is misaligned to the erase size, out of bounds or overlaps another region.
    #[error("invalid flash layout")]
    InvalidLayout,

    /// The internal error value is returned from the provided `NorFlash` driver. Timeouts of
    /// the driver's completion polling are reported the same way.
    #[error("internal flash error")]
    FlashError,

    /// Data read back from flash doesn't match its recorded CRC-32.
    #[error("crc mismatch")]
    CrcMismatch,

    /// Magic, structure version or encoding of a record is wrong.
    #[error("invalid record")]
    InvalidRecord,

    /// The version is older than the minimum version ever accepted.
    #[error("rollback rejected")]
    RollbackRejected,

    /// The installed firmware fails the anti-rollback check at boot.
    #[error("version error")]
    VersionError,

    /// The security engine didn't report ready.
    #[error("security engine not ready")]
    EngineNotReady,

    #[error("signature verification failed: {0}")]
    SignatureFailure(EngineError),

    /// No fallback image, or its metadata or image CRC doesn't check out.
    #[error("fallback invalid")]
    FallbackInvalid,

    /// Every automated recovery path is exhausted.
    #[error("factory reset required")]
    FactoryResetRequired,

    /// The update plus its signature don't fit the workspace, or the update is empty.
    #[error("update too large")]
    UpdateTooLarge,

    #[error("no pending update")]
    NoPendingUpdate,

    #[error("update in progress")]
    UpdateInProgress,

    /// The runtime digest of the critical region differs from its reference.
    #[error("integrity violation")]
    IntegrityViolation,
}

impl Error {
    /// Compact code stored in the error details of a boot log entry.
    pub fn code(&self) -> u16 {
        match self {
            Error::InvalidLayout => 0x01,
            Error::FlashError => 0x02,
            Error::CrcMismatch => 0x03,
            Error::InvalidRecord => 0x04,
            Error::RollbackRejected => 0x05,
            Error::VersionError => 0x06,
            Error::EngineNotReady => 0x07,
            Error::SignatureFailure(e) => 0x0100 | *e as u16,
            Error::FallbackInvalid => 0x09,
            Error::FactoryResetRequired => 0x0A,
            Error::UpdateTooLarge => 0x0B,
            Error::NoPendingUpdate => 0x0C,
            Error::UpdateInProgress => 0x0D,
            Error::IntegrityViolation => 0x0E,
        }
    }
}

/// Error codes reported by the security engine.
#[derive(Error, strum::FromRepr, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum EngineError {
    #[error("general failure")]
    General = 0x01,

    #[error("authentication failed")]
    AuthFailed = 0x02,

    #[error("key not found")]
    KeyNotFound = 0x03,

    #[error("busy")]
    Busy = 0x04,
}
