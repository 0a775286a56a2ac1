use crate::raw::CrcMismatch;
use thiserror::Error;

/// Errors that can occur during NVDS operations. Flash driver errors are never surfaced
/// directly, they are reported as [`Error::FlashIoFail`].
///
/// Corruption found while mounting a region is repaired silently (pages are recycled, entries
/// are retired) so a caller usually only has to handle [`Error::NotFound`], [`Error::NoSpace`]
/// and [`Error::InvalidLength`].
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// Malformed key or namespace, empty or oversized value, or a region that is not sector
    /// aligned, too small, or overlapping another region.
    #[error("invalid parameter")]
    InvalidParam,

    /// The underlying flash driver failed to read, write or erase.
    #[error("flash i/o failed")]
    FlashIoFail,

    /// Key or namespace not found. Also returned for values whose payload CRC doesn't match.
    #[error("not found")]
    NotFound,

    /// No page with enough room could be found, even after garbage collection.
    #[error("no space left")]
    NoSpace,

    /// The buffer passed to `get` is too small. Carries the required length.
    #[error("buffer too small, {0} bytes required")]
    InvalidLength(u32),

    #[error("entry decryption failed")]
    DecryptFail,

    #[error("entry encryption failed")]
    EncryptFail,

    /// The key derivation for entry encryption failed.
    #[error("security configuration failed")]
    SecurityConfigFail,

    /// An internal invariant was violated.
    #[error("internal failure")]
    Fail,

    /// The store was compiled without the `flash` feature.
    #[error("nvds is not using flash")]
    NotUsingFlash,
}

impl From<CrcMismatch> for Error {
    fn from(_: CrcMismatch) -> Self {
        Error::NotFound
    }
}
