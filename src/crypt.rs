//! Optional entry encryption.
//!
//! Entries are encrypted as two independent 16-byte blocks (ECB) right before they are written
//! and decrypted right after they are read. Page headers and entry state tables stay in clear
//! text so a region can be mounted and garbage collected without touching the cipher.

use crate::error::Error;

pub const BLOCK_SIZE: usize = 16;

/// A 128-bit block cipher. Failures are reported as [`Error::EncryptFail`] or
/// [`Error::DecryptFail`].
pub trait BlockCipher {
    fn encrypt_block(&self, block: &mut [u8; BLOCK_SIZE]) -> Result<(), Error>;
    fn decrypt_block(&self, block: &mut [u8; BLOCK_SIZE]) -> Result<(), Error>;
}

pub(crate) fn encrypt(cipher: &dyn BlockCipher, data: &mut [u8]) -> Result<(), Error> {
    if !data.len().is_multiple_of(BLOCK_SIZE) {
        return Err(Error::InvalidParam);
    }
    for chunk in data.chunks_exact_mut(BLOCK_SIZE) {
        let block: &mut [u8; BLOCK_SIZE] = chunk.try_into().map_err(|_| Error::Fail)?;
        cipher.encrypt_block(block)?;
    }
    Ok(())
}

pub(crate) fn decrypt(cipher: &dyn BlockCipher, data: &mut [u8]) -> Result<(), Error> {
    if !data.len().is_multiple_of(BLOCK_SIZE) {
        return Err(Error::InvalidParam);
    }
    for chunk in data.chunks_exact_mut(BLOCK_SIZE) {
        let block: &mut [u8; BLOCK_SIZE] = chunk.try_into().map_err(|_| Error::Fail)?;
        cipher.decrypt_block(block)?;
    }
    Ok(())
}

#[cfg(feature = "encryption")]
pub use aes_ecb::Aes128Ecb;

#[cfg(feature = "encryption")]
mod aes_ecb {
    use super::{BLOCK_SIZE, BlockCipher};
    use crate::error::Error;
    use aes::Aes128;
    use aes::cipher::generic_array::GenericArray;
    use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};

    /// AES-128 in ECB mode, the key is bound to one region.
    pub struct Aes128Ecb {
        cipher: Aes128,
    }

    impl Aes128Ecb {
        pub fn new(key: &[u8; BLOCK_SIZE]) -> Self {
            Self {
                cipher: Aes128::new(GenericArray::from_slice(key)),
            }
        }

        /// Derives the region key from its label, e.g. with a hardware unique key engine.
        ///
        /// Any error of `kdf` is reported as [`Error::SecurityConfigFail`].
        pub fn derive<E>(
            label: &str,
            kdf: impl FnOnce(&[u8], &mut [u8; BLOCK_SIZE]) -> Result<(), E>,
        ) -> Result<Self, Error> {
            let mut key = [0u8; BLOCK_SIZE];
            kdf(label.as_bytes(), &mut key).map_err(|_| Error::SecurityConfigFail)?;
            Ok(Self::new(&key))
        }
    }

    impl BlockCipher for Aes128Ecb {
        fn encrypt_block(&self, block: &mut [u8; BLOCK_SIZE]) -> Result<(), Error> {
            self.cipher
                .encrypt_block(GenericArray::from_mut_slice(block.as_mut_slice()));
            Ok(())
        }

        fn decrypt_block(&self, block: &mut [u8; BLOCK_SIZE]) -> Result<(), Error> {
            self.cipher
                .decrypt_block(GenericArray::from_mut_slice(block.as_mut_slice()));
            Ok(())
        }
    }

}
