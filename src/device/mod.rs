//! The crypto device holding the election's decryption and result signing
//! keys. Nothing outside a device ever sees key material.

use thiserror::Error;

pub mod software;

pub use software::{seal_ballot, SealedKeyFile, SoftwareDevice};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device activation failed: {0}")]
    Activation(String),
    /// A single ciphertext could not be opened. The device itself is fine.
    #[error("ciphertext could not be decrypted")]
    Decryption,
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("device malfunction: {0}")]
    Malfunction(String),
    #[error("device key file: {0}")]
    KeyFile(String),
}

pub trait CryptoDevice {
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DeviceError>;

    /// Decrypt several ciphertexts, one result per input in input order.
    /// Devices that can batch should override this.
    fn decrypt_batch(&self, ciphertexts: &[&[u8]]) -> Vec<Result<Vec<u8>, DeviceError>> {
        ciphertexts.iter().map(|c| self.decrypt(c)).collect()
    }

    fn sign(&self, blob: &[u8]) -> Result<Vec<u8>, DeviceError>;
}
