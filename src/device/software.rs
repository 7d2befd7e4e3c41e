//! A software stand-in for the HSM: an Ed25519 signing key and an X25519
//! decryption key, kept at rest encrypted under the operator's activation
//! secret.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use data_encoding::HEXLOWER;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use super::{CryptoDevice, DeviceError};

const SALT_LENGTH: usize = 16;
const NONCE_LENGTH: usize = 12;
const KEY_LENGTH: usize = 32;
/// AES-GCM authentication tag.
const TAG_LENGTH: usize = 16;
const BALLOT_KDF_INFO: &[u8] = b"ivote ballot key";

/// Derive an AES-256-GCM cipher from the shared secret of an ECIES exchange.
fn ballot_cipher(shared: &[u8], ephemeral: &PublicKey, receiver: &PublicKey) -> Aes256Gcm {
    let mut salt = Vec::with_capacity(2 * KEY_LENGTH);
    salt.extend_from_slice(ephemeral.as_bytes());
    salt.extend_from_slice(receiver.as_bytes());
    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut key = [0_u8; KEY_LENGTH];
    // 32 bytes is far below the HKDF output limit.
    let _ = hkdf.expand(BALLOT_KDF_INFO, &mut key);
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key))
}

/// Encrypt a ballot plaintext to a device's encryption key. Output is
/// `ephemeral public key || nonce || ciphertext`.
pub fn seal_ballot(receiver: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, DeviceError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(receiver);
    let cipher = ballot_cipher(shared.as_bytes(), &ephemeral_public, receiver);
    let nonce = rand::random::<[u8; NONCE_LENGTH]>();

    let mut sealed = Vec::with_capacity(KEY_LENGTH + NONCE_LENGTH + plaintext.len() + TAG_LENGTH);
    sealed.extend_from_slice(ephemeral_public.as_bytes());
    sealed.extend_from_slice(&nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| DeviceError::Malfunction(format!("ballot encryption failed: {e}")))?;
    sealed.extend(ciphertext);
    Ok(sealed)
}

/// On-disk form of a device's keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKeyFile {
    /// Public half of the result signing key, hex.
    pub verifying_key: String,
    /// Public half of the ballot decryption key, hex.
    pub encryption_key: String,
    salt: String,
    nonce: String,
    ciphertext: String,
}

impl SealedKeyFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        let path = path.as_ref();
        let bytes = fs::read(path)
            .map_err(|e| DeviceError::KeyFile(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| DeviceError::KeyFile(format!("malformed {}: {e}", path.display())))
    }

    /// Write the key file through a temporary file in the same directory, so
    /// a crash leaves either the old file or the new one.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), DeviceError> {
        let path = path.as_ref();
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| DeviceError::KeyFile(e.to_string()))?;
        let name = path
            .file_name()
            .ok_or_else(|| DeviceError::KeyFile(format!("{} names no file", path.display())))?;
        let tmp = path.with_file_name(format!(".{}.tmp", name.to_string_lossy()));
        let written = File::create(&tmp)
            .and_then(|mut file| file.write_all(&bytes).and_then(|_| file.sync_all()))
            .and_then(|_| fs::rename(&tmp, path));
        written.map_err(|e| {
            let _ = fs::remove_file(&tmp);
            DeviceError::KeyFile(format!("cannot write {}: {e}", path.display()))
        })
    }
}

fn unsealing_cipher(secret: &[u8], salt: &[u8]) -> Result<Aes256Gcm, DeviceError> {
    let key = argon2::hash_raw(secret, salt, &argon2::Config::default())
        .map_err(|e| DeviceError::Activation(e.to_string()))?;
    Aes256Gcm::new_from_slice(&key).map_err(|e| DeviceError::Activation(e.to_string()))
}

fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>, DeviceError> {
    HEXLOWER
        .decode(value.as_bytes())
        .map_err(|_| DeviceError::KeyFile(format!("{field} is not hex")))
}

pub struct SoftwareDevice {
    signing: SigningKey,
    decryption: StaticSecret,
}

impl SoftwareDevice {
    /// Fresh random keys.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
            decryption: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub fn encryption_key(&self) -> PublicKey {
        PublicKey::from(&self.decryption)
    }

    /// Encrypt both keys under `secret`.
    pub fn seal(&self, secret: &[u8]) -> Result<SealedKeyFile, DeviceError> {
        let salt = rand::random::<[u8; SALT_LENGTH]>();
        let nonce = rand::random::<[u8; NONCE_LENGTH]>();
        let mut keys = Vec::with_capacity(2 * KEY_LENGTH);
        keys.extend_from_slice(&self.signing.to_bytes());
        keys.extend_from_slice(&self.decryption.to_bytes());
        let ciphertext = unsealing_cipher(secret, &salt)?
            .encrypt(Nonce::from_slice(&nonce), keys.as_slice())
            .map_err(|_| DeviceError::KeyFile("cannot seal keys".to_string()))?;
        Ok(SealedKeyFile {
            verifying_key: HEXLOWER.encode(self.verifying_key().as_bytes()),
            encryption_key: HEXLOWER.encode(self.encryption_key().as_bytes()),
            salt: HEXLOWER.encode(&salt),
            nonce: HEXLOWER.encode(&nonce),
            ciphertext: HEXLOWER.encode(&ciphertext),
        })
    }

    /// Activate a device from its sealed keys. A wrong secret is an
    /// activation failure.
    pub fn unseal(file: &SealedKeyFile, secret: &[u8]) -> Result<Self, DeviceError> {
        let salt = decode_hex("salt", &file.salt)?;
        let nonce = decode_hex("nonce", &file.nonce)?;
        if nonce.len() != NONCE_LENGTH {
            return Err(DeviceError::KeyFile("nonce has the wrong length".to_string()));
        }
        let ciphertext = decode_hex("ciphertext", &file.ciphertext)?;
        let keys = unsealing_cipher(secret, &salt)?
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| DeviceError::Activation("wrong activation secret".to_string()))?;
        if keys.len() != 2 * KEY_LENGTH {
            return Err(DeviceError::KeyFile("sealed keys have the wrong length".to_string()));
        }
        let mut signing = [0_u8; KEY_LENGTH];
        let mut decryption = [0_u8; KEY_LENGTH];
        signing.copy_from_slice(&keys[..KEY_LENGTH]);
        decryption.copy_from_slice(&keys[KEY_LENGTH..]);
        let device = Self {
            signing: SigningKey::from_bytes(&signing),
            decryption: StaticSecret::from(decryption),
        };
        if HEXLOWER.encode(device.verifying_key().as_bytes()) != file.verifying_key {
            return Err(DeviceError::KeyFile(
                "sealed keys do not match the public keys on file".to_string(),
            ));
        }
        info!("Crypto device activated");
        Ok(device)
    }
}

impl CryptoDevice for SoftwareDevice {
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DeviceError> {
        if ciphertext.len() < KEY_LENGTH + NONCE_LENGTH + TAG_LENGTH {
            return Err(DeviceError::Decryption);
        }
        let (ephemeral, rest) = ciphertext.split_at(KEY_LENGTH);
        let (nonce, body) = rest.split_at(NONCE_LENGTH);
        let ephemeral: [u8; KEY_LENGTH] = ephemeral.try_into().map_err(|_| DeviceError::Decryption)?;
        let ephemeral = PublicKey::from(ephemeral);
        let receiver = self.encryption_key();
        let shared = self.decryption.diffie_hellman(&ephemeral);
        ballot_cipher(shared.as_bytes(), &ephemeral, &receiver)
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| DeviceError::Decryption)
    }

    fn sign(&self, blob: &[u8]) -> Result<Vec<u8>, DeviceError> {
        Ok(self.signing.sign(blob).to_bytes().to_vec())
    }
}
