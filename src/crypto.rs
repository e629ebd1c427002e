//! WinZip-AES entry encryption.
//!
//! Key material is derived with PBKDF2-SHA1 (1000 iterations) from a
//! password and per-entry salt, split into the cipher key, the HMAC key,
//! and a 2-byte password verification value. Payload bytes are encrypted
//! with AES in CTR mode using a little-endian counter starting at 1, and
//! authenticated by the first 10 bytes of an HMAC-SHA1 over the
//! ciphertext.
//!
//! Key management itself is an external collaborator: this module only
//! defines the [`CryptoProvider`] contract through which per-entry
//! parameters are obtained.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::{Aes128, Aes192, Aes256};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;

use crate::error::{Result, ZipError};

type HmacSha1 = Hmac<Sha1>;
type Aes128Ctr = ctr::Ctr128LE<Aes128>;
type Aes192Ctr = ctr::Ctr128LE<Aes192>;
type Aes256Ctr = ctr::Ctr128LE<Aes256>;

/// PBKDF2 iteration count fixed by the WinZip AES specification.
const PBKDF2_ITERATIONS: u32 = 1000;

/// Length of the truncated HMAC-SHA1 authentication code.
pub const AUTH_CODE_LEN: usize = 10;

/// Length of the password verification value.
pub const VERIFIER_LEN: usize = 2;

/// AES key strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AesStrength {
    /// AES-128: 16-byte key, 8-byte salt.
    Aes128 = 1,
    /// AES-192: 24-byte key, 12-byte salt.
    Aes192 = 2,
    /// AES-256: 32-byte key, 16-byte salt.
    Aes256 = 3,
}

impl AesStrength {
    /// Salt length in bytes (half the key length).
    pub fn salt_len(self) -> usize {
        self.key_len() / 2
    }

    /// Cipher key length in bytes.
    pub fn key_len(self) -> usize {
        match self {
            Self::Aes128 => 16,
            Self::Aes192 => 24,
            Self::Aes256 => 32,
        }
    }

    /// Fixed per-entry overhead added to the compressed size: salt,
    /// password verification value, and authentication code.
    pub fn overhead(self) -> u64 {
        (self.salt_len() + VERIFIER_LEN + AUTH_CODE_LEN) as u64
    }

    /// Convert from the key-strength code in the AES extra field.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Aes128),
            2 => Some(Self::Aes192),
            3 => Some(Self::Aes256),
            _ => None,
        }
    }
}

/// Per-entry crypto parameters returned by a [`CryptoProvider`].
#[derive(Clone)]
pub struct CryptoParams {
    /// Key strength for this entry.
    pub strength: AesStrength,
    /// Secret material the keys are derived from.
    pub password: Vec<u8>,
}

impl std::fmt::Debug for CryptoParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoParams")
            .field("strength", &self.strength)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// External crypto-parameters provider contract.
///
/// The provider is queried once per entry. Returning an error (typically
/// [`ZipError::CryptoParameters`]) means no parameters match or the
/// provider declined; retry/prompting policy belongs to the caller, not
/// to this crate.
pub trait CryptoProvider {
    /// Produce the crypto parameters for the named entry.
    fn parameters(&self, entry_name: &str) -> Result<CryptoParams>;
}

/// The simplest provider: one password and strength for every entry.
pub struct PasswordProvider {
    params: CryptoParams,
}

impl PasswordProvider {
    /// Create a provider from a password, using AES-256.
    pub fn new(password: impl Into<Vec<u8>>) -> Self {
        Self::with_strength(password, AesStrength::Aes256)
    }

    /// Create a provider from a password and an explicit key strength.
    pub fn with_strength(password: impl Into<Vec<u8>>, strength: AesStrength) -> Self {
        Self {
            params: CryptoParams {
                strength,
                password: password.into(),
            },
        }
    }
}

impl CryptoProvider for PasswordProvider {
    fn parameters(&self, _entry_name: &str) -> Result<CryptoParams> {
        Ok(self.params.clone())
    }
}

/// Generate a random per-entry salt.
pub(crate) fn random_salt(len: usize) -> Vec<u8> {
    let mut salt = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

struct DerivedKeys {
    cipher_key: Vec<u8>,
    mac_key: Vec<u8>,
    verifier: [u8; VERIFIER_LEN],
}

fn derive_keys(password: &[u8], salt: &[u8], strength: AesStrength) -> DerivedKeys {
    let key_len = strength.key_len();
    let mut material = vec![0u8; key_len * 2 + VERIFIER_LEN];
    pbkdf2::pbkdf2_hmac::<Sha1>(password, salt, PBKDF2_ITERATIONS, &mut material);
    DerivedKeys {
        cipher_key: material[..key_len].to_vec(),
        mac_key: material[key_len..key_len * 2].to_vec(),
        verifier: [material[key_len * 2], material[key_len * 2 + 1]],
    }
}

enum EntryCipher {
    Aes128(Box<Aes128Ctr>),
    Aes192(Box<Aes192Ctr>),
    Aes256(Box<Aes256Ctr>),
}

impl EntryCipher {
    fn new(strength: AesStrength, key: &[u8]) -> Result<Self> {
        // WinZip runs the CTR counter little-endian, starting at 1.
        let mut iv = [0u8; 16];
        iv[0] = 1;
        let invalid = |_| ZipError::crypto_parameters("invalid derived key length");
        Ok(match strength {
            AesStrength::Aes128 => {
                Self::Aes128(Box::new(Aes128Ctr::new_from_slices(key, &iv).map_err(invalid)?))
            }
            AesStrength::Aes192 => {
                Self::Aes192(Box::new(Aes192Ctr::new_from_slices(key, &iv).map_err(invalid)?))
            }
            AesStrength::Aes256 => {
                Self::Aes256(Box::new(Aes256Ctr::new_from_slices(key, &iv).map_err(invalid)?))
            }
        })
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            Self::Aes128(c) => c.apply_keystream(data),
            Self::Aes192(c) => c.apply_keystream(data),
            Self::Aes256(c) => c.apply_keystream(data),
        }
    }
}

/// Streaming encryptor for one entry.
pub(crate) struct EntryEncryptor {
    cipher: EntryCipher,
    mac: HmacSha1,
}

impl EntryEncryptor {
    /// Derive keys and return the encryptor plus the password
    /// verification value to be written after the salt.
    pub(crate) fn new(
        password: &[u8],
        salt: &[u8],
        strength: AesStrength,
    ) -> Result<(Self, [u8; VERIFIER_LEN])> {
        let keys = derive_keys(password, salt, strength);
        let cipher = EntryCipher::new(strength, &keys.cipher_key)?;
        let mac = HmacSha1::new_from_slice(&keys.mac_key)
            .map_err(|_| ZipError::crypto_parameters("invalid derived MAC key length"))?;
        Ok((Self { cipher, mac }, keys.verifier))
    }

    /// Encrypt in place and fold the ciphertext into the MAC.
    pub(crate) fn encrypt(&mut self, data: &mut [u8]) {
        self.cipher.apply(data);
        self.mac.update(data);
    }

    /// Finalize the authentication code.
    pub(crate) fn finish(self) -> [u8; AUTH_CODE_LEN] {
        let digest = self.mac.finalize().into_bytes();
        let mut code = [0u8; AUTH_CODE_LEN];
        code.copy_from_slice(&digest[..AUTH_CODE_LEN]);
        code
    }
}

/// Streaming decryptor for one entry.
pub(crate) struct EntryDecryptor {
    cipher: EntryCipher,
    mac: HmacSha1,
    verifier: [u8; VERIFIER_LEN],
}

impl EntryDecryptor {
    pub(crate) fn new(password: &[u8], salt: &[u8], strength: AesStrength) -> Result<Self> {
        let keys = derive_keys(password, salt, strength);
        let cipher = EntryCipher::new(strength, &keys.cipher_key)?;
        let mac = HmacSha1::new_from_slice(&keys.mac_key)
            .map_err(|_| ZipError::crypto_parameters("invalid derived MAC key length"))?;
        Ok(Self {
            cipher,
            mac,
            verifier: keys.verifier,
        })
    }

    /// Check the stored password verification value.
    pub(crate) fn verify_password(&self, stored: &[u8]) -> bool {
        constant_time_eq::constant_time_eq(&self.verifier, stored)
    }

    /// Fold ciphertext into the MAC before decrypting it.
    pub(crate) fn update_mac(&mut self, ciphertext: &[u8]) {
        self.mac.update(ciphertext);
    }

    /// Verify the truncated authentication code.
    pub(crate) fn verify_auth_code(&self, code: &[u8]) -> bool {
        let digest = self.mac.clone().finalize().into_bytes();
        constant_time_eq::constant_time_eq(&digest[..AUTH_CODE_LEN], code)
    }

    /// Decrypt in place.
    pub(crate) fn decrypt(&mut self, data: &mut [u8]) {
        self.cipher.apply(data);
    }
}
